//! End-to-end tests driven through the public `hustle` API against real
//! temporary package trees and real child processes, mirroring the library's
//! own unit tests one layer up: these exercise manifest parsing, analysis,
//! fingerprinting, and execution together rather than any one module in
//! isolation.

use hustle::path::AbsDirPath;
use tempfile::TempDir;

pub mod diagnostics;
pub mod scenarios;

#[track_caller]
pub fn temporary_directory() -> (TempDir, AbsDirPath) {
    let dir = TempDir::new().expect("create temporary directory");
    let path = AbsDirPath::assume(dir.path()).expect("read temp dir as abs dir");
    (dir, path)
}

pub async fn write_manifest(root: &AbsDirPath, contents: &str) {
    tokio::fs::write(root.as_std_path().join("package.json"), contents)
        .await
        .expect("write package.json");
}
