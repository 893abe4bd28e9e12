//! End-to-end diagnostic scenarios: a same-package cycle spanning three
//! scripts, and an invalid-usage manifest whose diagnostic carries two
//! source locations (the mismatched `scripts` entry and the `wireit` stanza
//! that implies it).

use hustle::analyzer::{self, Outcome};
use hustle::diagnostics;

use crate::{temporary_directory, write_manifest};

#[test_log::test(tokio::test)]
async fn a_three_script_cycle_renders_as_a_single_trail() {
    let (_guard, root) = temporary_directory();
    write_manifest(
        &root,
        r#"{
            "scripts": { "a": "wireit", "b": "wireit", "c": "wireit" },
            "wireit": {
                "a": { "command": "echo a", "dependencies": ["b"] },
                "b": { "command": "echo b", "dependencies": ["c"] },
                "c": { "command": "echo c", "dependencies": ["a"] }
            }
        }"#,
    )
    .await;

    let Outcome::Diagnostics(diagnostics) = analyzer::analyze(root.clone(), "a").await.unwrap()
    else {
        panic!("expected a diagnostic for the cycle");
    };
    assert_eq!(diagnostics.len(), 1);
    assert!(diagnostics[0].message.contains(".-> a\n|   b\n|   c\n`-- a"));

    let source = tokio::fs::read_to_string(root.as_std_path().join("package.json"))
        .await
        .unwrap();
    let rendered = diagnostics::render_diagnostic(&diagnostics[0], &root, &source, &[]);
    assert!(rendered.contains("Cycle detected"));
}

#[test_log::test(tokio::test)]
async fn a_script_not_marked_wireit_renders_two_caret_excerpts() {
    let (_guard, root) = temporary_directory();
    write_manifest(
        &root,
        r#"{
            "scripts": { "build": "not-wireit" },
            "wireit": { "build": { "command": "echo hi" } }
        }"#,
    )
    .await;

    let Outcome::Diagnostics(diagnostics) = analyzer::analyze(root.clone(), "build").await.unwrap()
    else {
        panic!("expected a diagnostic for the scripts/wireit mismatch");
    };
    assert_eq!(diagnostics.len(), 1);
    assert_eq!(diagnostics[0].supplemental.len(), 1);

    let source = tokio::fs::read_to_string(root.as_std_path().join("package.json"))
        .await
        .unwrap();
    let rendered = diagnostics::render_diagnostic(&diagnostics[0], &root, &source, &[source.as_str()]);

    // annotate-snippets renders one caret-annotated excerpt per location;
    // the primary message plus one supplemental label should both show up.
    assert!(rendered.contains("must be"));
    assert!(rendered.contains("wireit config declared here"));
}
