//! The non-diagnostic end-to-end scenarios: a fingerprint-stable re-run, a
//! service with exactly one consumer, a service kept alive by two direct
//! dependents, and a dependency cycle that spans two packages.

use std::time::Duration;

use hustle::analyzer::{self, Outcome};
use hustle::cache::AnyCacheBackend;
use hustle::config::FailureMode;
use hustle::executor::{Executor, ExecutorConfig, SuccessKind};
use hustle::script::ScriptReference;
use tokio::sync::mpsc;

use crate::{temporary_directory, write_manifest};

fn new_executor(
    graph: hustle::script::ScriptGraph,
    root: hustle::script::ScriptNodeId,
) -> std::sync::Arc<Executor> {
    let (tx, _rx) = mpsc::unbounded_channel();
    Executor::new(
        graph,
        root,
        ExecutorConfig::builder()
            .failure_mode(FailureMode::Continue)
            .cache(AnyCacheBackend::None)
            .parallelism(2)
            .output_tx(tx)
            .build(),
    )
}

#[test_log::test(tokio::test)]
async fn unchanged_inputs_are_skipped_as_fresh_on_the_second_run() {
    let (_guard, root) = temporary_directory();
    write_manifest(
        &root,
        r#"{
            "scripts": { "build": "wireit" },
            "wireit": { "build": { "command": "true", "files": ["in.txt"] } }
        }"#,
    )
    .await;
    tokio::fs::write(root.as_std_path().join("in.txt"), b"hello")
        .await
        .unwrap();

    let Outcome::Resolved(analysis) = analyzer::analyze(root.clone(), "build").await.unwrap()
    else {
        panic!("expected a resolved graph");
    };
    let root_id = analysis.root;
    let first = new_executor(analysis.graph.clone(), root_id)
        .execute_top_level()
        .await
        .unwrap();
    assert_eq!(first.kind, SuccessKind::Ran);

    let second = new_executor(analysis.graph, root_id)
        .execute_top_level()
        .await
        .unwrap();
    assert_eq!(second.kind, SuccessKind::Fresh);
}

#[test_log::test(tokio::test)]
async fn a_service_with_one_consumer_starts_and_stops_cleanly() {
    let (_guard, root) = temporary_directory();
    write_manifest(
        &root,
        r#"{
            "scripts": { "start": "wireit", "serve": "wireit" },
            "wireit": {
                "start": { "command": "true", "dependencies": ["serve"] },
                "serve": { "command": "sleep 30", "service": true }
            }
        }"#,
    )
    .await;

    let Outcome::Resolved(analysis) = analyzer::analyze(root.clone(), "start").await.unwrap()
    else {
        panic!("expected a resolved graph");
    };
    let executor = new_executor(analysis.graph, analysis.root);
    let outcome = executor.execute_top_level().await.unwrap();
    assert_eq!(outcome.kind, SuccessKind::Ran);

    let service_id = executor
        .graph()
        .lookup(&ScriptReference::new(root.clone(), "serve"))
        .expect("serve was resolved into the graph");
    let service_outcome = executor.execute(service_id).await.unwrap();
    assert_eq!(service_outcome.services.len(), 1);

    tokio::time::timeout(Duration::from_secs(5), service_outcome.services[0].done())
        .await
        .expect("the service should have stopped once its only consumer finished")
        .expect("clean shutdown");
}

#[test_log::test(tokio::test)]
async fn a_service_stays_up_until_both_direct_dependents_release_it() {
    let (_guard, root) = temporary_directory();
    write_manifest(
        &root,
        r#"{
            "scripts": { "main": "wireit", "a": "wireit", "b": "wireit", "server": "wireit" },
            "wireit": {
                "main": { "command": "true", "dependencies": ["a", "b"] },
                "a": { "command": "true", "dependencies": ["server"] },
                "b": { "command": "true", "dependencies": ["server"] },
                "server": { "command": "sleep 30", "service": true }
            }
        }"#,
    )
    .await;

    let Outcome::Resolved(analysis) = analyzer::analyze(root.clone(), "main").await.unwrap()
    else {
        panic!("expected a resolved graph");
    };
    let executor = new_executor(analysis.graph, analysis.root);
    let outcome = executor.execute_top_level().await.unwrap();
    assert_eq!(outcome.kind, SuccessKind::Ran);

    let service_id = executor
        .graph()
        .lookup(&ScriptReference::new(root.clone(), "server"))
        .expect("server was resolved into the graph");
    let service_outcome = executor.execute(service_id).await.unwrap();
    assert_eq!(service_outcome.services.len(), 1);

    tokio::time::timeout(Duration::from_secs(5), service_outcome.services[0].done())
        .await
        .expect("the service should have stopped once both dependents released it")
        .expect("clean shutdown");
}

#[test_log::test(tokio::test)]
async fn a_dependency_cycle_across_two_packages_is_a_single_diagnostic() {
    let (_guard, root) = temporary_directory();
    tokio::fs::create_dir_all(root.as_std_path().join("sibling"))
        .await
        .unwrap();

    write_manifest(
        &root,
        r#"{
            "scripts": { "build": "wireit" },
            "wireit": { "build": { "command": "echo hi", "dependencies": ["sibling:build"] } }
        }"#,
    )
    .await;

    let sibling = hustle::path::AbsDirPath::assume(root.as_std_path().join("sibling")).unwrap();
    write_manifest(
        &sibling,
        r#"{
            "scripts": { "build": "wireit" },
            "wireit": { "build": { "command": "echo hi", "dependencies": ["..:build"] } }
        }"#,
    )
    .await;

    let outcome = analyzer::analyze(root, "build").await.unwrap();
    let Outcome::Diagnostics(diagnostics) = outcome else {
        panic!("expected a diagnostic for the cross-package cycle");
    };
    assert_eq!(diagnostics.len(), 1);
    assert!(diagnostics[0].message.contains("Cycle detected"));
}
