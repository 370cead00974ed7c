//! Live Custom Cluster Tests
//!
//! Creates custom clusters on a real provisioning control plane, joins
//! simulated nodes to them and verifies the resulting machines. Everything the
//! tests create is deleted again when they finish.
//!
//! Requires a kubeconfig pointing at the control plane's local cluster and,
//! optionally, a harness config file.
//!
//! Run with:
//! ```sh
//! PROVISIONING_E2E_CONFIG=./e2e.yaml \
//!   cargo test -p provisioning-e2e --test custom_cluster -- --ignored --test-threads=1
//! ```

#![allow(clippy::doc_markdown)]

use provisioning_e2e::scenarios::{run_custom_topology, CustomTopology};
use provisioning_e2e::telemetry::init_test_tracing;
use provisioning_e2e::{HarnessConfig, SuiteContext};

async fn run_topology(topology: CustomTopology) {
    init_test_tracing();
    let config = HarnessConfig::load(None).expect("harness config");
    if let Some(reason) = topology.skip_reason(config.distribution) {
        eprintln!("skipping {}: {reason}", topology.name);
        return;
    }

    let suite = SuiteContext::setup(config).await.expect("suite setup");
    let (client, config) = (suite.admin(), suite.config());
    let outcome = suite
        .session()
        .child(topology.name.clone())
        .scope(|session| async move { run_custom_topology(client, config, &session, &topology).await })
        .await;
    let teardown = suite.teardown().await;

    outcome.expect("custom topology");
    teardown.expect("suite teardown");
}

#[tokio::test]
#[ignore = "requires a live provisioning control plane"]
async fn custom_one_node_all_roles() {
    run_topology(CustomTopology::one_node_all_roles()).await;
}

#[tokio::test]
#[ignore = "requires a live provisioning control plane"]
async fn custom_three_nodes_all_roles() {
    run_topology(CustomTopology::three_node_all_roles()).await;
}

#[tokio::test]
#[ignore = "requires a live provisioning control plane"]
async fn custom_unique_roles() {
    run_topology(CustomTopology::unique_roles()).await;
}

#[tokio::test]
#[ignore = "requires a live provisioning control plane"]
async fn custom_three_nodes_with_taint() {
    run_topology(CustomTopology::three_node_with_taint()).await;
}

#[tokio::test]
#[ignore = "requires a live provisioning control plane"]
async fn custom_suite_reports_every_topology() {
    init_test_tracing();
    let config = HarnessConfig::load(None).expect("harness config");
    let suite = SuiteContext::setup(config).await.expect("suite setup");

    let reports = provisioning_e2e::scenarios::run_custom_suite(&suite).await;
    suite.teardown().await.expect("suite teardown");

    assert_eq!(reports.len(), CustomTopology::all().len());
    for report in &reports {
        assert!(
            !matches!(report.outcome, provisioning_e2e::CaseOutcome::Failed(_)),
            "{}: {}",
            report.name,
            report.outcome
        );
    }
}
