/*
 * Provisioning E2E - Convergence harness for the cluster provisioning control plane
 * Copyright (C) 2025 Provisioning QA
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Provisioning E2E runner
//!
//! Exit codes: 0 when every case passed or was skipped, 1 when any case
//! failed, 2 when configuration or suite setup failed.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use provisioning_e2e::config::{HarnessConfig, CONFIG_ENV};
use provisioning_e2e::matrix::{default_templates, expand, expand_dynamic, Expansion};
use provisioning_e2e::provider::{DriverProvider, ProviderKind};
use provisioning_e2e::scenarios::{
    run_custom_suite, run_node_driver_suite, verify_system_agent_version, CustomTopology,
};
use provisioning_e2e::suite::{run_isolated, CaseReport, SuiteContext, SuiteReport};
use provisioning_e2e::telemetry::init_tracing;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

#[derive(Parser)]
#[command(
    name = "provisioning-e2e",
    version,
    about = "End-to-end convergence tests for the cluster provisioning control plane"
)]
#[command(propagate_version = true)]
struct Cli {
    /// Harness config file (YAML)
    #[arg(short, long, global = true, env = CONFIG_ENV)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the cases a run would execute, without touching a cluster
    Plan,

    /// Provision node-driver clusters for every configured provider
    NodeDriver {
        /// Only run these providers
        #[arg(short, long = "provider")]
        providers: Vec<ProviderKind>,
    },

    /// Join simulated nodes to custom clusters and verify the machines
    Custom,

    /// Check the system-agent-version setting
    AgentVersion,
}

/// Runs the selected command. An `Err` means no case could run at all.
async fn run(cli: Cli) -> Result<SuiteReport> {
    let config = HarnessConfig::load(cli.config.as_deref()).context("failed to load harness config")?;

    info!(
        "Starting provisioning-e2e v{} ({})",
        env!("CARGO_PKG_VERSION"),
        config.distribution
    );

    match cli.command {
        Commands::Plan => {
            plan(&config);
            Ok(SuiteReport::default())
        }
        Commands::AgentVersion => agent_version(config).await,
        Commands::Custom => {
            let suite = SuiteContext::setup(config).await?;
            let mut report = SuiteReport::default();
            report.extend(run_custom_suite(&suite).await);
            Ok(teardown(suite, report).await)
        }
        Commands::NodeDriver { providers } => {
            let suite = SuiteContext::setup(config).await?;
            let mut report = SuiteReport::default();
            report.extend(node_driver(&suite, &providers).await);
            Ok(teardown(suite, report).await)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.json_logs, cli.verbose);

    match run(cli).await {
        Ok(report) => {
            report.log_summary();
            if report.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(1)
            }
        }
        Err(e) => {
            error!(error = %format!("{e:#}"), "Setup failed");
            ExitCode::from(2)
        }
    }
}

async fn teardown(suite: SuiteContext, mut report: SuiteReport) -> SuiteReport {
    if let Err(e) = suite.teardown().await {
        report.extend([CaseReport::failed("suite teardown", e.to_string())]);
    }
    report
}

async fn node_driver(suite: &SuiteContext, only: &[ProviderKind]) -> Vec<CaseReport> {
    let selected: Vec<_> = suite
        .config()
        .providers
        .iter()
        .filter(|p| only.is_empty() || only.contains(&p.kind))
        .cloned()
        .collect();
    if selected.is_empty() {
        return vec![CaseReport::skipped("node-driver", "no providers configured")];
    }

    let mut reports = Vec::new();
    for provider_config in &selected {
        match DriverProvider::from_config(provider_config) {
            Ok(provider) => reports.extend(run_node_driver_suite(suite, &provider).await),
            Err(e) => reports.push(CaseReport::failed(
                format!("{} provider", provider_config.kind),
                e.to_string(),
            )),
        }
    }
    reports
}

async fn agent_version(config: HarnessConfig) -> Result<SuiteReport> {
    let client = kube::Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;
    let expected = config.expected_agent_version.clone();

    let reports = run_isolated(vec![("system agent version".to_string(), ())], 1, |(), _session| {
        verify_system_agent_version(&client, expected.as_deref())
    })
    .await;
    Ok(SuiteReport { cases: reports })
}

fn plan(config: &HarnessConfig) {
    let cases = expand(&default_templates(), &config.kubernetes_versions, &config.cnis);
    for provider in &config.providers {
        for case in &cases {
            println!("node-driver {}/{} [{} node(s)]", provider.kind, case.name, case.nodes.len());
        }
        match expand_dynamic(&config.nodes_and_roles, &config.kubernetes_versions, &config.cnis) {
            Expansion::Cases(dynamic) => {
                for case in dynamic {
                    println!("node-driver {}/{} [{} node(s)]", provider.kind, case.name, case.nodes.len());
                }
            }
            Expansion::Skip { reason } => {
                println!("node-driver {}/dynamic input [skipped: {reason}]", provider.kind);
            }
        }
    }

    for topology in CustomTopology::all() {
        match topology.skip_reason(config.distribution) {
            Some(reason) => println!("custom {} [skipped: {reason}]", topology.name),
            None => println!("custom {} [{} node(s)]", topology.name, topology.nodes.len()),
        }
    }
    println!("agent-version system agent version");
}
