//! `nsgate verify` — run the standard validation pass.

use std::sync::Arc;

use anyhow::Result;
use nsgate_core::clock::SystemClock;
use nsgate_core::config::DeploymentConfig;
use nsgate_core::gateway::ExecutionGateway;
use nsgate_core::policy::AuthorizationPolicy;
use nsgate_core::registry::NamespaceRegistry;
use nsgate_harness::observer::SystemdObserver;
use nsgate_harness::runner::HostRunner;
use nsgate_harness::scenario::{standard_steps, ScenarioRunner};

use crate::exit_codes::codes as exit_codes;

/// Run the standard scenario against the live deployment.
pub async fn run(config: &DeploymentConfig) -> Result<i32> {
    let registry = NamespaceRegistry::from_config(config);
    let policy = AuthorizationPolicy::from_config(config);
    let gateway = ExecutionGateway::new(
        Arc::new(registry.clone()),
        Arc::new(policy),
        config.gateway.exec_timeout,
    );
    let observer = SystemdObserver::default();
    let host = HostRunner::new(config.gateway.exec_timeout);
    let clock = SystemClock;

    let steps = standard_steps(config)?;
    let runner = ScenarioRunner::new(config, &registry, &observer, &host, &gateway, &clock);

    match runner.run(&steps).await {
        Ok(report) => {
            for outcome in &report.steps {
                println!("ok - {}: {}", outcome.name, outcome.detail);
            }
            println!("{} steps passed", report.steps.len());
            Ok(exit_codes::SUCCESS)
        }
        Err(err) => {
            eprintln!("nsgate: {err}");
            Ok(exit_codes::FAILURE)
        }
    }
}
