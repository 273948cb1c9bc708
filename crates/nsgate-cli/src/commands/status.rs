//! `nsgate status` — one-shot unit state and log tail.

use anyhow::Result;
use nsgate_harness::observer::{SystemdObserver, UnitObserver};

use crate::exit_codes::codes as exit_codes;

/// Print the unit's state and its most recent log lines.
pub async fn run(unit: &str, lines: usize) -> Result<i32> {
    let observer = SystemdObserver::default();

    let state = observer.unit_state(unit).await?;
    println!("{unit}: {state}");

    let log = observer.unit_log(unit, None).await?;
    let start = log.len().saturating_sub(lines);
    for line in &log[start..] {
        println!("{} {}", line.timestamp.format("%Y-%m-%d %H:%M:%S%.6f"), line.text);
    }

    Ok(exit_codes::SUCCESS)
}
