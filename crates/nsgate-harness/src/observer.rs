//! Supervised unit observation.
//!
//! The supervisor (systemd in the reference deployment) owns unit
//! lifecycle and logs; the harness only observes. [`UnitObserver`] is
//! the boundary trait: production code uses [`SystemdObserver`], which
//! shells out to `systemctl` and `journalctl`; tests script the trait
//! directly.
//!
//! Log queries take an optional `since` cursor with microsecond
//! precision. The cursor is inclusive: entries at or after it are
//! returned, entries strictly before it are not, even when the same
//! pattern occurred earlier in the unit's history. This is what makes
//! re-entrant checks after a service restart sound — each reader keeps
//! its own monotonic cursor into the append-only stream.

use std::process::Stdio;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

/// Lifecycle state of a supervised unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    /// Not started.
    Inactive,
    /// Starting up.
    Activating,
    /// Running.
    Active,
    /// Exited with failure.
    Failed,
    /// Shutting down or stopped.
    Stopped,
}

impl std::fmt::Display for UnitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Inactive => "inactive",
            Self::Activating => "activating",
            Self::Active => "active",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

impl UnitState {
    /// Parse a supervisor `ActiveState` value.
    #[must_use]
    pub fn parse(state: &str) -> Option<Self> {
        match state {
            "inactive" => Some(Self::Inactive),
            "activating" | "reloading" => Some(Self::Activating),
            "active" => Some(Self::Active),
            "failed" => Some(Self::Failed),
            "deactivating" => Some(Self::Stopped),
            _ => None,
        }
    }
}

/// One timestamped line from a unit's log stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    /// Entry timestamp.
    pub timestamp: DateTime<Utc>,

    /// Message text.
    pub text: String,
}

/// Observation failures.
#[derive(Debug, Error)]
pub enum ObserverError {
    /// The supervisor query could not be run or returned nonzero.
    #[error("supervisor query for unit '{unit}' failed: {reason}")]
    QueryFailed {
        /// The unit queried.
        unit: String,
        /// What went wrong.
        reason: String,
    },

    /// The supervisor reported a state this harness does not know.
    #[error("unit '{unit}' reported unrecognized state '{state}'")]
    UnrecognizedState {
        /// The unit queried.
        unit: String,
        /// The raw state string.
        state: String,
    },

    /// A lifecycle request (start/stop/restart) failed.
    #[error("lifecycle request '{request}' failed: {reason}")]
    LifecycleFailed {
        /// The issued request.
        request: String,
        /// What went wrong.
        reason: String,
    },
}

/// Boundary trait over the external supervisor.
#[allow(async_fn_in_trait)]
pub trait UnitObserver {
    /// Current lifecycle state of `unit`.
    async fn unit_state(&self, unit: &str) -> Result<UnitState, ObserverError>;

    /// Log lines of `unit` at or after `since` (all lines when `None`).
    async fn unit_log(
        &self,
        unit: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<LogLine>, ObserverError>;

    /// Request the supervisor to start `units`.
    async fn start_units(&self, units: &[String]) -> Result<(), ObserverError>;

    /// Request the supervisor to stop `units`.
    async fn stop_units(&self, units: &[String]) -> Result<(), ObserverError>;

    /// Request the supervisor to restart `units`.
    async fn restart_units(&self, units: &[String]) -> Result<(), ObserverError>;
}

/// Production observer shelling out to `systemctl` and `journalctl`.
#[derive(Debug, Clone)]
pub struct SystemdObserver {
    command_timeout: Duration,
}

impl Default for SystemdObserver {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl SystemdObserver {
    /// Create an observer with a per-query wall-clock bound.
    #[must_use]
    pub const fn new(command_timeout: Duration) -> Self {
        Self { command_timeout }
    }

    async fn run_supervisor(
        &self,
        unit: &str,
        program: &str,
        args: &[&str],
    ) -> Result<String, ObserverError> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let spawned = cmd.spawn().map_err(|e| ObserverError::QueryFailed {
            unit: unit.to_string(),
            reason: format!("failed to spawn {program}: {e}"),
        })?;

        let output = timeout(self.command_timeout, spawned.wait_with_output())
            .await
            .map_err(|_| ObserverError::QueryFailed {
                unit: unit.to_string(),
                reason: format!("{program} timed out"),
            })?
            .map_err(|e| ObserverError::QueryFailed {
                unit: unit.to_string(),
                reason: format!("failed to wait for {program}: {e}"),
            })?;

        if !output.status.success() {
            return Err(ObserverError::QueryFailed {
                unit: unit.to_string(),
                reason: format!(
                    "{program} exited with code {}: {}",
                    output.status.code().unwrap_or(-1),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn lifecycle(&self, verb: &str, units: &[String]) -> Result<(), ObserverError> {
        if units.is_empty() {
            return Ok(());
        }
        let request = format!("systemctl {verb} {}", units.join(" "));
        debug!(%request, "issuing lifecycle request");

        let mut args: Vec<&str> = vec![verb];
        args.extend(units.iter().map(String::as_str));
        self.run_supervisor(&units.join(","), "systemctl", &args)
            .await
            .map_err(|e| ObserverError::LifecycleFailed {
                request,
                reason: e.to_string(),
            })?;
        Ok(())
    }
}

impl UnitObserver for SystemdObserver {
    async fn unit_state(&self, unit: &str) -> Result<UnitState, ObserverError> {
        let raw = self
            .run_supervisor(
                unit,
                "systemctl",
                &["show", "--property=ActiveState", "--value", unit],
            )
            .await?;
        let state = raw.trim();
        UnitState::parse(state).ok_or_else(|| ObserverError::UnrecognizedState {
            unit: unit.to_string(),
            state: state.to_string(),
        })
    }

    async fn unit_log(
        &self,
        unit: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<LogLine>, ObserverError> {
        let mut args: Vec<String> = vec![
            "-q".to_string(),
            "-b".to_string(),
            "-u".to_string(),
            unit.to_string(),
            "--output=short-unix".to_string(),
        ];
        if let Some(since) = since {
            args.push(format!(
                "--since=@{}.{:06}",
                since.timestamp(),
                since.timestamp_subsec_micros()
            ));
        }
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let raw = self.run_supervisor(unit, "journalctl", &arg_refs).await?;

        let lines = raw
            .lines()
            .filter_map(parse_short_unix_line)
            .collect::<Vec<_>>();
        Ok(filter_since(lines, since))
    }

    async fn start_units(&self, units: &[String]) -> Result<(), ObserverError> {
        self.lifecycle("start", units).await
    }

    async fn stop_units(&self, units: &[String]) -> Result<(), ObserverError> {
        self.lifecycle("stop", units).await
    }

    async fn restart_units(&self, units: &[String]) -> Result<(), ObserverError> {
        self.lifecycle("restart", units).await
    }
}

/// Parse one `short-unix` formatted journal line.
///
/// The format is `<epoch-seconds>.<micros> <text>`; lines without the
/// timestamp prefix (continuations) are skipped.
pub(crate) fn parse_short_unix_line(line: &str) -> Option<LogLine> {
    let (stamp, text) = line.split_once(' ')?;
    let (secs, frac) = stamp.split_once('.')?;
    let secs: i64 = secs.parse().ok()?;
    if frac.len() != 6 {
        return None;
    }
    let micros: i64 = frac.parse().ok()?;
    let timestamp = DateTime::from_timestamp_micros(secs * 1_000_000 + micros)?;
    Some(LogLine {
        timestamp,
        text: text.to_string(),
    })
}

/// Keep only entries at or after `since`.
pub(crate) fn filter_since(lines: Vec<LogLine>, since: Option<DateTime<Utc>>) -> Vec<LogLine> {
    match since {
        None => lines,
        Some(cursor) => lines
            .into_iter()
            .filter(|line| line.timestamp >= cursor)
            .collect(),
    }
}
