//! Typed probe predicates.
//!
//! Each assertion the harness makes is constructed as a value of
//! [`ProbePredicate`] and evaluated by a [`ProbeEvaluator`] against the
//! observer and runner seams. Two distinctions matter and are encoded in
//! the variants rather than left to call-site convention:
//!
//! - [`ProbePredicate::SubstringMatch`] requires the pattern to occur
//!   somewhere in the output; [`ProbePredicate::ExactOutputMatch`]
//!   requires the pattern to cover the entire output.
//! - [`ProbePredicate::LogPatternPresent`] succeeds when the pattern is
//!   found; [`ProbePredicate::LogPatternAbsent`] succeeds when it is
//!   not. The negative form is a first-class check, not a negated call.

use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::debug;

use crate::convergence::ProbeFault;
use crate::observer::UnitObserver;
use crate::runner::{CommandRunner, ExecError, ExecOutput};

/// A side-effect-free (or idempotent) check.
#[derive(Debug, Clone)]
pub enum ProbePredicate {
    /// The command exits zero.
    CommandSucceeds {
        /// Namespace to run in, host context when `None`.
        namespace: Option<String>,
        /// Command and arguments.
        command: Vec<String>,
    },

    /// The command exits zero and the pattern occurs in its output.
    SubstringMatch {
        /// Namespace to run in, host context when `None`.
        namespace: Option<String>,
        /// Command and arguments.
        command: Vec<String>,
        /// Pattern that must occur somewhere in stdout.
        pattern: Regex,
    },

    /// The command exits zero and the pattern covers its entire output.
    ExactOutputMatch {
        /// Namespace to run in, host context when `None`.
        namespace: Option<String>,
        /// Command and arguments.
        command: Vec<String>,
        /// Pattern that must match the whole of stdout.
        pattern: Regex,
    },

    /// The command exits zero and its output parses as a JSON object
    /// containing the field.
    JsonFieldPresent {
        /// Namespace to run in, host context when `None`.
        namespace: Option<String>,
        /// Command and arguments.
        command: Vec<String>,
        /// Top-level field that must be present.
        field: String,
    },

    /// A TCP connect to `host:port` succeeds. Connect-only; no data is
    /// exchanged.
    TcpPortOpen {
        /// Namespace to probe from, host context when `None`.
        namespace: Option<String>,
        /// Host to connect to.
        host: String,
        /// Port to connect to.
        port: u16,
    },

    /// The unit's log contains a line matching the pattern, at or after
    /// `since` when given.
    LogPatternPresent {
        /// Unit whose log is searched.
        unit: String,
        /// Pattern to find.
        pattern: Regex,
        /// Cursor; entries strictly before it never match.
        since: Option<DateTime<Utc>>,
    },

    /// The unit's log contains no line matching the pattern.
    LogPatternAbsent {
        /// Unit whose log is searched.
        unit: String,
        /// Pattern that must not occur.
        pattern: Regex,
    },
}

impl ProbePredicate {
    /// Human-readable description used in failure reports.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::CommandSucceeds { namespace, command } => {
                format!("command succeeds{}: {}", in_ns(namespace), command.join(" "))
            }
            Self::SubstringMatch {
                namespace,
                command,
                pattern,
            } => format!(
                "output of '{}'{} contains /{pattern}/",
                command.join(" "),
                in_ns(namespace)
            ),
            Self::ExactOutputMatch {
                namespace,
                command,
                pattern,
            } => format!(
                "output of '{}'{} is exactly /{pattern}/",
                command.join(" "),
                in_ns(namespace)
            ),
            Self::JsonFieldPresent {
                namespace,
                command,
                field,
            } => format!(
                "output of '{}'{} has JSON field '{field}'",
                command.join(" "),
                in_ns(namespace)
            ),
            Self::TcpPortOpen {
                namespace,
                host,
                port,
            } => format!("tcp {host}:{port} accepts connections{}", in_ns(namespace)),
            Self::LogPatternPresent { unit, pattern, .. } => {
                format!("log of '{unit}' contains /{pattern}/")
            }
            Self::LogPatternAbsent { unit, pattern } => {
                format!("log of '{unit}' free of /{pattern}/")
            }
        }
    }
}

fn in_ns(namespace: &Option<String>) -> String {
    namespace
        .as_ref()
        .map(|ns| format!(" in {ns}"))
        .unwrap_or_default()
}

/// Whether `pattern` matches the whole of `text`.
fn is_full_match(pattern: &Regex, text: &str) -> bool {
    pattern
        .find(text)
        .is_some_and(|m| m.start() == 0 && m.end() == text.len())
}

/// Evaluates predicates against the observer and runner seams.
#[derive(Debug, Clone, Copy)]
pub struct ProbeEvaluator<'a, O, R> {
    observer: &'a O,
    runner: &'a R,
    connect_timeout: Duration,
}

impl<'a, O, R> ProbeEvaluator<'a, O, R>
where
    O: UnitObserver,
    R: CommandRunner,
{
    /// Create an evaluator over the given seams.
    #[must_use]
    pub const fn new(observer: &'a O, runner: &'a R, connect_timeout: Duration) -> Self {
        Self {
            observer,
            runner,
            connect_timeout,
        }
    }

    /// Evaluate one predicate sample.
    ///
    /// Transient failures (command exited nonzero, probe could not run,
    /// supervisor query failed) report `Ok(false)` so a surrounding
    /// convergence check retries them. Authorization and configuration
    /// failures raise a [`ProbeFault`] and are never retried.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeFault`] on policy denial or a missing namespace.
    pub async fn evaluate(&self, predicate: &ProbePredicate) -> Result<bool, ProbeFault> {
        match predicate {
            ProbePredicate::CommandSucceeds { namespace, command } => {
                let output = self.run(namespace.as_deref(), command).await?;
                Ok(output.is_some_and(|out| out.success()))
            }
            ProbePredicate::SubstringMatch {
                namespace,
                command,
                pattern,
            } => {
                let output = self.run(namespace.as_deref(), command).await?;
                Ok(output
                    .is_some_and(|out| out.success() && pattern.is_match(&out.stdout)))
            }
            ProbePredicate::ExactOutputMatch {
                namespace,
                command,
                pattern,
            } => {
                let output = self.run(namespace.as_deref(), command).await?;
                Ok(output
                    .is_some_and(|out| out.success() && is_full_match(pattern, &out.stdout)))
            }
            ProbePredicate::JsonFieldPresent {
                namespace,
                command,
                field,
            } => {
                let output = self.run(namespace.as_deref(), command).await?;
                Ok(output.is_some_and(|out| {
                    out.success()
                        && serde_json::from_str::<serde_json::Value>(&out.stdout)
                            .is_ok_and(|value| value.get(field).is_some())
                }))
            }
            ProbePredicate::TcpPortOpen {
                namespace: None,
                host,
                port,
            } => {
                let connect = tokio::net::TcpStream::connect((host.as_str(), *port));
                match tokio::time::timeout(self.connect_timeout, connect).await {
                    Ok(Ok(_stream)) => Ok(true),
                    Ok(Err(_)) | Err(_) => Ok(false),
                }
            }
            ProbePredicate::TcpPortOpen {
                namespace: Some(ns),
                host,
                port,
            } => {
                let command = vec![
                    "nc".to_string(),
                    "-z".to_string(),
                    "-w".to_string(),
                    "1".to_string(),
                    host.clone(),
                    port.to_string(),
                ];
                let output = self.run(Some(ns.as_str()), &command).await?;
                Ok(output.is_some_and(|out| out.success()))
            }
            ProbePredicate::LogPatternPresent {
                unit,
                pattern,
                since,
            } => match self.observer.unit_log(unit, *since).await {
                Ok(lines) => Ok(lines.iter().any(|line| pattern.is_match(&line.text))),
                Err(e) => {
                    debug!(%unit, error = %e, "log query failed, retrying");
                    Ok(false)
                }
            },
            ProbePredicate::LogPatternAbsent { unit, pattern } => {
                match self.observer.unit_log(unit, None).await {
                    Ok(lines) => Ok(!lines.iter().any(|line| pattern.is_match(&line.text))),
                    Err(e) => {
                        debug!(%unit, error = %e, "log query failed, retrying");
                        Ok(false)
                    }
                }
            }
        }
    }

    /// Run a probe command, mapping transient failures to `None`.
    async fn run(
        &self,
        namespace: Option<&str>,
        command: &[String],
    ) -> Result<Option<ExecOutput>, ProbeFault> {
        match self.runner.run(namespace, command).await {
            Ok(output) => Ok(Some(output)),
            Err(e @ (ExecError::Unauthorized { .. } | ExecError::NamespaceNotFound { .. })) => {
                Err(ProbeFault::new(e.to_string()))
            }
            Err(ExecError::Spawn { reason }) => {
                debug!(%reason, "probe spawn failed, retrying");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_match_requires_entire_output() {
        let pattern = Regex::new("Current: =\n").unwrap();
        assert!(is_full_match(&pattern, "Current: =\n"));
        assert!(!is_full_match(&pattern, "Current: = cap_net_admin\n"));
        assert!(!is_full_match(&pattern, "prefix Current: =\n"));
    }

    #[test]
    fn test_substring_and_exact_are_distinct() {
        let pattern = Regex::new("\"version\"").unwrap();
        let output = "{\n  \"version\": 270000\n}";
        assert!(pattern.is_match(output));
        assert!(!is_full_match(&pattern, output));
    }

    #[test]
    fn test_describe_names_the_subject() {
        let present = ProbePredicate::LogPatternPresent {
            unit: "bitcoind-import-banlist".to_string(),
            pattern: Regex::new("Importing node banlist").unwrap(),
            since: None,
        };
        assert!(present.describe().contains("bitcoind-import-banlist"));
        assert!(present.describe().contains("Importing node banlist"));

        let absent = ProbePredicate::LogPatternAbsent {
            unit: "lnd".to_string(),
            pattern: Regex::new("Failed with result").unwrap(),
        };
        assert!(absent.describe().contains("free of"));
    }
}
