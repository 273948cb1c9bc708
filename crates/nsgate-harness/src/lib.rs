//! Convergence verification harness for nsgate deployments.
//!
//! A multi-service stack has unbounded and variable startup latency:
//! chain sync, key derivation, downstream readiness. A single synchronous
//! check against such a stack is flaky by construction. This crate
//! provides the pieces used to assert that a deployment has converged to
//! its expected state within a bounded wait:
//!
//! - [`observer`]: queries a supervised unit's lifecycle state and its
//!   structured log stream since an optional timestamp.
//! - [`convergence`]: the bounded retry combinator
//!   ([`convergence::await_condition`]).
//! - [`predicate`]: the typed probe set (command success, substring and
//!   exact output matches, log pattern present/absent, TCP reachability,
//!   JSON field presence).
//! - [`secrets`]: secret file ownership and mode verification.
//! - [`runner`]: command execution seams over the host and the gateway.
//! - [`scenario`]: the ordered end-to-end validation pass.

pub mod convergence;
pub mod observer;
pub mod predicate;
pub mod runner;
pub mod scenario;
pub mod secrets;

pub use convergence::{await_condition, Converged, ProbeFault, WaitConfig, WaitError};
pub use observer::{LogLine, ObserverError, SystemdObserver, UnitObserver, UnitState};
pub use predicate::{ProbeEvaluator, ProbePredicate};
pub use runner::{CommandRunner, ExecError, ExecOutput, GatewayProbe, HostRunner};
pub use scenario::{ScenarioError, ScenarioReport, ScenarioRunner, Step};
pub use secrets::{verify_secret, SecretError};
