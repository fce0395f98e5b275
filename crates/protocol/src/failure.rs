use std::fmt;

use crate::ScriptReference;

/// Why a script execution failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The child ran to completion with a non-zero status.
    ExitNonZero { code: i32 },
    /// The child was terminated by a signal.
    Signal { signal: String },
    /// The child could not be spawned at all.
    SpawnError { message: String },
    /// A start request was cancelled before the child spawned.
    StartCancelled,
    /// The child was killed by the engine (failure mode `kill`).
    Killed,
    /// A non-failure error escaped a component.
    UnknownErrorThrown { message: String },
    /// A dependency of this script failed; this script never started.
    DependencyFailed { dependency: ScriptReference },
    /// A service exited on its own while it was expected to keep running.
    ServiceExitedUnexpectedly,
    /// A service this script depends on exited while this script needed it.
    DependencyServiceExitedUnexpectedly { dependency: ScriptReference },
    /// The global abort signal fired before or during this script.
    Aborted,
}

impl FailureReason {
    pub fn as_code(&self) -> &'static str {
        match self {
            FailureReason::ExitNonZero { .. } => "exit-non-zero",
            FailureReason::Signal { .. } => "signal",
            FailureReason::SpawnError { .. } => "spawn-error",
            FailureReason::StartCancelled => "start-cancelled",
            FailureReason::Killed => "killed",
            FailureReason::UnknownErrorThrown { .. } => "unknown-error-thrown",
            FailureReason::DependencyFailed { .. } => "dependency-failed",
            FailureReason::ServiceExitedUnexpectedly => "service-exited-unexpectedly",
            FailureReason::DependencyServiceExitedUnexpectedly { .. } => {
                "dependency-service-exited-unexpectedly"
            }
            FailureReason::Aborted => "aborted",
        }
    }

    /// Whether this failure merely points at another script's failure rather
    /// than being a root cause of its own.
    pub fn is_derivative(&self) -> bool {
        matches!(self, FailureReason::DependencyFailed { .. })
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::ExitNonZero { code } => write!(f, "exited with status {code}"),
            FailureReason::Signal { signal } => write!(f, "terminated by signal {signal}"),
            FailureReason::SpawnError { message } => write!(f, "failed to spawn: {message}"),
            FailureReason::StartCancelled => f.write_str("start was cancelled"),
            FailureReason::Killed => f.write_str("killed"),
            FailureReason::UnknownErrorThrown { message } => {
                write!(f, "unexpected internal error: {message}")
            }
            FailureReason::DependencyFailed { dependency } => {
                write!(f, "dependency {} failed", dependency.name)
            }
            FailureReason::ServiceExitedUnexpectedly => {
                f.write_str("service exited unexpectedly")
            }
            FailureReason::DependencyServiceExitedUnexpectedly { dependency } => {
                write!(f, "service dependency {} exited unexpectedly", dependency.name)
            }
            FailureReason::Aborted => f.write_str("aborted"),
        }
    }
}

/// A script execution failure, as aggregated by the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub script: ScriptReference,
    pub reason: FailureReason,
}

impl Failure {
    pub fn new(script: ScriptReference, reason: FailureReason) -> Self {
        Self { script, reason }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.script.name, self.reason)
    }
}
