use crate::ScriptReference;

/// What happened to a script, as observed on the executor's event stream.
///
/// The executor owns the single writer; the logger and tests subscribe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// The stored fingerprint matched; nothing ran.
    Fresh,
    /// Outputs were restored from the cache; nothing ran.
    Cached,
    /// A child process was spawned for this script.
    Spawned,
    /// The child exited with status zero.
    ExitZero,
    /// A line of child output (already forwarded to the logger).
    Output { stderr: bool, line: String },
    /// A service reached its started state.
    ServiceStarted,
    /// A service child was adopted from the previous executor without a
    /// restart.
    ServiceAdopted,
    /// A service was stopped on purpose.
    ServiceStopped,
    /// The script failed; the failure itself travels on the result path.
    Failed { code: &'static str },
}

/// One entry on the executor's event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionEvent {
    pub script: ScriptReference,
    pub kind: EventKind,
}

impl ExecutionEvent {
    pub fn new(script: ScriptReference, kind: EventKind) -> Self {
        Self { script, kind }
    }
}
