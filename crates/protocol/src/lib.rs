//! Shared leaf types for the wireit build engine.
//!
//! Everything here is data: script references and their canonical string
//! encoding, analysis diagnostics with source positions, execution failures,
//! and the event stream emitted by the executor. No component logic lives in
//! this crate, which keeps it a dependency leaf for every other crate in the
//! workspace.

mod diagnostic;
mod event;
mod failure;
mod reference;

pub use diagnostic::{line_col, Diagnostic, DiagnosticKind, Label, Location, Range, Severity};
pub use event::{EventKind, ExecutionEvent};
pub use failure::{Failure, FailureReason};
pub use reference::{PackageReference, ScriptKey, ScriptReference};
