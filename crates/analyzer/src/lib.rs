//! Build-graph construction.
//!
//! The analyzer resolves a root script reference into a validated
//! [`BuildGraph`]: it reads manifests for the transitive dependency closure,
//! validates every wireit config, resolves dependency specifiers (including
//! `./path:name` cross-package references), expands package-lock patterns,
//! and rejects cycles. Diagnostics accumulate; a failed analysis returns all
//! of them rather than the first.

mod analyze;
mod config;

pub use analyze::{Analysis, Analyzer};
pub use config::{BuildGraph, CleanPolicy, Dependency, ScriptConfig, ScriptKind};
