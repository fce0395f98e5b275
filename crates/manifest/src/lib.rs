//! `package.json` reading for the wireit build engine.
//!
//! Diagnostics need byte-accurate source positions, which an off-the-shelf
//! deserializer does not expose, so this crate carries its own small JSON
//! parser that records a span on every node. On top of that sit the
//! structured [`PackageJson`] view and the [`ManifestReader`], an async
//! cache that reads each package directory at most once per generation.

mod ast;
mod package;
mod reader;

pub use ast::{parse_json, JsonNode, Member, NodeKind, ParseError};
pub use package::{PackageJson, ScriptEntry};
pub use reader::{ManifestFailure, ManifestReader};
