use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Severity of a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => f.write_str("info"),
            Severity::Warning => f.write_str("warning"),
            Severity::Error => f.write_str("error"),
        }
    }
}

/// The distinct analysis-time diagnostic kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagnosticKind {
    LaunchedIncorrectly,
    MissingPackageJson,
    InvalidJsonSyntax,
    NoScriptsInPackageJson,
    ScriptNotFound,
    WireitConfigButNoScript,
    ScriptNotWireit,
    InvalidConfigSyntax,
    DuplicateDependency,
    Cycle,
    DependencyOnMissingPackageJson,
    DependencyOnMissingScript,
    InvalidUsage,
}

impl DiagnosticKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DiagnosticKind::LaunchedIncorrectly => "launched-incorrectly",
            DiagnosticKind::MissingPackageJson => "missing-package-json",
            DiagnosticKind::InvalidJsonSyntax => "invalid-json-syntax",
            DiagnosticKind::NoScriptsInPackageJson => "no-scripts-in-package-json",
            DiagnosticKind::ScriptNotFound => "script-not-found",
            DiagnosticKind::WireitConfigButNoScript => "wireit-config-but-no-script",
            DiagnosticKind::ScriptNotWireit => "script-not-wireit",
            DiagnosticKind::InvalidConfigSyntax => "invalid-config-syntax",
            DiagnosticKind::DuplicateDependency => "duplicate-dependency",
            DiagnosticKind::Cycle => "cycle",
            DiagnosticKind::DependencyOnMissingPackageJson => "dependency-on-missing-package-json",
            DiagnosticKind::DependencyOnMissingScript => "dependency-on-missing-script",
            DiagnosticKind::InvalidUsage => "invalid-usage",
        }
    }
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A byte range inside a source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub offset: usize,
    pub length: usize,
}

impl Range {
    pub fn new(offset: usize, length: usize) -> Self {
        Self { offset, length }
    }
}

/// A position inside a specific manifest file.
///
/// Carries the file contents so diagnostics can be rendered after the
/// manifest cache has been dropped or the file has changed on disk.
#[derive(Debug, Clone)]
pub struct Location {
    pub path: Arc<PathBuf>,
    pub contents: Arc<str>,
    pub range: Range,
}

impl Location {
    pub fn new(path: Arc<PathBuf>, contents: Arc<str>, range: Range) -> Self {
        Self {
            path,
            contents,
            range,
        }
    }

    /// 1-based line and column of the start of this location.
    pub fn line_col(&self) -> (usize, usize) {
        line_col(&self.contents, self.range.offset)
    }
}

/// 1-based line and column for a byte offset in `contents`.
pub fn line_col(contents: &str, offset: usize) -> (usize, usize) {
    let clamped = offset.min(contents.len());
    let mut line = 1;
    let mut line_start = 0;
    for (idx, byte) in contents.as_bytes()[..clamped].iter().enumerate() {
        if *byte == b'\n' {
            line += 1;
            line_start = idx + 1;
        }
    }
    (line, clamped - line_start + 1)
}

/// A secondary location annotating a diagnostic.
#[derive(Debug, Clone)]
pub struct Label {
    pub location: Location,
    pub message: String,
}

/// An analysis-time diagnostic with a primary source position.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub kind: DiagnosticKind,
    pub message: String,
    pub location: Option<Location>,
    pub supplemental: Vec<Label>,
}

impl Diagnostic {
    pub fn error(kind: DiagnosticKind, message: impl Into<String>, location: Location) -> Self {
        Self {
            severity: Severity::Error,
            kind,
            message: message.into(),
            location: Some(location),
            supplemental: Vec::new(),
        }
    }

    pub fn warning(kind: DiagnosticKind, message: impl Into<String>, location: Location) -> Self {
        Self {
            severity: Severity::Warning,
            kind,
            message: message.into(),
            location: Some(location),
            supplemental: Vec::new(),
        }
    }

    /// A diagnostic with no source position, for failures that precede
    /// reading any file (e.g. the manifest itself is missing).
    pub fn bare(kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            kind,
            message: message.into(),
            location: None,
            supplemental: Vec::new(),
        }
    }

    pub fn with_label(mut self, location: Location, message: impl Into<String>) -> Self {
        self.supplemental.push(Label {
            location,
            message: message.into(),
        });
        self
    }
}
