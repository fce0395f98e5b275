//! Plain-text rendering of diagnostics with source excerpts.

use wireit_protocol::{Diagnostic, Location};

/// Render one diagnostic as `severity [kind] message` plus a caret excerpt
/// of the offending line for every location it carries.
pub fn render(diagnostic: &Diagnostic) -> String {
    let mut out = format!(
        "{} [{}] {}",
        diagnostic.severity, diagnostic.kind, diagnostic.message
    );
    if let Some(location) = &diagnostic.location {
        out.push('\n');
        out.push_str(&excerpt(location));
    }
    for label in &diagnostic.supplemental {
        out.push('\n');
        out.push_str(&format!("  note: {}", label.message));
        out.push('\n');
        out.push_str(&excerpt(&label.location));
    }
    out
}

fn excerpt(location: &Location) -> String {
    let (line, col) = location.line_col();
    let source_line = location
        .contents
        .lines()
        .nth(line - 1)
        .unwrap_or_default();
    let caret_width = location.range.length.clamp(1, source_line.len().max(1));
    let mut out = format!("  --> {}:{line}:{col}\n", location.path.display());
    out.push_str(&format!("   | {source_line}\n"));
    out.push_str(&format!(
        "   | {}{}",
        " ".repeat(col.saturating_sub(1)),
        "^".repeat(caret_width)
    ));
    out
}
