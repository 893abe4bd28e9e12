//! Diagnostics: locations, severities, and caret-style rendering.
//!
//! The Analyzer never throws on a validation problem; it accumulates
//! [`Diagnostic`] values and returns them as a batch (`spec.md` §4.1, §7).
//! Rendering is layered on [`annotate_snippets`], the same crate
//! `rust-lang/cargo` uses for its own diagnostic output.

use annotate_snippets::{Level, Renderer, Snippet};
use derive_more::Display;

use crate::path::{AbsDirPath, AbsFilePath};

/// A byte-offset span within a specific file, as preserved by the manifest
/// loader's span-aware JSON parse.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Location {
    pub file: AbsFilePath,
    pub offset: usize,
    pub length: usize,
}

impl Location {
    pub fn new(file: AbsFilePath, offset: usize, length: usize) -> Self {
        Self {
            file,
            offset,
            length,
        }
    }

    /// A location spanning the whole file, used for file-level failures
    /// (invalid JSON, a missing manifest) that have no narrower span.
    pub fn whole_file(file: AbsFilePath) -> Self {
        Self {
            file,
            offset: 0,
            length: 0,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Display)]
pub enum Severity {
    #[display("error")]
    Error,
    #[display("warning")]
    Warning,
}

/// One diagnostic: a message anchored at a primary location, with zero or
/// more supplemental locations carrying their own label (`spec.md` §4.1).
#[derive(Clone, Debug)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub primary: Location,
    pub supplemental: Vec<(String, Location)>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>, primary: Location) -> Self {
        Self {
            severity: Severity::Error,
            message: message.into(),
            primary,
            supplemental: Vec::new(),
        }
    }

    pub fn with_supplemental(mut self, label: impl Into<String>, location: Location) -> Self {
        self.supplemental.push((label.into(), location));
        self
    }
}

/// Express `file` relative to `cwd` for display, falling back to the
/// absolute path if `file` is not nested under `cwd`.
fn relativize_for_display(cwd: &AbsDirPath, file: &AbsFilePath) -> String {
    match cwd.relativize(file) {
        Some(rel) => rel.to_string(),
        None => file.to_string(),
    }
}

/// Render a single diagnostic as a caret-style excerpt, given the already
/// read source text of its primary file and, for each supplemental
/// location, the source text of *that* file (by index, matching
/// `diagnostic.supplemental`).
pub fn render_diagnostic(
    diagnostic: &Diagnostic,
    cwd: &AbsDirPath,
    primary_source: &str,
    supplemental_sources: &[&str],
) -> String {
    let level = match diagnostic.severity {
        Severity::Error => Level::Error,
        Severity::Warning => Level::Warning,
    };

    let primary_origin = relativize_for_display(cwd, &diagnostic.primary.file);
    let primary_span = diagnostic.primary.offset
        ..(diagnostic.primary.offset + diagnostic.primary.length).max(diagnostic.primary.offset);

    let mut message = level.title(&diagnostic.message).snippet(
        Snippet::source(primary_source)
            .origin(&primary_origin)
            .fold(true)
            .annotation(Level::Error.span(primary_span)),
    );

    for ((label, location), source) in diagnostic
        .supplemental
        .iter()
        .zip(supplemental_sources.iter())
    {
        let origin = relativize_for_display(cwd, &location.file);
        let span = location.offset..(location.offset + location.length).max(location.offset);
        message = message.snippet(
            Snippet::source(*source)
                .origin(&origin)
                .fold(true)
                .annotation(Level::Info.span(span).label(label)),
        );
    }

    Renderer::styled().render(message).to_string()
}

/// Format a cycle's DFS trail in the `.-> a / |  b / \`-- a` style described
/// in `spec.md` §8: a box-drawn path from the first stack entry matching the
/// repeated reference down to the repeated reference itself.
pub fn format_cycle_trail(labels: &[String]) -> String {
    let last = labels.len().saturating_sub(1);
    labels
        .iter()
        .enumerate()
        .map(|(i, label)| {
            if i == 0 {
                format!(".-> {label}")
            } else if i == last {
                format!("`-- {label}")
            } else {
                format!("|   {label}")
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_cycle_is_two_lines() {
        let trail = format_cycle_trail(&["a".to_string(), "a".to_string()]);
        assert_eq!(trail, ".-> a\n`-- a");
    }

    #[test]
    fn three_cycle_trail() {
        let labels = ["a", "b", "c", "a"].map(String::from);
        let trail = format_cycle_trail(&labels);
        assert_eq!(trail, ".-> a\n|   b\n|   c\n`-- a");
    }
}
