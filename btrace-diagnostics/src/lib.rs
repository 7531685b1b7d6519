// Diagnostic reporting for the btrace front-end
// Spans, severity levels, and a per-phase accumulator

use colored::Colorize;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Source code location, 1-based
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub line: usize,
    pub column: usize,
}

impl Span {
    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }

    /// Derive line/column from a byte range into the source text
    pub fn from_offset(source: &str, span: std::ops::Range<usize>) -> Self {
        let before = &source[..span.start.min(source.len())];
        let line = before.chars().filter(|&c| c == '\n').count() + 1;
        let column = before
            .rfind('\n')
            .map_or(before.len() + 1, |pos| before.len() - pos);

        Self { line, column }
    }

    pub fn unknown() -> Self {
        Self { line: 0, column: 0 }
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Error,
    Warning,
    Note,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Level::Error => write!(f, "{}", "error".red().bold()),
            Level::Warning => write!(f, "{}", "warning".yellow().bold()),
            Level::Note => write!(f, "{}", "note".cyan().bold()),
        }
    }
}

/// A single message tied to a source location
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub level: Level,
    pub message: String,
    pub span: Span,
    pub help: Option<String>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>, span: Span) -> Self {
        Self {
            level: Level::Error,
            message: message.into(),
            span,
            help: None,
        }
    }

    pub fn warning(message: impl Into<String>, span: Span) -> Self {
        Self {
            level: Level::Warning,
            message: message.into(),
            span,
            help: None,
        }
    }

    pub fn note(message: impl Into<String>, span: Span) -> Self {
        Self {
            level: Level::Note,
            message: message.into(),
            span,
            help: None,
        }
    }

    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {} (at {})", self.level, self.message, self.span)?;
        if let Some(help) = &self.help {
            write!(f, "\n  {}: {}", "help".green().bold(), help)?;
        }
        Ok(())
    }
}

/// Accumulates diagnostics within a compilation phase.
///
/// Phases report everything they find and fail at their boundary, so the
/// user sees all of a phase's errors at once.
#[derive(Debug, Default)]
pub struct Diagnostics {
    items: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diag: Diagnostic) {
        self.items.push(diag);
    }

    pub fn error(&mut self, message: impl Into<String>, span: Span) {
        self.push(Diagnostic::error(message, span));
    }

    pub fn has_errors(&self) -> bool {
        self.items.iter().any(|d| d.level == Level::Error)
    }

    pub fn error_count(&self) -> usize {
        self.items.iter().filter(|d| d.level == Level::Error).count()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.items.iter()
    }

    /// Render every accumulated diagnostic to stderr.
    pub fn eprint_all(&self) {
        for diag in &self.items {
            eprintln!("{}", diag);
        }
    }

    /// Phase-boundary check: Ok when no errors were emitted.
    pub fn check(&self) -> Result<(), PhaseError> {
        match self.error_count() {
            0 => Ok(()),
            n => Err(PhaseError { errors: n }),
        }
    }
}

/// A phase failed after accumulating one or more errors.
#[derive(Debug, thiserror::Error)]
#[error("{errors} error(s) emitted")]
pub struct PhaseError {
    pub errors: usize,
}

/// Pick the closest candidate to `name`, for "did you mean" help lines.
///
/// Returns None when nothing is close enough to be a plausible typo.
pub fn closest_match<'a>(name: &str, candidates: &[&'a str]) -> Option<&'a str> {
    candidates
        .iter()
        .map(|c| (*c, strsim::levenshtein(name, c)))
        .filter(|(c, dist)| *dist <= 2 && *dist < c.len())
        .min_by_key(|(_, dist)| *dist)
        .map(|(c, _)| c)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_from_offset() {
        let src = "kprobe:f\n{ pid }\n";
        assert_eq!(Span::from_offset(src, 0..6), Span::new(1, 1));
        assert_eq!(Span::from_offset(src, 11..14), Span::new(2, 3));
    }

    #[test]
    fn bag_counts_errors_only() {
        let mut bag = Diagnostics::new();
        bag.push(Diagnostic::warning("meh", Span::unknown()));
        assert!(!bag.has_errors());
        assert!(bag.check().is_ok());
        bag.error("bad", Span::new(1, 1));
        assert!(bag.has_errors());
        assert_eq!(bag.error_count(), 1);
        let err = bag.check().expect_err("phase must fail");
        assert_eq!(err.errors, 1);
    }

    #[test]
    fn suggestion_finds_close_name() {
        let builtins = ["pid", "tid", "nsecs", "comm"];
        assert_eq!(closest_match("pd", &builtins), Some("pid"));
        assert_eq!(closest_match("nsec", &builtins), Some("nsecs"));
        assert_eq!(closest_match("zzzzz", &builtins), None);
    }
}
