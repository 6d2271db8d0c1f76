//! Byte-offset source spans and diagnostic snippet rendering.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A half-open byte range into the source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Span {
        Span { start, end }
    }

    /// The smallest span covering both operands.
    pub fn merge(self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    /// Shifts the span by a fixed offset; used when re-parsing interpolation
    /// segments whose text was carved out of a larger source.
    pub fn offset(self, by: usize) -> Span {
        Span {
            start: self.start + by,
            end: self.end + by,
        }
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// 1-based line/column position of a byte offset.
pub fn line_col(source: &str, offset: usize) -> (usize, usize) {
    let offset = offset.min(source.len());
    let mut line = 1;
    let mut col = 1;
    for (i, c) in source.char_indices() {
        if i >= offset {
            break;
        }
        if c == '\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    (line, col)
}

/// Renders the source line a span starts on, with a caret underline:
///
/// ```text
///  3 | out = Upper(n)
///    |             ^
/// ```
pub fn render_snippet(source: &str, span: Span) -> String {
    let (line_no, col) = line_col(source, span.start);
    let line_text = source.lines().nth(line_no - 1).unwrap_or("");
    let width = span.end.saturating_sub(span.start).max(1);
    let underline_width = width.min(line_text.len().saturating_sub(col - 1).max(1));
    let gutter = line_no.to_string();
    let pad = " ".repeat(gutter.len());
    format!(
        "{gutter} | {line_text}\n{pad} | {caret_pad}{carets}",
        caret_pad = " ".repeat(col - 1),
        carets = "^".repeat(underline_width),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_covers_both() {
        let merged = Span::new(3, 7).merge(Span::new(5, 12));
        assert_eq!(merged, Span::new(3, 12));
    }

    #[test]
    fn line_col_counts_from_one() {
        let src = "ab\ncd\nef";
        assert_eq!(line_col(src, 0), (1, 1));
        assert_eq!(line_col(src, 3), (2, 1));
        assert_eq!(line_col(src, 7), (3, 2));
    }

    #[test]
    fn snippet_has_caret_under_span() {
        let src = "in n: Int\nout = Upper(n)";
        let snippet = render_snippet(src, Span::new(22, 23));
        assert!(snippet.contains("out = Upper(n)"));
        assert!(snippet.lines().nth(1).unwrap().contains('^'));
    }
}
