use std::{
    fmt::{self, Debug, Display, Formatter},
    rc::Rc,
};

use crate::common::source::Source;

/// A `Span` refers to a section of a `Source`.
/// Every AST node carries one, so that internal compiler errors
/// can report where the offending node came from.
#[derive(Clone, Eq, PartialEq)]
pub struct Span {
    source: Rc<Source>,
    offset: usize,
    length: usize,
}

impl Span {
    pub fn new(source: &Rc<Source>, offset: usize, length: usize) -> Span {
        Span { source: Rc::clone(source), offset, length }
    }

    /// A zero-length `Span` at a single point in the source.
    pub fn point(source: &Rc<Source>, offset: usize) -> Span {
        Span::new(source, offset, 0)
    }

    /// A `Span` for nodes that have no text behind them,
    /// such as nodes built by hand or synthesized by a pass.
    pub fn empty() -> Span {
        Span::point(&Source::source(""), 0)
    }

    pub fn end(&self) -> usize {
        self.offset + self.length
    }

    pub fn is_empty(&self) -> bool {
        self.source.contents.is_empty()
    }

    /// Returns the text the `Span` covers.
    pub fn contents(&self) -> &str {
        &self.source.contents[self.offset..self.end()]
    }

    pub fn path(&self) -> String {
        self.source.path.to_string_lossy().to_string()
    }

    /// Zero-based line of a byte index.
    fn line(&self, index: usize) -> usize {
        self.source.contents[..index].matches('\n').count()
    }

    /// Zero-based column of a byte index.
    fn col(&self, index: usize) -> usize {
        self.source.contents[..index]
            .rsplit('\n')
            .next()
            .unwrap_or("")
            .chars()
            .count()
    }
}

impl Debug for Span {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Span")
            .field("start", &self.offset)
            .field("end", &self.end())
            .finish()
    }
}

impl Display for Span {
    /// Points out where the `Span` occurs in its source:
    /// ```plain
    /// In ./source:1:5
    ///   |
    /// 1 | x = y @ 100#B
    ///   |     ^
    /// ```
    /// Spans without text behind them print nothing.
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return Ok(());
        }

        let line = self.line(self.offset);
        let start_col = self.col(self.offset);
        let text = self.source.contents.split('\n').nth(line).unwrap_or("");
        let gutter = " ".repeat((line + 1).to_string().len());
        let carrots = if self.line(self.end()) == line {
            (self.col(self.end()) - start_col).max(1)
        } else {
            text.chars().count().saturating_sub(start_col).max(1)
        };

        writeln!(f, "In {}:{}:{}", self.path(), line + 1, start_col + 1)?;
        writeln!(f, "{} |", gutter)?;
        writeln!(f, "{} | {}", line + 1, text)?;
        writeln!(f, "{} | {}{}", gutter, " ".repeat(start_col), "^".repeat(carrots))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn contents() {
        let source = Source::source("uint<8>[3] @ 0#B");
        assert_eq!(Span::new(&source, 0, 7).contents(), "uint<8>");
    }

    #[test]
    fn display() {
        let source = Source::source("var x = 1;\nx = y @ 100#B;");
        let span = Span::new(&source, 15, 1);
        let target = "\
            In ./source:2:5\n  \
              |\n\
            2 | x = y @ 100#B;\n  \
              |     ^\n\
        ";
        assert_eq!(format!("{}", span), target);
    }

    #[test]
    fn empty() {
        assert_eq!(format!("{}", Span::empty()), "");
    }
}
