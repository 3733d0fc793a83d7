use std::fmt;

use thiserror::Error;

use crate::common::span::Span;

/// A location attached to a compile-time error,
/// with an optional hint about what is there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Note {
    pub span: Span,
    pub hint: Option<String>,
}

impl Note {
    pub fn new(span: Span) -> Note {
        Note { span, hint: None }
    }

    pub fn new_with_hint(hint: &str, span: &Span) -> Note {
        Note { span: span.clone(), hint: Some(hint.to_string()) }
    }
}

/// An internal compiler error: the generator met a tree it has no
/// handler for, or a conversion it does not support.
/// These are never the user's fault; they mean an earlier pass
/// and the code generator disagree about what the tree looks like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Syntax {
    pub reason: String,
    pub notes: Vec<Note>,
}

impl Syntax {
    pub fn error(reason: &str, span: &Span) -> Syntax {
        Syntax::error_with_note(reason, Note::new(span.clone()))
    }

    pub fn error_with_note(reason: &str, note: Note) -> Syntax {
        Syntax { reason: reason.to_string(), notes: vec![note] }
    }

    /// An error with no location to point at.
    pub fn error_no_note(reason: &str) -> Syntax {
        Syntax { reason: reason.to_string(), notes: vec![] }
    }

    pub fn add_note(mut self, note: Note) -> Self {
        self.notes.push(note);
        self
    }
}

impl fmt::Display for Syntax {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for note in self.notes.iter() {
            write!(f, "{}", note.span)?;
            if let Some(ref hint) = note.hint {
                writeln!(f, "note: {}", hint)?;
            }
        }
        write!(f, "Internal Compiler Error: {}", self.reason)
    }
}

/// Everything that can stop a compilation.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("{0}")]
    Internal(Syntax),
    /// Allocation failed while building the tree or a program.
    /// Unlike an internal error, retrying with more memory may succeed.
    #[error("out of memory while {0}")]
    Exhausted(&'static str),
}

impl From<Syntax> for CompileError {
    fn from(syntax: Syntax) -> CompileError {
        CompileError::Internal(syntax)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::source::Source;

    #[test]
    fn error() {
        let source = Source::source("x = y @ 100#B");
        let error = Syntax::error("unhandled node Map", &Span::new(&source, 4, 9))
            .add_note(Note::new_with_hint("declared here", &Span::new(&source, 0, 1)));

        let target = "\
            In ./source:1:5\n  \
              |\n\
            1 | x = y @ 100#B\n  \
              |     ^^^^^^^^^\n\
            In ./source:1:1\n  \
              |\n\
            1 | x = y @ 100#B\n  \
              | ^\n\
            note: declared here\n\
            Internal Compiler Error: unhandled node Map\
        ";
        assert_eq!(format!("{}", error), target);
    }

    #[test]
    fn exhaustion_is_distinct() {
        let error = CompileError::Exhausted("assembling a program");
        assert_eq!(error.to_string(), "out of memory while assembling a program");
        assert!(matches!(CompileError::from(Syntax::error_no_note("x")), CompileError::Internal(_)));
    }
}
