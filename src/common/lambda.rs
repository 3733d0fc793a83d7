use std::fmt::{self, Debug, Formatter};

use crate::common::data::Data;

/// A finished, immutable bytecode program.
/// Think a function body: closing it over an environment
/// makes it a `Closure`.
#[derive(Clone, Default)]
pub struct Lambda {
    pub code: Vec<u8>, // each byte is an opcode or part of an operand
    pub constants: Vec<Data>, // indexed by `Push`
    pub note: Option<String>,
}

impl Lambda {
    /// The name the program was noted with, for tracebacks.
    pub fn name(&self) -> &str {
        self.note.as_deref().unwrap_or("<anonymous>")
    }

    pub fn constant(&self, index: usize) -> Option<&Data> {
        self.constants.get(index)
    }
}

impl Debug for Lambda {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lambda")
            .field("note", &self.name())
            .field("code", &self.code.len())
            .field("constants", &self.constants)
            .finish()
    }
}
