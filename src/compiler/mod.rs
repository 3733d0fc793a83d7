//! This module contains the compiler implementation.
//! It takes over from the resolver, which hands it a fully typed `Ast`,
//! and turns that tree into bytecode the `vm` can run.
//!
//! Every step is a pass over the same tree, driven by `pass`:
//!
//! 1. Analysis: `check.rs` and `fold.rs`, run together in one pass.
//! 2. Bytecode: `gen.rs`, emitting through the structured assembler in `asm.rs`.
//!
//! Compilation either yields one finished program or fails as a whole;
//! closures built before a failure are dropped with it.

pub mod asm;
pub mod check;
pub mod fold;
pub mod gen;
pub mod pass;
pub mod syntax;

use std::rc::Rc;

use crate::{
    common::lambda::Lambda,
    construct::tree::Ast,
};

pub use gen::Flavor;
use pass::Completion;
use syntax::{CompileError, Syntax};

/// Compiles a typed tree into a top-level program.
/// Analysis may rewrite the tree in place.
pub fn compile(ast: &mut Ast, flavor: Flavor) -> Result<Rc<Lambda>, CompileError> {
    let (check, fold) = (check::phase(), fold::phase());
    pass::run(ast, &[&check, &fold], &mut ())?;

    let gen = gen::phase();
    let mut payload = gen::Gen::new(flavor);
    match pass::run(ast, &[&gen], &mut payload)? {
        Completion::Finished => payload.finish(),
        Completion::Exited => Err(Syntax::error_no_note("code generation stopped before the end").into()),
    }
}
