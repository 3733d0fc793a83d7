//! # Peck
//! This repository contains the back end of Peck,
//! a small language for describing, mapping and editing binary data:
//! the pass engine and code generator, and the VM that runs what they emit.
//! The lexer, parser and type checker live elsewhere;
//! they hand this crate a fully typed tree.
//!
//! ## Embedding Peck in Rust
//! Add peck to your `Cargo.toml`:
//! ```toml
//! peck = "0.1"
//! ```
//! Then build (or receive) a typed `Ast`, compile it and run it:
//! ```ignore
//! use peck::{compiler::{compile, Flavor}, vm::{ios::MemoryDevice, vm::VM}};
//!
//! let program = compile(&mut ast, Flavor::Expression)?;
//! let mut vm = VM::init();
//! vm.open(Box::new(MemoryDevice::new(bytes)));
//! let (exit, value) = vm.run(program);
//! ```
//!
//! ## Overview of the compilation process
//! The tree lives in an arena, `construct::tree::Ast`.
//! Every compiler step is a `compiler::pass` over that arena:
//! an analysis pass that checks the hand-off and folds constants,
//! then the code generator, which emits bytecode through
//! the structured assembler in `compiler::asm`.
//! Structured values the program maps onto the backing store
//! carry closures, generated alongside the program,
//! that decode them again or encode them back when assigned to.

pub mod common;
pub mod construct;
pub mod compiler;
pub mod vm;
