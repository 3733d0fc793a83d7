//! Contains datastructures and utility functions
//! common to both the `compiler` and `vm`.
//!
//! - Core data-structures: values, programs, closures and environments.
//! - Opcodes and number splicing.
//! - Source code representation and span annotations.
//! - The configuration code is decoded and rendered under.

pub mod source;
pub mod span;
pub mod data;
pub mod number;
pub mod opcode;
pub mod lambda;
pub mod closure;
pub mod env;
pub mod config;
