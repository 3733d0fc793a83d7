//! The tree the compiler works on.
//! `tree` is the arena itself; `build` helps put one together by hand.

pub mod tree;
pub mod build;
