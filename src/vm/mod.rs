//! This module contains the core VM implementation.
//! Note that these modules are public for documentation visiblility,
//! But should never be used outside of the module by `common` or `compiler`,
//! apart from `ios`, which embedders implement to hand the VM a backing store.

pub mod vm;

pub mod ios;
pub mod stack;
pub mod trace;
