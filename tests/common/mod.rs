//! Shared helpers: compiling hand-built trees and running them.
#![allow(dead_code)]

use std::{cell::RefCell, rc::Rc};

use peck::{
    common::data::{Data, Int},
    compiler::{compile, Flavor},
    construct::tree::{Ast, NodeId},
    vm::{
        ios::MemoryDevice,
        vm::{Exit, VM},
    },
};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Compiles and runs a tree, which must compile.
pub fn run(vm: &mut VM, mut ast: Ast, flavor: Flavor) -> (Exit, Option<Data>) {
    init_logger();
    let program = compile(&mut ast, flavor).expect("tree should compile");
    vm.run(program)
}

/// A VM backed by the given bytes, and a handle on them.
pub fn vm_over(bytes: Vec<u8>) -> (VM, Rc<RefCell<MemoryDevice>>) {
    let device = Rc::new(RefCell::new(MemoryDevice::new(bytes)));
    let mut vm = VM::init();
    vm.open(Box::new(Rc::clone(&device)));
    (vm, device)
}

pub fn int(value: i32) -> Data {
    Data::Int(Int::int(value))
}

/// A byte offset literal of type `offset<uint<64>,B>`.
pub fn byte_offset(ast: &mut Ast, bytes: u64) -> NodeId {
    let base = ast.integral(64, false);
    let ty = ast.offset_type(base, 8);
    let magnitude = ast.integer(bytes, base);
    ast.offset(magnitude, 8, ty)
}
