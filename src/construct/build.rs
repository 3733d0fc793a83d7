//! Shorthands for building typed trees, as a parser and resolver would.
//! Every node built here has an empty span.

use crate::{
    common::span::Span,
    construct::tree::{Ast, Attr, DeclKind, Kind, Lexical, NodeId, Op, Type},
};

impl Ast {
    fn node(&mut self, kind: Kind, ty: Option<NodeId>) -> NodeId {
        self.push(kind, Span::empty(), ty)
    }

    fn ty(&mut self, ty: Type) -> NodeId {
        self.node(Kind::Type(ty), None)
    }

    pub fn integral(&mut self, size: u8, signed: bool) -> NodeId {
        self.ty(Type::Integral { size, signed })
    }

    pub fn string_type(&mut self) -> NodeId {
        self.ty(Type::String)
    }

    pub fn void_type(&mut self) -> NodeId {
        self.ty(Type::Void)
    }

    /// An offset type counting `unit` bits per unit, e.g. `offset<uint<32>,B>`.
    pub fn offset_type(&mut self, base: NodeId, unit: u64) -> NodeId {
        let unit = self.unit(unit);
        self.ty(Type::Offset { base, unit })
    }

    pub fn array_type(&mut self, etype: NodeId, bound: Option<NodeId>) -> NodeId {
        self.ty(Type::Array { etype, bound })
    }

    /// A struct type with fields in the given order.
    pub fn struct_type(&mut self, name: Option<&str>, fields: &[(Option<&str>, NodeId)]) -> NodeId {
        let elems = fields
            .iter()
            .map(|(name, ty)| {
                let name = name.map(str::to_string);
                self.node(Kind::StructElemType { name, ty: *ty }, None)
            })
            .collect();
        self.ty(Type::Struct { name: name.map(str::to_string), elems })
    }

    pub fn function_type(&mut self, rtype: NodeId, args: &[NodeId]) -> NodeId {
        let args = args.iter().map(|ty| self.node(Kind::FuncTypeArg { ty: *ty }, None)).collect();
        self.ty(Type::Function { rtype, args })
    }

    /// A unit literal: a `uint<64>` counting bits.
    pub fn unit(&mut self, bits: u64) -> NodeId {
        let ty = self.integral(64, false);
        self.integer(bits, ty)
    }

    pub fn integer(&mut self, value: u64, ty: NodeId) -> NodeId {
        self.node(Kind::Integer { value }, Some(ty))
    }

    pub fn string(&mut self, value: &str) -> NodeId {
        let ty = self.string_type();
        self.node(Kind::String { value: value.to_string() }, Some(ty))
    }

    pub fn identifier(&mut self, name: &str) -> NodeId {
        self.node(Kind::Identifier { name: name.to_string() }, None)
    }

    /// An offset literal, `magnitude#unit`, of type `ty`.
    pub fn offset(&mut self, magnitude: NodeId, unit: u64, ty: NodeId) -> NodeId {
        let unit = self.unit(unit);
        self.node(Kind::Offset { magnitude, unit }, Some(ty))
    }

    pub fn var(&mut self, name: &str, back: usize, over: usize, ty: NodeId) -> NodeId {
        let lexical = Lexical::new(back, over);
        self.node(Kind::Var { name: name.to_string(), lexical }, Some(ty))
    }

    pub fn binary(&mut self, op: Op, a: NodeId, b: NodeId, ty: NodeId) -> NodeId {
        self.node(Kind::Exp { op, attr: None, operands: vec![a, b] }, Some(ty))
    }

    pub fn unary(&mut self, op: Op, a: NodeId, ty: NodeId) -> NodeId {
        self.node(Kind::Exp { op, attr: None, operands: vec![a] }, Some(ty))
    }

    pub fn attr(&mut self, attr: Attr, a: NodeId, ty: NodeId) -> NodeId {
        self.node(Kind::Exp { op: Op::Attr, attr: Some(attr), operands: vec![a] }, Some(ty))
    }

    pub fn cast(&mut self, to: NodeId, exp: NodeId) -> NodeId {
        self.node(Kind::Cast { to, exp }, Some(to))
    }

    /// `ty @ offset`. The result has type `ty`.
    pub fn map(&mut self, ty: NodeId, offset: NodeId, mapper: Option<Lexical>) -> NodeId {
        self.node(Kind::Map { ty, offset, mapper }, Some(ty))
    }

    pub fn scons(&mut self, value: NodeId, constructor: Lexical, ty: NodeId) -> NodeId {
        self.node(Kind::Scons { value, constructor }, Some(ty))
    }

    /// An array literal whose elements are given in index order.
    pub fn array(&mut self, elems: &[NodeId], ty: NodeId) -> NodeId {
        let index_type = self.integral(64, false);
        let initializers = elems
            .iter()
            .enumerate()
            .map(|(i, exp)| {
                let index = self.integer(i as u64, index_type);
                self.node(Kind::ArrayInitializer { index, exp: *exp }, None)
            })
            .collect();
        self.node(Kind::Array { initializers, nelem: elems.len() }, Some(ty))
    }

    pub fn array_ref(&mut self, array: NodeId, index: NodeId, ty: NodeId) -> NodeId {
        self.node(Kind::ArrayRef { array, index }, Some(ty))
    }

    pub fn record(&mut self, elems: &[(Option<&str>, NodeId)], ty: NodeId) -> NodeId {
        let elems = elems
            .iter()
            .map(|(name, exp)| {
                let name = name.map(|n| self.identifier(n));
                self.node(Kind::StructElem { name, exp: *exp }, None)
            })
            .collect();
        self.node(Kind::Struct { elems }, Some(ty))
    }

    pub fn struct_ref(&mut self, sct: NodeId, field: &str, ty: NodeId) -> NodeId {
        let field = self.identifier(field);
        self.node(Kind::StructRef { sct, field }, Some(ty))
    }

    pub fn funcall(&mut self, function: NodeId, args: &[NodeId], ty: NodeId) -> NodeId {
        let args = args.iter().map(|exp| self.node(Kind::FuncallArg { exp: *exp }, None)).collect();
        self.node(Kind::Funcall { function, args }, Some(ty))
    }

    pub fn func_arg(&mut self, name: &str, ty: NodeId) -> NodeId {
        self.node(Kind::FuncArg { name: name.to_string(), ty }, None)
    }

    pub fn func(&mut self, name: Option<&str>, rtype: NodeId, args: &[NodeId], body: NodeId, ty: NodeId) -> NodeId {
        let kind = Kind::Func { name: name.map(str::to_string), rtype, args: args.to_vec(), body };
        self.node(kind, Some(ty))
    }

    pub fn decl(&mut self, kind: DeclKind, name: &str, initial: NodeId) -> NodeId {
        self.node(Kind::Decl { kind, name: name.to_string(), initial }, None)
    }

    pub fn comp(&mut self, stmts: &[NodeId]) -> NodeId {
        self.node(Kind::CompStmt { stmts: stmts.to_vec() }, None)
    }

    pub fn null_stmt(&mut self) -> NodeId {
        self.node(Kind::NullStmt, None)
    }

    pub fn assign(&mut self, lvalue: NodeId, exp: NodeId) -> NodeId {
        self.node(Kind::AssStmt { lvalue, exp }, None)
    }

    pub fn exp_stmt(&mut self, exp: NodeId) -> NodeId {
        self.node(Kind::ExpStmt { exp }, None)
    }

    pub fn if_stmt(&mut self, cond: NodeId, then: NodeId, otherwise: Option<NodeId>) -> NodeId {
        self.node(Kind::IfStmt { cond, then, otherwise }, None)
    }

    pub fn while_stmt(&mut self, cond: NodeId, body: NodeId) -> NodeId {
        self.node(Kind::LoopStmt { cond: Some(cond), container: None, body }, None)
    }

    /// `for (x in container where cond) body`; `x` lives at (0, 0) in the body.
    pub fn for_in(&mut self, container: NodeId, cond: Option<NodeId>, body: NodeId) -> NodeId {
        self.node(Kind::LoopStmt { cond, container: Some(container), body }, None)
    }

    pub fn return_stmt(&mut self, exp: Option<NodeId>, frames: usize) -> NodeId {
        self.node(Kind::ReturnStmt { exp, frames }, None)
    }

    pub fn raise(&mut self, exp: Option<NodeId>) -> NodeId {
        self.node(Kind::RaiseStmt { exp }, None)
    }

    pub fn try_catch(&mut self, code: NodeId, handler: NodeId, arg: Option<&str>, exp: Option<NodeId>) -> NodeId {
        let arg = arg.map(str::to_string);
        self.node(Kind::TryCatchStmt { code, handler, arg, exp }, None)
    }

    /// Makes a program of the given elements the root of the tree.
    pub fn program(&mut self, elems: &[NodeId]) -> NodeId {
        let root = self.node(Kind::Program { elems: elems.to_vec() }, None);
        self.set_root(root);
        root
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::construct::tree::{Code, TypeCode};

    #[test]
    fn shared_types() {
        let mut ast = Ast::new();
        let int = ast.integral(32, true);
        let a = ast.integer(1, int);
        let b = ast.integer(2, int);
        let sum = ast.binary(Op::Add, a, b, int);

        assert_eq!(ast[a].ty, ast[b].ty);
        assert_eq!(ast.type_of(sum), Some(&Type::Integral { size: 32, signed: true }));
        assert_eq!(ast[sum].op(), Some(Op::Add));
        assert_eq!(ast[int].type_code(), Some(TypeCode::Integral));
    }

    #[test]
    fn traversal_order() {
        let mut ast = Ast::new();
        let int = ast.integral(32, true);
        let value = ast.integer(1, int);
        let target = ast.var("x", 0, 0, int);
        let assign = ast.assign(target, value);

        assert_eq!(ast[assign].children(), vec![value, target]);
        assert_eq!(ast[assign].code(), Code::AssStmt);
        assert!(!ast[assign].needs_type());
        assert!(ast[target].needs_type());
    }

    #[test]
    fn rewrite_in_place() {
        let mut ast = Ast::new();
        let int = ast.integral(32, true);
        let a = ast.integer(1, int);
        let neg = ast.unary(Op::Neg, a, int);
        let stmt = ast.exp_stmt(neg);

        ast.replace(neg, Kind::Integer { value: u64::MAX }, Some(int));
        assert_eq!(ast[stmt].children(), vec![neg]);
        assert_eq!(ast[neg].code(), Code::Integer);
    }
}
