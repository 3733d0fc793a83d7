use std::{
    collections::TryReserveError,
    fmt,
    ops::Index,
};

use crate::common::span::Span;

/// A handle to a node in an `Ast`.
/// Handles are only ever made by the arena they index,
/// and stay valid for the arena's whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where a variable lives at run time:
/// `back` frames out from the innermost one, slot `over` in that frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Lexical {
    pub back: usize,
    pub over: usize,
}

impl Lexical {
    pub fn new(back: usize, over: usize) -> Lexical {
        Lexical { back, over }
    }
}

/// The node-kind tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    Program,
    Decl,
    Var,
    CompStmt,
    NullStmt,
    AssStmt,
    IfStmt,
    LoopStmt,
    ReturnStmt,
    ExpStmt,
    RaiseStmt,
    TryCatchStmt,
    Funcall,
    FuncallArg,
    Func,
    FuncArg,
    Integer,
    String,
    Identifier,
    Offset,
    Cast,
    Map,
    Scons,
    Array,
    ArrayInitializer,
    ArrayRef,
    Struct,
    StructElem,
    StructRef,
    Exp,
    Type,
    StructElemType,
    FuncTypeArg,
}

/// The operator sub-tag of `Exp` nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Or,
    And,
    Not,
    Ior,
    Xor,
    Band,
    Bnot,
    Neg,
    Pos,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    Sl,
    Sr,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Bconc,
    Attr,
}

/// Attributes queried with `Op::Attr`, as in `x'size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Attr {
    Size,
    Magnitude,
    Unit,
    Signed,
    Length,
    Alignment,
}

/// The type-kind sub-tag of `Type` nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeCode {
    Integral,
    String,
    Void,
    Offset,
    Array,
    Struct,
    Function,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Type {
    Integral { size: u8, signed: bool },
    String,
    Void,
    /// `base` is an integral type, `unit` an integer literal counting bits.
    Offset { base: NodeId, unit: NodeId },
    /// `bound` is either an element count or, if offset typed, a size.
    Array { etype: NodeId, bound: Option<NodeId> },
    /// `elems` are `StructElemType` nodes, in declaration order.
    Struct { name: Option<String>, elems: Vec<NodeId> },
    /// `args` are `FuncTypeArg` nodes.
    Function { rtype: NodeId, args: Vec<NodeId> },
}

impl Type {
    pub fn code(&self) -> TypeCode {
        match self {
            Type::Integral { .. } => TypeCode::Integral,
            Type::String => TypeCode::String,
            Type::Void => TypeCode::Void,
            Type::Offset { .. } => TypeCode::Offset,
            Type::Array { .. } => TypeCode::Array,
            Type::Struct { .. } => TypeCode::Struct,
            Type::Function { .. } => TypeCode::Function,
        }
    }

    /// Arrays and structs: the types whose values can be mapped.
    pub fn is_structured(&self) -> bool {
        matches!(self, Type::Array { .. } | Type::Struct { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclKind {
    Var,
    Func,
    Type,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Kind {
    Program { elems: Vec<NodeId> },
    Decl { kind: DeclKind, name: String, initial: NodeId },
    Var { name: String, lexical: Lexical },
    CompStmt { stmts: Vec<NodeId> },
    NullStmt,
    /// Visits `exp` before `lvalue`.
    AssStmt { lvalue: NodeId, exp: NodeId },
    IfStmt { cond: NodeId, then: NodeId, otherwise: Option<NodeId> },
    /// A `while` loop when `container` is `None`, a for-in loop otherwise,
    /// in which case `cond` is its `where` clause.
    LoopStmt { cond: Option<NodeId>, container: Option<NodeId>, body: NodeId },
    /// `frames` counts the frames between the statement and its function.
    ReturnStmt { exp: Option<NodeId>, frames: usize },
    ExpStmt { exp: NodeId },
    RaiseStmt { exp: Option<NodeId> },
    TryCatchStmt { code: NodeId, handler: NodeId, arg: Option<String>, exp: Option<NodeId> },
    /// Visits the arguments before the function.
    Funcall { function: NodeId, args: Vec<NodeId> },
    FuncallArg { exp: NodeId },
    Func { name: Option<String>, rtype: NodeId, args: Vec<NodeId>, body: NodeId },
    FuncArg { name: String, ty: NodeId },
    Integer { value: u64 },
    String { value: String },
    Identifier { name: String },
    /// `unit` is an integer literal counting bits.
    Offset { magnitude: NodeId, unit: NodeId },
    Cast { to: NodeId, exp: NodeId },
    /// `mapper` addresses the mapper of a declared struct type, if `ty` is one.
    Map { ty: NodeId, offset: NodeId, mapper: Option<Lexical> },
    Scons { value: NodeId, constructor: Lexical },
    Array { initializers: Vec<NodeId>, nelem: usize },
    ArrayInitializer { index: NodeId, exp: NodeId },
    ArrayRef { array: NodeId, index: NodeId },
    Struct { elems: Vec<NodeId> },
    StructElem { name: Option<NodeId>, exp: NodeId },
    StructRef { sct: NodeId, field: NodeId },
    Exp { op: Op, attr: Option<Attr>, operands: Vec<NodeId> },
    Type(Type),
    StructElemType { name: Option<String>, ty: NodeId },
    FuncTypeArg { ty: NodeId },
}

#[derive(Debug, Clone)]
pub struct Node {
    pub kind: Kind,
    pub span: Span,
    /// The resolved type, shared with every other node of that type.
    pub ty: Option<NodeId>,
}

impl Node {
    pub fn code(&self) -> Code {
        match &self.kind {
            Kind::Program { .. } => Code::Program,
            Kind::Decl { .. } => Code::Decl,
            Kind::Var { .. } => Code::Var,
            Kind::CompStmt { .. } => Code::CompStmt,
            Kind::NullStmt => Code::NullStmt,
            Kind::AssStmt { .. } => Code::AssStmt,
            Kind::IfStmt { .. } => Code::IfStmt,
            Kind::LoopStmt { .. } => Code::LoopStmt,
            Kind::ReturnStmt { .. } => Code::ReturnStmt,
            Kind::ExpStmt { .. } => Code::ExpStmt,
            Kind::RaiseStmt { .. } => Code::RaiseStmt,
            Kind::TryCatchStmt { .. } => Code::TryCatchStmt,
            Kind::Funcall { .. } => Code::Funcall,
            Kind::FuncallArg { .. } => Code::FuncallArg,
            Kind::Func { .. } => Code::Func,
            Kind::FuncArg { .. } => Code::FuncArg,
            Kind::Integer { .. } => Code::Integer,
            Kind::String { .. } => Code::String,
            Kind::Identifier { .. } => Code::Identifier,
            Kind::Offset { .. } => Code::Offset,
            Kind::Cast { .. } => Code::Cast,
            Kind::Map { .. } => Code::Map,
            Kind::Scons { .. } => Code::Scons,
            Kind::Array { .. } => Code::Array,
            Kind::ArrayInitializer { .. } => Code::ArrayInitializer,
            Kind::ArrayRef { .. } => Code::ArrayRef,
            Kind::Struct { .. } => Code::Struct,
            Kind::StructElem { .. } => Code::StructElem,
            Kind::StructRef { .. } => Code::StructRef,
            Kind::Exp { .. } => Code::Exp,
            Kind::Type(_) => Code::Type,
            Kind::StructElemType { .. } => Code::StructElemType,
            Kind::FuncTypeArg { .. } => Code::FuncTypeArg,
        }
    }

    pub fn op(&self) -> Option<Op> {
        match &self.kind {
            Kind::Exp { op, .. } => Some(*op),
            _ => None,
        }
    }

    pub fn type_code(&self) -> Option<TypeCode> {
        match &self.kind {
            Kind::Type(ty) => Some(ty.code()),
            _ => None,
        }
    }

    /// Children in traversal order.
    pub fn children(&self) -> Vec<NodeId> {
        fn opt(node: &Option<NodeId>) -> Vec<NodeId> {
            node.iter().copied().collect()
        }

        match &self.kind {
            Kind::Program { elems } => elems.clone(),
            Kind::Decl { initial, .. } => vec![*initial],
            Kind::CompStmt { stmts } => stmts.clone(),
            Kind::AssStmt { lvalue, exp } => vec![*exp, *lvalue],
            Kind::IfStmt { cond, then, otherwise } => {
                [vec![*cond, *then], opt(otherwise)].concat()
            },
            Kind::LoopStmt { cond, container, body } => {
                [opt(container), opt(cond), vec![*body]].concat()
            },
            Kind::ReturnStmt { exp, .. } | Kind::RaiseStmt { exp } => opt(exp),
            Kind::ExpStmt { exp } | Kind::FuncallArg { exp } => vec![*exp],
            Kind::TryCatchStmt { code, handler, exp, .. } => {
                [vec![*code, *handler], opt(exp)].concat()
            },
            Kind::Funcall { function, args } => [args.clone(), vec![*function]].concat(),
            Kind::Func { rtype, args, body, .. } => {
                [vec![*rtype], args.clone(), vec![*body]].concat()
            },
            Kind::FuncArg { ty, .. } | Kind::StructElemType { ty, .. } | Kind::FuncTypeArg { ty } => {
                vec![*ty]
            },
            Kind::Offset { magnitude, unit } => vec![*magnitude, *unit],
            Kind::Cast { to, exp } => vec![*exp, *to],
            Kind::Map { ty, offset, .. } => vec![*offset, *ty],
            Kind::Scons { value, .. } => vec![*value],
            Kind::Array { initializers, .. } => initializers.clone(),
            Kind::ArrayInitializer { index, exp } => vec![*index, *exp],
            Kind::ArrayRef { array, index } => vec![*array, *index],
            Kind::Struct { elems } => elems.clone(),
            Kind::StructElem { name, exp } => [opt(name), vec![*exp]].concat(),
            Kind::StructRef { sct, field } => vec![*sct, *field],
            Kind::Exp { operands, .. } => operands.clone(),
            Kind::Type(ty) => match ty {
                Type::Offset { base, unit } => vec![*base, *unit],
                Type::Array { etype, bound } => [vec![*etype], opt(bound)].concat(),
                Type::Struct { elems, .. } => elems.clone(),
                Type::Function { rtype, args } => [vec![*rtype], args.clone()].concat(),
                Type::Integral { .. } | Type::String | Type::Void => vec![],
            },
            Kind::Var { .. }
            | Kind::NullStmt
            | Kind::Integer { .. }
            | Kind::String { .. }
            | Kind::Identifier { .. } => vec![],
        }
    }

    /// Whether the node must carry a resolved type once analysis is done.
    /// Types, declarations, statements and syntactic markers are exempt.
    pub fn needs_type(&self) -> bool {
        matches!(
            self.code(),
            Code::Var
                | Code::Funcall
                | Code::Func
                | Code::Integer
                | Code::String
                | Code::Offset
                | Code::Cast
                | Code::Map
                | Code::Scons
                | Code::Array
                | Code::ArrayRef
                | Code::Struct
                | Code::StructRef
                | Code::Exp
        )
    }
}

/// The arena every node of one program lives in.
/// Nodes may be rewritten in place by analysis passes;
/// code generation only reads them.
#[derive(Debug, Clone, Default)]
pub struct Ast {
    nodes: Vec<Node>,
    root: Option<NodeId>,
}

impl Ast {
    pub fn new() -> Ast {
        Ast::default()
    }

    pub fn push(&mut self, kind: Kind, span: Span, ty: Option<NodeId>) -> NodeId {
        self.nodes.push(Node { kind, span, ty });
        NodeId(self.nodes.len() - 1)
    }

    /// Like `push`, but reports allocation failure instead of aborting.
    pub fn try_push(&mut self, kind: Kind, span: Span, ty: Option<NodeId>) -> Result<NodeId, TryReserveError> {
        self.nodes.try_reserve(1)?;
        Ok(self.push(kind, span, ty))
    }

    /// Rewrites a node in place, keeping its span.
    /// Every parent keeps pointing at the new contents.
    pub fn replace(&mut self, id: NodeId, kind: Kind, ty: Option<NodeId>) {
        let node = &mut self.nodes[id.0];
        node.kind = kind;
        node.ty = ty;
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub fn set_root(&mut self, root: NodeId) {
        self.root = Some(root);
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0)
    }

    /// The node as a type, if it is one.
    pub fn as_type(&self, id: NodeId) -> Option<&Type> {
        match &self.get(id)?.kind {
            Kind::Type(ty) => Some(ty),
            _ => None,
        }
    }

    /// The resolved type of a node.
    pub fn type_of(&self, id: NodeId) -> Option<&Type> {
        self.as_type(self.get(id)?.ty?)
    }
}

impl Index<NodeId> for Ast {
    type Output = Node;

    fn index(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }
}
