//! The code generator: a phase that lowers a typed `Ast` into bytecode.
//!
//! Every handler keeps the operand stack balanced: statements leave it
//! as they found it, expressions push exactly one value.
//! Code for a node is the concatenation of the code for its parts,
//! so one unbalanced handler corrupts everything around it.
//!
//! Type nodes emit nothing in ordinary code.
//! What they emit elsewhere depends on the `Context` the generator is in:
//!
//! | context          | stack effect        | emits                            |
//! |------------------|---------------------|----------------------------------|
//! | `Mapper`         | `OFF -- VALUE`      | decodes a value of the type      |
//! | `Writer`         | `OFF VALUE --`      | encodes a value of the type      |
//! | `ValueRemapper`  | `-- CLOSURE`        | the type's value re-mapper       |
//! | `StructDecl`     | `--`                | registers mapper and constructor |
//!
//! Mapped values carry their mapper and writer with them,
//! so the closures synthesized here outlive the compilation.

use std::{mem, rc::Rc};

use log::debug;

use crate::{
    common::{
        data::{Data, Int},
        lambda::Lambda,
        opcode::Opcode,
    },
    compiler::{
        asm::Assembler,
        pass::{Abort, Flow, Phase, Visit},
        syntax::{CompileError, Syntax},
    },
    construct::tree::{Attr, Code, DeclKind, Kind, Lexical, NodeId, Op, Type, TypeCode},
    vm::trace::Exception,
};

/// What type nodes are being lowered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Context {
    Normal,
    Mapper,
    Writer,
    ValueRemapper,
    StructDecl,
}

/// What a compiled top-level program leaves behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    /// A list of declarations and statements. Results in null.
    Program,
    /// A single expression, whose value is the result.
    Expression,
}

/// State threaded through one code generation pass.
pub struct Gen {
    top: Assembler,
    /// Closures being built, innermost last.
    nested: Vec<Assembler>,
    context: Context,
    flavor: Flavor,
}

impl Gen {
    pub fn new(flavor: Flavor) -> Gen {
        let mut top = Assembler::new(true);
        top.note("toplevel");
        Gen { top, nested: vec![], context: Context::Normal, flavor }
    }

    pub fn context(&self) -> Context {
        self.context
    }

    /// The assembler of the closure currently being built.
    fn asm(&mut self) -> &mut Assembler {
        match self.nested.last_mut() {
            Some(asm) => asm,
            None => &mut self.top,
        }
    }

    fn open(&mut self, note: &str) {
        let mut asm = Assembler::new(false);
        asm.note(note);
        self.nested.push(asm);
    }

    fn close(&mut self) -> Result<Rc<Lambda>, CompileError> {
        let asm = self.nested.pop().ok_or_else(|| Syntax::error_no_note("closed a closure never opened"))?;
        let lambda = asm.finish()?;
        debug!("generated {} ({} bytes)", lambda.name(), lambda.code.len());
        Ok(lambda)
    }

    /// Seals the top-level program.
    pub fn finish(self) -> Result<Rc<Lambda>, CompileError> {
        if !self.nested.is_empty() {
            let reason = format!("{} closures left unfinished", self.nested.len());
            return Err(Syntax::error_no_note(&reason).into());
        }
        self.top.finish()
    }
}

/// The code generation phase.
pub fn phase() -> Phase<Gen> {
    Phase::new("gen")
        .pre(Code::Decl, decl)
        .pre(Code::CompStmt, open_frame)
        .post(Code::CompStmt, close_frame)
        .pre(Code::AssStmt, assign)
        .pre(Code::IfStmt, if_stmt)
        .pre(Code::LoopStmt, loop_stmt)
        .pre(Code::ReturnStmt, return_stmt)
        .pre(Code::TryCatchStmt, try_catch)
        .pre(Code::Func, func)
        .pre(Code::Map, map)
        .pre(Code::StructElem, struct_elem)
        .pre(Code::StructRef, struct_ref)
        .pre(Code::Type, other_type)
        .pre_type(TypeCode::Integral, integral_type)
        .pre_type(TypeCode::String, string_type)
        .pre_type(TypeCode::Offset, offset_type)
        .pre_type(TypeCode::Array, array_type)
        .pre_type(TypeCode::Struct, struct_type)
        .post(Code::Program, program)
        .post(Code::ExpStmt, exp_stmt)
        .post(Code::NullStmt, skip)
        .post(Code::FuncallArg, skip)
        .post(Code::ArrayInitializer, skip)
        .post(Code::RaiseStmt, raise_stmt)
        .post(Code::Funcall, funcall)
        .post(Code::Integer, integer)
        .post(Code::String, string)
        .post(Code::Offset, offset)
        .post(Code::Var, var)
        .post(Code::Cast, cast)
        .post(Code::Scons, scons)
        .post(Code::Array, array)
        .post(Code::ArrayRef, array_ref)
        .post(Code::Struct, record)
        .post_op(Op::Add, binary)
        .post_op(Op::Sub, binary)
        .post_op(Op::Mul, binary)
        .post_op(Op::Div, binary)
        .post_op(Op::Mod, binary)
        .post_op(Op::Ior, binary)
        .post_op(Op::Xor, binary)
        .post_op(Op::Band, binary)
        .post_op(Op::Sl, binary)
        .post_op(Op::Sr, binary)
        .post_op(Op::Neg, unary)
        .post_op(Op::Bnot, unary)
        .post_op(Op::Pos, unary)
        .post_op(Op::And, logical)
        .post_op(Op::Or, logical)
        .post_op(Op::Not, logical)
        .post_op(Op::Eq, relational)
        .post_op(Op::Ne, relational)
        .post_op(Op::Lt, relational)
        .post_op(Op::Gt, relational)
        .post_op(Op::Le, relational)
        .post_op(Op::Ge, relational)
        .post_op(Op::Bconc, bconc)
        .post_op(Op::Attr, attr)
        .otherwise(unhandled)
}

// helpers

fn asm_of<'a>(v: &'a mut Visit<'_, Gen>) -> &'a mut Assembler {
    v.payload.asm()
}

/// Generates code for a subtree in another context.
fn with_context(v: &mut Visit<'_, Gen>, context: Context, node: NodeId) -> Result<(), Abort> {
    let saved = mem::replace(&mut v.payload.context, context);
    v.subpass(node)?;
    v.payload.context = saved;
    Ok(())
}

fn type_node(v: &Visit<'_, Gen>, node: NodeId) -> Result<NodeId, Abort> {
    v.ast[node].ty.ok_or_else(|| v.ice_at(node, &format!("node {} has no resolved type", node)))
}

fn integral_of(v: &Visit<'_, Gen>, ty: NodeId) -> Result<(u8, bool), Abort> {
    match v.as_type(ty)? {
        Type::Integral { size, signed } => Ok((*size, *signed)),
        other => Err(v.ice_at(ty, &format!("expected an integral type, found {:?}", other.code()))),
    }
}

fn is_structured(v: &Visit<'_, Gen>, node: NodeId) -> Result<bool, Abort> {
    Ok(v.type_of(node)?.is_structured())
}

fn identifier(v: &Visit<'_, Gen>, node: NodeId) -> Result<String, Abort> {
    match &v.ast[node].kind {
        Kind::Identifier { name } => Ok(name.clone()),
        _ => Err(v.ice_at(node, "expected an identifier")),
    }
}

fn push_var(asm: &mut Assembler, lexical: Lexical) {
    asm.emit(Opcode::PushVar, &[lexical.back, lexical.over]);
}

/// `OFFSET -- BITS`, a `uint<64>`.
fn bits(asm: &mut Assembler) {
    asm.push_int(Int::ulong(1));
    asm.emit_int(Opcode::Ogetmc, 64, false);
}

/// `CURSOR SIZE -- CURSOR'`, the cursor moved past `SIZE` and counted in bits.
fn advance(asm: &mut Assembler) {
    asm.emit(Opcode::Ogetm, &[]);
    asm.emit(Opcode::Swap, &[]);
    bits(asm);
    asm.emit_int(Opcode::Add, 64, false);
    asm.push_int(Int::ulong(1));
    asm.emit(Opcode::Mko, &[]);
}

/// Opens the frame of a closure taking `args` arguments,
/// binding them to slots `0..args` in the order they were passed.
fn prologue(asm: &mut Assembler, args: usize) {
    asm.emit(Opcode::Prolog, &[]);
    asm.emit(Opcode::PushF, &[]);
    if args > 1 {
        asm.emit(Opcode::Revn, &[args]);
    }
    for _ in 0..args {
        asm.emit(Opcode::RegVar, &[]);
    }
}

fn epilogue(asm: &mut Assembler) {
    asm.emit(Opcode::PopF, &[1]);
    asm.emit(Opcode::Return, &[]);
}

/// Closes the finished program over the current environment.
fn install(asm: &mut Assembler, lambda: Rc<Lambda>) {
    asm.push(Data::Lambda(lambda));
    asm.emit(Opcode::Pec, &[]);
}

fn raise_exception(asm: &mut Assembler, exception: Exception) {
    asm.push_int(Int::int(exception.code()));
    asm.emit(Opcode::Raise, &[]);
}

// declarations and statements

fn skip(_: &mut Visit<'_, Gen>) -> Result<Flow, Abort> {
    Ok(Flow::Continue)
}

fn unhandled(v: &mut Visit<'_, Gen>) -> Result<Flow, Abort> {
    let code = v.node().code();
    Err(v.ice(&format!("no code generation handler for {:?} node in {:?} context", code, v.payload.context)))
}

fn program(v: &mut Visit<'_, Gen>) -> Result<Flow, Abort> {
    if v.payload.flavor == Flavor::Program {
        asm_of(v).push(Data::Null);
    }
    Ok(Flow::Continue)
}

fn decl(v: &mut Visit<'_, Gen>) -> Result<Flow, Abort> {
    let (kind, initial) = match &v.node().kind {
        Kind::Decl { kind, initial, .. } => (*kind, *initial),
        _ => return Err(v.ice("expected a declaration")),
    };

    match kind {
        DeclKind::Var | DeclKind::Func => {
            v.subpass(initial)?;
            asm_of(v).emit(Opcode::RegVar, &[]);
        },
        // only struct types need anything at run time
        DeclKind::Type => {
            if matches!(v.as_type(initial)?, Type::Struct { .. }) {
                with_context(v, Context::StructDecl, initial)?;
            }
        },
    }

    Ok(Flow::Break)
}

fn open_frame(v: &mut Visit<'_, Gen>) -> Result<Flow, Abort> {
    asm_of(v).emit(Opcode::PushF, &[]);
    Ok(Flow::Continue)
}

fn close_frame(v: &mut Visit<'_, Gen>) -> Result<Flow, Abort> {
    asm_of(v).emit(Opcode::PopF, &[1]);
    Ok(Flow::Continue)
}

fn exp_stmt(v: &mut Visit<'_, Gen>) -> Result<Flow, Abort> {
    asm_of(v).emit(Opcode::Drop, &[]);
    Ok(Flow::Continue)
}

/// Assignments to array elements and struct fields go through the
/// old value's mapping, if it has one, and then through the container's
/// writer, so the backing store sees the change right away:
///
/// ```plain
/// NVAL CONT KEY   ROT TOR (S)REF FROMR SWAP MGETM BN done
/// CONT KEY NVAL OLD MAPPER
///                 DROP MGETO NROT SWAP ROT  valmapper CALL  PUSH null PUSH null
/// done:           DROP DROP (S)SET WRITE DROP
/// ```
fn assign(v: &mut Visit<'_, Gen>) -> Result<Flow, Abort> {
    let (lvalue, exp) = match &v.node().kind {
        Kind::AssStmt { lvalue, exp } => (*lvalue, *exp),
        _ => return Err(v.ice("expected an assignment")),
    };

    v.subpass(exp)?;

    let (get, set) = match v.ast[lvalue].kind.clone() {
        Kind::Var { lexical, .. } => {
            asm_of(v).emit(Opcode::PopVar, &[lexical.back, lexical.over]);
            return Ok(Flow::Break);
        },
        Kind::ArrayRef { array, index } => {
            v.subpass(array)?;
            v.subpass(index)?;
            (Opcode::Aref, Opcode::Aset)
        },
        Kind::StructRef { sct, field } => {
            v.subpass(sct)?;
            let name = identifier(v, field)?;
            asm_of(v).push(Data::string(&name));
            (Opcode::Sref, Opcode::Sset)
        },
        _ => return Err(v.ice_at(lvalue, "unsupported assignment target")),
    };

    let done = {
        let asm = asm_of(v);
        let done = asm.fresh_label();
        asm.emit(Opcode::Rot, &[]);
        asm.emit(Opcode::Tor, &[]);
        asm.emit(get, &[]);
        asm.emit(Opcode::Fromr, &[]);
        asm.emit(Opcode::Swap, &[]);
        asm.emit(Opcode::Mgetm, &[]);
        asm.jump(Opcode::Bn, done);
        asm.emit(Opcode::Drop, &[]);
        asm.emit(Opcode::Mgeto, &[]);
        asm.emit(Opcode::Nrot, &[]);
        asm.emit(Opcode::Swap, &[]);
        asm.emit(Opcode::Rot, &[]);
        done
    };

    let ty = type_node(v, lvalue)?;
    with_context(v, Context::ValueRemapper, ty)?;

    let asm = asm_of(v);
    asm.emit(Opcode::Call, &[]);
    asm.push(Data::Null);
    asm.push(Data::Null);
    asm.label(done);
    asm.emit(Opcode::Drop, &[]);
    asm.emit(Opcode::Drop, &[]);
    asm.emit(set, &[]);
    asm.emit(Opcode::Write, &[]);
    asm.emit(Opcode::Drop, &[]);

    Ok(Flow::Break)
}

fn if_stmt(v: &mut Visit<'_, Gen>) -> Result<Flow, Abort> {
    let (cond, then, otherwise) = match &v.node().kind {
        Kind::IfStmt { cond, then, otherwise } => (*cond, *then, *otherwise),
        _ => return Err(v.ice("expected an if statement")),
    };

    asm_of(v).if_();
    v.subpass(cond)?;
    asm_of(v).then();
    v.subpass(then)?;
    if let Some(otherwise) = otherwise {
        asm_of(v).else_();
        v.subpass(otherwise)?;
    }
    asm_of(v).end_if();

    Ok(Flow::Break)
}

fn loop_stmt(v: &mut Visit<'_, Gen>) -> Result<Flow, Abort> {
    let (cond, container, body) = match &v.node().kind {
        Kind::LoopStmt { cond, container, body } => (*cond, *container, *body),
        _ => return Err(v.ice("expected a loop")),
    };

    match container {
        None => {
            asm_of(v).while_();
            match cond {
                Some(cond) => v.subpass(cond)?,
                None => asm_of(v).push_int(Int::int(1)),
            }
            asm_of(v).loop_();
            v.subpass(body)?;
            asm_of(v).end_loop();
        },
        Some(container) => {
            v.subpass(container)?;
            asm_of(v).for_(cond.is_some());
            asm_of(v).for_where();
            if let Some(cond) = cond {
                v.subpass(cond)?;
            }
            asm_of(v).for_loop();
            v.subpass(body)?;
            asm_of(v).for_end();
        },
    }

    Ok(Flow::Break)
}

fn return_stmt(v: &mut Visit<'_, Gen>) -> Result<Flow, Abort> {
    let (exp, frames) = match &v.node().kind {
        Kind::ReturnStmt { exp, frames } => (*exp, *frames),
        _ => return Err(v.ice("expected a return statement")),
    };

    match exp {
        Some(exp) => v.subpass(exp)?,
        None => asm_of(v).push(Data::Null),
    }

    let asm = asm_of(v);
    // for-in loops keep their container and index under the result
    for _ in 0..asm.loop_values() {
        asm.emit(Opcode::Nip, &[]);
    }
    asm.emit(Opcode::PopF, &[frames + 1]);
    asm.emit(Opcode::Return, &[]);

    Ok(Flow::Break)
}

fn raise_stmt(v: &mut Visit<'_, Gen>) -> Result<Flow, Abort> {
    let generic = matches!(v.node().kind, Kind::RaiseStmt { exp: None });
    let asm = asm_of(v);
    if generic {
        asm.push_int(Int::int(Exception::Generic.code()));
    }
    asm.emit(Opcode::Raise, &[]);
    Ok(Flow::Continue)
}

fn try_catch(v: &mut Visit<'_, Gen>) -> Result<Flow, Abort> {
    let (code, handler, arg, exp) = match &v.node().kind {
        Kind::TryCatchStmt { code, handler, arg, exp } => (*code, *handler, arg.is_some(), *exp),
        _ => return Err(v.ice("expected a try statement")),
    };

    match exp {
        Some(exp) => v.subpass(exp)?,
        None => asm_of(v).push_int(Int::int(Exception::Generic.code())),
    }
    asm_of(v).try_(arg);
    v.subpass(code)?;
    asm_of(v).catch();
    v.subpass(handler)?;
    asm_of(v).end_try();

    Ok(Flow::Break)
}

// functions

fn func(v: &mut Visit<'_, Gen>) -> Result<Flow, Abort> {
    let (name, rtype, args, body) = match &v.node().kind {
        Kind::Func { name, rtype, args, body } => (name.clone(), *rtype, args.len(), *body),
        _ => return Err(v.ice("expected a function")),
    };
    let void = matches!(v.as_type(rtype)?, Type::Void);

    v.payload.open(name.as_deref().unwrap_or("<lambda>"));
    prologue(asm_of(v), args);
    v.subpass(body)?;

    let asm = asm_of(v);
    if void {
        asm.push(Data::Null);
    } else {
        // falling off the end of a function that returns something
        raise_exception(asm, Exception::NoReturn);
    }
    epilogue(asm);

    let lambda = v.payload.close()?;
    install(asm_of(v), lambda);
    Ok(Flow::Break)
}

fn funcall(v: &mut Visit<'_, Gen>) -> Result<Flow, Abort> {
    asm_of(v).emit(Opcode::Call, &[]);
    Ok(Flow::Continue)
}

// expressions

fn integer(v: &mut Visit<'_, Gen>) -> Result<Flow, Abort> {
    let value = match v.node().kind {
        Kind::Integer { value } => value,
        _ => return Err(v.ice("expected an integer")),
    };
    let (size, signed) = integral_of(v, type_node(v, v.node)?)?;
    asm_of(v).push_int(Int::from_bits(value, size, signed));
    Ok(Flow::Continue)
}

fn string(v: &mut Visit<'_, Gen>) -> Result<Flow, Abort> {
    let value = match &v.node().kind {
        Kind::String { value } => Data::string(value),
        _ => return Err(v.ice("expected a string")),
    };
    asm_of(v).push(value);
    Ok(Flow::Continue)
}

fn offset(v: &mut Visit<'_, Gen>) -> Result<Flow, Abort> {
    asm_of(v).emit(Opcode::Mko, &[]);
    Ok(Flow::Continue)
}

/// Structured variables are re-decoded on every read,
/// so they always show what the backing store holds.
fn var(v: &mut Visit<'_, Gen>) -> Result<Flow, Abort> {
    let lexical = match &v.node().kind {
        Kind::Var { lexical, .. } => *lexical,
        _ => return Err(v.ice("expected a variable")),
    };
    let remap = is_structured(v, v.node)?;

    let asm = asm_of(v);
    push_var(asm, lexical);
    if remap {
        asm.emit(Opcode::Remap, &[]);
    }
    Ok(Flow::Continue)
}

fn cast(v: &mut Visit<'_, Gen>) -> Result<Flow, Abort> {
    let (to, exp) = match &v.node().kind {
        Kind::Cast { to, exp } => (*to, *exp),
        _ => return Err(v.ice("expected a cast")),
    };
    let from = v.type_of(exp)?.clone();
    let into = v.as_type(to)?.clone();

    match (&from, &into) {
        (Type::Integral { .. }, Type::Integral { size, signed }) => {
            asm_of(v).emit_int(Opcode::Nton, *size, *signed);
        },
        (Type::Offset { .. }, Type::Offset { base, unit }) => {
            let (size, signed) = integral_of(v, *base)?;
            v.subpass(*unit)?;
            asm_of(v).emit_int(Opcode::Ogetmc, size, signed);
            v.subpass(*unit)?;
            asm_of(v).emit(Opcode::Mko, &[]);
        },
        (a, b) if a.is_structured() || b.is_structured() => {
            return Err(v.ice("casts between structured types are not supported"));
        },
        (a, b) if a == b => (),
        (a, b) => {
            return Err(v.ice(&format!("unsupported cast from {:?} to {:?}", a.code(), b.code())));
        },
    }

    Ok(Flow::Continue)
}

fn map(v: &mut Visit<'_, Gen>) -> Result<Flow, Abort> {
    let (ty, offset, mapper) = match &v.node().kind {
        Kind::Map { ty, offset, mapper } => (*ty, *offset, *mapper),
        _ => return Err(v.ice("expected a map")),
    };

    v.subpass(offset)?;
    match mapper {
        // declared struct types have their mapper in scope
        Some(mapper) => {
            let asm = asm_of(v);
            push_var(asm, mapper);
            asm.emit(Opcode::Call, &[]);
        },
        None => with_context(v, Context::Mapper, ty)?,
    }

    Ok(Flow::Break)
}

fn scons(v: &mut Visit<'_, Gen>) -> Result<Flow, Abort> {
    let constructor = match &v.node().kind {
        Kind::Scons { constructor, .. } => *constructor,
        _ => return Err(v.ice("expected a struct constructor")),
    };
    let asm = asm_of(v);
    push_var(asm, constructor);
    asm.emit(Opcode::Call, &[]);
    Ok(Flow::Continue)
}

fn array(v: &mut Visit<'_, Gen>) -> Result<Flow, Abort> {
    let (nelem, ninit) = match &v.node().kind {
        Kind::Array { initializers, nelem } => (*nelem, initializers.len()),
        _ => return Err(v.ice("expected an array")),
    };
    asm_of(v).emit(Opcode::Mka, &[nelem, ninit]);
    Ok(Flow::Continue)
}

fn array_ref(v: &mut Visit<'_, Gen>) -> Result<Flow, Abort> {
    let remap = is_structured(v, v.node)?;
    let asm = asm_of(v);
    asm.emit(Opcode::Aref, &[]);
    asm.emit(Opcode::Nip2, &[]);
    if remap {
        asm.emit(Opcode::Remap, &[]);
    }
    Ok(Flow::Continue)
}

fn record(v: &mut Visit<'_, Gen>) -> Result<Flow, Abort> {
    let fields = match &v.node().kind {
        Kind::Struct { elems } => elems.len(),
        _ => return Err(v.ice("expected a struct")),
    };
    asm_of(v).emit(Opcode::Mksct, &[fields]);
    Ok(Flow::Continue)
}

fn struct_elem(v: &mut Visit<'_, Gen>) -> Result<Flow, Abort> {
    let (name, exp) = match &v.node().kind {
        Kind::StructElem { name, exp } => (*name, *exp),
        _ => return Err(v.ice("expected a struct element")),
    };
    let name = match name {
        Some(name) => Data::string(&identifier(v, name)?),
        None => Data::Null,
    };
    asm_of(v).push(name);
    v.subpass(exp)?;
    Ok(Flow::Break)
}

fn struct_ref(v: &mut Visit<'_, Gen>) -> Result<Flow, Abort> {
    let (sct, field) = match &v.node().kind {
        Kind::StructRef { sct, field } => (*sct, *field),
        _ => return Err(v.ice("expected a field access")),
    };
    let name = identifier(v, field)?;
    let remap = is_structured(v, v.node)?;

    v.subpass(sct)?;
    let asm = asm_of(v);
    asm.push(Data::string(&name));
    asm.emit(Opcode::Sref, &[]);
    asm.emit(Opcode::Nip2, &[]);
    if remap {
        asm.emit(Opcode::Remap, &[]);
    }
    Ok(Flow::Break)
}

fn operands(v: &Visit<'_, Gen>) -> Result<(Op, Vec<NodeId>), Abort> {
    match &v.node().kind {
        Kind::Exp { op, operands, .. } => Ok((*op, operands.clone())),
        _ => Err(v.ice("expected an operator expression")),
    }
}

fn opcode(op: Op) -> Option<Opcode> {
    Some(match op {
        Op::Add => Opcode::Add,
        Op::Sub => Opcode::Sub,
        Op::Mul => Opcode::Mul,
        Op::Div => Opcode::Div,
        Op::Mod => Opcode::Mod,
        Op::Ior => Opcode::Bor,
        Op::Xor => Opcode::Bxor,
        Op::Band => Opcode::Band,
        Op::Sl => Opcode::Sl,
        Op::Sr => Opcode::Sr,
        Op::Neg => Opcode::Neg,
        Op::Bnot => Opcode::Bnot,
        Op::And => Opcode::And,
        Op::Or => Opcode::Or,
        Op::Not => Opcode::Not,
        Op::Eq => Opcode::Eq,
        Op::Ne => Opcode::Ne,
        Op::Lt => Opcode::Lt,
        Op::Gt => Opcode::Gt,
        Op::Le => Opcode::Le,
        Op::Ge => Opcode::Ge,
        Op::Pos | Op::Bconc | Op::Attr => return None,
    })
}

fn binary(v: &mut Visit<'_, Gen>) -> Result<Flow, Abort> {
    let (op, operands) = operands(v)?;
    let code = opcode(op).ok_or_else(|| v.ice("not a binary operator"))?;
    let result = v.type_of(v.node)?.clone();
    let lhs = v.type_of(operands[0])?.clone();
    let rhs = v.type_of(operands[1])?.clone();

    let offsets = matches!(lhs, Type::Offset { .. }) || matches!(rhs, Type::Offset { .. });
    match result {
        _ if offsets => offset_arithmetic(v, op, code, &lhs, &rhs, &result)?,
        Type::Integral { size, signed } => asm_of(v).emit_int(code, size, signed),
        Type::String if op == Op::Add => asm_of(v).emit(Opcode::Sconc, &[]),
        other => return Err(v.ice(&format!("no {:?} operator on {:?} values", op, other.code()))),
    }

    Ok(Flow::Continue)
}

/// Offsets are added and subtracted in the greatest common divisor
/// of their units, which the result keeps.
/// Scaling by an integer keeps the offset's unit,
/// and dividing two offsets compares them in bits.
fn offset_arithmetic(
    v: &mut Visit<'_, Gen>,
    op: Op,
    code: Opcode,
    lhs: &Type,
    rhs: &Type,
    result: &Type,
) -> Result<(), Abort> {
    match (op, lhs, rhs, result) {
        (
            Op::Add | Op::Sub,
            Type::Offset { unit: a, .. },
            Type::Offset { unit: b, .. },
            Type::Offset { base, .. },
        ) => {
            let (size, signed) = integral_of(v, *base)?;
            // A B -- A B GCD
            v.subpass(*a)?;
            v.subpass(*b)?;
            let asm = asm_of(v);
            asm.emit(Opcode::Gcd, &[]);
            asm.emit(Opcode::Tor, &[]);
            asm.emit(Opcode::Swap, &[]);
            asm.emit(Opcode::Fromr, &[]);
            asm.emit(Opcode::Dup, &[]);
            asm.emit(Opcode::Tor, &[]);
            asm.emit_int(Opcode::Ogetmc, size, signed);
            asm.emit(Opcode::Swap, &[]);
            asm.emit(Opcode::Fromr, &[]);
            asm.emit(Opcode::Dup, &[]);
            asm.emit(Opcode::Tor, &[]);
            asm.emit_int(Opcode::Ogetmc, size, signed);
            asm.emit_int(code, size, signed);
            asm.emit(Opcode::Fromr, &[]);
            asm.emit(Opcode::Mko, &[]);
        },
        (Op::Mul, Type::Offset { .. }, Type::Integral { .. }, Type::Offset { base, .. })
        | (Op::Div, Type::Offset { .. }, Type::Integral { .. }, Type::Offset { base, .. }) => {
            let (size, signed) = integral_of(v, *base)?;
            let asm = asm_of(v);
            asm.emit(Opcode::Swap, &[]);
            scale(asm, code, size, signed);
        },
        (Op::Mul, Type::Integral { .. }, Type::Offset { .. }, Type::Offset { base, .. }) => {
            let (size, signed) = integral_of(v, *base)?;
            scale(asm_of(v), code, size, signed);
        },
        (Op::Div, Type::Offset { .. }, Type::Offset { .. }, Type::Integral { size, signed }) => {
            let asm = asm_of(v);
            bits(asm);
            asm.emit(Opcode::Swap, &[]);
            bits(asm);
            asm.emit(Opcode::Swap, &[]);
            asm.emit_int(Opcode::Div, *size, *signed);
        },
        (Op::Mod, Type::Offset { unit, .. }, Type::Offset { .. }, Type::Offset { base, .. }) => {
            let (size, signed) = integral_of(v, *base)?;
            v.subpass(*unit)?;
            let asm = asm_of(v);
            asm.emit(Opcode::Dup, &[]);
            asm.emit(Opcode::Tor, &[]);
            asm.emit_int(Opcode::Ogetmc, size, signed);
            asm.emit(Opcode::Swap, &[]);
            asm.emit(Opcode::Fromr, &[]);
            asm.emit(Opcode::Dup, &[]);
            asm.emit(Opcode::Tor, &[]);
            asm.emit_int(Opcode::Ogetmc, size, signed);
            asm.emit(Opcode::Swap, &[]);
            asm.emit_int(Opcode::Mod, size, signed);
            asm.emit(Opcode::Fromr, &[]);
            asm.emit(Opcode::Mko, &[]);
        },
        _ => {
            let reason = format!("no {:?} operator on {:?} and {:?}", op, lhs.code(), rhs.code());
            return Err(v.ice(&reason));
        },
    }
    Ok(())
}

/// `INT OFFSET -- OFFSET'`, applying `code` to the magnitude and the integer.
fn scale(asm: &mut Assembler, code: Opcode, size: u8, signed: bool) {
    asm.emit(Opcode::Dup, &[]);
    asm.emit(Opcode::Ogetu, &[]);
    asm.emit(Opcode::Tor, &[]);
    asm.emit(Opcode::Ogetm, &[]);
    asm.emit_int(Opcode::Nton, size, signed);
    asm.emit(Opcode::Swap, &[]);
    asm.emit_int(Opcode::Nton, size, signed);
    asm.emit_int(code, size, signed);
    asm.emit(Opcode::Fromr, &[]);
    asm.emit(Opcode::Mko, &[]);
}

fn unary(v: &mut Visit<'_, Gen>) -> Result<Flow, Abort> {
    let (op, _) = operands(v)?;
    let result = v.type_of(v.node)?.clone();

    match (op, result) {
        (Op::Pos, _) => (),
        (op, Type::Integral { size, signed }) => {
            let code = opcode(op).ok_or_else(|| v.ice("not a unary operator"))?;
            asm_of(v).emit_int(code, size, signed);
        },
        (Op::Neg, Type::Offset { base, .. }) => {
            let (size, signed) = integral_of(v, base)?;
            let asm = asm_of(v);
            asm.emit(Opcode::Dup, &[]);
            asm.emit(Opcode::Ogetu, &[]);
            asm.emit(Opcode::Tor, &[]);
            asm.emit(Opcode::Ogetm, &[]);
            asm.emit_int(Opcode::Neg, size, signed);
            asm.emit(Opcode::Fromr, &[]);
            asm.emit(Opcode::Mko, &[]);
        },
        (op, other) => return Err(v.ice(&format!("no {:?} operator on {:?} values", op, other.code()))),
    }

    Ok(Flow::Continue)
}

fn logical(v: &mut Visit<'_, Gen>) -> Result<Flow, Abort> {
    let (op, _) = operands(v)?;
    let code = opcode(op).ok_or_else(|| v.ice("not a logical operator"))?;
    asm_of(v).emit(code, &[]);
    Ok(Flow::Continue)
}

/// Offsets compare by their size in bits, whatever their units.
fn relational(v: &mut Visit<'_, Gen>) -> Result<Flow, Abort> {
    logical(v)
}

fn bconc(v: &mut Visit<'_, Gen>) -> Result<Flow, Abort> {
    let (_, operands) = operands(v)?;
    let (size, signed) = integral_of(v, type_node(v, v.node)?)?;
    let (rsize, _) = integral_of(v, type_node(v, operands[1])?)?;
    asm_of(v).emit(Opcode::Bconc, &[size as usize, signed as usize, rsize as usize]);
    Ok(Flow::Continue)
}

fn attr(v: &mut Visit<'_, Gen>) -> Result<Flow, Abort> {
    let (attr, operand) = match &v.node().kind {
        Kind::Exp { attr, operands, .. } if operands.len() == 1 => (*attr, operands[0]),
        _ => return Err(v.ice("malformed attribute")),
    };

    match attr {
        Some(Attr::Size) => asm_of(v).emit(Opcode::Siz, &[]),
        Some(Attr::Magnitude) => asm_of(v).emit(Opcode::Ogetm, &[]),
        Some(Attr::Unit) => asm_of(v).emit(Opcode::Ogetu, &[]),
        Some(Attr::Length) => asm_of(v).emit(Opcode::Sel, &[]),
        Some(Attr::Signed) => {
            let signed = match v.type_of(operand)? {
                Type::Integral { signed, .. } => *signed,
                _ => false,
            };
            let asm = asm_of(v);
            asm.emit(Opcode::Drop, &[]);
            asm.push_int(Int::int(signed as i32));
        },
        Some(Attr::Alignment) | None => return Err(v.ice(&format!("unsupported attribute {:?}", attr))),
    }

    Ok(Flow::Continue)
}

// types

fn wrong_context(v: &Visit<'_, Gen>) -> Abort {
    let code = v.node().type_code();
    v.ice(&format!("{:?} type in {:?} context", code, v.payload.context))
}

fn other_type(v: &mut Visit<'_, Gen>) -> Result<Flow, Abort> {
    match v.payload.context {
        Context::Normal => Ok(Flow::Break),
        _ => Err(wrong_context(v)),
    }
}

fn integral_type(v: &mut Visit<'_, Gen>) -> Result<Flow, Abort> {
    let (size, signed) = integral_of(v, v.node)?;
    match v.payload.context {
        Context::Normal => (),
        Context::Mapper => asm_of(v).emit_int(Opcode::Peekd, size, signed),
        Context::Writer => asm_of(v).emit_int(Opcode::Poked, size, signed),
        Context::ValueRemapper => scalar_valmapper(v)?,
        Context::StructDecl => return Err(wrong_context(v)),
    }
    Ok(Flow::Break)
}

fn string_type(v: &mut Visit<'_, Gen>) -> Result<Flow, Abort> {
    match v.payload.context {
        Context::Normal => (),
        Context::Mapper => asm_of(v).emit(Opcode::Peeks, &[]),
        Context::Writer => asm_of(v).emit(Opcode::Pokes, &[]),
        Context::ValueRemapper => scalar_valmapper(v)?,
        Context::StructDecl => return Err(wrong_context(v)),
    }
    Ok(Flow::Break)
}

fn offset_type(v: &mut Visit<'_, Gen>) -> Result<Flow, Abort> {
    let (base, unit) = match v.as_type(v.node)? {
        Type::Offset { base, unit } => (*base, *unit),
        _ => return Err(v.ice("expected an offset type")),
    };
    let (size, signed) = integral_of(v, base)?;

    match v.payload.context {
        Context::Normal => (),
        Context::Mapper => {
            asm_of(v).emit_int(Opcode::Peekd, size, signed);
            with_context(v, Context::Normal, unit)?;
            asm_of(v).emit(Opcode::Mko, &[]);
        },
        Context::Writer => {
            let asm = asm_of(v);
            asm.emit(Opcode::Ogetm, &[]);
            asm.emit_int(Opcode::Poked, size, signed);
        },
        Context::ValueRemapper => scalar_valmapper(v)?,
        Context::StructDecl => return Err(wrong_context(v)),
    }
    Ok(Flow::Break)
}

fn array_type(v: &mut Visit<'_, Gen>) -> Result<Flow, Abort> {
    match v.payload.context {
        Context::Normal => (),
        Context::Mapper => array_mapper(v)?,
        Context::Writer => {
            let writer = array_writer(v)?;
            call_writer(asm_of(v), writer);
        },
        Context::ValueRemapper => structured_valmapper(v)?,
        Context::StructDecl => return Err(wrong_context(v)),
    }
    Ok(Flow::Break)
}

fn struct_type(v: &mut Visit<'_, Gen>) -> Result<Flow, Abort> {
    match v.payload.context {
        Context::Normal => (),
        Context::Mapper => {
            let mapper = struct_mapper(v)?;
            let asm = asm_of(v);
            install(asm, mapper);
            asm.emit(Opcode::Call, &[]);
        },
        Context::Writer => {
            let writer = struct_writer(v)?;
            call_writer(asm_of(v), writer);
        },
        Context::ValueRemapper => structured_valmapper(v)?,
        // the mapper, then the constructor, as the resolver laid them out
        Context::StructDecl => {
            let mapper = struct_mapper(v)?;
            let asm = asm_of(v);
            install(asm, mapper);
            asm.emit(Opcode::RegVar, &[]);
            let constructor = struct_constructor(v)?;
            let asm = asm_of(v);
            install(asm, constructor);
            asm.emit(Opcode::RegVar, &[]);
        },
    }
    Ok(Flow::Break)
}

/// `OFF VALUE --`
fn call_writer(asm: &mut Assembler, writer: Rc<Lambda>) {
    install(asm, writer);
    asm.emit(Opcode::Call, &[]);
    asm.emit(Opcode::Drop, &[]);
}

/// `VALUE -- VALUE'`, in a mapper whose slot 0 is the mapped offset:
/// tags the value with the offset, the running mapper and `writer`.
fn tag_mapping(asm: &mut Assembler, writer: Rc<Lambda>) {
    asm.emit(Opcode::PushVar, &[0, 0]);
    asm.emit(Opcode::PushSelf, &[]);
    install(asm, writer);
    asm.emit(Opcode::Mset, &[]);
}

/// Value re-mappers take `(OLD, NEW, OFF)`.
/// Scalars are stored as they are.
fn scalar_valmapper(v: &mut Visit<'_, Gen>) -> Result<(), Abort> {
    v.payload.open("valmapper");
    let asm = asm_of(v);
    prologue(asm, 3);
    asm.emit(Opcode::PushVar, &[0, 1]);
    epilogue(asm);
    let lambda = v.payload.close()?;
    install(asm_of(v), lambda);
    Ok(())
}

/// Structured values take over the old value's place in the store.
fn structured_valmapper(v: &mut Visit<'_, Gen>) -> Result<(), Abort> {
    v.payload.open("valmapper");
    let asm = asm_of(v);
    prologue(asm, 3);
    asm.emit(Opcode::PushVar, &[0, 1]);
    asm.emit(Opcode::PushVar, &[0, 2]);
    asm.emit(Opcode::PushVar, &[0, 0]);
    asm.emit(Opcode::Mgetm, &[]);
    asm.emit(Opcode::Nip, &[]);
    asm.emit(Opcode::PushVar, &[0, 0]);
    asm.emit(Opcode::Mgetw, &[]);
    asm.emit(Opcode::Nip, &[]);
    asm.emit(Opcode::Mset, &[]);
    epilogue(asm);
    let lambda = v.payload.close()?;
    install(asm_of(v), lambda);
    Ok(())
}

enum Bound {
    Count,
    Size,
    Unbounded,
}

fn array_parts(v: &Visit<'_, Gen>) -> Result<(NodeId, Option<NodeId>, Bound), Abort> {
    let (etype, bound) = match v.as_type(v.node)? {
        Type::Array { etype, bound } => (*etype, *bound),
        _ => return Err(v.ice("expected an array type")),
    };
    let kind = match bound {
        None => Bound::Unbounded,
        Some(bound) => match v.type_of(bound)? {
            Type::Integral { .. } => Bound::Count,
            Type::Offset { .. } => Bound::Size,
            other => return Err(v.ice_at(bound, &format!("array bound of type {:?}", other.code()))),
        },
    };
    Ok((etype, bound, kind))
}

/// `ARR CUR -- ARR CUR'`: decodes one element at the cursor and appends it.
fn array_step(v: &mut Visit<'_, Gen>, etype: NodeId) -> Result<(), Abort> {
    asm_of(v).emit(Opcode::Dup, &[]);
    with_context(v, Context::Mapper, etype)?;
    let asm = asm_of(v);
    asm.emit(Opcode::Swap, &[]);
    asm.emit(Opcode::Over, &[]);
    asm.emit(Opcode::Siz, &[]);
    advance(asm);
    asm.emit(Opcode::Nrot, &[]);
    asm.emit(Opcode::Apush, &[]);
    asm.emit(Opcode::Swap, &[]);
    Ok(())
}

/// `OFF -- ARRAY`
///
/// The bound is evaluated here, where the resolver expects it,
/// and kept in a frame of its own that the mapper closes over,
/// so re-mapping later sees the same bound.
fn array_mapper(v: &mut Visit<'_, Gen>) -> Result<(), Abort> {
    let (etype, bound, kind) = array_parts(v)?;

    if let Some(bound) = bound {
        with_context(v, Context::Normal, bound)?;
        let asm = asm_of(v);
        asm.emit(Opcode::PushF, &[]);
        asm.emit(Opcode::RegVar, &[]);
    }

    v.payload.open("array mapper");
    let asm = asm_of(v);
    prologue(asm, 1);
    asm.emit(Opcode::Mka, &[0, 0]);
    asm.emit(Opcode::PushVar, &[0, 0]);

    match kind {
        Bound::Count => {
            let asm = asm_of(v);
            asm.push_int(Int::ulong(0));
            asm.while_();
            asm.emit(Opcode::Dup, &[]);
            asm.emit(Opcode::PushVar, &[1, 0]);
            asm.emit_int(Opcode::Nton, 64, false);
            asm.emit(Opcode::Lt, &[]);
            asm.loop_();
            asm.emit(Opcode::Tor, &[]);
            array_step(v, etype)?;
            let asm = asm_of(v);
            asm.emit(Opcode::Fromr, &[]);
            asm.push_int(Int::ulong(1));
            asm.emit_int(Opcode::Add, 64, false);
            asm.end_loop();
            asm.emit(Opcode::Drop, &[]);
        },
        Bound::Size => {
            let asm = asm_of(v);
            asm.while_();
            consumed(asm);
            asm.emit(Opcode::Lt, &[]);
            asm.loop_();
            array_step(v, etype)?;
            let asm = asm_of(v);
            asm.end_loop();
            // the elements have to fill the bound exactly
            asm.if_();
            consumed(asm);
            asm.emit(Opcode::Ne, &[]);
            asm.then();
            raise_exception(asm, Exception::MapBounds);
            asm.end_if();
        },
        Bound::Unbounded => {
            let asm = asm_of(v);
            let out = asm.fresh_label();
            asm.while_();
            asm.emit(Opcode::Dup, &[]);
            bits(asm);
            asm.emit(Opcode::Iosize, &[]);
            bits(asm);
            asm.emit(Opcode::Lt, &[]);
            asm.loop_();
            // running out of data ends the array
            asm.push_int(Int::int(Exception::Eof.code()));
            asm.try_(false);
            array_step(v, etype)?;
            let asm = asm_of(v);
            asm.catch();
            asm.jump(Opcode::Ba, out);
            asm.end_try();
            asm.end_loop();
            asm.label(out);
        },
    }

    asm_of(v).emit(Opcode::Drop, &[]);
    let writer = array_writer(v)?;
    let asm = asm_of(v);
    tag_mapping(asm, writer);
    epilogue(asm);
    let mapper = v.payload.close()?;

    let asm = asm_of(v);
    install(asm, mapper);
    if bound.is_some() {
        asm.emit(Opcode::PopF, &[1]);
    }
    asm.emit(Opcode::Call, &[]);
    Ok(())
}

/// `ARR CUR -- ARR CUR USED BOUND`, both in bits.
fn consumed(asm: &mut Assembler) {
    asm.emit(Opcode::Dup, &[]);
    bits(asm);
    asm.emit(Opcode::PushVar, &[0, 0]);
    bits(asm);
    asm.emit_int(Opcode::Sub, 64, false);
    asm.emit(Opcode::PushVar, &[1, 0]);
    bits(asm);
}

/// `-- ELEM` in a writer: the element at the index on top of the return stack.
fn writer_elem(asm: &mut Assembler) {
    asm.emit(Opcode::PushVar, &[0, 1]);
    asm.emit(Opcode::Fromr, &[]);
    asm.emit(Opcode::Dup, &[]);
    asm.emit(Opcode::Tor, &[]);
    asm.emit(Opcode::Aref, &[]);
    asm.emit(Opcode::Nip2, &[]);
}

/// Writers take `(OFF, VALUE)` and return null.
fn array_writer(v: &mut Visit<'_, Gen>) -> Result<Rc<Lambda>, Abort> {
    let (etype, _, _) = array_parts(v)?;

    v.payload.open("array writer");
    let asm = asm_of(v);
    prologue(asm, 2);
    asm.emit(Opcode::PushVar, &[0, 0]);
    asm.push_int(Int::ulong(0));
    asm.while_();
    asm.emit(Opcode::Dup, &[]);
    asm.emit(Opcode::PushVar, &[0, 1]);
    asm.emit(Opcode::Sel, &[]);
    asm.emit(Opcode::Lt, &[]);
    asm.loop_();
    asm.emit(Opcode::Tor, &[]);
    asm.emit(Opcode::Dup, &[]);
    writer_elem(asm);
    with_context(v, Context::Writer, etype)?;
    let asm = asm_of(v);
    writer_elem(asm);
    asm.emit(Opcode::Siz, &[]);
    advance(asm);
    asm.emit(Opcode::Fromr, &[]);
    asm.push_int(Int::ulong(1));
    asm.emit_int(Opcode::Add, 64, false);
    asm.end_loop();
    asm.emit(Opcode::Drop, &[]);
    asm.emit(Opcode::Drop, &[]);
    asm.push(Data::Null);
    epilogue(asm);

    Ok(v.payload.close()?)
}

fn struct_fields(v: &Visit<'_, Gen>) -> Result<(Option<String>, Vec<(Option<String>, NodeId)>), Abort> {
    let (name, elems) = match v.as_type(v.node)? {
        Type::Struct { name, elems } => (name.clone(), elems.clone()),
        _ => return Err(v.ice("expected a struct type")),
    };
    let fields = elems
        .into_iter()
        .map(|elem| match &v.ast[elem].kind {
            Kind::StructElemType { name, ty } => Ok((name.clone(), *ty)),
            _ => Err(v.ice_at(elem, "expected a struct element type")),
        })
        .collect::<Result<_, _>>()?;
    Ok((name, fields))
}

fn field_name(name: &Option<String>) -> Data {
    match name {
        Some(name) => Data::string(name),
        None => Data::Null,
    }
}

/// Decodes fields one after the other,
/// binding each to slot `i + 1` as it goes
/// so later fields can refer to earlier ones.
fn struct_mapper(v: &mut Visit<'_, Gen>) -> Result<Rc<Lambda>, Abort> {
    let (name, fields) = struct_fields(v)?;

    v.payload.open(&format!("{} mapper", name.as_deref().unwrap_or("struct")));
    let asm = asm_of(v);
    prologue(asm, 1);
    asm.emit(Opcode::PushVar, &[0, 0]);

    for (_, ty) in fields.iter() {
        asm_of(v).emit(Opcode::Dup, &[]);
        with_context(v, Context::Mapper, *ty)?;
        let asm = asm_of(v);
        asm.emit(Opcode::Dup, &[]);
        asm.emit(Opcode::RegVar, &[]);
        asm.emit(Opcode::Siz, &[]);
        advance(asm);
    }

    let asm = asm_of(v);
    asm.emit(Opcode::Drop, &[]);
    for (index, (name, _)) in fields.iter().enumerate() {
        asm.push(field_name(name));
        asm.emit(Opcode::PushVar, &[0, index + 1]);
    }
    asm.emit(Opcode::Mksct, &[fields.len()]);

    let writer = struct_writer(v)?;
    let asm = asm_of(v);
    tag_mapping(asm, writer);
    epilogue(asm);
    Ok(v.payload.close()?)
}

/// `-- FIELD` in a writer.
fn writer_field(asm: &mut Assembler, index: usize) {
    asm.emit(Opcode::PushVar, &[0, 1]);
    asm.push_int(Int::ulong(index as u64));
    asm.emit(Opcode::Srefi, &[]);
    asm.emit(Opcode::Nip2, &[]);
}

fn struct_writer(v: &mut Visit<'_, Gen>) -> Result<Rc<Lambda>, Abort> {
    let (name, fields) = struct_fields(v)?;

    v.payload.open(&format!("{} writer", name.as_deref().unwrap_or("struct")));
    let asm = asm_of(v);
    prologue(asm, 2);
    asm.emit(Opcode::PushVar, &[0, 0]);

    for (index, (_, ty)) in fields.iter().enumerate() {
        let asm = asm_of(v);
        asm.emit(Opcode::Dup, &[]);
        writer_field(asm, index);
        with_context(v, Context::Writer, *ty)?;
        let asm = asm_of(v);
        writer_field(asm, index);
        asm.emit(Opcode::Siz, &[]);
        advance(asm);
    }

    let asm = asm_of(v);
    asm.emit(Opcode::Drop, &[]);
    asm.push(Data::Null);
    epilogue(asm);
    Ok(v.payload.close()?)
}

/// Constructors take a struct of initial values
/// and give every field left out the zero value of its type.
fn struct_constructor(v: &mut Visit<'_, Gen>) -> Result<Rc<Lambda>, Abort> {
    let (name, fields) = struct_fields(v)?;

    v.payload.open(&format!("{} constructor", name.as_deref().unwrap_or("struct")));
    prologue(asm_of(v), 1);

    for (name, ty) in fields.iter() {
        match name {
            Some(name) => {
                let asm = asm_of(v);
                let have = asm.fresh_label();
                asm.emit(Opcode::PushVar, &[0, 0]);
                asm.push(Data::string(name));
                asm.emit(Opcode::Srefnt, &[]);
                asm.emit(Opcode::Nip2, &[]);
                asm.jump(Opcode::Bnn, have);
                asm.emit(Opcode::Drop, &[]);
                zero(v, *ty)?;
                let integral = match v.as_type(*ty)? {
                    Type::Integral { size, signed } => Some((*size, *signed)),
                    _ => None,
                };
                let asm = asm_of(v);
                asm.label(have);
                if let Some((size, signed)) = integral {
                    asm.emit_int(Opcode::Nton, size, signed);
                }
            },
            None => zero(v, *ty)?,
        }
        asm_of(v).emit(Opcode::RegVar, &[]);
    }

    let asm = asm_of(v);
    for (index, (name, _)) in fields.iter().enumerate() {
        asm.push(field_name(name));
        asm.emit(Opcode::PushVar, &[0, index + 1]);
    }
    asm.emit(Opcode::Mksct, &[fields.len()]);
    epilogue(asm);
    Ok(v.payload.close()?)
}

/// `-- ZERO`, the value a constructor gives fields left out.
fn zero(v: &mut Visit<'_, Gen>, ty: NodeId) -> Result<(), Abort> {
    match v.as_type(ty)?.clone() {
        Type::Integral { size, signed } => asm_of(v).push_int(Int::new(0, size, signed)),
        Type::String => asm_of(v).push(Data::string("")),
        Type::Offset { base, unit } => {
            let (size, signed) = integral_of(v, base)?;
            asm_of(v).push_int(Int::new(0, size, signed));
            with_context(v, Context::Normal, unit)?;
            asm_of(v).emit(Opcode::Mko, &[]);
        },
        Type::Array { .. } => asm_of(v).emit(Opcode::Mka, &[0, 0]),
        Type::Struct { elems, .. } => {
            for elem in elems.iter() {
                let (name, ty) = match &v.ast[*elem].kind {
                    Kind::StructElemType { name, ty } => (name.clone(), *ty),
                    _ => return Err(v.ice_at(*elem, "expected a struct element type")),
                };
                asm_of(v).push(field_name(&name));
                zero(v, ty)?;
            }
            asm_of(v).emit(Opcode::Mksct, &[elems.len()]);
        },
        Type::Void | Type::Function { .. } => asm_of(v).push(Data::Null),
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        common::{
            number::{build_number, ADDRESS_WIDTH},
            opcode::Arg,
        },
        compiler::compile,
        construct::tree::Ast,
    };

    /// The opcodes of a program, operands skipped.
    fn ops(lambda: &Lambda) -> Vec<Opcode> {
        let mut ip = 0;
        let mut out = vec![];
        while ip < lambda.code.len() {
            let op = Opcode::from_byte(lambda.code[ip]).unwrap();
            ip += 1;
            for arg in op.layout() {
                ip += match arg {
                    Arg::Number => build_number(&lambda.code[ip..]).unwrap().1,
                    Arg::Address => ADDRESS_WIDTH,
                };
            }
            out.push(op);
        }
        out
    }

    fn nested(lambda: &Lambda) -> Vec<Rc<Lambda>> {
        lambda
            .constants
            .iter()
            .filter_map(|c| match c {
                Data::Lambda(l) => Some(Rc::clone(l)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn flavors() {
        let mut ast = Ast::new();
        let ty = ast.integral(32, true);
        let one = ast.integer(1, ty);
        let decl = ast.decl(DeclKind::Var, "a", one);
        ast.program(&[decl]);
        let program = compile(&mut ast, Flavor::Program).unwrap();
        assert_eq!(ops(&program), vec![
            Opcode::Prolog,
            Opcode::Push,
            Opcode::RegVar,
            Opcode::Push,
            Opcode::Exit,
        ]);

        let mut ast = Ast::new();
        let ty = ast.integral(32, true);
        let five = ast.integer(5, ty);
        ast.program(&[five]);
        let expression = compile(&mut ast, Flavor::Expression).unwrap();
        assert_eq!(ops(&expression), vec![Opcode::Prolog, Opcode::Push, Opcode::Exit]);
        assert_eq!(expression.name(), "toplevel");
    }

    #[test]
    fn struct_declarations() {
        let mut ast = Ast::new();
        let a = ast.integral(32, false);
        let pair = ast.struct_type(Some("pair"), &[(Some("a"), a)]);
        let decl = ast.decl(DeclKind::Type, "pair", pair);
        ast.program(&[decl]);
        let program = compile(&mut ast, Flavor::Program).unwrap();

        let registered = ops(&program).into_iter().filter(|op| *op == Opcode::RegVar).count();
        assert_eq!(registered, 2);

        let closures = nested(&program);
        let names: Vec<&str> = closures.iter().map(|l| l.name()).collect();
        assert_eq!(names, vec!["pair mapper", "pair constructor"]);

        // the writer travels inside the mapper
        let writers = nested(&closures[0]);
        assert_eq!(writers.iter().map(|l| l.name()).collect::<Vec<_>>(), vec!["pair writer"]);
        assert!(ops(&closures[0]).contains(&Opcode::Mset));
    }

    #[test]
    fn structured_reads_remap() {
        let read = |structured: bool| {
            let mut ast = Ast::new();
            let byte = ast.integral(8, false);
            let ty = if structured { ast.array_type(byte, None) } else { byte };
            let var = ast.var("v", 0, 0, ty);
            ast.program(&[var]);
            ops(&compile(&mut ast, Flavor::Expression).unwrap())
        };

        assert_eq!(read(true), vec![Opcode::Prolog, Opcode::PushVar, Opcode::Remap, Opcode::Exit]);
        assert_eq!(read(false), vec![Opcode::Prolog, Opcode::PushVar, Opcode::Exit]);
    }

    #[test]
    fn missing_returns_raise() {
        let mut ast = Ast::new();
        let int = ast.integral(32, true);
        let void = ast.void_type();
        let decls: Vec<NodeId> = [("f", int), ("g", void)]
            .iter()
            .map(|&(name, rtype)| {
                let fn_ty = ast.function_type(rtype, &[]);
                let body = ast.null_stmt();
                let func = ast.func(Some(name), rtype, &[], body, fn_ty);
                ast.decl(DeclKind::Func, name, func)
            })
            .collect();
        ast.program(&decls);

        let program = compile(&mut ast, Flavor::Program).unwrap();
        let closures = nested(&program);
        let tail = |l: &Rc<Lambda>| {
            let ops = ops(l);
            ops[ops.len() - 4..].to_vec()
        };
        assert_eq!(closures[0].name(), "f");
        assert_eq!(tail(&closures[0]), vec![Opcode::Push, Opcode::Raise, Opcode::PopF, Opcode::Return]);
        assert_eq!(closures[1].name(), "g");
        assert_eq!(ops(&closures[1]).last(), Some(&Opcode::Return));
        assert!(!ops(&closures[1]).contains(&Opcode::Raise));
    }

    #[test]
    fn unhandled_nodes_are_internal_errors() {
        let mut ast = Ast::new();
        let stray = ast.identifier("x");
        ast.program(&[stray]);

        match compile(&mut ast, Flavor::Program) {
            Err(CompileError::Internal(syntax)) => {
                assert!(syntax.reason.contains("no code generation handler for Identifier"))
            },
            other => panic!("expected an internal error, got {:?}", other),
        }
    }
}
