//! The pass engine: one depth-first walk over an `Ast`,
//! dispatching every node to the handlers of a list of phases.
//!
//! A phase registers handlers for the way in (pre-order) and the way out
//! (post-order), keyed by node kind, by operator or by type kind.
//! At each node and for each direction, the most specific handler fires
//! (operator or type before node kind), followed by the phase's default
//! handler for that direction. A phase may also name a handler for nodes
//! it did not handle at all.
//!
//! Handlers steer the walk with the `Flow` they return, and stop it
//! by returning an `Abort`, which unwinds every frame of the walk,
//! sub-passes included.

use std::collections::HashMap;

use log::trace;

use crate::{
    compiler::syntax::{CompileError, Note, Syntax},
    construct::tree::{Ast, Code, Node, NodeId, Op, Type, TypeCode},
};

/// How many times a single node may be restarted before the
/// engine decides a phase is looping.
pub const MAX_RESTARTS: usize = 8;

/// What a handler wants the engine to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Do not descend into the node's children.
    /// Only meaningful on the way in.
    Break,
    /// The handler rewrote the node: visit it again from the top.
    Restart,
}

/// Stops the whole walk.
#[derive(Debug)]
pub enum Abort {
    /// Stop early, successfully.
    Exit,
    Error(CompileError),
}

impl From<CompileError> for Abort {
    fn from(error: CompileError) -> Abort {
        Abort::Error(error)
    }
}

impl From<Syntax> for Abort {
    fn from(error: Syntax) -> Abort {
        Abort::Error(CompileError::Internal(error))
    }
}

/// How a walk ended, when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Finished,
    Exited,
}

pub type Handler<P> = fn(&mut Visit<'_, P>) -> Result<Flow, Abort>;

struct Table<P> {
    code: HashMap<Code, Handler<P>>,
    op: HashMap<Op, Handler<P>>,
    ty: HashMap<TypeCode, Handler<P>>,
    default: Option<Handler<P>>,
}

impl<P> Table<P> {
    fn new() -> Table<P> {
        Table { code: HashMap::new(), op: HashMap::new(), ty: HashMap::new(), default: None }
    }

    fn specific(&self, node: &Node) -> Option<Handler<P>> {
        let sub = match (node.op(), node.type_code()) {
            (Some(op), _) => self.op.get(&op),
            (_, Some(code)) => self.ty.get(&code),
            _ => None,
        };
        sub.or_else(|| self.code.get(&node.code())).copied()
    }

    /// The handlers to fire for a node, in order.
    fn handlers(&self, node: &Node) -> impl Iterator<Item = Handler<P>> {
        [self.specific(node), self.default].into_iter().flatten()
    }
}

/// A set of handlers, plus the payload type they share.
pub struct Phase<P> {
    name: &'static str,
    pre: Table<P>,
    post: Table<P>,
    otherwise: Option<Handler<P>>,
}

impl<P> Phase<P> {
    pub fn new(name: &'static str) -> Phase<P> {
        Phase { name, pre: Table::new(), post: Table::new(), otherwise: None }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn pre(mut self, code: Code, handler: Handler<P>) -> Self {
        self.pre.code.insert(code, handler);
        self
    }

    pub fn pre_op(mut self, op: Op, handler: Handler<P>) -> Self {
        self.pre.op.insert(op, handler);
        self
    }

    pub fn pre_type(mut self, code: TypeCode, handler: Handler<P>) -> Self {
        self.pre.ty.insert(code, handler);
        self
    }

    pub fn pre_default(mut self, handler: Handler<P>) -> Self {
        self.pre.default = Some(handler);
        self
    }

    pub fn post(mut self, code: Code, handler: Handler<P>) -> Self {
        self.post.code.insert(code, handler);
        self
    }

    pub fn post_op(mut self, op: Op, handler: Handler<P>) -> Self {
        self.post.op.insert(op, handler);
        self
    }

    pub fn post_type(mut self, code: TypeCode, handler: Handler<P>) -> Self {
        self.post.ty.insert(code, handler);
        self
    }

    pub fn post_default(mut self, handler: Handler<P>) -> Self {
        self.post.default = Some(handler);
        self
    }

    /// Fires for nodes no other handler of this phase fired for.
    pub fn otherwise(mut self, handler: Handler<P>) -> Self {
        self.otherwise = Some(handler);
        self
    }
}

/// What a handler sees of the walk.
pub struct Visit<'v, P> {
    pub ast: &'v mut Ast,
    pub payload: &'v mut P,
    pub node: NodeId,
    pub parent: Option<NodeId>,
    /// Position of the node among its parent's children.
    pub child: usize,
    phases: &'v [&'v Phase<P>],
}

impl<'v, P> Visit<'v, P> {
    pub fn node(&self) -> &Node {
        &self.ast[self.node]
    }

    pub fn parent_code(&self) -> Option<Code> {
        self.parent.map(|p| self.ast[p].code())
    }

    /// An internal compiler error located at the current node.
    pub fn ice(&self, reason: &str) -> Abort {
        self.ice_at(self.node, reason)
    }

    pub fn ice_at(&self, node: NodeId, reason: &str) -> Abort {
        let node = &self.ast[node];
        Syntax::error(reason, &node.span).into()
    }

    /// The resolved type of a node.
    pub fn type_of(&self, node: NodeId) -> Result<&Type, Abort> {
        match self.ast.type_of(node) {
            Some(ty) => Ok(ty),
            None => Err(self.ice_at(node, &format!("node {} has no resolved type", node))),
        }
    }

    /// A node that is itself a type.
    pub fn as_type(&self, node: NodeId) -> Result<&Type, Abort> {
        match self.ast.as_type(node) {
            Some(ty) => Ok(ty),
            None => Err(self.ice_at(node, &format!("node {} is not a type", node))),
        }
    }

    /// Walks the subtree at `node` with every phase of this pass,
    /// then returns here.
    pub fn subpass(&mut self, node: NodeId) -> Result<(), Abort> {
        trace!("subpass at {} from {}", node, self.node);
        walk(self.ast, self.payload, self.phases, node, None, 0)
    }
}

/// Walks the whole tree from its root.
pub fn run<P>(ast: &mut Ast, phases: &[&Phase<P>], payload: &mut P) -> Result<Completion, CompileError> {
    let root = ast.root().ok_or_else(|| Syntax::error_no_note("tree has no program node"))?;
    run_subpass(ast, phases, payload, root)
}

/// Walks the subtree at `node`.
pub fn run_subpass<P>(
    ast: &mut Ast,
    phases: &[&Phase<P>],
    payload: &mut P,
    node: NodeId,
) -> Result<Completion, CompileError> {
    match walk(ast, payload, phases, node, None, 0) {
        Ok(()) => Ok(Completion::Finished),
        Err(Abort::Exit) => Ok(Completion::Exited),
        Err(Abort::Error(error)) => Err(error),
    }
}

fn walk<P>(
    ast: &mut Ast,
    payload: &mut P,
    phases: &[&Phase<P>],
    node: NodeId,
    parent: Option<NodeId>,
    child: usize,
) -> Result<(), Abort> {
    if ast.get(node).is_none() {
        return Err(Syntax::error_no_note(&format!("dangling node handle {}", node)).into());
    }

    let mut restarts = 0;

    'node: loop {
        let mut handled = vec![false; phases.len()];
        let mut descend = true;

        for (index, phase) in phases.iter().enumerate() {
            let handlers: Vec<_> = phase.pre.handlers(&ast[node]).collect();
            for handler in handlers {
                handled[index] = true;
                let mut visit = Visit { ast: &mut *ast, payload: &mut *payload, node, parent, child, phases };
                match handler(&mut visit)? {
                    Flow::Continue => (),
                    Flow::Break => descend = false,
                    Flow::Restart => {
                        restart(ast, phase, node, &mut restarts)?;
                        continue 'node;
                    },
                }
            }
        }

        if descend {
            for (position, next) in ast[node].children().into_iter().enumerate() {
                walk(ast, payload, phases, next, Some(node), position)?;
            }
        }

        for (index, phase) in phases.iter().enumerate() {
            let mut handlers: Vec<_> = phase.post.handlers(&ast[node]).collect();
            if handlers.is_empty() && !handled[index] {
                handlers.extend(phase.otherwise);
            }

            for handler in handlers {
                let mut visit = Visit { ast: &mut *ast, payload: &mut *payload, node, parent, child, phases };
                match handler(&mut visit)? {
                    Flow::Continue => (),
                    Flow::Break => {
                        let span = ast[node].span.clone();
                        let reason = format!("phase {} tried to skip children on the way out", phase.name);
                        return Err(Syntax::error(&reason, &span).into());
                    },
                    Flow::Restart => {
                        restart(ast, phase, node, &mut restarts)?;
                        continue 'node;
                    },
                }
            }
        }

        return Ok(());
    }
}

fn restart<P>(ast: &Ast, phase: &Phase<P>, node: NodeId, restarts: &mut usize) -> Result<(), Abort> {
    *restarts += 1;
    trace!("{}: restart {} at {} ({:?})", phase.name, restarts, node, ast[node].code());

    if *restarts > MAX_RESTARTS {
        let reason = format!("phase {} restarted node {} more than {} times", phase.name, node, MAX_RESTARTS);
        let note = Note::new_with_hint(&format!("{:?} node", ast[node].code()), &ast[node].span);
        return Err(Syntax::error_with_note(&reason, note).into());
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::construct::tree::Kind;

    /// Records the order handlers fire in.
    #[derive(Default)]
    struct Log(Vec<String>);

    fn note(v: &mut Visit<'_, Log>, what: &str) {
        let entry = format!("{}:{:?}", what, v.node().code());
        v.payload.0.push(entry);
    }

    fn pre_exp(v: &mut Visit<'_, Log>) -> Result<Flow, Abort> {
        note(v, "pre");
        Ok(Flow::Continue)
    }

    fn pre_add(v: &mut Visit<'_, Log>) -> Result<Flow, Abort> {
        note(v, "pre-add");
        Ok(Flow::Continue)
    }

    fn post_integer(v: &mut Visit<'_, Log>) -> Result<Flow, Abort> {
        note(v, "post");
        Ok(Flow::Continue)
    }

    fn post_any(v: &mut Visit<'_, Log>) -> Result<Flow, Abort> {
        note(v, "default");
        Ok(Flow::Continue)
    }

    fn skip(v: &mut Visit<'_, Log>) -> Result<Flow, Abort> {
        note(v, "skip");
        Ok(Flow::Break)
    }

    fn forever(_: &mut Visit<'_, Log>) -> Result<Flow, Abort> {
        Ok(Flow::Restart)
    }

    fn unhandled(v: &mut Visit<'_, Log>) -> Result<Flow, Abort> {
        Err(v.ice("no handler"))
    }

    fn leave(_: &mut Visit<'_, Log>) -> Result<Flow, Abort> {
        Err(Abort::Exit)
    }

    fn sum(ast: &mut Ast) -> NodeId {
        let int = ast.integral(32, true);
        let a = ast.integer(1, int);
        let b = ast.integer(2, int);
        let sum = ast.binary(Op::Add, a, b, int);
        let stmt = ast.exp_stmt(sum);
        ast.program(&[stmt]);
        sum
    }

    #[test]
    fn specific_before_default() {
        let mut ast = Ast::new();
        sum(&mut ast);
        let phase = Phase::new("log")
            .pre(Code::Exp, pre_exp)
            .pre_op(Op::Add, pre_add)
            .post(Code::Integer, post_integer)
            .post_default(post_any);
        let mut log = Log::default();

        assert_eq!(run(&mut ast, &[&phase], &mut log).unwrap(), Completion::Finished);
        assert_eq!(log.0, vec![
            "pre-add:Exp",
            "post:Integer", "default:Integer",
            "post:Integer", "default:Integer",
            "default:Exp",
            "default:ExpStmt",
            "default:Program",
        ]);
    }

    #[test]
    fn break_skips_children_for_every_phase() {
        let mut ast = Ast::new();
        sum(&mut ast);
        let first = Phase::new("first").pre(Code::ExpStmt, skip);
        let second = Phase::new("second").post(Code::Integer, post_integer);
        let mut log = Log::default();

        run(&mut ast, &[&first, &second], &mut log).unwrap();
        assert_eq!(log.0, vec!["skip:ExpStmt"]);
    }

    #[test]
    fn restarts_are_bounded() {
        let mut ast = Ast::new();
        sum(&mut ast);
        let phase = Phase::new("loop").post(Code::Integer, forever);
        let mut log = Log::default();

        match run(&mut ast, &[&phase], &mut log) {
            Err(CompileError::Internal(syntax)) => assert!(syntax.reason.contains("restarted")),
            other => panic!("expected an internal error, got {:?}", other),
        }
    }

    #[test]
    fn otherwise_fires_for_unhandled_nodes() {
        let mut ast = Ast::new();
        sum(&mut ast);
        let phase = Phase::new("strict")
            .post(Code::Program, post_any)
            .post(Code::ExpStmt, post_any)
            .post(Code::Exp, post_any)
            .otherwise(unhandled);
        let mut log = Log::default();

        assert!(run(&mut ast, &[&phase], &mut log).is_err());
        assert!(log.0.is_empty());
    }

    #[test]
    fn early_exit() {
        let mut ast = Ast::new();
        sum(&mut ast);
        let phase = Phase::new("exit").pre(Code::Exp, leave).post(Code::Integer, post_integer);
        let mut log = Log::default();

        assert_eq!(run(&mut ast, &[&phase], &mut log).unwrap(), Completion::Exited);
        assert!(log.0.is_empty());
    }

    fn fold_once(v: &mut Visit<'_, Log>) -> Result<Flow, Abort> {
        note(v, "fold");
        let ty = v.node().ty;
        v.ast.replace(v.node, Kind::Integer { value: 3 }, ty);
        Ok(Flow::Restart)
    }

    fn count_sub(v: &mut Visit<'_, Log>) -> Result<Flow, Abort> {
        note(v, "sub");
        let operands = v.node().children();
        v.subpass(operands[0])?;
        Ok(Flow::Break)
    }

    #[test]
    fn restart_revisits_rewritten_node() {
        let mut ast = Ast::new();
        let sum = sum(&mut ast);
        let phase = Phase::new("fold").post_op(Op::Add, fold_once).post(Code::Integer, post_integer);
        let mut log = Log::default();

        run(&mut ast, &[&phase], &mut log).unwrap();
        assert_eq!(log.0, vec!["post:Integer", "post:Integer", "fold:Exp", "post:Integer"]);
        assert_eq!(ast[sum].kind, Kind::Integer { value: 3 });
    }

    #[test]
    fn subpass_and_exit_unwind() {
        let mut ast = Ast::new();
        sum(&mut ast);
        let phase = Phase::new("sub").pre_op(Op::Add, count_sub).pre(Code::Integer, leave);
        let mut log = Log::default();

        assert_eq!(run(&mut ast, &[&phase], &mut log).unwrap(), Completion::Exited);
        assert_eq!(log.0, vec!["sub:Exp"]);
    }
}
