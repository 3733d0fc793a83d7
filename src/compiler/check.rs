//! Verifies the tree handed over by the resolver:
//! every node that stands for a value must have a resolved type.

use crate::compiler::pass::{Abort, Flow, Phase, Visit};

pub fn phase() -> Phase<()> {
    Phase::new("check").post_default(typed)
}

fn typed(v: &mut Visit<'_, ()>) -> Result<Flow, Abort> {
    let node = v.node();
    if node.needs_type() && v.ast.type_of(v.node).is_none() {
        let code = node.code();
        return Err(v.ice(&format!("{:?} node {} reached code generation untyped", code, v.node)));
    }
    Ok(Flow::Continue)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        compiler::{pass, syntax::CompileError},
        construct::tree::{Ast, Kind},
        common::span::Span,
    };

    #[test]
    fn typed_tree_passes() {
        let mut ast = Ast::new();
        let int = ast.integral(32, true);
        let one = ast.integer(1, int);
        let stmt = ast.exp_stmt(one);
        ast.program(&[stmt]);

        assert!(pass::run(&mut ast, &[&phase()], &mut ()).is_ok());
    }

    #[test]
    fn untyped_node_is_internal_error() {
        let mut ast = Ast::new();
        let one = ast.push(Kind::Integer { value: 1 }, Span::empty(), None);
        let stmt = ast.exp_stmt(one);
        ast.program(&[stmt]);

        match pass::run(&mut ast, &[&phase()], &mut ()) {
            Err(CompileError::Internal(syntax)) => assert!(syntax.reason.contains("Integer")),
            other => panic!("expected an internal error, got {:?}", other),
        }
    }
}
