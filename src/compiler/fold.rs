//! Constant folding of integer arithmetic.
//!
//! An operator expression whose operands are all integer literals
//! is rewritten in place into the literal it evaluates to,
//! and visited again, so chains fold from the leaves up.
//! Folding wraps exactly as the VM does at run time.

use log::trace;

use crate::{
    common::{data::Int, opcode::Opcode},
    compiler::pass::{Abort, Flow, Phase, Visit},
    construct::tree::{Ast, Code, Kind, NodeId, Op, Type},
};

pub fn phase() -> Phase<()> {
    Phase::new("fold").post(Code::Exp, fold)
}

fn literal(ast: &Ast, node: NodeId) -> Option<Int> {
    match (&ast[node].kind, ast.type_of(node)?) {
        (Kind::Integer { value }, Type::Integral { size, signed }) => {
            Some(Int::from_bits(*value, *size, *signed))
        },
        _ => None,
    }
}

fn evaluate(op: Op, operands: &[Int], size: u8, signed: bool) -> Option<Int> {
    match (op, operands) {
        (Op::Pos, [a]) => Some(a.convert(size, signed)),
        (Op::Neg, [a]) => Int::unary(Opcode::Neg, *a, size, signed),
        (Op::Bnot, [a]) => Int::unary(Opcode::Bnot, *a, size, signed),
        (_, [a, b]) => {
            let code = match op {
                Op::Add => Opcode::Add,
                Op::Sub => Opcode::Sub,
                Op::Mul => Opcode::Mul,
                Op::Div => Opcode::Div,
                Op::Mod => Opcode::Mod,
                Op::Band => Opcode::Band,
                Op::Ior => Opcode::Bor,
                Op::Xor => Opcode::Bxor,
                Op::Sl => Opcode::Sl,
                Op::Sr => Opcode::Sr,
                _ => return None,
            };
            // division by zero is left for run time to raise
            Int::binary(code, *a, *b, size, signed)
        },
        _ => None,
    }
}

fn fold(v: &mut Visit<'_, ()>) -> Result<Flow, Abort> {
    let (op, operands) = match &v.node().kind {
        Kind::Exp { op, operands, .. } => (*op, operands.clone()),
        _ => return Ok(Flow::Continue),
    };
    let (size, signed) = match v.ast.type_of(v.node) {
        Some(Type::Integral { size, signed }) => (*size, *signed),
        _ => return Ok(Flow::Continue),
    };
    let ast = &*v.ast;
    let values = match operands.iter().map(|o| literal(ast, *o)).collect::<Option<Vec<_>>>() {
        Some(values) => values,
        None => return Ok(Flow::Continue),
    };

    match evaluate(op, &values, size, signed) {
        Some(folded) => {
            trace!("folded {:?} at {} into {}", op, v.node, folded.value());
            let ty = v.node().ty;
            v.ast.replace(v.node, Kind::Integer { value: folded.bits() }, ty);
            Ok(Flow::Restart)
        },
        None => Ok(Flow::Continue),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::compiler::pass::{self, Completion};

    #[test]
    fn folds_from_the_leaves() {
        let mut ast = Ast::new();
        let byte = ast.integral(8, false);
        let a = ast.integer(200, byte);
        let b = ast.integer(100, byte);
        let sum = ast.binary(Op::Add, a, b, byte);
        let c = ast.integer(2, byte);
        let product = ast.binary(Op::Mul, sum, c, byte);
        let stmt = ast.exp_stmt(product);
        ast.program(&[stmt]);

        let result = pass::run(&mut ast, &[&phase()], &mut ());
        assert_eq!(result.unwrap(), Completion::Finished);
        // (200 + 100) wraps to 44, times 2
        assert_eq!(ast[product].kind, Kind::Integer { value: 88 });
        assert_eq!(ast[product].ty, Some(byte));
    }

    #[test]
    fn leaves_division_by_zero() {
        let mut ast = Ast::new();
        let int = ast.integral(32, true);
        let a = ast.integer(1, int);
        let b = ast.integer(0, int);
        let quotient = ast.binary(Op::Div, a, b, int);
        let stmt = ast.exp_stmt(quotient);
        ast.program(&[stmt]);

        pass::run(&mut ast, &[&phase()], &mut ()).unwrap();
        assert_eq!(ast[quotient].op(), Some(Op::Div));
    }

    #[test]
    fn negative_literals() {
        let mut ast = Ast::new();
        let int = ast.integral(16, true);
        let a = ast.integer(5, int);
        let neg = ast.unary(Op::Neg, a, int);
        let stmt = ast.exp_stmt(neg);
        ast.program(&[stmt]);

        pass::run(&mut ast, &[&phase()], &mut ()).unwrap();
        assert_eq!(ast[neg].kind, Kind::Integer { value: 0xfffb });
    }
}
