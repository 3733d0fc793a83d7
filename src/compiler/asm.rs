//! The structured assembler.
//!
//! The code generator never handles raw branch targets:
//! it opens and closes regions (`if`, `while`, for-in, `try`)
//! and the assembler lays out the labels and jumps around
//! whatever the generator emits in between.
//! Instructions are kept symbolic until `finish`,
//! which resolves labels and encodes the program.

use std::rc::Rc;

use crate::{
    common::{
        data::{Data, Int},
        lambda::Lambda,
        number::{split_address, split_number, ADDRESS_WIDTH},
        opcode::{Arg, Opcode},
    },
    compiler::syntax::{CompileError, Syntax},
};

/// A branch target within one program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

#[derive(Debug)]
enum Insn {
    Op(Opcode, Vec<usize>),
    Jump(Opcode, Label),
    Label(Label),
}

#[derive(Debug)]
enum Region {
    If { otherwise: Label, end: Label, has_else: bool },
    While { start: Label, end: Label },
    For { start: Label, next: Label, end: Label, has_where: bool },
    Try { catch: Label, end: Label, arg: bool },
}

/// The operands of an instruction working on integers of a given type.
pub fn int_args(size: u8, signed: bool) -> [usize; 2] {
    [size as usize, signed as usize]
}

/// Builds one program.
#[derive(Debug)]
pub struct Assembler {
    insns: Vec<Insn>,
    labels: usize,
    regions: Vec<Region>,
    constants: Vec<Data>,
    note: Option<String>,
    program: bool,
    misuse: Option<String>,
}

impl Assembler {
    /// Starts a program.
    /// A top-level program (`program = true`) gets a prologue marker
    /// and ends with `Exit`; functions frame themselves.
    pub fn new(program: bool) -> Assembler {
        let mut asm = Assembler {
            insns: vec![],
            labels: 0,
            regions: vec![],
            constants: vec![],
            note: None,
            program,
            misuse: None,
        };
        if program {
            asm.emit(Opcode::Prolog, &[]);
        }
        asm
    }

    /// Names the program, for tracebacks.
    pub fn note(&mut self, name: &str) {
        self.note = Some(name.to_string());
    }

    pub fn emit(&mut self, op: Opcode, args: &[usize]) {
        self.insns.push(Insn::Op(op, args.to_vec()));
    }

    /// Emits an instruction working on integers of the given type.
    pub fn emit_int(&mut self, op: Opcode, size: u8, signed: bool) {
        self.emit(op, &int_args(size, signed));
    }

    /// Adds a value to the constant table, reusing equal entries,
    /// and emits the instruction that pushes it.
    pub fn push(&mut self, data: Data) {
        let index = match self.constants.iter().position(|d| d == &data) {
            Some(index) => index,
            None => {
                self.constants.push(data);
                self.constants.len() - 1
            },
        };
        self.emit(Opcode::Push, &[index]);
    }

    pub fn push_int(&mut self, int: Int) {
        self.push(Data::Int(int));
    }

    pub fn fresh_label(&mut self) -> Label {
        self.labels += 1;
        Label(self.labels - 1)
    }

    pub fn label(&mut self, label: Label) {
        self.insns.push(Insn::Label(label));
    }

    pub fn jump(&mut self, op: Opcode, label: Label) {
        self.insns.push(Insn::Jump(op, label));
    }

    fn misuse(&mut self, what: &str) {
        if self.misuse.is_none() {
            self.misuse = Some(what.to_string());
        }
    }

    /// `if_`, condition, `then`, code, [`else_`, code], `end_if`.
    pub fn if_(&mut self) {
        let (otherwise, end) = (self.fresh_label(), self.fresh_label());
        self.regions.push(Region::If { otherwise, end, has_else: false });
    }

    pub fn then(&mut self) {
        match self.regions.last() {
            Some(Region::If { otherwise, .. }) => {
                let otherwise = *otherwise;
                self.jump(Opcode::Bz, otherwise);
            },
            _ => self.misuse("then outside of an if"),
        }
    }

    pub fn else_(&mut self) {
        match self.regions.last_mut() {
            Some(Region::If { otherwise, end, has_else }) => {
                *has_else = true;
                let (otherwise, end) = (*otherwise, *end);
                self.jump(Opcode::Ba, end);
                self.label(otherwise);
            },
            _ => self.misuse("else outside of an if"),
        }
    }

    pub fn end_if(&mut self) {
        match self.regions.pop() {
            Some(Region::If { otherwise, end, has_else }) => {
                if !has_else {
                    self.label(otherwise);
                }
                self.label(end);
            },
            _ => self.misuse("end_if outside of an if"),
        }
    }

    /// `while_`, condition, `loop_`, body, `end_loop`.
    pub fn while_(&mut self) {
        let (start, end) = (self.fresh_label(), self.fresh_label());
        self.label(start);
        self.regions.push(Region::While { start, end });
    }

    pub fn loop_(&mut self) {
        match self.regions.last() {
            Some(Region::While { end, .. }) => {
                let end = *end;
                self.jump(Opcode::Bz, end);
            },
            _ => self.misuse("loop outside of a while"),
        }
    }

    pub fn end_loop(&mut self) {
        match self.regions.pop() {
            Some(Region::While { start, end }) => {
                self.jump(Opcode::Ba, start);
                self.label(end);
            },
            _ => self.misuse("end_loop outside of a while"),
        }
    }

    /// `for_`, container, `for_where`, [condition], `for_loop`, body, `for_end`.
    ///
    /// While the loop runs the container and the current index
    /// sit on the operand stack, and a frame holds the current element
    /// at slot 0 for the condition and the body.
    pub fn for_(&mut self, has_where: bool) {
        let (start, next, end) = (self.fresh_label(), self.fresh_label(), self.fresh_label());
        self.regions.push(Region::For { start, next, end, has_where });
    }

    pub fn for_where(&mut self) {
        let (start, end) = match self.regions.last() {
            Some(Region::For { start, end, .. }) => (*start, *end),
            _ => return self.misuse("for_where outside of a for"),
        };

        self.push_int(Int::ulong(0));
        self.label(start);
        // ARR IDX -- ARR IDX (IDX < LEN)
        self.emit(Opcode::Over, &[]);
        self.emit(Opcode::Sel, &[]);
        self.emit(Opcode::Over, &[]);
        self.emit(Opcode::Swap, &[]);
        self.emit(Opcode::Lt, &[]);
        self.jump(Opcode::Bz, end);
        self.emit(Opcode::PushF, &[]);
        self.emit(Opcode::Over, &[]);
        self.emit(Opcode::Over, &[]);
        self.emit(Opcode::Aref, &[]);
        self.emit(Opcode::Nip2, &[]);
        self.emit(Opcode::RegVar, &[]);
    }

    pub fn for_loop(&mut self) {
        match self.regions.last() {
            Some(Region::For { next, has_where: true, .. }) => {
                let next = *next;
                self.jump(Opcode::Bz, next);
            },
            Some(Region::For { .. }) => (),
            _ => self.misuse("for_loop outside of a for"),
        }
    }

    pub fn for_end(&mut self) {
        match self.regions.pop() {
            Some(Region::For { start, next, end, .. }) => {
                self.label(next);
                self.emit(Opcode::PopF, &[1]);
                self.push_int(Int::ulong(1));
                self.emit_int(Opcode::Add, 64, false);
                self.jump(Opcode::Ba, start);
                self.label(end);
                self.emit(Opcode::Drop, &[]);
                self.emit(Opcode::Drop, &[]);
            },
            _ => self.misuse("for_end outside of a for"),
        }
    }

    /// With the tag to catch on the stack:
    /// `try_`, code, `catch`, handler, `end_try`.
    /// If the handler takes an argument, it runs in a frame
    /// holding the raised condition at slot 0.
    pub fn try_(&mut self, arg: bool) {
        let (catch, end) = (self.fresh_label(), self.fresh_label());
        self.jump(Opcode::PushH, catch);
        self.regions.push(Region::Try { catch, end, arg });
    }

    pub fn catch(&mut self) {
        let (catch, end, arg) = match self.regions.last() {
            Some(Region::Try { catch, end, arg }) => (*catch, *end, *arg),
            _ => return self.misuse("catch outside of a try"),
        };

        self.emit(Opcode::PopH, &[]);
        self.jump(Opcode::Ba, end);
        self.label(catch);
        if arg {
            self.emit(Opcode::PushF, &[]);
            self.emit(Opcode::RegVar, &[]);
        } else {
            self.emit(Opcode::Drop, &[]);
        }
    }

    pub fn end_try(&mut self) {
        match self.regions.pop() {
            Some(Region::Try { end, arg, .. }) => {
                if arg {
                    self.emit(Opcode::PopF, &[1]);
                }
                self.label(end);
            },
            _ => self.misuse("end_try outside of a try"),
        }
    }

    /// How many values open for-in loops keep on the operand stack.
    pub fn loop_values(&self) -> usize {
        self.regions.iter().filter(|r| matches!(r, Region::For { .. })).count() * 2
    }

    /// Seals the program, resolving every label.
    pub fn finish(mut self) -> Result<Rc<Lambda>, CompileError> {
        if let Some(misuse) = self.misuse.take() {
            return Err(Syntax::error_no_note(&format!("assembler misuse: {}", misuse)).into());
        }
        if !self.regions.is_empty() {
            let reason = format!("{} structured regions left open", self.regions.len());
            return Err(Syntax::error_no_note(&reason).into());
        }
        if self.program {
            self.emit(Opcode::Exit, &[]);
        }

        let mut addresses = vec![None; self.labels];
        let mut size = 0;
        for insn in self.insns.iter() {
            match insn {
                Insn::Op(op, args) => {
                    if op.layout().len() != args.len() || op.layout().contains(&Arg::Address) {
                        let reason = format!("{:?} given {} operands", op, args.len());
                        return Err(Syntax::error_no_note(&reason).into());
                    }
                    size += 1 + args.iter().map(|a| split_number(*a).len()).sum::<usize>();
                },
                Insn::Jump(..) => size += 1 + ADDRESS_WIDTH,
                Insn::Label(Label(label)) => addresses[*label] = Some(size),
            }
        }

        let mut code = Vec::new();
        code.try_reserve_exact(size).map_err(|_| CompileError::Exhausted("assembling a program"))?;

        for insn in self.insns.iter() {
            match insn {
                Insn::Op(op, args) => {
                    code.push(*op as u8);
                    for arg in args {
                        code.extend(split_number(*arg));
                    }
                },
                Insn::Jump(op, Label(label)) => {
                    let address = addresses[*label]
                        .ok_or_else(|| Syntax::error_no_note(&format!("label {} never placed", label)))?;
                    code.push(*op as u8);
                    code.extend(split_address(address as u32));
                },
                Insn::Label(_) => (),
            }
        }

        Ok(Rc::new(Lambda { code, constants: self.constants, note: self.note }))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::number::{build_address, build_number};

    /// Decodes a program back into (opcode, operands) pairs.
    fn decode(lambda: &Lambda) -> Vec<(Opcode, Vec<usize>)> {
        let mut ip = 0;
        let mut out = vec![];
        while ip < lambda.code.len() {
            let op = Opcode::from_byte(lambda.code[ip]).unwrap();
            ip += 1;
            let mut args = vec![];
            for arg in op.layout() {
                match arg {
                    Arg::Number => {
                        let (n, eaten) = build_number(&lambda.code[ip..]).unwrap();
                        args.push(n);
                        ip += eaten;
                    },
                    Arg::Address => {
                        args.push(build_address(&lambda.code[ip..]).unwrap());
                        ip += ADDRESS_WIDTH;
                    },
                }
            }
            out.push((op, args));
        }
        out
    }

    #[test]
    fn if_else_layout() {
        let mut asm = Assembler::new(false);
        asm.push_int(Int::int(1));
        asm.if_();
        asm.then();
        asm.push_int(Int::int(2));
        asm.else_();
        asm.push_int(Int::int(3));
        asm.end_if();
        asm.emit(Opcode::Return, &[]);
        let lambda = asm.finish().unwrap();

        // push(2) bz(5) push(2) ba(5) push(2) return
        assert_eq!(decode(&lambda), vec![
            (Opcode::Push, vec![0]),
            (Opcode::Bz, vec![14]),
            (Opcode::Push, vec![1]),
            (Opcode::Ba, vec![16]),
            (Opcode::Push, vec![2]),
            (Opcode::Return, vec![]),
        ]);
    }

    #[test]
    fn constants_are_shared() {
        let mut asm = Assembler::new(true);
        asm.push(Data::string("x"));
        asm.push(Data::string("x"));
        asm.push(Data::Null);
        let lambda = asm.finish().unwrap();

        assert_eq!(lambda.constants.len(), 2);
        assert_eq!(decode(&lambda).last(), Some(&(Opcode::Exit, vec![])));
        assert_eq!(decode(&lambda).first(), Some(&(Opcode::Prolog, vec![])));
    }

    #[test]
    fn open_regions_are_an_error() {
        let mut asm = Assembler::new(false);
        asm.while_();
        assert!(matches!(asm.finish(), Err(CompileError::Internal(_))));

        let mut asm = Assembler::new(false);
        asm.catch();
        assert!(matches!(asm.finish(), Err(CompileError::Internal(_))));
    }

    #[test]
    fn loop_values() {
        let mut asm = Assembler::new(false);
        asm.for_(false);
        asm.while_();
        asm.for_(true);
        assert_eq!(asm.loop_values(), 4);
    }

    #[test]
    fn bad_arity() {
        let mut asm = Assembler::new(false);
        asm.emit(Opcode::PushVar, &[0]);
        assert!(asm.finish().is_err());
    }
}
