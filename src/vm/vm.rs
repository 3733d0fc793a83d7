use std::{cmp::Ordering, rc::Rc};

use log::{debug, warn};

use crate::common::{
    closure::Closure,
    config::Config,
    data::{Array, Data, Field, Int, Mapping, Offset, Struct},
    env::{Env, Frame},
    lambda::Lambda,
    number::{build_address, build_number, ADDRESS_WIDTH},
    opcode::Opcode,
};

use crate::vm::{
    ios::{decode_int, encode_int, Device, IoError},
    stack::{mismatch, Stack},
    trace::{Exception, Trace},
};

/// How deep calls may nest before the VM gives up on a program.
pub const MAX_DEPTH: usize = 256;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Ok,
    Error,
    DivByZero,
}

/// An installed `try` handler.
struct Handler {
    tag: i32,
    address: usize,
    /// Operand stack depth when the handler was installed.
    depth: usize,
    env: Env,
}

/// The state of one running closure.
struct Activation {
    closure: Rc<Closure>,
    ip: usize,
    env: Env,
    handlers: Vec<Handler>,
    rstack: Vec<Data>,
}

enum Control {
    Next,
    Return,
    Exit,
}

impl Activation {
    fn new(closure: Rc<Closure>) -> Activation {
        let env = Rc::clone(&closure.env);
        Activation { closure, ip: 0, env, handlers: vec![], rstack: vec![] }
    }

    fn remaining(&self) -> &[u8] {
        self.closure.lambda.code.get(self.ip..).unwrap_or(&[])
    }

    fn next_op(&mut self) -> Result<Opcode, Trace> {
        let byte = *self.remaining().first()
            .ok_or_else(|| Trace::fatal("ran past the end of the program"))?;
        self.ip += 1;
        Opcode::from_byte(byte).ok_or_else(|| Trace::fatal(&format!("invalid opcode {}", byte)))
    }

    /// Builds the next number in the bytecode stream.
    /// See `common::number` for more.
    fn next_number(&mut self) -> Result<usize, Trace> {
        let (number, eaten) = build_number(self.remaining())
            .ok_or_else(|| Trace::fatal("truncated operand"))?;
        self.ip += eaten;
        Ok(number)
    }

    fn next_address(&mut self) -> Result<usize, Trace> {
        let address = build_address(self.remaining())
            .ok_or_else(|| Trace::fatal("truncated branch target"))?;
        self.ip += ADDRESS_WIDTH;
        Ok(address)
    }

    /// The (size, signed) operands of an integer instruction.
    fn next_int_args(&mut self) -> Result<(u8, bool), Trace> {
        let size = self.next_number()?;
        let signed = self.next_number()? != 0;
        match u8::try_from(size) {
            Ok(size @ 1..=64) => Ok((size, signed)),
            _ => Err(Trace::fatal(&format!("integers can not be {} bits wide", size))),
        }
    }
}

fn raise(exception: Exception, message: &str) -> Trace {
    Trace::error(exception, message)
}

fn io_error(error: IoError) -> Trace {
    debug!("backing store: {}", error);
    match error {
        IoError::Eof => raise(Exception::Eof, "read past the end of the backing store"),
        other => raise(Exception::Io, &other.to_string()),
    }
}

/// Offsets handed to the backing store are counted in whole bytes.
fn byte_offset(offset: &Offset) -> Result<u64, Trace> {
    let bits = offset.in_bits();
    if bits < 0 || bits % 8 != 0 {
        return Err(raise(Exception::Io, &format!("offset of {} bits is not byte aligned", bits)));
    }
    u64::try_from(bits / 8).map_err(|_| raise(Exception::Io, "offset out of range"))
}

fn truth(value: bool) -> Data {
    Data::Int(Int::int(value as i32))
}

fn gcd(mut a: u128, mut b: u128) -> u128 {
    while b != 0 {
        let r = a % b;
        a = b;
        b = r;
    }
    a
}

fn compare(a: &Data, b: &Data) -> Option<Ordering> {
    match (a, b) {
        (Data::Int(a), Data::Int(b)) => Some(a.value().cmp(&b.value())),
        (Data::String(a), Data::String(b)) => Some(a.cmp(b)),
        (Data::Offset(a), Data::Offset(b)) => Some(a.in_bits().cmp(&b.in_bits())),
        _ => None,
    }
}

/// Fills an array of `nelem` elements from `(index, value)` initializers.
/// An element nobody initialized takes the value of the next
/// initializer after it, or of the last one if there is none.
fn fill(nelem: usize, mut inits: Vec<(usize, Data)>) -> Result<Vec<Data>, Trace> {
    if let Some((index, _)) = inits.iter().find(|(index, _)| *index >= nelem) {
        return Err(raise(Exception::OutOfBounds, &format!("initializer index {} out of bounds", index)));
    }
    inits.sort_by_key(|(index, _)| *index);

    let last = match inits.last() {
        Some((_, value)) => value.clone(),
        None if nelem == 0 => return Ok(vec![]),
        None => return Err(Trace::fatal("array of elements without initializers")),
    };

    let mut elems = Vec::with_capacity(nelem);
    let mut next = inits.iter().peekable();
    for position in 0..nelem {
        while next.peek().map_or(false, |(index, _)| *index < position) {
            next.next();
        }
        elems.push(next.peek().map_or_else(|| last.clone(), |(_, value)| value.clone()));
    }
    Ok(elems)
}

/// A `VM` executes bytecode lambdas.
/// Each VM's state is self-contained,
/// So more than one can be spawned if needed.
/// Top-level programs share one global frame,
/// which outlives every run.
pub struct VM {
    stack: Stack,
    globals: Env,
    config: Config,
    device: Option<Box<dyn Device>>,
    depth: usize,
    last_trace: Option<Trace>,
}

impl Default for VM {
    fn default() -> VM {
        VM::init()
    }
}

impl VM {
    /// Initialize a new VM.
    /// To run the VM, a lambda must be passed to it through `run`.
    pub fn init() -> VM {
        VM {
            stack: Stack::init(),
            globals: Frame::root(),
            config: Config::default(),
            device: None,
            depth: 0,
            last_trace: None,
        }
    }

    /// Opens a backing store, returning the one it replaces.
    pub fn open(&mut self, device: Box<dyn Device>) -> Option<Box<dyn Device>> {
        self.device.replace(device)
    }

    pub fn close(&mut self) -> Option<Box<dyn Device>> {
        self.device.take()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Takes effect from the next run on.
    pub fn set_config(&mut self, config: Config) {
        self.config = config;
    }

    pub fn globals(&self) -> &Env {
        &self.globals
    }

    /// The condition that ended the last run that did not end well.
    pub fn last_trace(&self) -> Option<&Trace> {
        self.last_trace.as_ref()
    }

    /// Flushes the backing store up to a byte offset.
    pub fn flush(&mut self, offset: u64) -> Result<(), IoError> {
        match self.device.as_mut() {
            Some(device) => device.flush(offset),
            None => Ok(()),
        }
    }

    /// Renders a value with integers in the configured output base.
    pub fn format(&self, data: &Data) -> String {
        match data {
            Data::Int(int) => self.config.format_int(int.value()),
            Data::Offset(offset) => {
                format!("{}#{}", self.config.format_int(offset.magnitude.value()), offset.unit)
            },
            Data::Array(array) => {
                let elems: Vec<String> = array.borrow().elems.iter().map(|e| self.format(e)).collect();
                format!("[{}]", elems.join(","))
            },
            Data::Struct(record) => {
                let fields: Vec<String> = record.borrow().fields.iter()
                    .map(|field| match &field.name {
                        Some(name) => format!("{}={}", name, self.format(&field.value)),
                        None => self.format(&field.value),
                    })
                    .collect();
                format!("struct {{{}}}", fields.join(","))
            },
            other => other.to_string(),
        }
    }

    /// Runs a top-level program in the global frame.
    /// The result is whatever the program left on the stack,
    /// unless that is null.
    pub fn run(&mut self, program: Rc<Lambda>) -> (Exit, Option<Data>) {
        let closure = Closure::wrap(program, Rc::clone(&self.globals));
        self.depth = 0;
        self.stack.clear();

        // a program leaves its result, if anything
        let result = self.execute(closure).and_then(|()| match self.stack.len() {
            0 | 1 => Ok(()),
            n => Err(Trace::fatal(&format!("program left {} values on the stack", n))),
        });
        let top = self.stack.pop().ok();
        self.stack.clear();

        match result {
            Ok(()) => (Exit::Ok, top.filter(|data| !data.is_null())),
            Err(trace) => {
                warn!("{}", trace);
                let exit = match trace.exception() {
                    Some(Exception::DivByZero) if !trace.is_fatal() => Exit::DivByZero,
                    _ => Exit::Error,
                };
                self.last_trace = Some(trace);
                (exit, None)
            },
        }
    }

    /// Calls a closure from outside any program,
    /// e.g. to re-map a value by hand.
    pub fn call(&mut self, closure: &Rc<Closure>, args: Vec<Data>) -> Result<Data, Trace> {
        let base = self.stack.len();
        for arg in args {
            self.stack.push(arg);
        }

        let result = self.invoke(Rc::clone(closure)).and_then(|()| self.stack.pop());
        self.stack.truncate(base);
        result
    }

    fn invoke(&mut self, closure: Rc<Closure>) -> Result<(), Trace> {
        if self.depth >= MAX_DEPTH {
            return Err(Trace::fatal("maximum call depth exceeded"));
        }
        self.depth += 1;
        let result = self.execute(closure);
        self.depth -= 1;
        result
    }

    /// Runs a closure until it returns or exits.
    /// Conditions it does not catch itself unwind into the caller.
    fn execute(&mut self, closure: Rc<Closure>) -> Result<(), Trace> {
        let mut frame = Activation::new(closure);

        loop {
            match self.step(&mut frame) {
                Ok(Control::Next) => (),
                Ok(Control::Return) | Ok(Control::Exit) => return Ok(()),
                Err(trace) => self.catch(&mut frame, trace)?,
            }
        }
    }

    /// Hands a condition to the innermost handler that takes it,
    /// dropping that handler and every handler inside it.
    fn catch(&mut self, frame: &mut Activation, trace: Trace) -> Result<(), Trace> {
        let index = match frame.handlers.iter().rposition(|h| trace.caught_by(h.tag)) {
            Some(index) => index,
            None => return Err(trace.unwind(frame.closure.lambda.name())),
        };

        frame.handlers.truncate(index + 1);
        if let Some(handler) = frame.handlers.pop() {
            self.stack.truncate(handler.depth);
            self.stack.push(Data::Int(Int::int(trace.code())));
            frame.env = handler.env;
            frame.ip = handler.address;
        }
        Ok(())
    }

    // core interpreter loop

    /// Dissasembles and interprets a single (potentially fallible) bytecode op.
    /// The op definitions follow in the proceeding impl block.
    fn step(&mut self, frame: &mut Activation) -> Result<Control, Trace> {
        let opcode = frame.next_op()?;

        match opcode {
            Opcode::Push     => self.con(frame),
            Opcode::Drop     => self.stack.pop().map(|_| Control::Next),
            Opcode::Dup      => self.dup(),
            Opcode::Swap     => self.swap(),
            Opcode::Nip      => self.nip(1),
            Opcode::Nip2     => self.nip(2),
            Opcode::Over     => self.over(),
            Opcode::Rot      => self.rot(),
            Opcode::Nrot     => self.nrot(),
            Opcode::Revn     => self.revn(frame),
            Opcode::Tor      => self.tor(frame),
            Opcode::Fromr    => self.fromr(frame),

            Opcode::PushF    => self.push_frame(frame),
            Opcode::PopF     => self.pop_frame(frame),
            Opcode::RegVar   => self.reg_var(frame),
            Opcode::PushVar  => self.push_var(frame),
            Opcode::PopVar   => self.pop_var(frame),

            Opcode::Pec      => self.pec(frame),
            Opcode::PushSelf => self.push_self(frame),
            Opcode::Call     => self.call_closure(),
            Opcode::Prolog   => self.done(),
            Opcode::Return   => Ok(Control::Return),
            Opcode::Exit     => Ok(Control::Exit),

            Opcode::Ba       => self.branch(frame),
            Opcode::Bz       => self.branch_zero(frame),
            Opcode::Bn       => self.branch_null(frame, true),
            Opcode::Bnn      => self.branch_null(frame, false),

            Opcode::PushH    => self.push_handler(frame),
            Opcode::PopH     => self.pop_handler(frame),
            Opcode::Raise    => self.raise(),

            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod
            | Opcode::Band | Opcode::Bor | Opcode::Bxor | Opcode::Sl | Opcode::Sr
                => self.binary(frame, opcode),
            Opcode::Neg | Opcode::Bnot => self.unary(frame, opcode),

            Opcode::And      => self.logical(|a, b| a && b),
            Opcode::Or       => self.logical(|a, b| a || b),
            Opcode::Not      => self.not(),

            Opcode::Eq | Opcode::Ne | Opcode::Lt | Opcode::Gt | Opcode::Le | Opcode::Ge
                => self.relational(opcode),

            Opcode::Nton     => self.nton(frame),
            Opcode::Bconc    => self.bconc(frame),
            Opcode::Sconc    => self.sconc(),

            Opcode::Mko      => self.mko(),
            Opcode::Ogetm    => self.ogetm(),
            Opcode::Ogetu    => self.ogetu(),
            Opcode::Ogetmc   => self.ogetmc(frame),
            Opcode::Gcd      => self.gcd(),

            Opcode::Mka      => self.mka(frame),
            Opcode::Apush    => self.apush(),
            Opcode::Aref     => self.aref(),
            Opcode::Aset     => self.aset(),

            Opcode::Mksct    => self.mksct(frame),
            Opcode::Sref     => self.sref(false),
            Opcode::Srefnt   => self.sref(true),
            Opcode::Srefi    => self.srefi(),
            Opcode::Sset     => self.sset(),

            Opcode::Sel      => self.sel(),
            Opcode::Siz      => self.siz(),

            Opcode::Mgeto    => self.mget(|m| Data::Offset(m.offset)),
            Opcode::Mgetm    => self.mget(|m| Data::Closure(Rc::clone(&m.mapper))),
            Opcode::Mgetw    => self.mget(|m| Data::Closure(Rc::clone(&m.writer))),
            Opcode::Mset     => self.mset(),
            Opcode::Remap    => self.remap(),
            Opcode::Write    => self.write(),

            Opcode::Peekd    => self.peekd(frame),
            Opcode::Poked    => self.poked(frame),
            Opcode::Peeks    => self.peeks(),
            Opcode::Pokes    => self.pokes(),
            Opcode::Iosize   => self.iosize(),
        }
    }

    fn done(&mut self) -> Result<Control, Trace> {
        Ok(Control::Next)
    }

    fn device(&mut self) -> Result<&mut Box<dyn Device>, Trace> {
        self.device.as_mut().ok_or_else(|| raise(Exception::NoIos, "no backing store is open"))
    }
}

// stack shuffling
impl VM {
    /// Load a constant and push it onto the stack.
    fn con(&mut self, frame: &mut Activation) -> Result<Control, Trace> {
        let index = frame.next_number()?;
        let data = frame.closure.lambda.constant(index)
            .ok_or_else(|| Trace::fatal(&format!("no constant at index {}", index)))?
            .clone();
        self.stack.push(data);
        self.done()
    }

    fn dup(&mut self) -> Result<Control, Trace> {
        let top = self.stack.peek(0)?.clone();
        self.stack.push(top);
        self.done()
    }

    fn swap(&mut self) -> Result<Control, Trace> {
        let b = self.stack.pop()?;
        let a = self.stack.pop()?;
        self.stack.push(b);
        self.stack.push(a);
        self.done()
    }

    /// Drops the `count` values under the top.
    fn nip(&mut self, count: usize) -> Result<Control, Trace> {
        let top = self.stack.pop()?;
        for _ in 0..count {
            self.stack.pop()?;
        }
        self.stack.push(top);
        self.done()
    }

    fn over(&mut self) -> Result<Control, Trace> {
        let under = self.stack.peek(1)?.clone();
        self.stack.push(under);
        self.done()
    }

    fn rot(&mut self) -> Result<Control, Trace> {
        let c = self.stack.pop()?;
        let b = self.stack.pop()?;
        let a = self.stack.pop()?;
        self.stack.push(b);
        self.stack.push(c);
        self.stack.push(a);
        self.done()
    }

    fn nrot(&mut self) -> Result<Control, Trace> {
        let c = self.stack.pop()?;
        let b = self.stack.pop()?;
        let a = self.stack.pop()?;
        self.stack.push(c);
        self.stack.push(a);
        self.stack.push(b);
        self.done()
    }

    fn revn(&mut self, frame: &mut Activation) -> Result<Control, Trace> {
        let count = frame.next_number()?;
        self.stack.reverse(count)?;
        self.done()
    }

    fn tor(&mut self, frame: &mut Activation) -> Result<Control, Trace> {
        frame.rstack.push(self.stack.pop()?);
        self.done()
    }

    fn fromr(&mut self, frame: &mut Activation) -> Result<Control, Trace> {
        let data = frame.rstack.pop().ok_or_else(|| Trace::fatal("return stack underflow"))?;
        self.stack.push(data);
        self.done()
    }
}

// environments, closures and control
impl VM {
    fn push_frame(&mut self, frame: &mut Activation) -> Result<Control, Trace> {
        frame.env = Frame::push(&frame.env);
        self.done()
    }

    fn pop_frame(&mut self, frame: &mut Activation) -> Result<Control, Trace> {
        for _ in 0..frame.next_number()? {
            let parent = frame.env.parent().cloned()
                .ok_or_else(|| Trace::fatal("popped the outermost frame"))?;
            frame.env = parent;
        }
        self.done()
    }

    fn reg_var(&mut self, frame: &mut Activation) -> Result<Control, Trace> {
        frame.env.register(self.stack.pop()?);
        self.done()
    }

    fn push_var(&mut self, frame: &mut Activation) -> Result<Control, Trace> {
        let back = frame.next_number()?;
        let over = frame.next_number()?;
        let data = Frame::lookup(&frame.env, back, over)
            .ok_or_else(|| Trace::fatal(&format!("no variable at ({}, {})", back, over)))?;
        self.stack.push(data);
        self.done()
    }

    fn pop_var(&mut self, frame: &mut Activation) -> Result<Control, Trace> {
        let back = frame.next_number()?;
        let over = frame.next_number()?;
        let data = self.stack.pop()?;
        Frame::assign(&frame.env, back, over, data)
            .ok_or_else(|| Trace::fatal(&format!("no variable at ({}, {})", back, over)))?;
        self.done()
    }

    fn pec(&mut self, frame: &mut Activation) -> Result<Control, Trace> {
        let lambda = match self.stack.pop()? {
            Data::Lambda(lambda) => lambda,
            other => return Err(mismatch("a program", &other)),
        };
        self.stack.push(Data::Closure(Closure::wrap(lambda, Rc::clone(&frame.env))));
        self.done()
    }

    fn push_self(&mut self, frame: &mut Activation) -> Result<Control, Trace> {
        self.stack.push(Data::Closure(Rc::clone(&frame.closure)));
        self.done()
    }

    /// Calls the closure on top of the stack.
    /// Its arguments are already on the stack; its result is left there.
    fn call_closure(&mut self) -> Result<Control, Trace> {
        let closure = self.stack.pop_closure()?;
        self.invoke(closure)?;
        self.done()
    }

    fn branch(&mut self, frame: &mut Activation) -> Result<Control, Trace> {
        frame.ip = frame.next_address()?;
        self.done()
    }

    fn branch_zero(&mut self, frame: &mut Activation) -> Result<Control, Trace> {
        let address = frame.next_address()?;
        if !self.stack.pop_int()?.is_true() {
            frame.ip = address;
        }
        self.done()
    }

    fn branch_null(&mut self, frame: &mut Activation, on_null: bool) -> Result<Control, Trace> {
        let address = frame.next_address()?;
        if self.stack.peek(0)?.is_null() == on_null {
            frame.ip = address;
        }
        self.done()
    }

    fn push_handler(&mut self, frame: &mut Activation) -> Result<Control, Trace> {
        let address = frame.next_address()?;
        let tag = self.stack.pop_int()?;
        let tag = i32::try_from(tag.value()).map_err(|_| Trace::fatal("handler tag out of range"))?;
        frame.handlers.push(Handler {
            tag,
            address,
            depth: self.stack.len(),
            env: Rc::clone(&frame.env),
        });
        self.done()
    }

    fn pop_handler(&mut self, frame: &mut Activation) -> Result<Control, Trace> {
        frame.handlers.pop().ok_or_else(|| Trace::fatal("no handler to remove"))?;
        self.done()
    }

    fn raise(&mut self) -> Result<Control, Trace> {
        let code = self.stack.pop_int()?;
        let code = i32::try_from(code.value()).map_err(|_| Trace::fatal("condition code out of range"))?;
        Err(Trace::raised(code))
    }
}

// integers, strings and offsets
impl VM {
    fn binary(&mut self, frame: &mut Activation, op: Opcode) -> Result<Control, Trace> {
        let (size, signed) = frame.next_int_args()?;
        let b = self.stack.pop_int()?;
        let a = self.stack.pop_int()?;
        let result = match Int::binary(op, a, b, size, signed) {
            Some(result) => result,
            None if matches!(op, Opcode::Div | Opcode::Mod) => {
                return Err(raise(Exception::DivByZero, "division by zero"));
            },
            None => return Err(Trace::fatal(&format!("{:?} is not an integer operation", op))),
        };
        self.stack.push(Data::Int(result));
        self.done()
    }

    fn unary(&mut self, frame: &mut Activation, op: Opcode) -> Result<Control, Trace> {
        let (size, signed) = frame.next_int_args()?;
        let a = self.stack.pop_int()?;
        let result = Int::unary(op, a, size, signed)
            .ok_or_else(|| Trace::fatal(&format!("{:?} is not an integer operation", op)))?;
        self.stack.push(Data::Int(result));
        self.done()
    }

    fn logical(&mut self, op: fn(bool, bool) -> bool) -> Result<Control, Trace> {
        let b = self.stack.pop_int()?.is_true();
        let a = self.stack.pop_int()?.is_true();
        self.stack.push(truth(op(a, b)));
        self.done()
    }

    fn not(&mut self) -> Result<Control, Trace> {
        let a = self.stack.pop_int()?.is_true();
        self.stack.push(truth(!a));
        self.done()
    }

    fn relational(&mut self, op: Opcode) -> Result<Control, Trace> {
        let b = self.stack.pop()?;
        let a = self.stack.pop()?;
        let ordering = compare(&a, &b);

        let result = match (op, ordering) {
            (Opcode::Eq, None) => a == b,
            (Opcode::Ne, None) => a != b,
            (_, None) => {
                return Err(Trace::fatal(&format!("can not order {} and {}", a.kind(), b.kind())));
            },
            (Opcode::Eq, Some(o)) => o == Ordering::Equal,
            (Opcode::Ne, Some(o)) => o != Ordering::Equal,
            (Opcode::Lt, Some(o)) => o == Ordering::Less,
            (Opcode::Gt, Some(o)) => o == Ordering::Greater,
            (Opcode::Le, Some(o)) => o != Ordering::Greater,
            (_, Some(o)) => o != Ordering::Less,
        };
        self.stack.push(truth(result));
        self.done()
    }

    fn nton(&mut self, frame: &mut Activation) -> Result<Control, Trace> {
        let (size, signed) = frame.next_int_args()?;
        let int = self.stack.pop_int()?;
        self.stack.push(Data::Int(int.convert(size, signed)));
        self.done()
    }

    /// Concatenates the bits of two integers, the second in the low `rsize` bits.
    fn bconc(&mut self, frame: &mut Activation) -> Result<Control, Trace> {
        let (size, signed) = frame.next_int_args()?;
        let rsize = frame.next_number()?.min(64) as u32;
        let b = self.stack.pop_int()?;
        let a = self.stack.pop_int()?;
        let value = (a.value() << rsize) | b.bits() as i128;
        self.stack.push(Data::Int(Int::new(value, size, signed)));
        self.done()
    }

    fn sconc(&mut self) -> Result<Control, Trace> {
        let b = self.stack.pop_string()?;
        let a = self.stack.pop_string()?;
        self.stack.push(Data::string(&format!("{}{}", a, b)));
        self.done()
    }

    fn mko(&mut self) -> Result<Control, Trace> {
        let unit = self.stack.pop_int()?;
        let magnitude = self.stack.pop_int()?;
        let unit = match u64::try_from(unit.value()) {
            Ok(unit) if unit > 0 => unit,
            _ => return Err(raise(Exception::Conversion, "offset units must be positive")),
        };
        self.stack.push(Data::Offset(Offset::new(magnitude, unit)));
        self.done()
    }

    fn ogetm(&mut self) -> Result<Control, Trace> {
        let offset = self.stack.pop_offset()?;
        self.stack.push(Data::Int(offset.magnitude));
        self.done()
    }

    fn ogetu(&mut self) -> Result<Control, Trace> {
        let offset = self.stack.pop_offset()?;
        self.stack.push(Data::Int(Int::ulong(offset.unit)));
        self.done()
    }

    /// The magnitude of an offset counted in another unit.
    fn ogetmc(&mut self, frame: &mut Activation) -> Result<Control, Trace> {
        let (size, signed) = frame.next_int_args()?;
        let unit = self.stack.pop_int()?.value();
        let offset = self.stack.pop_offset()?;
        let magnitude = offset.in_bits().checked_div(unit)
            .ok_or_else(|| raise(Exception::DivByZero, "offset unit of zero"))?;
        self.stack.push(Data::Int(Int::new(magnitude, size, signed)));
        self.done()
    }

    fn gcd(&mut self) -> Result<Control, Trace> {
        let b = self.stack.pop_int()?.value().unsigned_abs();
        let a = self.stack.pop_int()?.value().unsigned_abs();
        self.stack.push(Data::Int(Int::ulong(gcd(a, b) as u64)));
        self.done()
    }
}

// arrays and structs
impl VM {
    fn mka(&mut self, frame: &mut Activation) -> Result<Control, Trace> {
        let nelem = frame.next_number()?;
        let ninit = frame.next_number()?;

        let mut inits = Vec::with_capacity(ninit);
        for _ in 0..ninit {
            let value = self.stack.pop()?;
            let index = self.stack.pop_index()?
                .ok_or_else(|| raise(Exception::OutOfBounds, "negative initializer index"))?;
            inits.push((index, value));
        }

        let elems = fill(nelem, inits)?;
        self.stack.push(Data::array(elems));
        self.done()
    }

    fn array(&self, depth: usize) -> Result<Rc<std::cell::RefCell<Array>>, Trace> {
        match self.stack.peek(depth)? {
            Data::Array(array) => Ok(Rc::clone(array)),
            other => Err(mismatch("an array", other)),
        }
    }

    fn record(&self, depth: usize) -> Result<Rc<std::cell::RefCell<Struct>>, Trace> {
        match self.stack.peek(depth)? {
            Data::Struct(record) => Ok(Rc::clone(record)),
            other => Err(mismatch("a struct", other)),
        }
    }

    fn index(&self, depth: usize) -> Result<Option<usize>, Trace> {
        match self.stack.peek(depth)? {
            Data::Int(int) => Ok(usize::try_from(int.value()).ok()),
            other => Err(mismatch("an integer", other)),
        }
    }

    fn apush(&mut self) -> Result<Control, Trace> {
        let value = self.stack.pop()?;
        self.array(0)?.borrow_mut().elems.push(value);
        self.done()
    }

    fn aref(&mut self) -> Result<Control, Trace> {
        let array = self.array(1)?;
        let index = self.index(0)?;
        let value = index
            .and_then(|index| array.borrow().elems.get(index).cloned())
            .ok_or_else(|| raise(Exception::OutOfBounds, "array index out of bounds"))?;
        self.stack.push(value);
        self.done()
    }

    fn aset(&mut self) -> Result<Control, Trace> {
        let value = self.stack.pop()?;
        let index = self.stack.pop_index()?;
        let array = self.array(0)?;
        let mut array = array.borrow_mut();
        let slot = index
            .and_then(|index| array.elems.get_mut(index))
            .ok_or_else(|| raise(Exception::OutOfBounds, "array index out of bounds"))?;
        *slot = value;
        self.done()
    }

    fn mksct(&mut self, frame: &mut Activation) -> Result<Control, Trace> {
        let count = frame.next_number()?;
        let mut fields = Vec::with_capacity(count);
        for _ in 0..count {
            let value = self.stack.pop()?;
            let name = match self.stack.pop()? {
                Data::Null => None,
                Data::String(name) => Some(name),
                other => return Err(mismatch("a field name", &other)),
            };
            fields.push(Field { name, value });
        }
        fields.reverse();
        self.stack.push(Data::record(fields));
        self.done()
    }

    /// Looks a field up by name.
    /// A missing field is an error, unless `or_null` is set.
    fn sref(&mut self, or_null: bool) -> Result<Control, Trace> {
        let record = self.record(1)?;
        let name = match self.stack.peek(0)? {
            Data::String(name) => Rc::clone(name),
            other => return Err(mismatch("a field name", other)),
        };

        let value = record.borrow().field(&name).cloned();
        let value = match value {
            Some(value) => value,
            None if or_null => Data::Null,
            None => return Err(raise(Exception::Elem, &format!("no field named {}", name))),
        };
        self.stack.push(value);
        self.done()
    }

    fn srefi(&mut self) -> Result<Control, Trace> {
        let record = self.record(1)?;
        let index = self.index(0)?;
        let value = index
            .and_then(|index| record.borrow().fields.get(index).map(|f| f.value.clone()))
            .ok_or_else(|| raise(Exception::OutOfBounds, "field index out of bounds"))?;
        self.stack.push(value);
        self.done()
    }

    fn sset(&mut self) -> Result<Control, Trace> {
        let value = self.stack.pop()?;
        let name = self.stack.pop_string()?;
        let record = self.record(0)?;
        let mut record = record.borrow_mut();
        let field = record.fields.iter_mut()
            .find(|f| f.name.as_deref() == Some(&*name))
            .ok_or_else(|| raise(Exception::Elem, &format!("no field named {}", name)))?;
        field.value = value;
        self.done()
    }

    fn sel(&mut self) -> Result<Control, Trace> {
        let length = match self.stack.pop()? {
            Data::Array(array) => array.borrow().elems.len(),
            Data::Struct(record) => record.borrow().fields.len(),
            Data::String(string) => string.len(),
            other => return Err(mismatch("something with a length", &other)),
        };
        self.stack.push(Data::Int(Int::ulong(length as u64)));
        self.done()
    }

    fn siz(&mut self) -> Result<Control, Trace> {
        let data = self.stack.pop()?;
        let bits = data.size_in_bits().ok_or_else(|| mismatch("a value with a stored form", &data))?;
        self.stack.push(Data::Offset(Offset::bits(bits)));
        self.done()
    }
}

// mapping
impl VM {
    /// Pushes a part of the top value's mapping, or null.
    fn mget(&mut self, part: fn(&Mapping) -> Data) -> Result<Control, Trace> {
        let data = self.stack.peek(0)?.mapping().map_or(Data::Null, |m| part(&m));
        self.stack.push(data);
        self.done()
    }

    /// Copies the value with a new mapping.
    /// Without a mapper, writer and offset the copy is unmapped.
    fn mset(&mut self) -> Result<Control, Trace> {
        let writer = self.stack.pop_optional_closure()?;
        let mapper = self.stack.pop_optional_closure()?;
        let offset = match self.stack.pop()? {
            Data::Null => None,
            Data::Offset(offset) => Some(offset),
            other => return Err(mismatch("an offset", &other)),
        };
        let data = self.stack.pop()?;

        let mapping = match (offset, mapper, writer) {
            (Some(offset), Some(mapper), Some(writer)) => Some(Mapping { offset, mapper, writer }),
            _ => None,
        };

        let copy = match data {
            Data::Array(array) => {
                let elems = array.borrow().elems.clone();
                Data::Array(Rc::new(std::cell::RefCell::new(Array { elems, mapping })))
            },
            Data::Struct(record) => {
                let fields = record.borrow().fields.clone();
                Data::Struct(Rc::new(std::cell::RefCell::new(Struct { fields, mapping })))
            },
            scalar => scalar,
        };
        self.stack.push(copy);
        self.done()
    }

    /// Decodes a mapped value again from where it was mapped.
    fn remap(&mut self) -> Result<Control, Trace> {
        let data = self.stack.pop()?;
        match data.mapping() {
            Some(mapping) => {
                self.stack.push(Data::Offset(mapping.offset));
                self.invoke(mapping.mapper)?;
            },
            None => self.stack.push(data),
        }
        self.done()
    }

    /// Encodes a mapped value back to where it was mapped.
    fn write(&mut self) -> Result<Control, Trace> {
        let data = self.stack.peek(0)?.clone();
        if let Some(mapping) = data.mapping() {
            self.stack.push(Data::Offset(mapping.offset));
            self.stack.push(data);
            self.invoke(mapping.writer)?;
            self.stack.pop()?;
        }
        self.done()
    }
}

// the backing store
impl VM {
    fn whole_bytes(size: u8) -> Result<usize, Trace> {
        if size % 8 != 0 {
            return Err(raise(Exception::Io, &format!("can not store a {} bit integer", size)));
        }
        Ok(size as usize / 8)
    }

    fn peekd(&mut self, frame: &mut Activation) -> Result<Control, Trace> {
        let (size, signed) = frame.next_int_args()?;
        let offset = byte_offset(&self.stack.pop_offset()?)?;
        let mut bytes = vec![0; VM::whole_bytes(size)?];
        self.device()?.read(offset, &mut bytes).map_err(io_error)?;

        let int = decode_int(&bytes, signed, &self.config);
        self.stack.push(Data::Int(int));
        self.done()
    }

    fn poked(&mut self, frame: &mut Activation) -> Result<Control, Trace> {
        let (size, signed) = frame.next_int_args()?;
        let int = self.stack.pop_int()?.convert(size, signed);
        let offset = byte_offset(&self.stack.pop_offset()?)?;
        VM::whole_bytes(size)?;

        let bytes = encode_int(int, &self.config);
        self.device()?.write(offset, &bytes).map_err(io_error)?;
        self.done()
    }

    fn peeks(&mut self) -> Result<Control, Trace> {
        let mut offset = byte_offset(&self.stack.pop_offset()?)?;
        let device = self.device()?;

        let mut bytes = vec![];
        let mut byte = [0];
        loop {
            device.read(offset, &mut byte).map_err(io_error)?;
            if byte[0] == 0 { break; }
            bytes.push(byte[0]);
            offset += 1;
        }

        let string = String::from_utf8_lossy(&bytes);
        self.stack.push(Data::string(&string));
        self.done()
    }

    fn pokes(&mut self) -> Result<Control, Trace> {
        let string = self.stack.pop_string()?;
        let offset = byte_offset(&self.stack.pop_offset()?)?;
        let mut bytes = string.as_bytes().to_vec();
        bytes.push(0);
        self.device()?.write(offset, &bytes).map_err(io_error)?;
        self.done()
    }

    fn iosize(&mut self) -> Result<Control, Trace> {
        let size = self.device()?.size();
        self.stack.push(Data::Offset(Offset::bytes(size)));
        self.done()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::cell::RefCell;
    use crate::{
        common::config::{Endian, NegEncoding},
        compiler::asm::Assembler,
        vm::ios::MemoryDevice,
    };

    fn int(value: i32) -> Data {
        Data::Int(Int::int(value))
    }

    fn run(asm: Assembler) -> (Exit, Option<Data>) {
        VM::init().run(asm.finish().unwrap())
    }

    #[test]
    fn arithmetic() {
        let mut asm = Assembler::new(true);
        asm.push(int(6));
        asm.push(int(7));
        asm.emit_int(Opcode::Mul, 32, true);
        asm.push(int(2));
        asm.emit_int(Opcode::Sub, 32, true);
        assert_eq!(run(asm), (Exit::Ok, Some(int(40))));
    }

    #[test]
    fn unbalanced_programs() {
        let mut asm = Assembler::new(true);
        asm.push(int(1));
        asm.push(int(2));

        let mut vm = VM::init();
        assert_eq!(vm.run(asm.finish().unwrap()), (Exit::Error, None));
        assert!(vm.last_trace().unwrap().is_fatal());
    }

    #[test]
    fn null_is_no_result() {
        let mut asm = Assembler::new(true);
        asm.push(Data::Null);
        assert_eq!(run(asm), (Exit::Ok, None));
    }

    #[test]
    fn division_by_zero() {
        let mut asm = Assembler::new(true);
        asm.push(int(1));
        asm.push(int(0));
        asm.emit_int(Opcode::Div, 32, true);

        let mut vm = VM::init();
        assert_eq!(vm.run(asm.finish().unwrap()), (Exit::DivByZero, None));
        let trace = vm.last_trace().unwrap();
        assert_eq!(trace.exception(), Some(Exception::DivByZero));
        assert!(trace.to_string().contains("Runtime Division By Zero"));
    }

    #[test]
    fn caught_conditions() {
        let mut asm = Assembler::new(true);
        asm.push(int(-1));
        asm.emit(Opcode::RegVar, &[]);
        asm.push(int(0));
        asm.try_(true);
        asm.push(int(Exception::Elem.code()));
        asm.emit(Opcode::Raise, &[]);
        asm.catch();
        asm.emit(Opcode::PushVar, &[0, 0]);
        asm.emit(Opcode::PopVar, &[1, 0]);
        asm.end_try();
        asm.emit(Opcode::PushVar, &[0, 0]);
        assert_eq!(run(asm), (Exit::Ok, Some(int(Exception::Elem.code()))));
    }

    #[test]
    fn mismatched_tags_propagate() {
        let mut asm = Assembler::new(true);
        asm.push(int(Exception::Eof.code()));
        asm.try_(false);
        asm.push(int(Exception::Constraint.code()));
        asm.emit(Opcode::Raise, &[]);
        asm.catch();
        asm.end_try();

        let mut vm = VM::init();
        assert_eq!(vm.run(asm.finish().unwrap()), (Exit::Error, None));
        assert_eq!(vm.last_trace().unwrap().exception(), Some(Exception::Constraint));
    }

    #[test]
    fn handlers_restore_the_stack() {
        let mut asm = Assembler::new(true);
        asm.push(int(0));
        asm.try_(false);
        asm.push(int(1));
        asm.push(int(2));
        asm.push(int(3));
        asm.emit(Opcode::Raise, &[]);
        asm.catch();
        asm.end_try();
        asm.push(int(9));
        assert_eq!(run(asm), (Exit::Ok, Some(int(9))));
    }

    #[test]
    fn closures_share_the_stack() {
        // (a, b) -> a - b
        let mut callee = Assembler::new(false);
        callee.emit(Opcode::Prolog, &[]);
        callee.emit(Opcode::PushF, &[]);
        callee.emit(Opcode::Revn, &[2]);
        callee.emit(Opcode::RegVar, &[]);
        callee.emit(Opcode::RegVar, &[]);
        callee.emit(Opcode::PushVar, &[0, 0]);
        callee.emit(Opcode::PushVar, &[0, 1]);
        callee.emit_int(Opcode::Sub, 32, true);
        callee.emit(Opcode::PopF, &[1]);
        callee.emit(Opcode::Return, &[]);

        let mut asm = Assembler::new(true);
        asm.push(int(10));
        asm.push(int(3));
        asm.push(Data::Lambda(callee.finish().unwrap()));
        asm.emit(Opcode::Pec, &[]);
        asm.emit(Opcode::Call, &[]);
        assert_eq!(run(asm), (Exit::Ok, Some(int(7))));
    }

    #[test]
    fn runaway_recursion_is_fatal() {
        let mut callee = Assembler::new(false);
        callee.emit(Opcode::PushSelf, &[]);
        callee.emit(Opcode::Call, &[]);
        callee.emit(Opcode::Return, &[]);

        let mut asm = Assembler::new(true);
        asm.push(int(0));
        asm.try_(false);
        asm.push(Data::Lambda(callee.finish().unwrap()));
        asm.emit(Opcode::Pec, &[]);
        asm.emit(Opcode::Call, &[]);
        asm.emit(Opcode::Drop, &[]);
        asm.catch();
        asm.end_try();

        let mut vm = VM::init();
        assert_eq!(vm.run(asm.finish().unwrap()), (Exit::Error, None));
        assert!(vm.last_trace().unwrap().is_fatal());
    }

    #[test]
    fn array_gaps() {
        let elems = fill(5, vec![(1, int(10)), (3, int(30))]).unwrap();
        assert_eq!(elems, vec![int(10), int(10), int(30), int(30), int(30)]);
        assert!(fill(2, vec![(2, int(0))]).is_err());
        assert_eq!(fill(0, vec![]).unwrap(), vec![]);
    }

    #[test]
    fn fields() {
        let mut asm = Assembler::new(true);
        asm.push(Data::string("a"));
        asm.push(int(1));
        asm.push(Data::Null);
        asm.push(int(2));
        asm.emit(Opcode::Mksct, &[2]);
        asm.push(Data::string("a"));
        asm.push(int(5));
        asm.emit(Opcode::Sset, &[]);
        asm.push(Data::string("b"));
        asm.emit(Opcode::Srefnt, &[]);
        asm.emit(Opcode::Nip, &[]);
        asm.emit(Opcode::Nip, &[]);
        assert_eq!(run(asm), (Exit::Ok, None));

        let mut asm = Assembler::new(true);
        asm.push(Data::string("a"));
        asm.push(int(1));
        asm.emit(Opcode::Mksct, &[1]);
        asm.push(Data::string("b"));
        asm.emit(Opcode::Sref, &[]);

        let mut vm = VM::init();
        assert_eq!(vm.run(asm.finish().unwrap()).0, Exit::Error);
        assert_eq!(vm.last_trace().unwrap().exception(), Some(Exception::Elem));
    }

    #[test]
    fn offsets() {
        // 3 bytes in units of 4 bits
        let mut asm = Assembler::new(true);
        asm.push_int(Int::ulong(3));
        asm.push_int(Int::ulong(8));
        asm.emit(Opcode::Mko, &[]);
        asm.push_int(Int::ulong(4));
        asm.emit_int(Opcode::Ogetmc, 64, false);
        assert_eq!(run(asm), (Exit::Ok, Some(Data::Int(Int::ulong(6)))));

        let mut asm = Assembler::new(true);
        asm.push_int(Int::ulong(12));
        asm.push_int(Int::ulong(18));
        asm.emit(Opcode::Gcd, &[]);
        assert_eq!(run(asm), (Exit::Ok, Some(Data::Int(Int::ulong(6)))));
    }

    #[test]
    fn backing_store() {
        let device = Rc::new(RefCell::new(MemoryDevice::zeroed(8)));
        let mut vm = VM::init();
        vm.set_config(Config { endian: Endian::Little, nenc: NegEncoding::TwosComplement, ..Config::default() });
        vm.open(Box::new(Rc::clone(&device)));

        let mut asm = Assembler::new(true);
        asm.push(Data::Offset(Offset::bytes(2)));
        asm.push_int(Int::new(0x0102, 16, false));
        asm.emit_int(Opcode::Poked, 16, false);
        asm.push(Data::Offset(Offset::bytes(2)));
        asm.emit_int(Opcode::Peekd, 8, false);
        assert_eq!(vm.run(asm.finish().unwrap()), (Exit::Ok, Some(Data::Int(Int::new(2, 8, false)))));
        assert_eq!(device.borrow().bytes(), &[0, 0, 2, 1, 0, 0, 0, 0]);

        let mut asm = Assembler::new(true);
        asm.push(Data::Offset(Offset::bytes(4)));
        asm.push(Data::string("hi"));
        asm.emit(Opcode::Pokes, &[]);
        asm.push(Data::Offset(Offset::bytes(4)));
        asm.emit(Opcode::Peeks, &[]);
        assert_eq!(vm.run(asm.finish().unwrap()), (Exit::Ok, Some(Data::string("hi"))));

        vm.flush(6).unwrap();
        assert_eq!(device.borrow().flushed(), 6);
    }

    #[test]
    fn backing_store_conditions() {
        let mut asm = Assembler::new(true);
        asm.push(Data::Offset(Offset::bytes(0)));
        asm.emit_int(Opcode::Peekd, 8, false);

        let mut vm = VM::init();
        vm.run(asm.finish().unwrap());
        assert_eq!(vm.last_trace().unwrap().exception(), Some(Exception::NoIos));

        vm.open(Box::new(MemoryDevice::zeroed(4)));
        let mut asm = Assembler::new(true);
        asm.push(Data::Offset(Offset::bits(4)));
        asm.emit_int(Opcode::Peekd, 8, false);
        vm.run(asm.finish().unwrap());
        assert_eq!(vm.last_trace().unwrap().exception(), Some(Exception::Io));

        let mut asm = Assembler::new(true);
        asm.push(Data::Offset(Offset::bytes(3)));
        asm.emit_int(Opcode::Peekd, 16, false);
        vm.run(asm.finish().unwrap());
        assert_eq!(vm.last_trace().unwrap().exception(), Some(Exception::Eof));
    }

    #[test]
    fn globals_persist() {
        let mut vm = VM::init();
        let mut asm = Assembler::new(true);
        asm.push(int(3));
        asm.emit(Opcode::RegVar, &[]);
        vm.run(asm.finish().unwrap());

        let mut asm = Assembler::new(true);
        asm.emit(Opcode::PushVar, &[0, 0]);
        assert_eq!(vm.run(asm.finish().unwrap()), (Exit::Ok, Some(int(3))));
    }

    #[test]
    fn output_base() {
        let mut vm = VM::init();
        vm.set_config(Config::from_toml("obase = 16").unwrap());
        let array = Data::array(vec![int(255), Data::string("x")]);
        assert_eq!(vm.format(&array), "[0xff,\"x\"]");
    }
}
