use std::{
    cell::RefCell,
    fmt::{Debug, Display, Formatter, Result},
    rc::Rc,
};

use crate::common::{closure::Closure, lambda::Lambda, opcode::Opcode};

fn mask(size: u8) -> u64 {
    if size >= 64 { u64::MAX } else { (1u64 << size) - 1 }
}

/// An integer of a given width and signedness, `1..=64` bits.
/// The bits are kept masked to the width;
/// `value` gives the number they stand for.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Int {
    bits: u64,
    size: u8,
    signed: bool,
}

impl Int {
    /// Wraps a value to `size` bits, the way two's complement hardware would.
    pub fn new(value: i128, size: u8, signed: bool) -> Int {
        Int { bits: (value as u64) & mask(size), size, signed }
    }

    pub fn from_bits(bits: u64, size: u8, signed: bool) -> Int {
        Int { bits: bits & mask(size), size, signed }
    }

    /// An `int<32>`, the type of truth values and condition codes.
    pub fn int(value: i32) -> Int {
        Int::new(value as i128, 32, true)
    }

    /// A `uint<64>`, the type of lengths, indices and units.
    pub fn ulong(value: u64) -> Int {
        Int::new(value as i128, 64, false)
    }

    pub fn value(&self) -> i128 {
        let negative = self.signed && (self.bits >> (self.size - 1)) & 1 == 1;
        if negative {
            self.bits as i128 - (1i128 << self.size)
        } else {
            self.bits as i128
        }
    }

    pub fn bits(&self) -> u64 { self.bits }
    pub fn size(&self) -> u8 { self.size }
    pub fn signed(&self) -> bool { self.signed }

    pub fn is_true(&self) -> bool {
        self.bits != 0
    }

    pub fn convert(self, size: u8, signed: bool) -> Int {
        Int::new(self.value(), size, signed)
    }

    /// Applies a binary integer instruction to the values of `a` and `b`,
    /// wrapping the result to (size, signed).
    /// `None` on division by zero, or for an opcode that is not one.
    pub fn binary(op: Opcode, a: Int, b: Int, size: u8, signed: bool) -> Option<Int> {
        let (x, y) = (a.value(), b.value());
        let value = match op {
            Opcode::Add => x.wrapping_add(y),
            Opcode::Sub => x.wrapping_sub(y),
            Opcode::Mul => x.wrapping_mul(y),
            Opcode::Div => x.checked_div(y)?,
            Opcode::Mod => x.checked_rem(y)?,
            Opcode::Band => x & y,
            Opcode::Bor => x | y,
            Opcode::Bxor => x ^ y,
            Opcode::Sl => x.wrapping_shl(y.clamp(0, 127) as u32),
            Opcode::Sr => x >> y.clamp(0, 127),
            _ => return None,
        };
        Some(Int::new(value, size, signed))
    }

    /// Like `binary`, for `Neg` and `Bnot`.
    pub fn unary(op: Opcode, a: Int, size: u8, signed: bool) -> Option<Int> {
        let value = match op {
            Opcode::Neg => a.value().wrapping_neg(),
            Opcode::Bnot => !a.value(),
            _ => return None,
        };
        Some(Int::new(value, size, signed))
    }
}

impl Debug for Int {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        let kind = if self.signed { "int" } else { "uint" };
        write!(f, "{}<{}> {}", kind, self.size, self.value())
    }
}

/// A quantity of storage: a magnitude counted in `unit`s of bits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Offset {
    pub magnitude: Int,
    pub unit: u64,
}

impl Offset {
    pub fn new(magnitude: Int, unit: u64) -> Offset {
        Offset { magnitude, unit }
    }

    /// An offset counted in bits.
    pub fn bits(bits: u64) -> Offset {
        Offset::new(Int::ulong(bits), 1)
    }

    /// An offset counted in bytes.
    pub fn bytes(bytes: u64) -> Offset {
        Offset::new(Int::ulong(bytes), 8)
    }

    /// The magnitude normalized to bits.
    pub fn in_bits(&self) -> i128 {
        self.magnitude.value() * self.unit as i128
    }
}

/// Ties a structured value to the backing store:
/// where it was decoded from, how to decode it again,
/// and how to encode it back.
/// A value either has all three or is unmapped.
#[derive(Clone)]
pub struct Mapping {
    pub offset: Offset,
    pub mapper: Rc<Closure>,
    pub writer: Rc<Closure>,
}

#[derive(Clone, Default)]
pub struct Array {
    pub elems: Vec<Data>,
    pub mapping: Option<Mapping>,
}

#[derive(Clone, Debug)]
pub struct Field {
    pub name: Option<Rc<str>>,
    pub value: Data,
}

#[derive(Clone, Default)]
pub struct Struct {
    pub fields: Vec<Field>,
    pub mapping: Option<Mapping>,
}

impl Struct {
    pub fn field(&self, name: &str) -> Option<&Data> {
        self.fields
            .iter()
            .find(|f| f.name.as_deref() == Some(name))
            .map(|f| &f.value)
    }
}

/// Values the VM works with.
#[derive(Clone)]
pub enum Data {
    Null,
    Int(Int),
    String(Rc<str>),
    Offset(Offset),
    // Arrays and structs are boxed:
    // every holder sees mutations made through any other.
    Array(Rc<RefCell<Array>>),
    Struct(Rc<RefCell<Struct>>),
    /// A finished program not yet closed over an environment.
    Lambda(Rc<Lambda>),
    Closure(Rc<Closure>),
}

impl Data {
    pub fn string(s: &str) -> Data {
        Data::String(Rc::from(s))
    }

    pub fn array(elems: Vec<Data>) -> Data {
        Data::Array(Rc::new(RefCell::new(Array { elems, mapping: None })))
    }

    pub fn record(fields: Vec<Field>) -> Data {
        Data::Struct(Rc::new(RefCell::new(Struct { fields, mapping: None })))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Data::Null)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Data::Null => "null",
            Data::Int(_) => "integer",
            Data::String(_) => "string",
            Data::Offset(_) => "offset",
            Data::Array(_) => "array",
            Data::Struct(_) => "struct",
            Data::Lambda(_) => "program",
            Data::Closure(_) => "closure",
        }
    }

    /// The mapping of a structured value, if it is mapped.
    pub fn mapping(&self) -> Option<Mapping> {
        match self {
            Data::Array(a) => a.borrow().mapping.clone(),
            Data::Struct(s) => s.borrow().mapping.clone(),
            _ => None,
        }
    }

    /// How many bits the value takes up when stored.
    /// Programs and closures have no stored form.
    pub fn size_in_bits(&self) -> Option<u64> {
        match self {
            Data::Null => Some(0),
            Data::Int(i) => Some(i.size() as u64),
            Data::String(s) => Some((s.len() as u64 + 1) * 8),
            Data::Offset(o) => Some(o.magnitude.size() as u64),
            Data::Array(a) => a.borrow().elems.iter().map(Data::size_in_bits).sum(),
            Data::Struct(s) => s.borrow().fields.iter().map(|f| f.value.size_in_bits()).sum(),
            Data::Lambda(_) | Data::Closure(_) => None,
        }
    }
}

impl PartialEq for Data {
    /// Scalars compare by value, everything boxed by identity.
    fn eq(&self, other: &Data) -> bool {
        match (self, other) {
            (Data::Null, Data::Null) => true,
            (Data::Int(a), Data::Int(b)) => a == b,
            (Data::String(a), Data::String(b)) => a == b,
            (Data::Offset(a), Data::Offset(b)) => a == b,
            (Data::Array(a), Data::Array(b)) => Rc::ptr_eq(a, b),
            (Data::Struct(a), Data::Struct(b)) => Rc::ptr_eq(a, b),
            (Data::Lambda(a), Data::Lambda(b)) => Rc::ptr_eq(a, b),
            (Data::Closure(a), Data::Closure(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Display for Data {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        match self {
            Data::Null => write!(f, "null"),
            Data::Int(i) => write!(f, "{}", i.value()),
            Data::String(s) => write!(f, "{:?}", s),
            Data::Offset(o) => write!(f, "{}#{}", o.magnitude.value(), o.unit),
            Data::Array(a) => {
                write!(f, "[")?;
                for (index, elem) in a.borrow().elems.iter().enumerate() {
                    if index > 0 { write!(f, ",")?; }
                    write!(f, "{}", elem)?;
                }
                write!(f, "]")
            },
            Data::Struct(s) => {
                write!(f, "struct {{")?;
                for (index, field) in s.borrow().fields.iter().enumerate() {
                    if index > 0 { write!(f, ",")?; }
                    match &field.name {
                        Some(name) => write!(f, "{}={}", name, field.value)?,
                        None => write!(f, "{}", field.value)?,
                    }
                }
                write!(f, "}}")
            },
            Data::Lambda(l) => write!(f, "#<program {}>", l.name()),
            Data::Closure(c) => write!(f, "#<closure {}>", c.lambda.name()),
        }
    }
}

impl Debug for Data {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        match self {
            Data::Null => write!(f, "Null"),
            Data::Int(i) => write!(f, "Int({:?})", i),
            Data::String(s) => write!(f, "String({:?})", s),
            Data::Offset(o) => write!(f, "Offset({:?}, {})", o.magnitude, o.unit),
            Data::Array(a) => {
                let a = a.borrow();
                write!(f, "Array({:?}, mapped: {})", a.elems, a.mapping.is_some())
            },
            Data::Struct(s) => {
                let s = s.borrow();
                write!(f, "Struct({:?}, mapped: {})", s.fields, s.mapping.is_some())
            },
            Data::Lambda(l) => write!(f, "Lambda({})", l.name()),
            Data::Closure(c) => write!(f, "Closure({})", c.lambda.name()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wrapping() {
        assert_eq!(Int::new(256, 8, false).value(), 0);
        assert_eq!(Int::new(255, 8, true).value(), -1);
        assert_eq!(Int::new(-1, 8, false).value(), 255);
        assert_eq!(Int::new(-1, 64, false).bits(), u64::MAX);
        assert_eq!(Int::new(-2, 64, true).value(), -2);
    }

    #[test]
    fn sizes() {
        let record = Data::record(vec![
            Field { name: Some(Rc::from("a")), value: Data::Int(Int::new(1, 32, false)) },
            Field { name: None, value: Data::string("ab") },
        ]);
        let nested = Data::array(vec![record, Data::Int(Int::new(0, 8, false))]);
        assert_eq!(nested.size_in_bits(), Some(32 + 24 + 8));
    }

    #[test]
    fn boxed_identity() {
        let a = Data::array(vec![]);
        assert_eq!(a, a.clone());
        assert_ne!(a, Data::array(vec![]));
    }

    #[test]
    fn arithmetic() {
        let (a, b) = (Int::new(200, 8, false), Int::new(100, 8, false));
        assert_eq!(Int::binary(Opcode::Add, a, b, 8, false), Some(Int::new(44, 8, false)));
        assert_eq!(Int::binary(Opcode::Sub, b, a, 16, true).map(|i| i.value()), Some(-100));
        assert_eq!(Int::binary(Opcode::Div, a, Int::int(0), 8, false), None);
        assert_eq!(Int::binary(Opcode::Sr, Int::int(-8), Int::int(1), 32, true), Some(Int::int(-4)));
        assert_eq!(Int::unary(Opcode::Neg, Int::int(5), 32, true), Some(Int::int(-5)));
        assert_eq!(Int::unary(Opcode::Bnot, Int::new(0, 4, false), 4, false).map(|i| i.value()), Some(15));
        assert_eq!(Int::binary(Opcode::Call, a, b, 8, false), None);
    }

    #[test]
    fn offsets_in_bits() {
        assert_eq!(Offset::bytes(3).in_bits(), 24);
        assert_eq!(Offset::new(Int::new(-2, 32, true), 4).in_bits(), -8);
    }
}
