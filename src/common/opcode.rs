/// The kind of an operand following an opcode in a bytecode stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arg {
    /// A number encoded with `split_number`.
    Number,
    /// A branch target, `ADDRESS_WIDTH` bytes wide.
    Address,
}

const NONE: &[Arg] = &[];
const ONE: &[Arg] = &[Arg::Number];
const TWO: &[Arg] = &[Arg::Number, Arg::Number];
const THREE: &[Arg] = &[Arg::Number, Arg::Number, Arg::Number];
const JUMP: &[Arg] = &[Arg::Address];

macro_rules! opcodes {
    ($($(#[$doc:meta])* $name:ident => $layout:expr,)*) => {
        /// This enum represents a single opcode.
        /// Under the hood, it's just a byte,
        /// followed by the operands its `layout` describes.
        /// Stack effects are written `before -- after`, top of stack last.
        #[repr(u8)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Opcode {
            $($(#[$doc])* $name,)*
        }

        impl Opcode {
            const ALL: &'static [Opcode] = &[$(Opcode::$name,)*];

            /// The operands that follow this opcode in a stream.
            pub fn layout(self) -> &'static [Arg] {
                match self {
                    $(Opcode::$name => $layout,)*
                }
            }
        }
    };
}

opcodes! {
    /// `-- V`: push the constant at the given index.
    Push => ONE,
    /// `V --`
    Drop => NONE,
    /// `V -- V V`
    Dup => NONE,
    /// `A B -- B A`
    Swap => NONE,
    /// `A B -- B`
    Nip => NONE,
    /// `A B C -- C`
    Nip2 => NONE,
    /// `A B -- A B A`
    Over => NONE,
    /// `A B C -- B C A`
    Rot => NONE,
    /// `A B C -- C A B`
    Nrot => NONE,
    /// Reverses the given number of topmost values.
    Revn => ONE,
    /// `V --`, moving the value to the return stack.
    Tor => NONE,
    /// `-- V`, moving the value back from the return stack.
    Fromr => NONE,

    /// Opens a new, empty environment frame.
    PushF => NONE,
    /// Closes the given number of environment frames.
    PopF => ONE,
    /// `V --`: binds the value to the next slot of the current frame.
    RegVar => NONE,
    /// `-- V`: reads the variable at (back, over).
    PushVar => TWO,
    /// `V --`: overwrites the variable at (back, over).
    PopVar => TWO,

    /// `PROGRAM -- CLOSURE`: closes a program over the current environment.
    Pec => NONE,
    /// `-- CLOSURE`: the closure currently running.
    PushSelf => NONE,
    /// `ARGS.. CLOSURE -- RESULT`
    Call => NONE,
    /// Marks the entry point of a function.
    Prolog => NONE,
    /// Leaves the running closure, keeping the top of stack as its result.
    Return => NONE,
    /// Ends the program.
    Exit => NONE,

    /// Branches unconditionally.
    Ba => JUMP,
    /// `COND --`: branches if the condition is zero.
    Bz => JUMP,
    /// `V -- V`: branches if the value is null.
    Bn => JUMP,
    /// `V -- V`: branches if the value is not null.
    Bnn => JUMP,

    /// `TAG --`: installs a handler for conditions matching the tag.
    PushH => JUMP,
    /// Removes the innermost handler.
    PopH => NONE,
    /// `CODE --`: raises a condition.
    Raise => NONE,

    /// `A B -- A+B`, wrapped to (size, signed).
    Add => TWO,
    Sub => TWO,
    Mul => TWO,
    /// Raises division by zero.
    Div => TWO,
    Mod => TWO,
    /// `A -- -A`
    Neg => TWO,
    Band => TWO,
    Bor => TWO,
    Bxor => TWO,
    /// `A -- ~A`
    Bnot => TWO,
    Sl => TWO,
    Sr => TWO,

    /// `A B -- A&&B` as an `int<32>`.
    And => NONE,
    Or => NONE,
    /// `A -- !A`
    Not => NONE,

    /// `A B -- A==B` as an `int<32>`. Works on integers, strings and offsets.
    Eq => NONE,
    Ne => NONE,
    Lt => NONE,
    Gt => NONE,
    Le => NONE,
    Ge => NONE,

    /// `INT -- INT`: converts to (size, signed).
    Nton => TWO,
    /// `A B -- A:::B`: (size, signed, size of B).
    Bconc => THREE,
    /// `STR STR -- STR`
    Sconc => NONE,

    /// `MAGNITUDE UNIT -- OFFSET`
    Mko => NONE,
    /// `OFFSET -- MAGNITUDE`
    Ogetm => NONE,
    /// `OFFSET -- UNIT`
    Ogetu => NONE,
    /// `OFFSET UNIT -- MAGNITUDE`, in the given unit and (size, signed).
    Ogetmc => TWO,
    /// `A B -- GCD` as a `uint<64>`.
    Gcd => NONE,

    /// `(INDEX VALUE)*ninit -- ARRAY`: (nelem, ninit).
    Mka => TWO,
    /// `ARRAY VALUE -- ARRAY`, appending in place.
    Apush => NONE,
    /// `ARRAY INDEX -- ARRAY INDEX VALUE`
    Aref => NONE,
    /// `ARRAY INDEX VALUE -- ARRAY`
    Aset => NONE,

    /// `(NAME VALUE)*n -- STRUCT`; anonymous fields have a null name.
    Mksct => ONE,
    /// `STRUCT NAME -- STRUCT NAME VALUE`
    Sref => NONE,
    /// `STRUCT INDEX -- STRUCT INDEX VALUE`
    Srefi => NONE,
    /// `STRUCT NAME -- STRUCT NAME VALUE`, or null if there is no such field.
    Srefnt => NONE,
    /// `STRUCT NAME VALUE -- STRUCT`
    Sset => NONE,

    /// `V -- LENGTH`: elements of an array or struct, bytes of a string.
    Sel => NONE,
    /// `V -- OFFSET`: size of a value, in bits.
    Siz => NONE,

    /// `V -- V OFFSET`, or null for unmapped values.
    Mgeto => NONE,
    /// `V -- V MAPPER`, or null.
    Mgetm => NONE,
    /// `V -- V WRITER`, or null.
    Mgetw => NONE,
    /// `V OFFSET MAPPER WRITER -- V'`: a copy of the value mapped at the offset.
    Mset => NONE,
    /// `V -- V'`: re-decodes a mapped value from the backing store.
    Remap => NONE,
    /// `V -- V`: re-encodes a mapped value into the backing store.
    Write => NONE,

    /// `OFFSET -- INT`: decodes an integer of (size, signed).
    Peekd => TWO,
    /// `OFFSET INT --`: encodes an integer of (size, signed).
    Poked => TWO,
    /// `OFFSET -- STR`: decodes a NUL terminated string.
    Peeks => NONE,
    /// `OFFSET STR --`
    Pokes => NONE,
    /// `-- OFFSET`: size of the backing store.
    Iosize => NONE,
}

impl Opcode {
    /// Convert a raw byte to an opcode, if it is one.
    pub fn from_byte(byte: u8) -> Option<Opcode> {
        Opcode::ALL.get(byte as usize).copied()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bytes() {
        for (index, op) in Opcode::ALL.iter().enumerate() {
            assert_eq!(*op as u8 as usize, index);
            assert_eq!(Opcode::from_byte(*op as u8), Some(*op));
        }
        assert_eq!(Opcode::from_byte(Opcode::ALL.len() as u8), None);
    }

    #[test]
    fn branches_take_addresses() {
        for op in [Opcode::Ba, Opcode::Bz, Opcode::Bn, Opcode::Bnn, Opcode::PushH] {
            assert_eq!(op.layout(), &[Arg::Address]);
        }
    }
}
