use std::rc::Rc;

use crate::common::{
    closure::Closure,
    data::{Data, Int, Offset},
};

use crate::vm::trace::Trace;

/// The operand stack.
/// Every activation shares the one stack:
/// arguments are left on it by the caller and picked up by the callee.
/// Popping more than was pushed is a fatal error,
/// since only a malformed program can do it.
#[derive(Debug, Default)]
pub struct Stack {
    values: Vec<Data>,
}

impl Stack {
    pub fn init() -> Stack {
        Stack { values: vec![] }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn push(&mut self, data: Data) {
        self.values.push(data);
    }

    pub fn pop(&mut self) -> Result<Data, Trace> {
        self.values.pop().ok_or_else(|| Trace::fatal("stack underflow"))
    }

    /// The value `depth` places below the top, the top being 0.
    pub fn peek(&self, depth: usize) -> Result<&Data, Trace> {
        self.values
            .len()
            .checked_sub(depth + 1)
            .and_then(|index| self.values.get(index))
            .ok_or_else(|| Trace::fatal("stack underflow"))
    }

    /// Drops everything above `len` values.
    pub fn truncate(&mut self, len: usize) {
        self.values.truncate(len);
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    /// Reverses the order of the topmost `count` values.
    pub fn reverse(&mut self, count: usize) -> Result<(), Trace> {
        let start = self.values.len().checked_sub(count)
            .ok_or_else(|| Trace::fatal("stack underflow"))?;
        self.values[start..].reverse();
        Ok(())
    }

    pub fn pop_int(&mut self) -> Result<Int, Trace> {
        match self.pop()? {
            Data::Int(int) => Ok(int),
            other => Err(mismatch("an integer", &other)),
        }
    }

    /// Pops an integer that can index into something.
    /// Negative values do not index anything, so they come back as `None`.
    pub fn pop_index(&mut self) -> Result<Option<usize>, Trace> {
        let int = self.pop_int()?;
        Ok(usize::try_from(int.value()).ok())
    }

    pub fn pop_offset(&mut self) -> Result<Offset, Trace> {
        match self.pop()? {
            Data::Offset(offset) => Ok(offset),
            other => Err(mismatch("an offset", &other)),
        }
    }

    pub fn pop_string(&mut self) -> Result<Rc<str>, Trace> {
        match self.pop()? {
            Data::String(string) => Ok(string),
            other => Err(mismatch("a string", &other)),
        }
    }

    pub fn pop_closure(&mut self) -> Result<Rc<Closure>, Trace> {
        match self.pop()? {
            Data::Closure(closure) => Ok(closure),
            other => Err(mismatch("a closure", &other)),
        }
    }

    /// Pops a closure, or null.
    pub fn pop_optional_closure(&mut self) -> Result<Option<Rc<Closure>>, Trace> {
        match self.pop()? {
            Data::Null => Ok(None),
            Data::Closure(closure) => Ok(Some(closure)),
            other => Err(mismatch("a closure", &other)),
        }
    }
}

pub fn mismatch(expected: &str, found: &Data) -> Trace {
    Trace::fatal(&format!("expected {}, found {}", expected, found.kind()))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn underflow_is_fatal() {
        let mut stack = Stack::init();
        assert!(stack.pop().unwrap_err().is_fatal());
        assert!(stack.peek(0).is_err());
        stack.push(Data::Null);
        assert!(stack.reverse(2).is_err());
    }

    #[test]
    fn reversal() {
        let mut stack = Stack::init();
        for n in 0..4 {
            stack.push(Data::Int(Int::int(n)));
        }
        stack.reverse(3).unwrap();
        let popped: Vec<i128> = (0..4).map(|_| stack.pop_int().unwrap().value()).collect();
        assert_eq!(popped, vec![1, 2, 3, 0]);
    }

    #[test]
    fn typed_pops() {
        let mut stack = Stack::init();
        stack.push(Data::string("hello"));
        assert_eq!(stack.peek(0).unwrap().kind(), "string");
        assert!(stack.pop_int().unwrap_err().is_fatal());

        stack.push(Data::Int(Int::new(-1, 8, true)));
        assert_eq!(stack.pop_index().unwrap(), None);
        stack.push(Data::Null);
        assert!(stack.pop_optional_closure().unwrap().is_none());
    }
}
