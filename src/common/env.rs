use std::{cell::RefCell, rc::Rc};

use crate::common::data::Data;

/// A lexical environment: a chain of frames, innermost first.
/// Closures hold on to the `Env` they were made in,
/// sharing it with every other holder.
pub type Env = Rc<Frame>;

/// One frame of slots, filled in registration order.
#[derive(Default)]
pub struct Frame {
    slots: RefCell<Vec<Data>>,
    parent: Option<Env>,
}

impl Frame {
    /// An outermost frame.
    pub fn root() -> Env {
        Rc::new(Frame::default())
    }

    /// A new empty frame inside `parent`.
    pub fn push(parent: &Env) -> Env {
        Rc::new(Frame { slots: RefCell::new(vec![]), parent: Some(Rc::clone(parent)) })
    }

    pub fn parent(&self) -> Option<&Env> {
        self.parent.as_ref()
    }

    /// Binds a value to the next free slot.
    pub fn register(&self, value: Data) {
        self.slots.borrow_mut().push(value);
    }

    pub fn len(&self) -> usize {
        self.slots.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ancestor(env: &Env, back: usize) -> Option<&Env> {
        let mut frame = env;
        for _ in 0..back {
            frame = frame.parent.as_ref()?;
        }
        Some(frame)
    }

    /// The value at a lexical address, if the address exists.
    pub fn lookup(env: &Env, back: usize, over: usize) -> Option<Data> {
        Frame::ancestor(env, back)?.slots.borrow().get(over).cloned()
    }

    /// Overwrites the value at a lexical address.
    /// Returns `None` if the address does not exist.
    pub fn assign(env: &Env, back: usize, over: usize, value: Data) -> Option<()> {
        let frame = Frame::ancestor(env, back)?;
        let mut slots = frame.slots.borrow_mut();
        *slots.get_mut(over)? = value;
        Some(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::data::Int;

    #[test]
    fn addresses() {
        let outer = Frame::root();
        outer.register(Data::Int(Int::int(1)));
        outer.register(Data::Int(Int::int(2)));
        let inner = Frame::push(&outer);
        inner.register(Data::Int(Int::int(3)));

        assert_eq!(Frame::lookup(&inner, 0, 0), Some(Data::Int(Int::int(3))));
        assert_eq!(Frame::lookup(&inner, 1, 1), Some(Data::Int(Int::int(2))));
        assert_eq!(Frame::lookup(&inner, 2, 0), None);
        assert_eq!(Frame::lookup(&inner, 0, 1), None);
    }

    #[test]
    fn shared() {
        let outer = Frame::root();
        outer.register(Data::Null);
        let a = Frame::push(&outer);
        let b = Frame::push(&outer);

        Frame::assign(&a, 1, 0, Data::Int(Int::int(7))).unwrap();
        assert_eq!(Frame::lookup(&b, 1, 0), Some(Data::Int(Int::int(7))));
        assert_eq!(Frame::assign(&b, 0, 0, Data::Null), None);
    }
}
