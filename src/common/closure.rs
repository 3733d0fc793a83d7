use std::rc::Rc;

use crate::common::{env::Env, lambda::Lambda};

/// Wraps a `Lambda` with the environment it was closed over.
#[derive(Clone)]
pub struct Closure {
    pub lambda: Rc<Lambda>,
    pub env: Env,
}

impl Closure {
    pub fn wrap(lambda: Rc<Lambda>, env: Env) -> Rc<Closure> {
        Rc::new(Closure { lambda, env })
    }
}
