use std::rc::Rc;

use crate::chunk::Chunk;
use crate::env::EnvRef;
use crate::objects::object::ObjRef;

pub struct ObjectFunction {
    pub name: ObjRef,
    /// Upper bound of accepted arguments (number of declared parameters).
    pub arity: u8,
    /// Parameters without a default value.
    pub min_arity: u8,
    pub is_initializer: bool,
    pub params: Vec<ObjRef>,
    pub chunk: Rc<Chunk>,
    pub closure: Option<EnvRef>,
    /// Path of the program this function was compiled from, for diagnostics.
    pub path: Option<Rc<str>>,
}

impl ObjectFunction {
    pub fn new(name: ObjRef, params: Vec<ObjRef>, min_arity: u8, chunk: Rc<Chunk>) -> ObjectFunction {
        let arity = params.len() as u8;
        ObjectFunction {
            name,
            arity,
            min_arity: min_arity.min(arity),
            is_initializer: false,
            params,
            chunk,
            closure: None,
            path: None,
        }
    }

    /// Copy of a prototype bound to the environment active at its definition.
    pub fn clone_with_env(&self, closure: Option<EnvRef>) -> ObjectFunction {
        ObjectFunction {
            name: self.name,
            arity: self.arity,
            min_arity: self.min_arity,
            is_initializer: self.is_initializer,
            params: self.params.clone(),
            chunk: Rc::clone(&self.chunk),
            closure,
            path: self.path.clone(),
        }
    }

    #[inline]
    pub fn accepts(&self, argc: usize) -> bool {
        argc >= self.min_arity as usize && argc <= self.arity as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arity_range_is_inclusive() {
        let chunk = Rc::new(Chunk::default());
        let function = ObjectFunction::new(ObjRef(0), vec![ObjRef(1), ObjRef(2), ObjRef(3)], 1, chunk);
        assert!(!function.accepts(0));
        assert!(function.accepts(1));
        assert!(function.accepts(3));
        assert!(!function.accepts(4));
    }

    #[test]
    fn clone_shares_chunk() {
        let chunk = Rc::new(Chunk::default());
        let proto = ObjectFunction::new(ObjRef(0), vec![], 0, Rc::clone(&chunk));
        let copy = proto.clone_with_env(None);
        assert!(Rc::ptr_eq(&proto.chunk, &copy.chunk));
    }
}
