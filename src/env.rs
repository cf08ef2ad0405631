use std::mem::size_of;

use crate::objects::object::ObjRef;

/// Handle to a lexical environment in the env arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EnvRef(pub(crate) u32);

impl EnvRef {
    #[inline(always)]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// One lexical scope. Bindings live in two heap maps so they are traced and
/// barriered like any other map; the env record itself is swept separately.
#[derive(Debug, Clone)]
pub struct Env {
    pub values: ObjRef,
    pub consts: ObjRef,
    pub enclosing: Option<EnvRef>,
    pub marked: bool,
}

impl Env {
    /// Bytes charged to the env counter per live env record.
    pub const SIZE: usize = size_of::<Env>();

    pub fn new(values: ObjRef, consts: ObjRef, enclosing: Option<EnvRef>) -> Env {
        Env {
            values,
            consts,
            enclosing,
            marked: false,
        }
    }
}
