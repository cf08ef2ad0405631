use crate::error::RuntimeError;
use crate::objects::object::ObjRef;
use crate::value::Value;
use crate::vm::VM;

/// Host function callable from bytecode. Arguments are copied out of the
/// stack window, which stays rooted for the duration of the call.
pub type NativeFn = fn(&mut VM, &[Value]) -> Result<Value, RuntimeError>;

pub struct ObjectNativeFunction {
    pub name: ObjRef,
    /// Exact argument count, or negative for variadic.
    pub arity: i32,
    pub function: NativeFn,
}

impl ObjectNativeFunction {
    pub fn new(name: ObjRef, arity: i32, function: NativeFn) -> ObjectNativeFunction {
        ObjectNativeFunction { name, arity, function }
    }

    #[inline]
    pub fn accepts(&self, argc: usize) -> bool {
        self.arity < 0 || self.arity as usize == argc
    }
}
