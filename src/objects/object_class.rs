use crate::objects::object::ObjRef;
use crate::value::Value;

/// Field layout of a class declared with `STRUCT`.
pub struct StructShape {
    /// Array of field-name strings, in declaration order.
    pub fields: ObjRef,
    /// Map of field name to default value.
    pub defaults: ObjRef,
    /// Array of field-name strings that cannot be reassigned.
    pub readonly: ObjRef,
}

pub struct ObjectClass {
    pub name: ObjRef,
    /// Map of method name to function.
    pub methods: ObjRef,
    pub shape: Option<StructShape>,
}

impl ObjectClass {
    pub fn new(name: ObjRef, methods: ObjRef) -> ObjectClass {
        ObjectClass { name, methods, shape: None }
    }
}

pub struct ObjectInstance {
    pub class: ObjRef,
    /// Map of field name to value.
    pub fields: ObjRef,
}

pub struct ObjectBoundMethod {
    pub receiver: Value,
    pub method: ObjRef,
}
