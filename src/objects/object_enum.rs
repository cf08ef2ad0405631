use crate::objects::object::ObjRef;

pub const ENUM_KEY: &str = "_enum";
pub const TAG_KEY: &str = "_tag";
pub const VALUES_KEY: &str = "_values";

/// Constructor for an enum variant with a payload. Calling it with `arity`
/// arguments yields a tagged map `{ _enum, _tag, _values }`.
pub struct ObjectEnumCtor {
    pub enum_name: ObjRef,
    pub variant: ObjRef,
    pub arity: u8,
}

impl ObjectEnumCtor {
    pub fn new(enum_name: ObjRef, variant: ObjRef, arity: u8) -> ObjectEnumCtor {
        ObjectEnumCtor { enum_name, variant, arity }
    }
}
