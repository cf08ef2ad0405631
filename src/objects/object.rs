use std::mem::size_of;

use strum_macros::Display;

use crate::gc::trace::Tracer;
use crate::value::Value;

use super::{
    object_array::ObjectArray,
    object_class::{ObjectBoundMethod, ObjectClass, ObjectInstance},
    object_enum::ObjectEnumCtor,
    object_function::ObjectFunction,
    object_map::ObjectMap,
    object_native_function::ObjectNativeFunction,
    object_string::ObjectString,
};

/// Handle to a heap object. The object manager is the only owner; everything
/// else (stack slots, env maps, frames) holds these by value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjRef(pub(crate) u32);

impl ObjRef {
    #[inline(always)]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generation {
    Young,
    Old,
}

#[derive(Debug, Clone)]
pub struct ObjHeader {
    pub generation: Generation,
    pub age: u8,
    pub marked: bool,
    pub remembered: bool,
    pub size: usize,
}

impl ObjHeader {
    pub fn young(size: usize) -> Self {
        ObjHeader {
            generation: Generation::Young,
            age: 0,
            marked: false,
            remembered: false,
            size,
        }
    }

    #[inline(always)]
    pub fn is_young(&self) -> bool {
        self.generation == Generation::Young
    }
}

#[derive(Debug, Hash, PartialEq, Eq, Clone, Copy, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ObjectType {
    String,
    Array,
    Map,
    Function,
    Native,
    Class,
    Instance,
    BoundMethod,
    EnumCtor,
}

pub enum Object {
    String(ObjectString),
    Array(ObjectArray),
    Map(ObjectMap),
    Function(ObjectFunction),
    Native(ObjectNativeFunction),
    Class(ObjectClass),
    Instance(ObjectInstance),
    BoundMethod(ObjectBoundMethod),
    EnumCtor(ObjectEnumCtor),
}

impl Object {
    pub fn obj_type(&self) -> ObjectType {
        match self {
            Object::String(_) => ObjectType::String,
            Object::Array(_) => ObjectType::Array,
            Object::Map(_) => ObjectType::Map,
            Object::Function(_) => ObjectType::Function,
            Object::Native(_) => ObjectType::Native,
            Object::Class(_) => ObjectType::Class,
            Object::Instance(_) => ObjectType::Instance,
            Object::BoundMethod(_) => ObjectType::BoundMethod,
            Object::EnumCtor(_) => ObjectType::EnumCtor,
        }
    }

    /// Push every handle this object holds onto the tracer's gray lists.
    pub fn trace(&self, tracer: &mut Tracer) {
        match self {
            Object::String(_) => {}
            Object::Array(array) => {
                for value in &array.items {
                    tracer.push_value(*value);
                }
            }
            Object::Map(map) => {
                for (key, value) in map.iter() {
                    tracer.push_object(key);
                    tracer.push_value(value);
                }
            }
            Object::Function(function) => {
                tracer.push_object(function.name);
                for param in &function.params {
                    tracer.push_object(*param);
                }
                if let Some(env) = function.closure {
                    tracer.push_env(env);
                }
                for constant in function.chunk.constants.iter() {
                    tracer.push_value(*constant);
                }
            }
            Object::Native(native) => tracer.push_object(native.name),
            Object::Class(class) => {
                tracer.push_object(class.name);
                tracer.push_object(class.methods);
                if let Some(shape) = &class.shape {
                    tracer.push_object(shape.fields);
                    tracer.push_object(shape.defaults);
                    tracer.push_object(shape.readonly);
                }
            }
            Object::Instance(instance) => {
                tracer.push_object(instance.class);
                tracer.push_object(instance.fields);
            }
            Object::BoundMethod(bound) => {
                tracer.push_value(bound.receiver);
                tracer.push_object(bound.method);
            }
            Object::EnumCtor(ctor) => {
                tracer.push_object(ctor.enum_name);
                tracer.push_object(ctor.variant);
            }
        }
    }

    pub fn deep_size(&self) -> usize {
        match self {
            Object::String(s) => s.deep_size(),
            Object::Array(a) => a.deep_size(),
            Object::Map(m) => m.deep_size(),
            Object::Function(f) => f.deep_size(),
            Object::Native(n) => n.deep_size(),
            Object::Class(c) => c.deep_size(),
            Object::Instance(i) => i.deep_size(),
            Object::BoundMethod(b) => b.deep_size(),
            Object::EnumCtor(e) => e.deep_size(),
        }
    }
}

/// A slot in the object arena: header plus payload.
pub struct HeapObject {
    pub header: ObjHeader,
    pub object: Object,
}

/// Trait for computing heap usage of GC managed structures (owned data only).
pub trait GcSize {
    /// Bytes for the struct itself (includes inline fields, pointers, lengths, capacities meta).
    fn shallow_size(&self) -> usize;
    /// Bytes including owned heap allocations (NOT traversing to other GC objects).
    fn deep_size(&self) -> usize;
}

impl GcSize for ObjectString {
    fn shallow_size(&self) -> usize { size_of::<ObjectString>() }
    fn deep_size(&self) -> usize {
        self.shallow_size() + self.content.len()
    }
}

impl GcSize for ObjectArray {
    fn shallow_size(&self) -> usize { size_of::<ObjectArray>() }
    fn deep_size(&self) -> usize {
        self.shallow_size() + self.items.capacity() * size_of::<Value>()
    }
}

impl GcSize for ObjectMap {
    fn shallow_size(&self) -> usize { size_of::<ObjectMap>() }
    fn deep_size(&self) -> usize {
        self.shallow_size() + self.capacity() * ObjectMap::ENTRY_SIZE
    }
}

impl GcSize for ObjectFunction {
    fn shallow_size(&self) -> usize { size_of::<ObjectFunction>() }
    fn deep_size(&self) -> usize {
        // The chunk is shared between a prototype and its closures, so it is not counted here.
        self.shallow_size() + self.params.capacity() * size_of::<ObjRef>()
    }
}

impl GcSize for ObjectNativeFunction {
    fn shallow_size(&self) -> usize { size_of::<ObjectNativeFunction>() }
    fn deep_size(&self) -> usize { self.shallow_size() }
}

impl GcSize for ObjectClass {
    fn shallow_size(&self) -> usize { size_of::<ObjectClass>() }
    fn deep_size(&self) -> usize { self.shallow_size() }
}

impl GcSize for ObjectInstance {
    fn shallow_size(&self) -> usize { size_of::<ObjectInstance>() }
    fn deep_size(&self) -> usize { self.shallow_size() }
}

impl GcSize for ObjectBoundMethod {
    fn shallow_size(&self) -> usize { size_of::<ObjectBoundMethod>() }
    fn deep_size(&self) -> usize { self.shallow_size() }
}

impl GcSize for ObjectEnumCtor {
    fn shallow_size(&self) -> usize { size_of::<ObjectEnumCtor>() }
    fn deep_size(&self) -> usize { self.shallow_size() }
}
