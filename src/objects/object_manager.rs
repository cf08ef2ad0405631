use rustc_hash::FxHashMap;

use crate::env::{Env, EnvRef};
use crate::gc::gc_trace;
use crate::objects::{
    object::{Generation, HeapObject, ObjHeader, ObjRef, Object, ObjectType},
    object_array::ObjectArray,
    object_class::{ObjectBoundMethod, ObjectClass, ObjectInstance},
    object_enum::ObjectEnumCtor,
    object_function::ObjectFunction,
    object_map::ObjectMap,
    object_native_function::{NativeFn, ObjectNativeFunction},
    object_string::{hash_str, ObjectString},
};
use crate::value::{format_number, Value};

const DISPLAY_DEPTH_MAX: usize = 16;

/// Outcome of assigning through an environment chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignError {
    Undefined,
    Constant,
}

/// Owner of every heap object and environment record.
///
/// Objects live in an index arena; a handle stays valid until the sweeper frees
/// its slot. Each object is listed in exactly one generation list. Byte counters
/// are kept per generation and updated on every allocation, resize and free.
pub struct ObjectManager {
    slots: Vec<Option<HeapObject>>,
    free_slots: Vec<u32>,
    pub(crate) young: Vec<ObjRef>,
    pub(crate) old: Vec<ObjRef>,
    env_slots: Vec<Option<Env>>,
    free_env_slots: Vec<u32>,
    pub(crate) envs: Vec<EnvRef>,
    strings: FxHashMap<Box<str>, ObjRef>,
    pub(crate) young_bytes: usize,
    pub(crate) old_bytes: usize,
    pub(crate) env_bytes: usize,
}

impl ObjectManager {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_slots: Vec::new(),
            young: Vec::new(),
            old: Vec::new(),
            env_slots: Vec::new(),
            free_env_slots: Vec::new(),
            envs: Vec::new(),
            strings: FxHashMap::default(),
            young_bytes: 0,
            old_bytes: 0,
            env_bytes: 0,
        }
    }

    /// Register a new object in the young generation and return its handle and size.
    pub fn push_object(&mut self, object: Object) -> (ObjRef, usize) {
        let size = object.deep_size();
        let heap_object = HeapObject {
            header: ObjHeader::young(size),
            object,
        };
        let handle = match self.free_slots.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(heap_object);
                ObjRef(index)
            }
            None => {
                self.slots.push(Some(heap_object));
                ObjRef((self.slots.len() - 1) as u32)
            }
        };
        self.young.push(handle);
        self.young_bytes += size;
        #[cfg(feature = "debug_trace_object")]
        gc_trace!("alloc {:?} {} bytes={}", handle, self.object(handle).obj_type(), size);
        (handle, size)
    }

    pub fn alloc_string(&mut self, value: &str) -> (ObjRef, usize) {
        self.push_object(Object::String(ObjectString::new(value)))
    }

    /// Return the canonical string for `value`, allocating it on first use.
    pub fn intern(&mut self, value: &str) -> (ObjRef, usize) {
        if let Some(&handle) = self.strings.get(value) {
            return (handle, 0);
        }
        let (handle, size) = self.alloc_string(value);
        self.strings.insert(value.into(), handle);
        (handle, size)
    }

    pub fn alloc_array(&mut self, items: Vec<Value>) -> (ObjRef, usize) {
        self.push_object(Object::Array(ObjectArray { items }))
    }

    pub fn alloc_map(&mut self, capacity: usize) -> (ObjRef, usize) {
        self.push_object(Object::Map(ObjectMap::with_capacity(capacity)))
    }

    pub fn alloc_function(&mut self, function: ObjectFunction) -> (ObjRef, usize) {
        self.push_object(Object::Function(function))
    }

    pub fn alloc_native_function(&mut self, name: ObjRef, arity: i32, function: NativeFn) -> (ObjRef, usize) {
        self.push_object(Object::Native(ObjectNativeFunction::new(name, arity, function)))
    }

    pub fn alloc_class(&mut self, class: ObjectClass) -> (ObjRef, usize) {
        self.push_object(Object::Class(class))
    }

    pub fn alloc_instance(&mut self, class: ObjRef, fields: ObjRef) -> (ObjRef, usize) {
        self.push_object(Object::Instance(ObjectInstance { class, fields }))
    }

    pub fn alloc_bound_method(&mut self, receiver: Value, method: ObjRef) -> (ObjRef, usize) {
        self.push_object(Object::BoundMethod(ObjectBoundMethod { receiver, method }))
    }

    pub fn alloc_enum_ctor(&mut self, enum_name: ObjRef, variant: ObjRef, arity: u8) -> (ObjRef, usize) {
        self.push_object(Object::EnumCtor(ObjectEnumCtor::new(enum_name, variant, arity)))
    }

    /// Allocate an environment with fresh binding maps. The returned size covers all three.
    pub fn alloc_env(&mut self, enclosing: Option<EnvRef>) -> (EnvRef, usize) {
        let (values, values_size) = self.alloc_map(0);
        let (consts, consts_size) = self.alloc_map(0);
        let env = Env::new(values, consts, enclosing);
        let handle = match self.free_env_slots.pop() {
            Some(index) => {
                self.env_slots[index as usize] = Some(env);
                EnvRef(index)
            }
            None => {
                self.env_slots.push(Some(env));
                EnvRef((self.env_slots.len() - 1) as u32)
            }
        };
        self.envs.push(handle);
        self.env_bytes += Env::SIZE;
        (handle, values_size + consts_size + Env::SIZE)
    }

    /// Release an object's slot. The caller removes it from its generation list
    /// and adjusts that generation's counter.
    pub fn free_object(&mut self, handle: ObjRef) -> usize {
        let Some(heap_object) = self.slots[handle.index()].take() else {
            return 0;
        };
        if let Object::String(string) = &heap_object.object {
            if self.strings.get(string.as_str()) == Some(&handle) {
                self.strings.remove(string.as_str());
            }
        }
        #[cfg(feature = "debug_trace_object")]
        gc_trace!("free {:?} {} bytes={}", handle, heap_object.object.obj_type(), heap_object.header.size);
        self.free_slots.push(handle.0);
        heap_object.header.size
    }

    pub fn free_env(&mut self, handle: EnvRef) {
        if self.env_slots[handle.index()].take().is_some() {
            gc_trace!("free env {:?}", handle);
            self.free_env_slots.push(handle.0);
            self.env_bytes -= Env::SIZE;
        }
    }

    #[inline]
    pub fn is_live(&self, handle: ObjRef) -> bool {
        matches!(self.slots.get(handle.index()), Some(Some(_)))
    }

    #[inline]
    pub fn get(&self, handle: ObjRef) -> &HeapObject {
        match self.slots.get(handle.index()) {
            Some(Some(object)) => object,
            _ => panic!("use of freed object {:?}", handle),
        }
    }

    #[inline]
    pub fn get_mut(&mut self, handle: ObjRef) -> &mut HeapObject {
        match self.slots.get_mut(handle.index()) {
            Some(Some(object)) => object,
            _ => panic!("use of freed object {:?}", handle),
        }
    }

    #[inline]
    pub fn header(&self, handle: ObjRef) -> &ObjHeader {
        &self.get(handle).header
    }

    #[inline]
    pub fn header_mut(&mut self, handle: ObjRef) -> &mut ObjHeader {
        &mut self.get_mut(handle).header
    }

    #[inline]
    pub fn object(&self, handle: ObjRef) -> &Object {
        &self.get(handle).object
    }

    #[inline]
    pub fn object_mut(&mut self, handle: ObjRef) -> &mut Object {
        &mut self.get_mut(handle).object
    }

    #[inline]
    pub fn env(&self, handle: EnvRef) -> &Env {
        match self.env_slots.get(handle.index()) {
            Some(Some(env)) => env,
            _ => panic!("use of freed env {:?}", handle),
        }
    }

    #[inline]
    pub fn env_mut(&mut self, handle: EnvRef) -> &mut Env {
        match self.env_slots.get_mut(handle.index()) {
            Some(Some(env)) => env,
            _ => panic!("use of freed env {:?}", handle),
        }
    }

    pub fn is_env_live(&self, handle: EnvRef) -> bool {
        matches!(self.env_slots.get(handle.index()), Some(Some(_)))
    }

    /// Recompute an object's size after it grew or shrank and fix the counters.
    pub fn refresh_size(&mut self, handle: ObjRef) {
        let heap_object = self.get_mut(handle);
        let size = heap_object.object.deep_size();
        let previous = heap_object.header.size;
        if size == previous {
            return;
        }
        heap_object.header.size = size;
        let generation = heap_object.header.generation;
        let counter = match generation {
            Generation::Young => &mut self.young_bytes,
            Generation::Old => &mut self.old_bytes,
        };
        *counter = (*counter + size).saturating_sub(previous);
    }

    pub fn young_bytes(&self) -> usize {
        self.young_bytes
    }

    pub fn old_bytes(&self) -> usize {
        self.old_bytes
    }

    pub fn env_bytes(&self) -> usize {
        self.env_bytes
    }

    pub fn total_bytes(&self) -> usize {
        self.young_bytes + self.old_bytes + self.env_bytes
    }

    pub fn young_count(&self) -> usize {
        self.young.len()
    }

    pub fn old_count(&self) -> usize {
        self.old.len()
    }

    pub fn env_count(&self) -> usize {
        self.envs.len()
    }

    pub fn interned(&self) -> impl Iterator<Item = ObjRef> + '_ {
        self.strings.values().copied()
    }

    /// Iterate over all managed objects.
    pub fn iter(&self) -> impl Iterator<Item = ObjRef> + '_ {
        self.young.iter().chain(self.old.iter()).copied()
    }

    // ---- typed views ----

    pub fn obj_type(&self, value: Value) -> Option<ObjectType> {
        value.as_obj().map(|handle| self.object(handle).obj_type())
    }

    pub fn as_string(&self, handle: ObjRef) -> Option<&ObjectString> {
        match self.object(handle) {
            Object::String(string) => Some(string),
            _ => None,
        }
    }

    pub fn as_array(&self, handle: ObjRef) -> Option<&ObjectArray> {
        match self.object(handle) {
            Object::Array(array) => Some(array),
            _ => None,
        }
    }

    pub fn as_array_mut(&mut self, handle: ObjRef) -> Option<&mut ObjectArray> {
        match self.object_mut(handle) {
            Object::Array(array) => Some(array),
            _ => None,
        }
    }

    pub fn as_map(&self, handle: ObjRef) -> Option<&ObjectMap> {
        match self.object(handle) {
            Object::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_map_mut(&mut self, handle: ObjRef) -> Option<&mut ObjectMap> {
        match self.object_mut(handle) {
            Object::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_function(&self, handle: ObjRef) -> Option<&ObjectFunction> {
        match self.object(handle) {
            Object::Function(function) => Some(function),
            _ => None,
        }
    }

    pub fn as_function_mut(&mut self, handle: ObjRef) -> Option<&mut ObjectFunction> {
        match self.object_mut(handle) {
            Object::Function(function) => Some(function),
            _ => None,
        }
    }

    pub fn as_class(&self, handle: ObjRef) -> Option<&ObjectClass> {
        match self.object(handle) {
            Object::Class(class) => Some(class),
            _ => None,
        }
    }

    pub fn as_instance(&self, handle: ObjRef) -> Option<&ObjectInstance> {
        match self.object(handle) {
            Object::Instance(instance) => Some(instance),
            _ => None,
        }
    }

    /// Text of a string handle. Non-strings read as empty.
    pub fn str(&self, handle: ObjRef) -> &str {
        self.as_string(handle).map(ObjectString::as_str).unwrap_or("")
    }

    pub fn value_str(&self, value: Value) -> Option<&str> {
        value.as_obj().and_then(|handle| self.as_string(handle)).map(ObjectString::as_str)
    }

    pub fn is_string(&self, value: Value) -> bool {
        self.obj_type(value) == Some(ObjectType::String)
    }

    pub fn is_array(&self, value: Value) -> bool {
        self.obj_type(value) == Some(ObjectType::Array)
    }

    pub fn is_map(&self, value: Value) -> bool {
        self.obj_type(value) == Some(ObjectType::Map)
    }

    fn string_hash(&self, handle: ObjRef) -> u32 {
        self.as_string(handle).map(|s| s.hash).unwrap_or(0)
    }

    fn strings_equal(&self, a: ObjRef, b: ObjRef) -> bool {
        if a == b {
            return true;
        }
        match (self.as_string(a), self.as_string(b)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    // ---- arrays ----

    pub fn array_push(&mut self, array: ObjRef, value: Value) -> bool {
        match self.as_array_mut(array) {
            Some(items) => items.push(value),
            None => return false,
        }
        self.refresh_size(array);
        true
    }

    pub fn array_set(&mut self, array: ObjRef, index: i64, value: Value) -> bool {
        let stored = match self.as_array_mut(array) {
            Some(items) => items.set(index, value),
            None => false,
        };
        if stored {
            self.refresh_size(array);
        }
        stored
    }

    // ---- maps ----

    /// Index of `key` in `map`, matching by identity or by string content.
    pub fn map_find(&self, map: ObjRef, key: ObjRef) -> Option<usize> {
        let hash = self.string_hash(key);
        self.as_map(map)?.find(key, hash, |candidate| self.strings_equal(candidate, key))
    }

    pub fn map_get(&self, map: ObjRef, key: ObjRef) -> Option<Value> {
        let index = self.map_find(map, key)?;
        self.as_map(map)?.entry(index).map(|(_, value)| value)
    }

    pub fn map_get_str(&self, map: ObjRef, name: &str) -> Option<Value> {
        let table = self.as_map(map)?;
        let index = table.probe_by_content(hash_str(name), |candidate| self.str(candidate) == name)?;
        table.entry(index).map(|(_, value)| value)
    }

    /// Insert or overwrite. Returns true when the key was not present.
    pub fn map_set(&mut self, map: ObjRef, key: ObjRef, value: Value) -> bool {
        let hash = self.string_hash(key);
        let grow = match self.as_map(map) {
            Some(table) => table.needs_grow(),
            None => return false,
        };
        if grow {
            if let Some(table) = self.as_map_mut(map) {
                table.grow();
            }
        }
        let slot = self
            .as_map(map)
            .and_then(|table| table.probe(key, hash, |candidate| self.strings_equal(candidate, key)));
        let Some((index, _)) = slot else {
            return false;
        };
        let is_new = self.as_map_mut(map).map(|table| table.write(index, key, hash, value)).unwrap_or(false);
        if grow {
            self.refresh_size(map);
        }
        is_new
    }

    pub fn map_remove(&mut self, map: ObjRef, key: ObjRef) -> bool {
        match self.map_find(map, key) {
            Some(index) => self.as_map_mut(map).map(|table| table.remove_at(index)).unwrap_or(false),
            None => false,
        }
    }

    pub fn map_len(&self, map: ObjRef) -> usize {
        self.as_map(map).map(ObjectMap::len).unwrap_or(0)
    }

    /// Snapshot of a map's entries, for callers that mutate the heap while iterating.
    pub fn map_entries(&self, map: ObjRef) -> Vec<(ObjRef, Value)> {
        self.as_map(map).map(|table| table.iter().collect()).unwrap_or_default()
    }

    // ---- environments ----

    /// Resolve `name` through the chain starting at `env`.
    pub fn env_get(&self, mut env: EnvRef, name: ObjRef) -> Option<Value> {
        loop {
            let record = self.env(env);
            if let Some(value) = self.map_get(record.values, name) {
                return Some(value);
            }
            if let Some(value) = self.map_get(record.consts, name) {
                return Some(value);
            }
            env = record.enclosing?;
        }
    }

    /// Define in `env`'s own scope. Returns the map written, for the write barrier.
    pub fn env_define(&mut self, env: EnvRef, name: ObjRef, value: Value) -> ObjRef {
        let values = self.env(env).values;
        self.map_set(values, name, value);
        values
    }

    pub fn env_define_const(&mut self, env: EnvRef, name: ObjRef, value: Value) -> ObjRef {
        let consts = self.env(env).consts;
        self.map_set(consts, name, value);
        consts
    }

    /// Overwrite the nearest existing binding. Returns the map written.
    pub fn env_assign(&mut self, mut env: EnvRef, name: ObjRef, value: Value) -> Result<ObjRef, AssignError> {
        loop {
            let record = self.env(env);
            let (values, consts, enclosing) = (record.values, record.consts, record.enclosing);
            if let Some(index) = self.map_find(values, name) {
                if let Some(table) = self.as_map_mut(values) {
                    table.set_value_at(index, value);
                }
                return Ok(values);
            }
            if self.map_find(consts, name).is_some() {
                return Err(AssignError::Constant);
            }
            env = enclosing.ok_or(AssignError::Undefined)?;
        }
    }

    /// Every name visible from `env`, innermost first.
    pub fn env_names(&self, mut env: EnvRef) -> Vec<&str> {
        let mut names = Vec::new();
        loop {
            let record = self.env(env);
            for map in [record.values, record.consts] {
                if let Some(table) = self.as_map(map) {
                    names.extend(table.iter().map(|(key, _)| self.str(key)));
                }
            }
            match record.enclosing {
                Some(enclosing) => env = enclosing,
                None => return names,
            }
        }
    }

    // ---- value semantics ----

    /// Strings compare by content, other objects by identity.
    pub fn values_equal(&self, a: Value, b: Value) -> bool {
        match (a, b) {
            (Value::Obj(x), Value::Obj(y)) => {
                if x == y {
                    return true;
                }
                match (self.as_string(x), self.as_string(y)) {
                    (Some(x), Some(y)) => x == y,
                    _ => false,
                }
            }
            _ => a == b,
        }
    }

    pub fn type_name(&self, value: Value) -> String {
        match value {
            Value::Null => "null".to_string(),
            Value::Bool(_) => "bool".to_string(),
            Value::Number(_) => "number".to_string(),
            Value::Obj(handle) => self.object(handle).obj_type().to_string(),
        }
    }

    pub fn display_value(&self, value: Value) -> String {
        let mut out = String::new();
        self.write_value(&mut out, value, 0);
        out
    }

    fn write_value(&self, out: &mut String, value: Value, depth: usize) {
        match value {
            Value::Null => out.push_str("null"),
            Value::Bool(b) => out.push_str(if b { "true" } else { "false" }),
            Value::Number(n) => out.push_str(&format_number(n)),
            Value::Obj(handle) => {
                if depth >= DISPLAY_DEPTH_MAX {
                    out.push_str("...");
                    return;
                }
                self.write_object(out, handle, depth)
            }
        }
    }

    fn write_object(&self, out: &mut String, handle: ObjRef, depth: usize) {
        match self.object(handle) {
            Object::String(string) => out.push_str(string.as_str()),
            Object::Array(array) => {
                out.push('[');
                for (i, item) in array.items.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    self.write_value(out, *item, depth + 1);
                }
                out.push(']');
            }
            Object::Map(map) => {
                out.push('{');
                for (i, (key, value)) in map.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    out.push_str(self.str(key));
                    out.push_str(": ");
                    self.write_value(out, value, depth + 1);
                }
                out.push('}');
            }
            Object::Function(function) => {
                let name = self.str(function.name);
                if name.is_empty() {
                    out.push_str("<fun>");
                } else {
                    out.push_str(&format!("<fun {}>", name));
                }
            }
            Object::Native(native) => out.push_str(&format!("<native {}>", self.str(native.name))),
            Object::Class(class) => out.push_str(&format!("<class {}>", self.str(class.name))),
            Object::Instance(instance) => {
                let class_name = self.as_class(instance.class).map(|c| self.str(c.name)).unwrap_or("?");
                out.push_str(&format!("<{} instance>", class_name));
            }
            Object::BoundMethod(_) => out.push_str("<bound method>"),
            Object::EnumCtor(ctor) => {
                out.push_str(&format!("<enum {}.{}>", self.str(ctor.enum_name), self.str(ctor.variant)))
            }
        }
    }
}

impl Default for ObjectManager {
    fn default() -> Self {
        Self::new()
    }
}
