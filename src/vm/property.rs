use crate::{
    chunk::InlineCache,
    error::{suggest, RuntimeError, RuntimeErrorKind},
    objects::object::{ObjRef, Object},
    value::Value,
};

use super::VM;

/// What a property name resolved to on an instance.
pub(crate) enum Member {
    Field(Value),
    Method(ObjRef),
}

impl VM {
    fn cache_at(&self, offset: usize) -> InlineCache {
        self.frames.last().map(|frame| frame.chunk.cache(offset)).unwrap_or_default()
    }

    fn fill_cache(&self, offset: usize, cache: InlineCache) {
        if let Some(frame) = self.frames.last() {
            frame.chunk.set_cache(offset, cache);
        }
    }

    fn same_key(&self, stored: ObjRef, name: ObjRef) -> bool {
        stored == name || self.heap.values_equal(Value::Obj(stored), Value::Obj(name))
    }

    /// Read `name` from `map`, consulting and refreshing the cache slot at `offset`.
    /// A hit is trusted only if the map handle, the version and the key at the
    /// cached index all still match.
    pub(crate) fn cached_entry(&self, map: ObjRef, name: ObjRef, offset: usize) -> Option<Value> {
        let table = self.heap.as_map(map)?;
        if let InlineCache::Field { map: cached, key, index, version } = self.cache_at(offset) {
            if cached == map && key == name && version == table.version() {
                if let Some((stored, value)) = table.entry(index) {
                    if self.same_key(stored, name) {
                        return Some(value);
                    }
                }
            }
        }
        let index = self.heap.map_find(map, name)?;
        let (_, value) = table.entry(index)?;
        self.fill_cache(
            offset,
            InlineCache::Field {
                map,
                key: name,
                index,
                version: table.version(),
            },
        );
        Some(value)
    }

    fn cached_method(&self, class: ObjRef, name: ObjRef, offset: usize) -> Option<ObjRef> {
        let methods = self.heap.as_class(class)?.methods;
        let table = self.heap.as_map(methods)?;
        if let InlineCache::Method { class: cached, key, index, version } = self.cache_at(offset) {
            if cached == class && key == name && version == table.version() {
                if let Some((stored, Value::Obj(method))) = table.entry(index) {
                    if self.same_key(stored, name) {
                        return Some(method);
                    }
                }
            }
        }
        let index = self.heap.map_find(methods, name)?;
        let (_, Value::Obj(method)) = table.entry(index)? else {
            return None;
        };
        self.fill_cache(
            offset,
            InlineCache::Method {
                class,
                key: name,
                index,
                version: table.version(),
            },
        );
        Some(method)
    }

    /// Fields shadow methods.
    pub(crate) fn instance_member(&self, instance: ObjRef, name: ObjRef, offset: usize) -> Option<Member> {
        let record = self.heap.as_instance(instance)?;
        let (class, fields) = (record.class, record.fields);
        if let Some(value) = self.cached_entry(fields, name, offset) {
            return Some(Member::Field(value));
        }
        self.cached_method(class, name, offset).map(Member::Method)
    }

    pub(crate) fn undefined_property(&self, instance: ObjRef, name: ObjRef) -> RuntimeError {
        let text = self.heap.str(name);
        let mut candidates = Vec::new();
        if let Some(record) = self.heap.as_instance(instance) {
            for map in [Some(record.fields), self.heap.as_class(record.class).map(|class| class.methods)]
                .into_iter()
                .flatten()
            {
                if let Some(table) = self.heap.as_map(map) {
                    candidates.extend(table.iter().map(|(key, _)| self.heap.str(key)));
                }
            }
        }
        RuntimeErrorKind::UndefinedProperty {
            name: text.to_string(),
            suggestion: suggest(text, candidates),
        }
        .into()
    }

    pub(crate) fn get_property(&mut self, object: Value, name: ObjRef, offset: usize, optional: bool) -> Result<Value, RuntimeError> {
        let handle = match object {
            Value::Null if optional => return Ok(Value::Null),
            Value::Obj(handle) => handle,
            _ => return Err(RuntimeError::type_mismatch("Only instances have properties.")),
        };
        match self.heap.object(handle) {
            Object::Instance(_) => match self.instance_member(handle, name, offset) {
                Some(Member::Field(value)) => Ok(value),
                Some(Member::Method(method)) => Ok(Value::Obj(self.new_bound_method(object, method))),
                None => Err(self.undefined_property(handle, name)),
            },
            Object::Map(_) => Ok(self.cached_entry(handle, name, offset).unwrap_or(Value::Null)),
            _ => Err(RuntimeError::type_mismatch("Only instances have properties.")),
        }
    }

    pub(crate) fn set_property(&mut self, object: Value, name: ObjRef, value: Value, offset: usize) -> Result<(), RuntimeError> {
        let Some((class, fields)) = object
            .as_obj()
            .and_then(|handle| self.heap.as_instance(handle))
            .map(|instance| (instance.class, instance.fields))
        else {
            return Err(RuntimeError::type_mismatch("Only instances have fields."));
        };
        if self.is_readonly(class, name) {
            return Err(RuntimeError::type_mismatch(format!(
                "Cannot assign to readonly field '{}'.",
                self.heap.str(name)
            )));
        }

        if let InlineCache::Field { map, key, index, version } = self.cache_at(offset) {
            let hit = map == fields
                && key == name
                && self.heap.as_map(fields).map_or(false, |table| {
                    table.version() == version && table.key_at(index).map_or(false, |stored| self.same_key(stored, name))
                });
            if hit {
                if let Some(table) = self.heap.as_map_mut(fields) {
                    table.set_value_at(index, value);
                }
                self.gc.write_barrier(&mut self.heap, fields, value);
                return Ok(());
            }
        }

        self.map_set(fields, name, value);
        if let (Some(index), Some(table)) = (self.heap.map_find(fields, name), self.heap.as_map(fields)) {
            self.fill_cache(
                offset,
                InlineCache::Field {
                    map: fields,
                    key: name,
                    index,
                    version: table.version(),
                },
            );
        }
        Ok(())
    }

    fn is_readonly(&self, class: ObjRef, name: ObjRef) -> bool {
        let Some(readonly) = self.heap.as_class(class).and_then(|class| class.shape.as_ref()).map(|shape| shape.readonly) else {
            return false;
        };
        self.heap
            .as_array(readonly)
            .map_or(false, |array| array.items.iter().any(|field| self.heap.values_equal(*field, Value::Obj(name))))
    }

    pub(crate) fn get_index(&mut self, object: Value, index: Value, offset: usize, optional: bool) -> Result<Value, RuntimeError> {
        let handle = match object {
            Value::Null if optional => return Ok(Value::Null),
            Value::Obj(handle) => handle,
            _ => return Err(RuntimeError::type_mismatch("Only arrays and maps can be indexed.")),
        };
        match self.heap.object(handle) {
            Object::Array(array) => {
                let Some(i) = index.as_integer() else {
                    return Err(RuntimeError::type_mismatch("Array index must be an integer."));
                };
                array
                    .get(i)
                    .ok_or_else(|| RuntimeError::from(RuntimeErrorKind::IndexOutOfRange { index: i, len: array.len() }))
            }
            Object::Map(_) => match index {
                Value::Obj(key) if self.heap.is_string(index) => Ok(self.cached_entry(handle, key, offset).unwrap_or(Value::Null)),
                _ => Err(RuntimeError::type_mismatch("Map index must be a string.")),
            },
            _ => Err(RuntimeError::type_mismatch("Only arrays and maps can be indexed.")),
        }
    }

    pub(crate) fn set_index(&mut self, object: Value, index: Value, value: Value) -> Result<(), RuntimeError> {
        let Value::Obj(handle) = object else {
            return Err(RuntimeError::type_mismatch("Only arrays and maps can be indexed."));
        };
        match self.heap.object(handle) {
            Object::Array(array) => {
                let len = array.len();
                let Some(i) = index.as_integer() else {
                    return Err(RuntimeError::type_mismatch("Array index must be an integer."));
                };
                if self.array_set(handle, i, value) {
                    Ok(())
                } else {
                    Err(RuntimeErrorKind::IndexOutOfRange { index: i, len }.into())
                }
            }
            Object::Map(_) => match index {
                Value::Obj(key) if self.heap.is_string(index) => {
                    self.map_set(handle, key, value);
                    Ok(())
                }
                _ => Err(RuntimeError::type_mismatch("Map index must be a string.")),
            },
            _ => Err(RuntimeError::type_mismatch("Only arrays and maps can be indexed.")),
        }
    }

    pub(crate) fn length_of(&self, value: Value) -> Result<usize, RuntimeError> {
        match value.as_obj().map(|handle| self.heap.object(handle)) {
            Some(Object::String(string)) => Ok(string.len()),
            Some(Object::Array(array)) => Ok(array.len()),
            Some(Object::Map(map)) => Ok(map.len()),
            _ => Err(RuntimeError::type_mismatch("Length is only defined for strings, arrays and maps.")),
        }
    }

    pub(crate) fn matches_enum(&self, value: Value, enum_name: ObjRef, variant: ObjRef) -> bool {
        let Some(map) = value.as_obj().filter(|_| self.heap.is_map(value)) else {
            return false;
        };
        let tag_matches = |key: ObjRef, expected: ObjRef| {
            self.heap
                .map_get(map, key)
                .map_or(false, |stored| self.heap.values_equal(stored, Value::Obj(expected)))
        };
        tag_matches(self.names.enum_key, enum_name) && tag_matches(self.names.tag_key, variant)
    }
}
