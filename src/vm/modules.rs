use std::{path::Path, rc::Rc};

use log::debug;

use crate::{
    call_frame::ModuleFrame,
    error::{RuntimeError, RuntimeErrorKind},
    objects::{object::ObjRef, object_class::ObjectClass},
    value::Value,
};

use super::VM;

/// Source of module bodies for `IMPORT`. Resolution and compilation live
/// outside the engine; `load` hands back a zero-parameter function whose body
/// is the module.
pub trait ModuleLoader {
    /// Map an import path, as written, to a canonical key. `from` is the path
    /// of the importing program, if it has one.
    fn resolve(&self, from: Option<&str>, path: &str) -> Option<String>;

    fn load(&mut self, vm: &mut VM, resolved: &str) -> Result<ObjRef, String>;
}

/// Refuses every import.
pub struct NoModuleLoader;

impl ModuleLoader for NoModuleLoader {
    fn resolve(&self, _from: Option<&str>, _path: &str) -> Option<String> {
        None
    }

    fn load(&mut self, _vm: &mut VM, resolved: &str) -> Result<ObjRef, String> {
        Err(format!("no loader for '{}'", resolved))
    }
}

const MODULE_EXTENSION: &str = "mo";

impl VM {
    /// `IMPORT` / `IMPORT_MODULE`. A cached module is bound straight away,
    /// otherwise its body is pushed as a new frame and bound when it returns.
    pub(crate) fn import(&mut self, path: Value, alias: Option<ObjRef>, push_instance: bool) -> Result<(), RuntimeError> {
        let Some(raw) = self.heap.value_str(path).map(str::to_string) else {
            return Err(RuntimeError::type_mismatch("Import path must be a string."));
        };
        let Some(mut resolved) = self.loader.resolve(self.current_path.as_deref(), &raw) else {
            return Err(RuntimeError::type_mismatch("Failed to resolve import path."));
        };
        if Path::new(&resolved).extension().is_none() {
            resolved.push('.');
            resolved.push_str(MODULE_EXTENSION);
        }

        let key = self.intern(&resolved);
        match self.heap.map_get(self.modules, key) {
            Some(Value::Bool(true)) => return Err(RuntimeError::type_mismatch("Circular import detected.")),
            Some(instance @ Value::Obj(_)) => {
                debug!("module cache hit: {}", resolved);
                self.bind_module(instance, alias, push_instance);
                return Ok(());
            }
            _ => {}
        }
        self.map_set(self.modules, key, Value::Bool(true));

        let mut loader = std::mem::replace(&mut self.loader, Box::new(NoModuleLoader));
        let loaded = loader.load(self, &resolved);
        self.loader = loader;
        let function = match loaded {
            Ok(function) => function,
            Err(message) => {
                self.map_set(self.modules, key, Value::Null);
                return Err(RuntimeError::type_mismatch(format!(
                    "Failed to load module '{}': {}",
                    resolved, message
                )));
            }
        };

        self.push(Value::Obj(function));
        if let Err(error) = self.call_function(function, 0, None) {
            self.pop();
            self.map_set(self.modules, key, Value::Null);
            return Err(error);
        }
        let stem = Path::new(&resolved)
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or(&resolved)
            .to_string();
        let name = self.intern(&stem);
        let exports = self.new_map(0);
        let private = self.new_map(0);
        let env = self.env;
        self.current_path = Some(Rc::from(resolved.as_str()));
        if let Some(frame) = self.frames.last_mut() {
            frame.discard_result = true;
            frame.module = Some(ModuleFrame {
                key,
                name,
                env,
                exports,
                private,
                alias,
                push_instance,
            });
        }
        debug!("loading module {}", resolved);
        Ok(())
    }

    /// Build the instance for a module whose body just returned. The caller's
    /// env is already restored.
    pub(crate) fn finish_module(&mut self, module: ModuleFrame) {
        let values = self.heap.env(module.env).values;
        let fields = self.new_map(self.heap.map_len(values));
        for (name, value) in self.heap.map_entries(values) {
            if self.heap.map_get(module.private, name).is_none() {
                self.map_set(fields, name, value);
            }
        }
        for (name, value) in self.heap.map_entries(module.exports) {
            self.map_set(fields, name, value);
        }
        let methods = self.new_map(0);
        let class = self.new_class(ObjectClass::new(module.name, methods));
        let instance = Value::Obj(self.new_instance(class, fields));
        self.map_set(self.modules, module.key, instance);
        debug!("module {} ready", self.heap.str(module.key));
        self.bind_module(instance, module.alias, module.push_instance);
    }

    fn bind_module(&mut self, instance: Value, alias: Option<ObjRef>, push_instance: bool) {
        if let Some(alias) = alias {
            self.define_var(self.env, alias, instance);
        }
        if push_instance {
            self.push(instance);
        }
    }

    fn module_frame(&self) -> Option<&ModuleFrame> {
        self.frames.iter().rev().find_map(|frame| frame.module.as_ref())
    }

    /// `EXPORT`: publish the current value of a binding.
    pub(crate) fn export_binding(&mut self, name: ObjRef) -> Result<(), RuntimeError> {
        let Some(value) = self.heap.env_get(self.env, name) else {
            return Err(self.undefined_variable(name));
        };
        self.export_value(name, value);
        Ok(())
    }

    /// Exports outside a module body have nowhere to go and are dropped.
    pub(crate) fn export_value(&mut self, name: ObjRef, value: Value) {
        if let Some(exports) = self.module_frame().map(|module| module.exports) {
            self.map_set(exports, name, value);
        }
    }

    /// `EXPORT_FROM`: re-export fields of another module. An empty list
    /// re-exports all of them under their own names.
    pub(crate) fn export_from(&mut self, module: Value, names: &[(ObjRef, ObjRef)]) -> Result<(), RuntimeError> {
        let fields = match module {
            Value::Obj(handle) => self.heap.as_instance(handle).map(|instance| instance.fields),
            _ => None,
        };
        let Some(fields) = fields else {
            return Err(RuntimeError::type_mismatch("Can only re-export from a module."));
        };
        if names.is_empty() {
            for (name, value) in self.heap.map_entries(fields) {
                self.export_value(name, value);
            }
            return Ok(());
        }
        for &(from, to) in names {
            let Some(value) = self.heap.map_get(fields, from) else {
                return Err(RuntimeErrorKind::UndefinedProperty {
                    name: self.heap.str(from).to_string(),
                    suggestion: None,
                }
                .into());
            };
            self.export_value(to, value);
        }
        Ok(())
    }

    /// `PRIVATE`: keep a top-level name out of the module instance.
    pub(crate) fn mark_private(&mut self, name: ObjRef) {
        if let Some(private) = self.module_frame().map(|module| module.private) {
            self.map_set(private, name, Value::Bool(true));
        }
    }

    /// Drop "loading" markers left behind by a run that failed mid-import.
    pub(crate) fn forget_pending_modules(&mut self) {
        for (key, value) in self.heap.map_entries(self.modules) {
            if value == Value::Bool(true) {
                self.map_set(self.modules, key, Value::Null);
            }
        }
    }
}
