mod call;
mod exceptions;
mod exec;
mod modules;
mod natives;
mod property;

use std::rc::Rc;

use log::warn;

pub use self::modules::{ModuleLoader, NoModuleLoader};

use crate::{
    call_frame::{CallFrame, TryFrame},
    chunk::Chunk,
    config::VmConfig,
    env::EnvRef,
    error::{suggest, Location, RuntimeError, RuntimeErrorKind},
    gc::{GarbageCollector, Roots},
    objects::{
        object::{ObjRef, ObjectType},
        object_class::ObjectClass,
        object_enum::{ENUM_KEY, TAG_KEY, VALUES_KEY},
        object_function::ObjectFunction,
        object_manager::{AssignError, ObjectManager},
        object_native_function::NativeFn,
    },
    value::Value,
};

#[derive(PartialEq, Debug)]
pub enum InterpretResult {
    InterpretOk,
    InterpretCompileError,
    InterpretRuntimeError,
}

/// Snapshot of heap occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapStats {
    pub young_bytes: usize,
    pub old_bytes: usize,
    pub env_bytes: usize,
    pub young_objects: usize,
    pub old_objects: usize,
    pub envs: usize,
}

/// Interned names the engine looks up on hot paths.
pub(crate) struct Names {
    pub init: ObjRef,
    pub this: ObjRef,
    pub message: ObjRef,
    pub value: ObjRef,
    pub stack: ObjRef,
    pub error: ObjRef,
    pub enum_key: ObjRef,
    pub tag_key: ObjRef,
    pub values_key: ObjRef,
}

pub struct VM {
    pub(crate) stack: Vec<Value>,
    pub(crate) frames: Vec<CallFrame>,
    pub(crate) try_frames: Vec<TryFrame>,
    pub(crate) heap: ObjectManager,
    pub gc: GarbageCollector,
    pub(crate) globals: EnvRef,
    pub(crate) env: EnvRef,
    /// Map of resolved path to module instance (or `true` while loading).
    pub(crate) modules: ObjRef,
    pub(crate) args: ObjRef,
    pub(crate) pinned: Vec<Value>,
    pub(crate) current_path: Option<Rc<str>>,
    pub(crate) loader: Box<dyn ModuleLoader>,
    pub(crate) config: VmConfig,
    pub(crate) names: Names,
    /// Frames below this index belong to an outer dispatch loop.
    pub(crate) frame_floor: usize,
    instruction_count: u64,
    had_error: bool,
    last_error: Option<RuntimeError>,
    last_value: Value,
}

macro_rules! roots {
    ($vm:expr) => {
        Roots {
            stack: &$vm.stack,
            frames: &$vm.frames,
            try_frames: &$vm.try_frames,
            globals: $vm.globals,
            env: $vm.env,
            modules: $vm.modules,
            args: $vm.args,
            pinned: &$vm.pinned,
        }
    };
}

impl VM {
    pub fn new() -> VM {
        VM::with_config(VmConfig::default())
    }

    pub fn with_config(config: VmConfig) -> VM {
        let mut heap = ObjectManager::new();
        let (globals, _) = heap.alloc_env(None);
        let (modules, _) = heap.alloc_map(0);
        let (args, _) = heap.alloc_array(Vec::new());
        let mut intern = |text: &str| heap.intern(text).0;
        let names = Names {
            init: intern("init"),
            this: intern("this"),
            message: intern("message"),
            value: intern("value"),
            stack: intern("stack"),
            error: intern("__error"),
            enum_key: intern(ENUM_KEY),
            tag_key: intern(TAG_KEY),
            values_key: intern(VALUES_KEY),
        };
        let mut gc = GarbageCollector::new();
        gc.set_logging(config.gc_log);
        let mut vm = VM {
            stack: Vec::with_capacity(config.max_stack_slots),
            frames: Vec::with_capacity(config.max_frames),
            try_frames: Vec::new(),
            heap,
            gc,
            globals,
            env: globals,
            modules,
            args,
            pinned: Vec::new(),
            current_path: None,
            loader: Box::new(NoModuleLoader),
            config,
            names,
            frame_floor: 0,
            instruction_count: 0,
            had_error: false,
            last_error: None,
            last_value: Value::Null,
        };
        vm.setup_standards();
        vm
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn heap(&self) -> &ObjectManager {
        &self.heap
    }

    pub fn set_loader(&mut self, loader: Box<dyn ModuleLoader>) {
        self.loader = loader;
    }

    /// Replace the values returned by the `args` native.
    pub fn set_args(&mut self, args: &[&str]) {
        let items: Vec<Value> = args.iter().map(|arg| Value::Obj(self.new_string(arg))).collect();
        self.args = self.new_array(items);
    }

    /// Run a script function to completion on a fresh stack.
    pub fn interpret(&mut self, function: ObjRef) -> InterpretResult {
        self.reset_stack();
        self.had_error = false;
        self.last_error = None;
        self.last_value = Value::Null;

        #[cfg(feature = "debug_print_code")]
        if self.config.debug_bytecode {
            if let Some(chunk) = self.heap.as_function(function).map(|f| Rc::clone(&f.chunk)) {
                print!("{}", crate::debug::disassemble_chunk(&chunk, &self.heap, "<script>"));
            }
        }

        if let Err(error) = self.call_script(function) {
            return self.fail(error);
        }
        match self.run() {
            Ok(value) => {
                self.last_value = value;
                InterpretResult::InterpretOk
            }
            Err(error) => self.fail(error),
        }
    }

    fn fail(&mut self, error: RuntimeError) -> InterpretResult {
        self.had_error = true;
        if self.config.stack_trace {
            eprintln!("{}", error);
            if !error.stack_trace.is_empty() {
                eprintln!("Stack trace (most recent call last):");
                for line in &error.stack_trace {
                    eprintln!("  {}", line);
                }
            }
        }
        self.last_error = Some(error);
        InterpretResult::InterpretRuntimeError
    }

    fn reset_stack(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.try_frames.clear();
        self.pinned.clear();
        self.env = self.globals;
        self.current_path = None;
        self.frame_floor = 0;
        self.instruction_count = 0;
        self.forget_pending_modules();
    }

    pub fn had_error(&self) -> bool {
        self.had_error
    }

    /// Diagnostic for the most recent failed `interpret`.
    pub fn last_error(&self) -> Option<&RuntimeError> {
        self.last_error.as_ref()
    }

    /// Value returned by the script frame of the most recent successful `interpret`.
    pub fn last_value(&self) -> Value {
        self.last_value
    }

    pub fn global(&self, name: &str) -> Option<Value> {
        let env = self.heap.env(self.globals);
        self.heap.map_get_str(env.values, name).or_else(|| self.heap.map_get_str(env.consts, name))
    }

    pub fn display(&self, value: Value) -> String {
        self.heap.display_value(value)
    }

    // ---- building functions for the engine ----

    /// Wrap a chunk as a function object. `min_arity` parameters are required,
    /// the rest default to null.
    pub fn function(&mut self, name: &str, params: &[&str], min_arity: u8, chunk: Chunk) -> ObjRef {
        let name = self.intern(name);
        let params = params.iter().map(|param| self.intern(param)).collect();
        let function = ObjectFunction::new(name, params, min_arity, Rc::new(chunk));
        let (handle, _) = self.heap.alloc_function(function);
        self.track_allocation();
        handle
    }

    /// A zero-parameter function suitable for `interpret`.
    pub fn script(&mut self, chunk: Chunk) -> ObjRef {
        self.function("", &[], 0, chunk)
    }

    /// Attach a source path to a function for diagnostics and relative imports.
    pub fn set_function_path(&mut self, function: ObjRef, path: &str) {
        if let Some(function) = self.heap.as_function_mut(function) {
            function.path = Some(Rc::from(path));
        }
    }

    pub fn enum_ctor(&mut self, enum_name: &str, variant: &str, arity: u8) -> Value {
        let enum_name = self.intern(enum_name);
        let variant = self.intern(variant);
        let (handle, _) = self.heap.alloc_enum_ctor(enum_name, variant, arity);
        self.track_allocation();
        Value::Obj(handle)
    }

    pub fn define_native(&mut self, name: &str, arity: i32, function: NativeFn) {
        let name = self.intern(name);
        let (native, _) = self.heap.alloc_native_function(name, arity, function);
        self.track_allocation();
        self.define_var(self.globals, name, Value::Obj(native));
    }

    // ---- stack ----

    #[inline]
    pub(crate) fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    #[inline]
    pub(crate) fn pop(&mut self) -> Value {
        self.stack.pop().unwrap_or_default()
    }

    #[inline]
    pub(crate) fn peek(&self) -> Value {
        self.peek_steps(0)
    }

    #[inline]
    pub(crate) fn peek_steps(&self, distance: usize) -> Value {
        let len = self.stack.len();
        if distance < len {
            self.stack[len - 1 - distance]
        } else {
            Value::Null
        }
    }

    /// Keep `value` alive across a re-entrant call from a native. Pins made
    /// inside a native are released when that native returns.
    pub fn pin(&mut self, value: Value) {
        self.pinned.push(value);
    }

    pub fn unpin(&mut self) {
        self.pinned.pop();
    }

    // ---- heap helpers: allocate, then account ----

    #[inline]
    pub(crate) fn track_allocation(&mut self) {
        self.gc.note_allocation(&self.heap);
    }

    pub fn intern(&mut self, text: &str) -> ObjRef {
        let (handle, size) = self.heap.intern(text);
        if size > 0 {
            self.track_allocation();
        }
        handle
    }

    pub fn new_string(&mut self, text: &str) -> ObjRef {
        let (handle, _) = self.heap.alloc_string(text);
        self.track_allocation();
        handle
    }

    pub fn new_array(&mut self, items: Vec<Value>) -> ObjRef {
        let (handle, _) = self.heap.alloc_array(items);
        self.track_allocation();
        handle
    }

    pub fn new_map(&mut self, capacity: usize) -> ObjRef {
        let (handle, _) = self.heap.alloc_map(capacity);
        self.track_allocation();
        handle
    }

    pub(crate) fn new_env(&mut self, enclosing: Option<EnvRef>) -> EnvRef {
        let (env, _) = self.heap.alloc_env(enclosing);
        self.track_allocation();
        env
    }

    pub(crate) fn new_class(&mut self, class: ObjectClass) -> ObjRef {
        let (handle, _) = self.heap.alloc_class(class);
        self.track_allocation();
        handle
    }

    pub(crate) fn new_instance(&mut self, class: ObjRef, fields: ObjRef) -> ObjRef {
        let (handle, _) = self.heap.alloc_instance(class, fields);
        self.track_allocation();
        handle
    }

    pub(crate) fn new_bound_method(&mut self, receiver: Value, method: ObjRef) -> ObjRef {
        let (handle, _) = self.heap.alloc_bound_method(receiver, method);
        self.track_allocation();
        handle
    }

    pub fn map_set(&mut self, map: ObjRef, key: ObjRef, value: Value) {
        self.heap.map_set(map, key, value);
        self.gc.write_barrier(&mut self.heap, map, Value::Obj(key));
        self.gc.write_barrier(&mut self.heap, map, value);
        self.track_allocation();
    }

    pub fn array_push(&mut self, array: ObjRef, value: Value) {
        if self.heap.array_push(array, value) {
            self.gc.write_barrier(&mut self.heap, array, value);
            self.track_allocation();
        }
    }

    pub(crate) fn array_set(&mut self, array: ObjRef, index: i64, value: Value) -> bool {
        let stored = self.heap.array_set(array, index, value);
        if stored {
            self.gc.write_barrier(&mut self.heap, array, value);
            self.track_allocation();
        }
        stored
    }

    pub(crate) fn define_var(&mut self, env: EnvRef, name: ObjRef, value: Value) {
        let map = self.heap.env_define(env, name, value);
        self.gc.write_barrier(&mut self.heap, map, Value::Obj(name));
        self.gc.write_barrier(&mut self.heap, map, value);
        self.track_allocation();
    }

    pub(crate) fn define_const(&mut self, env: EnvRef, name: ObjRef, value: Value) {
        let map = self.heap.env_define_const(env, name, value);
        self.gc.write_barrier(&mut self.heap, map, Value::Obj(name));
        self.gc.write_barrier(&mut self.heap, map, value);
        self.track_allocation();
    }

    pub(crate) fn assign_var(&mut self, name: ObjRef, value: Value) -> Result<(), RuntimeError> {
        match self.heap.env_assign(self.env, name, value) {
            Ok(map) => {
                self.gc.write_barrier(&mut self.heap, map, value);
                Ok(())
            }
            Err(AssignError::Constant) => Err(RuntimeError::type_mismatch("Cannot assign to constant.")),
            Err(AssignError::Undefined) => Err(self.undefined_variable(name)),
        }
    }

    /// Assign through the chain, or define in the current scope if unbound.
    pub(crate) fn assign_or_define(&mut self, name: ObjRef, value: Value) {
        if self.assign_var(name, value).is_err() {
            self.define_var(self.env, name, value);
        }
    }

    // ---- diagnostics ----

    pub(crate) fn undefined_variable(&self, name: ObjRef) -> RuntimeError {
        let text = self.heap.str(name);
        let suggestion = suggest(text, self.heap.env_names(self.env));
        RuntimeErrorKind::UndefinedVariable {
            name: text.to_string(),
            suggestion,
        }
        .into()
    }

    /// Attach the failing instruction's location and a stack trace, unless already present.
    pub(crate) fn locate(&self, mut error: RuntimeError) -> RuntimeError {
        if error.location.line == 0 {
            if let Some(frame) = self.frames.last() {
                if let Some(token) = frame.chunk.token_at(frame.current_offset()) {
                    error.location = Location {
                        path: self.current_path.clone(),
                        line: token.line,
                        column: token.column,
                        lexeme: token.lexeme.clone(),
                    };
                }
            }
            if error.location.path.is_none() {
                error.location.path = self.current_path.clone();
            }
        }
        if error.stack_trace.is_empty() {
            error.stack_trace = self.capture_stack_trace();
        }
        error
    }

    pub fn capture_stack_trace(&self) -> Vec<String> {
        let mut lines = Vec::with_capacity(self.frames.len());
        for (depth, frame) in self.frames.iter().enumerate() {
            let function = self.heap.as_function(frame.function);
            let name = if frame.is_script {
                "<script>".to_string()
            } else if frame.module.is_some() {
                "<module>".to_string()
            } else {
                match function.map(|f| self.heap.str(f.name)) {
                    Some(name) if !name.is_empty() => name.to_string(),
                    _ => "<fn>".to_string(),
                }
            };
            let path = function.and_then(|f| f.path.as_deref()).unwrap_or("<script>");
            let mut line = match frame.chunk.token_at(frame.current_offset()) {
                Some(token) if token.line > 0 => {
                    format!("#{} {} ({}:{}:{})", depth, name, path, token.line, token.column)
                }
                _ => format!("#{} {} ({})", depth, name, path),
            };
            if let Some(lexeme) = frame.chunk.token_at(frame.current_offset()).and_then(|t| t.lexeme.as_deref()) {
                line.push_str(&format!(" -> '{}'", lexeme));
            }
            lines.push(line);
        }
        lines
    }

    /// Per-instruction ceilings. A heap breach first forces a full collection.
    pub(crate) fn check_limits(&mut self) -> Result<(), RuntimeError> {
        if self.stack.len() > self.config.max_stack_slots {
            return Err(RuntimeErrorKind::StackLimitExceeded(self.config.max_stack_slots).into());
        }
        if let Some(max) = self.config.max_heap_bytes {
            if self.heap.total_bytes() > max {
                warn!("heap limit {} exceeded ({} bytes), forcing collection", max, self.heap.total_bytes());
                self.collect_garbage();
                if self.heap.total_bytes() > max {
                    return Err(RuntimeErrorKind::HeapLimitExceeded(max).into());
                }
            }
        }
        Ok(())
    }

    // ---- collector entry points ----

    /// `OP_GC` safe point.
    pub(crate) fn gc_checkpoint(&mut self) {
        let roots = roots!(self);
        self.gc.gc_maybe(&mut self.heap, &roots);
    }

    /// Run a full major collection, including the whole old-space sweep.
    pub fn collect_garbage(&mut self) {
        let roots = roots!(self);
        self.gc.collect_garbage(&mut self.heap, &roots);
    }

    pub fn collect_young(&mut self) {
        let roots = roots!(self);
        self.gc.collect_young(&mut self.heap, &roots);
    }

    pub fn heap_stats(&self) -> HeapStats {
        HeapStats {
            young_bytes: self.heap.young_bytes(),
            old_bytes: self.heap.old_bytes(),
            env_bytes: self.heap.env_bytes(),
            young_objects: self.heap.young_count(),
            old_objects: self.heap.old_count(),
            envs: self.heap.env_count(),
        }
    }

    pub fn is_live(&self, object: ObjRef) -> bool {
        self.heap.is_live(object)
    }

    pub fn is_young(&self, object: ObjRef) -> bool {
        self.heap.is_live(object) && self.heap.header(object).is_young()
    }

    pub fn is_remembered(&self, object: ObjRef) -> bool {
        self.heap.is_live(object) && self.heap.header(object).remembered
    }

    // Test-only helper: allow tests to lower GC thresholds to force cycles under smaller workloads.
    #[cfg(test)]
    pub(crate) fn set_gc_thresholds(&mut self, young: usize, full: usize) {
        self.gc.set_thresholds(young, full);
    }

    pub(crate) fn value_type(&self, value: Value) -> Option<ObjectType> {
        self.heap.obj_type(value)
    }
}

impl Default for VM {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "debug_trace_execution")]
mod debug_feature {
    use super::*;

    pub fn disassemble_instruction(vm: &VM) {
        let mut line = format!("{: >17}", "");
        for slot in &vm.stack {
            line.push_str(&format!(" [ {} ]", vm.heap.display_value(*slot)));
        }
        println!("{}", line);
        if let Some(frame) = vm.frames.last() {
            let mut out = String::new();
            crate::debug::disassemble_instruction(&frame.chunk, &vm.heap, frame.ip, &mut out);
            print!("{}", out);
        }
    }
}


#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::test_support::run_script;
    use super::{InterpretResult, VM};
    use crate::chunk::OpCode;
    use crate::objects::object::ObjRef;
    use crate::value::Value;

    fn global_obj(vm: &VM, name: &str) -> ObjRef {
        vm.global(name).and_then(|value| value.as_obj()).unwrap()
    }

    /// Globals `kept` (an array) and `garbage` (an array, then unbound).
    fn prepare(vm: &mut VM) -> (ObjRef, ObjRef) {
        run_script(vm, |a| {
            a.op(OpCode::Array).short(0).named(OpCode::DefineVar, "kept");
            a.op(OpCode::Array).short(0).named(OpCode::DefineVar, "garbage");
            a.op(OpCode::Null).op(OpCode::Return);
        });
        let kept = global_obj(vm, "kept");
        let garbage = global_obj(vm, "garbage");
        vm.set_gc_thresholds(0, usize::MAX);
        let result = run_script(vm, |a| {
            a.op(OpCode::Null).named(OpCode::SetVar, "garbage").op(OpCode::Pop);
            a.op(OpCode::Gc);
            a.op(OpCode::Null).op(OpCode::Return);
        });
        assert_eq!(result, InterpretResult::InterpretOk);
        (kept, garbage)
    }

    #[test]
    fn minor_collection_frees_unreachable_young_objects() {
        let mut vm = VM::new();
        let (kept, garbage) = prepare(&mut vm);
        assert_eq!(vm.gc.stats().minor_cycles, 1);
        assert!(!vm.is_live(garbage));
        assert!(vm.is_live(kept));
        assert!(vm.is_young(kept));
    }

    #[test]
    fn survivors_are_promoted_after_two_minors() {
        let mut vm = VM::new();
        let (kept, _) = prepare(&mut vm);
        let promoted_before = vm.gc.stats().promoted;
        vm.collect_young();
        assert!(!vm.is_young(kept));
        assert!(vm.gc.stats().promoted > promoted_before);
        assert!(vm.heap_stats().old_objects > 0);
    }

    #[test]
    fn storing_young_into_old_is_remembered() {
        let mut vm = VM::new();
        let (kept, _) = prepare(&mut vm);
        vm.collect_young();
        assert!(!vm.is_remembered(kept));

        run_script(&mut vm, |a| {
            a.named(OpCode::GetVar, "kept");
            a.op(OpCode::Array).short(0).num(1.0).op(OpCode::ArrayAppend);
            a.op(OpCode::ArrayAppend).op(OpCode::Pop);
            a.op(OpCode::Null).op(OpCode::Return);
        });
        assert!(vm.is_remembered(kept));
        let inner = vm.heap.as_array(kept).unwrap().items[0].as_obj().unwrap();
        assert!(vm.is_young(inner));

        vm.collect_young();
        assert!(vm.is_live(inner));
        assert_eq!(vm.display(Value::Obj(kept)), "[[1]]");
    }

    #[test]
    fn major_collection_is_transparent() {
        let mut vm = VM::new();
        run_script(&mut vm, |a| {
            a.op(OpCode::Map).short(2);
            a.str("name").str("mocha").op(OpCode::MapSet);
            a.str("tags").op(OpCode::Array).short(2).str("vm").op(OpCode::ArrayAppend).op(OpCode::MapSet);
            a.named(OpCode::DefineVar, "config");
            a.op(OpCode::Array).short(8).named(OpCode::DefineVar, "scratch");
            a.op(OpCode::Null).op(OpCode::Return);
        });
        let config = vm.global("config").unwrap();
        let before = vm.display(config);
        let scratch = global_obj(&vm, "scratch");

        run_script(&mut vm, |a| {
            a.op(OpCode::Null).named(OpCode::SetVar, "scratch").op(OpCode::Pop);
            a.op(OpCode::Null).op(OpCode::Return);
        });
        vm.collect_garbage();
        assert!(!vm.gc.is_sweeping());
        assert_eq!(vm.gc.stats().major_cycles, 1);
        assert!(!vm.is_live(scratch));
        assert_eq!(vm.display(config), before);
        let config = config.as_obj().unwrap();
        let tags = vm.heap.map_get_str(config, "tags").unwrap();
        assert_eq!(vm.display(tags), "[vm]");
    }

    #[test]
    fn major_sweep_advances_at_checkpoints() {
        let mut vm = VM::new();
        vm.set_gc_thresholds(usize::MAX, 0);
        let result = run_script(&mut vm, |a| {
            a.op(OpCode::Gc).op(OpCode::Null).op(OpCode::Return);
        });
        assert_eq!(result, InterpretResult::InterpretOk);
        assert!(vm.gc.is_sweeping());
        assert_eq!(vm.gc.stats().major_cycles, 0);

        while vm.gc.is_sweeping() {
            vm.gc_checkpoint();
        }
        assert_eq!(vm.gc.stats().major_cycles, 1);
        assert!(vm.global("len").is_some());
    }
}
