use std::rc::Rc;

use crate::{
    call_frame::CallFrame,
    error::{RuntimeError, RuntimeErrorKind},
    objects::object::{ObjRef, Object},
    value::Value,
};

use super::{exec::Flow, property::Member, VM};

impl VM {
    /// Call whatever sits `argc` slots below the top. User functions push a
    /// frame; natives, constructors without `init` and enum constructors
    /// complete immediately and leave their result in the callee slot.
    pub(crate) fn call_value_at(&mut self, callee: Value, argc: u8) -> Result<(), RuntimeError> {
        let Value::Obj(handle) = callee else {
            return Err(RuntimeError::type_mismatch("Can only call functions and classes."));
        };
        match self.heap.object(handle) {
            Object::Function(_) => self.call_function(handle, argc, None),
            Object::BoundMethod(bound) => {
                let (receiver, method) = (bound.receiver, bound.method);
                self.call_function(method, argc, Some(receiver))
            }
            Object::Native(_) => self.call_native(handle, argc),
            Object::Class(_) => self.call_class(handle, argc),
            Object::EnumCtor(_) => self.call_enum_ctor(handle, argc),
            _ => Err(RuntimeError::type_mismatch("Can only call functions and classes.")),
        }
    }

    /// Push a frame for `function` over the `argc + 1` slot window at the top
    /// of the stack. Parameters without an argument are bound to null.
    pub(crate) fn call_function(&mut self, function: ObjRef, argc: u8, receiver: Option<Value>) -> Result<(), RuntimeError> {
        let Some(callee) = self.heap.as_function(function) else {
            return Err(RuntimeError::type_mismatch("Can only call functions and classes."));
        };
        if !callee.accepts(argc as usize) {
            return Err(RuntimeErrorKind::ArityMismatch {
                min: callee.min_arity as usize,
                max: callee.arity as usize,
                got: argc as usize,
            }
            .into());
        }
        if self.frames.len() >= self.config.max_frames {
            return Err(RuntimeErrorKind::StackOverflow.into());
        }
        let chunk = Rc::clone(&callee.chunk);
        let params = callee.params.clone();
        let closure = callee.closure.unwrap_or(self.globals);
        let path = callee.path.clone();

        let env = self.new_env(Some(closure));
        if let Some(receiver) = receiver {
            self.define_var(env, self.names.this, receiver);
        }
        let slots = self.stack.len() - argc as usize - 1;
        for (i, name) in params.into_iter().enumerate() {
            let value = if i < argc as usize { self.stack[slots + 1 + i] } else { Value::Null };
            self.define_var(env, name, value);
        }

        let mut frame = CallFrame::new(function, chunk, slots, argc, self.env);
        frame.receiver = receiver;
        frame.previous_path = self.current_path.clone();
        if path.is_some() {
            self.current_path = path;
        }
        self.frames.push(frame);
        self.env = env;
        Ok(())
    }

    fn call_native(&mut self, native: ObjRef, argc: u8) -> Result<(), RuntimeError> {
        let function = match self.heap.object(native) {
            Object::Native(native) if native.accepts(argc as usize) => native.function,
            Object::Native(native) => {
                return Err(RuntimeErrorKind::ArityMismatch {
                    min: native.arity as usize,
                    max: native.arity as usize,
                    got: argc as usize,
                }
                .into())
            }
            _ => return Err(RuntimeError::type_mismatch("Can only call functions and classes.")),
        };
        let start = self.stack.len() - argc as usize;
        // The window stays on the stack, so arguments remain rooted while the native runs.
        let args: Vec<Value> = self.stack[start..].to_vec();
        let pinned = self.pinned.len();
        let result = function(self, &args);
        self.pinned.truncate(pinned);
        let result = result?;
        self.stack.truncate(start - 1);
        self.push(result);
        Ok(())
    }

    /// Construct an instance. Struct classes fill fields positionally; other
    /// classes run `init` if they have one.
    fn call_class(&mut self, class: ObjRef, argc: u8) -> Result<(), RuntimeError> {
        let Some(record) = self.heap.as_class(class) else {
            return Err(RuntimeError::type_mismatch("Can only call functions and classes."));
        };
        let methods = record.methods;
        let shape = record.shape.as_ref().map(|shape| (shape.fields, shape.defaults));
        let slot = self.stack.len() - argc as usize - 1;

        if let Some((field_names, defaults)) = shape {
            let names = self.heap.as_array(field_names).map(|array| array.items.clone()).unwrap_or_default();
            if argc as usize > names.len() {
                return Err(RuntimeErrorKind::ArityMismatch {
                    min: 0,
                    max: names.len(),
                    got: argc as usize,
                }
                .into());
            }
            let fields = self.new_map(names.len());
            for (i, name) in names.into_iter().enumerate() {
                let Value::Obj(name) = name else {
                    continue;
                };
                let value = if i < argc as usize {
                    self.stack[slot + 1 + i]
                } else {
                    self.heap.map_get(defaults, name).unwrap_or(Value::Null)
                };
                self.map_set(fields, name, value);
            }
            let instance = self.new_instance(class, fields);
            self.stack.truncate(slot);
            self.push(Value::Obj(instance));
            return Ok(());
        }

        let fields = self.new_map(0);
        let instance = Value::Obj(self.new_instance(class, fields));
        self.stack[slot] = instance;
        match self.heap.map_get(methods, self.names.init) {
            Some(Value::Obj(init)) => self.call_function(init, argc, Some(instance)),
            _ if argc != 0 => Err(RuntimeErrorKind::ArityMismatch {
                min: 0,
                max: 0,
                got: argc as usize,
            }
            .into()),
            _ => {
                self.stack.truncate(slot + 1);
                Ok(())
            }
        }
    }

    /// An enum variant with a payload: `{ _enum, _tag, _values }`.
    fn call_enum_ctor(&mut self, ctor: ObjRef, argc: u8) -> Result<(), RuntimeError> {
        let (enum_name, variant, arity) = match self.heap.object(ctor) {
            Object::EnumCtor(ctor) => (ctor.enum_name, ctor.variant, ctor.arity),
            _ => return Err(RuntimeError::type_mismatch("Can only call functions and classes.")),
        };
        if argc != arity {
            return Err(RuntimeErrorKind::ArityMismatch {
                min: arity as usize,
                max: arity as usize,
                got: argc as usize,
            }
            .into());
        }
        let start = self.stack.len() - argc as usize;
        let values = self.new_array(self.stack[start..].to_vec());
        let tagged = self.new_map(3);
        self.map_set(tagged, self.names.enum_key, Value::Obj(enum_name));
        self.map_set(tagged, self.names.tag_key, Value::Obj(variant));
        self.map_set(tagged, self.names.values_key, Value::Obj(values));
        self.stack.truncate(start - 1);
        self.push(Value::Obj(tagged));
        Ok(())
    }

    /// `receiver.name(args)` without materialising a bound method when the
    /// name resolves to a class method.
    pub(crate) fn invoke(&mut self, name: ObjRef, argc: u8, offset: usize) -> Result<(), RuntimeError> {
        let receiver = self.peek_steps(argc as usize);
        let slot = self.stack.len() - argc as usize - 1;
        if let Some(instance) = receiver.as_obj().filter(|handle| self.heap.as_instance(*handle).is_some()) {
            return match self.instance_member(instance, name, offset) {
                Some(Member::Method(method)) => self.call_function(method, argc, Some(receiver)),
                Some(Member::Field(value)) => {
                    self.stack[slot] = value;
                    self.call_value_at(value, argc)
                }
                None => Err(self.undefined_property(instance, name)),
            };
        }
        let value = self.get_property(receiver, name, offset, false)?;
        self.stack[slot] = value;
        self.call_value_at(value, argc)
    }

    /// Pop the current frame and hand its result to the caller.
    pub(crate) fn return_from_frame(&mut self, result: Value) -> Result<Flow, RuntimeError> {
        let Some(frame) = self.frames.pop() else {
            return Err(RuntimeError::type_mismatch("Return outside of a call frame."));
        };
        self.env = frame.previous_env;
        self.current_path = frame.previous_path;
        let depth = self.frames.len();
        while self.try_frames.last().map_or(false, |handler| handler.frame_index >= depth) {
            self.try_frames.pop();
        }

        let is_initializer = self.heap.as_function(frame.function).map_or(false, |f| f.is_initializer);
        let result = match frame.receiver {
            Some(receiver) if is_initializer => receiver,
            _ => result,
        };
        self.stack.truncate(frame.slots);

        if let Some(module) = frame.module {
            self.finish_module(module);
            return Ok(Flow::Continue);
        }
        if self.frames.len() <= self.frame_floor {
            return Ok(Flow::Return(result));
        }
        if !frame.discard_result {
            self.push(result);
        }
        Ok(Flow::Continue)
    }

    /// Call `callee` from host code, typically a native. Runs a nested dispatch
    /// loop until the call returns, then restores the engine to where it was.
    /// A `throw` that is not caught inside the call comes back as an error
    /// carrying the thrown value, which the calling dispatch loop re-raises.
    /// The returned or thrown value stays pinned until the calling native
    /// returns.
    pub fn call_value(&mut self, callee: Value, args: &[Value]) -> Result<Value, RuntimeError> {
        let Ok(argc) = u8::try_from(args.len()) else {
            return Err(RuntimeError::type_mismatch("Too many arguments."));
        };
        let saved_frames = self.frames.len();
        let saved_stack = self.stack.len();
        let saved_try = self.try_frames.len();
        let saved_env = self.env;
        let saved_path = self.current_path.clone();
        let saved_floor = self.frame_floor;

        self.push(callee);
        self.stack.extend_from_slice(args);
        let result = self.call_value_at(callee, argc).and_then(|()| {
            if self.frames.len() > saved_frames {
                self.frame_floor = saved_frames;
                self.run()
            } else {
                Ok(self.pop())
            }
        });

        self.unwind_frames(saved_frames);
        self.stack.truncate(saved_stack);
        self.try_frames.truncate(saved_try);
        self.env = saved_env;
        self.current_path = saved_path;
        self.frame_floor = saved_floor;
        match &result {
            Ok(value) => self.pin(*value),
            Err(error) => {
                if let Some(thrown) = error.thrown {
                    self.pin(thrown);
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::chunk::OpCode;
    use crate::config::VmConfig;
    use crate::error::{RuntimeError, RuntimeErrorKind};
    use crate::value::Value;
    use crate::vm::test_support::{function, run_script};
    use crate::vm::{InterpretResult, VM};

    fn quiet() -> VM {
        VM::with_config(VmConfig {
            stack_trace: false,
            ..VmConfig::default()
        })
    }

    fn define(vm: &mut VM, name: &str, value: Value) {
        let name = vm.intern(name);
        let globals = vm.globals;
        vm.define_var(globals, name, value);
    }

    /// `fn f(a, b = 10) { return [a, b]; }`
    fn define_defaulted(vm: &mut VM) {
        let f = function(vm, "f", &["a", "b"], 1, |a| {
            a.op(OpCode::ArgCount).num(2.0).op(OpCode::Less);
            let skip = a.b.emit_jump(OpCode::JumpIfFalse);
            a.op(OpCode::Pop).num(10.0).named(OpCode::SetVar, "b").op(OpCode::Pop);
            let end = a.b.emit_jump(OpCode::Jump);
            a.b.patch_jump(skip).unwrap();
            a.op(OpCode::Pop);
            a.b.patch_jump(end).unwrap();
            a.op(OpCode::Array).short(2);
            a.named(OpCode::GetVar, "a").op(OpCode::ArrayAppend);
            a.named(OpCode::GetVar, "b").op(OpCode::ArrayAppend);
            a.op(OpCode::Return);
        });
        define(vm, "f", f);
    }

    #[test]
    fn default_parameter_is_bound_when_omitted() {
        let mut vm = quiet();
        define_defaulted(&mut vm);
        run_script(&mut vm, |a| {
            a.named(OpCode::GetVar, "f").num(1.0).op(OpCode::Call).byte(1).op(OpCode::Return);
        });
        assert_eq!(vm.display(vm.last_value()), "[1, 10]");
        run_script(&mut vm, |a| {
            a.named(OpCode::GetVar, "f").num(1.0).num(2.0).op(OpCode::Call).byte(2).op(OpCode::Return);
        });
        assert_eq!(vm.display(vm.last_value()), "[1, 2]");
    }

    #[test]
    fn arity_range_is_enforced() {
        let mut vm = quiet();
        define_defaulted(&mut vm);
        for argc in 0u8..=3 {
            let result = run_script(&mut vm, |a| {
                a.named(OpCode::GetVar, "f");
                for i in 0..argc {
                    a.num(i as f64);
                }
                a.op(OpCode::Call).byte(argc).op(OpCode::Return);
            });
            if (1..=2).contains(&argc) {
                assert_eq!(result, InterpretResult::InterpretOk, "argc {}", argc);
            } else {
                assert_eq!(result, InterpretResult::InterpretRuntimeError, "argc {}", argc);
                assert_eq!(
                    vm.last_error().unwrap().kind,
                    RuntimeErrorKind::ArityMismatch { min: 1, max: 2, got: argc as usize }
                );
            }
        }
        assert_eq!(
            vm.last_error().unwrap().message(),
            "Expected 1 to 2 arguments but got 3."
        );
    }

    #[test]
    fn runaway_recursion_overflows() {
        let mut vm = VM::with_config(VmConfig {
            max_frames: 64,
            stack_trace: false,
            ..VmConfig::default()
        });
        let f = function(&mut vm, "down", &[], 0, |a| {
            a.named(OpCode::GetVar, "down").op(OpCode::Call).byte(0).op(OpCode::Return);
        });
        define(&mut vm, "down", f);
        let result = run_script(&mut vm, |a| {
            a.named(OpCode::GetVar, "down").op(OpCode::Call).byte(0).op(OpCode::Return);
        });
        assert_eq!(result, InterpretResult::InterpretRuntimeError);
        let error = vm.last_error().unwrap();
        assert_eq!(error.kind, RuntimeErrorKind::StackOverflow);
        assert_eq!(error.stack_trace.len(), 64);
        assert!(error.stack_trace[0].starts_with("#0 <script>"));
        assert!(error.stack_trace[1].starts_with("#1 down"));
    }

    /// `class Counter { init(n) { this.n = n; } bump() { this.n = this.n + 1; return this.n; } }`
    fn define_counter(vm: &mut VM) -> InterpretResult {
        let init = function(vm, "init", &["n"], 1, |a| {
            a.named(OpCode::GetThis, "this").named(OpCode::GetVar, "n");
            a.named(OpCode::SetProperty, "n").op(OpCode::Pop);
            a.op(OpCode::Null).op(OpCode::Return);
        });
        let bump = function(vm, "bump", &[], 0, |a| {
            a.named(OpCode::GetThis, "this");
            a.named(OpCode::GetThis, "this").named(OpCode::GetProperty, "n").num(1.0).op(OpCode::Add);
            a.named(OpCode::SetProperty, "n").op(OpCode::Pop);
            a.named(OpCode::GetThis, "this").named(OpCode::GetProperty, "n").op(OpCode::Return);
        });
        run_script(vm, |a| {
            a.value(OpCode::Closure, init).value(OpCode::Closure, bump);
            a.named(OpCode::Class, "Counter").short(2);
            a.op(OpCode::Null).op(OpCode::Return);
        })
    }

    #[test]
    fn class_construction_runs_init_and_invoke_calls_methods() {
        let mut vm = quiet();
        assert_eq!(define_counter(&mut vm), InterpretResult::InterpretOk);
        let result = run_script(&mut vm, |a| {
            a.named(OpCode::GetVar, "Counter").num(5.0).op(OpCode::Call).byte(1);
            a.named(OpCode::DefineVar, "c");
            a.named(OpCode::GetVar, "c").named(OpCode::Invoke, "bump").byte(0).op(OpCode::Pop);
            a.named(OpCode::GetVar, "c").named(OpCode::GetProperty, "bump").op(OpCode::Call).byte(0);
            a.op(OpCode::Return);
        });
        assert_eq!(result, InterpretResult::InterpretOk);
        assert_eq!(vm.last_value(), Value::Number(7.0));
    }

    #[test]
    fn class_without_init_rejects_arguments() {
        let mut vm = quiet();
        let result = run_script(&mut vm, |a| {
            a.named(OpCode::Class, "Empty").short(0);
            a.named(OpCode::GetVar, "Empty").num(1.0).op(OpCode::Call).byte(1).op(OpCode::Return);
        });
        assert_eq!(result, InterpretResult::InterpretRuntimeError);
        assert_eq!(vm.last_error().unwrap().message(), "Expected 0 arguments but got 1.");
    }

    #[test]
    fn calling_a_number_fails() {
        let mut vm = quiet();
        let result = run_script(&mut vm, |a| {
            a.num(1.0).op(OpCode::Call).byte(0).op(OpCode::Return);
        });
        assert_eq!(result, InterpretResult::InterpretRuntimeError);
        assert_eq!(vm.last_error().unwrap().message(), "Can only call functions and classes.");
    }

    #[test]
    fn closures_capture_defining_scope() {
        let mut vm = quiet();
        // { let x = 41; fn get() { return x + 1; } } ; get()
        let getter = function(&mut vm, "get", &[], 0, |a| {
            a.named(OpCode::GetVar, "x").num(1.0).op(OpCode::Add).op(OpCode::Return);
        });
        let result = run_script(&mut vm, |a| {
            a.op(OpCode::BeginScope);
            a.num(41.0).named(OpCode::DefineVar, "x");
            a.value(OpCode::Closure, getter).named(OpCode::DefineVar, "inner");
            a.named(OpCode::GetVar, "inner");
            a.op(OpCode::EndScope);
            a.op(OpCode::Call).byte(0).op(OpCode::Return);
        });
        assert_eq!(result, InterpretResult::InterpretOk);
        assert_eq!(vm.last_value(), Value::Number(42.0));
    }

    #[test]
    fn yield_accumulates_into_implicit_array() {
        let mut vm = quiet();
        // fn gen() { yield 1; yield 2; yield 3; return; }
        let gen = function(&mut vm, "gen", &[], 0, |a| {
            a.op(OpCode::Array).short(0).named(OpCode::DefineVar, "__yield");
            a.op(OpCode::False).named(OpCode::DefineVar, "__yielded");
            for n in 1..=3 {
                a.named(OpCode::GetVar, "__yield").num(n as f64).op(OpCode::ArrayAppend).op(OpCode::Pop);
                a.op(OpCode::True).named(OpCode::SetVar, "__yielded").op(OpCode::Pop);
            }
            a.named(OpCode::GetVar, "__yielded");
            let explicit = a.b.emit_jump(OpCode::JumpIfFalse);
            a.op(OpCode::Pop).named(OpCode::GetVar, "__yield").op(OpCode::Return);
            a.b.patch_jump(explicit).unwrap();
            a.op(OpCode::Pop).op(OpCode::Null).op(OpCode::Return);
        });
        define(&mut vm, "gen", gen);
        run_script(&mut vm, |a| {
            a.named(OpCode::GetVar, "gen").op(OpCode::Call).byte(0).op(OpCode::Return);
        });
        assert_eq!(vm.display(vm.last_value()), "[1, 2, 3]");
    }

    fn apply(vm: &mut VM, args: &[Value]) -> Result<Value, RuntimeError> {
        vm.call_value(args[0], &args[1..])
    }

    #[test]
    fn natives_can_call_back_into_the_engine() {
        let mut vm = quiet();
        vm.define_native("apply", -1, apply);
        define_defaulted(&mut vm);
        let result = run_script(&mut vm, |a| {
            a.named(OpCode::GetVar, "apply").named(OpCode::GetVar, "f").num(3.0);
            a.op(OpCode::Call).byte(2).op(OpCode::Return);
        });
        assert_eq!(result, InterpretResult::InterpretOk);
        assert_eq!(vm.display(vm.last_value()), "[3, 10]");
        assert!(vm.stack.is_empty());
        assert!(vm.pinned.is_empty());
        assert_eq!(vm.frame_floor, 0);
    }

    #[test]
    fn native_arity_is_exact() {
        let mut vm = quiet();
        let result = run_script(&mut vm, |a| {
            a.named(OpCode::GetVar, "len").op(OpCode::Call).byte(0).op(OpCode::Return);
        });
        assert_eq!(result, InterpretResult::InterpretRuntimeError);
        assert_eq!(
            vm.last_error().unwrap().kind,
            RuntimeErrorKind::ArityMismatch { min: 1, max: 1, got: 0 }
        );
    }

    #[test]
    fn call_value_from_host_code() {
        let mut vm = quiet();
        define_defaulted(&mut vm);
        let f = vm.global("f").unwrap();
        let result = vm.call_value(f, &[Value::Number(4.0), Value::Number(5.0)]).unwrap();
        assert_eq!(vm.display(result), "[4, 5]");
        assert!(vm.frames.is_empty());
    }
}
