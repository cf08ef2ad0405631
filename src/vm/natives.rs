use std::time::{SystemTime, UNIX_EPOCH};

use crate::{error::RuntimeError, objects::object_native_function::NativeFn, value::Value};

use super::VM;

/// Globals bound in every fresh engine.
const STANDARDS: &[(&str, i32, NativeFn)] = &[
    ("len", 1, len),
    ("type", 1, type_of),
    ("gc", 0, gc),
    ("args", 0, args),
    ("clock", 0, clock),
];

impl VM {
    pub(crate) fn setup_standards(&mut self) {
        for &(name, arity, function) in STANDARDS {
            self.define_native(name, arity, function);
        }
    }
}

fn len(vm: &mut VM, args: &[Value]) -> Result<Value, RuntimeError> {
    let len = vm.length_of(args[0])?;
    Ok(Value::Number(len as f64))
}

fn type_of(vm: &mut VM, args: &[Value]) -> Result<Value, RuntimeError> {
    let name = vm.heap.type_name(args[0]);
    Ok(Value::Obj(vm.intern(&name)))
}

fn gc(vm: &mut VM, _args: &[Value]) -> Result<Value, RuntimeError> {
    vm.gc_checkpoint();
    Ok(Value::Null)
}

fn args(vm: &mut VM, _args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Obj(vm.args))
}

/// Milliseconds since the Unix epoch.
fn clock(_vm: &mut VM, _args: &[Value]) -> Result<Value, RuntimeError> {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64() * 1000.0)
        .unwrap_or(0.0);
    Ok(Value::Number(millis))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::chunk::OpCode;
    use crate::config::VmConfig;
    use crate::error::{RuntimeError, RuntimeErrorKind};
    use crate::value::Value;
    use crate::vm::test_support::{function, run_script, Asm};
    use crate::vm::{InterpretResult, VM};

    fn quiet() -> VM {
        VM::with_config(VmConfig {
            stack_trace: false,
            ..VmConfig::default()
        })
    }

    fn call(a: &mut Asm, native: &str, build_args: impl FnOnce(&mut Asm), argc: u8) {
        a.named(OpCode::GetVar, native);
        build_args(a);
        a.op(OpCode::Call).byte(argc);
    }

    #[test]
    fn len_and_type_report_on_values() {
        let mut vm = quiet();
        let result = run_script(&mut vm, |a| {
            a.op(OpCode::Array).short(4);
            call(a, "len", |a| { a.str("abc"); }, 1);
            a.op(OpCode::ArrayAppend);
            call(a, "len", |a| { a.op(OpCode::Array).short(0).num(1.0).op(OpCode::ArrayAppend); }, 1);
            a.op(OpCode::ArrayAppend);
            call(a, "type", |a| { a.num(1.0); }, 1);
            a.op(OpCode::ArrayAppend);
            call(a, "type", |a| { a.named(OpCode::GetVar, "len"); }, 1);
            a.op(OpCode::ArrayAppend);
            a.op(OpCode::Return);
        });
        assert_eq!(result, InterpretResult::InterpretOk);
        assert_eq!(vm.display(vm.last_value()), "[3, 1, number, native]");
    }

    #[test]
    fn len_of_a_number_is_a_type_error() {
        let mut vm = quiet();
        let result = run_script(&mut vm, |a| {
            call(a, "len", |a| { a.op(OpCode::True); }, 1);
            a.op(OpCode::Return);
        });
        assert_eq!(result, InterpretResult::InterpretRuntimeError);
        assert_eq!(
            vm.last_error().unwrap().kind,
            RuntimeErrorKind::TypeMismatch("Length is only defined for strings, arrays and maps.".to_string())
        );
    }

    #[test]
    fn gc_native_runs_a_pending_collection() {
        let mut vm = quiet();
        vm.set_gc_thresholds(0, usize::MAX);
        let result = run_script(&mut vm, |a| {
            call(a, "gc", |_| {}, 0);
            a.op(OpCode::Return);
        });
        assert_eq!(result, InterpretResult::InterpretOk);
        assert_eq!(vm.last_value(), Value::Null);
        assert_eq!(vm.gc.stats().minor_cycles, 1);
    }

    #[test]
    fn args_returns_host_arguments() {
        let mut vm = quiet();
        vm.set_args(&["input.txt", "-v"]);
        run_script(&mut vm, |a| {
            call(a, "args", |_| {}, 0);
            a.op(OpCode::Return);
        });
        assert_eq!(vm.display(vm.last_value()), "[input.txt, -v]");
    }

    #[test]
    fn clock_reports_wall_time() {
        let mut vm = quiet();
        run_script(&mut vm, |a| {
            call(a, "clock", |_| {}, 0);
            a.op(OpCode::Return);
        });
        assert!(vm.last_value().as_number().unwrap() > 0.0);
    }

    fn define(vm: &mut VM, name: &str, value: Value) {
        let name = vm.intern(name);
        let globals = vm.globals;
        vm.define_var(globals, name, value);
    }

    /// Collect everything unreachable, then allocate so a freed slot is reused.
    fn churn(vm: &mut VM) {
        vm.collect_garbage();
        vm.new_string("filler");
    }

    fn rescue(vm: &mut VM, args: &[Value]) -> Result<Value, RuntimeError> {
        match vm.call_value(args[0], &[]) {
            Ok(value) => Ok(value),
            Err(error) => {
                let thrown = error.thrown.unwrap_or(Value::Null);
                churn(vm);
                Ok(thrown)
            }
        }
    }

    fn first_of_two(vm: &mut VM, args: &[Value]) -> Result<Value, RuntimeError> {
        let first = vm.call_value(args[0], &[])?;
        vm.call_value(args[0], &[])?;
        churn(vm);
        Ok(first)
    }

    fn keep(vm: &mut VM, _args: &[Value]) -> Result<Value, RuntimeError> {
        let kept = Value::Obj(vm.new_string("kept"));
        vm.pin(kept);
        churn(vm);
        let text = vm.display(kept);
        vm.unpin();
        Ok(Value::Obj(vm.intern(&text)))
    }

    #[test]
    fn thrown_value_survives_a_collection_in_the_catching_native() {
        let mut vm = quiet();
        vm.define_native("rescue", 1, rescue);
        let thrower = function(&mut vm, "thrower", &[], 0, |a| {
            a.str("boom").op(OpCode::Throw);
        });
        define(&mut vm, "thrower", thrower);
        let result = run_script(&mut vm, |a| {
            call(a, "rescue", |a| { a.named(OpCode::GetVar, "thrower"); }, 1);
            a.str("message").op(OpCode::GetIndex).op(OpCode::Return);
        });
        assert_eq!(result, InterpretResult::InterpretOk);
        assert_eq!(vm.display(vm.last_value()), "boom");
        assert!(vm.pinned.is_empty());
    }

    #[test]
    fn callback_result_survives_a_second_callback() {
        let mut vm = quiet();
        vm.define_native("first_of_two", 1, first_of_two);
        let fresh = function(&mut vm, "fresh", &[], 0, |a| {
            a.op(OpCode::Array).short(1).num(7.0).op(OpCode::ArrayAppend).op(OpCode::Return);
        });
        define(&mut vm, "fresh", fresh);
        let result = run_script(&mut vm, |a| {
            call(a, "first_of_two", |a| { a.named(OpCode::GetVar, "fresh"); }, 1);
            a.op(OpCode::Return);
        });
        assert_eq!(result, InterpretResult::InterpretOk);
        assert_eq!(vm.display(vm.last_value()), "[7]");
        assert!(vm.pinned.is_empty());
    }

    #[test]
    fn pinned_values_survive_collection() {
        let mut vm = quiet();
        vm.define_native("keep", 0, keep);
        let result = run_script(&mut vm, |a| {
            call(a, "keep", |_| {}, 0);
            a.op(OpCode::Return);
        });
        assert_eq!(result, InterpretResult::InterpretOk);
        assert_eq!(vm.display(vm.last_value()), "kept");
        assert!(vm.pinned.is_empty());
    }
}
