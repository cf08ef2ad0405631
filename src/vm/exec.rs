use std::rc::Rc;

use crate::{
    call_frame::TryFrame,
    chunk::OpCode,
    error::{RuntimeError, RuntimeErrorKind},
    objects::{
        object::{ObjRef, ObjectType},
        object_class::{ObjectClass, StructShape},
    },
    value::Value,
};

use super::VM;

/// Outcome of one dispatch step.
pub(crate) enum Flow {
    Continue,
    /// The frame at the current floor returned this value.
    Return(Value),
}

impl VM {
    /// Dispatch until the frame at `frame_floor` returns. A `throw` is caught
    /// here if a handler exists above the floor; otherwise the error (with its
    /// thrown value still attached) goes to the caller.
    pub(crate) fn run(&mut self) -> Result<Value, RuntimeError> {
        loop {
            match self.step() {
                Ok(Flow::Continue) => {}
                Ok(Flow::Return(value)) => return Ok(value),
                Err(error) => {
                    let caught = error.thrown.map_or(false, |thrown| self.catch(thrown));
                    if !caught {
                        return Err(self.locate(error));
                    }
                }
            }
            if let Err(error) = self.check_limits() {
                return Err(self.locate(error));
            }
        }
    }

    fn step(&mut self) -> Result<Flow, RuntimeError> {
        self.instruction_count += 1;
        if let Some(budget) = self.config.instruction_budget {
            if self.instruction_count > budget {
                return Err(RuntimeErrorKind::InstructionBudgetExceeded(budget).into());
            }
        }

        #[cfg(feature = "debug_trace_execution")]
        if self.config.debug_trace {
            super::debug_feature::disassemble_instruction(self);
        }

        let offset = self.frames.last().map(|frame| frame.ip).unwrap_or(0);
        let instruction = OpCode::from_byte(self.read_byte()?);
        match instruction {
            Some(OpCode::Constant) => {
                let constant = self.read_constant()?;
                self.push(constant);
            }
            Some(OpCode::Null) => self.push(Value::Null),
            Some(OpCode::True) => self.push(Value::Bool(true)),
            Some(OpCode::False) => self.push(Value::Bool(false)),
            Some(OpCode::Pop) => {
                self.pop();
            }
            Some(OpCode::BeginScope) => {
                let env = self.new_env(Some(self.env));
                self.env = env;
            }
            Some(OpCode::EndScope) => {
                if let Some(enclosing) = self.heap.env(self.env).enclosing {
                    self.env = enclosing;
                }
            }
            Some(OpCode::GetVar) => {
                let name = self.read_name()?;
                match self.heap.env_get(self.env, name) {
                    Some(value) => self.push(value),
                    None => return Err(self.undefined_variable(name)),
                }
            }
            Some(OpCode::SetVar) => {
                let name = self.read_name()?;
                let value = self.peek();
                self.assign_var(name, value)?;
            }
            Some(OpCode::DefineVar) => {
                let name = self.read_name()?;
                let value = self.pop();
                self.define_var(self.env, name, value);
            }
            Some(OpCode::DefineConst) => {
                let name = self.read_name()?;
                let value = self.pop();
                self.define_const(self.env, name, value);
            }
            Some(OpCode::GetProperty) | Some(OpCode::GetPropertyOptional) => {
                let name = self.read_name()?;
                let object = self.pop();
                let optional = instruction == Some(OpCode::GetPropertyOptional);
                let value = self.get_property(object, name, offset, optional)?;
                self.push(value);
            }
            Some(OpCode::SetProperty) => {
                let name = self.read_name()?;
                let value = self.pop();
                let object = self.pop();
                self.set_property(object, name, value, offset)?;
                self.push(value);
            }
            Some(OpCode::GetThis) => {
                let name = self.read_name()?;
                match self.heap.env_get(self.env, name) {
                    Some(value) => self.push(value),
                    None => return Err(RuntimeError::type_mismatch("Cannot use 'this' outside of a class.")),
                }
            }
            Some(OpCode::GetIndex) | Some(OpCode::GetIndexOptional) => {
                let index = self.pop();
                let object = self.pop();
                let optional = instruction == Some(OpCode::GetIndexOptional);
                let value = self.get_index(object, index, offset, optional)?;
                self.push(value);
            }
            Some(OpCode::SetIndex) => {
                let value = self.pop();
                let index = self.pop();
                let object = self.pop();
                self.set_index(object, index, value)?;
                self.push(value);
            }
            Some(OpCode::Equal) => {
                let b = self.pop();
                let a = self.pop();
                self.push(Value::Bool(self.heap.values_equal(a, b)));
            }
            Some(OpCode::Add) => {
                let b = self.peek_steps(0);
                let a = self.peek_steps(1);
                match (a, b) {
                    (Value::Number(a), Value::Number(b)) => {
                        self.pop();
                        self.pop();
                        self.push(Value::Number(a + b));
                    }
                    _ if self.heap.is_string(a) && self.heap.is_string(b) => {
                        let mut combination = String::with_capacity(
                            self.heap.value_str(a).map_or(0, str::len) + self.heap.value_str(b).map_or(0, str::len),
                        );
                        combination.push_str(self.heap.value_str(a).unwrap_or_default());
                        combination.push_str(self.heap.value_str(b).unwrap_or_default());
                        let result = self.new_string(&combination);
                        self.pop();
                        self.pop();
                        self.push(Value::Obj(result));
                    }
                    _ => return Err(RuntimeError::type_mismatch("Operands must be two numbers or two strings.")),
                }
            }
            Some(
                op @ (OpCode::Greater
                | OpCode::GreaterEqual
                | OpCode::Less
                | OpCode::LessEqual
                | OpCode::Subtract
                | OpCode::Multiply
                | OpCode::Divide
                | OpCode::Modulo),
            ) => self.binary_op(op)?,
            Some(OpCode::Not) => {
                let value = self.pop();
                self.push(Value::Bool(value.is_falsey()));
            }
            Some(OpCode::Negate) => match self.pop() {
                Value::Number(number) => self.push(Value::Number(-number)),
                _ => return Err(RuntimeError::type_mismatch("Operand must be a number.")),
            },
            Some(OpCode::Stringify) => {
                let value = self.peek();
                if !self.heap.is_string(value) {
                    let text = self.heap.display_value(value);
                    let string = self.new_string(&text);
                    self.pop();
                    self.push(Value::Obj(string));
                }
            }
            Some(OpCode::Jump) => {
                let jump = self.read_short()? as usize;
                self.frame_mut()?.ip += jump;
            }
            Some(OpCode::JumpIfFalse) => {
                let jump = self.read_short()? as usize;
                if self.peek().is_falsey() {
                    self.frame_mut()?.ip += jump;
                }
            }
            Some(OpCode::Loop) => {
                let jump = self.read_short()? as usize;
                let frame = self.frame_mut()?;
                frame.ip = frame.ip.saturating_sub(jump);
            }
            Some(OpCode::Call) => {
                let argc = self.read_byte()?;
                let callee = self.peek_steps(argc as usize);
                self.call_value_at(callee, argc)?;
            }
            Some(OpCode::CallOptional) => {
                let argc = self.read_byte()?;
                let callee = self.peek_steps(argc as usize);
                if callee.is_null() {
                    let base = self.stack.len() - argc as usize - 1;
                    self.stack.truncate(base);
                    self.push(Value::Null);
                } else {
                    self.call_value_at(callee, argc)?;
                }
            }
            Some(OpCode::Invoke) => {
                let name = self.read_name()?;
                let argc = self.read_byte()?;
                self.invoke(name, argc, offset)?;
            }
            Some(OpCode::ArgCount) => {
                let argc = self.frame()?.argc;
                self.push(Value::Number(argc as f64));
            }
            Some(OpCode::Closure) => {
                let proto = self.read_constant()?;
                let closure = match proto.as_obj().and_then(|handle| self.heap.as_function(handle)) {
                    Some(function) => function.clone_with_env(Some(self.env)),
                    None => return Err(RuntimeError::type_mismatch("Closure operand must be a function.")),
                };
                let (function, _) = self.heap.alloc_function(closure);
                self.track_allocation();
                self.push(Value::Obj(function));
            }
            Some(OpCode::Return) => {
                let result = self.pop();
                return self.return_from_frame(result);
            }
            Some(OpCode::Class) => {
                let name = self.read_name()?;
                let count = self.read_short()?;
                self.define_class(name, count)?;
            }
            Some(OpCode::Struct) => {
                let name = self.read_name()?;
                self.define_struct(name)?;
            }
            Some(OpCode::Import) => {
                let has_alias = self.read_byte()? != 0;
                let alias_index = self.read_short()?;
                let alias = if has_alias { Some(self.name_constant(alias_index as usize)?) } else { None };
                let path = self.pop();
                self.import(path, alias, false)?;
            }
            Some(OpCode::ImportModule) => {
                let path = self.pop();
                self.import(path, None, true)?;
            }
            Some(OpCode::Export) => {
                let name = self.read_name()?;
                self.export_binding(name)?;
            }
            Some(OpCode::ExportValue) => {
                let name = self.read_name()?;
                let value = self.pop();
                self.export_value(name, value);
            }
            Some(OpCode::ExportFrom) => {
                let count = self.read_short()?;
                let mut names = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let from = self.read_name()?;
                    let to = self.read_name()?;
                    names.push((from, to));
                }
                let module = self.pop();
                self.export_from(module, &names)?;
            }
            Some(OpCode::Private) => {
                let name = self.read_name()?;
                self.mark_private(name);
            }
            Some(OpCode::Array) => {
                let capacity = self.read_short()?;
                let array = self.new_array(Vec::with_capacity(capacity as usize));
                self.push(Value::Obj(array));
            }
            Some(OpCode::ArrayAppend) => {
                let value = self.pop();
                match self.peek() {
                    Value::Obj(array) if self.heap.as_array(array).is_some() => self.array_push(array, value),
                    _ => return Err(RuntimeError::type_mismatch("Can only append to arrays.")),
                }
            }
            Some(OpCode::Map) => {
                let capacity = self.read_short()?;
                let map = self.new_map(capacity as usize);
                self.push(Value::Obj(map));
            }
            Some(OpCode::MapSet) => {
                let value = self.pop();
                let key = self.pop();
                let Some(key) = key.as_obj().filter(|_| self.heap.is_string(key)) else {
                    return Err(RuntimeError::type_mismatch("Map keys must be strings."));
                };
                match self.peek() {
                    Value::Obj(map) if self.heap.as_map(map).is_some() => self.map_set(map, key, value),
                    _ => return Err(RuntimeError::type_mismatch("Can only set entries on maps.")),
                }
            }
            Some(OpCode::MapHas) => {
                let key = self.pop();
                let map = self.pop();
                let found = match (map, key) {
                    (Value::Obj(map), Value::Obj(key)) if self.heap.is_map(Value::Obj(map)) && self.heap.is_string(Value::Obj(key)) => {
                        self.heap.map_find(map, key).is_some()
                    }
                    _ => false,
                };
                self.push(Value::Bool(found));
            }
            Some(OpCode::Len) => {
                let value = self.pop();
                let len = self.length_of(value)?;
                self.push(Value::Number(len as f64));
            }
            Some(OpCode::IsArray) => {
                let value = self.pop();
                self.push(Value::Bool(self.heap.is_array(value)));
            }
            Some(OpCode::IsMap) => {
                let value = self.pop();
                self.push(Value::Bool(self.heap.is_map(value)));
            }
            Some(OpCode::Try) => {
                let jump = self.read_short()? as usize;
                let frame_index = self.frames.len() - 1;
                let handler = self.frame()?.ip + jump;
                self.try_frames.push(TryFrame {
                    frame_index,
                    handler,
                    stack_top: self.stack.len(),
                    env: self.env,
                });
            }
            Some(OpCode::EndTry) => {
                let current = self.frames.len() - 1;
                if self.try_frames.last().map_or(false, |handler| handler.frame_index == current) {
                    self.try_frames.pop();
                }
            }
            Some(OpCode::Throw) => {
                let value = self.pop();
                return Err(self.throw_value(value));
            }
            Some(OpCode::TryUnwrap) => {
                let value = self.peek();
                if value.is_null() {
                    self.pop();
                    let message = self.new_string("Tried to unwrap null.");
                    return Err(self.throw_value(Value::Obj(message)));
                }
                if self.is_error_object(value) {
                    self.pop();
                    return Err(self.throw_value(value));
                }
            }
            Some(OpCode::MatchEnum) => {
                let enum_name = self.read_name()?;
                let variant = self.read_name()?;
                let value = self.pop();
                let matched = self.matches_enum(value, enum_name, variant);
                self.push(Value::Bool(matched));
            }
            Some(OpCode::Gc) => self.gc_checkpoint(),
            None => return Err(RuntimeError::type_mismatch("Unknown opcode.")),
        }
        Ok(Flow::Continue)
    }

    fn binary_op(&mut self, op: OpCode) -> Result<(), RuntimeError> {
        let (Value::Number(a), Value::Number(b)) = (self.peek_steps(1), self.peek_steps(0)) else {
            return Err(RuntimeError::type_mismatch("Operands must be numbers."));
        };
        self.pop();
        self.pop();
        let result = match op {
            OpCode::Greater => Value::Bool(a > b),
            OpCode::GreaterEqual => Value::Bool(a >= b),
            OpCode::Less => Value::Bool(a < b),
            OpCode::LessEqual => Value::Bool(a <= b),
            OpCode::Subtract => Value::Number(a - b),
            OpCode::Multiply => Value::Number(a * b),
            OpCode::Divide => Value::Number(a / b),
            OpCode::Modulo => Value::Number(a % b),
            _ => return Err(RuntimeError::type_mismatch("Unknown binary operator.")),
        };
        self.push(result);
        Ok(())
    }

    // ---- operand decoding ----

    fn frame(&self) -> Result<&crate::call_frame::CallFrame, RuntimeError> {
        self.frames.last().ok_or_else(|| RuntimeError::type_mismatch("No active call frame."))
    }

    fn frame_mut(&mut self) -> Result<&mut crate::call_frame::CallFrame, RuntimeError> {
        self.frames.last_mut().ok_or_else(|| RuntimeError::type_mismatch("No active call frame."))
    }

    fn read_byte(&mut self) -> Result<u8, RuntimeError> {
        let frame = self.frame_mut()?;
        let byte = frame
            .chunk
            .read_from_offset(frame.ip)
            .ok_or_else(|| RuntimeError::type_mismatch("Unexpected end of bytecode."))?;
        frame.ip += 1;
        Ok(byte)
    }

    fn read_short(&mut self) -> Result<u16, RuntimeError> {
        let frame = self.frame_mut()?;
        let short = frame
            .chunk
            .read_short_from_offset(frame.ip)
            .ok_or_else(|| RuntimeError::type_mismatch("Unexpected end of bytecode."))?;
        frame.ip += 2;
        Ok(short)
    }

    fn read_constant(&mut self) -> Result<Value, RuntimeError> {
        let index = self.read_short()? as usize;
        self.constant(index)
    }

    fn read_name(&mut self) -> Result<ObjRef, RuntimeError> {
        let index = self.read_short()? as usize;
        self.name_constant(index)
    }

    fn constant(&self, index: usize) -> Result<Value, RuntimeError> {
        self.frame()?
            .chunk
            .get_constant(index)
            .ok_or_else(|| RuntimeError::type_mismatch("Constant index out of range."))
    }

    fn name_constant(&self, index: usize) -> Result<ObjRef, RuntimeError> {
        match self.constant(index)? {
            Value::Obj(handle) if self.heap.as_string(handle).is_some() => Ok(handle),
            _ => Err(RuntimeError::type_mismatch("Expected a name constant.")),
        }
    }

    // ---- declarations ----

    /// Pop `count` method closures into a fresh class bound to `name`.
    fn define_class(&mut self, name: ObjRef, count: u16) -> Result<(), RuntimeError> {
        let methods = self.new_map(count as usize);
        for _ in 0..count {
            let method = self.pop();
            let Some(handle) = method.as_obj().filter(|_| self.value_type(method) == Some(ObjectType::Function)) else {
                return Err(RuntimeError::type_mismatch("Class methods must be functions."));
            };
            let init = self.names.init;
            let Some(function) = self.heap.as_function_mut(handle) else {
                continue;
            };
            let method_name = function.name;
            if method_name == init {
                function.is_initializer = true;
            }
            self.map_set(methods, method_name, method);
        }
        let class = self.new_class(ObjectClass::new(name, methods));
        self.assign_or_define(name, Value::Obj(class));
        Ok(())
    }

    /// Pop `readonly`, `defaults` and `fields` and bind a struct class to `name`.
    fn define_struct(&mut self, name: ObjRef) -> Result<(), RuntimeError> {
        let readonly = self.pop();
        let defaults = self.pop();
        let fields = self.pop();
        let (Value::Obj(fields), Value::Obj(defaults), Value::Obj(readonly)) = (fields, defaults, readonly) else {
            return Err(RuntimeError::type_mismatch("Malformed struct declaration."));
        };
        if self.heap.as_array(fields).is_none() || self.heap.as_map(defaults).is_none() || self.heap.as_array(readonly).is_none() {
            return Err(RuntimeError::type_mismatch("Malformed struct declaration."));
        }
        let methods = self.new_map(0);
        let mut class = ObjectClass::new(name, methods);
        class.shape = Some(StructShape { fields, defaults, readonly });
        let class = self.new_class(class);
        self.assign_or_define(name, Value::Obj(class));
        Ok(())
    }

    /// Script entry: the function occupies slot 0 and runs in the current env.
    pub(crate) fn call_script(&mut self, function: ObjRef) -> Result<(), RuntimeError> {
        let Some(script) = self.heap.as_function(function) else {
            return Err(RuntimeError::type_mismatch("Can only interpret functions."));
        };
        let chunk = Rc::clone(&script.chunk);
        let path = script.path.clone();
        if self.frames.len() >= self.config.max_frames {
            return Err(RuntimeErrorKind::StackOverflow.into());
        }
        self.push(Value::Obj(function));
        let mut frame = crate::call_frame::CallFrame::new(function, chunk, self.stack.len() - 1, 0, self.env);
        frame.is_script = true;
        frame.previous_path = self.current_path.clone();
        if path.is_some() {
            self.current_path = path;
        }
        self.frames.push(frame);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::chunk::OpCode;
    use crate::config::VmConfig;
    use crate::error::RuntimeErrorKind;
    use crate::value::Value;
    use crate::vm::test_support::run_script;
    use crate::vm::{InterpretResult, VM};

    fn quiet() -> VM {
        VM::with_config(VmConfig {
            stack_trace: false,
            ..VmConfig::default()
        })
    }

    #[test]
    fn adds_two_numbers() {
        let mut vm = quiet();
        let result = run_script(&mut vm, |a| {
            a.num(1.0).num(2.0).op(OpCode::Add).op(OpCode::Return);
        });
        assert_eq!(result, InterpretResult::InterpretOk);
        assert_eq!(vm.last_value(), Value::Number(3.0));
    }

    #[test]
    fn arithmetic_and_comparison() {
        let mut vm = quiet();
        run_script(&mut vm, |a| {
            a.num(7.0).num(2.0).op(OpCode::Modulo);
            a.num(3.0).op(OpCode::Multiply);
            a.num(1.0).op(OpCode::Subtract);
            a.op(OpCode::Negate);
            a.num(-2.0).op(OpCode::Divide);
            a.op(OpCode::Return);
        });
        assert_eq!(vm.last_value(), Value::Number(1.0));

        run_script(&mut vm, |a| {
            a.num(2.0).num(2.0).op(OpCode::GreaterEqual);
            a.op(OpCode::Not).op(OpCode::Return);
        });
        assert_eq!(vm.last_value(), Value::Bool(false));
    }

    #[test]
    fn string_concatenation_and_equality_by_content() {
        let mut vm = quiet();
        run_script(&mut vm, |a| {
            a.str("foo").str("bar").op(OpCode::Add);
            a.str("foobar").op(OpCode::Equal).op(OpCode::Return);
        });
        assert_eq!(vm.last_value(), Value::Bool(true));
    }

    #[test]
    fn mixed_add_is_a_type_error() {
        let mut vm = quiet();
        let result = run_script(&mut vm, |a| {
            a.at(3, 7, "+");
            a.num(1.0).str("x").op(OpCode::Add).op(OpCode::Return);
        });
        assert_eq!(result, InterpretResult::InterpretRuntimeError);
        let error = vm.last_error().unwrap();
        assert_eq!(error.message(), "Operands must be two numbers or two strings.");
        assert_eq!(error.location.line, 3);
        assert_eq!(error.location.column, 7);
        assert_eq!(error.to_string(), "<script>:3:7: RuntimeError at '+': Operands must be two numbers or two strings.");
        assert!(vm.had_error());
    }

    #[test]
    fn globals_scopes_and_constants() {
        let mut vm = quiet();
        let result = run_script(&mut vm, |a| {
            a.num(1.0).named(OpCode::DefineVar, "x");
            a.op(OpCode::BeginScope);
            a.num(2.0).named(OpCode::DefineVar, "x");
            a.num(5.0).named(OpCode::DefineConst, "k");
            a.op(OpCode::EndScope);
            a.num(10.0).named(OpCode::SetVar, "x").op(OpCode::Pop);
            a.named(OpCode::GetVar, "x").op(OpCode::Return);
        });
        assert_eq!(result, InterpretResult::InterpretOk);
        assert_eq!(vm.last_value(), Value::Number(10.0));
        assert_eq!(vm.global("x"), Some(Value::Number(10.0)));
        assert_eq!(vm.global("k"), None);
    }

    #[test]
    fn assigning_a_constant_fails() {
        let mut vm = quiet();
        let result = run_script(&mut vm, |a| {
            a.num(5.0).named(OpCode::DefineConst, "k");
            a.num(6.0).named(OpCode::SetVar, "k").op(OpCode::Return);
        });
        assert_eq!(result, InterpretResult::InterpretRuntimeError);
        assert_eq!(vm.last_error().unwrap().message(), "Cannot assign to constant.");
    }

    #[test]
    fn undefined_variable_suggests_close_name() {
        let mut vm = quiet();
        let result = run_script(&mut vm, |a| {
            a.num(1.0).named(OpCode::DefineVar, "counter");
            a.named(OpCode::GetVar, "countr").op(OpCode::Return);
        });
        assert_eq!(result, InterpretResult::InterpretRuntimeError);
        assert_eq!(
            vm.last_error().unwrap().kind,
            RuntimeErrorKind::UndefinedVariable {
                name: "countr".to_string(),
                suggestion: Some("counter".to_string()),
            }
        );
    }

    #[test]
    fn jump_if_false_leaves_condition_on_stack() {
        let mut vm = quiet();
        // if (false) { 1 } else { 2 }
        let result = run_script(&mut vm, |a| {
            a.op(OpCode::False);
            let else_jump = a.b.emit_jump(OpCode::JumpIfFalse);
            a.op(OpCode::Pop).num(1.0);
            let end_jump = a.b.emit_jump(OpCode::Jump);
            a.b.patch_jump(else_jump).unwrap();
            a.op(OpCode::Pop).num(2.0);
            a.b.patch_jump(end_jump).unwrap();
            a.op(OpCode::Return);
        });
        assert_eq!(result, InterpretResult::InterpretOk);
        assert_eq!(vm.last_value(), Value::Number(2.0));
    }

    #[test]
    fn loop_sums_to_ten() {
        let mut vm = quiet();
        run_script(&mut vm, |a| {
            a.num(0.0).named(OpCode::DefineVar, "i");
            a.num(0.0).named(OpCode::DefineVar, "sum");
            let start = a.b.position();
            a.named(OpCode::GetVar, "i").num(5.0).op(OpCode::Less);
            let exit = a.b.emit_jump(OpCode::JumpIfFalse);
            a.op(OpCode::Pop);
            a.named(OpCode::GetVar, "sum").named(OpCode::GetVar, "i").op(OpCode::Add);
            a.named(OpCode::SetVar, "sum").op(OpCode::Pop);
            a.named(OpCode::GetVar, "i").num(1.0).op(OpCode::Add);
            a.named(OpCode::SetVar, "i").op(OpCode::Pop);
            a.b.emit_loop(start).unwrap();
            a.b.patch_jump(exit).unwrap();
            a.op(OpCode::Pop);
            a.named(OpCode::GetVar, "sum").op(OpCode::Return);
        });
        assert_eq!(vm.last_value(), Value::Number(10.0));
    }

    #[test]
    fn collections_and_predicates() {
        let mut vm = quiet();
        run_script(&mut vm, |a| {
            a.op(OpCode::Array).short(2);
            a.num(1.0).op(OpCode::ArrayAppend);
            a.num(2.0).op(OpCode::ArrayAppend);
            a.named(OpCode::DefineVar, "xs");
            a.op(OpCode::Map).short(1);
            a.str("a").num(1.0).op(OpCode::MapSet);
            a.named(OpCode::DefineVar, "m");
            a.op(OpCode::Array).short(0);
            a.named(OpCode::GetVar, "xs").op(OpCode::Len).op(OpCode::ArrayAppend);
            a.named(OpCode::GetVar, "m").str("a").op(OpCode::MapHas).op(OpCode::ArrayAppend);
            a.named(OpCode::GetVar, "m").str("b").op(OpCode::MapHas).op(OpCode::ArrayAppend);
            a.named(OpCode::GetVar, "xs").op(OpCode::IsArray).op(OpCode::ArrayAppend);
            a.named(OpCode::GetVar, "xs").op(OpCode::IsMap).op(OpCode::ArrayAppend);
            a.op(OpCode::Return);
        });
        assert_eq!(vm.display(vm.last_value()), "[2, true, false, true, false]");
    }

    #[test]
    fn stringify_uses_display_format() {
        let mut vm = quiet();
        run_script(&mut vm, |a| {
            a.op(OpCode::Array).short(1);
            a.num(1.5).op(OpCode::ArrayAppend);
            a.op(OpCode::Stringify).str("!").op(OpCode::Add).op(OpCode::Return);
        });
        assert_eq!(vm.display(vm.last_value()), "[1.5]!");
    }

    #[test]
    fn len_rejects_numbers() {
        let mut vm = quiet();
        let result = run_script(&mut vm, |a| {
            a.num(3.0).op(OpCode::Len).op(OpCode::Return);
        });
        assert_eq!(result, InterpretResult::InterpretRuntimeError);
        assert!(matches!(vm.last_error().unwrap().kind, RuntimeErrorKind::TypeMismatch(_)));
    }

    #[test]
    fn instruction_budget_stops_infinite_loop() {
        let mut vm = VM::with_config(VmConfig {
            instruction_budget: Some(500),
            stack_trace: false,
            ..VmConfig::default()
        });
        let result = run_script(&mut vm, |a| {
            let start = a.b.position();
            a.op(OpCode::Null).op(OpCode::Pop);
            a.b.emit_loop(start).unwrap();
        });
        assert_eq!(result, InterpretResult::InterpretRuntimeError);
        assert_eq!(vm.last_error().unwrap().kind, RuntimeErrorKind::InstructionBudgetExceeded(500));
    }

    #[test]
    fn stack_limit_is_enforced() {
        let mut vm = VM::with_config(VmConfig {
            max_stack_slots: 8,
            stack_trace: false,
            ..VmConfig::default()
        });
        let result = run_script(&mut vm, |a| {
            let start = a.b.position();
            a.op(OpCode::Null);
            a.b.emit_loop(start).unwrap();
        });
        assert_eq!(result, InterpretResult::InterpretRuntimeError);
        assert_eq!(vm.last_error().unwrap().kind, RuntimeErrorKind::StackLimitExceeded(8));
    }

    #[test]
    fn heap_limit_collects_before_failing() {
        let mut vm = VM::with_config(VmConfig {
            max_heap_bytes: Some(64 * 1024),
            stack_trace: false,
            ..VmConfig::default()
        });
        // Garbage alone never breaches the limit: each forced collection reclaims it.
        let result = run_script(&mut vm, |a| {
            a.num(0.0).named(OpCode::DefineVar, "i");
            let start = a.b.position();
            a.named(OpCode::GetVar, "i").num(2000.0).op(OpCode::Less);
            let exit = a.b.emit_jump(OpCode::JumpIfFalse);
            a.op(OpCode::Pop);
            a.op(OpCode::Array).short(16).op(OpCode::Pop);
            a.named(OpCode::GetVar, "i").num(1.0).op(OpCode::Add);
            a.named(OpCode::SetVar, "i").op(OpCode::Pop);
            a.b.emit_loop(start).unwrap();
            a.b.patch_jump(exit).unwrap();
            a.op(OpCode::Pop).op(OpCode::Null).op(OpCode::Return);
        });
        assert_eq!(result, InterpretResult::InterpretOk);
        assert!(vm.gc.stats().major_cycles > 0);

        // Live data that cannot be reclaimed is fatal.
        let result = run_script(&mut vm, |a| {
            a.op(OpCode::Array).short(0).named(OpCode::DefineVar, "keep");
            let start = a.b.position();
            a.named(OpCode::GetVar, "keep").named(OpCode::GetVar, "keep").op(OpCode::Len).str("item").op(OpCode::Stringify);
            a.op(OpCode::SetIndex).op(OpCode::Pop);
            a.b.emit_loop(start).unwrap();
        });
        assert_eq!(result, InterpretResult::InterpretRuntimeError);
        assert_eq!(vm.last_error().unwrap().kind, RuntimeErrorKind::HeapLimitExceeded(64 * 1024));
    }

    #[test]
    fn match_enum_checks_tag() {
        let mut vm = quiet();
        let some = vm.enum_ctor("Option", "Some", 1);
        let name = vm.intern("Some");
        let globals = vm.globals;
        vm.define_var(globals, name, some);
        run_script(&mut vm, |a| {
            a.op(OpCode::Array).short(0);
            a.named(OpCode::GetVar, "Some").num(4.0).op(OpCode::Call).byte(1);
            a.named(OpCode::DefineVar, "v");
            a.named(OpCode::GetVar, "v");
            a.op(OpCode::MatchEnum);
            let option = a.name_index("Option");
            let some = a.name_index("Some");
            a.short(option).short(some);
            a.op(OpCode::ArrayAppend);
            a.named(OpCode::GetVar, "v");
            a.op(OpCode::MatchEnum);
            let none = a.name_index("None");
            a.short(option).short(none);
            a.op(OpCode::ArrayAppend);
            a.named(OpCode::GetVar, "v").str("_values").op(OpCode::GetIndex);
            a.op(OpCode::ArrayAppend);
            a.op(OpCode::Return);
        });
        assert_eq!(vm.display(vm.last_value()), "[true, false, [4]]");
    }

    #[test]
    fn struct_fills_fields_from_arguments_and_defaults() {
        let mut vm = quiet();
        let result = run_script(&mut vm, |a| {
            a.op(OpCode::Array).short(3);
            a.str("x").op(OpCode::ArrayAppend);
            a.str("y").op(OpCode::ArrayAppend);
            a.str("z").op(OpCode::ArrayAppend);
            a.op(OpCode::Map).short(1);
            a.str("y").num(9.0).op(OpCode::MapSet);
            a.op(OpCode::Array).short(1);
            a.str("x").op(OpCode::ArrayAppend);
            a.named(OpCode::Struct, "Point");
            a.named(OpCode::GetVar, "Point").num(1.0).op(OpCode::Call).byte(1);
            a.named(OpCode::DefineVar, "p");
            a.op(OpCode::Array).short(3);
            a.named(OpCode::GetVar, "p").named(OpCode::GetProperty, "x").op(OpCode::ArrayAppend);
            a.named(OpCode::GetVar, "p").named(OpCode::GetProperty, "y").op(OpCode::ArrayAppend);
            a.named(OpCode::GetVar, "p").named(OpCode::GetProperty, "z").op(OpCode::ArrayAppend);
            a.op(OpCode::Return);
        });
        assert_eq!(result, InterpretResult::InterpretOk);
        assert_eq!(vm.display(vm.last_value()), "[1, 9, null]");

        let result = run_script(&mut vm, |a| {
            a.named(OpCode::GetVar, "p").num(2.0).named(OpCode::SetProperty, "x").op(OpCode::Return);
        });
        assert_eq!(result, InterpretResult::InterpretRuntimeError);
        assert_eq!(vm.last_error().unwrap().message(), "Cannot assign to readonly field 'x'.");
    }

    #[test]
    fn optional_call_on_null_yields_null() {
        let mut vm = quiet();
        let result = run_script(&mut vm, |a| {
            a.op(OpCode::Null).num(1.0).op(OpCode::CallOptional).byte(1).op(OpCode::Return);
        });
        assert_eq!(result, InterpretResult::InterpretOk);
        assert_eq!(vm.last_value(), Value::Null);
    }

    #[test]
    fn stack_is_reset_between_runs() {
        let mut vm = quiet();
        let result = run_script(&mut vm, |a| {
            a.num(1.0).num(2.0).named(OpCode::GetVar, "missing");
        });
        assert_eq!(result, InterpretResult::InterpretRuntimeError);
        let result = run_script(&mut vm, |a| {
            a.num(4.0).op(OpCode::Return);
        });
        assert_eq!(result, InterpretResult::InterpretOk);
        assert_eq!(vm.last_value(), Value::Number(4.0));
        assert!(vm.last_error().is_none());
    }
}
