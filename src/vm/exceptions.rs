use log::trace;

use crate::{
    error::{RuntimeError, RuntimeErrorKind},
    value::Value,
};

use super::VM;

impl VM {
    /// Maps tagged with `__error: true`, as built by `throw`.
    pub(crate) fn is_error_object(&self, value: Value) -> bool {
        match value {
            Value::Obj(map) if self.heap.is_map(value) => {
                self.heap.map_get(map, self.names.error).map_or(false, |tag| !tag.is_falsey())
            }
            _ => false,
        }
    }

    /// Wrap a thrown value as `{ __error, message, value, stack }`. Error
    /// objects pass through unchanged so a rethrow keeps its original trace.
    pub(crate) fn make_error(&mut self, value: Value) -> Value {
        if self.is_error_object(value) {
            return value;
        }
        let message = match value {
            Value::Obj(string) if self.heap.is_string(value) => string,
            _ => {
                let text = self.heap.display_value(value);
                self.new_string(&text)
            }
        };
        let lines = self.capture_stack_trace();
        let mut frames = Vec::with_capacity(lines.len());
        for line in &lines {
            frames.push(Value::Obj(self.new_string(line)));
        }
        let stack = self.new_array(frames);
        let error = self.new_map(4);
        self.map_set(error, self.names.error, Value::Bool(true));
        self.map_set(error, self.names.message, Value::Obj(message));
        self.map_set(error, self.names.value, value);
        self.map_set(error, self.names.stack, Value::Obj(stack));
        Value::Obj(error)
    }

    /// Build the error that carries a `throw` to the dispatch loop.
    pub(crate) fn throw_value(&mut self, value: Value) -> RuntimeError {
        let error = self.make_error(value);
        let message = match error {
            Value::Obj(map) => self
                .heap
                .map_get(map, self.names.message)
                .map(|message| self.heap.display_value(message))
                .unwrap_or_default(),
            _ => String::new(),
        };
        let mut runtime_error = RuntimeError::new(RuntimeErrorKind::UncaughtThrow(message));
        runtime_error.thrown = Some(error);
        runtime_error
    }

    /// Unwind to the innermost handler owned by a frame at or above the
    /// current floor. Restores that handler's stack height and env, pushes the
    /// error and jumps to the handler. Returns false if there is none.
    pub(crate) fn catch(&mut self, error: Value) -> bool {
        while let Some(handler) = self.try_frames.last().copied() {
            if handler.frame_index < self.frame_floor {
                return false;
            }
            self.try_frames.pop();
            if handler.frame_index >= self.frames.len() {
                continue;
            }
            self.unwind_frames(handler.frame_index + 1);
            let Some(frame) = self.frames.last_mut() else {
                return false;
            };
            frame.ip = handler.handler;
            self.stack.truncate(handler.stack_top);
            self.env = handler.env;
            self.push(error);
            trace!("caught throw in frame {}", handler.frame_index);
            return true;
        }
        false
    }

    /// Pop every frame above `depth`. A module body cut short loses its
    /// loading marker so the import can be retried.
    pub(crate) fn unwind_frames(&mut self, depth: usize) {
        while self.frames.len() > depth {
            let Some(frame) = self.frames.pop() else {
                break;
            };
            self.current_path = frame.previous_path;
            if let Some(module) = frame.module {
                self.map_set(self.modules, module.key, Value::Null);
            }
        }
    }
}
