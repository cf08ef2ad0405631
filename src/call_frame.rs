use std::rc::Rc;

use crate::chunk::Chunk;
use crate::env::EnvRef;
use crate::gc::trace::Tracer;
use crate::objects::object::ObjRef;
use crate::value::Value;

/// Bookkeeping for a module body being executed by `IMPORT`/`IMPORT_MODULE`.
#[derive(Debug, Clone)]
pub struct ModuleFrame {
    /// Resolved path, the module cache key.
    pub key: ObjRef,
    /// File stem, used as the module instance's class name.
    pub name: ObjRef,
    pub env: EnvRef,
    /// Map of explicit exports, overlaid on the env's values at return.
    pub exports: ObjRef,
    /// Map of names declared private.
    pub private: ObjRef,
    pub alias: Option<ObjRef>,
    pub push_instance: bool,
}

pub struct CallFrame {
    pub function: ObjRef,
    /// Shared with the function object so dispatch does not go through the heap.
    pub chunk: Rc<Chunk>,
    pub ip: usize,
    /// Stack index of the callee slot; arguments follow it.
    pub slots: usize,
    pub argc: u8,
    pub receiver: Option<Value>,
    pub previous_env: EnvRef,
    pub previous_path: Option<Rc<str>>,
    pub discard_result: bool,
    pub is_script: bool,
    pub module: Option<ModuleFrame>,
}

impl CallFrame {
    pub fn new(function: ObjRef, chunk: Rc<Chunk>, slots: usize, argc: u8, previous_env: EnvRef) -> Self {
        CallFrame {
            function,
            chunk,
            ip: 0,
            slots,
            argc,
            receiver: None,
            previous_env,
            previous_path: None,
            discard_result: false,
            is_script: false,
            module: None,
        }
    }

    /// Offset of the instruction being executed, for diagnostics.
    #[inline(always)]
    pub fn current_offset(&self) -> usize {
        self.ip.saturating_sub(1)
    }

    pub fn trace(&self, tracer: &mut Tracer) {
        tracer.push_object(self.function);
        if let Some(receiver) = self.receiver {
            tracer.push_value(receiver);
        }
        tracer.push_env(self.previous_env);
        if let Some(module) = &self.module {
            tracer.push_object(module.key);
            tracer.push_object(module.name);
            tracer.push_env(module.env);
            tracer.push_object(module.exports);
            tracer.push_object(module.private);
            if let Some(alias) = module.alias {
                tracer.push_object(alias);
            }
        }
    }
}

/// An active `try` handler.
#[derive(Debug, Clone, Copy)]
pub struct TryFrame {
    /// Index of the call frame that executed `TRY`.
    pub frame_index: usize,
    pub handler: usize,
    pub stack_top: usize,
    pub env: EnvRef,
}
