pub mod objects;

pub mod call_frame;
pub mod chunk;
pub mod config;
pub mod debug;
pub mod env;
pub mod error;
pub mod gc;
pub mod value;
pub mod vm;

pub use chunk::{Chunk, ChunkBuilder, OpCode};
pub use config::VmConfig;
pub use error::{RuntimeError, RuntimeErrorKind};
pub use value::Value;
pub use vm::{InterpretResult, ModuleLoader, VM};
