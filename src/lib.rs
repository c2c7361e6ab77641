//! Kiln - an incremental JIT compilation core.
//!
//! Compiles stack-machine bytecode units to A32 or AArch64 code under
//! memory and time budgets. A compilation can stop at any task boundary
//! and later resume with bit-identical results.

pub mod config;
pub mod jit;
pub mod vm;

// Re-export commonly used types
pub use config::{ConfigError, JitConfig};
pub use jit::{CompileStatus, CompiledCode, Failure, JitCompiler, JitError};
pub use vm::text::parse_program;
pub use vm::{CompilationUnit, Program, ProgramError, UnitId};
