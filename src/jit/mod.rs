//! Incremental JIT compilation.
//!
//! This module provides:
//! - An offset-addressed code buffer with allocator-backed growth
//! - Labels with backpatch chains threaded through the code
//! - A literal pool for constants that do not fit an immediate
//! - A LIFO work queue of compilation tasks and the session that drains it
//! - Suspension of a session at task boundaries and bit-identical resumption
//! - A32 and AArch64 instruction encoding

pub mod backend;
pub mod budget;
pub mod code;
mod codebuf;
pub mod compiler;
mod label;
mod literal;
mod masm;
pub mod memory;
pub mod session;
pub mod snapshot;
mod task;
pub mod template;

pub use backend::{AArch64, Arm32, Backend};
pub use budget::{Budget, TaskQuota, TimeSlice, Unlimited};
pub use code::{CompiledCode, OsrEntry, Relocation};
pub use codebuf::{BufferLimits, CodeBuffer};
pub use compiler::{CompileStatus, JitCompiler, JitError};
pub use label::{Label, LabelChain, LabelId, LabelTable};
pub use literal::{Literal, LiteralPool};
pub use masm::MacroAssembler;
pub use memory::{AllocError, CodeAllocator, ExecutableMemory, HeapAllocator};
pub use session::{CompilerSession, Outcome, SessionStats};
pub use snapshot::SuspendedSnapshot;
pub use task::{ExceptionKind, Task, WorkQueue};

use thiserror::Error;

/// Byte offset into a code buffer. Stays valid across buffer growth.
pub type CodeOffset = u32;

/// Why a compilation stopped before producing code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum Failure {
    /// Scratch memory for the code buffer could not be reserved. Retry later.
    #[error("could not reserve scratch memory for the code buffer")]
    ReservationFailed,
    /// The time budget ran out at a task boundary. The session is suspended.
    #[error("time budget exhausted")]
    OutOfTime,
    /// The code buffer outgrew its estimate or the size ceiling.
    #[error("code buffer exhausted")]
    OutOfMemory,
    /// Inline nesting exceeded its limit.
    #[error("inline nesting too deep")]
    OutOfStack,
}
