//! The per-VM front door to the JIT.
//!
//! [`JitCompiler`] owns the single snapshot slot and remembers which units
//! can never be compiled. A scheduler calls `compile` when a unit gets hot,
//! `resume` at later scheduling points, and `abort_suspended` when it wants
//! the slot back.

use super::backend::Backend;
use super::budget::{Budget, TimeSlice};
use super::code::CompiledCode;
use super::memory::{CodeAllocator, HeapAllocator};
use super::session::{CompilerSession, Outcome};
use super::snapshot::SuspendedSnapshot;
use super::Failure;
use crate::config::{ConfigError, JitConfig};
use crate::vm::{Program, UnitId};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JitError {
    /// The unit is marked permanently non-compilable.
    #[error("unit {unit} cannot be compiled: {cause}")]
    NotCompilable { unit: UnitId, cause: Failure },
    /// Not enough scratch memory to start. The unit stays eligible.
    #[error("not enough scratch memory to compile unit {unit}")]
    ReservationFailed { unit: UnitId },
    #[error("unit {suspended} is suspended; resume or abort it first")]
    Busy { suspended: UnitId },
    #[error("no suspended compilation for unit {unit}")]
    NothingToResume { unit: UnitId },
    #[error("unknown unit {0}")]
    UnknownUnit(UnitId),
}

#[derive(Debug)]
pub enum CompileStatus {
    Compiled(CompiledCode),
    /// Out of time; call `resume` later.
    Suspended,
}

pub struct JitCompiler<B: Backend> {
    backend: B,
    config: JitConfig,
    allocator: Arc<dyn CodeAllocator>,
    suspended: Option<SuspendedSnapshot<B>>,
    failures: HashMap<UnitId, Failure>,
    /// Enlarged estimates for units that ran out of buffer once.
    retries: HashMap<UnitId, u32>,
}

impl<B: Backend> JitCompiler<B> {
    /// Fails when `config` does not pass [`JitConfig::validate`].
    pub fn new(backend: B, config: JitConfig) -> Result<Self, ConfigError> {
        let allocator = Arc::new(HeapAllocator::new(config.scratch_limit));
        Self::with_allocator(backend, config, allocator)
    }

    pub fn with_allocator(
        backend: B,
        config: JitConfig,
        allocator: Arc<dyn CodeAllocator>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            backend,
            config,
            allocator,
            suspended: None,
            failures: HashMap::new(),
            retries: HashMap::new(),
        })
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    pub fn allocator(&self) -> &Arc<dyn CodeAllocator> {
        &self.allocator
    }

    pub fn is_compilable(&self, unit: UnitId) -> bool {
        !self.failures.contains_key(&unit)
    }

    /// Why `unit` was marked non-compilable, if it was.
    pub fn failure(&self, unit: UnitId) -> Option<Failure> {
        self.failures.get(&unit).copied()
    }

    pub fn suspended_unit(&self) -> Option<UnitId> {
        self.suspended.as_ref().map(SuspendedSnapshot::unit)
    }

    /// Compile `unit` within one configured time slice.
    pub fn compile(&mut self, program: &Program, unit: UnitId) -> Result<CompileStatus, JitError> {
        let mut budget = TimeSlice::starting_now(self.config.time_slice());
        self.compile_with(program, unit, &mut budget)
    }

    /// Compile `unit` under `budget`. If `unit` is the suspended one, this
    /// resumes it.
    #[tracing::instrument(level = "debug", skip_all, fields(unit = %unit, backend = B::NAME))]
    pub fn compile_with(
        &mut self,
        program: &Program,
        unit: UnitId,
        budget: &mut dyn Budget,
    ) -> Result<CompileStatus, JitError> {
        if let Some(cause) = self.failure(unit) {
            return Err(JitError::NotCompilable { unit, cause });
        }
        match self.suspended_unit() {
            Some(suspended) if suspended == unit => return self.resume_with(program, unit, budget),
            Some(suspended) => return Err(JitError::Busy { suspended }),
            None => {}
        }

        let source = program.get(unit).ok_or(JitError::UnknownUnit(unit))?;
        let estimate = match self.retries.get(&unit) {
            Some(&estimate) => estimate,
            None => CompilerSession::<B>::initial_estimate(source, &self.config),
        };
        let session = CompilerSession::new(
            self.backend.clone(),
            source,
            &self.config,
            self.allocator.clone(),
            estimate,
        )
        .map_err(|_| JitError::ReservationFailed { unit })?;
        self.drive(program, session, budget)
    }

    /// Continue the suspended compilation of `unit` within one time slice.
    pub fn resume(&mut self, program: &Program, unit: UnitId) -> Result<CompileStatus, JitError> {
        let mut budget = TimeSlice::starting_now(self.config.time_slice());
        self.resume_with(program, unit, &mut budget)
    }

    #[tracing::instrument(level = "debug", skip_all, fields(unit = %unit, backend = B::NAME))]
    pub fn resume_with(
        &mut self,
        program: &Program,
        unit: UnitId,
        budget: &mut dyn Budget,
    ) -> Result<CompileStatus, JitError> {
        if self.suspended_unit() != Some(unit) {
            return Err(JitError::NothingToResume { unit });
        }
        if program.get(unit).is_none() {
            return Err(JitError::UnknownUnit(unit));
        }
        let Some(snapshot) = self.suspended.take() else {
            return Err(JitError::NothingToResume { unit });
        };
        debug!(offset = snapshot.code_offset(), pending = snapshot.pending_tasks(), "resuming");
        self.drive(program, snapshot.resume(), budget)
    }

    /// Drop the suspended compilation, if any. With `permanent`, its unit
    /// is never offered to the compiler again.
    pub fn abort_suspended(&mut self, permanent: bool) -> Option<UnitId> {
        let snapshot = self.suspended.take()?;
        let unit = snapshot.unit();
        snapshot.resume().abort();
        if permanent {
            self.mark(unit, Failure::OutOfTime);
        }
        Some(unit)
    }

    fn drive(
        &mut self,
        program: &Program,
        session: CompilerSession<B>,
        budget: &mut dyn Budget,
    ) -> Result<CompileStatus, JitError> {
        let unit = session.unit();
        let estimate = session.estimate();
        match session.drive(program, budget) {
            Ok(Outcome::Finished(code)) => {
                self.retries.remove(&unit);
                Ok(CompileStatus::Compiled(code))
            }
            Ok(Outcome::Suspended(snapshot)) => {
                self.suspended = Some(snapshot);
                Ok(CompileStatus::Suspended)
            }
            Err(Failure::ReservationFailed) => Err(JitError::ReservationFailed { unit }),
            Err(Failure::OutOfMemory) if !self.retries.contains_key(&unit) => {
                let enlarged = estimate.saturating_mul(2).min(self.config.max_code_size);
                debug!(%unit, estimate, enlarged, "retrying with a larger buffer");
                self.retries.insert(unit, enlarged);
                self.compile_with(program, unit, budget)
            }
            Err(cause) => {
                self.retries.remove(&unit);
                let cause = self.mark(unit, cause);
                Err(JitError::NotCompilable { unit, cause })
            }
        }
    }

    /// Mark `unit` non-compilable. The first cause sticks.
    fn mark(&mut self, unit: UnitId, cause: Failure) -> Failure {
        let cause = *self.failures.entry(unit).or_insert(cause);
        debug!(%unit, %cause, "unit marked non-compilable");
        cause
    }
}
