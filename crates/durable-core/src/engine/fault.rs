//! Fault injection hook for crash-recovery testing.
//!
//! The executor calls [`FaultHook::after_step_started`] once the
//! `IN_PROGRESS` claim for a step is committed and before the step's work
//! runs. [`CrashInjector`] uses that point to kill the process, leaving a
//! durable in-progress record behind for a later resume to recover.

use std::sync::atomic::{AtomicU64, Ordering};

use durable_types::step::StepRecord;

/// Observer of step starts.
pub trait FaultHook: Send + Sync {
    fn after_step_started(&self, record: &StepRecord);
}

/// Hook that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFaults;

impl FaultHook for NoFaults {
    fn after_step_started(&self, _record: &StepRecord) {}
}

/// Terminates the process with exit code 1 on the n-th step start.
#[derive(Debug)]
pub struct CrashInjector {
    crash_after: u64,
    started: AtomicU64,
}

impl CrashInjector {
    /// `crash_after = 0` never fires.
    pub fn new(crash_after: u64) -> Self {
        Self {
            crash_after,
            started: AtomicU64::new(0),
        }
    }

    /// Count one step start; `true` when this start is the one to crash on.
    pub fn record_start(&self) -> bool {
        let started = self.started.fetch_add(1, Ordering::SeqCst) + 1;
        self.crash_after > 0 && started == self.crash_after
    }

    pub fn started(&self) -> u64 {
        self.started.load(Ordering::SeqCst)
    }
}

impl FaultHook for CrashInjector {
    fn after_step_started(&self, record: &StepRecord) {
        if self.record_start() {
            tracing::error!(
                workflow_id = %record.workflow_id,
                step_key = %record.step_key,
                step_id = %record.step_id,
                crash_after = self.crash_after,
                "injected crash after step start"
            );
            std::process::exit(1);
        }
    }
}
