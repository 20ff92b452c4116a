//! Scripted phase executors.
//!
//! Every executor records its calls in a shared `CallLog` so tests can
//! assert how often and in what order phases ran.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use listing_engine::{ExecutionContext, ExecutorError, ExecutorRegistry, Phase, PhaseExecutor};

/// Ordered record of `(product_id, phase, attempt)` for every execution.
#[derive(Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<(String, Phase, u32)>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, ctx: &ExecutionContext) {
        self.calls
            .lock()
            .unwrap()
            .push((ctx.product_id.clone(), ctx.phase, ctx.attempt));
    }

    pub fn all(&self) -> Vec<(String, Phase, u32)> {
        self.calls.lock().unwrap().clone()
    }

    /// Phases executed for one product, in execution order.
    pub fn phases_for(&self, product_id: &str) -> Vec<Phase> {
        self.all()
            .into_iter()
            .filter(|(p, _, _)| p == product_id)
            .map(|(_, phase, _)| phase)
            .collect()
    }

    pub fn count(&self, product_id: &str, phase: Phase) -> usize {
        self.phases_for(product_id)
            .into_iter()
            .filter(|p| *p == phase)
            .count()
    }

    pub fn total(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

/// Succeeds with a small payload naming the phase.
pub struct Succeeds {
    log: CallLog,
}

impl Succeeds {
    pub fn new(log: &CallLog) -> Arc<Self> {
        Arc::new(Self { log: log.clone() })
    }
}

#[async_trait]
impl PhaseExecutor for Succeeds {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<Value, ExecutorError> {
        self.log.record(ctx);
        ctx.progress.report(50).await;
        Ok(json!({ "phase": ctx.phase.number(), "product": ctx.product_id }))
    }
}

/// Fails the first `failures` executions, then succeeds.
pub struct FailsThenSucceeds {
    log: CallLog,
    remaining: AtomicU32,
}

impl FailsThenSucceeds {
    pub fn new(log: &CallLog, failures: u32) -> Arc<Self> {
        Arc::new(Self {
            log: log.clone(),
            remaining: AtomicU32::new(failures),
        })
    }
}

#[async_trait]
impl PhaseExecutor for FailsThenSucceeds {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<Value, ExecutorError> {
        self.log.record(ctx);
        let left = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match left {
            Ok(_) => Err(ExecutorError::failed(format!(
                "upstream unavailable (attempt {})",
                ctx.attempt
            ))),
            Err(_) => Ok(json!({ "phase": ctx.phase.number() })),
        }
    }
}

/// Fails while the switch is on.
pub struct Switchable {
    log: CallLog,
    failing: AtomicBool,
}

impl Switchable {
    pub fn failing(log: &CallLog) -> Arc<Self> {
        Arc::new(Self {
            log: log.clone(),
            failing: AtomicBool::new(true),
        })
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl PhaseExecutor for Switchable {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<Value, ExecutorError> {
        self.log.record(ctx);
        if self.failing.load(Ordering::SeqCst) {
            Err(ExecutorError::failed("rate limited"))
        } else {
            Ok(json!({ "phase": ctx.phase.number() }))
        }
    }
}

/// A registry where every phase succeeds.
pub fn all_succeed(log: &CallLog) -> ExecutorRegistry {
    let mut registry = ExecutorRegistry::new();
    for phase in Phase::ALL {
        registry.register(phase, Succeeds::new(log));
    }
    registry
}

/// A registry where every phase succeeds except `phase`, which uses `executor`.
pub fn all_succeed_except(
    log: &CallLog,
    phase: Phase,
    executor: Arc<dyn PhaseExecutor>,
) -> ExecutorRegistry {
    all_succeed(log).with(phase, executor)
}
