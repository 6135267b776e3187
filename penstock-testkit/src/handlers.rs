use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use penstock::{HandlerError, JobContext, JobHandler};
use serde_json::{json, Value};

/// Uppercases `payload.text` into `{ "text": ... }`.
#[derive(Clone, Debug, Default)]
pub struct UppercaseHandler;

#[async_trait]
impl JobHandler for UppercaseHandler {
    async fn handle(&self, ctx: JobContext) -> Result<Value, HandlerError> {
        let text = ctx
            .payload
            .get("text")
            .and_then(Value::as_str)
            .ok_or_else(|| HandlerError::validation("payload.text must be a string"))?;
        Ok(json!({ "text": text.to_uppercase() }))
    }
}

/// Reports progress in steps, then returns the payload.
#[derive(Clone, Debug)]
pub struct ProgressHandler {
    steps: Vec<u8>,
    pause: Duration,
}

impl ProgressHandler {
    pub fn new(steps: Vec<u8>, pause: Duration) -> Self {
        Self { steps, pause }
    }
}

#[async_trait]
impl JobHandler for ProgressHandler {
    async fn handle(&self, ctx: JobContext) -> Result<Value, HandlerError> {
        for step in &self.steps {
            ctx.report_progress(*step).await;
            tokio::time::sleep(self.pause).await;
        }
        Ok(ctx.payload)
    }
}

/// Fails with a retryable error a fixed number of times, then succeeds.
#[derive(Clone, Debug)]
pub struct FlakyHandler {
    failures: u32,
    calls: Arc<AtomicU32>,
}

impl FlakyHandler {
    pub fn new(failures: u32) -> Self {
        Self {
            failures,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Total handler invocations so far.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobHandler for FlakyHandler {
    async fn handle(&self, ctx: JobContext) -> Result<Value, HandlerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            return Err(HandlerError::ConnectionReset(format!(
                "simulated reset on call {call}"
            )));
        }
        Ok(json!({ "attempt": ctx.attempt }))
    }
}

/// How [`FailingHandler`] fails.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Failure {
    Timeout,
    Validation,
}

/// Always fails the same way.
#[derive(Clone, Debug)]
pub struct FailingHandler {
    failure: Failure,
    calls: Arc<AtomicU32>,
}

impl FailingHandler {
    pub fn new(failure: Failure) -> Self {
        Self {
            failure,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobHandler for FailingHandler {
    async fn handle(&self, ctx: JobContext) -> Result<Value, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(match self.failure {
            Failure::Timeout => {
                HandlerError::timeout(format!("completion call timed out on attempt {}", ctx.attempt))
            }
            Failure::Validation => HandlerError::validation("entry text is empty"),
        })
    }
}

/// Panics on every call.
#[derive(Clone, Debug, Default)]
pub struct PanickingHandler;

#[async_trait]
impl JobHandler for PanickingHandler {
    async fn handle(&self, _ctx: JobContext) -> Result<Value, HandlerError> {
        panic!("handler panicked on purpose");
    }
}

/// Sleeps for a while and records the highest number of overlapping calls.
#[derive(Clone, Debug)]
pub struct ConcurrencyGauge {
    hold: Duration,
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl ConcurrencyGauge {
    pub fn new(hold: Duration) -> Self {
        Self {
            hold,
            current: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobHandler for ConcurrencyGauge {
    async fn handle(&self, _ctx: JobContext) -> Result<Value, HandlerError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.hold).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(Value::Null)
    }
}
