//! Bounded-concurrency pipeline stages.
//!
//! A stage accepts units through a one-slot queue. Its driver takes units
//! off the queue, waits for enough claims, and runs each unit on its own
//! task. Finished units are forwarded to the output sink, failed ones to the
//! error sink.
use std::{
    any::Any,
    collections::HashMap,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tonic::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::claims::{Claim, ClaimPool};

mod input_fetch;

pub use self::input_fetch::{InputFetchStage, InputFetcher};

/// What a stage does with each unit.
#[async_trait]
pub trait StageWorker: Send + Sync + 'static {
    type Unit: Send + 'static;
    type Error: std::error::Error + Send + Sync + 'static;

    fn name(&self) -> &'static str;

    /// How many claims a unit needs while it is processed.
    fn claims_required(&self, _unit: &Self::Unit) -> u32 {
        1
    }

    /// Short description of a unit, for logs.
    fn describe(&self, unit: &Self::Unit) -> String;

    async fn process(
        &self,
        unit: &mut Self::Unit,
        cancel: &CancellationToken,
    ) -> Result<(), Self::Error>;
}

/// How a unit left a stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub stage: &'static str,
    pub success: bool,
    /// Slot usage after the unit released its claims, as `active/width`.
    pub usage: String,
    /// Time spent processing.
    pub duration: Duration,
    /// Time spent waiting for claims before processing started.
    pub stall: Duration,
    /// Set on failure. For an input fetch this is a precondition failure,
    /// not something the action itself did.
    pub error: Option<String>,
}

impl std::fmt::Display for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = if self.success { "Success" } else { "Failure" };
        write!(f, "{}, {}", status, self.usage)
    }
}

/// Where units go after a stage.
#[async_trait]
pub trait PipelineSink<T>: Send + Sync {
    async fn put(&self, unit: T, completion: Completion);
}

/// A [PipelineSink] forwarding into a channel.
pub struct ChannelSink<T> {
    tx: mpsc::Sender<(T, Completion)>,
}

impl<T> ChannelSink<T> {
    pub fn new(tx: mpsc::Sender<(T, Completion)>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl<T: Send + 'static> PipelineSink<T> for ChannelSink<T> {
    async fn put(&self, unit: T, completion: Completion) {
        if self.tx.send((unit, completion)).await.is_err() {
            warn!("pipeline sink closed, dropping unit");
        }
    }
}

/// Counters a stage keeps about its units.
#[derive(Debug, Default)]
pub struct StageMetrics {
    slot_usage: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    duration_micros: AtomicU64,
    stall_micros: AtomicU64,
}

impl StageMetrics {
    /// Number of units currently being processed.
    pub fn slot_usage(&self) -> u64 {
        self.slot_usage.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn total_duration(&self) -> Duration {
        Duration::from_micros(self.duration_micros.load(Ordering::Relaxed))
    }

    pub fn total_stall(&self) -> Duration {
        Duration::from_micros(self.stall_micros.load(Ordering::Relaxed))
    }

    fn record(&self, completion: &Completion) {
        if completion.success {
            self.completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.duration_micros
            .fetch_add(completion.duration.as_micros() as u64, Ordering::Relaxed);
        self.stall_micros
            .fetch_add(completion.stall.as_micros() as u64, Ordering::Relaxed);
    }
}

pub struct PipelineStage<W: StageWorker> {
    worker: W,
    width: u32,
    claims: ClaimPool,

    tx: mpsc::Sender<W::Unit>,
    rx: tokio::sync::Mutex<mpsc::Receiver<W::Unit>>,
    closed: CancellationToken,

    active: Mutex<HashMap<u64, CancellationToken>>,
    next_id: AtomicU64,
    tracker: TaskTracker,
    metrics: StageMetrics,

    output: Arc<dyn PipelineSink<W::Unit>>,
    error: Arc<dyn PipelineSink<W::Unit>>,
}

impl<W: StageWorker> PipelineStage<W> {
    pub fn new(
        worker: W,
        width: u32,
        output: Arc<dyn PipelineSink<W::Unit>>,
        error: Arc<dyn PipelineSink<W::Unit>>,
    ) -> Self {
        let width = width.max(1);
        let (tx, rx) = mpsc::channel(1);

        Self {
            worker,
            width,
            claims: ClaimPool::new(width),
            tx,
            rx: tokio::sync::Mutex::new(rx),
            closed: CancellationToken::new(),
            active: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            tracker: TaskTracker::new(),
            metrics: StageMetrics::default(),
            output,
            error,
        }
    }

    pub fn name(&self) -> &'static str {
        self.worker.name()
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn metrics(&self) -> &StageMetrics {
        &self.metrics
    }

    /// Number of units currently being processed.
    pub fn slot_usage(&self) -> usize {
        self.active.lock().len()
    }

    fn usage(&self, active: usize) -> String {
        format!("{}/{}", active, self.width)
    }

    /// Waits until the queue slot is free and hands `unit` to the stage.
    /// The unit is given back if the stage is closed or `cancel` fires first.
    pub async fn put(&self, unit: W::Unit, cancel: &CancellationToken) -> Result<(), W::Unit> {
        if self.closed.is_cancelled() {
            return Err(unit);
        }

        let permit = tokio::select! {
            permit = self.tx.reserve() => permit,
            _ = cancel.cancelled() => return Err(unit),
            _ = self.closed.cancelled() => return Err(unit),
        };

        match permit {
            Ok(permit) => {
                permit.send(unit);
                Ok(())
            }
            Err(_) => Err(unit),
        }
    }

    /// Whether a [Self::put] would be taken right away.
    pub fn has_capacity(&self) -> bool {
        !self.closed.is_cancelled() && self.tx.capacity() > 0
    }

    /// Waits for the next unit. Once the stage is closed, units accepted
    /// before the close are still handed out, then [None] is returned.
    pub async fn take(&self) -> Option<W::Unit> {
        let mut rx = self.rx.lock().await;
        if !self.closed.is_cancelled() {
            tokio::select! {
                biased;
                unit = rx.recv() => return unit,
                _ = self.closed.cancelled() => {}
            }
        }

        // no new sends, outstanding permits still complete
        rx.close();
        rx.recv().await
    }

    /// Stops accepting units. The driver drains once it sees the close.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Cancels every unit currently being processed.
    pub fn interrupt_all(&self) {
        let active = self.active.lock();
        for token in active.values() {
            token.cancel();
        }
    }

    /// Admits units until the stage is closed or `cancel` fires, then waits
    /// for the units still running. On cancellation they are interrupted
    /// first, and units still queued are forwarded to the error sink.
    #[instrument(skip_all, fields(stage = self.worker.name()))]
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(width = self.width, "stage started");

        loop {
            let unit = tokio::select! {
                unit = self.take() => unit,
                _ = cancel.cancelled() => None,
            };
            let Some(unit) = unit else {
                break;
            };

            let stall_start = Instant::now();
            let claims_required = self.worker.claims_required(&unit);
            let claim = tokio::select! {
                claim = self.claims.acquire(claims_required) => claim.ok(),
                _ = cancel.cancelled() => None,
            };

            match claim {
                Some(claim) => self.start(unit, claim, stall_start.elapsed(), &cancel),
                None => {
                    self.reject(unit, stall_start.elapsed()).await;
                    break;
                }
            }
        }

        if cancel.is_cancelled() {
            self.interrupt_all();
        }

        self.close();
        while let Some(unit) = self.take().await {
            self.reject(unit, Duration::ZERO).await;
        }

        self.tracker.close();
        self.tracker.wait().await;
        info!("stage stopped");
    }

    /// Runs a unit on its own task, registered as active until it releases
    /// its claims.
    fn start(
        self: &Arc<Self>,
        unit: W::Unit,
        claim: Claim,
        stall: Duration,
        cancel: &CancellationToken,
    ) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = cancel.child_token();

        let usage = {
            let mut active = self.active.lock();
            active.insert(id, token.clone());
            self.metrics
                .slot_usage
                .store(active.len() as u64, Ordering::Relaxed);
            self.usage(active.len())
        };
        debug!(unit = %self.worker.describe(&unit), usage = %usage, "start");

        let stage = self.clone();
        self.tracker.spawn(async move {
            let mut unit = unit;
            let started = Instant::now();
            let result = AssertUnwindSafe(stage.worker.process(&mut unit, &token))
                .catch_unwind()
                .await;
            let error = match result {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(panic) => Some(format!("worker panicked: {}", panic_message(&*panic))),
            };
            stage
                .release(id, claim, unit, error, started.elapsed(), stall)
                .await;
        });
    }

    /// Unregisters a finished unit, gives back its claims and forwards it.
    async fn release(
        &self,
        id: u64,
        claim: Claim,
        unit: W::Unit,
        error: Option<String>,
        duration: Duration,
        stall: Duration,
    ) {
        let usage = {
            let mut active = self.active.lock();
            active.remove(&id);
            drop(claim);
            self.metrics
                .slot_usage
                .store(active.len() as u64, Ordering::Relaxed);
            self.usage(active.len())
        };

        let completion = Completion {
            stage: self.worker.name(),
            success: error.is_none(),
            usage,
            duration,
            stall,
            error,
        };
        self.metrics.record(&completion);

        let description = self.worker.describe(&unit);
        match &completion.error {
            None => {
                debug!(unit = %description, completion = %completion, "complete");
                self.output.put(unit, completion).await;
            }
            Some(err) => {
                warn!(unit = %description, completion = %completion, err = %err, "failed");
                self.error.put(unit, completion).await;
            }
        }
    }

    /// Forwards a unit that never started to the error sink.
    async fn reject(&self, unit: W::Unit, stall: Duration) {
        let completion = Completion {
            stage: self.worker.name(),
            success: false,
            usage: self.usage(self.slot_usage()),
            duration: Duration::ZERO,
            stall,
            error: Some("interrupted before start".to_string()),
        };
        self.metrics.record(&completion);
        self.error.put(unit, completion).await;
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests;
