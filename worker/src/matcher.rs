//! The protocol a work source uses to offer entries to a consumer.
//!
//! Every offer runs through one cycle: `on_wait_start`, optionally a wait for
//! an entry followed by `on_wait_end`, then `on_entry` with the entry (or
//! nothing) and the claim it would run under. An entry that is declined is
//! handed back together with its claim.
use std::{io, sync::Arc};

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tonic::async_trait;
use tracing::{debug, error, warn};

use crate::{
    claims::Claim,
    operation::{OperationContext, QueueEntry},
    pipeline::{PipelineStage, StageWorker},
};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("cancelled")]
pub struct Cancelled;

/// The answer to an offer.
#[derive(Debug)]
pub enum Offer<T> {
    /// The consumer took the entry and owns its claim from now on.
    Accepted,
    /// The consumer didn't take it. Both are handed back.
    Declined { entry: Option<T>, claim: Claim },
}

#[async_trait]
pub trait MatchListener<T: Send + 'static>: Send {
    /// Called before waiting for an entry. Returning false skips the wait,
    /// `on_entry` is called right away without an entry.
    fn on_wait_start(&mut self) -> bool;

    /// Called once waiting is over, whatever its outcome.
    fn on_wait_end(&mut self);

    /// Offers an entry. Must only fail when cancelled.
    async fn on_entry(&mut self, entry: Option<T>, claim: Claim) -> Result<Offer<T>, Cancelled>;

    /// The source failed for good. The listener is unusable afterwards.
    fn on_error(&mut self, err: &io::Error);
}

/// Where in the offer cycle a listener is.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum MatchState {
    #[default]
    AwaitingWait,
    Waiting,
    Matched,
    Errored,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("{event} is not allowed in state {state:?}")]
pub struct IllegalTransition {
    pub state: MatchState,
    pub event: &'static str,
}

impl MatchState {
    fn transition(
        &mut self,
        event: &'static str,
        allowed: &[MatchState],
        next: MatchState,
    ) -> Result<(), IllegalTransition> {
        if !allowed.contains(self) {
            return Err(IllegalTransition {
                state: *self,
                event,
            });
        }
        *self = next;
        Ok(())
    }

    pub fn wait_start(&mut self) -> Result<(), IllegalTransition> {
        self.transition(
            "wait start",
            &[MatchState::AwaitingWait],
            MatchState::Waiting,
        )
    }

    pub fn wait_end(&mut self) -> Result<(), IllegalTransition> {
        self.transition("wait end", &[MatchState::Waiting], MatchState::Matched)
    }

    /// An entry (or none) is offered. Also legal straight after a skipped
    /// wait.
    pub fn entry(&mut self) -> Result<(), IllegalTransition> {
        self.transition(
            "entry",
            &[MatchState::AwaitingWait, MatchState::Matched],
            MatchState::AwaitingWait,
        )
    }

    pub fn error(&mut self) -> Result<(), IllegalTransition> {
        self.transition(
            "error",
            &[
                MatchState::AwaitingWait,
                MatchState::Waiting,
                MatchState::Matched,
            ],
            MatchState::Errored,
        )
    }
}

/// A source of entries.
#[async_trait]
pub trait WorkSource<T>: Send + Sync {
    /// Waits for the next entry. [None] means there is nothing to offer.
    async fn take(&self, cancel: &CancellationToken) -> io::Result<Option<T>>;

    /// Puts back an entry that was declined.
    async fn requeue(&self, entry: T) -> io::Result<()>;
}

/// A [WorkSource] backed by a channel.
pub struct ChannelWorkSource<T> {
    tx: mpsc::Sender<T>,
    rx: Mutex<mpsc::Receiver<T>>,
}

impl<T: Send> ChannelWorkSource<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// A handle to enqueue entries with.
    pub fn sender(&self) -> mpsc::Sender<T> {
        self.tx.clone()
    }
}

#[async_trait]
impl<T: Send + 'static> WorkSource<T> for ChannelWorkSource<T> {
    async fn take(&self, cancel: &CancellationToken) -> io::Result<Option<T>> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            entry = rx.recv() => Ok(entry),
            _ = cancel.cancelled() => Ok(None),
        }
    }

    async fn requeue(&self, entry: T) -> io::Result<()> {
        self.tx
            .send(entry)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "work source closed"))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MatchError {
    /// The source failed, the listener was told through `on_error`.
    #[error("work source failed: {0}")]
    Source(#[source] io::Error),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

/// What became of one offer cycle.
#[derive(Debug)]
pub enum Matched {
    Accepted,
    /// The claim is handed back to the caller.
    Declined(Claim),
}

/// Runs one offer cycle of `source` against `listener` with `claim`.
pub async fn match_entry<T, S, L>(
    source: &S,
    listener: &mut L,
    claim: Claim,
    cancel: &CancellationToken,
) -> Result<Matched, MatchError>
where
    T: Send + 'static,
    S: WorkSource<T> + ?Sized,
    L: MatchListener<T> + ?Sized,
{
    let entry = if listener.on_wait_start() {
        let taken = source.take(cancel).await;
        listener.on_wait_end();
        match taken {
            Ok(entry) => entry,
            Err(e) => {
                listener.on_error(&e);
                return Err(MatchError::Source(e));
            }
        }
    } else {
        None
    };

    match listener.on_entry(entry, claim).await? {
        Offer::Accepted => Ok(Matched::Accepted),
        Offer::Declined { entry, claim } => {
            if let Some(entry) = entry {
                if let Err(e) = source.requeue(entry).await {
                    listener.on_error(&e);
                    return Err(MatchError::Source(e));
                }
            }
            Ok(Matched::Declined(claim))
        }
    }
}

/// Offers entries to a pipeline stage, which takes them as long as it
/// isn't closed.
pub struct StageMatchListener<W: StageWorker<Unit = OperationContext>> {
    stage: Arc<PipelineStage<W>>,
    state: MatchState,
    cancel: CancellationToken,
}

impl<W: StageWorker<Unit = OperationContext>> StageMatchListener<W> {
    pub fn new(stage: Arc<PipelineStage<W>>, cancel: CancellationToken) -> Self {
        Self {
            stage,
            state: MatchState::default(),
            cancel,
        }
    }

    pub fn state(&self) -> MatchState {
        self.state
    }

    fn advance(&mut self, result: Result<(), IllegalTransition>) {
        if let Err(e) = result {
            warn!(err = %e, "illegal match sequence");
        }
    }
}

#[async_trait]
impl<W: StageWorker<Unit = OperationContext>> MatchListener<QueueEntry> for StageMatchListener<W> {
    fn on_wait_start(&mut self) -> bool {
        if !self.stage.has_capacity() {
            debug!(stage = self.stage.name(), "stage has no capacity, skipping wait");
            return false;
        }

        let result = self.state.wait_start();
        self.advance(result);
        self.state == MatchState::Waiting
    }

    fn on_wait_end(&mut self) {
        let result = self.state.wait_end();
        self.advance(result);
    }

    async fn on_entry(
        &mut self,
        entry: Option<QueueEntry>,
        claim: Claim,
    ) -> Result<Offer<QueueEntry>, Cancelled> {
        let result = self.state.entry();
        self.advance(result);

        let Some(entry) = entry else {
            return Ok(Offer::Declined { entry: None, claim });
        };

        debug!(operation = %entry.operation_name, stage = self.stage.name(), "matched");
        match self
            .stage
            .put(OperationContext::new(entry, claim), &self.cancel)
            .await
        {
            Ok(()) => Ok(Offer::Accepted),
            Err(_) if self.cancel.is_cancelled() => Err(Cancelled),
            Err(context) => match context.into_parts() {
                (entry, Some(claim)) => Ok(Offer::Declined {
                    entry: Some(entry),
                    claim,
                }),
                // OperationContext::new always sets the claim
                (_, None) => Err(Cancelled),
            },
        }
    }

    fn on_error(&mut self, err: &io::Error) {
        let result = self.state.error();
        self.advance(result);
        error!(err = %err, stage = self.stage.name(), "work source failed");
    }
}
