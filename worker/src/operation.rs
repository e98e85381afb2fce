use std::{path::PathBuf, sync::Arc};

use farmhand_castore::DirectoriesIndex;

use crate::{
    action::{Action, Command},
    claims::Claim,
};

/// An operation handed to this worker by the scheduler.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub operation_name: String,
    pub action: Action,
    pub command: Command,
    /// Every directory reachable from the action's input root.
    pub index: Arc<DirectoriesIndex>,
}

/// The unit of work flowing through the worker pipeline.
#[derive(Debug)]
pub struct OperationContext {
    pub entry: QueueEntry,
    /// The execution slot this operation was matched with. Released when
    /// the context is dropped.
    pub claim: Option<Claim>,
    /// Set once the inputs are materialized.
    pub exec_dir: Option<PathBuf>,
}

impl OperationContext {
    pub fn new(entry: QueueEntry, claim: Claim) -> Self {
        Self {
            entry,
            claim: Some(claim),
            exec_dir: None,
        }
    }

    pub fn operation_name(&self) -> &str {
        &self.entry.operation_name
    }

    /// Gives back the entry and the claim it was matched with.
    pub fn into_parts(self) -> (QueueEntry, Option<Claim>) {
        (self.entry, self.claim)
    }
}
