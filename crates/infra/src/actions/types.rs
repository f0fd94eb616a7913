//! Retryable units of work.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Failure of one attempt of an action.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ActionError {
    /// The attempt failed and may succeed if retried.
    #[error("{0}")]
    Failed(String),
}

impl ActionError {
    pub fn failed(msg: impl fmt::Display) -> Self {
        Self::Failed(msg.to_string())
    }
}

impl From<crate::event_store::EventStoreError> for ActionError {
    fn from(err: crate::event_store::EventStoreError) -> Self {
        Self::failed(err)
    }
}

impl From<crate::ledger::LedgerError> for ActionError {
    fn from(err: crate::ledger::LedgerError) -> Self {
        Self::failed(err)
    }
}

impl From<anyhow::Error> for ActionError {
    fn from(err: anyhow::Error) -> Self {
        Self::Failed(format!("{err:#}"))
    }
}

/// Unit of work: called once per attempt.
pub type ActionFn = Box<dyn FnMut() -> Result<(), ActionError> + Send>;

/// A named, retryable unit of work with an optional continuation.
///
/// The continuation runs only after this action succeeds, through the same
/// executor, so it gets the same inline-then-background retry treatment.
pub struct ActionInfo {
    pub(crate) name: String,
    pub(crate) action: ActionFn,
    pub(crate) max_retry_count: Option<u32>,
    pub(crate) next: Option<Box<ActionInfo>>,
}

impl ActionInfo {
    pub fn new<F>(name: impl Into<String>, action: F) -> Self
    where
        F: FnMut() -> Result<(), ActionError> + Send + 'static,
    {
        Self {
            name: name.into(),
            action: Box::new(action),
            max_retry_count: None,
            next: None,
        }
    }

    /// Override the executor's inline attempt budget for this action only.
    pub fn with_max_retry_count(mut self, count: u32) -> Self {
        self.max_retry_count = Some(count);
        self
    }

    /// Append `next` at the end of this action's continuation chain.
    pub fn then(mut self, next: ActionInfo) -> Self {
        fn push_last(slot: &mut Option<Box<ActionInfo>>, next: ActionInfo) {
            match slot {
                Some(existing) => push_last(&mut existing.next, next),
                None => *slot = Some(Box::new(next)),
            }
        }

        push_last(&mut self.next, next);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn attempt(&mut self) -> Result<(), ActionError> {
        (self.action)()
    }
}

impl fmt::Debug for ActionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionInfo")
            .field("name", &self.name)
            .field("max_retry_count", &self.max_retry_count)
            .field("next", &self.next)
            .finish_non_exhaustive()
    }
}

/// What happened to an action handed to the executor.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    /// Succeeded within the inline budget (the continuation was dispatched).
    Succeeded,
    /// Inline budget exhausted; the action now lives on the background queue.
    Queued,
}

/// Executor runtime statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ActionStats {
    /// Every invocation of a unit of work, inline or background.
    pub attempts: u64,
    pub succeeded: u64,
    /// Actions handed to the background queue.
    pub queued: u64,
    pub background_attempts: u64,
    /// Actions currently waiting on the background queue.
    pub pending: u64,
}
