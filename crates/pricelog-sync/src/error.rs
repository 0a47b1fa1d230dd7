use std::fmt;

use pricelog_feed::FeedParseError;
use pricelog_storage::{PersistenceError, TransportError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Acquire,
    Fetch,
    Stage,
    Register,
    Reconcile,
    Classify,
    Cleanup,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Acquire => "acquire",
            Phase::Fetch => "fetch",
            Phase::Stage => "stage",
            Phase::Register => "register",
            Phase::Reconcile => "reconcile",
            Phase::Classify => "classify",
            Phase::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("an import run is already in progress")]
    AlreadyRunning,
    #[error("feed transport failed: {0}")]
    Transport(#[from] TransportError),
    #[error("feed is not a usable price table: {0}")]
    FeedFormat(#[source] FeedParseError),
    #[error("persistence failed: {0}")]
    Persistence(#[from] PersistenceError),
    #[error("cancelled during {phase}")]
    Cancelled { phase: Phase },
    #[error("run deadline exceeded during {phase}")]
    DeadlineExceeded { phase: Phase },
    #[error("feed parser task failed: {0}")]
    Parser(String),
    #[error("writing run report: {0:#}")]
    Report(anyhow::Error),
}

/// Cancellation and deadline checks shared by every phase of one run.
#[derive(Debug, Clone)]
pub struct RunContext {
    cancel: watch::Receiver<bool>,
    deadline: Option<Instant>,
}

impl RunContext {
    pub fn new(cancel: watch::Receiver<bool>, deadline: Option<Instant>) -> Self {
        Self { cancel, deadline }
    }

    pub fn detached() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self::new(rx, None)
    }

    pub fn checkpoint(&self, phase: Phase) -> Result<(), ImportError> {
        if *self.cancel.borrow() {
            return Err(ImportError::Cancelled { phase });
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(ImportError::DeadlineExceeded { phase });
            }
        }
        Ok(())
    }
}
