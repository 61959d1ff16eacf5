use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use hourglass_rs::SafeTimeProvider;

use crate::errors::{EngineError, Result};

/// per-call cancellation and deadline
///
/// The engine checks the context between steps of a unit of work and
/// before commit. A tripped check aborts the transaction.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    deadline: Option<DateTime<Utc>>,
    cancelled: Arc<AtomicBool>,
}

impl CallContext {
    /// no deadline, never cancelled unless a handle fires
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    pub fn with_timeout(self, time_provider: &SafeTimeProvider, timeout: Duration) -> Self {
        self.with_deadline(time_provider.now() + timeout)
    }

    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.deadline
    }

    /// handle another thread can use to cancel this call
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            cancelled: self.cancelled.clone(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn checkpoint(&self, step: &'static str, time_provider: &SafeTimeProvider) -> Result<()> {
        if self.is_cancelled() {
            return Err(EngineError::Cancelled { step });
        }
        if let Some(deadline) = self.deadline {
            if time_provider.now() >= deadline {
                return Err(EngineError::DeadlineExceeded { step });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}
