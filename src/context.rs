//! # Cancellation and Deadlines
//!
//! A [`Context`] is a cheap clonable handle carrying an optional cancel token
//! and an optional deadline. Transactions check it when they begin, and again
//! at every operation that touches the underlying store and at every cursor
//! step. Pure in-memory work (planning, decoding an already-fetched record)
//! does not check it.
//!
//! The cancel token reports [`Error::Canceled`]; a passed deadline reports
//! [`Error::Timeout`]. The token is checked first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};

/// Wall-clock source used for `default now` timestamps. Supplied at open,
/// defaulting to [`Utc::now`]; tests inject a fixed clock.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Cancellation/deadline handle passed to transactions and queries.
#[derive(Clone, Default)]
pub struct Context {
    cancel: Option<Arc<AtomicBool>>,
    deadline: Option<Instant>,
}

/// Cancels the [`Context`] it was created with.
#[derive(Clone)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }
}

impl Context {
    /// A context that is never canceled and has no deadline.
    pub fn background() -> Context {
        Context::default()
    }

    /// A cancelable context and the handle that cancels it.
    pub fn with_cancel() -> (Context, CancelHandle) {
        let flag = Arc::new(AtomicBool::new(false));
        let ctx = Context {
            cancel: Some(flag.clone()),
            deadline: None,
        };
        (ctx, CancelHandle { flag })
    }

    /// A copy of this context that additionally expires after `timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Context {
        self.with_deadline(Instant::now() + timeout)
    }

    /// A copy of this context that additionally expires at `deadline`. An
    /// earlier existing deadline wins.
    pub fn with_deadline(&self, deadline: Instant) -> Context {
        let deadline = match self.deadline {
            Some(d) if d < deadline => d,
            _ => deadline,
        };
        Context {
            cancel: self.cancel.clone(),
            deadline: Some(deadline),
        }
    }

    /// Ok if the context is live, the cancellation or timeout error if not.
    pub fn err(&self) -> Result<()> {
        if let Some(flag) = &self.cancel {
            if flag.load(Ordering::Relaxed) {
                return Err(Error::Canceled);
            }
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("cancelable", &self.cancel.is_some())
            .field("deadline", &self.deadline)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn background_is_live() {
        assert!(Context::background().err().is_ok());
    }

    #[test]
    fn cancel_reports_canceled() {
        let (ctx, handle) = Context::with_cancel();
        assert!(ctx.err().is_ok());
        handle.cancel();
        assert!(matches!(ctx.err(), Err(Error::Canceled)));
    }

    #[test]
    fn deadline_reports_timeout() {
        let ctx = Context::background().with_timeout(Duration::ZERO);
        assert!(matches!(ctx.err(), Err(Error::Timeout)));
    }

    #[test]
    fn cancel_wins_over_deadline() {
        let (ctx, handle) = Context::with_cancel();
        let ctx = ctx.with_timeout(Duration::ZERO);
        handle.cancel();
        assert!(matches!(ctx.err(), Err(Error::Canceled)));
    }
}
