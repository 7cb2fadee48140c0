//! Cooperative cancellation.
//!
//! A token is a shared flag plus a wakeup: synchronous code polls
//! [`CancellationToken::is_cancelled`] at its safe points, while async code
//! can `select!` on [`CancellationToken::cancelled`] to stop waiting on an
//! in-flight provider call the moment the job is cancelled.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Clone, Default)]
pub struct CancellationToken {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    flag: AtomicBool,
    wakeup: Notify,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation and wake every pending [`cancelled`] wait.
    /// Idempotent.
    ///
    /// [`cancelled`]: CancellationToken::cancelled
    pub fn cancel(&self) {
        if !self.shared.flag.swap(true, Ordering::SeqCst) {
            self.shared.wakeup.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.flag.load(Ordering::SeqCst)
    }

    /// Resolve once cancellation has been requested; immediately if it
    /// already was. Registering the waiter before re-reading the flag
    /// closes the window where a concurrent `cancel` would be missed.
    pub async fn cancelled(&self) {
        loop {
            let armed = self.shared.wakeup.notified();
            if self.is_cancelled() {
                return;
            }
            armed.await;
        }
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
