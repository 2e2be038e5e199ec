//! Caller-driven cancellation for in-flight queries.
//!
//! A [`CancellationToken`] is created together with its [`CancellationHandle`]. Listeners derived
//! from the token are passed to the executor; calling [`CancellationHandle::cancel`] makes every
//! listener fire. Dropping the handle without cancelling leaves listeners pending forever, so a
//! query whose caller lost interest in cancelling still runs to completion.

use std::sync::Arc;

use tokio::sync::watch;

#[derive(Debug)]
pub struct CancellationToken {
    receiver: watch::Receiver<bool>,
}

/// Clonable view of a token, handed to query calls.
#[derive(Clone, Debug)]
pub struct CancellationListener {
    receiver: Arc<watch::Receiver<bool>>,
}

/// Triggers cancellation for the token it was created with.
#[derive(Debug)]
pub struct CancellationHandle {
    sender: watch::Sender<bool>,
}

impl CancellationToken {
    pub fn new() -> (Self, CancellationHandle) {
        let (tx, rx) = watch::channel(false);
        (Self { receiver: rx }, CancellationHandle { sender: tx })
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    pub fn listener(&self) -> CancellationListener {
        CancellationListener {
            receiver: Arc::new(self.receiver.clone()),
        }
    }
}

impl CancellationListener {
    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once cancellation is requested. Never resolves if the handle is dropped first.
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.as_ref().clone();
        let sender_dropped = receiver.wait_for(|cancelled| *cancelled).await.is_err();
        if sender_dropped {
            std::future::pending::<()>().await;
        }
    }
}

impl CancellationHandle {
    pub fn cancel(&self) {
        // no listeners left is fine
        let _ = self.sender.send(true);
    }

    /// True once the token and every listener are gone.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new().0
    }
}
