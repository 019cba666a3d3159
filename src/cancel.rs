//! Cancellation for blocking connection attempts.
//!
//! A [`CancelHandle`] and a [`Cancellation`] are created together by [`channel`].
//! The cancellation is attached to a stream builder; the handle may be moved to any
//! other thread and fired to abandon a connect-retry loop that is still waiting for
//! its peer. Dropping the handle without firing it never cancels anything.

use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::Arc;
use std::task::Context;

use crate::BoxFuture;

/// Fires a cancellation signal.
#[derive(Debug, Clone)]
pub struct CancelHandle(Arc<tokio::sync::watch::Sender<bool>>);

impl CancelHandle {
    /// Signal every paired [`Cancellation`]. Firing more than once is a no-op.
    pub fn cancel(&self) {
        self.0.send_replace(true);
        tracing::trace!("sending cancel signal");
    }
}

/// Receives a cancellation signal.
#[derive(Debug, Clone)]
pub struct Cancellation(tokio::sync::watch::Receiver<bool>);

impl Cancellation {
    /// Whether the paired handle has already fired.
    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }
}

impl IntoFuture for Cancellation {
    type IntoFuture = Cancelled;
    type Output = ();

    fn into_future(mut self) -> Self::IntoFuture {
        Cancelled(Box::pin(async move {
            let closed = self.0.wait_for(|cancelled| *cancelled).await.is_err();
            if closed {
                // Every handle is gone without firing; nothing can cancel us now.
                std::future::pending::<()>().await;
            }
        }))
    }
}

/// Future which resolves once the paired [`CancelHandle`] fires.
pub struct Cancelled(BoxFuture<'static, ()>);

impl std::fmt::Debug for Cancelled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Cancelled").finish()
    }
}

impl Future for Cancelled {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> std::task::Poll<Self::Output> {
        self.0.as_mut().poll(cx)
    }
}

/// Create a paired cancel handle and cancellation signal.
pub fn channel() -> (CancelHandle, Cancellation) {
    let (tx, rx) = tokio::sync::watch::channel(false);
    (CancelHandle(Arc::new(tx)), Cancellation(rx))
}
