//! Completion handle for a start attempt.

use std::fmt;
use std::future::{Future, IntoFuture};
use std::pin::Pin;

use tokio::sync::watch;

use crate::error::{ClientError, ClientResult};

type Outcome = Option<ClientResult<()>>;

/// Resolves when a start attempt has finished.
///
/// Every call to `start` made while that attempt is in flight (or connected)
/// returns a clone of the same handle. Awaiting it yields the attempt's
/// outcome; the handle can be awaited any number of times.
#[derive(Clone)]
pub struct StartHandle {
    attempt: u64,
    rx: watch::Receiver<Outcome>,
}

impl StartHandle {
    pub(crate) fn pending(attempt: u64) -> (Self, watch::Sender<Outcome>) {
        let (tx, rx) = watch::channel(None);
        (Self { attempt, rx }, tx)
    }

    pub(crate) fn ready(result: ClientResult<()>) -> Self {
        let (_, rx) = watch::channel(Some(result));
        Self { attempt: 0, rx }
    }

    /// The start attempt this handle belongs to.
    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub fn is_finished(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Wait for the attempt to finish.
    pub async fn wait(&self) -> ClientResult<()> {
        let mut rx = self.rx.clone();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or(Err(ClientError::Cancelled))
    }
}

impl PartialEq for StartHandle {
    fn eq(&self, other: &Self) -> bool {
        self.attempt == other.attempt && self.rx.same_channel(&other.rx)
    }
}

impl fmt::Debug for StartHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartHandle")
            .field("attempt", &self.attempt)
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl IntoFuture for StartHandle {
    type Output = ClientResult<()>;
    type IntoFuture = Pin<Box<dyn Future<Output = ClientResult<()>> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.wait().await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_for_every_clone() {
        let (handle, tx) = StartHandle::pending(3);
        let other = handle.clone();
        assert_eq!(handle, other);
        assert!(!handle.is_finished());

        tx.send_replace(Some(Ok(())));
        assert_eq!(handle.wait().await, Ok(()));
        assert_eq!(other.await, Ok(()));
    }

    #[tokio::test]
    async fn dropped_sender_means_cancelled() {
        let (handle, tx) = StartHandle::pending(1);
        drop(tx);
        assert_eq!(handle.wait().await, Err(ClientError::Cancelled));
    }

    #[tokio::test]
    async fn ready_handles_are_distinct() {
        let a = StartHandle::ready(Ok(()));
        let b = StartHandle::ready(Ok(()));
        assert_ne!(a, b);
        assert!(a.is_finished());
    }
}
