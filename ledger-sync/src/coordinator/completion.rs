//! Completion notification of range requests.

use std::collections::HashMap;

use tokio::sync::{mpsc, watch};

use crate::primitives::Nonce;

/// Per-coordinator registry of completion waiters and subscribers.
///
/// Each nonce has at most one one-shot handle, removed as soon as it resolves. Subscribers
/// receive every completed nonce exactly once.
#[derive(Debug, Default)]
pub(crate) struct CompletionRegistry {
    waiters: HashMap<Nonce, watch::Sender<bool>>,
    subscribers: Vec<mpsc::UnboundedSender<Nonce>>,
}

impl CompletionRegistry {
    /// A receiver observing `true` once `nonce` completes.
    pub(crate) fn waiter(&mut self, nonce: Nonce) -> watch::Receiver<bool> {
        self.waiters
            .entry(nonce)
            .or_insert_with(|| watch::channel(false).0)
            .subscribe()
    }

    pub(crate) fn subscribe(&mut self) -> mpsc::UnboundedReceiver<Nonce> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers.push(sender);
        receiver
    }

    /// Resolves the waiters of `nonce` and publishes it. Closed subscribers are dropped.
    pub(crate) fn resolve(&mut self, nonce: Nonce) {
        if let Some(waiter) = self.waiters.remove(&nonce) {
            waiter.send_replace(true);
        }
        self.subscribers
            .retain(|subscriber| subscriber.send(nonce).is_ok());
    }

    /// Drops the waiters of a request that will never complete.
    pub(crate) fn abandon(&mut self, nonce: Nonce) {
        self.waiters.remove(&nonce);
    }

    pub(crate) fn pending_waiters(&self) -> usize {
        self.waiters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolution_reaches_waiters_and_subscribers() {
        let mut registry = CompletionRegistry::default();
        let mut waiter = registry.waiter(7);
        let mut subscriber = registry.subscribe();

        registry.resolve(7);

        assert!(waiter.wait_for(|done| *done).await.is_ok());
        assert_eq!(registry.pending_waiters(), 0);
        assert_eq!(subscriber.recv().await, Some(7));
        assert!(subscriber.try_recv().is_err());
    }

    #[tokio::test]
    async fn abandoned_waiters_observe_a_closed_channel() {
        let mut registry = CompletionRegistry::default();
        let mut waiter = registry.waiter(3);
        registry.abandon(3);
        assert!(waiter.wait_for(|done| *done).await.is_err());
    }

    #[test]
    fn closed_subscribers_are_dropped() {
        let mut registry = CompletionRegistry::default();
        drop(registry.subscribe());
        registry.resolve(1);
        assert!(registry.subscribers.is_empty());
    }
}
