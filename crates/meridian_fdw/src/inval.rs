//! Catalog invalidation delivery.
//!
//! Catalog changes are published cluster-wide on an [`InvalidationBus`];
//! every session owns an [`InvalidationInbox`] and drains it at its own
//! safe points, so a session never sees an invalidation in the middle of a
//! remote command.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CatalogCache {
    ForeignServer,
    UserMapping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogInvalidation {
    pub cache: CatalogCache,
    /// Hash of the changed row; 0 means every row of `cache`.
    pub hash: u32,
}

impl CatalogInvalidation {
    pub fn reset(cache: CatalogCache) -> Self {
        Self { cache, hash: 0 }
    }

    pub fn is_reset(&self) -> bool {
        self.hash == 0
    }
}

/// Receives catalog invalidations synchronously.
pub trait CatalogObserver {
    fn on_invalidation(&mut self, inval: CatalogInvalidation);
}

#[derive(Default)]
pub struct InvalidationInbox {
    pending: Mutex<Vec<CatalogInvalidation>>,
}

impl InvalidationInbox {
    fn push(&self, inval: CatalogInvalidation) {
        self.pending.lock().push(inval);
    }

    pub fn drain(&self) -> Vec<CatalogInvalidation> {
        std::mem::take(&mut *self.pending.lock())
    }

    /// Deliver everything queued so far to `observer`, in arrival order.
    pub fn deliver(&self, observer: &mut dyn CatalogObserver) {
        for inval in self.drain() {
            observer.on_invalidation(inval);
        }
    }
}

#[derive(Default)]
pub struct InvalidationBus {
    subscribers: Mutex<Vec<Weak<InvalidationInbox>>>,
}

impl InvalidationBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Arc<InvalidationInbox> {
        let inbox = Arc::new(InvalidationInbox::default());
        self.subscribers.lock().push(Arc::downgrade(&inbox));
        inbox
    }

    /// Queue `inval` for every live subscriber; dropped inboxes are pruned.
    pub fn publish(&self, inval: CatalogInvalidation) {
        let mut subs = self.subscribers.lock();
        subs.retain(|weak| match weak.upgrade() {
            Some(inbox) => {
                inbox.push(inval);
                true
            }
            None => false,
        });
        tracing::trace!(cache = ?inval.cache, hash = inval.hash, subscribers = subs.len(), "published catalog invalidation");
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}
