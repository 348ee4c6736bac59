//! Snapshot registry.
//!
//! Holds the routing table the protocol front-ends read from. Readers
//! load the current snapshot without locking; the reload pipeline
//! replaces it wholesale. An `Arc<Account>` obtained from [`Registry::get`]
//! stays self-consistent for as long as the caller holds it, regardless
//! of concurrent publishes.
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::core::{route::Account, table::Snapshot};

#[derive(Debug, Default)]
pub struct Registry {
    snapshot: ArcSwap<Snapshot>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(Snapshot::new()),
        }
    }

    /// Look up an account in the current snapshot. Unknown accounts are
    /// `None`, not an error.
    pub fn get(&self, account: &str) -> Option<Arc<Account>> {
        self.snapshot.load().get(account).cloned()
    }

    /// Atomically replace the current snapshot.
    pub fn publish(&self, snapshot: Snapshot) {
        let accounts = snapshot.len();
        self.snapshot.store(Arc::new(snapshot));
        tracing::debug!(accounts, "published routing snapshot");
    }

    /// Number of accounts in the current snapshot.
    pub fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.load().is_empty()
    }
}
