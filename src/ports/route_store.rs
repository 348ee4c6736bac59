use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::core::table::RouteTree;

/// Errors from the configuration store.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StoreError {
    /// The store could not be reached or the request failed in transit.
    #[error("store transport error: {0}")]
    Transport(String),

    /// The store answered with something we could not interpret.
    #[error("store protocol error: {0}")]
    Protocol(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Port for the hierarchical store the routing tree lives in.
#[async_trait]
pub trait RouteStore: Send + Sync {
    /// Read the whole routing tree below the configured root.
    ///
    /// `Ok(None)` means the root key does not exist: an empty
    /// configuration, which is a successful fetch, not a failure.
    async fn fetch_tree(&self) -> StoreResult<Option<RouteTree>>;

    /// Start the change stream. Every change below the root pushes one
    /// token into the returned channel; the receiver is expected to
    /// debounce and re-fetch. The stream re-establishes itself on error
    /// for the lifetime of the process.
    fn watch(&self) -> mpsc::Receiver<()>;
}
