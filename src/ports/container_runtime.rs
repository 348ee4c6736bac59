use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::core::route::Container;

/// Errors from the container runtime API.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RuntimeError {
    #[error("runtime transport error: {0}")]
    Transport(String),

    #[error("runtime protocol error: {0}")]
    Protocol(String),

    /// The configured endpoint string could not be understood.
    #[error("invalid runtime endpoint: {0}")]
    Endpoint(String),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// One entry of the runtime's event stream.
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeEvent {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub time: i64,
}

/// Port for the container runtime inventory and its event stream.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// One-shot inventory: every alias the runtime knows a container by,
    /// mapped to that container.
    async fn containers(&self) -> RuntimeResult<HashMap<String, Container>>;

    /// Start the event stream. Each decoded runtime event is pushed into
    /// the returned channel; the stream reconnects on error for the
    /// lifetime of the process.
    fn watch(&self) -> mpsc::Receiver<RuntimeEvent>;
}
