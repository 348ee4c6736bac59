pub mod container_runtime;
pub mod route_store;

pub use container_runtime::{ContainerRuntime, RuntimeError, RuntimeEvent, RuntimeResult};
pub use route_store::{RouteStore, StoreError, StoreResult};
