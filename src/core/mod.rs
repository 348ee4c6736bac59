pub mod registry;
pub mod reload;
pub mod route;
pub mod table;

pub use registry::Registry;
pub use reload::Reloader;
pub use route::{Account, Container, Route, RouteList};
pub use table::{RouteTree, Snapshot, build_snapshot};
