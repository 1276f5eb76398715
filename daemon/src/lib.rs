pub mod agent;
pub mod control_plane;
pub mod db;
pub mod engine;
pub mod methods;
pub mod scanner;
pub mod store;
pub mod watcher;

#[cfg(test)]
mod testing;

pub use agent::{Agent, AgentError, AgentHandle};
pub use control_plane::{ControlPlane, RemoteError, StandaloneControlPlane};
pub use db::DbHandle;
pub use store::{ChangeEvent, ChangeSubscription, LocalStore, StoreError};
