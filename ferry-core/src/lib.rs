//! Shared types for the ferry edge agent: configuration, file and transfer
//! records, and the identity/hash functions used for change detection.

pub mod config;
pub mod identity;
pub mod models;

pub use config::{AgentConfig, ConfigError, DestinationConfig, HostConfig, RetryConfig, SourceConfig};
