//! Host-facing service layer: configuration and the generic lifecycle
//! registry the [`crate::membership::Monitor`] is registered into.

pub mod config;
pub mod registry;

pub use config::ServerConfig;
pub use registry::{ManagedService, ServiceContext, ServiceRegistry};
