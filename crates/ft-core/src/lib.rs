//! ft-core: Tunnel registry and cloudflared integration for flaretun
//!
//! This crate owns the persisted tunnel registry (schema, migration and
//! storage), the gateway to the `cloudflared` binary, and the reconciliation
//! between the two. The CLI is a thin layer over the workflows exported here.

pub mod config;
pub mod daemon_config;
pub mod error;
pub mod gateway;
pub mod guard;
pub mod health;
pub mod logging;
pub mod migrate;
pub mod process;
pub mod reconcile;
pub mod registry;
pub mod store;
pub mod workflow;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{FtError, Result};
pub use gateway::{Cloudflared, TunnelGateway};
pub use process::{ProcessLister, SystemProcessLister};
pub use reconcile::{Reconciler, TunnelStatus};
pub use registry::{Protocol, Registry, Service, Tunnel};
pub use store::ConfigStore;
