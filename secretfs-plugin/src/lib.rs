//! Docker plugin surface.
//!
//! Speaks the Docker plugin JSON-over-HTTP protocol on a Unix or TCP
//! listener and translates each endpoint into core operations:
//!
//! - the volume driver ([`driver`]) manages the registry of secret volumes
//!   and their reference-counted mounts,
//! - the secret provider ([`provider`]) answers one-shot Swarm secret
//!   fetches,
//! - [`server`] carries the listener variants and the dispatch table,
//! - [`plugin`] ties driver, provider and listener into one lifecycle with
//!   idempotent cleanup.

pub mod driver;
pub mod plugin;
pub mod provider;
pub mod server;
pub mod types;
pub mod volume;

pub use driver::{DriverConfig, VolumeDriver};
pub use plugin::{Plugin, PluginConfig};
pub use server::{Listener, ListenerConfig, TlsServerConfig};

// The daemon binary configures the filesystem through the plugin config;
// re-exported so it needs no direct fuse dependency.
pub use secretfs_fuse::FsConfig;
