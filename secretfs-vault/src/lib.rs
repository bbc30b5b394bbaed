//! HashiCorp Vault backend.
//!
//! Three layers, bottom up:
//!
//! - [`api`]: the raw HTTP surface (login per auth method, KV v1/v2 reads,
//!   lease and token renewal) over reqwest,
//! - [`client`]: the process-wide pool of authenticated sessions, deduplicated
//!   by option fingerprint and reference-counted, with deferred login and
//!   defensive logout,
//! - [`secret`]: the [`secretfs_core::Secret`] implementation — a TTL-cached
//!   handle over one secret path, with a lease watcher keeping renewable
//!   secrets alive.

pub mod api;
pub mod client;
pub mod secret;
pub mod watcher;

pub use client::VaultClient;
pub use secret::VaultSecret;
