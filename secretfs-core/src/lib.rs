//! Core types shared by the secretfs daemon and its backend crates.
//!
//! This crate defines the three seams the rest of the workspace hangs off:
//!
//! - [`Secret`] / [`SecretBody`] — one live reference to a remote secret and
//!   the immutable snapshot it yields,
//! - the option family under [`options`] — everything a volume or a
//!   secret-provider request can configure, with parsing, validation and
//!   session fingerprints,
//! - [`SecretError`] — the error kinds every surface (FUSE, HTTP, startup)
//!   maps from.

pub mod error;
pub mod options;
pub mod secret;

pub use error::SecretError;
pub use secret::{LeaseInfo, Secret, SecretBody};

/// Application name. Used for the FUSE fsname, the custom-metadata directive
/// prefix and default paths.
pub const APP_NAME: &str = "secretfs";

/// Docker plugin identifier (socket name, default mount subdirectory).
pub const PLUGIN_ID: &str = "secretfs";
