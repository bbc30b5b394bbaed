//! The option family.
//!
//! Options arrive from two places: daemon flags establish a default set, and
//! each `VolumeDriver.Create` / `SecretProvider.GetSecret` request overlays
//! string options on top of a copy of those defaults. Every struct follows
//! the same protocol: `apply_volume_opts` overlays request strings,
//! `normalize` canonicalises, `validate` rejects incomplete combinations with
//! the exact offending field, and the fingerprint methods feed the session
//! dedup key.

mod auth;
mod engine;
mod http;
mod mount;
mod secret;
mod tls;
mod volume;

pub use auth::{AuthMethod, AuthOptions};
pub use engine::{EngineKind, EngineOptions};
pub use http::HttpOptions;
pub use mount::MountOptions;
pub use secret::SecretOptions;
pub use tls::TlsOptions;
pub use volume::VolumeOptions;

use std::collections::HashMap;

use crate::error::SecretError;

/// String options as decoded from a request body.
pub type OptMap = HashMap<String, String>;

/// Parse a decimal integer option, reporting the field on failure.
fn parse_int<T>(opts: &OptMap, key: &'static str) -> Result<Option<T>, SecretError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match opts.get(key) {
        None => Ok(None),
        Some(v) => v
            .parse::<T>()
            .map(Some)
            .map_err(|e| SecretError::config(key, format!("cannot parse {v:?} as integer: {e}"))),
    }
}

/// Parse an octal file-mode option (`"550"` means `0o550`).
fn parse_mode(opts: &OptMap, key: &'static str) -> Result<Option<u32>, SecretError> {
    match opts.get(key) {
        None => Ok(None),
        Some(v) => u32::from_str_radix(v, 8)
            .map(Some)
            .map_err(|e| SecretError::config(key, format!("cannot parse {v:?} as octal mode: {e}"))),
    }
}

/// Fingerprint fragment for an optional string: the value, or a marker so
/// `None` and `Some("")` cannot collide with adjacent fields.
fn fingerprint_opt(out: &mut String, v: Option<&str>) {
    match v {
        Some(s) => {
            out.push('=');
            out.push_str(s);
        }
        None => out.push('-'),
    }
    out.push(';');
}
