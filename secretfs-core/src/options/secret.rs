//! Per-secret options: which path to read and at which KV-v2 version.

use serde::{Deserialize, Serialize};

use super::{parse_int, OptMap};
use crate::error::SecretError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretOptions {
    /// Path of the secret below the engine mount.
    pub path: String,
    /// Renewal increment (seconds) requested by the secret lease watcher.
    pub token_renew_ttl: i64,
    /// KV-v2 secret version; `None` reads the latest.
    pub kv_version: Option<u64>,
}

impl SecretOptions {
    /// Overlay request options. The volume name doubles as the secret
    /// locator: `<secret-path>[@<version>]`, where an empty version suffix
    /// means latest. Explicit `secret` / `kv-secret-version` options win over
    /// the name encoding.
    pub fn apply_volume_opts(&mut self, volume_name: &str, opts: &OptMap) -> Result<(), SecretError> {
        if let Some(v) = parse_int(opts, "token-renew-ttl")? {
            self.token_renew_ttl = v;
        }

        let (name_path, name_version) = match volume_name.split_once('@') {
            Some((p, v)) => (p, Some(v)),
            None => (volume_name, None),
        };

        self.path = match opts.get("secret") {
            Some(v) => v.clone(),
            None => name_path.to_string(),
        };

        let version = match opts.get("kv-secret-version") {
            Some(v) => Some(v.as_str()),
            None => name_version.map(|v| if v.is_empty() { "latest" } else { v }),
        };
        if let Some(v) = version {
            self.kv_version = if v == "latest" {
                None
            } else {
                Some(v.parse::<u64>().map_err(|e| {
                    SecretError::config(
                        "kv-secret-version",
                        format!("cannot parse {v:?} as integer: {e}"),
                    )
                })?)
            };
        }

        Ok(())
    }

    pub fn normalize(&mut self) {
        self.path = self.path.trim_matches('/').to_string();
    }

    pub fn validate(&self) -> Result<(), SecretError> {
        if self.path.is_empty() {
            return Err(SecretError::config("secret", "path cannot be empty"));
        }
        Ok(())
    }
}
