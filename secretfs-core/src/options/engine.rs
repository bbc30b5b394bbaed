//! Secrets-engine options.

use serde::{Deserialize, Serialize};

use super::{parse_int, OptMap};
use crate::error::SecretError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Kv,
    Db,
    Pki,
}

impl EngineKind {
    pub fn default_mount_path(self) -> &'static str {
        match self {
            Self::Kv => "secret",
            Self::Db => "database",
            Self::Pki => "pki",
        }
    }
}

impl std::str::FromStr for EngineKind {
    type Err = SecretError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "kv" => Ok(Self::Kv),
            "db" => Ok(Self::Db),
            "pki" => Ok(Self::Pki),
            other => Err(SecretError::config(
                "engine-type",
                format!("unknown engine type {other:?}"),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    pub kind: EngineKind,
    /// Engine mount path; falls back to the kind default.
    pub mount_path: Option<String>,
    /// KV engine version (1 or 2). Ignored for non-KV engines.
    pub kv_version: u8,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            kind: EngineKind::Kv,
            mount_path: None,
            kv_version: 1,
        }
    }
}

impl EngineOptions {
    pub fn effective_mount_path(&self) -> &str {
        self.mount_path
            .as_deref()
            .unwrap_or_else(|| self.kind.default_mount_path())
    }

    pub fn apply_volume_opts(&mut self, opts: &OptMap) -> Result<(), SecretError> {
        if let Some(v) = opts.get("engine-type") {
            self.kind = v.parse()?;
        }
        if let Some(v) = opts.get("engine-mount") {
            self.mount_path = Some(v.clone());
        }
        if let Some(v) = parse_int(opts, "kv-engine-version")? {
            self.kv_version = v;
        }
        Ok(())
    }

    pub fn normalize(&mut self) {
        if self.mount_path.as_deref() == Some("") {
            self.mount_path = None;
        }
    }

    pub fn validate(&self) -> Result<(), SecretError> {
        if self.kind == EngineKind::Kv && self.kv_version != 1 && self.kv_version != 2 {
            return Err(SecretError::config(
                "kv-engine-version",
                format!("unknown KV version {}", self.kv_version),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(pairs: &[(&str, &str)]) -> OptMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_to_kv_v1_on_secret_mount() {
        let e = EngineOptions::default();
        assert_eq!(e.kind, EngineKind::Kv);
        assert_eq!(e.kv_version, 1);
        assert_eq!(e.effective_mount_path(), "secret");
        e.validate().unwrap();
    }

    #[test]
    fn kind_default_mounts() {
        assert_eq!(EngineKind::Db.default_mount_path(), "database");
        assert_eq!(EngineKind::Pki.default_mount_path(), "pki");
    }

    #[test]
    fn kv_version_validated() {
        let mut e = EngineOptions::default();
        e.apply_volume_opts(&opts(&[("kv-engine-version", "3")]))
            .unwrap();
        let err = e.validate().unwrap_err();
        assert!(err.to_string().contains("kv-engine-version"));

        e.apply_volume_opts(&opts(&[("kv-engine-version", "2")]))
            .unwrap();
        e.validate().unwrap();
    }

    #[test]
    fn unknown_engine_rejected() {
        let mut e = EngineOptions::default();
        let err = e
            .apply_volume_opts(&opts(&[("engine-type", "transit")]))
            .unwrap_err();
        assert!(err.to_string().contains("engine-type"));
    }
}
