//! The fully resolved option set for one volume (or one transient
//! secret-provider request).

use serde::{Deserialize, Serialize};

use super::{AuthOptions, EngineOptions, HttpOptions, MountOptions, OptMap, SecretOptions};
use crate::error::SecretError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeOptions {
    pub mount: MountOptions,
    pub http: HttpOptions,
    pub auth: AuthOptions,
    pub engine: EngineOptions,
    pub secret: SecretOptions,
}

impl VolumeOptions {
    /// Resolve options for a `VolumeDriver.Create` request: overlay the
    /// request's `Opts` on a copy of the daemon defaults, then normalize and
    /// validate.
    pub fn from_volume_opts(
        volume_name: &str,
        opts: &OptMap,
        defaults: &VolumeOptions,
    ) -> Result<Self, SecretError> {
        let mut resolved = defaults.clone();
        resolved.mount.apply_volume_opts(opts)?;
        resolved.auth.apply_volume_opts(opts)?;
        resolved.engine.apply_volume_opts(opts)?;
        resolved.secret.apply_volume_opts(volume_name, opts)?;
        resolved.normalize();
        resolved.validate()?;
        Ok(resolved)
    }

    /// Resolve options for a `SecretProvider.GetSecret` request. Secret
    /// labels use the same keys as volume `Opts`; the secret path defaults to
    /// the requested secret name.
    pub fn from_secret_labels(
        secret_name: &str,
        labels: &OptMap,
        defaults: &VolumeOptions,
    ) -> Result<Self, SecretError> {
        Self::from_volume_opts(secret_name, labels, defaults)
    }

    pub fn normalize(&mut self) {
        self.http.normalize();
        self.auth.normalize();
        self.engine.normalize();
        self.secret.normalize();
    }

    pub fn validate(&self) -> Result<(), SecretError> {
        self.http.validate()?;
        self.auth.validate()?;
        self.engine.validate()?;
        self.secret.validate()?;
        Ok(())
    }

    /// The session fingerprint: the subset of options affecting authenticated
    /// connectivity. Two volumes with equal fingerprints share one backend
    /// session.
    pub fn session_fingerprint(&self) -> String {
        let mut out = String::new();
        self.http.fingerprint_into(&mut out);
        self.auth.fingerprint_into(&mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::AuthMethod;

    fn defaults() -> VolumeOptions {
        let mut d = VolumeOptions::default();
        d.http.address = "http://127.0.0.1:8200".to_string();
        d.auth.token = Some("s.root".to_string());
        d
    }

    fn opts(pairs: &[(&str, &str)]) -> OptMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn resolves_with_defaults() {
        let v = VolumeOptions::from_volume_opts("db@2", &OptMap::new(), &defaults()).unwrap();
        assert_eq!(v.secret.path, "db");
        assert_eq!(v.secret.kv_version, Some(2));
        assert_eq!(v.auth.method, AuthMethod::Token);
        assert_eq!(v.http.address, "http://127.0.0.1:8200");
    }

    #[test]
    fn request_opts_override_defaults() {
        let v = VolumeOptions::from_volume_opts(
            "db",
            &opts(&[
                ("engine-type", "kv"),
                ("kv-engine-version", "2"),
                ("mount-uid", "1000"),
            ]),
            &defaults(),
        )
        .unwrap();
        assert_eq!(v.engine.kv_version, 2);
        assert_eq!(v.mount.uid, 1000);
    }

    #[test]
    fn validation_failure_propagates_field() {
        let err = VolumeOptions::from_volume_opts(
            "db",
            &opts(&[("auth-method", "approle")]),
            &defaults(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("auth-role-id"));
    }

    #[test]
    fn equal_connectivity_options_share_fingerprint() {
        let a = VolumeOptions::from_volume_opts("db@1", &OptMap::new(), &defaults()).unwrap();
        let b = VolumeOptions::from_volume_opts(
            "other-secret",
            &opts(&[("mount-uid", "1000")]),
            &defaults(),
        )
        .unwrap();
        assert_eq!(a.session_fingerprint(), b.session_fingerprint());
    }

    #[test]
    fn different_auth_changes_fingerprint() {
        let a = VolumeOptions::from_volume_opts("db", &OptMap::new(), &defaults()).unwrap();
        let b = VolumeOptions::from_volume_opts(
            "db",
            &opts(&[("auth-token", "s.other")]),
            &defaults(),
        )
        .unwrap();
        assert_ne!(a.session_fingerprint(), b.session_fingerprint());
    }

    #[test]
    fn serde_round_trip_preserves_options() {
        let v = VolumeOptions::from_volume_opts(
            "db@2",
            &opts(&[("kv-engine-version", "2"), ("field-mount-mode", "400")]),
            &defaults(),
        )
        .unwrap();
        let json = serde_json::to_string(&v).unwrap();
        let back: VolumeOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(v, back);
    }

    #[test]
    fn unknown_json_fields_ignored() {
        let v: VolumeOptions = serde_json::from_str(
            r#"{"mount":{"uid":5,"unknown_field":true},"future_section":{}}"#,
        )
        .unwrap();
        assert_eq!(v.mount.uid, 5);
    }
}
