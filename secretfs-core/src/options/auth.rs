//! Backend authentication options.
//!
//! Each method takes its credentials either inline or from a file; the file
//! variant wins when both are set (file contents can rotate without
//! re-creating the volume).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::{fingerprint_opt, parse_int, OptMap};
use crate::error::SecretError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    AppRole,
    Cert,
    Token,
    Userpass,
}

impl AuthMethod {
    /// Default auth engine mount path for this method.
    pub fn default_mount_path(self) -> &'static str {
        match self {
            Self::AppRole => "approle",
            Self::Cert => "cert",
            Self::Token => "token",
            Self::Userpass => "userpass",
        }
    }
}

impl std::str::FromStr for AuthMethod {
    type Err = SecretError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "approle" => Ok(Self::AppRole),
            "cert" => Ok(Self::Cert),
            "token" => Ok(Self::Token),
            "userpass" => Ok(Self::Userpass),
            other => Err(SecretError::config(
                "auth-method",
                format!("unknown auth method {other:?}"),
            )),
        }
    }
}

impl std::fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::AppRole => "approle",
            Self::Cert => "cert",
            Self::Token => "token",
            Self::Userpass => "userpass",
        })
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthOptions {
    pub method: AuthMethod,
    /// Auth engine mount path; falls back to the method default.
    pub mount_path: Option<String>,
    /// Renewal increment (seconds) requested by the auth token lease watcher.
    pub token_renew_ttl: i64,

    // AppRole
    pub role_id: Option<String>,
    pub role_id_file: Option<PathBuf>,
    pub secret_id: Option<String>,
    pub secret_id_file: Option<PathBuf>,
    pub secret_id_token_wrapped: bool,

    // Cert
    pub cert_file: Option<PathBuf>,
    pub cert_key_file: Option<PathBuf>,

    // Token
    pub token: Option<String>,
    pub token_file: Option<PathBuf>,

    // Userpass
    pub username: Option<String>,
    pub username_file: Option<PathBuf>,
    pub password: Option<String>,
    pub password_file: Option<PathBuf>,
}

impl Default for AuthOptions {
    fn default() -> Self {
        Self {
            method: AuthMethod::Token,
            mount_path: None,
            token_renew_ttl: 0,
            role_id: None,
            role_id_file: None,
            secret_id: None,
            secret_id_file: None,
            secret_id_token_wrapped: false,
            cert_file: None,
            cert_key_file: None,
            token: None,
            token_file: None,
            username: None,
            username_file: None,
            password: None,
            password_file: None,
        }
    }
}

impl AuthOptions {
    pub fn effective_mount_path(&self) -> &str {
        self.mount_path
            .as_deref()
            .unwrap_or_else(|| self.method.default_mount_path())
    }

    pub fn apply_volume_opts(&mut self, opts: &OptMap) -> Result<(), SecretError> {
        if let Some(v) = opts.get("auth-mount") {
            self.mount_path = Some(v.clone());
        }
        if let Some(v) = opts.get("auth-method") {
            self.method = v.parse()?;
        }
        if let Some(v) = parse_int(opts, "auth-token-renew-ttl")? {
            self.token_renew_ttl = v;
        }

        let string_fields: [(&str, &mut Option<String>); 5] = [
            ("auth-role-id", &mut self.role_id),
            ("auth-secret-id", &mut self.secret_id),
            ("auth-token", &mut self.token),
            ("auth-username", &mut self.username),
            ("auth-password", &mut self.password),
        ];
        for (key, field) in string_fields {
            if let Some(v) = opts.get(key) {
                *field = Some(v.clone());
            }
        }

        let file_fields: [(&str, &mut Option<PathBuf>); 7] = [
            ("auth-role-id-file", &mut self.role_id_file),
            ("auth-secret-id-file", &mut self.secret_id_file),
            ("auth-cert-file", &mut self.cert_file),
            ("auth-cert-key-file", &mut self.cert_key_file),
            ("auth-token-file", &mut self.token_file),
            ("auth-username-file", &mut self.username_file),
            ("auth-password-file", &mut self.password_file),
        ];
        for (key, field) in file_fields {
            if let Some(v) = opts.get(key) {
                *field = Some(PathBuf::from(v));
            }
        }

        if let Some(v) = opts.get("auth-secret-id-token-wrapped") {
            self.secret_id_token_wrapped = v == "true" || v == "1";
        }

        Ok(())
    }

    pub fn normalize(&mut self) {
        if self.mount_path.as_deref() == Some("") {
            self.mount_path = None;
        }
        for file in [
            &mut self.role_id_file,
            &mut self.secret_id_file,
            &mut self.cert_file,
            &mut self.cert_key_file,
            &mut self.token_file,
            &mut self.username_file,
            &mut self.password_file,
        ] {
            if file.as_ref().is_some_and(|p| p.as_os_str().is_empty()) {
                *file = None;
            }
        }
    }

    pub fn validate(&self) -> Result<(), SecretError> {
        match self.method {
            AuthMethod::AppRole => {
                if self.role_id.is_none() && self.role_id_file.is_none() {
                    return Err(SecretError::config(
                        "auth-role-id",
                        "approle auth method requires a role id",
                    ));
                }
                if self.secret_id.is_none() && self.secret_id_file.is_none() {
                    return Err(SecretError::config(
                        "auth-secret-id",
                        "approle auth method requires a secret id",
                    ));
                }
            }
            AuthMethod::Cert => {
                if self.cert_file.is_none() || self.cert_key_file.is_none() {
                    return Err(SecretError::config(
                        "auth-cert-file",
                        "cert auth method requires both cert and cert key files",
                    ));
                }
            }
            AuthMethod::Token => {
                if self.token.is_none() && self.token_file.is_none() {
                    return Err(SecretError::config(
                        "auth-token",
                        "token auth method requires a token",
                    ));
                }
            }
            AuthMethod::Userpass => {
                if self.username.is_none() && self.username_file.is_none() {
                    return Err(SecretError::config(
                        "auth-username",
                        "userpass auth method requires a username",
                    ));
                }
                if self.password.is_none() && self.password_file.is_none() {
                    return Err(SecretError::config(
                        "auth-password",
                        "userpass auth method requires a password",
                    ));
                }
            }
        }
        Ok(())
    }

    /// Credential locator fragment of the session fingerprint. File-based
    /// credentials contribute the path, not the contents.
    pub fn fingerprint_into(&self, out: &mut String) {
        out.push_str(self.effective_mount_path());
        out.push_str(&self.method.to_string());
        out.push_str(&self.token_renew_ttl.to_string());

        let path_str = |p: &Option<PathBuf>| p.as_deref().and_then(|p| p.to_str()).map(str::to_owned);

        match self.method {
            AuthMethod::AppRole => {
                fingerprint_opt(
                    out,
                    path_str(&self.role_id_file)
                        .or_else(|| self.role_id.clone())
                        .as_deref(),
                );
                fingerprint_opt(
                    out,
                    path_str(&self.secret_id_file)
                        .or_else(|| self.secret_id.clone())
                        .as_deref(),
                );
            }
            AuthMethod::Cert => {
                fingerprint_opt(out, path_str(&self.cert_file).as_deref());
                fingerprint_opt(out, path_str(&self.cert_key_file).as_deref());
            }
            AuthMethod::Token => {
                fingerprint_opt(
                    out,
                    path_str(&self.token_file)
                        .or_else(|| self.token.clone())
                        .as_deref(),
                );
            }
            AuthMethod::Userpass => {
                fingerprint_opt(
                    out,
                    path_str(&self.username_file)
                        .or_else(|| self.username.clone())
                        .as_deref(),
                );
                fingerprint_opt(
                    out,
                    path_str(&self.password_file)
                        .or_else(|| self.password.clone())
                        .as_deref(),
                );
            }
        }
    }
}

impl std::fmt::Debug for AuthOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthOptions")
            .field("method", &self.method)
            .field("mount_path", &self.mount_path)
            .field("token_renew_ttl", &self.token_renew_ttl)
            .field("role_id", &self.role_id.as_ref().map(|_| "[redacted]"))
            .field("role_id_file", &self.role_id_file)
            .field("secret_id", &self.secret_id.as_ref().map(|_| "[redacted]"))
            .field("secret_id_file", &self.secret_id_file)
            .field("secret_id_token_wrapped", &self.secret_id_token_wrapped)
            .field("cert_file", &self.cert_file)
            .field("cert_key_file", &self.cert_key_file)
            .field("token", &self.token.as_ref().map(|_| "[redacted]"))
            .field("token_file", &self.token_file)
            .field("username", &self.username)
            .field("username_file", &self.username_file)
            .field("password", &self.password.as_ref().map(|_| "[redacted]"))
            .field("password_file", &self.password_file)
            .finish()
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
    fn default_method_is_token() {
        assert_eq!(AuthOptions::default().method, AuthMethod::Token);
        assert_eq!(AuthOptions::default().effective_mount_path(), "token");
    }

    #[test]
    fn method_parses_case_insensitively() {
        assert_eq!("AppRole".parse::<AuthMethod>().unwrap(), AuthMethod::AppRole);
        assert_eq!("USERPASS".parse::<AuthMethod>().unwrap(), AuthMethod::Userpass);
        assert!("ldap".parse::<AuthMethod>().is_err());
    }

    #[test]
    fn approle_requires_role_and_secret_id() {
        let mut auth = AuthOptions::default();
        auth.apply_volume_opts(&opts(&[("auth-method", "approle")]))
            .unwrap();
        let err = auth.validate().unwrap_err();
        assert!(err.to_string().contains("auth-role-id"));

        auth.apply_volume_opts(&opts(&[("auth-role-id", "r")]))
            .unwrap();
        let err = auth.validate().unwrap_err();
        assert!(err.to_string().contains("auth-secret-id"));

        auth.apply_volume_opts(&opts(&[("auth-secret-id-file", "/run/secret-id")]))
            .unwrap();
        auth.validate().unwrap();
    }

    #[test]
    fn userpass_mount_override() {
        let mut auth = AuthOptions::default();
        auth.apply_volume_opts(&opts(&[
            ("auth-method", "userpass"),
            ("auth-mount", "ldap-users"),
            ("auth-username", "alice"),
            ("auth-password", "p"),
        ]))
        .unwrap();
        auth.validate().unwrap();
        assert_eq!(auth.effective_mount_path(), "ldap-users");
    }

    #[test]
    fn fingerprint_uses_file_locator_not_contents() {
        let mut inline = AuthOptions {
            token: Some("s.abc".to_string()),
            ..Default::default()
        };
        inline.normalize();
        let mut from_file = AuthOptions {
            token: Some("s.abc".to_string()),
            token_file: Some(PathBuf::from("/run/vault-token")),
            ..Default::default()
        };
        from_file.normalize();

        let mut a = String::new();
        let mut b = String::new();
        inline.fingerprint_into(&mut a);
        from_file.fingerprint_into(&mut b);
        assert_ne!(a, b);
        assert!(b.contains("/run/vault-token"));
        assert!(!b.contains("s.abc"));
    }

    #[test]
    fn debug_redacts_credentials() {
        let auth = AuthOptions {
            token: Some("s.supersecret".to_string()),
            password: Some("hunter2".to_string()),
            ..Default::default()
        };
        let debug = format!("{auth:?}");
        assert!(!debug.contains("s.supersecret"));
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("[redacted]"));
    }

    #[test]
    fn serde_round_trip() {
        let mut auth = AuthOptions::default();
        auth.apply_volume_opts(&opts(&[
            ("auth-method", "approle"),
            ("auth-role-id", "r"),
            ("auth-secret-id-file", "/run/sid"),
        ]))
        .unwrap();

        let json = serde_json::to_string(&auth).unwrap();
        let back: AuthOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(auth, back);
    }
}
