//! Raw Vault HTTP API client.
//!
//! A thin typed wrapper over reqwest for the handful of endpoints the daemon
//! uses. Auth state lives a layer up in [`crate::client`]; every call here
//! takes the token explicitly.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use secretfs_core::options::HttpOptions;
use secretfs_core::{LeaseInfo, SecretError};

const VAULT_TOKEN_HEADER: &str = "X-Vault-Token";

/// One secret as read from a KV engine, version metadata included for v2.
#[derive(Debug, Clone)]
pub struct KvSecret {
    /// Key/value pairs, non-string JSON values stringified.
    pub data: HashMap<String, String>,
    pub version_metadata: Option<VersionMetadata>,
    pub custom_metadata: Option<HashMap<String, String>>,
    pub lease: Option<LeaseInfo>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct VersionMetadata {
    pub created_time: DateTime<Utc>,
    pub deletion_time: Option<DateTime<Utc>>,
    pub destroyed: bool,
    pub version: u64,
}

/// Auth lease returned by a login endpoint.
#[derive(Debug, Clone)]
pub struct AuthLease {
    pub client_token: String,
    pub renewable: bool,
    pub lease_duration: u64,
}

/// Outcome of one successful renewal, reported to `on_renewed` callbacks.
#[derive(Debug, Clone)]
pub struct RenewalInfo {
    pub lease_duration: u64,
    pub renewable: bool,
}

/// HTTP-level client bound to one server address and TLS configuration.
///
/// Cheap to clone (reqwest clients share their connection pool).
#[derive(Clone)]
pub struct RawClient {
    http: reqwest::Client,
    base: String,
}

impl RawClient {
    /// Build a client from the session's HTTP options. `identity` supplies a
    /// client certificate/key pair for the TLS handshake (cert auth method).
    pub fn build(
        options: &HttpOptions,
        identity: Option<(&Path, &Path)>,
    ) -> Result<Self, SecretError> {
        let mut builder = reqwest::Client::builder()
            .user_agent(format!("secretfs/{}", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(10));

        if options.disable_redirects {
            builder = builder.redirect(reqwest::redirect::Policy::none());
        }
        if options.tls.insecure {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(ca) = &options.tls.ca_cert_file {
            let pem = std::fs::read(ca).map_err(|e| {
                SecretError::config("vault-tls-ca-cert-file", format!("read {}: {e}", ca.display()))
            })?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| SecretError::config("vault-tls-ca-cert-file", e.to_string()))?;
            builder = builder.add_root_certificate(cert);
        }

        let identity = identity.or_else(|| {
            options
                .tls
                .cert_file
                .as_deref()
                .zip(options.tls.key_file.as_deref())
        });
        if let Some((cert_file, key_file)) = identity {
            // reqwest's rustls backend wants key and chain in one PEM bundle.
            let mut pem = std::fs::read(key_file).map_err(|e| {
                SecretError::config("auth-cert-key-file", format!("read {}: {e}", key_file.display()))
            })?;
            let cert = std::fs::read(cert_file).map_err(|e| {
                SecretError::config("auth-cert-file", format!("read {}: {e}", cert_file.display()))
            })?;
            pem.extend_from_slice(&cert);
            let id = reqwest::Identity::from_pem(&pem)
                .map_err(|e| SecretError::config("auth-cert-file", e.to_string()))?;
            builder = builder.identity(id);
        }

        let http = builder
            .build()
            .map_err(|e| SecretError::Transport(e.to_string()))?;

        Ok(Self {
            http,
            base: options.address.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.base, path)
    }

    /// POST to an auth backend's login endpoint.
    ///
    /// `suffix` extends the login path for methods that encode the principal
    /// in the URL (userpass).
    pub async fn login(
        &self,
        auth_mount: &str,
        suffix: Option<&str>,
        body: &serde_json::Value,
    ) -> Result<AuthLease, SecretError> {
        let mut path = format!("auth/{auth_mount}/login");
        if let Some(s) = suffix {
            path.push('/');
            path.push_str(s);
        }
        debug!(path, "vault login");

        let resp = self.http.post(self.url(&path)).json(body).send().await;
        let api: ApiResponse = decode(resp).await?;

        let auth = api
            .auth
            .ok_or_else(|| SecretError::Internal("login did not return a token".to_string()))?;
        Ok(AuthLease {
            client_token: auth.client_token,
            renewable: auth.renewable,
            lease_duration: auth.lease_duration,
        })
    }

    /// Unwrap a response-wrapped secret (wrapped AppRole secret ids).
    pub async fn unwrap(&self, wrapping_token: &str) -> Result<serde_json::Value, SecretError> {
        let resp = self
            .http
            .post(self.url("sys/wrapping/unwrap"))
            .header(VAULT_TOKEN_HEADER, wrapping_token)
            .send()
            .await;
        let api: ApiResponse = decode(resp).await?;
        api.data
            .ok_or_else(|| SecretError::Internal("unwrap returned no data".to_string()))
    }

    pub async fn read_kv_v1(
        &self,
        token: &str,
        engine_mount: &str,
        secret_path: &str,
    ) -> Result<KvSecret, SecretError> {
        debug!(engine_mount, secret_path, "vault kv1 read");

        let resp = self
            .http
            .get(self.url(&format!("{engine_mount}/{secret_path}")))
            .header(VAULT_TOKEN_HEADER, token)
            .send()
            .await;
        let api: ApiResponse = decode(resp).await?;
        let lease = api.lease();

        let data = match api.data {
            Some(serde_json::Value::Object(map)) => stringify_values(map),
            _ => HashMap::new(),
        };

        Ok(KvSecret {
            data,
            version_metadata: None,
            custom_metadata: None,
            lease,
            warnings: api.warnings.unwrap_or_default(),
        })
    }

    pub async fn read_kv_v2(
        &self,
        token: &str,
        engine_mount: &str,
        secret_path: &str,
        version: Option<u64>,
    ) -> Result<KvSecret, SecretError> {
        debug!(engine_mount, secret_path, ?version, "vault kv2 read");

        let mut req = self
            .http
            .get(self.url(&format!("{engine_mount}/data/{secret_path}")))
            .header(VAULT_TOKEN_HEADER, token);
        if let Some(v) = version {
            req = req.query(&[("version", v)]);
        }

        let api: ApiResponse = decode(req.send().await).await?;
        let lease = api.lease();

        let envelope: KvV2Envelope = match api.data {
            Some(v) => serde_json::from_value(v)
                .map_err(|e| SecretError::Internal(format!("decode kv2 response: {e}")))?,
            None => return Err(SecretError::NotFound),
        };

        Ok(KvSecret {
            data: envelope.data.map(stringify_values).unwrap_or_default(),
            custom_metadata: envelope
                .metadata
                .as_ref()
                .and_then(|m| m.custom_metadata.clone()),
            version_metadata: envelope.metadata.map(|m| VersionMetadata {
                created_time: m.created_time,
                deletion_time: m.deletion_time,
                destroyed: m.destroyed,
                version: m.version,
            }),
            lease,
            warnings: api.warnings.unwrap_or_default(),
        })
    }

    /// Renew a secret lease by id.
    pub async fn renew_lease(
        &self,
        token: &str,
        lease_id: &str,
        increment: i64,
    ) -> Result<RenewalInfo, SecretError> {
        let resp = self
            .http
            .put(self.url("sys/leases/renew"))
            .header(VAULT_TOKEN_HEADER, token)
            .json(&serde_json::json!({ "lease_id": lease_id, "increment": increment }))
            .send()
            .await;
        let api: ApiResponse = decode(resp).await?;
        Ok(RenewalInfo {
            lease_duration: api.lease_duration,
            renewable: api.renewable,
        })
    }

    /// Renew the auth token itself.
    pub async fn renew_token(&self, token: &str, increment: i64) -> Result<RenewalInfo, SecretError> {
        let resp = self
            .http
            .post(self.url("auth/token/renew-self"))
            .header(VAULT_TOKEN_HEADER, token)
            .json(&serde_json::json!({ "increment": increment }))
            .send()
            .await;
        let api: ApiResponse = decode(resp).await?;
        let auth = api
            .auth
            .ok_or_else(|| SecretError::Internal("renew-self did not return auth data".to_string()))?;
        Ok(RenewalInfo {
            lease_duration: auth.lease_duration,
            renewable: auth.renewable,
        })
    }
}

impl std::fmt::Debug for RawClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawClient").field("base", &self.base).finish()
    }
}

/// Map a reqwest outcome to a typed result: 404 is `NotFound`, 401/403 are
/// `Unauthorized`, other failures are `Transport`.
async fn decode<T: serde::de::DeserializeOwned>(
    resp: Result<reqwest::Response, reqwest::Error>,
) -> Result<T, SecretError> {
    let resp = resp.map_err(|e| SecretError::Transport(e.to_string()))?;
    let status = resp.status();

    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(SecretError::NotFound);
    }
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        let body = resp.text().await.unwrap_or_default();
        return Err(SecretError::Unauthorized(vault_error_text(status, &body)));
    }
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(SecretError::Transport(vault_error_text(status, &body)));
    }

    resp.json::<T>()
        .await
        .map_err(|e| SecretError::Internal(format!("decode response: {e}")))
}

/// Pull the `errors` array out of a Vault error body when present.
fn vault_error_text(status: reqwest::StatusCode, body: &str) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        errors: Vec<String>,
    }
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(e) if !e.errors.is_empty() => format!("{status}: {}", e.errors.join("; ")),
        _ => format!("{status}: {body}"),
    }
}

fn stringify_values(map: serde_json::Map<String, serde_json::Value>) -> HashMap<String, String> {
    map.into_iter()
        .map(|(k, v)| {
            let s = match v {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            (k, s)
        })
        .collect()
}

// --- Response types ---

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    lease_id: String,
    #[serde(default)]
    renewable: bool,
    #[serde(default)]
    lease_duration: u64,
    data: Option<serde_json::Value>,
    warnings: Option<Vec<String>>,
    auth: Option<AuthData>,
}

impl ApiResponse {
    fn lease(&self) -> Option<LeaseInfo> {
        if self.lease_id.is_empty() {
            return None;
        }
        Some(LeaseInfo {
            lease_id: self.lease_id.clone(),
            renewable: self.renewable,
            lease_duration: self.lease_duration,
        })
    }
}

#[derive(Debug, Deserialize)]
struct AuthData {
    client_token: String,
    #[serde(default)]
    renewable: bool,
    #[serde(default)]
    lease_duration: u64,
}

#[derive(Debug, Deserialize)]
struct KvV2Envelope {
    data: Option<serde_json::Map<String, serde_json::Value>>,
    metadata: Option<KvV2Metadata>,
}

#[derive(Debug, Deserialize)]
struct KvV2Metadata {
    created_time: DateTime<Utc>,
    #[serde(default, deserialize_with = "empty_string_as_none")]
    deletion_time: Option<DateTime<Utc>>,
    #[serde(default)]
    destroyed: bool,
    #[serde(default)]
    version: u64,
    custom_metadata: Option<HashMap<String, String>>,
}

/// KV v2 reports a never-deleted version as `"deletion_time": ""`.
fn empty_string_as_none<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    match raw.as_deref() {
        None | Some("") => Ok(None),
        Some(s) => s
            .parse::<DateTime<Utc>>()
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kv2_envelope_parses_metadata() {
        let json = serde_json::json!({
            "data": { "username": "u", "password": "p" },
            "metadata": {
                "created_time": "2024-03-01T12:00:00Z",
                "deletion_time": "",
                "destroyed": false,
                "version": 2,
                "custom_metadata": { "secretfs-cache-ttl": "60000000000" }
            }
        });
        let envelope: KvV2Envelope = serde_json::from_value(json).unwrap();
        let meta = envelope.metadata.unwrap();
        assert_eq!(meta.version, 2);
        assert!(meta.deletion_time.is_none());
        assert!(!meta.destroyed);
        assert_eq!(
            meta.custom_metadata.unwrap()["secretfs-cache-ttl"],
            "60000000000"
        );
        assert_eq!(envelope.data.unwrap()["username"], "u");
    }

    #[test]
    fn kv2_envelope_parses_deletion_time() {
        let json = serde_json::json!({
            "data": null,
            "metadata": {
                "created_time": "2024-03-01T12:00:00Z",
                "deletion_time": "2024-04-01T00:00:00Z",
                "destroyed": true,
                "version": 1
            }
        });
        let envelope: KvV2Envelope = serde_json::from_value(json).unwrap();
        let meta = envelope.metadata.unwrap();
        assert!(meta.deletion_time.is_some());
        assert!(meta.destroyed);
    }

    #[test]
    fn api_response_lease_extraction() {
        let json = serde_json::json!({
            "lease_id": "database/creds/app/abc",
            "renewable": true,
            "lease_duration": 300,
            "data": { "username": "v-app-u" }
        });
        let api: ApiResponse = serde_json::from_value(json).unwrap();
        let lease = api.lease().unwrap();
        assert_eq!(lease.lease_id, "database/creds/app/abc");
        assert!(lease.renewable);
        assert_eq!(lease.lease_duration, 300);
    }

    #[test]
    fn api_response_without_lease() {
        let api: ApiResponse =
            serde_json::from_value(serde_json::json!({ "data": {} })).unwrap();
        assert!(api.lease().is_none());
    }

    #[test]
    fn auth_data_parses_login_response() {
        let json = serde_json::json!({
            "auth": {
                "client_token": "hvs.abc",
                "renewable": true,
                "lease_duration": 3600,
                "policies": ["default"]
            }
        });
        let api: ApiResponse = serde_json::from_value(json).unwrap();
        let auth = api.auth.unwrap();
        assert_eq!(auth.client_token, "hvs.abc");
        assert!(auth.renewable);
    }

    #[test]
    fn non_string_values_are_stringified() {
        let map = serde_json::json!({ "port": 5432, "tls": true, "name": "db" });
        let serde_json::Value::Object(map) = map else {
            unreachable!()
        };
        let data = stringify_values(map);
        assert_eq!(data["port"], "5432");
        assert_eq!(data["tls"], "true");
        assert_eq!(data["name"], "db");
    }

    #[test]
    fn vault_error_body_extracted() {
        let text = vault_error_text(
            reqwest::StatusCode::FORBIDDEN,
            r#"{"errors":["permission denied"]}"#,
        );
        assert!(text.contains("permission denied"));
    }
}
