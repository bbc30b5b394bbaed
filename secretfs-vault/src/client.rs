//! The process-wide pool of authenticated Vault sessions.
//!
//! Sessions are keyed by the fingerprint of the options that affect
//! authenticated connectivity (address, redirect/TLS policy, auth method and
//! credential locators): equal fingerprints share one session. A session is
//! created logged-out; login happens lazily on the first fetch and is
//! re-attempted on the next fetch after any defensive logout.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Weak};

use tokio::sync::Mutex;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use secretfs_core::options::{AuthMethod, AuthOptions, HttpOptions};
use secretfs_core::{LeaseInfo, SecretError};

use crate::api::{KvSecret, RawClient};
use crate::watcher::{OnDone, OnRenewed, RenewFn, WatcherSet};

static POOL: LazyLock<Mutex<HashMap<String, Arc<VaultClient>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn fingerprint(http: &HttpOptions, auth: &AuthOptions) -> String {
    let mut out = String::new();
    http.fingerprint_into(&mut out);
    auth.fingerprint_into(&mut out);
    out
}

#[derive(Clone)]
struct AuthedSession {
    api: RawClient,
    token: Zeroizing<String>,
}

#[derive(Default)]
struct AuthState {
    session: Option<AuthedSession>,
    auth_watcher: Option<Uuid>,
}

/// One shared, reference-counted backend session.
pub struct VaultClient {
    fingerprint: String,
    http_options: HttpOptions,
    auth_options: AuthOptions,
    /// Mutated only under the pool lock.
    refcount: AtomicUsize,
    auth: Mutex<AuthState>,
    watchers: WatcherSet,
    /// Non-owning self-reference handed to watcher callbacks, so a watcher
    /// outliving the pool entry cannot keep the session alive.
    weak: Weak<VaultClient>,
}

impl VaultClient {
    /// Return the pooled session for these options, or construct a fresh
    /// logged-out one. Construction never talks to the backend.
    pub async fn acquire(
        http: &HttpOptions,
        auth: &AuthOptions,
    ) -> Result<Arc<Self>, SecretError> {
        let fingerprint = fingerprint(http, auth);
        let mut pool = POOL.lock().await;

        if let Some(existing) = pool.get(&fingerprint) {
            existing.refcount.fetch_add(1, Ordering::SeqCst);
            trace!(refcount = existing.refcount.load(Ordering::SeqCst), "reusing vault session");
            return Ok(Arc::clone(existing));
        }

        http.validate()?;

        let client = Arc::new_cyclic(|weak| Self {
            fingerprint: fingerprint.clone(),
            http_options: http.clone(),
            auth_options: auth.clone(),
            refcount: AtomicUsize::new(1),
            auth: Mutex::new(AuthState::default()),
            watchers: WatcherSet::new(),
            weak: weak.clone(),
        });
        pool.insert(fingerprint, Arc::clone(&client));
        debug!(address = %http.address, "new vault session");
        Ok(client)
    }

    /// Drop one reference. The last release removes the session from the
    /// pool, logs out, and waits for every lease watcher to terminate.
    pub async fn release(&self) {
        let mut pool = POOL.lock().await;
        if self.refcount.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }
        pool.remove(&self.fingerprint);
        drop(pool);

        self.logout().await;
        self.watchers.stop_all().await;
        debug!(address = %self.http_options.address, "vault session closed");
    }

    pub async fn fetch_kv_v1(
        &self,
        engine_mount: &str,
        secret_path: &str,
    ) -> Result<KvSecret, SecretError> {
        let session = self.authed().await?;
        match session.api.read_kv_v1(&session.token, engine_mount, secret_path).await {
            Err(e) if e.is_auth_suspect() => {
                // token may be expired; the next fetch re-authenticates
                self.logout().await;
                Err(e)
            }
            other => other,
        }
    }

    pub async fn fetch_kv_v2(
        &self,
        engine_mount: &str,
        secret_path: &str,
        version: Option<u64>,
    ) -> Result<KvSecret, SecretError> {
        let session = self.authed().await?;
        match session
            .api
            .read_kv_v2(&session.token, engine_mount, secret_path, version)
            .await
        {
            Err(e) if e.is_auth_suspect() => {
                self.logout().await;
                Err(e)
            }
            other => other,
        }
    }

    /// Start a watcher for a secret lease fetched through this session.
    /// The caller owns the returned id and stops it via [`Self::stop_watcher`].
    pub async fn watch_lease(
        &self,
        lease: &LeaseInfo,
        increment: i64,
        on_renewed: Option<OnRenewed>,
        on_done: OnDone,
    ) -> Result<Uuid, SecretError> {
        let session = {
            let state = self.auth.lock().await;
            state
                .session
                .as_ref()
                .ok_or_else(|| {
                    SecretError::Internal("lease watcher requested on logged-out session".to_string())
                })?
                .clone()
        };

        let lease_id = lease.lease_id.clone();
        let renew: RenewFn = Arc::new(move || {
            let api = session.api.clone();
            let token = session.token.clone();
            let lease_id = lease_id.clone();
            Box::pin(async move { api.renew_lease(&token, &lease_id, increment).await })
        });

        Ok(self.watchers.spawn(lease.lease_duration, renew, on_renewed, on_done))
    }

    pub async fn stop_watcher(&self, id: Uuid) -> bool {
        self.watchers.stop(id).await
    }

    /// Forget the authenticated state. Stops the auth lease watcher first so
    /// it cannot renew a token we no longer use.
    pub async fn logout(&self) {
        let auth_watcher = {
            let mut state = self.auth.lock().await;
            if state.session.take().is_some() {
                debug!(address = %self.http_options.address, "vault session logged out");
            }
            state.auth_watcher.take()
        };
        // Join outside the state lock: the watcher's own termination path
        // takes locks of its own.
        if let Some(id) = auth_watcher {
            self.watchers.stop(id).await;
        }
    }

    /// Get the authenticated session, logging in first if needed. Login
    /// failures are returned verbatim; the session stays logged out and the
    /// next call retries.
    async fn authed(&self) -> Result<AuthedSession, SecretError> {
        let mut state = self.auth.lock().await;
        if state.session.is_none() {
            self.login_locked(&mut state).await?;
        }
        state
            .session
            .as_ref()
            .cloned()
            .ok_or_else(|| SecretError::Internal("login left no session".to_string()))
    }

    async fn login_locked(&self, state: &mut AuthState) -> Result<(), SecretError> {
        let auth = &self.auth_options;
        debug!(address = %self.http_options.address, method = %auth.method, "vault login");

        let (api, token, lease) = match auth.method {
            AuthMethod::AppRole => {
                let api = RawClient::build(&self.http_options, None)?;
                let role_id =
                    credential(&auth.role_id, &auth.role_id_file, "auth-role-id").await?;
                let mut secret_id =
                    credential(&auth.secret_id, &auth.secret_id_file, "auth-secret-id").await?;
                if auth.secret_id_token_wrapped {
                    let data = api.unwrap(&secret_id).await?;
                    let unwrapped = data
                        .get("secret_id")
                        .and_then(|v| v.as_str())
                        .ok_or_else(|| {
                            SecretError::config(
                                "auth-secret-id",
                                "unwrap response carries no secret_id",
                            )
                        })?;
                    secret_id = Zeroizing::new(unwrapped.to_string());
                }
                let lease = api
                    .login(
                        auth.effective_mount_path(),
                        None,
                        &serde_json::json!({
                            "role_id": role_id.as_str(),
                            "secret_id": secret_id.as_str(),
                        }),
                    )
                    .await?;
                let token = Zeroizing::new(lease.client_token.clone());
                (api, token, Some(lease))
            }

            AuthMethod::Cert => {
                let cert = auth.cert_file.as_deref().ok_or_else(|| {
                    SecretError::config("auth-cert-file", "cert auth method requires a cert file")
                })?;
                let key = auth.cert_key_file.as_deref().ok_or_else(|| {
                    SecretError::config("auth-cert-key-file", "cert auth method requires a key file")
                })?;
                let api = RawClient::build(&self.http_options, Some((cert, key)))?;
                let lease = api
                    .login(auth.effective_mount_path(), None, &serde_json::json!({}))
                    .await?;
                let token = Zeroizing::new(lease.client_token.clone());
                (api, token, Some(lease))
            }

            AuthMethod::Token => {
                let api = RawClient::build(&self.http_options, None)?;
                let token = credential(&auth.token, &auth.token_file, "auth-token").await?;
                // A supplied token has no login response; nothing to watch.
                (api, token, None)
            }

            AuthMethod::Userpass => {
                let api = RawClient::build(&self.http_options, None)?;
                let username =
                    credential(&auth.username, &auth.username_file, "auth-username").await?;
                let password =
                    credential(&auth.password, &auth.password_file, "auth-password").await?;
                let lease = api
                    .login(
                        auth.effective_mount_path(),
                        Some(username.as_str()),
                        &serde_json::json!({ "password": password.as_str() }),
                    )
                    .await?;
                let token = Zeroizing::new(lease.client_token.clone());
                (api, token, Some(lease))
            }
        };

        let session = AuthedSession { api, token };
        state.session = Some(session.clone());

        if let Some(lease) = lease.filter(|l| l.renewable) {
            state.auth_watcher = Some(self.spawn_auth_watcher(&session, lease.lease_duration));
        }

        Ok(())
    }

    fn spawn_auth_watcher(&self, session: &AuthedSession, lease_duration: u64) -> Uuid {
        let increment = self.auth_options.token_renew_ttl;
        let api = session.api.clone();
        let token = session.token.clone();
        let renew: RenewFn = Arc::new(move || {
            let api = api.clone();
            let token = token.clone();
            Box::pin(async move { api.renew_token(&token, increment).await })
        });

        let weak = self.weak.clone();
        let on_done: OnDone = Arc::new(move |err| {
            match &err {
                Some(e) => error!(error = %e, "auth token renewal failed"),
                None => debug!("auth lease watcher finished"),
            }
            // Force a logout so the next fetch re-authenticates. Spawned:
            // the callback runs inside the terminating watcher task and must
            // not block on session locks held by whoever is stopping it.
            if let Some(client) = weak.upgrade() {
                tokio::spawn(async move { client.logout().await });
            }
        });
        let on_renewed: OnRenewed = Arc::new(|info| {
            trace!(lease_duration = info.lease_duration, "auth token renewed");
        });

        self.watchers.spawn(lease_duration, renew, Some(on_renewed), on_done)
    }

    #[cfg(test)]
    pub(crate) fn refcount(&self) -> usize {
        self.refcount.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) async fn pooled(http: &HttpOptions, auth: &AuthOptions) -> bool {
        POOL.lock().await.contains_key(&fingerprint(http, auth))
    }
}

impl std::fmt::Debug for VaultClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultClient")
            .field("address", &self.http_options.address)
            .field("method", &self.auth_options.method)
            .field("refcount", &self.refcount.load(Ordering::SeqCst))
            .field("watchers", &self.watchers.len())
            .finish()
    }
}

/// Resolve a credential that can be given inline or as a file path; the file
/// wins so rotated file contents take effect without re-creating the volume.
async fn credential(
    inline: &Option<String>,
    file: &Option<PathBuf>,
    field: &'static str,
) -> Result<Zeroizing<String>, SecretError> {
    if let Some(path) = file {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            SecretError::config(field, format!("read {}: {e}", path.display()))
        })?;
        let trimmed = content.trim_end();
        if trimmed.is_empty() {
            warn!(field, path = %path.display(), "credential file is empty");
        }
        return Ok(Zeroizing::new(trimmed.to_string()));
    }
    inline
        .as_ref()
        .map(|v| Zeroizing::new(v.clone()))
        .ok_or_else(|| SecretError::config(field, "credential is not configured"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn options(address: &str) -> (HttpOptions, AuthOptions) {
        let http = HttpOptions {
            address: address.to_string(),
            ..Default::default()
        };
        let auth = AuthOptions {
            token: Some("s.test".to_string()),
            ..Default::default()
        };
        (http, auth)
    }

    #[tokio::test]
    async fn acquire_dedupes_equal_fingerprints() {
        let (http, auth) = options("http://pool-dedup.invalid:8200");

        let a = VaultClient::acquire(&http, &auth).await.unwrap();
        let b = VaultClient::acquire(&http, &auth).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.refcount(), 2);

        a.release().await;
        assert!(VaultClient::pooled(&http, &auth).await);
        b.release().await;
        assert!(!VaultClient::pooled(&http, &auth).await);
    }

    #[tokio::test]
    async fn concurrent_acquires_create_one_session() {
        let (http, auth) = options("http://pool-concurrent.invalid:8200");

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let http = http.clone();
                let auth = auth.clone();
                tokio::spawn(async move { VaultClient::acquire(&http, &auth).await.unwrap() })
            })
            .collect();

        let mut clients = Vec::new();
        for task in tasks {
            clients.push(task.await.unwrap());
        }

        for c in &clients[1..] {
            assert!(Arc::ptr_eq(&clients[0], c));
        }
        assert_eq!(clients[0].refcount(), 8);

        for c in &clients {
            c.release().await;
        }
        assert!(!VaultClient::pooled(&http, &auth).await);
    }

    #[tokio::test]
    async fn different_credentials_get_distinct_sessions() {
        let (http, auth_a) = options("http://pool-distinct.invalid:8200");
        let auth_b = AuthOptions {
            token: Some("s.other".to_string()),
            ..Default::default()
        };

        let a = VaultClient::acquire(&http, &auth_a).await.unwrap();
        let b = VaultClient::acquire(&http, &auth_b).await.unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(a.refcount(), 1);
        assert_eq!(b.refcount(), 1);

        a.release().await;
        b.release().await;
    }

    #[tokio::test]
    async fn acquire_rejects_missing_address() {
        let http = HttpOptions::default();
        let auth = AuthOptions {
            token: Some("s.test".to_string()),
            ..Default::default()
        };
        let err = VaultClient::acquire(&http, &auth).await.unwrap_err();
        assert!(matches!(err, SecretError::Config { .. }));
    }

    #[tokio::test]
    async fn credential_prefers_file_and_trims() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "s.from-file").unwrap();

        let inline = Some("s.inline".to_string());
        let path = Some(file.path().to_path_buf());
        let cred = credential(&inline, &path, "auth-token").await.unwrap();
        assert_eq!(cred.as_str(), "s.from-file");

        let cred = credential(&inline, &None, "auth-token").await.unwrap();
        assert_eq!(cred.as_str(), "s.inline");
    }

    #[tokio::test]
    async fn credential_missing_is_config_error() {
        let err = credential(&None, &None, "auth-password").await.unwrap_err();
        assert!(err.to_string().contains("auth-password"));
    }
}
