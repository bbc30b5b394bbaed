//! The per-secret handle: one configured (engine, path, version) triple over
//! a pooled session, with a TTL body cache and an optional lease watcher.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::SecondsFormat;
use tokio::sync::Mutex;
use tracing::{error, trace, warn};
use uuid::Uuid;

use secretfs_core::options::{EngineKind, EngineOptions, SecretOptions, VolumeOptions};
use secretfs_core::{Secret, SecretBody, SecretError, APP_NAME};

use crate::api::KvSecret;
use crate::client::VaultClient;
use crate::watcher::{OnDone, OnRenewed};

#[derive(Default)]
struct CacheState {
    body: Option<Arc<SecretBody>>,
    watcher: Option<Uuid>,
}

pub struct VaultSecret {
    engine: EngineOptions,
    options: SecretOptions,
    client: std::sync::Mutex<Option<Arc<VaultClient>>>,
    cache: Arc<Mutex<CacheState>>,
}

impl VaultSecret {
    /// Acquire a session reference for these options. Does not fetch.
    pub async fn new(options: &VolumeOptions) -> Result<Self, SecretError> {
        let client = VaultClient::acquire(&options.http, &options.auth).await?;
        Ok(Self {
            engine: options.engine.clone(),
            options: options.secret.clone(),
            client: std::sync::Mutex::new(Some(client)),
            cache: Arc::new(Mutex::new(CacheState::default())),
        })
    }

    fn client(&self) -> Result<Arc<VaultClient>, SecretError> {
        self.client
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| SecretError::Internal("secret handle used after close".to_string()))
    }

    async fn clear_cache_locked(&self, cache: &mut CacheState, client: &Arc<VaultClient>) {
        cache.body = None;
        if let Some(id) = cache.watcher.take() {
            client.stop_watcher(id).await;
        }
    }

    fn lease_callbacks(&self) -> (OnDone, OnRenewed) {
        let path = self.options.path.clone();
        let cache = Arc::downgrade(&self.cache);
        let on_done: OnDone = Arc::new(move |err| {
            if let Some(e) = &err {
                error!(secret = %path, error = %e, "secret lease renewal failed");
            }
            if let Some(cache) = cache.upgrade() {
                // try_lock: if the cache lock is held, the holder is already
                // replacing or tearing down the cache, which supersedes this
                // invalidation.
                if let Ok(mut state) = cache.try_lock() {
                    state.body = None;
                    state.watcher = None;
                }
            }
        });

        let path = self.options.path.clone();
        let on_renewed: OnRenewed = Arc::new(move |info| {
            trace!(secret = %path, lease_duration = info.lease_duration, "secret lease renewed");
        });

        (on_done, on_renewed)
    }
}

#[async_trait::async_trait]
impl Secret for VaultSecret {
    async fn fetch(&self, no_cache: bool) -> Result<Arc<SecretBody>, SecretError> {
        let client = self.client()?;
        let mut cache = self.cache.lock().await;

        if !no_cache {
            if let Some(body) = &cache.body {
                if body.is_fresh(SystemTime::now()) {
                    return Ok(Arc::clone(body));
                }
            }
        }

        self.clear_cache_locked(&mut cache, &client).await;

        let kv = match self.engine.kind {
            EngineKind::Kv => match self.engine.kv_version {
                1 => {
                    client
                        .fetch_kv_v1(self.engine.effective_mount_path(), &self.options.path)
                        .await?
                }
                2 => {
                    client
                        .fetch_kv_v2(
                            self.engine.effective_mount_path(),
                            &self.options.path,
                            self.options.kv_version,
                        )
                        .await?
                }
                v => {
                    return Err(SecretError::config(
                        "kv-engine-version",
                        format!("unknown KV version {v}"),
                    ))
                }
            },
            kind => {
                return Err(SecretError::Internal(format!(
                    "{kind:?} engine fetch is not implemented"
                )))
            }
        };

        for warning in &kv.warnings {
            warn!(secret = %self.options.path, warning = %warning, "backend returned a warning");
        }

        let body = Arc::new(build_body(kv)?);

        if let Some(lease) = body.lease().filter(|l| l.renewable) {
            let (on_done, on_renewed) = self.lease_callbacks();
            let id = client
                .watch_lease(lease, self.options.token_renew_ttl, Some(on_renewed), on_done)
                .await?;
            cache.watcher = Some(id);
        }

        cache.body = Some(Arc::clone(&body));
        Ok(body)
    }

    async fn close(&self) {
        let client = self.client.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(client) = client else {
            return;
        };

        {
            let mut cache = self.cache.lock().await;
            self.clear_cache_locked(&mut cache, &client).await;
        }

        client.release().await;
    }
}

impl std::fmt::Debug for VaultSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultSecret")
            .field("engine", &self.engine)
            .field("path", &self.options.path)
            .field("kv_version", &self.options.kv_version)
            .finish_non_exhaustive()
    }
}

/// Turn a fetched KV secret into an immutable body: merge in the synthetic
/// version-metadata keys, consume app-prefixed custom-metadata directives,
/// surface the rest under `.metadata-`.
fn build_body(kv: KvSecret) -> Result<SecretBody, SecretError> {
    let mut data = kv.data;
    let mut created_at = None;

    if let Some(vm) = &kv.version_metadata {
        created_at = Some(vm.created_time);
        data.insert(
            ".version-metadata-created-at".to_string(),
            vm.created_time.to_rfc3339_opts(SecondsFormat::Secs, true),
        );
        data.insert(
            ".version-metadata-deleted-at".to_string(),
            vm.deletion_time
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
                .unwrap_or_default(),
        );
        data.insert(
            ".version-metadata-is-destroyed".to_string(),
            vm.destroyed.to_string(),
        );
        data.insert(".version-metadata-version".to_string(), vm.version.to_string());
    }

    let mut cache_ttl = Duration::ZERO;
    let directive_prefix = format!("{APP_NAME}-");
    let ttl_directive = format!("{APP_NAME}-cache-ttl");

    if let Some(custom) = kv.custom_metadata {
        for (key, value) in custom {
            if key.starts_with(&directive_prefix) {
                if key == ttl_directive {
                    let nanos: u64 = value.parse().map_err(|e| {
                        SecretError::config(
                            "secretfs-cache-ttl",
                            format!("cannot parse {value:?} as nanoseconds: {e}"),
                        )
                    })?;
                    cache_ttl = Duration::from_nanos(nanos);
                }
            } else {
                data.insert(format!(".metadata-{key}"), value);
            }
        }
    }

    Ok(SecretBody::new(
        Uuid::new_v4().to_string(),
        cache_ttl,
        created_at,
        data,
        kv.lease,
    ))
}
