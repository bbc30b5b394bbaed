//! The plugin listener and the HTTP dispatch table.
//!
//! One listener serves the whole plugin protocol: either a Unix socket with
//! configured ownership and mode, or a TCP socket optionally wrapped in TLS
//! (ALPN `http/1.1`). Every endpoint is a POST; handlers decode the body,
//! call one core operation, and encode either the success response or
//! `{"Err": "<message>"}` with HTTP 500. Undecodable bodies get a plain-text
//! 400.

use std::io::BufReader;
use std::os::unix::fs::PermissionsExt as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use serde::Serialize;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use secretfs_core::SecretError;

use crate::driver::VolumeDriver;
use crate::provider::SecretProvider;
use crate::types::*;

#[derive(Debug, Clone)]
pub struct TlsServerConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

#[derive(Debug, Clone)]
pub enum ListenerConfig {
    Unix {
        path: PathBuf,
        uid: u32,
        gid: u32,
        mode: u32,
    },
    Tcp {
        addr: std::net::SocketAddr,
        tls: Option<TlsServerConfig>,
    },
}

pub enum Listener {
    Unix {
        listener: tokio::net::UnixListener,
        path: PathBuf,
    },
    Tcp {
        listener: tokio::net::TcpListener,
        tls: Option<TlsAcceptor>,
    },
}

impl Listener {
    pub async fn bind(config: ListenerConfig) -> anyhow::Result<Self> {
        match config {
            ListenerConfig::Unix { path, uid, gid, mode } => {
                // Bind with no access at all, then hand the socket to its
                // configured owner and mode.
                let old_umask = unsafe { libc::umask(0o777) };
                let bound = tokio::net::UnixListener::bind(&path);
                unsafe { libc::umask(old_umask) };
                let listener =
                    bound.with_context(|| format!("bind unix socket {}", path.display()))?;

                chown(&path, uid, gid)
                    .with_context(|| format!("update unix socket owner to {uid}:{gid}"))?;
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))
                    .context("update unix socket access mode")?;

                info!(socket = %path.display(), "plugin listening on unix socket");
                Ok(Self::Unix { listener, path })
            }
            ListenerConfig::Tcp { addr, tls } => {
                let listener = tokio::net::TcpListener::bind(addr)
                    .await
                    .with_context(|| format!("create TCP socket {addr}"))?;
                let tls = match tls {
                    Some(config) => Some(tls_acceptor(&config)?),
                    None => None,
                };
                info!(%addr, tls = tls.is_some(), "plugin listening on TCP socket");
                Ok(Self::Tcp { listener, tls })
            }
        }
    }

    /// Serve until `shutdown` flips. The Unix socket file is removed on the
    /// way out.
    pub async fn serve(
        self,
        router: Router,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        match self {
            Self::Unix { listener, path } => {
                let result = axum::serve(listener, router)
                    .with_graceful_shutdown(async move {
                        let _ = shutdown.changed().await;
                    })
                    .await;
                if let Err(e) = std::fs::remove_file(&path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(socket = %path.display(), "unable to remove unix socket: {e}");
                    }
                }
                result.context("serve unix listener")
            }
            Self::Tcp { listener, tls: None } => axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = shutdown.changed().await;
                })
                .await
                .context("serve TCP listener"),
            Self::Tcp {
                listener,
                tls: Some(acceptor),
            } => serve_tls(listener, acceptor, router, shutdown).await,
        }
    }
}

fn chown(path: &Path, uid: u32, gid: u32) -> std::io::Result<()> {
    use std::os::unix::ffi::OsStrExt as _;
    let cpath = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|e| std::io::Error::other(e.to_string()))?;
    // SAFETY: cpath is a valid NUL-terminated path.
    if unsafe { libc::chown(cpath.as_ptr(), uid, gid) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn tls_acceptor(config: &TlsServerConfig) -> anyhow::Result<TlsAcceptor> {
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(
        std::fs::File::open(&config.cert_file)
            .with_context(|| format!("open {}", config.cert_file.display()))?,
    ))
    .collect::<Result<_, _>>()
    .context("parse TLS certificate chain")?;

    let key = rustls_pemfile::private_key(&mut BufReader::new(
        std::fs::File::open(&config.key_file)
            .with_context(|| format!("open {}", config.key_file.display()))?,
    ))
    .context("parse TLS private key")?
    .context("no private key found")?;

    let mut server = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("build TLS server config")?;
    server.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(server)))
}

async fn serve_tls(
    listener: tokio::net::TcpListener,
    acceptor: TlsAcceptor,
    router: Router,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("TCP accept failed: {e}");
                    continue;
                }
            },
        };

        let acceptor = acceptor.clone();
        let service = hyper_util::service::TowerToHyperService::new(router.clone());
        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(s) => s,
                Err(e) => {
                    debug!(%peer, "TLS handshake failed: {e}");
                    return;
                }
            };
            let io = hyper_util::rt::TokioIo::new(tls_stream);
            if let Err(e) = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, service)
                .await
            {
                debug!(%peer, "connection error: {e}");
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Dispatch table
// ---------------------------------------------------------------------------

pub struct PluginState {
    pub driver: Option<Arc<VolumeDriver>>,
    pub provider: Option<SecretProvider>,
    pub manifest: PluginManifest,
}

/// The fixed dispatch table. Disabled surfaces are simply not routed.
pub fn router(state: Arc<PluginState>) -> Router {
    let mut router = Router::new().route("/Plugin.Activate", post(activate));

    if state.driver.is_some() {
        router = router
            .route("/VolumeDriver.Create", post(create))
            .route("/VolumeDriver.List", post(list))
            .route("/VolumeDriver.Get", post(get))
            .route("/VolumeDriver.Remove", post(remove))
            .route("/VolumeDriver.Path", post(path))
            .route("/VolumeDriver.Mount", post(mount))
            .route("/VolumeDriver.Unmount", post(unmount))
            .route("/VolumeDriver.Capabilities", post(capabilities));
    }
    if state.provider.is_some() {
        router = router.route("/SecretProvider.GetSecret", post(get_secret));
    }

    router.with_state(state)
}

fn plugin_json<T: Serialize>(status: StatusCode, value: &T) -> Response {
    let body = serde_json::to_vec(value).unwrap_or_default();
    (
        status,
        [(header::CONTENT_TYPE, PLUGIN_CONTENT_TYPE)],
        body,
    )
        .into_response()
}

fn success<T: Serialize>(value: &T) -> Response {
    plugin_json(StatusCode::OK, value)
}

fn failure(message: String) -> Response {
    plugin_json(StatusCode::INTERNAL_SERVER_ERROR, &ErrorResponse { err: message })
}

/// Volume-scoped errors carry the volume name in the message.
fn volume_failure(name: &str, e: SecretError) -> Response {
    match e {
        SecretError::NotFound => failure(format!("unable to find volume {name}")),
        other => failure(other.to_string()),
    }
}

fn decode<T: serde::de::DeserializeOwned>(body: &Bytes) -> Result<T, Response> {
    serde_json::from_slice(body)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()).into_response())
}

fn driver_of(state: &PluginState) -> Result<&Arc<VolumeDriver>, Response> {
    state
        .driver
        .as_ref()
        .ok_or_else(|| failure("volume driver is disabled".to_string()))
}

async fn activate(State(state): State<Arc<PluginState>>) -> Response {
    success(&state.manifest)
}

async fn create(State(state): State<Arc<PluginState>>, body: Bytes) -> Response {
    let req: CreateRequest = match decode(&body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let driver = match driver_of(&state) {
        Ok(d) => d,
        Err(resp) => return resp,
    };
    match driver.create(&req.name, &req.opts).await {
        Ok(()) => success(&serde_json::json!({})),
        Err(e) => failure(e.to_string()),
    }
}

async fn list(State(state): State<Arc<PluginState>>) -> Response {
    let driver = match driver_of(&state) {
        Ok(d) => d,
        Err(resp) => return resp,
    };
    let volumes = driver
        .list()
        .await
        .into_iter()
        .map(|(name, mountpoint)| VolumeInfo { name, mountpoint })
        .collect();
    success(&ListResponse { volumes })
}

async fn get(State(state): State<Arc<PluginState>>, body: Bytes) -> Response {
    let req: NameRequest = match decode(&body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let driver = match driver_of(&state) {
        Ok(d) => d,
        Err(resp) => return resp,
    };
    match driver.get(&req.name).await {
        Ok((name, mountpoint)) => success(&GetResponse {
            volume: VolumeInfo { name, mountpoint },
        }),
        Err(e) => volume_failure(&req.name, e),
    }
}

async fn remove(State(state): State<Arc<PluginState>>, body: Bytes) -> Response {
    let req: NameRequest = match decode(&body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let driver = match driver_of(&state) {
        Ok(d) => d,
        Err(resp) => return resp,
    };
    match driver.remove(&req.name).await {
        Ok(()) => success(&serde_json::json!({})),
        Err(e) => volume_failure(&req.name, e),
    }
}

async fn path(State(state): State<Arc<PluginState>>, body: Bytes) -> Response {
    let req: NameRequest = match decode(&body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let driver = match driver_of(&state) {
        Ok(d) => d,
        Err(resp) => return resp,
    };
    match driver.path(&req.name).await {
        Ok(mountpoint) => success(&PathResponse { mountpoint }),
        Err(e) => volume_failure(&req.name, e),
    }
}

async fn mount(State(state): State<Arc<PluginState>>, body: Bytes) -> Response {
    let req: MountRequest = match decode(&body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let driver = match driver_of(&state) {
        Ok(d) => d,
        Err(resp) => return resp,
    };
    match driver.mount(&req.name, &req.id).await {
        Ok(mountpoint) => success(&MountResponse { mountpoint }),
        Err(e) => volume_failure(&req.name, e),
    }
}

async fn unmount(State(state): State<Arc<PluginState>>, body: Bytes) -> Response {
    let req: MountRequest = match decode(&body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let driver = match driver_of(&state) {
        Ok(d) => d,
        Err(resp) => return resp,
    };
    match driver.unmount(&req.name, &req.id).await {
        Ok(()) => success(&serde_json::json!({})),
        Err(e) => volume_failure(&req.name, e),
    }
}

async fn capabilities(State(state): State<Arc<PluginState>>) -> Response {
    let driver = match driver_of(&state) {
        Ok(d) => d,
        Err(resp) => return resp,
    };
    success(&CapabilitiesResponse {
        capabilities: Capability {
            scope: driver.capabilities(),
        },
    })
}

async fn get_secret(State(state): State<Arc<PluginState>>, body: Bytes) -> Response {
    use base64::prelude::{Engine as _, BASE64_STANDARD};

    let req: GetSecretRequest = match decode(&body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let Some(provider) = &state.provider else {
        return failure("secret provider is disabled".to_string());
    };
    match provider.get_secret(&req).await {
        Ok(value) => success(&GetSecretResponse {
            value: BASE64_STANDARD.encode(value),
            do_not_reuse: true,
        }),
        Err(SecretError::NotFound) => failure(format!(
            "unable to find secret data field {}",
            req.secret_name
        )),
        Err(e) => failure(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DriverConfig;
    use axum::body::Body;
    use axum::http::Request;
    use secretfs_core::options::VolumeOptions;
    use secretfs_fuse::{Fs, FsConfig};
    use tower::ServiceExt as _;

    fn test_state(dir: &std::path::Path, tag: &str) -> Arc<PluginState> {
        let mut defaults = VolumeOptions::default();
        defaults.http.address = format!("http://server-tests-{tag}.invalid:8200");
        defaults.auth.token = Some("s.test".to_string());

        let fs = Arc::new(Fs::new(
            FsConfig {
                fuse_name: "secretfs-test".to_string(),
                mount_dir: dir.join("mnt"),
                uid: 0,
                gid: 0,
            },
            tokio::runtime::Handle::current(),
        ));
        let driver = Arc::new(VolumeDriver::new(
            DriverConfig {
                global_scope: false,
                state_file: dir.join("state.json"),
                defaults: defaults.clone(),
            },
            fs,
        ));

        Arc::new(PluginState {
            driver: Some(driver),
            provider: Some(SecretProvider::new(defaults)),
            manifest: PluginManifest {
                implements: vec![IMPLEMENTS_VOLUME_DRIVER, IMPLEMENTS_SECRET_PROVIDER],
            },
        })
    }

    async fn call(router: &Router, path: &str, body: Option<serde_json::Value>) -> (StatusCode, Bytes) {
        let request = Request::builder()
            .method("POST")
            .uri(path)
            .body(match body {
                Some(v) => Body::from(v.to_string()),
                None => Body::empty(),
            })
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, bytes)
    }

    fn json(bytes: &Bytes) -> serde_json::Value {
        serde_json::from_slice(bytes).unwrap()
    }

    #[tokio::test]
    async fn activate_reports_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let router = router(test_state(dir.path(), "activate"));

        let (status, body) = call(&router, "/Plugin.Activate", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            json(&body),
            serde_json::json!({ "Implements": ["VolumeDriver", "secretprovider"] })
        );
    }

    #[tokio::test]
    async fn create_list_and_capabilities_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let router = router(test_state(dir.path(), "crud"));

        let (status, body) = call(
            &router,
            "/VolumeDriver.Create",
            Some(serde_json::json!({ "Name": "db@2", "Opts": { "kv-engine-version": "2" } })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json(&body), serde_json::json!({}));

        let (status, body) = call(&router, "/VolumeDriver.List", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            json(&body),
            serde_json::json!({ "Volumes": [{ "Name": "db@2", "Mountpoint": "" }] })
        );

        let (status, body) = call(&router, "/VolumeDriver.Capabilities", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            json(&body),
            serde_json::json!({ "Capabilities": { "Scope": "local" } })
        );
    }

    #[tokio::test]
    async fn mount_and_unmount_over_http() {
        let dir = tempfile::tempdir().unwrap();
        let router = router(test_state(dir.path(), "mount"));

        call(
            &router,
            "/VolumeDriver.Create",
            Some(serde_json::json!({ "Name": "db" })),
        )
        .await;

        let (status, body) = call(
            &router,
            "/VolumeDriver.Mount",
            Some(serde_json::json!({ "Name": "db", "ID": "A" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let mountpoint = json(&body)["Mountpoint"].as_str().unwrap().to_string();
        assert!(mountpoint.ends_with("mnt/db"));

        let (status, body) = call(
            &router,
            "/VolumeDriver.Path",
            Some(serde_json::json!({ "Name": "db" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json(&body)["Mountpoint"], mountpoint.as_str());

        let (status, _) = call(
            &router,
            "/VolumeDriver.Unmount",
            Some(serde_json::json!({ "Name": "db", "ID": "A" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(
            &router,
            "/VolumeDriver.Unmount",
            Some(serde_json::json!({ "Name": "db", "ID": "A" })),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(json(&body)["Err"]
            .as_str()
            .unwrap()
            .contains("mount request id"));
    }

    #[tokio::test]
    async fn unknown_volume_is_a_500_with_message() {
        let dir = tempfile::tempdir().unwrap();
        let router = router(test_state(dir.path(), "missing"));

        let (status, body) = call(
            &router,
            "/VolumeDriver.Get",
            Some(serde_json::json!({ "Name": "ghost" })),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            json(&body),
            serde_json::json!({ "Err": "unable to find volume ghost" })
        );
    }

    #[tokio::test]
    async fn undecodable_body_is_a_plain_400() {
        let dir = tempfile::tempdir().unwrap();
        let router = router(test_state(dir.path(), "badjson"));

        let request = Request::builder()
            .method("POST")
            .uri("/VolumeDriver.Create")
            .body(Body::from("{not json"))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        assert!(content_type.starts_with("text/plain"));
    }

    #[tokio::test]
    async fn responses_carry_the_plugin_content_type() {
        let dir = tempfile::tempdir().unwrap();
        let router = router(test_state(dir.path(), "mime"));

        let request = Request::builder()
            .method("POST")
            .uri("/Plugin.Activate")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            PLUGIN_CONTENT_TYPE
        );
    }

    #[tokio::test]
    async fn create_with_invalid_options_reports_the_field() {
        let dir = tempfile::tempdir().unwrap();
        let router = router(test_state(dir.path(), "badopts"));

        let (status, body) = call(
            &router,
            "/VolumeDriver.Create",
            Some(serde_json::json!({ "Name": "db", "Opts": { "auth-method": "ldap" } })),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(json(&body)["Err"].as_str().unwrap().contains("auth-method"));
    }
}
