use std::path::PathBuf;

use anyhow::Context as _;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use secretfs_core::options::VolumeOptions;
use secretfs_core::{APP_NAME, PLUGIN_ID};
use secretfs_plugin::{FsConfig, ListenerConfig, Plugin, PluginConfig, TlsServerConfig};

mod bootstrap;
mod util;

#[derive(Debug, Parser)]
#[command(name = "secretfsd", version, about = "Vault secrets as Docker volumes over FUSE")]
struct Args {
    /// Debug logging (WARNING: leaks sensitive data in logs)
    #[arg(long, env = "SECRETFS_DEBUG")]
    debug: bool,

    /// Verbose logging
    #[arg(long, env = "SECRETFS_VERBOSE")]
    verbose: bool,

    /// Disable memory locking (NOT RECOMMENDED)
    #[arg(long, env = "SECRETFS_DISABLE_MLOCK")]
    disable_mlock: bool,

    // --- Vault client ---
    /// URL of the Vault server
    #[arg(long, env = "SECRETFS_VAULT_URL")]
    vault_url: Option<String>,

    /// Disable Vault HTTP redirects
    #[arg(long, env = "SECRETFS_VAULT_DISABLE_REDIRECTS")]
    vault_disable_redirects: bool,

    /// Skip verification of the Vault server TLS certificate
    #[arg(long, env = "SECRETFS_VAULT_TLS_SKIP_VERIFY")]
    vault_tls_skip_verify: bool,

    /// CA bundle used to verify the Vault server certificate
    #[arg(long, env = "SECRETFS_VAULT_TLS_CA_CERT_FILE")]
    vault_tls_ca_cert_file: Option<PathBuf>,

    /// Default auth method (approle, cert, token, userpass)
    #[arg(long, env = "SECRETFS_AUTH_METHOD", default_value = "token")]
    auth_method: String,

    /// Default auth engine mount path
    #[arg(long, env = "SECRETFS_AUTH_MOUNT")]
    auth_mount: Option<String>,

    // --- Vault secrets ---
    /// Default secrets engine type (kv, db or pki)
    #[arg(long, env = "SECRETFS_ENGINE_TYPE", default_value = "kv")]
    engine_type: String,

    /// Default secrets engine mount path
    #[arg(long, env = "SECRETFS_ENGINE_MOUNT")]
    engine_mount: Option<String>,

    /// Default KV engine version (1 or 2)
    #[arg(long, env = "SECRETFS_KV_ENGINE_VERSION", default_value_t = 1)]
    kv_engine_version: u8,

    // --- Plugin listener ---
    /// Plugin TCP bind address
    #[arg(long, env = "SECRETFS_PLUGIN_TCP_BIND_ADDR", default_value = "0.0.0.0")]
    plugin_tcp_bind_addr: String,

    /// Plugin TCP bind port (0 keeps the Unix socket listener)
    #[arg(long, env = "SECRETFS_PLUGIN_TCP_BIND_PORT", default_value_t = 0)]
    plugin_tcp_bind_port: u16,

    /// TLS certificate for the TCP listener
    #[arg(long, env = "SECRETFS_PLUGIN_TLS_CERT_FILE", requires = "plugin_tls_key_file")]
    plugin_tls_cert_file: Option<PathBuf>,

    /// TLS private key for the TCP listener
    #[arg(long, env = "SECRETFS_PLUGIN_TLS_KEY_FILE", requires = "plugin_tls_cert_file")]
    plugin_tls_key_file: Option<PathBuf>,

    /// Plugin Unix socket path
    #[arg(long, env = "SECRETFS_PLUGIN_SOCKET_PATH", default_value = "/run/docker/plugins/secretfs.sock")]
    plugin_socket_path: PathBuf,

    /// Plugin Unix socket user (name or id, empty = current)
    #[arg(long, env = "SECRETFS_PLUGIN_SOCKET_USER", default_value = "")]
    plugin_socket_user: String,

    /// Plugin Unix socket group (name or id, empty = current)
    #[arg(long, env = "SECRETFS_PLUGIN_SOCKET_GROUP", default_value = "")]
    plugin_socket_group: String,

    /// Plugin Unix socket access mode (octal)
    #[arg(long, env = "SECRETFS_PLUGIN_SOCKET_MODE", default_value = "600")]
    plugin_socket_mode: String,

    // --- Volume driver ---
    /// Disable the volume driver
    #[arg(long, env = "SECRETFS_DISABLE_VOLUME_DRIVER")]
    disable_volume_driver: bool,

    /// Report global scope instead of local
    #[arg(long, env = "SECRETFS_VOLUME_DRIVER_GLOBAL_SCOPE")]
    volume_driver_global_scope: bool,

    /// Volume driver state file
    #[arg(long, env = "SECRETFS_VOLUME_DRIVER_STATE_FILE", default_value = "/var/local/secretfs/state.json")]
    volume_driver_state_file: PathBuf,

    /// Volume driver FS mount directory
    #[arg(long, env = "SECRETFS_VOLUME_DRIVER_MOUNT_DIR", default_value = "/var/lib/docker-volumes/secretfs")]
    volume_driver_mount_dir: PathBuf,

    /// Volume driver FS mount user (name or id, empty = current)
    #[arg(long, env = "SECRETFS_VOLUME_DRIVER_MOUNT_USER", default_value = "")]
    volume_driver_mount_user: String,

    /// Volume driver FS mount group (name or id, empty = current)
    #[arg(long, env = "SECRETFS_VOLUME_DRIVER_MOUNT_GROUP", default_value = "")]
    volume_driver_mount_group: String,

    // --- Secret provider ---
    /// Disable the secret provider
    #[arg(long, env = "SECRETFS_DISABLE_SECRET_PROVIDER")]
    disable_secret_provider: bool,
}

fn init_tracing(args: &Args) {
    let default = if args.debug {
        "trace"
    } else if args.verbose {
        "debug"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_env("SECRETFS_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Daemon-level defaults every volume and provider request overlays.
fn build_defaults(args: &Args) -> anyhow::Result<VolumeOptions> {
    let mut defaults = VolumeOptions::default();

    defaults.http.address = args
        .vault_url
        .clone()
        .or_else(|| std::env::var("VAULT_ADDR").ok())
        .context("vault URL must be set (--vault-url or VAULT_ADDR)")?;
    defaults.http.disable_redirects = args.vault_disable_redirects;
    defaults.http.tls.insecure = args.vault_tls_skip_verify;
    defaults.http.tls.ca_cert_file = args.vault_tls_ca_cert_file.clone();

    defaults.auth.method = args.auth_method.parse()?;
    defaults.auth.mount_path = args.auth_mount.clone();

    defaults.engine.kind = args.engine_type.parse()?;
    defaults.engine.mount_path = args.engine_mount.clone();
    defaults.engine.kv_version = args.kv_engine_version;
    defaults.engine.validate()?;

    defaults.normalize();
    defaults.http.validate()?;
    Ok(defaults)
}

fn listener_config(args: &Args) -> anyhow::Result<ListenerConfig> {
    if args.plugin_tcp_bind_port != 0 {
        let addr = format!("{}:{}", args.plugin_tcp_bind_addr, args.plugin_tcp_bind_port)
            .parse()
            .context("parse plugin TCP bind address")?;
        let tls = args
            .plugin_tls_cert_file
            .clone()
            .zip(args.plugin_tls_key_file.clone())
            .map(|(cert_file, key_file)| TlsServerConfig { cert_file, key_file });
        return Ok(ListenerConfig::Tcp { addr, tls });
    }

    Ok(ListenerConfig::Unix {
        path: args.plugin_socket_path.clone(),
        uid: util::resolve_user(&args.plugin_socket_user)?,
        gid: util::resolve_group(&args.plugin_socket_group)?,
        mode: u32::from_str_radix(&args.plugin_socket_mode, 8)
            .context("parse plugin socket mode as octal")?,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args);

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "plugin starting");

    bootstrap::harden(args.disable_mlock);

    let config = PluginConfig {
        listener: listener_config(&args)?,
        volume_driver_disabled: args.disable_volume_driver,
        volume_driver_global_scope: args.volume_driver_global_scope,
        state_file: args.volume_driver_state_file.clone(),
        fs: FsConfig {
            fuse_name: APP_NAME.to_string(),
            mount_dir: args.volume_driver_mount_dir.clone(),
            uid: util::resolve_user(&args.volume_driver_mount_user)?,
            gid: util::resolve_group(&args.volume_driver_mount_group)?,
        },
        secret_provider_disabled: args.disable_secret_provider,
        defaults: build_defaults(&args)?,
    };

    let plugin = Plugin::new(config).await.context("create plugin")?;
    std::sync::Arc::clone(&plugin)
        .initialize()
        .await
        .context("initialize plugin")?;

    tracing::info!(plugin = PLUGIN_ID, "started");

    shutdown_signal(&plugin).await;
    tracing::info!("exiting");

    plugin.cleanup().await;
    Ok(())
}

/// Wait for SIGINT, SIGQUIT, SIGTERM, or the plugin finishing on its own.
async fn shutdown_signal(plugin: &Plugin) {
    let mut done = plugin.done();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("unable to register SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        let mut sigquit = match signal(SignalKind::quit()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("unable to register SIGQUIT handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
            _ = sigquit.recv() => {}
            _ = done.changed() => {}
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = done.changed() => {}
        }
    }
}
