//! Plugin lifecycle: driver + provider + listener with idempotent cleanup.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use tokio::sync::{watch, Mutex};
use tracing::{error, info};

use secretfs_core::options::VolumeOptions;
use secretfs_fuse::{Fs, FsConfig};

use crate::driver::{DriverConfig, VolumeDriver};
use crate::provider::SecretProvider;
use crate::server::{self, Listener, ListenerConfig, PluginState};
use crate::types::{PluginManifest, IMPLEMENTS_SECRET_PROVIDER, IMPLEMENTS_VOLUME_DRIVER};

#[derive(Debug, Clone)]
pub struct PluginConfig {
    pub listener: ListenerConfig,

    pub volume_driver_disabled: bool,
    pub volume_driver_global_scope: bool,
    pub state_file: PathBuf,
    pub fs: FsConfig,

    pub secret_provider_disabled: bool,

    /// Daemon-level option defaults for volumes and provider requests.
    pub defaults: VolumeOptions,
}

pub struct Plugin {
    driver: Option<Arc<VolumeDriver>>,
    listener: std::sync::Mutex<Option<Listener>>,
    state: Arc<PluginState>,
    shutdown_tx: watch::Sender<bool>,
    cleanup_lock: Mutex<()>,
    done_tx: watch::Sender<bool>,
}

impl Plugin {
    /// Construct the enabled surfaces and bind the listener. Nothing is
    /// served or mounted yet.
    pub async fn new(config: PluginConfig) -> anyhow::Result<Arc<Self>> {
        let mut implements = Vec::new();

        let driver = if config.volume_driver_disabled {
            None
        } else {
            implements.push(IMPLEMENTS_VOLUME_DRIVER);
            let fs = Arc::new(Fs::new(
                config.fs.clone(),
                tokio::runtime::Handle::current(),
            ));
            Some(Arc::new(VolumeDriver::new(
                DriverConfig {
                    global_scope: config.volume_driver_global_scope,
                    state_file: config.state_file.clone(),
                    defaults: config.defaults.clone(),
                },
                fs,
            )))
        };

        let provider = if config.secret_provider_disabled {
            None
        } else {
            implements.push(IMPLEMENTS_SECRET_PROVIDER);
            Some(SecretProvider::new(config.defaults.clone()))
        };

        let listener = Listener::bind(config.listener)
            .await
            .context("create plugin listener")?;

        let state = Arc::new(PluginState {
            driver: driver.clone(),
            provider,
            manifest: PluginManifest { implements },
        });

        let (shutdown_tx, _) = watch::channel(false);
        let (done_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            driver,
            listener: std::sync::Mutex::new(Some(listener)),
            state,
            shutdown_tx,
            cleanup_lock: Mutex::new(()),
            done_tx,
        }))
    }

    /// Initialize the driver (restore + mount) and start serving. Both the
    /// driver finishing and the listener terminating trigger cleanup.
    pub async fn initialize(self: Arc<Self>) -> anyhow::Result<()> {
        if let Some(driver) = &self.driver {
            Arc::clone(driver)
                .initialize()
                .await
                .context("initialize volume driver")?;

            let plugin = Arc::clone(&self);
            let mut driver_done = driver.done();
            tokio::spawn(async move {
                if driver_done.changed().await.is_ok() {
                    info!("volume driver closed");
                    plugin.cleanup().await;
                }
            });
        }

        let listener = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .context("plugin already initialized")?;
        let router = server::router(Arc::clone(&self.state));
        let shutdown = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            match listener.serve(router, shutdown).await {
                Ok(()) => info!("plugin serve completed"),
                Err(e) => error!("plugin serve completed with error: {e}"),
            }
            self.cleanup().await;
        });

        Ok(())
    }

    /// Idempotent teardown: stop the listener, clean the driver up, signal
    /// done. Safe to call from any of the termination paths concurrently.
    pub async fn cleanup(&self) {
        let Ok(_guard) = self.cleanup_lock.try_lock() else {
            return;
        };

        let _ = self.shutdown_tx.send(true);
        if let Some(driver) = &self.driver {
            driver.cleanup().await;
        }
        let _ = self.done_tx.send(true);
    }

    /// Resolves once cleanup has completed.
    pub fn done(&self) -> watch::Receiver<bool> {
        self.done_tx.subscribe()
    }
}
