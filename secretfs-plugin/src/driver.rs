//! The volume registry: canonical set of volumes, crash-safe persistence,
//! and the operations behind the `VolumeDriver.*` endpoints.

use std::collections::HashMap;
use std::io::Write as _;
use std::os::unix::fs::{OpenOptionsExt as _, PermissionsExt as _};
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, error, info};

use secretfs_core::options::{OptMap, VolumeOptions};
use secretfs_core::SecretError;
use secretfs_fuse::Fs;

use crate::volume::Volume;

/// One persisted registry entry: the volume name and its fully resolved
/// options. Unknown fields in older or newer state files are ignored.
#[derive(Debug, Serialize, Deserialize)]
pub struct VolumeRecord {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "OptDocker")]
    pub options: VolumeOptions,
}

#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub global_scope: bool,
    pub state_file: PathBuf,
    /// Daemon-level defaults that per-volume `Opts` overlay.
    pub defaults: VolumeOptions,
}

pub struct VolumeDriver {
    config: DriverConfig,
    fs: Arc<Fs>,
    volumes: RwLock<HashMap<String, Arc<Volume>>>,
    cleanup_lock: Mutex<()>,
    done_tx: watch::Sender<bool>,
}

impl VolumeDriver {
    pub fn new(config: DriverConfig, fs: Arc<Fs>) -> Self {
        let (done_tx, _) = watch::channel(false);
        Self {
            config,
            fs,
            volumes: RwLock::new(HashMap::new()),
            cleanup_lock: Mutex::new(()),
            done_tx,
        }
    }

    pub fn fs(&self) -> &Arc<Fs> {
        &self.fs
    }

    /// Resolves to `true` once cleanup has run.
    pub fn done(&self) -> watch::Receiver<bool> {
        self.done_tx.subscribe()
    }

    /// Restore the persisted registry, mount the filesystem, and start the
    /// task that reacts to the mount disappearing.
    pub async fn initialize(self: Arc<Self>) -> anyhow::Result<()> {
        if let Err(e) = self.restore_volumes().await {
            self.fs.unmount();
            return Err(anyhow::Error::from(e).context("restore volumes"));
        }

        self.fs.mount()?;

        tokio::spawn(async move {
            self.fs.wait_unmounted().await;
            info!("volume FS unmounted");
            self.cleanup().await;
        });

        Ok(())
    }

    /// Idempotent teardown: unmount the filesystem, force-unmount every
    /// volume, empty the registry, signal done. A second concurrent call
    /// returns immediately.
    pub async fn cleanup(&self) {
        let Ok(_guard) = self.cleanup_lock.try_lock() else {
            return;
        };

        self.fs.unmount();

        let volumes: Vec<Arc<Volume>> = {
            let mut map = self.volumes.write().await;
            map.drain().map(|(_, v)| v).collect()
        };
        for volume in &volumes {
            volume.force_unmount(&self.fs).await;
        }

        let _ = self.done_tx.send(true);
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Serialise the registry to the state file, atomically replacing it.
    /// Callers log failures; a write error never fails the triggering
    /// operation — the in-memory registry stays authoritative.
    async fn backup_volumes(&self) -> Result<(), SecretError> {
        let records: Vec<VolumeRecord> = {
            let volumes = self.volumes.read().await;
            volumes
                .values()
                .map(|v| VolumeRecord {
                    name: v.name().to_string(),
                    options: v.options().clone(),
                })
                .collect()
        };

        let data = serde_json::to_vec(&records)
            .map_err(|e| SecretError::Persistence(format!("serialize volume backup: {e}")))?;

        let state_file = &self.config.state_file;
        if let Some(parent) = state_file.parent() {
            std::fs::create_dir_all(parent)
                .and_then(|_| {
                    std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o770))
                })
                .map_err(|e| SecretError::Persistence(format!("create state directory: {e}")))?;
        }

        // Write-new, rename-over; the file carries credentials and is 0600.
        let tmp = state_file.with_extension("tmp");
        std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&tmp)
            .and_then(|mut f| f.write_all(&data))
            .map_err(|e| SecretError::Persistence(format!("write state file: {e}")))?;
        std::fs::rename(&tmp, state_file)
            .map_err(|e| SecretError::Persistence(format!("replace state file: {e}")))?;

        debug!(state_file = %state_file.display(), volumes = records.len(), "registry persisted");
        Ok(())
    }

    /// Load the registry from the state file. A missing file starts empty;
    /// any record that fails to reconstruct aborts startup. Restored volumes
    /// are not mounted — mounts are initiated by the runtime.
    async fn restore_volumes(&self) -> Result<(), SecretError> {
        let content = match std::fs::read(&self.config.state_file) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(SecretError::Persistence(format!("read volume backup: {e}")));
            }
        };

        let records: Vec<VolumeRecord> = serde_json::from_slice(&content)
            .map_err(|e| SecretError::Persistence(format!("unserialize volume backup: {e}")))?;

        let mut volumes = self.volumes.write().await;
        for record in records {
            record.options.validate()?;
            volumes.insert(
                record.name.clone(),
                Arc::new(Volume::new(record.name, record.options)),
            );
        }
        info!(volumes = volumes.len(), "registry restored");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // VolumeDriver operations
    // -----------------------------------------------------------------------

    pub async fn create(&self, name: &str, opts: &OptMap) -> Result<(), SecretError> {
        {
            let mut volumes = self.volumes.write().await;
            if volumes.contains_key(name) {
                return Err(SecretError::Internal(format!("volume {name} already exists")));
            }
            let options = VolumeOptions::from_volume_opts(name, opts, &self.config.defaults)?;
            volumes.insert(name.to_string(), Arc::new(Volume::new(name, options)));
        }
        info!(volume = name, "volume created");

        if let Err(e) = self.backup_volumes().await {
            error!(error = %e, "unable to backup volumes");
        }
        Ok(())
    }

    pub async fn list(&self) -> Vec<(String, String)> {
        let volumes = self.volumes.read().await;
        let mut entries = Vec::with_capacity(volumes.len());
        for volume in volumes.values() {
            entries.push((volume.name().to_string(), volume.mountpoint().await));
        }
        entries.sort();
        entries
    }

    pub async fn get(&self, name: &str) -> Result<(String, String), SecretError> {
        let volumes = self.volumes.read().await;
        let volume = volumes.get(name).ok_or(SecretError::NotFound)?;
        Ok((volume.name().to_string(), volume.mountpoint().await))
    }

    pub async fn remove(&self, name: &str) -> Result<(), SecretError> {
        {
            let mut volumes = self.volumes.write().await;
            let volume = volumes.get(name).ok_or(SecretError::NotFound)?;
            volume.force_unmount(&self.fs).await;
            volumes.remove(name);
        }
        info!(volume = name, "volume removed");

        if let Err(e) = self.backup_volumes().await {
            error!(error = %e, "unable to backup volumes");
        }
        Ok(())
    }

    pub async fn path(&self, name: &str) -> Result<String, SecretError> {
        let volumes = self.volumes.read().await;
        let volume = volumes.get(name).ok_or(SecretError::NotFound)?;
        Ok(volume.mountpoint().await)
    }

    pub async fn mount(&self, name: &str, request_id: &str) -> Result<String, SecretError> {
        let volumes = self.volumes.read().await;
        let volume = volumes.get(name).ok_or(SecretError::NotFound)?;
        volume.mount(&self.fs, request_id).await
    }

    pub async fn unmount(&self, name: &str, request_id: &str) -> Result<(), SecretError> {
        let volumes = self.volumes.read().await;
        let volume = volumes.get(name).ok_or(SecretError::NotFound)?;
        volume.unmount(&self.fs, request_id).await
    }

    pub fn capabilities(&self) -> &'static str {
        if self.config.global_scope {
            "global"
        } else {
            "local"
        }
    }
}
