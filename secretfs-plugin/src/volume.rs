//! One managed secret volume and its reference-counted mounts.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use secretfs_core::options::VolumeOptions;
use secretfs_core::{Secret, SecretError};
use secretfs_fuse::Fs;
use secretfs_vault::VaultSecret;

/// Construct the secret handle for a resolved option set. The single seam
/// where a backend kind is chosen; today every option set resolves to Vault.
pub(crate) async fn new_secret(options: &VolumeOptions) -> Result<Arc<dyn Secret>, SecretError> {
    Ok(Arc::new(VaultSecret::new(options).await?))
}

#[derive(Default)]
struct MountState {
    /// Container-runtime claims on this volume; the volume is "in use" while
    /// any id is present.
    request_ids: HashSet<String>,
    secret: Option<Arc<dyn Secret>>,
    mount_path: Option<PathBuf>,
}

pub struct Volume {
    name: String,
    options: VolumeOptions,
    state: Mutex<MountState>,
}

impl Volume {
    pub fn new(name: impl Into<String>, options: VolumeOptions) -> Self {
        Self {
            name: name.into(),
            options,
            state: Mutex::new(MountState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &VolumeOptions {
        &self.options
    }

    /// Mount path while mounted, empty string otherwise (protocol shape).
    pub async fn mountpoint(&self) -> String {
        self.state
            .lock()
            .await
            .mount_path
            .as_deref()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Register a mount claim. The first claim constructs the secret handle
    /// and attaches the volume directory; repeated claims with the same id
    /// are accepted silently.
    pub async fn mount(&self, fs: &Fs, request_id: &str) -> Result<String, SecretError> {
        let mut state = self.state.lock().await;

        if state.request_ids.is_empty() {
            let secret = new_secret(&self.options).await?;
            if let Err(e) = fs
                .tree()
                .add_volume(&self.name, Arc::clone(&secret), &self.options.mount)
            {
                secret.close().await;
                return Err(e);
            }
            state.secret = Some(secret);
            state.mount_path = Some(fs.mount_dir().join(&self.name));
        }

        state.request_ids.insert(request_id.to_string());
        debug!(volume = %self.name, request_id, claims = state.request_ids.len(), "volume mounted");

        state
            .mount_path
            .as_deref()
            .map(|p| p.to_string_lossy().into_owned())
            .ok_or_else(|| SecretError::Internal("mounted volume has no mount path".to_string()))
    }

    /// Drop one mount claim. The last claim detaches the volume directory
    /// and closes the secret handle.
    pub async fn unmount(&self, fs: &Fs, request_id: &str) -> Result<(), SecretError> {
        let mut state = self.state.lock().await;

        if !state.request_ids.remove(request_id) {
            return Err(SecretError::Internal(format!(
                "unable to find mount request id {request_id}"
            )));
        }

        if state.request_ids.is_empty() {
            self.teardown(fs, &mut state).await;
        }
        debug!(volume = %self.name, request_id, claims = state.request_ids.len(), "volume unmounted");
        Ok(())
    }

    /// Unconditionally drop every claim and detach. Used on volume removal
    /// and daemon shutdown.
    pub async fn force_unmount(&self, fs: &Fs) {
        let mut state = self.state.lock().await;
        if !state.request_ids.is_empty() {
            state.request_ids.clear();
            self.teardown(fs, &mut state).await;
            debug!(volume = %self.name, "volume force-unmounted");
        }
    }

    async fn teardown(&self, fs: &Fs, state: &mut MountState) {
        fs.tree().remove_volume(&self.name);
        state.mount_path = None;
        if let Some(secret) = state.secret.take() {
            secret.close().await;
        }
    }
}

impl std::fmt::Debug for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("name", &self.name)
            .field("secret_path", &self.options.secret.path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secretfs_core::options::OptMap;
    use secretfs_fuse::FsConfig;

    fn test_options(name: &str) -> VolumeOptions {
        let mut defaults = VolumeOptions::default();
        defaults.http.address = format!("http://volume-tests-{name}.invalid:8200");
        defaults.auth.token = Some("s.test".to_string());
        VolumeOptions::from_volume_opts(name, &OptMap::new(), &defaults).unwrap()
    }

    fn test_fs(dir: &std::path::Path) -> Fs {
        Fs::new(
            FsConfig {
                fuse_name: "secretfs-test".to_string(),
                mount_dir: dir.join("mnt"),
                uid: 0,
                gid: 0,
            },
            tokio::runtime::Handle::current(),
        )
    }

    #[tokio::test]
    async fn refcounted_mount_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let fs = test_fs(dir.path());
        let volume = Volume::new("db@2", test_options("db@2"));

        assert_eq!(volume.mountpoint().await, "");

        let path = volume.mount(&fs, "A").await.unwrap();
        assert!(path.ends_with("mnt/db@2"));
        assert_eq!(fs.tree().volume_count(), 1);

        volume.mount(&fs, "B").await.unwrap();
        assert_eq!(fs.tree().volume_count(), 1);

        // First claim released: directory stays.
        volume.unmount(&fs, "A").await.unwrap();
        assert_eq!(fs.tree().volume_count(), 1);
        assert!(!volume.mountpoint().await.is_empty());

        // Last claim released: directory removed, mountpoint cleared.
        volume.unmount(&fs, "B").await.unwrap();
        assert_eq!(fs.tree().volume_count(), 0);
        assert_eq!(volume.mountpoint().await, "");
    }

    #[tokio::test]
    async fn repeated_mount_with_same_id_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let fs = test_fs(dir.path());
        let volume = Volume::new("db", test_options("db"));

        volume.mount(&fs, "A").await.unwrap();
        volume.mount(&fs, "A").await.unwrap();

        // One claim: a single unmount tears everything down.
        volume.unmount(&fs, "A").await.unwrap();
        assert_eq!(fs.tree().volume_count(), 0);
    }

    #[tokio::test]
    async fn unmount_with_unknown_id_fails() {
        let dir = tempfile::tempdir().unwrap();
        let fs = test_fs(dir.path());
        let volume = Volume::new("db", test_options("db"));

        volume.mount(&fs, "A").await.unwrap();
        let err = volume.unmount(&fs, "Z").await.unwrap_err();
        assert!(err.to_string().contains("mount request id"));

        // The failed unmount left the claim intact.
        assert_eq!(fs.tree().volume_count(), 1);
        volume.unmount(&fs, "A").await.unwrap();
    }

    #[tokio::test]
    async fn force_unmount_clears_all_claims() {
        let dir = tempfile::tempdir().unwrap();
        let fs = test_fs(dir.path());
        let volume = Volume::new("db", test_options("db"));

        volume.mount(&fs, "A").await.unwrap();
        volume.mount(&fs, "B").await.unwrap();

        volume.force_unmount(&fs).await;
        assert_eq!(fs.tree().volume_count(), 0);
        assert_eq!(volume.mountpoint().await, "");

        // Idempotent on an unmounted volume.
        volume.force_unmount(&fs).await;
    }

    #[tokio::test]
    async fn remount_after_full_unmount_works() {
        let dir = tempfile::tempdir().unwrap();
        let fs = test_fs(dir.path());
        let volume = Volume::new("db", test_options("db"));

        volume.mount(&fs, "A").await.unwrap();
        volume.unmount(&fs, "A").await.unwrap();

        let path = volume.mount(&fs, "B").await.unwrap();
        assert!(path.ends_with("mnt/db"));
        assert_eq!(fs.tree().volume_count(), 1);
        volume.unmount(&fs, "B").await.unwrap();
    }
}
