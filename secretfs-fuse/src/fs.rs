//! Mount plumbing and the fuser adapter.
//!
//! `Filesystem` in fuser 0.17 takes `&self`; all state lives in [`Tree`]
//! behind its own lock, so the adapter is a thin translation layer between
//! kernel requests and tree operations.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt as _;
use std::os::unix::fs::PermissionsExt as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context as _;
use fuser::{
    AccessFlags, BackgroundSession, Config, FileHandle, Filesystem, FopenFlags, Generation,
    INodeNo, LockOwner, MountOption, OpenFlags, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyStatfs, Request, SessionACL,
};
use tracing::{debug, info, warn};

use crate::tree::Tree;

/// Kernel-side cache TTL for entries and attributes.
const TTL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct FsConfig {
    /// fsname reported in the mount table.
    pub fuse_name: String,
    /// Directory the filesystem is mounted on; volumes appear one level
    /// below it.
    pub mount_dir: PathBuf,
    /// Owner of the mount directory and the root node.
    pub uid: u32,
    pub gid: u32,
}

/// The mounted filesystem. Mount and unmount are idempotent; the volume
/// registry manipulates the tree through [`Fs::tree`].
pub struct Fs {
    config: FsConfig,
    tree: Arc<Tree>,
    session: Mutex<Option<BackgroundSession>>,
}

impl Fs {
    pub fn new(config: FsConfig, runtime: tokio::runtime::Handle) -> Self {
        let tree = Arc::new(Tree::new(runtime, config.uid, config.gid));
        Self {
            config,
            tree,
            session: Mutex::new(None),
        }
    }

    pub fn tree(&self) -> &Arc<Tree> {
        &self.tree
    }

    pub fn mount_dir(&self) -> &Path {
        &self.config.mount_dir
    }

    pub fn is_mounted(&self) -> bool {
        self.session.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Mount the filesystem. Defensively unmounts any stale instance first,
    /// then creates the mount directory with mode 0550 and the configured
    /// owner.
    pub fn mount(&self) -> anyhow::Result<()> {
        let mut session = self.session.lock().unwrap_or_else(|e| e.into_inner());
        if session.is_some() {
            return Ok(());
        }

        // A stale mount from a crashed instance makes the new mount fail with
        // ENOTCONN. A non-zero exit just means nothing was mounted; failing
        // to run fusermount at all is fatal.
        std::process::Command::new("fusermount")
            .args(["-u", &self.config.mount_dir.to_string_lossy()])
            .output()
            .context("assert FS directory is unmounted")?;

        std::fs::create_dir_all(&self.config.mount_dir)
            .with_context(|| format!("create FS mount directory {:?}", self.config.mount_dir))?;
        std::fs::set_permissions(
            &self.config.mount_dir,
            std::fs::Permissions::from_mode(0o550),
        )
        .context("set FS mount directory mode")?;
        chown_best_effort(&self.config.mount_dir, self.config.uid, self.config.gid);

        let mut fuse_config = Config::default();
        fuse_config.mount_options = vec![
            MountOption::RO,
            MountOption::FSName(self.config.fuse_name.clone()),
        ];
        // Containers run under arbitrary uids but must still traverse the
        // mounted volumes.
        fuse_config.acl = SessionACL::All;

        let fs = TreeFs(Arc::clone(&self.tree));
        let new_session = fuser::spawn_mount2(fs, &self.config.mount_dir, &fuse_config)
            .with_context(|| format!("mount FUSE at {:?}", self.config.mount_dir))?;

        info!(mount_dir = %self.config.mount_dir.display(), "volume FS mounted");
        *session = Some(new_session);
        Ok(())
    }

    /// Unmount. Dropping the background session performs the kernel unmount;
    /// `fusermount -u` covers a mount that outlived the session (e.g. after
    /// a panic on the session thread).
    pub fn unmount(&self) {
        let taken = self
            .session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if taken.is_none() {
            return;
        }
        drop(taken);

        let _ = std::process::Command::new("fusermount")
            .args(["-u", &self.config.mount_dir.to_string_lossy()])
            .output();
        info!(mount_dir = %self.config.mount_dir.display(), "volume FS unmounted");
    }

    /// Resolve once the kernel mount is gone — whether through [`Fs::unmount`]
    /// or an external `fusermount -u` / `umount`.
    pub async fn wait_unmounted(&self) {
        loop {
            tokio::time::sleep(Duration::from_secs(2)).await;
            if !self.is_mounted() {
                return;
            }
            if !mount_table_contains(&self.config.mount_dir) {
                debug!(mount_dir = %self.config.mount_dir.display(), "mount disappeared from mount table");
                return;
            }
        }
    }
}

fn chown_best_effort(path: &Path, uid: u32, gid: u32) {
    let Ok(cpath) = std::ffi::CString::new(path.as_os_str().as_bytes()) else {
        return;
    };
    // SAFETY: cpath is a valid NUL-terminated path.
    let ret = unsafe { libc::chown(cpath.as_ptr(), uid, gid) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        warn!(path = %path.display(), uid, gid, "chown mount directory failed (non-fatal): {err}");
    }
}

fn mount_table_contains(dir: &Path) -> bool {
    let Ok(mounts) = std::fs::read_to_string("/proc/self/mounts") else {
        return false;
    };
    let needle = dir.to_string_lossy();
    mounts
        .lines()
        .any(|line| line.split_whitespace().nth(1) == Some(needle.as_ref()))
}

/// Newtype so the shared tree can be handed to fuser as a `Filesystem`.
struct TreeFs(Arc<Tree>);

impl Filesystem for TreeFs {
    fn lookup(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEntry) {
        let Some(name) = name.to_str() else {
            reply.error(fuser::Errno::ENOENT);
            return;
        };
        match self.0.lookup(parent.0, name) {
            Ok(attr) => reply.entry(&TTL, &attr, Generation(0)),
            Err(errno) => reply.error(errno),
        }
    }

    fn getattr(&self, _req: &Request, ino: INodeNo, _fh: Option<FileHandle>, reply: ReplyAttr) {
        match self.0.getattr(ino.0) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(errno) => reply.error(errno),
        }
    }

    fn access(&self, _req: &Request, ino: INodeNo, _mask: AccessFlags, reply: ReplyEmpty) {
        if self.0.exists(ino.0) {
            reply.ok();
        } else {
            reply.error(fuser::Errno::ENOENT);
        }
    }

    fn open(&self, _req: &Request, ino: INodeNo, _flags: OpenFlags, reply: ReplyOpen) {
        match self.0.open(ino.0) {
            // No FOPEN_DIRECT_IO: it would prevent the files from being
            // memory mapped.
            Ok(fh) => reply.opened(FileHandle(fh), FopenFlags::empty()),
            Err(errno) => reply.error(errno),
        }
    }

    fn opendir(&self, _req: &Request, ino: INodeNo, _flags: OpenFlags, reply: ReplyOpen) {
        if self.0.is_dir(ino.0) {
            reply.opened(FileHandle(0), FopenFlags::empty());
        } else {
            reply.error(fuser::Errno::ENOENT);
        }
    }

    fn read(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        offset: u64,
        size: u32,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        reply: ReplyData,
    ) {
        match self.0.read(fh.0, offset, size) {
            Ok(bytes) => reply.data(&bytes),
            Err(errno) => reply.error(errno),
        }
    }

    fn release(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.0.release(fh.0);
        reply.ok();
    }

    fn readdir(
        &self,
        _req: &Request,
        ino: INodeNo,
        _fh: FileHandle,
        offset: u64,
        mut reply: ReplyDirectory,
    ) {
        let entries = match self.0.readdir_entries(ino.0) {
            Ok(entries) => entries,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        for (i, (child_ino, kind, name)) in entries.iter().enumerate() {
            if (i as u64) < offset {
                continue;
            }
            if reply.add(INodeNo(*child_ino), (i + 1) as u64, *kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&self, _req: &Request, _ino: INodeNo, reply: ReplyStatfs) {
        // blocks=0 (virtual), bfree/bavail=0 (read-only), namelen=255
        reply.statfs(0, 0, 0, self.0.file_count(), 0, 4096, 255, 0);
    }
}
