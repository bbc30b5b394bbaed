//! The in-memory filesystem tree.
//!
//! One table of live inodes behind a single mutex, in three kinds: the root
//! (ino 1), one directory node per attached volume, and one file node per
//! secret key. Backend fetches never run under the tree lock — a refresh
//! resolves the handle, fetches, then re-takes the lock to install the
//! snapshot.
//!
//! Child identity is stable: a refresh reuses the inode of every key that
//! persists, creates inodes only for new keys, and forgets inodes whose keys
//! disappeared. Open file handles capture the bytes at open time and are
//! untouched by later refreshes.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use fuser::{Errno, FileAttr, FileType, INodeNo};
use tracing::{debug, error, trace};

use secretfs_core::options::MountOptions;
use secretfs_core::{Secret, SecretBody, SecretError};

pub const INO_ROOT: u64 = 1;

/// First inode handed out to volume directories and field files.
const INO_DYNAMIC_START: u64 = 2;

struct DirNode {
    name: String,
    secret: Arc<dyn Secret>,
    mount: MountOptions,
    snapshot_id: Option<String>,
    created_at: Option<SystemTime>,
    atime: Option<SystemTime>,
    children: BTreeMap<String, u64>,
}

struct FileNode {
    bytes: Arc<Vec<u8>>,
    mount: MountOptions,
    created_at: Option<SystemTime>,
    atime: Option<SystemTime>,
}

enum Node {
    Dir(DirNode),
    File(FileNode),
}

#[derive(Default)]
struct TreeState {
    /// Root children: volume name → directory inode.
    dirs: BTreeMap<String, u64>,
    nodes: HashMap<u64, Node>,
    /// Open file handles → byte snapshot captured at open time.
    open_files: HashMap<u64, Arc<Vec<u8>>>,
}

pub struct Tree {
    runtime: tokio::runtime::Handle,
    root_uid: u32,
    root_gid: u32,
    mounted_at: SystemTime,
    next_ino: AtomicU64,
    next_fh: AtomicU64,
    state: Mutex<TreeState>,
}

impl Tree {
    pub fn new(runtime: tokio::runtime::Handle, root_uid: u32, root_gid: u32) -> Self {
        Self {
            runtime,
            root_uid,
            root_gid,
            mounted_at: SystemTime::now(),
            next_ino: AtomicU64::new(INO_DYNAMIC_START),
            next_fh: AtomicU64::new(1),
            state: Mutex::new(TreeState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TreeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn alloc_ino(&self) -> u64 {
        self.next_ino.fetch_add(1, Ordering::SeqCst)
    }

    // -----------------------------------------------------------------------
    // Registry-facing surface
    // -----------------------------------------------------------------------

    /// Attach a volume directory under the root. Fails if the name is taken.
    pub fn add_volume(
        &self,
        name: &str,
        secret: Arc<dyn Secret>,
        mount: &MountOptions,
    ) -> Result<(), SecretError> {
        let mut state = self.lock();
        if state.dirs.contains_key(name) {
            return Err(SecretError::Internal(format!(
                "volume directory {name} already attached"
            )));
        }
        let ino = self.alloc_ino();
        state.dirs.insert(name.to_string(), ino);
        state.nodes.insert(
            ino,
            Node::Dir(DirNode {
                name: name.to_string(),
                secret,
                mount: *mount,
                snapshot_id: None,
                created_at: None,
                atime: None,
                children: BTreeMap::new(),
            }),
        );
        debug!(volume = name, ino, "volume directory attached");
        Ok(())
    }

    /// Detach a volume directory and forget its children. Removing an
    /// unknown name is a no-op returning `false`. Open file handles keep
    /// their snapshots until released.
    pub fn remove_volume(&self, name: &str) -> bool {
        let mut state = self.lock();
        let Some(ino) = state.dirs.remove(name) else {
            return false;
        };
        if let Some(Node::Dir(dir)) = state.nodes.remove(&ino) {
            for child in dir.children.values() {
                state.nodes.remove(child);
            }
        }
        debug!(volume = name, ino, "volume directory detached");
        true
    }

    pub fn volume_count(&self) -> usize {
        self.lock().dirs.len()
    }

    // -----------------------------------------------------------------------
    // Kernel-facing surface (called from the fuser adapter)
    // -----------------------------------------------------------------------

    pub fn lookup(&self, parent: u64, name: &str) -> Result<FileAttr, Errno> {
        if parent == INO_ROOT {
            let state = self.lock();
            let ino = *state.dirs.get(name).ok_or(Errno::ENOENT)?;
            return self.attr_locked(&state, ino).ok_or(Errno::ENOENT);
        }

        self.refresh_dir(parent, false)?;

        let state = self.lock();
        let Some(Node::Dir(dir)) = state.nodes.get(&parent) else {
            return Err(Errno::ENOENT);
        };
        let ino = *dir.children.get(name).ok_or(Errno::ENOENT)?;
        self.attr_locked(&state, ino).ok_or(Errno::ENOENT)
    }

    pub fn getattr(&self, ino: u64) -> Result<FileAttr, Errno> {
        let state = self.lock();
        self.attr_locked(&state, ino).ok_or(Errno::ENOENT)
    }

    pub fn exists(&self, ino: u64) -> bool {
        ino == INO_ROOT || self.lock().nodes.contains_key(&ino)
    }

    pub fn is_dir(&self, ino: u64) -> bool {
        ino == INO_ROOT || matches!(self.lock().nodes.get(&ino), Some(Node::Dir(_)))
    }

    /// Directory listing including `.` and `..`. A volume directory forces a
    /// backend refresh first and stamps its atime.
    pub fn readdir_entries(&self, ino: u64) -> Result<Vec<(u64, FileType, String)>, Errno> {
        if ino == INO_ROOT {
            let state = self.lock();
            let mut entries = vec![
                (INO_ROOT, FileType::Directory, ".".to_string()),
                (INO_ROOT, FileType::Directory, "..".to_string()),
            ];
            for (name, &dir_ino) in &state.dirs {
                entries.push((dir_ino, FileType::Directory, name.clone()));
            }
            return Ok(entries);
        }

        self.refresh_dir(ino, true)?;

        let mut state = self.lock();
        let Some(Node::Dir(dir)) = state.nodes.get_mut(&ino) else {
            return Err(Errno::ENOENT);
        };
        dir.atime = Some(SystemTime::now());

        let mut entries = vec![
            (ino, FileType::Directory, ".".to_string()),
            (INO_ROOT, FileType::Directory, "..".to_string()),
        ];
        for (name, &child) in &dir.children {
            entries.push((child, FileType::RegularFile, name.clone()));
        }
        Ok(entries)
    }

    /// Open a field file: stamp atime and capture an immutable snapshot of
    /// the current bytes under a fresh file handle.
    pub fn open(&self, ino: u64) -> Result<u64, Errno> {
        let mut state = self.lock();
        let snapshot = match state.nodes.get_mut(&ino) {
            Some(Node::File(file)) => {
                file.atime = Some(SystemTime::now());
                Arc::clone(&file.bytes)
            }
            Some(Node::Dir(_)) => return Err(Errno::EISDIR),
            None => return Err(Errno::ENOENT),
        };
        let fh = self.next_fh.fetch_add(1, Ordering::SeqCst);
        state.open_files.insert(fh, snapshot);
        trace!(ino, fh, "field file opened");
        Ok(fh)
    }

    /// Read from an open handle's snapshot. Reads past the end return empty.
    pub fn read(&self, fh: u64, offset: u64, size: u32) -> Result<Vec<u8>, Errno> {
        let state = self.lock();
        let bytes = state.open_files.get(&fh).ok_or(Errno::EBADF)?;
        let start = (offset as usize).min(bytes.len());
        let end = (start + size as usize).min(bytes.len());
        Ok(bytes[start..end].to_vec())
    }

    pub fn release(&self, fh: u64) {
        self.lock().open_files.remove(&fh);
    }

    pub fn file_count(&self) -> u64 {
        self.lock()
            .nodes
            .values()
            .filter(|n| matches!(n, Node::File(_)))
            .count() as u64
    }

    // -----------------------------------------------------------------------
    // Refresh
    // -----------------------------------------------------------------------

    /// Refresh a volume directory through its secret handle. On not-found the
    /// local cache is dropped and ENOENT returned; on any other error the
    /// cache is dropped and EIO returned. The directory itself stays attached
    /// either way.
    fn refresh_dir(&self, dir_ino: u64, no_cache: bool) -> Result<(), Errno> {
        let secret = {
            let state = self.lock();
            match state.nodes.get(&dir_ino) {
                Some(Node::Dir(dir)) => Arc::clone(&dir.secret),
                _ => return Err(Errno::ENOENT),
            }
        };

        match self.runtime.block_on(secret.fetch(no_cache)) {
            Ok(body) => {
                let mut state = self.lock();
                self.install_locked(&mut state, dir_ino, &body)
            }
            Err(e) => {
                let mut state = self.lock();
                self.invalidate_locked(&mut state, dir_ino);
                match e {
                    SecretError::NotFound => Err(Errno::ENOENT),
                    other => {
                        error!(error = %other, "unable to refresh secret directory");
                        Err(Errno::EIO)
                    }
                }
            }
        }
    }

    /// Install a fetched snapshot: no-op when the unique id is unchanged,
    /// otherwise reuse persisting child inodes, create new ones, forget
    /// vanished ones.
    fn install_locked(
        &self,
        state: &mut TreeState,
        dir_ino: u64,
        body: &SecretBody,
    ) -> Result<(), Errno> {
        struct Update {
            ino: u64,
            bytes: Arc<Vec<u8>>,
            is_new: bool,
        }

        let (updates, removed, created_at, mount) = {
            let Some(Node::Dir(dir)) = state.nodes.get_mut(&dir_ino) else {
                return Err(Errno::ENOENT);
            };
            if dir.snapshot_id.as_deref() == Some(body.unique_id()) {
                return Ok(());
            }
            dir.snapshot_id = Some(body.unique_id().to_string());
            dir.created_at = body.created_at().map(SystemTime::from);

            let mut children = BTreeMap::new();
            let mut updates = Vec::with_capacity(body.len());
            for key in body.keys() {
                let bytes = Arc::new(
                    body.value(key)
                        .unwrap_or_default()
                        .as_bytes()
                        .to_vec(),
                );
                let (ino, is_new) = match dir.children.get(key) {
                    Some(&ino) => (ino, false),
                    None => (self.alloc_ino(), true),
                };
                children.insert(key.to_string(), ino);
                updates.push(Update { ino, bytes, is_new });
            }

            let kept: HashSet<u64> = children.values().copied().collect();
            let removed: Vec<u64> = dir
                .children
                .values()
                .copied()
                .filter(|ino| !kept.contains(ino))
                .collect();

            trace!(
                volume = %dir.name,
                keys = children.len(),
                forgotten = removed.len(),
                "secret directory snapshot installed"
            );

            dir.children = children;
            (updates, removed, dir.created_at, dir.mount)
        };

        for ino in removed {
            state.nodes.remove(&ino);
        }
        for update in updates {
            match state.nodes.get_mut(&update.ino) {
                Some(Node::File(file)) => {
                    file.bytes = update.bytes;
                    file.created_at = created_at;
                }
                _ if update.is_new => {
                    state.nodes.insert(
                        update.ino,
                        Node::File(FileNode {
                            bytes: update.bytes,
                            mount,
                            created_at,
                            atime: None,
                        }),
                    );
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn invalidate_locked(&self, state: &mut TreeState, dir_ino: u64) {
        let children: Vec<u64> = {
            let Some(Node::Dir(dir)) = state.nodes.get_mut(&dir_ino) else {
                return;
            };
            dir.snapshot_id = None;
            dir.created_at = None;
            std::mem::take(&mut dir.children).into_values().collect()
        };
        for ino in children {
            state.nodes.remove(&ino);
        }
    }

    // -----------------------------------------------------------------------
    // Attributes
    // -----------------------------------------------------------------------

    fn attr_locked(&self, state: &TreeState, ino: u64) -> Option<FileAttr> {
        if ino == INO_ROOT {
            return Some(make_attr(
                ino,
                FileType::Directory,
                0o550,
                4096,
                2,
                self.root_uid,
                self.root_gid,
                self.mounted_at,
                self.mounted_at,
            ));
        }
        match state.nodes.get(&ino)? {
            Node::Dir(dir) => Some(make_attr(
                ino,
                FileType::Directory,
                dir.mount.dir_mode as u16,
                4096,
                2,
                dir.mount.uid,
                dir.mount.gid,
                dir.atime.unwrap_or(UNIX_EPOCH),
                dir.created_at.unwrap_or(UNIX_EPOCH),
            )),
            Node::File(file) => Some(make_attr(
                ino,
                FileType::RegularFile,
                file.mount.file_mode as u16,
                file.bytes.len() as u64,
                1,
                file.mount.uid,
                file.mount.gid,
                file.atime.unwrap_or(UNIX_EPOCH),
                file.created_at.unwrap_or(UNIX_EPOCH),
            )),
        }
    }
}

impl std::fmt::Debug for Tree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("Tree")
            .field("volumes", &state.dirs.len())
            .field("nodes", &state.nodes.len())
            .field("open_files", &state.open_files.len())
            .finish()
    }
}

#[allow(clippy::too_many_arguments)]
fn make_attr(
    ino: u64,
    kind: FileType,
    perm: u16,
    size: u64,
    nlink: u32,
    uid: u32,
    gid: u32,
    atime: SystemTime,
    mtime: SystemTime,
) -> FileAttr {
    FileAttr {
        ino: INodeNo(ino),
        size,
        blocks: size.div_ceil(512),
        atime,
        mtime,
        ctime: mtime,
        crtime: UNIX_EPOCH,
        kind,
        perm,
        nlink,
        uid,
        gid,
        rdev: 0,
        blksize: 4096,
        flags: 0,
    }
}
