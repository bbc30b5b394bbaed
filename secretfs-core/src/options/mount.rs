//! Ownership and modes of the per-volume directory and its field files.

use serde::{Deserialize, Serialize};

use super::{parse_int, parse_mode, OptMap};
use crate::error::SecretError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountOptions {
    pub uid: u32,
    pub gid: u32,
    /// Mode of the volume directory node.
    pub dir_mode: u32,
    /// Mode of each field file node.
    pub file_mode: u32,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            uid: 0,
            gid: 0,
            dir_mode: 0o550,
            file_mode: 0o440,
        }
    }
}

impl MountOptions {
    pub fn apply_volume_opts(&mut self, opts: &OptMap) -> Result<(), SecretError> {
        if let Some(v) = parse_int(opts, "mount-uid")? {
            self.uid = v;
        }
        if let Some(v) = parse_int(opts, "mount-gid")? {
            self.gid = v;
        }
        if let Some(v) = parse_mode(opts, "mount-mode")? {
            self.dir_mode = v;
        }
        if let Some(v) = parse_mode(opts, "field-mount-mode")? {
            self.file_mode = v;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(pairs: &[(&str, &str)]) -> OptMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults() {
        let m = MountOptions::default();
        assert_eq!(m.dir_mode, 0o550);
        assert_eq!(m.file_mode, 0o440);
    }

    #[test]
    fn modes_parse_as_octal() {
        let mut m = MountOptions::default();
        m.apply_volume_opts(&opts(&[("mount-mode", "750"), ("field-mount-mode", "600")]))
            .unwrap();
        assert_eq!(m.dir_mode, 0o750);
        assert_eq!(m.file_mode, 0o600);
    }

    #[test]
    fn uid_gid_parse_as_decimal() {
        let mut m = MountOptions::default();
        m.apply_volume_opts(&opts(&[("mount-uid", "1000"), ("mount-gid", "984")]))
            .unwrap();
        assert_eq!(m.uid, 1000);
        assert_eq!(m.gid, 984);
    }

    #[test]
    fn bad_mode_names_field() {
        let mut m = MountOptions::default();
        let err = m
            .apply_volume_opts(&opts(&[("mount-mode", "rwxr-x---")]))
            .unwrap_err();
        assert!(err.to_string().contains("mount-mode"));
    }
}
