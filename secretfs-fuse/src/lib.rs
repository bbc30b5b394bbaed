//! FUSE filesystem for secretfs.
//!
//! Presents one directory per registered volume under the mount root; each
//! key of the volume's secret appears as a regular read-only file:
//!
//! ```text
//! /<mount-dir>/
//! ├── db@2/                 one directory per mounted volume
//! │   ├── username          one file per secret key
//! │   ├── password
//! │   └── .version-metadata-version
//! └── api-token/
//!     └── token
//! ```
//!
//! Directory contents are materialised lazily: `readdir` forces a backend
//! refresh, `lookup` serves from the handle's cache while fresh. Opening a
//! file captures an immutable copy of its bytes, so reads through one file
//! descriptor are stable across refreshes.

pub mod fs;
pub mod tree;

pub use fs::{Fs, FsConfig};
pub use tree::Tree;
