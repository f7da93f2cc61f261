//! A POSIX-like FUSE file system backed by an S3-compatible object store.
//!
//! The crate is organized bottom-up: [`pagemap`] and [`headers`] are
//! dependency-free leaves; [`statcache`], [`workerpool`] and [`retry`] build
//! on them; [`transport`] and [`credentials`] talk to the object store;
//! [`multipart`] and [`fdcache`] combine those into the open-file lifecycle;
//! [`fs`] is the path-addressed facade; [`fuse_adapter`] is the only piece
//! that knows about `fuser`'s inode-based kernel protocol.

pub mod config;
pub mod credentials;
pub mod error;
pub mod fdcache;
pub mod fs;
pub mod fuse_adapter;
pub mod headers;
pub mod multipart;
pub mod pagemap;
pub mod retry;
pub mod statcache;
pub mod transport;
pub mod workerpool;
pub mod xml;

pub use config::Config;
pub use error::{FsError, Result};
