#![warn(missing_docs)]

//! Coffre storage subsystem: durable, content-addressed blob stores.
//!
//! This crate is the substrate the repository layer builds on. It defines
//! the pluggable [`Backend`] contract with its three namespaces (packfiles,
//! states, locks), the atomic write-rename installation discipline, the
//! two-level hex bucketed layout for large flat namespaces, and the
//! built-in backends: `fs`, `null`, `ptar`, `rpc` and (behind the `sftp`
//! feature) `sftp`.

pub mod atomic;
pub mod backend;
pub mod buckets;
pub mod cancel;
pub mod error;
pub mod fs;
pub mod mac;
pub mod null;
pub mod ptar;
pub mod rpc;
pub mod rpc_server;

#[cfg(feature = "sftp")]
pub mod sftp;

pub use backend::{create_store, open_store, register, Backend, Mode, Namespace, StoreConfig};
pub use cancel::{cancel_pair, CancelHandle, CancelToken};
pub use error::{StorageError, StorageResult};
pub use mac::Mac;
