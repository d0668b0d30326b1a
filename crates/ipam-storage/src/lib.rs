//! ipam-storage - storage abstraction and redb backend
//!
//! This crate provides:
//! - `KVStore` trait for storage abstraction
//! - a redb-based implementation
//! - canonical object-name encoding shared by the pool store and overlap
//!   registry

pub mod encoding;
pub mod error;
pub mod kv;
pub mod redb_backend;

pub use encoding::{encode_object_name, namespaced_key, namespaced_prefix};
pub use error::{Result, StorageError};
pub use kv::{KVStore, Transaction};
pub use redb_backend::RedbBackend;
