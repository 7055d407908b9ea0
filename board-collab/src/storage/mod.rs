//! Local durable state owned by one client process.
//!
//! ```text
//! ┌──────────────┐   snapshot    ┌──────────────────────────────────────┐
//! │ ReplicaSet   │ ────────────► │ LocalStore (RocksDB)                 │
//! └──────────────┘               │ CF "snapshots" board → lz4 JSON      │
//! ┌──────────────┐   append      │ CF "pending"   seq (BE) → change     │
//! │ OfflineQueue │ ────────────► │ CF "meta"      last sync timestamp   │
//! └──────────────┘               └──────────────────────────────────────┘
//! ```
//!
//! Everything is read synchronously at startup; no other process writes it.

pub mod local;

pub use local::{LocalStore, StoreConfig};
