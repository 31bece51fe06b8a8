//! hivegrid-state — embedded persistence store for hivegrid.
//!
//! Backed by [redb](https://docs.rs/redb), holds the durable mirror of the
//! pool topology: node configs, worker configs, a bounded history of
//! metrics snapshots, and the monotonic id counters.
//!
//! # Architecture
//!
//! Domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Nodes and workers are keyed by their string ids; snapshots are keyed by
//! a monotone `u64` sequence so FIFO eviction is a prefix delete.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{SNAPSHOT_CAPACITY, StateStore};
pub use types::*;
