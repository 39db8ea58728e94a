//! # Caching infrastructure
//!
//! Every value handed out by [`Picassiette`](crate::Picassiette) goes through two cache layers
//! before the producer is ever invoked. This module contains both layers, the [`CacheEngine`] that
//! composes them, and our central [`CacheError`] type.
//!
//! ## Cache Layers
//!
//! - An in-memory layer ([`MemoryCache`]), bounded by a caller-defined size function and evicting
//!   the least recently used entries first.
//! - A file-system layer ([`PersistentStore`]), bounded in bytes, also evicting the least recently
//!   used entries first. It is only present if a cache directory is configured.
//!
//! A cache request goes through the following steps:
//! - First, it goes through the in-memory layer.
//! - On miss, it will try to load the entry from the file-system, if enabled. A hit is promoted
//!   into the in-memory layer.
//! - On miss, the fetch task runs the producer and stores the fresh value in memory.
//!
//! The file-system layer is never written directly. Entries reach it when they are evicted from
//! memory ("write-back"), which happens on the blocking pool and is tracked so that it can be
//! awaited with [`CacheEngine::flush`]. Every eviction carries a version, and a write-back never
//! replaces a newer version of the same key, whatever order the write-backs land in.
//!
//! ### Persisted layout
//!
//! Logical keys are hashed with SHA-256 ([`CacheKey`]), and each entry lives in a file named
//! `<dir>/aa/bbccdd/eeff...`. Writes go to `<dir>/tmp` first and are then atomically renamed into
//! place. The `tmp` directory is cleared whenever the store is initialized.
//!
//! The recency order of the file-system layer is kept in memory and is rebuilt on startup from the
//! file modification times. Reads touch the `mtime` so that it survives restarts.
//!
//! ### Lifecycle
//!
//! The file-system layer starts out uninitialized and scans its directory on the blocking pool.
//! Until that is done, every read is a miss and every write-back is dropped. A reset wipes the
//! directory and goes through the same initialization again. Resets bump a generation counter, and
//! write-backs of an older generation are discarded, see [`StoreState`].
//!
//! ### Encoding
//!
//! Values are turned into bytes by a [`Codec`], which is chosen once per payload type through the
//! [`Payload`] trait: [`BinaryCodec`] for payloads with their own binary representation, and
//! [`JsonCodec`] for everything else.
//!
//! ### Metrics
//!
//! - `caches.access`: All accesses.
//! - `caches.memory.hit`: Accesses served by the in-memory layer.
//! - `caches.disk.hit` / `caches.disk.miss`: Accesses that reached the file-system layer.
//! - `caches.disk.write`: The number of entries written back to disk.
//! - `caches.disk.size`: A histogram for the size (in bytes) of loaded / written cache files.
//! - `caches.memory.evicted`: Entries evicted from the in-memory layer.

mod cache_error;
mod cache_key;
mod codec;
mod disk;
mod engine;
mod memory;

pub use cache_error::CacheError;
pub use cache_key::CacheKey;
pub use codec::{BinaryCodec, BinaryPayload, Codec, JsonCodec, Payload};
pub use disk::{PersistentStore, StoreState};
pub use engine::CacheEngine;
pub use memory::{Evicted, MemoryCache, Weigher};
