//! A two-tier cache with per-observer fetch coordination.
//!
//! [`Picassiette`] hands out values for string keys. Values are looked up in a bounded in-memory
//! cache first, then in a bounded persistent store on disk, and are otherwise produced by a
//! caller-supplied blocking producer. Results are delivered to a [`Target`] on a single serialized
//! delivery context, and a target only ever receives the result of the request it is currently
//! bound to.
//!
//! See the [`caching`] module for the cache layers and the [`fetch`] module for the task
//! lifecycle.

#[macro_use]
pub mod metrics;

pub mod bitmap;
pub mod caching;
pub mod config;
pub mod fetch;
pub mod logging;


pub use bitmap::Bitmap;
pub use caching::{BinaryCodec, BinaryPayload, CacheEngine, CacheError, Codec, JsonCodec, Payload};
pub use fetch::{
    BuildError, Dispatcher, Picassiette, PicassietteBuilder, ResourceExhausted, SerialDispatcher,
    Target, TargetHandle,
};
