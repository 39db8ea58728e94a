use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::CacheError;

/// Converts payloads to and from the bytes kept in the persistent store.
pub trait Codec<P>: Send + Sync + 'static {
    /// Encodes `value` for the persistent store.
    fn encode(&self, value: &P) -> Result<Vec<u8>, CacheError>;

    /// Decodes a value previously written by [`encode`](Self::encode).
    fn decode(&self, bytes: &[u8]) -> Result<P, CacheError>;
}

/// A payload type that can be held by the cache.
///
/// The associated [`Codec`] decides once, per payload type, how values are persisted: binary
/// payloads use [`BinaryCodec`], everything else typically uses [`JsonCodec`].
pub trait Payload: Clone + Send + Sync + 'static {
    /// The codec used when no explicit codec is configured.
    type Codec: Codec<Self> + Default;

    /// The default "cost" of keeping this value in the in-memory cache.
    ///
    /// This is used when no explicit size function is configured, and defaults to one unit per
    /// entry.
    fn weight(&self) -> u64 {
        1
    }
}

/// A payload with its own binary representation.
pub trait BinaryPayload: Sized {
    /// Writes the binary representation of `self`.
    fn to_bytes(&self) -> Vec<u8>;

    /// Parses the binary representation written by [`to_bytes`](Self::to_bytes).
    fn from_bytes(bytes: &[u8]) -> Result<Self, CacheError>;
}

/// The [`Codec`] for [`BinaryPayload`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct BinaryCodec;

impl<P: BinaryPayload + 'static> Codec<P> for BinaryCodec {
    fn encode(&self, value: &P) -> Result<Vec<u8>, CacheError> {
        Ok(value.to_bytes())
    }

    fn decode(&self, bytes: &[u8]) -> Result<P, CacheError> {
        P::from_bytes(bytes)
    }
}

/// The structured-text [`Codec`], writing values as JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl<P: Serialize + DeserializeOwned + 'static> Codec<P> for JsonCodec {
    fn encode(&self, value: &P) -> Result<Vec<u8>, CacheError> {
        serde_json::to_vec(value).map_err(|e| CacheError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<P, CacheError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl BinaryPayload for Vec<u8> {
    fn to_bytes(&self) -> Vec<u8> {
        self.clone()
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, CacheError> {
        Ok(bytes.to_vec())
    }
}

impl BinaryPayload for Bytes {
    fn to_bytes(&self) -> Vec<u8> {
        self.to_vec()
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, CacheError> {
        Ok(Bytes::copy_from_slice(bytes))
    }
}

impl Payload for Vec<u8> {
    type Codec = BinaryCodec;
}

impl Payload for Bytes {
    type Codec = BinaryCodec;
}

impl Payload for String {
    type Codec = JsonCodec;
}

impl Payload for serde_json::Value {
    type Codec = JsonCodec;
}
