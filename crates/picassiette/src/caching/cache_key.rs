use std::fmt::{self, Write};
use std::path::Path;

use sha2::{Digest, Sha256};

/// The physical key of an entry in the persistent store.
///
/// Logical keys are hashed with SHA-256 and only the digest is kept. Two logical keys with the
/// same digest are indistinguishable to the store, the last writer wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    hash: [u8; 32],
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.hash {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl CacheKey {
    /// Creates the [`CacheKey`] for the given logical key.
    pub fn new(key: &str) -> Self {
        let hash = Sha256::digest(key.as_bytes());
        Self { hash: hash.into() }
    }

    /// Returns the relative path for this cache key.
    ///
    /// The relative path is the sha-256 hash hex-formatted like so:
    /// `aa/bbccdd/eeff...`
    pub fn cache_path(&self) -> String {
        let mut path = format!("{:02x}/", self.hash[0]);
        for b in &self.hash[1..4] {
            path.write_fmt(format_args!("{b:02x}")).unwrap();
        }
        path.push('/');
        for b in &self.hash[4..] {
            path.write_fmt(format_args!("{b:02x}")).unwrap();
        }
        path
    }

    /// Recovers a [`CacheKey`] from a path relative to the store directory.
    ///
    /// This is the inverse of [`cache_path`](Self::cache_path). Returns `None` for anything that
    /// was not created by it.
    pub fn from_cache_path(path: &Path) -> Option<Self> {
        let mut hex = String::with_capacity(64);
        let mut components = 0;
        for component in path.components() {
            hex.push_str(component.as_os_str().to_str()?);
            components += 1;
        }
        if components != 3 || hex.len() != 64 {
            return None;
        }

        let mut hash = [0u8; 32];
        for (i, byte) in hash.iter_mut().enumerate() {
            *byte = u8::from_str_radix(hex.get(i * 2..i * 2 + 2)?, 16).ok()?;
        }
        let key = Self { hash };

        // reject paths with the right characters but the wrong layout, like `aabb/cc/...`
        (Path::new(&key.cache_path()) == path).then_some(key)
    }
}
