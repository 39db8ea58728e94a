//! Loads the raw bytes behind a key.
//!
//! Keys starting with `http://` or `https://` are downloaded, everything else is read from the
//! local file system. A missing resource is a miss, not an error.
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use anyhow::{Context, Result};
use bytes::Bytes;
use reqwest::StatusCode;
use tokio::runtime::Handle;

#[derive(Debug, Clone)]
pub struct Loader {
    client: reqwest::Client,
    runtime: Handle,
}

impl Loader {
    /// Creates a loader that drives downloads on `runtime`.
    pub fn new(runtime: Handle) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("picassiette/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to create HTTP client")?;
        Ok(Self { client, runtime })
    }

    /// Loads `key`. Must be called from a blocking thread.
    pub fn load(&self, key: &str) -> Result<Option<Bytes>> {
        if key.starts_with("http://") || key.starts_with("https://") {
            self.runtime.block_on(self.download(key))
        } else {
            read_file(Path::new(key))
        }
    }

    async fn download(&self, url: &str) -> Result<Option<Bytes>> {
        tracing::debug!(url, "Downloading");
        let response = self.client.get(url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response.error_for_status()?;
        Ok(Some(response.bytes().await?))
    }
}

fn read_file(path: &Path) -> Result<Option<Bytes>> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("failed to open {}", path.display())),
    };
    let len = file.metadata()?.len();

    let mut buf = Vec::new();
    buf.try_reserve_exact(len as usize)
        .with_context(|| format!("failed to allocate {len} bytes for {}", path.display()))?;
    file.read_to_end(&mut buf)?;
    Ok(Some(buf.into()))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[tokio::test]
    async fn test_read_file() {
        let dir = picassiette_test::tempdir();
        let path = dir.path().join("image.png");
        fs::write(&path, b"\x89PNG").unwrap();

        let loader = Loader::new(Handle::current()).unwrap();
        let key = path.to_str().unwrap();
        assert_eq!(loader.load(key).unwrap(), Some(Bytes::from_static(b"\x89PNG")));
    }

    #[tokio::test]
    async fn test_missing_file_is_a_miss() {
        let dir = picassiette_test::tempdir();
        let loader = Loader::new(Handle::current()).unwrap();
        let key = dir.path().join("nope.png");
        assert_eq!(loader.load(key.to_str().unwrap()).unwrap(), None);
    }

    #[test]
    fn test_directory_is_an_error() {
        let dir = picassiette_test::tempdir();
        assert!(read_file(dir.path()).is_err());
    }
}
