// Firmware download into the storage root. Prior images are removed before the
// network is touched, so the root never holds two candidate images.

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::FetchError;
use crate::transport::{HttpTransport, Storage, TrustAnchor};
use crate::validators;

const CHUNK_SIZE: usize = 4096;

/// What verification learned about a stored image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    pub path: PathBuf,
    pub len: u64,
    /// Lowercase hex SHA-256 of the contents
    pub sha256: String,
}

pub struct FirmwareFetcher<H, S> {
    http: H,
    storage: S,
    root: PathBuf,
    extension: String,
    trust_anchor: TrustAnchor,
}

impl<H: HttpTransport, S: Storage> FirmwareFetcher<H, S> {
    pub fn new(http: H, storage: S, root: impl Into<PathBuf>, extension: &str, trust_anchor: TrustAnchor) -> Self {
        Self {
            http,
            storage,
            root: root.into(),
            extension: extension.trim_start_matches('.').to_string(),
            trust_anchor,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    /// Download `url` into `destination` inside the storage root, replacing any
    /// prior firmware image.
    pub fn fetch(&mut self, url: &str, destination: &str) -> Result<(), FetchError> {
        validators::validate_image_name(destination, &self.extension).map_err(|e| FetchError::InvalidName {
            name: destination.to_string(),
            reason: e.to_string(),
        })?;

        let removed = self.remove_stale_images()?;
        if removed > 0 {
            log::info!("Removed {} stale firmware image(s)", removed);
        }

        log::info!("Downloading firmware from {}", url);
        let mut response = self.http.get(url, &self.trust_anchor).map_err(FetchError::Network)?;
        if !response.is_success() {
            log::error!("Failed to download firmware: HTTP {}", response.status);
            return Err(FetchError::HttpStatus(response.status));
        }

        let path = self.root.join(destination);
        let outcome = {
            let mut sink = self.storage.create(&path).map_err(FetchError::Storage)?;
            let copied = copy_body(response.body.as_mut(), &mut sink);
            match copied {
                Ok(total) => sink.finish().map(|()| total).map_err(FetchError::Storage),
                Err(e) => Err(e),
            }
        };
        drop(response);

        match outcome {
            Ok(total) => {
                log::info!("Firmware stored at {} ({} bytes)", path.display(), total);
                Ok(())
            }
            Err(e) => {
                log::error!("Firmware download aborted: {}", e);
                // a truncated image must not be taken for a candidate
                if let Err(cleanup) = self.storage.delete(&path) {
                    log::warn!("Could not remove partial image {}: {}", path.display(), cleanup);
                }
                Err(e)
            }
        }
    }

    /// Size and digest of a stored image, `None` when it does not exist.
    pub fn inspect(&self, name: &str) -> Result<Option<ImageInfo>, FetchError> {
        let path = self.root.join(name);
        if self.storage.file_len(&path).map_err(FetchError::Storage)?.is_none() {
            return Ok(None);
        }

        let mut reader = self.storage.open_read(&path).map_err(FetchError::Storage)?;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; CHUNK_SIZE];
        let mut len = 0u64;
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(FetchError::Storage(e)),
            };
            hasher.update(&buf[..n]);
            len += n as u64;
        }

        let sha256 = hex::encode(hasher.finalize());
        Ok(Some(ImageInfo { path, len, sha256 }))
    }

    fn remove_stale_images(&mut self) -> Result<usize, FetchError> {
        let files = self.storage.list_files(&self.root).map_err(FetchError::Storage)?;
        let stale: Vec<PathBuf> = files.into_iter().filter(|f| self.is_image(f)).collect();
        let mut removed = 0;
        for file in &stale {
            log::debug!("Deleting stale image {}", file.display());
            self.storage.delete(file).map_err(|e| {
                log::error!("Cleanup failed at {}: {}", file.display(), e);
                FetchError::Storage(e)
            })?;
            removed += 1;
        }
        Ok(removed)
    }

    fn is_image(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|n| n.to_str())
            .map(|n| validators::has_extension(n, &self.extension))
            .unwrap_or(false)
    }
}

fn copy_body(body: &mut dyn Read, sink: &mut dyn Write) -> Result<u64, FetchError> {
    let mut buf = [0u8; CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        let n = match body.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(FetchError::Network(e)),
        };
        sink.write_all(&buf[..n]).map_err(FetchError::Storage)?;
        total += n as u64;
    }
    sink.flush().map_err(FetchError::Storage)?;
    Ok(total)
}
