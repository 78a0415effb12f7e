//! Content-addressed blob store.
//!
//! Blobs are keyed by `(node_id, key)`; the on-disk location is derived from
//! the SHA-1 digest of the key, split into fixed-width directory segments.

use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncWriteExt};

use crate::crypto;
use crate::errors::{ErrorKind, Result, VaultError};
use crate::{IV_SIZE, KEY_SIZE};

pub const DEFAULT_ROOT: &str = "peervault_storage";

const SEGMENT_LEN: usize = 5;

/// Location of a blob relative to a node's namespace directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathKey {
    pub dir: String,
    pub filename: String,
}

impl PathKey {
    pub fn full_path(&self) -> PathBuf {
        Path::new(&self.dir).join(&self.filename)
    }
}

pub type PathTransformFn = fn(&str) -> PathKey;

/// Derive the content-addressed location for a key: SHA-1 the key, hex-encode
/// to 40 lowercase chars, split into 8 directory segments of 5 chars; the
/// filename is the full digest. Deterministic and total.
pub fn cas_path_transform(key: &str) -> PathKey {
    let hash = hex::encode(Sha1::digest(key.as_bytes()));
    let segments: Vec<&str> = (0..hash.len() / SEGMENT_LEN)
        .map(|i| &hash[i * SEGMENT_LEN..(i + 1) * SEGMENT_LEN])
        .collect();
    PathKey {
        dir: segments.join("/"),
        filename: hash,
    }
}

#[derive(Clone)]
pub struct StoreOpts {
    pub root: PathBuf,
    pub path_transform: PathTransformFn,
}

impl Default for StoreOpts {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_ROOT),
            path_transform: cas_path_transform,
        }
    }
}

/// Filesystem-backed blob store. The root directory is created lazily on the
/// first write.
pub struct Store {
    opts: StoreOpts,
}

impl Store {
    pub fn new(opts: StoreOpts) -> Self {
        Self { opts }
    }

    pub fn root(&self) -> &Path {
        &self.opts.root
    }

    /// Absolute path of the blob for `(id, key)`.
    pub fn blob_path(&self, id: &str, key: &str) -> PathBuf {
        let path_key = (self.opts.path_transform)(key);
        self.opts.root.join(id).join(path_key.full_path())
    }

    pub fn has(&self, id: &str, key: &str) -> bool {
        self.blob_path(id, key).exists()
    }

    /// Stream `r` into the blob for `(id, key)`, creating parent directories
    /// as needed and truncating any previous content. Returns the byte count.
    pub async fn write<R>(&self, id: &str, key: &str, r: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut file = self.create_blob_file(id, key).await?;
        let n = tokio::io::copy(r, &mut file)
            .await
            .map_err(|e| VaultError::wrap(e, ErrorKind::Storage, "failed to write blob"))?;
        file.flush()
            .await
            .map_err(|e| VaultError::wrap(e, ErrorKind::Storage, "failed to flush blob"))?;
        Ok(n)
    }

    /// Open the blob for `(id, key)` for streaming reads. The caller is
    /// responsible for draining or dropping the returned handle.
    pub async fn read(&self, id: &str, key: &str) -> Result<(u64, File)> {
        let path = self.blob_path(id, key);
        let meta = fs::metadata(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                VaultError::file_not_found(key)
            } else {
                VaultError::wrap(e, ErrorKind::Storage, "failed to stat blob")
            }
        })?;
        let file = File::open(&path)
            .await
            .map_err(|e| VaultError::wrap(e, ErrorKind::Storage, "failed to open blob"))?;
        Ok((meta.len(), file))
    }

    /// Stream an encrypted payload (16-byte IV followed by CTR ciphertext)
    /// from `r` into the blob for `(id, key)`, decrypting on the way.
    /// Returns the number of decrypted bytes written.
    pub async fn write_decrypt<R>(
        &self,
        enc_key: &[u8; KEY_SIZE],
        id: &str,
        key: &str,
        r: &mut R,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut file = self.create_blob_file(id, key).await?;
        let n = crypto::copy_decrypt(enc_key, r, &mut file).await?;
        Ok(n - IV_SIZE as u64)
    }

    /// Remove the entire storage root. Used by tests and the demo.
    pub async fn clear(&self) -> Result<()> {
        match fs::remove_dir_all(&self.opts.root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(VaultError::wrap(
                e,
                ErrorKind::Storage,
                "failed to clear storage root",
            )),
        }
    }

    async fn create_blob_file(&self, id: &str, key: &str) -> Result<File> {
        let path = self.blob_path(id, key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                VaultError::wrap(e, ErrorKind::Storage, "failed to create blob directory")
            })?;
        }
        File::create(&path)
            .await
            .map_err(|e| VaultError::wrap(e, ErrorKind::Storage, "failed to create blob file"))
    }
}
