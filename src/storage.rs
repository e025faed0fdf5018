use std::path::Path;
use std::path::PathBuf;

use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::io::AsyncWriteExt;

use crate::configuration::StorageSettings;
use crate::domain::TenantId;

/// Content-addressed byte store on the local filesystem. Layout:
/// `{base}/{tenant}/{hash[0..2]}/{hash}{ext}`, addressed by `file://` URIs.
/// Writes stage to a sibling temp file, flush, then rename into place, so a
/// path either holds the complete object or nothing.
#[derive(Debug, Clone)]
pub struct ContentStore {
    base: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage backend {0:?} is not supported (file only)")]
    UnsupportedBackend(String),
    #[error("storage base URI must use the file:// scheme")]
    UnsupportedBase,
    #[error("unsupported storage URI scheme: {0}")]
    UnsupportedScheme(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

const FILE_SCHEME: &str = "file://";

impl ContentStore {
    pub fn from_settings(settings: &StorageSettings) -> Result<Self, StorageError> {
        if settings.backend != "file" {
            return Err(StorageError::UnsupportedBackend(settings.backend.clone()));
        }
        let base = settings
            .base_uri
            .strip_prefix(FILE_SCHEME)
            .ok_or(StorageError::UnsupportedBase)?;
        Ok(Self { base: PathBuf::from(base) })
    }

    /// Persist `data` under its content hash and return the `file://` URI.
    /// Re-putting existing content is a no-op returning the same URI.
    pub async fn put_bytes(
        &self,
        tenant: &TenantId,
        content_hash: &str,
        ext: &str,
        data: &[u8],
    ) -> Result<String, StorageError> {
        let shard = &content_hash[..content_hash.len().min(2)];
        let dir = self.base.join(tenant.to_string()).join(shard);
        tokio::fs::create_dir_all(&dir).await?;

        let target = dir.join(format!("{content_hash}{ext}"));
        if tokio::fs::try_exists(&target).await? {
            return Ok(uri_for(&target));
        }

        // stage under a random sibling name, flush durably, rename into place
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(12)
            .map(char::from)
            .collect();
        let tmp = dir.join(format!(".{content_hash}.{suffix}.tmp"));
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &target).await?;

        Ok(uri_for(&target))
    }

    /// Resolve a store URI back to bytes. Only `file://` is understood; any
    /// other scheme is a compatibility fault the caller maps to `io_error`.
    pub async fn read_uri(uri: &str) -> Result<Vec<u8>, StorageError> {
        let path = uri
            .strip_prefix(FILE_SCHEME)
            .ok_or_else(|| StorageError::UnsupportedScheme(scheme_of(uri)))?;
        Ok(tokio::fs::read(path).await?)
    }
}

fn uri_for(path: &Path) -> String { format!("{FILE_SCHEME}{}", path.display()) }

fn scheme_of(uri: &str) -> String {
    uri.split("://").next().unwrap_or("").to_owned()
}
