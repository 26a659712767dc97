//! On-disk layout for sealed blobs.
//!
//! One directory per app (mode 0700) holding one file per logical key,
//! suffixed `.enc` (mode 0600). Writes go to a temp file that is synced and
//! renamed over the target. Deletion overwrites the file three times with
//! random bytes before unlinking it.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use rand::RngCore;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::error::{SecurityError, SecurityResult};

/// Suffix for every sealed file.
pub const FILE_SUFFIX: &str = ".enc";

const MAX_KEY_LEN: usize = 64;
const OVERWRITE_PASSES: usize = 3;
const OVERWRITE_CHUNK: usize = 64 * 1024;

/// Write `bytes` to `path` atomically with owner-only permissions.
pub async fn write_private_file(path: &Path, bytes: &[u8]) -> SecurityResult<()> {
    let mut temp_name = path
        .file_name()
        .map(|n| n.to_os_string())
        .ok_or_else(|| SecurityError::InvalidInput(format!("no file name in {:?}", path)))?;
    temp_name.push(".tmp");
    let temp_path = path.with_file_name(temp_name);

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(&temp_path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&temp_path, path).await?;

    // Set restrictive permissions on Unix (covers a pre-existing target)
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }

    Ok(())
}

/// Overwrite `path` with random data three times, then unlink it.
///
/// Returns `Ok(false)` if the file did not exist.
pub async fn secure_delete_file(path: &Path) -> SecurityResult<bool> {
    let len = match tokio::fs::metadata(path).await {
        Ok(meta) => meta.len() as usize,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };

    let mut file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
    let mut chunk = vec![0u8; OVERWRITE_CHUNK.min(len.max(1))];

    for _ in 0..OVERWRITE_PASSES {
        file.seek(SeekFrom::Start(0)).await?;
        let mut remaining = len;
        while remaining > 0 {
            let n = remaining.min(chunk.len());
            rand::rng().fill_bytes(&mut chunk[..n]);
            file.write_all(&chunk[..n]).await?;
            remaining -= n;
        }
        file.sync_all().await?;
    }
    drop(file);

    tokio::fs::remove_file(path).await?;
    debug!("Securely deleted {:?}", path);
    Ok(true)
}

/// Sealed-blob directory.
#[derive(Debug, Clone)]
pub struct SecureStorage {
    dir: PathBuf,
}

impl SecureStorage {
    /// Open (creating if needed) the storage directory with mode 0700.
    pub async fn open(dir: impl Into<PathBuf>) -> SecurityResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700)).await?;
        }

        debug!("Secure storage at {:?}", dir);
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file backing `key`.
    pub fn path_for(&self, key: &str) -> SecurityResult<PathBuf> {
        validate_key(key)?;
        Ok(self.dir.join(format!("{}{}", key, FILE_SUFFIX)))
    }

    pub async fn write(&self, key: &str, bytes: &[u8]) -> SecurityResult<()> {
        let path = self.path_for(key)?;
        write_private_file(&path, bytes).await
    }

    /// Read a blob; `None` if it does not exist.
    pub async fn read(&self, key: &str) -> SecurityResult<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn exists(&self, key: &str) -> SecurityResult<bool> {
        let path = self.path_for(key)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    /// Securely delete one blob. Returns whether it existed.
    pub async fn secure_delete(&self, key: &str) -> SecurityResult<bool> {
        let path = self.path_for(key)?;
        secure_delete_file(&path).await
    }

    /// Keys of every blob currently stored, sorted.
    pub async fn keys(&self) -> SecurityResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(key) = name.strip_suffix(FILE_SUFFIX) {
                if validate_key(key).is_ok() {
                    keys.push(key.to_string());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// Securely delete every blob whose key is not in `preserved`. Keeps
    /// going past individual failures so one stuck file never shields the
    /// rest.
    pub async fn secure_delete_all_except(&self, preserved: &[&str]) -> DeleteReport {
        let mut report = DeleteReport::default();
        let keys = match self.keys().await {
            Ok(keys) => keys,
            Err(e) => {
                warn!("Failed to list sealed files: {}", e);
                report.failed.push(("*".to_string(), e));
                return report;
            }
        };
        for key in keys {
            if preserved.contains(&key.as_str()) {
                continue;
            }
            match self.secure_delete(&key).await {
                Ok(true) => report.deleted += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!("Failed to securely delete {}: {}", key, e);
                    report.failed.push((key, e));
                }
            }
        }
        info!(
            "Securely deleted {} sealed files, {} failed",
            report.deleted,
            report.failed.len()
        );
        report
    }
}

/// Result of a bulk secure delete.
#[derive(Debug, Default)]
pub struct DeleteReport {
    pub deleted: usize,
    /// Keys that could not be deleted, with the cause. `*` stands for the
    /// whole directory when it could not be listed.
    pub failed: Vec<(String, SecurityError)>,
}

impl DeleteReport {
    /// `Ok(deleted)` if nothing failed, otherwise the first failure.
    pub fn into_result(self) -> SecurityResult<usize> {
        match self.failed.into_iter().next() {
            Some((_, e)) => Err(e),
            None => Ok(self.deleted),
        }
    }
}

/// Keys are short `[a-z0-9_-]` names so they map 1:1 onto file names.
fn validate_key(key: &str) -> SecurityResult<()> {
    let ok = !key.is_empty()
        && key.len() <= MAX_KEY_LEN
        && key
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-');
    if ok {
        Ok(())
    } else {
        Err(SecurityError::InvalidInput(format!(
            "invalid storage key {:?}",
            key
        )))
    }
}
