use std::path::{Path, PathBuf};

use anyhow::Context;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// A file written (or found already current) under an [`OutputStore`].
#[derive(Debug, Clone)]
pub struct StoredOutput {
    pub file_name: String,
    pub content_hash: String,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    /// The file on disk already held these exact bytes.
    pub unchanged: bool,
}

/// Directory of finished run outputs: workbooks, master CSVs and run reports.
#[derive(Debug, Clone)]
pub struct OutputStore {
    root: PathBuf,
}

impl OutputStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Writes `bytes` at `relative_path`. The file appears whole or not at
    /// all, and identical content already on disk is left untouched.
    pub async fn store_bytes(
        &self,
        relative_path: impl AsRef<Path>,
        bytes: &[u8],
    ) -> anyhow::Result<StoredOutput> {
        let relative_path = relative_path.as_ref();
        let file_name = match relative_path.file_name() {
            Some(name) => name.to_string_lossy().into_owned(),
            None => anyhow::bail!("output path {} has no file name", relative_path.display()),
        };
        let mut stored = StoredOutput {
            file_name,
            content_hash: sha256_hex(bytes),
            absolute_path: self.root.join(relative_path),
            byte_size: bytes.len(),
            unchanged: false,
        };

        let dir = stored
            .absolute_path
            .parent()
            .map_or_else(|| self.root.clone(), Path::to_path_buf);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;

        if current_hash(&stored.absolute_path).await?.as_deref() == Some(&stored.content_hash) {
            debug!(file = %stored.file_name, "output unchanged");
            stored.unchanged = true;
            return Ok(stored);
        }

        replace_file(&dir, &stored.absolute_path, bytes).await?;
        debug!(file = %stored.file_name, bytes = stored.byte_size, "output written");
        Ok(stored)
    }
}

async fn current_hash(path: &Path) -> anyhow::Result<Option<String>> {
    match fs::read(path).await {
        Ok(existing) => Ok(Some(sha256_hex(&existing))),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
    }
}

/// Stage into a sibling temp file, then rename over `target`.
async fn replace_file(dir: &Path, target: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let staging = dir.join(format!(".{}.partial", Uuid::new_v4().simple()));
    let written = async {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&staging)
            .await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        fs::rename(&staging, target).await
    }
    .await;

    if let Err(err) = written {
        let _ = fs::remove_file(&staging).await;
        return Err(err).with_context(|| format!("writing {}", target.display()));
    }
    Ok(())
}
