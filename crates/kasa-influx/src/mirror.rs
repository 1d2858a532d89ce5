// JSON file mirror: appends each batch as pretty JSON so the health
// check (and humans) can see recent data without querying InfluxDB.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::trace;

use crate::error::InfluxError;

#[derive(Debug, Clone)]
pub struct FileMirror {
    emeter_path: PathBuf,
    sysinfo_path: PathBuf,
}

impl FileMirror {
    pub fn new(emeter_path: PathBuf, sysinfo_path: PathBuf) -> Self {
        Self {
            emeter_path,
            sysinfo_path,
        }
    }

    pub fn emeter_path(&self) -> &Path {
        &self.emeter_path
    }

    pub fn sysinfo_path(&self) -> &Path {
        &self.sysinfo_path
    }

    pub async fn append_emeter<T: Serialize>(&self, batch: &T) -> Result<(), InfluxError> {
        append(&self.emeter_path, batch).await
    }

    pub async fn append_sysinfo<T: Serialize>(&self, batch: &T) -> Result<(), InfluxError> {
        append(&self.sysinfo_path, batch).await
    }
}

async fn append<T: Serialize>(path: &Path, batch: &T) -> Result<(), InfluxError> {
    let mut text = serde_json::to_string_pretty(batch)?;
    text.push('\n');

    let io_err = |source| InfluxError::Mirror {
        path: path.to_path_buf(),
        source,
    };
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(dir).await.map_err(io_err)?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(io_err)?;
    file.write_all(text.as_bytes()).await.map_err(io_err)?;
    file.flush().await.map_err(io_err)?;

    trace!(path = %path.display(), bytes = text.len(), "mirrored batch to file");
    Ok(())
}
