//! JSON-lines report file

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::Output;
use crate::error::SwarmResult;
use crate::stats::ReportData;

#[derive(Serialize)]
struct Record<'a> {
    timestamp: String,
    #[serde(flatten)]
    report: &'a ReportData,
}

/// Appends one JSON document per report to a file
#[derive(Debug)]
pub struct JsonOutput {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonOutput {
    /// Open (or create) `path` for appending
    pub async fn open(path: impl AsRef<Path>) -> SwarmResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Destination path
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write(&self, report: &ReportData) -> SwarmResult<()> {
        let record = Record {
            timestamp: chrono::Utc::now().to_rfc3339(),
            report,
        };
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl Output for JsonOutput {
    async fn on_event(&self, report: &ReportData) {
        if let Err(e) = self.write(report).await {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to write report");
        }
    }

    async fn on_stop(&self) {
        if let Err(e) = self.file.lock().await.sync_all().await {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to sync report file");
        }
    }
}
