//! Hand-off of finished recordings: saving to disk and upload

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::info;

use crate::pipeline::RecordingArtifact;

/// Where an artifact lands inside `dir` when no explicit path is given
pub fn export_path(dir: &Path, artifact: &RecordingArtifact) -> PathBuf {
    dir.join(artifact.file_name())
}

/// Write the artifact to `path`, creating missing parent directories
pub async fn save_artifact(artifact: &RecordingArtifact, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }

    tokio::fs::write(path, &artifact.data)
        .await
        .with_context(|| format!("writing {}", path.display()))?;

    info!(
        "Saved recording {} ({} bytes, {}) to {}",
        artifact.id,
        artifact.len(),
        artifact.mime_type(),
        path.display()
    );
    Ok(())
}

/// Receives finished recordings as opaque blobs
#[async_trait]
pub trait UploadSink: Send + Sync {
    async fn upload(&self, artifact: Arc<RecordingArtifact>) -> Result<()>;
}

/// Sink that only reports what it was given
#[derive(Debug, Default, Clone, Copy)]
pub struct LogUploadSink;

#[async_trait]
impl UploadSink for LogUploadSink {
    async fn upload(&self, artifact: Arc<RecordingArtifact>) -> Result<()> {
        info!(
            "Upload requested: recording {} of {} bytes ({}), recorded {}",
            artifact.id,
            artifact.len(),
            artifact.mime_type(),
            artifact.created_at.format("%Y-%m-%d %H:%M:%S")
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::ContainerFormat;
    use bytes::Bytes;

    fn artifact() -> RecordingArtifact {
        RecordingArtifact {
            id: 7,
            data: Bytes::from_static(b"video-bytes"),
            format: ContainerFormat::WebM,
            chunk_count: 2,
            created_at: chrono::Local::now(),
        }
    }

    #[tokio::test]
    async fn test_save_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = artifact();
        let path = export_path(&dir.path().join("nested/out"), &artifact);
        assert!(path.ends_with("recorded_video.webm"));

        save_artifact(&artifact, &path).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"video-bytes");
    }

    #[tokio::test]
    async fn test_save_reports_path_in_error() {
        let dir = tempfile::tempdir().unwrap();
        // A file where a directory is expected
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();

        let err = save_artifact(&artifact(), &blocker.join("video.webm"))
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("blocker"));
    }

    #[tokio::test]
    async fn test_log_sink_accepts_any_blob() {
        LogUploadSink.upload(Arc::new(artifact())).await.unwrap();
    }
}
