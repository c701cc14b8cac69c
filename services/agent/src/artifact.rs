//! Artifact fetch and extraction.
//!
//! Artifacts are `.tar.gz` root filesystems, cached under a
//! content-addressed path derived from the URL host and path. Fetch is
//! idempotent: an existing cache directory is reused as-is.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use flotilla_api::Error;

/// Where container root filesystems come from. The agent core only depends
/// on this seam; tests substitute an in-memory implementation.
#[async_trait]
pub trait ArtifactStore: Send + Sync + 'static {
    /// Ensure the artifact is present locally and return its rootfs path.
    async fn fetch(&self, artifact_url: &str) -> Result<PathBuf, Error>;
}

/// Fetches artifacts over HTTP and extracts them with the system tar.
pub struct HttpArtifactStore {
    root: PathBuf,
    client: reqwest::Client,
}

impl HttpArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Cache path for an artifact URL: `<root>/<host>/<path minus .tar.gz>`.
    fn artifact_path(&self, artifact_url: &str) -> Result<PathBuf, Error> {
        let rest = artifact_url
            .split_once("://")
            .map(|(_, rest)| rest)
            .ok_or_else(|| Error::InvalidInput(format!("artifact URL {artifact_url:?} invalid")))?;
        let (host, path) = rest.split_once('/').unwrap_or((rest, ""));
        let path = path.trim_end_matches(".tar.gz");
        Ok(self.root.join(host).join(path))
    }
}

#[async_trait]
impl ArtifactStore for HttpArtifactStore {
    async fn fetch(&self, artifact_url: &str) -> Result<PathBuf, Error> {
        if !artifact_url.ends_with(".tar.gz") {
            return Err(Error::InvalidInput("artifact must be .tar.gz".to_string()));
        }

        let dst = self.artifact_path(artifact_url)?;
        if dst.exists() {
            return Ok(dst);
        }

        info!(url = %artifact_url, path = %dst.display(), "fetching artifact");

        tokio::fs::create_dir_all(&dst)
            .await
            .map_err(|e| Error::RuntimeFailure(format!("mkdir {}: {e}", dst.display())))?;

        if let Err(e) = download_and_extract(&self.client, artifact_url, &dst).await {
            // A partially extracted directory would satisfy the existence
            // check on the next fetch; remove it.
            if let Err(rm) = tokio::fs::remove_dir_all(&dst).await {
                warn!(path = %dst.display(), error = %rm, "failed to clean partial artifact");
            }
            return Err(e);
        }

        Ok(dst)
    }
}

async fn download_and_extract(
    client: &reqwest::Client,
    artifact_url: &str,
    dst: &Path,
) -> Result<(), Error> {
    let response = client
        .get(artifact_url)
        .send()
        .await
        .map_err(|e| Error::RuntimeFailure(format!("artifact GET {artifact_url}: {e}")))?;

    if !response.status().is_success() {
        return Err(Error::RuntimeFailure(format!(
            "artifact GET {artifact_url}: HTTP {}",
            response.status()
        )));
    }

    let mut tar = tokio::process::Command::new("tar")
        .arg("-C")
        .arg(dst)
        .arg("-zx")
        .stdin(std::process::Stdio::piped())
        .spawn()
        .map_err(|e| Error::RuntimeFailure(format!("spawn tar: {e}")))?;

    let mut stdin = tar.stdin.take().expect("tar stdin is piped");
    let mut body = response.bytes_stream();

    use futures_util::StreamExt;
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| Error::RuntimeFailure(format!("artifact read: {e}")))?;
        stdin
            .write_all(&chunk)
            .await
            .map_err(|e| Error::RuntimeFailure(format!("tar write: {e}")))?;
    }
    drop(stdin);

    let status = tar
        .wait()
        .await
        .map_err(|e| Error::RuntimeFailure(format!("tar wait: {e}")))?;
    if !status.success() {
        return Err(Error::RuntimeFailure(format!("tar exited {status}")));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_path_is_content_addressed() {
        let store = HttpArtifactStore::new("/srv/flotilla/artifacts");
        let path = store
            .artifact_path("http://artifacts.internal/site/web-1.2.tar.gz")
            .unwrap();
        assert_eq!(
            path,
            PathBuf::from("/srv/flotilla/artifacts/artifacts.internal/site/web-1.2")
        );
    }

    #[tokio::test]
    async fn non_targz_is_rejected() {
        let store = HttpArtifactStore::new("/tmp");
        let err = store.fetch("http://a/b.zip").await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
