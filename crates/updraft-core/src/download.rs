//! Artifact download with streaming content hashing.
//!
//! Downloads stream straight to the session's staging area while a blake3
//! hash accumulates over the bytes written; the hash lands in the resume
//! marker so a later session can trust (or reject) a leftover artifact
//! without re-downloading it. Cancellation is cooperative: the in-flight
//! transfer observes the session token at every chunk and aborts, removing
//! the partial file.

use std::path::{Path, PathBuf};

use futures::StreamExt;
use reqwest::Client;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

/// Download failures.
#[derive(Error, Debug)]
pub enum DownloadError {
    /// Transport failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Staging-area write failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The session token was cancelled mid-transfer.
    #[error("download cancelled")]
    Cancelled,
}

/// A completed download.
#[derive(Debug, Clone)]
pub struct DownloadedArtifact {
    /// Where the artifact landed.
    pub path: PathBuf,
    /// Bytes received.
    pub length: u64,
    /// Hex blake3 hash of the received bytes.
    pub blake3: String,
}

/// Streams `url` to `dest`, reporting progress after every chunk.
///
/// `expected_length` (the feed's published length) takes precedence over the
/// transport's content length for progress totals. On cancellation the
/// partial file is removed and [`DownloadError::Cancelled`] is returned.
pub async fn download_artifact(
    client: &Client,
    url: &str,
    dest: &Path,
    user_agent: &str,
    expected_length: Option<u64>,
    cancel: &CancellationToken,
    mut progress: impl FnMut(u64, Option<u64>) + Send,
) -> Result<DownloadedArtifact, DownloadError> {
    let response = client
        .get(url)
        .header(reqwest::header::USER_AGENT, user_agent)
        .send()
        .await?
        .error_for_status()?;

    let total = expected_length.or(response.content_length());
    let mut file = File::create(dest).await?;
    let mut stream = response.bytes_stream();
    let mut hasher = blake3::Hasher::new();
    let mut downloaded: u64 = 0;

    loop {
        let chunk = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                drop(file);
                tokio::fs::remove_file(dest).await.ok();
                tracing::debug!(url, downloaded, "download cancelled");
                return Err(DownloadError::Cancelled);
            }
            next = stream.next() => match next {
                Some(chunk) => chunk?,
                None => break,
            },
        };

        file.write_all(&chunk).await?;
        hasher.update(&chunk);
        downloaded += chunk.len() as u64;
        progress(downloaded, total);
    }

    file.flush().await?;
    Ok(DownloadedArtifact {
        path: dest.to_path_buf(),
        length: downloaded,
        blake3: hasher.finalize().to_hex().to_string(),
    })
}

/// Recomputes the blake3 hash of a staged artifact.
///
/// Used when resuming: a leftover artifact is only trusted if its bytes
/// still hash to what the resume marker recorded.
pub async fn artifact_hash(path: &Path) -> Result<String, DownloadError> {
    let path = path.to_path_buf();
    let hash = tokio::task::spawn_blocking(move || -> Result<String, std::io::Error> {
        let mut hasher = blake3::Hasher::new();
        let mut file = std::fs::File::open(&path)?;
        std::io::copy(&mut file, &mut hasher)?;
        Ok(hasher.finalize().to_hex().to_string())
    })
    .await
    .map_err(std::io::Error::other)??;
    Ok(hash)
}
