//! HTTP download of server tarballs with a content-addressed cache.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::info;

use super::Downloader;

const URL_TEMPLATE: &str = "https://update.code.visualstudio.com/commit:{commit}/server-linux-{arch}/stable";

/// Downloads server tarballs over HTTP and caches them on disk as
/// `<cache_dir>/<commit>-<arch>.tar.gz`.
pub struct HttpDownloader {
    cache_dir: PathBuf,
    client: reqwest::Client,
}

impl HttpDownloader {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self { cache_dir: cache_dir.into(), client: reqwest::Client::new() }
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn download(&self, commit: &str, arch: &str) -> Result<PathBuf> {
        let dest = self.cache_dir.join(format!("{commit}-{arch}.tar.gz"));
        if dest.is_file() {
            info!(path = %dest.display(), "using cached tarball");
            return Ok(dest);
        }

        tokio::fs::create_dir_all(&self.cache_dir)
            .await
            .context("create cache dir")?;

        let url = URL_TEMPLATE
            .replace("{commit}", commit)
            .replace("{arch}", arch);
        info!(commit, arch, "downloading VS Code Server");

        let mut response = self
            .client
            .get(&url)
            .send()
            .await
            .context("download failed")?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            bail!(
                "VS Code Server commit {commit} not found for arch {arch}; \
                 verify the commit hash matches your VS Code version"
            );
        }
        if !response.status().is_success() {
            bail!("download returned HTTP {}", response.status().as_u16());
        }

        // Stream into a temp file, then rename atomically into the cache.
        let tmp = self.cache_dir.join(format!(".download-{}", std::process::id()));
        let result = write_body(&mut response, &tmp).await;
        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }
        if let Err(e) = tokio::fs::rename(&tmp, &dest).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e).context("rename tarball");
        }

        info!(path = %dest.display(), "download complete");
        Ok(dest)
    }
}

async fn write_body(response: &mut reqwest::Response, path: &Path) -> Result<()> {
    let mut file = tokio::fs::File::create(path)
        .await
        .context("create temp file")?;
    while let Some(chunk) = response.chunk().await.context("read download stream")? {
        file.write_all(&chunk).await.context("write tarball")?;
    }
    file.flush().await.context("flush tarball")?;
    Ok(())
}
