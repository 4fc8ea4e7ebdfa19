//! Tarball extraction into the content-addressed repository directory.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tracing::info;

use super::{Extractor, Provisioner};

/// Extracts server tarballs under `<repo_base_dir>/<commit>/` and answers
/// provisioning queries against that layout.
pub struct TarExtractor {
    repo_base_dir: PathBuf,
}

impl TarExtractor {
    pub fn new(repo_base_dir: impl Into<PathBuf>) -> Self {
        Self { repo_base_dir: repo_base_dir.into() }
    }
}

impl Provisioner for TarExtractor {
    fn is_provisioned(&self, commit: &str) -> bool {
        self.server_bin_path(commit).is_file()
    }

    fn server_bin_path(&self, commit: &str) -> PathBuf {
        self.repo_base_dir.join(commit).join("bin").join("code-server")
    }

    fn server_dir(&self, commit: &str) -> PathBuf {
        self.repo_base_dir.join(commit)
    }
}

#[async_trait]
impl Extractor for TarExtractor {
    async fn extract(&self, tarball: &Path, target_dir: &Path) -> Result<()> {
        if target_dir.join("bin").join("code-server").is_file() {
            info!(path = %target_dir.display(), "server already extracted");
            return Ok(());
        }

        let parent = target_dir
            .parent()
            .context("extraction target has no parent directory")?;
        std::fs::create_dir_all(parent).context("create server base dir")?;

        // Unpack into a temp dir, then rename atomically so a killed
        // extraction never leaves a half-populated server directory.
        let tmp_dir = parent.join(format!(".extract-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&tmp_dir);
        std::fs::create_dir_all(&tmp_dir).context("create temp extract dir")?;

        info!(tarball = %tarball.display(), target = %target_dir.display(), "extracting server");

        let unpack_tarball = tarball.to_path_buf();
        let unpack_dest = tmp_dir.clone();
        let unpack = tokio::task::spawn_blocking(move || unpack_stripped(&unpack_tarball, &unpack_dest))
            .await
            .context("join extract task")?;
        if let Err(e) = unpack {
            let _ = std::fs::remove_dir_all(&tmp_dir);
            return Err(e);
        }

        if !tmp_dir.join("bin").join("code-server").is_file() {
            let _ = std::fs::remove_dir_all(&tmp_dir);
            bail!(
                "extracted tarball missing bin/code-server; corrupt download? delete {} and retry",
                tarball.display()
            );
        }

        if let Err(e) = std::fs::rename(&tmp_dir, target_dir) {
            let _ = std::fs::remove_dir_all(&tmp_dir);
            return Err(e).context("rename extracted dir");
        }

        info!(path = %target_dir.display(), "extraction complete");
        Ok(())
    }
}

/// Unpack a gzipped tarball into `dest`, stripping the single top-level
/// directory the upstream tarballs carry.
fn unpack_stripped(tarball: &Path, dest: &Path) -> Result<()> {
    let file = std::fs::File::open(tarball).context("open tarball")?;
    let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(file));

    for entry in archive.entries().context("read tarball")? {
        let mut entry = entry.context("read tarball entry")?;
        let path = entry.path().context("tarball entry path")?.into_owned();
        let stripped: PathBuf = path.components().skip(1).collect();
        if stripped.as_os_str().is_empty() {
            continue;
        }
        let out = dest.join(&stripped);
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent).context("create entry parent dir")?;
        }
        entry
            .unpack(&out)
            .with_context(|| format!("unpack {}", stripped.display()))?;
    }
    Ok(())
}
