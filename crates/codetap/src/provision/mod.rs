//! Provisioning of versioned editor-server builds.
//!
//! Provisioning is a check-installed, download, extract pipeline behind
//! three trait seams so the lifecycle service can be exercised without the
//! network or a real tarball:
//!
//! - [`Downloader`] fetches the server tarball for a commit and arch
//! - [`Extractor`] unpacks a tarball into a target directory
//! - [`Provisioner`] answers what is already installed and where
//!
//! The shipping implementations are [`download::HttpDownloader`] and
//! [`extract::TarExtractor`] (which plays both extractor and provisioner
//! over the content-addressed repository directory).

use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;

pub mod download;
pub mod extract;
pub mod resolve;

pub use download::HttpDownloader;
pub use extract::TarExtractor;
pub use resolve::CommitResolver;

/// Fetches the server tarball for a given commit and arch, returning the
/// local path. Implementations cache; a hit returns immediately.
#[async_trait]
pub trait Downloader: Send + Sync {
    async fn download(&self, commit: &str, arch: &str) -> Result<PathBuf>;
}

/// Unpacks a server tarball into a target directory.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, tarball: &Path, target_dir: &Path) -> Result<()>;
}

/// Answers whether a server build is installed and where its pieces live.
pub trait Provisioner: Send + Sync {
    fn is_provisioned(&self, commit: &str) -> bool;
    fn server_bin_path(&self, commit: &str) -> PathBuf;
    fn server_dir(&self, commit: &str) -> PathBuf;
}
