//! Commit resolution: turn a user-supplied version reference into the
//! 40-char lowercase hex commit the update service addresses builds by.

use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tokio::process::Command;
use tokio::time::timeout;

const DEFAULT_BASE_URL: &str = "https://update.code.visualstudio.com";

fn hex_hash_re() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"^[0-9a-f]{40}$").expect("hex hash regex"))
}

fn semver_re() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"^\d+\.\d+\.\d+$").expect("semver regex"))
}

/// Whether `value` is a full lowercase commit hash.
pub fn is_commit_hash(value: &str) -> bool {
    hex_hash_re().is_match(value)
}

/// The JSON returned by the update API.
#[derive(Debug, Deserialize)]
struct UpdateResponse {
    /// 40-char commit hash.
    version: String,
    #[serde(rename = "productVersion")]
    #[allow(dead_code)]
    product_version: Option<String>,
}

/// Resolves commit references for one architecture.
pub struct CommitResolver {
    arch: String,
    base_url: String,
    client: reqwest::Client,
}

impl CommitResolver {
    pub fn new(arch: &str) -> Self {
        Self {
            arch: arch.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .unwrap_or_default(),
        }
    }

    /// Resolve `input` to a commit hash.
    ///
    /// Accepts a 40-char lowercase hex hash (returned as-is after case
    /// normalization), a version like `1.109.5`, or `latest`. Empty input
    /// resolves to an empty string so the caller can pick its fallback.
    pub async fn resolve(&self, input: &str) -> Result<String> {
        let input = input.trim();
        if input.is_empty() {
            return Ok(String::new());
        }

        let lower = input.to_ascii_lowercase();
        if is_commit_hash(&lower) {
            return Ok(lower);
        }
        if semver_re().is_match(input) {
            return self.resolve_version(input).await;
        }
        if lower == "latest" {
            return self.resolve_latest().await;
        }

        bail!(
            "invalid commit value {input:?}: expected 40-char hex hash, \
             version (e.g. 1.109.5), or \"latest\""
        )
    }

    async fn resolve_version(&self, version: &str) -> Result<String> {
        let url = format!(
            "{}/api/update/server-linux-{}/stable/{version}",
            self.base_url, self.arch
        );
        self.fetch_commit(&url).await
    }

    async fn resolve_latest(&self) -> Result<String> {
        // The API treats an all-zero commit as "anything older than stable".
        let url = format!(
            "{}/api/update/server-linux-{}/stable/{}",
            self.base_url,
            self.arch,
            "0".repeat(40)
        );
        self.fetch_commit(&url).await
    }

    async fn fetch_commit(&self, url: &str) -> Result<String> {
        let response = self.client.get(url).send().await.context("resolve commit")?;
        if !response.status().is_success() {
            bail!(
                "resolve commit: update API returned HTTP {}",
                response.status().as_u16()
            );
        }
        let result: UpdateResponse = response
            .json()
            .await
            .context("resolve commit: invalid API response")?;
        if !is_commit_hash(&result.version) {
            bail!(
                "resolve commit: API returned unexpected version format {:?}",
                result.version
            );
        }
        Ok(result.version)
    }
}

/// Detect the commit hash from a locally installed `code --version`.
/// Returns `None` when the CLI is absent, times out, or prints something
/// unexpected; this probe is strictly best-effort.
pub async fn probe_code_cli() -> Option<String> {
    let output = timeout(
        Duration::from_secs(5),
        Command::new("code").arg("--version").output(),
    )
    .await
    .ok()?
    .ok()?;

    if !output.status.success() {
        return None;
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    // Second line of `code --version` is the commit hash.
    let candidate = stdout.lines().nth(1)?.trim();
    is_commit_hash(candidate).then(|| candidate.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn full_hash_passes_through() {
        let resolver = CommitResolver::new("x64");
        let hash = "0123456789abcdef0123456789abcdef01234567";
        assert_eq!(resolver.resolve(hash).await.unwrap(), hash);
    }

    #[tokio::test]
    async fn uppercase_hash_is_normalized() {
        let resolver = CommitResolver::new("x64");
        let hash = "0123456789ABCDEF0123456789ABCDEF01234567";
        assert_eq!(
            resolver.resolve(hash).await.unwrap(),
            hash.to_ascii_lowercase()
        );
    }

    #[tokio::test]
    async fn empty_input_resolves_to_empty() {
        let resolver = CommitResolver::new("x64");
        assert_eq!(resolver.resolve("  ").await.unwrap(), "");
    }

    #[tokio::test]
    async fn junk_input_errors_without_network() {
        let resolver = CommitResolver::new("x64");
        let err = resolver.resolve("not-a-version").await.unwrap_err();
        assert!(err.to_string().contains("invalid commit value"));

        // Too-short hex is junk too, not a hash.
        let err = resolver.resolve("abc123").await.unwrap_err();
        assert!(err.to_string().contains("invalid commit value"));
    }

    #[test]
    fn hash_grammar() {
        assert!(is_commit_hash(&"a".repeat(40)));
        assert!(!is_commit_hash(&"A".repeat(40)));
        assert!(!is_commit_hash(&"a".repeat(39)));
        assert!(!is_commit_hash(&"g".repeat(40)));
    }
}
