//! Architecture detection and filesystem path resolution.
//!
//! All defaults can be steered by environment variables so tests and custom
//! deployments never touch the real home directory or `/dev/shm`:
//!
//! - `CODETAP_HOME` overrides the home directory
//! - `CODETAP_SOCKET_DIR` overrides the socket directory
//! - `CODETAP_COMMIT` supplies a commit when no flag is given

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

const DEFAULT_SOCKET_DIR: &str = "/dev/shm/codetap";

/// Home directory for codetap state: `CODETAP_HOME` if set and non-empty,
/// else the platform home directory.
pub fn home_dir() -> Result<PathBuf> {
    if let Ok(home) = std::env::var("CODETAP_HOME") {
        if !home.trim().is_empty() {
            return Ok(PathBuf::from(home));
        }
    }
    dirs::home_dir().context("resolve home directory")
}

/// The update-service architecture string for the running machine.
pub fn detect_arch() -> Result<&'static str> {
    match std::env::consts::ARCH {
        "x86_64" => Ok("x64"),
        "aarch64" => Ok("arm64"),
        other => bail!("unsupported architecture: {other}"),
    }
}

/// Socket directory: explicit flag value, else `CODETAP_SOCKET_DIR`, else
/// the `/dev/shm/codetap` default.
pub fn resolve_socket_dir(flag: Option<&Path>) -> PathBuf {
    if let Some(dir) = flag {
        return dir.to_path_buf();
    }
    if let Ok(dir) = std::env::var("CODETAP_SOCKET_DIR") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    PathBuf::from(DEFAULT_SOCKET_DIR)
}

/// Tarball cache directory (`~/.codetap/cache`).
pub fn cache_dir() -> Result<PathBuf> {
    Ok(home_dir()?.join(".codetap").join("cache"))
}

/// Base directory for extracted servers (`~/.codetap/repository`).
pub fn repository_dir() -> Result<PathBuf> {
    Ok(home_dir()?.join(".codetap").join("repository"))
}

/// Raw commit input resolution chain: flag, then `CODETAP_COMMIT`, then the
/// `~/.codetap/.commit` file. Returns an empty string when nothing supplied
/// a value; the caller decides the fallback.
pub fn resolve_commit_input(flag: Option<&str>) -> Result<String> {
    if let Some(value) = flag {
        if !value.trim().is_empty() {
            return Ok(value.trim().to_string());
        }
    }
    if let Ok(value) = std::env::var("CODETAP_COMMIT") {
        if !value.trim().is_empty() {
            return Ok(value.trim().to_string());
        }
    }
    let commit_file = home_dir()?.join(".codetap").join(".commit");
    if let Ok(data) = std::fs::read_to_string(&commit_file) {
        let value = data.trim();
        if !value.is_empty() {
            return Ok(value.to_string());
        }
    }
    Ok(String::new())
}

/// Default session name: the hostname, falling back to a random suffix when
/// the hostname is unavailable.
pub fn default_session_name() -> String {
    if let Ok(name) = hostname::get() {
        let name = name.to_string_lossy().trim().to_string();
        if !name.is_empty() {
            return name;
        }
    }
    use rand::RngCore;
    let mut bytes = [0u8; 4];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    format!("codetap-{}", hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn arch_maps_to_update_service_names() {
        let arch = detect_arch().unwrap();
        assert!(arch == "x64" || arch == "arm64");
    }

    #[test]
    #[serial]
    fn socket_dir_prefers_flag_then_env_then_default() {
        std::env::remove_var("CODETAP_SOCKET_DIR");
        assert_eq!(
            resolve_socket_dir(Some(Path::new("/tmp/custom"))),
            PathBuf::from("/tmp/custom")
        );
        assert_eq!(resolve_socket_dir(None), PathBuf::from(DEFAULT_SOCKET_DIR));

        std::env::set_var("CODETAP_SOCKET_DIR", "/tmp/from-env");
        assert_eq!(resolve_socket_dir(None), PathBuf::from("/tmp/from-env"));
        std::env::remove_var("CODETAP_SOCKET_DIR");
    }

    #[test]
    #[serial]
    fn commit_input_chain_flag_env_file() {
        let home = tempfile::tempdir().unwrap();
        std::env::set_var("CODETAP_HOME", home.path());
        std::env::remove_var("CODETAP_COMMIT");

        assert_eq!(resolve_commit_input(Some("latest")).unwrap(), "latest");
        assert_eq!(resolve_commit_input(None).unwrap(), "");

        std::env::set_var("CODETAP_COMMIT", "1.109.5");
        assert_eq!(resolve_commit_input(None).unwrap(), "1.109.5");
        std::env::remove_var("CODETAP_COMMIT");

        let dot_dir = home.path().join(".codetap");
        std::fs::create_dir_all(&dot_dir).unwrap();
        std::fs::write(dot_dir.join(".commit"), "  abc123\n").unwrap();
        assert_eq!(resolve_commit_input(None).unwrap(), "abc123");

        std::env::remove_var("CODETAP_HOME");
    }

    #[test]
    #[serial]
    fn home_dir_honors_override() {
        std::env::set_var("CODETAP_HOME", "/tmp/codetap-home");
        assert_eq!(home_dir().unwrap(), PathBuf::from("/tmp/codetap-home"));
        std::env::remove_var("CODETAP_HOME");
    }

    #[test]
    fn default_session_name_is_nonempty() {
        assert!(!default_session_name().is_empty());
    }
}
