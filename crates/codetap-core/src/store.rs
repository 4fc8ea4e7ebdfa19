//! Session socket paths and discovery.
//!
//! The socket directory IS the session registry. Each live session owns two
//! well-known paths, `<name>.sock` (data) and `<name>.ctl.sock` (control),
//! and nothing else: no metadata files, no token files. Presence of the
//! control socket is the discoverability signal; liveness is whether an
//! `INFO` query completes.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

const CTL_SUFFIX: &str = ".ctl.sock";

/// Maps session names to their socket pair inside one directory.
#[derive(Debug, Clone)]
pub struct SessionStore {
    socket_dir: PathBuf,
}

impl SessionStore {
    pub fn new(socket_dir: impl Into<PathBuf>) -> Self {
        Self { socket_dir: socket_dir.into() }
    }

    pub fn socket_dir(&self) -> &Path {
        &self.socket_dir
    }

    /// Create the socket directory if it does not exist yet.
    pub fn ensure_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.socket_dir)
            .with_context(|| format!("create socket dir {}", self.socket_dir.display()))
    }

    /// Path of the data socket for `name`.
    pub fn socket_path(&self, name: &str) -> PathBuf {
        self.socket_dir.join(format!("{name}.sock"))
    }

    /// Path of the control socket for `name`.
    pub fn ctl_socket_path(&self, name: &str) -> PathBuf {
        self.socket_dir.join(format!("{name}{CTL_SUFFIX}"))
    }

    /// All session names discovered in the directory, sorted. A session is
    /// any entry ending in `.ctl.sock`; liveness is not checked here.
    pub fn list_session_names(&self) -> Result<Vec<String>> {
        let entries = match std::fs::read_dir(&self.socket_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("read socket dir {}", self.socket_dir.display()))
            }
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.context("read socket dir entry")?;
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else { continue };
            if let Some(name) = file_name.strip_suffix(CTL_SUFFIX) {
                if !name.is_empty() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Remove both sockets for `name`. Missing files are not an error.
    pub fn remove(&self, name: &str) -> Result<()> {
        for path in [self.socket_path(name), self.ctl_socket_path(name)] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("remove {}", path.display()))
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_use_well_known_suffixes() {
        let store = SessionStore::new("/dev/shm/codetap");
        assert_eq!(
            store.socket_path("dev"),
            PathBuf::from("/dev/shm/codetap/dev.sock")
        );
        assert_eq!(
            store.ctl_socket_path("dev"),
            PathBuf::from("/dev/shm/codetap/dev.ctl.sock")
        );
    }

    #[test]
    fn list_names_scans_ctl_sockets_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());

        std::fs::write(store.ctl_socket_path("beta"), b"").unwrap();
        std::fs::write(store.ctl_socket_path("alpha"), b"").unwrap();
        std::fs::write(store.socket_path("gamma"), b"").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"").unwrap();

        let names = store.list_session_names().unwrap();
        assert_eq!(names, vec!["alpha".to_string(), "beta".to_string()]);
    }

    #[test]
    fn list_names_on_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("absent"));
        assert!(store.list_session_names().unwrap().is_empty());
    }

    #[test]
    fn remove_deletes_both_sockets_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());

        std::fs::write(store.socket_path("dev"), b"").unwrap();
        std::fs::write(store.ctl_socket_path("dev"), b"").unwrap();

        store.remove("dev").unwrap();
        assert!(!store.socket_path("dev").exists());
        assert!(!store.ctl_socket_path("dev").exists());

        // Second removal is a no-op.
        store.remove("dev").unwrap();
    }
}
