//! On-disk state the engine owns directly (SPEC_FULL.md §3 supplemented features):
//! the capped recent-servers list and the certs directory bootstrap. Everything else
//! named in distilled spec §6 "Persisted state" (headers file, config key-value store)
//! belongs to the out-of-scope collaborators; this module only covers what the
//! distillation explicitly carved out as ours.
use std::path::{Path, PathBuf};

use thiserror::Error;

use hsync_types::network::RECENT_SERVERS_CAP;
use hsync_types::peer::PeerDescriptor;

/// Errors reading or writing persisted engine state.
#[derive(Debug, Error)]
pub enum Error {
    /// The recent-servers file existed but didn't parse as a JSON string array.
    #[error("recent_servers file is not a JSON array of strings: {0}")]
    Malformed(#[source] serde_json::Error),
    /// Writing the recent-servers file failed.
    #[error("failed to write {0}: {1}")]
    Write(PathBuf, #[source] std::io::Error),
    /// Creating the certs directory failed.
    #[error("failed to create certs directory {0}: {1}")]
    CreateCertDir(PathBuf, #[source] std::io::Error),
    /// Setting owner-only permissions on the certs directory failed.
    #[error("failed to set permissions on {0}: {1}")]
    SetPermissions(PathBuf, #[source] std::io::Error),
}

fn recent_servers_path(config_dir: &Path) -> PathBuf {
    config_dir.join("recent_servers")
}

/// Read the capped, most-recent-first list of peer descriptor strings
/// (distilled spec §6). A missing or unparseable file is treated as empty, matching
/// the original's `read_recent_servers`'s blanket `except: return []`.
pub fn read_recent_servers(config_dir: &Path) -> Vec<String> {
    let path = recent_servers_path(config_dir);
    let Ok(data) = std::fs::read_to_string(&path) else {
        return Vec::new();
    };
    serde_json::from_str(&data).unwrap_or_default()
}

/// Overwrite the recent-servers file with `servers`.
pub fn save_recent_servers(config_dir: &Path, servers: &[String]) -> Result<(), Error> {
    let path = recent_servers_path(config_dir);
    let json = serde_json::to_string_pretty(servers).map_err(Error::Malformed)?;
    std::fs::write(&path, json).map_err(|e| Error::Write(path, e))
}

/// Move `server` to the front of `recent`, inserting it if absent, and truncate to
/// [`RECENT_SERVERS_CAP`] entries (distilled spec §6 "capped at 20, most-recent-first").
pub fn add_recent_server(recent: &mut Vec<String>, server: &PeerDescriptor) {
    let server = server.to_string();
    recent.retain(|s| s != &server);
    recent.insert(0, server);
    recent.truncate(RECENT_SERVERS_CAP);
}

/// Ensure `<config_dir>/certs/` exists with owner-only permissions, creating it if
/// missing (distilled spec §6; grounded on `apps/node/src/cli/node.rs::init_storage`'s
/// `create_dir_all` + `wrap_err_with` idiom for bootstrapping a config-owned directory).
pub fn ensure_cert_dir(config_dir: &Path) -> Result<PathBuf, Error> {
    let certs = config_dir.join("certs");
    if !certs.exists() {
        std::fs::create_dir_all(&certs).map_err(|e| Error::CreateCertDir(certs.clone(), e))?;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o700);
        std::fs::set_permissions(&certs, perms)
            .map_err(|e| Error::SetPermissions(certs.clone(), e))?;
    }

    Ok(certs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hsync_types::peer::Protocol;

    #[test]
    fn read_missing_file_is_empty() {
        let dir = tempdir();
        assert!(read_recent_servers(dir.path()).is_empty());
    }

    #[test]
    fn save_then_read_roundtrips() {
        let dir = tempdir();
        let servers = vec!["a.example:50002:s".to_string(), "b.example:50001:t".to_string()];
        save_recent_servers(dir.path(), &servers).unwrap();
        assert_eq!(read_recent_servers(dir.path()), servers);
    }

    #[test]
    fn add_recent_server_moves_existing_entry_to_front() {
        let mut recent = vec!["b:1:s".to_string(), "a:1:s".to_string()];
        add_recent_server(&mut recent, &PeerDescriptor::new("a", 1, Protocol::Tls));
        assert_eq!(recent, vec!["a:1:s".to_string(), "b:1:s".to_string()]);
    }

    #[test]
    fn add_recent_server_caps_at_twenty() {
        let mut recent: Vec<String> = (0..25).map(|i| format!("host{i}:1:s")).collect();
        add_recent_server(&mut recent, &PeerDescriptor::new("new", 1, Protocol::Tls));
        assert_eq!(recent.len(), RECENT_SERVERS_CAP);
        assert_eq!(recent[0], "new:1:s");
    }

    #[test]
    fn ensure_cert_dir_creates_directory() {
        let dir = tempdir();
        let certs = ensure_cert_dir(dir.path()).unwrap();
        assert!(certs.is_dir());
    }

    fn tempdir() -> TempDir {
        TempDir::new()
    }

    /// A tiny self-cleaning temp directory, avoiding a `tempfile` dev-dependency for
    /// what amounts to three tests.
    struct TempDir(PathBuf);

    impl TempDir {
        fn new() -> Self {
            let path = std::env::temp_dir().join(format!(
                "hsync-engine-test-{}-{}",
                std::process::id(),
                fastrand::u64(..)
            ));
            std::fs::create_dir_all(&path).unwrap();
            Self(path)
        }

        fn path(&self) -> &Path {
            &self.0
        }
    }

    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.0);
        }
    }
}
