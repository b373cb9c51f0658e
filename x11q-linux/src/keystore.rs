//! Persistent node identity. The file holds the hex-encoded Ed25519 secret and
//! is created with mode 0600 on first run. A file that exists but cannot be
//! read or decoded is an error and is never overwritten: regenerating would
//! silently change the node id.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use x11q_core::NodeIdentity;
use zeroize::Zeroizing;

#[derive(Debug, thiserror::Error)]
pub enum KeyStoreError {
    #[error("identity store {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("identity store {path} is not a valid key")]
    Corrupt { path: PathBuf },
}

/// `~/.config/x11q/identity.key`, or the working directory without `HOME`.
pub fn default_path() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".config/x11q/identity.key"),
        None => PathBuf::from("x11q-identity.key"),
    }
}

pub fn load_or_create(path: &Path) -> Result<NodeIdentity, KeyStoreError> {
    match fs::read_to_string(path) {
        Ok(text) => decode(Zeroizing::new(text)).ok_or_else(|| KeyStoreError::Corrupt {
            path: path.to_path_buf(),
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => create(path),
        Err(source) => Err(KeyStoreError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn decode(text: Zeroizing<String>) -> Option<NodeIdentity> {
    let mut secret = Zeroizing::new([0u8; 32]);
    hex::decode_to_slice(text.trim(), &mut secret[..]).ok()?;
    Some(NodeIdentity::from_secret_bytes(&secret))
}

fn create(path: &Path) -> Result<NodeIdentity, KeyStoreError> {
    let io_err = |source| KeyStoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let identity = NodeIdentity::generate();
    let encoded = Zeroizing::new(hex::encode(&identity.secret_bytes()[..]));

    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path).map_err(io_err)?;
    file.write_all(encoded.as_bytes()).map_err(io_err)?;
    file.write_all(b"\n").map_err(io_err)?;
    file.sync_all().map_err(io_err)?;
    tracing::info!(path = %path.display(), node = %identity.id().short(), "created node identity");
    Ok(identity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn created_identity_is_stable_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/identity.key");
        let first = load_or_create(&path).unwrap();
        let second = load_or_create(&path).unwrap();
        assert_eq!(first.id(), second.id());
    }

    #[cfg(unix)]
    #[test]
    fn key_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.key");
        load_or_create(&path).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn corrupt_store_is_fatal_and_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.key");
        fs::write(&path, "not a key\n").unwrap();
        assert!(matches!(
            load_or_create(&path),
            Err(KeyStoreError::Corrupt { .. })
        ));
        assert_eq!(fs::read_to_string(&path).unwrap(), "not a key\n");
    }

    #[test]
    fn unreadable_store_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the file should be.
        let path = dir.path().join("identity.key");
        fs::create_dir(&path).unwrap();
        assert!(matches!(
            load_or_create(&path),
            Err(KeyStoreError::Io { .. })
        ));
    }

    #[test]
    fn error_text_never_contains_key_material() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.key");
        let secret = "ab".repeat(31);
        fs::write(&path, &secret).unwrap();
        let err = load_or_create(&path).unwrap_err().to_string();
        assert!(!err.contains(&secret));
    }
}
