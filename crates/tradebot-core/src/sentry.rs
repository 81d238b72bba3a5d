// Device-trust ("sentry") persistence.
//
// When an account completes an out-of-band verification, the remote service
// pushes an opaque payload that proves this machine was trusted. The payload
// is written to `{account}.sentryfile` and its SHA-1 digest is echoed back on
// every later logon so the verification step can be skipped.

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use thiserror::Error;
use tracing::{debug, warn};

/// File extension of persisted sentry payloads.
pub const SENTRY_FILE_EXTENSION: &str = "sentryfile";

#[derive(Debug, Error)]
pub enum SentryError {
    #[error("invalid account name for sentry file: {account:?}")]
    InvalidAccount { account: String },

    #[error("failed to {operation} sentry file {path}: {source}")]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// SHA-1 digest of a sentry payload.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SentryHash([u8; 20]);

impl SentryHash {
    /// Hash a raw sentry payload.
    pub fn of(payload: &[u8]) -> Self {
        let digest = Sha1::digest(payload);
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&digest);
        SentryHash(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for SentryHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SentryHash({})", self.to_hex())
    }
}

impl fmt::Display for SentryHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Per-account storage for device-trust payloads.
///
/// `load` is soft: any problem reading the record is reported as "no
/// record" so a logon can always proceed (it will simply require
/// verification again).
pub trait SentryStore: Send + Sync {
    fn load(&self, account: &str) -> Option<SentryHash>;
    fn save(&self, account: &str, payload: &[u8]) -> Result<SentryHash, SentryError>;
}

/// Stores each account's payload as `{account}.sentryfile` inside `dir`.
#[derive(Debug, Clone)]
pub struct FileSentryStore {
    dir: PathBuf,
}

impl FileSentryStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Path of the sentry file for `account`.
    pub fn path_for(&self, account: &str) -> Result<PathBuf, SentryError> {
        validate_account(account)?;
        Ok(self
            .dir
            .join(format!("{account}.{SENTRY_FILE_EXTENSION}")))
    }
}

impl SentryStore for FileSentryStore {
    fn load(&self, account: &str) -> Option<SentryHash> {
        let path = match self.path_for(account) {
            Ok(p) => p,
            Err(e) => {
                warn!("Not loading sentry: {}", e);
                return None;
            }
        };

        match fs::read(&path) {
            Ok(bytes) if bytes.is_empty() => {
                debug!("Sentry file {} is empty, ignoring", path.display());
                None
            }
            Ok(bytes) => Some(SentryHash::of(&bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!("Failed to read sentry file {}: {}", path.display(), e);
                None
            }
        }
    }

    fn save(&self, account: &str, payload: &[u8]) -> Result<SentryHash, SentryError> {
        let path = self.path_for(account)?;
        let hash = SentryHash::of(payload);

        fs::create_dir_all(&self.dir).map_err(|source| SentryError::Io {
            operation: "create directory for",
            path: path.clone(),
            source,
        })?;

        // Write to a sibling temp file and rename over the target so a
        // concurrent logon never reads a half-written payload.
        let tmp_path = path.with_extension(format!("{SENTRY_FILE_EXTENSION}.tmp"));
        let mut file = fs::File::create(&tmp_path).map_err(|source| SentryError::Io {
            operation: "create",
            path: tmp_path.clone(),
            source,
        })?;
        file.write_all(payload)
            .and_then(|()| file.sync_all())
            .map_err(|source| SentryError::Io {
                operation: "write",
                path: tmp_path.clone(),
                source,
            })?;
        drop(file);

        fs::rename(&tmp_path, &path).map_err(|source| SentryError::Io {
            operation: "replace",
            path: path.clone(),
            source,
        })?;

        debug!("Wrote {} sentry bytes to {}", payload.len(), path.display());
        Ok(hash)
    }
}

fn validate_account(account: &str) -> Result<(), SentryError> {
    let bad = account.is_empty()
        || account == "."
        || account == ".."
        || account.contains(['/', '\\', '\0']);
    if bad {
        return Err(SentryError::InvalidAccount {
            account: account.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_matches_known_sha1_vector() {
        let hash = SentryHash::of(b"abc");
        assert_eq!(hash.to_hex(), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn load_without_file_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSentryStore::new(dir.path());
        assert_eq!(store.load("bot"), None);
    }

    #[test]
    fn load_of_empty_file_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bot.sentryfile"), b"").unwrap();
        let store = FileSentryStore::new(dir.path());
        assert_eq!(store.load("bot"), None);
    }

    #[test]
    fn save_then_load_returns_same_hash() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSentryStore::new(dir.path());

        let saved = store.save("bot", b"machine-auth-bytes").unwrap();
        assert_eq!(store.load("bot"), Some(saved));
        assert_eq!(saved, SentryHash::of(b"machine-auth-bytes"));
    }

    #[test]
    fn saving_identical_payload_twice_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSentryStore::new(dir.path());

        let first = store.save("bot", b"payload").unwrap();
        let second = store.save("bot", b"payload").unwrap();
        assert_eq!(first, second);
        assert_eq!(store.load("bot"), Some(first));
    }

    #[test]
    fn newer_payload_overwrites_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSentryStore::new(dir.path());

        store.save("bot", b"old").unwrap();
        let newer = store.save("bot", b"new").unwrap();
        assert_eq!(store.load("bot"), Some(newer));
        assert_eq!(
            std::fs::read(dir.path().join("bot.sentryfile")).unwrap(),
            b"new"
        );
    }

    #[test]
    fn records_are_keyed_by_account() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSentryStore::new(dir.path());

        let a = store.save("alpha", b"one").unwrap();
        assert_eq!(store.load("alpha"), Some(a));
        assert_eq!(store.load("beta"), None);
    }

    #[test]
    fn save_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("state").join("sentry");
        let store = FileSentryStore::new(&nested);

        store.save("bot", b"x").unwrap();
        assert!(nested.join("bot.sentryfile").is_file());
    }

    #[test]
    fn path_traversal_account_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSentryStore::new(dir.path());

        assert!(matches!(
            store.save("../evil", b"x"),
            Err(SentryError::InvalidAccount { .. })
        ));
        assert_eq!(store.load("../evil"), None);
    }
}
