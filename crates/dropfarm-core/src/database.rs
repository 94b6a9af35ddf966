//! Persisted per-account and process-wide state.
//!
//! Every mutation serializes the full record and atomically replaces the
//! on-disk file (write `<file>.tmp`, then rename), so readers never observe
//! a torn write. The bot database is owned by its bot; the global database
//! is shared across bots with last-writer-wins semantics.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::error::{CoreError, Result};

/// Mobile-authenticator enrollment data for one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatorSecrets {
    /// Base64 secret the time-based codes are derived from.
    pub shared_secret: String,
    /// Base64 secret used to sign confirmation requests.
    pub identity_secret: String,
    /// Device identifier presented alongside confirmation queries.
    pub device_id: String,
    /// Web-session cookies captured at enrollment time.
    #[serde(default)]
    pub session_cookies: HashMap<String, String>,
}

/// On-disk shape of a bot's database.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct BotRecord {
    /// Remembered session key. Present means the password can be omitted
    /// on the next logon.
    login_key: Option<String>,
    authenticator: Option<AuthenticatorSecrets>,
}

/// Per-account persisted state, written through on every mutation.
pub struct BotDatabase {
    path: PathBuf,
    record: RwLock<BotRecord>,
}

impl BotDatabase {
    /// Load a bot database, creating an empty record when the file does
    /// not exist yet.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let record = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str(&content).map_err(|e| {
                CoreError::Database(format!("Corrupt bot database {}: {e}", path.display()))
            })?
        } else {
            BotRecord::default()
        };
        Ok(Self {
            path,
            record: RwLock::new(record),
        })
    }

    pub fn login_key(&self) -> Option<String> {
        self.read().login_key.clone()
    }

    /// Persist a new remembered session key (or clear it with `None`).
    pub fn set_login_key(&self, key: Option<String>) -> Result<()> {
        self.mutate(|r| r.login_key = key)
    }

    pub fn authenticator(&self) -> Option<AuthenticatorSecrets> {
        self.read().authenticator.clone()
    }

    pub fn set_authenticator(&self, secrets: Option<AuthenticatorSecrets>) -> Result<()> {
        self.mutate(|r| r.authenticator = secrets)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BotRecord> {
        self.record.read().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn mutate(&self, f: impl FnOnce(&mut BotRecord)) -> Result<()> {
        let mut record = self
            .record
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut record);
        atomic_write_json(&self.path, &*record)
    }
}

/// On-disk shape of the global database.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct GlobalRecord {
    /// Last observed cell id, used to pre-seed server selection.
    cell_id: u32,
}

/// Process-wide persisted state shared by all bots.
pub struct GlobalDatabase {
    path: PathBuf,
    record: RwLock<GlobalRecord>,
}

impl GlobalDatabase {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let record = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str(&content).map_err(|e| {
                CoreError::Database(format!("Corrupt global database {}: {e}", path.display()))
            })?
        } else {
            GlobalRecord::default()
        };
        Ok(Self {
            path,
            record: RwLock::new(record),
        })
    }

    pub fn cell_id(&self) -> u32 {
        self.record
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .cell_id
    }

    /// Store a new cell id. Concurrent callers race last-writer-wins; the
    /// replace itself is atomic either way.
    pub fn set_cell_id(&self, cell_id: u32) -> Result<()> {
        let mut record = self
            .record
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if record.cell_id == cell_id {
            return Ok(());
        }
        record.cell_id = cell_id;
        atomic_write_json(&self.path, &*record)
    }
}

/// Serialize `value` as JSON and atomically replace `path` with it.
fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Apply a machine-auth sentry chunk at `offset` and return the SHA-1 of
/// the whole file together with its new size.
///
/// The platform sends chunks for one session strictly in arrival order, so
/// no extra locking happens here.
pub fn write_sentry_chunk(path: &Path, offset: u64, data: &[u8]) -> Result<(Vec<u8>, u64)> {
    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(data)?;
    file.flush()?;

    file.seek(SeekFrom::Start(0))?;
    let mut contents = Vec::new();
    file.read_to_end(&mut contents)?;

    let hash = Sha1::digest(&contents).to_vec();
    Ok((hash, contents.len() as u64))
}

/// SHA-1 of an existing sentry file, or `None` when the account has none
/// on this device yet.
pub fn sentry_hash(path: &Path) -> Result<Option<Vec<u8>>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read(path)?;
    Ok(Some(Sha1::digest(&contents).to_vec()))
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn bot_database_round_trips_all_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("main.db.json");

        let db = BotDatabase::load(&path).unwrap();
        db.set_login_key(Some("remembered-key".into())).unwrap();
        db.set_authenticator(Some(AuthenticatorSecrets {
            shared_secret: "c2hhcmVk".into(),
            identity_secret: "aWRlbnRpdHk=".into(),
            device_id: "android:a-b-c".into(),
            session_cookies: [("sessionid".to_string(), "abc".to_string())].into(),
        }))
        .unwrap();

        let reloaded = BotDatabase::load(&path).unwrap();
        assert_eq!(reloaded.login_key(), Some("remembered-key".to_string()));
        let auth = reloaded.authenticator().unwrap();
        assert_eq!(auth.device_id, "android:a-b-c");
        assert_eq!(auth.session_cookies.get("sessionid").unwrap(), "abc");
    }

    #[test]
    fn clearing_login_key_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("main.db.json");

        let db = BotDatabase::load(&path).unwrap();
        db.set_login_key(Some("expired".into())).unwrap();
        db.set_login_key(None).unwrap();

        let reloaded = BotDatabase::load(&path).unwrap();
        assert_eq!(reloaded.login_key(), None);
    }

    #[test]
    fn missing_database_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let db = BotDatabase::load(dir.path().join("fresh.db.json")).unwrap();
        assert_eq!(db.login_key(), None);
        assert_eq!(db.authenticator(), None);
    }

    #[test]
    fn corrupt_database_is_an_error_not_a_reset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.db.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(BotDatabase::load(&path).is_err());
    }

    #[test]
    fn global_database_persists_cell_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("global.db.json");

        let db = GlobalDatabase::load(&path).unwrap();
        assert_eq!(db.cell_id(), 0);
        db.set_cell_id(92).unwrap();

        let reloaded = GlobalDatabase::load(&path).unwrap();
        assert_eq!(reloaded.cell_id(), 92);
    }

    #[test]
    fn no_tmp_file_left_behind_after_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("main.db.json");
        let db = BotDatabase::load(&path).unwrap();
        db.set_login_key(Some("k".into())).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn sentry_chunks_append_and_hash_full_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("main.sentry.bin");

        let (hash1, size1) = write_sentry_chunk(&path, 0, b"abcd").unwrap();
        assert_eq!(size1, 4);
        assert_eq!(hash1, Sha1::digest(b"abcd").to_vec());

        let (hash2, size2) = write_sentry_chunk(&path, 4, b"efgh").unwrap();
        assert_eq!(size2, 8);
        assert_eq!(hash2, Sha1::digest(b"abcdefgh").to_vec());

        // Overwrite in the middle re-hashes the whole file.
        let (hash3, size3) = write_sentry_chunk(&path, 2, b"XY").unwrap();
        assert_eq!(size3, 8);
        assert_eq!(hash3, Sha1::digest(b"abXYefgh").to_vec());

        assert_eq!(sentry_hash(&path).unwrap(), Some(hash3));
    }

    #[test]
    fn sentry_hash_none_when_no_file() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(sentry_hash(&dir.path().join("none.bin")).unwrap(), None);
    }
}
