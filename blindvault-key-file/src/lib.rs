//! File-based key configuration for `BlindVault`.
//!
//! Keys live in a small, human-editable TOML file:
//!
//! ```text
//! keys/
//! ├── keys.toml                          (0600 permissions)
//! ├── keys.20261018T101500.123Z.bak      (backup written before each switch)
//! ├── keys.pending.toml                  (generated target keys of an unfinished rotation)
//! └── rotation.checkpoint.toml           (present only while a rotation is in flight)
//! ```
//!
//! ```toml
//! encryption_key = "base64..."
//! index_key = "base64..."
//! created_at = "2026-10-18T10:15:00Z"
//! ```

#![warn(clippy::pedantic, clippy::nursery)]

use base64::{engine::general_purpose::STANDARD, Engine};
use blindvault::error::KeyStoreError;
use blindvault::key_store::{Checkpoint, KeyConfigStore, Notifier, RotationCheckpoint};
use blindvault::keys::KeyMaterial;
use blindvault::report::RotationReport;
use chrono::{SecondsFormat, Utc};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// On-disk representation of a key pair.
#[derive(Serialize, Deserialize)]
struct KeyFile {
    encryption_key: String,
    index_key: String,
    #[serde(default)]
    created_at: Option<String>,
}

impl KeyFile {
    fn from_keys(keys: &KeyMaterial) -> Self {
        Self {
            encryption_key: STANDARD.encode(keys.encryption_key().expose_secret()),
            index_key: STANDARD.encode(keys.index_key().expose_secret()),
            created_at: Some(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
        }
    }

    fn to_keys(&self) -> Result<KeyMaterial, KeyStoreError> {
        let encryption_key = STANDARD
            .decode(self.encryption_key.trim())
            .map_err(|e| KeyStoreError::Malformed(format!("encryption_key: {e}")))?;
        let index_key = STANDARD
            .decode(self.index_key.trim())
            .map_err(|e| KeyStoreError::Malformed(format!("index_key: {e}")))?;
        KeyMaterial::from_slices(&encryption_key, &index_key)
            .map_err(|e| KeyStoreError::Malformed(e.to_string()))
    }
}

/// Writes `contents` to `path` via a temporary sibling and a rename, so
/// readers never observe a half-written file.
fn write_atomic(path: &Path, contents: &str) -> Result<(), KeyStoreError> {
    let tmp = path.with_extension("tmp");
    let write = || -> std::io::Result<()> {
        let mut file = open_private(&tmp)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    };
    write().map_err(|e| KeyStoreError::WriteFailed(format!("{}: {e}", path.display())))
}

#[cfg(unix)]
fn open_private(path: &Path) -> std::io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    fs::OpenOptions::new().write(true).create(true).truncate(true).mode(0o600).open(path)
}

#[cfg(not(unix))]
fn open_private(path: &Path) -> std::io::Result<fs::File> {
    fs::OpenOptions::new().write(true).create(true).truncate(true).open(path)
}

fn timestamp() -> String {
    Utc::now().format("%Y%m%dT%H%M%S%.3fZ").to_string()
}

/// Key configuration stored in a TOML file.
pub struct FileKeyStore {
    path: PathBuf,
}

impl FileKeyStore {
    /// Creates a store for an existing key file.
    ///
    /// # Errors
    ///
    /// Returns `KeyStoreError::NotFound` if the file does not exist.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, KeyStoreError> {
        let path = path.into();
        if !path.is_file() {
            return Err(KeyStoreError::NotFound(path.display().to_string()));
        }
        Ok(Self { path })
    }

    /// Writes a freshly generated key pair to `path` and returns a store for it.
    ///
    /// # Errors
    ///
    /// Returns `KeyStoreError::WriteFailed` if the file already exists or
    /// cannot be written.
    pub fn init(path: impl Into<PathBuf>) -> Result<Self, KeyStoreError> {
        let path = path.into();
        if path.exists() {
            return Err(KeyStoreError::WriteFailed(format!(
                "refusing to overwrite existing key file {}",
                path.display()
            )));
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let keys = KeyMaterial::generate();
        let store = Self { path };
        store.write_keys(&keys)?;
        info!(path = %store.path.display(), fingerprint = %keys.fingerprint(), "key file initialized");
        Ok(store)
    }

    /// Path of the key file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the pending key file holding the target pair of a rotation
    /// that has not switched the configuration yet.
    #[must_use]
    pub fn pending_path(&self) -> PathBuf {
        self.path.with_file_name(format!("{}.pending.toml", self.stem()))
    }

    /// Returns the pending target key pair, generating and saving one (0600)
    /// when none exists yet.
    ///
    /// The pair is on disk before any record is rotated to it, so a run that
    /// stops part-way can be resumed with the same keys. A pending file that
    /// holds the current keys is left over from a finished rotation and is
    /// replaced.
    ///
    /// # Errors
    ///
    /// Returns `KeyStoreError` if the current or pending file cannot be read
    /// or the new pending file cannot be written.
    pub fn pending_keys(&self) -> Result<KeyMaterial, KeyStoreError> {
        let current = self.load()?.fingerprint();
        let path = self.pending_path();
        if path.is_file() {
            let pending = read_key_file(&path)?;
            if pending.fingerprint() != current {
                info!(path = %path.display(), fingerprint = %pending.fingerprint(), "reusing pending rotation keys");
                return Ok(pending);
            }
            debug!(path = %path.display(), "pending keys are already active; generating a new pair");
        }

        let keys = KeyMaterial::generate();
        write_key_file(&path, &keys)?;
        info!(path = %path.display(), fingerprint = %keys.fingerprint(), "pending rotation keys written");
        Ok(keys)
    }

    /// Removes the pending key file once its keys are the configured ones.
    ///
    /// # Errors
    ///
    /// Returns `KeyStoreError::Io` if the file exists but cannot be removed.
    pub fn clear_pending(&self) -> Result<(), KeyStoreError> {
        match fs::remove_file(self.pending_path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(KeyStoreError::Io(e)),
        }
    }

    fn write_keys(&self, keys: &KeyMaterial) -> Result<(), KeyStoreError> {
        write_key_file(&self.path, keys)
    }

    fn stem(&self) -> String {
        self.path.file_stem().map_or_else(|| "keys".to_string(), |s| s.to_string_lossy().into_owned())
    }

    fn backup_path(&self) -> PathBuf {
        let stem = self.stem();
        let stamp = timestamp();
        let mut candidate = self.path.with_file_name(format!("{stem}.{stamp}.bak"));
        let mut n = 1;
        while candidate.exists() {
            candidate = self.path.with_file_name(format!("{stem}.{stamp}-{n}.bak"));
            n += 1;
        }
        candidate
    }
}

/// Writes `keys` to `path` as a TOML key file with owner-only permissions.
///
/// # Errors
///
/// Returns `KeyStoreError::WriteFailed` if the file cannot be written.
pub fn write_key_file(path: &Path, keys: &KeyMaterial) -> Result<(), KeyStoreError> {
    let text = toml::to_string(&KeyFile::from_keys(keys))
        .map_err(|e| KeyStoreError::WriteFailed(e.to_string()))?;
    write_atomic(path, &text)
}

/// Reads and parses a key file.
///
/// # Errors
///
/// Returns `KeyStoreError::NotFound` if the file is missing and
/// `KeyStoreError::Malformed` if it cannot be parsed.
pub fn read_key_file(path: &Path) -> Result<KeyMaterial, KeyStoreError> {
    let text = fs::read_to_string(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => KeyStoreError::NotFound(path.display().to_string()),
        _ => KeyStoreError::Io(e),
    })?;
    let file: KeyFile =
        toml::from_str(&text).map_err(|e| KeyStoreError::Malformed(e.to_string()))?;
    file.to_keys()
}

impl KeyConfigStore for FileKeyStore {
    fn load(&self) -> Result<KeyMaterial, KeyStoreError> {
        read_key_file(&self.path)
    }

    fn backup(&self) -> Result<String, KeyStoreError> {
        let target = self.backup_path();
        let contents = fs::read_to_string(&self.path)
            .map_err(|e| KeyStoreError::WriteFailed(format!("cannot read current keys: {e}")))?;
        write_atomic(&target, &contents)?;
        debug!(backup = %target.display(), "key file backed up");
        Ok(target.display().to_string())
    }

    fn store(&self, keys: &KeyMaterial) -> Result<(), KeyStoreError> {
        self.write_keys(keys)
    }
}

/// Rotation checkpoint kept in a TOML file.
pub struct FileCheckpoint {
    path: PathBuf,
}

impl FileCheckpoint {
    /// Creates a checkpoint stored at `path` (the file need not exist).
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl RotationCheckpoint for FileCheckpoint {
    fn load(&self) -> Result<Option<Checkpoint>, KeyStoreError> {
        match fs::read_to_string(&self.path) {
            Ok(text) => toml::from_str(&text)
                .map(Some)
                .map_err(|e| KeyStoreError::Malformed(format!("checkpoint: {e}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(KeyStoreError::Io(e)),
        }
    }

    fn save(&self, checkpoint: &Checkpoint) -> Result<(), KeyStoreError> {
        let text =
            toml::to_string(checkpoint).map_err(|e| KeyStoreError::WriteFailed(e.to_string()))?;
        write_atomic(&self.path, &text)
    }

    fn clear(&self) -> Result<(), KeyStoreError> {
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(KeyStoreError::Io(e)),
            _ => Ok(()),
        }
    }
}

/// Notifier that drops the new keys and the run report into a directory
/// meant for offline backup (a mounted vault, removable media, ...).
///
/// Each rotation writes `rotation-<timestamp>.keys.toml` and
/// `rotation-<timestamp>.report.json`.
pub struct OfflineBackupNotifier {
    dir: PathBuf,
}

impl OfflineBackupNotifier {
    /// Creates a notifier writing into `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl Notifier for OfflineBackupNotifier {
    fn notify(&self, keys: &KeyMaterial, report: &RotationReport) -> Result<(), KeyStoreError> {
        let failed = |e: &dyn std::fmt::Display| KeyStoreError::NotifyFailed(e.to_string());

        fs::create_dir_all(&self.dir).map_err(|e| failed(&e))?;
        let stamp = timestamp();

        let keys_text = toml::to_string(&KeyFile::from_keys(keys)).map_err(|e| failed(&e))?;
        write_atomic(&self.dir.join(format!("rotation-{stamp}.keys.toml")), &keys_text)
            .map_err(|e| failed(&e))?;

        let report_text = serde_json::to_string_pretty(report).map_err(|e| failed(&e))?;
        write_atomic(&self.dir.join(format!("rotation-{stamp}.report.json")), &report_text)
            .map_err(|e| failed(&e))?;

        info!(dir = %self.dir.display(), "new keys written for offline backup");
        Ok(())
    }
}
