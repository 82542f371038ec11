//! Collaborators the rotation pipeline hands keys and progress to.
//!
//! Key material lives outside the record store, in a configuration store an
//! operator can read and edit. Rotation also needs somewhere to record its
//! progress (for resuming an interrupted run) and someone to hand the new
//! keys to for offline safekeeping.

use crate::error::KeyStoreError;
use crate::keys::KeyMaterial;
use crate::report::RotationReport;
use crate::store::RecordId;
use serde::{Deserialize, Serialize};
use tracing::info;

/// External configuration holding the active key pair.
///
/// Implementations must be thread-safe (`Send + Sync`).
pub trait KeyConfigStore: Send + Sync {
    /// Loads the currently configured key pair.
    ///
    /// # Errors
    ///
    /// Returns `KeyStoreError::NotFound` if nothing is configured, or
    /// `KeyStoreError::Malformed` if the configuration cannot be parsed.
    fn load(&self) -> Result<KeyMaterial, KeyStoreError>;

    /// Writes a timestamped copy of the current configuration.
    ///
    /// # Returns
    ///
    /// A reference (path, object name, ...) identifying the backup.
    ///
    /// # Errors
    ///
    /// Returns `KeyStoreError::WriteFailed` if the backup cannot be written.
    fn backup(&self) -> Result<String, KeyStoreError>;

    /// Replaces the configured key pair.
    ///
    /// # Errors
    ///
    /// Returns `KeyStoreError::WriteFailed` if the write fails.
    fn store(&self, keys: &KeyMaterial) -> Result<(), KeyStoreError>;
}

/// Out-of-band delivery of freshly rotated keys (for example secure email).
pub trait Notifier: Send + Sync {
    /// Hands over the new keys and the run's report.
    ///
    /// # Errors
    ///
    /// Returns `KeyStoreError::NotifyFailed` on delivery failure. The pipeline
    /// logs this and carries on.
    fn notify(&self, keys: &KeyMaterial, report: &RotationReport) -> Result<(), KeyStoreError>;
}

/// Progress marker of a rotation run towards a specific key pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Fingerprint of the key pair the run is rotating to.
    pub target_fingerprint: String,
    /// Highest record id whose batch has been handled.
    pub last_rotated_id: RecordId,
    /// Records whose batch failed to commit. A resumed run retries these
    /// before continuing after `last_rotated_id`.
    #[serde(default)]
    pub failed_ids: Vec<RecordId>,
}

/// Durable storage for a rotation [`Checkpoint`].
pub trait RotationCheckpoint: Send + Sync {
    /// Returns the saved checkpoint, if any.
    ///
    /// # Errors
    ///
    /// Returns `KeyStoreError` if the checkpoint cannot be read.
    fn load(&self) -> Result<Option<Checkpoint>, KeyStoreError>;

    /// Saves `checkpoint`, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns `KeyStoreError` if the checkpoint cannot be written.
    fn save(&self, checkpoint: &Checkpoint) -> Result<(), KeyStoreError>;

    /// Removes the checkpoint after a completed run.
    ///
    /// # Errors
    ///
    /// Returns `KeyStoreError` if the checkpoint cannot be removed.
    fn clear(&self) -> Result<(), KeyStoreError>;
}

/// Notifier that only records the rotation in the log.
///
/// Never logs key bytes, only fingerprints.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, keys: &KeyMaterial, report: &RotationReport) -> Result<(), KeyStoreError> {
        info!(
            fingerprint = %keys.fingerprint(),
            processed = report.processed,
            errors = report.errors,
            "key rotation completed; store the new key pair offline"
        );
        Ok(())
    }
}
