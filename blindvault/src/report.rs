//! Summary of one key rotation run.

use crate::store::RecordId;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

/// Why a record (or one of its fields) was not rotated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum FailureKind {
    /// The field did not decrypt under the old key; it was left untouched.
    FieldDecrypt,
    /// The field decrypted but could not be re-encrypted or re-indexed.
    FieldReseal,
    /// The record's whole batch failed to commit and was rolled back.
    BatchCommit,
    /// The application kept rewriting the record while it was being rotated;
    /// it was left under the old keys.
    ConcurrentWrite,
}

/// One entry of [`RotationReport::failures`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RotationFailure {
    pub record_id: RecordId,
    /// Affected field; `None` when the whole record failed.
    pub field: Option<String>,
    pub kind: FailureKind,
    pub reason: String,
}

/// Result of a rotation run.
///
/// `errors` is the number of failed fields plus the number of records in
/// batches that failed to commit or that changed on every attempt. A non-zero count does not fail the run;
/// [`failed_ids`](Self::failed_ids) lists the records needing attention.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RotationReport {
    /// Records in scope for this run.
    pub total: u64,
    /// Records whose rewrite committed, plus records deleted before it could.
    pub processed: u64,
    pub errors: u64,
    /// Batches attempted.
    pub batches: u64,
    pub duration: Duration,
    /// Reference to the pre-switch configuration backup.
    pub backup_reference: Option<String>,
    /// Set when the run continued from a saved checkpoint.
    pub resumed_after: Option<RecordId>,
    pub old_key_fingerprint: String,
    pub new_key_fingerprint: String,
    /// Whether the out-of-band notification was delivered.
    pub notified: bool,
    pub failures: Vec<RotationFailure>,
}

impl RotationReport {
    /// Returns true when every record and field rotated.
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        self.errors == 0
    }

    /// Distinct ids of records with at least one failure, ascending.
    #[must_use]
    pub fn failed_ids(&self) -> Vec<RecordId> {
        self.failures.iter().map(|f| f.record_id).collect::<BTreeSet<_>>().into_iter().collect()
    }

    pub(crate) fn record_failure(
        &mut self,
        record_id: RecordId,
        field: Option<&str>,
        kind: FailureKind,
        reason: impl Into<String>,
    ) {
        self.errors += 1;
        self.failures.push(RotationFailure {
            record_id,
            field: field.map(str::to_string),
            kind,
            reason: reason.into(),
        });
    }
}

impl fmt::Display for RotationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rotated {}/{} records in {} batches ({} errors) in {:.2?}; {} -> {}",
            self.processed,
            self.total,
            self.batches,
            self.errors,
            self.duration,
            self.old_key_fingerprint,
            self.new_key_fingerprint
        )?;
        if let Some(backup) = &self.backup_reference {
            write!(f, "; previous keys backed up to {backup}")?;
        }
        Ok(())
    }
}
