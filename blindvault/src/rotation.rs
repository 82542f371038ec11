//! Batched key rotation.
//!
//! Rotation re-encrypts every encrypted field and rebuilds every blind index
//! row under a new key pair. The pipeline walks the record population in
//! ascending id order, one bounded batch at a time:
//!
//! ```text
//! Idle -> Counting -> BatchProcessing -> Committing -> (next batch ...)
//!      -> ConfigSwitch -> NotifyAndBackup -> Done
//! ```
//!
//! Each batch commits atomically, so a record never ends up with ciphertext
//! under one key and index rows under another. A commit only replaces values
//! the batch actually read: records the application rewrote in the meantime
//! are skipped by the store, re-read and re-sealed from their current value.
//!
//! Field-level decryption failures and failed batch commits are counted and
//! reported but do not stop the run. Records of failed batches are kept in the
//! checkpoint, and a resumed run retries them first. Failing to persist the
//! new key configuration stops the run: it ends in [`RotationState::Failed`]
//! and the new keys are never installed.
//!
//! The application must keep encrypting with the old keys until the
//! pipeline has switched the configuration; pass its [`ActiveKeys`] handle to
//! [`RotationPipeline::with_active_keys`] to have the swap happen at exactly
//! that point.

use crate::blind_index::tokenize;
use crate::cipher::{decrypt, encrypt};
use crate::config::RotationOptions;
use crate::error::{Error, KeyStoreError, StoreError};
use crate::key_store::{Checkpoint, KeyConfigStore, Notifier, RotationCheckpoint};
use crate::keys::{ActiveKeys, KeyMaterial};
use crate::report::{FailureKind, RotationReport};
use crate::schema::FieldRegistry;
use crate::store::{EncryptedRecord, RecordId, RecordRewrite, RotationStore};
use std::collections::BTreeSet;
use std::time::Instant;
use tracing::{debug, error, info, info_span, warn};
use zeroize::Zeroizing;

/// Position of the pipeline in its run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationState {
    Idle,
    Counting,
    /// Reading and re-encrypting the batch after `after`.
    BatchProcessing { after: Option<RecordId> },
    /// Committing the batch after `after`.
    Committing { after: Option<RecordId> },
    ConfigSwitch,
    NotifyAndBackup,
    Done,
    /// Terminal state after a non-recoverable error.
    Failed,
}

/// Non-recoverable rotation errors.
///
/// Variants raised mid-run carry the partial report.
#[derive(Debug, thiserror::Error)]
pub enum RotationError {
    /// Old and new keys are unusable together
    #[error("invalid rotation keys: {0}")]
    InvalidKeys(String),

    /// Options are invalid
    #[error("invalid rotation options: {0}")]
    InvalidOptions(#[source] Error),

    /// The store could not be read; nothing after this point ran
    #[error("record store unavailable during rotation: {source}")]
    Store {
        #[source]
        source: StoreError,
        report: Box<RotationReport>,
    },

    /// The rotation checkpoint could not be read
    #[error("rotation checkpoint unreadable: {0}")]
    Checkpoint(#[source] KeyStoreError),

    /// The new keys could not be persisted. Data already rotated is sealed
    /// under keys that are not recorded anywhere durable.
    #[error("new key configuration could not be written: {source}")]
    ConfigWrite {
        #[source]
        source: KeyStoreError,
        report: Box<RotationReport>,
    },
}

impl RotationError {
    /// Returns the partial report, for errors raised mid-run.
    #[must_use]
    pub fn report(&self) -> Option<&RotationReport> {
        match self {
            Self::Store { report, .. } | Self::ConfigWrite { report, .. } => Some(report),
            _ => None,
        }
    }
}

/// How many times records rewritten during a commit are re-read and
/// re-sealed before they are reported as failed.
const CONFLICT_REREADS: usize = 2;

/// Outcome of re-sealing one batch before it is committed.
struct PreparedBatch {
    rewrites: Vec<RecordRewrite>,
    // Reported only for records whose rewrite is applied.
    field_failures: Vec<FieldFailure>,
    first_id: RecordId,
    last_id: RecordId,
}

struct FieldFailure {
    record_id: RecordId,
    field: String,
    kind: FailureKind,
    reason: String,
}

/// Drives one key rotation over a [`RotationStore`].
///
/// # Example
///
/// ```
/// use blindvault::prelude::*;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let old = KeyMaterial::generate();
/// let new = KeyMaterial::generate();
/// let store = InMemoryStore::new();
/// let registry = FieldRegistry::new().with_field("client", "name", FieldPolicy::SEARCHABLE)?;
/// let config = MemoryKeyStore::new(old.clone());
///
/// let report = RotationPipeline::new(&store, &registry, &config).rotate(&old, &new)?;
/// assert_eq!(report.errors, 0);
/// # Ok(())
/// # }
/// ```
pub struct RotationPipeline<'a, S: RotationStore> {
    store: &'a S,
    registry: &'a FieldRegistry,
    config_store: &'a dyn KeyConfigStore,
    notifier: Option<&'a dyn Notifier>,
    checkpoint: Option<&'a dyn RotationCheckpoint>,
    active_keys: Option<&'a ActiveKeys>,
    options: RotationOptions,
    state: RotationState,
}

impl<'a, S: RotationStore> RotationPipeline<'a, S> {
    /// Creates a pipeline with default options and no notifier or checkpoint.
    pub fn new(
        store: &'a S,
        registry: &'a FieldRegistry,
        config_store: &'a dyn KeyConfigStore,
    ) -> Self {
        Self {
            store,
            registry,
            config_store,
            notifier: None,
            checkpoint: None,
            active_keys: None,
            options: RotationOptions::default(),
            state: RotationState::Idle,
        }
    }

    /// Sets batch size and retry options.
    #[must_use]
    pub fn with_options(mut self, options: RotationOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the notifier that receives the new keys after the switch.
    #[must_use]
    pub fn with_notifier(mut self, notifier: &'a dyn Notifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Persists progress after every batch so an interrupted run can resume.
    #[must_use]
    pub fn with_checkpoint(mut self, checkpoint: &'a dyn RotationCheckpoint) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    /// Swaps `active_keys` to the new pair once the configuration is written.
    #[must_use]
    pub fn with_active_keys(mut self, active_keys: &'a ActiveKeys) -> Self {
        self.active_keys = Some(active_keys);
        self
    }

    /// Returns the current state.
    #[must_use]
    pub const fn state(&self) -> &RotationState {
        &self.state
    }

    /// Rotates every record from `old` to `new`.
    ///
    /// If a checkpoint for `new` exists, the run continues after the last
    /// rotated id instead of starting over.
    ///
    /// # Errors
    ///
    /// - `RotationError::InvalidKeys` if `old` and `new` are the same pair
    /// - `RotationError::InvalidOptions` if the batch size is zero
    /// - `RotationError::Checkpoint` if the checkpoint cannot be read
    /// - `RotationError::Store` if records cannot be counted or scanned
    /// - `RotationError::ConfigWrite` if the backup or new configuration
    ///   cannot be written
    pub fn rotate(
        &mut self,
        old: &KeyMaterial,
        new: &KeyMaterial,
    ) -> Result<RotationReport, RotationError> {
        let started = Instant::now();
        let old_fp = old.fingerprint();
        let new_fp = new.fingerprint();
        let span = info_span!("key_rotation", old = %old_fp, new = %new_fp);
        let _guard = span.enter();

        if old_fp == new_fp {
            return Err(RotationError::InvalidKeys("old and new key pairs are identical".into()));
        }
        self.options.validate().map_err(RotationError::InvalidOptions)?;

        let mut report = RotationReport {
            old_key_fingerprint: old_fp,
            new_key_fingerprint: new_fp.clone(),
            ..RotationReport::default()
        };

        self.transition(RotationState::Counting);
        let resumed = self.resume_point(&new_fp)?;
        let mut cursor = resumed.as_ref().map(|saved| saved.last_rotated_id);
        let mut failed: BTreeSet<RecordId> =
            resumed.map(|saved| saved.failed_ids.into_iter().collect()).unwrap_or_default();
        report.resumed_after = cursor;

        let remaining = match self.store.count_records(cursor) {
            Ok(remaining) => remaining,
            Err(source) => return Err(self.fail_store(source, report, started)),
        };
        report.total = remaining + failed.len() as u64;
        info!(total = report.total, resumed_after = ?cursor, retried = failed.len(), "rotation started");

        // Records whose batch failed in an earlier run go first.
        let retried: Vec<RecordId> = failed.iter().copied().collect();
        for ids in retried.chunks(self.options.batch_size) {
            self.transition(RotationState::BatchProcessing { after: cursor });
            let mut batch = Vec::with_capacity(ids.len());
            for &id in ids {
                match self.store.get_record(id) {
                    Ok(Some(record)) => batch.push(record),
                    Ok(None) => {
                        debug!(id, "record deleted since its batch failed");
                        failed.remove(&id);
                        report.processed += 1;
                    }
                    Err(source) => return Err(self.fail_store(source, report, started)),
                }
            }
            self.run_batch(batch, cursor, old, new, &mut report, &mut failed);
            self.save_checkpoint(&new_fp, cursor, &failed);
        }

        loop {
            self.transition(RotationState::BatchProcessing { after: cursor });
            let batch = match self.store.scan_batch(cursor, self.options.batch_size) {
                Ok(batch) => batch,
                Err(source) => return Err(self.fail_store(source, report, started)),
            };
            let Some(last_id) = batch.last().map(|record| record.id) else {
                break;
            };

            self.run_batch(batch, cursor, old, new, &mut report, &mut failed);
            cursor = Some(last_id);
            self.save_checkpoint(&new_fp, cursor, &failed);
        }

        self.transition(RotationState::ConfigSwitch);
        match self.switch_config(new) {
            Ok(backup) => report.backup_reference = Some(backup),
            Err(source) => {
                report.duration = started.elapsed();
                self.transition(RotationState::Failed);
                error!(
                    error = %source,
                    processed = report.processed,
                    "CRITICAL: records were rotated but the new key configuration was not \
                     written; keep the new keys and rerun with the same checkpoint"
                );
                return Err(RotationError::ConfigWrite { source, report: Box::new(report) });
            }
        }
        if let Some(active) = self.active_keys {
            active.replace(new.clone());
        }
        if let Some(checkpoint) = self.checkpoint {
            if let Err(err) = checkpoint.clear() {
                warn!(error = %err, "could not clear rotation checkpoint");
            }
        }

        self.transition(RotationState::NotifyAndBackup);
        report.duration = started.elapsed();
        if let Some(notifier) = self.notifier {
            match notifier.notify(new, &report) {
                Ok(()) => report.notified = true,
                Err(err) => warn!(error = %err, "key rotation notification failed"),
            }
        }

        if !report.is_clean() {
            warn!(
                errors = report.errors,
                failed_ids = ?report.failed_ids(),
                "rotation finished with errors; affected records need reprocessing"
            );
        }
        self.transition(RotationState::Done);
        info!(%report, "rotation done");
        Ok(report)
    }

    fn transition(&mut self, next: RotationState) {
        debug!(from = ?self.state, to = ?next, "rotation state change");
        self.state = next;
    }

    fn fail_store(
        &mut self,
        source: StoreError,
        mut report: RotationReport,
        started: Instant,
    ) -> RotationError {
        report.duration = started.elapsed();
        self.transition(RotationState::Failed);
        error!(error = %source, processed = report.processed, "rotation aborted: store unavailable");
        RotationError::Store { source, report: Box::new(report) }
    }

    fn resume_point(&self, new_fp: &str) -> Result<Option<Checkpoint>, RotationError> {
        let Some(checkpoint) = self.checkpoint else {
            return Ok(None);
        };
        match checkpoint.load().map_err(RotationError::Checkpoint)? {
            Some(saved) if saved.target_fingerprint == new_fp => {
                info!(
                    last_rotated_id = saved.last_rotated_id,
                    failed = saved.failed_ids.len(),
                    "resuming rotation from checkpoint"
                );
                Ok(Some(saved))
            }
            Some(saved) => {
                warn!(
                    checkpoint_target = %saved.target_fingerprint,
                    "ignoring checkpoint left by a rotation to a different key pair"
                );
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn save_checkpoint(&self, new_fp: &str, cursor: Option<RecordId>, failed: &BTreeSet<RecordId>) {
        let (Some(checkpoint), Some(last_rotated_id)) = (self.checkpoint, cursor) else {
            return;
        };
        let saved = Checkpoint {
            target_fingerprint: new_fp.to_string(),
            last_rotated_id,
            failed_ids: failed.iter().copied().collect(),
        };
        if let Err(err) = checkpoint.save(&saved) {
            warn!(error = %err, last_rotated_id, "could not save rotation checkpoint");
        }
    }

    /// Re-seals and commits one batch. Records the store skipped because
    /// they changed after being read are re-read and tried again.
    fn run_batch(
        &mut self,
        batch: Vec<EncryptedRecord>,
        after: Option<RecordId>,
        old: &KeyMaterial,
        new: &KeyMaterial,
        report: &mut RotationReport,
        failed: &mut BTreeSet<RecordId>,
    ) {
        if batch.is_empty() {
            return;
        }
        report.batches += 1;
        let mut records = batch;

        for round in 1..=CONFLICT_REREADS + 1 {
            let Some(prepared) = self.prepare_batch(&records, old, new) else {
                return;
            };

            self.transition(RotationState::Committing { after });
            let skipped: BTreeSet<RecordId> = match self.commit(&prepared) {
                Ok(skipped) => skipped.into_iter().collect(),
                Err(reason) => {
                    let ids: Vec<RecordId> = prepared.rewrites.iter().map(|r| r.id).collect();
                    warn!(?ids, "batch left under the old keys; records need reprocessing");
                    for id in ids {
                        report.record_failure(id, None, FailureKind::BatchCommit, reason.clone());
                        failed.insert(id);
                    }
                    return;
                }
            };

            for rewrite in prepared.rewrites.iter().filter(|r| !skipped.contains(&r.id)) {
                report.processed += 1;
                failed.remove(&rewrite.id);
            }
            for failure in prepared.field_failures {
                if !skipped.contains(&failure.record_id) {
                    report.record_failure(failure.record_id, Some(&failure.field), failure.kind, failure.reason);
                }
            }
            if skipped.is_empty() {
                return;
            }

            records = self.reread(&skipped, report, failed);
            if records.is_empty() {
                return;
            }
            debug!(round, records = records.len(), "records changed after being read; re-sealing current values");
        }

        let ids: Vec<RecordId> = records.iter().map(|r| r.id).collect();
        warn!(?ids, "records kept changing during rotation; left under the old keys");
        for id in ids {
            report.record_failure(
                id,
                None,
                FailureKind::ConcurrentWrite,
                "record was rewritten during every commit attempt",
            );
            failed.insert(id);
        }
    }

    fn reread(
        &self,
        ids: &BTreeSet<RecordId>,
        report: &mut RotationReport,
        failed: &mut BTreeSet<RecordId>,
    ) -> Vec<EncryptedRecord> {
        let mut records = Vec::with_capacity(ids.len());
        for &id in ids {
            match self.store.get_record(id) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {
                    debug!(id, "record deleted during rotation");
                    report.processed += 1;
                    failed.remove(&id);
                }
                Err(err) => {
                    warn!(id, error = %err, "record changed during rotation could not be re-read");
                    report.record_failure(id, None, FailureKind::ConcurrentWrite, err.to_string());
                    failed.insert(id);
                }
            }
        }
        records
    }

    /// Re-seals every encrypted field of the batch. Returns `None` for an
    /// empty batch.
    fn prepare_batch(
        &self,
        batch: &[EncryptedRecord],
        old: &KeyMaterial,
        new: &KeyMaterial,
    ) -> Option<PreparedBatch> {
        let first_id = batch.first()?.id;
        let last_id = batch.last()?.id;
        let mut field_failures = Vec::new();
        let rewrites = batch
            .iter()
            .map(|record| self.reseal_record(record, old, new, &mut field_failures))
            .collect();
        Some(PreparedBatch { rewrites, field_failures, first_id, last_id })
    }

    fn reseal_record(
        &self,
        record: &EncryptedRecord,
        old: &KeyMaterial,
        new: &KeyMaterial,
        failures: &mut Vec<FieldFailure>,
    ) -> RecordRewrite {
        let mut rewrite = RecordRewrite::from_scan(record);
        let mut fail = |field: &str, kind, reason: String| {
            failures.push(FieldFailure { record_id: record.id, field: field.to_string(), kind, reason });
        };

        for (field, policy) in self.registry.encrypted_fields(&record.entity_type) {
            let name = field.field_name();
            let Some(stored) = record.fields.get(name) else {
                continue;
            };

            let plaintext = match decrypt(stored, old) {
                Ok(plaintext) => Zeroizing::new(plaintext),
                Err(err) => {
                    warn!(
                        id = record.id,
                        field = %field,
                        error = %err,
                        index_dropped = policy.indexed,
                        "field did not decrypt under old key; left as is"
                    );
                    let reason = if policy.indexed {
                        format!("{err}; its search index rows were removed until the record is written again")
                    } else {
                        err.to_string()
                    };
                    fail(name, FailureKind::FieldDecrypt, reason);
                    continue;
                }
            };

            let resealed = encrypt(&plaintext, new).and_then(|sealed| {
                let tokens = if policy.indexed {
                    Some(tokenize(&String::from_utf8_lossy(&plaintext), new)?)
                } else {
                    None
                };
                Ok((sealed, tokens))
            });

            match resealed {
                Ok((sealed, tokens)) => {
                    rewrite.fields.insert(name.to_string(), sealed);
                    if let Some(tokens) = tokens {
                        rewrite.index.insert(field.index_name(), tokens);
                    }
                }
                Err(err) => {
                    warn!(id = record.id, field = %field, error = %err, "field could not be re-sealed");
                    fail(name, FailureKind::FieldReseal, err.to_string());
                }
            }
        }

        rewrite
    }

    /// Commits with retries. Returns the ids the store skipped, or the last
    /// error once every attempt failed.
    fn commit(&self, prepared: &PreparedBatch) -> Result<Vec<RecordId>, String> {
        let attempts = self.options.commit_retries.saturating_add(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.store.commit_batch(&prepared.rewrites) {
                Ok(skipped) => {
                    debug!(
                        first_id = prepared.first_id,
                        last_id = prepared.last_id,
                        records = prepared.rewrites.len().saturating_sub(skipped.len()),
                        skipped = skipped.len(),
                        attempt,
                        "batch committed"
                    );
                    return Ok(skipped);
                }
                Err(err) => {
                    warn!(
                        first_id = prepared.first_id,
                        last_id = prepared.last_id,
                        attempt,
                        error = %err,
                        "batch commit failed and was rolled back"
                    );
                    last_error = Some(err);
                }
            }
        }

        Err(last_error.map_or_else(String::new, |err| err.to_string()))
    }

    fn switch_config(&self, new: &KeyMaterial) -> Result<String, KeyStoreError> {
        let backup = self.config_store.backup()?;
        info!(backup = %backup, "previous key configuration backed up");
        self.config_store.store(new)?;
        info!(fingerprint = %new.fingerprint(), "new key configuration written");
        Ok(backup)
    }
}

/// Rotates `store` from `old` to `new` with the given batch size.
///
/// Convenience wrapper over [`RotationPipeline`] without notifier,
/// checkpoint or active-key handle.
///
/// # Errors
///
/// See [`RotationPipeline::rotate`].
pub fn rotate<S: RotationStore>(
    store: &S,
    registry: &FieldRegistry,
    config_store: &dyn KeyConfigStore,
    old: &KeyMaterial,
    new: &KeyMaterial,
    batch_size: usize,
) -> Result<RotationReport, RotationError> {
    RotationPipeline::new(store, registry, config_store)
        .with_options(RotationOptions { batch_size, ..RotationOptions::default() })
        .rotate(old, new)
}
