//! SQLite backend for `BlindVault`.
//!
//! Records, their field values and the blind index live in three tables of a
//! single database file:
//!
//! - `records (id, entity_type)`
//! - `record_fields (record_id, field_name, value)`
//! - `blind_index (field_name, token, entity_id)`
//!
//! [`SqliteStore`] implements every storage trait of the engine, including
//! the transactional record replacement used by writes and the
//! compare-and-swap batch commit used by key rotation.

#![warn(clippy::pedantic, clippy::nursery)]

use blindvault::blind_index::Token;
use blindvault::error::StoreError;
use blindvault::store::{
    EncryptedRecord, IndexStore, RecordId, RecordRewrite, RecordStore, RotationStore,
};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS records (
        id INTEGER PRIMARY KEY,
        entity_type TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS record_fields (
        record_id INTEGER NOT NULL,
        field_name TEXT NOT NULL,
        value TEXT NOT NULL,
        PRIMARY KEY (record_id, field_name)
    );

    CREATE TABLE IF NOT EXISTS blind_index (
        field_name TEXT NOT NULL,
        token TEXT NOT NULL,
        entity_id INTEGER NOT NULL,
        PRIMARY KEY (field_name, token, entity_id)
    );

    CREATE INDEX IF NOT EXISTS blind_index_entity ON blind_index (entity_id);
";

fn query_failed(context: &'static str) -> impl Fn(rusqlite::Error) -> StoreError {
    move |e| StoreError::Query(format!("{context}: {e}"))
}

fn transaction_failed(context: &'static str) -> impl Fn(rusqlite::Error) -> StoreError {
    move |e| StoreError::Transaction(format!("{context}: {e}"))
}

fn clamp_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// Record and blind index store backed by a SQLite database.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens (or creates) a store at `path`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Unavailable` if the database cannot be opened or
    /// its schema cannot be created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(|e| {
            StoreError::Unavailable(format!("failed to open {}: {e}", path.display()))
        })?;
        Self::with_connection(conn)
    }

    /// Opens a private in-memory store.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Unavailable` if the schema cannot be created.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::Unavailable(format!("failed to open in-memory store: {e}")))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| StoreError::Unavailable(format!("failed to init schema: {e}")))?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Number of rows in the blind index.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Query` if the count fails.
    pub fn index_len(&self) -> Result<u64, StoreError> {
        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM blind_index", [], |row| row.get(0))
            .map_err(query_failed("failed to count index rows"))?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    fn record_exists(tx: &Transaction<'_>, id: RecordId) -> Result<bool, StoreError> {
        tx.query_row("SELECT 1 FROM records WHERE id = ?1", params![id], |_| Ok(()))
            .optional()
            .map(|row| row.is_some())
            .map_err(transaction_failed("failed to look up record"))
    }

    fn load_fields(conn: &Connection, id: RecordId) -> Result<BTreeMap<String, String>, StoreError> {
        let mut stmt = conn
            .prepare_cached("SELECT field_name, value FROM record_fields WHERE record_id = ?1")
            .map_err(query_failed("failed to prepare field load"))?;
        let fields = stmt
            .query_map(params![id], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .map_err(query_failed("failed to load fields"))?;
        fields.collect::<Result<_, _>>().map_err(query_failed("failed to read field row"))
    }

    fn write_record(tx: &Transaction<'_>, record: &EncryptedRecord) -> Result<(), StoreError> {
        tx.execute(
            "INSERT INTO records (id, entity_type) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET entity_type = excluded.entity_type",
            params![record.id, record.entity_type],
        )
        .map_err(transaction_failed("failed to write record"))?;
        tx.execute("DELETE FROM record_fields WHERE record_id = ?1", params![record.id])
            .map_err(transaction_failed("failed to clear fields"))?;

        let mut stmt = tx
            .prepare_cached("INSERT INTO record_fields (record_id, field_name, value) VALUES (?1, ?2, ?3)")
            .map_err(transaction_failed("failed to prepare field insert"))?;
        for (name, value) in &record.fields {
            stmt.execute(params![record.id, name, value])
                .map_err(transaction_failed("failed to write field"))?;
        }
        Ok(())
    }

    fn insert_tokens(
        tx: &Transaction<'_>,
        entity_id: RecordId,
        field_name: &str,
        tokens: &[Token],
    ) -> Result<(), StoreError> {
        let mut stmt = tx
            .prepare_cached(
                "INSERT OR IGNORE INTO blind_index (field_name, token, entity_id) VALUES (?1, ?2, ?3)",
            )
            .map_err(transaction_failed("failed to prepare index insert"))?;
        for token in tokens {
            stmt.execute(params![field_name, token.as_str(), entity_id])
                .map_err(transaction_failed("failed to insert index row"))?;
        }
        Ok(())
    }
}

impl RecordStore for SqliteStore {
    fn count_records(&self, after: Option<RecordId>) -> Result<u64, StoreError> {
        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM records WHERE ?1 IS NULL OR id > ?1",
                params![after],
                |row| row.get(0),
            )
            .map_err(query_failed("failed to count records"))?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    fn scan_batch(
        &self,
        after: Option<RecordId>,
        limit: usize,
    ) -> Result<Vec<EncryptedRecord>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT r.id, r.entity_type, f.field_name, f.value
                 FROM (SELECT id, entity_type FROM records
                       WHERE ?1 IS NULL OR id > ?1
                       ORDER BY id LIMIT ?2) r
                 LEFT JOIN record_fields f ON f.record_id = r.id
                 ORDER BY r.id, f.field_name",
            )
            .map_err(query_failed("failed to prepare scan"))?;
        let rows = stmt
            .query_map(params![after, clamp_limit(limit)], |row| {
                Ok((
                    row.get::<_, RecordId>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            })
            .map_err(query_failed("failed to scan records"))?;

        let mut batch: Vec<EncryptedRecord> = Vec::new();
        for row in rows {
            let (id, entity_type, field_name, value) =
                row.map_err(query_failed("failed to read record row"))?;
            if batch.last().map_or(true, |record| record.id != id) {
                batch.push(EncryptedRecord::new(id, entity_type));
            }
            if let (Some(name), Some(value), Some(record)) = (field_name, value, batch.last_mut()) {
                record.fields.insert(name, value);
            }
        }
        Ok(batch)
    }

    fn get_record(&self, id: RecordId) -> Result<Option<EncryptedRecord>, StoreError> {
        let conn = self.conn.lock();
        let entity_type: Option<String> = conn
            .query_row("SELECT entity_type FROM records WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()
            .map_err(query_failed("failed to load record"))?;
        let Some(entity_type) = entity_type else {
            return Ok(None);
        };

        let mut record = EncryptedRecord::new(id, entity_type);
        record.fields = Self::load_fields(&conn, id)?;
        Ok(Some(record))
    }

    fn put_record(&self, record: &EncryptedRecord) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(transaction_failed("failed to begin"))?;
        Self::write_record(&tx, record)?;
        tx.commit().map_err(transaction_failed("failed to commit record"))
    }

    fn delete_record(&self, id: RecordId) -> Result<bool, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(transaction_failed("failed to begin"))?;

        tx.execute("DELETE FROM blind_index WHERE entity_id = ?1", params![id])
            .map_err(transaction_failed("failed to delete index rows"))?;
        tx.execute("DELETE FROM record_fields WHERE record_id = ?1", params![id])
            .map_err(transaction_failed("failed to delete fields"))?;
        let deleted = tx
            .execute("DELETE FROM records WHERE id = ?1", params![id])
            .map_err(transaction_failed("failed to delete record"))?;

        tx.commit().map_err(transaction_failed("failed to commit delete"))?;
        Ok(deleted > 0)
    }
}

impl IndexStore for SqliteStore {
    fn upsert_tokens(
        &self,
        entity_id: RecordId,
        field_name: &str,
        tokens: &[Token],
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(transaction_failed("failed to begin"))?;

        tx.execute(
            "DELETE FROM blind_index WHERE entity_id = ?1 AND field_name = ?2",
            params![entity_id, field_name],
        )
        .map_err(transaction_failed("failed to clear index rows"))?;
        Self::insert_tokens(&tx, entity_id, field_name, tokens)?;

        tx.commit().map_err(transaction_failed("failed to commit index rows"))
    }

    fn query_by_token(
        &self,
        token: &Token,
        field_name: &str,
        limit: usize,
    ) -> Result<Vec<RecordId>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT entity_id FROM blind_index
                 WHERE field_name = ?1 AND token = ?2
                 ORDER BY entity_id LIMIT ?3",
            )
            .map_err(query_failed("failed to prepare token query"))?;
        let ids = stmt
            .query_map(params![field_name, token.as_str(), clamp_limit(limit)], |row| row.get(0))
            .map_err(query_failed("failed to query token"))?;
        ids.collect::<Result<Vec<RecordId>, _>>().map_err(query_failed("failed to read entity id"))
    }

    fn delete_all_for_entity(&self, entity_id: RecordId) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM blind_index WHERE entity_id = ?1", params![entity_id])
            .map_err(query_failed("failed to delete index rows"))?;
        Ok(())
    }
}

impl RotationStore for SqliteStore {
    fn replace_record(
        &self,
        record: &EncryptedRecord,
        index: &BTreeMap<String, Vec<Token>>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(transaction_failed("failed to begin"))?;

        Self::write_record(&tx, record)?;
        tx.execute("DELETE FROM blind_index WHERE entity_id = ?1", params![record.id])
            .map_err(transaction_failed("failed to clear index rows"))?;
        for (field_name, tokens) in index {
            Self::insert_tokens(&tx, record.id, field_name, tokens)?;
        }

        tx.commit().map_err(transaction_failed("failed to commit record"))
    }

    fn commit_batch(&self, rewrites: &[RecordRewrite]) -> Result<Vec<RecordId>, StoreError> {
        let mut conn = self.conn.lock();
        // Dropping the transaction on an early return rolls it back.
        let tx = conn.transaction().map_err(transaction_failed("failed to begin batch"))?;
        let mut skipped = Vec::new();

        for rewrite in rewrites {
            if !Self::record_exists(&tx, rewrite.id)? {
                skipped.push(rewrite.id);
                continue;
            }
            if rewrite.expected.is_some() && !rewrite.matches(&Self::load_fields(&tx, rewrite.id)?) {
                skipped.push(rewrite.id);
                continue;
            }

            for (name, value) in &rewrite.fields {
                tx.execute(
                    "INSERT INTO record_fields (record_id, field_name, value) VALUES (?1, ?2, ?3)
                     ON CONFLICT(record_id, field_name) DO UPDATE SET value = excluded.value",
                    params![rewrite.id, name, value],
                )
                .map_err(transaction_failed("failed to rewrite field"))?;
            }

            tx.execute("DELETE FROM blind_index WHERE entity_id = ?1", params![rewrite.id])
                .map_err(transaction_failed("failed to clear index rows"))?;
            for (field_name, tokens) in &rewrite.index {
                Self::insert_tokens(&tx, rewrite.id, field_name, tokens)?;
            }
        }

        tx.commit().map_err(transaction_failed("failed to commit batch"))?;
        debug!(
            records = rewrites.len() - skipped.len(),
            skipped = skipped.len(),
            "rotation batch committed"
        );
        Ok(skipped)
    }
}
