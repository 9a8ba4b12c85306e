use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use memory_gate_core::{
    CorrectionEvent, CorrectionId, CorrectionKind, GateError, MemoryId, MemoryRecord, MemoryStore,
    TrustFields, TrustState,
};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS memory_records (
  memory_id TEXT PRIMARY KEY,
  content TEXT NOT NULL,
  embedding_ref TEXT,
  trust_state TEXT NOT NULL CHECK (trust_state IN ('active','low_confidence','suppressed')),
  confidence REAL NOT NULL CHECK (confidence >= 0.0 AND confidence <= 1.0),
  superseded_by TEXT,
  revision INTEGER NOT NULL CHECK (revision >= 1),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS correction_log (
  correction_id TEXT PRIMARY KEY,
  target_id TEXT NOT NULL,
  kind TEXT NOT NULL CHECK (kind IN ('supersede','flag_low_confidence','suppress','restore')),
  new_memory_id TEXT,
  applied_at TEXT NOT NULL,
  reason TEXT NOT NULL,
  FOREIGN KEY (target_id) REFERENCES memory_records(memory_id)
);

CREATE INDEX IF NOT EXISTS idx_memory_records_trust_state ON memory_records(trust_state);
CREATE INDEX IF NOT EXISTS idx_correction_log_target ON correction_log(target_id);
";

/// SQLite-backed [`MemoryStore`]. Trust updates and their audit rows commit
/// in one transaction; the connection sits behind a mutex so the store can be
/// shared across query and correction tasks.
pub struct SqliteMemoryStore {
    conn: Mutex<Connection>,
}

impl SqliteMemoryStore {
    /// Open (or create) a store at `path`, configure runtime pragmas, and
    /// apply pending migrations.
    ///
    /// # Errors
    /// Returns [`GateError::Storage`] when the database cannot be opened,
    /// configured, or migrated.
    pub fn open(path: &Path) -> Result<Self, GateError> {
        let conn = Connection::open(path).map_err(|err| {
            storage(format!("failed to open sqlite database at {}", path.display()), err)
        })?;
        Self::from_connection(conn)
    }

    /// Open an in-memory store, used by tests and short-lived tooling.
    ///
    /// # Errors
    /// Returns [`GateError::Storage`] when setup fails.
    pub fn open_in_memory() -> Result<Self, GateError> {
        let conn = Connection::open_in_memory()
            .map_err(|err| storage("failed to open in-memory sqlite database", err))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, GateError> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(|err| storage("failed to configure sqlite pragmas", err))?;

        let store = Self { conn: Mutex::new(conn) };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<(), GateError> {
        let conn = self.lock()?;
        conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .map_err(|err| storage("failed to apply schema_migrations table", err))?;

        let current: i64 = conn
            .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
                row.get(0)
            })
            .map_err(|err| storage("failed to read schema version", err))?;

        if current < 1 {
            conn.execute_batch(MIGRATION_001_SQL)
                .map_err(|err| storage("failed to apply migration v1", err))?;
            conn.execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![1_i64, now_rfc3339()?],
            )
            .map_err(|err| storage("failed to record migration version 1", err))?;
        } else if current > LATEST_SCHEMA_VERSION {
            return Err(GateError::Storage(format!(
                "unsupported schema version {current}; expected {LATEST_SCHEMA_VERSION}"
            )));
        }

        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, GateError> {
        self.conn
            .lock()
            .map_err(|_| GateError::Storage("memory store mutex poisoned".to_string()))
    }
}

impl MemoryStore for SqliteMemoryStore {
    fn put(&self, record: &MemoryRecord) -> Result<(), GateError> {
        record.validate()?;

        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|err| storage("failed to start put transaction", err))?;

        let exists: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM memory_records WHERE memory_id = ?1",
                params![record.memory_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| storage("failed to check for duplicate memory id", err))?;
        if exists.is_some() {
            return Err(GateError::DuplicateId(record.memory_id));
        }

        tx.execute(
            "INSERT INTO memory_records(
                memory_id, content, embedding_ref, trust_state, confidence,
                superseded_by, revision, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.memory_id.to_string(),
                record.content,
                record.embedding_ref,
                record.trust_state.as_str(),
                record.confidence,
                record.superseded_by.map(|id| id.to_string()),
                i64::from(record.revision),
                rfc3339(record.created_at)?,
                rfc3339(record.updated_at)?,
            ],
        )
        .map_err(|err| storage("failed to insert memory record", err))?;

        tx.commit().map_err(|err| storage("failed to commit put transaction", err))
    }

    fn get(&self, memory_id: MemoryId) -> Result<MemoryRecord, GateError> {
        let conn = self.lock()?;
        let record = conn
            .query_row(
                "SELECT memory_id, content, embedding_ref, trust_state, confidence,
                        superseded_by, revision, created_at, updated_at
                 FROM memory_records WHERE memory_id = ?1",
                params![memory_id.to_string()],
                record_from_row,
            )
            .optional()
            .map_err(|err| storage("failed to load memory record", err))?;

        record.ok_or(GateError::NotFound(memory_id))
    }

    fn batch_get(
        &self,
        memory_ids: &[MemoryId],
    ) -> Result<BTreeMap<MemoryId, MemoryRecord>, GateError> {
        if memory_ids.is_empty() {
            return Ok(BTreeMap::new());
        }

        // One statement for the whole batch: the result is a consistent
        // snapshot and the candidate list never costs N round trips.
        let placeholders =
            (1..=memory_ids.len()).map(|n| format!("?{n}")).collect::<Vec<_>>().join(", ");
        let sql = format!(
            "SELECT memory_id, content, embedding_ref, trust_state, confidence,
                    superseded_by, revision, created_at, updated_at
             FROM memory_records WHERE memory_id IN ({placeholders})"
        );

        let conn = self.lock()?;
        let mut stmt =
            conn.prepare(&sql).map_err(|err| storage("failed to prepare batch lookup", err))?;
        let rows = stmt
            .query_map(
                params_from_iter(memory_ids.iter().map(ToString::to_string)),
                record_from_row,
            )
            .map_err(|err| storage("failed to run batch lookup", err))?;

        let mut records = BTreeMap::new();
        for row in rows {
            let record = row.map_err(|err| storage("failed to decode memory record", err))?;
            records.insert(record.memory_id, record);
        }
        Ok(records)
    }

    fn update_trust(
        &self,
        memory_id: MemoryId,
        fields: TrustFields,
        expected_revision: u32,
        event: &CorrectionEvent,
    ) -> Result<MemoryRecord, GateError> {
        event.validate()?;

        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|err| storage("failed to start trust update transaction", err))?;

        let stored_revision: Option<i64> = tx
            .query_row(
                "SELECT revision FROM memory_records WHERE memory_id = ?1",
                params![memory_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| storage("failed to read stored revision", err))?;

        let Some(stored_revision) = stored_revision else {
            return Err(GateError::NotFound(memory_id));
        };
        if stored_revision != i64::from(expected_revision) {
            return Err(GateError::RevisionConflict(memory_id));
        }

        // Audit first: the log row is durable in the same commit that makes
        // the trust change visible, so replay never runs ahead of state.
        let new_memory_id = match &event.kind {
            CorrectionKind::Supersede { new_id } => Some(new_id.to_string()),
            _ => None,
        };
        tx.execute(
            "INSERT INTO correction_log(
                correction_id, target_id, kind, new_memory_id, applied_at, reason
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.correction_id.to_string(),
                event.target_id.to_string(),
                event.kind.as_str(),
                new_memory_id,
                rfc3339(event.applied_at)?,
                event.reason,
            ],
        )
        .map_err(|err| storage("failed to append correction event", err))?;

        let updated = tx
            .execute(
                "UPDATE memory_records
                 SET trust_state = ?2, confidence = ?3, superseded_by = ?4,
                     revision = revision + 1, updated_at = ?5
                 WHERE memory_id = ?1 AND revision = ?6",
                params![
                    memory_id.to_string(),
                    fields.trust_state.as_str(),
                    fields.confidence,
                    fields.superseded_by.map(|id| id.to_string()),
                    rfc3339(event.applied_at)?,
                    i64::from(expected_revision),
                ],
            )
            .map_err(|err| storage("failed to overwrite trust fields", err))?;
        if updated != 1 {
            return Err(GateError::RevisionConflict(memory_id));
        }

        let record = tx
            .query_row(
                "SELECT memory_id, content, embedding_ref, trust_state, confidence,
                        superseded_by, revision, created_at, updated_at
                 FROM memory_records WHERE memory_id = ?1",
                params![memory_id.to_string()],
                record_from_row,
            )
            .map_err(|err| storage("failed to reload updated record", err))?;

        tx.commit().map_err(|err| storage("failed to commit trust update", err))?;
        Ok(record)
    }

    fn list_corrections(&self) -> Result<Vec<CorrectionEvent>, GateError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT correction_id, target_id, kind, new_memory_id, applied_at, reason
                 FROM correction_log ORDER BY rowid ASC",
            )
            .map_err(|err| storage("failed to prepare audit log query", err))?;

        let mut rows =
            stmt.query([]).map_err(|err| storage("failed to run audit log query", err))?;
        let mut events = Vec::new();

        while let Some(row) =
            rows.next().map_err(|err| storage("failed to read audit log row", err))?
        {
            let correction_id_raw: String =
                row.get(0).map_err(|err| storage("failed to decode correction_id", err))?;
            let target_id_raw: String =
                row.get(1).map_err(|err| storage("failed to decode target_id", err))?;
            let kind_raw: String =
                row.get(2).map_err(|err| storage("failed to decode correction kind", err))?;
            let new_memory_id_raw: Option<String> =
                row.get(3).map_err(|err| storage("failed to decode new_memory_id", err))?;
            let applied_at_raw: String =
                row.get(4).map_err(|err| storage("failed to decode applied_at", err))?;
            let reason: String =
                row.get(5).map_err(|err| storage("failed to decode reason", err))?;

            let kind = match kind_raw.as_str() {
                "supersede" => {
                    let raw = new_memory_id_raw.ok_or_else(|| {
                        GateError::Storage("supersede event without new_memory_id".to_string())
                    })?;
                    CorrectionKind::Supersede { new_id: parse_memory_id(&raw)? }
                }
                "flag_low_confidence" => CorrectionKind::FlagLowConfidence,
                "suppress" => CorrectionKind::Suppress,
                "restore" => CorrectionKind::Restore,
                other => {
                    return Err(GateError::Storage(format!("unknown correction kind: {other}")));
                }
            };

            events.push(CorrectionEvent {
                correction_id: CorrectionId(parse_ulid(&correction_id_raw)?),
                target_id: parse_memory_id(&target_id_raw)?,
                kind,
                applied_at: parse_rfc3339(&applied_at_raw)?,
                reason,
            });
        }

        Ok(events)
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<MemoryRecord> {
    let memory_id_raw: String = row.get(0)?;
    let trust_state_raw: String = row.get(3)?;
    let superseded_by_raw: Option<String> = row.get(5)?;
    let created_at_raw: String = row.get(7)?;
    let updated_at_raw: String = row.get(8)?;

    Ok(MemoryRecord {
        memory_id: sql_memory_id(&memory_id_raw)?,
        content: row.get(1)?,
        embedding_ref: row.get(2)?,
        trust_state: TrustState::parse(&trust_state_raw).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                3,
                rusqlite::types::Type::Text,
                format!("unknown trust_state: {trust_state_raw}").into(),
            )
        })?,
        confidence: row.get(4)?,
        superseded_by: superseded_by_raw.as_deref().map(sql_memory_id).transpose()?,
        revision: row.get(6)?,
        created_at: sql_rfc3339(&created_at_raw, 7)?,
        updated_at: sql_rfc3339(&updated_at_raw, 8)?,
    })
}

fn sql_memory_id(raw: &str) -> rusqlite::Result<MemoryId> {
    Ulid::from_string(raw).map(MemoryId).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("invalid memory id {raw}: {err}").into(),
        )
    })
}

fn sql_rfc3339(raw: &str, column: usize) -> rusqlite::Result<OffsetDateTime> {
    OffsetDateTime::parse(raw, &Rfc3339).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            column,
            rusqlite::types::Type::Text,
            format!("invalid timestamp {raw}: {err}").into(),
        )
    })
}

fn parse_memory_id(raw: &str) -> Result<MemoryId, GateError> {
    Ok(MemoryId(parse_ulid(raw)?))
}

fn parse_ulid(raw: &str) -> Result<Ulid, GateError> {
    Ulid::from_string(raw)
        .map_err(|err| GateError::Storage(format!("invalid ULID {raw}: {err}")))
}

fn parse_rfc3339(raw: &str) -> Result<OffsetDateTime, GateError> {
    OffsetDateTime::parse(raw, &Rfc3339)
        .map_err(|err| GateError::Storage(format!("invalid timestamp {raw}: {err}")))
}

fn rfc3339(value: OffsetDateTime) -> Result<String, GateError> {
    value
        .format(&Rfc3339)
        .map_err(|err| GateError::Storage(format!("failed to format timestamp: {err}")))
}

fn now_rfc3339() -> Result<String, GateError> {
    rfc3339(OffsetDateTime::now_utc())
}

fn storage(context: impl Into<String>, err: impl Display) -> GateError {
    GateError::Storage(format!("{}: {err}", context.into()))
}
