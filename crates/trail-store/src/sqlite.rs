//! SQLite-backed version store (persistence).

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use trail_types::{
    check_new_version, Event, ItemKey, NewVersion, StoreError, TransactionId, Version, VersionId,
    VersionListOptions, VersionStore, VersionTransaction,
};

const COLUMNS: &str =
    "id, item_type, item_id, event, changeset, object, actor, metadata, transaction_id, created_at";

/// SQLite-backed version store.
///
/// Staged rows are written in a single SQL transaction at commit. Ids are
/// allocated in-process from `MAX(id)`, so one store should own the file.
pub struct SqliteVersionStore {
    conn: Arc<Mutex<rusqlite::Connection>>,
    next_id: Arc<AtomicU64>,
}

impl SqliteVersionStore {
    /// Open (or create) a store at the given path. `":memory:"` works for tests.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = rusqlite::Connection::open(path).map_err(|e| StoreError::Other(e.to_string()))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS versions (
                id INTEGER PRIMARY KEY,
                item_type TEXT NOT NULL,
                item_id TEXT NOT NULL,
                event TEXT NOT NULL,
                changeset TEXT NOT NULL,
                object TEXT,
                actor TEXT,
                metadata TEXT,
                transaction_id TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_versions_item
                ON versions(item_type, item_id, created_at, id);
            CREATE INDEX IF NOT EXISTS idx_versions_transaction ON versions(transaction_id);
            CREATE INDEX IF NOT EXISTS idx_versions_created ON versions(created_at, id);
            "#,
        )
        .map_err(|e| StoreError::Other(e.to_string()))?;

        let max_id: i64 = conn
            .query_row("SELECT COALESCE(MAX(id), 0) FROM versions", [], |row| {
                row.get(0)
            })
            .map_err(|e| StoreError::Other(e.to_string()))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            next_id: Arc::new(AtomicU64::new(max_id as u64 + 1)),
        })
    }

    fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&rusqlite::Connection) -> Result<T, rusqlite::Error>,
    {
        with_conn(&self.conn, f)
    }

    fn select(&self, clause: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<Version>, StoreError> {
        let sql = format!("SELECT {} FROM versions {}", COLUMNS, clause);
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params, row_to_version)?;
            rows.collect()
        })
    }
}

fn with_conn<T, F>(conn: &Mutex<rusqlite::Connection>, f: F) -> Result<T, StoreError>
where
    F: FnOnce(&rusqlite::Connection) -> Result<T, rusqlite::Error>,
{
    let conn = conn
        .lock()
        .map_err(|e| StoreError::Other(format!("failed to acquire lock: {}", e)))?;
    f(&conn).map_err(|e| match e {
        rusqlite::Error::SqliteFailure(code, msg)
            if code.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            StoreError::Constraint(msg.unwrap_or_else(|| code.to_string()))
        }
        rusqlite::Error::ToSqlConversionFailure(e) => StoreError::Serialization(e.to_string()),
        other => StoreError::Other(other.to_string()),
    })
}

/// Fixed-width UTC timestamps so text ordering matches time ordering.
fn timestamp_to_sql(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn conversion_error(
    idx: usize,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

fn row_to_version(row: &rusqlite::Row<'_>) -> Result<Version, rusqlite::Error> {
    let id: i64 = row.get(0)?;
    let event_text: String = row.get(3)?;
    let event = Event::parse(&event_text).ok_or_else(|| {
        conversion_error(
            3,
            InvalidColumn(format!("unknown event: {}", event_text)),
        )
    })?;
    let changeset_json: String = row.get(4)?;
    let object_json: Option<String> = row.get(5)?;
    let metadata_json: Option<String> = row.get(7)?;
    let transaction_text: String = row.get(8)?;
    let created_text: String = row.get(9)?;

    let changeset = serde_json::from_str(&changeset_json).map_err(|e| conversion_error(4, e))?;
    let object = object_json
        .map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| conversion_error(5, e))?;
    let metadata = metadata_json
        .map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| conversion_error(7, e))?;
    let transaction_id = uuid::Uuid::parse_str(&transaction_text)
        .map(TransactionId)
        .map_err(|e| conversion_error(8, e))?;
    let created_at = DateTime::parse_from_rfc3339(&created_text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(9, e))?;

    Ok(Version {
        id: VersionId(id as u64),
        item_type: row.get(1)?,
        item_id: row.get(2)?,
        event,
        changeset,
        object,
        actor: row.get(6)?,
        metadata,
        transaction_id,
        created_at,
    })
}

#[derive(Debug)]
struct InvalidColumn(String);

impl std::fmt::Display for InvalidColumn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for InvalidColumn {}

#[async_trait]
impl VersionStore for SqliteVersionStore {
    async fn begin(&self) -> Result<Box<dyn VersionTransaction>, StoreError> {
        Ok(Box::new(SqliteTransaction {
            id: TransactionId::new(),
            conn: Arc::clone(&self.conn),
            next_id: Arc::clone(&self.next_id),
            staged: Vec::new(),
        }))
    }

    async fn query(&self, key: &ItemKey) -> Result<Vec<Version>, StoreError> {
        self.select(
            "WHERE item_type = ?1 AND item_id = ?2 ORDER BY created_at ASC, id ASC",
            rusqlite::params![key.item_type, key.item_id],
        )
    }

    async fn most_recent_before(
        &self,
        key: &ItemKey,
        at: DateTime<Utc>,
    ) -> Result<Option<Version>, StoreError> {
        let rows = self.select(
            "WHERE item_type = ?1 AND item_id = ?2 AND created_at <= ?3 \
             ORDER BY created_at DESC, id DESC LIMIT 1",
            rusqlite::params![key.item_type, key.item_id, timestamp_to_sql(&at)],
        )?;
        Ok(rows.into_iter().next().filter(|v| !v.is_terminal()))
    }

    async fn get(&self, id: VersionId) -> Result<Option<Version>, StoreError> {
        let rows = self.select("WHERE id = ?1", rusqlite::params![id.0 as i64])?;
        Ok(rows.into_iter().next())
    }

    async fn query_transaction(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Vec<Version>, StoreError> {
        self.select(
            "WHERE transaction_id = ?1 ORDER BY id ASC",
            rusqlite::params![transaction_id.to_string()],
        )
    }

    async fn list(&self, opts: &VersionListOptions) -> Result<Vec<Version>, StoreError> {
        let event = opts.event.map(|e| e.as_str().to_string());
        let since = opts.since.as_ref().map(timestamp_to_sql);
        let limit = opts.limit.unwrap_or(100) as i64;
        let offset = opts.offset.unwrap_or(0) as i64;
        self.select(
            "WHERE (?1 IS NULL OR item_type = ?1) \
               AND (?2 IS NULL OR actor = ?2) \
               AND (?3 IS NULL OR event = ?3) \
               AND (?4 IS NULL OR created_at >= ?4) \
             ORDER BY created_at DESC, id DESC LIMIT ?5 OFFSET ?6",
            rusqlite::params![opts.item_type, opts.actor, event, since, limit, offset],
        )
    }
}

struct SqliteTransaction {
    id: TransactionId,
    conn: Arc<Mutex<rusqlite::Connection>>,
    next_id: Arc<AtomicU64>,
    staged: Vec<Version>,
}

#[async_trait]
impl VersionTransaction for SqliteTransaction {
    fn id(&self) -> TransactionId {
        self.id
    }

    async fn append(&mut self, version: NewVersion) -> Result<Version, StoreError> {
        check_new_version(&version)?;
        let id = VersionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let version = Version::from_new(id, self.id, version);
        self.staged.push(version.clone());
        Ok(version)
    }

    fn staged(&self) -> &[Version] {
        &self.staged
    }

    async fn commit(self: Box<Self>) -> Result<Vec<Version>, StoreError> {
        let this = *self;
        with_conn(&this.conn, |conn| {
            let tx = conn.unchecked_transaction()?;
            for v in &this.staged {
                let changeset = serde_json::to_string(&v.changeset)
                    .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
                let object = v
                    .object
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()
                    .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
                let metadata = v
                    .metadata
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()
                    .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
                tx.execute(
                    &format!(
                        "INSERT INTO versions ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                        COLUMNS
                    ),
                    rusqlite::params![
                        v.id.0 as i64,
                        v.item_type,
                        v.item_id,
                        v.event.as_str(),
                        changeset,
                        object,
                        v.actor,
                        metadata,
                        v.transaction_id.to_string(),
                        timestamp_to_sql(&v.created_at),
                    ],
                )?;
            }
            tx.commit()
        })?;
        tracing::debug!(
            transaction_id = %this.id,
            count = this.staged.len(),
            "versions committed"
        );
        Ok(this.staged)
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        tracing::debug!(
            transaction_id = %self.id,
            discarded = self.staged.len(),
            "version transaction rolled back"
        );
        Ok(())
    }
}
