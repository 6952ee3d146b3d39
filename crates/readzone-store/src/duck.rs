//! DuckDB storage for drafts, the book catalog, and the draft audit log.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use duckdb::types::Value;
use duckdb::{Connection, params, params_from_iter};
use readzone_core::{
    ActorId, AuditRecord, BookId, CanonicalBook, Draft, DraftId, DraftStatus, PayloadRecord,
};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::traits::{CatalogStore, DraftFilter, DraftOrder, DraftPatch, DraftStore, DraftTransaction};
use crate::{Seed, StoreError};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS drafts (
    id                VARCHAR PRIMARY KEY,
    owner_id          VARCHAR NOT NULL,
    payload_json      VARCHAR,
    resolved_book_id  VARCHAR,
    version           BIGINT  NOT NULL DEFAULT 0,
    last_accessed     BIGINT  NOT NULL,
    status            VARCHAR NOT NULL DEFAULT 'draft'
);
CREATE TABLE IF NOT EXISTS books (
    id            VARCHAR PRIMARY KEY,
    isbn13        VARCHAR UNIQUE,
    title         VARCHAR NOT NULL,
    authors_json  VARCHAR NOT NULL,
    publisher     VARCHAR
);
CREATE TABLE IF NOT EXISTS draft_audit (
    draft_id     VARCHAR NOT NULL,
    actor_id     VARCHAR NOT NULL,
    action       VARCHAR NOT NULL,
    before_json  VARCHAR NOT NULL,
    after_json   VARCHAR NOT NULL,
    created_at   BIGINT  NOT NULL
);
";

const DRAFT_COLUMNS: &str =
    "id, owner_id, payload_json, resolved_book_id, version, last_accessed, status";

const BOOK_COLUMNS: &str = "id, isbn13, title, authors_json, publisher";

/// DuckDB-backed draft store and catalog.
///
/// Raw payloads and audit states are stored as JSON text and parsed into
/// typed values at this boundary. Timestamps are epoch milliseconds.
///
/// Use [`open`](Self::open) for an ephemeral in-memory database and
/// [`open_persistent`](Self::open_persistent) for a file that survives restarts.
#[derive(Clone)]
pub struct DuckStore {
    conn: Arc<Mutex<Connection>>,
}

impl DuckStore {
    /// Open an in-memory database with the schema created.
    pub fn open() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    /// Open or create a database file at `path` with the schema created.
    pub fn open_persistent(path: &Path) -> Result<Self, StoreError> {
        Self::init(Connection::open(path)?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Insert every book and draft in `seed`, replacing rows with the same id.
    pub async fn load_seed(&self, seed: &Seed) -> Result<(), StoreError> {
        for book in &seed.books {
            self.insert_book(book).await?;
        }
        for draft in &seed.drafts {
            self.insert_draft(draft).await?;
        }
        info!(
            books = seed.books.len(),
            drafts = seed.drafts.len(),
            "loaded seed into duckdb"
        );
        Ok(())
    }

    pub async fn insert_book(&self, book: &CanonicalBook) -> Result<(), StoreError> {
        let authors = serde_json::to_string(&book.authors)?;
        let conn = self.conn.lock().await;
        conn.execute(
            &format!("INSERT OR REPLACE INTO books ({BOOK_COLUMNS}) VALUES (?, ?, ?, ?, ?)"),
            params![
                book.id.as_str(),
                book.isbn13,
                book.title,
                authors,
                book.publisher
            ],
        )?;
        Ok(())
    }

    pub async fn insert_draft(&self, draft: &Draft) -> Result<(), StoreError> {
        let payload = draft.payload.as_ref().map(PayloadRecord::to_json).transpose()?;
        let conn = self.conn.lock().await;
        conn.execute(
            &format!("INSERT OR REPLACE INTO drafts ({DRAFT_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?)"),
            params![
                draft.id.as_str(),
                draft.owner_id.as_str(),
                payload,
                draft.resolved_book_id.as_ref().map(|b| b.as_str().to_string()),
                draft.version,
                draft.last_accessed.timestamp_millis(),
                draft.status.as_str()
            ],
        )?;
        Ok(())
    }

    // ── Counts ──

    pub async fn draft_count(&self) -> Result<usize, StoreError> {
        self.count_table("drafts").await
    }

    pub async fn audit_count(&self) -> Result<usize, StoreError> {
        self.count_table("draft_audit").await
    }

    async fn count_table(&self, table: &str) -> Result<usize, StoreError> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(&format!("SELECT count(*) FROM {table}"), [], |row| {
            row.get(0)
        })?;
        Ok(count as usize)
    }
}

// ── Row decoding ──

struct DraftRow {
    id: String,
    owner_id: String,
    payload_json: Option<String>,
    resolved_book_id: Option<String>,
    version: i64,
    last_accessed: i64,
    status: String,
}

impl DraftRow {
    fn from_row(row: &duckdb::Row<'_>) -> duckdb::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            payload_json: row.get(2)?,
            resolved_book_id: row.get(3)?,
            version: row.get(4)?,
            last_accessed: row.get(5)?,
            status: row.get(6)?,
        })
    }

    fn into_draft(self) -> Result<Draft, StoreError> {
        let corrupt = |reason: String| StoreError::Corrupt {
            id: self.id.clone(),
            reason,
        };
        let status = DraftStatus::parse(&self.status)
            .ok_or_else(|| corrupt(format!("unknown status {:?}", self.status)))?;
        let last_accessed = DateTime::<Utc>::from_timestamp_millis(self.last_accessed)
            .ok_or_else(|| corrupt(format!("timestamp {} out of range", self.last_accessed)))?;
        let payload = match &self.payload_json {
            Some(json) => Some(
                PayloadRecord::from_json(json).map_err(|e| corrupt(format!("payload: {e}")))?,
            ),
            None => None,
        };
        Ok(Draft {
            id: DraftId::new(self.id),
            owner_id: ActorId::new(self.owner_id),
            payload,
            resolved_book_id: self.resolved_book_id.map(BookId::new),
            version: self.version,
            last_accessed,
            status,
        })
    }
}

struct BookRow {
    id: String,
    isbn13: Option<String>,
    title: String,
    authors_json: String,
    publisher: Option<String>,
}

impl BookRow {
    fn from_row(row: &duckdb::Row<'_>) -> duckdb::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            isbn13: row.get(1)?,
            title: row.get(2)?,
            authors_json: row.get(3)?,
            publisher: row.get(4)?,
        })
    }

    fn into_book(self) -> Result<CanonicalBook, StoreError> {
        let authors: Vec<String> =
            serde_json::from_str(&self.authors_json).map_err(|e| StoreError::Corrupt {
                id: self.id.clone(),
                reason: format!("authors: {e}"),
            })?;
        Ok(CanonicalBook {
            id: BookId::new(self.id),
            isbn13: self.isbn13,
            title: self.title,
            authors,
            publisher: self.publisher,
        })
    }
}

fn query_books(
    conn: &Connection,
    sql: &str,
    values: Vec<Value>,
) -> Result<Vec<CanonicalBook>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params_from_iter(values), BookRow::from_row)?
        .collect::<duckdb::Result<Vec<_>>>()?;
    rows.into_iter().map(BookRow::into_book).collect()
}

/// Conditional update shared by the store and its transactions.
fn update_if_version(
    conn: &Connection,
    id: &DraftId,
    expected_version: i64,
    patch: &DraftPatch,
) -> Result<u64, StoreError> {
    let mut sets = vec!["version = version + 1".to_string()];
    let mut values: Vec<Value> = Vec::new();
    if let Some(book_id) = &patch.resolved_book_id {
        sets.push("resolved_book_id = ?".into());
        values.push(Value::Text(book_id.as_str().to_string()));
    }
    if patch.clear_payload {
        sets.push("payload_json = NULL".into());
    }
    if let Some(ts) = patch.last_accessed {
        sets.push("last_accessed = ?".into());
        values.push(Value::BigInt(ts.timestamp_millis()));
    }
    values.push(Value::Text(id.as_str().to_string()));
    values.push(Value::BigInt(expected_version));

    let sql = format!(
        "UPDATE drafts SET {} WHERE id = ? AND version = ?",
        sets.join(", ")
    );
    let rows = conn.execute(&sql, params_from_iter(values))?;
    debug!(draft_id = %id, expected_version, rows, "conditional draft update");
    Ok(rows as u64)
}

#[async_trait]
impl DraftStore for DuckStore {
    async fn find_by_id(&self, id: &DraftId) -> Result<Option<Draft>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!("SELECT {DRAFT_COLUMNS} FROM drafts WHERE id = ?"))?;
        let row = stmt
            .query_map([id.as_str()], DraftRow::from_row)?
            .next()
            .transpose()?;
        row.map(DraftRow::into_draft).transpose()
    }

    async fn update_if_version(
        &self,
        id: &DraftId,
        expected_version: i64,
        patch: &DraftPatch,
    ) -> Result<u64, StoreError> {
        let conn = self.conn.lock().await;
        update_if_version(&conn, id, expected_version, patch)
    }

    async fn find_many(
        &self,
        filter: &DraftFilter,
        order: DraftOrder,
        limit: usize,
    ) -> Result<Vec<Draft>, StoreError> {
        let mut clauses = Vec::new();
        let mut values: Vec<Value> = Vec::new();
        match filter.has_payload {
            Some(true) => clauses.push("payload_json IS NOT NULL".to_string()),
            Some(false) => clauses.push("payload_json IS NULL".to_string()),
            None => {}
        }
        match filter.unresolved {
            Some(true) => clauses.push("resolved_book_id IS NULL".to_string()),
            Some(false) => clauses.push("resolved_book_id IS NOT NULL".to_string()),
            None => {}
        }
        if let Some(status) = filter.status {
            clauses.push("status = ?".to_string());
            values.push(Value::Text(status.as_str().to_string()));
        }
        if let Some(since) = filter.accessed_since {
            clauses.push("last_accessed >= ?".to_string());
            values.push(Value::BigInt(since.timestamp_millis()));
        }
        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let order_by = match order {
            DraftOrder::LastAccessedDesc => "ORDER BY last_accessed DESC, id ASC",
        };
        let sql = format!("SELECT {DRAFT_COLUMNS} FROM drafts {where_clause} {order_by} LIMIT {limit}");

        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values), DraftRow::from_row)?
            .collect::<duckdb::Result<Vec<_>>>()?;
        rows.into_iter().map(DraftRow::into_draft).collect()
    }

    async fn begin(&self) -> Result<Box<dyn DraftTransaction>, StoreError> {
        let conn = Arc::clone(&self.conn).lock_owned().await;
        conn.execute_batch("BEGIN TRANSACTION")?;
        Ok(Box::new(DuckTransaction {
            conn,
            finished: false,
        }))
    }
}

/// An open DuckDB transaction. Holds the connection for its whole lifetime.
struct DuckTransaction {
    conn: OwnedMutexGuard<Connection>,
    finished: bool,
}

#[async_trait]
impl DraftTransaction for DuckTransaction {
    async fn update_if_version(
        &mut self,
        id: &DraftId,
        expected_version: i64,
        patch: &DraftPatch,
    ) -> Result<u64, StoreError> {
        update_if_version(&self.conn, id, expected_version, patch)
    }

    async fn append_audit(&mut self, record: &AuditRecord) -> Result<(), StoreError> {
        let before = serde_json::to_string(&record.before)?;
        let after = serde_json::to_string(&record.after)?;
        self.conn.execute(
            "INSERT INTO draft_audit (draft_id, actor_id, action, before_json, after_json, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                record.draft_id.as_str(),
                record.actor_id.as_str(),
                record.action.as_str(),
                before,
                after,
                record.timestamp.timestamp_millis()
            ],
        )?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut this = self;
        this.finished = true;
        this.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        let mut this = self;
        this.finished = true;
        this.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }
}

impl Drop for DuckTransaction {
    fn drop(&mut self) {
        if !self.finished
            && let Err(e) = self.conn.execute_batch("ROLLBACK")
        {
            warn!(error = %e, "rollback of abandoned transaction failed");
        }
    }
}

#[async_trait]
impl CatalogStore for DuckStore {
    async fn find_by_isbn13(&self, isbn: &str) -> Result<Option<CanonicalBook>, StoreError> {
        let conn = self.conn.lock().await;
        let books = query_books(
            &conn,
            &format!("SELECT {BOOK_COLUMNS} FROM books WHERE isbn13 = ? LIMIT 1"),
            vec![Value::Text(isbn.to_string())],
        )?;
        Ok(books.into_iter().next())
    }

    async fn find_by_title_and_author_substring(
        &self,
        title: &str,
        author: &str,
    ) -> Result<Option<CanonicalBook>, StoreError> {
        let conn = self.conn.lock().await;
        let books = query_books(
            &conn,
            &format!(
                "SELECT {BOOK_COLUMNS} FROM books
                 WHERE contains(lower(title), lower(?)) AND contains(lower(authors_json), lower(?))
                 ORDER BY id LIMIT 1"
            ),
            vec![Value::Text(title.to_string()), Value::Text(author.to_string())],
        )?;
        Ok(books.into_iter().next())
    }

    async fn find_many_by_title_keyword(
        &self,
        keyword: &str,
        limit: usize,
    ) -> Result<Vec<CanonicalBook>, StoreError> {
        let conn = self.conn.lock().await;
        query_books(
            &conn,
            &format!(
                "SELECT {BOOK_COLUMNS} FROM books WHERE contains(lower(title), lower(?))
                 ORDER BY id LIMIT {limit}"
            ),
            vec![Value::Text(keyword.to_string())],
        )
    }
}
