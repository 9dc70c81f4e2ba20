//! SQLite Replica Store
//!
//! Local Replica Store backed by a SQLite file via rusqlite.
//!
//! Every successful write is committed together with a change frame in a
//! private outbox table, so the "dirty since last sync" counter always
//! equals the number of frames still waiting to be pushed. File replicas
//! keep a second read-only connection: while a sync apply holds the writer,
//! reads keep running against the pre-apply WAL snapshot.

use crate::domain::entities::{
    ChangeFrame, RemoteFrame, ReplicaId, SqlValue, StatementResult,
};
use crate::domain::errors::{ReplicaError, StatementError};
use crate::domain::value_objects::{EncryptionKey, SyncConfig};
use parking_lot::Mutex;
use rusqlite::types::{Value, ValueRef};
use rusqlite::{
    params, params_from_iter, Connection, OpenFlags, OptionalExtension, Statement,
    TransactionBehavior,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const META_REPLICA_ID: &str = "replica_id";
const META_LAST_SEQ: &str = "last_seq";

/// How a statement is routed before it is prepared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    /// Connection-local setting; never replicated
    Pragma,
    /// BEGIN/COMMIT/ROLLBACK/SAVEPOINT/RELEASE; refused (autocommit only)
    TransactionControl,
    /// Anything else; read or write is decided by SQLite after prepare
    Query,
}

impl StatementKind {
    pub fn of(sql: &str) -> Self {
        let keyword = leading_keyword(sql).to_ascii_uppercase();
        match keyword.as_str() {
            "PRAGMA" => StatementKind::Pragma,
            "BEGIN" | "COMMIT" | "END" | "ROLLBACK" | "SAVEPOINT" | "RELEASE" => {
                StatementKind::TransactionControl
            }
            _ => StatementKind::Query,
        }
    }
}

/// First SQL keyword, skipping whitespace and comments.
fn leading_keyword(sql: &str) -> &str {
    let mut rest = sql;
    loop {
        rest = rest.trim_start();
        if let Some(after) = rest.strip_prefix("--") {
            rest = after.split_once('\n').map(|(_, tail)| tail).unwrap_or("");
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = after.split_once("*/").map(|(_, tail)| tail).unwrap_or("");
        } else {
            break;
        }
    }
    let end = rest
        .find(|c: char| !c.is_ascii_alphabetic())
        .unwrap_or(rest.len());
    &rest[..end]
}

/// Local replica file plus its outbox bookkeeping.
pub struct SqliteReplicaStore {
    path: String,
    replica_id: ReplicaId,
    writer: Mutex<Option<Connection>>,
    /// Snapshot reader; absent for in-memory replicas
    reader: Option<Mutex<Option<Connection>>>,
    dirty: AtomicU64,
    cursor: AtomicU64,
    lock_timeout: Duration,
    closed: AtomicBool,
}

impl SqliteReplicaStore {
    /// Open (creating if absent) the replica described by `config`.
    pub fn open(config: &SyncConfig) -> Result<Self, ReplicaError> {
        let path = config.local_path().to_string();
        let memory = config.is_memory();
        let lock_timeout = config.lock_timeout();

        let writer = open_connection(&path, config.encryption_key(), lock_timeout, false)?;
        if !memory {
            let mode: String = writer
                .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
                .map_err(storage_error)?;
            tracing::debug!("replica {} journal_mode={}", path, mode);
        }
        writer
            .pragma_update(None, "foreign_keys", "ON")
            .map_err(storage_error)?;

        init_schema(&writer)?;
        let replica_id = load_or_create_replica_id(&writer)?;
        let cursor = read_cursor(&writer)?;
        let dirty = count_outbox(&writer)?;

        let reader = if memory {
            None
        } else {
            let conn = open_connection(&path, config.encryption_key(), lock_timeout, true)?;
            Some(Mutex::new(Some(conn)))
        };

        tracing::info!(
            "replica store opened path={} replica_id={} pending={} cursor={}",
            path,
            replica_id,
            dirty,
            cursor
        );

        Ok(Self {
            path,
            replica_id,
            writer: Mutex::new(Some(writer)),
            reader,
            dirty: AtomicU64::new(dirty),
            cursor: AtomicU64::new(cursor),
            lock_timeout,
            closed: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn replica_id(&self) -> &ReplicaId {
        &self.replica_id
    }

    /// Writes committed locally but not yet acknowledged by a sync.
    pub fn dirty(&self) -> u64 {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Highest remote sequence applied to this replica.
    pub fn cursor(&self) -> u64 {
        self.cursor.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), ReplicaError> {
        if self.is_closed() {
            return Err(ReplicaError::Closed);
        }
        Ok(())
    }

    /// Execute one statement.
    ///
    /// Reads return rows and are served from the snapshot reader when one
    /// exists. Writes autocommit, record a change frame and bump the dirty
    /// counter. A write waits at most the lock timeout for a running sync
    /// apply before failing with `ReplicaError::Lock`.
    pub fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<StatementResult, ReplicaError> {
        self.ensure_open()?;

        match StatementKind::of(sql) {
            StatementKind::TransactionControl => {
                Err(StatementError::TransactionControl(sql.trim().to_string()).into())
            }
            StatementKind::Pragma => {
                let mut guard = self.lock_writer()?;
                let conn = guard.as_mut().ok_or(ReplicaError::Closed)?;
                let mut stmt = conn.prepare(sql)?;
                Ok(run_statement(&mut stmt, params)?)
            }
            StatementKind::Query => {
                if let Some(result) = self.try_snapshot_read(sql, params)? {
                    return Ok(result);
                }
                self.execute_on_writer(sql, params)
            }
        }
    }

    /// Run `sql` on the snapshot reader if it is read-only.
    fn try_snapshot_read(
        &self,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<Option<StatementResult>, ReplicaError> {
        let Some(reader) = &self.reader else {
            return Ok(None);
        };
        let guard = reader.lock();
        let conn = guard.as_ref().ok_or(ReplicaError::Closed)?;
        let mut stmt = conn.prepare(sql)?;
        if !stmt.readonly() {
            return Ok(None);
        }
        Ok(Some(run_statement(&mut stmt, params)?))
    }

    fn execute_on_writer(&self, sql: &str, params: &[SqlValue]) -> Result<StatementResult, ReplicaError> {
        let mut guard = self.lock_writer()?;
        let conn = guard.as_mut().ok_or(ReplicaError::Closed)?;

        let tx = conn.transaction()?;
        let mut result = {
            let mut stmt = tx.prepare(sql)?;
            if stmt.readonly() {
                let result = run_statement(&mut stmt, params)?;
                drop(stmt);
                tx.commit()?;
                return Ok(result);
            }
            run_statement(&mut stmt, params)?
        };
        result.last_insert_rowid = tx.last_insert_rowid();

        let encoded = serde_json::to_string(params)
            .map_err(|e| StatementError::Parameters(e.to_string()))?;
        tx.execute(
            "INSERT INTO __replica_outbox (sql, params, recorded_at) VALUES (?1, ?2, ?3)",
            params![sql, encoded, unix_millis()],
        )?;
        tx.commit()?;

        self.dirty.fetch_add(1, Ordering::SeqCst);
        Ok(result)
    }

    fn lock_writer(&self) -> Result<parking_lot::MutexGuard<'_, Option<Connection>>, ReplicaError> {
        self.writer.try_lock_for(self.lock_timeout).ok_or_else(|| {
            ReplicaError::Lock(format!(
                "replica {} busy applying a sync for more than {:?}",
                self.path, self.lock_timeout
            ))
        })
    }

    /// Outbox frames with `origin_seq > after`, oldest first.
    pub fn pending_frames(&self, after: u64, limit: usize) -> Result<Vec<ChangeFrame>, ReplicaError> {
        self.ensure_open()?;
        let load = |conn: &Connection| -> Result<Vec<ChangeFrame>, ReplicaError> {
            let mut stmt = conn.prepare(
                "SELECT id, sql, params FROM __replica_outbox WHERE id > ?1 ORDER BY id LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![after as i64, limit as i64], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            rows.into_iter()
                .map(|(id, sql, encoded)| {
                    let params: Vec<SqlValue> = serde_json::from_str(&encoded).map_err(|e| {
                        ReplicaError::Storage(format!("outbox frame {} is unreadable: {}", id, e))
                    })?;
                    Ok(ChangeFrame {
                        origin_seq: id as u64,
                        sql,
                        params,
                    })
                })
                .collect()
        };

        self.with_reader(load)
    }

    /// Reload the cursor and dirty counter from the file.
    ///
    /// Other connections opened on the same file advance both, so an
    /// exchange starts from what is persisted rather than what this
    /// connection last saw.
    pub fn refresh(&self) -> Result<(u64, u64), ReplicaError> {
        self.ensure_open()?;
        let (cursor, dirty) =
            self.with_reader(|conn| Ok((read_cursor(conn)?, count_outbox(conn)?)))?;
        self.cursor.store(cursor, Ordering::SeqCst);
        self.dirty.store(dirty, Ordering::SeqCst);
        Ok((cursor, dirty))
    }

    /// Run `f` on the snapshot reader, or on the writer for in-memory replicas.
    fn with_reader<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, ReplicaError>,
    ) -> Result<T, ReplicaError> {
        match &self.reader {
            Some(reader) => {
                let guard = reader.lock();
                f(guard.as_ref().ok_or(ReplicaError::Closed)?)
            }
            None => {
                let guard = self.writer.lock();
                f(guard.as_ref().ok_or(ReplicaError::Closed)?)
            }
        }
    }

    /// Apply pulled frames and acknowledge pushed ones in one transaction.
    ///
    /// This is the exclusive apply phase: local writes wait on the writer
    /// lock until it commits. Frames that originated from this replica, and
    /// frames at or below the persisted cursor (applied by another
    /// connection on the same file), are skipped. On error nothing changes,
    /// neither the cursor nor the dirty counter.
    pub fn commit_exchange(
        &self,
        frames: &[RemoteFrame],
        new_cursor: u64,
        acknowledged: u64,
    ) -> Result<usize, ReplicaError> {
        self.ensure_open()?;
        let mut guard = self.writer.lock();
        let conn = guard.as_mut().ok_or(ReplicaError::Closed)?;

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let persisted = read_cursor(&tx)?;
        let mut applied = 0;
        for remote in frames {
            if remote.origin == self.replica_id || remote.seq <= persisted {
                continue;
            }
            let mut stmt = tx.prepare(&remote.frame.sql)?;
            run_statement(&mut stmt, &remote.frame.params).map_err(|e| {
                tracing::error!(
                    "failed to apply remote frame seq={} origin={}: {}",
                    remote.seq,
                    remote.origin,
                    e
                );
                ReplicaError::from(e)
            })?;
            applied += 1;
        }

        let cursor = new_cursor.max(persisted);
        write_meta(&tx, META_LAST_SEQ, &cursor.to_string())?;
        if acknowledged > 0 {
            tx.execute(
                "DELETE FROM __replica_outbox WHERE id <= ?1",
                params![acknowledged as i64],
            )?;
        }
        let remaining = count_outbox(&tx)?;
        tx.commit()?;

        self.cursor.store(cursor, Ordering::SeqCst);
        self.dirty.store(remaining, Ordering::SeqCst);
        Ok(applied)
    }

    /// Release both file handles. Idempotent; waits for a running apply.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(reader) = &self.reader {
            if let Some(conn) = reader.lock().take() {
                close_connection(conn, &self.path);
            }
        }
        if let Some(conn) = self.writer.lock().take() {
            close_connection(conn, &self.path);
        }
        tracing::debug!("replica store closed path={}", self.path);
    }
}

impl Drop for SqliteReplicaStore {
    fn drop(&mut self) {
        self.close();
    }
}

fn close_connection(conn: Connection, path: &str) {
    if let Err((_, e)) = conn.close() {
        tracing::warn!("error closing replica {}: {}", path, e);
    }
}

fn storage_error(err: rusqlite::Error) -> ReplicaError {
    ReplicaError::Storage(err.to_string())
}

fn open_connection(
    path: &str,
    key: Option<&EncryptionKey>,
    busy_timeout: Duration,
    read_only: bool,
) -> Result<Connection, ReplicaError> {
    let conn = if read_only {
        Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
    } else {
        Connection::open(path)
    }
    .map_err(|e| ReplicaError::Storage(format!("cannot open {}: {}", path, e)))?;

    if let Some(key) = key {
        apply_encryption_key(&conn, key)?;
    }
    conn.busy_timeout(busy_timeout).map_err(storage_error)?;
    Ok(conn)
}

/// Key the connection, refusing to continue on a SQLite without cipher support.
fn apply_encryption_key(conn: &Connection, key: &EncryptionKey) -> Result<(), ReplicaError> {
    conn.pragma_update(None, "key", key.expose())
        .map_err(storage_error)?;
    let cipher: Option<String> = conn
        .query_row("PRAGMA cipher_version", [], |row| row.get(0))
        .optional()
        .map_err(storage_error)?;
    if cipher.is_none() {
        return Err(ReplicaError::Storage(
            "encryption key supplied but SQLite was built without cipher support".to_string(),
        ));
    }
    Ok(())
}

fn init_schema(conn: &Connection) -> Result<(), ReplicaError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS __replica_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS __replica_outbox (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            sql TEXT NOT NULL,
            params TEXT NOT NULL,
            recorded_at INTEGER NOT NULL
        );",
    )
    .map_err(|e| match ReplicaError::from(e) {
        ReplicaError::Statement(inner) => ReplicaError::Storage(inner.to_string()),
        other => other,
    })
}

fn read_meta(conn: &Connection, key: &str) -> Result<Option<String>, ReplicaError> {
    Ok(conn
        .query_row(
            "SELECT value FROM __replica_meta WHERE key = ?1",
            [key],
            |row| row.get(0),
        )
        .optional()?)
}

fn read_cursor(conn: &Connection) -> Result<u64, ReplicaError> {
    Ok(read_meta(conn, META_LAST_SEQ)?
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0))
}

fn write_meta(conn: &Connection, key: &str, value: &str) -> Result<(), ReplicaError> {
    conn.execute(
        "INSERT OR REPLACE INTO __replica_meta (key, value) VALUES (?1, ?2)",
        params![key, value],
    )?;
    Ok(())
}

/// Connections racing to open the same file all end up with the first id.
fn load_or_create_replica_id(conn: &Connection) -> Result<ReplicaId, ReplicaError> {
    conn.execute(
        "INSERT OR IGNORE INTO __replica_meta (key, value) VALUES (?1, ?2)",
        params![META_REPLICA_ID, ReplicaId::generate().as_str()],
    )?;
    read_meta(conn, META_REPLICA_ID)?
        .map(ReplicaId)
        .ok_or_else(|| ReplicaError::Storage("replica id missing after initialization".to_string()))
}

fn count_outbox(conn: &Connection) -> Result<u64, ReplicaError> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM __replica_outbox", [], |row| row.get(0))?;
    Ok(count as u64)
}

fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn to_value(value: &SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(v) => Value::Integer(*v),
        SqlValue::Real(v) => Value::Real(*v),
        SqlValue::Text(v) => Value::Text(v.clone()),
        SqlValue::Blob(v) => Value::Blob(v.clone()),
    }
}

fn from_value_ref(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(v) => SqlValue::Integer(v),
        ValueRef::Real(v) => SqlValue::Real(v),
        ValueRef::Text(v) => SqlValue::Text(String::from_utf8_lossy(v).into_owned()),
        ValueRef::Blob(v) => SqlValue::Blob(v.to_vec()),
    }
}

/// Execute a prepared statement, collecting rows when it produces any.
fn run_statement(stmt: &mut Statement<'_>, params: &[SqlValue]) -> rusqlite::Result<StatementResult> {
    let bound = params.iter().map(to_value);

    if stmt.column_count() == 0 {
        let rows_affected = stmt.execute(params_from_iter(bound))?;
        return Ok(StatementResult {
            rows_affected,
            ..Default::default()
        });
    }

    let readonly = stmt.readonly();
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let width = columns.len();
    let mut out = Vec::new();
    let mut rows = stmt.query(params_from_iter(bound))?;
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(width);
        for i in 0..width {
            values.push(from_value_ref(row.get_ref(i)?));
        }
        out.push(values);
    }

    // INSERT ... RETURNING reports one row per changed row.
    let rows_affected = if readonly { 0 } else { out.len() };
    Ok(StatementResult {
        columns,
        rows: out,
        rows_affected,
        last_insert_rowid: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn file_config(dir: &TempDir) -> SyncConfig {
        SyncConfig::builder(dir.path().join("replica.db").to_str().unwrap())
            .lock_timeout(Duration::from_millis(100))
            .build()
            .unwrap()
    }

    fn open_with_table(dir: &TempDir) -> SqliteReplicaStore {
        let store = SqliteReplicaStore::open(&file_config(dir)).unwrap();
        store
            .execute("CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT NOT NULL UNIQUE, value INTEGER)", &[])
            .unwrap();
        store
    }

    fn remote(seq: u64, origin: &ReplicaId, sql: &str, params: Vec<SqlValue>) -> RemoteFrame {
        RemoteFrame {
            seq,
            origin: origin.clone(),
            frame: ChangeFrame {
                origin_seq: seq,
                sql: sql.to_string(),
                params,
            },
        }
    }

    #[test]
    fn test_statement_kind() {
        assert_eq!(StatementKind::of("PRAGMA foreign_keys = ON"), StatementKind::Pragma);
        assert_eq!(StatementKind::of("  begin immediate"), StatementKind::TransactionControl);
        assert_eq!(StatementKind::of("COMMIT"), StatementKind::TransactionControl);
        assert_eq!(
            StatementKind::of("-- note\n/* x */ SAVEPOINT a"),
            StatementKind::TransactionControl
        );
        assert_eq!(StatementKind::of("SELECT 1"), StatementKind::Query);
        assert_eq!(StatementKind::of("insert into t values (1)"), StatementKind::Query);
        assert_eq!(StatementKind::of(""), StatementKind::Query);
    }

    #[test]
    fn test_open_creates_file_and_identity() {
        let dir = TempDir::new().unwrap();
        let config = file_config(&dir);
        let store = SqliteReplicaStore::open(&config).unwrap();

        assert!(dir.path().join("replica.db").exists());
        assert!(!store.replica_id().as_str().is_empty());
        assert_eq!(store.dirty(), 0);
        assert_eq!(store.cursor(), 0);
    }

    #[test]
    fn test_replica_id_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let config = file_config(&dir);

        let first = SqliteReplicaStore::open(&config).unwrap();
        let id = first.replica_id().clone();
        first.close();

        let second = SqliteReplicaStore::open(&config).unwrap();
        assert_eq!(second.replica_id(), &id);
    }

    #[test]
    fn test_open_rejects_garbage_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("replica.db");
        std::fs::write(&path, vec![0xAB; 4096]).unwrap();

        let config = SyncConfig::local(path.to_str().unwrap()).unwrap();
        let result = SqliteReplicaStore::open(&config);
        assert!(matches!(result, Err(ReplicaError::Storage(_))));
    }

    #[test]
    fn test_open_missing_directory_is_storage_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing").join("replica.db");
        let config = SyncConfig::local(path.to_str().unwrap()).unwrap();

        assert!(matches!(
            SqliteReplicaStore::open(&config),
            Err(ReplicaError::Storage(_))
        ));
    }

    #[test]
    fn test_encryption_without_cipher_support_fails_closed() {
        let dir = TempDir::new().unwrap();
        let config = SyncConfig::builder(dir.path().join("enc.db").to_str().unwrap())
            .encryption_key("secret")
            .build()
            .unwrap();

        // The default bundled SQLite has no cipher; never fall back to plaintext.
        if !cfg!(feature = "sqlcipher") {
            assert!(matches!(
                SqliteReplicaStore::open(&config),
                Err(ReplicaError::Storage(_))
            ));
        }
    }

    #[test]
    fn test_read_your_writes_in_order() {
        let dir = TempDir::new().unwrap();
        let store = open_with_table(&dir);

        for i in 0..20i64 {
            store
                .execute(
                    "INSERT INTO items (name, value) VALUES (?1, ?2)",
                    &[format!("item-{}", i).into(), i.into()],
                )
                .unwrap();
            let read = store
                .execute("SELECT COUNT(*) FROM items", &[])
                .unwrap();
            assert_eq!(read.rows[0][0], SqlValue::Integer(i + 1));
        }

        let rows = store
            .execute("SELECT name, value FROM items ORDER BY id", &[])
            .unwrap();
        assert_eq!(rows.columns, vec!["name".to_string(), "value".to_string()]);
        for (i, row) in rows.rows.iter().enumerate() {
            assert_eq!(row[0], SqlValue::Text(format!("item-{}", i)));
            assert_eq!(row[1], SqlValue::Integer(i as i64));
        }
    }

    #[test]
    fn test_writes_increment_dirty_reads_do_not() {
        let dir = TempDir::new().unwrap();
        let store = open_with_table(&dir);
        assert_eq!(store.dirty(), 1); // CREATE TABLE

        let result = store
            .execute("INSERT INTO items (name) VALUES ('a')", &[])
            .unwrap();
        assert_eq!(result.rows_affected, 1);
        assert!(result.last_insert_rowid > 0);
        assert_eq!(store.dirty(), 2);

        store.execute("SELECT * FROM items", &[]).unwrap();
        store.execute("PRAGMA foreign_keys", &[]).unwrap();
        assert_eq!(store.dirty(), 2);
    }

    #[test]
    fn test_failed_write_is_not_recorded() {
        let dir = TempDir::new().unwrap();
        let store = open_with_table(&dir);
        store
            .execute("INSERT INTO items (name) VALUES ('dup')", &[])
            .unwrap();
        let before = store.dirty();

        let err = store
            .execute("INSERT INTO items (name) VALUES ('dup')", &[])
            .unwrap_err();
        assert!(matches!(
            err,
            ReplicaError::Statement(StatementError::Constraint(_))
        ));
        assert_eq!(store.dirty(), before);
        assert_eq!(store.pending_frames(0, 100).unwrap().len() as u64, before);
    }

    #[test]
    fn test_malformed_and_transaction_control() {
        let dir = TempDir::new().unwrap();
        let store = open_with_table(&dir);

        assert!(matches!(
            store.execute("INSRT INTO items", &[]),
            Err(ReplicaError::Statement(StatementError::Malformed(_)))
        ));
        assert!(matches!(
            store.execute("BEGIN", &[]),
            Err(ReplicaError::Statement(StatementError::TransactionControl(_)))
        ));
        assert!(matches!(
            store.execute("INSERT INTO items (name) VALUES (?1)", &[]),
            Err(ReplicaError::Statement(_))
        ));
    }

    #[test]
    fn test_insert_returning() {
        let dir = TempDir::new().unwrap();
        let store = open_with_table(&dir);

        let result = store
            .execute("INSERT INTO items (name) VALUES ('r') RETURNING id, name", &[])
            .unwrap();
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows_affected, 1);
        assert_eq!(result.rows[0][1], SqlValue::Text("r".to_string()));
        assert_eq!(store.dirty(), 2);
    }

    #[test]
    fn test_pending_frames_carry_params() {
        let dir = TempDir::new().unwrap();
        let store = open_with_table(&dir);
        store
            .execute(
                "INSERT INTO items (name, value) VALUES (?1, ?2)",
                &["x".into(), SqlValue::Null],
            )
            .unwrap();

        let frames = store.pending_frames(0, 10).unwrap();
        assert_eq!(frames.len(), 2);
        assert!(frames[0].sql.starts_with("CREATE TABLE"));
        assert_eq!(frames[1].params, vec![SqlValue::Text("x".into()), SqlValue::Null]);
        assert!(frames[0].origin_seq < frames[1].origin_seq);

        let after_first = store.pending_frames(frames[0].origin_seq, 10).unwrap();
        assert_eq!(after_first.len(), 1);
    }

    #[test]
    fn test_commit_exchange_applies_foreign_and_skips_own() {
        let dir = TempDir::new().unwrap();
        let store = open_with_table(&dir);
        let own = store.replica_id().clone();
        let other = ReplicaId("other".to_string());

        let frames = vec![
            remote(1, &own, "CREATE TABLE items (id INTEGER PRIMARY KEY)", vec![]),
            remote(
                2,
                &other,
                "INSERT INTO items (name, value) VALUES (?1, ?2)",
                vec!["remote".into(), 9i64.into()],
            ),
        ];
        let pushed = store.pending_frames(0, 10).unwrap();
        let applied = store
            .commit_exchange(&frames, 2, pushed.last().unwrap().origin_seq)
            .unwrap();

        assert_eq!(applied, 1);
        assert_eq!(store.cursor(), 2);
        assert_eq!(store.dirty(), 0);
        let rows = store
            .execute("SELECT value FROM items WHERE name = 'remote'", &[])
            .unwrap();
        assert_eq!(rows.rows, vec![vec![SqlValue::Integer(9)]]);
    }

    #[test]
    fn test_commit_exchange_failure_changes_nothing() {
        let dir = TempDir::new().unwrap();
        let store = open_with_table(&dir);
        store.execute("INSERT INTO items (name) VALUES ('a')", &[]).unwrap();
        let other = ReplicaId("other".to_string());

        let frames = vec![
            remote(1, &other, "INSERT INTO items (name) VALUES ('b')", vec![]),
            remote(2, &other, "INSERT INTO missing_table VALUES (1)", vec![]),
        ];
        assert!(store.commit_exchange(&frames, 2, 2).is_err());

        assert_eq!(store.cursor(), 0);
        assert_eq!(store.dirty(), 2);
        let rows = store.execute("SELECT COUNT(*) FROM items", &[]).unwrap();
        assert_eq!(rows.rows[0][0], SqlValue::Integer(1));
    }

    #[test]
    fn test_dirty_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let config = file_config(&dir);
        {
            let store = open_with_table(&dir);
            store.execute("INSERT INTO items (name) VALUES ('a')", &[]).unwrap();
            store.close();
        }
        let store = SqliteReplicaStore::open(&config).unwrap();
        assert_eq!(store.dirty(), 2);
    }

    #[test]
    fn test_write_during_apply_times_out_with_lock_error() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(open_with_table(&dir));

        let guard = store.writer.lock();
        let writer = {
            let store = store.clone();
            std::thread::spawn(move || store.execute("INSERT INTO items (name) VALUES ('w')", &[]))
        };
        let result = writer.join().unwrap();
        drop(guard);

        assert!(matches!(result, Err(ReplicaError::Lock(_))));
        assert_eq!(store.dirty(), 1);
    }

    #[test]
    fn test_write_blocks_until_apply_completes() {
        let dir = TempDir::new().unwrap();
        let config = SyncConfig::builder(dir.path().join("replica.db").to_str().unwrap())
            .lock_timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        let store = Arc::new(SqliteReplicaStore::open(&config).unwrap());
        store
            .execute("CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT)", &[])
            .unwrap();

        let guard = store.writer.lock();
        let writer = {
            let store = store.clone();
            std::thread::spawn(move || store.execute("INSERT INTO items (name) VALUES ('w')", &[]))
        };
        std::thread::sleep(Duration::from_millis(50));
        drop(guard);

        assert!(writer.join().unwrap().is_ok());
        assert_eq!(store.dirty(), 2);
    }

    #[test]
    fn test_reads_continue_during_apply() {
        let dir = TempDir::new().unwrap();
        let store = open_with_table(&dir);
        store.execute("INSERT INTO items (name) VALUES ('a')", &[]).unwrap();

        let _apply = store.writer.lock();
        let rows = store.execute("SELECT COUNT(*) FROM items", &[]).unwrap();
        assert_eq!(rows.rows[0][0], SqlValue::Integer(1));
    }

    #[test]
    fn test_memory_store_reads_and_writes() {
        let config = SyncConfig::local(":memory:").unwrap();
        let store = SqliteReplicaStore::open(&config).unwrap();
        store.execute("CREATE TABLE t (v INTEGER)", &[]).unwrap();
        store.execute("INSERT INTO t VALUES (?1)", &[5i64.into()]).unwrap();

        let rows = store.execute("SELECT v FROM t", &[]).unwrap();
        assert_eq!(rows.rows, vec![vec![SqlValue::Integer(5)]]);
        assert_eq!(store.dirty(), 2);
    }

    #[test]
    fn test_close_is_idempotent_and_rejects_use() {
        let dir = TempDir::new().unwrap();
        let store = open_with_table(&dir);
        store.close();
        store.close();

        assert!(store.is_closed());
        assert!(matches!(
            store.execute("SELECT 1", &[]),
            Err(ReplicaError::Closed)
        ));
        assert!(matches!(
            store.pending_frames(0, 1),
            Err(ReplicaError::Closed)
        ));
    }
}
