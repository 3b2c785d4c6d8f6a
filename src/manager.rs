//! The writer/reader connection topology.
//!
//! One write connection is guarded by a named lock that records its holder's
//! reason, so a timed-out acquisition can report what was blocking it. Reads
//! come from a bounded pool of read-only connections, except for in-memory
//! databases, whose reads route through the writer (savepoints misbehave on
//! shared-cache in-memory databases). A retry loop with jittered backoff
//! absorbs transient busy/locked failures, and the writer can be swapped for
//! an in-memory copy during heavy imports (bulk load) via the online-backup
//! API.

use std::fmt;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::backup::copy_database;
use crate::{Connection, ConnectionConfig, Error, OpenFlags, Result};

/// Configuration of a [`ConnectionManager`].
#[derive(Clone, Debug)]
pub struct ManagerConfig {
    pub connection: ConnectionConfig,
    /// Readers opened eagerly; at least 1.
    pub min_pool_size: usize,
    /// Upper bound on reader connections; callers wait beyond it.
    pub max_pool_size: usize,
    /// How long a write-lock acquisition may block.
    pub write_lock_timeout: Duration,
    /// `PRAGMA page_size` applied before the database is created.
    pub page_size: Option<u32>,
    /// Attempts made by the retry loop.
    pub retries: u32,
}

impl ManagerConfig {
    pub fn new(path: impl Into<String>) -> ManagerConfig {
        ManagerConfig {
            connection: ConnectionConfig::new(path),
            min_pool_size: 1,
            max_pool_size: 4,
            write_lock_timeout: Duration::from_secs(30),
            page_size: None,
            retries: 10,
        }
    }
}

/// Application schema migrations, driven by `PRAGMA user_version`.
///
/// [`ConnectionManager::open_with_migrator`] loops while the stored version
/// is below [`latest_version`](Migrator::latest_version), calling
/// [`migrate`](Migrator::migrate) with the current version; each call must
/// advance the version through [`MigrationStep::apply`].
pub trait Migrator {
    fn latest_version(&self) -> i64;
    fn migrate(&self, from: i64, step: &mut MigrationStep<'_>) -> Result<()>;
}

/// One migration round: runs DDL inside `BEGIN…COMMIT` and then records the
/// new `user_version`.
pub struct MigrationStep<'a> {
    conn: &'a Connection,
}

impl MigrationStep<'_> {
    pub fn connection(&self) -> &Connection {
        self.conn
    }

    pub fn apply(
        &mut self,
        to_version: i64,
        apply: impl FnOnce(&Connection) -> Result<()>,
    ) -> Result<()> {
        self.conn.execute_batch("BEGIN TRANSACTION")?;
        match apply(self.conn) {
            Ok(()) => {
                self.conn.execute_batch("COMMIT")?;
                self.conn.set_user_version(to_version)?;
                Ok(())
            }
            Err(e) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }
}

struct WriteLockState {
    held: bool,
    reason: String,
}

/// Named lock with a timeout; the holder's reason string is the diagnostic
/// reported when an acquisition times out.
struct WriteLock {
    state: Mutex<WriteLockState>,
    cond: Condvar,
}

impl WriteLock {
    fn new() -> WriteLock {
        WriteLock {
            state: Mutex::new(WriteLockState {
                held: false,
                reason: String::new(),
            }),
            cond: Condvar::new(),
        }
    }

    fn acquire(&self, reason: &str, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        while state.held {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::WriteLockTimeout {
                    held_by: state.reason.clone(),
                });
            }
            let (next, _) = self.cond.wait_timeout(state, deadline - now).unwrap();
            state = next;
        }
        state.held = true;
        state.reason = reason.to_owned();
        Ok(())
    }

    fn release(&self) {
        let mut state = self.state.lock().unwrap();
        state.held = false;
        state.reason.clear();
        drop(state);
        self.cond.notify_one();
    }
}

/// Exclusive access to the write connection; releases the named lock on
/// drop.
pub struct WriteGuard<'a> {
    manager: &'a ConnectionManager,
    conn: Option<MutexGuard<'a, Connection>>,
}

impl Deref for WriteGuard<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_deref().unwrap()
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.conn.take();
        self.manager.lock.release();
    }
}

struct PoolInner {
    free: Vec<Connection>,
    busy: usize,
}

struct ReaderPool {
    inner: Mutex<PoolInner>,
    cond: Condvar,
    max: usize,
}

impl ReaderPool {
    fn new(max: usize) -> ReaderPool {
        ReaderPool {
            inner: Mutex::new(PoolInner {
                free: Vec::new(),
                busy: 0,
            }),
            cond: Condvar::new(),
            max,
        }
    }

    fn seed(&self, conn: Connection) {
        self.inner.lock().unwrap().free.push(conn);
    }

    fn get<'a>(&'a self, open: &dyn Fn() -> Result<Connection>) -> Result<PooledReader<'a>> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(conn) = inner.free.pop() {
                inner.busy += 1;
                return Ok(PooledReader {
                    pool: self,
                    conn: Some(conn),
                });
            }
            if inner.free.len() + inner.busy < self.max {
                inner.busy += 1;
                drop(inner);
                match open() {
                    Ok(conn) => {
                        return Ok(PooledReader {
                            pool: self,
                            conn: Some(conn),
                        })
                    }
                    Err(e) => {
                        self.inner.lock().unwrap().busy -= 1;
                        self.cond.notify_one();
                        return Err(e);
                    }
                }
            }
            // Pool exhausted: wait for a reader to come back.
            inner = self.cond.wait(inner).unwrap();
        }
    }

    fn put(&self, conn: Connection) {
        let mut inner = self.inner.lock().unwrap();
        inner.busy = inner.busy.saturating_sub(1);
        if !conn.is_closed() {
            inner.free.push(conn);
        }
        drop(inner);
        self.cond.notify_one();
    }

    fn dispose(&self) {
        let mut inner = self.inner.lock().unwrap();
        for conn in inner.free.drain(..) {
            if let Err(e) = conn.close() {
                tracing::warn!("failed to close pooled reader: {}", e);
            }
        }
        // Busy readers drain naturally as their handles are dropped.
    }
}

/// A reader connection on loan from the pool; returns on drop.
pub struct PooledReader<'a> {
    pool: &'a ReaderPool,
    conn: Option<Connection>,
}

impl Deref for PooledReader<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().unwrap()
    }
}

impl Drop for PooledReader<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.put(conn);
        }
    }
}

/// One writer plus a bounded reader pool over a single database file.
pub struct ConnectionManager {
    config: ManagerConfig,
    writer: Mutex<Connection>,
    lock: WriteLock,
    readers: ReaderPool,
    in_memory: bool,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("config", &self.config)
            .field("in_memory", &self.in_memory)
            .finish()
    }
}

impl ConnectionManager {
    /// Open and bootstrap the database without schema migrations.
    pub fn open(config: ManagerConfig) -> Result<ConnectionManager> {
        Self::open_inner(config, None)
    }

    /// Open and bootstrap the database, bringing `PRAGMA user_version` up to
    /// the migrator's latest version.
    pub fn open_with_migrator(
        config: ManagerConfig,
        migrator: &dyn Migrator,
    ) -> Result<ConnectionManager> {
        Self::open_inner(config, Some(migrator))
    }

    fn open_inner(
        config: ManagerConfig,
        migrator: Option<&dyn Migrator>,
    ) -> Result<ConnectionManager> {
        let writer = match Self::bootstrap_writer(&config, migrator) {
            Ok(writer) => writer,
            Err(e) => {
                if matches!(e, Error::Corrupt(_)) && !is_memory_path(&config.connection.path) {
                    tracing::error!(
                        path = %config.connection.path,
                        "database is unreadable, deleting its files: {}", e
                    );
                    destroy_database_files(Path::new(&config.connection.path));
                }
                return Err(e);
            }
        };

        let in_memory = writer.is_in_memory();
        let min = config.min_pool_size.max(1);
        let max = config.max_pool_size.max(min);
        let readers = ReaderPool::new(max);
        if !in_memory {
            for _ in 0..min {
                readers.seed(Self::open_reader(&config)?);
            }
        }
        tracing::info!(path = %config.connection.path, "database manager ready");
        Ok(ConnectionManager {
            config,
            writer: Mutex::new(writer),
            lock: WriteLock::new(),
            readers,
            in_memory,
        })
    }

    fn bootstrap_writer(
        config: &ManagerConfig,
        migrator: Option<&dyn Migrator>,
    ) -> Result<Connection> {
        let conn = Connection::open_with_config(config.connection.clone())?;
        Self::apply_writer_pragmas(&conn, config)?;
        if let Some(migrator) = migrator {
            run_migrations(&conn, migrator)?;
        }
        conn.wal_checkpoint_restart()?;
        conn.execute_batch("VACUUM; REINDEX; ANALYZE")?;
        Ok(conn)
    }

    fn apply_writer_pragmas(conn: &Connection, config: &ManagerConfig) -> Result<()> {
        conn.execute_batch("PRAGMA synchronous=NORMAL")?;
        if let Some(page_size) = config.page_size {
            conn.execute_batch(&format!("PRAGMA page_size={}", page_size))?;
        }
        conn.execute_batch("PRAGMA journal_mode=WAL")?;
        conn.execute_batch("PRAGMA cache_size=5000")?;
        Ok(())
    }

    fn open_reader(config: &ManagerConfig) -> Result<Connection> {
        let mut reader_config = config.connection.clone();
        reader_config.open_flags = (reader_config.open_flags
            - (OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE))
            | OpenFlags::SQLITE_OPEN_READ_ONLY;
        let conn = Connection::open_with_config(reader_config)?;
        conn.execute_batch("PRAGMA cache_size=5000")?;
        Ok(conn)
    }

    /// Acquire the named write lock and the writer connection. Blocks up to
    /// the configured timeout; on expiry fails with
    /// [`Error::WriteLockTimeout`] naming the current holder's reason.
    pub fn write_lock(&self, reason: &str) -> Result<WriteGuard<'_>> {
        self.lock.acquire(reason, self.config.write_lock_timeout)?;
        Ok(WriteGuard {
            manager: self,
            conn: Some(self.writer.lock().unwrap()),
        })
    }

    /// Run `action` on the writer under the write lock, retrying transient
    /// failures.
    pub fn write<R>(
        &self,
        reason: &str,
        mut action: impl FnMut(&Connection) -> Result<R>,
    ) -> Result<R> {
        self.run_with_retry(|| {
            let guard = self.write_lock(reason)?;
            action(&guard)
        })
    }

    /// Run `action` on a pooled reader, retrying transient failures.
    /// In-memory databases route through the writer under the write lock.
    pub fn read<R>(&self, mut action: impl FnMut(&Connection) -> Result<R>) -> Result<R> {
        self.run_with_retry(|| {
            if self.in_memory {
                let guard = self.write_lock("read")?;
                action(&guard)
            } else {
                let reader = self.reader()?;
                action(&reader)
            }
        })
    }

    /// Borrow a reader connection directly. Waits (without timeout) when the
    /// pool is at capacity with every reader on loan.
    pub fn reader(&self) -> Result<PooledReader<'_>> {
        self.readers.get(&|| Self::open_reader(&self.config))
    }

    /// Run `action` up to the configured number of attempts, sleeping a
    /// uniform random 500–5000 ms between attempts and retrying transient
    /// failures (engine busy/locked, write-lock timeout). Exhaustion fails
    /// with [`Error::RetryExhausted`] wrapping the last cause.
    pub fn run_with_retry<R>(&self, mut action: impl FnMut() -> Result<R>) -> Result<R> {
        let attempts = self.config.retries.max(1);
        let mut last: Option<Error> = None;
        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = Duration::from_millis(rand::thread_rng().gen_range(500..5000));
                tracing::warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retrying after transient database error"
                );
                thread::sleep(delay);
            }
            match action() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => {
                    tracing::debug!("transient database error: {}", e);
                    last = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::RetryExhausted(Box::new(
            last.expect("retried at least once"),
        )))
    }

    /// Swap the writer for an in-memory copy of the database, filled through
    /// the online-backup API. Writes between this and
    /// [`bulk_load_finish`](ConnectionManager::bulk_load_finish) touch only
    /// memory.
    pub fn bulk_load_start(&self) -> Result<()> {
        self.with_writer_slot("bulk load start", |config, writer| {
            if writer.is_in_memory() {
                return Err(Error::InvalidArgument(
                    "bulk load is already active or the database is in-memory".to_owned(),
                ));
            }
            let mut surrogate_config = config.connection.clone();
            surrogate_config.path = ":memory:".to_owned();
            let mut surrogate = Connection::open_with_config(surrogate_config)?;
            if let Some(page_size) = config.page_size {
                surrogate.execute_batch(&format!("PRAGMA page_size={}", page_size))?;
            }
            copy_database(writer, &mut surrogate)?;
            tracing::info!("bulk load started, writes now target the in-memory surrogate");
            let disk = std::mem::replace(writer, surrogate);
            if let Err(e) = disk.close() {
                tracing::warn!("failed to close the on-disk connection: {}", e);
            }
            Ok(())
        })
    }

    /// Copy the in-memory surrogate back to disk and restore the on-disk
    /// writer.
    pub fn bulk_load_finish(&self) -> Result<()> {
        self.with_writer_slot("bulk load finish", |config, writer| {
            if !writer.is_in_memory() {
                return Err(Error::InvalidArgument("bulk load is not active".to_owned()));
            }
            let mut disk = Connection::open_with_config(config.connection.clone())?;
            Self::apply_writer_pragmas(&disk, config)?;
            copy_database(writer, &mut disk)?;
            tracing::info!("bulk load finished, database copied back to disk");
            let surrogate = std::mem::replace(writer, disk);
            if let Err(e) = surrogate.close() {
                tracing::warn!("failed to close the in-memory surrogate: {}", e);
            }
            Ok(())
        })
    }

    /// Discard the in-memory surrogate and reopen the on-disk database,
    /// abandoning everything written since
    /// [`bulk_load_start`](ConnectionManager::bulk_load_start).
    pub fn bulk_load_rollback(&self) -> Result<()> {
        self.with_writer_slot("bulk load rollback", |config, writer| {
            if !writer.is_in_memory() {
                return Err(Error::InvalidArgument("bulk load is not active".to_owned()));
            }
            let disk = Connection::open_with_config(config.connection.clone())?;
            Self::apply_writer_pragmas(&disk, config)?;
            tracing::warn!("bulk load rolled back, in-memory changes discarded");
            let surrogate = std::mem::replace(writer, disk);
            drop(surrogate);
            Ok(())
        })
    }

    fn with_writer_slot<R>(
        &self,
        reason: &str,
        f: impl FnOnce(&ManagerConfig, &mut Connection) -> Result<R>,
    ) -> Result<R> {
        self.lock.acquire(reason, self.config.write_lock_timeout)?;
        let result = {
            let mut writer = self.writer.lock().unwrap();
            f(&self.config, &mut writer)
        };
        self.lock.release();
        result
    }

    /// Ordered shutdown: `PRAGMA optimize`, dispose readers, checkpoint the
    /// WAL, close the writer. Dropping the manager without calling this
    /// still closes every connection, just without the maintenance steps.
    pub fn close(self) -> Result<()> {
        {
            let writer = self.writer.lock().unwrap();
            if let Err(e) = writer.execute_batch("PRAGMA optimize") {
                tracing::warn!("PRAGMA optimize failed during shutdown: {}", e);
            }
        }
        self.readers.dispose();
        let writer = self.writer.into_inner().unwrap();
        if let Err(e) = writer.wal_checkpoint_restart() {
            tracing::warn!("WAL checkpoint failed during shutdown: {}", e);
        }
        writer.close()
    }
}

fn run_migrations(conn: &Connection, migrator: &dyn Migrator) -> Result<()> {
    let latest = migrator.latest_version();
    let mut current = conn.user_version()?;
    while current < latest {
        tracing::info!(from = current, latest, "migrating database schema");
        let mut step = MigrationStep { conn };
        migrator.migrate(current, &mut step)?;
        let reached = conn.user_version()?;
        if reached <= current {
            return Err(Error::InvalidArgument(format!(
                "migration from version {} made no progress",
                current
            )));
        }
        current = reached;
    }
    Ok(())
}

fn is_memory_path(path: &str) -> bool {
    path == ":memory:" || path.contains("mode=memory")
}

/// Delete the database file and its sidecars (`-journal`, `-shm`, `-wal`,
/// `-mj*` master journals).
fn destroy_database_files(path: &Path) {
    for suffix in ["", "-journal", "-shm", "-wal"] {
        let mut target = path.as_os_str().to_owned();
        target.push(suffix);
        let target = PathBuf::from(target);
        if target.exists() {
            if let Err(e) = std::fs::remove_file(&target) {
                tracing::warn!("could not delete {}: {}", target.display(), e);
            }
        }
    }
    if let Some(file_name) = path.file_name() {
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let prefix = format!("{}-mj", file_name.to_string_lossy());
        if let Ok(entries) = std::fs::read_dir(parent) {
            for entry in entries.flatten() {
                if entry.file_name().to_string_lossy().starts_with(&prefix) {
                    let _ = std::fs::remove_file(entry.path());
                }
            }
        }
    }
}
