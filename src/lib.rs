//! Tablite is a typed record/table layer over SQLite.
//!
//! A [`Record`] type describes its table with a typed builder; connections
//! synthesize and migrate the schema from that descriptor, cache prepared
//! statements, run nested savepoint transactions, and classify constraint
//! failures into a stable error taxonomy. [`manager::ConnectionManager`]
//! adds a single-writer/pooled-reader topology with a named write lock and
//! retry with jittered backoff.
//!
//! ```rust,no_run
//! use tablite::{Column, Connection, Record, Result, TableDescriptor};
//!
//! #[derive(Default)]
//! struct Stock {
//!     id: i64,
//!     symbol: String,
//! }
//!
//! impl Record for Stock {
//!     fn table() -> TableDescriptor<Stock> {
//!         TableDescriptor::builder("Stock")
//!             .column(
//!                 Column::new("Id", |s: &Stock| s.id, |s, v| s.id = v)
//!                     .primary_key()
//!                     .auto_increment(),
//!             )
//!             .column(Column::new(
//!                 "Symbol",
//!                 |s: &Stock| s.symbol.clone(),
//!                 |s, v| s.symbol = v,
//!             ))
//!             .build()
//!     }
//! }
//!
//! fn main() -> Result<()> {
//!     let db = Connection::open("stocks.db")?;
//!     db.create_table::<Stock>()?;
//!     let mut stock = Stock {
//!         id: 0,
//!         symbol: "TSLA".to_owned(),
//!     };
//!     db.insert(&mut stock)?;
//!     let found: Stock = db.get(stock.id)?;
//!     assert_eq!(found.symbol, "TSLA");
//!     Ok(())
//! }
//! ```

pub use libsqlite3_sys as ffi;

use std::cell::{Cell, RefCell};
use std::convert::TryFrom;
use std::ffi::CString;
use std::fmt;
use std::os::raw::{c_char, c_int};
use std::sync::Arc;
use std::time::Duration;

use smallvec::SmallVec;

pub use crate::backup::{Backup, StepResult};
pub use crate::cache::CachedStatement;
pub use crate::error::{ConstraintFailure, Error, SqliteFailure};
pub use crate::mapping::{
    Column, CreateFlags, IndexDescriptor, IndexParticipation, MappingRegistry, OnConflict, Record,
    TableBuilder, TableDescriptor,
};
pub use crate::manager::{
    ConnectionManager, ManagerConfig, MigrationStep, Migrator, PooledReader, WriteGuard,
};
pub use crate::schema::{ColumnInfo, CreateTableResult, IndexInfo};
pub use crate::statement::{CommandEvent, CommandObserver, MappedRows, Row, Rows, Statement};
pub use crate::version::{version, version_number};

use crate::cache::StatementCache;
use crate::inner_connection::InnerConnection;
use crate::transaction::TxEntry;
use crate::types::{ColumnValue, Value, ValueContext, ValueRef};

mod backup;
mod cache;
mod error;
mod inner_connection;
pub mod manager;
mod mapping;
mod raw_statement;
mod schema;
mod statement;
mod transaction;
pub mod types;
mod version;

/// A typed result with this crate's [`Error`] type.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The engine's default ceiling on bound parameters per statement. The
/// engine can be rebuilt or reconfigured with a different limit at runtime;
/// this port keeps the stock literal and chunks batched inserts under it.
pub(crate) const MAX_BOUND_PARAMETERS: usize = 999;

const DEFAULT_STATEMENT_CACHE_CAPACITY: usize = 16;

/// Build a `&[Value]` parameter list from heterogeneous host values.
///
/// ```rust,no_run
/// # use tablite::{params, Connection, Result};
/// # fn f(db: &Connection) -> Result<usize> {
/// db.execute("INSERT INTO t (x, y) VALUES (?, ?)", &params![42, "answer"])
/// # }
/// ```
#[macro_export]
macro_rules! params {
    () => {{
        let params: [$crate::types::Value; 0] = [];
        params
    }};
    ($($value:expr),+ $(,)?) => {
        [$($crate::types::Value::from($value)),+]
    };
}

bitflags::bitflags! {
    /// Flags for opening SQLite database connections. See
    /// [sqlite3_open_v2](http://www.sqlite.org/c3ref/open.html) for details.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct OpenFlags: c_int {
        const SQLITE_OPEN_READ_ONLY     = ffi::SQLITE_OPEN_READONLY;
        const SQLITE_OPEN_READ_WRITE    = ffi::SQLITE_OPEN_READWRITE;
        const SQLITE_OPEN_CREATE        = ffi::SQLITE_OPEN_CREATE;
        const SQLITE_OPEN_URI           = 0x0000_0040;
        const SQLITE_OPEN_MEMORY        = 0x0000_0080;
        const SQLITE_OPEN_NO_MUTEX      = ffi::SQLITE_OPEN_NOMUTEX;
        const SQLITE_OPEN_FULL_MUTEX    = ffi::SQLITE_OPEN_FULLMUTEX;
        const SQLITE_OPEN_SHARED_CACHE  = 0x0002_0000;
        const SQLITE_OPEN_PRIVATE_CACHE = 0x0004_0000;
        const SQLITE_OPEN_WAL           = 0x0008_0000;
    }
}

impl Default for OpenFlags {
    fn default() -> OpenFlags {
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX
            | OpenFlags::SQLITE_OPEN_URI
    }
}

/// Trace sink: receives one line per traced command.
pub type Tracer = Arc<dyn Fn(&str) + Send + Sync>;

/// Everything configurable on a single connection.
#[derive(Clone)]
pub struct ConnectionConfig {
    /// File path, `":memory:"`, or a `file:` URI.
    pub path: String,
    pub open_flags: OpenFlags,
    /// Store wall-clock date-times as 100 ns ticks instead of ISO-8601 text.
    pub store_datetime_as_ticks: bool,
    /// Forwarded to `sqlite3_busy_timeout`.
    pub busy_timeout: Duration,
    /// Emit one trace line per command.
    pub trace: bool,
    /// Sink for trace lines; when absent they go to the `tablite` tracing
    /// target at debug level.
    pub tracer: Option<Tracer>,
    /// Emit a timing line for commands slower than
    /// [`trace_time_exceeding`](ConnectionConfig::trace_time_exceeding).
    pub trace_time: bool,
    pub trace_time_exceeding: Duration,
    /// Descriptor registry; the process-wide one when absent.
    pub mappings: Option<Arc<MappingRegistry>>,
}

impl ConnectionConfig {
    pub fn new(path: impl Into<String>) -> ConnectionConfig {
        ConnectionConfig {
            path: path.into(),
            open_flags: OpenFlags::default(),
            store_datetime_as_ticks: true,
            busy_timeout: Duration::from_millis(5000),
            trace: false,
            tracer: None,
            trace_time: false,
            trace_time_exceeding: Duration::from_millis(500),
            mappings: None,
        }
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("path", &self.path)
            .field("open_flags", &self.open_flags)
            .field("store_datetime_as_ticks", &self.store_datetime_as_ticks)
            .field("busy_timeout", &self.busy_timeout)
            .field("trace", &self.trace)
            .field("trace_time", &self.trace_time)
            .finish()
    }
}

/// Kind of mutation reported by a [`TableChanged`] event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableAction {
    Insert,
    Update,
    Delete,
}

/// Emitted after every successful mutation, on the thread that executed it.
#[derive(Debug)]
pub struct TableChanged<'a> {
    pub table: &'a str,
    pub action: TableAction,
    pub rows: usize,
}

type ChangeHook = Box<dyn Fn(&TableChanged<'_>) + Send>;

/// A connection to a SQLite database.
///
/// Connections are `Send` but not `Sync`: exactly one caller uses a
/// connection at a time (the pool enforces this by lending connections out),
/// which also serializes its cached prepared statements.
pub struct Connection {
    // Declared before `db`: cached statements must finalize before the
    // handle closes.
    cache: StatementCache,
    db: RefCell<InnerConnection>,
    pub(crate) tx: RefCell<Vec<TxEntry>>,
    change_hooks: RefCell<Vec<ChangeHook>>,
    observer: RefCell<Option<Arc<dyn CommandObserver>>>,
    trace: Cell<bool>,
    tracer: RefCell<Option<Tracer>>,
    trace_time: Cell<bool>,
    trace_time_exceeding: Duration,
    store_datetime_as_ticks: bool,
    mappings: Option<Arc<MappingRegistry>>,
}

// The raw statement pointers in the cache are only touched through &self /
// &mut self on this connection, which moves between threads as a whole.
unsafe impl Send for Connection {}

impl Connection {
    /// Open a read-write connection, creating the database if needed.
    pub fn open(path: &str) -> Result<Connection> {
        Connection::open_with_config(ConnectionConfig::new(path))
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Connection> {
        Connection::open(":memory:")
    }

    pub fn open_with_flags(path: &str, flags: OpenFlags) -> Result<Connection> {
        let mut config = ConnectionConfig::new(path);
        config.open_flags = flags;
        Connection::open_with_config(config)
    }

    pub fn open_with_config(config: ConnectionConfig) -> Result<Connection> {
        let c_path = str_to_cstring(&config.path)?;
        let mut db = InnerConnection::open_with_flags(&c_path, config.open_flags)?;
        db.busy_timeout(duration_to_ms(config.busy_timeout))?;
        Ok(Connection {
            cache: StatementCache::with_capacity(DEFAULT_STATEMENT_CACHE_CAPACITY),
            db: RefCell::new(db),
            tx: RefCell::new(Vec::new()),
            change_hooks: RefCell::new(Vec::new()),
            observer: RefCell::new(None),
            trace: Cell::new(config.trace),
            tracer: RefCell::new(config.tracer),
            trace_time: Cell::new(config.trace_time),
            trace_time_exceeding: config.trace_time_exceeding,
            store_datetime_as_ticks: config.store_datetime_as_ticks,
            mappings: config.mappings,
        })
    }

    /// Compile a statement. Prefer
    /// [`prepare_cached`](Connection::prepare_cached) for statements that
    /// run more than once.
    pub fn prepare(&self, sql: &str) -> Result<Statement<'_>> {
        let raw = self.db.borrow_mut().prepare(sql)?;
        Ok(Statement::new(self, raw))
    }

    /// Execute a single parameterized statement and return the number of
    /// rows changed.
    pub fn execute(&self, sql: &str, params: &[Value]) -> Result<usize> {
        let mut stmt = self.prepare_cached(sql)?;
        stmt.execute(params)
    }

    /// Execute one or more `;`-separated statements without parameters.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.db.borrow_mut().execute_batch(sql)
    }

    /// Execute a query and read the first column of its first row.
    pub fn query_scalar<V: ColumnValue>(&self, sql: &str, params: &[Value]) -> Result<Option<V>> {
        let mut stmt = self.prepare_cached(sql)?;
        stmt.query_scalar(params)
    }

    /// Execute a query and materialize every row into a `T`.
    pub fn query<T: Record>(&self, sql: &str, params: &[Value]) -> Result<Vec<T>> {
        let mapping = self.mapping::<T>();
        let mut stmt = self.prepare_cached(sql)?;
        let rows = stmt.query(mapping, params)?;
        rows.collect()
    }

    /// The cached descriptor for `T`.
    pub fn mapping<T: Record>(&self) -> Arc<TableDescriptor<T>> {
        self.registry().get::<T>()
    }

    fn registry(&self) -> &MappingRegistry {
        match self.mappings {
            Some(ref registry) => registry,
            None => MappingRegistry::global(),
        }
    }

    /// Number of rows changed by the most recent statement.
    pub fn changes(&self) -> usize {
        self.db.borrow().changes()
    }

    pub fn last_insert_rowid(&self) -> i64 {
        self.db.borrow().last_insert_rowid()
    }

    pub fn is_autocommit(&self) -> bool {
        self.db.borrow().is_autocommit()
    }

    /// Set the engine's busy handler timeout.
    pub fn busy_timeout(&self, timeout: Duration) -> Result<()> {
        self.db.borrow_mut().busy_timeout(duration_to_ms(timeout))
    }

    /// The file backing this database; `None` for in-memory databases.
    pub fn db_filename(&self) -> Option<String> {
        let main = CString::new("main").expect("static str");
        self.db.borrow().db_filename(&main)
    }

    pub fn is_in_memory(&self) -> bool {
        self.db_filename().is_none()
    }

    /// `PRAGMA user_version`: the application schema version, 0 on first
    /// open.
    pub fn user_version(&self) -> Result<i64> {
        Ok(self
            .query_scalar::<i64>("PRAGMA user_version", &[])?
            .unwrap_or(0))
    }

    pub fn set_user_version(&self, version: i64) -> Result<()> {
        self.execute_batch(&format!("PRAGMA user_version = {}", version))
    }

    /// `PRAGMA journal_mode` of the main database (e.g. `"wal"`).
    pub fn journal_mode(&self) -> Result<String> {
        Ok(self
            .query_scalar::<String>("PRAGMA journal_mode", &[])?
            .unwrap_or_default())
    }

    /// `PRAGMA wal_checkpoint(RESTART)` on the main database.
    pub fn wal_checkpoint_restart(&self) -> Result<()> {
        self.db.borrow().wal_checkpoint_restart()
    }

    pub fn enable_load_extension(&self, on: bool) -> Result<()> {
        self.db.borrow_mut().enable_load_extension(on)
    }

    pub fn is_closed(&self) -> bool {
        self.db.borrow().is_closed()
    }

    /// Finalize cached statements and close the handle.
    pub fn close(self) -> Result<()> {
        self.flush_prepared_statement_cache();
        self.db.borrow_mut().close()
    }

    /// Register a mutation observer; every successful insert/update/delete
    /// reports `(table, action, rows)`.
    pub fn on_table_changed(&self, hook: ChangeHook) {
        self.change_hooks.borrow_mut().push(hook);
    }

    /// Install (or clear) the command lifecycle observer.
    pub fn set_command_observer(&self, observer: Option<Arc<dyn CommandObserver>>) {
        *self.observer.borrow_mut() = observer;
    }

    pub fn set_trace(&self, enabled: bool) {
        self.trace.set(enabled);
    }

    pub fn set_tracer(&self, tracer: Option<Tracer>) {
        *self.tracer.borrow_mut() = tracer;
    }

    pub fn set_trace_time(&self, enabled: bool) {
        self.trace_time.set(enabled);
    }

    pub(crate) fn store_datetime_as_ticks(&self) -> bool {
        self.store_datetime_as_ticks
    }

    pub(crate) fn trace_enabled(&self) -> bool {
        self.trace.get()
    }

    pub(crate) fn trace_time_enabled(&self) -> bool {
        self.trace_time.get()
    }

    pub(crate) fn codec_ctx(&self, enum_as_text: bool) -> ValueContext {
        ValueContext {
            datetime_as_ticks: self.store_datetime_as_ticks,
            enum_as_text,
        }
    }

    pub(crate) fn handle(&self) -> *mut ffi::sqlite3 {
        self.db.borrow().db()
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        self.db.borrow().ensure_open()
    }

    pub(crate) fn decode_result(&self, code: c_int) -> Result<()> {
        self.db.borrow().decode_result(code)
    }

    pub(crate) fn command_observer(&self) -> Option<Arc<dyn CommandObserver>> {
        self.observer.borrow().clone()
    }

    pub(crate) fn emit_table_changed(&self, table: &str, action: TableAction, rows: usize) {
        let event = TableChanged {
            table,
            action,
            rows,
        };
        for hook in self.change_hooks.borrow().iter() {
            hook(&event);
        }
    }

    pub(crate) fn trace_sql(&self, verb: &str, sql: &str, params: &[Value]) {
        if !self.trace.get() {
            return;
        }
        let mut line = format!("{}: {}", verb, sql);
        for (i, param) in params.iter().enumerate() {
            line.push_str(&format!("\n  {}: {:?}", i, param));
        }
        self.emit_trace(&line);
    }

    pub(crate) fn trace_elapsed(&self, sql: &str, elapsed: Duration) {
        if self.trace_time.get() && elapsed >= self.trace_time_exceeding {
            self.emit_trace(&format!(
                "Database took {} ms to execute: {}",
                elapsed.as_millis(),
                sql
            ));
        }
    }

    fn emit_trace(&self, line: &str) {
        match self.tracer.borrow().as_ref() {
            Some(tracer) => tracer(line),
            None => tracing::debug!(target: "tablite", "{}", line),
        }
    }
}

// The record verbs.
impl Connection {
    /// Insert `obj` as a new row. A nil auto-GUID primary key is generated
    /// first; an auto-increment primary key is written back from
    /// `last_insert_rowid` afterwards.
    pub fn insert<T: Record>(&self, obj: &mut T) -> Result<usize> {
        self.insert_with(obj, OnConflict::Abort)
    }

    /// `INSERT OR REPLACE`: all columns, including the primary key, are
    /// written.
    pub fn insert_or_replace<T: Record>(&self, obj: &mut T) -> Result<usize> {
        self.insert_with(obj, OnConflict::Replace)
    }

    pub fn insert_with<T: Record>(&self, obj: &mut T, on_conflict: OnConflict) -> Result<usize> {
        let mapping = self.mapping::<T>();
        self.fill_auto_guid(&mapping, obj)?;
        let columns = mapping.insert_column_indices(on_conflict);
        let sql = mapping.insert_sql(on_conflict);
        let mut args: SmallVec<[Value; 8]> = SmallVec::new();
        for &ci in columns {
            let column = &mapping.columns()[ci];
            args.push(column.value_of(obj, &self.codec_ctx(column.stores_as_text()))?);
        }
        let count = {
            let mut stmt = self.prepare_cached(&sql)?;
            stmt.set_constraint_columns(mapping.diagnostic_columns().to_vec());
            stmt.execute(&args)?
        };
        if let Some(pk) = mapping.auto_inc_pk_index() {
            let rowid = self.last_insert_rowid();
            let column = &mapping.columns()[pk];
            column.assign(obj, ValueRef::Integer(rowid), &self.codec_ctx(false))?;
        }
        self.emit_table_changed(mapping.table_name(), TableAction::Insert, count);
        Ok(count)
    }

    /// Insert every element. When `run_in_transaction` is set the whole call
    /// is wrapped in a savepoint, so a failure persists nothing.
    ///
    /// Rows are written with multi-row `INSERT … VALUES` batches when the
    /// engine supports them (3.7.11), the mapping has no auto-increment
    /// primary key (row-ids could not be written back), and each batch stays
    /// under the engine's bound-parameter ceiling; otherwise it falls back
    /// to per-row inserts.
    pub fn insert_all<T: Record>(
        &self,
        objs: &mut [T],
        on_conflict: OnConflict,
        run_in_transaction: bool,
    ) -> Result<usize> {
        if run_in_transaction {
            self.run_in_transaction(|conn| conn.insert_all_inner(objs, on_conflict))
        } else {
            self.insert_all_inner(objs, on_conflict)
        }
    }

    fn insert_all_inner<T: Record>(&self, objs: &mut [T], on_conflict: OnConflict) -> Result<usize> {
        let mapping = self.mapping::<T>();
        let columns = mapping.insert_column_indices(on_conflict);
        let batched = version_number() >= 3_007_011
            && mapping.auto_inc_pk_index().is_none()
            && !columns.is_empty()
            && columns.len() <= MAX_BOUND_PARAMETERS
            && !objs.is_empty();
        if !batched {
            let mut total = 0;
            for obj in objs.iter_mut() {
                total += self.insert_with(obj, on_conflict)?;
            }
            return Ok(total);
        }

        for obj in objs.iter_mut() {
            self.fill_auto_guid(&mapping, obj)?;
        }

        let verb = match on_conflict {
            OnConflict::Abort => "INSERT",
            OnConflict::Replace => "INSERT OR REPLACE",
            OnConflict::Ignore => "INSERT OR IGNORE",
        };
        let column_list = columns
            .iter()
            .map(|&ci| quote_identifier(mapping.columns()[ci].name()))
            .collect::<Vec<_>>()
            .join(", ");
        let row_placeholders = format!("({})", vec!["?"; columns.len()].join(", "));
        let rows_per_batch = (MAX_BOUND_PARAMETERS / columns.len()).max(1);

        let mut total = 0;
        for chunk in objs.chunks(rows_per_batch) {
            let values = vec![row_placeholders.as_str(); chunk.len()].join(", ");
            let sql = format!(
                "{} INTO {} ({}) VALUES {}",
                verb,
                quote_identifier(mapping.table_name()),
                column_list,
                values
            );
            let mut args: Vec<Value> = Vec::with_capacity(chunk.len() * columns.len());
            for obj in chunk {
                for &ci in columns {
                    let column = &mapping.columns()[ci];
                    args.push(column.value_of(obj, &self.codec_ctx(column.stores_as_text()))?);
                }
            }
            let mut stmt = self.prepare_cached(&sql)?;
            stmt.set_constraint_columns(mapping.diagnostic_columns().to_vec());
            total += stmt.execute(&args)?;
        }
        self.emit_table_changed(mapping.table_name(), TableAction::Insert, total);
        Ok(total)
    }

    fn fill_auto_guid<T: Record>(&self, mapping: &TableDescriptor<T>, obj: &mut T) -> Result<()> {
        const NIL_UUID: &str = "00000000-0000-0000-0000-000000000000";
        if let Some(ci) = mapping.auto_guid_pk_index() {
            let column = &mapping.columns()[ci];
            let ctx = self.codec_ctx(column.stores_as_text());
            if let Value::Text(current) = column.value_of(obj, &ctx)? {
                if current == NIL_UUID {
                    let fresh = uuid::Uuid::new_v4().to_string();
                    column.assign(obj, ValueRef::Text(&fresh), &ctx)?;
                }
            }
        }
        Ok(())
    }

    /// Update the row whose primary key matches `obj`, writing every non-key
    /// column.
    pub fn update<T: Record>(&self, obj: &T) -> Result<usize> {
        let mapping = self.mapping::<T>();
        let pk = mapping.primary_key_index().ok_or_else(|| {
            Error::UnsupportedOperation(format!(
                "cannot update {}: it has no primary key",
                mapping.table_name()
            ))
        })?;
        self.update_keyed(&mapping, obj, pk)
    }

    /// Update keyed by the named column instead of the primary key; the
    /// column must be unique.
    pub fn update_by<T: Record>(&self, obj: &T, key_column: &str) -> Result<usize> {
        let mapping = self.mapping::<T>();
        let key = mapping.column_index(key_column).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "{} has no column named {}",
                mapping.table_name(),
                key_column
            ))
        })?;
        if !mapping.columns()[key].is_unique() {
            return Err(Error::UnsupportedOperation(format!(
                "cannot update {} keyed by non-unique column {}",
                mapping.table_name(),
                key_column
            )));
        }
        self.update_keyed(&mapping, obj, key)
    }

    fn update_keyed<T: Record>(
        &self,
        mapping: &TableDescriptor<T>,
        obj: &T,
        key: usize,
    ) -> Result<usize> {
        let column_count = mapping.columns().len();
        let mut set_columns: Vec<usize> = (0..column_count).filter(|&i| i != key).collect();
        if set_columns.is_empty() {
            // Nothing but the key: write all columns keyed by it. A legal
            // no-op kept for compatibility with the original behavior.
            set_columns = (0..column_count).collect();
        }
        let assignments = set_columns
            .iter()
            .map(|&i| format!("{} = ?", quote_identifier(mapping.columns()[i].name())))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ?",
            quote_identifier(mapping.table_name()),
            assignments,
            quote_identifier(mapping.columns()[key].name())
        );
        let mut args: Vec<Value> = Vec::with_capacity(set_columns.len() + 1);
        for &i in &set_columns {
            let column = &mapping.columns()[i];
            args.push(column.value_of(obj, &self.codec_ctx(column.stores_as_text()))?);
        }
        let key_column = &mapping.columns()[key];
        args.push(key_column.value_of(obj, &self.codec_ctx(key_column.stores_as_text()))?);

        let count = {
            let mut stmt = self.prepare_cached(&sql)?;
            stmt.set_constraint_columns(mapping.diagnostic_columns().to_vec());
            stmt.execute(&args)?
        };
        self.emit_table_changed(mapping.table_name(), TableAction::Update, count);
        Ok(count)
    }

    /// Update each element in turn, optionally inside one savepoint.
    pub fn update_all<T: Record>(&self, objs: &[T], run_in_transaction: bool) -> Result<usize> {
        let run = |conn: &Connection| {
            let mut total = 0;
            for obj in objs {
                total += conn.update(obj)?;
            }
            Ok(total)
        };
        if run_in_transaction {
            self.run_in_transaction(run)
        } else {
            run(self)
        }
    }

    /// Delete the row whose primary key matches `obj`.
    pub fn delete<T: Record>(&self, obj: &T) -> Result<usize> {
        let mapping = self.mapping::<T>();
        let pk = mapping.primary_key_index().ok_or_else(|| {
            Error::UnsupportedOperation(format!(
                "cannot delete from {}: it has no primary key",
                mapping.table_name()
            ))
        })?;
        let column = &mapping.columns()[pk];
        let key = column.value_of(obj, &self.codec_ctx(column.stores_as_text()))?;
        self.delete_keyed(&mapping, key)
    }

    /// Delete the row with the given primary key value.
    pub fn delete_by_key<T: Record>(&self, key: impl Into<Value>) -> Result<usize> {
        let mapping = self.mapping::<T>();
        if mapping.primary_key_index().is_none() {
            return Err(Error::UnsupportedOperation(format!(
                "cannot delete from {}: it has no primary key",
                mapping.table_name()
            )));
        }
        self.delete_keyed(&mapping, key.into())
    }

    fn delete_keyed<T: Record>(&self, mapping: &TableDescriptor<T>, key: Value) -> Result<usize> {
        let pk = mapping.primary_key().expect("checked by callers");
        let sql = format!(
            "DELETE FROM {} WHERE {} = ?",
            quote_identifier(mapping.table_name()),
            quote_identifier(pk.name())
        );
        let count = self.execute(&sql, &[key])?;
        self.emit_table_changed(mapping.table_name(), TableAction::Delete, count);
        Ok(count)
    }

    /// Delete every row of `T`'s table.
    pub fn delete_all<T: Record>(&self) -> Result<usize> {
        let mapping = self.mapping::<T>();
        let sql = format!("DELETE FROM {}", quote_identifier(mapping.table_name()));
        let count = self.execute(&sql, &[])?;
        self.emit_table_changed(mapping.table_name(), TableAction::Delete, count);
        Ok(count)
    }

    /// Fetch the row with the given primary key, failing with
    /// [`Error::NotFound`] when absent.
    pub fn get<T: Record>(&self, key: impl Into<Value>) -> Result<T> {
        self.find(key)?.ok_or(Error::NotFound)
    }

    /// Fetch the row with the given primary key, `None` when absent.
    pub fn find<T: Record>(&self, key: impl Into<Value>) -> Result<Option<T>> {
        let mapping = self.mapping::<T>();
        let sql = mapping
            .get_by_pk_sql()
            .ok_or_else(|| {
                Error::UnsupportedOperation(format!(
                    "cannot look up {} by primary key: it has none",
                    mapping.table_name()
                ))
            })?
            .to_owned();
        let mut stmt = self.prepare_cached(&sql)?;
        let mut rows = stmt.query(mapping.clone(), &[key.into()])?;
        match rows.next() {
            Some(row) => row.map(Some),
            None => Ok(None),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("path", &self.db_filename())
            .finish()
    }
}

pub(crate) fn str_to_cstring(s: &str) -> Result<CString> {
    Ok(CString::new(s)?)
}

/// Raw pointer + byte length of a SQL string for `sqlite3_prepare_v2`.
pub(crate) fn str_for_sqlite(s: &[u8]) -> Result<(*const c_char, c_int)> {
    let len = s.len();
    if len > c_int::MAX as usize {
        return Err(Error::InvalidArgument("SQL statement too large".to_owned()));
    }
    Ok((s.as_ptr() as *const c_char, len as c_int))
}

pub(crate) unsafe fn errmsg_to_string(errmsg: *const c_char) -> String {
    std::ffi::CStr::from_ptr(errmsg)
        .to_string_lossy()
        .into_owned()
}

/// Double-quote an identifier, escaping embedded quotes.
pub(crate) fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn duration_to_ms(d: Duration) -> c_int {
    d.as_secs()
        .checked_mul(1000)
        .and_then(|ms| ms.checked_add(u64::from(d.subsec_millis())))
        .and_then(|ms| c_int::try_from(ms).ok())
        .unwrap_or(c_int::MAX)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default, Debug, Clone, PartialEq)]
    struct TestObj {
        id: i64,
        flag: bool,
        text: String,
    }

    impl Record for TestObj {
        fn table() -> TableDescriptor<TestObj> {
            TableDescriptor::builder("TestObj")
                .column(
                    Column::new("Id", |o: &TestObj| o.id, |o, v| o.id = v)
                        .primary_key()
                        .auto_increment(),
                )
                .column(Column::new("Flag", |o: &TestObj| o.flag, |o, v| o.flag = v))
                .column(Column::new(
                    "Text",
                    |o: &TestObj| o.text.clone(),
                    |o, v| o.text = v,
                ))
                .build()
        }
    }

    fn scratch() -> Connection {
        let db = Connection::open_in_memory().unwrap();
        db.create_table::<TestObj>().unwrap();
        db
    }

    #[test]
    fn boolean_round_trip_counts() {
        let db = scratch();
        for i in 0..10 {
            let mut obj = TestObj {
                id: 0,
                flag: i % 3 == 0,
                text: format!("TestObj{}", i),
            };
            db.insert(&mut obj).unwrap();
        }
        assert_eq!(
            db.query_scalar::<i64>("SELECT COUNT(*) FROM \"TestObj\" WHERE \"Flag\" = ?", &params![true])
                .unwrap(),
            Some(4)
        );
        assert_eq!(
            db.query_scalar::<i64>("SELECT COUNT(*) FROM \"TestObj\" WHERE \"Flag\" = ?", &params![false])
                .unwrap(),
            Some(6)
        );
    }

    #[test]
    fn insert_writes_back_rowid() {
        let db = scratch();
        let mut a = TestObj {
            id: 0,
            flag: true,
            text: "a".to_owned(),
        };
        let mut b = a.clone();
        db.insert(&mut a).unwrap();
        db.insert(&mut b).unwrap();
        assert_eq!(a.id, 1);
        assert_eq!(b.id, 2);
    }

    #[test]
    fn get_and_find_by_pk() {
        let db = scratch();
        let mut obj = TestObj {
            id: 0,
            flag: true,
            text: "hello".to_owned(),
        };
        db.insert(&mut obj).unwrap();

        let read: TestObj = db.get(obj.id).unwrap();
        assert_eq!(read, obj);

        assert!(db.find::<TestObj>(9999).unwrap().is_none());
        assert!(matches!(db.get::<TestObj>(9999), Err(Error::NotFound)));
    }

    #[test]
    fn insert_or_replace_keeps_row_count() {
        let db = scratch();
        for i in 0..20 {
            let mut obj = TestObj {
                id: 0,
                flag: false,
                text: format!("#{}", i),
            };
            db.insert(&mut obj).unwrap();
        }
        let mut replacement = TestObj {
            id: 5,
            flag: false,
            text: "Foo".to_owned(),
        };
        db.insert_or_replace(&mut replacement).unwrap();

        assert_eq!(
            db.query_scalar::<i64>("SELECT COUNT(*) FROM \"TestObj\"", &[]).unwrap(),
            Some(20)
        );
        let row: TestObj = db.get(5).unwrap();
        assert_eq!(row.text, "Foo");
    }

    #[test]
    fn update_and_delete() {
        let db = scratch();
        let mut obj = TestObj {
            id: 0,
            flag: false,
            text: "before".to_owned(),
        };
        db.insert(&mut obj).unwrap();

        obj.text = "after".to_owned();
        assert_eq!(db.update(&obj).unwrap(), 1);
        assert_eq!(db.get::<TestObj>(obj.id).unwrap().text, "after");

        assert_eq!(db.delete(&obj).unwrap(), 1);
        assert!(db.find::<TestObj>(obj.id).unwrap().is_none());
    }

    #[test]
    fn delete_all_reports_row_count() {
        let db = scratch();
        for _ in 0..3 {
            let mut obj = TestObj::default();
            db.insert(&mut obj).unwrap();
        }
        assert_eq!(db.delete_all::<TestObj>().unwrap(), 3);
    }

    #[test]
    fn table_changed_events_fire() {
        let db = scratch();
        static EVENTS: AtomicUsize = AtomicUsize::new(0);
        db.on_table_changed(Box::new(|event| {
            assert_eq!(event.table, "TestObj");
            EVENTS.fetch_add(event.rows, Ordering::SeqCst);
        }));
        let mut obj = TestObj::default();
        db.insert(&mut obj).unwrap();
        db.update(&obj).unwrap();
        db.delete(&obj).unwrap();
        assert_eq!(EVENTS.load(Ordering::SeqCst), 3);
    }

    #[derive(Default)]
    struct KeyOnly {
        id: i64,
    }

    impl Record for KeyOnly {
        fn table() -> TableDescriptor<KeyOnly> {
            TableDescriptor::builder("KeyOnly")
                .column(Column::new("Id", |o: &KeyOnly| o.id, |o, v| o.id = v).primary_key())
                .build()
        }
    }

    #[test]
    fn update_with_only_key_columns_is_a_legal_noop() {
        let db = Connection::open_in_memory().unwrap();
        db.create_table::<KeyOnly>().unwrap();
        let mut row = KeyOnly { id: 7 };
        db.insert(&mut row).unwrap();
        assert_eq!(db.update(&row).unwrap(), 1);
        assert_eq!(
            db.query_scalar::<i64>("SELECT COUNT(*) FROM \"KeyOnly\"", &[]).unwrap(),
            Some(1)
        );
    }

    #[test]
    fn update_by_requires_unique_column() {
        let db = scratch();
        let obj = TestObj {
            id: 1,
            flag: false,
            text: "x".to_owned(),
        };
        assert!(matches!(
            db.update_by(&obj, "Text"),
            Err(Error::UnsupportedOperation(_))
        ));
    }

    #[test]
    fn tracer_receives_command_lines() {
        use std::sync::Mutex;
        let lines: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        let mut config = ConnectionConfig::new(":memory:");
        config.trace = true;
        config.tracer = Some(Arc::new(move |line: &str| {
            sink.lock().unwrap().push(line.to_owned());
        }));
        let db = Connection::open_with_config(config).unwrap();
        db.create_table::<TestObj>().unwrap();
        let mut obj = TestObj::default();
        db.insert(&mut obj).unwrap();

        let lines = lines.lock().unwrap();
        assert!(lines.iter().any(|l| l.starts_with("execute: INSERT INTO")));
        // Parameters are listed one per line.
        assert!(lines.iter().any(|l| l.contains("\n  0: ")));
    }

    #[test]
    fn unique_violation_carries_column_and_sql() {
        let db = Connection::open_in_memory().unwrap();
        db.execute_batch(
            "CREATE TABLE \"TestObj\" (\"Id\" integer primary key autoincrement not null, \
             \"Flag\" integer not null, \"Text\" varchar not null)",
        )
        .unwrap();
        db.create_index("TestObj", "UX_TestObj_Text", &["Text"], true)
            .unwrap();
        let mut a = TestObj {
            id: 0,
            flag: false,
            text: "dup".to_owned(),
        };
        let mut b = a.clone();
        db.insert(&mut a).unwrap();
        let err = db.insert(&mut b).unwrap_err();
        match err {
            Error::UniqueViolation(info) => {
                assert_eq!(info.column.as_deref(), Some("Text"));
                assert!(info.sql.as_deref().unwrap_or("").starts_with("INSERT INTO"));
            }
            other => panic!("expected unique violation, got {:?}", other),
        }
    }
}
