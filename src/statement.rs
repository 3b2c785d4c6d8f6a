//! Prepared statements: bind, step, materialize, classify.

use std::fmt;
use std::mem;
use std::os::raw::{c_char, c_int, c_void};
use std::ptr;
use std::str;
use std::sync::Arc;
use std::time::{Duration, Instant};

use fallible_iterator::FallibleIterator;
use fallible_streaming_iterator::FallibleStreamingIterator;

use crate::error::error_from_handle_with_sql;
use crate::ffi;
use crate::mapping::{Record, TableDescriptor};
use crate::raw_statement::RawStatement;
use crate::types::{ColumnValue, Value, ValueContext, ValueRef};
use crate::{str_to_cstring, Connection, Error, Result};

/// Lifecycle hook passed the phases of a command execution.
#[derive(Debug)]
pub enum CommandEvent<'a> {
    Started { sql: &'a str },
    Ended { sql: &'a str, elapsed: Duration },
    RowMaterialized { table: &'a str },
}

/// Observer of command lifecycle events; set per connection.
pub trait CommandObserver: Send + Sync {
    fn on_event(&self, event: CommandEvent<'_>);
}

/// A prepared statement.
pub struct Statement<'conn> {
    conn: &'conn Connection,
    stmt: RawStatement,
    // Candidate column names for constraint diagnostics, set by the record
    // verbs before execution.
    constraint_columns: Vec<String>,
}

impl<'conn> Statement<'conn> {
    pub(crate) fn new(conn: &'conn Connection, stmt: RawStatement) -> Statement<'conn> {
        Statement {
            conn,
            stmt,
            constraint_columns: Vec::new(),
        }
    }

    pub(crate) fn raw_mut(&mut self) -> &mut RawStatement {
        &mut self.stmt
    }

    pub(crate) fn set_constraint_columns(&mut self, columns: Vec<String>) {
        self.constraint_columns = columns;
    }

    /// The SQL text this statement was compiled from.
    pub fn sql(&self) -> String {
        self.stmt
            .sql()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Return the number of columns in the result set returned by the
    /// prepared statement.
    pub fn column_count(&self) -> usize {
        self.stmt.column_count()
    }

    /// Name of the result column at `idx`.
    pub fn column_name(&self, idx: usize) -> Result<&str> {
        match self.stmt.column_name(idx) {
            Some(name) => Ok(str::from_utf8(name.to_bytes())?),
            None => Err(Error::InvalidArgument(format!(
                "invalid column index: {}",
                idx
            ))),
        }
    }

    /// Execute once, accepting row-producing statements as success, and
    /// return the number of rows changed.
    pub fn execute(&mut self, params: &[Value]) -> Result<usize> {
        if self.stmt.is_null() {
            return Ok(0);
        }
        let started = self.on_started("execute", params);
        let result = self.execute_inner(params);
        self.on_ended(started);
        result
    }

    fn execute_inner(&mut self, params: &[Value]) -> Result<usize> {
        self.stmt.reset();
        self.bind(params)?;
        let rc = self.stmt.step();
        self.stmt.reset();
        match rc {
            ffi::SQLITE_DONE | ffi::SQLITE_ROW | ffi::SQLITE_OK => Ok(self.conn.changes()),
            code => Err(self.step_error(code)),
        }
    }

    /// Execute once and read the first column of the first row; `None` when
    /// the statement produces no row.
    pub fn query_scalar<V: ColumnValue>(&mut self, params: &[Value]) -> Result<Option<V>> {
        if self.stmt.is_null() {
            return Ok(None);
        }
        let started = self.on_started("scalar", params);
        let result = self.query_scalar_inner(params);
        self.on_ended(started);
        result
    }

    fn query_scalar_inner<V: ColumnValue>(&mut self, params: &[Value]) -> Result<Option<V>> {
        self.stmt.reset();
        self.bind(params)?;
        let rc = self.stmt.step();
        let out = match rc {
            ffi::SQLITE_ROW => {
                let ctx = ValueContext {
                    datetime_as_ticks: self.conn.store_datetime_as_ticks(),
                    enum_as_text: false,
                };
                V::decode(self.value_ref(0), &ctx)
                    .map(Some)
                    .map_err(|source| Error::FromSqlConversion {
                        column: "0".to_owned(),
                        source,
                    })
            }
            ffi::SQLITE_DONE | ffi::SQLITE_OK => Ok(None),
            code => Err(self.step_error(code)),
        };
        self.stmt.reset();
        out
    }

    /// Execute and lazily materialize each produced row into a `T`.
    ///
    /// Result columns are matched to descriptor columns by name; unknown
    /// columns are skipped. The compiled statement is not re-entrant: drain
    /// or drop the returned iterator before using the statement again.
    pub fn query<T: Record>(
        &mut self,
        mapping: Arc<TableDescriptor<T>>,
        params: &[Value],
    ) -> Result<MappedRows<'_, T>> {
        let started = self.on_started("query", params);
        if self.stmt.is_null() {
            return Ok(MappedRows {
                stmt: &*self,
                mapping,
                columns: Vec::new(),
                done: true,
                started,
            });
        }
        self.stmt.reset();
        self.bind(params)?;
        let count = self.stmt.column_count();
        let mut columns = Vec::with_capacity(count);
        for i in 0..count {
            let name = self.column_name(i)?;
            columns.push(mapping.column_index(name));
        }
        Ok(MappedRows {
            stmt: &*self,
            mapping,
            columns,
            done: false,
            started,
        })
    }

    /// Execute and iterate raw rows.
    pub fn query_raw(&mut self, params: &[Value]) -> Result<Rows<'_>> {
        let started = self.on_started("query", params);
        if !self.stmt.is_null() {
            self.stmt.reset();
            self.bind(params)?;
        }
        Ok(Rows {
            stmt: &*self,
            row: None,
            done: self.stmt.is_null(),
            started,
        })
    }

    /// Consumes the statement.
    ///
    /// Functionally equivalent to the `Drop` implementation, but allows
    /// callers to see any errors that occur.
    pub fn finalize(mut self) -> Result<()> {
        self.finalize_()
    }

    fn bind(&mut self, params: &[Value]) -> Result<()> {
        let expected = self.stmt.bind_parameter_count();
        if params.len() != expected {
            return Err(Error::InvalidArgument(format!(
                "wrong number of parameters: expected {}, got {}",
                expected,
                params.len()
            )));
        }
        for (i, p) in params.iter().enumerate() {
            // The leftmost SQL parameter has an index of 1.
            self.bind_value(i + 1, p)?;
        }
        Ok(())
    }

    pub(crate) fn bind_value(&self, col: usize, value: &Value) -> Result<()> {
        let ptr = unsafe { self.stmt.ptr() };
        let rc = match *value {
            Value::Null => unsafe { ffi::sqlite3_bind_null(ptr, col as c_int) },
            Value::Integer(i) => unsafe { ffi::sqlite3_bind_int64(ptr, col as c_int, i) },
            Value::Real(r) => unsafe { ffi::sqlite3_bind_double(ptr, col as c_int, r) },
            Value::Text(ref s) => unsafe {
                let length = s.len();
                if length > c_int::MAX as usize {
                    ffi::SQLITE_TOOBIG
                } else {
                    let c_str = str_to_cstring(s)?;
                    ffi::sqlite3_bind_text(
                        ptr,
                        col as c_int,
                        c_str.as_ptr(),
                        length as c_int,
                        ffi::SQLITE_TRANSIENT(),
                    )
                }
            },
            Value::Blob(ref b) => unsafe {
                let length = b.len();
                if length > c_int::MAX as usize {
                    ffi::SQLITE_TOOBIG
                } else if length == 0 {
                    ffi::sqlite3_bind_zeroblob(ptr, col as c_int, 0)
                } else {
                    ffi::sqlite3_bind_blob(
                        ptr,
                        col as c_int,
                        b.as_ptr() as *const c_void,
                        length as c_int,
                        ffi::SQLITE_TRANSIENT(),
                    )
                }
            },
        };
        self.conn.decode_result(rc)
    }

    pub(crate) fn value_ref(&self, col: usize) -> ValueRef<'_> {
        let raw = unsafe { self.stmt.ptr() };
        match self.stmt.column_type(col) {
            ffi::SQLITE_NULL => ValueRef::Null,
            ffi::SQLITE_INTEGER => {
                ValueRef::Integer(unsafe { ffi::sqlite3_column_int64(raw, col as c_int) })
            }
            ffi::SQLITE_FLOAT => {
                ValueRef::Real(unsafe { ffi::sqlite3_column_double(raw, col as c_int) })
            }
            ffi::SQLITE_TEXT => {
                let s = unsafe {
                    let text = ffi::sqlite3_column_text(raw, col as c_int);
                    assert!(
                        !text.is_null(),
                        "unexpected SQLITE_TEXT column type with NULL data"
                    );
                    std::ffi::CStr::from_ptr(text as *const c_char)
                };
                let s = s
                    .to_str()
                    .expect("sqlite3_column_text returned invalid UTF-8");
                ValueRef::Text(s)
            }
            ffi::SQLITE_BLOB => {
                let (blob, len) = unsafe {
                    (
                        ffi::sqlite3_column_blob(raw, col as c_int),
                        ffi::sqlite3_column_bytes(raw, col as c_int),
                    )
                };
                assert!(
                    len >= 0,
                    "unexpected negative return from sqlite3_column_bytes"
                );
                if len > 0 {
                    assert!(
                        !blob.is_null(),
                        "unexpected SQLITE_BLOB column type with NULL data"
                    );
                    ValueRef::Blob(unsafe {
                        std::slice::from_raw_parts(blob as *const u8, len as usize)
                    })
                } else {
                    ValueRef::Blob(&[])
                }
            }
            _ => unreachable!("sqlite3_column_type returned invalid value"),
        }
    }

    pub(crate) fn step_error(&self, code: c_int) -> Error {
        let sql = self.sql();
        unsafe {
            error_from_handle_with_sql(
                self.conn.handle(),
                code,
                Some(&sql),
                &self.constraint_columns,
            )
        }
    }

    fn on_started(&self, verb: &str, params: &[Value]) -> Instant {
        let observer = self.conn.command_observer();
        if self.conn.trace_enabled() || observer.is_some() {
            let sql = self.sql();
            self.conn.trace_sql(verb, &sql, params);
            if let Some(observer) = observer {
                observer.on_event(CommandEvent::Started { sql: &sql });
            }
        }
        Instant::now()
    }

    fn on_ended(&self, started: Instant) {
        let elapsed = started.elapsed();
        let observer = self.conn.command_observer();
        if self.conn.trace_time_enabled() || observer.is_some() {
            let sql = self.sql();
            self.conn.trace_elapsed(&sql, elapsed);
            if let Some(observer) = observer {
                observer.on_event(CommandEvent::Ended {
                    sql: &sql,
                    elapsed,
                });
            }
        }
    }

    fn finalize_(&mut self) -> Result<()> {
        let mut stmt = unsafe { RawStatement::new(ptr::null_mut()) };
        mem::swap(&mut stmt, &mut self.stmt);
        self.conn.decode_result(stmt.finalize())
    }
}

#[allow(clippy::from_over_into)]
impl Into<RawStatement> for Statement<'_> {
    fn into(mut self) -> RawStatement {
        let mut stmt = unsafe { RawStatement::new(ptr::null_mut()) };
        mem::swap(&mut stmt, &mut self.stmt);
        stmt
    }
}

impl fmt::Debug for Statement<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Statement").field("sql", &self.sql()).finish()
    }
}

impl Drop for Statement<'_> {
    #[allow(unused_must_use)]
    fn drop(&mut self) {
        self.finalize_();
    }
}

/// Lazy, single-pass sequence of materialized records. Owns the statement's
/// cursor: drain or drop it before reusing the connection. The statement is
/// reset when the iterator is dropped.
pub struct MappedRows<'stmt, T: Record> {
    stmt: &'stmt Statement<'stmt>,
    mapping: Arc<TableDescriptor<T>>,
    // Result column index -> descriptor column index; None for columns the
    // mapping does not know.
    columns: Vec<Option<usize>>,
    done: bool,
    started: Instant,
}

impl<T: Record> MappedRows<'_, T> {
    fn materialize(&self) -> Result<T> {
        let mut obj = T::default();
        let ticks = self.stmt.conn.store_datetime_as_ticks();
        for (i, slot) in self.columns.iter().enumerate() {
            if let Some(ci) = *slot {
                let column = &self.mapping.columns()[ci];
                let ctx = ValueContext {
                    datetime_as_ticks: ticks,
                    enum_as_text: column.stores_as_text(),
                };
                column.assign(&mut obj, self.stmt.value_ref(i), &ctx)?;
            }
        }
        if let Some(observer) = self.stmt.conn.command_observer() {
            observer.on_event(CommandEvent::RowMaterialized {
                table: self.mapping.table_name(),
            });
        }
        Ok(obj)
    }
}

impl<T: Record> Iterator for MappedRows<'_, T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Result<T>> {
        if self.done {
            return None;
        }
        match self.stmt.stmt.step() {
            ffi::SQLITE_ROW => Some(self.materialize()),
            ffi::SQLITE_DONE => {
                self.done = true;
                None
            }
            code => {
                self.done = true;
                Some(Err(self.stmt.step_error(code)))
            }
        }
    }
}

impl<T: Record> FallibleIterator for MappedRows<'_, T> {
    type Item = T;
    type Error = Error;

    fn next(&mut self) -> Result<Option<T>> {
        <Self as Iterator>::next(self).transpose()
    }
}

impl<T: Record> Drop for MappedRows<'_, T> {
    fn drop(&mut self) {
        self.stmt.stmt.reset();
        self.stmt.on_ended(self.started);
    }
}

/// Raw row cursor over a statement's result set.
pub struct Rows<'stmt> {
    stmt: &'stmt Statement<'stmt>,
    row: Option<Row<'stmt>>,
    done: bool,
    started: Instant,
}

impl Drop for Rows<'_> {
    fn drop(&mut self) {
        self.stmt.stmt.reset();
        self.stmt.on_ended(self.started);
    }
}

impl<'stmt> FallibleStreamingIterator for Rows<'stmt> {
    type Item = Row<'stmt>;
    type Error = Error;

    fn advance(&mut self) -> Result<()> {
        if self.done {
            self.row = None;
            return Ok(());
        }
        match self.stmt.stmt.step() {
            ffi::SQLITE_ROW => {
                self.row = Some(Row { stmt: self.stmt });
                Ok(())
            }
            ffi::SQLITE_DONE => {
                self.done = true;
                self.row = None;
                Ok(())
            }
            code => {
                self.done = true;
                self.row = None;
                Err(self.stmt.step_error(code))
            }
        }
    }

    fn get(&self) -> Option<&Row<'stmt>> {
        self.row.as_ref()
    }
}

/// A single result row of a query.
pub struct Row<'stmt> {
    stmt: &'stmt Statement<'stmt>,
}

impl Row<'_> {
    /// Read the column at `idx` as a `V`.
    pub fn get<V: ColumnValue>(&self, idx: usize) -> Result<V> {
        let ctx = ValueContext {
            datetime_as_ticks: self.stmt.conn.store_datetime_as_ticks(),
            enum_as_text: false,
        };
        V::decode(self.stmt.value_ref(idx), &ctx).map_err(|source| Error::FromSqlConversion {
            column: idx.to_string(),
            source,
        })
    }

    /// Read the column at `idx` as an owned dynamic value.
    pub fn value(&self, idx: usize) -> Value {
        Value::from(self.stmt.value_ref(idx))
    }

    pub fn column_count(&self) -> usize {
        self.stmt.column_count()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Connection;

    #[test]
    fn execute_accepts_row_results() {
        let db = Connection::open_in_memory().unwrap();
        db.execute_batch("CREATE TABLE t (x INTEGER)").unwrap();
        db.execute("INSERT INTO t (x) VALUES (?)", &[Value::Integer(1)])
            .unwrap();
        // A SELECT stepped through execute is not an error.
        let mut stmt = db.prepare("SELECT x FROM t").unwrap();
        stmt.execute(&[]).unwrap();
    }

    #[test]
    fn scalar_returns_none_on_empty() {
        let db = Connection::open_in_memory().unwrap();
        db.execute_batch("CREATE TABLE t (x INTEGER)").unwrap();
        let mut stmt = db.prepare("SELECT x FROM t").unwrap();
        assert_eq!(stmt.query_scalar::<i64>(&[]).unwrap(), None);
        db.execute("INSERT INTO t (x) VALUES (?)", &[Value::Integer(7)])
            .unwrap();
        assert_eq!(stmt.query_scalar::<i64>(&[]).unwrap(), Some(7));
    }

    #[test]
    fn parameter_count_is_checked() {
        let db = Connection::open_in_memory().unwrap();
        db.execute_batch("CREATE TABLE t (x INTEGER)").unwrap();
        let mut stmt = db.prepare("INSERT INTO t (x) VALUES (?)").unwrap();
        assert!(matches!(
            stmt.execute(&[]),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn statement_is_reusable_after_reset() {
        let db = Connection::open_in_memory().unwrap();
        db.execute_batch("CREATE TABLE t (x INTEGER)").unwrap();
        let mut stmt = db.prepare("INSERT INTO t (x) VALUES (?)").unwrap();
        for i in 0..3 {
            assert_eq!(stmt.execute(&[Value::Integer(i)]).unwrap(), 1);
        }
        assert_eq!(
            db.query_scalar::<i64>("SELECT COUNT(*) FROM t", &[]).unwrap(),
            Some(3)
        );
    }

    #[test]
    fn raw_rows_stream() {
        let db = Connection::open_in_memory().unwrap();
        db.execute_batch(
            "CREATE TABLE t (x INTEGER, y TEXT);
             INSERT INTO t VALUES (1, 'one');
             INSERT INTO t VALUES (2, 'two');",
        )
        .unwrap();
        let mut stmt = db.prepare("SELECT x, y FROM t ORDER BY x").unwrap();
        let mut rows = stmt.query_raw(&[]).unwrap();
        let mut seen = Vec::new();
        while let Some(row) = rows.next().unwrap() {
            seen.push((row.get::<i64>(0).unwrap(), row.get::<String>(1).unwrap()));
        }
        assert_eq!(seen, vec![(1, "one".to_owned()), (2, "two".to_owned())]);
    }

    #[test]
    fn empty_statement_is_inert() {
        let db = Connection::open_in_memory().unwrap();
        let mut stmt = db.prepare("").unwrap();
        assert_eq!(stmt.execute(&[]).unwrap(), 0);
        assert_eq!(stmt.query_scalar::<i64>(&[]).unwrap(), None);
    }
}
