use std::error;
use std::fmt;
use std::os::raw::c_int;
use std::str;

use crate::ffi;
use crate::types::FromSqlError;

/// Payload of an engine failure: the primary/extended result code pair, the
/// engine's message, and the SQL text that provoked it (absent for control
/// operations such as `ROLLBACK`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqliteFailure {
    pub error: ffi::Error,
    pub message: Option<String>,
    pub sql: Option<String>,
}

impl SqliteFailure {
    /// Primary result code (the low 8 bits).
    pub fn primary_code(&self) -> c_int {
        self.error.extended_code & 0xff
    }

    /// Full extended result code.
    pub fn extended_code(&self) -> c_int {
        self.error.extended_code
    }
}

impl fmt::Display for SqliteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message {
            Some(ref msg) => write!(f, "{}", msg)?,
            None => write!(f, "{}", self.error)?,
        }
        if let Some(ref sql) = self.sql {
            write!(f, " in: {}", sql)?;
        }
        Ok(())
    }
}

/// A [`SqliteFailure`] raised by a `CHECK`/`UNIQUE`/`NOT NULL`/foreign-key
/// constraint, with the offending column when it can be inferred from the
/// engine's message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstraintFailure {
    pub error: ffi::Error,
    pub message: Option<String>,
    pub sql: Option<String>,
    pub column: Option<String>,
}

impl fmt::Display for ConstraintFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message {
            Some(ref msg) => write!(f, "{}", msg)?,
            None => write!(f, "{}", self.error)?,
        }
        if let Some(ref col) = self.column {
            write!(f, " (column: {})", col)?;
        }
        if let Some(ref sql) = self.sql {
            write!(f, " in: {}", sql)?;
        }
        Ok(())
    }
}

/// Enum listing possible errors from tablite.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// An error from an underlying SQLite call that carries no more specific
    /// classification.
    Sqlite(SqliteFailure),

    /// A `UNIQUE` (or explicit `PRIMARY KEY`) constraint rejected the
    /// statement.
    UniqueViolation(ConstraintFailure),

    /// A `NOT NULL` constraint rejected the statement.
    NotNullViolation(ConstraintFailure),

    /// Any other constraint (check, foreign key, …) rejected the statement.
    ConstraintViolation(ConstraintFailure),

    /// The engine reported `SQLITE_CORRUPT` or `SQLITE_NOTADB`; the database
    /// file is unusable.
    Corrupt(SqliteFailure),

    /// The named write lock could not be acquired within the configured
    /// timeout; `held_by` is the reason string of the current holder.
    WriteLockTimeout { held_by: String },

    /// The retry loop ran out of attempts; wraps the last transient cause.
    RetryExhausted(Box<Error>),

    /// `begin_transaction` was called while a transaction was already open.
    AlreadyInTransaction,

    /// A savepoint name did not parse, or did not match the live savepoint
    /// stack.
    BadSavepoint(String),

    /// The operation is not valid for the mapping (no primary key, non-unique
    /// update key, …).
    UnsupportedOperation(String),

    /// A host value has no SQLite storage-class mapping.
    UnsupportedBinding(&'static str),

    /// `get` found no row for the given primary key.
    NotFound,

    /// The connection (or manager) has been closed.
    Disposed,

    /// A caller-supplied argument was rejected before reaching the engine.
    InvalidArgument(String),

    /// `verify_schema` found a live schema that does not match the
    /// descriptor.
    SchemaMismatch(String),

    /// A column value could not be converted to the requested host type.
    FromSqlConversion {
        column: String,
        source: FromSqlError,
    },

    /// Error converting engine text to UTF-8.
    Utf8Error(str::Utf8Error),

    /// Error converting a string to a C string because it contained an
    /// embedded nul.
    NulError(std::ffi::NulError),
}

impl Error {
    /// `true` for failures the retry loop may recover from: the engine
    /// reported busy/locked, or the write lock timed out.
    pub fn is_transient(&self) -> bool {
        match *self {
            Error::Sqlite(ref f) => matches!(
                f.error.code,
                ffi::ErrorCode::DatabaseBusy | ffi::ErrorCode::DatabaseLocked
            ),
            Error::WriteLockTimeout { .. } => true,
            _ => false,
        }
    }

    /// The SQL text the failing statement was compiled from, when known.
    pub fn sql(&self) -> Option<&str> {
        match *self {
            Error::Sqlite(ref f) | Error::Corrupt(ref f) => f.sql.as_deref(),
            Error::UniqueViolation(ref c)
            | Error::NotNullViolation(ref c)
            | Error::ConstraintViolation(ref c) => c.sql.as_deref(),
            Error::RetryExhausted(ref inner) => inner.sql(),
            _ => None,
        }
    }

    /// The full extended result code, when the error came from the engine.
    pub fn extended_code(&self) -> Option<c_int> {
        match *self {
            Error::Sqlite(ref f) | Error::Corrupt(ref f) => Some(f.error.extended_code),
            Error::UniqueViolation(ref c)
            | Error::NotNullViolation(ref c)
            | Error::ConstraintViolation(ref c) => Some(c.error.extended_code),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Error::Sqlite(ref e) => e.fmt(f),
            Error::UniqueViolation(ref c) => write!(f, "unique constraint violated: {}", c),
            Error::NotNullViolation(ref c) => write!(f, "not-null constraint violated: {}", c),
            Error::ConstraintViolation(ref c) => write!(f, "constraint violated: {}", c),
            Error::Corrupt(ref e) => write!(f, "database is corrupt: {}", e),
            Error::WriteLockTimeout { ref held_by } => write!(
                f,
                "timed out waiting for the database write lock held by: {}",
                held_by
            ),
            Error::RetryExhausted(ref e) => write!(f, "all retries exhausted, last error: {}", e),
            Error::AlreadyInTransaction => write!(f, "a transaction is already open"),
            Error::BadSavepoint(ref name) => write!(f, "invalid savepoint: {}", name),
            Error::UnsupportedOperation(ref msg) => write!(f, "{}", msg),
            Error::UnsupportedBinding(ty) => {
                write!(f, "cannot bind a value of type {} to a parameter", ty)
            }
            Error::NotFound => write!(f, "no row matched the given primary key"),
            Error::Disposed => write!(f, "the connection has been closed"),
            Error::InvalidArgument(ref msg) => write!(f, "{}", msg),
            Error::SchemaMismatch(ref msg) => write!(f, "schema mismatch: {}", msg),
            Error::FromSqlConversion {
                ref column,
                ref source,
            } => write!(f, "cannot read column {}: {}", column, source),
            Error::Utf8Error(ref err) => err.fmt(f),
            Error::NulError(ref err) => err.fmt(f),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            Error::Sqlite(ref f) | Error::Corrupt(ref f) => Some(&f.error),
            Error::UniqueViolation(ref c)
            | Error::NotNullViolation(ref c)
            | Error::ConstraintViolation(ref c) => Some(&c.error),
            Error::RetryExhausted(ref e) => Some(&**e),
            Error::Utf8Error(ref err) => Some(err),
            Error::NulError(ref err) => Some(err),
            _ => None,
        }
    }
}

impl From<str::Utf8Error> for Error {
    fn from(err: str::Utf8Error) -> Error {
        Error::Utf8Error(err)
    }
}

impl From<std::ffi::NulError> for Error {
    fn from(err: std::ffi::NulError) -> Error {
        Error::NulError(err)
    }
}

// These are public within the crate but not re-exported by lib.rs.

/// Classify a non-OK result code into the error taxonomy.
///
/// `columns` are the candidate column names for constraint diagnostics,
/// already filtered of the auto-increment primary key.
pub(crate) fn classify_sqlite_error(
    error: ffi::Error,
    message: Option<String>,
    sql: Option<String>,
    columns: &[String],
) -> Error {
    match error.code {
        ffi::ErrorCode::ConstraintViolation => {
            let column = message
                .as_deref()
                .and_then(|msg| infer_column(msg, columns));
            let info = ConstraintFailure {
                error,
                message,
                sql,
                column,
            };
            match error.extended_code {
                ffi::SQLITE_CONSTRAINT_NOTNULL => Error::NotNullViolation(info),
                ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY => {
                    Error::UniqueViolation(info)
                }
                _ => Error::ConstraintViolation(info),
            }
        }
        ffi::ErrorCode::DatabaseCorrupt | ffi::ErrorCode::NotADatabase => {
            Error::Corrupt(SqliteFailure {
                error,
                message,
                sql,
            })
        }
        _ => Error::Sqlite(SqliteFailure {
            error,
            message,
            sql,
        }),
    }
}

/// Best-effort scan of the engine's message for a mapped column name.
fn infer_column(message: &str, columns: &[String]) -> Option<String> {
    let lowered = message.to_lowercase();
    columns
        .iter()
        .find(|name| lowered.contains(&name.to_lowercase()))
        .cloned()
}

pub(crate) fn error_from_sqlite_code(code: c_int, message: Option<String>) -> Error {
    classify_sqlite_error(ffi::Error::new(code), message, None, &[])
}

/// Read the message (and the true extended code) off the handle and classify.
///
/// # Safety
///
/// `db` must be a valid open database handle or null.
pub(crate) unsafe fn error_from_handle(db: *mut ffi::sqlite3, code: c_int) -> Error {
    error_from_handle_with_sql(db, code, None, &[])
}

/// # Safety
///
/// `db` must be a valid open database handle or null.
pub(crate) unsafe fn error_from_handle_with_sql(
    db: *mut ffi::sqlite3,
    code: c_int,
    sql: Option<&str>,
    columns: &[String],
) -> Error {
    let (code, message) = if db.is_null() {
        (code, None)
    } else {
        // With extended result codes enabled the step/reset code is already
        // extended, but prefer the handle's view when it refines the code.
        let extended = ffi::sqlite3_extended_errcode(db);
        let code = if extended & 0xff == code & 0xff {
            extended
        } else {
            code
        };
        (code, Some(crate::errmsg_to_string(ffi::sqlite3_errmsg(db))))
    };
    classify_sqlite_error(
        ffi::Error::new(code),
        message,
        sql.map(str::to_owned),
        columns,
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn classify_unique_and_primary_key() {
        for code in [ffi::SQLITE_CONSTRAINT_UNIQUE, ffi::SQLITE_CONSTRAINT_PRIMARYKEY] {
            let err = classify_sqlite_error(
                ffi::Error::new(code),
                Some("UNIQUE constraint failed: stock.symbol".to_owned()),
                Some("insert into stock ...".to_owned()),
                &["Symbol".to_owned()],
            );
            match err {
                Error::UniqueViolation(info) => {
                    assert_eq!(info.column.as_deref(), Some("Symbol"));
                    assert!(info.sql.is_some());
                }
                other => panic!("expected unique violation, got {:?}", other),
            }
        }
    }

    #[test]
    fn classify_not_null() {
        let err = classify_sqlite_error(
            ffi::Error::new(ffi::SQLITE_CONSTRAINT_NOTNULL),
            Some("NOT NULL constraint failed: stock.name".to_owned()),
            None,
            &["Name".to_owned()],
        );
        assert!(matches!(err, Error::NotNullViolation(ref c) if c.column.as_deref() == Some("Name")));
    }

    #[test]
    fn classify_other_constraint() {
        let err = classify_sqlite_error(
            ffi::Error::new(ffi::SQLITE_CONSTRAINT_CHECK),
            Some("CHECK constraint failed".to_owned()),
            None,
            &[],
        );
        assert!(matches!(err, Error::ConstraintViolation(_)));
    }

    #[test]
    fn busy_is_transient() {
        let err = error_from_sqlite_code(ffi::SQLITE_BUSY, None);
        assert!(err.is_transient());
        let err = error_from_sqlite_code(ffi::SQLITE_LOCKED, None);
        assert!(err.is_transient());
        let err = error_from_sqlite_code(ffi::SQLITE_CONSTRAINT, None);
        assert!(!err.is_transient());
    }

    #[test]
    fn corrupt_is_classified() {
        assert!(matches!(
            error_from_sqlite_code(ffi::SQLITE_CORRUPT, None),
            Error::Corrupt(_)
        ));
        assert!(matches!(
            error_from_sqlite_code(ffi::SQLITE_NOTADB, None),
            Error::Corrupt(_)
        ));
    }

    #[test]
    fn primary_code_is_low_byte() {
        let failure = SqliteFailure {
            error: ffi::Error::new(ffi::SQLITE_CONSTRAINT_UNIQUE),
            message: None,
            sql: None,
        };
        assert_eq!(failure.primary_code(), ffi::SQLITE_CONSTRAINT);
        assert_eq!(failure.extended_code(), ffi::SQLITE_CONSTRAINT_UNIQUE);
    }
}
