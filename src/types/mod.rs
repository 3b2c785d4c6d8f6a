//! SQLite storage classes and the host-value codec.
//!
//! SQLite uses a [dynamic type system](https://www.sqlite.org/datatype3.html):
//! every stored value is one of NULL, INTEGER, REAL, TEXT or BLOB. [`Value`]
//! and [`ValueRef`] model that directly. [`ColumnValue`] is the bidirectional
//! mapping between host types and storage classes used by record columns:
//! integers and booleans store as INTEGER, floats as REAL, strings as TEXT,
//! byte vectors as BLOB, date-times as 100 ns ticks or ISO-8601 text
//! (selected by [`ValueContext::datetime_as_ticks`]), GUIDs as 36-character
//! text, and enums as their integer value or variant name (selected per
//! column by the store-as-text flag).
//!
//! Reading is the symmetric inverse of writing. Integer reads widen, a REAL
//! read into an integer type fails, and NULL reads succeed only for
//! `Option<_>` columns.

pub use self::column_value::{ColumnValue, ValueContext};
pub use self::enums::EnumColumn;
pub use self::from_sql::{FromSqlError, FromSqlResult};
pub use self::value::Value;
pub use self::value_ref::ValueRef;

use std::fmt;

mod chrono;
mod column_value;
mod enums;
mod from_sql;
mod uuid;
mod value;
mod value_ref;

/// Empty struct that can be used to bind a parameter as `NULL`.
#[derive(Copy, Clone)]
pub struct Null;

/// SQLite fundamental datatypes.
/// See [Fundamental Datatypes](https://sqlite.org/c3ref/c_blob.html).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Type {
    /// NULL
    Null,
    /// 64-bit signed integer
    Integer,
    /// 64-bit IEEE floating point number
    Real,
    /// String
    Text,
    /// BLOB
    Blob,
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Type::Null => f.pad("Null"),
            Type::Integer => f.pad("Integer"),
            Type::Real => f.pad("Real"),
            Type::Text => f.pad("Text"),
            Type::Blob => f.pad("Blob"),
        }
    }
}
