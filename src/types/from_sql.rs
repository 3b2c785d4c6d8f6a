use std::error;
use std::fmt;

/// Enum listing possible errors from converting a stored value to a host
/// type.
#[derive(Debug)]
#[non_exhaustive]
pub enum FromSqlError {
    /// Error when the storage class of the value is not compatible with the
    /// requested host type.
    InvalidType,

    /// Error when the value is an integer that is out of range for the
    /// requested host type.
    OutOfRange(i64),

    /// An error case available for implementors of the codec for host types
    /// with their own parse failures (dates, GUIDs, enum names, …).
    Other(Box<dyn error::Error + Send + Sync + 'static>),
}

impl FromSqlError {
    pub(crate) fn other<E: error::Error + Send + Sync + 'static>(err: E) -> FromSqlError {
        FromSqlError::Other(Box::new(err))
    }
}

impl fmt::Display for FromSqlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            FromSqlError::InvalidType => write!(f, "invalid storage class for the requested type"),
            FromSqlError::OutOfRange(i) => write!(f, "value {} out of range", i),
            FromSqlError::Other(ref err) => err.fmt(f),
        }
    }
}

impl error::Error for FromSqlError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        if let FromSqlError::Other(ref err) = self {
            Some(&**err)
        } else {
            None
        }
    }
}

/// Result type for the column-read half of the codec.
pub type FromSqlResult<T> = Result<T, FromSqlError>;
