use std::convert::TryFrom;

use super::{FromSqlError, FromSqlResult, Type, Value, ValueRef};
use crate::Result;

/// Per-column codec settings resolved from the connection configuration and
/// the column descriptor at bind/read time.
#[derive(Clone, Copy, Debug, Default)]
pub struct ValueContext {
    /// Store wall-clock date-times as 100 ns ticks instead of ISO-8601 text.
    pub datetime_as_ticks: bool,
    /// Store enums as their variant name instead of their integer value.
    pub enum_as_text: bool,
}

/// The bidirectional mapping between a host type and a SQLite storage class.
///
/// A record column's host type decides its storage class and declared SQL
/// type, how values are bound, and how stored values are read back.
/// Implementations exist for the primitive integer and float types, `bool`,
/// `String`, `Vec<u8>`, the chrono temporal types, `uuid::Uuid`, enums via
/// [`impl_enum_column!`](crate::impl_enum_column), and `Option<V>` for any of
/// those (which is what makes a column nullable).
pub trait ColumnValue: Sized {
    /// Whether a column of this host type admits NULL.
    const NULLABLE: bool = false;

    /// The storage class values of this type are bound as.
    fn storage(ctx: &ValueContext) -> Type;

    /// The declared SQL type used in synthesized DDL.
    fn decl_type(ctx: &ValueContext, max_length: Option<u32>) -> String;

    /// Encode a host value for binding.
    fn encode(&self, ctx: &ValueContext) -> Result<Value>;

    /// Decode a stored value back into the host type.
    fn decode(value: ValueRef<'_>, ctx: &ValueContext) -> FromSqlResult<Self>;
}

impl ColumnValue for bool {
    fn storage(_: &ValueContext) -> Type {
        Type::Integer
    }

    fn decl_type(_: &ValueContext, _: Option<u32>) -> String {
        "integer".to_owned()
    }

    fn encode(&self, _: &ValueContext) -> Result<Value> {
        Ok(Value::Integer(*self as i64))
    }

    fn decode(value: ValueRef<'_>, _: &ValueContext) -> FromSqlResult<bool> {
        value.as_i64().map(|i| i != 0)
    }
}

macro_rules! narrow_int_impl(
    ($t:ty) => (
        impl ColumnValue for $t {
            fn storage(_: &ValueContext) -> Type {
                Type::Integer
            }

            fn decl_type(_: &ValueContext, _: Option<u32>) -> String {
                "integer".to_owned()
            }

            fn encode(&self, _: &ValueContext) -> Result<Value> {
                Ok(Value::Integer(i64::from(*self)))
            }

            fn decode(value: ValueRef<'_>, _: &ValueContext) -> FromSqlResult<$t> {
                let i = value.as_i64()?;
                <$t>::try_from(i).map_err(|_| FromSqlError::OutOfRange(i))
            }
        }
    )
);

narrow_int_impl!(i8);
narrow_int_impl!(i16);
narrow_int_impl!(i32);
narrow_int_impl!(u8);
narrow_int_impl!(u16);

impl ColumnValue for i64 {
    fn storage(_: &ValueContext) -> Type {
        Type::Integer
    }

    fn decl_type(_: &ValueContext, _: Option<u32>) -> String {
        "bigint".to_owned()
    }

    fn encode(&self, _: &ValueContext) -> Result<Value> {
        Ok(Value::Integer(*self))
    }

    fn decode(value: ValueRef<'_>, _: &ValueContext) -> FromSqlResult<i64> {
        value.as_i64()
    }
}

/// 32-bit unsigned values widen to 64-bit integer storage.
impl ColumnValue for u32 {
    fn storage(_: &ValueContext) -> Type {
        Type::Integer
    }

    fn decl_type(_: &ValueContext, _: Option<u32>) -> String {
        "bigint".to_owned()
    }

    fn encode(&self, _: &ValueContext) -> Result<Value> {
        Ok(Value::Integer(i64::from(*self)))
    }

    fn decode(value: ValueRef<'_>, _: &ValueContext) -> FromSqlResult<u32> {
        let i = value.as_i64()?;
        u32::try_from(i).map_err(|_| FromSqlError::OutOfRange(i))
    }
}

impl ColumnValue for f64 {
    fn storage(_: &ValueContext) -> Type {
        Type::Real
    }

    fn decl_type(_: &ValueContext, _: Option<u32>) -> String {
        "float".to_owned()
    }

    fn encode(&self, _: &ValueContext) -> Result<Value> {
        Ok(Value::Real(*self))
    }

    fn decode(value: ValueRef<'_>, _: &ValueContext) -> FromSqlResult<f64> {
        value.as_f64()
    }
}

impl ColumnValue for f32 {
    fn storage(_: &ValueContext) -> Type {
        Type::Real
    }

    fn decl_type(_: &ValueContext, _: Option<u32>) -> String {
        "float".to_owned()
    }

    fn encode(&self, _: &ValueContext) -> Result<Value> {
        Ok(Value::Real(f64::from(*self)))
    }

    fn decode(value: ValueRef<'_>, _: &ValueContext) -> FromSqlResult<f32> {
        value.as_f64().map(|f| f as f32)
    }
}

impl ColumnValue for String {
    fn storage(_: &ValueContext) -> Type {
        Type::Text
    }

    fn decl_type(_: &ValueContext, max_length: Option<u32>) -> String {
        match max_length {
            Some(n) => format!("varchar({})", n),
            None => "varchar".to_owned(),
        }
    }

    fn encode(&self, _: &ValueContext) -> Result<Value> {
        Ok(Value::Text(self.clone()))
    }

    fn decode(value: ValueRef<'_>, _: &ValueContext) -> FromSqlResult<String> {
        value.as_str().map(str::to_owned)
    }
}

impl ColumnValue for Vec<u8> {
    fn storage(_: &ValueContext) -> Type {
        Type::Blob
    }

    fn decl_type(_: &ValueContext, _: Option<u32>) -> String {
        "blob".to_owned()
    }

    fn encode(&self, _: &ValueContext) -> Result<Value> {
        Ok(Value::Blob(self.clone()))
    }

    fn decode(value: ValueRef<'_>, _: &ValueContext) -> FromSqlResult<Vec<u8>> {
        value.as_blob().map(<[u8]>::to_vec)
    }
}

impl<V: ColumnValue> ColumnValue for Option<V> {
    const NULLABLE: bool = true;

    fn storage(ctx: &ValueContext) -> Type {
        V::storage(ctx)
    }

    fn decl_type(ctx: &ValueContext, max_length: Option<u32>) -> String {
        V::decl_type(ctx, max_length)
    }

    fn encode(&self, ctx: &ValueContext) -> Result<Value> {
        match *self {
            Some(ref v) => v.encode(ctx),
            None => Ok(Value::Null),
        }
    }

    fn decode(value: ValueRef<'_>, ctx: &ValueContext) -> FromSqlResult<Option<V>> {
        match value {
            ValueRef::Null => Ok(None),
            other => V::decode(other, ctx).map(Some),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn narrow_integers_check_range() {
        let ctx = ValueContext::default();
        assert_eq!(i8::decode(ValueRef::Integer(-128), &ctx).unwrap(), -128);
        assert!(matches!(
            u8::decode(ValueRef::Integer(1000), &ctx),
            Err(FromSqlError::OutOfRange(1000))
        ));
    }

    #[test]
    fn real_reads_accept_integers() {
        let ctx = ValueContext::default();
        assert_eq!(f64::decode(ValueRef::Integer(3), &ctx).unwrap(), 3.0);
        assert!(matches!(
            i64::decode(ValueRef::Real(3.0), &ctx),
            Err(FromSqlError::InvalidType)
        ));
    }

    #[test]
    fn option_marks_nullable() {
        assert!(!String::NULLABLE);
        assert!(<Option<String>>::NULLABLE);
        let ctx = ValueContext::default();
        assert_eq!(
            <Option<i64>>::decode(ValueRef::Null, &ctx).unwrap(),
            None
        );
    }

    #[test]
    fn varchar_decl_uses_max_length() {
        let ctx = ValueContext::default();
        assert_eq!(String::decl_type(&ctx, Some(140)), "varchar(140)");
        assert_eq!(String::decl_type(&ctx, None), "varchar");
    }
}
