//! Enum columns store as their integer value, or as the variant name when
//! the column carries the store-as-text flag.

/// Round-trip table for an enum host type: integer value and variant name in
/// both directions. Implemented by [`impl_enum_column!`](crate::impl_enum_column),
/// which also wires the type into the codec.
pub trait EnumColumn: Sized {
    fn to_i64(&self) -> i64;
    fn from_i64(value: i64) -> Option<Self>;
    fn name(&self) -> &'static str;
    fn from_name(name: &str) -> Option<Self>;
}

/// Implement [`EnumColumn`](crate::types::EnumColumn) and the column codec
/// for a fieldless enum.
///
/// ```
/// #[derive(Clone, Copy, Debug, Default, PartialEq)]
/// enum OrderState {
///     #[default]
///     Pending,
///     Shipped,
/// }
///
/// tablite::impl_enum_column!(OrderState { Pending = 0, Shipped = 1 });
/// ```
///
/// Columns of this type store the integer value by default and the variant
/// name when declared with `.store_as_text()`. Reads accept either form.
#[macro_export]
macro_rules! impl_enum_column {
    ($ty:ident { $($variant:ident = $value:literal),+ $(,)? }) => {
        impl $crate::types::EnumColumn for $ty {
            fn to_i64(&self) -> i64 {
                match *self {
                    $($ty::$variant => $value,)+
                }
            }

            fn from_i64(value: i64) -> Option<Self> {
                match value {
                    $(v if v == $value => Some($ty::$variant),)+
                    _ => None,
                }
            }

            fn name(&self) -> &'static str {
                match *self {
                    $($ty::$variant => stringify!($variant),)+
                }
            }

            fn from_name(name: &str) -> Option<Self> {
                match name {
                    $(n if n == stringify!($variant) => Some($ty::$variant),)+
                    _ => None,
                }
            }
        }

        impl $crate::types::ColumnValue for $ty {
            fn storage(ctx: &$crate::types::ValueContext) -> $crate::types::Type {
                if ctx.enum_as_text {
                    $crate::types::Type::Text
                } else {
                    $crate::types::Type::Integer
                }
            }

            fn decl_type(ctx: &$crate::types::ValueContext, _: Option<u32>) -> String {
                if ctx.enum_as_text {
                    "varchar".to_owned()
                } else {
                    "integer".to_owned()
                }
            }

            fn encode(
                &self,
                ctx: &$crate::types::ValueContext,
            ) -> $crate::Result<$crate::types::Value> {
                if ctx.enum_as_text {
                    Ok($crate::types::Value::Text(
                        $crate::types::EnumColumn::name(self).to_owned(),
                    ))
                } else {
                    Ok($crate::types::Value::Integer(
                        $crate::types::EnumColumn::to_i64(self),
                    ))
                }
            }

            fn decode(
                value: $crate::types::ValueRef<'_>,
                _: &$crate::types::ValueContext,
            ) -> $crate::types::FromSqlResult<Self> {
                match value {
                    $crate::types::ValueRef::Integer(i) => {
                        <$ty as $crate::types::EnumColumn>::from_i64(i)
                            .ok_or($crate::types::FromSqlError::OutOfRange(i))
                    }
                    $crate::types::ValueRef::Text(s) => {
                        <$ty as $crate::types::EnumColumn>::from_name(s)
                            .ok_or($crate::types::FromSqlError::InvalidType)
                    }
                    _ => Err($crate::types::FromSqlError::InvalidType),
                }
            }
        }
    };
}
