//! GUID columns store as 36-character hyphenated text.

use uuid::Uuid;

use super::{ColumnValue, FromSqlError, FromSqlResult, Type, Value, ValueContext, ValueRef};
use crate::Result;

impl ColumnValue for Uuid {
    fn storage(_: &ValueContext) -> Type {
        Type::Text
    }

    fn decl_type(_: &ValueContext, _: Option<u32>) -> String {
        "varchar(36)".to_owned()
    }

    fn encode(&self, _: &ValueContext) -> Result<Value> {
        Ok(Value::Text(self.to_string()))
    }

    fn decode(value: ValueRef<'_>, _: &ValueContext) -> FromSqlResult<Uuid> {
        value
            .as_str()
            .and_then(|s| Uuid::parse_str(s).map_err(FromSqlError::other))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn text_round_trip_is_36_chars() {
        let ctx = ValueContext::default();
        let id = Uuid::new_v4();
        let v = id.encode(&ctx).unwrap();
        match v {
            Value::Text(ref s) => assert_eq!(s.len(), 36),
            ref other => panic!("expected text storage, got {:?}", other),
        }
        let back = Uuid::decode(ValueRef::from(&v), &ctx).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn garbage_text_fails() {
        let ctx = ValueContext::default();
        assert!(Uuid::decode(ValueRef::Text("not-a-guid"), &ctx).is_err());
    }
}
