//! Temporal codec: wall-clock date-times store as 100 ns ticks or ISO-8601
//! text, UTC-offset date-times and durations always as ticks.

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};

use super::{ColumnValue, FromSqlError, FromSqlResult, Type, Value, ValueContext, ValueRef};
use crate::{Error, Result};

/// Ticks are 100 ns units counted from 0001-01-01T00:00:00; this is the tick
/// count at the Unix epoch.
const UNIX_EPOCH_TICKS: i64 = 621_355_968_000_000_000;
const TICKS_PER_SECOND: i64 = 10_000_000;

/// Text form written when ticks storage is off.
const DATETIME_WRITE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

pub(crate) fn datetime_to_ticks(dt: &NaiveDateTime) -> i64 {
    let utc: DateTime<Utc> = Utc.from_utc_datetime(dt);
    UNIX_EPOCH_TICKS
        + utc.timestamp() * TICKS_PER_SECOND
        + i64::from(utc.timestamp_subsec_nanos()) / 100
}

pub(crate) fn datetime_from_ticks(ticks: i64) -> Option<NaiveDateTime> {
    let from_epoch = ticks.checked_sub(UNIX_EPOCH_TICKS)?;
    let secs = from_epoch.div_euclid(TICKS_PER_SECOND);
    let nanos = (from_epoch.rem_euclid(TICKS_PER_SECOND) * 100) as u32;
    DateTime::<Utc>::from_timestamp(secs, nanos).map(|dt| dt.naive_utc())
}

fn parse_datetime_text(s: &str) -> FromSqlResult<NaiveDateTime> {
    // Accept both the `T` separator this codec writes and the space
    // separator SQLite's datetime() functions produce.
    let fmt = if s.len() >= 11 && s.as_bytes()[10] == b'T' {
        "%Y-%m-%dT%H:%M:%S%.f"
    } else {
        "%Y-%m-%d %H:%M:%S%.f"
    };
    NaiveDateTime::parse_from_str(s, fmt).map_err(FromSqlError::other)
}

/// Wall-clock date-time: ticks or ISO-8601 text per the connection setting.
impl ColumnValue for NaiveDateTime {
    fn storage(ctx: &ValueContext) -> Type {
        if ctx.datetime_as_ticks {
            Type::Integer
        } else {
            Type::Text
        }
    }

    fn decl_type(ctx: &ValueContext, _: Option<u32>) -> String {
        if ctx.datetime_as_ticks {
            "bigint".to_owned()
        } else {
            "datetime".to_owned()
        }
    }

    fn encode(&self, ctx: &ValueContext) -> Result<Value> {
        if ctx.datetime_as_ticks {
            Ok(Value::Integer(datetime_to_ticks(self)))
        } else {
            Ok(Value::Text(self.format(DATETIME_WRITE_FORMAT).to_string()))
        }
    }

    fn decode(value: ValueRef<'_>, _: &ValueContext) -> FromSqlResult<NaiveDateTime> {
        // Decode by storage class rather than by the write-side flag, so a
        // flipped setting does not orphan previously stored rows.
        match value {
            ValueRef::Integer(ticks) => {
                datetime_from_ticks(ticks).ok_or(FromSqlError::OutOfRange(ticks))
            }
            ValueRef::Text(s) => parse_datetime_text(s),
            _ => Err(FromSqlError::InvalidType),
        }
    }
}

/// Date-time with UTC offset: always stored as UTC ticks. A stored tick
/// count outside the representable range reads back as the minimum
/// timestamp (the host default) instead of erroring.
impl ColumnValue for DateTime<Utc> {
    fn storage(_: &ValueContext) -> Type {
        Type::Integer
    }

    fn decl_type(_: &ValueContext, _: Option<u32>) -> String {
        "bigint".to_owned()
    }

    fn encode(&self, _: &ValueContext) -> Result<Value> {
        Ok(Value::Integer(datetime_to_ticks(&self.naive_utc())))
    }

    fn decode(value: ValueRef<'_>, _: &ValueContext) -> FromSqlResult<DateTime<Utc>> {
        let ticks = value.as_i64()?;
        let naive = datetime_from_ticks(ticks)
            .unwrap_or(NaiveDateTime::MIN);
        Ok(Utc.from_utc_datetime(&naive))
    }
}

/// Time spans store as ticks.
impl ColumnValue for Duration {
    fn storage(_: &ValueContext) -> Type {
        Type::Integer
    }

    fn decl_type(_: &ValueContext, _: Option<u32>) -> String {
        "bigint".to_owned()
    }

    fn encode(&self, _: &ValueContext) -> Result<Value> {
        self.num_microseconds()
            .and_then(|us| us.checked_mul(10))
            .map(Value::Integer)
            .ok_or_else(|| Error::InvalidArgument("duration out of range for tick storage".to_owned()))
    }

    fn decode(value: ValueRef<'_>, _: &ValueContext) -> FromSqlResult<Duration> {
        let ticks = value.as_i64()?;
        Ok(Duration::microseconds(ticks / 10)
            + Duration::nanoseconds((ticks % 10) * 100))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::NaiveDate;

    fn sample() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2012, 1, 14)
            .unwrap()
            .and_hms_milli_opt(3, 2, 1, 234)
            .unwrap()
    }

    #[test]
    fn ticks_round_trip_preserves_milliseconds() {
        let dt = sample();
        let ticks = datetime_to_ticks(&dt);
        assert_eq!(datetime_from_ticks(ticks), Some(dt));
    }

    #[test]
    fn unix_epoch_tick_constant() {
        let epoch = NaiveDate::from_ymd_opt(1970, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        assert_eq!(datetime_to_ticks(&epoch), UNIX_EPOCH_TICKS);
    }

    #[test]
    fn text_form_matches_invariant_format() {
        let ctx = ValueContext::default();
        let v = sample().encode(&ctx).unwrap();
        assert_eq!(v, Value::Text("2012-01-14T03:02:01.234".to_owned()));
        let back = NaiveDateTime::decode(ValueRef::Text("2012-01-14T03:02:01.234"), &ctx).unwrap();
        assert_eq!(back, sample());
    }

    #[test]
    fn space_separated_text_also_parses() {
        let ctx = ValueContext::default();
        let back = NaiveDateTime::decode(ValueRef::Text("2012-01-14 03:02:01.234"), &ctx).unwrap();
        assert_eq!(back, sample());
    }

    #[test]
    fn ticks_flag_switches_storage() {
        let ticks_ctx = ValueContext {
            datetime_as_ticks: true,
            ..ValueContext::default()
        };
        assert_eq!(NaiveDateTime::storage(&ticks_ctx), Type::Integer);
        assert_eq!(NaiveDateTime::decl_type(&ticks_ctx, None), "bigint");
        let text_ctx = ValueContext::default();
        assert_eq!(NaiveDateTime::storage(&text_ctx), Type::Text);
        assert_eq!(NaiveDateTime::decl_type(&text_ctx, None), "datetime");
    }

    #[test]
    fn out_of_range_offset_datetime_reads_as_minimum() {
        let ctx = ValueContext::default();
        let read = <DateTime<Utc>>::decode(ValueRef::Integer(i64::MIN), &ctx).unwrap();
        assert_eq!(read.naive_utc(), NaiveDateTime::MIN);
    }

    #[test]
    fn duration_ticks_round_trip() {
        let ctx = ValueContext::default();
        let span = Duration::seconds(90) + Duration::milliseconds(250);
        let v = span.encode(&ctx).unwrap();
        assert_eq!(v, Value::Integer(902_500_000));
        assert_eq!(Duration::decode(ValueRef::Integer(902_500_000), &ctx).unwrap(), span);
    }
}
