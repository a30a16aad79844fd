use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use time::format_description::BorrowedFormatItem;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, OffsetDateTime, PrimitiveDateTime, Time};

use crate::{TheoriaError, TheoriaResult, Value};

const DATETIME_FRACTION: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second].[subsecond]");
const DATETIME_SPACE: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
const DATETIME_T: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");
const DATE_ONLY: &[BorrowedFormatItem<'static>] = format_description!("[year]-[month]-[day]");

/// Object cast: turns a stored value into an application value.
pub trait CastsAttribute: Send + Sync {
    fn get(
        &self,
        key: &str,
        value: &Value,
        attributes: &IndexMap<String, Value>,
    ) -> TheoriaResult<Value>;
}

#[derive(Clone)]
pub enum Cast {
    Integer,
    Float,
    Decimal(u32),
    Boolean,
    String,
    Json,
    Date,
    DateTime,
    Timestamp,
    Custom(Arc<dyn CastsAttribute>),
}

impl fmt::Debug for Cast {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cast::Integer => f.write_str("Integer"),
            Cast::Float => f.write_str("Float"),
            Cast::Decimal(scale) => write!(f, "Decimal({scale})"),
            Cast::Boolean => f.write_str("Boolean"),
            Cast::String => f.write_str("String"),
            Cast::Json => f.write_str("Json"),
            Cast::Date => f.write_str("Date"),
            Cast::DateTime => f.write_str("DateTime"),
            Cast::Timestamp => f.write_str("Timestamp"),
            Cast::Custom(_) => f.write_str("Custom"),
        }
    }
}

impl Cast {
    /// Parses the host cast names (`int`, `decimal:2`, `datetime`, `array`, ...).
    pub fn parse(spec: &str) -> TheoriaResult<Self> {
        let spec = spec.trim().to_ascii_lowercase();
        if let Some(scale) = spec.strip_prefix("decimal:") {
            let scale = scale
                .parse()
                .map_err(|_| TheoriaError::invalid(format!("invalid decimal scale '{scale}'")))?;
            return Ok(Cast::Decimal(scale));
        }
        let base = spec.split(':').next().unwrap_or_default();
        Ok(match base {
            "int" | "integer" => Cast::Integer,
            "real" | "float" | "double" => Cast::Float,
            "bool" | "boolean" => Cast::Boolean,
            "string" => Cast::String,
            "array" | "json" | "object" | "collection" => Cast::Json,
            "date" | "immutable_date" => Cast::Date,
            "datetime" | "immutable_datetime" | "custom_datetime" => Cast::DateTime,
            "timestamp" => Cast::Timestamp,
            other => return Err(TheoriaError::invalid(format!("unknown cast type '{other}'"))),
        })
    }

    pub fn is_date(&self) -> bool {
        matches!(self, Cast::Date | Cast::DateTime)
    }

    pub fn apply(
        &self,
        key: &str,
        value: &Value,
        attributes: &IndexMap<String, Value>,
    ) -> TheoriaResult<Value> {
        if let Cast::Custom(caster) = self {
            return caster.get(key, value, attributes);
        }
        if value.is_null() {
            return Ok(Value::Null);
        }
        match self {
            Cast::Integer => Ok(Value::Int(to_integer(value))),
            Cast::Float => Ok(Value::Float(value.as_f64().unwrap_or(0.0))),
            Cast::Decimal(scale) => round_decimal(&decimal_source(value)?, *scale).map(Value::Text),
            Cast::Boolean => Ok(Value::Bool(to_boolean(value))),
            Cast::String => Ok(Value::Text(value.to_string())),
            Cast::Json => to_json(key, value),
            Cast::Date => parse_datetime(value)
                .map(|at| Value::DateTime(at.replace_time(Time::MIDNIGHT)))
                .ok_or_else(|| unparseable_date(key, value)),
            Cast::DateTime => parse_datetime(value)
                .map(Value::DateTime)
                .ok_or_else(|| unparseable_date(key, value)),
            Cast::Timestamp => parse_datetime(value)
                .map(|at| Value::Int(at.unix_timestamp()))
                .ok_or_else(|| unparseable_date(key, value)),
            Cast::Custom(_) => Ok(value.clone()),
        }
    }
}

fn unparseable_date(key: &str, value: &Value) -> TheoriaError {
    TheoriaError::invalid(format!("attribute [{key}] holds unparseable date '{value}'"))
}

fn to_integer(value: &Value) -> i64 {
    if let Some(number) = value.as_i64() {
        return number;
    }
    if let Some(number) = value.as_f64() {
        return number.trunc() as i64;
    }
    let text = value.to_string();
    let digits: String = text
        .trim()
        .chars()
        .enumerate()
        .take_while(|(index, ch)| ch.is_ascii_digit() || (*index == 0 && *ch == '-'))
        .map(|(_, ch)| ch)
        .collect();
    digits.parse().unwrap_or(0)
}

fn to_boolean(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Int(number) => *number != 0,
        Value::Float(number) => *number != 0.0,
        Value::Text(text) => !(text.is_empty() || text == "0"),
        Value::Bytes(bytes) => !bytes.is_empty(),
        Value::Json(_) | Value::DateTime(_) => true,
    }
}

fn to_json(key: &str, value: &Value) -> TheoriaResult<Value> {
    match value {
        Value::Json(json) => Ok(Value::Json(json.clone())),
        Value::Text(text) => serde_json::from_str(text)
            .map(Value::Json)
            .map_err(|err| TheoriaError::invalid(format!("attribute [{key}] is not json: {err}"))),
        Value::Bytes(bytes) => serde_json::from_slice(bytes)
            .map(Value::Json)
            .map_err(|err| TheoriaError::invalid(format!("attribute [{key}] is not json: {err}"))),
        other => Ok(Value::Json(other.to_json())),
    }
}

fn decimal_source(value: &Value) -> TheoriaResult<String> {
    match value {
        Value::Int(number) => Ok(number.to_string()),
        Value::Float(number) if number.is_finite() => Ok(format!("{number}")),
        Value::Text(text) => Ok(text.trim().to_string()),
        Value::Bool(flag) => Ok(if *flag { "1" } else { "0" }.to_string()),
        other => Err(TheoriaError::invalid(format!(
            "value '{other}' cannot be cast to decimal"
        ))),
    }
}

/// Rounds a decimal string half-up to `scale` fraction digits without going through floats.
pub(crate) fn round_decimal(source: &str, scale: u32) -> TheoriaResult<String> {
    let invalid = || TheoriaError::invalid(format!("'{source}' is not a decimal number"));
    if source.contains(['e', 'E']) {
        let number: f64 = source.parse().map_err(|_| invalid())?;
        return round_decimal(&format!("{number:.17}"), scale);
    }
    let (negative, unsigned) = match source.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, source.strip_prefix('+').unwrap_or(source)),
    };
    let (whole, fraction) = unsigned.split_once('.').unwrap_or((unsigned, ""));
    let whole = if whole.is_empty() { "0" } else { whole };
    let digits = |part: &str| part.chars().all(|ch| ch.is_ascii_digit());
    if !digits(whole) || !digits(fraction) {
        return Err(invalid());
    }
    let scale = scale as usize;
    let mut digits: Vec<u8> = whole.bytes().map(|b| b - b'0').collect();
    let kept: Vec<u8> = fraction
        .bytes()
        .map(|b| b - b'0')
        .chain(std::iter::repeat(0))
        .take(scale)
        .collect();
    let round_up = fraction
        .as_bytes()
        .get(scale)
        .is_some_and(|next| *next >= b'5');
    digits.extend(kept);
    if round_up {
        let mut index = digits.len();
        loop {
            if index == 0 {
                digits.insert(0, 1);
                break;
            }
            index -= 1;
            if digits[index] == 9 {
                digits[index] = 0;
            } else {
                digits[index] += 1;
                break;
            }
        }
    }
    let split = digits.len() - scale;
    let mut rendered: String = digits[..split]
        .iter()
        .map(|d| char::from(b'0' + d))
        .collect::<String>()
        .trim_start_matches('0')
        .to_string();
    if rendered.is_empty() {
        rendered.push('0');
    }
    if scale > 0 {
        rendered.push('.');
        rendered.extend(digits[split..].iter().map(|d| char::from(b'0' + d)));
    }
    let is_zero = digits.iter().all(|d| *d == 0);
    if negative && !is_zero {
        rendered.insert(0, '-');
    }
    Ok(rendered)
}

/// Interprets stored values as instants: unix timestamps, RFC 3339 or `Y-m-d[ H:i:s[.u]]`.
pub(crate) fn parse_datetime(value: &Value) -> Option<OffsetDateTime> {
    match value {
        Value::DateTime(at) => Some(*at),
        Value::Int(seconds) => OffsetDateTime::from_unix_timestamp(*seconds).ok(),
        Value::Float(seconds) => {
            OffsetDateTime::from_unix_timestamp_nanos((*seconds * 1e9) as i128).ok()
        }
        Value::Text(text) => parse_datetime_text(text.trim()),
        _ => None,
    }
}

fn parse_datetime_text(text: &str) -> Option<OffsetDateTime> {
    if !text.is_empty() && text.chars().all(|ch| ch.is_ascii_digit()) {
        return text
            .parse()
            .ok()
            .and_then(|seconds| OffsetDateTime::from_unix_timestamp(seconds).ok());
    }
    if let Ok(at) = OffsetDateTime::parse(text, &Rfc3339) {
        return Some(at);
    }
    for format in [DATETIME_FRACTION, DATETIME_SPACE, DATETIME_T] {
        if let Ok(at) = PrimitiveDateTime::parse(text, format) {
            return Some(at.assume_utc());
        }
    }
    Date::parse(text, DATE_ONLY)
        .ok()
        .map(|date| date.midnight().assume_utc())
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;
    use serde_json::json;
    use time::macros::datetime;

    use super::{Cast, CastsAttribute, round_decimal};
    use crate::{TheoriaResult, Value};

    fn apply(cast: &Cast, value: Value) -> Value {
        cast.apply("field", &value, &IndexMap::new()).expect("cast")
    }

    #[test]
    fn parses_host_cast_names() {
        assert!(matches!(Cast::parse("int").expect("int"), Cast::Integer));
        assert!(matches!(Cast::parse("decimal:2").expect("dec"), Cast::Decimal(2)));
        assert!(matches!(Cast::parse("array").expect("array"), Cast::Json));
        assert!(matches!(
            Cast::parse("datetime:Y-m-d").expect("datetime"),
            Cast::DateTime
        ));
        assert!(Cast::parse("hologram").is_err());
        assert!(Cast::parse("decimal:x").is_err());
    }

    #[test]
    fn decimal_rounds_half_up_on_digits() {
        assert_eq!(round_decimal("12.345", 2).expect("round"), "12.35");
        assert_eq!(round_decimal("1.005", 2).expect("round"), "1.01");
        assert_eq!(round_decimal("9.995", 2).expect("round"), "10.00");
        assert_eq!(round_decimal("-0.001", 2).expect("round"), "0.00");
        assert_eq!(round_decimal("-2.5", 0).expect("round"), "-3");
        assert_eq!(round_decimal("7", 3).expect("round"), "7.000");
        assert!(round_decimal("abc", 2).is_err());
        assert_eq!(
            apply(&Cast::Decimal(2), Value::Float(3.1)),
            Value::from("3.10")
        );
    }

    #[test]
    fn scalar_casts_follow_host_semantics() {
        assert_eq!(apply(&Cast::Integer, Value::from("42")), Value::Int(42));
        assert_eq!(apply(&Cast::Integer, Value::from("12abc")), Value::Int(12));
        assert_eq!(apply(&Cast::Integer, Value::Float(3.9)), Value::Int(3));
        assert_eq!(apply(&Cast::Float, Value::Int(2)), Value::Float(2.0));
        assert_eq!(apply(&Cast::Boolean, Value::Int(0)), Value::Bool(false));
        assert_eq!(apply(&Cast::Boolean, Value::from("0")), Value::Bool(false));
        assert_eq!(apply(&Cast::Boolean, Value::from("yes")), Value::Bool(true));
        assert_eq!(apply(&Cast::String, Value::Int(5)), Value::from("5"));
        assert_eq!(apply(&Cast::Integer, Value::Null), Value::Null);
    }

    #[test]
    fn json_and_date_casts_decode_text() {
        assert_eq!(
            apply(&Cast::Json, Value::from(r#"{"theme":"dark"}"#)),
            Value::Json(json!({"theme": "dark"}))
        );
        assert!(
            Cast::Json
                .apply("settings", &Value::from("{"), &IndexMap::new())
                .is_err()
        );
        assert_eq!(
            apply(&Cast::DateTime, Value::from("2024-01-02 03:04:05")),
            Value::DateTime(datetime!(2024-01-02 03:04:05 UTC))
        );
        assert_eq!(
            apply(&Cast::Date, Value::from("2024-01-02 03:04:05")),
            Value::DateTime(datetime!(2024-01-02 00:00:00 UTC))
        );
        assert_eq!(
            apply(&Cast::Timestamp, Value::from("1970-01-01 00:01:00")),
            Value::Int(60)
        );
        assert_eq!(
            apply(&Cast::DateTime, Value::Int(0)),
            Value::DateTime(datetime!(1970-01-01 00:00:00 UTC))
        );
    }

    struct Upper;

    impl CastsAttribute for Upper {
        fn get(
            &self,
            _key: &str,
            value: &Value,
            _attributes: &IndexMap<String, Value>,
        ) -> TheoriaResult<Value> {
            Ok(Value::Text(value.to_string().to_uppercase()))
        }
    }

    #[test]
    fn custom_casts_receive_the_raw_value() {
        let cast = Cast::Custom(std::sync::Arc::new(Upper));
        assert_eq!(apply(&cast, Value::from("ada")), Value::from("ADA"));
    }
}
