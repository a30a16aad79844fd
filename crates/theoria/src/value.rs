use std::cmp::Ordering;
use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use sea_orm::sea_query::Value as SeaValue;
use serde::{Serialize, Serializer};
use serde_json::{Number, Value as JsonValue};
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

const STORAGE_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
const JSON_FORMAT: &[BorrowedFormatItem<'static>] = format_description!(
    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
);

/// One attribute value, either as read from storage or after casting.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Json(JsonValue),
    DateTime(OffsetDateTime),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(value) => Some(*value),
            Value::Bool(value) => Some(i64::from(*value)),
            Value::Float(value) if value.fract() == 0.0 => Some(*value as i64),
            Value::Text(value) => value.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(value) => Some(*value as f64),
            Value::Float(value) => Some(*value),
            Value::Bool(value) => Some(if *value { 1.0 } else { 0.0 }),
            Value::Text(value) => value.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(value) => Some(*value),
            Value::Int(value) => Some(*value != 0),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<OffsetDateTime> {
        match self {
            Value::DateTime(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&JsonValue> {
        match self {
            Value::Json(value) => Some(value),
            _ => None,
        }
    }

    /// Serialized form used by `to_array` and `to_json`.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::Null => JsonValue::Null,
            Value::Bool(value) => JsonValue::Bool(*value),
            Value::Int(value) => JsonValue::Number((*value).into()),
            Value::Float(value) => Number::from_f64(*value)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Value::Text(value) => JsonValue::String(value.clone()),
            Value::Bytes(value) => JsonValue::String(BASE64.encode(value)),
            Value::Json(value) => value.clone(),
            Value::DateTime(value) => JsonValue::String(format_json_datetime(*value)),
        }
    }

    /// Key used to match related rows to their owners. Null never matches.
    pub fn dictionary_key(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Bool(value) => Some(if *value { "1" } else { "0" }.to_string()),
            Value::Float(value) if value.fract() == 0.0 => Some(format!("{}", *value as i64)),
            other => Some(other.to_string()),
        }
    }

    /// Loose equality: numbers compare numerically across int, float and numeric text.
    pub fn loose_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Null, _) | (_, Value::Null) => false,
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Bool(a), b) | (b, Value::Bool(a)) => b.as_bool().or_else(|| {
                b.as_f64().map(|number| number != 0.0)
            }) == Some(*a),
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(left), Some(right)) => left == right,
                _ => a.to_string() == b.to_string(),
            },
        }
    }

    /// Total order used for in-memory sorting and range checks.
    pub fn sort_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Null, _) => Ordering::Less,
            (_, Value::Null) => Ordering::Greater,
            (Value::DateTime(a), Value::DateTime(b)) => a.cmp(b),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(left), Some(right)) => left.partial_cmp(&right).unwrap_or(Ordering::Equal),
                _ => a.to_string().cmp(&b.to_string()),
            },
        }
    }

    pub(crate) fn to_sea(&self) -> SeaValue {
        match self {
            Value::Null => SeaValue::String(None),
            Value::Bool(value) => SeaValue::Bool(Some(*value)),
            Value::Int(value) => SeaValue::BigInt(Some(*value)),
            Value::Float(value) => SeaValue::Double(Some(*value)),
            Value::Text(value) => SeaValue::String(Some(value.clone())),
            Value::Bytes(value) => SeaValue::Bytes(Some(value.clone())),
            Value::Json(value) => SeaValue::String(Some(value.to_string())),
            Value::DateTime(value) => SeaValue::String(Some(format_storage_datetime(*value))),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Bool(value) => write!(f, "{}", if *value { "1" } else { "" }),
            Value::Int(value) => write!(f, "{value}"),
            Value::Float(value) => write!(f, "{value}"),
            Value::Text(value) => f.write_str(value),
            Value::Bytes(value) => f.write_str(&String::from_utf8_lossy(value)),
            Value::Json(value) => write!(f, "{value}"),
            Value::DateTime(value) => f.write_str(&format_storage_datetime(*value)),
        }
    }
}

impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_json().serialize(serializer)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(i64::from(value))
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::Int(i64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Bytes(value)
    }
}

impl From<JsonValue> for Value {
    fn from(value: JsonValue) -> Self {
        Value::Json(value)
    }
}

impl From<OffsetDateTime> for Value {
    fn from(value: OffsetDateTime) -> Self {
        Value::DateTime(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

pub(crate) fn format_storage_datetime(value: OffsetDateTime) -> String {
    value
        .to_offset(UtcOffset::UTC)
        .format(STORAGE_FORMAT)
        .unwrap_or_default()
}

pub(crate) fn format_json_datetime(value: OffsetDateTime) -> String {
    value
        .to_offset(UtcOffset::UTC)
        .format(JSON_FORMAT)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::cmp::Ordering;

    use serde_json::json;
    use time::macros::datetime;

    use super::Value;

    #[test]
    fn json_form_covers_every_variant() {
        assert_eq!(Value::Null.to_json(), json!(null));
        assert_eq!(Value::Bool(true).to_json(), json!(true));
        assert_eq!(Value::Int(7).to_json(), json!(7));
        assert_eq!(Value::Float(1.5).to_json(), json!(1.5));
        assert_eq!(Value::Float(f64::NAN).to_json(), json!(null));
        assert_eq!(Value::from("x").to_json(), json!("x"));
        assert_eq!(Value::Bytes(b"hi".to_vec()).to_json(), json!("aGk="));
        assert_eq!(Value::Json(json!({"a": [1]})).to_json(), json!({"a": [1]}));
        let at = datetime!(2024-03-04 05:06:07.5 UTC);
        assert_eq!(
            Value::DateTime(at).to_json(),
            json!("2024-03-04T05:06:07.500000Z")
        );
    }

    #[test]
    fn dictionary_keys_normalise_numbers() {
        assert_eq!(Value::Int(3).dictionary_key().as_deref(), Some("3"));
        assert_eq!(Value::Float(3.0).dictionary_key().as_deref(), Some("3"));
        assert_eq!(Value::from("3").dictionary_key().as_deref(), Some("3"));
        assert_eq!(Value::Null.dictionary_key(), None);
    }

    #[test]
    fn loose_equality_crosses_numeric_representations() {
        assert!(Value::Int(1).loose_eq(&Value::Float(1.0)));
        assert!(Value::Int(1).loose_eq(&Value::from("1")));
        assert!(Value::Bool(true).loose_eq(&Value::Int(1)));
        assert!(!Value::Int(1).loose_eq(&Value::Null));
        assert!(!Value::from("a").loose_eq(&Value::from("b")));
    }

    #[test]
    fn sort_order_puts_null_first() {
        assert_eq!(Value::Null.sort_cmp(&Value::Int(0)), Ordering::Less);
        assert_eq!(Value::Int(2).sort_cmp(&Value::Float(1.5)), Ordering::Greater);
        assert_eq!(Value::from("b").sort_cmp(&Value::from("a")), Ordering::Greater);
    }

    #[test]
    fn optional_values_convert_to_null() {
        let missing: Option<i64> = None;
        assert_eq!(Value::from(missing), Value::Null);
        assert_eq!(Value::from(Some(4)), Value::Int(4));
    }
}
