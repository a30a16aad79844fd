use indexmap::IndexMap;
use serde::{Serialize, Serializer};
use serde_json::Value as JsonValue;

use crate::record::ReadOnlyGuard;
use crate::{Attributes, Value};

pub(crate) const PIVOT_PREFIX: &str = "pivot_";

/// Link-table columns attached to a record reached through a many-to-many relation.
#[derive(Clone, Debug, PartialEq)]
pub struct Pivot {
    table: String,
    attributes: IndexMap<String, Value>,
}

impl Pivot {
    pub fn new(table: impl Into<String>, attributes: IndexMap<String, Value>) -> Self {
        Self {
            table: table.into(),
            attributes,
        }
    }

    /// Splits `pivot_*` aliased columns out of a joined row.
    pub(crate) fn extract(table: &str, row: &mut IndexMap<String, Value>) -> Self {
        let keys: Vec<String> = row
            .keys()
            .filter(|key| key.starts_with(PIVOT_PREFIX))
            .cloned()
            .collect();
        let mut attributes = IndexMap::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = row.shift_remove(&key) {
                attributes.insert(key[PIVOT_PREFIX.len()..].to_string(), value);
            }
        }
        Self::new(table, attributes)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn get_attributes(&self) -> &IndexMap<String, Value> {
        &self.attributes
    }

    pub fn get_raw_or(&self, key: &str, default: Value) -> Value {
        self.attributes.get(key).cloned().unwrap_or(default)
    }

    pub fn to_array(&self) -> IndexMap<String, JsonValue> {
        self.attributes
            .iter()
            .map(|(key, value)| (key.clone(), value.to_json()))
            .collect()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.to_array()).unwrap_or_default()
    }
}

impl Attributes for Pivot {
    fn get(&self, key: &str) -> Value {
        self.get_raw(key)
    }

    fn raw_attributes(&self) -> &IndexMap<String, Value> {
        &self.attributes
    }
}

impl ReadOnlyGuard for Pivot {
    fn guarded_model(&self) -> &str {
        &self.table
    }
}

impl Serialize for Pivot {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_array().serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;

    use super::Pivot;
    use crate::record::ReadOnlyGuard;
    use crate::{Attributes, Value};

    #[test]
    fn extracts_aliased_columns_from_row() {
        let mut row: IndexMap<String, Value> = [
            ("id".to_string(), Value::Int(3)),
            ("pivot_user_id".to_string(), Value::Int(1)),
            ("pivot_granted_by".to_string(), Value::from("ops")),
        ]
        .into_iter()
        .collect();
        let pivot = Pivot::extract("role_user", &mut row);
        assert_eq!(row.keys().collect::<Vec<_>>(), vec!["id"]);
        assert_eq!(pivot.get("user_id"), Value::Int(1));
        assert_eq!(pivot.get("granted_by"), Value::from("ops"));
        assert_eq!(pivot.get("missing"), Value::Null);
        assert_eq!(pivot.get_raw_or("missing", Value::Int(0)), Value::Int(0));
        assert_eq!(
            pivot.to_json(),
            r#"{"user_id":1,"granted_by":"ops"}"#
        );
    }

    #[test]
    fn pivot_writes_are_violations() {
        let pivot = Pivot::new("role_user", IndexMap::new());
        let err = pivot
            .set_attribute("granted_by", Value::from("x"))
            .expect_err("violation");
        assert_eq!(err.to_string(), "Cannot set attribute [granted_by]");
        assert!(pivot.save().expect_err("violation").is_violation());
        assert!(pivot.delete().expect_err("violation").is_violation());
    }
}
