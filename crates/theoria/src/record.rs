use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::{Serialize, Serializer};
use serde_json::Value as JsonValue;

use crate::builder::ReadOnly;
use crate::eager::{self, EagerTree};
use crate::model::{cast_attributes, resolve_attribute, serialize_attributes};
use crate::relation::RelationQuery;
use crate::{
    Attributes, Collection, KeyType, ModelDef, NativeRecord, Pivot, TheoriaError, TheoriaResult,
    TheoriaStore, Value, naming,
};

type RelationSlot = Arc<tokio::sync::OnceCell<Related>>;

/// Resolved relation value. Read-only targets come back wrapped, native targets pass through.
#[derive(Clone, Debug)]
pub enum Related {
    One(Option<Record>),
    Many(Collection),
    NativeOne(Option<NativeRecord>),
    NativeMany(Vec<NativeRecord>),
}

impl Related {
    pub fn is_null(&self) -> bool {
        matches!(self, Related::One(None) | Related::NativeOne(None))
    }

    pub fn is_to_many(&self) -> bool {
        matches!(self, Related::Many(_) | Related::NativeMany(_))
    }

    pub fn len(&self) -> usize {
        match self {
            Related::One(record) => usize::from(record.is_some()),
            Related::NativeOne(record) => usize::from(record.is_some()),
            Related::Many(collection) => collection.count(),
            Related::NativeMany(records) => records.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_record(&self) -> Option<&Record> {
        match self {
            Related::One(record) => record.as_ref(),
            _ => None,
        }
    }

    pub fn as_collection(&self) -> Option<&Collection> {
        match self {
            Related::Many(collection) => Some(collection),
            _ => None,
        }
    }

    pub fn as_native(&self) -> Option<&NativeRecord> {
        match self {
            Related::NativeOne(record) => record.as_ref(),
            _ => None,
        }
    }

    pub fn as_native_many(&self) -> Option<&[NativeRecord]> {
        match self {
            Related::NativeMany(records) => Some(records),
            _ => None,
        }
    }

    pub fn into_record(self) -> Option<Record> {
        match self {
            Related::One(record) => record,
            _ => None,
        }
    }

    pub fn into_collection(self) -> Option<Collection> {
        match self {
            Related::Many(collection) => Some(collection),
            _ => None,
        }
    }

    pub fn into_native(self) -> Option<NativeRecord> {
        match self {
            Related::NativeOne(record) => record,
            _ => None,
        }
    }

    pub fn into_native_many(self) -> Option<Vec<NativeRecord>> {
        match self {
            Related::NativeMany(records) => Some(records),
            _ => None,
        }
    }

    /// Serialized form: `null` for a resolved empty to-one, `[]` for an empty to-many.
    pub fn to_json_value(&self) -> JsonValue {
        match self {
            Related::One(None) | Related::NativeOne(None) => JsonValue::Null,
            Related::One(Some(record)) => object(record.to_array()),
            Related::NativeOne(Some(record)) => object(record.to_array()),
            Related::Many(collection) => JsonValue::Array(
                collection
                    .iter()
                    .map(|record| object(record.to_array()))
                    .collect(),
            ),
            Related::NativeMany(records) => JsonValue::Array(
                records
                    .iter()
                    .map(|record| object(record.to_array()))
                    .collect(),
            ),
        }
    }
}

pub(crate) fn object(map: IndexMap<String, JsonValue>) -> JsonValue {
    JsonValue::Object(map.into_iter().collect())
}

/// Write entry points of a record. Every method fails with a violation naming the
/// operation; nothing is ever changed.
pub trait ReadOnlyGuard {
    fn guarded_model(&self) -> &str;

    fn set_attribute(&self, key: &str, _value: Value) -> TheoriaResult<Infallible> {
        Err(TheoriaError::cannot_set_attribute(self.guarded_model(), key))
    }

    fn unset_attribute(&self, key: &str) -> TheoriaResult<Infallible> {
        Err(TheoriaError::cannot_unset_attribute(self.guarded_model(), key))
    }

    /// Indexed assignment (`record[key] = value`).
    fn offset_set(&self, key: &str, _value: Value) -> TheoriaResult<Infallible> {
        Err(TheoriaError::cannot_set_attribute(self.guarded_model(), key))
    }

    fn offset_unset(&self, key: &str) -> TheoriaResult<Infallible> {
        Err(TheoriaError::cannot_unset_attribute(self.guarded_model(), key))
    }

    fn set_relation(&self, name: &str, _related: Related) -> TheoriaResult<Infallible> {
        Err(TheoriaError::cannot_set_relation(self.guarded_model(), name))
    }

    fn unset_relation(&self, name: &str) -> TheoriaResult<Infallible> {
        Err(TheoriaError::cannot_set_relation(self.guarded_model(), name))
    }

    fn set_raw_attributes(
        &self,
        _attributes: IndexMap<String, Value>,
    ) -> TheoriaResult<Infallible> {
        Err(TheoriaError::cannot_call(self.guarded_model(), "set_raw_attributes"))
    }

    fn fill(&self, _attributes: IndexMap<String, Value>) -> TheoriaResult<Infallible> {
        Err(TheoriaError::cannot_call(self.guarded_model(), "fill"))
    }

    fn save(&self) -> TheoriaResult<Infallible> {
        Err(TheoriaError::cannot_call(self.guarded_model(), "save"))
    }

    fn update(&self, _values: IndexMap<String, Value>) -> TheoriaResult<Infallible> {
        Err(TheoriaError::cannot_call(self.guarded_model(), "update"))
    }

    fn delete(&self) -> TheoriaResult<Infallible> {
        Err(TheoriaError::cannot_call(self.guarded_model(), "delete"))
    }

    fn push(&self) -> TheoriaResult<Infallible> {
        Err(TheoriaError::cannot_call(self.guarded_model(), "push"))
    }

    fn touch(&self) -> TheoriaResult<Infallible> {
        Err(TheoriaError::cannot_call(self.guarded_model(), "touch"))
    }

    fn increment(&self, _column: &str, _amount: i64) -> TheoriaResult<Infallible> {
        Err(TheoriaError::cannot_call(self.guarded_model(), "increment"))
    }

    fn decrement(&self, _column: &str, _amount: i64) -> TheoriaResult<Infallible> {
        Err(TheoriaError::cannot_call(self.guarded_model(), "decrement"))
    }

    fn force_delete(&self) -> TheoriaResult<Infallible> {
        Err(TheoriaError::cannot_call(self.guarded_model(), "force_delete"))
    }

    fn restore(&self) -> TheoriaResult<Infallible> {
        Err(TheoriaError::cannot_call(self.guarded_model(), "restore"))
    }
}

struct RecordInner {
    def: Arc<ModelDef>,
    raw: IndexMap<String, Value>,
    casts: OnceCell<IndexMap<String, Value>>,
    relations: Mutex<IndexMap<String, RelationSlot>>,
    pivot: Option<Pivot>,
    store: Option<TheoriaStore>,
}

/// Immutable hydrated row. Clones share state, including the relation cache.
#[derive(Clone)]
pub struct Record(Arc<RecordInner>);

impl Record {
    pub(crate) fn hydrate(
        def: Arc<ModelDef>,
        store: Option<TheoriaStore>,
        raw: IndexMap<String, Value>,
        pivot: Option<Pivot>,
    ) -> Self {
        Self(Arc::new(RecordInner {
            def,
            raw,
            casts: OnceCell::new(),
            relations: Mutex::new(IndexMap::new()),
            pivot,
            store,
        }))
    }

    /// Hydrates an in-memory row. Relations can only be read once loaded.
    pub fn from_attributes(def: Arc<ModelDef>, raw: IndexMap<String, Value>) -> Self {
        Self::hydrate(def, None, raw, None)
    }

    pub fn def(&self) -> &Arc<ModelDef> {
        &self.0.def
    }

    pub fn model_name(&self) -> &str {
        self.0.def.name()
    }

    pub fn table(&self) -> &str {
        self.0.def.table()
    }

    pub fn primary_key(&self) -> Option<&str> {
        self.0.def.primary_key()
    }

    pub fn key_type(&self) -> KeyType {
        self.0.def.key_type()
    }

    pub fn connection(&self) -> Option<&str> {
        self.0.def.connection()
    }

    pub(crate) fn store(&self) -> Option<&TheoriaStore> {
        self.0.store.as_ref()
    }

    pub fn get_key(&self) -> Value {
        match self.primary_key() {
            Some(key) => self.get_raw(key),
            None => Value::Null,
        }
    }

    pub fn get_attribute(&self, key: &str) -> Value {
        self.get(key)
    }

    pub fn get_attributes(&self) -> &IndexMap<String, Value> {
        &self.0.raw
    }

    pub fn get_raw_or(&self, key: &str, default: Value) -> Value {
        self.0.raw.get(key).cloned().unwrap_or(default)
    }

    /// Raw stored values; there is no dirty state to diverge from.
    pub fn get_original(&self) -> &IndexMap<String, Value> {
        &self.0.raw
    }

    pub fn get_raw_original(&self) -> &IndexMap<String, Value> {
        &self.0.raw
    }

    /// Cast values, computed on first use and cached for the record's lifetime.
    pub fn cast_attributes(&self) -> &IndexMap<String, Value> {
        self.0
            .casts
            .get_or_init(|| cast_attributes(&self.0.def, &self.0.raw))
    }

    pub fn pivot(&self) -> Option<&Pivot> {
        self.0.pivot.as_ref()
    }

    /// Same table, connection and key.
    pub fn is(&self, other: &Record) -> bool {
        let key = self.get_key();
        !key.is_null()
            && key.loose_eq(&other.get_key())
            && self.table() == other.table()
            && self.connection() == other.connection()
    }

    pub fn is_not(&self, other: &Record) -> bool {
        !self.is(other)
    }

    pub fn relation_loaded(&self, name: &str) -> bool {
        self.0
            .relations
            .lock()
            .get(name)
            .is_some_and(|slot| slot.initialized())
    }

    /// Already-loaded relation value. Never triggers a query.
    pub fn get_relation(&self, name: &str) -> TheoriaResult<Related> {
        self.0
            .relations
            .lock()
            .get(name)
            .and_then(|slot| slot.get().cloned())
            .ok_or_else(|| TheoriaError::relation_not_loaded(self.model_name(), name))
    }

    pub fn get_relations(&self) -> IndexMap<String, Related> {
        self.0
            .relations
            .lock()
            .iter()
            .filter_map(|(name, slot)| slot.get().map(|related| (name.clone(), related.clone())))
            .collect()
    }

    /// Property access: loads the relation on first use and caches it for good.
    pub async fn relation(&self, name: &str) -> TheoriaResult<Related> {
        let slot = self.slot(name)?;
        if let Some(related) = slot.get() {
            log::trace!("relation {}.{name} served from cache", self.model_name());
            return Ok(related.clone());
        }
        let related = slot
            .get_or_try_init(|| async { self.relation_query(name)?.get().await })
            .await?;
        Ok(related.clone())
    }

    /// Method access: a chainable query over the relation, of the target's family.
    pub fn relation_query(&self, name: &str) -> TheoriaResult<RelationQuery> {
        let relation = self
            .0
            .def
            .relation(name)
            .ok_or_else(|| TheoriaError::undefined_relation(self.model_name(), name))?;
        let store = self.store().ok_or_else(|| {
            TheoriaError::configuration(format!(
                "record of [{}] is not bound to a store; relation [{name}] cannot be queried",
                self.model_name()
            ))
        })?;
        RelationQuery::for_record(store.clone(), relation.clone(), self.clone())
    }

    /// Eager-loads relation paths onto this record. Loaded relations are kept as they are.
    pub async fn load<I, S>(&self, paths: I) -> TheoriaResult<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let store = self.store().cloned().ok_or_else(|| {
            TheoriaError::configuration(format!(
                "record of [{}] is not bound to a store",
                self.model_name()
            ))
        })?;
        let tree = EagerTree::parse(paths);
        let mut records = vec![self.clone()];
        eager::load::<ReadOnly>(&store, self.def(), &mut records, &tree).await
    }

    /// Stores an eager or lazy result. An existing value is never replaced.
    pub(crate) fn cache_relation(&self, name: &str, related: Related) {
        let slot = {
            let mut relations = self.0.relations.lock();
            relations.entry(name.to_string()).or_default().clone()
        };
        if slot.set(related).is_err() {
            log::trace!(
                "relation {}.{name} already cached; keeping the first value",
                self.model_name()
            );
        }
    }

    fn slot(&self, name: &str) -> TheoriaResult<RelationSlot> {
        if self.0.def.relation(name).is_none() {
            return Err(TheoriaError::undefined_relation(self.model_name(), name));
        }
        let mut relations = self.0.relations.lock();
        Ok(relations.entry(name.to_string()).or_default().clone())
    }

    pub fn to_array(&self) -> IndexMap<String, JsonValue> {
        let def = &self.0.def;
        let mut out = serialize_attributes(def, self);
        for (name, related) in self.get_relations() {
            if def.is_hidden(&name) {
                continue;
            }
            out.insert(naming::snake(&name), related.to_json_value());
        }
        if let Some(pivot) = &self.0.pivot {
            if !def.is_hidden("pivot") {
                out.insert("pivot".to_string(), object(pivot.to_array()));
            }
        }
        out
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.to_array()).unwrap_or_default()
    }
}

impl Attributes for Record {
    fn get(&self, key: &str) -> Value {
        resolve_attribute(&self.0.def, self, self.cast_attributes(), key)
    }

    fn raw_attributes(&self) -> &IndexMap<String, Value> {
        &self.0.raw
    }
}

impl ReadOnlyGuard for Record {
    fn guarded_model(&self) -> &str {
        self.model_name()
    }
}

impl Serialize for Record {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_array().serialize(serializer)
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("model", &self.model_name())
            .field("attributes", &self.0.raw)
            .field("pivot", &self.0.pivot)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use indexmap::IndexMap;
    use serde_json::json;

    use super::{ReadOnlyGuard, Record, Related};
    use crate::{Attributes, Cast, Collection, ModelBuilder, Registry, Value};

    fn user_record() -> Record {
        let registry = Registry::builder()
            .model(
                ModelBuilder::read_only("User")
                    .cast("is_admin", Cast::Boolean)
                    .cast("born_on", Cast::Date)
                    .hidden(["password"])
                    .accessor("display_name", |row| {
                        Value::from(format!("{} <{}>", row.get("name"), row.get("email")))
                    })
                    .append("display_name"),
            )
            .build()
            .expect("registry");
        let raw: IndexMap<String, Value> = [
            ("id", Value::Int(1)),
            ("name", Value::from("Ada")),
            ("email", Value::from("ada@example.test")),
            ("password", Value::from("hash")),
            ("is_admin", Value::Int(1)),
            ("born_on", Value::from("1815-12-10 08:00:00")),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect();
        Record::from_attributes(registry.def("User").expect("def"), raw)
    }

    #[test]
    fn get_prefers_accessor_then_cast_then_raw() {
        let record = user_record();
        assert_eq!(
            record.get("display_name"),
            Value::from("Ada <ada@example.test>")
        );
        assert_eq!(record.get("is_admin"), Value::Bool(true));
        assert_eq!(record.get("name"), Value::from("Ada"));
        assert_eq!(record.get("missing"), Value::Null);
        assert_eq!(record.get_raw("is_admin"), Value::Int(1));
        assert_eq!(record.get_raw_or("missing", Value::Int(9)), Value::Int(9));
        assert_eq!(record.get_original(), record.get_attributes());
    }

    #[test]
    fn to_array_hides_casts_and_appends() {
        let record = user_record();
        let array = record.to_array();
        assert!(!array.contains_key("password"));
        assert_eq!(array["is_admin"], json!(true));
        assert_eq!(array["born_on"], json!("1815-12-10T00:00:00.000000Z"));
        assert_eq!(array["display_name"], json!("Ada <ada@example.test>"));
        assert_eq!(record.to_array(), array);
        assert_eq!(serde_json::to_string(&record).expect("json"), record.to_json());
    }

    #[test]
    fn every_write_path_is_a_violation() {
        let record = user_record();
        let err = record
            .set_attribute("name", Value::from("x"))
            .expect_err("set");
        assert_eq!(err.to_string(), "Cannot set attribute [name]");
        let err = record.offset_unset("name").expect_err("unset");
        assert_eq!(err.to_string(), "Cannot unset attribute [name]");
        let err = record
            .set_relation("posts", Related::Many(Collection::default()))
            .expect_err("relation");
        assert_eq!(err.to_string(), "Cannot set relation [posts]");
        for err in [
            record.save().expect_err("save"),
            record.update(IndexMap::new()).expect_err("update"),
            record.delete().expect_err("delete"),
            record.fill(IndexMap::new()).expect_err("fill"),
            record.push().expect_err("push"),
            record.touch().expect_err("touch"),
            record.increment("votes", 1).expect_err("increment"),
            record.decrement("votes", 1).expect_err("decrement"),
            record.force_delete().expect_err("force_delete"),
            record.restore().expect_err("restore"),
        ] {
            assert!(err.is_violation(), "{err}");
        }
        assert_eq!(record.get("name"), Value::from("Ada"));
    }

    #[test]
    fn relations_without_store_report_state() {
        let record = user_record();
        assert!(!record.relation_loaded("posts"));
        assert!(record.get_relation("posts").is_err());
        record.cache_relation("posts", Related::Many(Collection::default()));
        record.cache_relation("posts", Related::One(None));
        assert!(record.relation_loaded("posts"));
        assert!(record.get_relation("posts").expect("cached").is_to_many());
        assert_eq!(record.to_array()["posts"], json!([]));
        let clone = record.clone();
        assert!(clone.relation_loaded("posts"));
        assert!(record.relation_query("posts").is_err());
    }

    #[test]
    fn identity_compares_table_and_key() {
        let left = user_record();
        let right = Record::from_attributes(Arc::clone(left.def()), left.get_attributes().clone());
        assert!(left.is(&right));
        let other = Record::from_attributes(
            Arc::clone(left.def()),
            [("id".to_string(), Value::Int(2))].into_iter().collect(),
        );
        assert!(left.is_not(&other));
    }
}
