use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Serialize, Serializer};
use serde_json::Value as JsonValue;
use time::OffsetDateTime;

use crate::builder::{Native, QueryBuilder};
use crate::eager::{self, EagerTree};
use crate::model::{cast_attributes, resolve_attribute, serialize_attributes};
use crate::query::QueryFilters;
use crate::record::object;
use crate::relation::{RelationKind, RelationQuery};
use crate::{
    Attributes, ModelDef, Pivot, Record, Related, TheoriaError, TheoriaResult, TheoriaStore,
    Value, naming,
};

/// Host-native mutable record: dirty tracking, persistence and a replaceable
/// relation cache. Relations to native types hand these back untouched.
#[derive(Clone)]
pub struct NativeRecord {
    def: Arc<ModelDef>,
    store: TheoriaStore,
    attributes: IndexMap<String, Value>,
    original: IndexMap<String, Value>,
    exists: bool,
    relations: IndexMap<String, Related>,
    pivot: Option<Pivot>,
}

impl NativeRecord {
    pub(crate) fn hydrate(
        def: Arc<ModelDef>,
        store: TheoriaStore,
        raw: IndexMap<String, Value>,
        pivot: Option<Pivot>,
    ) -> Self {
        Self {
            def,
            store,
            original: raw.clone(),
            attributes: raw,
            exists: true,
            relations: IndexMap::new(),
            pivot,
        }
    }

    /// New, unsaved record.
    pub fn make(
        def: Arc<ModelDef>,
        store: TheoriaStore,
        attributes: IndexMap<String, Value>,
    ) -> Self {
        Self {
            def,
            store,
            attributes,
            original: IndexMap::new(),
            exists: false,
            relations: IndexMap::new(),
            pivot: None,
        }
    }

    pub fn def(&self) -> &Arc<ModelDef> {
        &self.def
    }

    pub fn model_name(&self) -> &str {
        self.def.name()
    }

    pub fn exists(&self) -> bool {
        self.exists
    }

    pub fn get_key(&self) -> Value {
        match self.def.primary_key() {
            Some(key) => self.get_raw(key),
            None => Value::Null,
        }
    }

    pub fn get_attributes(&self) -> &IndexMap<String, Value> {
        &self.attributes
    }

    pub fn get_original(&self) -> &IndexMap<String, Value> {
        &self.original
    }

    pub fn pivot(&self) -> Option<&Pivot> {
        self.pivot.as_ref()
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) -> &mut Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    pub fn unset(&mut self, key: &str) -> &mut Self {
        self.attributes.shift_remove(key);
        self
    }

    pub fn fill(&mut self, values: IndexMap<String, Value>) -> &mut Self {
        self.attributes.extend(values);
        self
    }

    pub fn is_dirty(&self) -> bool {
        !self.get_dirty().is_empty()
    }

    /// Attributes that differ from the last persisted state.
    pub fn get_dirty(&self) -> IndexMap<String, Value> {
        self.attributes
            .iter()
            .filter(|(key, value)| self.original.get(*key) != Some(*value))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    fn key_query(&self) -> TheoriaResult<QueryBuilder<Native>> {
        let key = self.def.primary_key().ok_or_else(|| {
            TheoriaError::configuration(format!(
                "model [{}] has no primary key",
                self.def.name()
            ))
        })?;
        let value = self
            .original
            .get(key)
            .cloned()
            .unwrap_or_else(|| self.get_raw(key));
        Ok(QueryBuilder::new(self.store.clone(), Arc::clone(&self.def))
            .without_global_scopes()
            .where_eq(self.def.qualify(key), value))
    }

    fn touch_timestamps(&mut self) {
        if !self.def.uses_timestamps() {
            return;
        }
        let now = Value::DateTime(OffsetDateTime::now_utc());
        if !self.exists && !self.attributes.contains_key("created_at") {
            self.attributes.insert("created_at".to_string(), now.clone());
        }
        self.attributes.insert("updated_at".to_string(), now);
    }

    /// Inserts a new record or updates the dirty attributes of an existing one.
    pub async fn save(&mut self) -> TheoriaResult<()> {
        if self.exists {
            if !self.is_dirty() {
                return Ok(());
            }
            self.touch_timestamps();
            let dirty = self.get_dirty();
            self.key_query()?.update(dirty).await?;
        } else {
            self.touch_timestamps();
            let builder = QueryBuilder::<Native>::new(self.store.clone(), Arc::clone(&self.def));
            match self.def.primary_key() {
                Some(key) => {
                    let id = builder.insert_get_id(self.attributes.clone()).await?;
                    self.attributes.insert(key.to_string(), id);
                }
                None => {
                    builder.insert(vec![self.attributes.clone()]).await?;
                }
            }
            self.exists = true;
        }
        log::debug!("saved {} {}", self.def.name(), self.get_key());
        self.original = self.attributes.clone();
        Ok(())
    }

    pub async fn update(&mut self, values: IndexMap<String, Value>) -> TheoriaResult<()> {
        self.fill(values);
        self.save().await
    }

    /// Deletes the row, softly when the type declares soft deletes.
    pub async fn delete(&mut self) -> TheoriaResult<bool> {
        if !self.exists {
            return Ok(false);
        }
        let affected = self.key_query()?.delete().await?;
        match self.def.soft_delete_column() {
            Some(column) => {
                let column = column.to_string();
                self.set(&column, Value::DateTime(OffsetDateTime::now_utc()));
                self.original = self.attributes.clone();
            }
            None => self.exists = false,
        }
        Ok(affected > 0)
    }

    pub async fn force_delete(&mut self) -> TheoriaResult<bool> {
        if !self.exists {
            return Ok(false);
        }
        let affected = self.key_query()?.force_delete().await?;
        self.exists = false;
        Ok(affected > 0)
    }

    pub async fn restore(&mut self) -> TheoriaResult<bool> {
        let Some(column) = self.def.soft_delete_column().map(str::to_string) else {
            return Ok(false);
        };
        let affected = self.key_query()?.restore().await?;
        self.set(&column, Value::Null);
        self.original = self.attributes.clone();
        Ok(affected > 0)
    }

    pub async fn increment(&mut self, column: &str, amount: i64) -> TheoriaResult<()> {
        self.key_query()?.increment(column, amount).await?;
        let current = self.get_raw(column).as_i64().unwrap_or(0);
        self.set(column, current + amount);
        self.original.insert(column.to_string(), Value::Int(current + amount));
        Ok(())
    }

    pub async fn decrement(&mut self, column: &str, amount: i64) -> TheoriaResult<()> {
        self.increment(column, -amount).await
    }

    pub fn relation_loaded(&self, name: &str) -> bool {
        self.relations.contains_key(name)
    }

    pub fn get_relation(&self, name: &str) -> TheoriaResult<Related> {
        self.relations
            .get(name)
            .cloned()
            .ok_or_else(|| TheoriaError::relation_not_loaded(self.model_name(), name))
    }

    pub fn get_relations(&self) -> &IndexMap<String, Related> {
        &self.relations
    }

    /// Native relation cache: values may be replaced.
    pub fn set_relation(&mut self, name: &str, related: Related) -> &mut Self {
        self.relations.insert(name.to_string(), related);
        self
    }

    pub fn unset_relation(&mut self, name: &str) -> &mut Self {
        self.relations.shift_remove(name);
        self
    }

    /// Loaded value, else queried and cached.
    pub async fn relation(&mut self, name: &str) -> TheoriaResult<Related> {
        if let Some(related) = self.relations.get(name) {
            return Ok(related.clone());
        }
        let related = self.relation_query(name)?.get().await?;
        self.relations.insert(name.to_string(), related.clone());
        Ok(related)
    }

    pub fn relation_query(&self, name: &str) -> TheoriaResult<RelationQuery> {
        let relation = self
            .def
            .relation(name)
            .ok_or_else(|| TheoriaError::undefined_relation(self.model_name(), name))?;
        RelationQuery::for_native(self.store.clone(), relation.clone(), self.clone())
    }

    pub async fn load<I, S>(&mut self, paths: I) -> TheoriaResult<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let tree = EagerTree::parse(paths);
        let store = self.store.clone();
        let def = Arc::clone(&self.def);
        eager::load::<Native>(&store, &def, std::slice::from_mut(self), &tree).await
    }

    /// Points a belongs-to or morph-to relation at `target` without saving.
    pub fn associate(&mut self, name: &str, target: &NativeRecord) -> TheoriaResult<&mut Self> {
        let relation = self
            .def
            .relation(name)
            .cloned()
            .ok_or_else(|| TheoriaError::undefined_relation(self.model_name(), name))?;
        match relation.kind() {
            RelationKind::BelongsTo {
                foreign_key,
                owner_key,
            } => {
                self.set(foreign_key, target.get_raw(owner_key));
            }
            RelationKind::MorphTo {
                morph_type,
                foreign_key,
                owner_key,
            } => {
                let key = owner_key
                    .as_deref()
                    .or(target.def().primary_key())
                    .unwrap_or("id");
                self.set(foreign_key, target.get_raw(key));
                self.set(morph_type, target.def().morph_class());
            }
            _ => {
                return Err(TheoriaError::invalid(format!(
                    "relation [{name}] on [{}] does not support [associate]",
                    self.model_name()
                )));
            }
        }
        self.relations
            .insert(name.to_string(), Related::NativeOne(Some(target.clone())));
        Ok(self)
    }

    /// Read-only records can never become the parent of a native record.
    pub fn associate_record(&mut self, _name: &str, target: &Record) -> TheoriaResult<Infallible> {
        Err(TheoriaError::cannot_call(target.model_name(), "associate"))
    }

    pub fn dissociate(&mut self, name: &str) -> TheoriaResult<&mut Self> {
        let relation = self
            .def
            .relation(name)
            .cloned()
            .ok_or_else(|| TheoriaError::undefined_relation(self.model_name(), name))?;
        match relation.kind() {
            RelationKind::BelongsTo { foreign_key, .. } => {
                self.set(foreign_key, Value::Null);
            }
            RelationKind::MorphTo {
                morph_type,
                foreign_key,
                ..
            } => {
                self.set(foreign_key, Value::Null);
                self.set(morph_type, Value::Null);
            }
            _ => {
                return Err(TheoriaError::invalid(format!(
                    "relation [{name}] on [{}] does not support [dissociate]",
                    self.model_name()
                )));
            }
        }
        self.relations
            .insert(name.to_string(), Related::NativeOne(None));
        Ok(self)
    }

    pub fn to_array(&self) -> IndexMap<String, JsonValue> {
        let mut out = serialize_attributes(&self.def, self);
        for (name, related) in &self.relations {
            if self.def.is_hidden(name) {
                continue;
            }
            out.insert(naming::snake(name), related.to_json_value());
        }
        if let Some(pivot) = &self.pivot {
            if !self.def.is_hidden("pivot") {
                out.insert("pivot".to_string(), object(pivot.to_array()));
            }
        }
        out
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.to_array()).unwrap_or_default()
    }
}

impl Attributes for NativeRecord {
    fn get(&self, key: &str) -> Value {
        let casts = cast_attributes(&self.def, &self.attributes);
        resolve_attribute(&self.def, self, &casts, key)
    }

    fn raw_attributes(&self) -> &IndexMap<String, Value> {
        &self.attributes
    }
}

impl Serialize for NativeRecord {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_array().serialize(serializer)
    }
}

impl fmt::Debug for NativeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeRecord")
            .field("model", &self.def.name())
            .field("exists", &self.exists)
            .field("attributes", &self.attributes)
            .field("relations", &self.relations.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
