use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value as JsonValue;

use crate::query::{Query, QueryFilters};
use crate::relation::{Relation, RelationDecl};
use crate::{Cast, Value, naming};

pub(crate) const SOFT_DELETES_SCOPE: &str = "soft_deletes";

pub type Accessor = Arc<dyn Fn(&dyn Attributes) -> Value + Send + Sync>;
pub type LocalScope = Arc<dyn Fn(Query, &[Value]) -> Query + Send + Sync>;
pub type GlobalScope = Arc<dyn Fn(Query) -> Query + Send + Sync>;

/// Whether a registered type hydrates into read-only records or host-native mutable ones.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Family {
    ReadOnly,
    Native,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyType {
    Int,
    String,
    Uuid,
}

/// Read contract shared by read-only records, native records and accessors.
pub trait Attributes {
    /// Accessor value, else cast value, else raw value, else `Null`.
    fn get(&self, key: &str) -> Value;

    fn raw_attributes(&self) -> &IndexMap<String, Value>;

    fn get_raw(&self, key: &str) -> Value {
        self.raw_attributes()
            .get(key)
            .cloned()
            .unwrap_or(Value::Null)
    }

    fn has_attribute(&self, key: &str) -> bool {
        self.raw_attributes().contains_key(key)
    }
}

pub struct ModelBuilder {
    name: String,
    family: Family,
    table: Option<String>,
    primary_key: Option<String>,
    key_type: KeyType,
    connection: Option<String>,
    casts: IndexMap<String, Cast>,
    accessors: IndexMap<String, Accessor>,
    appends: Vec<String>,
    hidden: Vec<String>,
    scopes: IndexMap<String, LocalScope>,
    global_scopes: Vec<(String, GlobalScope)>,
    soft_delete_column: Option<String>,
    timestamps: bool,
    morph_class: Option<String>,
    relations: Vec<(String, RelationDecl)>,
}

impl ModelBuilder {
    pub fn read_only(name: impl Into<String>) -> Self {
        Self::new(name.into(), Family::ReadOnly)
    }

    pub fn native(name: impl Into<String>) -> Self {
        Self::new(name.into(), Family::Native)
    }

    fn new(name: String, family: Family) -> Self {
        Self {
            name,
            family,
            table: None,
            primary_key: Some("id".to_string()),
            key_type: KeyType::Int,
            connection: None,
            casts: IndexMap::new(),
            accessors: IndexMap::new(),
            appends: Vec::new(),
            hidden: Vec::new(),
            scopes: IndexMap::new(),
            global_scopes: Vec::new(),
            soft_delete_column: None,
            timestamps: false,
            morph_class: None,
            relations: Vec::new(),
        }
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn primary_key(mut self, key: impl Into<String>) -> Self {
        self.primary_key = Some(key.into());
        self
    }

    pub fn without_primary_key(mut self) -> Self {
        self.primary_key = None;
        self
    }

    pub fn key_type(mut self, key_type: KeyType) -> Self {
        self.key_type = key_type;
        self
    }

    pub fn connection(mut self, name: impl Into<String>) -> Self {
        self.connection = Some(name.into());
        self
    }

    pub fn cast(mut self, column: impl Into<String>, cast: Cast) -> Self {
        self.casts.insert(column.into(), cast);
        self
    }

    pub fn accessor<A>(mut self, name: impl Into<String>, accessor: A) -> Self
    where
        A: Fn(&dyn Attributes) -> Value + Send + Sync + 'static,
    {
        self.accessors.insert(name.into(), Arc::new(accessor));
        self
    }

    pub fn append(mut self, name: impl Into<String>) -> Self {
        self.appends.push(name.into());
        self
    }

    pub fn hidden<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.hidden.extend(columns.into_iter().map(Into::into));
        self
    }

    pub fn scope<S>(mut self, name: impl Into<String>, scope: S) -> Self
    where
        S: Fn(Query, &[Value]) -> Query + Send + Sync + 'static,
    {
        self.scopes.insert(name.into(), Arc::new(scope));
        self
    }

    pub fn global_scope<S>(mut self, name: impl Into<String>, scope: S) -> Self
    where
        S: Fn(Query) -> Query + Send + Sync + 'static,
    {
        self.global_scopes.push((name.into(), Arc::new(scope)));
        self
    }

    pub fn soft_deletes(self) -> Self {
        self.soft_deletes_column("deleted_at")
    }

    pub fn soft_deletes_column(mut self, column: impl Into<String>) -> Self {
        self.soft_delete_column = Some(column.into());
        self
    }

    pub fn timestamps(mut self) -> Self {
        self.timestamps = true;
        self
    }

    pub fn morph_alias(mut self, alias: impl Into<String>) -> Self {
        self.morph_class = Some(alias.into());
        self
    }

    pub fn relation(mut self, name: impl Into<String>, relation: RelationDecl) -> Self {
        self.relations.push((name.into(), relation));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Seals the metadata; relations are resolved separately by the registry.
    pub(crate) fn seal(self) -> (ModelDef, Vec<(String, RelationDecl)>) {
        let table = self
            .table
            .unwrap_or_else(|| naming::table_name(&self.name));
        let mut global_scopes = Vec::with_capacity(self.global_scopes.len() + 1);
        if let Some(column) = &self.soft_delete_column {
            let qualified = format!("{table}.{column}");
            let scope: GlobalScope =
                Arc::new(move |query: Query| query.where_null(qualified.clone()));
            global_scopes.push((SOFT_DELETES_SCOPE.to_string(), scope));
        }
        global_scopes.extend(self.global_scopes);
        let def = ModelDef {
            morph_class: self.morph_class.unwrap_or_else(|| self.name.clone()),
            name: self.name,
            family: self.family,
            table,
            primary_key: self.primary_key,
            key_type: self.key_type,
            connection: self.connection,
            casts: self.casts,
            accessors: self.accessors,
            appends: self.appends,
            hidden: self.hidden,
            scopes: self.scopes,
            global_scopes,
            soft_delete_column: self.soft_delete_column,
            timestamps: self.timestamps,
            relations: IndexMap::new(),
        };
        (def, self.relations)
    }
}

/// Sealed per-type metadata. Never mutated once the registry is built.
pub struct ModelDef {
    name: String,
    family: Family,
    table: String,
    primary_key: Option<String>,
    key_type: KeyType,
    connection: Option<String>,
    casts: IndexMap<String, Cast>,
    accessors: IndexMap<String, Accessor>,
    appends: Vec<String>,
    hidden: Vec<String>,
    scopes: IndexMap<String, LocalScope>,
    global_scopes: Vec<(String, GlobalScope)>,
    soft_delete_column: Option<String>,
    timestamps: bool,
    morph_class: String,
    pub(crate) relations: IndexMap<String, Relation>,
}

impl fmt::Debug for ModelDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelDef")
            .field("name", &self.name)
            .field("family", &self.family)
            .field("table", &self.table)
            .field("primary_key", &self.primary_key)
            .field("relations", &self.relations.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl ModelDef {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn primary_key(&self) -> Option<&str> {
        self.primary_key.as_deref()
    }

    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    pub fn connection(&self) -> Option<&str> {
        self.connection.as_deref()
    }

    pub fn cast(&self, column: &str) -> Option<&Cast> {
        self.casts.get(column)
    }

    pub fn casts(&self) -> &IndexMap<String, Cast> {
        &self.casts
    }

    pub fn accessor(&self, name: &str) -> Option<&Accessor> {
        self.accessors.get(name)
    }

    pub fn appends(&self) -> &[String] {
        &self.appends
    }

    pub fn is_hidden(&self, column: &str) -> bool {
        self.hidden.iter().any(|hidden| hidden == column)
    }

    pub fn has_named_scope(&self, name: &str) -> bool {
        self.scopes.contains_key(name)
    }

    pub(crate) fn local_scope(&self, name: &str) -> Option<&LocalScope> {
        self.scopes.get(name)
    }

    pub(crate) fn global_scopes(&self) -> &[(String, GlobalScope)] {
        &self.global_scopes
    }

    pub fn global_scope_names(&self) -> Vec<&str> {
        self.global_scopes
            .iter()
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn soft_delete_column(&self) -> Option<&str> {
        self.soft_delete_column.as_deref()
    }

    pub fn uses_timestamps(&self) -> bool {
        self.timestamps
    }

    pub fn morph_class(&self) -> &str {
        &self.morph_class
    }

    pub fn relation(&self, name: &str) -> Option<&Relation> {
        self.relations.get(name)
    }

    pub fn relation_names(&self) -> impl Iterator<Item = &str> {
        self.relations.keys().map(String::as_str)
    }

    /// `table.column`, unless the column is already qualified.
    pub fn qualify(&self, column: &str) -> String {
        if column.contains('.') {
            column.to_string()
        } else {
            format!("{}.{column}", self.table)
        }
    }

    /// Foreign key other types use to point at this one (`User` -> `user_id`).
    pub fn foreign_key(&self) -> String {
        naming::foreign_key(&self.name, self.primary_key().unwrap_or("id"))
    }
}

/// Serialized attribute form shared by read-only and native records: accessor value
/// when declared, else cast, else raw; hidden columns removed; appends merged.
pub(crate) fn serialize_attributes(
    def: &ModelDef,
    record: &dyn Attributes,
) -> IndexMap<String, JsonValue> {
    let mut out = IndexMap::new();
    for key in record.raw_attributes().keys() {
        if def.is_hidden(key) {
            continue;
        }
        out.insert(key.clone(), record.get(key).to_json());
    }
    for name in def.appends() {
        if def.is_hidden(name) {
            continue;
        }
        out.insert(name.clone(), record.get(name).to_json());
    }
    out
}

/// Attribute lookup shared by both record families.
pub(crate) fn resolve_attribute(
    def: &ModelDef,
    record: &dyn Attributes,
    casts: &IndexMap<String, Value>,
    key: &str,
) -> Value {
    if let Some(accessor) = def.accessor(key) {
        return accessor(record);
    }
    if let Some(value) = casts.get(key) {
        return value.clone();
    }
    record.get_raw(key)
}

/// Applies every declared cast to the raw attributes. Failed casts become `Null`.
pub(crate) fn cast_attributes(
    def: &ModelDef,
    raw: &IndexMap<String, Value>,
) -> IndexMap<String, Value> {
    let mut out = IndexMap::with_capacity(def.casts().len());
    for (column, cast) in def.casts() {
        let Some(value) = raw.get(column) else {
            continue;
        };
        let cast_value = match cast.apply(column, value, raw) {
            Ok(value) => value,
            Err(err) => {
                log::warn!("cast failed for {}.{column}: {err}", def.name());
                Value::Null
            }
        };
        out.insert(column.clone(), cast_value);
    }
    out
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;

    use super::{
        Attributes, ModelBuilder, ModelDef, cast_attributes, resolve_attribute,
        serialize_attributes,
    };
    use crate::{Cast, Value};

    struct Row<'a>(&'a ModelDef, IndexMap<String, Value>);

    impl Attributes for Row<'_> {
        fn get(&self, key: &str) -> Value {
            resolve_attribute(self.0, self, &IndexMap::new(), key)
        }

        fn raw_attributes(&self) -> &IndexMap<String, Value> {
            &self.1
        }
    }

    #[test]
    fn sealing_derives_table_and_soft_delete_scope() {
        let (def, relations) = ModelBuilder::read_only("AuditLog")
            .soft_deletes()
            .global_scope("recent", |query| query)
            .seal();
        assert_eq!(def.table(), "audit_logs");
        assert_eq!(def.primary_key(), Some("id"));
        assert_eq!(def.foreign_key(), "audit_log_id");
        assert_eq!(def.morph_class(), "AuditLog");
        assert_eq!(def.global_scope_names(), vec!["soft_deletes", "recent"]);
        assert_eq!(def.qualify("name"), "audit_logs.name");
        assert_eq!(def.qualify("users.name"), "users.name");
        assert!(relations.is_empty());
    }

    #[test]
    fn keyless_types_keep_no_primary_key() {
        let (def, _) = ModelBuilder::read_only("Metric")
            .table("metrics_view")
            .without_primary_key()
            .seal();
        assert_eq!(def.primary_key(), None);
        assert_eq!(def.foreign_key(), "metric_id");
        assert_eq!(def.table(), "metrics_view");
    }

    #[test]
    fn failed_casts_degrade_to_null() {
        let (def, _) = ModelBuilder::read_only("User")
            .cast("settings", Cast::Json)
            .cast("age", Cast::Integer)
            .seal();
        let raw: IndexMap<String, Value> = [
            ("settings".to_string(), Value::from("{broken")),
            ("age".to_string(), Value::from("41")),
        ]
        .into_iter()
        .collect();
        let casts = cast_attributes(&def, &raw);
        assert_eq!(casts.get("settings"), Some(&Value::Null));
        assert_eq!(casts.get("age"), Some(&Value::Int(41)));
    }

    #[test]
    fn serialization_hides_and_appends() {
        let (def, _) = ModelBuilder::read_only("User")
            .hidden(["password"])
            .accessor("initial", |row| {
                Value::from(row.get("name").to_string().chars().take(1).collect::<String>())
            })
            .append("initial")
            .seal();
        let row = Row(
            &def,
            [
                ("name".to_string(), Value::from("Ada")),
                ("password".to_string(), Value::from("secret")),
            ]
            .into_iter()
            .collect(),
        );
        let out = serialize_attributes(&def, &row);
        assert_eq!(out.keys().collect::<Vec<_>>(), vec!["name", "initial"]);
        assert_eq!(out["initial"], serde_json::json!("A"));
    }
}
