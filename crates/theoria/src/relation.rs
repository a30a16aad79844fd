use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use indexmap::IndexMap;
use sea_orm::sea_query::{Expr, ExprTrait, Query as SeaQuery};
use time::OffsetDateTime;

use crate::builder::{MatchKey, Native, QueryBuilder, ReadOnly, RecordFamily, RelationJoin};
use crate::pagination::LengthAwarePage;
use crate::query::{QueryFilters, alias};
use crate::store::decode_row;
use crate::{
    Attributes, Collection, Family, ModelDef, NativeRecord, Query, Record, Related, TheoriaError,
    TheoriaResult, TheoriaStore, Value, naming,
};

/// Link-table layout of a many-to-many relation.
#[derive(Clone, Debug, PartialEq)]
pub struct PivotSpec {
    pub table: String,
    pub foreign_pivot_key: String,
    pub related_pivot_key: String,
    pub parent_key: String,
    pub related_key: String,
    pub columns: Vec<String>,
    pub timestamps: bool,
    /// Discriminator column and the value this relation writes and filters on.
    pub morph: Option<(String, String)>,
}

impl PivotSpec {
    fn selected_columns(&self) -> Vec<String> {
        let mut columns = vec![
            self.foreign_pivot_key.clone(),
            self.related_pivot_key.clone(),
        ];
        if let Some((morph_type, _)) = &self.morph {
            columns.push(morph_type.clone());
        }
        columns.extend(self.columns.iter().cloned());
        if self.timestamps {
            columns.push("created_at".to_string());
            columns.push("updated_at".to_string());
        }
        let mut seen = Vec::with_capacity(columns.len());
        columns.retain(|column| {
            if seen.contains(column) {
                false
            } else {
                seen.push(column.clone());
                true
            }
        });
        columns
    }
}

/// Intermediate type of a has-one/has-many-through relation.
#[derive(Clone, Debug, PartialEq)]
pub struct ThroughSpec {
    pub through: String,
    pub table: String,
    pub soft_delete_column: Option<String>,
    pub first_key: String,
    pub second_key: String,
    pub local_key: String,
    pub second_local_key: String,
    /// Keep rows whose intermediate parent is soft-deleted.
    pub include_trashed: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum RelationKind {
    BelongsTo {
        foreign_key: String,
        owner_key: String,
    },
    HasOne {
        foreign_key: String,
        local_key: String,
    },
    HasMany {
        foreign_key: String,
        local_key: String,
    },
    BelongsToMany(PivotSpec),
    HasOneThrough(ThroughSpec),
    HasManyThrough(ThroughSpec),
    MorphTo {
        morph_type: String,
        foreign_key: String,
        owner_key: Option<String>,
    },
    MorphOne {
        morph_type: String,
        morph_class: String,
        foreign_key: String,
        local_key: String,
    },
    MorphMany {
        morph_type: String,
        morph_class: String,
        foreign_key: String,
        local_key: String,
    },
    MorphToMany(PivotSpec),
    MorphedByMany(PivotSpec),
}

/// Relation descriptor, sealed when the registry is built.
#[derive(Clone, Debug)]
pub struct Relation {
    name: String,
    owner: String,
    target: Option<String>,
    target_family: Option<Family>,
    kind: RelationKind,
}

impl Relation {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Target type name; `None` for `MorphTo`, which resolves per row.
    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub fn target_family(&self) -> Option<Family> {
        self.target_family
    }

    pub fn kind(&self) -> &RelationKind {
        &self.kind
    }

    pub fn is_to_many(&self) -> bool {
        matches!(
            self.kind,
            RelationKind::HasMany { .. }
                | RelationKind::BelongsToMany(_)
                | RelationKind::HasManyThrough(_)
                | RelationKind::MorphMany { .. }
                | RelationKind::MorphToMany(_)
                | RelationKind::MorphedByMany(_)
        )
    }

    pub fn pivot(&self) -> Option<&PivotSpec> {
        match &self.kind {
            RelationKind::BelongsToMany(spec)
            | RelationKind::MorphToMany(spec)
            | RelationKind::MorphedByMany(spec) => Some(spec),
            _ => None,
        }
    }

    /// Owner column whose value selects the related rows.
    pub(crate) fn owner_key(&self) -> &str {
        match &self.kind {
            RelationKind::BelongsTo { foreign_key, .. }
            | RelationKind::MorphTo { foreign_key, .. } => foreign_key,
            RelationKind::HasOne { local_key, .. }
            | RelationKind::HasMany { local_key, .. }
            | RelationKind::MorphOne { local_key, .. }
            | RelationKind::MorphMany { local_key, .. } => local_key,
            RelationKind::BelongsToMany(spec)
            | RelationKind::MorphToMany(spec)
            | RelationKind::MorphedByMany(spec) => &spec.parent_key,
            RelationKind::HasOneThrough(spec) | RelationKind::HasManyThrough(spec) => {
                &spec.local_key
            }
        }
    }

    /// Where a fetched related row carries the owner key it belongs to.
    pub(crate) fn match_key(&self, target: &ModelDef) -> MatchKey {
        match &self.kind {
            RelationKind::BelongsTo { owner_key, .. } => MatchKey::Attribute(owner_key.clone()),
            RelationKind::MorphTo { owner_key, .. } => MatchKey::Attribute(
                owner_key
                    .clone()
                    .or_else(|| target.primary_key().map(str::to_string))
                    .unwrap_or_else(|| "id".to_string()),
            ),
            RelationKind::HasOne { foreign_key, .. }
            | RelationKind::HasMany { foreign_key, .. }
            | RelationKind::MorphOne { foreign_key, .. }
            | RelationKind::MorphMany { foreign_key, .. } => {
                MatchKey::Attribute(foreign_key.clone())
            }
            RelationKind::BelongsToMany(spec)
            | RelationKind::MorphToMany(spec)
            | RelationKind::MorphedByMany(spec) => MatchKey::Pivot(spec.foreign_pivot_key.clone()),
            RelationKind::HasOneThrough(_) | RelationKind::HasManyThrough(_) => MatchKey::Through,
        }
    }

    /// Restricts a target builder to the rows related to the given owner keys.
    /// A single owner uses `=` plus the not-null guard; batches use `IN`.
    pub(crate) fn constrain<F: RecordFamily>(
        &self,
        builder: QueryBuilder<F>,
        keys: Vec<Value>,
        single: bool,
    ) -> QueryBuilder<F> {
        let target = Arc::clone(builder.def());
        let filter = |builder: QueryBuilder<F>, column: String| {
            if single {
                let key = keys.first().cloned().unwrap_or(Value::Null);
                builder.where_eq(column, key)
            } else {
                builder.where_in(column, keys.clone())
            }
        };
        match &self.kind {
            RelationKind::BelongsTo { owner_key, .. } => {
                filter(builder, target.qualify(owner_key))
            }
            RelationKind::MorphTo { owner_key, .. } => {
                let key = owner_key
                    .as_deref()
                    .or(target.primary_key())
                    .unwrap_or("id");
                filter(builder, target.qualify(key))
            }
            RelationKind::HasOne { foreign_key, .. }
            | RelationKind::HasMany { foreign_key, .. } => {
                let column = target.qualify(foreign_key);
                let builder = filter(builder, column.clone());
                if single {
                    builder.where_not_null(column)
                } else {
                    builder
                }
            }
            RelationKind::MorphOne {
                morph_type,
                morph_class,
                foreign_key,
                ..
            }
            | RelationKind::MorphMany {
                morph_type,
                morph_class,
                foreign_key,
                ..
            } => {
                let column = target.qualify(foreign_key);
                let builder = filter(builder, column.clone())
                    .where_eq(target.qualify(morph_type), morph_class.clone());
                if single {
                    builder.where_not_null(column)
                } else {
                    builder
                }
            }
            RelationKind::BelongsToMany(spec)
            | RelationKind::MorphToMany(spec)
            | RelationKind::MorphedByMany(spec) => {
                let builder = builder.set_join(RelationJoin::Pivot {
                    table: spec.table.clone(),
                    related_pivot_key: spec.related_pivot_key.clone(),
                    related_key: spec.related_key.clone(),
                    columns: spec.selected_columns(),
                });
                let builder = filter(
                    builder,
                    format!("{}.{}", spec.table, spec.foreign_pivot_key),
                );
                match &spec.morph {
                    Some((morph_type, class)) => builder
                        .where_eq(format!("{}.{morph_type}", spec.table), class.clone()),
                    None => builder,
                }
            }
            RelationKind::HasOneThrough(spec) | RelationKind::HasManyThrough(spec) => {
                let builder = builder.set_join(RelationJoin::Through {
                    table: spec.table.clone(),
                    first_key: spec.first_key.clone(),
                    second_key: spec.second_key.clone(),
                    second_local_key: spec.second_local_key.clone(),
                    soft_delete_column: spec.soft_delete_column.clone(),
                    include_trashed: spec.include_trashed,
                });
                filter(builder, format!("{}.{}", spec.table, spec.first_key))
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Shape {
    BelongsTo,
    HasOne,
    HasMany,
    BelongsToMany,
    HasOneThrough,
    HasManyThrough,
    MorphTo,
    MorphOne,
    MorphMany,
    MorphToMany,
    MorphedByMany,
}

/// Relation declaration. Keys left unset take the host's naming defaults.
#[derive(Clone, Debug)]
pub struct RelationDecl {
    shape: Shape,
    target: Option<String>,
    through: Option<String>,
    morph_name: Option<String>,
    foreign_key: Option<String>,
    owner_key: Option<String>,
    local_key: Option<String>,
    table: Option<String>,
    related_pivot_key: Option<String>,
    related_key: Option<String>,
    second_key: Option<String>,
    second_local_key: Option<String>,
    morph_type: Option<String>,
    pivot_columns: Vec<String>,
    pivot_timestamps: bool,
    with_trashed_parents: bool,
}

impl RelationDecl {
    fn new(shape: Shape, target: Option<String>) -> Self {
        Self {
            shape,
            target,
            through: None,
            morph_name: None,
            foreign_key: None,
            owner_key: None,
            local_key: None,
            table: None,
            related_pivot_key: None,
            related_key: None,
            second_key: None,
            second_local_key: None,
            morph_type: None,
            pivot_columns: Vec::new(),
            pivot_timestamps: false,
            with_trashed_parents: false,
        }
    }

    pub fn belongs_to(target: impl Into<String>) -> Self {
        Self::new(Shape::BelongsTo, Some(target.into()))
    }

    pub fn has_one(target: impl Into<String>) -> Self {
        Self::new(Shape::HasOne, Some(target.into()))
    }

    pub fn has_many(target: impl Into<String>) -> Self {
        Self::new(Shape::HasMany, Some(target.into()))
    }

    pub fn belongs_to_many(target: impl Into<String>) -> Self {
        Self::new(Shape::BelongsToMany, Some(target.into()))
    }

    pub fn has_one_through(target: impl Into<String>, through: impl Into<String>) -> Self {
        let mut decl = Self::new(Shape::HasOneThrough, Some(target.into()));
        decl.through = Some(through.into());
        decl
    }

    pub fn has_many_through(target: impl Into<String>, through: impl Into<String>) -> Self {
        let mut decl = Self::new(Shape::HasManyThrough, Some(target.into()));
        decl.through = Some(through.into());
        decl
    }

    /// Polymorphic parent; columns default to `{relation}_type` / `{relation}_id`.
    pub fn morph_to() -> Self {
        Self::new(Shape::MorphTo, None)
    }

    pub fn morph_one(target: impl Into<String>, name: impl Into<String>) -> Self {
        let mut decl = Self::new(Shape::MorphOne, Some(target.into()));
        decl.morph_name = Some(name.into());
        decl
    }

    pub fn morph_many(target: impl Into<String>, name: impl Into<String>) -> Self {
        let mut decl = Self::new(Shape::MorphMany, Some(target.into()));
        decl.morph_name = Some(name.into());
        decl
    }

    pub fn morph_to_many(target: impl Into<String>, name: impl Into<String>) -> Self {
        let mut decl = Self::new(Shape::MorphToMany, Some(target.into()));
        decl.morph_name = Some(name.into());
        decl
    }

    pub fn morphed_by_many(target: impl Into<String>, name: impl Into<String>) -> Self {
        let mut decl = Self::new(Shape::MorphedByMany, Some(target.into()));
        decl.morph_name = Some(name.into());
        decl
    }

    /// Foreign key column; on many-to-many relations, the owner's pivot key.
    pub fn foreign_key(mut self, column: impl Into<String>) -> Self {
        self.foreign_key = Some(column.into());
        self
    }

    pub fn owner_key(mut self, column: impl Into<String>) -> Self {
        self.owner_key = Some(column.into());
        self
    }

    /// Owner column matched by the relation (`parent_key` on many-to-many,
    /// first local key on through relations).
    pub fn local_key(mut self, column: impl Into<String>) -> Self {
        self.local_key = Some(column.into());
        self
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn related_pivot_key(mut self, column: impl Into<String>) -> Self {
        self.related_pivot_key = Some(column.into());
        self
    }

    pub fn related_key(mut self, column: impl Into<String>) -> Self {
        self.related_key = Some(column.into());
        self
    }

    pub fn second_key(mut self, column: impl Into<String>) -> Self {
        self.second_key = Some(column.into());
        self
    }

    pub fn second_local_key(mut self, column: impl Into<String>) -> Self {
        self.second_local_key = Some(column.into());
        self
    }

    pub fn morph_type(mut self, column: impl Into<String>) -> Self {
        self.morph_type = Some(column.into());
        self
    }

    pub fn with_pivot<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pivot_columns.extend(columns.into_iter().map(Into::into));
        self
    }

    pub fn with_timestamps(mut self) -> Self {
        self.pivot_timestamps = true;
        self
    }

    /// Through relations only: include rows reached via soft-deleted intermediates.
    pub fn with_trashed_parents(mut self) -> Self {
        self.with_trashed_parents = true;
        self
    }

    pub(crate) fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub(crate) fn through(&self) -> Option<&str> {
        self.through.as_deref()
    }

    /// Fills in default keys from the owner, target and intermediate metadata.
    pub(crate) fn resolve(
        self,
        name: &str,
        owner: &ModelDef,
        target: Option<&ModelDef>,
        through: Option<&ModelDef>,
    ) -> TheoriaResult<Relation> {
        let missing = |what: &str| {
            TheoriaError::configuration(format!(
                "relation [{name}] on [{}] needs {what}",
                owner.name()
            ))
        };
        let owner_pk = || {
            owner
                .primary_key()
                .map(str::to_string)
                .ok_or_else(|| missing("a local key (owner has no primary key)"))
        };
        let target_pk = |target: &ModelDef| {
            target
                .primary_key()
                .map(str::to_string)
                .ok_or_else(|| missing("an owner key (target has no primary key)"))
        };
        let morph_name = self.morph_name.clone().unwrap_or_else(|| name.to_string());
        let kind = match self.shape {
            Shape::BelongsTo => {
                let target = target.ok_or_else(|| missing("a target type"))?;
                let owner_key = match self.owner_key {
                    Some(key) => key,
                    None => target_pk(target)?,
                };
                RelationKind::BelongsTo {
                    foreign_key: self
                        .foreign_key
                        .unwrap_or_else(|| format!("{}_{owner_key}", naming::snake(name))),
                    owner_key,
                }
            }
            Shape::HasOne | Shape::HasMany => {
                let foreign_key = self.foreign_key.unwrap_or_else(|| owner.foreign_key());
                let local_key = match self.local_key {
                    Some(key) => key,
                    None => owner_pk()?,
                };
                if self.shape == Shape::HasOne {
                    RelationKind::HasOne {
                        foreign_key,
                        local_key,
                    }
                } else {
                    RelationKind::HasMany {
                        foreign_key,
                        local_key,
                    }
                }
            }
            Shape::BelongsToMany | Shape::MorphToMany | Shape::MorphedByMany => {
                let target = target.ok_or_else(|| missing("a target type"))?;
                let morph_type = self
                    .morph_type
                    .clone()
                    .unwrap_or_else(|| format!("{morph_name}_type"));
                let morph_id = format!("{morph_name}_id");
                let (table, foreign_pivot_key, related_pivot_key, morph) = match self.shape {
                    Shape::BelongsToMany => (
                        naming::joining_table(owner.name(), target.name()),
                        owner.foreign_key(),
                        target.foreign_key(),
                        None,
                    ),
                    Shape::MorphToMany => (
                        naming::plural(&morph_name),
                        morph_id,
                        target.foreign_key(),
                        Some((morph_type, owner.morph_class().to_string())),
                    ),
                    _ => (
                        naming::plural(&morph_name),
                        owner.foreign_key(),
                        morph_id,
                        Some((morph_type, target.morph_class().to_string())),
                    ),
                };
                let spec = PivotSpec {
                    table: self.table.unwrap_or(table),
                    foreign_pivot_key: self.foreign_key.unwrap_or(foreign_pivot_key),
                    related_pivot_key: self.related_pivot_key.unwrap_or(related_pivot_key),
                    parent_key: match self.local_key {
                        Some(key) => key,
                        None => owner_pk()?,
                    },
                    related_key: match self.related_key {
                        Some(key) => key,
                        None => target_pk(target)?,
                    },
                    columns: self.pivot_columns,
                    timestamps: self.pivot_timestamps,
                    morph,
                };
                match self.shape {
                    Shape::BelongsToMany => RelationKind::BelongsToMany(spec),
                    Shape::MorphToMany => RelationKind::MorphToMany(spec),
                    _ => RelationKind::MorphedByMany(spec),
                }
            }
            Shape::HasOneThrough | Shape::HasManyThrough => {
                let through = through.ok_or_else(|| missing("an intermediate type"))?;
                let spec = ThroughSpec {
                    through: through.name().to_string(),
                    table: through.table().to_string(),
                    soft_delete_column: through.soft_delete_column().map(str::to_string),
                    first_key: self.foreign_key.unwrap_or_else(|| owner.foreign_key()),
                    second_key: self.second_key.unwrap_or_else(|| through.foreign_key()),
                    local_key: match self.local_key {
                        Some(key) => key,
                        None => owner_pk()?,
                    },
                    second_local_key: match self.second_local_key {
                        Some(key) => key,
                        None => through
                            .primary_key()
                            .map(str::to_string)
                            .ok_or_else(|| missing("a second local key"))?,
                    },
                    include_trashed: self.with_trashed_parents,
                };
                if self.shape == Shape::HasOneThrough {
                    RelationKind::HasOneThrough(spec)
                } else {
                    RelationKind::HasManyThrough(spec)
                }
            }
            Shape::MorphTo => RelationKind::MorphTo {
                morph_type: self
                    .morph_type
                    .unwrap_or_else(|| format!("{morph_name}_type")),
                foreign_key: self
                    .foreign_key
                    .unwrap_or_else(|| format!("{morph_name}_id")),
                owner_key: self.owner_key,
            },
            Shape::MorphOne | Shape::MorphMany => {
                let morph_type = self
                    .morph_type
                    .unwrap_or_else(|| format!("{morph_name}_type"));
                let morph_class = owner.morph_class().to_string();
                let foreign_key = self
                    .foreign_key
                    .unwrap_or_else(|| format!("{morph_name}_id"));
                let local_key = match self.local_key {
                    Some(key) => key,
                    None => owner_pk()?,
                };
                if self.shape == Shape::MorphOne {
                    RelationKind::MorphOne {
                        morph_type,
                        morph_class,
                        foreign_key,
                        local_key,
                    }
                } else {
                    RelationKind::MorphMany {
                        morph_type,
                        morph_class,
                        foreign_key,
                        local_key,
                    }
                }
            }
        };
        Ok(Relation {
            name: name.to_string(),
            owner: owner.name().to_string(),
            target: target.map(|def| def.name().to_string()),
            target_family: target.map(ModelDef::family),
            kind,
        })
    }
}

#[derive(Clone, Debug)]
enum Owner {
    ReadOnly(Record),
    Native(NativeRecord),
}

impl Owner {
    fn def(&self) -> &Arc<ModelDef> {
        match self {
            Owner::ReadOnly(record) => record.def(),
            Owner::Native(record) => record.def(),
        }
    }

    fn get_raw(&self, key: &str) -> Value {
        match self {
            Owner::ReadOnly(record) => record.get_raw(key),
            Owner::Native(record) => record.get_raw(key),
        }
    }
}

/// Target builder of a relation query, typed by the target's family.
#[derive(Clone, Debug)]
pub enum RelationBuilder {
    ReadOnly(QueryBuilder<ReadOnly>),
    Native(QueryBuilder<Native>),
}

macro_rules! on_builder {
    ($builder:expr, $inner:ident => $body:expr) => {
        match $builder {
            RelationBuilder::ReadOnly($inner) => $body,
            RelationBuilder::Native($inner) => $body,
        }
    };
}

/// Result of `sync`, `sync_without_detaching` and `toggle`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SyncChanges {
    pub attached: Vec<Value>,
    pub detached: Vec<Value>,
    pub updated: Vec<Value>,
}

/// A relation called as a method: a chainable query over the related rows, of the
/// target's family, plus the relation verbs.
#[derive(Clone, Debug)]
pub struct RelationQuery {
    store: TheoriaStore,
    relation: Relation,
    owner: Owner,
    builder: RelationBuilder,
    /// Owner key is null; results are empty without querying.
    null_key: bool,
}

impl QueryFilters for RelationQuery {
    fn query_mut(&mut self) -> &mut Query {
        on_builder!(&mut self.builder, builder => builder.query_mut())
    }
}

impl RelationQuery {
    pub(crate) fn for_record(
        store: TheoriaStore,
        relation: Relation,
        owner: Record,
    ) -> TheoriaResult<Self> {
        Self::build(store, relation, Owner::ReadOnly(owner))
    }

    pub(crate) fn for_native(
        store: TheoriaStore,
        relation: Relation,
        owner: NativeRecord,
    ) -> TheoriaResult<Self> {
        Self::build(store, relation, Owner::Native(owner))
    }

    fn build(store: TheoriaStore, relation: Relation, owner: Owner) -> TheoriaResult<Self> {
        let key = owner.get_raw(relation.owner_key());
        let (target, null_key) = match &relation.kind {
            RelationKind::MorphTo { morph_type, .. } => match owner.get_raw(morph_type) {
                Value::Null => (Arc::clone(owner.def()), true),
                class => (store.registry().morph_def(&class.to_string())?, key.is_null()),
            },
            _ => {
                let name = relation.target().unwrap_or_default();
                (store.registry().def(name)?, key.is_null())
            }
        };
        let builder = match target.family() {
            Family::ReadOnly => RelationBuilder::ReadOnly(relation.constrain(
                QueryBuilder::new(store.clone(), target),
                vec![key],
                true,
            )),
            Family::Native => RelationBuilder::Native(relation.constrain(
                QueryBuilder::new(store.clone(), target),
                vec![key],
                true,
            )),
        };
        Ok(Self {
            store,
            relation,
            owner,
            builder,
            null_key,
        })
    }

    pub fn relation(&self) -> &Relation {
        &self.relation
    }

    /// Family of the type this query hydrates.
    pub fn family(&self) -> Family {
        match self.builder {
            RelationBuilder::ReadOnly(_) => Family::ReadOnly,
            RelationBuilder::Native(_) => Family::Native,
        }
    }

    pub fn builder(&self) -> &RelationBuilder {
        &self.builder
    }

    pub fn into_builder(self) -> RelationBuilder {
        self.builder
    }

    pub fn with<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.builder = match self.builder {
            RelationBuilder::ReadOnly(builder) => RelationBuilder::ReadOnly(builder.with(paths)),
            RelationBuilder::Native(builder) => RelationBuilder::Native(builder.with(paths)),
        };
        self
    }

    pub fn scope(mut self, name: &str, args: &[Value]) -> TheoriaResult<Self> {
        self.builder = match self.builder {
            RelationBuilder::ReadOnly(builder) => {
                RelationBuilder::ReadOnly(builder.scope(name, args)?)
            }
            RelationBuilder::Native(builder) => RelationBuilder::Native(builder.scope(name, args)?),
        };
        Ok(self)
    }

    pub fn with_trashed(mut self) -> Self {
        self.builder = match self.builder {
            RelationBuilder::ReadOnly(builder) => RelationBuilder::ReadOnly(builder.with_trashed()),
            RelationBuilder::Native(builder) => RelationBuilder::Native(builder.with_trashed()),
        };
        self
    }

    pub fn without_global_scopes(mut self) -> Self {
        self.builder = match self.builder {
            RelationBuilder::ReadOnly(builder) => {
                RelationBuilder::ReadOnly(builder.without_global_scopes())
            }
            RelationBuilder::Native(builder) => {
                RelationBuilder::Native(builder.without_global_scopes())
            }
        };
        self
    }

    /// Through relations: keep rows whose intermediate parent is soft-deleted.
    pub fn with_trashed_parents(mut self) -> Self {
        self.builder = match self.builder {
            RelationBuilder::ReadOnly(builder) => {
                RelationBuilder::ReadOnly(builder.include_trashed_parents())
            }
            RelationBuilder::Native(builder) => {
                RelationBuilder::Native(builder.include_trashed_parents())
            }
        };
        self
    }

    pub fn to_sql(&self) -> TheoriaResult<String> {
        on_builder!(&self.builder, builder => builder.to_sql())
    }

    fn empty(&self, many: bool) -> Related {
        match (&self.builder, many) {
            (RelationBuilder::ReadOnly(_), true) => Related::Many(Collection::default()),
            (RelationBuilder::ReadOnly(_), false) => Related::One(None),
            (RelationBuilder::Native(_), true) => Related::NativeMany(Vec::new()),
            (RelationBuilder::Native(_), false) => Related::NativeOne(None),
        }
    }

    /// Relation result: a single (possibly absent) record or a collection.
    pub async fn get(&self) -> TheoriaResult<Related> {
        let many = self.relation.is_to_many();
        if self.null_key {
            return Ok(self.empty(many));
        }
        log::trace!(
            "resolving relation {}.{}",
            self.relation.owner(),
            self.relation.name()
        );
        on_builder!(&self.builder, builder => resolve(builder, many).await)
    }

    pub async fn first(&self) -> TheoriaResult<Related> {
        if self.null_key {
            return Ok(self.empty(false));
        }
        on_builder!(&self.builder, builder => resolve(builder, false).await)
    }

    pub async fn first_or_fail(&self) -> TheoriaResult<Related> {
        let related = self.first().await?;
        if related.is_null() {
            let target = on_builder!(&self.builder, builder => builder.model_name().to_string());
            return Err(TheoriaError::not_found(target, ""));
        }
        Ok(related)
    }

    pub async fn count(&self) -> TheoriaResult<u64> {
        if self.null_key {
            return Ok(0);
        }
        on_builder!(&self.builder, builder => builder.count().await)
    }

    pub async fn exists(&self) -> TheoriaResult<bool> {
        if self.null_key {
            return Ok(false);
        }
        on_builder!(&self.builder, builder => builder.exists().await)
    }

    pub async fn pluck(&self, column: &str) -> TheoriaResult<Vec<Value>> {
        if self.null_key {
            return Ok(Vec::new());
        }
        on_builder!(&self.builder, builder => builder.pluck(column).await)
    }

    pub async fn value(&self, column: &str) -> TheoriaResult<Value> {
        if self.null_key {
            return Ok(Value::Null);
        }
        on_builder!(&self.builder, builder => builder.value(column).await)
    }

    pub async fn sum(&self, column: &str) -> TheoriaResult<Value> {
        if self.null_key {
            return Ok(Value::Int(0));
        }
        on_builder!(&self.builder, builder => builder.sum(column).await)
    }

    pub async fn avg(&self, column: &str) -> TheoriaResult<Value> {
        if self.null_key {
            return Ok(Value::Null);
        }
        on_builder!(&self.builder, builder => builder.avg(column).await)
    }

    pub async fn min(&self, column: &str) -> TheoriaResult<Value> {
        if self.null_key {
            return Ok(Value::Null);
        }
        on_builder!(&self.builder, builder => builder.min(column).await)
    }

    pub async fn max(&self, column: &str) -> TheoriaResult<Value> {
        if self.null_key {
            return Ok(Value::Null);
        }
        on_builder!(&self.builder, builder => builder.max(column).await)
    }

    pub async fn paginate(
        &self,
        per_page: Option<u64>,
        page: u64,
    ) -> TheoriaResult<LengthAwarePage<Related>> {
        if self.null_key {
            let per_page = std::cmp::max(per_page.unwrap_or(self.store.per_page()), 1);
            let page = std::cmp::max(page, 1);
            return Ok(LengthAwarePage::new(self.empty(true), 0, 0, per_page, page));
        }
        match &self.builder {
            RelationBuilder::ReadOnly(builder) => Ok(builder
                .paginate(per_page, page)
                .await?
                .map_items(Related::Many)),
            RelationBuilder::Native(builder) => Ok(builder
                .paginate(per_page, page)
                .await?
                .map_items(Related::NativeMany)),
        }
    }

    /// Read-only side of the relation, if any: the owner first, then the target.
    fn read_only_side(&self, target: Option<&ModelDef>) -> Option<String> {
        if let Owner::ReadOnly(record) = &self.owner {
            return Some(record.model_name().to_string());
        }
        let target_family = match target {
            Some(def) => Some(def.family()),
            None => match &self.relation.kind {
                RelationKind::MorphTo { .. } => None,
                _ => Some(self.family()),
            },
        };
        match target_family {
            Some(Family::ReadOnly) => Some(match target {
                Some(def) => def.name().to_string(),
                None => on_builder!(&self.builder, builder => builder.model_name().to_string()),
            }),
            _ => None,
        }
    }

    /// Violation when either side is read-only, else the native owner and builder.
    fn writable(
        &self,
        method: &str,
        target: Option<&ModelDef>,
    ) -> TheoriaResult<(&NativeRecord, Option<&QueryBuilder<Native>>)> {
        if let Some(model) = self.read_only_side(target) {
            return Err(TheoriaError::cannot_call(model, method));
        }
        let Owner::Native(owner) = &self.owner else {
            return Err(TheoriaError::cannot_call(self.relation.owner(), method));
        };
        let builder = match &self.builder {
            RelationBuilder::Native(builder) => Some(builder),
            RelationBuilder::ReadOnly(_) => None,
        };
        Ok((owner, builder))
    }

    fn unsupported(&self, method: &str) -> TheoriaError {
        TheoriaError::invalid(format!(
            "relation [{}] on [{}] does not support [{method}]",
            self.relation.name(),
            self.relation.owner()
        ))
    }

    fn native_builder<'a>(
        &self,
        builder: Option<&'a QueryBuilder<Native>>,
        method: &str,
    ) -> TheoriaResult<&'a QueryBuilder<Native>> {
        builder.ok_or_else(|| self.unsupported(method))
    }

    /// Points a native owner at `target`. Returns the updated, unsaved owner.
    pub fn associate(&self, target: &NativeRecord) -> TheoriaResult<NativeRecord> {
        self.writable("associate", Some(target.def().as_ref()))?;
        let Owner::Native(owner) = &self.owner else {
            return Err(TheoriaError::cannot_call(self.relation.owner(), "associate"));
        };
        let mut owner = owner.clone();
        owner.associate(self.relation.name(), target)?;
        Ok(owner)
    }

    /// Read-only records can never be associated.
    pub fn associate_record(&self, target: &Record) -> TheoriaResult<Infallible> {
        Err(TheoriaError::cannot_call(
            self.read_only_side(None)
                .unwrap_or_else(|| target.model_name().to_string()),
            "associate",
        ))
    }

    pub fn dissociate(&self) -> TheoriaResult<NativeRecord> {
        let (owner, _) = self.writable("dissociate", None)?;
        let mut owner = owner.clone();
        owner.dissociate(self.relation.name())?;
        Ok(owner)
    }

    /// Creates a related native row linked to the owner.
    pub async fn create(
        &self,
        attributes: IndexMap<String, Value>,
    ) -> TheoriaResult<NativeRecord> {
        let (owner, builder) = self.writable("create", None)?;
        let builder = self.native_builder(builder, "create")?;
        let record = NativeRecord::make(Arc::clone(builder.def()), self.store.clone(), attributes);
        self.save_linked(owner, record, "create").await
    }

    pub async fn create_many(
        &self,
        rows: Vec<IndexMap<String, Value>>,
    ) -> TheoriaResult<Vec<NativeRecord>> {
        self.writable("create_many", None)?;
        let mut created = Vec::with_capacity(rows.len());
        for attributes in rows {
            created.push(self.create(attributes).await?);
        }
        Ok(created)
    }

    pub async fn save(&self, record: NativeRecord) -> TheoriaResult<NativeRecord> {
        let (owner, _) = self.writable("save", Some(record.def().as_ref()))?;
        self.save_linked(owner, record, "save").await
    }

    pub async fn save_many(&self, records: Vec<NativeRecord>) -> TheoriaResult<Vec<NativeRecord>> {
        self.writable("save_many", None)?;
        let mut saved = Vec::with_capacity(records.len());
        for record in records {
            saved.push(self.save(record).await?);
        }
        Ok(saved)
    }

    async fn save_linked(
        &self,
        owner: &NativeRecord,
        mut record: NativeRecord,
        method: &str,
    ) -> TheoriaResult<NativeRecord> {
        match &self.relation.kind {
            RelationKind::HasOne {
                foreign_key,
                local_key,
            }
            | RelationKind::HasMany {
                foreign_key,
                local_key,
            } => {
                record.set(foreign_key, owner.get_raw(local_key));
                record.save().await?;
            }
            RelationKind::MorphOne {
                morph_type,
                morph_class,
                foreign_key,
                local_key,
            }
            | RelationKind::MorphMany {
                morph_type,
                morph_class,
                foreign_key,
                local_key,
            } => {
                record.set(foreign_key, owner.get_raw(local_key));
                record.set(morph_type, Value::from(morph_class.clone()));
                record.save().await?;
            }
            RelationKind::BelongsToMany(spec)
            | RelationKind::MorphToMany(spec)
            | RelationKind::MorphedByMany(spec) => {
                record.save().await?;
                let related = record.get_raw(&spec.related_key);
                self.insert_pivot_rows(owner, spec, &[related], &IndexMap::new())
                    .await?;
            }
            _ => return Err(self.unsupported(method)),
        }
        Ok(record)
    }

    /// Updates the related rows. Keys are read first so joins never reach the `UPDATE`.
    pub async fn update(&self, values: IndexMap<String, Value>) -> TheoriaResult<u64> {
        let (_, builder) = self.writable("update", None)?;
        let builder = self.native_builder(builder, "update")?;
        match self.related_key_scope(builder).await? {
            Some(scoped) => scoped.update(values).await,
            None => Ok(0),
        }
    }

    pub async fn delete(&self) -> TheoriaResult<u64> {
        let (_, builder) = self.writable("delete", None)?;
        let builder = self.native_builder(builder, "delete")?;
        match self.related_key_scope(builder).await? {
            Some(scoped) => scoped.delete().await,
            None => Ok(0),
        }
    }

    async fn related_key_scope(
        &self,
        builder: &QueryBuilder<Native>,
    ) -> TheoriaResult<Option<QueryBuilder<Native>>> {
        if self.null_key {
            return Ok(None);
        }
        let def = Arc::clone(builder.def());
        let key = def.primary_key().ok_or_else(|| {
            TheoriaError::configuration(format!("model [{}] has no primary key", def.name()))
        })?;
        let keys = builder.pluck(&def.qualify(key)).await?;
        if keys.is_empty() {
            return Ok(None);
        }
        Ok(Some(
            QueryBuilder::new(self.store.clone(), Arc::clone(&def))
                .where_in(def.qualify(key), keys),
        ))
    }

    fn pivot_spec(&self, method: &str) -> TheoriaResult<(&NativeRecord, &PivotSpec)> {
        let (owner, _) = self.writable(method, None)?;
        let spec = self.relation.pivot().ok_or_else(|| self.unsupported(method))?;
        Ok((owner, spec))
    }

    /// Inserts link rows for the given related keys.
    pub async fn attach<I, V>(
        &self,
        ids: I,
        attributes: IndexMap<String, Value>,
    ) -> TheoriaResult<u64>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let (owner, spec) = self.pivot_spec("attach")?;
        let ids: Vec<Value> = ids.into_iter().map(Into::into).collect();
        self.insert_pivot_rows(owner, spec, &ids, &attributes).await
    }

    /// Removes link rows; `None` detaches everything.
    pub async fn detach<I, V>(&self, ids: Option<I>) -> TheoriaResult<u64>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let (owner, spec) = self.pivot_spec("detach")?;
        let ids = ids.map(|ids| ids.into_iter().map(Into::into).collect::<Vec<Value>>());
        self.delete_pivot_rows(owner, spec, ids.as_deref()).await
    }

    pub async fn sync<I, V>(&self, ids: I) -> TheoriaResult<SyncChanges>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let (owner, spec) = self.pivot_spec("sync")?;
        self.sync_rows(owner, spec, ids.into_iter().map(Into::into).collect(), true)
            .await
    }

    pub async fn sync_without_detaching<I, V>(&self, ids: I) -> TheoriaResult<SyncChanges>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let (owner, spec) = self.pivot_spec("sync_without_detaching")?;
        self.sync_rows(owner, spec, ids.into_iter().map(Into::into).collect(), false)
            .await
    }

    /// Attaches the keys not yet linked and detaches the ones that are.
    pub async fn toggle<I, V>(&self, ids: I) -> TheoriaResult<SyncChanges>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let (owner, spec) = self.pivot_spec("toggle")?;
        let current = self.current_pivot_keys(owner, spec).await?;
        let mut changes = SyncChanges::default();
        for id in ids.into_iter().map(Into::into) {
            if current.iter().any(|key| key.loose_eq(&id)) {
                changes.detached.push(id);
            } else {
                changes.attached.push(id);
            }
        }
        if !changes.detached.is_empty() {
            self.delete_pivot_rows(owner, spec, Some(&changes.detached))
                .await?;
        }
        if !changes.attached.is_empty() {
            self.insert_pivot_rows(owner, spec, &changes.attached, &IndexMap::new())
                .await?;
        }
        Ok(changes)
    }

    pub async fn update_existing_pivot(
        &self,
        id: impl Into<Value>,
        values: IndexMap<String, Value>,
    ) -> TheoriaResult<u64> {
        let (owner, spec) = self.pivot_spec("update_existing_pivot")?;
        let mut values = values;
        if spec.timestamps {
            values
                .entry("updated_at".to_string())
                .or_insert_with(|| Value::DateTime(OffsetDateTime::now_utc()));
        }
        if values.is_empty() {
            return Ok(0);
        }
        let mut update = SeaQuery::update();
        update.table(alias(&spec.table));
        update.values(
            values
                .iter()
                .map(|(column, value)| (alias(column), Expr::val(value.to_sea()))),
        );
        update.cond_where(self.pivot_condition(owner, spec).add(
            Expr::col(alias(&spec.related_pivot_key)).eq(Expr::val(id.into().to_sea())),
        ));
        let result = self
            .store
            .execute(owner.def().connection(), &update)
            .await?;
        Ok(result.rows_affected())
    }

    async fn sync_rows(
        &self,
        owner: &NativeRecord,
        spec: &PivotSpec,
        ids: Vec<Value>,
        detaching: bool,
    ) -> TheoriaResult<SyncChanges> {
        let current = self.current_pivot_keys(owner, spec).await?;
        let mut changes = SyncChanges::default();
        if detaching {
            changes.detached = current
                .iter()
                .filter(|key| !ids.iter().any(|id| id.loose_eq(key)))
                .cloned()
                .collect();
            if !changes.detached.is_empty() {
                self.delete_pivot_rows(owner, spec, Some(&changes.detached))
                    .await?;
            }
        }
        for id in ids {
            let linked = current.iter().any(|key| key.loose_eq(&id));
            let queued = changes.attached.iter().any(|key| key.loose_eq(&id));
            if !linked && !queued {
                changes.attached.push(id);
            }
        }
        if !changes.attached.is_empty() {
            self.insert_pivot_rows(owner, spec, &changes.attached, &IndexMap::new())
                .await?;
        }
        Ok(changes)
    }

    fn pivot_condition(
        &self,
        owner: &NativeRecord,
        spec: &PivotSpec,
    ) -> sea_orm::sea_query::Condition {
        let mut condition = sea_orm::sea_query::Condition::all().add(
            Expr::col(alias(&spec.foreign_pivot_key))
                .eq(Expr::val(owner.get_raw(&spec.parent_key).to_sea())),
        );
        if let Some((morph_type, class)) = &spec.morph {
            condition = condition.add(
                Expr::col(alias(morph_type)).eq(Expr::val(Value::from(class.as_str()).to_sea())),
            );
        }
        condition
    }

    async fn current_pivot_keys(
        &self,
        owner: &NativeRecord,
        spec: &PivotSpec,
    ) -> TheoriaResult<Vec<Value>> {
        let mut select = SeaQuery::select();
        select
            .column(alias(&spec.related_pivot_key))
            .from(alias(&spec.table))
            .cond_where(self.pivot_condition(owner, spec));
        let rows = self.store.select(owner.def().connection(), &select).await?;
        let mut keys = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut decoded = decode_row(row)?;
            if let Some(key) = decoded.shift_remove(&spec.related_pivot_key) {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    async fn insert_pivot_rows(
        &self,
        owner: &NativeRecord,
        spec: &PivotSpec,
        ids: &[Value],
        attributes: &IndexMap<String, Value>,
    ) -> TheoriaResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let parent = owner.get_raw(&spec.parent_key);
        let now = Value::DateTime(OffsetDateTime::now_utc());
        let mut columns = vec![
            spec.foreign_pivot_key.clone(),
            spec.related_pivot_key.clone(),
        ];
        let mut fixed: Vec<Value> = Vec::new();
        if let Some((morph_type, class)) = &spec.morph {
            columns.push(morph_type.clone());
            fixed.push(Value::from(class.as_str()));
        }
        for (column, value) in attributes {
            columns.push(column.clone());
            fixed.push(value.clone());
        }
        if spec.timestamps {
            for column in ["created_at", "updated_at"] {
                if !attributes.contains_key(column) {
                    columns.push(column.to_string());
                    fixed.push(now.clone());
                }
            }
        }
        let mut insert = SeaQuery::insert();
        insert
            .into_table(alias(&spec.table))
            .columns(columns.iter().map(|column| alias(column)));
        for id in ids {
            let row = [parent.clone(), id.clone()]
                .into_iter()
                .chain(fixed.iter().cloned())
                .map(|value| Expr::val(value.to_sea()));
            insert
                .values(row)
                .map_err(|err| TheoriaError::storage(err.to_string()))?;
        }
        let result = self
            .store
            .execute(owner.def().connection(), &insert)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_pivot_rows(
        &self,
        owner: &NativeRecord,
        spec: &PivotSpec,
        ids: Option<&[Value]>,
    ) -> TheoriaResult<u64> {
        let mut condition = self.pivot_condition(owner, spec);
        if let Some(ids) = ids {
            if ids.is_empty() {
                return Ok(0);
            }
            condition = condition.add(
                Expr::col(alias(&spec.related_pivot_key))
                    .is_in(ids.iter().map(|id| Expr::val(id.to_sea()))),
            );
        }
        let mut delete = SeaQuery::delete();
        delete.from_table(alias(&spec.table)).cond_where(condition);
        let result = self
            .store
            .execute(owner.def().connection(), &delete)
            .await?;
        Ok(result.rows_affected())
    }
}

async fn resolve<F: RecordFamily>(
    builder: &QueryBuilder<F>,
    many: bool,
) -> TheoriaResult<Related> {
    if many {
        Ok(F::related_many(builder.get_records().await?))
    } else {
        Ok(F::related_one(builder.first().await?))
    }
}

/// Groups related rows by the owner key they belong to.
pub(crate) fn dictionary<R>(rows: Vec<(Option<String>, R)>) -> HashMap<String, Vec<R>> {
    let mut dictionary: HashMap<String, Vec<R>> = HashMap::new();
    for (key, record) in rows {
        if let Some(key) = key {
            dictionary.entry(key).or_default().push(record);
        }
    }
    dictionary
}

#[cfg(test)]
mod tests {
    use super::{PivotSpec, RelationDecl, RelationKind};
    use crate::{ModelBuilder, Registry};

    fn registry() -> Registry {
        Registry::builder()
            .model(
                ModelBuilder::read_only("User")
                    .soft_deletes()
                    .relation("posts", RelationDecl::has_many("Post"))
                    .relation(
                        "roles",
                        RelationDecl::belongs_to_many("Role").with_pivot(["granted_by"]),
                    )
                    .relation("tags", RelationDecl::morph_to_many("Tag", "taggable")),
            )
            .model(
                ModelBuilder::read_only("Post")
                    .relation(
                        "author",
                        RelationDecl::belongs_to("User").foreign_key("user_id"),
                    )
                    .relation("image", RelationDecl::morph_one("Image", "imageable")),
            )
            .model(
                ModelBuilder::read_only("Country")
                    .relation("posts", RelationDecl::has_many_through("Post", "User")),
            )
            .model(ModelBuilder::read_only("Role"))
            .model(ModelBuilder::native("Image").relation("imageable", RelationDecl::morph_to()))
            .model(
                ModelBuilder::read_only("Tag")
                    .relation("users", RelationDecl::morphed_by_many("User", "taggable")),
            )
            .build()
            .expect("registry")
    }

    #[test]
    fn defaults_follow_host_naming() {
        let registry = registry();
        let user = registry.def("User").expect("user");
        assert_eq!(
            user.relation("posts").expect("posts").kind(),
            &RelationKind::HasMany {
                foreign_key: "user_id".to_string(),
                local_key: "id".to_string(),
            }
        );
        let roles = user.relation("roles").expect("roles");
        assert_eq!(
            roles.pivot(),
            Some(&PivotSpec {
                table: "role_user".to_string(),
                foreign_pivot_key: "user_id".to_string(),
                related_pivot_key: "role_id".to_string(),
                parent_key: "id".to_string(),
                related_key: "id".to_string(),
                columns: vec!["granted_by".to_string()],
                timestamps: false,
                morph: None,
            })
        );
        let tags = user.relation("tags").expect("tags").pivot().expect("pivot");
        assert_eq!(tags.table, "taggables");
        assert_eq!(tags.foreign_pivot_key, "taggable_id");
        assert_eq!(tags.related_pivot_key, "tag_id");
        assert_eq!(
            tags.morph,
            Some(("taggable_type".to_string(), "User".to_string()))
        );
        let inverse = registry
            .def("Tag")
            .expect("tag")
            .relation("users")
            .expect("users")
            .pivot()
            .cloned()
            .expect("pivot");
        assert_eq!(inverse.foreign_pivot_key, "tag_id");
        assert_eq!(inverse.related_pivot_key, "taggable_id");
    }

    #[test]
    fn through_relations_capture_intermediate_soft_deletes() {
        let registry = registry();
        let relation = registry
            .def("Country")
            .expect("country")
            .relation("posts")
            .cloned()
            .expect("posts");
        let RelationKind::HasManyThrough(spec) = relation.kind() else {
            panic!("unexpected kind {:?}", relation.kind());
        };
        assert_eq!(spec.table, "users");
        assert_eq!(spec.first_key, "country_id");
        assert_eq!(spec.second_key, "user_id");
        assert_eq!(spec.second_local_key, "id");
        assert_eq!(spec.soft_delete_column.as_deref(), Some("deleted_at"));
        assert!(relation.is_to_many());
    }

    #[test]
    fn target_family_is_resolved_once() {
        let registry = registry();
        let post = registry.def("Post").expect("post");
        let image = post.relation("image").expect("image");
        assert_eq!(image.target_family(), Some(crate::Family::Native));
        assert_eq!(
            post.relation("author").expect("author").target_family(),
            Some(crate::Family::ReadOnly)
        );
        let morph_to = registry
            .def("Image")
            .expect("image")
            .relation("imageable")
            .cloned()
            .expect("imageable");
        assert_eq!(morph_to.target(), None);
        assert_eq!(morph_to.target_family(), None);
    }
}
