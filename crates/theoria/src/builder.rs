use std::cmp;
use std::collections::{HashSet, VecDeque};
use std::convert::Infallible;
use std::marker::PhantomData;
use std::sync::Arc;

use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use indexmap::IndexMap;
use sea_orm::DatabaseBackend;
use sea_orm::sea_query::{Condition, Expr, ExprTrait, Query as SeaQuery};
use time::OffsetDateTime;

use crate::eager::{self, Constraint, EagerTree};
use crate::model::SOFT_DELETES_SCOPE;
use crate::pagination::{Cursor, CursorPage, LengthAwarePage, SimplePage};
use crate::query::{Aggregate, Direction, Op, QueryFilters, alias, page_offset};
use crate::store::decode_row;
use crate::{
    Attributes, Collection, Family, KeyType, ModelDef, NativeRecord, Pivot, Query, Record,
    Related, TheoriaError, TheoriaResult, TheoriaStore, Value,
};

/// Column alias carrying the intermediate key of a through relation.
pub(crate) const THROUGH_KEY: &str = "theoria_through_key";

/// How rows of a registered type are hydrated and handed back.
pub trait RecordFamily: Send + Sync + 'static {
    const FAMILY: Family;
    type Record: Attributes + Clone + Send + Sync + 'static;
    type Collection: Send + Sync + 'static;

    fn hydrate(
        def: Arc<ModelDef>,
        store: &TheoriaStore,
        raw: IndexMap<String, Value>,
        pivot: Option<Pivot>,
    ) -> Self::Record;

    fn collect(records: Vec<Self::Record>) -> Self::Collection;

    fn related_one(record: Option<Self::Record>) -> Related;

    fn related_many(records: Vec<Self::Record>) -> Related;

    fn cache_relation(record: &mut Self::Record, name: &str, related: Related);

    /// Relation value eager loading may reuse instead of querying again.
    fn loaded_relation(record: &Self::Record, name: &str) -> Option<Related>;
}

/// Immutable records wrapped in the overlay.
#[derive(Clone, Copy, Debug)]
pub struct ReadOnly;

/// Host-native mutable records, passed through untouched.
#[derive(Clone, Copy, Debug)]
pub struct Native;

impl RecordFamily for ReadOnly {
    const FAMILY: Family = Family::ReadOnly;
    type Record = Record;
    type Collection = Collection;

    fn hydrate(
        def: Arc<ModelDef>,
        store: &TheoriaStore,
        raw: IndexMap<String, Value>,
        pivot: Option<Pivot>,
    ) -> Record {
        Record::hydrate(def, Some(store.clone()), raw, pivot)
    }

    fn collect(records: Vec<Record>) -> Collection {
        Collection::new(records)
    }

    fn related_one(record: Option<Record>) -> Related {
        Related::One(record)
    }

    fn related_many(records: Vec<Record>) -> Related {
        Related::Many(Collection::new(records))
    }

    fn cache_relation(record: &mut Record, name: &str, related: Related) {
        record.cache_relation(name, related);
    }

    fn loaded_relation(record: &Record, name: &str) -> Option<Related> {
        record.get_relation(name).ok()
    }
}

impl RecordFamily for Native {
    const FAMILY: Family = Family::Native;
    type Record = NativeRecord;
    type Collection = Vec<NativeRecord>;

    fn hydrate(
        def: Arc<ModelDef>,
        store: &TheoriaStore,
        raw: IndexMap<String, Value>,
        pivot: Option<Pivot>,
    ) -> NativeRecord {
        NativeRecord::hydrate(def, store.clone(), raw, pivot)
    }

    fn collect(records: Vec<NativeRecord>) -> Vec<NativeRecord> {
        records
    }

    fn related_one(record: Option<NativeRecord>) -> Related {
        Related::NativeOne(record)
    }

    fn related_many(records: Vec<NativeRecord>) -> Related {
        Related::NativeMany(records)
    }

    fn cache_relation(record: &mut NativeRecord, name: &str, related: Related) {
        record.set_relation(name, related);
    }

    fn loaded_relation(_record: &NativeRecord, _name: &str) -> Option<Related> {
        None
    }
}

/// Join a relation query adds on top of the caller's predicates.
#[derive(Clone, Debug)]
pub(crate) enum RelationJoin {
    Pivot {
        table: String,
        related_pivot_key: String,
        related_key: String,
        columns: Vec<String>,
    },
    Through {
        table: String,
        first_key: String,
        second_key: String,
        second_local_key: String,
        soft_delete_column: Option<String>,
        include_trashed: bool,
    },
}

impl RelationJoin {
    fn apply(&self, query: Query) -> Query {
        let target = query.table().to_string();
        match self {
            RelationJoin::Pivot {
                table,
                related_pivot_key,
                related_key,
                columns,
            } => {
                let mut query = query.join(
                    table.clone(),
                    format!("{target}.{related_key}"),
                    Op::Eq,
                    format!("{table}.{related_pivot_key}"),
                );
                if query.selects.is_empty() {
                    query = query.select([format!("{target}.*")]);
                }
                for column in columns {
                    query = query.select_as(
                        format!("{table}.{column}"),
                        format!("{}{column}", crate::pivot::PIVOT_PREFIX),
                    );
                }
                query
            }
            RelationJoin::Through {
                table,
                first_key,
                second_key,
                second_local_key,
                soft_delete_column,
                include_trashed,
            } => {
                let mut query = query.join(
                    table.clone(),
                    format!("{table}.{second_local_key}"),
                    Op::Eq,
                    format!("{target}.{second_key}"),
                );
                if query.selects.is_empty() {
                    query = query.select([format!("{target}.*")]);
                }
                query = query.select_as(format!("{table}.{first_key}"), THROUGH_KEY);
                match soft_delete_column {
                    Some(column) if !include_trashed => {
                        query.where_null(format!("{table}.{column}"))
                    }
                    _ => query,
                }
            }
        }
    }
}

/// Where a fetched row's match key comes from during eager loading.
#[derive(Clone, Debug)]
pub(crate) enum MatchKey {
    Attribute(String),
    Pivot(String),
    Through,
}

#[derive(Clone, Debug, Default)]
struct RemovedScopes {
    all: bool,
    names: HashSet<String>,
}

impl RemovedScopes {
    fn contains(&self, name: &str) -> bool {
        self.all || self.names.contains(name)
    }
}

/// Typed query builder. Read verbs record into the host query; the family decides
/// what rows hydrate into and whether write verbs run.
pub struct QueryBuilder<F: RecordFamily> {
    store: TheoriaStore,
    def: Arc<ModelDef>,
    query: Query,
    eager: EagerTree,
    removed_scopes: RemovedScopes,
    join: Option<RelationJoin>,
    family: PhantomData<fn() -> F>,
}

impl<F: RecordFamily> Clone for QueryBuilder<F> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            def: Arc::clone(&self.def),
            query: self.query.clone(),
            eager: self.eager.clone(),
            removed_scopes: self.removed_scopes.clone(),
            join: self.join.clone(),
            family: PhantomData,
        }
    }
}

impl<F: RecordFamily> std::fmt::Debug for QueryBuilder<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryBuilder")
            .field("model", &self.def.name())
            .field("family", &F::FAMILY)
            .field("query", &self.query)
            .finish_non_exhaustive()
    }
}

impl<F: RecordFamily> QueryFilters for QueryBuilder<F> {
    fn query_mut(&mut self) -> &mut Query {
        &mut self.query
    }
}

impl<F: RecordFamily> QueryBuilder<F> {
    pub(crate) fn new(store: TheoriaStore, def: Arc<ModelDef>) -> Self {
        let query = Query::new(def.table());
        Self {
            store,
            def,
            query,
            eager: EagerTree::default(),
            removed_scopes: RemovedScopes::default(),
            join: None,
            family: PhantomData,
        }
    }

    pub fn def(&self) -> &Arc<ModelDef> {
        &self.def
    }

    pub fn model_name(&self) -> &str {
        self.def.name()
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub(crate) fn store(&self) -> &TheoriaStore {
        &self.store
    }

    pub(crate) fn set_join(mut self, join: RelationJoin) -> Self {
        self.join = Some(join);
        self
    }

    pub(crate) fn include_trashed_parents(mut self) -> Self {
        if let Some(RelationJoin::Through {
            include_trashed, ..
        }) = &mut self.join
        {
            *include_trashed = true;
        }
        self
    }

    pub(crate) fn merge_eager(mut self, tree: EagerTree) -> Self {
        self.eager.merge(tree);
        self
    }

    /// Eager-loads relation paths (`"posts"`, `"posts.comments"`) with the results.
    pub fn with<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.eager.merge(EagerTree::parse(paths));
        self
    }

    /// Eager-loads one path, constraining the query of its last segment.
    pub fn with_constrained<C>(mut self, path: &str, constraint: C) -> Self
    where
        C: Fn(Query) -> Query + Send + Sync + 'static,
    {
        let constraint: Constraint = Arc::new(constraint);
        self.eager.add(path, Some(constraint));
        self
    }

    /// Applies a named local scope.
    pub fn scope(mut self, name: &str, args: &[Value]) -> TheoriaResult<Self> {
        let scope = Arc::clone(self.def.local_scope(name).ok_or_else(|| {
            TheoriaError::invalid(format!(
                "call to undefined scope [{name}] on model [{}]",
                self.def.name()
            ))
        })?);
        let query = std::mem::take(&mut self.query);
        self.query = scope(query, args);
        Ok(self)
    }

    pub fn without_global_scope(mut self, name: &str) -> Self {
        self.removed_scopes.names.insert(name.to_string());
        self
    }

    pub fn without_global_scopes(mut self) -> Self {
        self.removed_scopes.all = true;
        self
    }

    pub fn removed_scopes(&self) -> Vec<String> {
        self.def
            .global_scope_names()
            .into_iter()
            .filter(|name| self.removed_scopes.contains(name))
            .map(str::to_string)
            .collect()
    }

    /// Includes soft-deleted rows. No-op for types without soft deletes.
    pub fn with_trashed(self) -> Self {
        self.without_global_scope(SOFT_DELETES_SCOPE)
    }

    /// Only soft-deleted rows. No-op for types without soft deletes.
    pub fn only_trashed(self) -> Self {
        match self.def.soft_delete_column() {
            Some(column) => {
                let qualified = self.def.qualify(column);
                self.with_trashed().where_not_null(qualified)
            }
            None => self,
        }
    }

    /// Host query with global scopes and the relation join applied.
    pub(crate) fn compiled(&self) -> Query {
        let mut query = self.query.clone();
        if !self.removed_scopes.all && !self.def.global_scopes().is_empty() {
            query.isolate_wheres();
            for (name, scope) in self.def.global_scopes() {
                if !self.removed_scopes.contains(name) {
                    query = scope(query);
                }
            }
        }
        match &self.join {
            Some(join) => join.apply(query),
            None => query,
        }
    }

    fn backend(&self) -> TheoriaResult<DatabaseBackend> {
        self.store.backend(self.def.connection())
    }

    pub fn to_sql(&self) -> TheoriaResult<String> {
        let backend = self.backend()?;
        Ok(crate::store::render_sql(
            backend,
            &self.compiled().to_statement(backend),
        ))
    }

    fn key_column(&self) -> TheoriaResult<String> {
        let key = self.def.primary_key().ok_or_else(|| {
            TheoriaError::configuration(format!(
                "model [{}] has no primary key",
                self.def.name()
            ))
        })?;
        Ok(self.def.qualify(key))
    }

    fn accepts_key(&self, key: &Value) -> bool {
        match (self.def.key_type(), key) {
            (_, Value::Null) => false,
            (KeyType::Uuid, Value::Text(text)) => uuid::Uuid::parse_str(text).is_ok(),
            _ => true,
        }
    }

    async fn fetch_rows(&self) -> TheoriaResult<Vec<FetchedRow>> {
        let backend = self.backend()?;
        let statement = self.compiled().to_statement(backend);
        let rows = self.store.select(self.def.connection(), &statement).await?;
        let mut fetched = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut attributes = decode_row(row)?;
            let mut pivot = None;
            let mut through_key = None;
            match &self.join {
                Some(RelationJoin::Pivot { table, .. }) => {
                    pivot = Some(Pivot::extract(table, &mut attributes));
                }
                Some(RelationJoin::Through { .. }) => {
                    through_key = attributes.shift_remove(THROUGH_KEY);
                }
                None => {}
            }
            fetched.push(FetchedRow {
                attributes,
                pivot,
                through_key,
            });
        }
        Ok(fetched)
    }

    /// Rows hydrated with their eager relations, each paired with its match key.
    pub(crate) async fn get_keyed(
        &self,
        key: Option<&MatchKey>,
    ) -> TheoriaResult<Vec<(Option<String>, F::Record)>> {
        let rows = self.fetch_rows().await?;
        let mut keys = Vec::with_capacity(rows.len());
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            keys.push(match key {
                Some(MatchKey::Attribute(column)) => row
                    .attributes
                    .get(column)
                    .and_then(Value::dictionary_key),
                Some(MatchKey::Pivot(column)) => row
                    .pivot
                    .as_ref()
                    .and_then(|pivot| pivot.get_raw(column).dictionary_key()),
                Some(MatchKey::Through) => {
                    row.through_key.as_ref().and_then(Value::dictionary_key)
                }
                None => None,
            });
            records.push(F::hydrate(
                Arc::clone(&self.def),
                &self.store,
                row.attributes,
                row.pivot,
            ));
        }
        if !self.eager.is_empty() && !records.is_empty() {
            eager::load::<F>(&self.store, &self.def, &mut records, &self.eager).await?;
        }
        Ok(keys.into_iter().zip(records).collect())
    }

    pub(crate) async fn get_records(&self) -> TheoriaResult<Vec<F::Record>> {
        Ok(self
            .get_keyed(None)
            .await?
            .into_iter()
            .map(|(_, record)| record)
            .collect())
    }

    pub async fn get(&self) -> TheoriaResult<F::Collection> {
        Ok(F::collect(self.get_records().await?))
    }

    pub async fn first(&self) -> TheoriaResult<Option<F::Record>> {
        let mut records = self.clone().limit(1).get_records().await?;
        Ok(if records.is_empty() {
            None
        } else {
            Some(records.swap_remove(0))
        })
    }

    pub async fn first_or_fail(&self) -> TheoriaResult<F::Record> {
        self.first()
            .await?
            .ok_or_else(|| TheoriaError::not_found(self.def.name(), ""))
    }

    pub async fn find(&self, key: impl Into<Value>) -> TheoriaResult<Option<F::Record>> {
        let column = self.key_column()?;
        let key = key.into();
        if !self.accepts_key(&key) {
            return Ok(None);
        }
        self.clone().where_eq(column, key).first().await
    }

    pub async fn find_or_fail(&self, key: impl Into<Value>) -> TheoriaResult<F::Record> {
        let key = key.into();
        self.find(key.clone())
            .await?
            .ok_or_else(|| TheoriaError::not_found(self.def.name(), key.to_string()))
    }

    pub async fn find_many<I, V>(&self, keys: I) -> TheoriaResult<F::Collection>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let column = self.key_column()?;
        let keys: Vec<Value> = keys
            .into_iter()
            .map(Into::into)
            .filter(|key| self.accepts_key(key))
            .collect();
        if keys.is_empty() {
            return Ok(F::collect(Vec::new()));
        }
        self.clone().where_in(column, keys).get().await
    }

    /// Like `find_many`, failing unless every key matched a row.
    pub async fn find_many_or_fail<I, V>(&self, keys: I) -> TheoriaResult<F::Collection>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let column = self.key_column()?;
        let keys: Vec<Value> = keys.into_iter().map(Into::into).collect();
        let key_name = self.def.primary_key().unwrap_or_default().to_string();
        let records = self.clone().where_in(column, keys.clone()).get_records().await?;
        let missing: Vec<String> = keys
            .iter()
            .filter(|key| {
                !records
                    .iter()
                    .any(|record| record.get_raw(&key_name).loose_eq(key))
            })
            .map(Value::to_string)
            .collect();
        if missing.is_empty() {
            Ok(F::collect(records))
        } else {
            Err(TheoriaError::not_found(self.def.name(), missing.join(", ")))
        }
    }

    async fn aggregate(&self, function: Aggregate, column: Option<&str>) -> TheoriaResult<Value> {
        let backend = self.backend()?;
        let statement = self
            .compiled()
            .aggregate_statement(function, column, backend);
        let row = self
            .store
            .select_one(self.def.connection(), &statement)
            .await?;
        Ok(match row {
            Some(row) => decode_row(&row)?
                .shift_remove("aggregate")
                .unwrap_or(Value::Null),
            None => Value::Null,
        })
    }

    pub async fn count(&self) -> TheoriaResult<u64> {
        let value = self.aggregate(Aggregate::Count, None).await?;
        Ok(value.as_i64().map_or(0, |count| cmp::max(count, 0) as u64))
    }

    /// Sum of a column; `0` when no rows match.
    pub async fn sum(&self, column: &str) -> TheoriaResult<Value> {
        let value = self.aggregate(Aggregate::Sum, Some(column)).await?;
        Ok(if value.is_null() { Value::Int(0) } else { value })
    }

    pub async fn avg(&self, column: &str) -> TheoriaResult<Value> {
        self.aggregate(Aggregate::Avg, Some(column)).await
    }

    pub async fn min(&self, column: &str) -> TheoriaResult<Value> {
        self.aggregate(Aggregate::Min, Some(column)).await
    }

    pub async fn max(&self, column: &str) -> TheoriaResult<Value> {
        self.aggregate(Aggregate::Max, Some(column)).await
    }

    pub async fn exists(&self) -> TheoriaResult<bool> {
        let backend = self.backend()?;
        let statement = self.compiled().exists_statement(backend);
        Ok(self
            .store
            .select_one(self.def.connection(), &statement)
            .await?
            .is_some())
    }

    pub async fn doesnt_exist(&self) -> TheoriaResult<bool> {
        Ok(!self.exists().await?)
    }

    /// Rows reduced to the given columns, hydrated so casts and accessors apply.
    async fn plucked(&self, columns: Vec<String>) -> TheoriaResult<Vec<Record>> {
        let rows = self.clone().select(columns).fetch_rows().await?;
        Ok(rows
            .into_iter()
            .map(|row| Record::from_attributes(Arc::clone(&self.def), row.attributes))
            .collect())
    }

    pub async fn pluck(&self, column: &str) -> TheoriaResult<Vec<Value>> {
        let name = unqualified(column);
        Ok(self
            .plucked(vec![column.to_string()])
            .await?
            .iter()
            .map(|record| record.get(name))
            .collect())
    }

    pub async fn pluck_keyed(
        &self,
        column: &str,
        key: &str,
    ) -> TheoriaResult<IndexMap<String, Value>> {
        let (name, key_name) = (unqualified(column), unqualified(key));
        let records = self
            .plucked(vec![column.to_string(), key.to_string()])
            .await?;
        Ok(records
            .iter()
            .filter_map(|record| {
                record
                    .get(key_name)
                    .dictionary_key()
                    .map(|k| (k, record.get(name)))
            })
            .collect())
    }

    /// First row's value for a column, or `Null`.
    pub async fn value(&self, column: &str) -> TheoriaResult<Value> {
        Ok(self
            .clone()
            .limit(1)
            .pluck(column)
            .await?
            .into_iter()
            .next()
            .unwrap_or(Value::Null))
    }

    pub async fn paginate(
        &self,
        per_page: Option<u64>,
        page: u64,
    ) -> TheoriaResult<LengthAwarePage<F::Collection>> {
        let per_page = cmp::max(per_page.unwrap_or(self.store.per_page()), 1);
        let page = cmp::max(page, 1);
        let total = self.count().await?;
        let records = match page_offset(page, per_page) {
            Some(offset) if offset < total => {
                self.clone().for_page(page, per_page).get_records().await?
            }
            _ => Vec::new(),
        };
        let count = records.len();
        Ok(LengthAwarePage::new(
            F::collect(records),
            count,
            total,
            per_page,
            page,
        ))
    }

    /// Pagination without a count query; fetches one extra row to detect more pages.
    pub async fn simple_paginate(
        &self,
        per_page: Option<u64>,
        page: u64,
    ) -> TheoriaResult<SimplePage<F::Collection>> {
        let per_page = cmp::max(per_page.unwrap_or(self.store.per_page()), 1);
        let page = cmp::max(page, 1);
        let mut records = match page_offset(page, per_page) {
            Some(offset) => {
                self.clone()
                    .offset(offset)
                    .limit(per_page.saturating_add(1))
                    .get_records()
                    .await?
            }
            None => Vec::new(),
        };
        let has_more = records.len() as u64 > per_page;
        records.truncate(per_page as usize);
        let count = records.len();
        Ok(SimplePage::new(
            F::collect(records),
            count,
            per_page,
            page,
            has_more,
        ))
    }

    /// Keyset pagination over the builder's column orders, falling back to the key.
    pub async fn cursor_paginate(
        &self,
        per_page: Option<u64>,
        cursor: Option<Cursor>,
    ) -> TheoriaResult<CursorPage<F::Collection>> {
        let per_page = cmp::max(per_page.unwrap_or(self.store.per_page()), 1);
        let mut builder = self.clone();
        let mut orders = builder.query.column_orders();
        if orders.is_empty() {
            let key = builder.key_column().map_err(|_| {
                TheoriaError::configuration(
                    "cursor pagination requires an order by clause or a primary key",
                )
            })?;
            builder = builder.order_by(key.clone(), Direction::Asc);
            orders = vec![(key, Direction::Asc)];
        }
        let forward = cursor.as_ref().is_none_or(Cursor::points_to_next_items);
        if let Some(cursor) = &cursor {
            let mut predicates = Query::new(builder.def.table());
            for (index, (column, direction)) in orders.iter().enumerate() {
                let ascending = (*direction == Direction::Asc) == forward;
                let op = if ascending { Op::Gt } else { Op::Lt };
                let prefix = &orders[..index];
                predicates = predicates.or_where_nested(|mut nested| {
                    for (column, _) in prefix {
                        nested = nested.where_eq(column.clone(), cursor.parameter(column));
                    }
                    nested.where_op(column.clone(), op, cursor.parameter(column))
                });
            }
            builder = builder.where_nested(|_| predicates);
            if !forward {
                builder = builder.reorder();
                for (column, direction) in &orders {
                    builder = builder.order_by(column.clone(), direction.reversed());
                }
            }
        }
        let mut records = builder.limit(per_page.saturating_add(1)).get_records().await?;
        let has_more = records.len() as u64 > per_page;
        records.truncate(per_page as usize);
        if !forward {
            records.reverse();
        }
        let columns: Vec<String> = orders.into_iter().map(|(column, _)| column).collect();
        let cursor_for = |record: &F::Record, next: bool| {
            let parameters = columns
                .iter()
                .map(|column| (column.clone(), record.get_raw(unqualified(column))))
                .collect();
            Cursor::new(parameters, next)
        };
        let (has_previous, has_next) = match &cursor {
            None => (false, has_more),
            Some(_) if forward => (true, has_more),
            Some(_) => (has_more, true),
        };
        let next_cursor = if has_next {
            records.last().map(|record| cursor_for(record, true))
        } else {
            None
        };
        let previous_cursor = if has_previous {
            records.first().map(|record| cursor_for(record, false))
        } else {
            None
        };
        let count = records.len();
        Ok(CursorPage::new(
            F::collect(records),
            count,
            per_page,
            cursor,
            next_cursor,
            previous_cursor,
        ))
    }

    /// Chunked iteration needs a stable order: the caller's, else the primary key.
    fn ordered_for_chunking(self) -> TheoriaResult<Self> {
        if self.query.has_orders() {
            return Ok(self);
        }
        let key = self.key_column().map_err(|_| {
            TheoriaError::configuration(
                "You must specify an orderBy clause when using this function.",
            )
        })?;
        Ok(self.order_by(key, Direction::Asc))
    }

    /// Walks the results in pages of `size`. Returning `false` from the callback stops early.
    pub async fn chunk<C>(&self, size: u64, mut callback: C) -> TheoriaResult<bool>
    where
        C: FnMut(F::Collection, u64) -> TheoriaResult<bool>,
    {
        let size = cmp::max(size, 1);
        let base = self.clone().ordered_for_chunking()?;
        let mut page = 1;
        loop {
            let records = base.clone().for_page(page, size).get_records().await?;
            let count = records.len() as u64;
            if count == 0 {
                break;
            }
            if !callback(F::collect(records), page)? {
                return Ok(false);
            }
            if count < size {
                break;
            }
            page += 1;
        }
        Ok(true)
    }

    /// Streams records, fetching `chunk_size` rows per statement.
    pub fn lazy(&self, chunk_size: Option<u64>) -> BoxStream<'static, TheoriaResult<F::Record>> {
        let size = cmp::max(chunk_size.unwrap_or(self.store.lazy_chunk_size()), 1);
        let builder = match self.clone().ordered_for_chunking() {
            Ok(builder) => builder,
            Err(err) => return stream::once(async move { Err(err) }).boxed(),
        };
        let state = LazyState {
            builder,
            page: 1,
            buffer: VecDeque::new(),
            done: false,
        };
        stream::try_unfold(state, move |mut state| async move {
            loop {
                if let Some(record) = state.buffer.pop_front() {
                    return Ok(Some((record, state)));
                }
                if state.done {
                    return Ok(None);
                }
                let records = state
                    .builder
                    .clone()
                    .for_page(state.page, size)
                    .get_records()
                    .await?;
                state.page += 1;
                if (records.len() as u64) < size {
                    state.done = true;
                }
                if records.is_empty() {
                    return Ok(None);
                }
                state.buffer.extend(records);
            }
        })
        .boxed()
    }
}

struct FetchedRow {
    attributes: IndexMap<String, Value>,
    pivot: Option<Pivot>,
    through_key: Option<Value>,
}

struct LazyState<F: RecordFamily> {
    builder: QueryBuilder<F>,
    page: u64,
    buffer: VecDeque<F::Record>,
    done: bool,
}

fn unqualified(column: &str) -> &str {
    column.rsplit('.').next().unwrap_or(column)
}

/// Write verbs on a read-only builder fail before any statement is built.
impl QueryBuilder<ReadOnly> {
    fn refuse(&self, method: &str) -> TheoriaResult<Infallible> {
        Err(TheoriaError::cannot_call(self.def.name(), method))
    }

    pub async fn insert(&self, _rows: Vec<IndexMap<String, Value>>) -> TheoriaResult<Infallible> {
        self.refuse("insert")
    }

    pub async fn insert_get_id(
        &self,
        _values: IndexMap<String, Value>,
    ) -> TheoriaResult<Infallible> {
        self.refuse("insert_get_id")
    }

    pub async fn insert_or_ignore(
        &self,
        _rows: Vec<IndexMap<String, Value>>,
    ) -> TheoriaResult<Infallible> {
        self.refuse("insert_or_ignore")
    }

    pub async fn update(&self, _values: IndexMap<String, Value>) -> TheoriaResult<Infallible> {
        self.refuse("update")
    }

    pub async fn update_or_insert(
        &self,
        _attributes: IndexMap<String, Value>,
        _values: IndexMap<String, Value>,
    ) -> TheoriaResult<Infallible> {
        self.refuse("update_or_insert")
    }

    pub async fn upsert(
        &self,
        _rows: Vec<IndexMap<String, Value>>,
        _unique_by: &[&str],
    ) -> TheoriaResult<Infallible> {
        self.refuse("upsert")
    }

    pub async fn delete(&self) -> TheoriaResult<Infallible> {
        self.refuse("delete")
    }

    pub async fn force_delete(&self) -> TheoriaResult<Infallible> {
        self.refuse("force_delete")
    }

    pub async fn truncate(&self) -> TheoriaResult<Infallible> {
        self.refuse("truncate")
    }

    pub async fn increment(&self, _column: &str, _amount: i64) -> TheoriaResult<Infallible> {
        self.refuse("increment")
    }

    pub async fn decrement(&self, _column: &str, _amount: i64) -> TheoriaResult<Infallible> {
        self.refuse("decrement")
    }

    pub async fn restore(&self) -> TheoriaResult<Infallible> {
        self.refuse("restore")
    }
}

/// Native builders execute writes against the predicates recorded so far.
impl QueryBuilder<Native> {
    fn write_condition(&self, backend: DatabaseBackend) -> TheoriaResult<Option<Condition>> {
        if self.join.is_some() || !self.query.joins.is_empty() {
            return Err(TheoriaError::invalid(format!(
                "cannot write to [{}] through a joined query",
                self.def.name()
            )));
        }
        Ok(self.compiled().condition(backend))
    }

    fn timestamped(
        &self,
        mut values: IndexMap<String, Value>,
        creating: bool,
    ) -> IndexMap<String, Value> {
        if self.def.uses_timestamps() {
            let now = Value::DateTime(OffsetDateTime::now_utc());
            if creating {
                values
                    .entry("created_at".to_string())
                    .or_insert_with(|| now.clone());
            }
            values.entry("updated_at".to_string()).or_insert(now);
        }
        values
    }

    /// Inserts rows; columns missing from a row are written as `NULL`.
    pub async fn insert(&self, rows: Vec<IndexMap<String, Value>>) -> TheoriaResult<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let rows: Vec<IndexMap<String, Value>> = rows
            .into_iter()
            .map(|row| self.timestamped(row, true))
            .collect();
        let mut columns: Vec<String> = Vec::new();
        for row in &rows {
            for column in row.keys() {
                if !columns.contains(column) {
                    columns.push(column.clone());
                }
            }
        }
        let mut insert = SeaQuery::insert();
        insert
            .into_table(alias(self.def.table()))
            .columns(columns.iter().map(|column| alias(column)));
        for row in &rows {
            let values: Vec<Expr> = columns
                .iter()
                .map(|column| {
                    Expr::val(row.get(column).cloned().unwrap_or(Value::Null).to_sea())
                })
                .collect();
            insert
                .values(values)
                .map_err(|err| TheoriaError::storage(err.to_string()))?;
        }
        let result = self.store.execute(self.def.connection(), &insert).await?;
        Ok(result.rows_affected())
    }

    /// Inserts one row and returns its key, generated by the database or as a v4 UUID.
    pub async fn insert_get_id(&self, values: IndexMap<String, Value>) -> TheoriaResult<Value> {
        let key = self.def.primary_key().ok_or_else(|| {
            TheoriaError::configuration(format!(
                "model [{}] has no primary key",
                self.def.name()
            ))
        })?;
        let mut values = self.timestamped(values, true);
        let provided = values.get(key).filter(|value| !value.is_null()).cloned();
        let provided = match (provided, self.def.key_type()) {
            (Some(value), _) => Some(value),
            (None, KeyType::Uuid) => {
                let generated = Value::from(uuid::Uuid::new_v4().to_string());
                values.insert(key.to_string(), generated.clone());
                Some(generated)
            }
            (None, KeyType::String) => {
                return Err(TheoriaError::invalid(format!(
                    "model [{}] requires an explicit [{key}] value",
                    self.def.name()
                )));
            }
            (None, KeyType::Int) => None,
        };
        let backend = self.backend()?;
        let mut insert = SeaQuery::insert();
        insert
            .into_table(alias(self.def.table()))
            .columns(values.keys().map(|column| alias(column)));
        insert
            .values(values.values().map(|value| Expr::val(value.to_sea())))
            .map_err(|err| TheoriaError::storage(err.to_string()))?;
        if let Some(key_value) = provided {
            self.store.execute(self.def.connection(), &insert).await?;
            return Ok(key_value);
        }
        if backend == DatabaseBackend::Postgres {
            insert.returning_col(alias(key));
            let row = self
                .store
                .select_one(self.def.connection(), &insert)
                .await?
                .ok_or_else(|| TheoriaError::storage("insert returned no key"))?;
            return Ok(decode_row(&row)?.shift_remove(key).unwrap_or(Value::Null));
        }
        let result = self.store.execute(self.def.connection(), &insert).await?;
        Ok(Value::Int(result.last_insert_id() as i64))
    }

    pub async fn update(&self, values: IndexMap<String, Value>) -> TheoriaResult<u64> {
        if values.is_empty() {
            return Ok(0);
        }
        let backend = self.backend()?;
        let values = self.timestamped(values, false);
        let mut update = SeaQuery::update();
        update.table(alias(self.def.table()));
        update.values(
            values
                .iter()
                .map(|(column, value)| (alias(column), Expr::val(value.to_sea()))),
        );
        if let Some(condition) = self.write_condition(backend)? {
            update.cond_where(condition);
        }
        let result = self.store.execute(self.def.connection(), &update).await?;
        Ok(result.rows_affected())
    }

    /// Soft deletes when the type declares them, else removes the rows.
    pub async fn delete(&self) -> TheoriaResult<u64> {
        match self.def.soft_delete_column() {
            Some(column) => {
                let mut values = IndexMap::new();
                values.insert(
                    column.to_string(),
                    Value::DateTime(OffsetDateTime::now_utc()),
                );
                self.update(values).await
            }
            None => self.force_delete().await,
        }
    }

    pub async fn force_delete(&self) -> TheoriaResult<u64> {
        let backend = self.backend()?;
        let mut delete = SeaQuery::delete();
        delete.from_table(alias(self.def.table()));
        if let Some(condition) = self.write_condition(backend)? {
            delete.cond_where(condition);
        }
        let result = self.store.execute(self.def.connection(), &delete).await?;
        Ok(result.rows_affected())
    }

    pub async fn restore(&self) -> TheoriaResult<u64> {
        let Some(column) = self.def.soft_delete_column() else {
            return Ok(0);
        };
        let mut values = IndexMap::new();
        values.insert(column.to_string(), Value::Null);
        self.clone().with_trashed().update(values).await
    }

    pub async fn increment(&self, column: &str, amount: i64) -> TheoriaResult<u64> {
        let backend = self.backend()?;
        let mut update = SeaQuery::update();
        update.table(alias(self.def.table()));
        update.value(alias(column), Expr::col(alias(column)).add(Expr::val(amount)));
        if self.def.uses_timestamps() {
            update.value(
                alias("updated_at"),
                Expr::val(Value::DateTime(OffsetDateTime::now_utc()).to_sea()),
            );
        }
        if let Some(condition) = self.write_condition(backend)? {
            update.cond_where(condition);
        }
        let result = self.store.execute(self.def.connection(), &update).await?;
        Ok(result.rows_affected())
    }

    pub async fn decrement(&self, column: &str, amount: i64) -> TheoriaResult<u64> {
        self.increment(column, -amount).await
    }
}

#[cfg(test)]
mod tests {
    use sea_orm::DatabaseBackend;

    use super::RelationJoin;
    use crate::Query;
    use crate::query::{Op, QueryFilters};
    use crate::store::render_sql;

    #[test]
    fn pivot_join_aliases_link_columns() {
        let join = RelationJoin::Pivot {
            table: "role_user".to_string(),
            related_pivot_key: "role_id".to_string(),
            related_key: "id".to_string(),
            columns: vec!["user_id".to_string(), "role_id".to_string()],
        };
        let query = join.apply(Query::new("roles").where_eq("role_user.user_id", 1));
        let sql = render_sql(
            DatabaseBackend::Sqlite,
            &query.to_statement(DatabaseBackend::Sqlite),
        );
        assert!(sql.contains(r#""roles".*"#), "{sql}");
        assert!(
            sql.contains(r#""role_user"."user_id" AS "pivot_user_id""#),
            "{sql}"
        );
        assert!(
            sql.contains(r#"INNER JOIN "role_user" ON "roles"."id" = "role_user"."role_id""#),
            "{sql}"
        );
    }

    fn through(include_trashed: bool) -> RelationJoin {
        RelationJoin::Through {
            table: "users".to_string(),
            first_key: "country_id".to_string(),
            second_key: "user_id".to_string(),
            second_local_key: "id".to_string(),
            soft_delete_column: Some("deleted_at".to_string()),
            include_trashed,
        }
    }

    #[test]
    fn through_join_filters_trashed_parents_unless_asked() {
        let sql = render_sql(
            DatabaseBackend::Sqlite,
            &through(false)
                .apply(Query::new("posts"))
                .to_statement(DatabaseBackend::Sqlite),
        );
        assert!(sql.contains(r#""users"."deleted_at" IS NULL"#), "{sql}");
        assert!(
            sql.contains(r#""users"."country_id" AS "theoria_through_key""#),
            "{sql}"
        );

        let sql = render_sql(
            DatabaseBackend::Sqlite,
            &through(true)
                .apply(Query::new("posts").where_op("posts.id", Op::Gt, 0))
                .to_statement(DatabaseBackend::Sqlite),
        );
        assert!(!sql.contains("deleted_at"), "{sql}");
    }
}
