use std::cmp::Ordering;
use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Serialize, Serializer};
use serde_json::Value as JsonValue;

use crate::builder::{QueryBuilder, ReadOnly};
use crate::eager::{self, EagerTree};
use crate::query::{Op, QueryFilters};
use crate::{Attributes, ModelDef, Record, TheoriaError, TheoriaResult, Value};

/// Ordered read-only records. Restructuring in memory is allowed; persistence is not.
#[derive(Clone, Debug, Default)]
pub struct Collection {
    items: Vec<Record>,
}

impl Collection {
    pub fn new(items: Vec<Record>) -> Self {
        Self { items }
    }

    pub fn count(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_not_empty(&self) -> bool {
        !self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Record> {
        self.items.get(index)
    }

    pub fn first(&self) -> Option<&Record> {
        self.items.first()
    }

    pub fn last(&self) -> Option<&Record> {
        self.items.last()
    }

    pub fn first_where(&self, column: &str, value: impl Into<Value>) -> Option<&Record> {
        let value = value.into();
        self.items
            .iter()
            .find(|record| record.get(column).loose_eq(&value))
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Record> {
        self.items.iter()
    }

    pub fn contains(&self, record: &Record) -> bool {
        self.items.iter().any(|item| item.is(record))
    }

    pub fn contains_where<P>(&self, predicate: P) -> bool
    where
        P: Fn(&Record) -> bool,
    {
        self.items.iter().any(predicate)
    }

    pub fn contains_key(&self, key: impl Into<Value>) -> bool {
        self.find(key).is_some()
    }

    /// Record whose primary key matches `key`.
    pub fn find(&self, key: impl Into<Value>) -> Option<&Record> {
        let key = key.into();
        self.items
            .iter()
            .find(|record| !key.is_null() && record.get_key().loose_eq(&key))
    }

    pub fn model_keys(&self) -> Vec<Value> {
        self.items.iter().map(Record::get_key).collect()
    }

    /// Integer sum when every value is integral, float otherwise. Nulls are skipped.
    pub fn sum(&self, column: &str) -> Value {
        let values: Vec<Value> = self.non_null(column);
        if values.iter().all(|value| matches!(value, Value::Int(_))) {
            Value::Int(values.iter().filter_map(Value::as_i64).sum())
        } else {
            Value::Float(values.iter().filter_map(Value::as_f64).sum())
        }
    }

    pub fn avg(&self, column: &str) -> Option<f64> {
        let values: Vec<f64> = self
            .non_null(column)
            .iter()
            .filter_map(Value::as_f64)
            .collect();
        if values.is_empty() {
            None
        } else {
            Some(values.iter().sum::<f64>() / values.len() as f64)
        }
    }

    pub fn min(&self, column: &str) -> Value {
        self.non_null(column)
            .into_iter()
            .min_by(Value::sort_cmp)
            .unwrap_or(Value::Null)
    }

    pub fn max(&self, column: &str) -> Value {
        self.non_null(column)
            .into_iter()
            .max_by(Value::sort_cmp)
            .unwrap_or(Value::Null)
    }

    fn non_null(&self, column: &str) -> Vec<Value> {
        self.items
            .iter()
            .map(|record| record.get(column))
            .filter(|value| !value.is_null())
            .collect()
    }

    pub fn reduce<T, F>(&self, initial: T, reducer: F) -> T
    where
        F: FnMut(T, &Record) -> T,
    {
        self.items.iter().fold(initial, reducer)
    }

    pub fn filter<P>(&self, predicate: P) -> Self
    where
        P: Fn(&Record) -> bool,
    {
        Self::new(self.items.iter().filter(|r| predicate(r)).cloned().collect())
    }

    pub fn reject<P>(&self, predicate: P) -> Self
    where
        P: Fn(&Record) -> bool,
    {
        self.filter(|record| !predicate(record))
    }

    pub fn where_eq(&self, column: &str, value: impl Into<Value>) -> Self {
        self.where_op(column, Op::Eq, value)
    }

    /// Loose comparison, as the host collection does it.
    pub fn where_op(&self, column: &str, op: Op, value: impl Into<Value>) -> Self {
        let value = value.into();
        self.filter(|record| {
            let current = record.get(column);
            match op {
                Op::Eq => current.loose_eq(&value),
                Op::Ne => !current.loose_eq(&value),
                Op::Lt => current.sort_cmp(&value) == Ordering::Less,
                Op::Lte => current.sort_cmp(&value) != Ordering::Greater,
                Op::Gt => current.sort_cmp(&value) == Ordering::Greater,
                Op::Gte => current.sort_cmp(&value) != Ordering::Less,
                Op::Like => like(&current.to_string(), &value.to_string()),
                Op::NotLike => !like(&current.to_string(), &value.to_string()),
            }
        })
    }

    pub fn where_in<I, V>(&self, column: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let values: Vec<Value> = values.into_iter().map(Into::into).collect();
        self.filter(|record| {
            let current = record.get(column);
            values.iter().any(|value| current.loose_eq(value))
        })
    }

    pub fn where_not_in<I, V>(&self, column: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let values: Vec<Value> = values.into_iter().map(Into::into).collect();
        self.filter(|record| {
            let current = record.get(column);
            !values.iter().any(|value| current.loose_eq(value))
        })
    }

    pub fn where_null(&self, column: &str) -> Self {
        self.filter(|record| record.get(column).is_null())
    }

    pub fn where_not_null(&self, column: &str) -> Self {
        self.filter(|record| !record.get(column).is_null())
    }

    pub fn where_between(
        &self,
        column: &str,
        low: impl Into<Value>,
        high: impl Into<Value>,
    ) -> Self {
        let (low, high) = (low.into(), high.into());
        self.filter(|record| {
            let current = record.get(column);
            current.sort_cmp(&low) != Ordering::Less
                && current.sort_cmp(&high) != Ordering::Greater
        })
    }

    /// Stable sort on an attribute's value.
    pub fn sort_by(&self, column: &str) -> Self {
        let mut items = self.items.clone();
        items.sort_by(|a, b| a.get(column).sort_cmp(&b.get(column)));
        Self::new(items)
    }

    pub fn sort_by_desc(&self, column: &str) -> Self {
        let mut items = self.items.clone();
        items.sort_by(|a, b| b.get(column).sort_cmp(&a.get(column)));
        Self::new(items)
    }

    pub fn sort_by_key<K, F>(&self, key: F) -> Self
    where
        K: Ord,
        F: Fn(&Record) -> K,
    {
        let mut items = self.items.clone();
        items.sort_by_key(|record| key(record));
        Self::new(items)
    }

    pub fn reverse(&self) -> Self {
        Self::new(self.items.iter().rev().cloned().collect())
    }

    pub fn slice(&self, offset: usize, length: Option<usize>) -> Self {
        let iter = self.items.iter().skip(offset).cloned();
        match length {
            Some(length) => Self::new(iter.take(length).collect()),
            None => Self::new(iter.collect()),
        }
    }

    /// First `limit` records, or the last `-limit` when negative.
    pub fn take(&self, limit: i64) -> Self {
        let count = limit.unsigned_abs() as usize;
        if limit >= 0 {
            Self::new(self.items.iter().take(count).cloned().collect())
        } else {
            let start = self.items.len().saturating_sub(count);
            Self::new(self.items[start..].to_vec())
        }
    }

    pub fn skip(&self, count: usize) -> Self {
        self.slice(count, None)
    }

    /// Unique by primary key; keyless records are compared by raw attributes.
    pub fn unique(&self) -> Self {
        let mut seen = HashSet::new();
        Self::new(
            self.items
                .iter()
                .filter(|record| {
                    let identity = match record.get_key().dictionary_key() {
                        Some(key) => format!("{}:{key}", record.model_name()),
                        None => format!("{:?}", record.get_attributes()),
                    };
                    seen.insert(identity)
                })
                .cloned()
                .collect(),
        )
    }

    pub fn unique_by(&self, column: &str) -> Self {
        let mut seen = HashSet::new();
        Self::new(
            self.items
                .iter()
                .filter(|record| seen.insert(record.get(column).to_string()))
                .cloned()
                .collect(),
        )
    }

    /// Reindexed copy. Positions are already dense, so this is a plain copy.
    pub fn values(&self) -> Self {
        self.clone()
    }

    /// Records whose key is in `keys`.
    pub fn only<I, V>(&self, keys: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let keys: Vec<Value> = keys.into_iter().map(Into::into).collect();
        self.filter(|record| keys.iter().any(|key| record.get_key().loose_eq(key)))
    }

    pub fn except<I, V>(&self, keys: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let keys: Vec<Value> = keys.into_iter().map(Into::into).collect();
        self.filter(|record| !keys.iter().any(|key| record.get_key().loose_eq(key)))
    }

    pub fn diff(&self, other: &Collection) -> Self {
        self.filter(|record| !other.contains(record))
    }

    pub fn intersect(&self, other: &Collection) -> Self {
        self.filter(|record| other.contains(record))
    }

    pub fn map<T, F>(&self, mapper: F) -> Vec<T>
    where
        F: FnMut(&Record) -> T,
    {
        self.items.iter().map(mapper).collect()
    }

    pub fn flat_map<T, I, F>(&self, mapper: F) -> Vec<T>
    where
        I: IntoIterator<Item = T>,
        F: FnMut(&Record) -> I,
    {
        self.items.iter().flat_map(mapper).collect()
    }

    pub fn pluck(&self, column: &str) -> Vec<Value> {
        self.items.iter().map(|record| record.get(column)).collect()
    }

    pub fn pluck_keyed(&self, column: &str, key: &str) -> IndexMap<String, Value> {
        self.items
            .iter()
            .map(|record| (record.get(key).to_string(), record.get(column)))
            .collect()
    }

    pub fn keys(&self) -> Vec<usize> {
        (0..self.items.len()).collect()
    }

    pub fn group_by(&self, column: &str) -> IndexMap<String, Vec<Record>> {
        let mut groups: IndexMap<String, Vec<Record>> = IndexMap::new();
        for record in &self.items {
            groups
                .entry(record.get(column).to_string())
                .or_default()
                .push(record.clone());
        }
        groups
    }

    pub fn key_by(&self, column: &str) -> IndexMap<String, Record> {
        self.items
            .iter()
            .map(|record| (record.get(column).to_string(), record.clone()))
            .collect()
    }

    /// Plain vector; the records themselves stay read-only.
    pub fn to_base(&self) -> Vec<Record> {
        self.items.clone()
    }

    pub fn into_vec(self) -> Vec<Record> {
        self.items
    }

    pub fn push(&mut self, record: Record) -> &mut Self {
        self.items.push(record);
        self
    }

    pub fn pop(&mut self) -> Option<Record> {
        self.items.pop()
    }

    pub fn shift(&mut self) -> Option<Record> {
        if self.items.is_empty() {
            None
        } else {
            Some(self.items.remove(0))
        }
    }

    pub fn prepend(&mut self, record: Record) -> &mut Self {
        self.items.insert(0, record);
        self
    }

    /// Replaces the record at `index`, or appends when `index` is past the end.
    pub fn put(&mut self, index: usize, record: Record) -> &mut Self {
        match self.items.get_mut(index) {
            Some(slot) => *slot = record,
            None => self.items.push(record),
        }
        self
    }

    pub fn forget(&mut self, index: usize) -> Option<Record> {
        if index < self.items.len() {
            Some(self.items.remove(index))
        } else {
            None
        }
    }

    pub fn splice(
        &mut self,
        offset: usize,
        length: Option<usize>,
        replacement: Vec<Record>,
    ) -> Vec<Record> {
        let start = offset.min(self.items.len());
        let end = match length {
            Some(length) => start.saturating_add(length).min(self.items.len()),
            None => self.items.len(),
        };
        self.items.splice(start..end, replacement).collect()
    }

    pub fn transform<F>(&mut self, transform: F) -> &mut Self
    where
        F: FnMut(Record) -> Record,
    {
        self.items = std::mem::take(&mut self.items)
            .into_iter()
            .map(transform)
            .collect();
        self
    }

    pub fn save(&self) -> TheoriaResult<Infallible> {
        Err(TheoriaError::cannot_call(self.model_name(), "save"))
    }

    pub fn update(&self, _values: IndexMap<String, Value>) -> TheoriaResult<Infallible> {
        Err(TheoriaError::cannot_call(self.model_name(), "update"))
    }

    pub fn delete(&self) -> TheoriaResult<Infallible> {
        Err(TheoriaError::cannot_call(self.model_name(), "delete"))
    }

    pub fn touch(&self) -> TheoriaResult<Infallible> {
        Err(TheoriaError::cannot_call(self.model_name(), "touch"))
    }

    pub fn restore(&self) -> TheoriaResult<Infallible> {
        Err(TheoriaError::cannot_call(self.model_name(), "restore"))
    }

    pub fn force_delete(&self) -> TheoriaResult<Infallible> {
        Err(TheoriaError::cannot_call(self.model_name(), "force_delete"))
    }

    fn model_name(&self) -> String {
        self.items
            .first()
            .map(|record| record.model_name().to_string())
            .unwrap_or_else(|| "Collection".to_string())
    }

    /// Read-only builder constrained to the records' keys.
    pub fn to_query(&self) -> TheoriaResult<QueryBuilder<ReadOnly>> {
        let first = self.items.first().ok_or_else(|| {
            TheoriaError::configuration("unable to create query for empty collection")
        })?;
        if self
            .items
            .iter()
            .any(|record| record.model_name() != first.model_name())
        {
            return Err(TheoriaError::configuration(
                "unable to create query for collection with mixed types",
            ));
        }
        let def = Arc::clone(first.def());
        let key = def.primary_key().ok_or_else(|| {
            TheoriaError::configuration(format!("model [{}] has no primary key", def.name()))
        })?;
        let store = first.store().cloned().ok_or_else(|| {
            TheoriaError::configuration("collection records are not bound to a store")
        })?;
        let qualified = def.qualify(key);
        Ok(QueryBuilder::new(store, def).where_in(qualified, self.model_keys()))
    }

    /// Eager-loads relation paths onto every record, grouped by type.
    pub async fn load<I, S>(&self, paths: I) -> TheoriaResult<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let tree = EagerTree::parse(paths);
        let mut groups: IndexMap<String, (Arc<ModelDef>, Vec<Record>)> = IndexMap::new();
        for record in &self.items {
            groups
                .entry(record.model_name().to_string())
                .or_insert_with(|| (Arc::clone(record.def()), Vec::new()))
                .1
                .push(record.clone());
        }
        for (_, (def, mut records)) in groups {
            let Some(store) = records.first().and_then(|record| record.store().cloned()) else {
                return Err(TheoriaError::configuration(
                    "collection records are not bound to a store",
                ));
            };
            eager::load::<ReadOnly>(&store, &def, &mut records, &tree).await?;
        }
        Ok(())
    }

    pub fn to_array(&self) -> Vec<IndexMap<String, JsonValue>> {
        self.items.iter().map(Record::to_array).collect()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.to_array()).unwrap_or_default()
    }
}

fn like(haystack: &str, pattern: &str) -> bool {
    let haystack = haystack.to_lowercase();
    let parts: Vec<String> = pattern.to_lowercase().split('%').map(str::to_string).collect();
    let mut position = 0;
    for (index, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if index == 0 {
            if !haystack.starts_with(part.as_str()) {
                return false;
            }
            position = part.len();
            continue;
        }
        match haystack[position..].find(part.as_str()) {
            Some(found) => position += found + part.len(),
            None => return false,
        }
    }
    match parts.last() {
        Some(last) if !last.is_empty() && parts.len() > 1 => haystack.ends_with(last.as_str()),
        Some(last) if !last.is_empty() => haystack.len() == last.len(),
        _ => true,
    }
}

impl FromIterator<Record> for Collection {
    fn from_iter<T: IntoIterator<Item = Record>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl IntoIterator for Collection {
    type Item = Record;
    type IntoIter = std::vec::IntoIter<Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl<'a> IntoIterator for &'a Collection {
    type Item = &'a Record;
    type IntoIter = std::slice::Iter<'a, Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

impl Serialize for Collection {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_array().serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use indexmap::IndexMap;

    use super::{Collection, like};
    use crate::query::Op;
    use crate::record::ReadOnlyGuard;
    use crate::{Attributes, ModelBuilder, ModelDef, Record, Registry, Value};

    fn def() -> Arc<ModelDef> {
        Registry::builder()
            .model(ModelBuilder::read_only("Post"))
            .build()
            .expect("registry")
            .def("Post")
            .expect("def")
    }

    fn posts() -> Collection {
        let def = def();
        [(1, "alpha", 3), (2, "beta", 1), (3, "gamma", 2), (4, "beta", 5)]
            .into_iter()
            .map(|(id, title, votes)| {
                let raw: IndexMap<String, Value> = [
                    ("id".to_string(), Value::Int(id)),
                    ("title".to_string(), Value::from(title)),
                    ("votes".to_string(), Value::Int(votes)),
                ]
                .into_iter()
                .collect();
                Record::from_attributes(Arc::clone(&def), raw)
            })
            .collect()
    }

    #[test]
    fn reads_match_host_semantics() {
        let posts = posts();
        assert_eq!(posts.count(), 4);
        assert_eq!(posts.first().expect("first").get("title"), Value::from("alpha"));
        assert_eq!(posts.sum("votes"), Value::Int(11));
        assert_eq!(posts.avg("votes"), Some(2.75));
        assert_eq!(posts.max("votes"), Value::Int(5));
        assert_eq!(posts.min("title"), Value::from("alpha"));
        assert!(posts.contains_key(3));
        assert_eq!(posts.find("2").expect("found").get("title"), Value::from("beta"));
        assert_eq!(posts.model_keys().len(), 4);
        let empty = Collection::default();
        assert!(empty.first().is_none() && empty.last().is_none());
        assert_eq!(empty.avg("votes"), None);
        assert_eq!(empty.sum("votes"), Value::Int(0));
        assert!(empty.filter(|_| true).is_empty());
    }

    #[test]
    fn structure_preserving_ops_keep_the_wrapper() {
        let posts = posts();
        let betas = posts.where_eq("title", "beta");
        assert_eq!(betas.count(), 2);
        let sorted = posts.sort_by_desc("votes");
        assert_eq!(
            sorted.pluck("id"),
            vec![Value::Int(4), Value::Int(1), Value::Int(3), Value::Int(2)]
        );
        assert_eq!(posts.take(-1).pluck("id"), vec![Value::Int(4)]);
        assert_eq!(posts.skip(3).count(), 1);
        assert_eq!(posts.unique_by("title").count(), 3);
        assert_eq!(posts.where_op("votes", Op::Gte, 3).count(), 2);
        assert_eq!(posts.where_between("votes", 2, 3).count(), 2);
        assert_eq!(posts.only([1, 2]).count(), 2);
        assert_eq!(posts.except([1, 2]).count(), 2);
        assert_eq!(posts.diff(&posts.only([1])).count(), 3);
        assert_eq!(posts.intersect(&posts.only([1])).count(), 1);
        assert_eq!(posts.reverse().first().expect("last").get_key(), Value::Int(4));
        assert_eq!(posts.where_op("title", Op::Like, "%ET%").count(), 2);
    }

    #[test]
    fn type_erasing_ops_return_plain_containers() {
        let posts = posts();
        let titles: Vec<String> = posts.map(|record| record.get("title").to_string());
        assert_eq!(titles.len(), 4);
        let grouped = posts.group_by("title");
        assert_eq!(grouped["beta"].len(), 2);
        let keyed = posts.key_by("id");
        assert_eq!(keyed["3"].get("title"), Value::from("gamma"));
        assert_eq!(posts.pluck_keyed("title", "id")["1"], Value::from("alpha"));
        assert_eq!(posts.keys(), vec![0, 1, 2, 3]);
        let mut base = posts.to_base();
        base.clear();
        assert_eq!(posts.count(), 4);
    }

    #[test]
    fn in_memory_restructuring_keeps_records_immutable() {
        let mut posts = posts();
        let popped = posts.pop().expect("pop");
        posts.prepend(popped.clone());
        assert_eq!(posts.first().expect("first").get_key(), Value::Int(4));
        let shifted = posts.shift().expect("shift");
        posts.push(shifted);
        let removed = posts.splice(0, Some(1), Vec::new());
        assert_eq!(removed.len(), 1);
        posts.put(0, popped.clone());
        assert!(posts.forget(10).is_none());
        posts.transform(|record| record);
        let err = posts
            .first()
            .expect("first")
            .set_attribute("title", Value::from("x"))
            .expect_err("violation");
        assert!(err.is_violation());
    }

    #[test]
    fn persistence_verbs_are_violations() {
        let posts = posts();
        for err in [
            posts.save().expect_err("save"),
            posts.update(IndexMap::new()).expect_err("update"),
            posts.delete().expect_err("delete"),
            posts.touch().expect_err("touch"),
            posts.restore().expect_err("restore"),
            posts.force_delete().expect_err("force_delete"),
        ] {
            assert!(err.is_violation(), "{err}");
        }
        assert!(posts.to_query().is_err());
        assert!(Collection::default().to_query().expect_err("empty").is_configuration());
    }

    #[test]
    fn like_patterns_match_wildcards() {
        assert!(like("beta", "%et%"));
        assert!(like("beta", "b%"));
        assert!(like("beta", "%ta"));
        assert!(!like("beta", "%x%"));
        assert!(like("beta", "beta"));
        assert!(!like("betas", "beta"));
    }
}
