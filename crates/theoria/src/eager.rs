use std::fmt;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use indexmap::IndexMap;

use crate::builder::{Native, QueryBuilder, ReadOnly, RecordFamily};
use crate::query::QueryFilters;
use crate::relation::{Relation, RelationKind, dictionary};
use crate::{
    Attributes, Family, ModelDef, Query, Record, Related, TheoriaError, TheoriaResult,
    TheoriaStore, Value,
};

/// Callback narrowing the query of one eager-loaded relation.
pub type Constraint = Arc<dyn Fn(Query) -> Query + Send + Sync>;

/// Eager-load directives: relation names, nested by dotted path.
#[derive(Clone, Default)]
pub struct EagerTree {
    nodes: IndexMap<String, EagerNode>,
}

#[derive(Clone, Default)]
struct EagerNode {
    constraint: Option<Constraint>,
    children: EagerTree,
}

impl EagerTree {
    /// Parses `"posts"`, `"posts.comments"` and `"posts:id,title"` (column selection).
    pub fn parse<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut tree = Self::default();
        for path in paths {
            let path = path.as_ref().trim();
            if path.is_empty() {
                continue;
            }
            match path.split_once(':') {
                Some((path, columns)) => {
                    let columns: Vec<String> = columns
                        .split(',')
                        .map(|column| column.trim().to_string())
                        .filter(|column| !column.is_empty())
                        .collect();
                    let constraint: Constraint =
                        Arc::new(move |query: Query| query.select(columns.clone()));
                    tree.add(path, Some(constraint));
                }
                None => tree.add(path, None),
            }
        }
        tree
    }

    /// Adds a dotted path. The constraint applies to its last segment.
    pub fn add(&mut self, path: &str, constraint: Option<Constraint>) {
        let mut segments = path.split('.').map(str::trim).peekable();
        let mut tree = self;
        while let Some(segment) = segments.next() {
            let node = tree.nodes.entry(segment.to_string()).or_default();
            if segments.peek().is_none() {
                if constraint.is_some() {
                    node.constraint = constraint;
                }
                return;
            }
            tree = &mut node.children;
        }
    }

    pub fn merge(&mut self, other: EagerTree) {
        for (name, node) in other.nodes {
            let entry = self.nodes.entry(name).or_default();
            if node.constraint.is_some() {
                entry.constraint = node.constraint;
            }
            entry.children.merge(node.children);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Dotted paths, depth first.
    pub fn paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        for (name, node) in &self.nodes {
            paths.push(name.clone());
            paths.extend(
                node.children
                    .paths()
                    .into_iter()
                    .map(|child| format!("{name}.{child}")),
            );
        }
        paths
    }
}

impl fmt::Debug for EagerTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.paths()).finish()
    }
}

/// Loads every relation of `tree` onto `records` with one query per relation
/// (per morph type for `MorphTo`), then recurses into nested paths.
pub(crate) fn load<'a, F: RecordFamily>(
    store: &'a TheoriaStore,
    def: &'a Arc<ModelDef>,
    records: &'a mut [F::Record],
    tree: &'a EagerTree,
) -> BoxFuture<'a, TheoriaResult<()>> {
    async move {
        if records.is_empty() {
            return Ok(());
        }
        for (name, node) in &tree.nodes {
            let relation = def
                .relation(name)
                .cloned()
                .ok_or_else(|| TheoriaError::undefined_relation(def.name(), name))?;
            load_relation::<F>(store, &relation, records, node).await?;
        }
        Ok(())
    }
    .boxed()
}

async fn load_relation<F: RecordFamily>(
    store: &TheoriaStore,
    relation: &Relation,
    owners: &mut [F::Record],
    node: &EagerNode,
) -> TheoriaResult<()> {
    let mut pending = Vec::with_capacity(owners.len());
    let mut cached = Vec::new();
    for (index, owner) in owners.iter().enumerate() {
        match F::loaded_relation(owner, relation.name()) {
            Some(related) => cached.push(related),
            None => pending.push(index),
        }
    }
    if !cached.is_empty() {
        log::trace!(
            "relation {}.{} already loaded on {} record(s)",
            relation.owner(),
            relation.name(),
            cached.len()
        );
        if !node.children.is_empty() {
            descend(store, cached, &node.children).await?;
        }
    }
    if pending.is_empty() {
        return Ok(());
    }

    if let RelationKind::MorphTo {
        morph_type,
        foreign_key,
        ..
    } = relation.kind()
    {
        let mut by_type: IndexMap<String, Vec<usize>> = IndexMap::new();
        for index in pending {
            match owners[index].get_raw(morph_type) {
                Value::Null => {
                    F::cache_relation(&mut owners[index], relation.name(), F::related_one(None))
                }
                class => by_type.entry(class.to_string()).or_default().push(index),
            }
        }
        for (class, indices) in by_type {
            let target = store.registry().morph_def(&class)?;
            let batch = Batch {
                relation,
                node,
                indices: &indices,
                key_column: foreign_key,
            };
            match target.family() {
                Family::ReadOnly => match_onto::<F, ReadOnly>(store, target, owners, batch).await?,
                Family::Native => match_onto::<F, Native>(store, target, owners, batch).await?,
            }
        }
        return Ok(());
    }

    let target = store
        .registry()
        .def(relation.target().unwrap_or_default())?;
    let batch = Batch {
        relation,
        node,
        indices: &pending,
        key_column: relation.owner_key(),
    };
    match target.family() {
        Family::ReadOnly => match_onto::<F, ReadOnly>(store, target, owners, batch).await,
        Family::Native => match_onto::<F, Native>(store, target, owners, batch).await,
    }
}

/// Owners sharing one related query.
struct Batch<'a> {
    relation: &'a Relation,
    node: &'a EagerNode,
    indices: &'a [usize],
    key_column: &'a str,
}

/// Fetches the related rows of `owners[indices]` in one query and caches the matches.
async fn match_onto<F: RecordFamily, T: RecordFamily>(
    store: &TheoriaStore,
    target: Arc<ModelDef>,
    owners: &mut [F::Record],
    batch: Batch<'_>,
) -> TheoriaResult<()> {
    let Batch {
        relation,
        node,
        indices,
        key_column,
    } = batch;
    let mut keys: Vec<Value> = Vec::new();
    let mut seen: Vec<String> = Vec::new();
    for index in indices {
        let value = owners[*index].get_raw(key_column);
        if let Some(key) = value.dictionary_key() {
            if !seen.contains(&key) {
                seen.push(key);
                keys.push(value);
            }
        }
    }

    let rows = if keys.is_empty() {
        Vec::new()
    } else {
        let match_key = relation.match_key(&target);
        let mut builder = relation.constrain(
            QueryBuilder::<T>::new(store.clone(), Arc::clone(&target)),
            keys,
            false,
        );
        if let Some(constraint) = &node.constraint {
            let query = std::mem::take(builder.query_mut());
            *builder.query_mut() = constraint(query);
        }
        builder
            .merge_eager(node.children.clone())
            .get_keyed(Some(&match_key))
            .await?
    };
    log::debug!(
        "eager loaded {} row(s) for {}.{}",
        rows.len(),
        relation.owner(),
        relation.name()
    );

    let dictionary = dictionary(rows);
    let many = relation.is_to_many();
    for index in indices {
        let matched = owners[*index]
            .get_raw(key_column)
            .dictionary_key()
            .and_then(|key| dictionary.get(&key));
        let related = if many {
            T::related_many(matched.cloned().unwrap_or_default())
        } else {
            T::related_one(matched.and_then(|records| records.first().cloned()))
        };
        F::cache_relation(&mut owners[*index], relation.name(), related);
    }
    Ok(())
}

/// Nested paths below relations that were already loaded. Read-only records share
/// their cache across clones, so loading onto the cached values reaches the owners.
async fn descend(
    store: &TheoriaStore,
    cached: Vec<Related>,
    children: &EagerTree,
) -> TheoriaResult<()> {
    let mut groups: IndexMap<String, (Arc<ModelDef>, Vec<Record>)> = IndexMap::new();
    for related in cached {
        let records: Vec<Record> = match related {
            Related::One(Some(record)) => vec![record],
            Related::Many(collection) => collection.into_vec(),
            Related::One(None) => Vec::new(),
            Related::NativeOne(_) | Related::NativeMany(_) => {
                log::trace!("nested eager paths skip native values cached on read-only records");
                Vec::new()
            }
        };
        for record in records {
            groups
                .entry(record.model_name().to_string())
                .or_insert_with(|| (Arc::clone(record.def()), Vec::new()))
                .1
                .push(record);
        }
    }
    for (_, (def, mut records)) in groups {
        load::<ReadOnly>(store, &def, &mut records, children).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::EagerTree;

    #[test]
    fn parses_nested_paths_once() {
        let tree = EagerTree::parse(["posts.comments", "posts", "profile", " "]);
        assert_eq!(tree.paths(), vec!["posts", "posts.comments", "profile"]);
    }

    #[test]
    fn column_selection_becomes_constraint() {
        let tree = EagerTree::parse(["posts:id,user_id"]);
        assert_eq!(tree.paths(), vec!["posts"]);
        let node = tree.nodes.get("posts").expect("node");
        assert!(node.constraint.is_some());
    }

    #[test]
    fn merge_keeps_existing_children() {
        let mut tree = EagerTree::parse(["posts.comments"]);
        tree.merge(EagerTree::parse(["posts.tags", "roles"]));
        assert_eq!(
            tree.paths(),
            vec!["posts", "posts.comments", "posts.tags", "roles"]
        );
    }
}
