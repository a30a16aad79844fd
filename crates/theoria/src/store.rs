use std::fmt;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;
use sea_orm::prelude::Decimal;
use sea_orm::sea_query::{
    MysqlQueryBuilder, PostgresQueryBuilder, QueryStatementWriter, SqliteQueryBuilder, Values,
};
use sea_orm::{
    ConnectionTrait, Database, DatabaseBackend, DatabaseConnection, ExecResult, QueryResult,
    Statement,
};
use serde_json::Value as JsonValue;
use time::{Date, OffsetDateTime, PrimitiveDateTime};
use uuid::Uuid;

use crate::builder::{Native, QueryBuilder, ReadOnly, RecordFamily};
use crate::eager::EagerTree;
use crate::query::QueryFilters;
use crate::{
    Family, ModelDef, NativeRecord, Registry, TheoriaConfig, TheoriaError, TheoriaResult, Value,
};

const DEFAULT_PER_PAGE: u64 = 15;
const DEFAULT_LAZY_CHUNK_SIZE: u64 = 1000;

/// Connections plus the model registry every query resolves types against.
#[derive(Clone)]
pub struct TheoriaStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    default: DatabaseConnection,
    connections: IndexMap<String, DatabaseConnection>,
    registry: Registry,
    statements: AtomicU64,
    per_page: u64,
    lazy_chunk_size: u64,
    log_statements: bool,
}

impl fmt::Debug for TheoriaStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TheoriaStore")
            .field("backend", &self.inner.default.get_database_backend())
            .field("connections", &self.inner.connections.keys().collect::<Vec<_>>())
            .field("models", &self.inner.registry.names().collect::<Vec<_>>())
            .field("statements", &self.statement_count())
            .finish()
    }
}

impl TheoriaStore {
    /// Opens the store configured in `base_dir`, creating `theoria.json` and the
    /// sqlite file on first use.
    pub async fn open(base_dir: &Path, registry: Registry) -> TheoriaResult<Self> {
        let config = TheoriaConfig::load_from_dir(base_dir)?;
        Self::connect(&config, base_dir, registry).await
    }

    pub async fn connect(
        config: &TheoriaConfig,
        base_dir: &Path,
        registry: Registry,
    ) -> TheoriaResult<Self> {
        let options = config.connect_options(&config.database, base_dir)?;
        let default = Database::connect(options).await?;
        let mut connections = IndexMap::with_capacity(config.connections.len());
        for (name, database) in &config.connections {
            let options = config.connect_options(database, base_dir)?;
            connections.insert(name.clone(), Database::connect(options).await?);
        }
        log::info!(
            "theoria store connected ({}, {} named connection(s), {} model(s))",
            config.backend_name(),
            connections.len(),
            registry.names().count()
        );
        Ok(Self {
            inner: Arc::new(StoreInner {
                default,
                connections,
                registry,
                statements: AtomicU64::new(0),
                per_page: config.per_page(),
                lazy_chunk_size: config.lazy_chunk_size(),
                log_statements: config.log_statements(),
            }),
        })
    }

    /// Wraps an existing host connection with default settings.
    pub fn from_connection(conn: DatabaseConnection, registry: Registry) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                default: conn,
                connections: IndexMap::new(),
                registry,
                statements: AtomicU64::new(0),
                per_page: DEFAULT_PER_PAGE,
                lazy_chunk_size: DEFAULT_LAZY_CHUNK_SIZE,
                log_statements: true,
            }),
        }
    }

    /// Copy of this store with one more named connection.
    pub fn with_connection(&self, name: impl Into<String>, conn: DatabaseConnection) -> Self {
        let mut connections = self.inner.connections.clone();
        connections.insert(name.into(), conn);
        Self {
            inner: Arc::new(StoreInner {
                default: self.inner.default.clone(),
                connections,
                registry: self.inner.registry.clone(),
                statements: AtomicU64::new(self.statement_count()),
                per_page: self.inner.per_page,
                lazy_chunk_size: self.inner.lazy_chunk_size,
                log_statements: self.inner.log_statements,
            }),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Statements executed through this store so far.
    pub fn statement_count(&self) -> u64 {
        self.inner.statements.load(Ordering::Relaxed)
    }

    pub fn per_page(&self) -> u64 {
        self.inner.per_page
    }

    pub fn lazy_chunk_size(&self) -> u64 {
        self.inner.lazy_chunk_size
    }

    /// The default connection, for DDL and host-side work outside the overlay.
    pub fn connection(&self) -> &DatabaseConnection {
        &self.inner.default
    }

    fn conn(&self, name: Option<&str>) -> TheoriaResult<&DatabaseConnection> {
        match name {
            None => Ok(&self.inner.default),
            Some(name) => self.inner.connections.get(name).ok_or_else(|| {
                TheoriaError::configuration(format!(
                    "database connection [{name}] is not configured"
                ))
            }),
        }
    }

    pub(crate) fn backend(&self, conn: Option<&str>) -> TheoriaResult<DatabaseBackend> {
        Ok(self.conn(conn)?.get_database_backend())
    }

    fn statement<S: QueryStatementWriter>(
        &self,
        conn: &DatabaseConnection,
        stmt: &S,
    ) -> Statement {
        let backend = conn.get_database_backend();
        let (sql, values) = build_stmt(backend, stmt);
        self.inner.statements.fetch_add(1, Ordering::Relaxed);
        if self.inner.log_statements {
            log::debug!("theoria sql: {sql} {:?}", values.0);
        }
        Statement::from_sql_and_values(backend, sql, values)
    }

    pub(crate) async fn select<S: QueryStatementWriter>(
        &self,
        conn: Option<&str>,
        stmt: &S,
    ) -> TheoriaResult<Vec<QueryResult>> {
        let conn = self.conn(conn)?;
        let rows = conn.query_all_raw(self.statement(conn, stmt)).await?;
        Ok(rows)
    }

    pub(crate) async fn select_one<S: QueryStatementWriter>(
        &self,
        conn: Option<&str>,
        stmt: &S,
    ) -> TheoriaResult<Option<QueryResult>> {
        let conn = self.conn(conn)?;
        let row = conn.query_one_raw(self.statement(conn, stmt)).await?;
        Ok(row)
    }

    pub(crate) async fn execute<S: QueryStatementWriter>(
        &self,
        conn: Option<&str>,
        stmt: &S,
    ) -> TheoriaResult<ExecResult> {
        let conn = self.conn(conn)?;
        let result = conn.execute_raw(self.statement(conn, stmt)).await?;
        Ok(result)
    }

    /// Type-level entry point for a read-only type.
    pub fn model(&self, name: &str) -> TheoriaResult<ModelHandle<ReadOnly>> {
        self.handle(name)
    }

    /// Type-level entry point for a host-native type.
    pub fn native(&self, name: &str) -> TheoriaResult<ModelHandle<Native>> {
        self.handle(name)
    }

    fn handle<F: RecordFamily>(&self, name: &str) -> TheoriaResult<ModelHandle<F>> {
        let def = self.registry().def(name)?;
        if def.family() != F::FAMILY {
            let expected = match F::FAMILY {
                Family::ReadOnly => "read-only",
                Family::Native => "native",
            };
            return Err(TheoriaError::configuration(format!(
                "model [{name}] is not registered as {expected}"
            )));
        }
        Ok(ModelHandle {
            store: self.clone(),
            def,
            _family: PhantomData,
        })
    }
}

fn build_stmt<S: QueryStatementWriter>(backend: DatabaseBackend, stmt: &S) -> (String, Values) {
    match backend {
        DatabaseBackend::Sqlite => stmt.build(SqliteQueryBuilder),
        DatabaseBackend::Postgres => stmt.build(PostgresQueryBuilder),
        DatabaseBackend::MySql => stmt.build(MysqlQueryBuilder),
        _ => stmt.build(SqliteQueryBuilder),
    }
}

/// SQL with inlined values, for display.
pub(crate) fn render_sql<S: QueryStatementWriter>(backend: DatabaseBackend, stmt: &S) -> String {
    match backend {
        DatabaseBackend::Sqlite => stmt.to_string(SqliteQueryBuilder),
        DatabaseBackend::Postgres => stmt.to_string(PostgresQueryBuilder),
        DatabaseBackend::MySql => stmt.to_string(MysqlQueryBuilder),
        _ => stmt.to_string(SqliteQueryBuilder),
    }
}

macro_rules! try_column {
    ($row:expr, $name:expr, $ty:ty, $map:expr) => {
        if let Ok(value) = $row.try_get::<Option<$ty>>("", $name) {
            return Some(value.map_or(Value::Null, $map));
        }
    };
}

fn decode_column(row: &QueryResult, name: &str) -> Option<Value> {
    try_column!(row, name, i64, Value::Int);
    try_column!(row, name, i32, |value| Value::Int(value.into()));
    try_column!(row, name, i16, |value| Value::Int(value.into()));
    try_column!(row, name, f64, Value::Float);
    try_column!(row, name, f32, |value| Value::Float(value.into()));
    try_column!(row, name, bool, Value::Bool);
    try_column!(row, name, String, Value::Text);
    try_column!(row, name, Decimal, |value| Value::Text(value.to_string()));
    try_column!(row, name, Vec<u8>, Value::Bytes);
    try_column!(row, name, Uuid, |value| Value::Text(value.to_string()));
    try_column!(row, name, OffsetDateTime, Value::DateTime);
    try_column!(row, name, PrimitiveDateTime, |value| {
        Value::DateTime(value.assume_utc())
    });
    try_column!(row, name, Date, |value| Value::Text(value.to_string()));
    try_column!(row, name, JsonValue, Value::Json);
    None
}

/// Decodes every column of a row, in select order.
pub(crate) fn decode_row(row: &QueryResult) -> TheoriaResult<IndexMap<String, Value>> {
    let names = row.column_names();
    let mut attributes = IndexMap::with_capacity(names.len());
    for name in names {
        let value = decode_column(row, &name).ok_or_else(|| {
            TheoriaError::storage(format!("column [{name}] has an unsupported type"))
        })?;
        attributes.insert(name, value);
    }
    Ok(attributes)
}

/// Type-level API of one registered type: the static side of a model class.
pub struct ModelHandle<F: RecordFamily> {
    store: TheoriaStore,
    def: Arc<ModelDef>,
    _family: PhantomData<fn() -> F>,
}

impl<F: RecordFamily> Clone for ModelHandle<F> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            def: Arc::clone(&self.def),
            _family: PhantomData,
        }
    }
}

impl<F: RecordFamily> fmt::Debug for ModelHandle<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("model", &self.def.name())
            .field("family", &F::FAMILY)
            .finish()
    }
}

impl<F: RecordFamily> ModelHandle<F> {
    pub fn def(&self) -> &Arc<ModelDef> {
        &self.def
    }

    pub fn query(&self) -> QueryBuilder<F> {
        QueryBuilder::new(self.store.clone(), Arc::clone(&self.def))
    }

    pub fn where_eq(&self, column: impl Into<String>, value: impl Into<Value>) -> QueryBuilder<F> {
        self.query().where_eq(column, value)
    }

    pub fn with<I, S>(&self, paths: I) -> QueryBuilder<F>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.query().with(paths)
    }

    pub fn scope(&self, name: &str, args: &[Value]) -> TheoriaResult<QueryBuilder<F>> {
        self.query().scope(name, args)
    }

    pub fn has_named_scope(&self, name: &str) -> bool {
        self.def.has_named_scope(name)
    }

    pub async fn all(&self) -> TheoriaResult<F::Collection> {
        self.query().get().await
    }

    pub async fn first(&self) -> TheoriaResult<Option<F::Record>> {
        self.query().first().await
    }

    pub async fn count(&self) -> TheoriaResult<u64> {
        self.query().count().await
    }

    pub async fn find(&self, key: impl Into<Value>) -> TheoriaResult<Option<F::Record>> {
        self.query().find(key).await
    }

    pub async fn find_or_fail(&self, key: impl Into<Value>) -> TheoriaResult<F::Record> {
        self.query().find_or_fail(key).await
    }

    pub async fn find_many<I, V>(&self, keys: I) -> TheoriaResult<F::Collection>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.query().find_many(keys).await
    }

    /// Builds records from rows fetched elsewhere, as if they came from the database.
    pub fn hydrate<I>(&self, rows: I) -> F::Collection
    where
        I: IntoIterator<Item = IndexMap<String, Value>>,
    {
        F::collect(
            rows.into_iter()
                .map(|raw| F::hydrate(Arc::clone(&self.def), &self.store, raw, None))
                .collect(),
        )
    }

    /// Hydrates rows and eager loads `paths` onto them.
    pub async fn hydrate_with<I, P, S>(&self, rows: I, paths: P) -> TheoriaResult<F::Collection>
    where
        I: IntoIterator<Item = IndexMap<String, Value>>,
        P: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut records: Vec<F::Record> = rows
            .into_iter()
            .map(|raw| F::hydrate(Arc::clone(&self.def), &self.store, raw, None))
            .collect();
        let tree = EagerTree::parse(paths);
        crate::eager::load::<F>(&self.store, &self.def, &mut records, &tree).await?;
        Ok(F::collect(records))
    }
}

impl ModelHandle<Native> {
    /// Unsaved record.
    pub fn make(&self, attributes: IndexMap<String, Value>) -> NativeRecord {
        NativeRecord::make(Arc::clone(&self.def), self.store.clone(), attributes)
    }

    pub async fn create(&self, attributes: IndexMap<String, Value>) -> TheoriaResult<NativeRecord> {
        let mut record = self.make(attributes);
        record.save().await?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use sea_orm::{ConnectionTrait, Database};
    use tempfile::{TempDir, tempdir};

    use super::TheoriaStore;
    use crate::{Attributes, ModelBuilder, Registry, Value};

    async fn store() -> (TempDir, TheoriaStore) {
        let dir = tempdir().expect("tempdir");
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("notes.sqlite").display());
        let conn = Database::connect(url).await.expect("connect");
        for sql in [
            "CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT, score REAL, raw BLOB)",
            "INSERT INTO notes (id, body, score, raw) VALUES (1, 'hello', 1.5, x'0102')",
            "INSERT INTO notes (id, body, score, raw) VALUES (2, NULL, NULL, NULL)",
        ] {
            conn.execute_unprepared(sql).await.expect("seed");
        }
        let registry = Registry::builder()
            .model(ModelBuilder::read_only("Note"))
            .model(ModelBuilder::native("Draft").table("notes"))
            .build()
            .expect("registry");
        (dir, TheoriaStore::from_connection(conn, registry))
    }

    #[tokio::test]
    async fn opens_from_a_base_dir_with_default_config() {
        let dir = tempdir().expect("tempdir");
        let store = TheoriaStore::open(dir.path(), Registry::default())
            .await
            .expect("open store");
        assert!(dir.path().join("theoria.json").exists());
        assert!(dir.path().join("theoria.sqlite").exists());
        assert_eq!(store.per_page(), 15);
        assert_eq!(store.statement_count(), 0);
    }

    #[tokio::test]
    async fn decodes_rows_by_column_type() {
        let (_dir, store) = store().await;
        let notes = store.model("Note").expect("handle").all().await.expect("all");
        assert_eq!(notes.count(), 2);
        let first = notes.first().expect("first");
        assert_eq!(first.get_raw("id"), Value::Int(1));
        assert_eq!(first.get_raw("body"), Value::from("hello"));
        assert_eq!(first.get_raw("score"), Value::Float(1.5));
        assert_eq!(first.get_raw("raw"), Value::Bytes(vec![1, 2]));
        let second = notes.get(1).expect("second");
        assert!(second.get_raw("body").is_null());
        assert_eq!(store.statement_count(), 1);
    }

    #[tokio::test]
    async fn handles_check_the_registered_family() {
        let (_dir, store) = store().await;
        assert!(store.native("Note").expect_err("read-only").is_configuration());
        assert!(store.model("Draft").expect_err("native").is_configuration());
        assert!(store.model("Missing").expect_err("unknown").is_configuration());
        let draft = store.native("Draft").expect("native").find(1).await.expect("find");
        assert_eq!(draft.expect("row").get_raw("body"), Value::from("hello"));
    }

    #[tokio::test]
    async fn unknown_named_connection_is_configuration() {
        let (_dir, store) = store().await;
        let err = store.backend(Some("reporting")).expect_err("missing");
        assert!(err.is_configuration());
        let extended = store.with_connection("reporting", store.connection().clone());
        assert!(extended.backend(Some("reporting")).is_ok());
    }
}
