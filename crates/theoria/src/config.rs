use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use indexmap::IndexMap;
use sea_orm::ConnectOptions;
use serde::{Deserialize, Serialize};

use crate::{TheoriaError, TheoriaResult};

const DEFAULT_CONFIG_NAME: &str = "theoria.json";
const DEFAULT_DB_NAME: &str = "theoria.sqlite";
const DEFAULT_PER_PAGE: u64 = 15;
const DEFAULT_LAZY_CHUNK_SIZE: u64 = 1000;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum DatabaseConfig {
    Sqlite { path: Option<String> },
    Postgres { url: String },
    Mysql { url: String },
}

impl DatabaseConfig {
    pub fn backend_name(&self) -> &'static str {
        match self {
            DatabaseConfig::Sqlite { .. } => "sqlite",
            DatabaseConfig::Postgres { .. } => "postgres",
            DatabaseConfig::Mysql { .. } => "mysql",
        }
    }

    /// Relative sqlite paths resolve against `base_dir`.
    pub fn sqlite_path(&self, base_dir: &Path) -> TheoriaResult<PathBuf> {
        match self {
            DatabaseConfig::Sqlite { path } => {
                let candidate =
                    PathBuf::from(path.clone().unwrap_or_else(|| DEFAULT_DB_NAME.to_string()));
                if candidate.is_absolute() {
                    Ok(candidate)
                } else {
                    Ok(base_dir.join(candidate))
                }
            }
            _ => Err(TheoriaError::invalid("database is not a sqlite backend")),
        }
    }

    pub fn connection_url(&self, base_dir: &Path) -> TheoriaResult<String> {
        match self {
            DatabaseConfig::Sqlite { .. } => {
                let path = self.sqlite_path(base_dir)?;
                Ok(format!("sqlite://{}?mode=rwc", path.display()))
            }
            DatabaseConfig::Postgres { url } | DatabaseConfig::Mysql { url } => Ok(url.clone()),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_connections: Option<u32>,
    pub min_connections: Option<u32>,
    pub connect_timeout_ms: Option<u64>,
    pub acquire_timeout_ms: Option<u64>,
    pub idle_timeout_ms: Option<u64>,
}

impl PoolConfig {
    pub(crate) fn apply(&self, options: &mut ConnectOptions) {
        if let Some(max) = self.max_connections {
            options.max_connections(max);
        }
        if let Some(min) = self.min_connections {
            options.min_connections(min);
        }
        if let Some(timeout_ms) = self.connect_timeout_ms {
            options.connect_timeout(Duration::from_millis(timeout_ms));
        }
        if let Some(timeout_ms) = self.acquire_timeout_ms {
            options.acquire_timeout(Duration::from_millis(timeout_ms));
        }
        if let Some(timeout_ms) = self.idle_timeout_ms {
            options.idle_timeout(Duration::from_millis(timeout_ms));
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TheoriaConfig {
    pub database: DatabaseConfig,
    pub pool: Option<PoolConfig>,
    /// Extra databases, referenced by `ModelBuilder::connection`.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub connections: IndexMap<String, DatabaseConfig>,
    pub per_page: Option<u64>,
    pub lazy_chunk_size: Option<u64>,
    pub log_statements: Option<bool>,
}

impl TheoriaConfig {
    pub fn default_sqlite(path: impl Into<String>) -> Self {
        Self {
            database: DatabaseConfig::Sqlite {
                path: Some(path.into()),
            },
            pool: None,
            connections: IndexMap::new(),
            per_page: Some(DEFAULT_PER_PAGE),
            lazy_chunk_size: Some(DEFAULT_LAZY_CHUNK_SIZE),
            log_statements: Some(true),
        }
    }

    /// Config of a store rooted at `base_dir`; the default sqlite file sits beside it.
    pub fn load_from_dir(base_dir: &Path) -> TheoriaResult<Self> {
        Self::load_or_init(base_dir, &base_dir.join(DEFAULT_DB_NAME))
    }

    /// Reads `theoria.json` from `base_dir`, writing the sqlite default on first use.
    pub fn load_or_init(base_dir: &Path, default_sqlite_path: &Path) -> TheoriaResult<Self> {
        fs::create_dir_all(base_dir)
            .map_err(|err| TheoriaError::storage(format!("create config dir: {err}")))?;
        let config_path = base_dir.join(DEFAULT_CONFIG_NAME);
        if config_path.exists() {
            let raw = fs::read_to_string(&config_path)
                .map_err(|err| TheoriaError::storage(format!("read config: {err}")))?;
            let config: TheoriaConfig = serde_json::from_str(&raw)
                .map_err(|err| TheoriaError::invalid(err.to_string()))?;
            return Ok(config);
        }
        let default = TheoriaConfig::default_sqlite(default_sqlite_path.to_string_lossy());
        let payload = serde_json::to_string_pretty(&default)
            .map_err(|err| TheoriaError::storage(format!("serialize config: {err}")))?;
        fs::write(&config_path, payload)
            .map_err(|err| TheoriaError::storage(format!("write config: {err}")))?;
        Ok(default)
    }

    pub fn backend_name(&self) -> &'static str {
        self.database.backend_name()
    }

    pub fn per_page(&self) -> u64 {
        self.per_page.unwrap_or(DEFAULT_PER_PAGE).max(1)
    }

    pub fn lazy_chunk_size(&self) -> u64 {
        self.lazy_chunk_size.unwrap_or(DEFAULT_LAZY_CHUNK_SIZE).max(1)
    }

    pub fn log_statements(&self) -> bool {
        self.log_statements.unwrap_or(true)
    }

    pub(crate) fn connect_options(
        &self,
        database: &DatabaseConfig,
        base_dir: &Path,
    ) -> TheoriaResult<ConnectOptions> {
        let mut options = ConnectOptions::new(database.connection_url(base_dir)?);
        options.sqlx_logging(false);
        if let Some(pool) = &self.pool {
            pool.apply(&mut options);
        }
        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::{DatabaseConfig, TheoriaConfig};
    use tempfile::tempdir;

    #[test]
    fn first_load_writes_defaults() {
        let dir = tempdir().expect("tempdir");
        let db = dir.path().join("data.sqlite");
        let config = TheoriaConfig::load_or_init(dir.path(), &db).expect("config");
        assert!(dir.path().join("theoria.json").exists());
        assert_eq!(config.backend_name(), "sqlite");
        assert_eq!(config.per_page(), 15);
        assert_eq!(config.lazy_chunk_size(), 1000);
        assert!(config.log_statements());

        let reloaded =
            TheoriaConfig::load_or_init(dir.path(), Path::new("ignored")).expect("reload");
        assert_eq!(reloaded, config);
    }

    #[test]
    fn base_dir_config_defaults_to_a_local_sqlite_file() {
        let dir = tempdir().expect("tempdir");
        let config = TheoriaConfig::load_from_dir(dir.path()).expect("config");
        assert_eq!(
            config.database.sqlite_path(Path::new("/elsewhere")).expect("path"),
            dir.path().join("theoria.sqlite")
        );
        assert_eq!(TheoriaConfig::load_from_dir(dir.path()).expect("reload"), config);
    }

    #[test]
    fn sqlite_urls_resolve_against_base() {
        let database = DatabaseConfig::Sqlite {
            path: Some("nested/app.sqlite".to_string()),
        };
        let url = database.connection_url(Path::new("/srv")).expect("url");
        assert_eq!(url, "sqlite:///srv/nested/app.sqlite?mode=rwc");

        let postgres = DatabaseConfig::Postgres {
            url: "postgres://localhost/app".to_string(),
        };
        assert!(postgres.sqlite_path(Path::new("/srv")).is_err());
        assert_eq!(
            postgres.connection_url(Path::new("/srv")).expect("url"),
            "postgres://localhost/app"
        );
    }

    #[test]
    fn invalid_json_is_a_validation_error() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(dir.path().join("theoria.json"), "{ nope").expect("write");
        let err = TheoriaConfig::load_or_init(dir.path(), Path::new("x.sqlite"))
            .expect_err("invalid config");
        assert!(matches!(err, crate::TheoriaError::Validation { .. }));
    }
}
