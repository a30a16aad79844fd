pub mod builder;
pub mod cast;
pub mod collection;
pub mod config;
pub mod eager;
pub mod error;
pub mod model;
pub mod naming;
pub mod native;
pub mod pagination;
pub mod pivot;
pub mod query;
pub mod record;
pub mod registry;
pub mod relation;
pub mod store;
pub mod value;

pub use builder::{Native, QueryBuilder, ReadOnly, RecordFamily};
pub use cast::{Cast, CastsAttribute};
pub use collection::Collection;
pub use config::{DatabaseConfig, PoolConfig, TheoriaConfig};
pub use eager::{Constraint, EagerTree};
pub use error::{TheoriaError, TheoriaResult, Violation};
pub use model::{
    Accessor, Attributes, Family, GlobalScope, KeyType, LocalScope, ModelBuilder, ModelDef,
};
pub use native::NativeRecord;
pub use pagination::{Cursor, CursorPage, LengthAwarePage, SimplePage};
pub use pivot::Pivot;
pub use query::{Boolean, DatePart, Direction, JoinKind, Op, Query, QueryFilters};
pub use record::{ReadOnlyGuard, Record, Related};
pub use registry::{Registry, RegistryBuilder};
pub use relation::{
    PivotSpec, Relation, RelationBuilder, RelationDecl, RelationKind, RelationQuery, SyncChanges,
    ThroughSpec,
};
pub use store::{ModelHandle, TheoriaStore};
pub use value::Value;

/// Traits needed to call filters and attribute readers on records and builders.
pub mod prelude {
    pub use crate::{Attributes, QueryFilters, ReadOnlyGuard};
}
