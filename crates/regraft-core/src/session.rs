use crate::{
    catalog::Catalog,
    collapse::CollapseExecutor,
    config::EngineConfig,
    error::{EngineError, ErrorOrigin, SqlResultExt},
    exec::BatchExecutor,
    polyref::ReferenceLocator,
    registry::NameRegistry,
    remove::RemoveExecutor,
    rewrite::{Rewrite, RewriteExecutor},
    schema::SchemaCache,
    sql::{Ident, SqlExpr},
};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use std::{path::Path, sync::Arc, time::Duration};

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConnection = PooledConnection<SqliteConnectionManager>;

/// Open a pool suitable for partitioned migration work: WAL journaling so
/// worker connections read consistently, foreign keys enforced, and a busy
/// timeout long enough for partition writers to serialize.
pub fn open_pool(path: &Path, max_size: u32) -> Result<DbPool, EngineError> {
    let manager = SqliteConnectionManager::file(path).with_init(|conn| {
        conn.busy_timeout(Duration::from_secs(30))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        Ok(())
    });
    Pool::builder()
        .max_size(max_size)
        .build(manager)
        .at(ErrorOrigin::Session)
}

///
/// MigrationSession
///
/// A handle for one migration run: the connection pool, the external
/// collaborators, and the run-scoped schema caches. Entry point for
/// `rewrite`, `remove`, and `collapse`.
///

pub struct MigrationSession {
    pool: DbPool,
    config: EngineConfig,
    catalog: Arc<dyn Catalog>,
    registry: Option<Arc<dyn NameRegistry>>,
    schema: SchemaCache,
    locator: ReferenceLocator,
}

impl MigrationSession {
    #[must_use]
    pub fn new(pool: DbPool, catalog: Arc<dyn Catalog>, config: EngineConfig) -> Self {
        Self {
            pool,
            config,
            catalog,
            registry: None,
            schema: SchemaCache::new(),
            locator: ReferenceLocator::new(),
        }
    }

    /// Convenience constructor: open a pool on `path` sized for the
    /// configured worker count.
    pub fn open(
        path: &Path,
        catalog: Arc<dyn Catalog>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let size = u32::try_from(config.max_workers).unwrap_or(8) + 2;
        let pool = open_pool(path, size)?;
        Ok(Self::new(pool, catalog, config))
    }

    #[must_use]
    pub fn with_registry(mut self, registry: Arc<dyn NameRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub const fn schema(&self) -> &SchemaCache {
        &self.schema
    }

    /// The partitioned batch-execution facility, usable directly by
    /// migration steps for their own table-wide statements.
    #[must_use]
    pub const fn batch(&self) -> BatchExecutor<'_> {
        BatchExecutor::new(&self.pool, &self.schema, &self.config)
    }

    /// Propagate an id remap through every reference to the source entity.
    pub fn rewrite(&self, request: Rewrite<'_>) -> Result<(), EngineError> {
        RewriteExecutor::new(self).execute(&request)
    }

    /// Delete records and every dependent reachable through the graph.
    /// Returns the number of rows deleted across all touched entities.
    pub fn remove(&self, entity: &str, ids: &[i64]) -> Result<u64, EngineError> {
        RemoveExecutor::new(self).execute(entity, ids)
    }

    /// Collapse duplicate groups of `entity` (grouped by `uniqueness_key`,
    /// survivor chosen by `order_key`) and redirect all referrers.
    pub fn collapse(
        &self,
        entity: &str,
        uniqueness_key: &str,
        order_key: &str,
    ) -> Result<(), EngineError> {
        let uniq = SqlExpr::new(uniqueness_key)?;
        let order = SqlExpr::new(order_key)?;
        CollapseExecutor::new(self).execute(entity, &uniq, &order)
    }

    pub(crate) fn conn(&self) -> Result<DbConnection, EngineError> {
        self.pool.get().at(ErrorOrigin::Session)
    }

    pub(crate) fn catalog(&self) -> &dyn Catalog {
        self.catalog.as_ref()
    }

    pub(crate) fn registry(&self) -> Option<&dyn NameRegistry> {
        self.registry.as_deref()
    }

    pub(crate) const fn locator(&self) -> &ReferenceLocator {
        &self.locator
    }

    /// Resolve an entity to its validated table identifier.
    pub(crate) fn table_ident_of(
        &self,
        origin: ErrorOrigin,
        entity: &str,
    ) -> Result<Ident, EngineError> {
        let table = self
            .catalog
            .table_of(entity)
            .ok_or_else(|| EngineError::unknown_entity(origin, entity))?;
        Ident::new(&table)
    }
}
