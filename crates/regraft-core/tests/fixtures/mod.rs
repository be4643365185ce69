//! Shared fixture: a file-backed database with a small ERP-shaped schema
//! (entities, join tables, polymorphic sites, encoded references, an
//! external-name registry) plus the catalog wiring for all of it.

use regraft_core::{
    catalog::{ColumnKind, DefaultStoreSpec, Delegation, MemoryCatalog, SpecialRemoval},
    config::EngineConfig,
    polyref::RefSite,
    registry::SqlNameRegistry,
    session::{DbConnection, DbPool, MigrationSession, open_pool},
};
use std::sync::Arc;
use tempfile::TempDir;

pub struct Fixture {
    pub session: MigrationSession,
    pub pool: DbPool,
    pub catalog: MemoryCatalog,
    _dir: TempDir,
}

pub fn fixture() -> Fixture {
    fixture_with(EngineConfig::default())
}

pub fn fixture_with(config: EngineConfig) -> Fixture {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let dir = TempDir::new().expect("temp dir for fixture database");
    let path = dir.path().join("migration.db");
    let pool = open_pool(&path, 16).expect("fixture pool");

    let conn = pool.get().expect("fixture connection");
    conn.execute_batch(SCHEMA).expect("fixture schema");
    drop(conn);

    let catalog = build_catalog();
    let registry =
        SqlNameRegistry::with_defaults("external_name").expect("fixture registry spec");
    let session = MigrationSession::new(pool.clone(), Arc::new(catalog.clone()), config)
        .with_registry(Arc::new(registry));

    Fixture {
        session,
        pool,
        catalog,
        _dir: dir,
    }
}

const SCHEMA: &str = "
    CREATE TABLE partner (id INTEGER PRIMARY KEY, name TEXT);
    CREATE TABLE customer (id INTEGER PRIMARY KEY, name TEXT);
    CREATE TABLE project (id INTEGER PRIMARY KEY, name TEXT);
    CREATE TABLE task (
        id INTEGER PRIMARY KEY,
        name TEXT,
        tag_id INTEGER REFERENCES tag(id)
    );
    CREATE TABLE app_user (
        id INTEGER PRIMARY KEY,
        login TEXT,
        partner_id INTEGER REFERENCES partner(id)
    );
    CREATE TABLE sale_order (
        id INTEGER PRIMARY KEY,
        partner_id INTEGER REFERENCES partner(id) ON DELETE RESTRICT
    );
    CREATE TABLE tag (id INTEGER PRIMARY KEY, name TEXT);
    CREATE TABLE partner_tag (
        partner_id INTEGER NOT NULL REFERENCES partner(id) ON DELETE CASCADE,
        tag_id INTEGER NOT NULL REFERENCES tag(id) ON DELETE CASCADE,
        PRIMARY KEY (partner_id, tag_id)
    );
    CREATE TABLE partner_rel (
        src_id INTEGER NOT NULL REFERENCES partner(id) ON DELETE CASCADE,
        dst_id INTEGER NOT NULL REFERENCES partner(id) ON DELETE CASCADE,
        PRIMARY KEY (src_id, dst_id)
    );
    CREATE TABLE attachment (
        id INTEGER PRIMARY KEY,
        res_model TEXT,
        res_id INTEGER,
        name TEXT
    );
    CREATE TABLE subscription (
        id INTEGER PRIMARY KEY,
        res_model TEXT,
        res_id INTEGER,
        subscriber TEXT
    );
    CREATE UNIQUE INDEX subscription_uniq
        ON subscription (res_model, res_id, subscriber);
    CREATE TABLE audit_log (
        id INTEGER PRIMARY KEY,
        res_model_ord INTEGER,
        res_id INTEGER,
        note TEXT
    );
    CREATE TABLE message (id INTEGER PRIMARY KEY, target_ref TEXT);
    CREATE TABLE partner_note (id INTEGER PRIMARY KEY, res_id INTEGER, body TEXT);
    CREATE TABLE menu (
        id INTEGER PRIMARY KEY,
        parent_id INTEGER,
        name TEXT
    );
    CREATE TABLE doc_view (
        id INTEGER PRIMARY KEY,
        parent_id INTEGER,
        active INTEGER NOT NULL DEFAULT 1,
        name TEXT
    );
    CREATE TABLE default_store (
        id INTEGER PRIMARY KEY,
        entity TEXT NOT NULL,
        field TEXT NOT NULL,
        value TEXT
    );
    CREATE TABLE external_name (
        name TEXT PRIMARY KEY,
        entity TEXT NOT NULL,
        res_id INTEGER NOT NULL,
        protected INTEGER NOT NULL DEFAULT 0
    );
    CREATE TABLE orphan (id INTEGER PRIMARY KEY, name TEXT);
";

fn build_catalog() -> MemoryCatalog {
    let mut catalog = MemoryCatalog::new();
    catalog
        .register_entity("partner", "partner")
        .register_entity("customer", "customer")
        .register_entity("project", "project")
        .register_entity("task", "task")
        .register_entity("user", "app_user")
        .register_entity("order", "sale_order")
        .register_entity("tag", "tag")
        .register_entity("menu", "menu")
        .register_entity("view", "doc_view")
        .register_entity("orphan", "orphan");

    catalog.hint_column("task", "tag_id", ColumnKind::ManyToOne);

    catalog
        .add_reference_site(RefSite::unbound_by_name("attachment", "res_id", "res_model"))
        .add_reference_site(RefSite::unbound_by_name(
            "subscription",
            "res_id",
            "res_model",
        ))
        .add_reference_site(RefSite::unbound_by_ordinal(
            "audit_log",
            "res_id",
            "res_model_ord",
        ))
        .add_reference_site(RefSite::unbound_by_name("external_name", "res_id", "entity"))
        .add_reference_site(RefSite::bound("partner_note", "res_id", "partner"));

    catalog.add_encoded_column("message", "target_ref");

    catalog.set_default_store(DefaultStoreSpec {
        table: "default_store".to_owned(),
        entity_column: "entity".to_owned(),
        field_column: "field".to_owned(),
        value_column: "value".to_owned(),
    });

    catalog.add_delegation(
        "partner",
        Delegation {
            entity: "user".to_owned(),
            via_column: "partner_id".to_owned(),
        },
    );

    catalog.set_special_removal(
        "menu",
        SpecialRemoval::MenuTree {
            parent_column: "parent_id".to_owned(),
        },
    );
    catalog.set_special_removal(
        "view",
        SpecialRemoval::DocumentTree {
            parent_column: "parent_id".to_owned(),
            active_column: "active".to_owned(),
        },
    );

    catalog
}

impl Fixture {
    pub fn conn(&self) -> DbConnection {
        self.pool.get().expect("fixture connection")
    }

    pub fn exec(&self, sql: &str) {
        self.conn().execute_batch(sql).expect("fixture statement");
    }

    pub fn count(&self, sql: &str) -> i64 {
        self.conn()
            .query_row(sql, [], |row| row.get(0))
            .expect("fixture count query")
    }

    pub fn ids(&self, sql: &str) -> Vec<i64> {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql).expect("fixture id query");
        let ids = stmt
            .query_map([], |row| row.get::<_, i64>(0))
            .expect("fixture id rows")
            .collect::<Result<Vec<_>, _>>()
            .expect("fixture id values");
        ids
    }

    /// Stable textual dump of a whole table, for byte-identical assertions.
    pub fn snapshot(&self, table: &str) -> Vec<String> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!("SELECT * FROM \"{table}\" ORDER BY rowid"))
            .expect("fixture snapshot query");
        let width = stmt.column_count();
        let rows = stmt
            .query_map([], |row| {
                let mut parts = Vec::with_capacity(width);
                for index in 0..width {
                    parts.push(format!("{:?}", row.get_ref(index)?));
                }
                Ok(parts.join("|"))
            })
            .expect("fixture snapshot rows")
            .collect::<Result<Vec<_>, _>>()
            .expect("fixture snapshot values");
        rows
    }
}
