//! Runtime schema discovery.
//!
//! Tables and columns are data looked up at run time, never compile-time
//! identifiers. All facts are memoized per table for the duration of one
//! migration run; schema does not change mid-run.

pub mod relation;

pub use relation::{ForeignKeyEdge, OnDelete, RelationKind};

use crate::{
    error::{EngineError, ErrorOrigin, SqlResultExt},
    mapping::ID_MAP_TABLE,
    sql::Ident,
};
use rusqlite::Connection;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tracing::debug;

///
/// ColumnFacts
///

#[derive(Clone, Debug)]
pub struct ColumnFacts {
    pub name: String,
    pub declared_type: String,
    /// Generated columns are not updatable and are skipped by bulk writes.
    pub updatable: bool,
}

///
/// TableFacts
///
/// Everything the engine needs to know about one physical table: columns,
/// identity shape, outgoing single-column foreign keys, unique index sets.
///

#[derive(Clone, Debug)]
pub struct TableFacts {
    pub name: String,
    pub columns: Vec<ColumnFacts>,
    pub has_id: bool,
    pub foreign_keys: Vec<ForeignKeyEdge>,
    pub unique_indexes: Vec<Vec<String>>,
}

impl TableFacts {
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&ColumnFacts> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Ordered column names minus `ignore`.
    #[must_use]
    pub fn column_names(&self, ignore: &[&str]) -> Vec<String> {
        self.columns
            .iter()
            .filter(|c| !ignore.contains(&c.name.as_str()))
            .map(|c| c.name.clone())
            .collect()
    }
}

///
/// SchemaCache
///
/// Run-scoped read-only cache over the database catalog. Staleness across
/// runs is acceptable; a run never alters the schema it discovered.
///

#[derive(Debug, Default)]
pub struct SchemaCache {
    tables: Mutex<HashMap<String, Arc<TableFacts>>>,
    reverse: Mutex<Option<Arc<HashMap<String, Vec<ForeignKeyEdge>>>>>,
}

impl SchemaCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table_exists(&self, conn: &Connection, table: &str) -> Result<bool, EngineError> {
        if self.tables.lock().expect("schema cache poisoned").contains_key(table) {
            return Ok(true);
        }
        let n: i64 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [table],
                |row| row.get(0),
            )
            .at(ErrorOrigin::Introspect)?;
        Ok(n > 0)
    }

    /// Memoized facts for one table. Schema error if the table is missing.
    pub fn facts(&self, conn: &Connection, table: &str) -> Result<Arc<TableFacts>, EngineError> {
        if let Some(facts) = self.tables.lock().expect("schema cache poisoned").get(table) {
            return Ok(Arc::clone(facts));
        }
        let facts = Arc::new(load_facts(conn, table)?);
        self.tables
            .lock()
            .expect("schema cache poisoned")
            .insert(table.to_owned(), Arc::clone(&facts));
        Ok(facts)
    }

    /// Ordered column names of `table` minus `ignore`.
    pub fn columns(
        &self,
        conn: &Connection,
        table: &str,
        ignore: &[&str],
    ) -> Result<Vec<String>, EngineError> {
        Ok(self.facts(conn, table)?.column_names(ignore))
    }

    /// Whether `column` exists on `table` and accepts bulk updates.
    /// Missing columns report `false`; callers decide whether that is fatal.
    pub fn column_updatable(
        &self,
        conn: &Connection,
        table: &str,
        column: &str,
    ) -> Result<bool, EngineError> {
        Ok(self
            .facts(conn, table)?
            .column(column)
            .is_some_and(|c| c.updatable))
    }

    /// Foreign-key edges whose *target* is `table`'s id column.
    /// The reverse map is built by one full-schema scan and cached.
    pub fn referencing(
        &self,
        conn: &Connection,
        table: &str,
    ) -> Result<Vec<ForeignKeyEdge>, EngineError> {
        let map = self.reverse_map(conn)?;
        Ok(map
            .get(table)
            .map(|edges| {
                edges
                    .iter()
                    .filter(|e| e.target_column == "id")
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Unique index column sets on `table` containing at least `columns`.
    pub fn unique_indexes_with(
        &self,
        conn: &Connection,
        table: &str,
        columns: &[&str],
    ) -> Result<Vec<Vec<String>>, EngineError> {
        let facts = self.facts(conn, table)?;
        Ok(facts
            .unique_indexes
            .iter()
            .filter(|index| columns.iter().all(|c| index.iter().any(|ic| ic == c)))
            .cloned()
            .collect())
    }

    /// `Some((min, max))` of the table's id column, `None` when empty.
    pub fn id_bounds(
        &self,
        conn: &Connection,
        table: &str,
    ) -> Result<Option<(i64, i64)>, EngineError> {
        let facts = self.facts(conn, table)?;
        if !facts.has_id {
            return Err(EngineError::new(
                crate::error::ErrorClass::Schema,
                ErrorOrigin::Introspect,
                format!("table '{table}' has no simple id column"),
            ));
        }
        let ident = Ident::new(table)?;
        let bounds: (Option<i64>, Option<i64>) = conn
            .query_row(
                &format!("SELECT min(\"id\"), max(\"id\") FROM {ident}"),
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .at(ErrorOrigin::Introspect)?;
        match bounds {
            (Some(lo), Some(hi)) => Ok(Some((lo, hi))),
            _ => Ok(None),
        }
    }

    fn reverse_map(
        &self,
        conn: &Connection,
    ) -> Result<Arc<HashMap<String, Vec<ForeignKeyEdge>>>, EngineError> {
        if let Some(map) = self.reverse.lock().expect("schema cache poisoned").as_ref() {
            return Ok(Arc::clone(map));
        }

        let mut map: HashMap<String, Vec<ForeignKeyEdge>> = HashMap::new();
        for table in all_tables(conn)? {
            if Ident::new(&table).is_err() {
                debug!(%table, "skipping table with non-plain name in reverse scan");
                continue;
            }
            let facts = self.facts(conn, &table)?;
            for edge in &facts.foreign_keys {
                map.entry(edge.target_table.clone())
                    .or_default()
                    .push(edge.clone());
            }
        }

        let map = Arc::new(map);
        *self.reverse.lock().expect("schema cache poisoned") = Some(Arc::clone(&map));
        Ok(map)
    }
}

fn all_tables(conn: &Connection) -> Result<Vec<String>, EngineError> {
    let mut stmt = conn
        .prepare(
            "SELECT name FROM sqlite_master \
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND name != ?1 \
             ORDER BY name",
        )
        .at(ErrorOrigin::Introspect)?;
    let names = stmt
        .query_map([ID_MAP_TABLE], |row| row.get::<_, String>(0))
        .at(ErrorOrigin::Introspect)?
        .collect::<Result<Vec<_>, _>>()
        .at(ErrorOrigin::Introspect)?;
    Ok(names)
}

fn load_facts(conn: &Connection, table: &str) -> Result<TableFacts, EngineError> {
    let exists: i64 = conn
        .query_row(
            "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |row| row.get(0),
        )
        .at(ErrorOrigin::Introspect)?;
    if exists == 0 {
        return Err(EngineError::missing_table(ErrorOrigin::Introspect, table));
    }
    let ident = Ident::new(table)?;

    // hidden: 0 = plain, 1 = virtual-table internal, 2/3 = generated
    let mut columns = Vec::new();
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_xinfo({ident})"))
        .at(ErrorOrigin::Introspect)?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>("name")?,
                row.get::<_, String>("type")?,
                row.get::<_, i64>("hidden")?,
            ))
        })
        .at(ErrorOrigin::Introspect)?;
    for row in rows {
        let (name, declared_type, hidden) = row.at(ErrorOrigin::Introspect)?;
        if hidden == 1 {
            continue;
        }
        columns.push(ColumnFacts {
            name,
            declared_type,
            updatable: hidden == 0,
        });
    }
    let has_id = columns.iter().any(|c| c.name == "id");

    let foreign_keys = load_foreign_keys(conn, table, &ident)?;
    let unique_indexes = load_unique_indexes(conn, &ident)?;

    Ok(TableFacts {
        name: table.to_owned(),
        columns,
        has_id,
        foreign_keys,
        unique_indexes,
    })
}

fn load_foreign_keys(
    conn: &Connection,
    table: &str,
    ident: &Ident,
) -> Result<Vec<ForeignKeyEdge>, EngineError> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA foreign_key_list({ident})"))
        .at(ErrorOrigin::Introspect)?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>("id")?,
                row.get::<_, i64>("seq")?,
                row.get::<_, String>("table")?,
                row.get::<_, String>("from")?,
                row.get::<_, Option<String>>("to")?,
                row.get::<_, String>("on_delete")?,
            ))
        })
        .at(ErrorOrigin::Introspect)?;

    let mut edges: Vec<(i64, ForeignKeyEdge)> = Vec::new();
    let mut composite: Vec<i64> = Vec::new();
    for row in rows {
        let (fk_id, seq, target, from, to, on_delete) = row.at(ErrorOrigin::Introspect)?;
        if seq > 0 {
            // composite foreign keys are outside the model
            composite.push(fk_id);
            continue;
        }
        edges.push((
            fk_id,
            ForeignKeyEdge {
                source_table: table.to_owned(),
                source_column: from,
                target_table: target,
                // an omitted target column references the primary key
                target_column: to.unwrap_or_else(|| "id".to_owned()),
                on_delete: OnDelete::parse(&on_delete),
            },
        ));
    }
    Ok(edges
        .into_iter()
        .filter(|(fk_id, _)| !composite.contains(fk_id))
        .map(|(_, edge)| edge)
        .collect())
}

fn load_unique_indexes(conn: &Connection, ident: &Ident) -> Result<Vec<Vec<String>>, EngineError> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA index_list({ident})"))
        .at(ErrorOrigin::Introspect)?;
    let index_names = stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>("name")?, row.get::<_, i64>("unique")?))
        })
        .at(ErrorOrigin::Introspect)?
        .collect::<Result<Vec<_>, _>>()
        .at(ErrorOrigin::Introspect)?;

    let mut indexes = Vec::new();
    for (name, unique) in index_names {
        if unique == 0 {
            continue;
        }
        let Ok(index_ident) = Ident::new(&name) else {
            continue;
        };
        let mut info = conn
            .prepare(&format!("PRAGMA index_info({index_ident})"))
            .at(ErrorOrigin::Introspect)?;
        let cols = info
            .query_map([], |row| row.get::<_, Option<String>>("name"))
            .at(ErrorOrigin::Introspect)?
            .collect::<Result<Vec<_>, _>>()
            .at(ErrorOrigin::Introspect)?;
        // expression index members come back NULL; such indexes are opaque
        if cols.iter().any(Option::is_none) {
            continue;
        }
        indexes.push(cols.into_iter().flatten().collect());
    }
    Ok(indexes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch(
            "CREATE TABLE tag (id INTEGER PRIMARY KEY, name TEXT);
             CREATE TABLE partner (id INTEGER PRIMARY KEY, name TEXT);
             CREATE TABLE partner_tag (
                 partner_id INTEGER NOT NULL REFERENCES partner(id) ON DELETE CASCADE,
                 tag_id INTEGER NOT NULL REFERENCES tag(id) ON DELETE CASCADE,
                 PRIMARY KEY (partner_id, tag_id)
             );
             CREATE TABLE attachment (
                 id INTEGER PRIMARY KEY,
                 res_model TEXT,
                 res_id INTEGER,
                 kind TEXT
             );
             CREATE UNIQUE INDEX attachment_uniq ON attachment (res_model, res_id, kind);",
        )
        .expect("seed schema");
        conn
    }

    #[test]
    fn facts_report_columns_identity_and_edges() {
        let conn = seeded();
        let cache = SchemaCache::new();

        let jt = cache.facts(&conn, "partner_tag").expect("join table facts");
        assert!(!jt.has_id, "a pair-keyed join table has no simple id");
        assert_eq!(jt.column_names(&["tag_id"]), vec!["partner_id".to_owned()]);
        assert_eq!(jt.foreign_keys.len(), 2);
        assert!(jt.foreign_keys.iter().all(|e| e.on_delete.is_cascade()));

        let tag = cache.facts(&conn, "tag").expect("tag facts");
        assert!(tag.has_id);
    }

    #[test]
    fn missing_table_raises_schema_error() {
        let conn = seeded();
        let cache = SchemaCache::new();
        let err = cache
            .facts(&conn, "not_there")
            .expect_err("missing tables must not be silently tolerated");
        assert!(err.is_schema(), "{err:?}");
    }

    #[test]
    fn reverse_scan_finds_edges_targeting_a_table() {
        let conn = seeded();
        let cache = SchemaCache::new();
        let edges = cache.referencing(&conn, "tag").expect("reverse edges");
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].source_table, "partner_tag");
        assert_eq!(edges[0].source_column, "tag_id");
        assert_eq!(edges[0].target_column, "id");
    }

    #[test]
    fn unique_indexes_filter_on_contained_columns() {
        let conn = seeded();
        let cache = SchemaCache::new();
        let hits = cache
            .unique_indexes_with(&conn, "attachment", &["res_id", "res_model"])
            .expect("unique index lookup");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0], vec!["res_model", "res_id", "kind"]);

        let none = cache
            .unique_indexes_with(&conn, "attachment", &["res_id", "name"])
            .expect("unique index lookup");
        assert!(none.is_empty());
    }

    #[test]
    fn id_bounds_distinguish_empty_from_missing_id() {
        let conn = seeded();
        let cache = SchemaCache::new();

        assert_eq!(cache.id_bounds(&conn, "tag").expect("empty table"), None);

        conn.execute_batch("INSERT INTO tag (id, name) VALUES (3, 'a'), (9, 'b')")
            .expect("seed rows");
        // facts cache is per table name, bounds query always hits the db
        assert_eq!(
            cache.id_bounds(&conn, "tag").expect("bounds"),
            Some((3, 9))
        );

        let err = cache
            .id_bounds(&conn, "partner_tag")
            .expect_err("no id column must be a schema error");
        assert!(err.is_schema(), "{err:?}");
    }
}
