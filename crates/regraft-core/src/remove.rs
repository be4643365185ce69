//! Cascading removal.
//!
//! Removing records pulls in every dependent reachable through delegation
//! columns, then scrubs polymorphic and encoded references to the removed
//! ids. Two entity kinds need bespoke handling (menu subtrees, document
//! trees); this is a closed set baked into the recursion.

use crate::{
    catalog::SpecialRemoval,
    error::{EngineError, ErrorOrigin, SqlResultExt},
    session::{DbConnection, MigrationSession},
    sql::{Ident, id_list},
};
use rusqlite::params_from_iter;
use tracing::{debug, info};

const ORIGIN: ErrorOrigin = ErrorOrigin::Remove;

/// Bound on inlined id lists; keeps statements well under driver limits.
const ID_CHUNK: usize = 500;

///
/// RemoveExecutor
///

pub(crate) struct RemoveExecutor<'a> {
    session: &'a MigrationSession,
}

impl<'a> RemoveExecutor<'a> {
    pub const fn new(session: &'a MigrationSession) -> Self {
        Self { session }
    }

    pub fn execute(&self, entity: &str, ids: &[i64]) -> Result<u64, EngineError> {
        let conn = self.session.conn()?;
        let deleted = self.remove_entity(&conn, entity, ids)?;
        info!(
            entity,
            requested = ids.len(),
            deleted,
            "cascading removal finished"
        );
        Ok(deleted)
    }

    fn remove_entity(
        &self,
        conn: &DbConnection,
        entity: &str,
        ids: &[i64],
    ) -> Result<u64, EngineError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let table = self.session.table_ident_of(ORIGIN, entity)?;

        let ids: Vec<i64> = match self.session.catalog().special_removal(entity) {
            Some(SpecialRemoval::MenuTree { parent_column }) => {
                self.expand_subtree(conn, &table, &parent_column, ids)?
            }
            Some(SpecialRemoval::DocumentTree {
                parent_column,
                active_column,
            }) => {
                self.deactivate_descendants(conn, &table, &parent_column, &active_column, ids)?;
                ids.to_vec()
            }
            None => ids.to_vec(),
        };

        let mut deleted = 0u64;

        // dependents extend our rows; they go first
        for delegation in self.session.catalog().delegations(entity) {
            let dep_table = self.session.table_ident_of(ORIGIN, &delegation.entity)?;
            let facts = self.session.schema().facts(conn, dep_table.as_str())?;
            if facts.column(&delegation.via_column).is_none() {
                // a partially-removed module can leave the table without it
                debug!(
                    entity = %delegation.entity,
                    column = %delegation.via_column,
                    "delegation column missing, dependent skipped"
                );
                continue;
            }
            let via = Ident::new(&delegation.via_column)?;
            let mut dependent_ids: Vec<i64> = Vec::new();
            for chunk in ids.chunks(ID_CHUNK) {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT \"id\" FROM {dep_table} WHERE {via} IN ({list})",
                        list = id_list(chunk),
                    ))
                    .at(ORIGIN)?;
                let found = stmt
                    .query_map([], |row| row.get::<_, i64>(0))
                    .at(ORIGIN)?
                    .collect::<Result<Vec<_>, _>>()
                    .at(ORIGIN)?;
                dependent_ids.extend(found);
            }
            deleted += self.remove_entity(conn, &delegation.entity, &dependent_ids)?;
        }

        for chunk in ids.chunks(ID_CHUNK) {
            let rows = conn
                .execute(
                    &format!("DELETE FROM {table} WHERE \"id\" IN ({})", id_list(chunk)),
                    [],
                )
                .at(ORIGIN)?;
            deleted += rows as u64;
        }

        self.scrub_reference_sites(conn, entity, &ids)?;
        self.scrub_encoded_references(conn, entity, &ids)?;
        self.scrub_default_store(conn, entity, table.as_str(), &ids)?;

        if let Some(registry) = self.session.registry() {
            registry.delete_where(conn, entity, &ids)?;
        }
        Ok(deleted)
    }

    /// Menu-style entities: removal swallows the whole subtree.
    fn expand_subtree(
        &self,
        conn: &DbConnection,
        table: &Ident,
        parent_column: &str,
        roots: &[i64],
    ) -> Result<Vec<i64>, EngineError> {
        let parent = Ident::new(parent_column)?;
        let mut stmt = conn
            .prepare(&format!(
                "WITH RECURSIVE subtree(\"id\") AS ( \
                     SELECT \"id\" FROM {table} WHERE \"id\" IN ({roots}) \
                     UNION \
                     SELECT c.\"id\" FROM {table} AS c \
                       JOIN subtree AS s ON c.{parent} = s.\"id\" \
                 ) SELECT \"id\" FROM subtree",
                roots = id_list(roots),
            ))
            .at(ORIGIN)?;
        let all = stmt
            .query_map([], |row| row.get::<_, i64>(0))
            .at(ORIGIN)?
            .collect::<Result<Vec<_>, _>>()
            .at(ORIGIN)?;
        if all.len() > roots.len() {
            debug!(
                table = table.as_str(),
                roots = roots.len(),
                expanded = all.len(),
                "menu removal expanded to subtree"
            );
        }
        Ok(all)
    }

    /// Document-style entities: customized descendants are switched off
    /// transitively; only the requested rows are deleted afterwards.
    fn deactivate_descendants(
        &self,
        conn: &DbConnection,
        table: &Ident,
        parent_column: &str,
        active_column: &str,
        roots: &[i64],
    ) -> Result<(), EngineError> {
        let parent = Ident::new(parent_column)?;
        let active = Ident::new(active_column)?;
        let roots_list = id_list(roots);
        let rows = conn
            .execute(
                &format!(
                    "WITH RECURSIVE subtree(\"id\") AS ( \
                         SELECT \"id\" FROM {table} WHERE \"id\" IN ({roots_list}) \
                         UNION \
                         SELECT c.\"id\" FROM {table} AS c \
                           JOIN subtree AS s ON c.{parent} = s.\"id\" \
                     ) \
                     UPDATE {table} SET {active} = 0 \
                     WHERE \"id\" IN (SELECT \"id\" FROM subtree) \
                       AND \"id\" NOT IN ({roots_list})"
                ),
                [],
            )
            .at(ORIGIN)?;
        if rows > 0 {
            debug!(
                table = table.as_str(),
                rows, "descendant documents deactivated before removal"
            );
        }
        Ok(())
    }

    /// Delete rows of polymorphic sites pointing at the removed records.
    fn scrub_reference_sites(
        &self,
        conn: &DbConnection,
        entity: &str,
        ids: &[i64],
    ) -> Result<(), EngineError> {
        let session = self.session;
        let sites = session
            .locator()
            .sites(conn, session.schema(), session.catalog())?;

        for site in sites.iter() {
            if site.is_bound() && site.bound_model() != Some(entity) {
                continue;
            }
            let ordinal = if site.res_model_id_column().is_some() {
                let Some(ordinal) = session.catalog().entity_ordinal(entity) else {
                    debug!(entity, "entity has no catalog ordinal, site skipped");
                    continue;
                };
                Some(ordinal)
            } else {
                None
            };
            let table = Ident::new(site.table())?;
            let res_id = Ident::new(site.res_id_column())?;

            for chunk in ids.chunks(ID_CHUNK) {
                let list = id_list(chunk);
                let rows = if let Some(col) = site.res_model_column() {
                    let model = Ident::new(col)?;
                    conn.execute(
                        &format!(
                            "DELETE FROM {table} WHERE {model} = ?1 AND {res_id} IN ({list})"
                        ),
                        [entity],
                    )
                    .at(ORIGIN)?
                } else if let Some(col) = site.res_model_id_column() {
                    let model = Ident::new(col)?;
                    conn.execute(
                        &format!(
                            "DELETE FROM {table} WHERE {model} = ?1 AND {res_id} IN ({list})"
                        ),
                        [ordinal],
                    )
                    .at(ORIGIN)?
                } else {
                    conn.execute(
                        &format!("DELETE FROM {table} WHERE {res_id} IN ({list})"),
                        [],
                    )
                    .at(ORIGIN)?
                };
                if rows > 0 {
                    debug!(
                        table = site.table(),
                        rows, "polymorphic references to removed records deleted"
                    );
                }
            }
        }
        Ok(())
    }

    /// Delete rows whose encoded reference value names a removed record.
    fn scrub_encoded_references(
        &self,
        conn: &DbConnection,
        entity: &str,
        ids: &[i64],
    ) -> Result<(), EngineError> {
        let session = self.session;
        let encoded = session
            .locator()
            .encoded_columns(conn, session.schema(), session.catalog())?;

        for enc in encoded.iter() {
            let table = Ident::new(&enc.table)?;
            let column = Ident::new(&enc.column)?;
            for chunk in ids.chunks(ID_CHUNK) {
                let placeholders = vec!["?"; chunk.len()].join(",");
                let needles = chunk.iter().map(|id| format!("{entity},{id}"));
                let rows = conn
                    .execute(
                        &format!("DELETE FROM {table} WHERE {column} IN ({placeholders})"),
                        params_from_iter(needles),
                    )
                    .at(ORIGIN)?;
                if rows > 0 {
                    debug!(
                        table = %enc.table,
                        column = %enc.column,
                        rows,
                        "encoded references to removed records deleted"
                    );
                }
            }
        }
        Ok(())
    }

    /// Clean the default-value store: keyed entries of columns referencing
    /// the removed entity, plus encoded `entity,id` needles.
    fn scrub_default_store(
        &self,
        conn: &DbConnection,
        entity: &str,
        entity_table: &str,
        ids: &[i64],
    ) -> Result<(), EngineError> {
        let session = self.session;
        let Some(store) = session.catalog().default_value_store() else {
            return Ok(());
        };
        if !session.schema().table_exists(conn, &store.table)? {
            return Ok(());
        }
        let table = Ident::new(&store.table)?;
        let entity_col = Ident::new(&store.entity_column)?;
        let field_col = Ident::new(&store.field_column)?;
        let value_col = Ident::new(&store.value_column)?;

        let edges = session.schema().referencing(conn, entity_table)?;
        for edge in &edges {
            let Some(referrer) = session.catalog().entity_of(&edge.source_table) else {
                continue;
            };
            for chunk in ids.chunks(ID_CHUNK) {
                let placeholders = vec!["?"; chunk.len()].join(",");
                let mut params: Vec<String> = vec![referrer.clone(), edge.source_column.clone()];
                params.extend(chunk.iter().map(ToString::to_string));
                conn.execute(
                    &format!(
                        "DELETE FROM {table} \
                         WHERE {entity_col} = ? AND {field_col} = ? \
                           AND {value_col} IN ({placeholders})"
                    ),
                    params_from_iter(params),
                )
                .at(ORIGIN)?;
            }
        }

        for chunk in ids.chunks(ID_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            let needles = chunk.iter().map(|id| format!("{entity},{id}"));
            conn.execute(
                &format!("DELETE FROM {table} WHERE {value_col} IN ({placeholders})"),
                params_from_iter(needles),
            )
            .at(ORIGIN)?;
        }
        Ok(())
    }
}
