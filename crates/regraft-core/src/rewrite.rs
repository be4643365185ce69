//! Reference rewriting.
//!
//! Given an old → new id mapping for one entity, propagate the remap
//! through every direct foreign key, join table, polymorphic site, and
//! encoded reference. Join-table rows are deduplicated; unique-index
//! conflicts are resolved by deleting the losing row.

use crate::{
    error::{EngineError, ErrorOrigin, SqlResultExt},
    mapping::{self, ID_MAP_TABLE, IdMapping},
    schema::TableFacts,
    session::{DbConnection, MigrationSession},
    sql::{Ident, RangeTemplate},
};
use rusqlite::{params_from_iter, types::Value};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

const ORIGIN: ErrorOrigin = ErrorOrigin::Rewrite;

///
/// Rewrite
///
/// One rewrite request. `dest` defaults to the source entity; ignored
/// tables are exempt from every pass.
///

#[derive(Clone, Debug)]
pub struct Rewrite<'a> {
    pub(crate) mapping: &'a IdMapping,
    pub(crate) source: &'a str,
    pub(crate) dest: &'a str,
    pub(crate) ignore_tables: BTreeSet<String>,
    pub(crate) replace_external_names: bool,
}

impl<'a> Rewrite<'a> {
    #[must_use]
    pub fn new(mapping: &'a IdMapping, source: &'a str) -> Self {
        Self {
            mapping,
            source,
            dest: source,
            ignore_tables: BTreeSet::new(),
            replace_external_names: true,
        }
    }

    /// Retarget references to a different destination entity.
    #[must_use]
    pub fn into_entity(mut self, dest: &'a str) -> Self {
        self.dest = dest;
        self
    }

    /// Exempt a table from all rewrite passes.
    #[must_use]
    pub fn ignore_table(mut self, table: impl Into<String>) -> Self {
        self.ignore_tables.insert(table.into());
        self
    }

    /// Leave the external-name registry untouched.
    #[must_use]
    pub const fn keep_external_names(mut self) -> Self {
        self.replace_external_names = false;
        self
    }

    #[must_use]
    pub(crate) fn is_cross_entity(&self) -> bool {
        self.source != self.dest
    }
}

///
/// RewriteExecutor
///

pub(crate) struct RewriteExecutor<'a> {
    session: &'a MigrationSession,
}

impl<'a> RewriteExecutor<'a> {
    pub const fn new(session: &'a MigrationSession) -> Self {
        Self { session }
    }

    pub fn execute(&self, request: &Rewrite<'_>) -> Result<(), EngineError> {
        if request.mapping.is_empty() {
            return Ok(());
        }
        if !request.is_cross_entity() && request.mapping.is_identity() {
            debug!(entity = request.source, "identity mapping, nothing to rewrite");
            return Ok(());
        }

        let source_table = self.session.table_ident_of(ORIGIN, request.source)?;
        // the destination must be resolvable even when only sites move
        let _ = self.session.table_ident_of(ORIGIN, request.dest)?;

        let mut ignores = request.ignore_tables.clone();
        if !request.replace_external_names
            && let Some(registry) = self.session.registry()
            && let Some(table) = registry.backing_table()
        {
            ignores.insert(table);
        }

        let conn = self.session.conn()?;
        mapping::install_id_map(&conn, request.mapping, ORIGIN)?;
        let result = self.run(&conn, request, &source_table, &ignores);
        let cleanup = mapping::drop_id_map(&conn, ORIGIN);
        result.and(cleanup)
    }

    fn run(
        &self,
        conn: &DbConnection,
        request: &Rewrite<'_>,
        source_table: &Ident,
        ignores: &BTreeSet<String>,
    ) -> Result<(), EngineError> {
        self.rewrite_foreign_keys(conn, request, source_table, ignores)?;
        self.rewrite_unbound_sites(conn, request, ignores)?;
        self.rewrite_bound_sites(conn, request, ignores)?;
        self.rewrite_encoded_references(conn, request, ignores)?;
        info!(
            source = request.source,
            dest = request.dest,
            pairs = request.mapping.len(),
            "reference rewrite finished"
        );
        Ok(())
    }

    fn rewrite_foreign_keys(
        &self,
        conn: &DbConnection,
        request: &Rewrite<'_>,
        source_table: &Ident,
        ignores: &BTreeSet<String>,
    ) -> Result<(), EngineError> {
        let schema = self.session.schema();
        let cross = request.is_cross_entity();
        let edges: Vec<_> = schema
            .referencing(conn, source_table.as_str())?
            .into_iter()
            .filter(|edge| !ignores.contains(&edge.source_table))
            .collect();

        if cross {
            // fail before mutating anything: join rows cannot change entity
            for edge in &edges {
                if !schema.facts(conn, &edge.source_table)?.has_id {
                    return Err(EngineError::invariant(
                        ORIGIN,
                        format!(
                            "cannot remap join table '{}' across entities ('{}' -> '{}')",
                            edge.source_table, request.source, request.dest
                        ),
                    ));
                }
            }
        }

        let mut default_keys: Vec<(String, String)> = Vec::new();
        for edge in &edges {
            let table = Ident::new(&edge.source_table)?;
            let fk = Ident::new(&edge.source_column)?;
            let facts = schema.facts(conn, &edge.source_table)?;

            if facts.has_id {
                let alias = Ident::new("t")?;
                let sql = format!(
                    "UPDATE {table} AS t SET {fk} = m.\"new\" \
                     FROM \"{ID_MAP_TABLE}\" AS m \
                     WHERE m.\"old\" = t.{fk} AND {{id_range}}"
                );
                let template = RangeTemplate::new(sql, &alias)?;
                let rows = self.session.batch().run_partitioned(&table, &template)?;
                debug!(
                    table = %edge.source_table,
                    column = %edge.source_column,
                    rows,
                    "direct references remapped"
                );
                if let Some(entity) = self.session.catalog().entity_of(&edge.source_table) {
                    default_keys.push((entity, edge.source_column.clone()));
                }
            } else {
                self.merge_join_table(conn, &facts, &table, &fk, source_table)?;
            }
        }

        if !cross {
            self.rewrite_default_store(conn, &default_keys)?;
        }
        Ok(())
    }

    /// Remap one join table: move rows to the new ids unless the resulting
    /// pair already exists, then drop the leftover old-id rows.
    fn merge_join_table(
        &self,
        conn: &DbConnection,
        facts: &TableFacts,
        table: &Ident,
        fk: &Ident,
        source_table: &Ident,
    ) -> Result<(), EngineError> {
        let others = facts.column_names(&[fk.as_str()]);
        if others.len() != 1 {
            return Err(EngineError::invariant(
                ORIGIN,
                format!(
                    "join table '{}' must have exactly two columns, found {}",
                    facts.name,
                    others.len() + 1
                ),
            ));
        }
        let other = Ident::new(&others[0])?;

        conn.execute(
            &format!(
                "UPDATE {table} AS t SET {fk} = m.\"new\" \
                 FROM \"{ID_MAP_TABLE}\" AS m \
                 WHERE m.\"old\" = t.{fk} \
                   AND NOT EXISTS (SELECT 1 FROM {table} e \
                                    WHERE e.{other} = t.{other} AND e.{fk} = m.\"new\")"
            ),
            [],
        )
        .at(ORIGIN)?;
        conn.execute(
            &format!(
                "DELETE FROM {table} \
                 WHERE {fk} IN (SELECT \"old\" FROM \"{ID_MAP_TABLE}\")"
            ),
            [],
        )
        .at(ORIGIN)?;

        // a m2m of the entity on itself: the remap may have produced rows
        // linking a record to itself; only this one-hop loop is resolved,
        // multi-hop cycles cannot be broken without picking a loser
        let self_referencing = facts.foreign_keys.iter().any(|f| {
            f.source_column == others[0]
                && f.target_table == source_table.as_str()
                && f.target_column == "id"
        });
        if self_referencing {
            let dropped = conn
                .execute(
                    &format!(
                        "DELETE FROM {table} \
                         WHERE {fk} = {other} \
                           AND {fk} IN (SELECT \"new\" FROM \"{ID_MAP_TABLE}\")"
                    ),
                    [],
                )
                .at(ORIGIN)?;
            if dropped > 0 {
                debug!(
                    table = %facts.name,
                    dropped, "self-loop join rows removed after remap"
                );
            }
        }
        Ok(())
    }

    fn rewrite_default_store(
        &self,
        conn: &DbConnection,
        default_keys: &[(String, String)],
    ) -> Result<(), EngineError> {
        if default_keys.is_empty() {
            return Ok(());
        }
        let Some(store) = self.session.catalog().default_value_store() else {
            return Ok(());
        };
        if !self.session.schema().table_exists(conn, &store.table)? {
            debug!(table = %store.table, "default-value store table missing, skipped");
            return Ok(());
        }
        let table = Ident::new(&store.table)?;
        let entity_col = Ident::new(&store.entity_column)?;
        let field_col = Ident::new(&store.field_column)?;
        let value_col = Ident::new(&store.value_column)?;

        let mut stmt = conn
            .prepare(&format!(
                "UPDATE {table} SET {value_col} = \
                     (SELECT CAST(m.\"new\" AS TEXT) FROM \"{ID_MAP_TABLE}\" m \
                       WHERE CAST(m.\"old\" AS TEXT) = {table}.{value_col}) \
                 WHERE {entity_col} = ?1 AND {field_col} = ?2 \
                   AND {value_col} IN (SELECT CAST(\"old\" AS TEXT) FROM \"{ID_MAP_TABLE}\")"
            ))
            .at(ORIGIN)?;
        for (entity, field) in default_keys {
            let rows = stmt.execute((entity, field)).at(ORIGIN)?;
            if rows > 0 {
                debug!(%entity, %field, rows, "default values remapped");
            }
        }
        Ok(())
    }

    fn rewrite_unbound_sites(
        &self,
        conn: &DbConnection,
        request: &Rewrite<'_>,
        ignores: &BTreeSet<String>,
    ) -> Result<(), EngineError> {
        let session = self.session;
        let sites = session
            .locator()
            .unbound_sites(conn, session.schema(), session.catalog())?;

        for site in sites {
            if ignores.contains(site.table()) {
                continue;
            }
            let table = Ident::new(site.table())?;
            let res_id = Ident::new(site.res_id_column())?;

            let (model_col_name, src_value, dest_value) =
                if let Some(col) = site.res_model_column() {
                    (
                        col,
                        Value::Text(request.source.to_owned()),
                        Value::Text(request.dest.to_owned()),
                    )
                } else if let Some(col) = site.res_model_id_column() {
                    let ordinal_of = |entity: &str| {
                        session.catalog().entity_ordinal(entity).ok_or_else(|| {
                            EngineError::invariant(
                                ORIGIN,
                                format!("catalog has no ordinal for entity '{entity}'"),
                            )
                        })
                    };
                    (
                        col,
                        Value::Integer(ordinal_of(request.source)?),
                        Value::Integer(ordinal_of(request.dest)?),
                    )
                } else {
                    continue;
                };
            let model_col = Ident::new(model_col_name)?;

            let unique_indexes = session.schema().unique_indexes_with(
                conn,
                site.table(),
                &[site.res_id_column(), model_col_name],
            )?;

            if unique_indexes.is_empty() {
                let alias = Ident::new("t")?;
                let sql = format!(
                    "UPDATE {table} AS t SET {model_col} = ?1, {res_id} = m.\"new\" \
                     FROM \"{ID_MAP_TABLE}\" AS m \
                     WHERE t.{model_col} = ?2 AND m.\"old\" = t.{res_id} AND {{id_range}}"
                );
                let template = RangeTemplate::new(sql, &alias)?
                    .with_params(vec![dest_value.clone(), src_value.clone()]);
                session.batch().run_partitioned(&table, &template)?;
                continue;
            }

            // a remapped row may collide with an existing one on a unique
            // index; update only conflict-free rows, delete the rest
            let mut guards = String::new();
            for index in &unique_indexes {
                let mut probe = format!(
                    "SELECT 1 FROM {table} x \
                     WHERE x.{model_col} = ?1 AND x.{res_id} = m.\"new\""
                );
                for extra in index {
                    if extra == site.res_id_column() || extra == model_col_name {
                        continue;
                    }
                    let extra = Ident::new(extra)?;
                    probe.push_str(&format!(" AND x.{extra} = t.{extra}"));
                }
                guards.push_str(&format!(" AND NOT EXISTS ({probe})"));
            }
            conn.execute(
                &format!(
                    "UPDATE {table} AS t SET {model_col} = ?1, {res_id} = m.\"new\" \
                     FROM \"{ID_MAP_TABLE}\" AS m \
                     WHERE t.{model_col} = ?2 AND m.\"old\" = t.{res_id}{guards}"
                ),
                params_from_iter([dest_value, src_value.clone()]),
            )
            .at(ORIGIN)?;
            let losers = conn
                .execute(
                    &format!(
                        "DELETE FROM {table} \
                         WHERE {model_col} = ?1 \
                           AND {res_id} IN (SELECT \"old\" FROM \"{ID_MAP_TABLE}\")"
                    ),
                    params_from_iter([src_value]),
                )
                .at(ORIGIN)?;
            if losers > 0 {
                warn!(
                    table = site.table(),
                    rows = losers,
                    "unique conflict resolved by deleting losing rows"
                );
            }
        }
        Ok(())
    }

    fn rewrite_bound_sites(
        &self,
        conn: &DbConnection,
        request: &Rewrite<'_>,
        ignores: &BTreeSet<String>,
    ) -> Result<(), EngineError> {
        let session = self.session;
        let sites = session
            .locator()
            .bound_sites(conn, session.schema(), session.catalog())?;

        for site in sites {
            if site.bound_model() != Some(request.source) || ignores.contains(site.table()) {
                continue;
            }
            if request.is_cross_entity() {
                // the site's entity is fixed by declaration; it cannot
                // represent the destination
                debug!(
                    table = site.table(),
                    "bound site skipped by cross-entity rewrite"
                );
                continue;
            }
            let table = Ident::new(site.table())?;
            let res_id = Ident::new(site.res_id_column())?;
            let alias = Ident::new("t")?;
            let sql = format!(
                "UPDATE {table} AS t SET {res_id} = m.\"new\" \
                 FROM \"{ID_MAP_TABLE}\" AS m \
                 WHERE m.\"old\" = t.{res_id} AND {{id_range}}"
            );
            let template = RangeTemplate::new(sql, &alias)?;
            session.batch().run_partitioned(&table, &template)?;
        }
        Ok(())
    }

    fn rewrite_encoded_references(
        &self,
        conn: &DbConnection,
        request: &Rewrite<'_>,
        ignores: &BTreeSet<String>,
    ) -> Result<(), EngineError> {
        let session = self.session;
        let encoded = session
            .locator()
            .encoded_columns(conn, session.schema(), session.catalog())?;

        for enc in encoded.iter() {
            if ignores.contains(&enc.table) {
                continue;
            }
            let table = Ident::new(&enc.table)?;
            let column = Ident::new(&enc.column)?;
            let rows = conn
                .execute(
                    &format!(
                        "UPDATE {table} SET {column} = ?1 || ',' || \
                             (SELECT m.\"new\" FROM \"{ID_MAP_TABLE}\" m \
                               WHERE m.\"old\" = \
                                 CAST(substr({table}.{column}, length(?2) + 2) AS INTEGER)) \
                         WHERE {column} IN \
                             (SELECT ?2 || ',' || m.\"old\" FROM \"{ID_MAP_TABLE}\" m)"
                    ),
                    rusqlite::params![request.dest, request.source],
                )
                .at(ORIGIN)?;
            if rows > 0 {
                debug!(
                    table = %enc.table,
                    column = %enc.column,
                    rows,
                    "encoded references remapped"
                );
            }
        }
        Ok(())
    }
}
