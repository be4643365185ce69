//! Duplicate collapsing.
//!
//! Groups an entity's rows by a uniqueness key, keeps the first row per
//! group as survivor, redirects every referrer, and deletes the rest.
//! Plain UPDATE/INSERT batches, not the general rewriter: collapsing needs
//! the referrer classification heuristics, nothing more.

use crate::{
    error::{EngineError, ErrorOrigin, SqlResultExt},
    mapping::{self, ID_MAP_TABLE, IdMapping},
    schema::{ForeignKeyEdge, RelationKind, relation::classify_edge},
    session::{DbConnection, MigrationSession},
    sql::{Ident, RangeTemplate, SqlExpr},
};
use rusqlite::types::Value;
use tracing::{debug, info};

const ORIGIN: ErrorOrigin = ErrorOrigin::Collapse;

///
/// CollapseExecutor
///

pub(crate) struct CollapseExecutor<'a> {
    session: &'a MigrationSession,
}

impl<'a> CollapseExecutor<'a> {
    pub const fn new(session: &'a MigrationSession) -> Self {
        Self { session }
    }

    pub fn execute(
        &self,
        entity: &str,
        uniqueness_key: &SqlExpr,
        order_key: &SqlExpr,
    ) -> Result<(), EngineError> {
        let table = self.session.table_ident_of(ORIGIN, entity)?;
        let conn = self.session.conn()?;

        // an entity nobody references has no migration reason to be
        // deduplicated here; treat it as API misuse
        let edges = self.session.schema().referencing(&conn, table.as_str())?;
        if edges.is_empty() {
            return Err(EngineError::invariant(
                ORIGIN,
                format!(
                    "refusing to collapse '{entity}': no foreign keys reference '{}'",
                    table.as_str()
                ),
            ));
        }

        let duplicates = self.duplicate_mapping(&conn, &table, uniqueness_key, order_key)?;
        if duplicates.is_empty() {
            debug!(entity, "no duplicate groups, nothing to collapse");
            return Ok(());
        }

        mapping::install_id_map(&conn, &duplicates, ORIGIN)?;
        let result = self.run(&conn, entity, &table, &edges, &duplicates);
        let cleanup = mapping::drop_id_map(&conn, ORIGIN);
        result.and(cleanup)
    }

    /// One ordered scan; within a key group the first row is the survivor
    /// and every later row maps onto it.
    fn duplicate_mapping(
        &self,
        conn: &DbConnection,
        table: &Ident,
        uniqueness_key: &SqlExpr,
        order_key: &SqlExpr,
    ) -> Result<IdMapping, EngineError> {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT \"id\", ({uniqueness_key}) FROM {table} \
                 ORDER BY ({uniqueness_key}), ({order_key}), \"id\""
            ))
            .at(ORIGIN)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, Value>(1)?))
            })
            .at(ORIGIN)?;

        let mut duplicates = IdMapping::new();
        let mut current: Option<(Value, i64)> = None;
        for row in rows {
            let (id, key) = row.at(ORIGIN)?;
            match &current {
                Some((group_key, survivor)) if *group_key == key => {
                    duplicates.insert(id, *survivor);
                }
                _ => current = Some((key, id)),
            }
        }
        Ok(duplicates)
    }

    fn run(
        &self,
        conn: &DbConnection,
        entity: &str,
        table: &Ident,
        edges: &[ForeignKeyEdge],
        duplicates: &IdMapping,
    ) -> Result<(), EngineError> {
        let schema = self.session.schema();

        for edge in edges {
            let facts = schema.facts(conn, &edge.source_table)?;
            let rel_table = Ident::new(&edge.source_table)?;
            let fk = Ident::new(&edge.source_column)?;

            match classify_edge(&facts, self.session.catalog(), edge)? {
                RelationKind::ManyToOne => {
                    let alias = Ident::new("t")?;
                    let sql = format!(
                        "UPDATE {rel_table} AS t SET {fk} = m.\"new\" \
                         FROM \"{ID_MAP_TABLE}\" AS m \
                         WHERE m.\"old\" = t.{fk} AND {{id_range}}"
                    );
                    let template = RangeTemplate::new(sql, &alias)?;
                    let rows = self.session.batch().run_partitioned(&rel_table, &template)?;
                    debug!(
                        table = %edge.source_table,
                        column = %edge.source_column,
                        rows,
                        "many-to-one referrers retargeted to survivors"
                    );
                }
                RelationKind::ManyToMany { other_column } => {
                    let other = Ident::new(&other_column)?;
                    // add the survivor-linked pairs that are missing; the
                    // duplicate delete below cascades the old pairs away
                    let rows = conn
                        .execute(
                            &format!(
                                "INSERT INTO {rel_table} ({other}, {fk}) \
                                 SELECT r.{other}, m.\"new\" \
                                   FROM {rel_table} AS r \
                                   JOIN \"{ID_MAP_TABLE}\" AS m ON m.\"old\" = r.{fk} \
                                 EXCEPT \
                                 SELECT r.{other}, r.{fk} \
                                   FROM {rel_table} AS r \
                                  WHERE r.{fk} IN (SELECT \"new\" FROM \"{ID_MAP_TABLE}\")"
                            ),
                            [],
                        )
                        .at(ORIGIN)?;
                    debug!(
                        table = %edge.source_table,
                        rows, "survivor join rows inserted"
                    );
                }
            }
        }

        if let Some(registry) = self.session.registry() {
            let moved = registry.retarget(conn, entity, duplicates)?;
            if moved > 0 {
                debug!(entity, moved, "registry names retargeted to survivors");
            }
        }

        let removed = conn
            .execute(
                &format!(
                    "DELETE FROM {table} \
                     WHERE \"id\" IN (SELECT \"old\" FROM \"{ID_MAP_TABLE}\")"
                ),
                [],
            )
            .at(ORIGIN)?;
        info!(
            entity,
            duplicates = duplicates.len(),
            removed,
            "duplicate records collapsed"
        );
        Ok(())
    }
}
