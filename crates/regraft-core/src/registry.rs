//! Identity-registry boundary.
//!
//! The registry maps stable human-readable names to `(entity, id)` pairs
//! and carries a protect-from-overwrite flag. It is an external
//! collaborator; the engine only keeps it consistent with id churn.

use crate::{
    error::{EngineError, ErrorOrigin, SqlResultExt},
    mapping::IdMapping,
    sql::{Ident, id_list},
};
use rusqlite::{Connection, OptionalExtension};

///
/// NameRegistry
///

pub trait NameRegistry: Send + Sync {
    /// The registry's backing table, when it lives in the same database.
    /// Used to exclude it from reference rewriting on request.
    fn backing_table(&self) -> Option<String> {
        None
    }

    fn resolve(&self, conn: &Connection, name: &str) -> Result<Option<(String, i64)>, EngineError>;

    /// Point `name` at a new record id. Returns whether a row changed.
    fn reassign(&self, conn: &Connection, name: &str, new_id: i64) -> Result<bool, EngineError>;

    /// Set or clear the protect-from-overwrite flag.
    fn protect(&self, conn: &Connection, name: &str, flag: bool) -> Result<bool, EngineError>;

    /// Drop every name pointing at `(entity, id ∈ ids)`.
    fn delete_where(&self, conn: &Connection, entity: &str, ids: &[i64]) -> Result<u64, EngineError>;

    /// Re-point names of `entity` through an old → new mapping.
    fn retarget(
        &self,
        conn: &Connection,
        entity: &str,
        mapping: &IdMapping,
    ) -> Result<u64, EngineError>;
}

///
/// SqlNameRegistry
///
/// Table-backed registry: one row per name, with entity, record id, and
/// protection flag columns.
///

#[derive(Clone, Debug)]
pub struct SqlNameRegistry {
    table: Ident,
    name_column: Ident,
    entity_column: Ident,
    id_column: Ident,
    protect_column: Ident,
}

impl SqlNameRegistry {
    pub fn new(
        table: &str,
        name_column: &str,
        entity_column: &str,
        id_column: &str,
        protect_column: &str,
    ) -> Result<Self, EngineError> {
        Ok(Self {
            table: Ident::new(table)?,
            name_column: Ident::new(name_column)?,
            entity_column: Ident::new(entity_column)?,
            id_column: Ident::new(id_column)?,
            protect_column: Ident::new(protect_column)?,
        })
    }

    /// The conventional column layout: `name`, `entity`, `res_id`,
    /// `protected`.
    pub fn with_defaults(table: &str) -> Result<Self, EngineError> {
        Self::new(table, "name", "entity", "res_id", "protected")
    }
}

impl NameRegistry for SqlNameRegistry {
    fn backing_table(&self) -> Option<String> {
        Some(self.table.as_str().to_owned())
    }

    fn resolve(&self, conn: &Connection, name: &str) -> Result<Option<(String, i64)>, EngineError> {
        conn.query_row(
            &format!(
                "SELECT {entity}, {id} FROM {table} WHERE {name_col} = ?1",
                entity = self.entity_column,
                id = self.id_column,
                table = self.table,
                name_col = self.name_column,
            ),
            [name],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .at(ErrorOrigin::Registry)
    }

    fn reassign(&self, conn: &Connection, name: &str, new_id: i64) -> Result<bool, EngineError> {
        let n = conn
            .execute(
                &format!(
                    "UPDATE {table} SET {id} = ?1 WHERE {name_col} = ?2",
                    table = self.table,
                    id = self.id_column,
                    name_col = self.name_column,
                ),
                (new_id, name),
            )
            .at(ErrorOrigin::Registry)?;
        Ok(n > 0)
    }

    fn protect(&self, conn: &Connection, name: &str, flag: bool) -> Result<bool, EngineError> {
        let n = conn
            .execute(
                &format!(
                    "UPDATE {table} SET {protect} = ?1 WHERE {name_col} = ?2",
                    table = self.table,
                    protect = self.protect_column,
                    name_col = self.name_column,
                ),
                (i64::from(flag), name),
            )
            .at(ErrorOrigin::Registry)?;
        Ok(n > 0)
    }

    fn delete_where(&self, conn: &Connection, entity: &str, ids: &[i64]) -> Result<u64, EngineError> {
        let mut deleted = 0u64;
        for chunk in ids.chunks(500) {
            let n = conn
                .execute(
                    &format!(
                        "DELETE FROM {table} WHERE {entity_col} = ?1 AND {id} IN ({ids})",
                        table = self.table,
                        entity_col = self.entity_column,
                        id = self.id_column,
                        ids = id_list(chunk),
                    ),
                    [entity],
                )
                .at(ErrorOrigin::Registry)?;
            deleted += n as u64;
        }
        Ok(deleted)
    }

    fn retarget(
        &self,
        conn: &Connection,
        entity: &str,
        mapping: &IdMapping,
    ) -> Result<u64, EngineError> {
        let mut stmt = conn
            .prepare(&format!(
                "UPDATE {table} SET {id} = ?1 WHERE {entity_col} = ?2 AND {id} = ?3",
                table = self.table,
                id = self.id_column,
                entity_col = self.entity_column,
            ))
            .at(ErrorOrigin::Registry)?;
        let mut changed = 0u64;
        for (old, new) in mapping.pairs() {
            if old == new {
                continue;
            }
            changed += stmt.execute((new, entity, old)).at(ErrorOrigin::Registry)? as u64;
        }
        Ok(changed)
    }
}
