use crate::error::{EngineError, ErrorOrigin, SqlResultExt};
use derive_more::Deref;
use rusqlite::Connection;
use std::collections::BTreeMap;

/// Transient table holding the old → new id pairs for one operation.
/// A plain (non-temp) table so partition worker connections can see it,
/// mirroring how the statements themselves join against it.
pub(crate) const ID_MAP_TABLE: &str = "_regraft_idmap";

///
/// IdMapping
///
/// A finite old → new identifier mapping for one source entity (or a
/// source/destination pair for cross-entity rewrites). Keys are unique by
/// construction; identity pairs are legal and treated as no-ops.
///

#[derive(Clone, Debug, Default, Deref, Eq, PartialEq)]
pub struct IdMapping(BTreeMap<i64, i64>);

impl IdMapping {
    #[must_use]
    pub const fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Insert a pair; an existing key is overwritten (last writer wins,
    /// callers build mappings once).
    pub fn insert(&mut self, old: i64, new: i64) {
        self.0.insert(old, new);
    }

    /// True when every pair maps an id to itself (including the empty map).
    #[must_use]
    pub fn is_identity(&self) -> bool {
        self.0.iter().all(|(old, new)| old == new)
    }

    pub fn pairs(&self) -> impl Iterator<Item = (i64, i64)> + '_ {
        self.0.iter().map(|(old, new)| (*old, *new))
    }
}

impl FromIterator<(i64, i64)> for IdMapping {
    fn from_iter<I: IntoIterator<Item = (i64, i64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<const N: usize> From<[(i64, i64); N]> for IdMapping {
    fn from(pairs: [(i64, i64); N]) -> Self {
        pairs.into_iter().collect()
    }
}

/// Materialize the mapping into the transient id-map table.
pub(crate) fn install_id_map(
    conn: &Connection,
    mapping: &IdMapping,
    origin: ErrorOrigin,
) -> Result<(), EngineError> {
    conn.execute_batch(&format!(
        "DROP TABLE IF EXISTS \"{ID_MAP_TABLE}\";\n\
         CREATE TABLE \"{ID_MAP_TABLE}\" (\"old\" INTEGER PRIMARY KEY, \"new\" INTEGER NOT NULL);"
    ))
    .at(origin)?;

    let mut stmt = conn
        .prepare(&format!(
            "INSERT INTO \"{ID_MAP_TABLE}\" (\"old\", \"new\") VALUES (?1, ?2)"
        ))
        .at(origin)?;
    for (old, new) in mapping.pairs() {
        stmt.execute((old, new)).at(origin)?;
    }
    Ok(())
}

/// Drop the transient id-map table. Called on every exit path.
pub(crate) fn drop_id_map(conn: &Connection, origin: ErrorOrigin) -> Result<(), EngineError> {
    conn.execute_batch(&format!("DROP TABLE IF EXISTS \"{ID_MAP_TABLE}\""))
        .at(origin)
}
