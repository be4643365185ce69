//! Polymorphic reference sites.
//!
//! A polymorphic reference stores its target entity as data: either a
//! sibling column holding the entity name (or the entity's catalog
//! ordinal), or a single text column encoded as `entity-name,record-id`.

use crate::{
    catalog::Catalog,
    error::EngineError,
    schema::SchemaCache,
};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::debug;

///
/// RefSite
///
/// One polymorphic reference site. Exactly one of `res_model_column` /
/// `res_model_id_column` is set for an unbound site; `bound_model` is set
/// instead when the column's declared semantics fix the target entity.
///

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RefSite {
    table: String,
    res_id_column: String,
    res_model_column: Option<String>,
    res_model_id_column: Option<String>,
    bound_model: Option<String>,
}

impl RefSite {
    /// A site whose target entity is fixed by declaration.
    #[must_use]
    pub fn bound(table: impl Into<String>, res_id_column: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            res_id_column: res_id_column.into(),
            res_model_column: None,
            res_model_id_column: None,
            bound_model: Some(model.into()),
        }
    }

    /// A site reading the target entity name from a sibling text column.
    #[must_use]
    pub fn unbound_by_name(
        table: impl Into<String>,
        res_id_column: impl Into<String>,
        res_model_column: impl Into<String>,
    ) -> Self {
        Self {
            table: table.into(),
            res_id_column: res_id_column.into(),
            res_model_column: Some(res_model_column.into()),
            res_model_id_column: None,
            bound_model: None,
        }
    }

    /// A site reading the target entity's catalog ordinal from a sibling
    /// integer column.
    #[must_use]
    pub fn unbound_by_ordinal(
        table: impl Into<String>,
        res_id_column: impl Into<String>,
        res_model_id_column: impl Into<String>,
    ) -> Self {
        Self {
            table: table.into(),
            res_id_column: res_id_column.into(),
            res_model_column: None,
            res_model_id_column: Some(res_model_id_column.into()),
            bound_model: None,
        }
    }

    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    #[must_use]
    pub fn res_id_column(&self) -> &str {
        &self.res_id_column
    }

    #[must_use]
    pub fn res_model_column(&self) -> Option<&str> {
        self.res_model_column.as_deref()
    }

    #[must_use]
    pub fn res_model_id_column(&self) -> Option<&str> {
        self.res_model_id_column.as_deref()
    }

    #[must_use]
    pub fn bound_model(&self) -> Option<&str> {
        self.bound_model.as_deref()
    }

    #[must_use]
    pub const fn is_bound(&self) -> bool {
        self.bound_model.is_some()
    }

    /// The sibling column carrying the entity, whichever encoding applies.
    #[must_use]
    pub fn model_column(&self) -> Option<&str> {
        self.res_model_column
            .as_deref()
            .or(self.res_model_id_column.as_deref())
    }
}

///
/// EncodedColumn
///
/// A text column storing `entity-name,record-id` in one field.
///

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct EncodedColumn {
    pub table: String,
    pub column: String,
}

///
/// ReferenceLocator
///
/// Enumerates every usable polymorphic site and encoded column once per
/// run. Sites on missing tables, missing columns, or non-writable id
/// columns are dropped with a debug note, not an error.
///

#[derive(Debug, Default)]
pub(crate) struct ReferenceLocator {
    sites: Mutex<Option<Arc<Vec<RefSite>>>>,
    encoded: Mutex<Option<Arc<Vec<EncodedColumn>>>>,
}

impl ReferenceLocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sites(
        &self,
        conn: &Connection,
        schema: &SchemaCache,
        catalog: &dyn Catalog,
    ) -> Result<Arc<Vec<RefSite>>, EngineError> {
        if let Some(sites) = self.sites.lock().expect("locator poisoned").as_ref() {
            return Ok(Arc::clone(sites));
        }

        let mut usable = Vec::new();
        for site in catalog.reference_sites() {
            if !schema.table_exists(conn, site.table())? {
                debug!(table = site.table(), "reference site on missing table skipped");
                continue;
            }
            let facts = schema.facts(conn, site.table())?;
            if !facts.column(site.res_id_column()).is_some_and(|c| c.updatable) {
                debug!(
                    table = site.table(),
                    column = site.res_id_column(),
                    "reference site with non-writable id column skipped"
                );
                continue;
            }
            if let Some(model_col) = site.model_column()
                && facts.column(model_col).is_none()
            {
                debug!(
                    table = site.table(),
                    column = model_col,
                    "reference site with missing entity column skipped"
                );
                continue;
            }
            usable.push(site);
        }

        let usable = Arc::new(usable);
        *self.sites.lock().expect("locator poisoned") = Some(Arc::clone(&usable));
        Ok(usable)
    }

    pub fn bound_sites(
        &self,
        conn: &Connection,
        schema: &SchemaCache,
        catalog: &dyn Catalog,
    ) -> Result<Vec<RefSite>, EngineError> {
        Ok(self
            .sites(conn, schema, catalog)?
            .iter()
            .filter(|s| s.is_bound())
            .cloned()
            .collect())
    }

    pub fn unbound_sites(
        &self,
        conn: &Connection,
        schema: &SchemaCache,
        catalog: &dyn Catalog,
    ) -> Result<Vec<RefSite>, EngineError> {
        Ok(self
            .sites(conn, schema, catalog)?
            .iter()
            .filter(|s| !s.is_bound())
            .cloned()
            .collect())
    }

    pub fn encoded_columns(
        &self,
        conn: &Connection,
        schema: &SchemaCache,
        catalog: &dyn Catalog,
    ) -> Result<Arc<Vec<EncodedColumn>>, EngineError> {
        if let Some(cols) = self.encoded.lock().expect("locator poisoned").as_ref() {
            return Ok(Arc::clone(cols));
        }

        let mut usable = Vec::new();
        for enc in catalog.encoded_reference_columns() {
            if !schema.table_exists(conn, &enc.table)? {
                debug!(table = %enc.table, "encoded reference on missing table skipped");
                continue;
            }
            if !schema.column_updatable(conn, &enc.table, &enc.column)? {
                debug!(
                    table = %enc.table,
                    column = %enc.column,
                    "non-writable encoded reference column skipped"
                );
                continue;
            }
            usable.push(enc);
        }

        let usable = Arc::new(usable);
        *self.encoded.lock().expect("locator poisoned") = Some(Arc::clone(&usable));
        Ok(usable)
    }
}
