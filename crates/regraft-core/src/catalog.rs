//! External catalog boundary.
//!
//! The entity ↔ table mapping and the field-level facts that cannot be read
//! from the database catalog (declared many-to-many tables, reference-typed
//! columns, delegation edges) come from an external catalog, treated as a
//! pure function for the duration of a run.

use crate::polyref::{EncodedColumn, RefSite};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

///
/// ColumnKind
///
/// Classifier hint of last resort for a referring column.
///

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ColumnKind {
    ManyToOne,
    ManyToMany,
}

///
/// Delegation
///
/// A dependent entity whose rows each extend exactly one row of a base
/// entity through `via_column` (inheritance by delegation).
///

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Delegation {
    pub entity: String,
    pub via_column: String,
}

///
/// SpecialRemoval
///
/// The two entity kinds whose removal is not plain row deletion. This is a
/// closed set baked into the remover, not an extension point; a new kind
/// means a new variant and a new match arm.
///

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum SpecialRemoval {
    /// Hierarchical menus: removal swallows the whole parent-column subtree.
    MenuTree { parent_column: String },
    /// Structured documents (views): customized descendants are deactivated
    /// transitively before the requested rows are deleted.
    DocumentTree {
        parent_column: String,
        active_column: String,
    },
}

///
/// DefaultStoreSpec
///
/// A store of per-field default values keyed by `(entity, field)`, holding
/// the referenced record id as text.
///

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct DefaultStoreSpec {
    pub table: String,
    pub entity_column: String,
    pub field_column: String,
    pub value_column: String,
}

///
/// Catalog
///

pub trait Catalog: Send + Sync {
    /// Physical table backing `entity`, if the entity exists.
    fn table_of(&self, entity: &str) -> Option<String>;

    /// Entity backed by `table`, if any.
    fn entity_of(&self, table: &str) -> Option<String>;

    /// Numeric id of the entity's own catalog record, for sites that store
    /// the entity as an ordinal instead of a name.
    fn entity_ordinal(&self, entity: &str) -> Option<i64>;

    /// Whether `table` is declared as a many-to-many relation table.
    fn declared_many_to_many(&self, table: &str) -> bool;

    /// Classifier hint of last resort.
    fn column_kind(&self, table: &str, column: &str) -> Option<ColumnKind>;

    /// Every polymorphic reference site in the schema (bound and unbound).
    fn reference_sites(&self) -> Vec<RefSite>;

    /// Every `entity-name,record-id` encoded text column.
    fn encoded_reference_columns(&self) -> Vec<EncodedColumn>;

    /// The default-value store, when the deployment has one.
    fn default_value_store(&self) -> Option<DefaultStoreSpec>;

    /// Dependent entities extending `entity` by delegation.
    fn delegations(&self, entity: &str) -> Vec<Delegation>;

    /// Whether `entity` is one of the specially-removed kinds.
    fn special_removal(&self, entity: &str) -> Option<SpecialRemoval>;
}

///
/// MemoryCatalog
///
/// Value-type catalog for embedders and tests.
///

#[derive(Clone, Debug, Default)]
pub struct MemoryCatalog {
    tables: BTreeMap<String, String>,
    ordinals: BTreeMap<String, i64>,
    many_to_many: BTreeSet<String>,
    column_kinds: BTreeMap<(String, String), ColumnKind>,
    sites: Vec<RefSite>,
    encoded: Vec<EncodedColumn>,
    default_store: Option<DefaultStoreSpec>,
    delegations: BTreeMap<String, Vec<Delegation>>,
    special: BTreeMap<String, SpecialRemoval>,
}

impl MemoryCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_entity(&mut self, entity: impl Into<String>, table: impl Into<String>) -> &mut Self {
        let entity = entity.into();
        let ordinal = self.tables.len() as i64 + 1;
        self.ordinals.entry(entity.clone()).or_insert(ordinal);
        self.tables.insert(entity, table.into());
        self
    }

    pub fn declare_many_to_many(&mut self, table: impl Into<String>) -> &mut Self {
        self.many_to_many.insert(table.into());
        self
    }

    pub fn hint_column(
        &mut self,
        table: impl Into<String>,
        column: impl Into<String>,
        kind: ColumnKind,
    ) -> &mut Self {
        self.column_kinds.insert((table.into(), column.into()), kind);
        self
    }

    pub fn add_reference_site(&mut self, site: RefSite) -> &mut Self {
        self.sites.push(site);
        self
    }

    pub fn add_encoded_column(&mut self, table: impl Into<String>, column: impl Into<String>) -> &mut Self {
        self.encoded.push(EncodedColumn {
            table: table.into(),
            column: column.into(),
        });
        self
    }

    pub fn set_default_store(&mut self, spec: DefaultStoreSpec) -> &mut Self {
        self.default_store = Some(spec);
        self
    }

    pub fn add_delegation(
        &mut self,
        base_entity: impl Into<String>,
        dependent: Delegation,
    ) -> &mut Self {
        self.delegations
            .entry(base_entity.into())
            .or_default()
            .push(dependent);
        self
    }

    pub fn set_special_removal(
        &mut self,
        entity: impl Into<String>,
        removal: SpecialRemoval,
    ) -> &mut Self {
        self.special.insert(entity.into(), removal);
        self
    }
}

impl Catalog for MemoryCatalog {
    fn table_of(&self, entity: &str) -> Option<String> {
        self.tables.get(entity).cloned()
    }

    fn entity_of(&self, table: &str) -> Option<String> {
        self.tables
            .iter()
            .find(|(_, t)| t.as_str() == table)
            .map(|(entity, _)| entity.clone())
    }

    fn entity_ordinal(&self, entity: &str) -> Option<i64> {
        self.ordinals.get(entity).copied()
    }

    fn declared_many_to_many(&self, table: &str) -> bool {
        self.many_to_many.contains(table)
    }

    fn column_kind(&self, table: &str, column: &str) -> Option<ColumnKind> {
        self.column_kinds
            .get(&(table.to_owned(), column.to_owned()))
            .copied()
    }

    fn reference_sites(&self) -> Vec<RefSite> {
        self.sites.clone()
    }

    fn encoded_reference_columns(&self) -> Vec<EncodedColumn> {
        self.encoded.clone()
    }

    fn default_value_store(&self) -> Option<DefaultStoreSpec> {
        self.default_store.clone()
    }

    fn delegations(&self, entity: &str) -> Vec<Delegation> {
        self.delegations.get(entity).cloned().unwrap_or_default()
    }

    fn special_removal(&self, entity: &str) -> Option<SpecialRemoval> {
        self.special.get(entity).cloned()
    }
}
