//! Core runtime for Regraft: runtime schema discovery, reference
//! rewriting, cascading removal, duplicate collapsing, and the
//! id-range-partitioned batch executor.
//!
//! The engine assumes one ambient database and one connection pool,
//! both supplied by the caller; it opens no transactions of its own.

pub mod catalog;
pub mod config;
pub mod error;
pub mod exec;
pub mod mapping;
pub mod polyref;
pub mod registry;
pub mod rewrite;
pub mod schema;
pub mod session;
pub mod sql;

mod collapse;
mod remove;

///
/// Prelude
///
/// Prelude contains only the vocabulary a migration step needs.
/// No executors, caches, or statement plumbing are re-exported here.
///

pub mod prelude {
    pub use crate::{
        catalog::{Catalog, Delegation, MemoryCatalog, SpecialRemoval},
        config::EngineConfig,
        error::{EngineError, ErrorClass},
        mapping::IdMapping,
        polyref::RefSite,
        registry::{NameRegistry, SqlNameRegistry},
        rewrite::Rewrite,
        session::{MigrationSession, open_pool},
    };
}
