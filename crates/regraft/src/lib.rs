//! ## Crate layout
//! - `core`: schema discovery, reference rewriting, cascading removal,
//!   duplicate collapsing, and the partitioned batch executor.
//!
//! The `prelude` module mirrors the surface a migration step uses.

pub use regraft_core as core;

pub use regraft_core::{error::EngineError as Error, session::MigrationSession};

/// Workspace version re-export for downstream tooling/tests.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

///
/// Migration-step Prelude
///

pub mod prelude {
    pub use regraft_core::prelude::*;
}
