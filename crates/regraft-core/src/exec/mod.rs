//! Partitioned batch execution.
//!
//! Large table-wide statements are split into contiguous, non-overlapping
//! id ranges and run concurrently on pooled connections. Disjoint ranges
//! are the sole mechanism that makes concurrent execution safe; no
//! row-level application locks exist. The executor never commits; a
//! partitioned run is visible to worker connections only under the
//! caller's transaction discipline.

use crate::{
    config::EngineConfig,
    error::{EngineError, ErrorOrigin, PartitionError, SqlResultExt},
    schema::SchemaCache,
    session::DbPool,
    sql::{Ident, RangeTemplate, Window},
};
use rusqlite::params_from_iter;
use std::thread;
use tracing::debug;

///
/// BatchExecutor
///

pub struct BatchExecutor<'a> {
    pool: &'a DbPool,
    schema: &'a SchemaCache,
    config: &'a EngineConfig,
}

impl<'a> BatchExecutor<'a> {
    pub(crate) const fn new(
        pool: &'a DbPool,
        schema: &'a SchemaCache,
        config: &'a EngineConfig,
    ) -> Self {
        Self {
            pool,
            schema,
            config,
        }
    }

    /// Run a table-scoped statement, partitioned over the table's id space.
    ///
    /// Tables without a simple id column run unpartitioned; tables whose id
    /// span does not exceed the small-table threshold run as one statement
    /// regardless of the worker count. Returns total rows affected.
    pub fn run_partitioned(
        &self,
        table: &Ident,
        template: &RangeTemplate,
    ) -> Result<u64, EngineError> {
        let conn = self.pool.get().at(ErrorOrigin::Execute)?;
        let facts = self.schema.facts(&conn, table.as_str())?;
        if !facts.has_id {
            drop(conn);
            return self.execute_window(template, Window::Open);
        }
        let Some((lo, hi)) = self.schema.id_bounds(&conn, table.as_str())? else {
            return Ok(0);
        };
        drop(conn);

        let span = i128::from(hi) - i128::from(lo) + 1;
        if span <= i128::from(self.config.small_table_threshold) || self.config.max_workers <= 1 {
            return self.execute_window(template, Window::NotNull);
        }

        let ranges = split_ranges(lo, hi, self.config.max_workers);
        debug!(
            table = table.as_str(),
            partitions = ranges.len(),
            lo,
            hi,
            "running partitioned statement"
        );

        // all partitions run to completion; failures are aggregated after
        let results: Vec<Result<u64, PartitionError>> = thread::scope(|scope| {
            let handles: Vec<_> = ranges
                .iter()
                .map(|&(plo, phi)| {
                    let handle = scope.spawn(move || {
                        self.execute_window(template, Window::Range(plo, phi))
                    });
                    (plo, phi, handle)
                })
                .collect();
            handles
                .into_iter()
                .map(|(plo, phi, handle)| match handle.join() {
                    Ok(Ok(rows)) => Ok(rows),
                    Ok(Err(err)) => Err(PartitionError {
                        lo: plo,
                        hi: phi,
                        message: err.to_string(),
                    }),
                    Err(_) => Err(PartitionError {
                        lo: plo,
                        hi: phi,
                        message: "worker panicked".to_owned(),
                    }),
                })
                .collect()
        });

        let mut total = 0u64;
        let mut failed = Vec::new();
        for result in results {
            match result {
                Ok(rows) => total += rows,
                Err(err) => failed.push(err),
            }
        }
        if failed.is_empty() {
            Ok(total)
        } else {
            Err(EngineError::partitions(
                ErrorOrigin::Execute,
                table.as_str(),
                failed,
            ))
        }
    }

    fn execute_window(
        &self,
        template: &RangeTemplate,
        window: Window,
    ) -> Result<u64, EngineError> {
        let conn = self.pool.get().at(ErrorOrigin::Execute)?;
        let sql = template.instantiate(window);
        let rows = conn
            .execute(&sql, params_from_iter(template.params().iter()))
            .at(ErrorOrigin::Execute)?;
        Ok(rows as u64)
    }
}

/// Split `[lo, hi]` into at most `parts` contiguous, disjoint ranges whose
/// union is exactly `[lo, hi]`. The last range absorbs the remainder.
pub(crate) fn split_ranges(lo: i64, hi: i64, parts: usize) -> Vec<(i64, i64)> {
    debug_assert!(hi >= lo);
    let span = i128::from(hi) - i128::from(lo) + 1;
    let parts = i128::try_from(parts.max(1)).expect("worker count fits i128").min(span);
    let base = span / parts;

    let mut ranges = Vec::with_capacity(parts as usize);
    let mut cursor = i128::from(lo);
    for index in 0..parts {
        let end = if index == parts - 1 {
            i128::from(hi)
        } else {
            cursor + base - 1
        };
        ranges.push((cursor as i64, end as i64));
        cursor = end + 1;
    }
    ranges
}
