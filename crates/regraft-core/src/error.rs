use derive_more::Display;
use thiserror::Error as ThisError;

///
/// ErrorClass
///
/// Stable internal classification of engine failures. The class decides how
/// an orchestrator should react; the origin says which subsystem raised it.
///

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum ErrorClass {
    /// A referenced table or column does not exist. Fatal for the step.
    #[display("schema")]
    Schema,
    /// API misuse (cross-entity join remap, collapse without referrers, a
    /// malformed statement template). Fatal, signals a bug in the caller.
    #[display("invariant_violation")]
    InvariantViolation,
    /// One or more batch partitions failed. Carries every partition error.
    #[display("partition")]
    Partition,
    /// The database driver rejected a statement.
    #[display("backend")]
    Backend,
    #[display("internal")]
    Internal,
}

///
/// ErrorOrigin
///

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum ErrorOrigin {
    #[display("introspect")]
    Introspect,
    #[display("locate")]
    Locate,
    #[display("statement")]
    Statement,
    #[display("execute")]
    Execute,
    #[display("rewrite")]
    Rewrite,
    #[display("remove")]
    Remove,
    #[display("collapse")]
    Collapse,
    #[display("registry")]
    Registry,
    #[display("session")]
    Session,
}

///
/// PartitionError
///
/// One failed id-range partition of a batched statement.
///

#[derive(Clone, Debug, Display)]
#[display("[{lo}, {hi}]: {message}")]
pub struct PartitionError {
    pub lo: i64,
    pub hi: i64,
    pub message: String,
}

///
/// ErrorDetail
///
/// Optional structured error detail.
/// The variant (if present) must correspond to `class`.
///

#[derive(Clone, Debug)]
pub enum ErrorDetail {
    /// Every failed partition of a batched run, not just the first.
    Partitions(Vec<PartitionError>),
}

///
/// EngineError
///
/// Structured runtime error with a stable internal classification.
/// Not a stable API; intended for internal use and may change without notice.
///

#[derive(Debug, ThisError)]
#[error("{origin}: {message}")]
pub struct EngineError {
    pub class: ErrorClass,
    pub origin: ErrorOrigin,
    pub message: String,
    pub detail: Option<ErrorDetail>,
}

impl EngineError {
    pub fn new(class: ErrorClass, origin: ErrorOrigin, message: impl Into<String>) -> Self {
        Self {
            class,
            origin,
            message: message.into(),
            detail: None,
        }
    }

    /// Construct a schema error for a table that is not in the database.
    pub(crate) fn missing_table(origin: ErrorOrigin, table: &str) -> Self {
        Self::new(
            ErrorClass::Schema,
            origin,
            format!("table '{table}' does not exist"),
        )
    }

    /// Construct a schema error for an entity unknown to the catalog.
    pub(crate) fn unknown_entity(origin: ErrorOrigin, entity: &str) -> Self {
        Self::new(
            ErrorClass::Schema,
            origin,
            format!("entity '{entity}' is not registered in the catalog"),
        )
    }

    /// Construct an invariant violation for a specific origin.
    pub(crate) fn invariant(origin: ErrorOrigin, message: impl Into<String>) -> Self {
        Self::new(ErrorClass::InvariantViolation, origin, message.into())
    }

    /// Construct a backend error for a specific origin.
    pub(crate) fn backend(origin: ErrorOrigin, message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Backend, origin, message.into())
    }

    /// Aggregate failed partitions into a single error carrying all of them.
    pub(crate) fn partitions(origin: ErrorOrigin, table: &str, failed: Vec<PartitionError>) -> Self {
        let ranges = failed
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        Self {
            class: ErrorClass::Partition,
            origin,
            message: format!(
                "{n} partition(s) failed on table '{table}': {ranges}",
                n = failed.len()
            ),
            detail: Some(ErrorDetail::Partitions(failed)),
        }
    }

    #[must_use]
    pub const fn is_schema(&self) -> bool {
        matches!(self.class, ErrorClass::Schema)
    }

    #[must_use]
    pub const fn is_invariant_violation(&self) -> bool {
        matches!(self.class, ErrorClass::InvariantViolation)
    }
}

///
/// SqlResultExt
///
/// Attach an origin when propagating driver errors. Keeps `?` ergonomics
/// without a blanket `From` that would erase where the statement ran.
///

pub(crate) trait SqlResultExt<T> {
    fn at(self, origin: ErrorOrigin) -> Result<T, EngineError>;
}

impl<T> SqlResultExt<T> for Result<T, rusqlite::Error> {
    fn at(self, origin: ErrorOrigin) -> Result<T, EngineError> {
        self.map_err(|err| EngineError::backend(origin, err.to_string()))
    }
}

impl<T> SqlResultExt<T> for Result<T, r2d2::Error> {
    fn at(self, origin: ErrorOrigin) -> Result<T, EngineError> {
        self.map_err(|err| EngineError::backend(origin, format!("connection pool: {err}")))
    }
}
