use crate::{
    catalog::{Catalog, ColumnKind},
    error::{EngineError, ErrorOrigin},
    schema::TableFacts,
};
use serde::{Deserialize, Serialize};

///
/// OnDelete
///
/// Foreign-key delete action as reported by the database catalog.
///

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum OnDelete {
    NoAction,
    Restrict,
    SetNull,
    SetDefault,
    Cascade,
}

impl OnDelete {
    /// Parse the action text from `PRAGMA foreign_key_list`.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        match text.to_ascii_uppercase().as_str() {
            "CASCADE" => Self::Cascade,
            "RESTRICT" => Self::Restrict,
            "SET NULL" => Self::SetNull,
            "SET DEFAULT" => Self::SetDefault,
            _ => Self::NoAction,
        }
    }

    #[must_use]
    pub const fn is_cascade(self) -> bool {
        matches!(self, Self::Cascade)
    }
}

///
/// ForeignKeyEdge
///
/// One single-column foreign-key constraint. Discovered, never mutated,
/// cached for the run. Composite-key constraints are not modeled.
///

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ForeignKeyEdge {
    pub source_table: String,
    pub source_column: String,
    pub target_table: String,
    pub target_column: String,
    pub on_delete: OnDelete,
}

///
/// RelationKind
///
/// How a referring edge is mutated when its target ids move: update in
/// place (many-to-one) or merge join rows (many-to-many).
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RelationKind {
    ManyToOne,
    ManyToMany { other_column: String },
}

/// Classify a referring edge for the duplicate collapser.
///
/// Fallback order: explicit many-to-many declaration from the catalog, then
/// the no-id/two-column/cascade heuristic, then the catalog's column-kind
/// lookup. Finding neither is a hard error, never a silent default.
pub(crate) fn classify_edge(
    facts: &TableFacts,
    catalog: &dyn Catalog,
    edge: &ForeignKeyEdge,
) -> Result<RelationKind, EngineError> {
    let others = facts.column_names(&[edge.source_column.as_str()]);

    let join_partner = |others: &[String]| -> Result<String, EngineError> {
        match others {
            [other] => Ok(other.clone()),
            _ => Err(EngineError::invariant(
                ErrorOrigin::Collapse,
                format!(
                    "join table '{}' must have exactly two columns, found {}",
                    edge.source_table,
                    others.len() + 1
                ),
            )),
        }
    };

    if catalog.declared_many_to_many(&edge.source_table) {
        return Ok(RelationKind::ManyToMany {
            other_column: join_partner(&others)?,
        });
    }

    if !facts.has_id && others.len() == 1 && edge.on_delete.is_cascade() {
        return Ok(RelationKind::ManyToMany {
            other_column: others[0].clone(),
        });
    }

    match catalog.column_kind(&edge.source_table, &edge.source_column) {
        Some(ColumnKind::ManyToOne) => Ok(RelationKind::ManyToOne),
        Some(ColumnKind::ManyToMany) => Ok(RelationKind::ManyToMany {
            other_column: join_partner(&others)?,
        }),
        None => Err(EngineError::invariant(
            ErrorOrigin::Collapse,
            format!(
                "cannot determine whether column '{}' of table '{}' is many-to-one or many-to-many",
                edge.source_column, edge.source_table
            ),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{catalog::MemoryCatalog, schema::ColumnFacts};

    fn facts(name: &str, has_id: bool, columns: &[&str]) -> TableFacts {
        TableFacts {
            name: name.to_owned(),
            columns: columns
                .iter()
                .map(|c| ColumnFacts {
                    name: (*c).to_owned(),
                    declared_type: "INTEGER".to_owned(),
                    updatable: true,
                })
                .collect(),
            has_id,
            foreign_keys: Vec::new(),
            unique_indexes: Vec::new(),
        }
    }

    fn edge(table: &str, column: &str, on_delete: OnDelete) -> ForeignKeyEdge {
        ForeignKeyEdge {
            source_table: table.to_owned(),
            source_column: column.to_owned(),
            target_table: "tag".to_owned(),
            target_column: "id".to_owned(),
            on_delete,
        }
    }

    #[test]
    fn cascade_two_column_table_without_id_is_many_to_many() {
        let catalog = MemoryCatalog::default();
        let kind = classify_edge(
            &facts("partner_tag", false, &["partner_id", "tag_id"]),
            &catalog,
            &edge("partner_tag", "tag_id", OnDelete::Cascade),
        )
        .expect("heuristic should classify the join table");
        assert_eq!(
            kind,
            RelationKind::ManyToMany {
                other_column: "partner_id".to_owned()
            }
        );
    }

    #[test]
    fn declared_many_to_many_wins_over_heuristic() {
        let mut catalog = MemoryCatalog::default();
        catalog.declare_many_to_many("partner_tag");
        // restrict action would fail the heuristic; the declaration decides
        let kind = classify_edge(
            &facts("partner_tag", false, &["partner_id", "tag_id"]),
            &catalog,
            &edge("partner_tag", "tag_id", OnDelete::Restrict),
        )
        .expect("declared m2m should classify");
        assert!(matches!(kind, RelationKind::ManyToMany { .. }));
    }

    #[test]
    fn catalog_hint_resolves_plain_tables() {
        let mut catalog = MemoryCatalog::default();
        catalog.hint_column("task", "tag_id", ColumnKind::ManyToOne);
        let kind = classify_edge(
            &facts("task", true, &["id", "name", "tag_id"]),
            &catalog,
            &edge("task", "tag_id", OnDelete::SetNull),
        )
        .expect("hinted column should classify");
        assert_eq!(kind, RelationKind::ManyToOne);
    }

    #[test]
    fn unclassifiable_edge_is_a_hard_error() {
        let catalog = MemoryCatalog::default();
        let err = classify_edge(
            &facts("task", true, &["id", "name", "tag_id"]),
            &catalog,
            &edge("task", "tag_id", OnDelete::NoAction),
        )
        .expect_err("classifier must never fall back silently");
        assert!(err.is_invariant_violation(), "{err:?}");
    }

    #[test]
    fn on_delete_parses_pragma_action_text() {
        assert_eq!(OnDelete::parse("CASCADE"), OnDelete::Cascade);
        assert_eq!(OnDelete::parse("set null"), OnDelete::SetNull);
        assert_eq!(OnDelete::parse("NO ACTION"), OnDelete::NoAction);
        assert_eq!(OnDelete::parse(""), OnDelete::NoAction);
    }
}
