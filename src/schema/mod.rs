//! Structured schema operations.
//!
//! A migration is expressed as a list of [`SchemaOperation`]s rather than opaque SQL so that
//! the object each operation touches is known up front. Raw SQL is still accepted through
//! [`SchemaOperation::Sql`] and translated by [`sql::translate`].

pub mod blueprint;
pub mod sql;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::{Column, EngineResult, ForeignKey, IndexDef, TableSchema};

pub use blueprint::Blueprint;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SchemaOperation {
    CreateTable(TableSchema),
    DropTable { name: String, if_exists: bool },
    RenameTable { from: String, to: String },
    AddColumn { table: String, column: Column },
    DropColumn { table: String, column: String },
    AddForeignKey { table: String, foreign_key: ForeignKey },
    DropForeignKey { table: String, name: String },
    CreateIndex { table: String, index: IndexDef },
    DropIndex { table: String, name: String },
    Sql(String),
}

impl SchemaOperation {
    pub fn drop_table(name: impl Into<String>) -> Self {
        SchemaOperation::DropTable {
            name: name.into(),
            if_exists: false,
        }
    }

    pub fn drop_table_if_exists(name: impl Into<String>) -> Self {
        SchemaOperation::DropTable {
            name: name.into(),
            if_exists: true,
        }
    }

    pub fn sql(statement: impl Into<String>) -> Self {
        SchemaOperation::Sql(statement.into())
    }

    /// Expands `Sql` into structured operations; other variants are returned as-is.
    pub fn normalize(&self) -> EngineResult<Vec<SchemaOperation>> {
        match self {
            SchemaOperation::Sql(text) => sql::translate(text),
            other => Ok(vec![other.clone()]),
        }
    }

    /// The schema object this operation creates, drops or renames.
    ///
    /// `Sql` has no footprint until normalized.
    pub fn footprint(&self) -> Option<Footprint> {
        let (action, object) = match self {
            SchemaOperation::CreateTable(schema) => {
                (Action::Create, ObjectRef::Table(schema.name.clone()))
            }
            SchemaOperation::DropTable { name, .. } => (Action::Drop, ObjectRef::Table(name.clone())),
            SchemaOperation::RenameTable { from, to } => {
                (Action::RenameTo(to.clone()), ObjectRef::Table(from.clone()))
            }
            SchemaOperation::AddColumn { table, column } => (
                Action::Create,
                ObjectRef::Column {
                    table: table.clone(),
                    name: column.name.clone(),
                },
            ),
            SchemaOperation::DropColumn { table, column } => (
                Action::Drop,
                ObjectRef::Column {
                    table: table.clone(),
                    name: column.clone(),
                },
            ),
            SchemaOperation::AddForeignKey { table, foreign_key } => (
                Action::Create,
                ObjectRef::ForeignKey {
                    table: table.clone(),
                    name: foreign_key.name.clone(),
                },
            ),
            SchemaOperation::DropForeignKey { table, name } => (
                Action::Drop,
                ObjectRef::ForeignKey {
                    table: table.clone(),
                    name: name.clone(),
                },
            ),
            SchemaOperation::CreateIndex { table, index } => (
                Action::Create,
                ObjectRef::Index {
                    table: table.clone(),
                    name: index.name.clone(),
                },
            ),
            SchemaOperation::DropIndex { table, name } => (
                Action::Drop,
                ObjectRef::Index {
                    table: table.clone(),
                    name: name.clone(),
                },
            ),
            SchemaOperation::Sql(_) => return None,
        };
        Some(Footprint { action, object })
    }
}

impl fmt::Display for SchemaOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaOperation::CreateTable(schema) => {
                write!(f, "{}", schema)?;
                for index in &schema.indexes {
                    write!(f, "; {}", render_create_index(&schema.name, index))?;
                }
                Ok(())
            }
            SchemaOperation::DropTable { name, if_exists } => {
                if *if_exists {
                    write!(f, "DROP TABLE IF EXISTS {}", name)
                } else {
                    write!(f, "DROP TABLE {}", name)
                }
            }
            SchemaOperation::RenameTable { from, to } => {
                write!(f, "ALTER TABLE {} RENAME TO {}", from, to)
            }
            SchemaOperation::AddColumn { table, column } => {
                write!(f, "ALTER TABLE {} ADD COLUMN {}", table, column)
            }
            SchemaOperation::DropColumn { table, column } => {
                write!(f, "ALTER TABLE {} DROP COLUMN {}", table, column)
            }
            SchemaOperation::AddForeignKey { table, foreign_key } => {
                write!(f, "ALTER TABLE {} ADD {}", table, foreign_key)
            }
            SchemaOperation::DropForeignKey { table, name } => {
                write!(f, "ALTER TABLE {} DROP CONSTRAINT {}", table, name)
            }
            SchemaOperation::CreateIndex { table, index } => {
                write!(f, "{}", render_create_index(table, index))
            }
            SchemaOperation::DropIndex { table, name } => {
                write!(f, "DROP INDEX {} ON {}", name, table)
            }
            SchemaOperation::Sql(text) => write!(f, "{}", text.trim()),
        }
    }
}

fn render_create_index(table: &str, index: &IndexDef) -> String {
    format!(
        "CREATE {}INDEX {} ON {} ({})",
        if index.unique { "UNIQUE " } else { "" },
        index.name,
        table,
        index.columns.join(", ")
    )
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectRef {
    Table(String),
    Column { table: String, name: String },
    ForeignKey { table: String, name: String },
    Index { table: String, name: String },
}

impl ObjectRef {
    /// Owning table for sub-objects, `None` for tables themselves.
    pub fn parent_table(&self) -> Option<&str> {
        match self {
            ObjectRef::Table(_) => None,
            ObjectRef::Column { table, .. }
            | ObjectRef::ForeignKey { table, .. }
            | ObjectRef::Index { table, .. } => Some(table),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectRef::Table(name) => write!(f, "table '{}'", name),
            ObjectRef::Column { table, name } => write!(f, "column '{}.{}'", table, name),
            ObjectRef::ForeignKey { table, name } => write!(f, "foreign key '{}' on '{}'", name, table),
            ObjectRef::Index { table, name } => write!(f, "index '{}' on '{}'", name, table),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Action {
    Create,
    Drop,
    RenameTo(String),
}

/// What one operation does to which object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Footprint {
    pub action: Action,
    pub object: ObjectRef,
}

impl Footprint {
    /// The footprint an exact reverse operation must have.
    pub fn inverse(&self) -> Footprint {
        match (&self.action, &self.object) {
            (Action::Create, object) => Footprint {
                action: Action::Drop,
                object: object.clone(),
            },
            (Action::Drop, object) => Footprint {
                action: Action::Create,
                object: object.clone(),
            },
            (Action::RenameTo(to), ObjectRef::Table(from)) => Footprint {
                action: Action::RenameTo(from.clone()),
                object: ObjectRef::Table(to.clone()),
            },
            (Action::RenameTo(_), object) => Footprint {
                action: self.action.clone(),
                object: object.clone(),
            },
        }
    }
}

impl fmt::Display for Footprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.action {
            Action::Create => write!(f, "create {}", self.object),
            Action::Drop => write!(f, "drop {}", self.object),
            Action::RenameTo(to) => write!(f, "rename {} to '{}'", self.object, to),
        }
    }
}

/// Footprints of a list of normalized operations.
///
/// Sub-objects of a table that the same list creates or drops as a whole are folded into
/// that table's footprint: dropping a table also drops its columns and indexes.
pub fn footprints(operations: &[SchemaOperation]) -> Vec<Footprint> {
    let all: Vec<Footprint> = operations.iter().filter_map(|op| op.footprint()).collect();

    let whole_tables: Vec<(&Action, &str)> = all
        .iter()
        .filter_map(|fp| match &fp.object {
            ObjectRef::Table(name) if matches!(fp.action, Action::Create | Action::Drop) => {
                Some((&fp.action, name.as_str()))
            }
            _ => None,
        })
        .collect();

    let mut kept: Vec<Footprint> = all
        .iter()
        .filter(|fp| match fp.object.parent_table() {
            Some(table) => !whole_tables
                .iter()
                .any(|(action, name)| *action == &fp.action && *name == table),
            None => true,
        })
        .cloned()
        .collect();
    kept.sort();
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DataType;

    #[test]
    fn inverse_of_rename_swaps_names() {
        let op = SchemaOperation::RenameTable {
            from: "sessions".into(),
            to: "event_sessions".into(),
        };
        let inverse = op.footprint().unwrap().inverse();
        assert_eq!(inverse.object, ObjectRef::Table("event_sessions".into()));
        assert_eq!(inverse.action, Action::RenameTo("sessions".into()));
    }

    #[test]
    fn sub_objects_fold_into_table_creation() {
        let mut schema = TableSchema::new("events", vec![Column::new("id", DataType::BigInteger)]);
        schema.indexes.push(IndexDef::new("events_id_index", vec!["id".into()]));
        let ops = vec![
            SchemaOperation::CreateTable(schema),
            SchemaOperation::CreateIndex {
                table: "events".into(),
                index: IndexDef::new("events_extra_index", vec!["id".into()]),
            },
        ];

        let fps = footprints(&ops);
        assert_eq!(fps.len(), 1);
        assert_eq!(fps[0].object, ObjectRef::Table("events".into()));
    }

    #[test]
    fn display_renders_sql() {
        let op = SchemaOperation::AddColumn {
            table: "events".into(),
            column: Column::new("venue", DataType::String(120)).nullable(),
        };
        assert_eq!(op.to_string(), "ALTER TABLE events ADD COLUMN venue VARCHAR(120)");
        assert_eq!(
            SchemaOperation::drop_table_if_exists("events").to_string(),
            "DROP TABLE IF EXISTS events"
        );
    }
}
