use crate::core::{Column, DataType, ForeignKey, IndexDef, TableSchema, Value};

use super::SchemaOperation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Create,
    Alter,
}

/// Fluent table definition.
///
/// Column modifiers (`nullable`, `default`, `unique`) apply to the most recently added
/// column. Nothing is inferred from names: foreign keys, index names and referenced
/// tables are always passed explicitly.
///
/// ```
/// use rustmigrate::core::ReferentialAction;
/// use rustmigrate::core::ForeignKey;
/// use rustmigrate::schema::Blueprint;
///
/// let ops = Blueprint::create("event_sessions")
///     .id("id")
///     .string("title", 255)
///     .foreign_id("event_id")
///     .foreign(
///         ForeignKey::new("event_sessions_event_id_foreign", "event_id", "events", "id")
///             .on_delete(ReferentialAction::Cascade),
///     )
///     .into_operations();
/// assert_eq!(ops.len(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct Blueprint {
    table: String,
    mode: Mode,
    columns: Vec<Column>,
    dropped_columns: Vec<String>,
    foreign_keys: Vec<ForeignKey>,
    indexes: Vec<IndexDef>,
}

impl Blueprint {
    /// Starts the definition of a new table.
    pub fn create(table: impl Into<String>) -> Self {
        Self::with_mode(table, Mode::Create)
    }

    /// Starts a set of changes to an existing table.
    pub fn alter(table: impl Into<String>) -> Self {
        Self::with_mode(table, Mode::Alter)
    }

    fn with_mode(table: impl Into<String>, mode: Mode) -> Self {
        Self {
            table: table.into(),
            mode,
            columns: Vec::new(),
            dropped_columns: Vec::new(),
            foreign_keys: Vec::new(),
            indexes: Vec::new(),
        }
    }

    pub fn column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    /// Auto-incrementing big integer primary key.
    pub fn id(self, name: &str) -> Self {
        self.column(Column::new(name, DataType::BigInteger).primary_key().auto_increment())
    }

    pub fn big_integer(self, name: &str) -> Self {
        self.column(Column::new(name, DataType::BigInteger))
    }

    pub fn integer(self, name: &str) -> Self {
        self.column(Column::new(name, DataType::Integer))
    }

    pub fn float(self, name: &str) -> Self {
        self.column(Column::new(name, DataType::Float))
    }

    pub fn boolean(self, name: &str) -> Self {
        self.column(Column::new(name, DataType::Boolean))
    }

    pub fn string(self, name: &str, length: u32) -> Self {
        self.column(Column::new(name, DataType::String(length)))
    }

    pub fn text(self, name: &str) -> Self {
        self.column(Column::new(name, DataType::Text))
    }

    pub fn time(self, name: &str) -> Self {
        self.column(Column::new(name, DataType::Time))
    }

    pub fn date(self, name: &str) -> Self {
        self.column(Column::new(name, DataType::Date))
    }

    pub fn timestamp(self, name: &str) -> Self {
        self.column(Column::new(name, DataType::Timestamp))
    }

    /// Nullable `created_at` and `updated_at` timestamps.
    pub fn timestamps(self) -> Self {
        self.timestamp("created_at")
            .nullable()
            .timestamp("updated_at")
            .nullable()
    }

    /// Big integer column meant to carry a foreign key declared with [`Blueprint::foreign`].
    pub fn foreign_id(self, name: &str) -> Self {
        self.big_integer(name)
    }

    pub fn nullable(mut self) -> Self {
        if let Some(column) = self.columns.last_mut() {
            column.nullable = true;
        }
        self
    }

    pub fn default(mut self, value: impl Into<Value>) -> Self {
        if let Some(column) = self.columns.last_mut() {
            column.default = Some(value.into());
        }
        self
    }

    /// Unique index named `index_name` over the last added column.
    pub fn unique(mut self, index_name: &str) -> Self {
        if let Some(column) = self.columns.last() {
            let index = IndexDef::new(index_name, vec![column.name.clone()]).unique();
            self.indexes.push(index);
        }
        self
    }

    pub fn index(mut self, index: IndexDef) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn foreign(mut self, foreign_key: ForeignKey) -> Self {
        self.foreign_keys.push(foreign_key);
        self
    }

    /// Only meaningful for [`Blueprint::alter`].
    pub fn drop_column(mut self, name: &str) -> Self {
        self.dropped_columns.push(name.to_string());
        self
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    pub fn into_operations(self) -> Vec<SchemaOperation> {
        match self.mode {
            Mode::Create => {
                let mut schema = TableSchema::new(self.table, self.columns);
                schema.foreign_keys = self.foreign_keys;
                schema.indexes = self.indexes;
                vec![SchemaOperation::CreateTable(schema)]
            }
            Mode::Alter => {
                let table = self.table;
                let mut ops = Vec::new();
                for column in self.dropped_columns {
                    ops.push(SchemaOperation::DropColumn {
                        table: table.clone(),
                        column,
                    });
                }
                for column in self.columns {
                    ops.push(SchemaOperation::AddColumn {
                        table: table.clone(),
                        column,
                    });
                }
                for foreign_key in self.foreign_keys {
                    ops.push(SchemaOperation::AddForeignKey {
                        table: table.clone(),
                        foreign_key,
                    });
                }
                for index in self.indexes {
                    ops.push(SchemaOperation::CreateIndex {
                        table: table.clone(),
                        index,
                    });
                }
                ops
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modifiers_apply_to_last_column() {
        let ops = Blueprint::create("event_sessions")
            .string("title", 255)
            .string("speaker", 255)
            .nullable()
            .into_operations();

        let SchemaOperation::CreateTable(schema) = &ops[0] else {
            panic!("expected CreateTable, got {:?}", ops[0]);
        };
        assert!(!schema.get_column("title").unwrap().nullable);
        assert!(schema.get_column("speaker").unwrap().nullable);
    }

    #[test]
    fn alter_emits_one_operation_per_change() {
        let ops = Blueprint::alter("events")
            .string("venue", 120)
            .nullable()
            .unique("events_venue_unique")
            .drop_column("legacy_code")
            .into_operations();

        assert_eq!(ops.len(), 3);
        assert!(matches!(ops[0], SchemaOperation::DropColumn { .. }));
        assert!(matches!(ops[1], SchemaOperation::AddColumn { .. }));
        assert!(matches!(ops[2], SchemaOperation::CreateIndex { ref index, .. } if index.unique));
    }
}
