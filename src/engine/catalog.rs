use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::core::{
    EngineError, EngineResult, ForeignKey, ReferentialAction, Row, TableSchema, Value,
};
use crate::schema::SchemaOperation;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableData {
    pub schema: TableSchema,
    pub rows: im::Vector<Row>,
    next_id: i64,
}

impl TableData {
    fn new(schema: TableSchema) -> Self {
        Self {
            schema,
            rows: im::Vector::new(),
            next_id: 1,
        }
    }
}

/// Complete database contents: schema objects plus rows.
///
/// Backed by persistent maps, so cloning is O(1); every transaction works on its own
/// clone and publishes it wholesale on commit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    tables: im::OrdMap<String, TableData>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table_exists(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }

    pub fn get_schema(&self, name: &str) -> Option<&TableSchema> {
        self.tables.get(name).map(|t| &t.schema)
    }

    pub fn scan(&self, name: &str) -> EngineResult<Vec<Row>> {
        Ok(self.table(name)?.rows.iter().cloned().collect())
    }

    fn table(&self, name: &str) -> EngineResult<&TableData> {
        self.tables
            .get(name)
            .ok_or_else(|| EngineError::SchemaConflict(format!("Table '{}' not found", name)))
    }

    fn table_mut(&mut self, name: &str) -> EngineResult<&mut TableData> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| EngineError::SchemaConflict(format!("Table '{}' not found", name)))
    }

    /// Foreign keys of *other* tables pointing at `table`.
    fn inbound_foreign_keys(&self, table: &str) -> Vec<(String, ForeignKey)> {
        self.tables
            .iter()
            .filter(|(name, _)| name.as_str() != table)
            .flat_map(|(name, data)| {
                data.schema
                    .foreign_keys
                    .iter()
                    .filter(|fk| fk.referenced_table == table)
                    .map(move |fk| (name.clone(), fk.clone()))
            })
            .collect()
    }

    // ========================================================================
    // Schema operations
    // ========================================================================

    pub fn apply(&mut self, operation: &SchemaOperation) -> EngineResult<()> {
        match operation {
            SchemaOperation::CreateTable(schema) => self.create_table(schema.clone()),
            SchemaOperation::DropTable { name, if_exists } => self.drop_table(name, *if_exists),
            SchemaOperation::RenameTable { from, to } => self.rename_table(from, to),
            SchemaOperation::AddColumn { table, column } => {
                let data = self.table_mut(table)?;
                if data.schema.get_column(&column.name).is_some() {
                    return Err(EngineError::SchemaConflict(format!(
                        "Column '{}' already exists in table '{}'",
                        column.name, table
                    )));
                }
                let fill = column.default.clone().unwrap_or(Value::Null);
                if fill.is_null() && !column.nullable && !data.rows.is_empty() {
                    return Err(EngineError::ConstraintViolation(format!(
                        "Cannot add NOT NULL column '{}' without default to non-empty table '{}'",
                        column.name, table
                    )));
                }
                data.schema.columns.push(column.clone());
                data.rows = data
                    .rows
                    .iter()
                    .map(|row| {
                        let mut row = row.clone();
                        row.push(fill.clone());
                        row
                    })
                    .collect();
                Ok(())
            }
            SchemaOperation::DropColumn { table, column } => self.drop_column(table, column),
            SchemaOperation::AddForeignKey { table, foreign_key } => {
                self.add_foreign_key(table, foreign_key.clone())
            }
            SchemaOperation::DropForeignKey { table, name } => {
                let data = self.table_mut(table)?;
                let before = data.schema.foreign_keys.len();
                data.schema.foreign_keys.retain(|fk| &fk.name != name);
                if data.schema.foreign_keys.len() == before {
                    return Err(EngineError::SchemaConflict(format!(
                        "Foreign key '{}' not found on table '{}'",
                        name, table
                    )));
                }
                Ok(())
            }
            SchemaOperation::CreateIndex { table, index } => {
                let data = self.table(table)?;
                if data.schema.find_index(&index.name).is_some() {
                    return Err(EngineError::SchemaConflict(format!(
                        "Index '{}' already exists on table '{}'",
                        index.name, table
                    )));
                }
                let positions = column_positions(&data.schema, &index.columns)?;
                if index.unique {
                    let mut seen = HashSet::new();
                    for row in &data.rows {
                        let key = project(row, &positions);
                        if !key.iter().any(Value::is_null) && !seen.insert(key) {
                            return Err(EngineError::ConstraintViolation(format!(
                                "Cannot create unique index '{}': duplicate values in '{}'",
                                index.name, table
                            )));
                        }
                    }
                }
                self.table_mut(table)?.schema.indexes.push(index.clone());
                Ok(())
            }
            SchemaOperation::DropIndex { table, name } => {
                let data = self.table_mut(table)?;
                let before = data.schema.indexes.len();
                data.schema.indexes.retain(|idx| &idx.name != name);
                if data.schema.indexes.len() == before {
                    return Err(EngineError::SchemaConflict(format!(
                        "Index '{}' not found on table '{}'",
                        name, table
                    )));
                }
                Ok(())
            }
            SchemaOperation::Sql(_) => {
                for op in operation.normalize()? {
                    self.apply(&op)?;
                }
                Ok(())
            }
        }
    }

    fn create_table(&mut self, schema: TableSchema) -> EngineResult<()> {
        if self.table_exists(&schema.name) {
            return Err(EngineError::SchemaConflict(format!(
                "Table '{}' already exists",
                schema.name
            )));
        }
        if schema.columns.is_empty() {
            return Err(EngineError::SchemaConflict(format!(
                "Table '{}' must have at least one column",
                schema.name
            )));
        }

        let mut names = HashSet::new();
        for col in &schema.columns {
            if !names.insert(col.name.as_str()) {
                return Err(EngineError::SchemaConflict(format!(
                    "Duplicate column '{}' in table '{}'",
                    col.name, schema.name
                )));
            }
        }

        let mut index_names = HashSet::new();
        for index in &schema.indexes {
            if !index_names.insert(index.name.as_str()) {
                return Err(EngineError::SchemaConflict(format!(
                    "Duplicate index '{}' in table '{}'",
                    index.name, schema.name
                )));
            }
            column_positions(&schema, &index.columns)?;
        }

        for fk in &schema.foreign_keys {
            column_positions(&schema, &fk.columns)?;
            if fk.referenced_table == schema.name {
                column_positions(&schema, &fk.referenced_columns)?;
            } else {
                self.check_reference_target(fk)?;
            }
        }

        self.tables
            .insert(schema.name.clone(), TableData::new(schema));
        Ok(())
    }

    fn drop_table(&mut self, name: &str, if_exists: bool) -> EngineResult<()> {
        if !self.table_exists(name) {
            if if_exists {
                return Ok(());
            }
            return Err(EngineError::SchemaConflict(format!("Table '{}' not found", name)));
        }

        if let Some((child, fk)) = self.inbound_foreign_keys(name).into_iter().next() {
            return Err(EngineError::ConstraintViolation(format!(
                "Cannot drop table '{}': referenced by foreign key '{}' on '{}'",
                name, fk.name, child
            )));
        }

        self.tables.remove(name);
        Ok(())
    }

    fn rename_table(&mut self, from: &str, to: &str) -> EngineResult<()> {
        if self.table_exists(to) {
            return Err(EngineError::SchemaConflict(format!("Table '{}' already exists", to)));
        }
        let mut data = self
            .tables
            .remove(from)
            .ok_or_else(|| EngineError::SchemaConflict(format!("Table '{}' not found", from)))?;

        data.schema.name = to.to_string();
        for fk in data.schema.foreign_keys.iter_mut() {
            if fk.referenced_table == from {
                fk.referenced_table = to.to_string();
            }
        }
        let others: Vec<String> = self.tables.keys().cloned().collect();
        for name in others {
            if let Some(other) = self.tables.get_mut(&name) {
                for fk in other.schema.foreign_keys.iter_mut() {
                    if fk.referenced_table == from {
                        fk.referenced_table = to.to_string();
                    }
                }
            }
        }
        self.tables.insert(to.to_string(), data);
        Ok(())
    }

    fn drop_column(&mut self, table: &str, column: &str) -> EngineResult<()> {
        for (child, fk) in self.inbound_foreign_keys(table) {
            if fk.referenced_columns.iter().any(|c| c == column) {
                return Err(EngineError::ConstraintViolation(format!(
                    "Cannot drop column '{}.{}': referenced by foreign key '{}' on '{}'",
                    table, column, fk.name, child
                )));
            }
        }

        let data = self.table_mut(table)?;
        let position = data.schema.find_column_index(column).ok_or_else(|| {
            EngineError::SchemaConflict(format!("Column '{}' not found in table '{}'", column, table))
        })?;
        if data.schema.column_is_constrained(column) {
            return Err(EngineError::SchemaConflict(format!(
                "Column '{}.{}' is used by an index or foreign key; drop that first",
                table, column
            )));
        }
        if data.schema.columns.len() == 1 {
            return Err(EngineError::SchemaConflict(format!(
                "Cannot drop the last column of table '{}'",
                table
            )));
        }

        data.schema.columns.remove(position);
        data.rows = data
            .rows
            .iter()
            .map(|row| {
                let mut row = row.clone();
                row.remove(position);
                row
            })
            .collect();
        Ok(())
    }

    fn add_foreign_key(&mut self, table: &str, fk: ForeignKey) -> EngineResult<()> {
        let data = self.table(table)?;
        if data.schema.find_foreign_key(&fk.name).is_some() {
            return Err(EngineError::SchemaConflict(format!(
                "Foreign key '{}' already exists on table '{}'",
                fk.name, table
            )));
        }
        let positions = column_positions(&data.schema, &fk.columns)?;
        self.check_reference_target(&fk)?;

        let target = self.table(&fk.referenced_table)?;
        let target_positions = column_positions(&target.schema, &fk.referenced_columns)?;
        let existing: HashSet<Vec<Value>> = target
            .rows
            .iter()
            .map(|row| project(row, &target_positions))
            .collect();
        for row in &data.rows {
            let key = project(row, &positions);
            if !key.iter().any(Value::is_null) && !existing.contains(&key) {
                return Err(EngineError::ConstraintViolation(format!(
                    "Existing rows of '{}' violate foreign key '{}'",
                    table, fk.name
                )));
            }
        }

        self.table_mut(table)?.schema.foreign_keys.push(fk);
        Ok(())
    }

    fn check_reference_target(&self, fk: &ForeignKey) -> EngineResult<()> {
        let target = self.get_schema(&fk.referenced_table).ok_or_else(|| {
            EngineError::ConstraintViolation(format!(
                "Foreign key '{}' references missing table '{}'",
                fk.name, fk.referenced_table
            ))
        })?;
        for col in &fk.referenced_columns {
            if target.get_column(col).is_none() {
                return Err(EngineError::ConstraintViolation(format!(
                    "Foreign key '{}' references missing column '{}.{}'",
                    fk.name, fk.referenced_table, col
                )));
            }
        }
        if fk.columns.len() != fk.referenced_columns.len() {
            return Err(EngineError::SchemaConflict(format!(
                "Foreign key '{}' column count does not match its reference",
                fk.name
            )));
        }
        Ok(())
    }

    // ========================================================================
    // Row operations
    // ========================================================================

    pub fn insert(&mut self, table: &str, mut row: Row) -> EngineResult<()> {
        let data = self.table(table)?;
        let schema = &data.schema;
        if row.len() != schema.columns.len() {
            return Err(EngineError::ConstraintViolation(format!(
                "Table '{}' expects {} values, got {}",
                table,
                schema.columns.len(),
                row.len()
            )));
        }

        let mut next_id = data.next_id;
        for (idx, col) in schema.columns.iter().enumerate() {
            if row[idx].is_null() {
                if col.auto_increment {
                    row[idx] = Value::Integer(next_id);
                } else if let Some(default) = &col.default {
                    row[idx] = default.clone();
                }
            }
            if row[idx].is_null() && !col.nullable {
                return Err(EngineError::ConstraintViolation(format!(
                    "Column '{}.{}' cannot be NULL",
                    table, col.name
                )));
            }
            if !col.data_type.is_compatible(&row[idx]) {
                return Err(EngineError::ConstraintViolation(format!(
                    "Column '{}.{}' expects {}, got {}",
                    table,
                    col.name,
                    col.data_type,
                    row[idx].type_name()
                )));
            }
            if col.auto_increment {
                if let Some(id) = row[idx].as_i64() {
                    next_id = next_id.max(id + 1);
                }
            }
        }

        let pk = schema.primary_key_indexes();
        if !pk.is_empty() {
            let key = project(&row, &pk);
            if data.rows.iter().any(|existing| project(existing, &pk) == key) {
                return Err(EngineError::ConstraintViolation(format!(
                    "Duplicate primary key in '{}'",
                    table
                )));
            }
        }

        for index in schema.indexes.iter().filter(|idx| idx.unique) {
            let positions = column_positions(schema, &index.columns)?;
            let key = project(&row, &positions);
            if key.iter().any(Value::is_null) {
                continue;
            }
            if data.rows.iter().any(|existing| project(existing, &positions) == key) {
                return Err(EngineError::ConstraintViolation(format!(
                    "Duplicate value for unique index '{}'",
                    index.name
                )));
            }
        }

        for fk in &schema.foreign_keys {
            let key = project(&row, &column_positions(schema, &fk.columns)?);
            if key.iter().any(Value::is_null) {
                continue;
            }
            let found = if fk.referenced_table == table {
                let positions = column_positions(schema, &fk.referenced_columns)?;
                data.rows.iter().any(|r| project(r, &positions) == key)
                    || project(&row, &positions) == key
            } else {
                let target = self.table(&fk.referenced_table)?;
                let positions = column_positions(&target.schema, &fk.referenced_columns)?;
                target.rows.iter().any(|r| project(r, &positions) == key)
            };
            if !found {
                return Err(EngineError::ConstraintViolation(format!(
                    "Row in '{}' references non-existent key in '{}' (foreign key '{}')",
                    table, fk.referenced_table, fk.name
                )));
            }
        }

        let data = self.table_mut(table)?;
        data.next_id = next_id;
        data.rows.push_back(row);
        Ok(())
    }

    /// Deletes rows whose `column` equals `value`, applying referential actions of
    /// inbound foreign keys. Returns the number of rows deleted from `table`.
    pub fn delete_where(&mut self, table: &str, column: &str, value: &Value) -> EngineResult<usize> {
        let position = {
            let schema = &self.table(table)?.schema;
            schema.find_column_index(column).ok_or_else(|| {
                EngineError::SchemaConflict(format!(
                    "Column '{}' not found in table '{}'",
                    column, table
                ))
            })?
        };
        let keys = HashSet::from([vec![value.clone()]]);
        self.delete_keys(table, &[position], &keys)
    }

    fn delete_keys(
        &mut self,
        table: &str,
        positions: &[usize],
        keys: &HashSet<Vec<Value>>,
    ) -> EngineResult<usize> {
        let data = self.table(table)?;
        let (deleted, kept): (Vec<Row>, Vec<Row>) = data
            .rows
            .iter()
            .cloned()
            .partition(|row| keys.contains(&project(row, positions)));
        if deleted.is_empty() {
            return Ok(0);
        }
        let schema = data.schema.clone();
        self.table_mut(table)?.rows = kept.into_iter().collect();

        for (child, fk) in self.inbound_foreign_keys(table) {
            let parent_positions = column_positions(&schema, &fk.referenced_columns)?;
            let removed: HashSet<Vec<Value>> = deleted
                .iter()
                .map(|row| project(row, &parent_positions))
                .collect();
            let child_positions = column_positions(&self.table(&child)?.schema, &fk.columns)?;
            let referencing = self
                .table(&child)?
                .rows
                .iter()
                .filter(|row| removed.contains(&project(row, &child_positions)))
                .count();
            if referencing == 0 {
                continue;
            }

            match fk.on_delete {
                ReferentialAction::Restrict | ReferentialAction::NoAction => {
                    return Err(EngineError::ConstraintViolation(format!(
                        "Delete from '{}' violates foreign key constraint '{}' on '{}'",
                        table, fk.name, child
                    )));
                }
                ReferentialAction::Cascade => {
                    self.delete_keys(&child, &child_positions, &removed)?;
                }
                ReferentialAction::SetNull => {
                    let child_data = self.table_mut(&child)?;
                    child_data.rows = child_data
                        .rows
                        .iter()
                        .map(|row| {
                            let mut row = row.clone();
                            if removed.contains(&project(&row, &child_positions)) {
                                for pos in &child_positions {
                                    row[*pos] = Value::Null;
                                }
                            }
                            row
                        })
                        .collect();
                }
            }
        }

        Ok(deleted.len())
    }
}

fn column_positions(schema: &TableSchema, columns: &[String]) -> EngineResult<Vec<usize>> {
    columns
        .iter()
        .map(|name| {
            schema.find_column_index(name).ok_or_else(|| {
                EngineError::SchemaConflict(format!(
                    "Column '{}' not found in table '{}'",
                    name, schema.name
                ))
            })
        })
        .collect()
}

fn project(row: &Row, positions: &[usize]) -> Vec<Value> {
    positions.iter().map(|pos| row[*pos].clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Column, DataType, IndexDef};
    use crate::schema::Blueprint;

    fn events_and_sessions() -> Catalog {
        let mut catalog = Catalog::new();
        for op in Blueprint::create("events").id("id").string("name", 100).into_operations() {
            catalog.apply(&op).unwrap();
        }
        let sessions = Blueprint::create("event_sessions")
            .id("id")
            .foreign_id("event_id")
            .foreign(
                ForeignKey::new("event_sessions_event_id_foreign", "event_id", "events", "id")
                    .on_delete(ReferentialAction::Cascade),
            )
            .into_operations();
        for op in sessions {
            catalog.apply(&op).unwrap();
        }
        catalog
    }

    #[test]
    fn create_twice_is_a_conflict() {
        let mut catalog = events_and_sessions();
        let err = catalog
            .apply(&SchemaOperation::CreateTable(TableSchema::new(
                "events",
                vec![Column::new("id", DataType::Integer)],
            )))
            .unwrap_err();
        assert!(matches!(err, EngineError::SchemaConflict(_)));
    }

    #[test]
    fn foreign_key_needs_target_table() {
        let mut catalog = Catalog::new();
        let ops = Blueprint::create("event_sessions")
            .id("id")
            .foreign_id("event_id")
            .foreign(ForeignKey::new("fk", "event_id", "events", "id"))
            .into_operations();
        let err = catalog.apply(&ops[0]).unwrap_err();
        assert!(matches!(err, EngineError::ConstraintViolation(_)));
    }

    #[test]
    fn referenced_table_cannot_be_dropped() {
        let mut catalog = events_and_sessions();
        let err = catalog.apply(&SchemaOperation::drop_table("events")).unwrap_err();
        assert!(matches!(err, EngineError::ConstraintViolation(_)));

        catalog.apply(&SchemaOperation::drop_table("event_sessions")).unwrap();
        catalog.apply(&SchemaOperation::drop_table("events")).unwrap();
        assert!(catalog.table_names().is_empty());
    }

    #[test]
    fn cascade_delete_removes_children() {
        let mut catalog = events_and_sessions();
        catalog
            .insert("events", vec![Value::Null, Value::from("RustConf")])
            .unwrap();
        catalog
            .insert("event_sessions", vec![Value::Null, Value::Integer(1)])
            .unwrap();
        let err = catalog
            .insert("event_sessions", vec![Value::Null, Value::Integer(42)])
            .unwrap_err();
        assert!(matches!(err, EngineError::ConstraintViolation(_)));

        let deleted = catalog.delete_where("events", "id", &Value::Integer(1)).unwrap();
        assert_eq!(deleted, 1);
        assert!(catalog.scan("event_sessions").unwrap().is_empty());
    }

    #[test]
    fn rename_rewrites_inbound_references() {
        let mut catalog = events_and_sessions();
        catalog
            .apply(&SchemaOperation::RenameTable {
                from: "events".into(),
                to: "conferences".into(),
            })
            .unwrap();
        let fk = &catalog.get_schema("event_sessions").unwrap().foreign_keys[0];
        assert_eq!(fk.referenced_table, "conferences");
    }

    #[test]
    fn not_null_column_needs_default_on_populated_table() {
        let mut catalog = events_and_sessions();
        catalog
            .insert("events", vec![Value::Null, Value::from("RustConf")])
            .unwrap();
        let err = catalog
            .apply(&SchemaOperation::AddColumn {
                table: "events".into(),
                column: Column::new("city", DataType::Text),
            })
            .unwrap_err();
        assert!(matches!(err, EngineError::ConstraintViolation(_)));

        catalog
            .apply(&SchemaOperation::AddColumn {
                table: "events".into(),
                column: Column::new("city", DataType::Text).default_value("Berlin"),
            })
            .unwrap();
        let rows = catalog.scan("events").unwrap();
        assert_eq!(rows[0][2], Value::from("Berlin"));
    }

    #[test]
    fn unique_index_treats_signed_zeros_as_duplicates() {
        let mut catalog = Catalog::new();
        for op in Blueprint::create("readings").id("id").float("level").into_operations() {
            catalog.apply(&op).unwrap();
        }
        catalog.insert("readings", vec![Value::Null, Value::Float(0.0)]).unwrap();
        catalog.insert("readings", vec![Value::Null, Value::Float(-0.0)]).unwrap();

        let err = catalog
            .apply(&SchemaOperation::CreateIndex {
                table: "readings".into(),
                index: IndexDef::new("readings_level_unique", vec!["level".into()]).unique(),
            })
            .unwrap_err();
        assert!(matches!(err, EngineError::ConstraintViolation(_)));
    }
}
