//! Translation of raw DDL text into structured operations.
//!
//! Supports `CREATE TABLE`, `DROP TABLE` and `CREATE [UNIQUE] INDEX`. Anything else is
//! rejected so that every migration keeps a known footprint.

use sqlparser::ast as sql_ast;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::core::{Column, DataType, EngineError, EngineResult, IndexDef, TableSchema};

use super::SchemaOperation;

const DEFAULT_STRING_LENGTH: u32 = 255;

pub fn translate(sql: &str) -> EngineResult<Vec<SchemaOperation>> {
    let statements = Parser::parse_sql(&PostgreSqlDialect {}, sql)
        .map_err(|e| EngineError::Unsupported(format!("Failed to parse SQL: {}", e)))?;

    if statements.is_empty() {
        return Err(EngineError::Unsupported("Empty SQL statement".into()));
    }

    statements.into_iter().map(convert_statement).collect()
}

fn convert_statement(stmt: sql_ast::Statement) -> EngineResult<SchemaOperation> {
    match stmt {
        sql_ast::Statement::CreateTable(create) => convert_create_table(create),
        sql_ast::Statement::CreateIndex(ci) => convert_create_index(&ci),
        sql_ast::Statement::Drop {
            object_type,
            names,
            if_exists,
            ..
        } => {
            if !matches!(object_type, sql_ast::ObjectType::Table) {
                return Err(EngineError::Unsupported(format!(
                    "Only DROP TABLE is supported, got DROP {}",
                    object_type
                )));
            }
            if names.len() != 1 {
                return Err(EngineError::Unsupported(
                    "Only single table DROP is supported".into(),
                ));
            }
            Ok(SchemaOperation::DropTable {
                name: object_name(&names[0])?,
                if_exists,
            })
        }
        other => Err(EngineError::Unsupported(format!(
            "Statement is not supported in migrations: {}",
            other
        ))),
    }
}

fn convert_create_table(create: sql_ast::CreateTable) -> EngineResult<SchemaOperation> {
    let name = object_name(&create.name)?;
    if !create.constraints.is_empty() {
        return Err(EngineError::Unsupported(format!(
            "Table constraints in raw SQL for '{}'; declare foreign keys with the blueprint",
            name
        )));
    }

    let mut indexes = Vec::new();
    let mut columns = Vec::with_capacity(create.columns.len());
    for col in create.columns {
        let (column, unique) = convert_column_def(col)?;
        if unique {
            indexes.push(
                IndexDef::new(format!("{}_{}_unique", name, column.name), vec![column.name.clone()])
                    .unique(),
            );
        }
        columns.push(column);
    }

    let mut schema = TableSchema::new(name, columns);
    schema.indexes = indexes;
    Ok(SchemaOperation::CreateTable(schema))
}

/// Returns the column and whether it carries an inline `UNIQUE`.
fn convert_column_def(col: sql_ast::ColumnDef) -> EngineResult<(Column, bool)> {
    let data_type = convert_data_type(&col.data_type)?;
    // Columns are nullable unless declared otherwise, as in SQL.
    let mut column = Column::new(col.name.value.clone(), data_type).nullable();
    let mut unique = false;

    for opt in &col.options {
        match &opt.option {
            sql_ast::ColumnOption::NotNull => column.nullable = false,
            sql_ast::ColumnOption::Null => column.nullable = true,
            other => {
                // Remaining options are classified by their rendered keyword.
                let rendered = other.to_string().to_uppercase();
                if rendered.starts_with("PRIMARY KEY") {
                    column = column.primary_key();
                } else if rendered.starts_with("UNIQUE") {
                    unique = true;
                } else {
                    return Err(EngineError::Unsupported(format!(
                        "Column option '{}' on '{}'",
                        other, col.name.value
                    )));
                }
            }
        }
    }

    Ok((column, unique))
}

fn convert_data_type(dt: &sql_ast::DataType) -> EngineResult<DataType> {
    match dt {
        sql_ast::DataType::BigInt(_) => Ok(DataType::BigInteger),
        sql_ast::DataType::Int(_) | sql_ast::DataType::Integer(_) => Ok(DataType::Integer),
        sql_ast::DataType::Float(_) | sql_ast::DataType::Double(_) | sql_ast::DataType::Real => {
            Ok(DataType::Float)
        }
        sql_ast::DataType::Boolean | sql_ast::DataType::Bool => Ok(DataType::Boolean),
        sql_ast::DataType::Text => Ok(DataType::Text),
        sql_ast::DataType::Varchar(_)
        | sql_ast::DataType::Char(_)
        | sql_ast::DataType::String(_) => Ok(DataType::String(
            declared_length(dt).unwrap_or(DEFAULT_STRING_LENGTH),
        )),
        sql_ast::DataType::Time(..) => Ok(DataType::Time),
        sql_ast::DataType::Date => Ok(DataType::Date),
        sql_ast::DataType::Timestamp(..) => Ok(DataType::Timestamp),
        _ => Err(EngineError::Unsupported(format!("Data type {}", dt))),
    }
}

/// Reads `n` out of a rendered `VARCHAR(n)`.
fn declared_length(dt: &sql_ast::DataType) -> Option<u32> {
    let rendered = dt.to_string();
    let open = rendered.find('(')?;
    let close = rendered[open..].find(')')? + open;
    rendered[open + 1..close].trim().parse().ok()
}

fn convert_create_index(ci: &sql_ast::CreateIndex) -> EngineResult<SchemaOperation> {
    let name = match &ci.name {
        Some(n) => object_name(n)?,
        None => return Err(EngineError::Unsupported("Index name is required".into())),
    };
    let table = object_name(&ci.table_name)?;

    let columns = ci
        .columns
        .iter()
        .map(|c| match &c.column.expr {
            sql_ast::Expr::Identifier(ident) => Ok(ident.value.clone()),
            other => Err(EngineError::Unsupported(format!(
                "Index column must be an identifier, got {}",
                other
            ))),
        })
        .collect::<EngineResult<Vec<_>>>()?;

    let mut index = IndexDef::new(name, columns);
    index.unique = ci.unique;
    Ok(SchemaOperation::CreateIndex { table, index })
}

/// Last part of a possibly qualified name, with quotes stripped.
fn object_name(name: &sql_ast::ObjectName) -> EngineResult<String> {
    name.0
        .last()
        .and_then(|part| part.as_ident())
        .map(|ident| ident.value.clone())
        .ok_or_else(|| EngineError::Unsupported(format!("Invalid object name '{}'", name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_table_becomes_structured() {
        let ops = translate(
            "CREATE TABLE events (id BIGINT PRIMARY KEY, name VARCHAR(100) NOT NULL, notes TEXT)",
        )
        .unwrap();
        assert_eq!(ops.len(), 1);

        let SchemaOperation::CreateTable(schema) = &ops[0] else {
            panic!("expected CreateTable, got {:?}", ops[0]);
        };
        assert_eq!(schema.name, "events");
        assert!(schema.get_column("id").unwrap().primary_key);
        assert_eq!(schema.get_column("name").unwrap().data_type, DataType::String(100));
        assert!(!schema.get_column("name").unwrap().nullable);
        assert!(schema.get_column("notes").unwrap().nullable);
    }

    #[test]
    fn drop_table_keeps_if_exists() {
        let ops = translate("DROP TABLE IF EXISTS event_sessions").unwrap();
        assert_eq!(ops, vec![SchemaOperation::drop_table_if_exists("event_sessions")]);
    }

    #[test]
    fn create_index_lists_columns() {
        let ops = translate("CREATE UNIQUE INDEX events_name_unique ON events (name)").unwrap();
        let SchemaOperation::CreateIndex { table, index } = &ops[0] else {
            panic!("expected CreateIndex, got {:?}", ops[0]);
        };
        assert_eq!(table, "events");
        assert_eq!(index.columns, vec!["name".to_string()]);
        assert!(index.unique);
    }

    #[test]
    fn quoted_names_are_unquoted() {
        let ops = translate(r#"CREATE TABLE "rooms" ("id" BIGINT PRIMARY KEY)"#).unwrap();
        let SchemaOperation::CreateTable(schema) = &ops[0] else {
            panic!("expected CreateTable, got {:?}", ops[0]);
        };
        assert_eq!(schema.name, "rooms");
        assert!(schema.get_column("id").is_some());

        let ops = translate(r#"DROP TABLE public."rooms""#).unwrap();
        assert_eq!(ops, vec![SchemaOperation::drop_table("rooms")]);
    }

    #[test]
    fn data_manipulation_is_rejected() {
        let err = translate("DELETE FROM events").unwrap_err();
        assert!(matches!(err, EngineError::Unsupported(_)));
    }
}
