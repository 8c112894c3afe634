//! Schema descriptor for the generic columnar store (§4.4).

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Integer,
    Real,
}

impl ColumnType {
    pub fn sql_type(self) -> &'static str {
        match self {
            ColumnType::Text => "TEXT",
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ColumnSpec {
    pub name: String,
    pub sql_column: String,
    pub column_type: ColumnType,
    pub required: bool,
    pub default: Option<Value>,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        let name = name.into();
        Self { sql_column: name.clone(), name, column_type, required: false, default: None }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }
}

/// Describes a one-row-per-entity table: table name, primary key, and
/// column list, with optional well-known bookkeeping fields that
/// [`super::ColumnarStore`] auto-advances.
#[derive(Debug, Clone)]
pub struct Schema {
    pub table: String,
    pub primary_key: ColumnSpec,
    pub columns: Vec<ColumnSpec>,
    pub version_field: Option<String>,
    pub created_at_field: Option<String>,
    pub updated_at_field: Option<String>,
    pub checkpointed_at_field: Option<String>,
}

impl Schema {
    pub fn new(table: impl Into<String>, primary_key: ColumnSpec) -> Self {
        Self {
            table: table.into(),
            primary_key,
            columns: Vec::new(),
            version_field: None,
            created_at_field: None,
            updated_at_field: None,
            checkpointed_at_field: None,
        }
    }

    pub fn column(mut self, spec: ColumnSpec) -> Self {
        self.columns.push(spec);
        self
    }

    pub fn with_version_field(mut self, name: impl Into<String>) -> Self {
        self.version_field = Some(name.into());
        self
    }

    pub fn with_created_at_field(mut self, name: impl Into<String>) -> Self {
        self.created_at_field = Some(name.into());
        self
    }

    pub fn with_updated_at_field(mut self, name: impl Into<String>) -> Self {
        self.updated_at_field = Some(name.into());
        self
    }

    pub fn with_checkpointed_at_field(mut self, name: impl Into<String>) -> Self {
        self.checkpointed_at_field = Some(name.into());
        self
    }

    pub fn create_table_sql(&self) -> String {
        let mut columns = vec![format!(
            "{} {} PRIMARY KEY",
            self.primary_key.sql_column,
            self.primary_key.column_type.sql_type()
        )];
        for column in &self.columns {
            let mut def = format!("{} {}", column.sql_column, column.column_type.sql_type());
            if column.required {
                def.push_str(" NOT NULL");
            }
            columns.push(def);
        }
        format!("CREATE TABLE IF NOT EXISTS {} ({})", self.table, columns.join(", "))
    }

    pub fn all_sql_columns(&self) -> Vec<&str> {
        std::iter::once(self.primary_key.sql_column.as_str())
            .chain(self.columns.iter().map(|c| c.sql_column.as_str()))
            .collect()
    }
}
