//! Target table definition and the DDL rendered from it.
//!
//! Everything here is plain string building; the SQL channel executes it and
//! the REST channel hands it to the operator when the table is missing.

use crate::policy::{self, PolicySet};

/// One column of the target table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub sql_type: String,
    pub nullable: bool,
    /// SQL default expression, rendered verbatim.
    pub default: Option<String>,
    /// Column-level CHECK expression, rendered verbatim.
    pub check: Option<String>,
    pub primary_key: bool,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql_type: sql_type.into(),
            nullable: true,
            default: None,
            check: None,
            primary_key: false,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn default_expr(mut self, expr: impl Into<String>) -> Self {
        self.default = Some(expr.into());
        self
    }

    pub fn check(mut self, expr: impl Into<String>) -> Self {
        self.check = Some(expr.into());
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    /// `"name" TYPE [DEFAULT ..] [PRIMARY KEY | NOT NULL] [CHECK (..)]`
    pub fn definition_sql(&self) -> String {
        let mut sql = format!("{} {}", quote_ident(&self.name), self.sql_type);
        if let Some(default) = &self.default {
            sql.push_str(&format!(" DEFAULT {default}"));
        }
        if self.primary_key {
            sql.push_str(" PRIMARY KEY");
        } else if !self.nullable {
            sql.push_str(" NOT NULL");
        }
        if let Some(check) = &self.check {
            sql.push_str(&format!(" CHECK ({check})"));
        }
        sql
    }
}

/// Table name, ordered columns and the natural unique key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    /// Columns of the unique constraint used to recognise rows that are already present.
    pub unique_key: Vec<String>,
}

impl TableSchema {
    /// The listing table the website reads.
    pub fn properties(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: vec![
                ColumnDef::new("id", "UUID")
                    .default_expr("gen_random_uuid()")
                    .primary_key(),
                ColumnDef::new("title", "TEXT").not_null(),
                ColumnDef::new("price", "BIGINT")
                    .not_null()
                    .check("price >= 0"),
                ColumnDef::new("location", "TEXT").not_null(),
                ColumnDef::new("bedrooms", "INTEGER").default_expr("0"),
                ColumnDef::new("bathrooms", "INTEGER").default_expr("0"),
                ColumnDef::new("area", "INTEGER").not_null().check("area > 0"),
                ColumnDef::new("image_url", "TEXT").not_null(),
                ColumnDef::new("description", "TEXT"),
                ColumnDef::new("type", "TEXT").not_null(),
                ColumnDef::new("status", "TEXT").default_expr("'available'"),
                ColumnDef::new("created_at", "TIMESTAMPTZ").default_expr("NOW()"),
                ColumnDef::new("updated_at", "TIMESTAMPTZ").default_expr("NOW()"),
            ],
            unique_key: vec!["title".into(), "location".into()],
        }
    }

    /// Schema-qualified, quoted table name.
    pub fn qualified_name(&self) -> String {
        format!("public.{}", quote_ident(&self.name))
    }

    pub fn unique_key_name(&self) -> String {
        format!("{}_{}_key", self.name, self.unique_key.join("_"))
    }

    fn unique_key_sql(&self) -> String {
        let columns = self
            .unique_key
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "CONSTRAINT {} UNIQUE ({columns})",
            quote_ident(&self.unique_key_name())
        )
    }

    pub fn create_table_sql(&self) -> String {
        let mut lines: Vec<String> = self
            .columns
            .iter()
            .map(|c| format!("  {}", c.definition_sql()))
            .collect();
        if !self.unique_key.is_empty() {
            lines.push(format!("  {}", self.unique_key_sql()));
        }
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n{}\n)",
            self.qualified_name(),
            lines.join(",\n")
        )
    }

    pub fn enable_row_security_sql(&self) -> String {
        format!(
            "ALTER TABLE {} ENABLE ROW LEVEL SECURITY",
            self.qualified_name()
        )
    }

    pub fn add_column_sql(&self, column: &ColumnDef) -> String {
        format!(
            "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {}",
            self.qualified_name(),
            column.definition_sql()
        )
    }

    pub fn add_unique_key_sql(&self) -> String {
        format!(
            "ALTER TABLE {} ADD {}",
            self.qualified_name(),
            self.unique_key_sql()
        )
    }

    /// Columns of this schema absent from `existing`, in schema order.
    pub fn missing_columns(&self, existing: &[String]) -> Vec<&ColumnDef> {
        self.columns
            .iter()
            .filter(|c| !existing.iter().any(|e| e == &c.name))
            .collect()
    }

    /// The complete script that brings an empty database to the target state.
    pub fn remedial_ddl(&self, policies: &PolicySet, admin_email: Option<&str>) -> String {
        let mut statements = vec![self.create_table_sql(), self.enable_row_security_sql()];
        if policies.requires_admin_function() {
            statements.push(policy::admin_function_sql(admin_email));
        }
        for rule in policies.rules(&self.name) {
            statements.push(policy::drop_policy_sql(&self.name, &rule.name));
            statements.push(rule.create_sql(&self.name));
        }
        statements
            .into_iter()
            .map(|s| format!("{s};"))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Quote an SQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote an SQL string literal.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
