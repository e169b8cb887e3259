//! Direct SQL channel over a single PostgreSQL connection.

use std::collections::HashSet;
use std::str::FromStr;

use async_trait::async_trait;
use homestead_common::config::SqlTarget;
use homestead_common::error::{ReconcileError, ReconcileResult};
use homestead_common::models::{NaturalKey, NewProperty, Property};
use sqlx::postgres::{PgConnectOptions, PgConnection, PgSslMode};
use sqlx::{Connection, Row};

use crate::channel::{Channel, ChannelKind, FailureKind, InsertOutcome, SkipReason, TableState};
use crate::policy::{self, ExistingPolicy, PolicyRule};
use crate::schema::{quote_ident, ColumnDef, TableSchema};

/// Columns written on insert, in bind order. Everything else is server-assigned.
const INSERT_COLUMNS: [&str; 10] = [
    "title",
    "price",
    "location",
    "bedrooms",
    "bathrooms",
    "area",
    "image_url",
    "description",
    "type",
    "status",
];

const CONNECTION_HINT: &str = "Check that:\n\
  - the host and port are reachable from this machine\n\
  - the user and password are correct (the hosted pooler expects user 'postgres.<project-ref>')\n\
  - sslmode matches the server (hosted databases require 'require')\n\
  - port 5432 is the session pooler; 6543 is the transaction pooler";

/// A single, exclusively owned connection.
pub struct SqlChannel {
    conn: PgConnection,
    endpoint: String,
}

impl SqlChannel {
    pub async fn connect(target: &SqlTarget) -> ReconcileResult<Self> {
        let endpoint = target.describe();
        let options = connect_options(target)?;

        tracing::info!(%endpoint, "Connecting to PostgreSQL...");
        let conn = PgConnection::connect_with(&options)
            .await
            .map_err(|e| connection_error(&endpoint, e))?;
        tracing::info!(%endpoint, "Connected to PostgreSQL");

        Ok(Self { conn, endpoint })
    }

    async fn execute(&mut self, sql: &str, context: &str) -> ReconcileResult<()> {
        tracing::debug!(%sql, "executing");
        sqlx::query(sql)
            .execute(&mut self.conn)
            .await
            .map_err(|e| ReconcileError::unexpected(context, e))?;
        Ok(())
    }
}

/// Connection options for `target`; `sslmode` applies unless the URL sets its own.
pub fn connect_options(target: &SqlTarget) -> ReconcileResult<PgConnectOptions> {
    let options = match target {
        SqlTarget::Url { url, sslmode } => {
            let options = PgConnectOptions::from_str(url).map_err(|e| {
                ReconcileError::configuration(format!("invalid database URL: {e}"))
            })?;
            if url.contains("sslmode=") {
                options
            } else {
                options.ssl_mode(ssl_mode(sslmode)?)
            }
        }
        SqlTarget::Fields {
            host,
            port,
            user,
            password,
            dbname,
            sslmode,
        } => PgConnectOptions::new()
            .host(host)
            .port(*port)
            .username(user)
            .password(password)
            .database(dbname)
            .ssl_mode(ssl_mode(sslmode)?),
    };

    // Pooled endpoints in transaction mode cannot keep named prepared statements.
    Ok(options.statement_cache_capacity(0))
}

fn ssl_mode(mode: &str) -> ReconcileResult<PgSslMode> {
    PgSslMode::from_str(mode)
        .map_err(|e| ReconcileError::configuration(format!("invalid sslmode '{mode}': {e}")))
}

fn connection_error(endpoint: &str, error: sqlx::Error) -> ReconcileError {
    let message = match &error {
        sqlx::Error::Database(db) if db.code().as_deref() == Some("28P01") => {
            "authentication rejected (invalid password)".to_string()
        }
        sqlx::Error::Database(db) if db.code().as_deref() == Some("3D000") => {
            format!("database does not exist: {}", db.message())
        }
        other => other.to_string(),
    };
    ReconcileError::Connection {
        endpoint: endpoint.to_owned(),
        message,
        hint: CONNECTION_HINT.to_string(),
    }
}

/// Map an SQLSTATE from a failed insert to an outcome.
pub fn outcome_for_sql_state(code: Option<&str>, detail: String) -> InsertOutcome {
    match code {
        // unique_violation
        Some("23505") => InsertOutcome::Skipped(SkipReason::Duplicate { detail }),
        // integrity constraints, data exceptions, insufficient privilege (RLS)
        Some(code) if code.starts_with("23") || code.starts_with("22") || code == "42501" => {
            InsertOutcome::Failed(FailureKind::Rejected, detail)
        }
        _ => InsertOutcome::Failed(FailureKind::Server, detail),
    }
}

#[async_trait]
impl Channel for SqlChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Sql
    }

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    fn supports_ddl(&self) -> bool {
        true
    }

    async fn inspect(&mut self, schema: &TableSchema) -> ReconcileResult<Option<TableState>> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM pg_class c
                JOIN pg_namespace n ON n.oid = c.relnamespace
                WHERE n.nspname = 'public' AND c.relname = $1 AND c.relkind IN ('r', 'p')
            )
            "#,
        )
        .bind(&schema.name)
        .fetch_one(&mut self.conn)
        .await
        .map_err(|e| ReconcileError::unexpected("checking whether the table exists", e))?;

        if !exists {
            return Ok(None);
        }

        let columns: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT column_name::text FROM information_schema.columns
            WHERE table_schema = 'public' AND table_name = $1
            ORDER BY ordinal_position
            "#,
        )
        .bind(&schema.name)
        .fetch_all(&mut self.conn)
        .await
        .map_err(|e| ReconcileError::unexpected("reading table columns", e))?;

        let has_unique_key: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM pg_constraint con
                JOIN pg_class c ON c.oid = con.conrelid
                JOIN pg_namespace n ON n.oid = c.relnamespace
                WHERE n.nspname = 'public' AND c.relname = $1 AND con.conname = $2
            )
            "#,
        )
        .bind(&schema.name)
        .bind(schema.unique_key_name())
        .fetch_one(&mut self.conn)
        .await
        .map_err(|e| ReconcileError::unexpected("reading table constraints", e))?;

        let row_count = self.row_count(schema).await?;

        Ok(Some(TableState {
            row_count,
            columns: Some(columns),
            has_unique_key: Some(has_unique_key),
        }))
    }

    async fn create_table(&mut self, schema: &TableSchema) -> ReconcileResult<()> {
        self.execute(&schema.create_table_sql(), "creating the table")
            .await
    }

    async fn add_column(&mut self, schema: &TableSchema, column: &ColumnDef) -> ReconcileResult<()> {
        let context = format!("adding column {}", column.name);
        self.execute(&schema.add_column_sql(column), &context).await
    }

    async fn add_unique_key(&mut self, schema: &TableSchema) -> ReconcileResult<()> {
        self.execute(&schema.add_unique_key_sql(), "adding the unique key")
            .await
    }

    async fn enable_row_security(&mut self, schema: &TableSchema) -> ReconcileResult<()> {
        self.execute(&schema.enable_row_security_sql(), "enabling row level security")
            .await
    }

    async fn policies(&mut self, table: &str) -> ReconcileResult<Vec<ExistingPolicy>> {
        let rows = sqlx::query(
            r#"
            SELECT policyname::text AS name, cmd::text AS command, qual, with_check
            FROM pg_policies
            WHERE schemaname = 'public' AND tablename = $1
            ORDER BY policyname
            "#,
        )
        .bind(table)
        .fetch_all(&mut self.conn)
        .await
        .map_err(|e| ReconcileError::unexpected("reading pg_policies", e))?;

        rows.iter()
            .map(|row| -> Result<ExistingPolicy, sqlx::Error> {
                Ok(ExistingPolicy {
                    name: row.try_get("name")?,
                    command: row.try_get("command")?,
                    qual: row.try_get("qual")?,
                    with_check: row.try_get("with_check")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(|e| ReconcileError::unexpected("decoding pg_policies", e))
    }

    async fn install_admin_function(&mut self, admin_email: Option<&str>) -> ReconcileResult<()> {
        self.execute(
            &policy::admin_function_sql(admin_email),
            "installing is_admin()",
        )
        .await
    }

    async fn drop_policy(&mut self, table: &str, name: &str) -> ReconcileResult<()> {
        let context = format!("dropping policy '{name}'");
        self.execute(&policy::drop_policy_sql(table, name), &context)
            .await
    }

    async fn create_policy(&mut self, table: &str, rule: &PolicyRule) -> ReconcileResult<()> {
        let context = format!("creating policy '{}'", rule.name);
        self.execute(&rule.create_sql(table), &context).await
    }

    async fn existing_keys(&mut self, schema: &TableSchema) -> ReconcileResult<HashSet<NaturalKey>> {
        if schema.unique_key.is_empty() {
            return Ok(HashSet::new());
        }
        let columns = schema
            .unique_key
            .iter()
            .map(|c| format!("{}::text", quote_ident(c)))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("SELECT {columns} FROM {}", schema.qualified_name());

        let rows = sqlx::query(&sql)
            .fetch_all(&mut self.conn)
            .await
            .map_err(|e| ReconcileError::unexpected("reading existing keys", e))?;

        rows.iter()
            .map(|row| {
                (0..schema.unique_key.len())
                    .map(|i| row.try_get::<Option<String>, _>(i).map(Option::unwrap_or_default))
                    .collect::<Result<Vec<_>, _>>()
                    .map(NaturalKey)
            })
            .collect::<Result<HashSet<_>, sqlx::Error>>()
            .map_err(|e| ReconcileError::unexpected("decoding existing keys", e))
    }

    async fn insert(&mut self, schema: &TableSchema, record: &NewProperty) -> InsertOutcome {
        let columns = INSERT_COLUMNS.map(quote_ident).join(", ");
        let params = (1..=INSERT_COLUMNS.len())
            .map(|i| format!("${i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO {} ({columns}) VALUES ({params})",
            schema.qualified_name()
        );

        let result = sqlx::query(&sql)
            .bind(&record.title)
            .bind(record.price)
            .bind(&record.location)
            .bind(record.bedrooms)
            .bind(record.bathrooms)
            .bind(record.area)
            .bind(&record.image_url)
            .bind(&record.description)
            .bind(&record.kind)
            .bind(&record.status)
            .execute(&mut self.conn)
            .await;

        match result {
            Ok(_) => InsertOutcome::Inserted,
            Err(sqlx::Error::Database(db)) => {
                let code = db.code().map(|c| c.into_owned());
                outcome_for_sql_state(code.as_deref(), db.message().to_owned())
            }
            Err(other) => InsertOutcome::Failed(FailureKind::Server, other.to_string()),
        }
    }

    async fn row_count(&mut self, schema: &TableSchema) -> ReconcileResult<i64> {
        let sql = format!("SELECT COUNT(*) FROM {}", schema.qualified_name());
        sqlx::query_scalar(&sql)
            .fetch_one(&mut self.conn)
            .await
            .map_err(|e| ReconcileError::unexpected("counting rows", e))
    }

    async fn sample(&mut self, schema: &TableSchema, limit: usize) -> ReconcileResult<Vec<Property>> {
        let sql = format!(
            "SELECT * FROM {} ORDER BY created_at ASC NULLS LAST, id LIMIT $1",
            schema.qualified_name()
        );
        sqlx::query_as::<_, Property>(&sql)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&mut self.conn)
            .await
            .map_err(|e| ReconcileError::unexpected("fetching sample rows", e))
    }

    async fn close(self: Box<Self>) -> ReconcileResult<()> {
        let this = *self;
        tracing::debug!(endpoint = %this.endpoint, "Closing PostgreSQL connection");
        this.conn
            .close()
            .await
            .map_err(|e| ReconcileError::unexpected("closing the connection", e))
    }
}
