//! The seam between the reconciler and the remote database.
//!
//! A [`Connector`] turns a [`Configuration`] into an open [`Channel`]. The SQL
//! channel can run DDL; the REST channel can only read and insert rows, so its
//! DDL methods keep the default `Unsupported` implementations.

use std::collections::HashSet;
use std::fmt;

use async_trait::async_trait;
use homestead_common::config::Configuration;
use homestead_common::error::{ReconcileError, ReconcileResult};
use homestead_common::models::{NaturalKey, NewProperty, Property};

use crate::policy::{ExistingPolicy, PolicyRule};
use crate::postgres::SqlChannel;
use crate::rest::RestChannel;
use crate::schema::{ColumnDef, TableSchema};

/// Which wire protocol a channel speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Sql,
    Rest,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sql => f.write_str("SQL"),
            Self::Rest => f.write_str("REST"),
        }
    }
}

/// What the channel could observe about an existing table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableState {
    pub row_count: i64,
    /// Column names, when the channel can introspect them.
    pub columns: Option<Vec<String>>,
    /// Whether the natural unique constraint exists, when the channel can tell.
    pub has_unique_key: Option<bool>,
}

/// Why a seed record was not inserted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Its natural key was already in the table before the insert was attempted.
    AlreadyPresent,
    /// The insert hit a uniqueness violation.
    Duplicate { detail: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The server refused the row itself (constraint, type or permission error).
    Rejected,
    /// Anything else: transport failures, unexpected statuses, driver errors.
    Server,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected => f.write_str("rejected"),
            Self::Server => f.write_str("server error"),
        }
    }
}

/// Result of inserting one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Skipped(SkipReason),
    Failed(FailureKind, String),
}

/// An open, exclusively owned session with the database.
#[async_trait]
pub trait Channel: Send {
    fn kind(&self) -> ChannelKind;

    /// Redacted description of where this channel is connected.
    fn endpoint(&self) -> String;

    fn supports_ddl(&self) -> bool {
        false
    }

    fn unsupported(&self, operation: &str) -> ReconcileError {
        ReconcileError::Unsupported {
            channel: self.kind().to_string(),
            operation: operation.to_owned(),
        }
    }

    /// `None` when the table does not exist.
    async fn inspect(&mut self, schema: &TableSchema) -> ReconcileResult<Option<TableState>>;

    async fn create_table(&mut self, _schema: &TableSchema) -> ReconcileResult<()> {
        Err(self.unsupported("CREATE TABLE"))
    }

    async fn add_column(&mut self, _schema: &TableSchema, _column: &ColumnDef) -> ReconcileResult<()> {
        Err(self.unsupported("ALTER TABLE .. ADD COLUMN"))
    }

    async fn add_unique_key(&mut self, _schema: &TableSchema) -> ReconcileResult<()> {
        Err(self.unsupported("ALTER TABLE .. ADD CONSTRAINT"))
    }

    async fn enable_row_security(&mut self, _schema: &TableSchema) -> ReconcileResult<()> {
        Err(self.unsupported("ALTER TABLE .. ENABLE ROW LEVEL SECURITY"))
    }

    async fn policies(&mut self, _table: &str) -> ReconcileResult<Vec<ExistingPolicy>> {
        Err(self.unsupported("reading pg_policies"))
    }

    async fn install_admin_function(&mut self, _admin_email: Option<&str>) -> ReconcileResult<()> {
        Err(self.unsupported("CREATE FUNCTION"))
    }

    /// Drop a policy; a policy that does not exist is not an error.
    async fn drop_policy(&mut self, _table: &str, _name: &str) -> ReconcileResult<()> {
        Err(self.unsupported("DROP POLICY"))
    }

    async fn create_policy(&mut self, _table: &str, _rule: &PolicyRule) -> ReconcileResult<()> {
        Err(self.unsupported("CREATE POLICY"))
    }

    /// Natural keys of every row currently in the table.
    async fn existing_keys(&mut self, schema: &TableSchema) -> ReconcileResult<HashSet<NaturalKey>>;

    async fn insert(&mut self, schema: &TableSchema, record: &NewProperty) -> InsertOutcome;

    async fn row_count(&mut self, schema: &TableSchema) -> ReconcileResult<i64>;

    /// The first `limit` rows in insertion order.
    async fn sample(&mut self, schema: &TableSchema, limit: usize) -> ReconcileResult<Vec<Property>>;

    /// Release the session.
    async fn close(self: Box<Self>) -> ReconcileResult<()> {
        Ok(())
    }
}

/// Opens channels of one kind.
#[async_trait]
pub trait Connector: Sync {
    fn kind(&self) -> ChannelKind;

    /// Check that `config` carries what this connector needs. Never touches the network.
    fn validate(&self, config: &Configuration) -> ReconcileResult<()> {
        match self.kind() {
            ChannelKind::Sql => config.sql_target().map(|_| ()),
            ChannelKind::Rest => config.rest_target().map(|_| ()),
        }
    }

    async fn connect(&self, config: &Configuration) -> ReconcileResult<Box<dyn Channel>>;
}

/// The two real backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Sql,
    Rest,
}

impl Backend {
    /// SQL when database credentials are configured, otherwise REST.
    pub fn detect(config: &Configuration) -> Self {
        if config.has_sql_credentials() {
            Self::Sql
        } else {
            Self::Rest
        }
    }
}

#[async_trait]
impl Connector for Backend {
    fn kind(&self) -> ChannelKind {
        match self {
            Self::Sql => ChannelKind::Sql,
            Self::Rest => ChannelKind::Rest,
        }
    }

    async fn connect(&self, config: &Configuration) -> ReconcileResult<Box<dyn Channel>> {
        match self {
            Self::Sql => {
                let target = config.sql_target()?;
                Ok(Box::new(SqlChannel::connect(&target).await?))
            }
            Self::Rest => {
                let target = config.rest_target()?;
                Ok(Box::new(RestChannel::connect(&target)?))
            }
        }
    }
}
