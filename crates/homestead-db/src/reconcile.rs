//! The schema/seed reconciler.
//!
//! One run: validate inputs, connect, detect the table, repair schema and
//! policies when the channel can run DDL, insert the seed rows that are not
//! yet present, then re-read the count and a sample. The channel is closed
//! on every exit path once it has been opened.

use homestead_common::config::Configuration;
use homestead_common::error::{ReconcileError, ReconcileResult};
use homestead_common::models::{NewProperty, Property};
use homestead_common::validation::validate_records;

use crate::channel::{Channel, ChannelKind, Connector, InsertOutcome, SkipReason, TableState};
use crate::policy::{ExistingPolicy, PolicySet};
use crate::schema::TableSchema;

/// What a reconciliation run did.
#[derive(Debug, Clone)]
pub struct Report {
    pub channel: ChannelKind,
    pub endpoint: String,
    pub table_created: bool,
    pub columns_added: Vec<String>,
    pub unique_key_added: bool,
    /// False when the channel could not manage policies and they were left alone.
    pub policies_reconciled: bool,
    /// Policies created to reach the desired set.
    pub policies_changed: usize,
    pub policies_dropped: usize,
    pub rows_inserted: usize,
    pub rows_skipped: usize,
    /// 1-based seed position and reason for every skipped record.
    pub skips: Vec<(usize, SkipReason)>,
    /// Row count before any seed row was inserted.
    pub initial_count: i64,
    pub final_count: i64,
    pub sample: Vec<Property>,
}

/// Result of a read-only check.
#[derive(Debug, Clone)]
pub struct Inspection {
    pub channel: ChannelKind,
    pub endpoint: String,
    /// `None` when the table does not exist.
    pub table: Option<TableState>,
    /// Policies on the table, when the channel can read them.
    pub policies: Option<Vec<ExistingPolicy>>,
    pub sample: Vec<Property>,
}

/// Bring `schema`, `policies` and `seeds` into the database behind `connector`.
pub async fn reconcile<C>(
    connector: &C,
    config: &Configuration,
    schema: &TableSchema,
    policies: &PolicySet,
    seeds: &[NewProperty],
) -> ReconcileResult<Report>
where
    C: Connector + ?Sized,
{
    connector.validate(config)?;
    validate_records(seeds, &schema.unique_key)?;

    let mut channel = connector.connect(config).await?;
    tracing::info!(channel = %channel.kind(), endpoint = %channel.endpoint(), "🔌 Connected");
    let result = run(channel.as_mut(), config, schema, policies, seeds).await;
    release(channel, result).await
}

/// Connect and describe the table without changing anything.
pub async fn inspect<C>(
    connector: &C,
    config: &Configuration,
    schema: &TableSchema,
) -> ReconcileResult<Inspection>
where
    C: Connector + ?Sized,
{
    connector.validate(config)?;

    let mut channel = connector.connect(config).await?;
    let result = observe(channel.as_mut(), config, schema).await;
    release(channel, result).await
}

async fn release<T>(channel: Box<dyn Channel>, result: ReconcileResult<T>) -> ReconcileResult<T> {
    if let Err(e) = channel.close().await {
        tracing::warn!(error = %e, "Failed to close the connection cleanly");
    }
    result
}

async fn observe(
    channel: &mut dyn Channel,
    config: &Configuration,
    schema: &TableSchema,
) -> ReconcileResult<Inspection> {
    let table = channel.inspect(schema).await?;
    let policies = match (&table, channel.supports_ddl()) {
        (Some(_), true) => Some(channel.policies(&schema.name).await?),
        _ => None,
    };
    let sample = match &table {
        Some(_) => channel.sample(schema, config.seed.sample_size).await?,
        None => Vec::new(),
    };
    Ok(Inspection {
        channel: channel.kind(),
        endpoint: channel.endpoint(),
        table,
        policies,
        sample,
    })
}

async fn run(
    channel: &mut dyn Channel,
    config: &Configuration,
    schema: &TableSchema,
    policies: &PolicySet,
    seeds: &[NewProperty],
) -> ReconcileResult<Report> {
    let mut report = Report {
        channel: channel.kind(),
        endpoint: channel.endpoint(),
        table_created: false,
        columns_added: Vec::new(),
        unique_key_added: false,
        policies_reconciled: false,
        policies_changed: 0,
        policies_dropped: 0,
        rows_inserted: 0,
        rows_skipped: 0,
        skips: Vec::new(),
        initial_count: 0,
        final_count: 0,
        sample: Vec::new(),
    };

    // ── Detect ──────────────────────────────────────────────
    let state = channel.inspect(schema).await?;
    let ddl = channel.supports_ddl();

    match (state, ddl) {
        (None, false) => {
            return Err(ReconcileError::TableMissing {
                table: schema.name.clone(),
                ddl: schema.remedial_ddl(policies, config.seed.admin_email.as_deref()),
            });
        }
        (None, true) => {
            tracing::info!(table = %schema.name, "🧱 Creating table");
            channel.create_table(schema).await?;
            report.table_created = true;
        }
        (Some(state), _) => {
            tracing::info!(table = %schema.name, rows = state.row_count, "Table exists");
            report.initial_count = state.row_count;
            if ddl {
                repair_schema(channel, schema, &state, &mut report).await?;
            }
        }
    }

    // ── Policies ────────────────────────────────────────────
    if ddl {
        channel.enable_row_security(schema).await?;
        reconcile_policies(channel, config, schema, policies, &mut report).await?;
    } else {
        tracing::warn!(
            channel = %channel.kind(),
            "Policies cannot be managed through this channel; leaving them unchanged"
        );
    }

    // ── Rows ────────────────────────────────────────────────
    insert_missing(channel, schema, seeds, &mut report).await?;

    // ── Verify ──────────────────────────────────────────────
    report.final_count = channel.row_count(schema).await?;
    report.sample = channel.sample(schema, config.seed.sample_size).await?;
    tracing::info!(
        inserted = report.rows_inserted,
        skipped = report.rows_skipped,
        total = report.final_count,
        "✅ Reconciliation finished"
    );
    Ok(report)
}

async fn repair_schema(
    channel: &mut dyn Channel,
    schema: &TableSchema,
    state: &TableState,
    report: &mut Report,
) -> ReconcileResult<()> {
    if let Some(columns) = &state.columns {
        for column in schema.missing_columns(columns) {
            tracing::info!(column = %column.name, "Adding missing column");
            channel.add_column(schema, column).await?;
            report.columns_added.push(column.name.clone());
        }
    }
    if state.has_unique_key == Some(false) && !schema.unique_key.is_empty() {
        tracing::info!(constraint = %schema.unique_key_name(), "Adding unique key");
        channel.add_unique_key(schema).await?;
        report.unique_key_added = true;
    }
    Ok(())
}

async fn reconcile_policies(
    channel: &mut dyn Channel,
    config: &Configuration,
    schema: &TableSchema,
    policies: &PolicySet,
    report: &mut Report,
) -> ReconcileResult<()> {
    if policies.requires_admin_function() {
        channel
            .install_admin_function(config.seed.admin_email.as_deref())
            .await?;
    }

    let existing = channel.policies(&schema.name).await?;
    let plan = policies.plan(&schema.name, &existing);
    report.policies_reconciled = true;
    if plan.is_empty() {
        tracing::info!("🔐 Policies already up to date");
        return Ok(());
    }

    // Every drop runs before any create.
    for name in &plan.drops {
        tracing::debug!(policy = %name, "Dropping policy");
        channel.drop_policy(&schema.name, name).await?;
    }
    for rule in &plan.creates {
        tracing::debug!(policy = %rule.name, "Creating policy");
        channel.create_policy(&schema.name, rule).await?;
    }

    report.policies_dropped = plan.drops.len();
    report.policies_changed = plan.creates.len();
    tracing::info!(
        dropped = report.policies_dropped,
        created = report.policies_changed,
        "🔐 Policies reconciled"
    );
    Ok(())
}

async fn insert_missing(
    channel: &mut dyn Channel,
    schema: &TableSchema,
    seeds: &[NewProperty],
    report: &mut Report,
) -> ReconcileResult<()> {
    let keyed = !schema.unique_key.is_empty();
    let mut present = if keyed {
        channel.existing_keys(schema).await?
    } else {
        Default::default()
    };

    for (index, record) in seeds.iter().enumerate() {
        let position = index + 1;
        let key = record.natural_key(&schema.unique_key);
        let outcome = if keyed && present.contains(&key) {
            InsertOutcome::Skipped(SkipReason::AlreadyPresent)
        } else {
            channel.insert(schema, record).await
        };

        match outcome {
            InsertOutcome::Inserted => {
                tracing::debug!(position, title = %record.title, "Inserted");
                report.rows_inserted += 1;
                present.insert(key);
            }
            InsertOutcome::Skipped(reason) => {
                match &reason {
                    SkipReason::AlreadyPresent => {
                        tracing::debug!(position, title = %record.title, "Already present");
                    }
                    SkipReason::Duplicate { detail } => {
                        tracing::debug!(position, %detail, "Duplicate key, skipping");
                    }
                }
                report.rows_skipped += 1;
                report.skips.push((position, reason));
            }
            InsertOutcome::Failed(kind, detail) => {
                return Err(ReconcileError::RecordRejected {
                    position,
                    title: record.title.clone(),
                    detail: format!("{kind}: {detail}"),
                });
            }
        }
    }
    Ok(())
}
