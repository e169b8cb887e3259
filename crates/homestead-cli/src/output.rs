//! Human-readable status text for stdout.

use std::fmt::Write;

use homestead_common::error::ReconcileError;
use homestead_common::models::Property;
use homestead_db::{Inspection, Report};

/// Compact VND price: `8.5B VNĐ`, `850.0M VNĐ`, `950000 VNĐ`.
pub fn format_vnd(price: i64) -> String {
    const BILLION: f64 = 1_000_000_000.0;
    const MILLION: f64 = 1_000_000.0;

    let value = price as f64;
    if value.abs() >= BILLION {
        format!("{:.1}B VNĐ", value / BILLION)
    } else if value.abs() >= MILLION {
        format!("{:.1}M VNĐ", value / MILLION)
    } else {
        format!("{price} VNĐ")
    }
}

fn sample_lines(out: &mut String, sample: &[Property]) {
    if sample.is_empty() {
        return;
    }
    let _ = writeln!(out, "\n📊 Sample properties:");
    for (idx, row) in sample.iter().enumerate() {
        let _ = writeln!(
            out,
            "   {}. {} - {} - {} - {}",
            idx + 1,
            row.title,
            row.kind,
            row.status.as_deref().unwrap_or("-"),
            format_vnd(row.price)
        );
    }
}

pub fn render_report(report: &Report) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "🔌 Connected via {} ({})", report.channel, report.endpoint);

    if report.table_created {
        let _ = writeln!(out, "🧱 Table created");
    } else {
        let _ = writeln!(out, "🧱 Table present ({} rows before seeding)", report.initial_count);
    }
    if !report.columns_added.is_empty() {
        let _ = writeln!(out, "   Added columns: {}", report.columns_added.join(", "));
    }
    if report.unique_key_added {
        let _ = writeln!(out, "   Added the unique key on the natural key columns");
    }

    if report.policies_reconciled {
        let _ = writeln!(
            out,
            "🔐 Policies: {} created, {} dropped",
            report.policies_changed, report.policies_dropped
        );
    } else {
        let _ = writeln!(out, "🔐 Policies: not managed over {}", report.channel);
    }

    let _ = writeln!(
        out,
        "🌱 Rows: {} inserted, {} skipped (already present)",
        report.rows_inserted, report.rows_skipped
    );
    let _ = writeln!(out, "✅ Found {} properties in the table", report.final_count);
    sample_lines(&mut out, &report.sample);
    out
}

pub fn render_inspection(inspection: &Inspection, table: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "🔌 Connected via {} ({})",
        inspection.channel, inspection.endpoint
    );
    match &inspection.table {
        Some(state) => {
            let _ = writeln!(out, "✅ Table '{table}' exists");
            let _ = writeln!(out, "📊 Rows: {}", state.row_count);
        }
        None => {
            let _ = writeln!(out, "❌ Table '{table}' does not exist");
        }
    }
    match &inspection.policies {
        Some(policies) if policies.is_empty() => {
            let _ = writeln!(out, "⚠️  No policies found");
        }
        Some(policies) => {
            let _ = writeln!(out, "🔒 {} policies:", policies.len());
            for policy in policies {
                let _ = writeln!(out, "   - {} ({})", policy.name, policy.command);
            }
        }
        None => {}
    }
    sample_lines(&mut out, &inspection.sample);
    out
}

/// Error line, error code and follow-up hint.
pub fn render_error(error: &ReconcileError) -> String {
    let mut out = format!("❌ {error} [{}]\n", error.error_code());
    if let Some(hint) = error.remediation() {
        let _ = writeln!(out, "\n{hint}");
    }
    out
}
