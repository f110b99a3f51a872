//! Formatting utilities for table output and age display

use chrono::{DateTime, Utc};
use plf_migrate::{BatchReport, MigrationState};
use plf_setup::Run;

/// Format a timestamp as a human-readable age (e.g., "2d", "5h", "30m", "15s")
pub fn format_age(timestamp: &DateTime<Utc>) -> String {
    let duration = Utc::now().signed_duration_since(*timestamp);

    let total_secs = duration.num_seconds();
    if total_secs < 0 {
        return "0s".to_string();
    }

    let days = duration.num_days();
    if days > 0 {
        return format!("{}d", days);
    }

    let hours = duration.num_hours();
    if hours > 0 {
        return format!("{}h", hours);
    }

    let minutes = duration.num_minutes();
    if minutes > 0 {
        return format!("{}m", minutes);
    }

    format!("{}s", total_secs)
}

fn age_or_dash(timestamp: Option<&DateTime<Utc>>) -> String {
    timestamp.map(format_age).unwrap_or_else(|| "-".to_string())
}

/// Column-aligned lines: headers first, then one line per row.
pub fn table_lines(headers: &[&str], rows: &[Vec<String>]) -> Vec<String> {
    let num_cols = headers.len();
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate().take(num_cols) {
            widths[i] = widths[i].max(cell.len());
        }
    }

    let line = |cells: Vec<&str>| -> String {
        let padded: Vec<String> = cells
            .iter()
            .enumerate()
            .map(|(i, cell)| {
                let w = widths.get(i).copied().unwrap_or(0);
                format!("{:<width$}", cell, width = w)
            })
            .collect();
        padded.join("  ").trim_end().to_string()
    };

    let mut lines = vec![line(headers.to_vec())];
    lines.extend(rows.iter().map(|row| line(row.iter().map(String::as_str).collect())));
    lines
}

/// Print rows as a column-aligned table with headers.
pub fn print_table(headers: &[&str], rows: &[Vec<String>]) {
    for line in table_lines(headers, rows) {
        println!("{}", line);
    }
}

/// Rows of the setup run's resource table
pub fn run_rows(run: &Run) -> Vec<Vec<String>> {
    run.resources
        .iter()
        .map(|r| vec![r.ordinal.to_string(), r.label.clone(), r.status.to_string()])
        .collect()
}

pub fn print_run(run: &Run) {
    println!(
        "Run: {}  (cluster {}, updated {})",
        run.status,
        if run.config.cluster_name.is_empty() {
            "-"
        } else {
            run.config.cluster_name.as_str()
        },
        age_or_dash(run.updated_at.as_ref())
    );
    print_table(&["#", "RESOURCE", "STATUS"], &run_rows(run));
}

/// Rows of the migration table: one per entity
pub fn entity_rows(state: &MigrationState) -> Vec<Vec<String>> {
    state
        .tables
        .values()
        .map(|e| {
            let error = e
                .sync
                .error
                .as_deref()
                .or(e.register.error.as_deref())
                .or(e.sync.rewrite_error.as_deref())
                .or(e.register.refresh_error.as_deref())
                .unwrap_or("");
            vec![
                e.key(),
                e.sync.status.to_string(),
                e.sync.object_count.to_string(),
                e.register.status.to_string(),
                e.register.sf_table.clone().unwrap_or_else(|| "-".to_string()),
                age_or_dash(e.sync.last_sync.as_ref()),
                error.to_string(),
            ]
        })
        .collect()
}

pub fn print_migration(state: &MigrationState) {
    match &state.aws {
        Some(aws) => println!("Bucket: {} ({})", aws.bucket, aws.region),
        None => println!("Bucket: not set up"),
    }
    match &state.warehouse {
        Some(wh) => println!("Warehouse: {}.{} (role {})", wh.database, wh.schema, wh.sa_role),
        None => println!("Warehouse: not set up"),
    }
    println!();
    print_table(
        &["TABLE", "SYNC", "OBJECTS", "REGISTER", "WAREHOUSE TABLE", "SYNCED", "ERROR"],
        &entity_rows(state),
    );
}

/// Print per-table outcomes and a one-line summary
pub fn print_report(operation: &str, report: &BatchReport) {
    let rows: Vec<Vec<String>> = report
        .outcomes
        .iter()
        .map(|o| {
            vec![
                o.key.clone(),
                if o.succeeded() { "ok" } else { "failed" }.to_string(),
                o.error.clone().unwrap_or_else(|| o.detail.clone()),
            ]
        })
        .collect();
    if !rows.is_empty() {
        print_table(&["TABLE", "RESULT", "DETAIL"], &rows);
    }
    println!(
        "{}: {} succeeded, {} failed",
        operation,
        report.outcomes.len() - report.failed().len(),
        report.failed().len()
    );
}
