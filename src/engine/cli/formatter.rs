//! CLI Output Formatting Module
//! Colorized terminal output for snapshots and audit logs

use chrono::{DateTime, SecondsFormat, Utc};
use colored::{ColoredString, Colorize};

use crate::engine::audit::model::{AuditLog, ChangeKind, Snapshot, SnapshotSummary};

pub struct CliFormatter;

impl CliFormatter {
    /// Print a success message
    pub fn success(message: &str) {
        println!("{} {}", "✓".green().bold(), message);
    }

    /// Print an error message
    pub fn error(message: &str) {
        eprintln!("{} {}", "✗".red().bold(), message);
    }

    pub fn info(message: &str) {
        println!("{} {}", "ℹ".blue().bold(), message);
    }

    /// Print a section header
    pub fn header(title: &str) {
        println!("\n{}", title.bright_cyan().bold());
        println!("{}", "─".repeat(title.chars().count()).bright_black());
    }

    /// Print a key-value pair
    pub fn kv(key: &str, value: &str) {
        println!("  {}: {}", key.bright_white().bold(), value);
    }

    pub fn table_header(columns: &[&str]) {
        let plain_width: usize = columns.iter().map(|c| c.len()).sum::<usize>() + 3 * columns.len().saturating_sub(1);
        let header = columns
            .iter()
            .map(|c| c.bright_white().bold().to_string())
            .collect::<Vec<_>>()
            .join(" │ ");
        println!("  {}", header);
        println!("  {}", "─".repeat(plain_width).bright_black());
    }

    pub fn table_row(values: &[&str]) {
        println!("  {}", values.join(" │ "));
    }

    /// One history line: position, snapshot id, change, time, audit log
    pub fn history_row(position: usize, summary: &SnapshotSummary) {
        println!(
            "  {:>3}. {}  {}  {}  log {}",
            position.to_string().bright_white().bold(),
            summary.id,
            pad_change(summary.change),
            format_timestamp(summary.created_at).bright_black(),
            short_id(&summary.audit_log_id.to_string())
        );
    }

    /// Snapshot metadata followed by its payload, pretty-printed
    pub fn snapshot(snapshot: &Snapshot) {
        Self::header(&format!("Snapshot {}", snapshot.id));
        Self::kv("Entity", &format!("{} {}", snapshot.entity_type, snapshot.entity_id));
        Self::kv("Change", &change_label(snapshot.change).to_string());
        Self::kv("Recorded", &format_timestamp(snapshot.created_at));
        Self::kv("Audit log", &snapshot.audit_log_id.to_string());
        Self::kv("Checksum", &snapshot.checksum);

        println!();
        for line in pretty_payload(&snapshot.payload).lines() {
            println!("  {}", line.bright_white());
        }
    }

    pub fn audit_log(audit_log: &AuditLog, snapshots: &[Snapshot]) {
        Self::header(&format!("Audit log {}", audit_log.id));
        Self::kv("Recorded", &format_timestamp(audit_log.created_at));
        Self::kv("Snapshots", &snapshots.len().to_string());
        println!();
        Self::table_header(&["Snapshot", "Change", "Entity"]);
        for snapshot in snapshots {
            let id = snapshot.id.to_string();
            let change = pad_change(snapshot.change).to_string();
            let entity = format!("{} {}", snapshot.entity_type, snapshot.entity_id);
            Self::table_row(&[id.as_str(), change.as_str(), entity.as_str()]);
        }
    }
}

pub fn change_label(change: ChangeKind) -> ColoredString {
    match change {
        ChangeKind::Created => change.as_str().green(),
        ChangeKind::Modified => change.as_str().yellow(),
        ChangeKind::Deleted => change.as_str().red(),
    }
}

fn pad_change(change: ChangeKind) -> ColoredString {
    let padded = format!("{:<8}", change.as_str());
    match change {
        ChangeKind::Created => padded.green(),
        ChangeKind::Modified => padded.yellow(),
        ChangeKind::Deleted => padded.red(),
    }
}

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// First 8 characters of an id, enough to tell rows apart
pub fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

/// Indent a JSON payload; anything unparseable is returned unchanged
pub fn pretty_payload(payload: &str) -> String {
    serde_json::from_str::<serde_json::Value>(payload)
        .ok()
        .and_then(|value| serde_json::to_string_pretty(&value).ok())
        .unwrap_or_else(|| payload.to_string())
}
