//! Chronicle CLI - Main entry point for CLI binary
//!
//! Read-only inspection of a project's audit history.

use anyhow::{bail, Context, Result};
use chronicle::engine::{
    audit::{AuditLogId, SnapshotId, SnapshotStore},
    cli::{formatter::CliFormatter, Cli, Commands, OutputFormat},
    config::{Config, ConfigError},
    database::Database,
};
use clap::Parser;
use std::path::Path;
use tracing_subscriber::EnvFilter;

fn main() {
    let cli = Cli::parse();
    init_tracing(&cli.get_project_dir());

    if let Err(e) = run_cli(cli) {
        CliFormatter::error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

/// RUST_LOG wins; otherwise the project's configured filter, otherwise warn
fn init_tracing(project_dir: &Path) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let configured = Config::load(project_dir)
            .map(|c| c.logging.filter)
            .unwrap_or_else(|_| "warn".to_string());
        EnvFilter::try_new(configured).unwrap_or_else(|_| EnvFilter::new("warn"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_cli(cli: Cli) -> Result<()> {
    let project_dir = cli.get_project_dir();
    let json_output = cli.format == OutputFormat::Json;

    match cli.command {
        Commands::Init { name } => cmd_init(&project_dir, &name, json_output),
        Commands::Status => cmd_status(&project_dir, json_output),
        Commands::History { entity_type, entity_id } => {
            cmd_history(&project_dir, &entity_type, &entity_id, json_output)
        }
        Commands::Show { snapshot_id } => cmd_show(&project_dir, &snapshot_id, json_output),
        Commands::Log { audit_log_id } => cmd_log(&project_dir, &audit_log_id, json_output),
    }
}

fn open_database(project_dir: &Path) -> Result<Database> {
    let config = match Config::load(project_dir) {
        Ok(config) => config,
        Err(ConfigError::NotFound(path)) => {
            bail!("no project at {} (run `chronicle init` first)", path.display())
        }
        Err(e) => return Err(e.into()),
    };
    let db_path = config.database_path(project_dir);
    Database::open_existing(&db_path, &config.database)
        .with_context(|| format!("opening {}", db_path.display()))
}

fn cmd_init(project_dir: &Path, name: &str, json: bool) -> Result<()> {
    if project_dir.join(chronicle::engine::config::CONFIG_FILE).exists() {
        bail!("project already initialized in {}", project_dir.display());
    }
    std::fs::create_dir_all(project_dir)?;

    let config = Config::default_for_project(name);
    config.save(project_dir)?;

    let db_path = config.database_path(project_dir);
    Database::with_config(&db_path, &config.database)
        .with_context(|| format!("creating {}", db_path.display()))?;
    tracing::info!(project = %name, path = %db_path.display(), "initialized project");

    if json {
        println!(
            "{}",
            serde_json::json!({
                "success": true,
                "project": name,
                "path": project_dir.display().to_string(),
                "database": db_path.display().to_string(),
            })
        );
    } else {
        CliFormatter::success(&format!("Initialized project '{}'", name));
        CliFormatter::kv("Config", &project_dir.join(chronicle::engine::config::CONFIG_FILE).display().to_string());
        CliFormatter::kv("Database", &db_path.display().to_string());
    }

    Ok(())
}

fn cmd_status(project_dir: &Path, json: bool) -> Result<()> {
    let config = Config::load(project_dir)?;
    let db = open_database(project_dir)?;
    let conn = db.get_connection()?;
    let stats = SnapshotStore::new().stats(&conn)?;
    let tables = db.get_tables()?;

    if json {
        println!(
            "{}",
            serde_json::json!({
                "project": config.project.name,
                "database": config.database.path.display().to_string(),
                "audit_logs": stats.audit_logs,
                "snapshots": stats.snapshots,
                "entities": stats.entities,
                "tables": tables,
            })
        );
    } else {
        CliFormatter::header(&format!("Project {}", config.project.name));
        CliFormatter::kv("Database", &config.database.path.display().to_string());
        CliFormatter::kv("Audit logs", &stats.audit_logs.to_string());
        CliFormatter::kv("Snapshots", &stats.snapshots.to_string());
        CliFormatter::kv("Audited entities", &stats.entities.to_string());
        CliFormatter::kv(
            "Host tables",
            &if tables.is_empty() { "(none)".to_string() } else { tables.join(", ") },
        );
    }

    Ok(())
}

fn cmd_history(project_dir: &Path, entity_type: &str, entity_id: &str, json: bool) -> Result<()> {
    let db = open_database(project_dir)?;
    let conn = db.get_connection()?;
    let history = SnapshotStore::new().history(&conn, entity_type, entity_id)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&history)?);
        return Ok(());
    }

    if history.is_empty() {
        CliFormatter::info(&format!("No snapshots recorded for {} {}", entity_type, entity_id));
        return Ok(());
    }

    CliFormatter::header(&format!("{} {} ({} snapshots)", entity_type, entity_id, history.len()));
    for (i, summary) in history.iter().enumerate() {
        CliFormatter::history_row(i + 1, summary);
    }

    Ok(())
}

fn cmd_show(project_dir: &Path, snapshot_id: &str, json: bool) -> Result<()> {
    let id: SnapshotId = snapshot_id
        .parse()
        .with_context(|| format!("invalid snapshot id: {}", snapshot_id))?;
    let db = open_database(project_dir)?;
    let conn = db.get_connection()?;
    let snapshot = SnapshotStore::new().get(&conn, id)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        CliFormatter::snapshot(&snapshot);
    }

    Ok(())
}

fn cmd_log(project_dir: &Path, audit_log_id: &str, json: bool) -> Result<()> {
    let id: AuditLogId = audit_log_id
        .parse()
        .with_context(|| format!("invalid audit log id: {}", audit_log_id))?;
    let db = open_database(project_dir)?;
    let conn = db.get_connection()?;
    let (audit_log, snapshots) = SnapshotStore::new().get_audit_log(&conn, id)?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "audit_log": audit_log,
                "snapshots": snapshots,
            }))?
        );
    } else {
        CliFormatter::audit_log(&audit_log, &snapshots);
    }

    Ok(())
}
