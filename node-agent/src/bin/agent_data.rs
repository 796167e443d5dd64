//! Operator tool for inspecting and maintaining the agent's data store

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use clap::{Parser, Subcommand};
use node_agent::config::{self, AgentConfig, CONFIG_ENV, KEYS};
use node_agent::records::{Category, LogEntry, MetricCategory, MetricSample, Severity};
use node_agent::store::{mask, MasterKey, SecureDataStore};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const EXPORT_LIMIT: usize = 100_000;

#[derive(Parser, Debug)]
#[command(name = "agent-data", version, about = "Inspect and maintain the node agent data store")]
struct Cli {
    /// Bootstrap configuration file
    #[arg(short, long, global = true, env = CONFIG_ENV)]
    config: Option<PathBuf>,

    /// Database file, overriding the configured location
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Record counts and sizes per category
    Stats,
    /// Print stored metric samples
    ExportMetrics {
        #[arg(long)]
        category: Option<MetricCategory>,
        /// Only samples from the last H hours
        #[arg(long, default_value_t = 24, value_parser = clap::value_parser!(i64).range(1..))]
        hours: i64,
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// Print stored log entries
    ExportLogs {
        /// Minimum severity
        #[arg(long)]
        severity: Option<Severity>,
        #[arg(long)]
        source: Option<String>,
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// Write records to a JSON file
    ExportJson {
        output: PathBuf,
        #[arg(long)]
        category: Option<Category>,
        #[arg(long, default_value_t = 7, value_parser = clap::value_parser!(i64).range(1..))]
        days: i64,
    },
    /// Delete records older than N days
    Cleanup {
        #[arg(long)]
        days: u64,
        #[arg(long)]
        category: Option<Category>,
        /// Only report what would be deleted
        #[arg(long)]
        dry_run: bool,
    },
    /// Apply the configured retention windows and retire grace keys
    CleanupExpired,
    /// Recompute every checksum, quarantining mismatches
    Verify,
    /// Print the runtime configuration
    ShowConfig {
        /// Also list the last N stored versions
        #[arg(long)]
        history: Option<usize>,
    },
    /// Change one runtime configuration key
    SetConfig { key: String, value: String },
    /// Print the stored device credential, masked
    ShowCredentials,
    /// Create the master key and first data key if absent
    InitCredentials,
}

/// `age` before now, or an error when that instant is not representable
fn ago(age: Option<ChronoDuration>, flag: &str, value: i64) -> Result<DateTime<Utc>> {
    age.and_then(|age| Utc::now().checked_sub_signed(age))
        .with_context(|| format!("{} {} is out of range", flag, value))
}

fn format_time(t: DateTime<Utc>) -> String {
    t.format(TIME_FORMAT).to_string()
}

fn categories(filter: Option<Category>) -> Vec<Category> {
    filter.map(|c| vec![c]).unwrap_or_else(|| Category::ALL.to_vec())
}

async fn bootstrap(cli: &Cli) -> Result<AgentConfig> {
    AgentConfig::load(cli.config.as_deref())
        .await
        .context("Failed to load agent configuration")
}

fn open(bootstrap: &AgentConfig, db: Option<&Path>, create: bool) -> Result<SecureDataStore> {
    let path = db.map(Path::to_path_buf).unwrap_or_else(|| bootstrap.database_path());
    if !create && !path.exists() {
        bail!("No data store at {} (run init-credentials first)", path.display());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let (master, created) =
        MasterKey::load_or_create(&bootstrap.security.master_key).context("Failed to load master key")?;
    if created {
        println!("Created a new master key");
    }
    SecureDataStore::open(&path, master).with_context(|| format!("Failed to open {}", path.display()))
}

fn stats(store: &SecureDataStore) -> Result<()> {
    let stats = store.stats()?;
    println!("=== Data Store Statistics ===");
    println!("Path: {}", stats.path.display());
    println!("Size: {:.2} MB", stats.file_size_bytes as f64 / 1024.0 / 1024.0);
    println!();
    for c in &stats.categories {
        println!("{}:", c.category);
        println!("  Records:   {}", c.total);
        println!("  Pending:   {}", c.pending);
        println!("  Delivered: {}", c.delivered);
        if let Some(oldest) = c.oldest {
            println!("  Oldest:    {}", format_time(oldest));
        }
        if let Some(newest) = c.newest {
            println!("  Newest:    {}", format_time(newest));
        }
    }
    println!();
    println!("Quarantined: {}", stats.quarantined);
    println!("Entities:    {}", stats.entities);
    for key in &stats.keys {
        println!("Data key {}: {} (created {})", key.id, key.state.as_str(), format_time(key.created_at));
    }
    Ok(())
}

fn export_metrics(store: &SecureDataStore, category: Option<MetricCategory>, hours: i64, limit: usize) -> Result<()> {
    let since = ago(ChronoDuration::try_hours(hours), "--hours", hours)?;
    let samples: Vec<MetricSample> = store
        .export(Category::Metrics, Some(since), EXPORT_LIMIT)?
        .iter()
        .filter_map(|r| r.json::<MetricSample>().ok())
        .filter(|s| category.map_or(true, |c| s.category == c))
        .take(limit)
        .collect();

    println!("=== Metrics Export ===");
    println!("Category: {}", category.map_or("all".to_string(), |c| c.to_string()));
    println!("Since: {}", format_time(since));
    println!("Records: {}", samples.len());
    println!();
    for sample in samples {
        println!("[{}] {} ({})", format_time(sample.timestamp), sample.category, sample.device_id);
        println!("{}", serde_json::to_string_pretty(&sample.value)?);
        println!("{}", "-".repeat(50));
    }
    Ok(())
}

fn export_logs(store: &SecureDataStore, severity: Option<Severity>, source: Option<&str>, limit: usize) -> Result<()> {
    let entries: Vec<LogEntry> = store
        .export(Category::Logs, None, EXPORT_LIMIT)?
        .iter()
        .filter_map(|r| r.json::<LogEntry>().ok())
        .filter(|e| severity.map_or(true, |min| e.severity >= min))
        .filter(|e| source.map_or(true, |s| e.source == s))
        .take(limit)
        .collect();

    println!("=== Log Export ===");
    println!("Records: {}", entries.len());
    println!();
    for entry in entries {
        println!(
            "[{}] {:<5} {}: {}",
            format_time(entry.timestamp),
            format!("{:?}", entry.severity).to_uppercase(),
            entry.source,
            entry.message
        );
        if let Some(context) = entry.context {
            println!("  {}", context);
        }
    }
    Ok(())
}

fn export_json(store: &SecureDataStore, output: &Path, category: Option<Category>, days: i64) -> Result<()> {
    let since = ago(ChronoDuration::try_days(days), "--days", days)?;
    let mut exported = serde_json::Map::new();
    for category in categories(category) {
        println!("Exporting {}...", category);
        let records: Vec<Value> = store
            .export(category, Some(since), EXPORT_LIMIT)?
            .iter()
            .map(|r| {
                json!({
                    "id": r.id,
                    "seq": r.seq,
                    "timestamp": r.timestamp,
                    "delivered": r.delivered,
                    "payload": r.value(),
                })
            })
            .collect();
        exported.insert(category.to_string(), Value::Array(records));
    }

    let document = json!({
        "exported_at": Utc::now(),
        "since": since,
        "categories": exported,
    });
    std::fs::write(output, serde_json::to_vec_pretty(&document)?)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    println!("Data exported to: {}", output.display());
    Ok(())
}

fn cleanup(store: &SecureDataStore, days: u64, category: Option<Category>, dry_run: bool) -> Result<()> {
    let age = days
        .checked_mul(86_400)
        .map(Duration::from_secs)
        .with_context(|| format!("--days {} is out of range", days))?;
    let mut total = 0;
    for category in categories(category) {
        let n = if dry_run {
            store.count_older_than(age, category)?
        } else {
            store.cleanup(age, category)?
        };
        println!("  {:<16} {}", category.to_string(), n);
        total += n;
    }
    if dry_run {
        println!("Would delete {} records older than {} days", total, days);
    } else {
        println!("Deleted {} records older than {} days", total, days);
    }
    Ok(())
}

fn cleanup_expired(store: &SecureDataStore, bootstrap: &AgentConfig) -> Result<()> {
    let runtime = config::load_runtime(store, bootstrap)?;
    store.set_retention(runtime.retention_policy());
    let report = store.cleanup_expired()?;
    for (category, n) in &report.deleted {
        println!("  {:<16} {}", category.to_string(), n);
    }
    println!("Removed {} expired records", report.total());
    let retired = store.retire_grace_keys()?;
    println!("Re-sealed {} rows from retired data keys", retired);
    Ok(())
}

fn verify(store: &SecureDataStore) -> Result<bool> {
    println!("=== Data Integrity Check ===");
    let report = store.verify_integrity()?;
    for (name, counts) in &report.by_category {
        println!("  {:<16} valid {:<8} quarantined {}", name, counts.valid, counts.quarantined);
    }
    println!("Valid: {}  Quarantined: {}", report.valid, report.quarantined);
    Ok(report.quarantined == 0)
}

fn show_config(store: &SecureDataStore, bootstrap: &AgentConfig, history: Option<usize>) -> Result<()> {
    let runtime = config::load_runtime(store, bootstrap)?;
    let values = runtime.to_values();
    println!("=== Runtime Configuration (version {}) ===", runtime.version);
    for (key, description) in KEYS {
        println!("{:<34} {:<30} # {}", key, values.get(*key).map(String::as_str).unwrap_or(""), description);
    }

    if let Some(limit) = history {
        println!();
        println!("=== History ===");
        for doc in store.config_history(limit)? {
            println!("version {} from {} at {}", doc.version, doc.source, format_time(doc.updated_at));
        }
    }
    Ok(())
}

fn set_config(store: &SecureDataStore, bootstrap: &AgentConfig, key: String, value: String) -> Result<()> {
    let current = config::load_runtime(store, bootstrap)?;
    let changes = BTreeMap::from([(key.clone(), value)]);
    let (next, change) = config::apply_changes(store, &current, &changes, "local-cli")?;
    if change.changed.is_empty() {
        println!("{} unchanged (version {})", key, change.version);
    } else {
        println!(
            "{} = {} (version {})",
            key,
            next.get(&key).unwrap_or_default(),
            change.version
        );
        println!("Send SIGHUP to a running agent to apply immediately");
    }
    Ok(())
}

fn show_credentials(store: &SecureDataStore) -> Result<()> {
    println!("=== Device Credential ===");
    let Some(credential) = store.credential()? else {
        println!("Not registered");
        return Ok(());
    };
    println!("Device ID:      {}", credential.device_id);
    println!("Session key:    {}", mask(&credential.session_key));
    println!("Generation:     {}", credential.key_generation);
    println!("Registered:     {}", format_time(credential.registered_at));
    println!("Rotated:        {}", format_time(credential.rotated_at));
    if let Some(endpoint) = &credential.endpoint {
        println!("Endpoint:       {}", endpoint);
    }
    if let Some(until) = credential.previous_valid_until {
        let status = if credential.previous_key_valid(Utc::now()) { "valid" } else { "expired" };
        println!("Previous key:   {} until {}", status, format_time(until));
    }
    if credential.pending_key.is_some() {
        println!("Rotation:       pending");
    }
    Ok(())
}

fn init_credentials(store: &SecureDataStore) -> Result<()> {
    println!("=== Key Status ===");
    for key in store.key_info() {
        let retired = key.retired_at.map(format_time).unwrap_or_default();
        println!("Data key {:<4} {:<8} created {} {}", key.id, key.state.as_str(), format_time(key.created_at), retired);
    }
    println!("Store ready at {}", store.path().display());
    Ok(())
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let bootstrap = bootstrap(&cli).await?;
    let create = matches!(cli.command, Command::InitCredentials);
    let store = open(&bootstrap, cli.db.as_deref(), create)?;

    match cli.command {
        Command::Stats => stats(&store)?,
        Command::ExportMetrics { category, hours, limit } => export_metrics(&store, category, hours, limit)?,
        Command::ExportLogs { severity, source, limit } => export_logs(&store, severity, source.as_deref(), limit)?,
        Command::ExportJson { output, category, days } => export_json(&store, &output, category, days)?,
        Command::Cleanup { days, category, dry_run } => cleanup(&store, days, category, dry_run)?,
        Command::CleanupExpired => cleanup_expired(&store, &bootstrap)?,
        Command::Verify => {
            if !verify(&store)? {
                store.flush()?;
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::ShowConfig { history } => show_config(&store, &bootstrap, history)?,
        Command::SetConfig { key, value } => set_config(&store, &bootstrap, key, value)?,
        Command::ShowCredentials => show_credentials(&store)?,
        Command::InitCredentials => init_credentials(&store)?,
    }
    store.flush()?;
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
