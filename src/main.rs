use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};

use bugtriage::config::{LoggingConfig, ServiceConfig};
use bugtriage::health::{self, HealthMonitor, ServiceStatus, SCHEDULER_SERVICE};
use bugtriage::scheduler::{ChangeCounts, Scheduler, TriggerKind};
use bugtriage::storage::catalog::NewQuery;
use bugtriage::storage::schema::DEFAULT_WORKPLACE;
use bugtriage::storage::{self, Catalog};
use bugtriage::tracker::bugzilla::BugzillaTracker;

#[derive(Parser)]
#[command(
    name = "bugtriage",
    about = "Update service for a bug-triage dashboard",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (default: $BUGTRIAGE_CONFIG, then /etc/bugtriage/bugtriage.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the service (scheduler + API server)
    Serve {
        /// Bind address, overrides api.bind
        #[arg(long)]
        bind: Option<String>,
    },

    /// Show whether the scheduler is online
    Status {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Run one query now and wait for the result
    Execute {
        query_id: i64,
    },

    /// List recent executions of a query
    Executions {
        query_id: i64,

        #[arg(long, default_value = "20")]
        limit: usize,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Show how one field of one bug changed over time
    History {
        bug_id: i64,
        field: String,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Manage saved queries
    Query {
        #[command(subcommand)]
        action: QueryAction,
    },

    /// Manage tracked columns
    Column {
        #[command(subcommand)]
        action: ColumnAction,
    },
}

#[derive(Subcommand)]
enum QueryAction {
    /// List all queries
    List,

    /// Add a new query
    Add {
        #[arg(long)]
        name: String,

        /// Tracker filter, e.g. "product=Core&bug_status=NEW"
        #[arg(long)]
        filter: String,

        #[arg(long, default_value = DEFAULT_WORKPLACE)]
        workplace: String,

        /// Run automatically every N seconds; manual-only when omitted
        #[arg(long)]
        every: Option<u64>,

        #[arg(long)]
        details: Option<String>,
    },

    /// Enable a query
    Enable { id: i64 },

    /// Disable a query
    Disable { id: i64 },
}

#[derive(Subcommand)]
enum ColumnAction {
    /// List tracked columns
    List,

    /// Track another tracker field
    Add {
        #[arg(long)]
        name: String,

        /// Tracker field name, e.g. "bug_status"
        #[arg(long)]
        field: String,

        #[arg(long, default_value = "text")]
        data_type: String,
    },
}

/// Subscriber for the time before the configured one exists, so config
/// resolution can still report files it skipped.
fn bootstrap_subscriber() -> impl tracing::Subscriber + Send + Sync {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish()
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn format_changes(changes: Option<ChangeCounts>) -> String {
    match changes {
        Some(c) => format!("+{} -{} ~{}", c.added, c.removed, c.changed),
        None => "-".into(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = tracing::subscriber::with_default(bootstrap_subscriber(), || {
        ServiceConfig::resolve(cli.config.as_deref())
    })?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.api.bind = bind;
            }
            tracing::info!(bind = %config.api.bind, "Starting bugtriage service");
            bugtriage::serve(config).await?;
        }
        Commands::Status { json } => {
            let pool = storage::open_pool(&config.database.path)?;
            let last = storage::last_heartbeat(&pool, SCHEDULER_SERVICE)?;
            let status = health::evaluate(last, Utc::now(), config.health.window());
            if json {
                let out = serde_json::json!({
                    "service": SCHEDULER_SERVICE,
                    "status": status,
                    "last_heartbeat": last,
                });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                match last {
                    Some(ts) => println!("{}: {} (last heartbeat {})", SCHEDULER_SERVICE, status, ts.to_rfc3339()),
                    None => println!("{}: {} (no heartbeat recorded)", SCHEDULER_SERVICE, status),
                }
            }
        }
        Commands::Execute { query_id } => {
            let pool = storage::open_pool(&config.database.path)?;
            let last = storage::last_heartbeat(&pool, SCHEDULER_SERVICE)?;
            if health::evaluate(last, Utc::now(), config.health.window()) == ServiceStatus::Online {
                bail!(
                    "scheduler is online; trigger through the service instead: POST /api/v1/queries/{}/execute",
                    query_id
                );
            }
            let Some(query) = Catalog::new(pool.clone()).get_query(query_id)? else {
                bail!("no query with id {}", query_id);
            };
            let tracker = Arc::new(BugzillaTracker::new(&config.tracker)?);
            let health = Arc::new(HealthMonitor::new(config.health.window()));
            let scheduler = Scheduler::new(pool, tracker, config.scheduler.clone(), health);

            let ack = scheduler.trigger(query_id, TriggerKind::Manual).await?;
            println!("Execution {} started for query {} ('{}').", ack.execution_id, query_id, query.name);
            match scheduler.wait(ack.execution_id).await? {
                Some(record) if record.outcome.is_final() => {
                    println!(
                        "Outcome: {}  attempts: {}  records: {}  changes: {}",
                        record.outcome,
                        record.attempts,
                        record.record_count.map(|n| n.to_string()).unwrap_or_else(|| "-".into()),
                        format_changes(record.changes)
                    );
                    if let Some(err) = record.error {
                        println!("Reason:  {}", err);
                    }
                }
                Some(_) => bail!("execution {} ran but its record could not be finalized", ack.execution_id),
                None => bail!("query {} already has a pending execution in another process", query_id),
            }
        }
        Commands::Executions { query_id, limit, json } => {
            let pool = storage::open_pool(&config.database.path)?;
            let records = storage::ExecutionLog::new(pool).list(query_id, limit)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else if records.is_empty() {
                println!("No executions recorded for query {}.", query_id);
            } else {
                println!(
                    "{:<36} | {:<9} | {:<8} | {:<32} | {:<7} | Changes",
                    "Execution", "Trigger", "Outcome", "Started", "Records"
                );
                println!("{:-<36}-|-{:-<9}-|-{:-<8}-|-{:-<32}-|-{:-<7}-|-{:-<12}", "", "", "", "", "", "");
                for r in records {
                    println!(
                        "{:<36} | {:<9} | {:<8} | {:<32} | {:<7} | {}",
                        r.id,
                        r.trigger.as_str(),
                        r.outcome.as_str(),
                        r.started_at.to_rfc3339(),
                        r.record_count.map(|n| n.to_string()).unwrap_or_else(|| "-".into()),
                        format_changes(r.changes)
                    );
                }
            }
        }
        Commands::History { bug_id, field, json } => {
            let pool = storage::open_pool(&config.database.path)?;
            let observations = storage::SnapshotStore::new(pool).history(bug_id, &field)?;
            let history = bugtriage::diff::field_history(bug_id, &field, &observations);
            if json {
                println!("{}", serde_json::to_string_pretty(&history)?);
            } else if history.is_empty() {
                println!("No changes to '{}' recorded for bug {}.", field, bug_id);
            } else {
                for entry in history {
                    let change = match &entry.change {
                        bugtriage::diff::FieldChange::Added { new } => format!("(absent) -> {}", new),
                        bugtriage::diff::FieldChange::Removed { old } => format!("{} -> (absent)", old),
                        bugtriage::diff::FieldChange::Changed { old, new } => format!("{} -> {}", old, new),
                    };
                    println!("{}  {}", entry.to_time.to_rfc3339(), change);
                }
            }
        }
        Commands::Query { action } => {
            let catalog = Catalog::new(storage::open_pool(&config.database.path)?);
            match action {
                QueryAction::List => {
                    let queries = catalog.list_queries()?;
                    if queries.is_empty() {
                        println!("No queries found.");
                    } else {
                        println!("{:<5} | {:<24} | {:<16} | {:<8} | Enabled", "Id", "Name", "Workplace", "Every");
                        println!("{:-<5}-|-{:-<24}-|-{:-<16}-|-{:-<8}-|-{:-<7}", "", "", "", "", "");
                        for q in queries {
                            let every = q
                                .schedule_interval_secs
                                .map(|s| format!("{}s", s))
                                .unwrap_or_else(|| "manual".into());
                            println!("{:<5} | {:<24} | {:<16} | {:<8} | {}", q.id, q.name, q.workplace, every, q.enabled);
                        }
                    }
                }
                QueryAction::Add { name, filter, workplace, every, details } => {
                    let id = catalog.add_query(&NewQuery {
                        name: name.clone(),
                        workplace,
                        tracker_filter: filter,
                        details,
                        schedule_interval_secs: every,
                    })?;
                    println!("Query '{}' added with id {}.", name, id);
                }
                QueryAction::Enable { id } => {
                    if !catalog.set_enabled(id, true)? {
                        bail!("no query with id {}", id);
                    }
                    println!("Query {} enabled.", id);
                }
                QueryAction::Disable { id } => {
                    if !catalog.set_enabled(id, false)? {
                        bail!("no query with id {}", id);
                    }
                    println!("Query {} disabled.", id);
                }
            }
        }
        Commands::Column { action } => {
            let catalog = Catalog::new(storage::open_pool(&config.database.path)?);
            match action {
                ColumnAction::List => {
                    let columns = catalog.list_columns()?;
                    if columns.is_empty() {
                        println!("No columns tracked.");
                    } else {
                        println!("{:<20} | {:<20} | Type", "Name", "Tracker field");
                        println!("{:-<20}-|-{:-<20}-|-{:-<6}", "", "", "");
                        for c in columns {
                            println!("{:<20} | {:<20} | {}", c.name, c.tracker_field, c.data_type);
                        }
                    }
                }
                ColumnAction::Add { name, field, data_type } => {
                    catalog.add_column(&name, &field, &data_type)?;
                    println!("Column '{}' tracks tracker field '{}'.", name, field);
                }
            }
        }
    }

    Ok(())
}
