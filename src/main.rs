use anyhow::Result;
use clap::{Parser, Subcommand};
use silver_transforms::config::{PipelineConfig, WAREHOUSE_ROOT_ENV};
use silver_transforms::{Pipeline, TableStore};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "silver")]
#[command(about = "Deduplicate, clean and merge bronze files into silver tables")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every job in a pipeline config
    Run {
        /// Pipeline config (JSON)
        #[arg(short, long, default_value = "pipeline.json")]
        config: PathBuf,

        /// Print job reports as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the commit history of a table
    History {
        /// Table name (`table`, `schema.table` or `catalog.schema.table`)
        table: String,

        /// Warehouse root (or set SILVER_WAREHOUSE_ROOT)
        #[arg(short, long)]
        root: Option<PathBuf>,
    },
    /// Print the contents of a table
    Show {
        table: String,

        #[arg(short, long)]
        root: Option<PathBuf>,

        /// Read an older version instead of the latest
        #[arg(short, long)]
        version: Option<u64>,

        /// Maximum rows to print
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Run { config, json } => run_pipeline(config, json).await,
        Commands::History { table, root } => show_history(&table, root),
        Commands::Show { table, root, version, limit } => show_table(&table, root, version, limit),
    }
}

fn store_for(root: Option<PathBuf>) -> Result<TableStore> {
    let root = root
        .or_else(|| std::env::var(WAREHOUSE_ROOT_ENV).ok().map(PathBuf::from))
        .ok_or_else(|| anyhow::anyhow!("No warehouse root: pass --root or set {}", WAREHOUSE_ROOT_ENV))?;
    Ok(TableStore::new(root))
}

async fn run_pipeline(config_path: PathBuf, json: bool) -> Result<()> {
    info!("Loading pipeline config from {:?}", config_path);
    let config = PipelineConfig::load(&config_path)
        .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;

    let pipeline = Arc::new(Pipeline::from_config(&config));
    let reports = pipeline.run(config.jobs.clone()).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        println!("\n{}", "=".repeat(80));
        println!(" PIPELINE SUMMARY");
        println!("{}", "=".repeat(80));
        for report in &reports {
            match (&report.metrics, &report.error) {
                (Some(m), _) => println!(
                    "  OK   {:<20} -> {} v{} ({} inserted, {} updated, {} stale) {} ms",
                    report.job,
                    report.table,
                    m.version,
                    m.rows_inserted,
                    m.rows_updated,
                    m.rows_stale(),
                    report.duration_ms
                ),
                (None, Some(e)) => println!("  FAIL {:<20} -> {}: {}", report.job, report.table, e),
                (None, None) => {}
            }
        }
    }

    let failed = reports.iter().filter(|r| !r.succeeded()).count();
    if failed > 0 {
        anyhow::bail!("{} of {} job(s) failed", failed, reports.len());
    }
    Ok(())
}

fn show_history(table: &str, root: Option<PathBuf>) -> Result<()> {
    let store = store_for(root)?;
    for commit in store.history(table)? {
        println!(
            "v{:<5} {}  {:?}  +{} -{}  {:?}",
            commit.version,
            commit.timestamp.format("%Y-%m-%d %H:%M:%S"),
            commit.operation,
            commit.added.len(),
            commit.removed.len(),
            commit.metrics
        );
    }
    Ok(())
}

fn show_table(table: &str, root: Option<PathBuf>, version: Option<u64>, limit: usize) -> Result<()> {
    let store = store_for(root)?;
    let df = match version {
        Some(v) => store.read_version(table, v)?,
        None => store.read(table)?,
    };
    println!("{}", df.head(Some(limit)));
    Ok(())
}
