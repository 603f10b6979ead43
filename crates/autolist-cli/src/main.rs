use anyhow::{Context, Result};
use autolist_nlp::{repair_concatenated_words, WordDictionary};
use autolist_sync::SyncConfig;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "autolist-cli")]
#[command(about = "Vehicle listing ingestion and feature extraction")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch one scraping job, reconcile it and extract features.
    Ingest {
        #[arg(long)]
        source: String,
        #[arg(long)]
        job: String,
    },
    /// Attach grouped features to stored listings that have none.
    Backfill {
        #[arg(long, default_value_t = autolist_sync::pipeline::DEFAULT_BACKFILL_BATCH_SIZE)]
        batch_size: usize,
    },
    /// Print the grouped features extracted from a description.
    Features { text: String },
    /// Split concatenated words using the workspace dictionary.
    Segment { text: String },
    /// Summarize recent ingest runs as markdown.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
    /// Run the backfill on its cron schedule until interrupted.
    Schedule,
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Ingest { source, job } => {
            let summary = autolist_sync::run_ingest_from_env(&source, &job).await?;
            let (creates, updates, deactivations) = summary
                .plan
                .as_ref()
                .map(|p| (p.creates.len(), p.updates.len(), p.deactivations.len()))
                .unwrap_or_default();
            println!(
                "ingest {}: run_id={} creates={} updates={} deactivations={} failures={} reports={}",
                summary.outcome.as_str(),
                summary.run_id,
                creates,
                updates,
                deactivations,
                summary.apply.failures.len(),
                summary.reports_dir.as_deref().unwrap_or("-")
            );
        }
        Commands::Backfill { batch_size } => {
            let summary = autolist_sync::run_backfill_from_env(batch_size).await?;
            println!(
                "backfill complete: processed={} updated={} errors={}",
                summary.processed, summary.updated, summary.errors
            );
        }
        Commands::Features { text } => {
            let engine = SyncConfig::from_env().feature_engine()?;
            let extraction = engine.extract(Some(&text)).await?;
            println!("{}", serde_json::to_string_pretty(&extraction)?);
        }
        Commands::Segment { text } => {
            let config = SyncConfig::from_env();
            let dictionary = WordDictionary::load(config.dictionary_path())?;
            println!("{}", repair_concatenated_words(&text, &dictionary));
        }
        Commands::Report { runs } => {
            let config = SyncConfig::from_env();
            print!(
                "{}",
                autolist_sync::report_daily_markdown(runs, &config.reports_dir())?
            );
        }
        Commands::Schedule => {
            let sched = autolist_sync::scheduler_from_env()
                .await?
                .context("scheduler disabled; set AUTOLIST_SCHEDULER_ENABLED=1")?;
            sched.start().await.context("starting scheduler")?;
            info!("backfill scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for ctrl-c")?;
            let mut sched = sched;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
