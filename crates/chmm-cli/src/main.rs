use anyhow::Result;
use chmm_store::{CacheStore, Namespace};
use chmm_sync::{Pipeline, RunConfig};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::warn;

#[derive(Debug, Parser)]
#[command(name = "chmm-cli")]
#[command(about = "CHMM command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the ingestion-and-enrichment pipeline once.
    Sync,
    /// Print the latest analysis snapshot.
    Report,
    /// Clear one cache namespace, or all of them.
    CacheClear {
        #[arg(value_enum)]
        namespace: Option<CacheNamespace>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CacheNamespace {
    DetailPage,
    DocumentText,
    Geocode,
}

impl From<CacheNamespace> for Namespace {
    fn from(value: CacheNamespace) -> Self {
        match value {
            CacheNamespace::DetailPage => Namespace::DetailPage,
            CacheNamespace::DocumentText => Namespace::DocumentText,
            CacheNamespace::Geocode => Namespace::Geocode,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let config = RunConfig::from_env()?;
            let pipeline = Pipeline::new(config)?;

            let shutdown = pipeline.shutdown_flag();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; finishing in-flight work and stopping new fetches");
                    shutdown.cancel();
                }
            });

            let summary = pipeline.run_once().await?;
            println!(
                "sync complete: run_id={} sources={} fetched={} dropped_dupes={} persisted_batch={} reports={} geocoded={} exports={}",
                summary.run_id,
                summary.sources_attempted,
                summary.postings_fetched,
                summary.duplicates_dropped,
                summary.postings_in_batch,
                summary.reports_processed,
                summary.geocoded,
                summary.exports_dir
            );
        }
        Commands::Report => {
            let config = RunConfig::from_env()?;
            let path = config.exports_dir().join("analysis.json");
            let text = std::fs::read_to_string(&path).map_err(|err| {
                anyhow::anyhow!("no snapshot at {} (run `chmm-cli sync` first): {err}", path.display())
            })?;
            println!("{text}");
        }
        Commands::CacheClear { namespace } => {
            let config = RunConfig::from_env()?;
            let cache = CacheStore::new(config.cache_dir.clone());
            match namespace {
                Some(namespace) => {
                    let namespace: Namespace = namespace.into();
                    cache.clear(namespace).await?;
                    println!("cleared cache namespace {}", namespace.as_str());
                }
                None => {
                    for namespace in Namespace::ALL {
                        cache.clear(namespace).await?;
                    }
                    println!("cleared all cache namespaces");
                }
            }
        }
    }

    Ok(())
}
