use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pricetrack_sync::{
    run_registry, PriceStore, RetailerRegistry, RunOutcome, SyncConfig, SyncPipeline,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "pricetrack-cli")]
#[command(about = "Grocery price tracker command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape one due category of every enabled retailer (or only `--retailer`).
    Scrape {
        #[arg(long)]
        retailer: Option<String>,
    },
    /// Refresh a retailer's category list.
    Catalogue {
        #[arg(long)]
        retailer: String,
    },
    Migrate,
    /// Categories of a retailer with their freshness dates.
    Status {
        #[arg(long)]
        retailer: String,
    },
    /// Price history of one product.
    History {
        #[arg(long)]
        retailer: String,
        #[arg(long)]
        code: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Scrape { retailer: None }) {
        Commands::Scrape { retailer } => {
            let registry = RetailerRegistry::load(&config.registry_path()).await?;
            let pipeline = SyncPipeline::connect(&config).await?;
            let summary = run_registry(&pipeline, &registry, retailer.as_deref()).await?;
            for run in &summary.retailers {
                match (&run.outcome, &run.error) {
                    (Some(outcome), _) => println!("{}: {}", run.retailer, describe(outcome)),
                    (None, Some(error)) => println!("{}: error: {error}", run.retailer),
                    (None, None) => println!("{}: no result", run.retailer),
                }
            }
            println!(
                "scrape complete: run_id={} retailers={} scraped={} failed={}",
                summary.run_id,
                summary.retailers.len(),
                summary.scraped(),
                summary.failed()
            );
        }
        Commands::Catalogue { retailer } => {
            let registry = RetailerRegistry::load(&config.registry_path()).await?;
            let retailer = registry
                .find(&retailer)
                .with_context(|| format!("retailer {retailer} is not in the registry"))?;
            let pipeline = SyncPipeline::connect(&config).await?;
            let run = pipeline.new_run();
            let count = pipeline.sync_catalogue(&run, retailer).await?;
            println!("catalogue stored: retailer={} categories={count}", retailer.name);
        }
        Commands::Migrate => {
            let store = PriceStore::connect(&config.database_url)
                .await
                .with_context(|| format!("connecting to {}", config.database_url))?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied to {}", config.database_url);
        }
        Commands::Status { retailer } => {
            let pipeline = SyncPipeline::connect(&config).await?;
            let supermarket = pipeline.supermarket(&retailer).await?;
            let categories = pipeline.store().supermarket_categories(supermarket.id).await?;
            let due: Vec<i64> = pipeline
                .tracker()
                .eligible_categories(&supermarket)
                .await?
                .iter()
                .map(|c| c.id)
                .collect();
            println!("{} (today {}):", supermarket.name, pipeline.tracker().today());
            for category in &categories {
                println!(
                    "  [{}] {} {} scraped={} empty={}{}",
                    category.id,
                    category.category_code,
                    category.name,
                    category.last_scraped_on.map_or("-".to_string(), |d| d.to_string()),
                    category.last_empty_on.map_or("-".to_string(), |d| d.to_string()),
                    if due.contains(&category.id) { " due" } else { "" }
                );
            }
            println!("{} categories, {} due", categories.len(), due.len());
        }
        Commands::History { retailer, code } => {
            let pipeline = SyncPipeline::connect(&config).await?;
            let supermarket = pipeline.supermarket(&retailer).await?;
            let product = pipeline
                .store()
                .product_by_code(supermarket.id, &code)
                .await?
                .with_context(|| format!("no product {code} at {}", supermarket.name))?;
            println!("{} [{}] {}", product.name, product.product_code, product.url);
            for observation in pipeline.store().observations_for_product(product.id).await? {
                println!(
                    "  {} price={} discounted={} rating={} votes={} unit={}",
                    observation.observed_on,
                    display_opt(observation.price),
                    display_opt(observation.discounted_price),
                    display_opt(observation.rating),
                    observation.rates_count,
                    observation.unit.as_deref().unwrap_or("-")
                );
            }
        }
    }

    Ok(())
}

fn describe(outcome: &RunOutcome) -> String {
    match outcome {
        RunOutcome::NothingToDo => "nothing to do".to_string(),
        RunOutcome::FetchFailed { category, reason } => {
            format!("fetch failed for {}: {reason}", category.name)
        }
        RunOutcome::ParseFailed { category, reason } => {
            format!("parse failed for {}: {reason}", category.name)
        }
        RunOutcome::Empty { category } => format!("{} is empty", category.name),
        RunOutcome::Scraped { category, report } => format!(
            "{} scraped on {}: {} new, {} updated, {} observations",
            category.name,
            report.observed_on,
            report.products_inserted,
            report.products_updated,
            report.observations_inserted
        ),
    }
}

fn display_opt<T: std::fmt::Display>(value: Option<T>) -> String {
    value.map_or("-".to_string(), |v| v.to_string())
}
