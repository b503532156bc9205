//! Persistence, reconciliation and run orchestration for the price tracker.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use pricetrack_adapters::{adapter_for_retailer, RetailerAdapter, RetailerContext};
use pricetrack_core::{Category, Clock, OperatingClock, OutcomeKind, Supermarket};
use pricetrack_storage::{HttpClientConfig, HttpFetcher, StagingStore};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

mod freshness;
mod reconcile;
mod resolver;
mod store;

pub use freshness::{FreshnessError, FreshnessTracker};
pub use reconcile::{ReconcileError, ReconciliationEngine, UpsertReport};
pub use resolver::{ensure_complete, KeyResolver, KnownProduct};
pub use store::{PriceStore, StoreError, StoredProduct};

pub const CRATE_NAME: &str = "pricetrack-sync";

#[derive(Debug, Clone, Deserialize)]
pub struct RetailerRegistry {
    pub retailers: Vec<RetailerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetailerConfig {
    /// Supermarket business key.
    pub name: String,
    pub adapter: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub store_code: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub cookies: BTreeMap<String, String>,
}

fn default_enabled() -> bool {
    true
}

impl RetailerRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing retailer registry")
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &RetailerConfig> {
        self.retailers.iter().filter(|r| r.enabled)
    }

    pub fn find(&self, name: &str) -> Option<&RetailerConfig> {
        self.retailers.iter().find(|r| r.name == name)
    }
}

impl RetailerConfig {
    pub fn context(&self, run: &RunContext) -> RetailerContext {
        RetailerContext {
            run_id: run.run_id,
            supermarket_name: self.name.clone(),
            store_code: self.store_code.clone(),
            today: run.today,
            headers: self.headers.clone(),
            cookies: self.cookies.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub staging_dir: PathBuf,
    pub staging_enabled: bool,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub utc_offset_hours: i32,
    pub workspace_root: PathBuf,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://pricetrack.db?mode=rwc".to_string()),
            staging_dir: std::env::var("STAGING_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./staging")),
            staging_enabled: std::env::var("PRICETRACK_STAGING_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(true),
            user_agent: std::env::var("PRICETRACK_USER_AGENT").unwrap_or_else(|_| {
                "Mozilla/5.0 (X11; Linux x86_64; rv:133.0) Gecko/20100101 Firefox/133.0".to_string()
            }),
            http_timeout_secs: std::env::var("PRICETRACK_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            utc_offset_hours: std::env::var("PRICETRACK_UTC_OFFSET_HOURS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(7),
            workspace_root: std::env::var("PRICETRACK_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    pub fn registry_path(&self) -> PathBuf {
        self.workspace_root.join("retailers.yaml")
    }

    pub fn clock(&self) -> OperatingClock {
        OperatingClock::from_utc_offset_hours(self.utc_offset_hours)
    }
}

/// Identity and date of one pipeline invocation, passed explicitly to every step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunContext {
    pub run_id: Uuid,
    pub today: NaiveDate,
}

impl RunContext {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            today,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    /// No category of the retailer is due.
    NothingToDo,
    FetchFailed { category: Category, reason: String },
    ParseFailed { category: Category, reason: String },
    Empty { category: Category },
    Scraped { category: Category, report: UpsertReport },
}

impl RunOutcome {
    pub fn category(&self) -> Option<&Category> {
        match self {
            Self::NothingToDo => None,
            Self::FetchFailed { category, .. }
            | Self::ParseFailed { category, .. }
            | Self::Empty { category }
            | Self::Scraped { category, .. } => Some(category),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RetailerRun {
    pub retailer: String,
    pub outcome: Option<RunOutcome>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub retailers: Vec<RetailerRun>,
}

impl SyncRunSummary {
    pub fn scraped(&self) -> usize {
        self.retailers
            .iter()
            .filter(|r| matches!(r.outcome, Some(RunOutcome::Scraped { .. })))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.retailers.iter().filter(|r| r.error.is_some()).count()
    }
}

pub struct SyncPipeline<C = OperatingClock> {
    store: PriceStore,
    http: HttpFetcher,
    staging: Option<StagingStore>,
    engine: ReconciliationEngine,
    tracker: FreshnessTracker<C>,
}

impl SyncPipeline<OperatingClock> {
    /// Connects to `config.database_url` and applies pending migrations.
    pub async fn connect(config: &SyncConfig) -> Result<Self> {
        let store = PriceStore::connect(&config.database_url)
            .await
            .with_context(|| format!("connecting to {}", config.database_url))?;
        store.migrate().await.context("applying migrations")?;
        Self::with_store(config, store, config.clock())
    }
}

impl<C: Clock> SyncPipeline<C> {
    pub fn with_store(config: &SyncConfig, store: PriceStore, clock: C) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        let staging = config
            .staging_enabled
            .then(|| StagingStore::new(config.staging_dir.clone()));
        Ok(Self {
            engine: ReconciliationEngine::new(store.clone()),
            tracker: FreshnessTracker::new(store.clone(), clock),
            store,
            http,
            staging,
        })
    }

    pub fn store(&self) -> &PriceStore {
        &self.store
    }

    pub fn tracker(&self) -> &FreshnessTracker<C> {
        &self.tracker
    }

    pub fn new_run(&self) -> RunContext {
        RunContext::new(self.tracker.today())
    }

    /// Scrape one due category of `retailer`, using the adapter named in its config.
    pub async fn run_once(&self, run: &RunContext, retailer: &RetailerConfig) -> Result<RunOutcome> {
        let adapter = adapter_for_retailer(&retailer.adapter)
            .with_context(|| format!("no adapter registered for {}", retailer.adapter))?;
        self.run_with_adapter(run, retailer, adapter.as_ref()).await
    }

    /// Pick → fetch → (empty: record and stop) → parse → stage → reconcile → record.
    /// Fetch and parse failures leave the category's freshness untouched.
    pub async fn run_with_adapter(
        &self,
        run: &RunContext,
        retailer: &RetailerConfig,
        adapter: &dyn RetailerAdapter,
    ) -> Result<RunOutcome> {
        let span = info_span!("scrape", run_id = %run.run_id, retailer = %retailer.name);
        self.scrape_one(run, retailer, adapter).instrument(span).await
    }

    async fn scrape_one(
        &self,
        run: &RunContext,
        retailer: &RetailerConfig,
        adapter: &dyn RetailerAdapter,
    ) -> Result<RunOutcome> {
        let supermarket = self
            .store
            .ensure_supermarket(&retailer.name)
            .await
            .with_context(|| format!("resolving supermarket {}", retailer.name))?;

        let Some(category) = self
            .tracker
            .pick_category_to_scrape(&supermarket)
            .await
            .context("picking category")?
        else {
            info!("no category is due");
            return Ok(RunOutcome::NothingToDo);
        };
        info!(category_id = category.id, category = %category.name, "scraping category");

        let ctx = retailer.context(run);
        let raw = match adapter.fetch_products(&self.http, &ctx, &category).await {
            Ok(raw) => raw,
            Err(err) => {
                warn!(category_id = category.id, error = %err, "fetch failed; category stays due");
                return Ok(RunOutcome::FetchFailed {
                    category,
                    reason: err.to_string(),
                });
            }
        };

        debug!(category_code = %raw.category_code, products = raw.products.len(), "fetched products");
        if raw.is_empty() {
            return self.record_empty(category, raw.fetched_on).await;
        }

        let batch = match adapter.parse_products(&raw, &category, &ctx) {
            Ok(batch) => batch,
            Err(err) => {
                warn!(category_id = category.id, error = %err, "parse failed; category stays due");
                return Ok(RunOutcome::ParseFailed {
                    category,
                    reason: err.to_string(),
                });
            }
        };
        if batch.is_empty() {
            return self.record_empty(category, raw.fetched_on).await;
        }

        if let Some(staging) = &self.staging {
            match staging.store_batch(&supermarket.name, category.id, &batch).await {
                Ok(Some(staged)) => debug!(
                    path = %staged.relative_path.display(),
                    bytes = staged.byte_size,
                    deduplicated = staged.deduplicated,
                    "staged batch"
                ),
                Ok(None) => {}
                Err(err) => warn!(error = %format!("{err:#}"), "staging failed; continuing"),
            }
        }

        let report = self
            .engine
            .upsert_batch(&category, batch)
            .await
            .with_context(|| format!("reconciling category {}", category.id))?;
        self.tracker
            .record_outcome(&category, report.observed_on, OutcomeKind::Scraped)
            .await
            .context("recording scrape outcome")?;
        Ok(RunOutcome::Scraped { category, report })
    }

    async fn record_empty(&self, category: Category, fetched_on: NaiveDate) -> Result<RunOutcome> {
        info!(category_id = category.id, "category returned no products");
        self.tracker
            .record_outcome(&category, fetched_on, OutcomeKind::Empty)
            .await
            .context("recording empty outcome")?;
        Ok(RunOutcome::Empty { category })
    }

    /// Fetch, normalise and persist the retailer's category tree. Returns the category count.
    pub async fn sync_catalogue(&self, run: &RunContext, retailer: &RetailerConfig) -> Result<usize> {
        let adapter = adapter_for_retailer(&retailer.adapter)
            .with_context(|| format!("no adapter registered for {}", retailer.adapter))?;
        self.sync_catalogue_with_adapter(run, retailer, adapter.as_ref())
            .await
    }

    pub async fn sync_catalogue_with_adapter(
        &self,
        run: &RunContext,
        retailer: &RetailerConfig,
        adapter: &dyn RetailerAdapter,
    ) -> Result<usize> {
        let span = info_span!("catalogue", run_id = %run.run_id, retailer = %retailer.name);
        self.ingest_catalogue(run, retailer, adapter)
            .instrument(span)
            .await
    }

    async fn ingest_catalogue(
        &self,
        run: &RunContext,
        retailer: &RetailerConfig,
        adapter: &dyn RetailerAdapter,
    ) -> Result<usize> {
        let supermarket = self.store.ensure_supermarket(&retailer.name).await?;
        let ctx = retailer.context(run);
        let raw = adapter
            .fetch_catalogue(&self.http, &ctx)
            .await
            .context("fetching catalogue")?;
        let categories = adapter
            .parse_catalogue(&raw, &supermarket)
            .context("parsing catalogue")?;
        let count = self.store.upsert_categories(&categories).await?;
        info!(categories = count, "catalogue stored");
        Ok(count)
    }

    pub async fn supermarket(&self, name: &str) -> Result<Supermarket> {
        self.store
            .supermarket_by_name(name)
            .await?
            .with_context(|| format!("unknown supermarket {name}"))
    }
}

/// One scrape per enabled retailer, sequentially. A failing retailer does not stop the others.
pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env();
    let registry = RetailerRegistry::load(&config.registry_path()).await?;
    let pipeline = SyncPipeline::connect(&config).await?;
    run_registry(&pipeline, &registry, None).await
}

pub async fn run_registry<C: Clock>(
    pipeline: &SyncPipeline<C>,
    registry: &RetailerRegistry,
    only: Option<&str>,
) -> Result<SyncRunSummary> {
    let started_at = Utc::now();
    let run = pipeline.new_run();
    let mut retailers = Vec::new();

    for retailer in registry
        .enabled()
        .filter(|r| only.map_or(true, |name| r.name == name))
    {
        let entry = match pipeline.run_once(&run, retailer).await {
            Ok(outcome) => RetailerRun {
                retailer: retailer.name.clone(),
                outcome: Some(outcome),
                error: None,
            },
            Err(err) => {
                warn!(retailer = %retailer.name, error = %format!("{err:#}"), "retailer run failed");
                RetailerRun {
                    retailer: retailer.name.clone(),
                    outcome: None,
                    error: Some(format!("{err:#}")),
                }
            }
        };
        retailers.push(entry);
    }

    if let Some(name) = only {
        if retailers.is_empty() {
            anyhow::bail!("retailer {name} is not enabled in the registry");
        }
    }

    Ok(SyncRunSummary {
        run_id: run.run_id,
        started_at,
        finished_at: Utc::now(),
        retailers,
    })
}
