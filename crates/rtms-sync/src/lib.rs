//! Collection runs: configuration, region selection and wiring of source,
//! store, checkpoint and backups around the [`Scheduler`].

use std::future::Future;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rtms_adapters::{MolitSourceConfig, MolitTradeSource, DEFAULT_ENDPOINT};
use rtms_core::{backfill_bounds, enumerate, Cell, RegionRegistry, YearMonth};
use rtms_storage::{
    BackoffPolicy, BackupStore, Checkpoint, DirectoryBackupStore, HttpClientConfig, HttpFetcher,
};
use tracing::{info, warn};

pub mod insight;
pub mod scheduler;
pub mod store;

pub use insight::annotate;
pub use scheduler::{
    HttpCacheInvalidator, InvalidationHook, NoopInvalidation, RunSummary, Scheduler,
    SchedulerConfig,
};
pub use store::{Store, StoreStats};

pub const CRATE_NAME: &str = "rtms-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub db_path: PathBuf,
    pub checkpoint_path: PathBuf,
    pub service_key: String,
    pub endpoint: String,
    pub page_size: u32,
    pub concurrency: usize,
    pub max_attempts: usize,
    pub api_delay_ms: u64,
    pub http_timeout_secs: u64,
    pub backoff_cap_secs: u64,
    pub checkpoint_every: usize,
    pub reference_peak: i64,
    pub regions_file: Option<PathBuf>,
    pub api_url: Option<String>,
    pub cache_clear_secret: String,
    pub backup_dir: Option<PathBuf>,
    pub backup_object_name: String,
    pub user_agent: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            db_path: var("DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("real_estate.db")),
            checkpoint_path: var("CHECKPOINT_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("progress.json")),
            service_key: var("MOLIT_API_KEY").unwrap_or_default(),
            endpoint: var("RTMS_ENDPOINT").unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            page_size: parse_or(var("RTMS_PAGE_SIZE"), 1000),
            concurrency: parse_or(var("RTMS_CONCURRENCY"), 5),
            max_attempts: parse_or(var("RTMS_MAX_ATTEMPTS"), 5),
            api_delay_ms: parse_or(var("RTMS_API_DELAY_MS"), 300),
            http_timeout_secs: parse_or(var("RTMS_HTTP_TIMEOUT_SECS"), 30),
            backoff_cap_secs: parse_or(var("RTMS_BACKOFF_CAP_SECS"), 60),
            checkpoint_every: parse_or(var("RTMS_CHECKPOINT_EVERY"), 10),
            reference_peak: parse_or(var("RTMS_REFERENCE_PEAK"), 150_000),
            regions_file: var("RTMS_REGIONS_FILE").map(PathBuf::from),
            api_url: var("API_URL"),
            cache_clear_secret: var("CACHE_CLEAR_SECRET").unwrap_or_else(|| "수집완료".to_string()),
            backup_dir: var("BACKUP_DIR").map(PathBuf::from),
            backup_object_name: var("BACKUP_OBJECT_NAME")
                .unwrap_or_else(|| "real_estate.db".to_string()),
            user_agent: var("RTMS_USER_AGENT").unwrap_or_else(|| "rtms-collector/0.1".to_string()),
        }
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            global_concurrency: self.concurrency.max(1),
            backoff: BackoffPolicy {
                max_attempts: self.max_attempts.max(1),
                max_delay: Duration::from_secs(self.backoff_cap_secs),
                ..BackoffPolicy::default()
            },
            request_delay: Duration::from_millis(self.api_delay_ms),
        }
    }

    pub fn source_config(&self) -> MolitSourceConfig {
        MolitSourceConfig {
            endpoint: self.endpoint.clone(),
            service_key: self.service_key.clone(),
            page_size: self.page_size,
        }
    }
}

fn parse_or<T: FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectMode {
    /// Whole years `start_year..=end_year`, clipped to `until` and the current month.
    Backfill {
        start_year: i32,
        end_year: i32,
        until: Option<YearMonth>,
        merge_checkpoint: Option<PathBuf>,
    },
    /// Previous and current month, without a persisted checkpoint.
    Daily,
}

#[derive(Debug, Clone)]
pub struct CollectRequest {
    pub mode: CollectMode,
    /// Overrides the configured worker count.
    pub concurrency: Option<usize>,
}

/// Cells a run in `mode` covers when the current month is `today`.
pub fn plan_cells(regions: &RegionRegistry, mode: &CollectMode, today: YearMonth) -> Vec<Cell> {
    let codes = regions.codes();
    match mode {
        CollectMode::Backfill {
            start_year,
            end_year,
            until,
            ..
        } => {
            let until = until.map_or(today, |u| u.min(today));
            let (start, end) = backfill_bounds(*start_year, *end_year, until);
            enumerate(&codes, start, end)
        }
        CollectMode::Daily => enumerate(&codes, today.pred(), today),
    }
}

pub async fn load_regions(config: &SyncConfig) -> Result<RegionRegistry> {
    let Some(path) = &config.regions_file else {
        return Ok(RegionRegistry::capital_area());
    };
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading region registry {}", path.display()))?;
    let registry: RegionRegistry = serde_yaml::from_str(&text)
        .with_context(|| format!("parsing region registry {}", path.display()))?;
    if registry.regions.is_empty() {
        bail!("region registry {} lists no regions", path.display());
    }
    Ok(registry)
}

pub fn backup_store(config: &SyncConfig) -> Option<DirectoryBackupStore> {
    config.backup_dir.as_ref().map(DirectoryBackupStore::new)
}

pub fn invalidation_hook(config: &SyncConfig) -> Result<Box<dyn InvalidationHook>> {
    match &config.api_url {
        Some(url) => Ok(Box::new(HttpCacheInvalidator::new(
            url,
            config.cache_clear_secret.clone(),
        )?)),
        None => Ok(Box::<NoopInvalidation>::default()),
    }
}

/// One full collection run against the live source.
pub async fn run_collection<F>(
    config: &SyncConfig,
    request: CollectRequest,
    shutdown: F,
) -> Result<RunSummary>
where
    F: Future<Output = ()>,
{
    if config.service_key.trim().is_empty() {
        bail!("MOLIT_API_KEY is not set; refusing to start a collection run");
    }

    let regions = load_regions(config).await?;
    let cells = plan_cells(&regions, &request.mode, YearMonth::current());

    let backup = backup_store(config);
    if let Some(bucket) = &backup {
        restore_before_run(bucket, config).await;
    }

    let store = Arc::new(Store::open(&config.db_path, config.reference_peak).await?);

    let checkpoint = match &request.mode {
        CollectMode::Daily => Checkpoint::ephemeral(),
        CollectMode::Backfill {
            merge_checkpoint, ..
        } => {
            let checkpoint = Checkpoint::at(&config.checkpoint_path);
            if let Some(legacy) = merge_checkpoint {
                merge_into(&checkpoint, legacy).await?;
            }
            checkpoint
        }
    };

    let concurrency = request.concurrency.unwrap_or(config.concurrency).max(1);
    let http = HttpFetcher::new(HttpClientConfig {
        global_concurrency: concurrency,
        ..config.http_config()
    })?;
    let source = Arc::new(MolitTradeSource::new(http, config.source_config()));

    let scheduler = Scheduler::new(
        source,
        Arc::clone(&store),
        checkpoint,
        SchedulerConfig {
            concurrency,
            checkpoint_every: config.checkpoint_every,
        },
    )
    .with_regions(regions)
    .with_invalidation(invalidation_hook(config)?);

    let summary = scheduler.run(cells, shutdown).await?;
    drop(scheduler);
    if let Ok(store) = Arc::try_unwrap(store) {
        store.close().await;
    }

    if let Some(bucket) = &backup {
        if let Err(err) = bucket
            .upload(&config.db_path, &config.backup_object_name)
            .await
        {
            warn!(error = %format!("{err:#}"), "backup upload failed");
        }
    }

    Ok(summary)
}

async fn restore_before_run(bucket: &DirectoryBackupStore, config: &SyncConfig) {
    match bucket
        .download(&config.backup_object_name, &config.db_path)
        .await
    {
        Ok(Some(transfer)) => info!(
            byte_size = transfer.byte_size,
            sha256 = %transfer.sha256,
            "store restored from backup"
        ),
        Ok(None) => info!(
            object = %config.backup_object_name,
            "no backup found, continuing with local store"
        ),
        Err(err) => warn!(
            error = %format!("{err:#}"),
            "backup download failed, continuing with local store"
        ),
    }
}

/// Fold an older progress file into the run checkpoint before the run starts.
pub async fn merge_into(checkpoint: &Checkpoint, legacy: &Path) -> Result<()> {
    if !tokio::fs::try_exists(legacy)
        .await
        .with_context(|| format!("checking {}", legacy.display()))?
    {
        bail!("checkpoint to merge not found: {}", legacy.display());
    }
    let mut state = checkpoint.load().await?;
    let before = state.completed_len();
    state.merge(Checkpoint::load_from(legacy).await?);
    checkpoint.save(&state).await?;
    info!(
        from = %legacy.display(),
        added = state.completed_len() - before,
        completed = state.completed_len(),
        "merged checkpoint"
    );
    Ok(())
}

/// Open the store (creating and migrating it) and report row counts.
pub async fn migrate(config: &SyncConfig) -> Result<StoreStats> {
    let store = Store::open(&config.db_path, config.reference_peak).await?;
    let stats = store.stats().await?;
    store.close().await;
    Ok(stats)
}
