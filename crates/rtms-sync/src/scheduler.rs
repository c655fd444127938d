//! Bounded worker pool that drives cells through fetch, store and checkpoint.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rtms_adapters::TradeSource;
use rtms_core::{Cell, RegionRegistry};
use rtms_storage::{Checkpoint, CheckpointState};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::store::Store;

/// Called once at the end of a run that stored at least one new transaction.
#[async_trait]
pub trait InvalidationHook: Send + Sync {
    async fn invalidate(&self) -> Result<()>;
}

#[derive(Default)]
pub struct NoopInvalidation;

#[async_trait]
impl InvalidationHook for NoopInvalidation {
    async fn invalidate(&self) -> Result<()> {
        Ok(())
    }
}

/// Asks the read-side API to drop its cached query results.
pub struct HttpCacheInvalidator {
    client: reqwest::Client,
    url: String,
    secret: String,
}

impl HttpCacheInvalidator {
    pub fn new(api_url: &str, secret: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .context("building invalidation client")?;
        Ok(Self {
            client,
            url: format!("{}/api/cache/clear", api_url.trim_end_matches('/')),
            secret: secret.into(),
        })
    }
}

#[async_trait]
impl InvalidationHook for HttpCacheInvalidator {
    async fn invalidate(&self) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .query(&[("secret", self.secret.as_str())])
            .send()
            .await
            .with_context(|| format!("POST {}", self.url))?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("cache clear answered HTTP {}", status.as_u16());
        }
        info!(url = %self.url, "read-side cache cleared");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub concurrency: usize,
    /// Persist the checkpoint after this many finished cells.
    pub checkpoint_every: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            checkpoint_every: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_cells: usize,
    /// Cells skipped because an earlier run completed them.
    pub skipped: usize,
    /// Failures from earlier runs that were cleared for retry.
    pub retried: usize,
    pub saved: u64,
    pub completed: usize,
    pub failed: usize,
    pub interrupted: bool,
}

struct CellOutcome {
    cell: Cell,
    result: Result<(usize, usize), String>,
}

pub struct Scheduler {
    source: Arc<dyn TradeSource>,
    store: Arc<Store>,
    checkpoint: Checkpoint,
    config: SchedulerConfig,
    regions: RegionRegistry,
    invalidation: Box<dyn InvalidationHook>,
}

impl Scheduler {
    pub fn new(
        source: Arc<dyn TradeSource>,
        store: Arc<Store>,
        checkpoint: Checkpoint,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            source,
            store,
            checkpoint,
            config,
            regions: RegionRegistry::capital_area(),
            invalidation: Box::<NoopInvalidation>::default(),
        }
    }

    pub fn with_invalidation(mut self, invalidation: Box<dyn InvalidationHook>) -> Self {
        self.invalidation = invalidation;
        self
    }

    /// Region names used in progress lines.
    pub fn with_regions(mut self, regions: RegionRegistry) -> Self {
        self.regions = regions;
        self
    }

    /// Process every cell not already completed, at most `concurrency` at a time.
    ///
    /// When `shutdown` resolves no further cells are dispatched; in-flight
    /// cells finish and are recorded before the final checkpoint save.
    pub async fn run<F>(&self, cells: Vec<Cell>, shutdown: F) -> Result<RunSummary>
    where
        F: Future<Output = ()>,
    {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let total_cells = cells.len();

        let mut state = self.checkpoint.load().await?;
        let retried = state.clear_failed();
        if retried > 0 {
            info!(retried, "cleared failures from previous run for retry");
            self.checkpoint.save(&state).await?;
        }

        let mut pending: Vec<Cell> = cells
            .into_iter()
            .filter(|cell| !state.is_complete(cell))
            .collect();
        let skipped = total_cells - pending.len();
        let to_process = pending.len();
        pending.reverse();

        info!(
            %run_id,
            source = self.source.source_id(),
            total_cells,
            skipped,
            to_process,
            concurrency = self.config.concurrency,
            "collection run started"
        );

        let limit = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut workers: JoinSet<CellOutcome> = JoinSet::new();
        let mut tally = Tally::default();
        let mut since_save = 0usize;
        let mut interrupted = false;
        tokio::pin!(shutdown);

        loop {
            if pending.is_empty() && workers.is_empty() {
                break;
            }
            let dispatching = !interrupted && !pending.is_empty();

            tokio::select! {
                biased;

                _ = &mut shutdown, if !interrupted => {
                    interrupted = true;
                    warn!(
                        in_flight = workers.len(),
                        undispatched = pending.len(),
                        "interrupt received, draining in-flight cells"
                    );
                    pending.clear();
                }

                joined = workers.join_next(), if !workers.is_empty() => {
                    match joined {
                        Some(Ok(outcome)) => {
                            self.record(&mut state, &mut tally, outcome, to_process);
                            since_save += 1;
                            if since_save >= self.config.checkpoint_every.max(1) {
                                self.checkpoint.save(&state).await?;
                                since_save = 0;
                            }
                        }
                        Some(Err(err)) => {
                            error!(error = %err, "cell worker did not finish; cell stays pending");
                        }
                        None => {}
                    }
                }

                permit = Arc::clone(&limit).acquire_owned(), if dispatching => {
                    let permit = permit.context("worker limit closed")?;
                    if let Some(cell) = pending.pop() {
                        state.set_current(Some(cell.key()));
                        let source = Arc::clone(&self.source);
                        let store = Arc::clone(&self.store);
                        workers.spawn(async move {
                            let outcome = process_cell(source, store, cell).await;
                            drop(permit);
                            outcome
                        });
                    }
                }
            }
        }

        state.set_current(None);
        self.checkpoint.save(&state).await?;

        if tally.saved > 0 {
            if let Err(err) = self.invalidation.invalidate().await {
                warn!(error = %format!("{err:#}"), "cache invalidation failed");
            }
        }

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            total_cells,
            skipped,
            retried,
            saved: tally.saved,
            completed: tally.completed,
            failed: tally.failed,
            interrupted,
        };
        info!(
            %run_id,
            saved = summary.saved,
            completed = summary.completed,
            failed = summary.failed,
            interrupted,
            total_saved = state.total_saved(),
            "collection run finished"
        );
        Ok(summary)
    }

    fn record(
        &self,
        state: &mut CheckpointState,
        tally: &mut Tally,
        outcome: CellOutcome,
        to_process: usize,
    ) {
        let CellOutcome { cell, result } = outcome;
        let done = tally.completed + tally.failed + 1;
        let region = self.regions.label(&cell.region_code);
        match result {
            Ok((fetched, saved)) => {
                state.record_success(cell.key(), saved as u64);
                tally.completed += 1;
                tally.saved += saved as u64;
                info!(
                    progress = %format!("{done}/{to_process}"),
                    region,
                    period = %cell.period,
                    fetched,
                    saved,
                    "cell complete"
                );
            }
            Err(cause) => {
                warn!(
                    progress = %format!("{done}/{to_process}"),
                    region,
                    period = %cell.period,
                    cause = %cause,
                    "cell failed"
                );
                state.record_failure(cell.key(), cause);
                tally.failed += 1;
            }
        }
    }
}

#[derive(Debug, Default)]
struct Tally {
    saved: u64,
    completed: usize,
    failed: usize,
}

async fn process_cell(source: Arc<dyn TradeSource>, store: Arc<Store>, cell: Cell) -> CellOutcome {
    let result = match source.fetch(&cell).await {
        Ok(items) => match store.upsert(&cell.region_code, &items).await {
            Ok(saved) => Ok((items.len(), saved)),
            Err(err) => Err(format!("store: {err:#}")),
        },
        Err(err) => Err(err.to_string()),
    };
    CellOutcome { cell, result }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtms_adapters::RawItem;
    use rtms_core::{enumerate, CellKey, YearMonth};
    use rtms_storage::FetchError;
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::{tempdir, TempDir};

    #[derive(Default)]
    struct FakeSource {
        responses: HashMap<String, Result<Vec<RawItem>, u16>>,
        calls: Mutex<Vec<String>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        delay: Duration,
        /// Completed count read from this checkpoint file at the start of each fetch.
        probe: Option<PathBuf>,
        observed: Mutex<Vec<usize>>,
    }

    impl FakeSource {
        fn respond(mut self, key: &str, response: Result<Vec<RawItem>, u16>) -> Self {
            self.responses.insert(key.to_string(), response);
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TradeSource for FakeSource {
        fn source_id(&self) -> &'static str {
            "fake"
        }

        async fn fetch(&self, cell: &Cell) -> Result<Vec<RawItem>, FetchError> {
            let key = cell.key().to_string();
            self.calls.lock().unwrap().push(key.clone());
            if let Some(path) = &self.probe {
                let completed = std::fs::read_to_string(path)
                    .ok()
                    .and_then(|text| serde_json::from_str::<serde_json::Value>(&text).ok())
                    .and_then(|v| v["completed"].as_array().map(Vec::len))
                    .unwrap_or(0);
                self.observed.lock().unwrap().push(completed);
            }

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            match self.responses.get(&key) {
                Some(Ok(items)) => Ok(items.clone()),
                Some(Err(status)) => Err(FetchError::HttpStatus { status: *status }),
                None => Ok(Vec::new()),
            }
        }
    }

    #[derive(Default)]
    struct CountingInvalidation(Arc<AtomicUsize>);

    #[async_trait]
    impl InvalidationHook for CountingInvalidation {
        async fn invalidate(&self) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn deal(floor: &str) -> RawItem {
        RawItem {
            apt_name: "래미안".into(),
            district_code: "11680".into(),
            dong: "대치동".into(),
            jibun: "1".into(),
            deal_year: "2024".into(),
            deal_month: "1".into(),
            deal_day: "10".into(),
            floor: floor.into(),
            area: "84.97".into(),
            amount: "125000".into(),
            ..RawItem::default()
        }
    }

    fn january(regions: &[&str]) -> Vec<Cell> {
        let jan = YearMonth::new(2024, 1).unwrap();
        enumerate(regions, jan, jan)
    }

    async fn harness() -> (TempDir, Arc<Store>, PathBuf) {
        let dir = tempdir().unwrap();
        let store = Store::open(&dir.path().join("db.sqlite"), 150000).await.unwrap();
        let checkpoint_path = dir.path().join("progress.json");
        (dir, Arc::new(store), checkpoint_path)
    }

    async fn load(path: &Path) -> CheckpointState {
        Checkpoint::at(path).load().await.unwrap()
    }

    fn never() -> std::future::Pending<()> {
        std::future::pending()
    }

    #[tokio::test]
    async fn successes_and_failures_are_recorded_in_the_checkpoint() {
        let (_dir, store, path) = harness().await;
        let source = Arc::new(
            FakeSource::default()
                .respond("11680_202401", Ok(vec![deal("1"), deal("2"), deal("3")]))
                .respond("11650_202401", Err(404)),
        );
        let scheduler = Scheduler::new(
            source.clone(),
            store,
            Checkpoint::at(&path),
            SchedulerConfig::default(),
        );

        let summary = scheduler
            .run(january(&["11680", "11650"]), never())
            .await
            .unwrap();
        assert_eq!((summary.saved, summary.completed, summary.failed), (3, 1, 1));
        assert!(!summary.interrupted);

        let state = load(&path).await;
        assert!(state.is_key_complete(&CellKey::from("11680_202401")));
        assert_eq!(
            state.failure_cause(&CellKey::from("11650_202401")),
            Some("HTTP 404")
        );
        assert_eq!(state.total_saved(), 3);
        assert!(state.current().is_none());
    }

    #[tokio::test]
    async fn rerun_skips_completed_and_retries_failed() {
        let (_dir, store, path) = harness().await;
        let first = Arc::new(
            FakeSource::default()
                .respond("11680_202401", Ok(vec![deal("1")]))
                .respond("11650_202401", Err(404)),
        );
        Scheduler::new(first, store.clone(), Checkpoint::at(&path), SchedulerConfig::default())
            .run(january(&["11680", "11650"]), never())
            .await
            .unwrap();

        let second = Arc::new(FakeSource::default().respond("11650_202401", Ok(vec![deal("7")])));
        let summary = Scheduler::new(
            second.clone(),
            store,
            Checkpoint::at(&path),
            SchedulerConfig::default(),
        )
        .run(january(&["11680", "11650"]), never())
        .await
        .unwrap();

        assert_eq!(second.calls(), vec!["11650_202401".to_string()]);
        assert_eq!((summary.skipped, summary.retried), (1, 1));
        assert_eq!((summary.completed, summary.failed, summary.saved), (1, 0, 1));
        let state = load(&path).await;
        assert_eq!((state.completed_len(), state.failed_len()), (2, 0));
    }

    #[tokio::test]
    async fn zero_record_cell_is_completed() {
        let (_dir, store, path) = harness().await;
        let source = Arc::new(FakeSource::default());
        let summary = Scheduler::new(source, store, Checkpoint::at(&path), SchedulerConfig::default())
            .run(january(&["41570"]), never())
            .await
            .unwrap();
        assert_eq!((summary.completed, summary.saved), (1, 0));
        assert!(load(&path).await.is_key_complete(&CellKey::from("41570_202401")));
    }

    #[tokio::test]
    async fn in_flight_fetches_never_exceed_concurrency() {
        let (_dir, store, _path) = harness().await;
        let source = Arc::new(FakeSource {
            delay: Duration::from_millis(20),
            ..FakeSource::default()
        });
        let regions: Vec<String> = (0..10).map(|i| format!("4100{i}")).collect();
        let jan = YearMonth::new(2024, 1).unwrap();
        let summary = Scheduler::new(
            source.clone(),
            store,
            Checkpoint::ephemeral(),
            SchedulerConfig {
                concurrency: 3,
                checkpoint_every: 10,
            },
        )
        .run(enumerate(&regions, jan, jan), never())
        .await
        .unwrap();

        assert_eq!(summary.completed, 10);
        assert_eq!(source.calls().len(), 10);
        let peak = source.max_in_flight.load(Ordering::SeqCst);
        assert!((1..=3).contains(&peak), "peak in-flight was {peak}");
    }

    #[tokio::test]
    async fn checkpoint_is_saved_periodically() {
        let (_dir, store, path) = harness().await;
        let source = Arc::new(FakeSource {
            probe: Some(path.clone()),
            ..FakeSource::default()
        });
        let regions = ["11110", "11140", "11170", "11200", "11215"];
        Scheduler::new(
            source.clone(),
            store,
            Checkpoint::at(&path),
            SchedulerConfig {
                concurrency: 1,
                checkpoint_every: 2,
            },
        )
        .run(january(&regions), never())
        .await
        .unwrap();

        assert_eq!(*source.observed.lock().unwrap(), vec![0, 0, 2, 2, 4]);
        assert_eq!(load(&path).await.completed_len(), 5);
    }

    #[tokio::test]
    async fn repeated_records_are_stored_once() {
        let (_dir, store, _path) = harness().await;
        let source = Arc::new(
            FakeSource::default().respond("11680_202401", Ok(vec![deal("1"), deal("2")])),
        );
        let run = || {
            Scheduler::new(
                source.clone(),
                store.clone(),
                Checkpoint::ephemeral(),
                SchedulerConfig::default(),
            )
        };
        let first = run().run(january(&["11680"]), never()).await.unwrap();
        let second = run().run(january(&["11680"]), never()).await.unwrap();
        assert_eq!((first.saved, second.saved), (2, 0));
        assert_eq!(second.completed, 1);
    }

    #[tokio::test]
    async fn invalidation_runs_only_when_something_was_saved() {
        let (_dir, store, _path) = harness().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let source = Arc::new(FakeSource::default().respond("11680_202401", Ok(vec![deal("1")])));
        let scheduler = || {
            Scheduler::new(
                source.clone(),
                store.clone(),
                Checkpoint::ephemeral(),
                SchedulerConfig::default(),
            )
            .with_invalidation(Box::new(CountingInvalidation(calls.clone())))
        };

        scheduler().run(january(&["11680"]), never()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        scheduler().run(january(&["11680"]), never()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_before_dispatch_still_saves_checkpoint() {
        let (_dir, store, path) = harness().await;
        let source = Arc::new(FakeSource::default());
        let summary = Scheduler::new(
            source.clone(),
            store,
            Checkpoint::at(&path),
            SchedulerConfig::default(),
        )
        .run(january(&["11680", "11650"]), std::future::ready(()))
        .await
        .unwrap();

        assert!(summary.interrupted);
        assert!(source.calls().is_empty());
        assert_eq!((summary.completed, summary.failed), (0, 0));
        assert!(path.exists());
    }

    #[tokio::test]
    async fn shutdown_mid_run_drains_in_flight_cells() {
        let (_dir, store, path) = harness().await;
        let source = Arc::new(FakeSource {
            delay: Duration::from_millis(200),
            ..FakeSource::default()
        });
        let regions: Vec<String> = (0..6).map(|i| format!("4100{i}")).collect();
        let jan = YearMonth::new(2024, 1).unwrap();
        let summary = Scheduler::new(
            source.clone(),
            store,
            Checkpoint::at(&path),
            SchedulerConfig {
                concurrency: 2,
                checkpoint_every: 10,
            },
        )
        .run(
            enumerate(&regions, jan, jan),
            tokio::time::sleep(Duration::from_millis(50)),
        )
        .await
        .unwrap();

        assert!(summary.interrupted);
        assert_eq!(source.calls().len(), 2);
        assert_eq!(summary.completed, 2);
        assert_eq!(load(&path).await.completed_len(), 2);
    }
}
