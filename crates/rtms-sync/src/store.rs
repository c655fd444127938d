//! SQLite persistence for properties, transactions and their annotations.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use rtms_adapters::RawItem;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions};
use sqlx::Acquire;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::insight::annotate;

/// Comparable deals differ in exclusive area by less than this many square meters.
const AREA_TOLERANCE_M2: f64 = 1.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub properties: i64,
    pub transactions: i64,
    pub insights: i64,
}

/// Durable deduplicating store. Writers are serialized; readers are not.
#[derive(Debug)]
pub struct Store {
    pool: SqlitePool,
    write_lock: Mutex<()>,
    reference_peak: i64,
}

impl Store {
    /// Open (creating if needed) the database at `path` and bring the schema up to date.
    pub async fn open(path: &Path, reference_peak: i64) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(30))
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("opening store {}", path.display()))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("running store migrations")?;

        Ok(Self {
            pool,
            write_lock: Mutex::new(()),
            reference_peak,
        })
    }

    /// Persist a cell's batch and return how many transactions were new.
    ///
    /// The batch commits as one transaction; an item that cannot be stored is
    /// rolled back to its savepoint, logged and skipped.
    pub async fn upsert(&self, region_code: &str, items: &[RawItem]) -> Result<usize> {
        if items.is_empty() {
            return Ok(0);
        }

        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await.context("starting batch transaction")?;
        let mut saved = 0usize;

        for item in items {
            let mut savepoint = tx.begin().await.context("opening item savepoint")?;
            match insert_item(&mut savepoint, region_code, item, self.reference_peak).await {
                Ok(inserted) => {
                    savepoint.commit().await.context("releasing item savepoint")?;
                    if inserted {
                        saved += 1;
                    }
                }
                Err(err) => {
                    warn!(
                        region_code,
                        apt_name = %item.apt_name,
                        error = %format!("{err:#}"),
                        "skipping record that could not be stored"
                    );
                    savepoint.rollback().await.context("rolling back item savepoint")?;
                }
            }
        }

        tx.commit().await.context("committing batch transaction")?;
        debug!(region_code, offered = items.len(), saved, "batch stored");
        Ok(saved)
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        let (properties, transactions, insights): (i64, i64, i64) = sqlx::query_as(
            "SELECT
                (SELECT COUNT(*) FROM apartments),
                (SELECT COUNT(*) FROM transactions),
                (SELECT COUNT(*) FROM transaction_insights)",
        )
        .fetch_one(&self.pool)
        .await
        .context("counting store rows")?;
        Ok(StoreStats {
            properties,
            transactions,
            insights,
        })
    }

    /// Annotation stored for the transaction with the given content hash.
    pub async fn insight_for(&self, unique_hash: &str) -> Result<Option<String>> {
        sqlx::query_scalar(
            "SELECT i.summary_text
               FROM transaction_insights i
               JOIN transactions t ON t.id = i.transaction_id
              WHERE t.unique_hash = ?",
        )
        .bind(unique_hash)
        .fetch_optional(&self.pool)
        .await
        .context("reading insight")
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

/// Returns `true` when a new transaction row was written.
async fn insert_item(
    conn: &mut SqliteConnection,
    region_code: &str,
    item: &RawItem,
    reference_peak: i64,
) -> Result<bool> {
    let amount = item
        .amount_value()
        .with_context(|| format!("unparsable price {:?}", item.amount))?;
    let area = item
        .area_value()
        .with_context(|| format!("unparsable area {:?}", item.area))?;
    let floor = item
        .floor_value()
        .with_context(|| format!("unparsable floor {:?}", item.floor))?;
    item.deal_naive_date().with_context(|| {
        format!(
            "invalid deal date {}-{}-{}",
            item.deal_year, item.deal_month, item.deal_day
        )
    })?;

    sqlx::query(
        "INSERT OR IGNORE INTO apartments (name, lawd_cd, dong, jibun, build_year)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&item.apt_name)
    .bind(region_code)
    .bind(&item.dong)
    .bind(&item.jibun)
    .bind(item.build_year_value())
    .execute(&mut *conn)
    .await
    .context("inserting property")?;

    let apt_id: i64 = sqlx::query_scalar(
        "SELECT id FROM apartments WHERE name = ? AND lawd_cd = ? AND dong = ? AND jibun = ?",
    )
    .bind(&item.apt_name)
    .bind(region_code)
    .bind(&item.dong)
    .bind(&item.jibun)
    .fetch_one(&mut *conn)
    .await
    .context("resolving property id")?;

    let content_hash = item.content_hash();
    let inserted = sqlx::query(
        "INSERT OR IGNORE INTO transactions
            (apt_id, amount, area, floor, deal_date, unique_hash, cancel_date)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(apt_id)
    .bind(amount)
    .bind(area)
    .bind(floor)
    .bind(item.deal_date())
    .bind(content_hash.as_str())
    .bind(item.cancel_date.as_deref())
    .execute(&mut *conn)
    .await
    .context("inserting transaction")?;

    if inserted.rows_affected() == 0 {
        return Ok(false);
    }
    let transaction_id = inserted.last_insert_rowid();

    let history_peak: Option<i64> = sqlx::query_scalar(
        "SELECT MAX(amount) FROM transactions
          WHERE apt_id = ? AND ABS(area - ?) < ? AND id != ?",
    )
    .bind(apt_id)
    .bind(area)
    .bind(AREA_TOLERANCE_M2)
    .bind(transaction_id)
    .fetch_one(&mut *conn)
    .await
    .context("reading price history")?;

    let summary = annotate(item, Some(history_peak.unwrap_or(reference_peak)));
    sqlx::query("INSERT INTO transaction_insights (transaction_id, summary_text) VALUES (?, ?)")
        .bind(transaction_id)
        .bind(&summary)
        .execute(&mut *conn)
        .await
        .context("inserting insight")?;

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insight::UNREMARKABLE;
    use tempfile::tempdir;

    fn deal(name: &str, amount: &str, floor: &str, day: &str) -> RawItem {
        RawItem {
            apt_name: name.into(),
            district_code: "11680".into(),
            dong: "대치동".into(),
            jibun: "316".into(),
            build_year: "1979".into(),
            deal_year: "2024".into(),
            deal_month: "3".into(),
            deal_day: day.into(),
            floor: floor.into(),
            area: "84.97".into(),
            amount: amount.into(),
            ..RawItem::default()
        }
    }

    #[tokio::test]
    async fn duplicate_records_are_ignored_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("real_estate.db");
        let batch = vec![
            deal("은마", "250000", "5", "5"),
            deal("은마", "245000", "9", "12"),
        ];

        let store = Store::open(&path, 150000).await.unwrap();
        assert_eq!(store.upsert("11680", &batch).await.unwrap(), 2);
        assert_eq!(store.upsert("11680", &batch).await.unwrap(), 0);
        store.close().await;

        let reopened = Store::open(&path, 150000).await.unwrap();
        assert_eq!(reopened.upsert("11680", &batch).await.unwrap(), 0);
        let stats = reopened.stats().await.unwrap();
        assert_eq!(
            stats,
            StoreStats {
                properties: 1,
                transactions: 2,
                insights: 2
            }
        );
    }

    #[tokio::test]
    async fn unstorable_record_is_skipped_and_others_commit() {
        let dir = tempdir().unwrap();
        let store = Store::open(&dir.path().join("db.sqlite"), 150000).await.unwrap();
        let batch = vec![
            deal("은마", "250000", "5", "5"),
            deal("은마", "twelve", "6", "6"),
            deal("은마", "240000", "7", "7"),
        ];
        assert_eq!(store.upsert("11680", &batch).await.unwrap(), 2);
        assert_eq!(store.stats().await.unwrap().transactions, 2);
    }

    #[tokio::test]
    async fn first_deal_is_compared_with_the_reference_peak() {
        let dir = tempdir().unwrap();
        let store = Store::open(&dir.path().join("db.sqlite"), 150000).await.unwrap();
        let first = deal("래미안", "125000", "12", "5");
        store.upsert("11680", &[first.clone()]).await.unwrap();
        assert_eq!(
            store.insight_for(first.content_hash().as_str()).await.unwrap().as_deref(),
            Some("📉 전고점 대비 -17% 수준")
        );
    }

    #[tokio::test]
    async fn later_deals_are_compared_with_stored_history() {
        let dir = tempdir().unwrap();
        let store = Store::open(&dir.path().join("db.sqlite"), 150000).await.unwrap();
        store
            .upsert("11680", &[deal("래미안", "100000", "3", "1")])
            .await
            .unwrap();

        let higher = deal("래미안", "120000", "4", "2");
        let lower = deal("래미안", "90000", "5", "3");
        store
            .upsert("11680", &[higher.clone(), lower.clone()])
            .await
            .unwrap();

        assert_eq!(
            store.insight_for(higher.content_hash().as_str()).await.unwrap().as_deref(),
            Some("🔥 신고가 경신!")
        );
        assert_eq!(
            store.insight_for(lower.content_hash().as_str()).await.unwrap().as_deref(),
            Some("📉 전고점 대비 -25% 수준")
        );
    }

    #[tokio::test]
    async fn insight_is_not_rewritten_for_duplicates() {
        let dir = tempdir().unwrap();
        let store = Store::open(&dir.path().join("db.sqlite"), 0).await.unwrap();
        let item = deal("래미안", "100000", "3", "1");
        store.upsert("11680", &[item.clone()]).await.unwrap();
        assert_eq!(
            store.insight_for(item.content_hash().as_str()).await.unwrap().as_deref(),
            Some(UNREMARKABLE)
        );
        store
            .upsert("11680", &[deal("래미안", "200000", "9", "9"), item.clone()])
            .await
            .unwrap();
        assert_eq!(
            store.insight_for(item.content_hash().as_str()).await.unwrap().as_deref(),
            Some(UNREMARKABLE)
        );
        assert_eq!(store.stats().await.unwrap().insights, 2);
    }
}
