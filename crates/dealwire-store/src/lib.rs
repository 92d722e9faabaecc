//! SQLite deal persistence + shared HTTP fetch utilities for Dealwire.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, NaiveDateTime, Utc};
use dealwire_core::Deal;
use reqwest::StatusCode;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow, SqliteSynchronous};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info_span, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dealwire-store";

/// Timestamps are stored as ISO-8601 UTC text without offset so SQL string
/// comparison orders them correctly.
const TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.format(TS_FORMAT).to_string()
}

pub fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, TS_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Bounded exponential backoff, shared by store mutations and HTTP retries.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Policy for SQLite write contention: short delays, a few more attempts.
    pub fn for_writes() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid deal: {0}")]
    InvalidDeal(String),
    #[error("storage fault: {0}")]
    Storage(#[from] sqlx::Error),
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// SQLITE_BUSY / SQLITE_LOCKED surface as message text through the driver;
/// both are transient writer contention.
fn is_lock_contention(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            let msg = db.message();
            msg.contains("database is locked") || msg.contains("database table is locked")
        }
        _ => false,
    }
}

const CREATE_DEALS_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS deals (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  store_slug TEXT NOT NULL,
  category TEXT,
  title TEXT NOT NULL,
  description TEXT NOT NULL DEFAULT '',
  url TEXT NOT NULL,
  coupon_code TEXT,
  price_old REAL,
  price_new REAL,
  cashback REAL,
  start_at TEXT,
  end_at TEXT,
  source TEXT NOT NULL DEFAULT '',
  score REAL NOT NULL DEFAULT 0,
  created_at TEXT NOT NULL,
  content_hash TEXT NOT NULL UNIQUE
)
"#;

const DEAL_COLUMNS: &str = "store_slug, category, title, description, url, coupon_code, \
     price_old, price_new, cashback, start_at, end_at, source, score, created_at, content_hash";

/// Durable table of deals keyed by content hash. A single logical writer
/// lock serializes mutations; reads go straight to the pool and may miss a
/// record still being committed.
#[derive(Clone)]
pub struct DealStore {
    pool: SqlitePool,
    writer: Arc<Mutex<()>>,
    backoff: BackoffPolicy,
}

impl DealStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(60));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let store = Self {
            pool,
            writer: Arc::new(Mutex::new(())),
            backoff: BackoffPolicy::for_writes(),
        };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::query(CREATE_DEALS_SQL).execute(&self.pool).await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_deals_store ON deals(store_slug)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_deals_end ON deals(end_at)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Raw pool handle, exposed for the API layer's health check and tests.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Idempotent insert keyed by `content_hash`. Returns `Ok(false)` when
    /// the hash is already present (first-seen record wins, no overwrite).
    /// Lock contention retries under the shared backoff before surfacing
    /// `StoreError::Storage`.
    pub async fn insert(&self, deal: &Deal) -> Result<bool, StoreError> {
        if deal.url.trim().is_empty() || deal.title.trim().is_empty() {
            return Err(StoreError::InvalidDeal("empty url or title".into()));
        }
        let expected =
            dealwire_core::content_hash(&deal.url, &deal.title, deal.coupon_code.as_deref());
        if expected != deal.content_hash {
            return Err(StoreError::InvalidDeal(
                "content_hash does not match identity fields".into(),
            ));
        }

        let created_at = format_ts(Utc::now());
        let _writer = self.writer.lock().await;

        let mut attempt = 0usize;
        loop {
            let result = sqlx::query(&format!(
                "INSERT INTO deals ({DEAL_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
            ))
            .bind(&deal.store_slug)
            .bind(&deal.category)
            .bind(&deal.title)
            .bind(&deal.description)
            .bind(&deal.url)
            .bind(&deal.coupon_code)
            .bind(deal.price_old)
            .bind(deal.price_new)
            .bind(deal.cashback)
            .bind(deal.start_at.map(format_ts))
            .bind(deal.end_at.map(format_ts))
            .bind(&deal.source)
            .bind(deal.score)
            .bind(&created_at)
            .bind(&deal.content_hash)
            .execute(&self.pool)
            .await;

            match result {
                Ok(_) => return Ok(true),
                Err(err) if is_unique_violation(&err) => return Ok(false),
                Err(err) if is_lock_contention(&err) && attempt < self.backoff.max_retries => {
                    warn!(attempt, "deal insert hit write contention, backing off");
                    tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                    attempt += 1;
                }
                Err(err) => return Err(StoreError::Storage(err)),
            }
        }
    }

    /// Live deals for one store, best first: score, then offers with a known
    /// deadline (soonest first), then recency. Expired deals never appear.
    pub async fn query(
        &self,
        store_slug: &str,
        category: Option<&str>,
        limit: u32,
    ) -> Result<Vec<Deal>, StoreError> {
        let now = format_ts(Utc::now());
        let rows = match category.map(str::trim).filter(|c| !c.is_empty()) {
            Some(category) => {
                let like = format!("%{category}%");
                sqlx::query(&format!(
                    "SELECT {DEAL_COLUMNS} FROM deals \
                     WHERE store_slug = ?1 \
                       AND (category = ?2 OR title LIKE ?3 OR description LIKE ?3) \
                       AND (end_at IS NULL OR end_at >= ?4) \
                     ORDER BY score DESC, (end_at IS NULL) ASC, end_at ASC, created_at DESC \
                     LIMIT ?5"
                ))
                .bind(store_slug)
                .bind(category)
                .bind(like)
                .bind(&now)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {DEAL_COLUMNS} FROM deals \
                     WHERE store_slug = ?1 AND (end_at IS NULL OR end_at >= ?2) \
                     ORDER BY score DESC, (end_at IS NULL) ASC, end_at ASC, created_at DESC \
                     LIMIT ?3"
                ))
                .bind(store_slug)
                .bind(&now)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows.iter().map(row_to_deal).collect())
    }

    /// Deletes deals whose deadline has passed, plus anything older than the
    /// retention window (boundary inclusive). Returns the deleted count.
    pub async fn delete_expired_or_stale(
        &self,
        stale_after: chrono::Duration,
    ) -> Result<u64, StoreError> {
        let now = Utc::now();
        let now_str = format_ts(now);
        let cutoff = format_ts(now - stale_after);

        let _writer = self.writer.lock().await;
        let mut attempt = 0usize;
        loop {
            let result = sqlx::query(
                "DELETE FROM deals \
                 WHERE (end_at IS NOT NULL AND end_at < ?1) OR created_at <= ?2",
            )
            .bind(&now_str)
            .bind(&cutoff)
            .execute(&self.pool)
            .await;

            match result {
                Ok(done) => return Ok(done.rows_affected()),
                Err(err) if is_lock_contention(&err) && attempt < self.backoff.max_retries => {
                    warn!(attempt, "cleanup hit write contention, backing off");
                    tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                    attempt += 1;
                }
                Err(err) => return Err(StoreError::Storage(err)),
            }
        }
    }

    /// Distinct canonical store slugs currently holding deals.
    pub async fn distinct_store_slugs(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query("SELECT DISTINCT store_slug FROM deals ORDER BY store_slug")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| row.get::<String, _>("store_slug"))
            .collect())
    }

    pub async fn distinct_categories(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            "SELECT DISTINCT category FROM deals WHERE category IS NOT NULL ORDER BY category",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| row.get::<String, _>("category"))
            .collect())
    }
}

fn row_to_deal(row: &SqliteRow) -> Deal {
    Deal {
        store_slug: row.get("store_slug"),
        category: row.get("category"),
        title: row.get("title"),
        description: row.get("description"),
        url: row.get("url"),
        coupon_code: row.get("coupon_code"),
        price_old: row.get("price_old"),
        price_new: row.get("price_new"),
        cashback: row.get("cashback"),
        start_at: row
            .get::<Option<String>, _>("start_at")
            .as_deref()
            .and_then(parse_ts),
        end_at: row
            .get::<Option<String>, _>("end_at")
            .as_deref()
            .and_then(parse_ts),
        source: row.get("source"),
        score: row.get("score"),
        created_at: parse_ts(&row.get::<String, _>("created_at"))
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
        content_hash: row.get("content_hash"),
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub max_body_bytes: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: "Mozilla/5.0 (compatible; DealwireBot/1.0)".to_string(),
            global_concurrency: 8,
            per_source_concurrency: 2,
            max_body_bytes: 1_500_000,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Shared fetcher for every extractor: hard timeout, retry with exponential
/// backoff on retryable faults, global and per-source concurrency bounds so
/// parallel ingestion cannot overwhelm remote hosts.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    max_body_bytes: usize,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            max_body_bytes: config.max_body_bytes,
            backoff: config.backoff,
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    /// Plain GET.
    pub async fn get(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let builder = self.client.get(url);
        self.send_with_retry(run_id, source_id, url, builder).await
    }

    /// GET with optional bearer credential and query parameters, for
    /// token-authenticated listing endpoints.
    pub async fn get_with(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        bearer: Option<&str>,
        query: &[(String, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let mut builder = self.client.get(url).query(query);
        if let Some(token) = bearer {
            builder = builder.bearer_auth(token);
        }
        self.send_with_retry(run_id, source_id, url, builder).await
    }

    /// Form POST, used by the client-credentials token exchange.
    pub async fn post_form(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        form: &[(String, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let builder = self.client.post(url).form(form);
        self.send_with_retry(run_id, source_id, url, builder).await
    }

    async fn send_with_retry(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        builder: reqwest::RequestBuilder,
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .expect("semaphore not closed");
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source.acquire().await.expect("semaphore not closed");

        let span = info_span!("http_fetch", %run_id, source_id, url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let request = builder
                .try_clone()
                .expect("fetch request bodies are clonable");

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let mut body = resp.bytes().await?.to_vec();
                        if body.len() > self.max_body_bytes {
                            warn!(bytes = body.len(), "response body over cap, truncating");
                            body.truncate(self.max_body_bytes);
                        }
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use dealwire_core::content_hash;
    use tempfile::tempdir;

    fn mk_deal(title: &str, url: &str) -> Deal {
        Deal {
            store_slug: "ozon".to_string(),
            category: Some("акции".to_string()),
            title: title.to_string(),
            description: String::new(),
            url: url.to_string(),
            coupon_code: None,
            price_old: None,
            price_new: None,
            cashback: None,
            start_at: None,
            end_at: None,
            source: "test".to_string(),
            score: 0.8,
            created_at: Utc::now(),
            content_hash: content_hash(url, title, None),
        }
    }

    async fn open_temp_store() -> (tempfile::TempDir, DealStore) {
        let dir = tempdir().expect("tempdir");
        let store = DealStore::open(dir.path().join("deals.db"))
            .await
            .expect("open store");
        (dir, store)
    }

    #[test]
    fn timestamps_round_trip_without_offset() {
        let ts = Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).single().unwrap();
        let raw = format_ts(ts);
        assert_eq!(raw, "2026-03-01T09:30:00");
        assert_eq!(parse_ts(&raw), Some(ts));
        assert_eq!(parse_ts("not a timestamp"), None);
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn duplicate_insert_is_a_noop() {
        let (_dir, store) = open_temp_store().await;
        let deal = mk_deal("20% off everything", "https://shop.example/sale");

        assert!(store.insert(&deal).await.unwrap());
        assert!(!store.insert(&deal).await.unwrap());

        let rows = store.query("ozon", None, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].title, "20% off everything");
    }

    #[tokio::test]
    async fn insert_rejects_mismatched_hash() {
        let (_dir, store) = open_temp_store().await;
        let mut deal = mk_deal("Sale", "https://shop.example/a");
        deal.content_hash = content_hash("https://other.example", "Sale", None);
        assert!(matches!(
            store.insert(&deal).await,
            Err(StoreError::InvalidDeal(_))
        ));

        let mut empty = mk_deal("Sale", "https://shop.example/a");
        empty.url = String::new();
        assert!(matches!(
            store.insert(&empty).await,
            Err(StoreError::InvalidDeal(_))
        ));
    }

    #[tokio::test]
    async fn expired_deals_never_surface() {
        let (_dir, store) = open_temp_store().await;

        let mut expired = mk_deal("Yesterday's deal", "https://shop.example/old");
        expired.end_at = Some(Utc::now() - chrono::Duration::days(1));
        let mut live = mk_deal("Still on", "https://shop.example/live");
        live.end_at = Some(Utc::now() + chrono::Duration::days(1));

        assert!(store.insert(&expired).await.unwrap());
        assert!(store.insert(&live).await.unwrap());

        let rows = store.query("ozon", None, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].title, "Still on");
    }

    #[tokio::test]
    async fn query_orders_by_score_then_deadline() {
        let (_dir, store) = open_temp_store().await;

        let mut high_no_deadline = mk_deal("High A", "https://shop.example/a");
        high_no_deadline.score = 0.9;
        let mut low = mk_deal("Low", "https://shop.example/b");
        low.score = 0.5;
        let mut high_with_deadline = mk_deal("High B", "https://shop.example/c");
        high_with_deadline.score = 0.9;
        high_with_deadline.end_at = Some(Utc::now() + chrono::Duration::days(2));

        for deal in [&high_no_deadline, &low, &high_with_deadline] {
            assert!(store.insert(deal).await.unwrap());
        }

        let rows = store.query("ozon", None, 10).await.unwrap();
        let titles: Vec<_> = rows.iter().map(|d| d.title.as_str()).collect();
        // Equal scores: the one with a known deadline outranks the open-ended one.
        assert_eq!(titles, vec!["High B", "High A", "Low"]);
    }

    #[tokio::test]
    async fn query_category_filter_matches_text_fields() {
        let (_dir, store) = open_temp_store().await;

        let mut kettle = mk_deal("Чайник со скидкой", "https://shop.example/kettle");
        kettle.category = Some("техника".to_string());
        let mut shoes = mk_deal("Кроссовки", "https://shop.example/shoes");
        shoes.category = Some("обувь".to_string());

        assert!(store.insert(&kettle).await.unwrap());
        assert!(store.insert(&shoes).await.unwrap());

        let rows = store.query("ozon", Some("техника"), 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].title, "Чайник со скидкой");

        let by_substring = store.query("ozon", Some("Кроссовки"), 10).await.unwrap();
        assert_eq!(by_substring.len(), 1);
    }

    #[tokio::test]
    async fn limit_bounds_results() {
        let (_dir, store) = open_temp_store().await;
        for i in 0..7 {
            let deal = mk_deal(&format!("Deal {i}"), &format!("https://shop.example/{i}"));
            assert!(store.insert(&deal).await.unwrap());
        }
        let rows = store.query("ozon", None, 5).await.unwrap();
        assert_eq!(rows.len(), 5);
    }

    #[tokio::test]
    async fn cleanup_deletes_expired_and_stale_inclusive() {
        let (_dir, store) = open_temp_store().await;
        let retention = chrono::Duration::days(14);

        let expired = mk_deal("Expired", "https://shop.example/expired");
        let stale = mk_deal("Stale", "https://shop.example/stale");
        let fresh = mk_deal("Fresh", "https://shop.example/fresh");
        for deal in [&expired, &stale, &fresh] {
            assert!(store.insert(deal).await.unwrap());
        }

        let now = Utc::now();
        sqlx::query("UPDATE deals SET end_at = ?1 WHERE content_hash = ?2")
            .bind(format_ts(now - chrono::Duration::hours(1)))
            .bind(&expired.content_hash)
            .execute(store.pool())
            .await
            .unwrap();
        // Exactly on the retention boundary: must be deleted.
        sqlx::query("UPDATE deals SET created_at = ?1 WHERE content_hash = ?2")
            .bind(format_ts(now - retention))
            .bind(&stale.content_hash)
            .execute(store.pool())
            .await
            .unwrap();
        // Inside the window with margin: must be retained.
        sqlx::query("UPDATE deals SET created_at = ?1 WHERE content_hash = ?2")
            .bind(format_ts(now - retention + chrono::Duration::minutes(1)))
            .bind(&fresh.content_hash)
            .execute(store.pool())
            .await
            .unwrap();

        let deleted = store.delete_expired_or_stale(retention).await.unwrap();
        assert_eq!(deleted, 2);

        let rows = store.query("ozon", None, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].title, "Fresh");
    }

    #[tokio::test]
    async fn distinct_listing_surfaces() {
        let (_dir, store) = open_temp_store().await;

        let mut a = mk_deal("A", "https://shop.example/a");
        a.store_slug = "wildberries".to_string();
        a.category = Some("обувь".to_string());
        let b = mk_deal("B", "https://shop.example/b");

        assert!(store.insert(&a).await.unwrap());
        assert!(store.insert(&b).await.unwrap());

        assert_eq!(
            store.distinct_store_slugs().await.unwrap(),
            vec!["ozon".to_string(), "wildberries".to_string()]
        );
        assert_eq!(
            store.distinct_categories().await.unwrap(),
            vec!["акции".to_string(), "обувь".to_string()]
        );
    }
}
