//! Ingestion orchestration: source configuration, per-source dispatch with
//! fault isolation, cleanup sweeps, and cron wiring.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dealwire_core::{normalize, AliasTable, MatchTokens, SourceKind};
use dealwire_extract::{ApiParams, CssSelectors, ExtractContext, Extractor, ExtractorSet, SourceSpec};
use dealwire_store::{BackoffPolicy, DealStore, HttpClientConfig, HttpFetcher, StoreError};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dealwire-ingest";

/// Built-in source list, used when neither `STORES_JSON` nor a sources file
/// is present.
pub const DEFAULT_STORES_JSON: &str = r#"{
  "stores": [
    { "type": "auto", "store": "ozon", "category": "акции", "url": "https://www.ozon.ru/info/actions/" },
    { "type": "auto", "store": "wildberries", "category": "акции", "url": "https://www.wildberries.ru/promotions" },
    { "type": "auto", "store": "yandexmarket", "category": "акции", "url": "https://market.yandex.ru/specials" },
    { "type": "auto", "store": "sbermegamarket", "category": "акции", "url": "https://sbermegamarket.ru/actions/" },
    { "type": "auto", "store": "mvideo", "category": "акции", "url": "https://www.mvideo.ru/promo" },
    { "type": "auto", "store": "eldorado", "category": "акции", "url": "https://www.eldorado.ru/promo/" },
    { "type": "auto", "store": "dns", "category": "акции", "url": "https://www.dns-shop.ru/actions/" },
    { "type": "auto", "store": "citilink", "category": "акции", "url": "https://www.citilink.ru/promo/" },
    { "type": "auto", "store": "lamoda", "category": "акции", "url": "https://www.lamoda.ru/promo/" },
    { "type": "auto", "store": "sportmaster", "category": "акции", "url": "https://www.sportmaster.ru/actions/" },
    { "type": "auto", "store": "letual", "category": "акции", "url": "https://www.letu.ru/promo" },
    { "type": "auto", "store": "apteka", "category": "акции", "url": "https://apteka.ru/discounts" },
    { "type": "auto", "store": "vkusvill", "category": "акции", "url": "https://vkusvill.ru/akcii/" },
    { "type": "auto", "store": "perekrestok", "category": "акции", "url": "https://www.perekrestok.ru/cat/akcii" },
    { "type": "auto", "store": "magnit", "category": "акции", "url": "https://magnit.ru/promo/" },
    { "type": "auto", "store": "lenta", "category": "акции", "url": "https://lenta.com/promo/" },
    { "type": "auto", "store": "auchan", "category": "акции", "url": "https://www.auchan.ru/promo/" },
    { "type": "auto", "store": "metro", "category": "акции", "url": "https://www.metro-cc.ru/promo" }
  ]
}"#;

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub db_path: PathBuf,
    /// Inline source document; takes precedence over `sources_path`.
    pub stores_json: Option<String>,
    pub sources_path: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub http_max_retries: usize,
    pub source_concurrency: usize,
    pub scheduler_enabled: bool,
    pub ingest_cron: String,
    pub cleanup_cron: String,
    pub retention_days: i64,
}

impl IngestConfig {
    pub fn from_env() -> Self {
        Self {
            db_path: std::env::var("DEALWIRE_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/dealwire.db")),
            stores_json: std::env::var("STORES_JSON").ok(),
            sources_path: std::env::var("DEALWIRE_SOURCES_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./sources.json")),
            user_agent: std::env::var("DEALWIRE_USER_AGENT")
                .unwrap_or_else(|_| "Mozilla/5.0 (compatible; DealwireBot/1.0)".to_string()),
            http_timeout_secs: std::env::var("DEALWIRE_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            http_max_retries: std::env::var("DEALWIRE_HTTP_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
            source_concurrency: std::env::var("DEALWIRE_SOURCE_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(4),
            scheduler_enabled: std::env::var("DEALWIRE_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            ingest_cron: std::env::var("DEALWIRE_INGEST_CRON")
                .unwrap_or_else(|_| "0 0,30 * * * *".to_string()),
            cleanup_cron: std::env::var("DEALWIRE_CLEANUP_CRON")
                .unwrap_or_else(|_| "0 0 3 * * *".to_string()),
            retention_days: std::env::var("DEALWIRE_RETENTION_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(14),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("malformed source document: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Deserialize)]
struct SourceDocument {
    #[serde(default)]
    stores: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct SourceEntry {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    store: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    item_selector: Option<String>,
    #[serde(default)]
    title_selector: Option<String>,
    #[serde(default)]
    link_selector: Option<String>,
    #[serde(default)]
    desc_selector: Option<String>,
    #[serde(default)]
    api: Option<ApiParams>,
}

/// Parse the `{"stores": [...]}` document. A document that fails to parse is
/// a `ConfigError`; a single malformed entry is logged and skipped so the
/// rest of the list still ingests.
pub fn parse_source_document(raw: &str) -> Result<Vec<SourceSpec>, ConfigError> {
    let doc: SourceDocument = serde_json::from_str(raw)?;
    let mut specs = Vec::new();
    for (index, value) in doc.stores.into_iter().enumerate() {
        let parsed = serde_json::from_value::<SourceEntry>(value)
            .map_err(|err| err.to_string())
            .and_then(entry_to_spec);
        match parsed {
            Ok(spec) => specs.push(spec),
            Err(reason) => warn!(index, %reason, "skipping malformed source entry"),
        }
    }
    Ok(specs)
}

fn entry_to_spec(entry: SourceEntry) -> Result<SourceSpec, String> {
    let store = entry
        .store
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| "missing store".to_string())?;
    let url = entry
        .url
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty())
        .ok_or_else(|| "missing url".to_string())?;

    let kind = SourceKind::parse(entry.kind.as_deref());
    let selectors = match kind {
        SourceKind::HtmlCss => {
            let item = entry
                .item_selector
                .ok_or_else(|| "html_css entry missing item_selector".to_string())?;
            let title = entry
                .title_selector
                .ok_or_else(|| "html_css entry missing title_selector".to_string())?;
            let link = entry
                .link_selector
                .ok_or_else(|| "html_css entry missing link_selector".to_string())?;
            Some(CssSelectors {
                item,
                title,
                link,
                description: entry.desc_selector,
            })
        }
        _ => None,
    };

    Ok(SourceSpec {
        kind,
        store,
        category: entry.category.filter(|c| !c.trim().is_empty()),
        url,
        selectors,
        api: entry.api,
    })
}

/// Aggregate result of one ingestion run.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct IngestSummary {
    pub run_id: Uuid,
    pub sources_run: usize,
    pub sources_failed: usize,
    pub candidates: usize,
    pub inserted: usize,
}

struct SourceOutcome {
    candidates: usize,
    inserted: usize,
}

/// Owns the store, the fetcher, and the extractor set; one per process.
pub struct Ingestor {
    config: IngestConfig,
    store: DealStore,
    http: Arc<HttpFetcher>,
    extractors: Arc<ExtractorSet>,
    aliases: Arc<AliasTable>,
}

impl Ingestor {
    pub async fn new(config: IngestConfig) -> anyhow::Result<Self> {
        if let Some(parent) = config.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating database directory {}", parent.display()))?;
            }
        }
        let store = DealStore::open(&config.db_path)
            .await
            .context("opening deal store")?;
        let http = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: config.user_agent.clone(),
            backoff: BackoffPolicy {
                max_retries: config.http_max_retries,
                ..BackoffPolicy::default()
            },
            ..HttpClientConfig::default()
        })?);
        let extractors = Arc::new(ExtractorSet::new(MatchTokens::default())?);
        Ok(Self {
            config,
            store,
            http,
            extractors,
            aliases: Arc::new(AliasTable::default()),
        })
    }

    pub fn store(&self) -> &DealStore {
        &self.store
    }

    pub fn aliases(&self) -> &AliasTable {
        &self.aliases
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.config.retention_days)
    }

    fn load_source_specs(&self) -> Vec<SourceSpec> {
        let raw = if let Some(inline) = &self.config.stores_json {
            inline.clone()
        } else if self.config.sources_path.exists() {
            match std::fs::read_to_string(&self.config.sources_path) {
                Ok(contents) => contents,
                Err(err) => {
                    error!(
                        path = %self.config.sources_path.display(),
                        error = %err,
                        "unreadable sources file, using built-in defaults"
                    );
                    DEFAULT_STORES_JSON.to_string()
                }
            }
        } else {
            DEFAULT_STORES_JSON.to_string()
        };

        match parse_source_document(&raw) {
            Ok(specs) => specs,
            Err(err) => {
                // Degrade to an empty source list rather than aborting.
                error!(error = %err, "source configuration unusable, running with no sources");
                Vec::new()
            }
        }
    }

    /// One full ingestion pass. Sources run with bounded parallelism; a
    /// failing source contributes nothing but never aborts its siblings.
    /// Only a non-transient storage fault propagates.
    pub async fn run_ingestion(&self) -> Result<IngestSummary, StoreError> {
        let run_id = Uuid::new_v4();
        let specs = self.load_source_specs();
        info!(%run_id, sources = specs.len(), "ingestion run started");

        let semaphore = Arc::new(Semaphore::new(self.config.source_concurrency.max(1)));
        let mut tasks: JoinSet<Result<SourceOutcome, StoreError>> = JoinSet::new();

        for spec in specs {
            let semaphore = semaphore.clone();
            let http = self.http.clone();
            let extractors = self.extractors.clone();
            let aliases = self.aliases.clone();
            let store = self.store.clone();
            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("semaphore not closed");
                let ctx = ExtractContext {
                    run_id,
                    http: &http,
                    aliases: &aliases,
                };
                let candidates = extractors.for_kind(spec.kind).extract(&ctx, &spec).await;

                let mut outcome = SourceOutcome {
                    candidates: candidates.len(),
                    inserted: 0,
                };
                for candidate in candidates {
                    let Some(deal) =
                        normalize(candidate, &spec.store, spec.category.as_deref(), &aliases)
                    else {
                        continue;
                    };
                    match store.insert(&deal).await {
                        Ok(true) => outcome.inserted += 1,
                        Ok(false) => {}
                        Err(StoreError::InvalidDeal(reason)) => {
                            warn!(%reason, "dropping invalid deal");
                        }
                        Err(err) => return Err(err),
                    }
                }
                Ok(outcome)
            });
        }

        let mut summary = IngestSummary {
            run_id,
            sources_run: 0,
            sources_failed: 0,
            candidates: 0,
            inserted: 0,
        };
        let mut storage_fault: Option<StoreError> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(outcome)) => {
                    summary.sources_run += 1;
                    summary.candidates += outcome.candidates;
                    summary.inserted += outcome.inserted;
                }
                Ok(Err(err)) => {
                    error!(error = %err, "storage fault during ingestion");
                    summary.sources_failed += 1;
                    storage_fault.get_or_insert(err);
                }
                Err(join_err) => {
                    error!(error = %join_err, "source task panicked");
                    summary.sources_failed += 1;
                }
            }
        }
        if let Some(err) = storage_fault {
            return Err(err);
        }

        info!(%run_id, added = summary.inserted, candidates = summary.candidates, "ingestion run finished");
        Ok(summary)
    }

    /// Cleanup sweep. No retry here; a missed sweep simply deletes more next
    /// time.
    pub async fn run_cleanup(&self, retention: chrono::Duration) -> Result<u64, StoreError> {
        let deleted = self.store.delete_expired_or_stale(retention).await?;
        info!(deleted, "cleanup sweep finished");
        Ok(deleted)
    }
}

/// Cron wiring for the periodic ingestion and cleanup jobs. Returns `None`
/// when the scheduler is disabled by configuration.
pub async fn maybe_build_scheduler(ingestor: Arc<Ingestor>) -> anyhow::Result<Option<JobScheduler>> {
    if !ingestor.config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;

    let ingest = ingestor.clone();
    let job = Job::new_async(ingestor.config.ingest_cron.as_str(), move |_uuid, _lock| {
        let ingest = ingest.clone();
        Box::pin(async move {
            match ingest.run_ingestion().await {
                Ok(summary) => info!(added = summary.inserted, "scheduled ingestion finished"),
                Err(err) => error!(error = %err, "scheduled ingestion failed"),
            }
        })
    })
    .with_context(|| format!("creating ingestion job for cron {}", ingestor.config.ingest_cron))?;
    sched.add(job).await.context("adding ingestion job")?;

    let cleanup = ingestor.clone();
    let job = Job::new_async(ingestor.config.cleanup_cron.as_str(), move |_uuid, _lock| {
        let cleanup = cleanup.clone();
        Box::pin(async move {
            let retention = cleanup.retention();
            if let Err(err) = cleanup.run_cleanup(retention).await {
                error!(error = %err, "scheduled cleanup failed");
            }
        })
    })
    .with_context(|| format!("creating cleanup job for cron {}", ingestor.config.cleanup_cron))?;
    sched.add(job).await.context("adding cleanup job")?;

    Ok(Some(sched))
}
