//! Offer ingestion pipeline, the query/write facade over the store, and the
//! periodic trigger that drives ingestion.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jof_adapters::{
    FetchError, FileOfferSource, HttpOfferSource, HttpSourceConfig, OfferSource, RetryPolicy,
};
use jof_core::{NewOffer, OfferId, OfferRequest, OfferResponse};
use jof_storage::{
    BatchSave, CacheLookup, InMemoryOfferCache, InMemoryOfferStore, NoopOfferCache, OfferCache,
    OfferStore, PgOfferStore, StoreError,
};
use serde::Serialize;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jof-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub offers_url: String,
    pub offers_file: Option<PathBuf>,
    pub scheduler_enabled: bool,
    pub sync_interval: Duration,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub http_max_retries: usize,
    pub cache_ttl_secs: u64,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            offers_url: std::env::var("JOF_OFFERS_URL")
                .unwrap_or_else(|_| "http://localhost:5057/offers".to_string()),
            offers_file: std::env::var("JOF_OFFERS_FILE").ok().map(PathBuf::from),
            scheduler_enabled: std::env::var("JOF_SCHEDULER_ENABLED")
                .map(|v| env_flag(&v))
                .unwrap_or(false),
            sync_interval: Duration::from_secs(env_number("JOF_SYNC_INTERVAL_SECS").unwrap_or(10_800)),
            user_agent: std::env::var("JOF_USER_AGENT").unwrap_or_else(|_| "jof-bot/0.1".to_string()),
            http_timeout_secs: env_number("JOF_HTTP_TIMEOUT_SECS").unwrap_or(20),
            http_max_retries: env_number("JOF_HTTP_MAX_RETRIES").unwrap_or(3),
            cache_ttl_secs: env_number("JOF_CACHE_TTL_SECS").unwrap_or(60),
        }
    }

    /// `None` when caching is disabled.
    pub fn cache_ttl(&self) -> Option<Duration> {
        (self.cache_ttl_secs > 0).then(|| Duration::from_secs(self.cache_ttl_secs))
    }
}

fn env_flag(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "TRUE" | "True" | "yes")
}

fn env_number<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Result of the optimistic duplicate check run before persistence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreFiltered {
    pub fresh: Vec<NewOffer>,
    pub known: usize,
}

/// Cheap duplicate check ahead of the store's own uniqueness enforcement.
///
/// A pre-filter only reduces write traffic. Correctness never depends on it:
/// the pipeline stays correct with [`NoopPreFilter`].
#[async_trait]
pub trait PreFilter: Send + Sync {
    async fn apply(&self, candidates: Vec<NewOffer>) -> Result<PreFiltered, StoreError>;
}

#[derive(Debug, Default)]
pub struct NoopPreFilter;

#[async_trait]
impl PreFilter for NoopPreFilter {
    async fn apply(&self, candidates: Vec<NewOffer>) -> Result<PreFiltered, StoreError> {
        Ok(PreFiltered {
            fresh: candidates,
            known: 0,
        })
    }
}

/// Drops candidates whose url the store already knows.
pub struct KnownUrlPreFilter {
    store: Arc<dyn OfferStore>,
}

impl KnownUrlPreFilter {
    pub fn new(store: Arc<dyn OfferStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl PreFilter for KnownUrlPreFilter {
    async fn apply(&self, candidates: Vec<NewOffer>) -> Result<PreFiltered, StoreError> {
        let mut filtered = PreFiltered::default();
        for candidate in candidates {
            if self.store.exists_by_offer_url(&candidate.offer_url).await? {
                filtered.known += 1;
            } else {
                filtered.fresh.push(candidate);
            }
        }
        Ok(filtered)
    }
}

/// Split off offers that can never be ingested. Returns the survivors and
/// how many were dropped.
pub fn retain_ingestible(offers: Vec<NewOffer>) -> (Vec<NewOffer>, usize) {
    let total = offers.len();
    let kept: Vec<_> = offers.into_iter().filter(NewOffer::is_ingestible).collect();
    let dropped = total - kept.len();
    (kept, dropped)
}

/// Offers that passed the pre-filter but were rejected by the store, together
/// with the offers from the same batch that were persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateBatch {
    pub persisted: Vec<OfferResponse>,
    pub duplicates: Vec<NewOffer>,
}

impl DuplicateBatch {
    pub fn duplicate_urls(&self) -> Vec<&str> {
        self.duplicates.iter().map(|o| o.offer_url.as_str()).collect()
    }
}

#[derive(Debug, Error)]
pub enum IngestionError {
    #[error("fetching offers from {source_id} failed: {source}")]
    Fetch {
        source_id: String,
        #[source]
        source: FetchError,
    },
    #[error(
        "{} offer(s) passed the pre-filter but were rejected as duplicates: {}",
        .0.duplicates.len(),
        .0.duplicate_urls().join(", ")
    )]
    DuplicateDetected(DuplicateBatch),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestionReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub source_id: String,
    pub fetched: usize,
    pub skipped_empty_url: usize,
    pub skipped_known: usize,
    pub persisted: usize,
    /// Offers saved by this cycle, in the order they were persisted.
    pub offers: Vec<OfferResponse>,
    pub duplicates: Vec<String>,
}

struct CycleOutcome {
    fetched: usize,
    skipped_empty_url: usize,
    skipped_known: usize,
    batch: BatchSave,
}

/// One ingestion cycle: fetch, drop unusable and already-known offers, persist
/// the rest.
pub struct IngestionService {
    source: Arc<dyn OfferSource>,
    store: Arc<dyn OfferStore>,
    pre_filter: Box<dyn PreFilter>,
    cache: Arc<dyn OfferCache>,
}

impl IngestionService {
    pub fn new(source: Arc<dyn OfferSource>, store: Arc<dyn OfferStore>) -> Self {
        Self {
            pre_filter: Box::new(KnownUrlPreFilter::new(Arc::clone(&store))),
            source,
            store,
            cache: Arc::new(NoopOfferCache),
        }
    }

    pub fn with_pre_filter(mut self, pre_filter: Box<dyn PreFilter>) -> Self {
        self.pre_filter = pre_filter;
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn OfferCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Persist every fetched offer whose url is not stored yet and return
    /// exactly those offers.
    ///
    /// A store-level duplicate surfaces as [`IngestionError::DuplicateDetected`]
    /// carrying both the rejected offers and the ones that were saved.
    pub async fn fetch_all_offers_and_save_all_if_not_exists(
        &self,
    ) -> Result<Vec<OfferResponse>, IngestionError> {
        let outcome = self.ingest().await?;
        if !outcome.batch.has_duplicates() {
            return Ok(outcome.batch.saved.into_iter().map(OfferResponse::from).collect());
        }
        let BatchSave { saved, duplicates } = outcome.batch;
        Err(IngestionError::DuplicateDetected(DuplicateBatch {
            persisted: saved.into_iter().map(OfferResponse::from).collect(),
            duplicates,
        }))
    }

    /// Scheduler-facing variant. Duplicates that slipped past the pre-filter
    /// are reported rather than raised; fetch and store failures still fail.
    pub async fn run_cycle(&self) -> Result<IngestionReport, IngestionError> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let span = info_span!("ingestion_cycle", %run_id, source = self.source.source_id());
        let outcome = self.ingest().instrument(span).await?;
        let BatchSave { saved, duplicates } = outcome.batch;

        let report = IngestionReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            source_id: self.source.source_id().to_string(),
            fetched: outcome.fetched,
            skipped_empty_url: outcome.skipped_empty_url,
            skipped_known: outcome.skipped_known,
            persisted: saved.len(),
            offers: saved.into_iter().map(OfferResponse::from).collect(),
            duplicates: duplicates.into_iter().map(|o| o.offer_url).collect(),
        };
        Ok(report)
    }

    async fn ingest(&self) -> Result<CycleOutcome, IngestionError> {
        info!(source = self.source.source_id(), "ingestion cycle started");
        let records = self
            .source
            .fetch()
            .await
            .map_err(|source| IngestionError::Fetch {
                source_id: self.source.source_id().to_string(),
                source,
            })?;
        let fetched = records.len();
        let mapped: Vec<NewOffer> = records.into_iter().map(NewOffer::from).collect();

        let (ingestible, skipped_empty_url) = retain_ingestible(mapped);
        let filtered = self.pre_filter.apply(ingestible).await?;

        let batch = if filtered.fresh.is_empty() {
            BatchSave::default()
        } else {
            match self.store.save_all(filtered.fresh).await {
                Ok(batch) => batch,
                Err(err) => {
                    // Part of the batch may already be committed.
                    self.cache.invalidate().await;
                    return Err(err.into());
                }
            }
        };

        if !batch.saved.is_empty() {
            self.cache.invalidate().await;
        }
        if batch.has_duplicates() {
            for duplicate in &batch.duplicates {
                warn!(offer_url = %duplicate.offer_url, "store rejected offer that passed the pre-filter");
            }
        }
        info!(
            fetched,
            skipped_empty_url,
            skipped_known = filtered.known,
            persisted = batch.saved.len(),
            duplicates = batch.duplicates.len(),
            "ingestion cycle finished"
        );

        Ok(CycleOutcome {
            fetched,
            skipped_empty_url,
            skipped_known: filtered.known,
            batch,
        })
    }
}

#[derive(Debug, Error)]
pub enum OfferError {
    #[error("Offer with id {id} not found")]
    NotFound { id: String },
    #[error("Offer with offerUrl {offer_url} already exists")]
    DuplicateKey { offer_url: String },
    #[error(transparent)]
    Ingestion(#[from] IngestionError),
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for OfferError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateKey { offer_url } => Self::DuplicateKey { offer_url },
            other => Self::Store(other),
        }
    }
}

/// Read/write entry point used by the API layer.
pub struct OfferFacade {
    store: Arc<dyn OfferStore>,
    cache: Arc<dyn OfferCache>,
    ingestion: Arc<IngestionService>,
}

impl OfferFacade {
    /// `ingestion` must be built with the same cache so both write paths
    /// invalidate it.
    pub fn new(
        store: Arc<dyn OfferStore>,
        cache: Arc<dyn OfferCache>,
        ingestion: Arc<IngestionService>,
    ) -> Self {
        Self {
            store,
            cache,
            ingestion,
        }
    }

    pub fn ingestion(&self) -> Arc<IngestionService> {
        Arc::clone(&self.ingestion)
    }

    pub async fn find_all_offers(&self) -> Result<Vec<OfferResponse>, OfferError> {
        let offers = match self.cache.get().await {
            CacheLookup::Hit(offers) => offers,
            CacheLookup::Miss(ticket) => {
                let offers = self.store.find_all().await?;
                self.cache.put(ticket, offers.clone()).await;
                offers
            }
        };
        Ok(offers.into_iter().map(OfferResponse::from).collect())
    }

    pub async fn find_offer_by_id(&self, id: &str) -> Result<OfferResponse, OfferError> {
        self.store
            .find_by_id(&OfferId::from(id))
            .await?
            .map(OfferResponse::from)
            .ok_or_else(|| OfferError::NotFound { id: id.to_string() })
    }

    pub async fn save_offer(&self, request: OfferRequest) -> Result<OfferResponse, OfferError> {
        let saved = self.store.save(NewOffer::from(request)).await?;
        self.cache.invalidate().await;
        debug!(id = %saved.id, offer_url = %saved.offer_url, "saved offer");
        Ok(OfferResponse::from(saved))
    }

    pub async fn fetch_all_offers_and_save_all_if_not_exists(
        &self,
    ) -> Result<Vec<OfferResponse>, OfferError> {
        Ok(self
            .ingestion
            .fetch_all_offers_and_save_all_if_not_exists()
            .await?)
    }
}

pub async fn connect_store(config: &SyncConfig) -> Result<Arc<dyn OfferStore>> {
    match &config.database_url {
        Some(database_url) => {
            let store = PgOfferStore::connect(database_url)
                .await
                .context("connecting to offer database")?;
            store.migrate().await.context("running offer migrations")?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set; offers are kept in memory");
            Ok(Arc::new(InMemoryOfferStore::new()))
        }
    }
}

pub fn build_source(config: &SyncConfig) -> Result<Arc<dyn OfferSource>> {
    if let Some(path) = &config.offers_file {
        return Ok(Arc::new(FileOfferSource::new(path.clone())));
    }
    let source = HttpOfferSource::new(HttpSourceConfig {
        url: config.offers_url.clone(),
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        retry: RetryPolicy {
            max_retries: config.http_max_retries,
            ..RetryPolicy::default()
        },
    })
    .context("building offer http client")?;
    info!(url = source.url(), "offers fetched over http");
    Ok(Arc::new(source))
}

pub fn build_cache(config: &SyncConfig) -> Arc<dyn OfferCache> {
    match config.cache_ttl() {
        Some(ttl) => Arc::new(InMemoryOfferCache::new(ttl)),
        None => Arc::new(NoopOfferCache),
    }
}

pub async fn build_facade(config: &SyncConfig) -> Result<OfferFacade> {
    let store = connect_store(config).await?;
    let source = build_source(config)?;
    let cache = build_cache(config);
    let ingestion =
        IngestionService::new(source, Arc::clone(&store)).with_cache(Arc::clone(&cache));
    Ok(OfferFacade::new(store, cache, Arc::new(ingestion)))
}

pub async fn run_ingestion_once_from_env() -> Result<IngestionReport> {
    let config = SyncConfig::from_env();
    let facade = build_facade(&config).await?;
    let report = facade
        .ingestion()
        .run_cycle()
        .await
        .context("running ingestion cycle")?;
    Ok(report)
}

/// Zero-argument trigger body for the periodic job. Failures are logged and
/// swallowed so the next tick still runs.
pub async fn run_scheduled_cycle(ingestion: &IngestionService) -> Option<IngestionReport> {
    match ingestion.run_cycle().await {
        Ok(report) => {
            if !report.duplicates.is_empty() {
                warn!(
                    run_id = %report.run_id,
                    duplicates = ?report.duplicates,
                    "ingestion cycle hit store-level duplicates"
                );
            }
            Some(report)
        }
        Err(err) => {
            error!(error = %err, "scheduled ingestion cycle failed");
            None
        }
    }
}

pub async fn start_ingestion_scheduler(
    ingestion: Arc<IngestionService>,
    period: Duration,
) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_repeated_async(period, move |_uuid, _lock| {
        let ingestion = Arc::clone(&ingestion);
        Box::pin(async move {
            run_scheduled_cycle(&ingestion).await;
        })
    })
    .with_context(|| format!("creating ingestion job every {period:?}"))?;
    sched.add(job).await.context("adding ingestion job")?;
    sched.start().await.context("starting scheduler")?;
    info!(period_secs = period.as_secs(), "offer ingestion scheduler started");
    Ok(sched)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use jof_adapters::StaticOfferSource;
    use jof_core::JobOfferRecord;

    use super::*;

    fn six_records() -> Vec<JobOfferRecord> {
        vec![
            JobOfferRecord::new("aaa", "developer", "100", "1"),
            JobOfferRecord::new("bbb", "junior developer", "200", "2"),
            JobOfferRecord::new("ccc", "scrum master", "300", "3"),
            JobOfferRecord::new("ddd", "agile coach", "400", "4"),
            JobOfferRecord::new("eee", "IT director", "500", "5"),
            JobOfferRecord::new("fff", "data analyst", "600", "6"),
        ]
    }

    struct Fixture {
        facade: OfferFacade,
        source: Arc<StaticOfferSource>,
        store: Arc<InMemoryOfferStore>,
    }

    fn fixture_with(records: Vec<JobOfferRecord>) -> Fixture {
        build_fixture(records, None)
    }

    fn fixture_with_pre_filter(
        records: Vec<JobOfferRecord>,
        pre_filter: Box<dyn PreFilter>,
    ) -> Fixture {
        build_fixture(records, Some(pre_filter))
    }

    fn build_fixture(records: Vec<JobOfferRecord>, pre_filter: Option<Box<dyn PreFilter>>) -> Fixture {
        let source = Arc::new(StaticOfferSource::new(records));
        let store = Arc::new(InMemoryOfferStore::new());
        let cache: Arc<dyn OfferCache> = Arc::new(InMemoryOfferCache::new(Duration::from_secs(60)));
        let mut ingestion =
            IngestionService::new(source.clone(), store.clone()).with_cache(Arc::clone(&cache));
        if let Some(pre_filter) = pre_filter {
            ingestion = ingestion.with_pre_filter(pre_filter);
        }
        let facade = OfferFacade::new(store.clone(), cache, Arc::new(ingestion));
        Fixture {
            facade,
            source,
            store,
        }
    }

    fn urls(offers: &[OfferResponse]) -> HashSet<String> {
        offers.iter().map(|o| o.offer_url.clone()).collect()
    }

    struct FailingSource;

    #[async_trait]
    impl OfferSource for FailingSource {
        fn source_id(&self) -> &str {
            "failing"
        }

        async fn fetch(&self) -> Result<Vec<JobOfferRecord>, FetchError> {
            Err(FetchError::HttpStatus {
                status: 503,
                url: "http://provider.invalid/offers".into(),
            })
        }
    }

    #[tokio::test]
    async fn saves_all_offers_when_store_is_empty() {
        let fx = fixture_with(six_records());
        assert!(fx.facade.find_all_offers().await.unwrap().is_empty());

        let result = fx
            .facade
            .fetch_all_offers_and_save_all_if_not_exists()
            .await
            .unwrap();

        assert_eq!(result.len(), 6);
        assert_eq!(fx.facade.find_all_offers().await.unwrap().len(), 6);
    }

    #[tokio::test]
    async fn saves_only_offers_with_unknown_urls() {
        let fx = fixture_with(vec![
            JobOfferRecord::new("aaa", "developer", "100", "1"),
            JobOfferRecord::new("bbb", "junior developer", "200", "2"),
            JobOfferRecord::new("ccc", "scrum master", "300", "3"),
            JobOfferRecord::new("ddd", "agile coach", "400", "4"),
            JobOfferRecord::new("new1", "Comarch", "1000", "https://someurl.example/5"),
            JobOfferRecord::new("new2", "Finanteq", "2000", "https://someother.example/6"),
        ]);
        for url in ["1", "2", "3", "4"] {
            fx.facade
                .save_offer(OfferRequest::new("company", "position", "1000", url))
                .await
                .unwrap();
        }
        assert_eq!(fx.facade.find_all_offers().await.unwrap().len(), 4);

        let result = fx
            .facade
            .fetch_all_offers_and_save_all_if_not_exists()
            .await
            .unwrap();

        assert_eq!(
            urls(&result),
            HashSet::from([
                "https://someurl.example/5".to_string(),
                "https://someother.example/6".to_string()
            ])
        );
    }

    #[tokio::test]
    async fn second_run_against_unchanged_source_saves_nothing() {
        let fx = fixture_with(six_records());
        let first = fx
            .facade
            .fetch_all_offers_and_save_all_if_not_exists()
            .await
            .unwrap();
        let second = fx
            .facade
            .fetch_all_offers_and_save_all_if_not_exists()
            .await
            .unwrap();

        assert_eq!(first.len(), 6);
        assert!(second.is_empty());
        assert_eq!(fx.store.count().await.unwrap(), 6);
    }

    #[tokio::test]
    async fn grown_source_yields_exactly_the_new_offers() {
        let records = six_records();
        let fx = fixture_with(records[..2].to_vec());
        let first = fx
            .facade
            .fetch_all_offers_and_save_all_if_not_exists()
            .await
            .unwrap();
        assert_eq!(first.len(), 2);

        fx.source.replace(records[..4].to_vec()).await;
        let second = fx
            .facade
            .fetch_all_offers_and_save_all_if_not_exists()
            .await
            .unwrap();
        assert_eq!(
            urls(&second),
            HashSet::from(["3".to_string(), "4".to_string()])
        );

        let all = fx.facade.find_all_offers().await.unwrap();
        assert_eq!(all.len(), 4);
        let mut expected = urls(&first);
        expected.extend(urls(&second));
        assert_eq!(urls(&all), expected);
    }

    #[tokio::test]
    async fn empty_source_leaves_store_untouched() {
        let fx = fixture_with(Vec::new());
        let result = fx
            .facade
            .fetch_all_offers_and_save_all_if_not_exists()
            .await
            .unwrap();
        assert!(result.is_empty());
        assert_eq!(fx.store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn offers_without_url_are_never_ingested() {
        let fx = fixture_with(vec![
            JobOfferRecord::new("aaa", "developer", "100", ""),
            JobOfferRecord::new("bbb", "tester", "200", "2"),
        ]);
        let report = fx.facade.ingestion().run_cycle().await.unwrap();

        assert_eq!(report.fetched, 2);
        assert_eq!(report.skipped_empty_url, 1);
        assert_eq!(report.persisted, 1);
        assert!(!fx.store.exists_by_offer_url("").await.unwrap());
    }

    #[tokio::test]
    async fn fetch_failure_persists_nothing() {
        let store = Arc::new(InMemoryOfferStore::new());
        let ingestion = IngestionService::new(Arc::new(FailingSource), store.clone());

        let err = ingestion
            .fetch_all_offers_and_save_all_if_not_exists()
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            IngestionError::Fetch {
                source: FetchError::HttpStatus { status: 503, .. },
                ..
            }
        ));
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn store_rejection_surfaces_duplicates_with_the_batch() {
        let fx = fixture_with_pre_filter(six_records(), Box::new(NoopPreFilter));
        fx.facade
            .save_offer(OfferRequest::new("manual", "position", "1000", "3"))
            .await
            .unwrap();

        let err = fx
            .facade
            .ingestion()
            .fetch_all_offers_and_save_all_if_not_exists()
            .await
            .unwrap_err();

        let IngestionError::DuplicateDetected(batch) = err else {
            panic!("expected duplicate detection, got {err}");
        };
        assert_eq!(batch.duplicate_urls(), vec!["3"]);
        assert_eq!(batch.persisted.len(), 5);
        assert_eq!(fx.store.count().await.unwrap(), 6);
        let stored = fx.facade.find_all_offers().await.unwrap();
        let manual = stored.iter().find(|o| o.offer_url == "3").unwrap();
        assert_eq!(manual.company_name, "manual");
    }

    #[tokio::test]
    async fn run_cycle_reports_duplicates_without_failing() {
        let fx = fixture_with_pre_filter(six_records(), Box::new(NoopPreFilter));
        fx.facade
            .save_offer(OfferRequest::new("manual", "position", "1000", "6"))
            .await
            .unwrap();

        let report = run_scheduled_cycle(&fx.facade.ingestion()).await.unwrap();
        assert_eq!(report.persisted, 5);
        assert_eq!(
            urls(&report.offers),
            HashSet::from(["1", "2", "3", "4", "5"].map(String::from))
        );
        assert!(report.offers.iter().all(|o| o.company_name != "manual"));
        assert_eq!(report.duplicates, vec!["6".to_string()]);
    }

    #[tokio::test]
    async fn run_cycle_counts_known_offers() {
        let fx = fixture_with(six_records());
        for url in ["1", "2", "3", "4"] {
            fx.facade
                .save_offer(OfferRequest::new("company", "position", "1000", url))
                .await
                .unwrap();
        }
        let report = fx.facade.ingestion().run_cycle().await.unwrap();
        assert_eq!(report.fetched, 6);
        assert_eq!(report.skipped_known, 4);
        assert_eq!(report.persisted, 2);
        assert_eq!(
            urls(&report.offers),
            HashSet::from(["5".to_string(), "6".to_string()])
        );
        for offer in &report.offers {
            assert_eq!(
                fx.facade.find_offer_by_id(offer.id.as_str()).await.unwrap(),
                *offer
            );
        }
        assert!(report.duplicates.is_empty());
        assert!(report.finished_at >= report.started_at);
    }

    /// Delegates to an in-memory store but fails the `fail_on`-th save once.
    struct FlakyStore {
        inner: InMemoryOfferStore,
        saves: AtomicUsize,
        fail_on: usize,
    }

    impl FlakyStore {
        fn failing_on(fail_on: usize) -> Self {
            Self {
                inner: InMemoryOfferStore::new(),
                saves: AtomicUsize::new(0),
                fail_on,
            }
        }
    }

    #[async_trait]
    impl OfferStore for FlakyStore {
        async fn find_all(&self) -> Result<Vec<jof_core::Offer>, StoreError> {
            self.inner.find_all().await
        }

        async fn find_by_id(&self, id: &OfferId) -> Result<Option<jof_core::Offer>, StoreError> {
            self.inner.find_by_id(id).await
        }

        async fn exists_by_offer_url(&self, offer_url: &str) -> Result<bool, StoreError> {
            self.inner.exists_by_offer_url(offer_url).await
        }

        async fn save(&self, offer: NewOffer) -> Result<jof_core::Offer, StoreError> {
            if self.saves.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_on {
                return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
            }
            self.inner.save(offer).await
        }
    }

    #[tokio::test]
    async fn store_failure_mid_batch_keeps_earlier_saves_and_refreshes_cache() {
        let source = Arc::new(StaticOfferSource::new(six_records()[..5].to_vec()));
        let store = Arc::new(FlakyStore::failing_on(3));
        let cache: Arc<dyn OfferCache> = Arc::new(InMemoryOfferCache::new(Duration::from_secs(60)));
        let ingestion =
            IngestionService::new(source, store.clone()).with_cache(Arc::clone(&cache));
        let facade = OfferFacade::new(store.clone(), cache, Arc::new(ingestion));

        assert!(facade.find_all_offers().await.unwrap().is_empty());

        let err = facade
            .fetch_all_offers_and_save_all_if_not_exists()
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OfferError::Ingestion(IngestionError::Store(StoreError::Database(_)))
        ));

        let after_failure = facade.find_all_offers().await.unwrap();
        assert_eq!(
            urls(&after_failure),
            HashSet::from(["1".to_string(), "2".to_string()])
        );

        let report = facade.ingestion().run_cycle().await.unwrap();
        assert_eq!(report.skipped_known, 2);
        assert_eq!(
            urls(&report.offers),
            HashSet::from(["3", "4", "5"].map(String::from))
        );
        assert_eq!(facade.find_all_offers().await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn scheduled_cycle_survives_fetch_failures() {
        let ingestion = IngestionService::new(
            Arc::new(FailingSource),
            Arc::new(InMemoryOfferStore::new()),
        );
        assert!(run_scheduled_cycle(&ingestion).await.is_none());
        assert!(run_scheduled_cycle(&ingestion).await.is_none());
    }

    #[tokio::test]
    async fn known_url_pre_filter_only_drops_stored_urls() {
        let store = Arc::new(InMemoryOfferStore::new());
        store
            .save(NewOffer::from(JobOfferRecord::new("a", "b", "c", "1")))
            .await
            .unwrap();
        let filter = KnownUrlPreFilter::new(store);

        let candidates: Vec<NewOffer> = six_records()[..3]
            .iter()
            .cloned()
            .map(NewOffer::from)
            .collect();
        let filtered = filter.apply(candidates).await.unwrap();

        assert_eq!(filtered.known, 1);
        let fresh: Vec<_> = filtered.fresh.iter().map(|o| o.offer_url.as_str()).collect();
        assert_eq!(fresh, vec!["2", "3"]);
    }

    #[tokio::test]
    async fn finds_saved_offer_by_id() {
        let fx = fixture_with(Vec::new());
        let saved = fx
            .facade
            .save_offer(OfferRequest::new("name", "xxx", "100", "1"))
            .await
            .unwrap();

        let found = fx.facade.find_offer_by_id(saved.id.as_str()).await.unwrap();
        assert_eq!(
            found,
            OfferResponse {
                id: saved.id.clone(),
                company_name: "name".into(),
                position: "xxx".into(),
                salary: "100".into(),
                offer_url: "1".into(),
            }
        );
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let fx = fixture_with(Vec::new());
        let err = fx.facade.find_offer_by_id("100").await.unwrap_err();
        assert!(matches!(err, OfferError::NotFound { ref id } if id == "100"));
        assert_eq!(err.to_string(), "Offer with id 100 not found");
    }

    #[tokio::test]
    async fn manual_save_of_existing_url_is_rejected() {
        let fx = fixture_with(Vec::new());
        let saved = fx
            .facade
            .save_offer(OfferRequest::new("company", "position", "1000", "1"))
            .await
            .unwrap();
        assert_eq!(
            fx.facade.find_offer_by_id(saved.id.as_str()).await.unwrap().id,
            saved.id
        );

        let err = fx
            .facade
            .save_offer(OfferRequest::new("company1", "position1", "10001", "1"))
            .await
            .unwrap_err();

        assert!(matches!(err, OfferError::DuplicateKey { .. }));
        assert_eq!(err.to_string(), "Offer with offerUrl 1 already exists");
        assert_eq!(fx.store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn cached_list_reflects_every_write_path() {
        let fx = fixture_with(six_records()[..2].to_vec());
        assert!(fx.facade.find_all_offers().await.unwrap().is_empty());

        fx.facade
            .fetch_all_offers_and_save_all_if_not_exists()
            .await
            .unwrap();
        assert_eq!(fx.facade.find_all_offers().await.unwrap().len(), 2);

        fx.facade
            .save_offer(OfferRequest::new("manual", "dev", "1", "https://manual.example/1"))
            .await
            .unwrap();
        assert_eq!(fx.facade.find_all_offers().await.unwrap().len(), 3);

        fx.facade.ingestion().run_cycle().await.unwrap();
        fx.source.replace(six_records()).await;
        fx.facade.ingestion().run_cycle().await.unwrap();
        assert_eq!(fx.facade.find_all_offers().await.unwrap().len(), 7);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn manual_save_racing_ingestion_keeps_urls_unique() {
        for _ in 0..20 {
            let fx = fixture_with(six_records());
            let facade = Arc::new(fx.facade);
            let ingest = {
                let facade = Arc::clone(&facade);
                tokio::spawn(async move { facade.fetch_all_offers_and_save_all_if_not_exists().await })
            };
            let manual = {
                let facade = Arc::clone(&facade);
                tokio::spawn(async move {
                    facade
                        .save_offer(OfferRequest::new("manual", "dev", "1", "4"))
                        .await
                })
            };
            let _ = ingest.await.unwrap();
            let _ = manual.await.unwrap();

            let all = facade.find_all_offers().await.unwrap();
            assert_eq!(all.len(), 6);
            assert_eq!(urls(&all).len(), 6);
        }
    }

    #[test]
    fn env_flags_accept_common_truthy_spellings() {
        assert!(env_flag("1"));
        assert!(env_flag("true"));
        assert!(env_flag(" True "));
        assert!(!env_flag("0"));
        assert!(!env_flag("off"));
    }

    #[test]
    fn zero_ttl_disables_cache() {
        let mut config = SyncConfig {
            database_url: None,
            offers_url: "http://localhost:5057/offers".into(),
            offers_file: None,
            scheduler_enabled: false,
            sync_interval: Duration::from_secs(10_800),
            user_agent: "jof-bot/0.1".into(),
            http_timeout_secs: 20,
            http_max_retries: 3,
            cache_ttl_secs: 0,
        };
        assert!(config.cache_ttl().is_none());
        config.cache_ttl_secs = 30;
        assert_eq!(config.cache_ttl(), Some(Duration::from_secs(30)));
    }
}
