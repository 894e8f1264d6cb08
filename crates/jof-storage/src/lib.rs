//! Offer persistence: the store contract, its in-memory and Postgres backends,
//! and the list cache that sits in front of `find_all`.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use jof_core::{NewOffer, Offer, OfferId};
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "jof-storage";

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const OFFER_URL_CONSTRAINT: &str = "offers_offer_url_key";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Offer with offerUrl {offer_url} already exists")]
    DuplicateKey { offer_url: String },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, Self::DuplicateKey { .. })
    }
}

/// Result of a best-effort batch save.
///
/// Every input offer ends up in exactly one of the two lists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSave {
    pub saved: Vec<Offer>,
    pub duplicates: Vec<NewOffer>,
}

impl BatchSave {
    pub fn has_duplicates(&self) -> bool {
        !self.duplicates.is_empty()
    }
}

/// Persistence capability for offers.
///
/// Implementations must make `save` an atomic check-and-insert on `offer_url`:
/// two concurrent saves of the same url never both succeed.
#[async_trait]
pub trait OfferStore: Send + Sync {
    async fn find_all(&self) -> Result<Vec<Offer>, StoreError>;

    async fn find_by_id(&self, id: &OfferId) -> Result<Option<Offer>, StoreError>;

    async fn exists_by_offer_url(&self, offer_url: &str) -> Result<bool, StoreError>;

    async fn save(&self, offer: NewOffer) -> Result<Offer, StoreError>;

    /// Save each offer independently. Duplicates are collected and the batch
    /// continues; any other failure stops the batch and is returned, leaving
    /// already-saved offers in place.
    async fn save_all(&self, offers: Vec<NewOffer>) -> Result<BatchSave, StoreError> {
        let mut batch = BatchSave::default();
        for offer in offers {
            match self.save(offer.clone()).await {
                Ok(saved) => batch.saved.push(saved),
                Err(StoreError::DuplicateKey { .. }) => batch.duplicates.push(offer),
                Err(err) => {
                    warn!(
                        saved_before_failure = batch.saved.len(),
                        error = %err,
                        "batch save aborted"
                    );
                    return Err(err);
                }
            }
        }
        Ok(batch)
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.find_all().await?.len())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryOfferStore {
    state: RwLock<InMemoryState>,
}

#[derive(Debug, Default)]
struct InMemoryState {
    offers: HashMap<OfferId, Offer>,
    ids_by_url: HashMap<String, OfferId>,
}

impl InMemoryOfferStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OfferStore for InMemoryOfferStore {
    async fn find_all(&self) -> Result<Vec<Offer>, StoreError> {
        let state = self.state.read().await;
        Ok(state.offers.values().cloned().collect())
    }

    async fn find_by_id(&self, id: &OfferId) -> Result<Option<Offer>, StoreError> {
        let state = self.state.read().await;
        Ok(state.offers.get(id).cloned())
    }

    async fn exists_by_offer_url(&self, offer_url: &str) -> Result<bool, StoreError> {
        let state = self.state.read().await;
        Ok(state.ids_by_url.contains_key(offer_url))
    }

    async fn save(&self, offer: NewOffer) -> Result<Offer, StoreError> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        match state.ids_by_url.entry(offer.offer_url.clone()) {
            Entry::Occupied(_) => {
                debug!(offer_url = %offer.offer_url, "rejecting duplicate offer");
                Err(StoreError::DuplicateKey {
                    offer_url: offer.offer_url,
                })
            }
            Entry::Vacant(slot) => {
                let id = OfferId::generate();
                slot.insert(id.clone());
                let persisted = offer.into_persisted(id.clone());
                state.offers.insert(id, persisted.clone());
                Ok(persisted)
            }
        }
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.state.read().await.offers.len())
    }
}

#[derive(Debug, Clone)]
pub struct PgOfferStore {
    pool: PgPool,
}

impl PgOfferStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }
}

fn row_to_offer(row: &PgRow) -> Result<Offer, sqlx::Error> {
    let id: String = row.try_get("id")?;
    Ok(Offer {
        id: OfferId::from(id),
        company_name: row.try_get("company_name")?,
        position: row.try_get("position")?,
        salary: row.try_get("salary")?,
        offer_url: row.try_get("offer_url")?,
    })
}

fn map_insert_error(err: sqlx::Error, offer_url: &str) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        let on_url = db_err
            .constraint()
            .map_or(true, |name| name == OFFER_URL_CONSTRAINT);
        if db_err.is_unique_violation() && on_url {
            return StoreError::DuplicateKey {
                offer_url: offer_url.to_string(),
            };
        }
    }
    StoreError::Database(err)
}

#[async_trait]
impl OfferStore for PgOfferStore {
    async fn find_all(&self) -> Result<Vec<Offer>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, company_name, position, salary, offer_url
              FROM offers
             ORDER BY created_at, id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        let offers = rows
            .iter()
            .map(row_to_offer)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(offers)
    }

    async fn find_by_id(&self, id: &OfferId) -> Result<Option<Offer>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, company_name, position, salary, offer_url
              FROM offers
             WHERE id = $1
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(row_to_offer).transpose()?)
    }

    async fn exists_by_offer_url(&self, offer_url: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT EXISTS (SELECT 1 FROM offers WHERE offer_url = $1)")
            .bind(offer_url)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<bool, _>(0)?)
    }

    async fn save(&self, offer: NewOffer) -> Result<Offer, StoreError> {
        let id = OfferId::generate();
        let inserted = sqlx::query(
            r#"
            INSERT INTO offers (id, company_name, position, salary, offer_url)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(id.as_str())
        .bind(&offer.company_name)
        .bind(&offer.position)
        .bind(&offer.salary)
        .bind(&offer.offer_url)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok(offer.into_persisted(id)),
            Err(err) => {
                let mapped = map_insert_error(err, &offer.offer_url);
                if mapped.is_duplicate_key() {
                    debug!(offer_url = %offer.offer_url, "unique constraint rejected offer");
                }
                Err(mapped)
            }
        }
    }

    async fn count(&self) -> Result<usize, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) FROM offers")
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.try_get(0)?;
        Ok(usize::try_from(count).unwrap_or_default())
    }
}

/// Proof that a cache miss was observed at a given cache generation.
///
/// A `put` made with a ticket older than the latest `invalidate` is dropped,
/// so a slow read can never re-populate the cache with a pre-write snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTicket(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    Hit(Vec<Offer>),
    Miss(CacheTicket),
}

/// Read-through cache for the full offer list.
///
/// Every write path that changes the persisted set must call `invalidate`.
#[async_trait]
pub trait OfferCache: Send + Sync {
    async fn get(&self) -> CacheLookup;

    async fn put(&self, ticket: CacheTicket, offers: Vec<Offer>);

    async fn invalidate(&self);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopOfferCache;

#[async_trait]
impl OfferCache for NoopOfferCache {
    async fn get(&self) -> CacheLookup {
        CacheLookup::Miss(CacheTicket(0))
    }

    async fn put(&self, _ticket: CacheTicket, _offers: Vec<Offer>) {}

    async fn invalidate(&self) {}
}

#[derive(Debug)]
pub struct InMemoryOfferCache {
    ttl: Duration,
    state: RwLock<CacheState>,
}

#[derive(Debug, Default)]
struct CacheState {
    generation: u64,
    entry: Option<CachedOffers>,
}

#[derive(Debug)]
struct CachedOffers {
    offers: Vec<Offer>,
    stored_at: Instant,
}

impl InMemoryOfferCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: RwLock::new(CacheState::default()),
        }
    }
}

#[async_trait]
impl OfferCache for InMemoryOfferCache {
    async fn get(&self) -> CacheLookup {
        let state = self.state.read().await;
        match &state.entry {
            Some(cached) if cached.stored_at.elapsed() < self.ttl => {
                CacheLookup::Hit(cached.offers.clone())
            }
            _ => CacheLookup::Miss(CacheTicket(state.generation)),
        }
    }

    async fn put(&self, ticket: CacheTicket, offers: Vec<Offer>) {
        let mut state = self.state.write().await;
        if ticket.0 != state.generation {
            debug!("dropping stale offer list cache fill");
            return;
        }
        state.entry = Some(CachedOffers {
            offers,
            stored_at: Instant::now(),
        });
    }

    async fn invalidate(&self) {
        let mut state = self.state.write().await;
        state.generation = state.generation.wrapping_add(1);
        state.entry = None;
    }
}
