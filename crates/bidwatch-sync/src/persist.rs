//! Transactional persistence of bids, vendor rows and their links.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use bidwatch_core::{NormalizedBid, VendorLink, VendorRecord};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder, Transaction};
use thiserror::Error;
use tracing::{info, warn};

/// Rows per INSERT statement, well under Postgres' bind parameter limit.
const INSERT_CHUNK: usize = 1000;

/// Links handed to one `insert_links` call; the cross product is never materialized whole.
pub const LINK_CHUNK: usize = INSERT_CHUNK * 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertPhase {
    Bids,
    Vendors,
    Links,
}

impl fmt::Display for InsertPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InsertPhase::Bids => "bids",
            InsertPhase::Vendors => "vendors",
            InsertPhase::Links => "vendor_bids",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("{phase} insert produced no rows")]
    EmptyPhase { phase: InsertPhase },
    #[error("{phase} insert failed: {source}")]
    Database {
        phase: InsertPhase,
        #[source]
        source: sqlx::Error,
    },
    #[error("transaction {action} failed: {source}")]
    Transaction {
        action: &'static str,
        #[source]
        source: sqlx::Error,
    },
}

impl PersistenceError {
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, PersistenceError::EmptyPhase { .. })
    }
}

/// How vendor rows are associated with bids in the link table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LinkStrategy {
    /// Every bid of the run linked to every vendor row of the run.
    #[default]
    CrossProduct,
    /// Each vendor row linked only to the bid it was extracted from.
    PerBid,
}

impl FromStr for LinkStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "cross-product" => Ok(LinkStrategy::CrossProduct),
            "per-bid" => Ok(LinkStrategy::PerBid),
            other => Err(format!("unknown link strategy {other:?}")),
        }
    }
}

/// Lazily yields the links for a run. `vendor_ids[i]` is the generated id of `vendors[i]`.
pub fn build_links<'a>(
    strategy: LinkStrategy,
    bid_ids: &'a [i64],
    vendors: &'a [VendorRecord],
    vendor_ids: &'a [i64],
) -> Box<dyn Iterator<Item = VendorLink> + Send + 'a> {
    match strategy {
        LinkStrategy::CrossProduct => Box::new(bid_ids.iter().flat_map(move |&bid_id| {
            vendor_ids.iter().map(move |&vendor_id| VendorLink { bid_id, vendor_id })
        })),
        LinkStrategy::PerBid => Box::new(vendors.iter().zip(vendor_ids).filter_map(
            move |(vendor, &vendor_id)| {
                bid_ids
                    .get(vendor.bid_index)
                    .map(|&bid_id| VendorLink { bid_id, vendor_id })
            },
        )),
    }
}

#[async_trait]
pub trait BidStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn BidTransaction>, PersistenceError>;
}

/// One open write transaction. Nothing is visible to readers until `commit`.
#[async_trait]
pub trait BidTransaction: Send {
    /// Returns generated ids in input order.
    async fn insert_bids(&mut self, bids: &[NormalizedBid]) -> Result<Vec<i64>, PersistenceError>;
    /// Returns generated ids in input order.
    async fn insert_vendors(&mut self, vendors: &[VendorRecord]) -> Result<Vec<i64>, PersistenceError>;
    async fn insert_links(&mut self, links: &[VendorLink]) -> Result<u64, PersistenceError>;
    async fn commit(self: Box<Self>) -> Result<(), PersistenceError>;
    async fn rollback(self: Box<Self>) -> Result<(), PersistenceError>;
}

#[derive(Clone)]
pub struct PgBidStore {
    pool: PgPool,
}

impl PgBidStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new().max_connections(5).connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl BidStore for PgBidStore {
    async fn begin(&self) -> Result<Box<dyn BidTransaction>, PersistenceError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|source| PersistenceError::Transaction { action: "begin", source })?;
        Ok(Box::new(PgBidTransaction { tx }))
    }
}

pub struct PgBidTransaction {
    tx: Transaction<'static, Postgres>,
}

fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[async_trait]
impl BidTransaction for PgBidTransaction {
    async fn insert_bids(&mut self, bids: &[NormalizedBid]) -> Result<Vec<i64>, PersistenceError> {
        let mut ids = Vec::with_capacity(bids.len());
        for chunk in bids.chunks(INSERT_CHUNK) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO bids (bid_name, bid_close_date, year, is_closed, has_winner, investor_name, bid_price, field_category, field_group, vendors) ",
            );
            qb.push_values(chunk, |mut row, bid| {
                row.push_bind(bid.bid_name.as_deref())
                    .push_bind(bid.bid_close_date)
                    .push_bind(bid.year)
                    .push_bind(bid.is_closed)
                    .push_bind(bid.has_winner)
                    .push_bind(bid.investor_name.as_deref())
                    .push_bind(bid.bid_price)
                    .push_bind(bid.field_category.as_str())
                    .push_bind(bid.field_group.as_str())
                    .push_bind(Json(&bid.vendors));
            });
            qb.push(" RETURNING id");

            let chunk_ids: Vec<i64> = qb
                .build_query_scalar()
                .fetch_all(&mut *self.tx)
                .await
                .map_err(|source| PersistenceError::Database {
                    phase: InsertPhase::Bids,
                    source,
                })?;
            ids.extend(chunk_ids);
        }
        Ok(ids)
    }

    async fn insert_vendors(&mut self, vendors: &[VendorRecord]) -> Result<Vec<i64>, PersistenceError> {
        let mut ids = Vec::with_capacity(vendors.len());
        for chunk in vendors.chunks(INSERT_CHUNK) {
            let mut qb: QueryBuilder<Postgres> =
                QueryBuilder::new("INSERT INTO vendors (name, code, feature, quantity, unit_price, total_amount) ");
            qb.push_values(chunk, |mut row, vendor| {
                row.push_bind(vendor.name.as_str())
                    .push_bind(vendor.code.as_str())
                    .push_bind(vendor.feature.as_str())
                    .push_bind(clamp_i64(vendor.quantity))
                    .push_bind(vendor.unit_price)
                    .push_bind(vendor.total_amount);
            });
            qb.push(" RETURNING id");

            let chunk_ids: Vec<i64> = qb
                .build_query_scalar()
                .fetch_all(&mut *self.tx)
                .await
                .map_err(|source| PersistenceError::Database {
                    phase: InsertPhase::Vendors,
                    source,
                })?;
            ids.extend(chunk_ids);
        }
        Ok(ids)
    }

    async fn insert_links(&mut self, links: &[VendorLink]) -> Result<u64, PersistenceError> {
        let mut inserted = 0u64;
        for chunk in links.chunks(LINK_CHUNK) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("INSERT INTO vendor_bids (bid_id, vendor_id) ");
            qb.push_values(chunk, |mut row, link| {
                row.push_bind(link.bid_id).push_bind(link.vendor_id);
            });

            let result = qb
                .build()
                .execute(&mut *self.tx)
                .await
                .map_err(|source| PersistenceError::Database {
                    phase: InsertPhase::Links,
                    source,
                })?;
            inserted += result.rows_affected();
        }
        Ok(inserted)
    }

    async fn commit(self: Box<Self>) -> Result<(), PersistenceError> {
        self.tx
            .commit()
            .await
            .map_err(|source| PersistenceError::Transaction { action: "commit", source })
    }

    async fn rollback(self: Box<Self>) -> Result<(), PersistenceError> {
        self.tx
            .rollback()
            .await
            .map_err(|source| PersistenceError::Transaction { action: "rollback", source })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PersistOutcome {
    pub bid_ids: Vec<i64>,
    pub vendor_ids: Vec<i64>,
    pub links: u64,
}

/// Writes a run's rows in one transaction; any empty phase rolls everything back.
pub struct PersistenceCoordinator<'a> {
    store: &'a dyn BidStore,
    strategy: LinkStrategy,
    link_chunk: usize,
}

impl<'a> PersistenceCoordinator<'a> {
    pub fn new(store: &'a dyn BidStore, strategy: LinkStrategy) -> Self {
        Self {
            store,
            strategy,
            link_chunk: LINK_CHUNK,
        }
    }

    pub fn with_link_chunk(mut self, link_chunk: usize) -> Self {
        self.link_chunk = link_chunk.max(1);
        self
    }

    pub async fn persist(
        &self,
        bids: &[NormalizedBid],
        vendors: &[VendorRecord],
    ) -> Result<PersistOutcome, PersistenceError> {
        let mut tx = self.store.begin().await?;

        match self.write_phases(tx.as_mut(), bids, vendors).await {
            Ok(outcome) => {
                tx.commit().await?;
                info!(
                    bids = outcome.bid_ids.len(),
                    vendors = outcome.vendor_ids.len(),
                    links = outcome.links,
                    "persisted run"
                );
                Ok(outcome)
            }
            Err(err) => {
                warn!(error = %err, "persistence failed, rolling back");
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "rollback failed");
                }
                Err(err)
            }
        }
    }

    async fn write_phases(
        &self,
        tx: &mut dyn BidTransaction,
        bids: &[NormalizedBid],
        vendors: &[VendorRecord],
    ) -> Result<PersistOutcome, PersistenceError> {
        let bid_ids = if bids.is_empty() { Vec::new() } else { tx.insert_bids(bids).await? };
        if bid_ids.is_empty() {
            return Err(PersistenceError::EmptyPhase { phase: InsertPhase::Bids });
        }

        let vendor_ids = if vendors.is_empty() {
            Vec::new()
        } else {
            tx.insert_vendors(vendors).await?
        };
        if vendor_ids.is_empty() {
            return Err(PersistenceError::EmptyPhase {
                phase: InsertPhase::Vendors,
            });
        }

        let mut links = build_links(self.strategy, &bid_ids, vendors, &vendor_ids);
        let mut inserted = 0;
        loop {
            let chunk: Vec<VendorLink> = links.by_ref().take(self.link_chunk).collect();
            if chunk.is_empty() {
                break;
            }
            inserted += tx.insert_links(&chunk).await?;
        }
        drop(links);
        if inserted == 0 {
            return Err(PersistenceError::EmptyPhase { phase: InsertPhase::Links });
        }

        Ok(PersistOutcome {
            bid_ids,
            vendor_ids,
            links: inserted,
        })
    }
}
