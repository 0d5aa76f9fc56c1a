/// Durable outbox for anchoring work.
///
/// The store owns every persisted row: queued jobs, the transaction refs
/// produced by successful submissions, and Merkle batches with their
/// per-member proofs. All status changes are conditional updates on the
/// expected source status; the returned `bool` says whether the transition
/// applied, and a transition that does not apply is never an error.
///
/// Backends:
/// - [`postgres::PgStore`]: multi-writer, for multi-instance deployments
/// - [`sqlite::SqliteStore`]: single file, one active writer process
pub mod models;
pub mod postgres;
pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::anchor::SubmittedTx;
use crate::error::{KeeperError, Result};
use models::{AnchoredBatch, ChainTxRef, EvidenceJob, NewEvidenceJob, StoredProof};

/// `last_error` written when a stale claim is returned to the queue.
pub const STALE_CLAIM_REASON: &str = "reclaimed after stale claim";

/// Current wall-clock time in ms since the Unix epoch.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Apply pending schema migrations. Safe to run on every start.
    async fn migrate(&self) -> Result<()>;

    /// Insert a new `queued` job, eligible immediately.
    async fn enqueue(&self, job: NewEvidenceJob) -> Result<EvidenceJob>;

    async fn get_job(&self, id: &str) -> Result<Option<EvidenceJob>>;

    /// Atomically claim the oldest eligible job (FIFO by `created_ms`, then
    /// `id`) and return it already `in_progress`.
    async fn fetch_next_eligible(&self) -> Result<Option<EvidenceJob>>;

    /// `queued -> in_progress` for one specific job.
    async fn mark_in_progress(&self, id: &str) -> Result<bool>;

    /// `in_progress -> done`, clearing `last_error`.
    async fn mark_done(&self, id: &str) -> Result<bool>;

    /// `in_progress -> failed`, counting the attempt.
    async fn mark_failed_permanent(&self, id: &str, reason: &str) -> Result<bool>;

    /// `in_progress -> queued`, counting the attempt and deferring the next
    /// claim until `next_attempt_ms`.
    async fn mark_failed_retry(&self, id: &str, reason: &str, next_attempt_ms: i64)
        -> Result<bool>;

    /// Insert an unconfirmed ref; recording the same identity twice is a no-op.
    async fn record_tx_ref(&self, job_id: &str, network: &str, chain: &str, tx_id: &str)
        -> Result<()>;

    /// Record every ref and mark the job `done` in one transaction. Nothing
    /// is written when the job is no longer `in_progress`.
    async fn complete_with_tx_refs(&self, job_id: &str, txs: &[SubmittedTx]) -> Result<bool>;

    /// All unconfirmed refs, oldest first.
    async fn fetch_unconfirmed_tx_refs(&self) -> Result<Vec<ChainTxRef>>;

    /// Set `confirmed`; `true` only when the flag changed.
    async fn mark_confirmed(&self, job_id: &str, network: &str, chain: &str) -> Result<bool>;

    async fn tx_refs_for_job(&self, job_id: &str) -> Result<Vec<ChainTxRef>>;

    /// Return `in_progress` jobs last touched before `stale_before_ms` to the
    /// queue. Returns how many were reclaimed.
    async fn reclaim_stale(&self, stale_before_ms: i64) -> Result<u64>;

    /// Write the batch, each member's proof and refs, and mark the members
    /// `done`, in one transaction. Members no longer `in_progress` are skipped.
    async fn persist_anchored_batch(&self, batch: &AnchoredBatch) -> Result<()>;

    async fn fetch_proof(&self, job_id: &str) -> Result<Option<StoredProof>>;
}

/// Connect to the store named by `url` and run its migrations.
///
/// `postgres://` and `postgresql://` select [`postgres::PgStore`]; `sqlite:`
/// selects [`sqlite::SqliteStore`].
pub async fn connect(url: &str) -> Result<Arc<dyn JobStore>> {
    let store: Arc<dyn JobStore> = if url.starts_with("postgres://")
        || url.starts_with("postgresql://")
    {
        Arc::new(postgres::PgStore::connect(url).await?)
    } else if url.starts_with("sqlite:") {
        Arc::new(sqlite::SqliteStore::connect(url).await?)
    } else {
        return Err(KeeperError::Config(format!(
            "unsupported database url scheme: {url}"
        )));
    };

    store.migrate().await?;
    Ok(store)
}
