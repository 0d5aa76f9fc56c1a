/// Merkle batch aggregation.
///
/// Collects claimed jobs into one open batch, builds a SHA-256 Merkle tree
/// over their digests and anchors only the root. Every member then gets a
/// ref pointing at the root transaction plus its own inclusion proof.
///
/// ```text
/// digest_0 ─┐
/// digest_1 ─┼──▶ Merkle root ──▶ provider.submit
/// digest_n ─┘
/// ```
///
/// A batch flushes when it reaches `max_size`, when its first member is
/// older than `max_age` (given at least `min_size` members), or
/// unconditionally on shutdown. With a stale-claim timeout set, a batch held
/// back by `min_size` is flushed anyway before its members can be reclaimed.
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::anchor::{AnchorError, AnchorProvider};
use crate::backoff::BackoffPolicy;
use crate::config::BatchConfig;
use crate::crypto::hash::Digest;
use crate::error::Result;
use crate::merkle::MerkleTree;
use crate::store::models::{AnchoredBatch, BatchMember, EvidenceJob};
use crate::store::{now_ms, JobStore};

struct PendingMember {
    job_id: String,
    attempts: u32,
    digest: Digest,
}

struct OpenBatch {
    opened_at: Instant,
    created_ms: i64,
    members: Vec<PendingMember>,
}

/// Counters since the aggregator was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregatorStats {
    pub pending: usize,
    pub batches_anchored: u64,
    pub items_anchored: u64,
    pub batches_failed: u64,
}

/// What a flush did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    Anchored {
        batch_id: String,
        merkle_root: Digest,
        items: usize,
    },
    /// Submission failed; members were requeued or failed.
    Rejected { items: usize, error: AnchorError },
}

pub struct BatchAggregator {
    store: Arc<dyn JobStore>,
    provider: Arc<dyn AnchorProvider>,
    backoff: BackoffPolicy,
    config: BatchConfig,
    /// Age at which a batch flushes even below `min_size`.
    max_hold: Option<Duration>,
    open: Option<OpenBatch>,
    stats: AggregatorStats,
}

impl BatchAggregator {
    pub fn new(
        store: Arc<dyn JobStore>,
        provider: Arc<dyn AnchorProvider>,
        config: BatchConfig,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            store,
            provider,
            backoff,
            config,
            max_hold: None,
            open: None,
            stats: AggregatorStats::default(),
        }
    }

    /// Members stay `in_progress` while they wait, so an under-filled batch
    /// must flush before the store reclaims them. The bound sits halfway
    /// between `max_age` and `timeout`.
    pub fn with_stale_claim_timeout(mut self, timeout: Duration) -> Self {
        let max_age = self.config.max_age;
        self.max_hold = Some(max_age + timeout.saturating_sub(max_age) / 2);
        self
    }

    pub fn pending(&self) -> usize {
        self.open.as_ref().map_or(0, |b| b.members.len())
    }

    pub fn stats(&self) -> AggregatorStats {
        AggregatorStats {
            pending: self.pending(),
            ..self.stats
        }
    }

    /// Add a claimed job. Flushes when the batch becomes full.
    ///
    /// A job already waiting in the open batch (re-claimed after a stale
    /// reclaim) is not added twice.
    pub async fn add(&mut self, job: &EvidenceJob, digest: Digest) -> Result<Option<FlushOutcome>> {
        let batch = self.open.get_or_insert_with(|| OpenBatch {
            opened_at: Instant::now(),
            created_ms: now_ms(),
            members: Vec::new(),
        });

        if batch.members.iter().any(|m| m.job_id == job.id) {
            return Ok(None);
        }
        batch.members.push(PendingMember {
            job_id: job.id.clone(),
            attempts: job.attempts,
            digest,
        });

        if batch.members.len() >= self.config.max_size {
            return self.flush().await;
        }
        Ok(None)
    }

    /// Flush if the open batch has reached `max_age` as of `now`.
    pub async fn flush_if_expired(&mut self, now: Instant) -> Result<Option<FlushOutcome>> {
        let Some(batch) = &self.open else {
            return Ok(None);
        };
        let age = now.saturating_duration_since(batch.opened_at);
        let filled = batch.members.len() >= self.config.min_size;
        let held_too_long = self.max_hold.is_some_and(|hold| age >= hold);

        if age >= self.config.max_age && filled {
            self.flush().await
        } else if held_too_long {
            warn!(
                items = batch.members.len(),
                min_size = self.config.min_size,
                "Flushing under-filled batch before its claims go stale"
            );
            self.flush().await
        } else {
            Ok(None)
        }
    }

    /// Anchor the open batch regardless of size or age.
    pub async fn flush(&mut self) -> Result<Option<FlushOutcome>> {
        let Some(batch) = self.open.take() else {
            return Ok(None);
        };
        if batch.members.is_empty() {
            return Ok(None);
        }

        let digests: Vec<Digest> = batch.members.iter().map(|m| m.digest).collect();
        let tree = MerkleTree::from_digests(&digests);
        let Some(merkle_root) = tree.root() else {
            return Ok(None);
        };
        let items = batch.members.len();

        info!(items, root = %merkle_root, "Anchoring Merkle batch");

        match self.provider.submit(&merkle_root).await {
            Ok(submission) => {
                for failure in &submission.failures {
                    warn!(chain = %failure.provider, error = %failure.error, "Batch root not anchored on chain");
                }

                let mut members = Vec::with_capacity(items);
                for (index, member) in batch.members.into_iter().enumerate() {
                    if let Some(proof) = tree.prove(index) {
                        members.push(BatchMember {
                            job_id: member.job_id,
                            proof,
                        });
                    }
                }

                let anchored = AnchoredBatch {
                    batch_id: Uuid::now_v7().to_string(),
                    merkle_root,
                    created_ms: batch.created_ms,
                    anchored_ms: now_ms(),
                    members,
                    txs: submission.txs,
                };
                // On a store error members stay in_progress until reclaimed
                self.store.persist_anchored_batch(&anchored).await?;

                self.stats.batches_anchored += 1;
                self.stats.items_anchored += items as u64;
                info!(
                    batch_id = %anchored.batch_id,
                    items,
                    root = %merkle_root,
                    "Merkle batch anchored"
                );

                Ok(Some(FlushOutcome::Anchored {
                    batch_id: anchored.batch_id,
                    merkle_root,
                    items,
                }))
            }
            Err(e) => {
                error!(items, error = %e, "Merkle batch submission failed");
                self.stats.batches_failed += 1;

                let reason = e.to_string();
                let now = now_ms();
                for member in &batch.members {
                    if e.is_transient() {
                        let next = self.backoff.next_attempt_ms(now, member.attempts);
                        self.store
                            .mark_failed_retry(&member.job_id, &reason, next)
                            .await?;
                    } else {
                        self.store
                            .mark_failed_permanent(&member.job_id, &reason)
                            .await?;
                    }
                }

                Ok(Some(FlushOutcome::Rejected { items, error: e }))
            }
        }
    }
}
