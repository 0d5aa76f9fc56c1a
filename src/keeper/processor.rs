/// Job processor loop.
///
/// Claims the next eligible job, anchors its digest (directly or through
/// the batch aggregator) and records the outcome:
///
/// 1. Claim the oldest eligible job
/// 2. Parse the stored digest; a malformed digest fails the job
/// 3. Submit to the anchor provider
/// 4. Success: record the tx refs and mark done, atomically
/// 5. Transient error: requeue with backoff
/// 6. Permanent error: mark failed
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::aggregator::{BatchAggregator, FlushOutcome};
use crate::anchor::{AnchorError, AnchorProvider};
use crate::backoff::BackoffPolicy;
use crate::config::BatchConfig;
use crate::error::Result;
use crate::store::models::EvidenceJob;
use crate::store::{now_ms, JobStore};

/// How often stale in-progress claims are looked for.
const RECLAIM_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// What a single tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// No eligible job.
    Idle,
    Done { job_id: String },
    Retrying { job_id: String },
    Failed { job_id: String },
    /// Handed to the batch aggregator.
    Batched { job_id: String },
    /// A conditional transition did not apply; someone else moved the job.
    Skipped { job_id: String },
}

pub struct JobProcessor {
    store: Arc<dyn JobStore>,
    provider: Arc<dyn AnchorProvider>,
    backoff: BackoffPolicy,
    poll_interval: Duration,
    stale_claim_timeout: Duration,
    last_reclaim: Option<Instant>,
    aggregator: Option<BatchAggregator>,
}

impl JobProcessor {
    pub fn new(
        store: Arc<dyn JobStore>,
        provider: Arc<dyn AnchorProvider>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            provider,
            backoff: BackoffPolicy::default(),
            poll_interval,
            stale_claim_timeout: Duration::from_secs(600),
            last_reclaim: None,
            aggregator: None,
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_stale_claim_timeout(mut self, timeout: Duration) -> Self {
        self.stale_claim_timeout = timeout;
        self.aggregator = self
            .aggregator
            .map(|aggregator| aggregator.with_stale_claim_timeout(timeout));
        self
    }

    /// Route claimed jobs through a Merkle batch instead of anchoring each.
    pub fn with_batching(mut self, config: BatchConfig) -> Self {
        self.aggregator = Some(
            BatchAggregator::new(
                Arc::clone(&self.store),
                Arc::clone(&self.provider),
                config,
                self.backoff,
            )
            .with_stale_claim_timeout(self.stale_claim_timeout),
        );
        self
    }

    pub fn aggregator(&self) -> Option<&BatchAggregator> {
        self.aggregator.as_ref()
    }

    /// Process at most one job.
    pub async fn tick(&mut self) -> Result<TickOutcome> {
        self.reclaim_if_due().await?;

        if let Some(aggregator) = &mut self.aggregator {
            aggregator.flush_if_expired(Instant::now()).await?;
        }

        let Some(job) = self.store.fetch_next_eligible().await? else {
            return Ok(TickOutcome::Idle);
        };
        debug!(job_id = %job.id, attempts = job.attempts, "Processing job");

        self.process(job).await
    }

    async fn process(&mut self, job: EvidenceJob) -> Result<TickOutcome> {
        let digest = match job.digest() {
            Ok(digest) => digest,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Malformed payload digest");
                return self.fail(&job, &e.to_string()).await;
            }
        };

        if let Some(aggregator) = &mut self.aggregator {
            if let Some(FlushOutcome::Rejected { error, .. }) = aggregator.add(&job, digest).await? {
                warn!(error = %error, "Full batch could not be anchored");
            }
            return Ok(TickOutcome::Batched { job_id: job.id });
        }

        match self.provider.submit(&digest).await {
            Ok(submission) => {
                for failure in &submission.failures {
                    warn!(
                        job_id = %job.id,
                        chain = %failure.provider,
                        error = %failure.error,
                        "Chain failed during fan-out, not retried"
                    );
                }

                if !self
                    .store
                    .complete_with_tx_refs(&job.id, &submission.txs)
                    .await?
                {
                    warn!(job_id = %job.id, "Job left in_progress before completion");
                    return Ok(TickOutcome::Skipped { job_id: job.id });
                }

                for tx in &submission.txs {
                    info!(
                        job_id = %job.id,
                        network = %tx.network,
                        chain = %tx.chain,
                        tx_id = %tx.tx_id,
                        "Digest anchored"
                    );
                }
                Ok(TickOutcome::Done { job_id: job.id })
            }
            Err(AnchorError::Transient(reason)) => {
                let next_attempt_ms = self.backoff.next_attempt_ms(now_ms(), job.attempts);
                warn!(
                    job_id = %job.id,
                    attempts = job.attempts + 1,
                    retry_in_ms = next_attempt_ms - now_ms(),
                    error = %reason,
                    "Transient anchoring failure, will retry"
                );

                if self
                    .store
                    .mark_failed_retry(&job.id, &reason, next_attempt_ms)
                    .await?
                {
                    Ok(TickOutcome::Retrying { job_id: job.id })
                } else {
                    Ok(TickOutcome::Skipped { job_id: job.id })
                }
            }
            Err(AnchorError::Permanent(reason)) => {
                error!(job_id = %job.id, error = %reason, "Permanent anchoring failure");
                self.fail(&job, &reason).await
            }
        }
    }

    async fn fail(&self, job: &EvidenceJob, reason: &str) -> Result<TickOutcome> {
        if self.store.mark_failed_permanent(&job.id, reason).await? {
            Ok(TickOutcome::Failed {
                job_id: job.id.clone(),
            })
        } else {
            Ok(TickOutcome::Skipped {
                job_id: job.id.clone(),
            })
        }
    }

    async fn reclaim_if_due(&mut self) -> Result<()> {
        let due = self
            .last_reclaim
            .is_none_or(|at| at.elapsed() >= RECLAIM_CHECK_INTERVAL);
        if !due {
            return Ok(());
        }
        self.last_reclaim = Some(Instant::now());

        let cutoff = now_ms() - self.stale_claim_timeout.as_millis() as i64;
        let reclaimed = self.store.reclaim_stale(cutoff).await?;
        if reclaimed > 0 {
            warn!(reclaimed, "Returned stale in-progress jobs to the queue");
        }
        Ok(())
    }

    /// Run until `shutdown` turns true. Shutdown is observed between ticks;
    /// an open batch is flushed before returning.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(poll_ms = self.poll_interval.as_millis() as u64, "Job processor started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let outcome = match self.tick().await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(error = %e, "Job processor tick failed");
                    TickOutcome::Idle
                }
            };

            // Keep draining while there is work
            if outcome != TickOutcome::Idle {
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        if let Some(aggregator) = &mut self.aggregator {
            match aggregator.flush().await {
                Ok(Some(outcome)) => info!(?outcome, "Flushed open batch on shutdown"),
                Ok(None) => {}
                Err(e) => error!(error = %e, "Failed to flush open batch on shutdown"),
            }
        }
        info!("Job processor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchor::simulated::{self, SimulatedAnchor};
    use crate::crypto::hash::Digest;
    use crate::keeper::confirmer::ConfirmationPoller;
    use crate::store::models::{JobStatus, NewEvidenceJob};
    use crate::store::sqlite::SqliteStore;
    use crate::testing::ScriptedProvider;

    async fn temp_store() -> (tempfile::TempDir, Arc<dyn JobStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("outbox.sqlite3"))
            .await
            .unwrap();
        store.migrate().await.unwrap();
        (dir, Arc::new(store))
    }

    fn no_wait() -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::ZERO,
            cap: Duration::ZERO,
            max_jitter: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn test_simulated_submit_then_confirm() {
        let (_dir, store) = temp_store().await;
        let digest: Digest = format!("0xdeadbeef{}", "00".repeat(28)).parse().unwrap();
        store
            .enqueue(NewEvidenceJob::new(digest).with_id("ev-1"))
            .await
            .unwrap();

        let provider = Arc::new(SimulatedAnchor::new(Duration::from_millis(50)));
        let mut processor = JobProcessor::new(
            Arc::clone(&store),
            provider.clone(),
            Duration::from_millis(10),
        );

        let outcome = processor.tick().await.unwrap();
        assert_eq!(outcome, TickOutcome::Done { job_id: "ev-1".into() });

        let job = store.get_job("ev-1").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Done);
        let refs = store.tx_refs_for_job("ev-1").await.unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].network, simulated::NETWORK);
        assert!(!refs[0].confirmed);

        let poller = ConfirmationPoller::new(Arc::clone(&store), provider, Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(80)).await;
        let report = poller.tick().await.unwrap();
        assert_eq!(report.confirmed, 1);
        assert!(store.tx_refs_for_job("ev-1").await.unwrap()[0].confirmed);
    }

    #[tokio::test]
    async fn test_three_transient_failures_then_success() {
        let (_dir, store) = temp_store().await;
        store
            .enqueue(NewEvidenceJob::new(Digest::of(b"flaky")).with_id("ev-1"))
            .await
            .unwrap();

        let provider = Arc::new(ScriptedProvider::new(vec![
            Err(AnchorError::transient("timeout")),
            Err(AnchorError::transient("timeout")),
            Err(AnchorError::transient("HTTP 503")),
        ]));
        let mut processor =
            JobProcessor::new(Arc::clone(&store), provider, Duration::from_millis(10))
                .with_backoff(no_wait());

        for _ in 0..3 {
            let outcome = processor.tick().await.unwrap();
            assert_eq!(outcome, TickOutcome::Retrying { job_id: "ev-1".into() });
        }
        let job = store.get_job("ev-1").await.unwrap().unwrap();
        assert_eq!(job.last_error.as_deref(), Some("HTTP 503"));

        assert_eq!(
            processor.tick().await.unwrap(),
            TickOutcome::Done { job_id: "ev-1".into() }
        );
        let job = store.get_job("ev-1").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.attempts, 3);
        assert_eq!(job.last_error, None);
    }

    #[tokio::test]
    async fn test_retry_waits_for_backoff() {
        let (_dir, store) = temp_store().await;
        store
            .enqueue(NewEvidenceJob::new(Digest::of(b"x")).with_id("ev-1"))
            .await
            .unwrap();

        let provider = Arc::new(ScriptedProvider::new(vec![Err(AnchorError::transient("down"))]));
        let mut processor =
            JobProcessor::new(Arc::clone(&store), provider, Duration::from_millis(10));

        processor.tick().await.unwrap();
        let job = store.get_job("ev-1").await.unwrap().unwrap();
        assert!(job.next_attempt_ms >= job.updated_ms + 4_000);
        assert_eq!(processor.tick().await.unwrap(), TickOutcome::Idle);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_terminal() {
        let (_dir, store) = temp_store().await;
        store
            .enqueue(NewEvidenceJob::new(Digest::of(b"x")).with_id("ev-1"))
            .await
            .unwrap();

        let provider = Arc::new(ScriptedProvider::failing(AnchorError::permanent("rejected")));
        let mut processor =
            JobProcessor::new(Arc::clone(&store), provider.clone(), Duration::from_millis(10));

        assert_eq!(
            processor.tick().await.unwrap(),
            TickOutcome::Failed { job_id: "ev-1".into() }
        );
        assert_eq!(processor.tick().await.unwrap(), TickOutcome::Idle);

        let job = store.get_job("ev-1").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.last_error.as_deref(), Some("rejected"));
        assert!(store.tx_refs_for_job("ev-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fanout_partial_success_completes_without_retry() {
        use crate::anchor::fanout::FanOutAnchor;

        let (_dir, store) = temp_store().await;
        store
            .enqueue(NewEvidenceJob::new(Digest::of(b"two chains")).with_id("ev-1"))
            .await
            .unwrap();

        let failing = Arc::new(ScriptedProvider::failing(AnchorError::transient("rpc down")));
        let children: Vec<Arc<dyn AnchorProvider>> = vec![
            Arc::new(SimulatedAnchor::new(Duration::ZERO)),
            failing.clone() as Arc<dyn AnchorProvider>,
        ];
        let fanout = FanOutAnchor::new(children).unwrap();
        let mut processor =
            JobProcessor::new(Arc::clone(&store), Arc::new(fanout), Duration::from_millis(10))
                .with_backoff(no_wait());

        let outcome = processor.tick().await.unwrap();
        assert_eq!(outcome, TickOutcome::Done { job_id: "ev-1".into() });

        let job = store.get_job("ev-1").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.attempts, 0);
        let refs = store.tx_refs_for_job("ev-1").await.unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].network, simulated::NETWORK);

        // The failed chain is not retried
        assert_eq!(processor.tick().await.unwrap(), TickOutcome::Idle);
        assert_eq!(failing.submits.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_malformed_digest_fails_without_submitting() {
        let (dir, store) = temp_store().await;
        let sqlite = SqliteStore::open(&dir.path().join("outbox.sqlite3"))
            .await
            .unwrap();
        // Bypass enqueue validation, as a foreign writer could
        sqlx::query(
            "INSERT INTO outbox_jobs (id, payload_digest, status, attempts, created_ms, updated_ms, next_attempt_ms) VALUES ('bad', 'not-hex', 'queued', 0, 0, 0, 0)",
        )
        .execute(sqlite.pool())
        .await
        .unwrap();

        let provider = Arc::new(ScriptedProvider::new(Vec::new()));
        let mut processor =
            JobProcessor::new(Arc::clone(&store), provider.clone(), Duration::from_millis(10));

        assert_eq!(
            processor.tick().await.unwrap(),
            TickOutcome::Failed { job_id: "bad".into() }
        );
        assert_eq!(
            provider.submits.load(std::sync::atomic::Ordering::SeqCst),
            0
        );
    }

    #[tokio::test]
    async fn test_batched_jobs_flush_on_size() {
        let (_dir, store) = temp_store().await;
        for i in 0..3u8 {
            store
                .enqueue(NewEvidenceJob::new(Digest::of(&[i])).with_id(format!("ev-{i}")))
                .await
                .unwrap();
        }

        let provider = Arc::new(SimulatedAnchor::new(Duration::ZERO));
        let mut processor = JobProcessor::new(Arc::clone(&store), provider, Duration::from_millis(10))
            .with_batching(BatchConfig {
                enabled: true,
                max_size: 3,
                max_age: Duration::from_secs(60),
                min_size: 1,
            });

        for _ in 0..3 {
            assert!(matches!(
                processor.tick().await.unwrap(),
                TickOutcome::Batched { .. }
            ));
        }
        assert_eq!(processor.aggregator().unwrap().stats().batches_anchored, 1);
        for i in 0..3u8 {
            let proof = store.fetch_proof(&format!("ev-{i}")).await.unwrap().unwrap();
            assert!(proof.verifies(&Digest::of(&[i])));
        }
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown_and_flushes_batch() {
        let (_dir, store) = temp_store().await;
        store
            .enqueue(NewEvidenceJob::new(Digest::of(b"lonely")).with_id("ev-1"))
            .await
            .unwrap();

        let provider = Arc::new(SimulatedAnchor::new(Duration::ZERO));
        let processor = JobProcessor::new(Arc::clone(&store), provider, Duration::from_millis(10))
            .with_batching(BatchConfig {
                enabled: true,
                ..BatchConfig::default()
            });

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(processor.run(rx));
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        let job = store.get_job("ev-1").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert!(store.fetch_proof("ev-1").await.unwrap().is_some());
    }
}
