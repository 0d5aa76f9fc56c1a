/// PostgreSQL outbox.
///
/// Safe for several keeper instances sharing one database: the claim query
/// locks the candidate row with `FOR UPDATE SKIP LOCKED`, so concurrent
/// claimants skip rows another transaction is already taking.
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{debug, info};

use super::models::{
    into_job, AnchoredBatch, ChainTxRef, EvidenceJob, JobRow, NewEvidenceJob, ProofRow,
    StoredProof,
};
use super::{now_ms, JobStore, STALE_CLAIM_REASON};
use crate::anchor::SubmittedTx;
use crate::error::Result;

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect to PostgreSQL. Migrations are run separately.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for PgStore {
    async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations/postgres").run(&self.pool).await?;
        info!("PostgreSQL outbox migrations applied");
        Ok(())
    }

    async fn enqueue(&self, job: NewEvidenceJob) -> Result<EvidenceJob> {
        let now = now_ms();
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            INSERT INTO outbox_jobs (id, payload_digest, status, attempts, created_ms, updated_ms, next_attempt_ms)
            VALUES ($1, $2, 'queued', 0, $3, $3, $3)
            RETURNING *
            "#,
        )
        .bind(job.resolve_id())
        .bind(job.payload_digest.to_hex())
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn get_job(&self, id: &str) -> Result<Option<EvidenceJob>> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM outbox_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        into_job(row)
    }

    async fn fetch_next_eligible(&self) -> Result<Option<EvidenceJob>> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE outbox_jobs
            SET status = 'in_progress', updated_ms = $1
            WHERE id = (
                SELECT id FROM outbox_jobs
                WHERE status = 'queued' AND next_attempt_ms <= $1
                ORDER BY created_ms, id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            AND status = 'queued'
            RETURNING *
            "#,
        )
        .bind(now_ms())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = &row {
            debug!(job_id = %row.id, "Claimed job");
        }
        into_job(row)
    }

    async fn mark_in_progress(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE outbox_jobs SET status = 'in_progress', updated_ms = $2 WHERE id = $1 AND status = 'queued'",
        )
        .bind(id)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_done(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_jobs SET status = 'done', last_error = NULL, updated_ms = $2
            WHERE id = $1 AND status = 'in_progress'
            "#,
        )
        .bind(id)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_failed_permanent(&self, id: &str, reason: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_jobs
            SET status = 'failed', attempts = attempts + 1, last_error = $2, updated_ms = $3
            WHERE id = $1 AND status = 'in_progress'
            "#,
        )
        .bind(id)
        .bind(reason)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_failed_retry(
        &self,
        id: &str,
        reason: &str,
        next_attempt_ms: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_jobs
            SET status = 'queued', attempts = attempts + 1, last_error = $2,
                next_attempt_ms = $3, updated_ms = $4
            WHERE id = $1 AND status = 'in_progress'
            "#,
        )
        .bind(id)
        .bind(reason)
        .bind(next_attempt_ms)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_tx_ref(
        &self,
        job_id: &str,
        network: &str,
        chain: &str,
        tx_id: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO outbox_tx_refs (job_id, network, chain, tx_id, confirmed, timestamp)
            VALUES ($1, $2, $3, $4, FALSE, $5)
            ON CONFLICT (job_id, network, chain) DO NOTHING
            "#,
        )
        .bind(job_id)
        .bind(network)
        .bind(chain)
        .bind(tx_id)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete_with_tx_refs(&self, job_id: &str, txs: &[SubmittedTx]) -> Result<bool> {
        let now = now_ms();
        let mut tx = self.pool.begin().await?;

        let done = sqlx::query(
            r#"
            UPDATE outbox_jobs SET status = 'done', last_error = NULL, updated_ms = $2
            WHERE id = $1 AND status = 'in_progress'
            "#,
        )
        .bind(job_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if done.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(false);
        }

        for submitted in txs {
            sqlx::query(
                r#"
                INSERT INTO outbox_tx_refs (job_id, network, chain, tx_id, confirmed, timestamp)
                VALUES ($1, $2, $3, $4, FALSE, $5)
                ON CONFLICT (job_id, network, chain) DO NOTHING
                "#,
            )
            .bind(job_id)
            .bind(&submitted.network)
            .bind(&submitted.chain)
            .bind(&submitted.tx_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn fetch_unconfirmed_tx_refs(&self) -> Result<Vec<ChainTxRef>> {
        let refs = sqlx::query_as::<_, ChainTxRef>(
            "SELECT * FROM outbox_tx_refs WHERE confirmed = FALSE ORDER BY timestamp, job_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(refs)
    }

    async fn mark_confirmed(&self, job_id: &str, network: &str, chain: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_tx_refs SET confirmed = TRUE
            WHERE job_id = $1 AND network = $2 AND chain = $3 AND confirmed = FALSE
            "#,
        )
        .bind(job_id)
        .bind(network)
        .bind(chain)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn tx_refs_for_job(&self, job_id: &str) -> Result<Vec<ChainTxRef>> {
        let refs = sqlx::query_as::<_, ChainTxRef>(
            "SELECT * FROM outbox_tx_refs WHERE job_id = $1 ORDER BY network, chain",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(refs)
    }

    async fn reclaim_stale(&self, stale_before_ms: i64) -> Result<u64> {
        let now = now_ms();
        let result = sqlx::query(
            r#"
            UPDATE outbox_jobs
            SET status = 'queued', attempts = attempts + 1, last_error = $2,
                next_attempt_ms = $3, updated_ms = $3
            WHERE status = 'in_progress' AND updated_ms < $1
            "#,
        )
        .bind(stale_before_ms)
        .bind(STALE_CLAIM_REASON)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn persist_anchored_batch(&self, batch: &AnchoredBatch) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO merkle_batches (id, merkle_root, item_count, created_ms, anchored_ms)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&batch.batch_id)
        .bind(batch.merkle_root.to_hex())
        .bind(batch.members.len() as i64)
        .bind(batch.created_ms)
        .bind(batch.anchored_ms)
        .execute(&mut *tx)
        .await?;

        for member in &batch.members {
            let done = sqlx::query(
                r#"
                UPDATE outbox_jobs SET status = 'done', last_error = NULL, updated_ms = $2
                WHERE id = $1 AND status = 'in_progress'
                "#,
            )
            .bind(&member.job_id)
            .bind(batch.anchored_ms)
            .execute(&mut *tx)
            .await?;

            if done.rows_affected() != 1 {
                debug!(job_id = %member.job_id, "Batch member no longer in progress, skipped");
                continue;
            }

            sqlx::query(
                r#"
                INSERT INTO merkle_proofs (job_id, batch_id, leaf_index, proof_json)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(&member.job_id)
            .bind(&batch.batch_id)
            .bind(member.proof.leaf_index as i64)
            .bind(serde_json::to_string(&member.proof)?)
            .execute(&mut *tx)
            .await?;

            for submitted in &batch.txs {
                sqlx::query(
                    r#"
                    INSERT INTO outbox_tx_refs (job_id, network, chain, tx_id, confirmed, timestamp)
                    VALUES ($1, $2, $3, $4, FALSE, $5)
                    ON CONFLICT (job_id, network, chain) DO NOTHING
                    "#,
                )
                .bind(&member.job_id)
                .bind(&submitted.network)
                .bind(&submitted.chain)
                .bind(&submitted.tx_id)
                .bind(batch.anchored_ms)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn fetch_proof(&self, job_id: &str) -> Result<Option<StoredProof>> {
        let row = sqlx::query_as::<_, ProofRow>(
            r#"
            SELECT p.job_id, p.batch_id, b.merkle_root, p.leaf_index, p.proof_json
            FROM merkle_proofs p
            JOIN merkle_batches b ON b.id = p.batch_id
            WHERE p.job_id = $1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(StoredProof::try_from).transpose()
    }
}
