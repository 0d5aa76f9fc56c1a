/// Outbox models.
///
/// Row structs map directly to the outbox tables; domain types are built
/// from them with `TryFrom` so an unknown status string surfaces as an error
/// instead of a panic.
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::anchor::SubmittedTx;
use crate::crypto::hash::Digest;
use crate::error::{KeeperError, Result};
use crate::merkle::MerkleProof;

/// Anchoring job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    InProgress,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    /// `done` and `failed` never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = KeeperError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(Self::Queued),
            "in_progress" => Ok(Self::InProgress),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            other => Err(KeeperError::UnknownStatus(other.to_string())),
        }
    }
}

/// A queued piece of anchoring work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceJob {
    pub id: String,
    /// SHA-256 of the evidence payload, 64 lowercase hex characters.
    pub payload_digest: String,
    pub status: JobStatus,
    /// Failed submission attempts so far.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_ms: i64,
    pub updated_ms: i64,
    /// Earliest time the job may be claimed again.
    pub next_attempt_ms: i64,
}

impl EvidenceJob {
    pub fn digest(&self) -> Result<Digest> {
        self.payload_digest.parse()
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct JobRow {
    pub id: String,
    pub payload_digest: String,
    pub status: String,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub created_ms: i64,
    pub updated_ms: i64,
    pub next_attempt_ms: i64,
}

impl TryFrom<JobRow> for EvidenceJob {
    type Error = KeeperError;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(Self {
            status: row.status.parse()?,
            attempts: u32::try_from(row.attempts).unwrap_or(u32::MAX),
            id: row.id,
            payload_digest: row.payload_digest,
            last_error: row.last_error,
            created_ms: row.created_ms,
            updated_ms: row.updated_ms,
            next_attempt_ms: row.next_attempt_ms,
        })
    }
}

pub(crate) fn into_job(row: Option<JobRow>) -> Result<Option<EvidenceJob>> {
    row.map(EvidenceJob::try_from).transpose()
}

/// Input for [`crate::store::JobStore::enqueue`].
#[derive(Debug, Clone)]
pub struct NewEvidenceJob {
    /// Caller-supplied id; a UUIDv7 is generated when absent.
    pub id: Option<String>,
    pub payload_digest: Digest,
}

impl NewEvidenceJob {
    pub fn new(payload_digest: Digest) -> Self {
        Self {
            id: None,
            payload_digest,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub(crate) fn resolve_id(&self) -> String {
        self.id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::now_v7().to_string())
    }
}

/// A transaction recorded for a job on one chain.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct ChainTxRef {
    pub job_id: String,
    pub network: String,
    pub chain: String,
    pub tx_id: String,
    pub confirmed: bool,
    /// Submission time, ms since epoch.
    pub timestamp: i64,
}

/// One member of an anchored Merkle batch.
#[derive(Debug, Clone)]
pub struct BatchMember {
    pub job_id: String,
    pub proof: MerkleProof,
}

/// Everything written when a batch root has been anchored.
#[derive(Debug, Clone)]
pub struct AnchoredBatch {
    pub batch_id: String,
    pub merkle_root: Digest,
    pub created_ms: i64,
    pub anchored_ms: i64,
    pub members: Vec<BatchMember>,
    /// Root transactions; every member gets one ref per entry.
    pub txs: Vec<SubmittedTx>,
}

#[derive(Debug, FromRow)]
pub(crate) struct ProofRow {
    pub job_id: String,
    pub batch_id: String,
    pub merkle_root: String,
    pub leaf_index: i64,
    pub proof_json: String,
}

/// A member's inclusion proof together with its batch root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredProof {
    pub job_id: String,
    pub batch_id: String,
    pub merkle_root: Digest,
    pub leaf_index: usize,
    pub proof: MerkleProof,
}

impl StoredProof {
    pub fn verifies(&self, digest: &Digest) -> bool {
        crate::merkle::verify_inclusion(digest, &self.proof, &self.merkle_root)
    }
}

impl TryFrom<ProofRow> for StoredProof {
    type Error = KeeperError;

    fn try_from(row: ProofRow) -> Result<Self> {
        Ok(Self {
            merkle_root: row.merkle_root.parse()?,
            leaf_index: usize::try_from(row.leaf_index).map_err(|_| {
                KeeperError::MerkleVerification(format!("negative leaf index for {}", row.job_id))
            })?,
            proof: serde_json::from_str(&row.proof_json)?,
            job_id: row.job_id,
            batch_id: row.batch_id,
        })
    }
}
