/// Blockchain anchoring for evidence digests.
///
/// The anchor module provides a pluggable trait for writing 32-byte
/// digests to blockchains and later asking whether those transactions
/// have reached finality. Providers are stateless: everything needed to
/// query a submission is carried in the returned `SubmittedTx`, so one
/// provider instance is shared by both keeper loops and survives restarts.
///
/// Variants:
/// - Simulated: synthetic transaction ids, confirms after a fixed delay
/// - EVM: calldata in a self-addressed transaction (Ethereum, Etherlink)
/// - Bitcoin: OP_RETURN output
/// - Fan-out: the same digest written to every configured chain
///
/// Chains are independent (multi-chain, NOT cross-chain).
pub mod bitcoin;
pub mod evm;
pub mod fanout;
pub mod simulated;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::config::{KeeperConfig, ProviderKind};
use crate::crypto::hash::Digest;
use crate::error::{KeeperError, Result};

/// Failure of a submit or confirmation query.
///
/// The variant decides what the job processor does next: transient errors
/// are retried with backoff, permanent errors terminate the job.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnchorError {
    #[error("transient: {0}")]
    Transient(String),

    #[error("permanent: {0}")]
    Permanent(String),
}

impl AnchorError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Classify an HTTP status returned by a chain endpoint.
    pub fn from_status(status: reqwest::StatusCode, context: &str) -> Self {
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Self::transient(format!("{context}: HTTP {status}"))
        } else {
            Self::permanent(format!("{context}: HTTP {status}"))
        }
    }

    /// Classify a transport-level failure. Malformed requests are the only
    /// reqwest errors that retrying cannot fix.
    pub fn from_transport(err: reqwest::Error, context: &str) -> Self {
        if err.is_builder() {
            Self::permanent(format!("{context}: {err}"))
        } else {
            Self::transient(format!("{context}: {err}"))
        }
    }
}

/// One successful on-chain submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmittedTx {
    /// Chain family or deployment (e.g., "ethereum", "etherlink", "bitcoin").
    pub network: String,
    /// Specific network (e.g., "mainnet", "sepolia", "testnet").
    pub chain: String,
    /// Chain-native transaction identifier.
    pub tx_id: String,
}

/// A failed chain inside a multi-chain submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainFailure {
    pub provider: String,
    pub error: AnchorError,
}

/// Outcome of a successful `submit`: at least one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxSubmission {
    pub txs: Vec<SubmittedTx>,
    /// Chains that failed during a fan-out. Empty for single-chain providers.
    pub failures: Vec<ChainFailure>,
}

impl TxSubmission {
    pub fn single(tx: SubmittedTx) -> Self {
        Self {
            txs: vec![tx],
            failures: Vec::new(),
        }
    }
}

/// Trait for pluggable blockchain anchors.
#[async_trait]
pub trait AnchorProvider: Send + Sync {
    /// Human-readable provider name, used in logs.
    fn name(&self) -> &str;

    /// Whether transaction refs recorded as `(network, chain)` belong to
    /// this provider.
    fn serves(&self, network: &str, chain: &str) -> bool;

    /// Anchor a 32-byte digest.
    async fn submit(&self, digest: &Digest) -> std::result::Result<TxSubmission, AnchorError>;

    /// Whether a previously submitted transaction has reached finality.
    async fn query_confirmation(
        &self,
        network: &str,
        chain: &str,
        tx_id: &str,
    ) -> std::result::Result<bool, AnchorError>;
}

/// Permanent error for a ref that was routed to the wrong provider.
pub(crate) fn not_served(provider: &str, network: &str, chain: &str) -> AnchorError {
    AnchorError::permanent(format!(
        "{provider} does not serve transactions on {network}/{chain}"
    ))
}

/// Build the provider selected by configuration.
///
/// Fails fast on missing signing keys or unusable chain settings, before
/// any loop starts.
pub fn build_provider(config: &KeeperConfig) -> Result<Arc<dyn AnchorProvider>> {
    let provider: Arc<dyn AnchorProvider> = match &config.provider {
        ProviderKind::Simulated => Arc::new(simulated::SimulatedAnchor::new(
            config.simulated_confirm_delay,
        )),
        ProviderKind::Evm => Arc::new(build_evm(config)?),
        ProviderKind::Bitcoin => Arc::new(build_bitcoin(config)?),
        ProviderKind::FanOut(children) => {
            let mut providers: Vec<Arc<dyn AnchorProvider>> = Vec::with_capacity(children.len());
            for child in children {
                match child {
                    ProviderKind::Evm => providers.push(Arc::new(build_evm(config)?)),
                    ProviderKind::Bitcoin => providers.push(Arc::new(build_bitcoin(config)?)),
                    ProviderKind::Simulated => providers.push(Arc::new(
                        simulated::SimulatedAnchor::new(config.simulated_confirm_delay),
                    )),
                    ProviderKind::FanOut(_) => {
                        return Err(KeeperError::Config(
                            "fan-out providers cannot be nested".into(),
                        ))
                    }
                }
            }
            Arc::new(fanout::FanOutAnchor::new(providers)?)
        }
    };

    info!(provider = provider.name(), "Anchor provider ready");
    Ok(provider)
}

fn build_evm(config: &KeeperConfig) -> Result<evm::EvmAnchor> {
    let evm = config
        .evm
        .clone()
        .ok_or_else(|| KeeperError::Config("EVM provider selected but not configured".into()))?;
    evm::EvmAnchor::new(evm)
}

fn build_bitcoin(config: &KeeperConfig) -> Result<bitcoin::BitcoinAnchor> {
    let btc = config.bitcoin.clone().ok_or_else(|| {
        KeeperError::Config("Bitcoin provider selected but not configured".into())
    })?;
    bitcoin::BitcoinAnchor::new(btc)
}
