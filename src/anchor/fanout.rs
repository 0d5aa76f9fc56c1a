/// Multi-chain fan-out anchoring.
///
/// Anchors the same digest to every configured chain independently.
///
/// ```text
/// digest ──┬──▶ Bitcoin OP_RETURN
///          └──▶ EVM calldata
/// ```
///
/// This is NOT cross-chain. Each anchor is independent: if one chain fails,
/// the others still provide the existence proof, so the submission counts
/// as a success when at least one chain accepted it.
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{info, warn};

use super::{not_served, AnchorError, AnchorProvider, ChainFailure, TxSubmission};
use crate::crypto::hash::Digest;
use crate::error::{KeeperError, Result};

pub struct FanOutAnchor {
    providers: Vec<Arc<dyn AnchorProvider>>,
}

impl FanOutAnchor {
    pub fn new(providers: Vec<Arc<dyn AnchorProvider>>) -> Result<Self> {
        if providers.is_empty() {
            return Err(KeeperError::Config(
                "fan-out provider needs at least one chain".into(),
            ));
        }
        Ok(Self { providers })
    }
}

#[async_trait]
impl AnchorProvider for FanOutAnchor {
    fn name(&self) -> &str {
        "fanout"
    }

    fn serves(&self, network: &str, chain: &str) -> bool {
        self.providers.iter().any(|p| p.serves(network, chain))
    }

    async fn submit(&self, digest: &Digest) -> std::result::Result<TxSubmission, AnchorError> {
        let results = join_all(self.providers.iter().map(|p| p.submit(digest))).await;

        let mut txs = Vec::new();
        let mut failures = Vec::new();
        for (provider, result) in self.providers.iter().zip(results) {
            match result {
                Ok(submission) => {
                    info!(chain = provider.name(), "Anchor successful");
                    txs.extend(submission.txs);
                    failures.extend(submission.failures);
                }
                Err(error) => {
                    warn!(chain = provider.name(), error = %error, "Anchor failed");
                    failures.push(ChainFailure {
                        provider: provider.name().to_string(),
                        error,
                    });
                }
            }
        }

        if !txs.is_empty() {
            return Ok(TxSubmission { txs, failures });
        }

        let summary = failures
            .iter()
            .map(|f| format!("{}: {}", f.provider, f.error))
            .collect::<Vec<_>>()
            .join("; ");
        if failures.iter().any(|f| f.error.is_transient()) {
            Err(AnchorError::Transient(format!("all chains failed: {summary}")))
        } else {
            Err(AnchorError::Permanent(format!("all chains failed: {summary}")))
        }
    }

    async fn query_confirmation(
        &self,
        network: &str,
        chain: &str,
        tx_id: &str,
    ) -> std::result::Result<bool, AnchorError> {
        match self.providers.iter().find(|p| p.serves(network, chain)) {
            Some(provider) => provider.query_confirmation(network, chain, tx_id).await,
            None => Err(not_served(self.name(), network, chain)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchor::SubmittedTx;

    /// Child provider with a scripted submit outcome.
    struct Scripted {
        name: &'static str,
        outcome: std::result::Result<(), AnchorError>,
    }

    #[async_trait]
    impl AnchorProvider for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        fn serves(&self, network: &str, _chain: &str) -> bool {
            network == self.name
        }

        async fn submit(&self, digest: &Digest) -> std::result::Result<TxSubmission, AnchorError> {
            self.outcome.clone()?;
            Ok(TxSubmission::single(SubmittedTx {
                network: self.name.to_string(),
                chain: "test".into(),
                tx_id: format!("{}-{}", self.name, digest),
            }))
        }

        async fn query_confirmation(
            &self,
            _network: &str,
            _chain: &str,
            tx_id: &str,
        ) -> std::result::Result<bool, AnchorError> {
            Ok(tx_id.starts_with(self.name))
        }
    }

    fn child(
        name: &'static str,
        outcome: std::result::Result<(), AnchorError>,
    ) -> Arc<dyn AnchorProvider> {
        Arc::new(Scripted { name, outcome })
    }

    #[test]
    fn test_empty_fanout_rejected() {
        assert!(FanOutAnchor::new(Vec::new()).is_err());
    }

    #[tokio::test]
    async fn test_partial_success_reports_failures() {
        let fanout = FanOutAnchor::new(vec![
            child("alpha", Ok(())),
            child("beta", Err(AnchorError::transient("rpc down"))),
        ])
        .unwrap();

        let submission = fanout.submit(&Digest::of(b"d")).await.unwrap();
        assert_eq!(submission.txs.len(), 1);
        assert_eq!(submission.txs[0].network, "alpha");
        assert_eq!(submission.failures.len(), 1);
        assert_eq!(submission.failures[0].provider, "beta");
    }

    #[tokio::test]
    async fn test_all_failed_classification() {
        let transient = FanOutAnchor::new(vec![
            child("alpha", Err(AnchorError::permanent("bad key"))),
            child("beta", Err(AnchorError::transient("timeout"))),
        ])
        .unwrap();
        assert!(transient.submit(&Digest::of(b"d")).await.unwrap_err().is_transient());

        let permanent = FanOutAnchor::new(vec![
            child("alpha", Err(AnchorError::permanent("bad key"))),
            child("beta", Err(AnchorError::permanent("rejected"))),
        ])
        .unwrap();
        assert!(!permanent.submit(&Digest::of(b"d")).await.unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn test_queries_route_by_network() {
        let fanout =
            FanOutAnchor::new(vec![child("alpha", Ok(())), child("beta", Ok(()))]).unwrap();

        assert!(fanout.serves("beta", "test"));
        assert!(fanout.query_confirmation("beta", "test", "beta-1").await.unwrap());
        assert!(!fanout.query_confirmation("alpha", "test", "beta-1").await.unwrap());
        assert!(fanout
            .query_confirmation("gamma", "test", "x")
            .await
            .is_err());
    }
}
