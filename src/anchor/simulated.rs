/// Simulated anchor for development and tests.
///
/// Submissions never leave the process. The synthetic transaction id embeds
/// the submission time, which is all `query_confirmation` needs to decide
/// whether the configured delay has elapsed. No state is kept.
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use super::{not_served, AnchorError, AnchorProvider, SubmittedTx, TxSubmission};
use crate::crypto::hash::Digest;

pub const NETWORK: &str = "simulated";
pub const CHAIN: &str = "devnet";

pub struct SimulatedAnchor {
    confirm_after: Duration,
}

impl SimulatedAnchor {
    pub fn new(confirm_after: Duration) -> Self {
        Self { confirm_after }
    }

    fn tx_id(submitted_ms: i64, digest: &Digest) -> String {
        format!("sim-{submitted_ms}-{digest}")
    }

    fn submitted_ms(tx_id: &str) -> Option<i64> {
        let rest = tx_id.strip_prefix("sim-")?;
        let (ms, digest) = rest.split_once('-')?;
        digest.parse::<Digest>().ok()?;
        ms.parse().ok()
    }
}

#[async_trait]
impl AnchorProvider for SimulatedAnchor {
    fn name(&self) -> &str {
        "simulated"
    }

    fn serves(&self, network: &str, chain: &str) -> bool {
        network == NETWORK && chain == CHAIN
    }

    async fn submit(&self, digest: &Digest) -> Result<TxSubmission, AnchorError> {
        let now_ms = Utc::now().timestamp_millis();
        Ok(TxSubmission::single(SubmittedTx {
            network: NETWORK.to_string(),
            chain: CHAIN.to_string(),
            tx_id: Self::tx_id(now_ms, digest),
        }))
    }

    async fn query_confirmation(
        &self,
        network: &str,
        chain: &str,
        tx_id: &str,
    ) -> Result<bool, AnchorError> {
        if !self.serves(network, chain) {
            return Err(not_served(self.name(), network, chain));
        }

        let submitted_ms = Self::submitted_ms(tx_id)
            .ok_or_else(|| AnchorError::permanent(format!("not a simulated tx id: {tx_id}")))?;
        let elapsed_ms = Utc::now().timestamp_millis().saturating_sub(submitted_ms);
        Ok(elapsed_ms >= self.confirm_after.as_millis() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_submit_then_confirm_after_delay() {
        let anchor = SimulatedAnchor::new(Duration::from_millis(40));
        let digest = Digest::of(b"payload");

        let submission = anchor.submit(&digest).await.unwrap();
        assert_eq!(submission.txs.len(), 1);
        let tx = &submission.txs[0];
        assert_eq!(tx.network, NETWORK);
        assert!(tx.tx_id.ends_with(&digest.to_hex()));

        assert!(!anchor
            .query_confirmation(&tx.network, &tx.chain, &tx.tx_id)
            .await
            .unwrap());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(anchor
            .query_confirmation(&tx.network, &tx.chain, &tx.tx_id)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_foreign_refs_are_permanent_errors() {
        let anchor = SimulatedAnchor::new(Duration::ZERO);
        let err = anchor
            .query_confirmation("bitcoin", "testnet", "abc")
            .await
            .unwrap_err();
        assert!(!err.is_transient());

        let err = anchor
            .query_confirmation(NETWORK, CHAIN, "sim-notanumber-xyz")
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }
}
