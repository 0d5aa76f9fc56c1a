/// Confirmation poller loop.
///
/// Scans unconfirmed transaction refs and asks the anchor provider whether
/// each transaction reached finality. Refs sharing one on-chain transaction
/// (every member of a Merkle batch) are queried once.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::anchor::AnchorProvider;
use crate::error::Result;
use crate::store::JobStore;

/// Counts from one poller tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfirmReport {
    /// Distinct transactions queried.
    pub checked: usize,
    /// Refs whose flag flipped to confirmed.
    pub confirmed: usize,
    pub errors: usize,
}

struct TxGroup<'a> {
    network: &'a str,
    chain: &'a str,
    tx_id: &'a str,
    job_ids: Vec<&'a str>,
}

pub struct ConfirmationPoller {
    store: Arc<dyn JobStore>,
    provider: Arc<dyn AnchorProvider>,
    interval: Duration,
}

impl ConfirmationPoller {
    pub fn new(
        store: Arc<dyn JobStore>,
        provider: Arc<dyn AnchorProvider>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            provider,
            interval,
        }
    }

    /// Query every unconfirmed transaction once. Provider errors are logged
    /// per transaction and never abort the tick; store errors do.
    pub async fn tick(&self) -> Result<ConfirmReport> {
        let refs = self.store.fetch_unconfirmed_tx_refs().await?;
        let mut report = ConfirmReport::default();
        if refs.is_empty() {
            return Ok(report);
        }

        // Group by transaction, oldest first
        let mut groups: Vec<TxGroup<'_>> = Vec::new();
        let mut index: HashMap<(&str, &str, &str), usize> = HashMap::new();
        for r in &refs {
            let key = (r.network.as_str(), r.chain.as_str(), r.tx_id.as_str());
            match index.get(&key) {
                Some(&i) => groups[i].job_ids.push(&r.job_id),
                None => {
                    index.insert(key, groups.len());
                    groups.push(TxGroup {
                        network: &r.network,
                        chain: &r.chain,
                        tx_id: &r.tx_id,
                        job_ids: vec![&r.job_id],
                    });
                }
            }
        }

        for group in &groups {
            report.checked += 1;
            match self
                .provider
                .query_confirmation(group.network, group.chain, group.tx_id)
                .await
            {
                Ok(true) => {
                    for job_id in &group.job_ids {
                        if self
                            .store
                            .mark_confirmed(job_id, group.network, group.chain)
                            .await?
                        {
                            report.confirmed += 1;
                        }
                    }
                    info!(
                        network = group.network,
                        chain = group.chain,
                        tx_id = group.tx_id,
                        jobs = group.job_ids.len(),
                        "Transaction confirmed"
                    );
                }
                Ok(false) => {
                    debug!(tx_id = group.tx_id, "Transaction not yet final");
                }
                Err(e) => {
                    report.errors += 1;
                    warn!(
                        network = group.network,
                        chain = group.chain,
                        tx_id = group.tx_id,
                        error = %e,
                        "Confirmation query failed"
                    );
                }
            }
        }

        Ok(report)
    }

    /// Run until `shutdown` turns true, ticking every `interval`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "Confirmation poller started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.tick().await {
                Ok(report) if report.checked > 0 => debug!(?report, "Confirmation tick"),
                Ok(_) => {}
                Err(e) => error!(error = %e, "Confirmation tick failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Confirmation poller stopped");
    }
}
