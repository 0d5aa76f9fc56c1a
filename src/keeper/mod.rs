/// The keeper: two independently timed loops over one shared store.
///
/// ```text
///              ┌──▶ JobProcessor        (claim → submit → record)
/// Keeper::run ─┤
///              └──▶ ConfirmationPoller  (unconfirmed refs → query → confirm)
/// ```
///
/// Mutual exclusion comes from the store's atomic claim, so several keeper
/// processes may share a PostgreSQL store. Shutdown is a `watch` channel
/// observed between ticks: in-flight work always finishes.
pub mod aggregator;
pub mod confirmer;
pub mod processor;

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use crate::anchor::AnchorProvider;
use crate::backoff::BackoffPolicy;
use crate::config::KeeperConfig;
use crate::error::Result;
use crate::store::JobStore;
use confirmer::ConfirmationPoller;
use processor::JobProcessor;

pub struct Keeper {
    processor: JobProcessor,
    poller: ConfirmationPoller,
}

impl Keeper {
    /// Wire both loops to the shared handles.
    pub fn new(
        store: Arc<dyn JobStore>,
        provider: Arc<dyn AnchorProvider>,
        config: &KeeperConfig,
    ) -> Self {
        let mut processor =
            JobProcessor::new(Arc::clone(&store), Arc::clone(&provider), config.poll_interval)
                .with_backoff(BackoffPolicy::default())
                .with_stale_claim_timeout(config.stale_claim_timeout);
        if config.batch.enabled {
            processor = processor.with_batching(config.batch.clone());
        }

        let poller = ConfirmationPoller::new(store, provider, config.confirm_interval);
        Self { processor, poller }
    }

    pub fn from_parts(processor: JobProcessor, poller: ConfirmationPoller) -> Self {
        Self { processor, poller }
    }

    /// Run both loops until `shutdown` turns true and both have returned.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let processor = tokio::spawn(self.processor.run(shutdown.clone()));
        let poller = tokio::spawn(self.poller.run(shutdown));

        let (processed, polled) = tokio::join!(processor, poller);
        processed?;
        polled?;

        info!("Keeper stopped");
        Ok(())
    }
}
