/// Test doubles shared by the unit tests.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::anchor::{AnchorError, AnchorProvider, SubmittedTx, TxSubmission};
use crate::crypto::hash::Digest;

pub const NETWORK: &str = "scripted";
pub const CHAIN: &str = "test";

/// Provider whose submit outcomes are scripted in advance. Once the script
/// runs out every submit uses `fallback`.
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Result<(), AnchorError>>>,
    fallback: Result<(), AnchorError>,
    confirmed: AtomicBool,
    pub submits: AtomicUsize,
    pub queries: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(script: Vec<Result<(), AnchorError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: Ok(()),
            confirmed: AtomicBool::new(false),
            submits: AtomicUsize::new(0),
            queries: AtomicUsize::new(0),
        }
    }

    pub fn failing(error: AnchorError) -> Self {
        Self {
            fallback: Err(error),
            ..Self::new(Vec::new())
        }
    }

    pub fn set_confirmed(&self, confirmed: bool) {
        self.confirmed.store(confirmed, Ordering::SeqCst);
    }
}

#[async_trait]
impl AnchorProvider for ScriptedProvider {
    fn name(&self) -> &str {
        NETWORK
    }

    fn serves(&self, network: &str, chain: &str) -> bool {
        network == NETWORK && chain == CHAIN
    }

    async fn submit(&self, digest: &Digest) -> Result<TxSubmission, AnchorError> {
        let n = self.submits.fetch_add(1, Ordering::SeqCst);
        let next = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        next?;
        Ok(TxSubmission::single(SubmittedTx {
            network: NETWORK.into(),
            chain: CHAIN.into(),
            tx_id: format!("scripted-{n}-{digest}"),
        }))
    }

    async fn query_confirmation(
        &self,
        _network: &str,
        _chain: &str,
        _tx_id: &str,
    ) -> Result<bool, AnchorError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        Ok(self.confirmed.load(Ordering::SeqCst))
    }
}
