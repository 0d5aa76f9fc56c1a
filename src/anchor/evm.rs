/// EVM calldata anchor.
///
/// Writes the 32-byte digest as calldata in a transaction the anchor
/// wallet sends to itself. Works on any EVM chain that speaks standard
/// JSON-RPC: Ethereum mainnet and testnets, Etherlink, and L2s.
///
/// Uses raw JSON-RPC for maximum compatibility; transactions are built and
/// signed locally with alloy.
use std::time::Duration;

use alloy::signers::local::PrivateKeySigner;
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info};

use super::{not_served, AnchorError, AnchorProvider, SubmittedTx, TxSubmission};
use crate::crypto::hash::Digest;
use crate::crypto::sensitive::SecretString;
use crate::error::{KeeperError, Result};

/// Configuration for EVM anchoring.
#[derive(Debug, Clone)]
pub struct EvmConfig {
    /// JSON-RPC endpoint (e.g., "https://node.mainnet.etherlink.com").
    pub rpc_url: String,
    /// Recorded as `ChainTxRef.network` (e.g., "ethereum", "etherlink").
    pub network: String,
    /// Recorded as `ChainTxRef.chain` (e.g., "mainnet", "sepolia").
    pub chain: String,
    /// EIP-155 chain id (1 for Ethereum mainnet, 42793 for Etherlink).
    pub chain_id: u64,
    /// Private key (hex, with or without 0x prefix) for signing.
    pub private_key: SecretString,
    /// Blocks required on top of the inclusion block, inclusive.
    pub confirmations: u64,
    pub gas_limit: u64,
    pub request_timeout: Duration,
}

/// EVM calldata anchor implementation.
pub struct EvmAnchor {
    config: EvmConfig,
    signer: PrivateKeySigner,
    client: Client,
}

/// Simplified JSON-RPC response.
#[derive(Debug, Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

impl JsonRpcError {
    /// Standard JSON-RPC codes for requests the node will never accept.
    fn into_anchor_error(self, method: &str) -> AnchorError {
        let msg = format!("{method} failed: RPC error {}: {}", self.code, self.message);
        match self.code {
            -32700 | -32600 | -32601 | -32602 => AnchorError::Permanent(msg),
            _ => AnchorError::Transient(msg),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TxReceipt {
    block_number: Option<String>,
    status: Option<String>,
}

/// Parse a JSON-RPC hex quantity ("0x1a").
fn parse_quantity(value: &str) -> std::result::Result<u128, AnchorError> {
    let digits = value.trim_start_matches("0x");
    if digits.is_empty() {
        return Ok(0);
    }
    u128::from_str_radix(digits, 16)
        .map_err(|e| AnchorError::permanent(format!("invalid hex quantity {value}: {e}")))
}

impl EvmAnchor {
    /// Validate the signing key and build the HTTP client.
    pub fn new(config: EvmConfig) -> Result<Self> {
        if config.private_key.is_empty() {
            return Err(KeeperError::Config(format!(
                "missing signing key for EVM network {}",
                config.network
            )));
        }

        let signer: PrivateKeySigner = config
            .private_key
            .expose()
            .trim()
            .parse()
            .map_err(|e| KeeperError::Config(format!("invalid EVM private key: {e}")))?;

        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| KeeperError::Config(format!("failed to build HTTP client: {e}")))?;

        info!(
            network = %config.network,
            chain = %config.chain,
            address = %signer.address(),
            "EVM anchor configured"
        );

        Ok(Self {
            config,
            signer,
            client,
        })
    }

    /// Send a JSON-RPC request. `Ok(None)` means the node answered `null`.
    async fn rpc_call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> std::result::Result<Option<T>, AnchorError> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        });

        let resp = self
            .client
            .post(&self.config.rpc_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| AnchorError::from_transport(e, method))?;

        if !resp.status().is_success() {
            return Err(AnchorError::from_status(resp.status(), method));
        }

        let resp: JsonRpcResponse<T> = resp
            .json()
            .await
            .map_err(|e| AnchorError::transient(format!("{method}: unreadable response: {e}")))?;

        if let Some(err) = resp.error {
            return Err(err.into_anchor_error(method));
        }

        Ok(resp.result)
    }

    async fn rpc_quantity(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> std::result::Result<u128, AnchorError> {
        let value: String = self
            .rpc_call(method, params)
            .await?
            .ok_or_else(|| AnchorError::transient(format!("{method}: empty result")))?;
        parse_quantity(&value)
    }

    /// Build, sign, and send a transaction with the digest as calldata.
    async fn send_anchor_tx(&self, digest: &Digest) -> std::result::Result<String, AnchorError> {
        use alloy::consensus::{SignableTransaction, TxEnvelope, TxLegacy};
        use alloy::eips::eip2718::Encodable2718;
        use alloy::primitives::{Bytes, TxKind, U256};
        use alloy::signers::Signer;

        let from_address = self.signer.address();

        let nonce = self
            .rpc_quantity(
                "eth_getTransactionCount",
                serde_json::json!([format!("{from_address}"), "pending"]),
            )
            .await?;
        let nonce = u64::try_from(nonce)
            .map_err(|_| AnchorError::permanent(format!("nonce out of range: {nonce}")))?;

        let gas_price = self
            .rpc_quantity("eth_gasPrice", serde_json::json!([]))
            .await?;

        // Legacy transaction to self with the digest as calldata
        let tx = TxLegacy {
            chain_id: Some(self.config.chain_id),
            nonce,
            gas_price,
            gas_limit: self.config.gas_limit,
            to: TxKind::Call(from_address),
            value: U256::ZERO,
            input: Bytes::copy_from_slice(digest.as_bytes()),
        };

        let sig_hash = tx.signature_hash();
        let sig = self
            .signer
            .sign_hash(&sig_hash)
            .await
            .map_err(|e| AnchorError::permanent(format!("EVM signing failed: {e}")))?;

        let signed = TxEnvelope::Legacy(tx.into_signed(sig));
        let mut raw_tx = Vec::new();
        signed.encode_2718(&mut raw_tx);
        let raw_hex = format!("0x{}", hex::encode(&raw_tx));

        debug!(nonce, gas_price = %gas_price, "Broadcasting EVM anchor transaction");

        self.rpc_call::<String>("eth_sendRawTransaction", serde_json::json!([raw_hex]))
            .await?
            .ok_or_else(|| AnchorError::transient("eth_sendRawTransaction: empty result"))
    }
}

#[async_trait]
impl AnchorProvider for EvmAnchor {
    fn name(&self) -> &str {
        &self.config.network
    }

    fn serves(&self, network: &str, chain: &str) -> bool {
        network == self.config.network && chain == self.config.chain
    }

    async fn submit(&self, digest: &Digest) -> std::result::Result<TxSubmission, AnchorError> {
        let tx_hash = self.send_anchor_tx(digest).await?;

        info!(
            network = %self.config.network,
            chain = %self.config.chain,
            tx_id = %tx_hash,
            "Digest anchored via EVM calldata"
        );

        Ok(TxSubmission::single(SubmittedTx {
            network: self.config.network.clone(),
            chain: self.config.chain.clone(),
            tx_id: tx_hash,
        }))
    }

    async fn query_confirmation(
        &self,
        network: &str,
        chain: &str,
        tx_id: &str,
    ) -> std::result::Result<bool, AnchorError> {
        if !self.serves(network, chain) {
            return Err(not_served(self.name(), network, chain));
        }

        let receipt: Option<TxReceipt> = self
            .rpc_call("eth_getTransactionReceipt", serde_json::json!([tx_id]))
            .await?;

        // No receipt yet: still in the mempool
        let Some(receipt) = receipt else {
            return Ok(false);
        };
        let Some(block_hex) = receipt.block_number else {
            return Ok(false);
        };

        if receipt.status.as_deref() == Some("0x0") {
            return Err(AnchorError::permanent(format!(
                "anchor transaction {tx_id} reverted"
            )));
        }

        if self.config.confirmations <= 1 {
            return Ok(true);
        }

        let included_at = parse_quantity(&block_hex)?;
        let head = self
            .rpc_quantity("eth_blockNumber", serde_json::json!([]))
            .await?;
        Ok(head + 1 >= included_at + u128::from(self.config.confirmations))
    }
}
