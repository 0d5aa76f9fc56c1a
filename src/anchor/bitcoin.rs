/// Bitcoin OP_RETURN anchor.
///
/// Writes a 32-byte digest as an OP_RETURN output in a Bitcoin transaction.
/// OP_RETURN outputs are provably unspendable and stored by all full nodes.
///
/// Talks to an Esplora-compatible REST API (blockstream.info,
/// mempool.space, or a self-hosted electrs) for UTXOs, broadcasting and
/// transaction status.
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::{Address, Network, PrivateKey, PublicKey};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, info};

use super::{not_served, AnchorError, AnchorProvider, SubmittedTx, TxSubmission};
use crate::crypto::hash::Digest;
use crate::crypto::sensitive::SecretString;
use crate::error::{KeeperError, Result};

/// Recorded as `ChainTxRef.network` for every Bitcoin anchor.
pub const NETWORK: &str = "bitcoin";

/// Outputs below this are non-standard and will not relay.
const DUST_LIMIT_SATS: u64 = 546;

/// Configuration for Bitcoin anchoring.
#[derive(Debug, Clone)]
pub struct BitcoinConfig {
    /// Esplora API base URL, e.g. "https://blockstream.info/testnet/api".
    pub api_url: String,
    /// "mainnet", "testnet", "signet" or "regtest". Recorded as
    /// `ChainTxRef.chain`.
    pub network: String,
    /// Private key in WIF format for signing transactions.
    pub wif: SecretString,
    /// Flat fee paid by every anchor transaction.
    pub fee_sats: u64,
    pub confirmations: u64,
    pub request_timeout: Duration,
}

/// Bitcoin OP_RETURN anchor implementation.
pub struct BitcoinAnchor {
    client: Client,
    config: BitcoinConfig,
    private_key: PrivateKey,
    public_key: PublicKey,
    address: Address,
}

/// UTXO from API response.
#[derive(Debug, Deserialize)]
struct Utxo {
    txid: String,
    vout: u32,
    value: u64,
    status: TxStatus,
}

/// Transaction status from API.
#[derive(Debug, Deserialize)]
struct TxStatus {
    confirmed: bool,
    block_height: Option<u64>,
}

fn parse_network(name: &str) -> Result<Network> {
    match name {
        "mainnet" => Ok(Network::Bitcoin),
        "testnet" => Ok(Network::Testnet),
        "signet" => Ok(Network::Signet),
        "regtest" => Ok(Network::Regtest),
        other => Err(KeeperError::Config(format!(
            "unknown bitcoin network: {other}"
        ))),
    }
}

impl BitcoinAnchor {
    /// Parse the signing key and derive the anchor address.
    pub fn new(config: BitcoinConfig) -> Result<Self> {
        use bitcoin::secp256k1::Secp256k1;

        let network = parse_network(&config.network)?;
        if config.fee_sats == 0 || config.fee_sats > bitcoin::Amount::MAX_MONEY.to_sat() {
            return Err(KeeperError::Config(format!(
                "bitcoin fee out of range: {} sats",
                config.fee_sats
            )));
        }
        if config.wif.is_empty() {
            return Err(KeeperError::Config(
                "missing WIF signing key for bitcoin anchor".into(),
            ));
        }

        let private_key = PrivateKey::from_wif(config.wif.expose().trim())
            .map_err(|e| KeeperError::Config(format!("invalid WIF key: {e}")))?;
        let secp = Secp256k1::new();
        let public_key = PublicKey::from_private_key(&secp, &private_key);
        let address = Address::p2pkh(public_key, network);

        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| KeeperError::Config(format!("failed to build HTTP client: {e}")))?;

        info!(network = %config.network, address = %address, "Bitcoin anchor configured");

        Ok(Self {
            client,
            config,
            private_key,
            public_key,
            address,
        })
    }

    async fn get(&self, path: &str) -> std::result::Result<reqwest::Response, AnchorError> {
        let resp = self
            .client
            .get(format!("{}{}", self.config.api_url, path))
            .send()
            .await
            .map_err(|e| AnchorError::from_transport(e, path))?;
        Ok(resp)
    }

    /// Pick a spendable output, preferring confirmed ones.
    async fn select_utxo(&self) -> std::result::Result<Utxo, AnchorError> {
        let path = format!("/address/{}/utxo", self.address);
        let resp = self.get(&path).await?;
        if !resp.status().is_success() {
            return Err(AnchorError::from_status(resp.status(), "fetch UTXOs"));
        }

        let mut utxos: Vec<Utxo> = resp
            .json()
            .await
            .map_err(|e| AnchorError::transient(format!("failed to parse UTXOs: {e}")))?;

        let min_value = self.config.fee_sats.saturating_add(DUST_LIMIT_SATS);
        utxos.retain(|u| u.value > min_value);
        utxos.sort_by_key(|u| (!u.status.confirmed, std::cmp::Reverse(u.value)));

        // An empty wallet can be refilled; keep the job retrying.
        utxos.into_iter().next().ok_or_else(|| {
            AnchorError::transient(format!(
                "no UTXO above {min_value} sats at {}",
                self.address
            ))
        })
    }

    /// Build and sign a transaction with an OP_RETURN output containing the digest.
    ///
    /// Transaction structure:
    /// - Input: one UTXO from the anchor wallet
    /// - Output 0: OP_RETURN <32-byte digest> (0 sats, unspendable)
    /// - Output 1: change back to the anchor address (input - fee)
    fn build_op_return_tx(
        &self,
        digest: &Digest,
        utxo: &Utxo,
    ) -> std::result::Result<Vec<u8>, AnchorError> {
        use bitcoin::absolute::LockTime;
        use bitcoin::blockdata::opcodes::all::OP_RETURN;
        use bitcoin::blockdata::script::{Builder as ScriptBuilder, ScriptBuf};
        use bitcoin::hashes::Hash;
        use bitcoin::script::PushBytesBuf;
        use bitcoin::secp256k1::{Message, Secp256k1};
        use bitcoin::sighash::SighashCache;
        use bitcoin::transaction::Version;
        use bitcoin::{
            Amount, EcdsaSighashType, OutPoint, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
        };

        let change_amount = utxo.value - self.config.fee_sats;

        let op_return_script = ScriptBuilder::new()
            .push_opcode(OP_RETURN)
            .push_slice(digest.as_bytes())
            .into_script();

        let prev_txid: Txid = utxo
            .txid
            .parse()
            .map_err(|e| AnchorError::permanent(format!("invalid UTXO txid: {e}")))?;

        let script_pubkey = self.address.script_pubkey();
        let mut tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::new(prev_txid, utxo.vout),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::default(),
            }],
            output: vec![
                TxOut {
                    value: Amount::ZERO,
                    script_pubkey: op_return_script,
                },
                TxOut {
                    value: Amount::from_sat(change_amount),
                    script_pubkey: script_pubkey.clone(),
                },
            ],
        };

        // P2PKH signature over the legacy sighash
        let sighash_type = EcdsaSighashType::All;
        let sighash = SighashCache::new(&tx)
            .legacy_signature_hash(0, &script_pubkey, sighash_type.to_u32())
            .map_err(|e| AnchorError::permanent(format!("sighash error: {e}")))?;

        let secp = Secp256k1::new();
        let msg = Message::from_digest(sighash.to_byte_array());
        let sig = secp.sign_ecdsa(&msg, &self.private_key.inner);

        let mut sig_bytes = sig.serialize_der().to_vec();
        sig_bytes.push(sighash_type.to_u32() as u8);

        let sig_push = PushBytesBuf::try_from(sig_bytes)
            .map_err(|e| AnchorError::permanent(format!("signature push error: {e}")))?;
        let pubkey_push = PushBytesBuf::try_from(self.public_key.to_bytes())
            .map_err(|e| AnchorError::permanent(format!("pubkey push error: {e}")))?;

        tx.input[0].script_sig = ScriptBuilder::new()
            .push_slice(&sig_push)
            .push_slice(&pubkey_push)
            .into_script();

        Ok(bitcoin::consensus::serialize(&tx))
    }

    /// Broadcast a raw transaction via the API.
    async fn broadcast_tx(&self, raw_tx: &[u8]) -> std::result::Result<String, AnchorError> {
        let resp = self
            .client
            .post(format!("{}/tx", self.config.api_url))
            .body(hex::encode(raw_tx))
            .send()
            .await
            .map_err(|e| AnchorError::from_transport(e, "broadcast"))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            // Losing a race for the same UTXO resolves itself on the next attempt
            if body.contains("missingorspent") || body.contains("txn-mempool-conflict") {
                return Err(AnchorError::transient(format!(
                    "broadcast conflict: {}",
                    body.trim()
                )));
            }
            return Err(match AnchorError::from_status(status, "broadcast") {
                AnchorError::Permanent(msg) => {
                    AnchorError::Permanent(format!("{msg}: {}", body.trim()))
                }
                transient => transient,
            });
        }

        let txid = resp
            .text()
            .await
            .map_err(|e| AnchorError::transient(format!("failed to read broadcast response: {e}")))?;

        Ok(txid.trim().to_string())
    }

    async fn tip_height(&self) -> std::result::Result<u64, AnchorError> {
        let resp = self.get("/blocks/tip/height").await?;
        if !resp.status().is_success() {
            return Err(AnchorError::from_status(resp.status(), "tip height"));
        }
        let text = resp
            .text()
            .await
            .map_err(|e| AnchorError::transient(format!("failed to read tip height: {e}")))?;
        text.trim()
            .parse()
            .map_err(|e| AnchorError::transient(format!("invalid tip height {text:?}: {e}")))
    }
}

#[async_trait]
impl AnchorProvider for BitcoinAnchor {
    fn name(&self) -> &str {
        NETWORK
    }

    fn serves(&self, network: &str, chain: &str) -> bool {
        network == NETWORK && chain == self.config.network
    }

    async fn submit(&self, digest: &Digest) -> std::result::Result<TxSubmission, AnchorError> {
        let utxo = self.select_utxo().await?;
        debug!(txid = %utxo.txid, vout = utxo.vout, value = utxo.value, "Spending UTXO");

        let raw_tx = self.build_op_return_tx(digest, &utxo)?;
        let txid = self.broadcast_tx(&raw_tx).await?;

        info!(chain = %self.config.network, tx_id = %txid, "Digest anchored via OP_RETURN");

        Ok(TxSubmission::single(SubmittedTx {
            network: NETWORK.to_string(),
            chain: self.config.network.clone(),
            tx_id: txid,
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

        let resp = self.get(&format!("/tx/{tx_id}/status")).await?;
        // Not yet propagated to this API node
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !resp.status().is_success() {
            return Err(AnchorError::from_status(resp.status(), "tx status"));
        }

        let status: TxStatus = resp
            .json()
            .await
            .map_err(|e| AnchorError::transient(format!("failed to parse tx status: {e}")))?;

        if !status.confirmed {
            return Ok(false);
        }
        if self.config.confirmations <= 1 {
            return Ok(true);
        }

        let Some(included_at) = status.block_height else {
            return Ok(false);
        };
        let tip = self.tip_height().await?;
        Ok(tip + 1 >= included_at + self.config.confirmations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::SecretKey;
    use serde_json::json;
    use wiremock::matchers::{method, path, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_wif() -> String {
        let key = SecretKey::from_slice(&[0x11; 32]).unwrap();
        PrivateKey::new(key, Network::Testnet).to_wif()
    }

    fn config(api_url: String) -> BitcoinConfig {
        BitcoinConfig {
            api_url,
            network: "testnet".into(),
            wif: SecretString::new(test_wif()),
            fee_sats: 5_000,
            confirmations: 1,
            request_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_invalid_settings_fail_fast() {
        let mut cfg = config("http://127.0.0.1:1".into());
        cfg.network = "moonnet".into();
        assert!(matches!(BitcoinAnchor::new(cfg), Err(KeeperError::Config(_))));

        let mut cfg = config("http://127.0.0.1:1".into());
        cfg.wif = SecretString::new("garbage");
        assert!(matches!(BitcoinAnchor::new(cfg), Err(KeeperError::Config(_))));

        for fee in [0, u64::MAX] {
            let mut cfg = config("http://127.0.0.1:1".into());
            cfg.fee_sats = fee;
            assert!(matches!(BitcoinAnchor::new(cfg), Err(KeeperError::Config(_))), "{fee}");
        }
    }

    #[tokio::test]
    async fn test_submit_builds_and_broadcasts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/address/.+/utxo$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "txid": "aa".repeat(32), "vout": 0, "value": 1_000,
                  "status": { "confirmed": true, "block_height": 10 } },
                { "txid": "bb".repeat(32), "vout": 1, "value": 50_000,
                  "status": { "confirmed": true, "block_height": 11 } }
            ])))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/tx"))
            .respond_with(ResponseTemplate::new(200).set_body_string("cc".repeat(32)))
            .mount(&server)
            .await;

        let anchor = BitcoinAnchor::new(config(server.uri())).unwrap();
        let submission = anchor.submit(&Digest::of(b"evidence")).await.unwrap();

        let tx = &submission.txs[0];
        assert_eq!(tx.network, "bitcoin");
        assert_eq!(tx.chain, "testnet");
        assert_eq!(tx.tx_id, "cc".repeat(32));
    }

    #[tokio::test]
    async fn test_empty_wallet_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/address/.+/utxo$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let anchor = BitcoinAnchor::new(config(server.uri())).unwrap();
        let err = anchor.submit(&Digest::of(b"x")).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_rejected_broadcast_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/address/.+/utxo$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "txid": "aa".repeat(32), "vout": 0, "value": 50_000,
                  "status": { "confirmed": true, "block_height": 10 } }
            ])))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/tx"))
            .respond_with(ResponseTemplate::new(400).set_body_string("scriptsig-not-pushonly"))
            .mount(&server)
            .await;

        let anchor = BitcoinAnchor::new(config(server.uri())).unwrap();
        let err = anchor.submit(&Digest::of(b"x")).await.unwrap_err();
        assert!(!err.is_transient(), "{err}");
    }

    #[tokio::test]
    async fn test_query_confirmation_states() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tx/confirmed/status"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "confirmed": true, "block_height": 100 })),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/tx/pending/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "confirmed": false })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/tx/flaky/status"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let anchor = BitcoinAnchor::new(config(server.uri())).unwrap();
        assert!(anchor
            .query_confirmation("bitcoin", "testnet", "confirmed")
            .await
            .unwrap());
        assert!(!anchor
            .query_confirmation("bitcoin", "testnet", "pending")
            .await
            .unwrap());
        // Unknown to the API: wiremock answers 404
        assert!(!anchor
            .query_confirmation("bitcoin", "testnet", "missing")
            .await
            .unwrap());
        assert!(anchor
            .query_confirmation("bitcoin", "testnet", "flaky")
            .await
            .unwrap_err()
            .is_transient());
        assert!(!anchor
            .query_confirmation("bitcoin", "mainnet", "confirmed")
            .await
            .unwrap_err()
            .is_transient());
    }

    #[tokio::test]
    async fn test_confirmation_depth_uses_tip_height() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tx/abc/status"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "confirmed": true, "block_height": 100 })),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/blocks/tip/height"))
            .respond_with(ResponseTemplate::new(200).set_body_string("102"))
            .mount(&server)
            .await;

        let mut cfg = config(server.uri());
        cfg.confirmations = 3;
        let anchor = BitcoinAnchor::new(cfg.clone()).unwrap();
        assert!(anchor.query_confirmation("bitcoin", "testnet", "abc").await.unwrap());

        cfg.confirmations = 6;
        let anchor = BitcoinAnchor::new(cfg).unwrap();
        assert!(!anchor.query_confirmation("bitcoin", "testnet", "abc").await.unwrap());
    }
}
