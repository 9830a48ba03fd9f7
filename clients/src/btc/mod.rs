//! Bitcoin chain client.
//!
//! Block and transaction data come from a blockbook-style indexer; the
//! chain tip and fee estimates come from a bitcoind node over JSON-RPC.
//! Bitcoin has no finalized tag, so finality is depth-based.

use std::str::FromStr as _;
use std::time::Duration;

use alloy_primitives::U256;
use bitcoin::key::TweakedPublicKey;
use secp256k1::{Scalar, Secp256k1, XOnlyPublicKey};
use serde::Deserialize;
use sha2::{Digest as _, Sha256};
use url::Url;

use crate::error::ClientError;
use crate::types::{Address, BlockNumber, Transfer, TxHash, UserId};

/// Bitcoin's native decimals.
const BTC_DECIMALS: u8 = 8;

/// Per-request timeout for node and indexer calls.
const RPC_TIMEOUT: Duration = Duration::from_secs(15);

/// A Bitcoin client bound to one node and one indexer.
#[derive(Debug, Clone)]
pub struct BtcClient {
    http: reqwest::Client,
    rpc_url: Url,
    indexer_url: Url,
    chain_symbol: String,
    finalize_block_count: u64,
    network: bitcoin::Network,
}

#[derive(Debug, Deserialize)]
struct IndexerBlock {
    height: u64,
    #[serde(default)]
    txs: Vec<IndexerTx>,
}

#[derive(Debug, Deserialize)]
struct IndexerTx {
    txid: String,
    #[serde(rename = "blockHeight", default)]
    block_height: Option<u64>,
    #[serde(default)]
    vout: Vec<IndexerVout>,
}

#[derive(Debug, Deserialize)]
struct IndexerVout {
    #[serde(default)]
    n: u32,
    #[serde(default)]
    value: Option<String>,
    #[serde(rename = "isAddress", default)]
    is_address: bool,
    #[serde(default)]
    addresses: Option<Vec<String>>,
}

impl BtcClient {
    /// Create a client for the configured node and indexer endpoints.
    pub fn new(
        chain_symbol: impl Into<String>,
        rpc_url: Url,
        indexer_url: Url,
        finalize_block_count: u64,
        network: bitcoin::Network,
    ) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(RPC_TIMEOUT)
            .build()
            .map_err(|error| ClientError::Connection(error.to_string()))?;

        Ok(Self {
            http,
            rpc_url,
            indexer_url,
            chain_symbol: chain_symbol.into(),
            finalize_block_count,
            network,
        })
    }

    /// The network addresses are encoded for.
    pub fn network(&self) -> bitcoin::Network {
        self.network
    }

    async fn node_rpc(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, ClientError> {
        let body = serde_json::json!({
            "jsonrpc": "1.0",
            "id": "zexporta",
            "method": method,
            "params": params,
        });

        let response = self
            .http
            .post(self.rpc_url.clone())
            .json(&body)
            .send()
            .await?
            .error_for_status()?;

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|error| ClientError::BadResponse(error.to_string()))?;

        if let Some(error) = payload.get("error").filter(|error| !error.is_null()) {
            return Err(ClientError::BadResponse(format!("{method}: {error}")));
        }

        payload
            .get("result")
            .cloned()
            .ok_or_else(|| ClientError::BadResponse(format!("{method}: missing result")))
    }

    async fn indexer_get(&self, path: &str) -> Result<serde_json::Value, ClientError> {
        let url = self
            .indexer_url
            .join(path)
            .map_err(|error| ClientError::BadResponse(error.to_string()))?;

        let response = self.http.get(url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ClientError::NotFound(path.to_owned()));
        }

        response
            .error_for_status()?
            .json()
            .await
            .map_err(|error| ClientError::BadResponse(error.to_string()))
    }

    async fn fetch_block(&self, number: BlockNumber) -> Result<IndexerBlock, ClientError> {
        let value = self.indexer_get(&format!("api/v2/block/{number}")).await?;
        serde_json::from_value(value).map_err(|error| ClientError::BadResponse(error.to_string()))
    }

    async fn fetch_tx(&self, tx_hash: &str) -> Result<IndexerTx, ClientError> {
        let value = self.indexer_get(&format!("api/v2/tx/{tx_hash}")).await?;
        serde_json::from_value(value).map_err(|error| ClientError::BadResponse(error.to_string()))
    }

    /// The node's current fee estimate, in satoshis per virtual byte.
    pub async fn fee_per_byte(&self) -> Result<u64, ClientError> {
        let result = self
            .node_rpc("estimatesmartfee", serde_json::json!([2]))
            .await?;
        let btc_per_kvb = result
            .get("feerate")
            .and_then(serde_json::Value::as_f64)
            .ok_or_else(|| ClientError::BadResponse("estimatesmartfee: no feerate".into()))?;

        let sat_per_byte = (btc_per_kvb * 100_000_000.0 / 1_000.0).ceil() as u64;
        Ok(sat_per_byte.max(1))
    }

    fn transfers_from_tx(&self, tx: &IndexerTx, block_number: u64) -> Vec<Transfer> {
        tx.vout
            .iter()
            .filter(|output| output.is_address)
            .filter_map(|output| {
                let address = output.addresses.as_ref()?.first()?.clone();
                let sats = output
                    .value
                    .as_deref()
                    .and_then(|value| value.parse::<u64>().ok())?;
                Some(Transfer {
                    tx_hash: tx.txid.clone(),
                    value: U256::from(sats),
                    chain_symbol: self.chain_symbol.clone(),
                    token: address.clone(),
                    to: address,
                    block_number,
                    vout: Some(output.n),
                })
            })
            .collect()
    }
}

impl crate::ChainClient for BtcClient {
    fn chain_symbol(&self) -> &str {
        &self.chain_symbol
    }

    async fn latest_block(&self) -> Result<BlockNumber, ClientError> {
        let result = self
            .node_rpc("getblockchaininfo", serde_json::json!([]))
            .await?;
        result
            .get("blocks")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| ClientError::BadResponse("getblockchaininfo: no blocks".into()))
    }

    async fn finalized_block(&self) -> Result<BlockNumber, ClientError> {
        let latest = self.latest_block().await?;
        Ok(latest.saturating_sub(self.finalize_block_count))
    }

    async fn block_tx_hashes(&self, number: BlockNumber) -> Result<Vec<TxHash>, ClientError> {
        let block = self.fetch_block(number).await?;
        Ok(block.txs.into_iter().map(|tx| tx.txid).collect())
    }

    async fn extract_transfers(&self, number: BlockNumber) -> Result<Vec<Transfer>, ClientError> {
        tracing::debug!(block = number, chain = %self.chain_symbol, "extracting transfers");
        let block = self.fetch_block(number).await?;
        let height = block.height;

        Ok(block
            .txs
            .iter()
            .flat_map(|tx| self.transfers_from_tx(tx, height))
            .collect())
    }

    async fn transfers_by_tx_hash(&self, tx_hash: &str) -> Result<Vec<Transfer>, ClientError> {
        let tx = self.fetch_tx(tx_hash).await?;
        let block_number = tx
            .block_height
            .filter(|height| *height > 0)
            .ok_or_else(|| ClientError::NotFound(format!("transaction {tx_hash} unconfirmed")))?;

        Ok(self.transfers_from_tx(&tx, block_number))
    }

    async fn is_successful(&self, tx_hash: &str) -> Result<bool, ClientError> {
        // Visibility is success on Bitcoin; a dropped transaction is a
        // NotFound from the indexer.
        match self.fetch_tx(tx_hash).await {
            Ok(_) => Ok(true),
            Err(ClientError::NotFound(_)) => Ok(false),
            Err(error) => Err(error),
        }
    }

    async fn token_decimals(&self, _token: &str) -> Result<u8, ClientError> {
        Ok(BTC_DECIMALS)
    }

    async fn send_raw(&self, tx_hex: &str) -> Result<TxHash, ClientError> {
        let value = self.indexer_get(&format!("api/v2/sendtx/{tx_hex}")).await?;
        value
            .get("result")
            .and_then(serde_json::Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| ClientError::BadResponse("sendtx: no result".into()))
    }
}

/// BIP-340 style tagged hash over the key and the user salt.
fn tap_tweak_hash(pubkey_x: &[u8; 32], salt: &[u8]) -> [u8; 32] {
    let tag_digest = Sha256::digest(b"TapTweak");
    let mut hasher = Sha256::new();
    hasher.update(tag_digest);
    hasher.update(tag_digest);
    hasher.update(pubkey_x);
    hasher.update(salt);
    hasher.finalize().into()
}

/// Parse the configured group key: accepts a 32-byte x-only key or a
/// 33-byte compressed key, hex encoded.
pub fn parse_group_key(group_pubkey_hex: &str) -> Result<XOnlyPublicKey, ClientError> {
    let bytes = hex::decode(group_pubkey_hex.trim_start_matches("0x"))
        .map_err(|error| ClientError::BadResponse(format!("group key: {error}")))?;

    let x_only = match bytes.len() {
        32 => &bytes[..],
        33 => &bytes[1..],
        len => {
            return Err(ClientError::BadResponse(format!(
                "group key: expected 32 or 33 bytes, got {len}"
            )))
        }
    };

    XOnlyPublicKey::from_slice(x_only)
        .map_err(|error| ClientError::BadResponse(format!("group key: {error}")))
}

/// Deterministic taproot deposit address for a user: the BIP-341 tweak of
/// the group key with `salt = user_id` as 8 big-endian bytes.
pub fn derive_deposit_address(
    group_key: &XOnlyPublicKey,
    user_id: UserId,
    network: bitcoin::Network,
) -> Result<Address, ClientError> {
    let secp = Secp256k1::verification_only();
    let salt = user_id.to_be_bytes();

    let tweak = tap_tweak_hash(&group_key.serialize(), &salt);
    let scalar = Scalar::from_be_bytes(tweak)
        .map_err(|_| ClientError::BadResponse("tap tweak overflows the curve order".into()))?;

    let (tweaked, _parity) = group_key
        .add_tweak(&secp, &scalar)
        .map_err(|error| ClientError::BadResponse(format!("tap tweak: {error}")))?;

    let output_key = TweakedPublicKey::dangerous_assume_tweaked(tweaked);
    Ok(bitcoin::Address::p2tr_tweaked(output_key, network).to_string())
}

/// The taproot script pubkey of a derived deposit address.
pub fn script_pubkey(address: &str, network: bitcoin::Network) -> Result<bitcoin::ScriptBuf, ClientError> {
    bitcoin::Address::from_str(address)
        .map_err(|error| ClientError::TransferNotValid(format!("{address}: {error}")))?
        .require_network(network)
        .map(|checked| checked.script_pubkey())
        .map_err(|error| ClientError::TransferNotValid(format!("{address}: {error}")))
}
