//! EVM chain client.
//!
//! Speaks plain JSON-RPC over HTTP to the chain's node. Only the handful
//! of methods the bridge needs are wrapped; responses are decoded into the
//! shared [`Transfer`] shape at this boundary so everything above it is
//! chain-family agnostic.

pub mod decoder;

use std::str::FromStr as _;
use std::time::Duration;

use alloy_primitives::{keccak256, U256};
use serde::Deserialize;
use url::Url;

use crate::error::ClientError;
use crate::types::{Address, BlockNumber, Transfer, TxHash, NATIVE_TOKEN};

use decoder::DecodeError;

/// Decimals of the native token on every EVM chain we support.
const NATIVE_DECIMALS: u8 = 18;

/// Per-request timeout for node RPC calls.
const RPC_TIMEOUT: Duration = Duration::from_secs(15);

/// An EVM JSON-RPC client bound to a single chain.
#[derive(Debug, Clone)]
pub struct EvmClient {
    http: reqwest::Client,
    rpc_url: Url,
    chain_symbol: String,
    chain_id: u64,
    finalize_block_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<serde_json::Value>,
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcBlock {
    transactions: Vec<RpcTransaction>,
}

#[derive(Debug, Clone, Deserialize)]
struct RpcTransaction {
    hash: String,
    to: Option<String>,
    value: String,
    input: String,
    #[serde(rename = "blockNumber")]
    block_number: Option<String>,
}

/// A transaction receipt, reduced to the part we act on.
#[derive(Debug, Clone, Deserialize)]
pub struct Receipt {
    /// `0x1` on success.
    pub status: String,
}

impl Receipt {
    /// Whether the transaction executed successfully.
    pub fn is_success(&self) -> bool {
        self.status == "0x1"
    }
}

impl EvmClient {
    /// Create a client for the given chain.
    pub fn new(
        chain_symbol: impl Into<String>,
        rpc_url: Url,
        chain_id: u64,
        finalize_block_count: Option<u64>,
    ) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(RPC_TIMEOUT)
            .build()
            .map_err(|error| ClientError::Connection(error.to_string()))?;

        Ok(Self {
            http,
            rpc_url,
            chain_symbol: chain_symbol.into(),
            chain_id,
            finalize_block_count,
        })
    }

    /// The chain id used in withdraw hashes and transaction signing.
    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn rpc(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, ClientError> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
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

        let payload: RpcResponse = response
            .json()
            .await
            .map_err(|error| ClientError::BadResponse(error.to_string()))?;

        if let Some(error) = payload.error {
            return Err(ClientError::BadResponse(format!(
                "{} (code {})",
                error.message, error.code
            )));
        }

        payload
            .result
            .ok_or_else(|| ClientError::BadResponse(format!("{method}: missing result")))
    }

    /// Like [`Self::rpc`] but treats a JSON `null` result as absent.
    async fn rpc_optional(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<Option<serde_json::Value>, ClientError> {
        let result = self.rpc(method, params).await?;
        Ok((!result.is_null()).then_some(result))
    }

    /// Number of pending-inclusive transactions sent from `address`.
    pub async fn transaction_count(&self, address: &str) -> Result<u64, ClientError> {
        let result = self
            .rpc("eth_getTransactionCount", serde_json::json!([address, "pending"]))
            .await?;
        parse_quantity(&result)
    }

    /// Current gas price in wei.
    pub async fn gas_price(&self) -> Result<u128, ClientError> {
        let result = self.rpc("eth_gasPrice", serde_json::json!([])).await?;
        Ok(parse_u256(&result)?.to::<u128>())
    }

    /// Estimate the gas needed for a call from `from` to `to` with `data`.
    pub async fn estimate_gas(
        &self,
        from: &str,
        to: &str,
        data: &str,
    ) -> Result<u64, ClientError> {
        let result = self
            .rpc(
                "eth_estimateGas",
                serde_json::json!([{"from": from, "to": to, "data": data}]),
            )
            .await?;
        parse_quantity(&result)
    }

    /// The deployed bytecode at `address`, `0x` when it is not a contract.
    pub async fn get_code(&self, address: &str) -> Result<String, ClientError> {
        let result = self
            .rpc("eth_getCode", serde_json::json!([address, "latest"]))
            .await?;
        result
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| ClientError::BadResponse("eth_getCode: non-string result".into()))
    }

    /// Execute a read-only call against `to` and return the raw result.
    pub async fn call(&self, to: &str, data: &str) -> Result<String, ClientError> {
        let result = self
            .rpc("eth_call", serde_json::json!([{"to": to, "data": data}, "latest"]))
            .await?;
        result
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| ClientError::BadResponse("eth_call: non-string result".into()))
    }

    /// Fetch the receipt of a transaction, if it has been mined.
    pub async fn receipt(&self, tx_hash: &str) -> Result<Option<Receipt>, ClientError> {
        let result = self
            .rpc_optional("eth_getTransactionReceipt", serde_json::json!([tx_hash]))
            .await?;

        result
            .map(|value| {
                serde_json::from_value(value)
                    .map_err(|error| ClientError::BadResponse(error.to_string()))
            })
            .transpose()
    }

    fn parse_transfer(&self, tx: &RpcTransaction) -> Result<Option<Transfer>, ClientError> {
        // Contract creations have no destination and cannot be deposits.
        let Some(tx_to) = tx.to.as_deref() else {
            return Ok(None);
        };

        let block_number = tx
            .block_number
            .as_deref()
            .map(parse_quantity_str)
            .transpose()?
            .ok_or_else(|| ClientError::TransferNotValid("transaction is not mined".into()))?;

        let input = tx.input.trim_start_matches("0x");
        if input.is_empty() {
            // Native transfer straight to the destination address.
            return Ok(Some(Transfer {
                tx_hash: tx.hash.clone(),
                value: parse_u256_str(&tx.value)?,
                chain_symbol: self.chain_symbol.clone(),
                token: NATIVE_TOKEN.to_owned(),
                to: checksum_address(tx_to)?,
                block_number,
                vout: None,
            }));
        }

        let calldata = hex::decode(input)
            .map_err(|error| ClientError::TransferNotValid(error.to_string()))?;

        match decoder::decode_transfer_input(&calldata) {
            Ok(decoded) => Ok(Some(Transfer {
                tx_hash: tx.hash.clone(),
                value: decoded.value,
                chain_symbol: self.chain_symbol.clone(),
                token: checksum_address(tx_to)?,
                to: decoded.to.to_checksum(None),
                block_number,
                vout: None,
            })),
            Err(DecodeError::NotRecognized) => Ok(None),
            Err(DecodeError::Invalid(reason)) => Err(ClientError::TransferNotValid(reason)),
        }
    }
}

impl crate::ChainClient for EvmClient {
    fn chain_symbol(&self) -> &str {
        &self.chain_symbol
    }

    async fn latest_block(&self) -> Result<BlockNumber, ClientError> {
        let result = self.rpc("eth_blockNumber", serde_json::json!([])).await?;
        parse_quantity(&result)
    }

    async fn finalized_block(&self) -> Result<BlockNumber, ClientError> {
        match self.finalize_block_count {
            Some(count) => {
                let latest = self.latest_block().await?;
                Ok(latest.saturating_sub(count))
            }
            None => {
                let result = self
                    .rpc("eth_getBlockByNumber", serde_json::json!(["finalized", false]))
                    .await?;
                let number = result
                    .get("number")
                    .ok_or_else(|| ClientError::BadResponse("finalized block: no number".into()))?;
                parse_quantity(number)
            }
        }
    }

    async fn block_tx_hashes(&self, number: BlockNumber) -> Result<Vec<TxHash>, ClientError> {
        let tag = format!("0x{number:x}");
        let result = self
            .rpc_optional("eth_getBlockByNumber", serde_json::json!([tag, false]))
            .await?
            .ok_or_else(|| ClientError::NotFound(format!("block {number}")))?;

        let hashes: Vec<String> = serde_json::from_value(
            result
                .get("transactions")
                .cloned()
                .unwrap_or(serde_json::Value::Array(Vec::new())),
        )
        .map_err(|error| ClientError::BadResponse(error.to_string()))?;

        Ok(hashes)
    }

    async fn extract_transfers(&self, number: BlockNumber) -> Result<Vec<Transfer>, ClientError> {
        tracing::debug!(block = number, chain = %self.chain_symbol, "extracting transfers");
        let tag = format!("0x{number:x}");
        let result = self
            .rpc_optional("eth_getBlockByNumber", serde_json::json!([tag, true]))
            .await?
            .ok_or_else(|| ClientError::NotFound(format!("block {number}")))?;

        let block: RpcBlock = serde_json::from_value(result)
            .map_err(|error| ClientError::BadResponse(error.to_string()))?;

        let mut transfers = Vec::new();
        for tx in &block.transactions {
            match self.parse_transfer(tx) {
                Ok(Some(transfer)) => transfers.push(transfer),
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(tx_hash = %tx.hash, %error, "skipping undecodable transaction");
                }
            }
        }
        Ok(transfers)
    }

    async fn transfers_by_tx_hash(&self, tx_hash: &str) -> Result<Vec<Transfer>, ClientError> {
        let result = self
            .rpc_optional("eth_getTransactionByHash", serde_json::json!([tx_hash]))
            .await?
            .ok_or_else(|| ClientError::NotFound(format!("transaction {tx_hash}")))?;

        let tx: RpcTransaction = serde_json::from_value(result)
            .map_err(|error| ClientError::BadResponse(error.to_string()))?;

        match self.parse_transfer(&tx)? {
            Some(transfer) => Ok(vec![transfer]),
            None => Err(ClientError::TransferNotValid(format!(
                "transaction {tx_hash} is not a transfer"
            ))),
        }
    }

    async fn is_successful(&self, tx_hash: &str) -> Result<bool, ClientError> {
        Ok(self
            .receipt(tx_hash)
            .await?
            .is_some_and(|receipt| receipt.is_success()))
    }

    async fn token_decimals(&self, token: &str) -> Result<u8, ClientError> {
        if token.eq_ignore_ascii_case(NATIVE_TOKEN) {
            return Ok(NATIVE_DECIMALS);
        }

        // IERC20.decimals() selector.
        let result = self.call(token, "0x313ce567").await?;
        let decimals = parse_u256_str(&result)?;
        u8::try_from(decimals.to::<u64>())
            .map_err(|_| ClientError::BadResponse(format!("{token}: decimals out of range")))
    }

    async fn send_raw(&self, tx_hex: &str) -> Result<TxHash, ClientError> {
        let result = self
            .rpc("eth_sendRawTransaction", serde_json::json!([tx_hex]))
            .await?;
        result
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| ClientError::BadResponse("sendRawTransaction: non-string result".into()))
    }
}

/// Normalize an address string into its EIP-55 checksummed form.
pub fn checksum_address(address: &str) -> Result<Address, ClientError> {
    alloy_primitives::Address::from_str(address)
        .map(|parsed| parsed.to_checksum(None))
        .map_err(|error| ClientError::TransferNotValid(format!("{address}: {error}")))
}

/// Deterministic CREATE2 deposit address for a user: the address the
/// factory deploys to with `salt = user_id` as 32 big-endian bytes.
pub fn derive_deposit_address(
    factory: &str,
    bytecode_hash: &str,
    user_id: u64,
) -> Result<Address, ClientError> {
    let factory = alloy_primitives::Address::from_str(factory)
        .map_err(|error| ClientError::BadResponse(format!("factory address: {error}")))?;
    let code_hash = hex::decode(bytecode_hash.trim_start_matches("0x"))
        .map_err(|error| ClientError::BadResponse(format!("bytecode hash: {error}")))?;
    if code_hash.len() != 32 {
        return Err(ClientError::BadResponse("bytecode hash: expected 32 bytes".into()));
    }

    let mut preimage = Vec::with_capacity(1 + 20 + 32 + 32);
    preimage.push(0xff);
    preimage.extend_from_slice(factory.as_slice());
    preimage.extend_from_slice(&U256::from(user_id).to_be_bytes::<32>());
    preimage.extend_from_slice(&code_hash);

    let digest = keccak256(&preimage);
    Ok(alloy_primitives::Address::from_slice(&digest[12..]).to_checksum(None))
}

fn parse_quantity(value: &serde_json::Value) -> Result<u64, ClientError> {
    value
        .as_str()
        .ok_or_else(|| ClientError::BadResponse("expected hex quantity".into()))
        .and_then(parse_quantity_str)
}

fn parse_quantity_str(value: &str) -> Result<u64, ClientError> {
    u64::from_str_radix(value.trim_start_matches("0x"), 16)
        .map_err(|error| ClientError::BadResponse(format!("{value}: {error}")))
}

fn parse_u256(value: &serde_json::Value) -> Result<U256, ClientError> {
    value
        .as_str()
        .ok_or_else(|| ClientError::BadResponse("expected hex quantity".into()))
        .and_then(parse_u256_str)
}

fn parse_u256_str(value: &str) -> Result<U256, ClientError> {
    let trimmed = value.trim_start_matches("0x");
    if trimmed.is_empty() {
        return Ok(U256::ZERO);
    }
    U256::from_str_radix(trimmed, 16)
        .map_err(|error| ClientError::BadResponse(format!("{value}: {error}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChainClient as _;

    #[test]
    fn create2_derivation_is_deterministic() {
        let factory = "0x4e59b44847b379578588920cA78FbF26c0B4956C";
        let bytecode_hash =
            "0x21c35dbe1b344a2488cf3321d6ce542f8e9f305544ff09e4993a62319a497c1f";

        let first = derive_deposit_address(factory, bytecode_hash, 7).unwrap();
        let second = derive_deposit_address(factory, bytecode_hash, 7).unwrap();
        let other = derive_deposit_address(factory, bytecode_hash, 8).unwrap();

        assert_eq!(first, second);
        assert_ne!(first, other);
        assert!(first.starts_with("0x"));
        assert_eq!(first.len(), 42);
    }

    #[test]
    fn checksums_addresses() {
        let checksummed = checksum_address("0xfb6916095ca1df60bb79ce92ce3ea74c37c5d359").unwrap();
        assert_eq!(checksummed, "0xfB6916095ca1df60bB79Ce92cE3Ea74c37c5d359");
    }

    #[tokio::test]
    async fn latest_block_parses_hex_quantity() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"jsonrpc":"2.0","id":1,"result":"0x64"}"#)
            .create_async()
            .await;

        let client = EvmClient::new(
            "SEP",
            Url::parse(&server.url()).unwrap(),
            11155111,
            Some(1),
        )
        .unwrap();

        assert_eq!(client.latest_block().await.unwrap(), 100);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn rpc_error_objects_become_bad_response() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32000,"message":"boom"}}"#)
            .create_async()
            .await;

        let client = EvmClient::new(
            "SEP",
            Url::parse(&server.url()).unwrap(),
            11155111,
            Some(1),
        )
        .unwrap();

        let error = client.latest_block().await.unwrap_err();
        assert!(matches!(error, ClientError::BadResponse(_)));
    }
}
