//! EVM transaction submission.
//!
//! Wraps an [`EvmClient`] and a local signing key into the one thing the
//! withdraw and vault-depositor roles need: sign an EIP-1559 call, send
//! it, and wait for its receipt.

use std::str::FromStr as _;
use std::time::Duration;

use alloy_consensus::{SignableTransaction as _, TxEip1559, TxEnvelope};
use alloy_eips::eip2718::Encodable2718 as _;
use alloy_primitives::{Address, TxKind, U256};
use alloy_signer::SignerSync as _;
use alloy_signer_local::PrivateKeySigner;

use clients::evm::{EvmClient, Receipt};
use clients::{ChainClient, ClientError, TxHash};

use crate::error::Error;

/// A signing account bound to one EVM chain.
#[derive(Debug, Clone)]
pub struct EvmSender {
    client: EvmClient,
    signer: PrivateKeySigner,
}

impl EvmSender {
    /// Create a sender from a hex private key.
    pub fn new(client: EvmClient, private_key: &str) -> Result<Self, Error> {
        let signer = PrivateKeySigner::from_str(private_key)
            .map_err(|error| Error::Config(format!("sender key: {error}")))?;
        Ok(Self { client, signer })
    }

    /// The sender's checksummed address.
    pub fn address(&self) -> String {
        self.signer.address().to_checksum(None)
    }

    /// The wrapped chain client.
    pub fn client(&self) -> &EvmClient {
        &self.client
    }

    /// Sign and broadcast a call to `to` with the given calldata,
    /// returning the transaction hash.
    pub async fn submit_call(&self, to: &str, calldata: Vec<u8>) -> Result<TxHash, Error> {
        let from = self.address();
        let to_address = Address::from_str(to)
            .map_err(|error| Error::InvalidValue(format!("call target {to}: {error}")))?;

        let nonce = self.client.transaction_count(&from).await?;
        let gas_price = self.client.gas_price().await?;
        let calldata_hex = format!("0x{}", hex::encode(&calldata));
        let gas_limit = self.client.estimate_gas(&from, to, &calldata_hex).await?;

        let tx = TxEip1559 {
            chain_id: self.client.chain_id(),
            nonce,
            // Headroom over the estimate; unused gas is refunded.
            gas_limit: gas_limit + gas_limit / 5,
            max_fee_per_gas: gas_price * 2,
            max_priority_fee_per_gas: (gas_price / 10).max(1),
            to: TxKind::Call(to_address),
            value: U256::ZERO,
            access_list: Default::default(),
            input: calldata.into(),
        };

        let signature = self
            .signer
            .sign_hash_sync(&tx.signature_hash())
            .map_err(|error| Error::InvalidValue(format!("signing: {error}")))?;
        let envelope = TxEnvelope::Eip1559(tx.into_signed(signature));
        let raw = format!("0x{}", hex::encode(envelope.encoded_2718()));

        self.client.send_raw(&raw).await.map_err(into_submit_error)
    }

    /// Sign an EIP-191 personal message with this account's key,
    /// returning the 65-byte signature as `0x`-prefixed hex.
    pub fn sign_message(&self, message: &[u8]) -> Result<String, Error> {
        let signature = self
            .signer
            .sign_message_sync(message)
            .map_err(|error| Error::InvalidValue(format!("signing: {error}")))?;
        Ok(format!("0x{}", hex::encode(signature.as_bytes())))
    }

    /// Poll for the receipt of a transaction, bounded by `attempts`.
    pub async fn wait_for_receipt(
        &self,
        tx_hash: &str,
        attempts: u32,
        interval: Duration,
    ) -> Result<Receipt, Error> {
        for _ in 0..attempts {
            if let Some(receipt) = self.client.receipt(tx_hash).await? {
                return Ok(receipt);
            }
            tokio::time::sleep(interval).await;
        }
        Err(Error::Client(ClientError::Timeout(format!(
            "no receipt for {tx_hash} after {attempts} polls"
        ))))
    }
}

/// Map a broadcast failure: node-side revert complaints become contract
/// errors so the caller can reject the withdraw instead of retrying.
fn into_submit_error(error: ClientError) -> Error {
    match &error {
        ClientError::BadResponse(message)
            if message.contains("revert") || message.contains("execution reverted") =>
        {
            Error::ContractError(message.clone())
        }
        _ => Error::Client(error),
    }
}

/// Shield signer: the SA's ECDSA key whose signature Zex verifies on
/// every submission.
pub fn shield_signer(private_key: &str) -> Result<PrivateKeySigner, Error> {
    PrivateKeySigner::from_str(private_key)
        .map_err(|error| Error::Config(format!("shield key: {error}")))
}

/// EIP-191 sign `message` with the shield key, hex encoded with prefix.
pub fn shield_sign(signer: &PrivateKeySigner, message: &[u8]) -> Result<String, Error> {
    let signature = signer
        .sign_message_sync(message)
        .map_err(|error| Error::InvalidValue(format!("shield signature: {error}")))?;
    Ok(format!("0x{}", hex::encode(signature.as_bytes())))
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "0x4c0883a69102937d6231471b5dbb6204fe51296170827936ea5cce4b76994b0f";

    #[test]
    fn shield_signatures_are_deterministic_65_bytes() {
        let signer = shield_signer(KEY).unwrap();
        let first = shield_sign(&signer, b"payload").unwrap();
        let second = shield_sign(&signer, b"payload").unwrap();

        assert_eq!(first, second);
        assert_eq!(first.len(), 2 + 65 * 2);
        assert_ne!(first, shield_sign(&signer, b"other").unwrap());
    }

    #[test]
    fn revert_messages_become_contract_errors() {
        let error = into_submit_error(ClientError::BadResponse(
            "execution reverted: NotWithdrawer (code 3)".into(),
        ));
        assert!(matches!(error, Error::ContractError(_)));

        let error = into_submit_error(ClientError::Timeout("slow node".into()));
        assert!(matches!(error, Error::Client(ClientError::Timeout(_))));
    }
}
