//! Hand-rolled test doubles shared by the unit tests.

use std::collections::{HashMap, HashSet};

use alloy_primitives::U256;

use clients::{BlockNumber, ChainClient, ClientError, Transfer, TxHash};

use crate::storage::model::{Deposit, DepositStatus};
use crate::threshold::{DkgKey, SignatureReply, SigningRequest, ThresholdError, ThresholdSigner};

/// A scripted chain used in place of a real RPC client.
#[derive(Debug, Clone, Default)]
pub struct MockChain {
    /// Chain symbol reported by the client.
    pub symbol: String,
    /// The chain tip.
    pub latest: BlockNumber,
    /// The finalized height.
    pub finalized: BlockNumber,
    /// Transfers per block.
    pub blocks: HashMap<BlockNumber, Vec<Transfer>>,
    /// Transactions that failed on-chain.
    pub failed: HashSet<TxHash>,
    /// Transactions the chain no longer knows about.
    pub missing: HashSet<TxHash>,
    /// Decimals per token address; 18 when absent.
    pub decimals: HashMap<String, u8>,
}

impl MockChain {
    /// A chain with the given symbol and tip heights.
    pub fn new(symbol: &str, latest: BlockNumber, finalized: BlockNumber) -> Self {
        Self {
            symbol: symbol.to_owned(),
            latest,
            finalized,
            ..Self::default()
        }
    }

    /// Script a transfer into a block.
    pub fn add_transfer(&mut self, transfer: Transfer) {
        self.blocks
            .entry(transfer.block_number)
            .or_default()
            .push(transfer);
    }
}

impl ChainClient for MockChain {
    fn chain_symbol(&self) -> &str {
        &self.symbol
    }

    async fn latest_block(&self) -> Result<BlockNumber, ClientError> {
        Ok(self.latest)
    }

    async fn finalized_block(&self) -> Result<BlockNumber, ClientError> {
        Ok(self.finalized)
    }

    async fn block_tx_hashes(&self, number: BlockNumber) -> Result<Vec<TxHash>, ClientError> {
        let mut hashes: Vec<TxHash> = self
            .blocks
            .get(&number)
            .map(|transfers| {
                transfers
                    .iter()
                    .filter(|transfer| !self.missing.contains(&transfer.tx_hash))
                    .map(|transfer| transfer.tx_hash.clone())
                    .collect()
            })
            .unwrap_or_default();
        hashes.dedup();
        Ok(hashes)
    }

    async fn extract_transfers(&self, number: BlockNumber) -> Result<Vec<Transfer>, ClientError> {
        Ok(self.blocks.get(&number).cloned().unwrap_or_default())
    }

    async fn transfers_by_tx_hash(&self, tx_hash: &str) -> Result<Vec<Transfer>, ClientError> {
        if self.missing.contains(tx_hash) {
            return Err(ClientError::NotFound(tx_hash.to_owned()));
        }

        let transfers: Vec<Transfer> = self
            .blocks
            .values()
            .flatten()
            .filter(|transfer| transfer.tx_hash == tx_hash)
            .cloned()
            .collect();

        if transfers.is_empty() {
            Err(ClientError::NotFound(tx_hash.to_owned()))
        } else {
            Ok(transfers)
        }
    }

    async fn is_successful(&self, tx_hash: &str) -> Result<bool, ClientError> {
        Ok(!self.failed.contains(tx_hash) && !self.missing.contains(tx_hash))
    }

    async fn token_decimals(&self, token: &str) -> Result<u8, ClientError> {
        Ok(self.decimals.get(token).copied().unwrap_or(18))
    }

    async fn send_raw(&self, _tx_hex: &str) -> Result<TxHash, ClientError> {
        Ok("broadcast-txid".to_owned())
    }
}

type SignerHandler =
    Box<dyn Fn(&SigningRequest) -> Result<SignatureReply, ThresholdError> + Send + Sync>;

/// A scripted threshold signer: every signing round is answered by the
/// given handler.
pub struct MockSigner {
    handler: SignerHandler,
}

impl MockSigner {
    /// Create a signer answering rounds with `handler`.
    pub fn new(
        handler: impl Fn(&SigningRequest) -> Result<SignatureReply, ThresholdError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            handler: Box::new(handler),
        }
    }
}

impl ThresholdSigner for MockSigner {
    async fn request_nonces(&self, _party: &[String]) -> Result<serde_json::Value, ThresholdError> {
        Ok(serde_json::json!({}))
    }

    async fn request_signature(
        &self,
        _key: &DkgKey,
        _nonces: &serde_json::Value,
        request: &SigningRequest,
        _party: &[String],
    ) -> Result<SignatureReply, ThresholdError> {
        (self.handler)(request)
    }
}

/// A transfer with the usual test defaults.
pub fn transfer(chain: &str, tx_hash: &str, to: &str, block: BlockNumber) -> Transfer {
    Transfer {
        tx_hash: tx_hash.to_owned(),
        value: U256::from(1_000_000u64),
        chain_symbol: chain.to_owned(),
        token: "0x0000000000000000000000000000000000000001".to_owned(),
        to: to.to_owned(),
        block_number: block,
        vout: None,
    }
}

/// A deposit wrapping [`transfer`].
pub fn deposit(
    chain: &str,
    tx_hash: &str,
    to: &str,
    block: BlockNumber,
    user_id: u64,
    status: DepositStatus,
) -> Deposit {
    Deposit {
        transfer: transfer(chain, tx_hash, to, block),
        user_id,
        decimals: 6,
        status,
        sa_timestamp: None,
    }
}
