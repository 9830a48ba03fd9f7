//! # Chain clients
//!
//! Async clients for the chain families the bridge observes: EVM networks
//! spoken to over plain JSON-RPC, and Bitcoin spoken to over a bitcoind
//! node plus a blockbook-style indexer.
//!
//! The [`ChainClient`] trait is the capability the rest of the system is
//! written against; [`Client`] is the family dispatch over the concrete
//! implementations.

pub mod btc;
pub mod error;
pub mod evm;
pub mod types;

use std::future::Future;

pub use error::ClientError;
pub use types::{Address, BlockNumber, ChainSymbol, Transfer, TxHash, UserId};

/// Per-chain RPC capability.
///
/// All methods surface failures as the typed [`ClientError`] family so the
/// role loops can distinguish transient faults from skip-and-log decode
/// failures.
pub trait ChainClient: Send + Sync {
    /// The symbol of the chain this client talks to.
    fn chain_symbol(&self) -> &str;

    /// Latest block number on the chain tip.
    fn latest_block(&self) -> impl Future<Output = Result<BlockNumber, ClientError>> + Send;

    /// Latest block the chain treats as irreversible, either by tag or by
    /// depth (`latest - finalize_block_count`).
    fn finalized_block(&self) -> impl Future<Output = Result<BlockNumber, ClientError>> + Send;

    /// All transaction hashes included in the given block.
    fn block_tx_hashes(
        &self,
        number: BlockNumber,
    ) -> impl Future<Output = Result<Vec<TxHash>, ClientError>> + Send;

    /// Fetch the block with full transactions and decode each into the
    /// transfers it carries. Unrecognized or malformed transactions are
    /// skipped, never fatal.
    fn extract_transfers(
        &self,
        number: BlockNumber,
    ) -> impl Future<Output = Result<Vec<Transfer>, ClientError>> + Send;

    /// The transfers carried by a single transaction: one element for EVM,
    /// one per addressable output for Bitcoin.
    fn transfers_by_tx_hash(
        &self,
        tx_hash: &str,
    ) -> impl Future<Output = Result<Vec<Transfer>, ClientError>> + Send;

    /// Whether the transaction landed successfully on-chain.
    fn is_successful(
        &self,
        tx_hash: &str,
    ) -> impl Future<Output = Result<bool, ClientError>> + Send;

    /// Decimals of the given token; the zero address means the chain's
    /// native token.
    fn token_decimals(
        &self,
        token: &str,
    ) -> impl Future<Output = Result<u8, ClientError>> + Send;

    /// Broadcast a raw transaction, returning its hash.
    fn send_raw(&self, tx_hex: &str) -> impl Future<Output = Result<TxHash, ClientError>> + Send;
}

/// Chain-family dispatch over the concrete clients.
#[derive(Debug, Clone)]
pub enum Client {
    /// An EVM network.
    Evm(evm::EvmClient),
    /// Bitcoin.
    Btc(btc::BtcClient),
}

impl ChainClient for Client {
    fn chain_symbol(&self) -> &str {
        match self {
            Client::Evm(client) => client.chain_symbol(),
            Client::Btc(client) => client.chain_symbol(),
        }
    }

    async fn latest_block(&self) -> Result<BlockNumber, ClientError> {
        match self {
            Client::Evm(client) => client.latest_block().await,
            Client::Btc(client) => client.latest_block().await,
        }
    }

    async fn finalized_block(&self) -> Result<BlockNumber, ClientError> {
        match self {
            Client::Evm(client) => client.finalized_block().await,
            Client::Btc(client) => client.finalized_block().await,
        }
    }

    async fn block_tx_hashes(&self, number: BlockNumber) -> Result<Vec<TxHash>, ClientError> {
        match self {
            Client::Evm(client) => client.block_tx_hashes(number).await,
            Client::Btc(client) => client.block_tx_hashes(number).await,
        }
    }

    async fn extract_transfers(&self, number: BlockNumber) -> Result<Vec<Transfer>, ClientError> {
        match self {
            Client::Evm(client) => client.extract_transfers(number).await,
            Client::Btc(client) => client.extract_transfers(number).await,
        }
    }

    async fn transfers_by_tx_hash(&self, tx_hash: &str) -> Result<Vec<Transfer>, ClientError> {
        match self {
            Client::Evm(client) => client.transfers_by_tx_hash(tx_hash).await,
            Client::Btc(client) => client.transfers_by_tx_hash(tx_hash).await,
        }
    }

    async fn is_successful(&self, tx_hash: &str) -> Result<bool, ClientError> {
        match self {
            Client::Evm(client) => client.is_successful(tx_hash).await,
            Client::Btc(client) => client.is_successful(tx_hash).await,
        }
    }

    async fn token_decimals(&self, token: &str) -> Result<u8, ClientError> {
        match self {
            Client::Evm(client) => client.token_decimals(token).await,
            Client::Btc(client) => client.token_decimals(token).await,
        }
    }

    async fn send_raw(&self, tx_hex: &str) -> Result<TxHash, ClientError> {
        match self {
            Client::Evm(client) => client.send_raw(tx_hex).await,
            Client::Btc(client) => client.send_raw(tx_hex).await,
        }
    }
}
