//! Persisted row types.

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};

use clients::types::u256_decimal;
use clients::{Address, ChainSymbol, Transfer, TxHash, UserId};

/// Chain family, selecting which collection namespace a row lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChainKind {
    /// EVM networks.
    Evm,
    /// Bitcoin.
    Btc,
}

/// Deposit lifecycle states.
///
/// Only the forward edges PENDING → FINALIZED → VERIFIED → SUCCESSFUL are
/// valid; REORG and REJECTED are terminal. Writers always transition with
/// a status-scoped update so concurrent writers converge.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DepositStatus {
    /// Observed on-chain, not yet past the finality depth.
    Pending,
    /// Past the finality depth and still present in its block.
    Finalized,
    /// Confirmed by a validator signature round and submitted to Zex.
    Verified,
    /// Swept into the vault.
    Successful,
    /// The carrying block was reorganized away.
    Reorg,
    /// Dropped by an operator or a failed round.
    Rejected,
}

/// UTXO lifecycle states (Bitcoin vault pool).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum UtxoStatus {
    /// Created at observation time, not yet final.
    Processing,
    /// Spendable by the vault.
    Unspent,
    /// Committed to an in-flight withdraw.
    Spend,
    /// The funding deposit reorged away.
    Rejected,
}

/// Withdraw request lifecycle states.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum WithdrawStatus {
    /// Ready for a signature round.
    Pending,
    /// Being prepared (Bitcoin UTXO selection / receipt wait).
    Processing,
    /// Confirmed on-chain.
    Successful,
    /// Permanently failed; the nonce cursor moves past it.
    Rejected,
}

/// A persisted deposit: a transfer envelope plus the crediting metadata.
///
/// Uniqueness key: `(chain_symbol, tx_hash[, vout])`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deposit {
    /// The observed transfer.
    #[serde(flatten)]
    pub transfer: Transfer,
    /// The user credited for this deposit.
    pub user_id: UserId,
    /// Token decimals at observation time.
    pub decimals: u8,
    /// Lifecycle state.
    pub status: DepositStatus,
    /// Unix seconds of the signature round that verified this deposit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sa_timestamp: Option<u64>,
}

impl Deposit {
    /// The identity key of this deposit.
    pub fn identity(&self) -> (&str, Option<u32>) {
        self.transfer.identity()
    }

    /// Canonical protocol ordering: by `(tx_hash, vout)`.
    pub fn sort_key(&self) -> (String, u32) {
        (
            self.transfer.tx_hash.clone(),
            self.transfer.vout.unwrap_or(0),
        )
    }
}

/// Sort deposits into the canonical protocol order shared by the
/// aggregator and every validator.
pub fn sort_deposits(deposits: &mut [Deposit]) {
    deposits.sort_by_key(Deposit::sort_key);
}

/// A derived user deposit address. Created once, never updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAddress {
    /// The owning user.
    pub user_id: UserId,
    /// The derived address.
    pub address: Address,
    /// Whether the address participates in observation.
    #[serde(default = "default_true")]
    pub is_active: bool,
}

/// An output owned by the Bitcoin vault. Uniqueness: `(tx_hash, index)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    /// Funding transaction hash.
    pub tx_hash: TxHash,
    /// Output index within the funding transaction.
    pub index: u32,
    /// Value in satoshis.
    pub amount: u64,
    /// The derived deposit address holding the output.
    pub address: Address,
    /// Lifecycle state.
    pub status: UtxoStatus,
    /// The user id (derivation salt) behind `address`.
    pub user_id: UserId,
}

impl Utxo {
    /// The identity key of this UTXO.
    pub fn outpoint(&self) -> (&str, u32) {
        (&self.tx_hash, self.index)
    }
}

/// An EVM withdraw request pulled from Zex.
/// Uniqueness: `(chain_symbol, nonce)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvmWithdraw {
    /// The chain to pay out on.
    pub chain_symbol: ChainSymbol,
    /// Zex-assigned withdraw nonce, strictly ordered per chain.
    pub nonce: u64,
    /// Amount in token units.
    #[serde(with = "u256_decimal")]
    pub amount: U256,
    /// Destination address.
    pub recipient: Address,
    /// Token contract; the zero address pays out native value.
    pub token_address: Address,
    /// Numeric chain id, bound into the withdraw hash.
    pub chain_id: u64,
    /// Lifecycle state.
    pub status: WithdrawStatus,
    /// On-chain hash once submitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<TxHash>,
}

/// A Bitcoin withdraw request pulled from Zex.
/// Uniqueness: `(chain_symbol, nonce)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtcWithdraw {
    /// The chain to pay out on (normally "BTC").
    pub chain_symbol: ChainSymbol,
    /// Zex-assigned withdraw nonce, strictly ordered per chain.
    pub nonce: u64,
    /// Amount in satoshis.
    pub amount: u64,
    /// Destination address.
    pub recipient: Address,
    /// Lifecycle state.
    pub status: WithdrawStatus,
    /// Broadcast transaction id once submitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<TxHash>,
    /// The inputs committed to this withdraw (phase A).
    #[serde(default)]
    pub utxos: Vec<Utxo>,
    /// Fee rate the transaction was shaped with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sat_per_byte: Option<u64>,
    /// Sequencer handle of the committed transaction shape.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zellular_index: Option<u64>,
}

fn default_true() -> bool {
    true
}
