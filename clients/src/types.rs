//! Shared chain-facing types.

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};

/// Block height on any supported chain.
pub type BlockNumber = u64;

/// Monotonically increasing user identifier assigned by Zex.
pub type UserId = u64;

/// Transaction hash in the chain's canonical string form: `0x`-prefixed
/// hex for EVM, plain hex for Bitcoin.
pub type TxHash = String;

/// Chain-dependent address string: EIP-55 checksummed for EVM, bech32m
/// for Bitcoin taproot.
pub type Address = String;

/// Short symbolic chain tag, e.g. "SEP" or "BTC". All persistent rows are
/// keyed by it so chains share the storage namespace without collision.
pub type ChainSymbol = String;

/// The EVM zero address, standing in for the chain's native token.
pub const NATIVE_TOKEN: &str = "0x0000000000000000000000000000000000000000";

/// A single incoming value movement extracted from a block.
///
/// For Bitcoin the `vout` index participates in the transfer's identity;
/// EVM transfers are identified by `tx_hash` alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    /// Hash of the carrying transaction.
    pub tx_hash: TxHash,
    /// Transferred value. EVM token units, or satoshis for Bitcoin.
    #[serde(with = "u256_decimal")]
    pub value: U256,
    /// Symbol of the chain the transfer was observed on.
    pub chain_symbol: ChainSymbol,
    /// Token contract address; the zero address for native transfers. For
    /// Bitcoin this is the receiving output address.
    pub token: Address,
    /// Receiving address.
    pub to: Address,
    /// Block the transaction was included in.
    pub block_number: BlockNumber,
    /// Output index, present only for Bitcoin transfers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vout: Option<u32>,
}

impl Transfer {
    /// The identity key of this transfer: `(tx_hash, vout)` for Bitcoin,
    /// `(tx_hash, None)` for EVM.
    pub fn identity(&self) -> (&str, Option<u32>) {
        (&self.tx_hash, self.vout)
    }
}

/// Serialize a [`U256`] as a decimal string so the value survives every
/// serialization format (JSON, BSON) without precision loss.
pub mod u256_decimal {
    use std::str::FromStr as _;

    use alloy_primitives::U256;
    use serde::{de, Deserialize as _, Deserializer, Serializer};

    /// Serialize the value as its decimal string form.
    pub fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    /// Deserialize a decimal (or `0x`-prefixed hex) string.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        let raw = String::deserialize(deserializer)?;
        U256::from_str(&raw).map_err(de::Error::custom)
    }
}
