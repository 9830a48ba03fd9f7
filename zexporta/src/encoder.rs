//! Deterministic protocol encoding.
//!
//! Both sides of a signature round — the aggregator and every validator —
//! hash the exact same bytes. The deposit batch layout is packed
//! big-endian with no padding; the withdraw hash is the packed keccak the
//! vault contract verifies. Any byte of drift here splits the round.

use alloy_primitives::{keccak256, U256};
use sha2::{Digest as _, Sha256};
use std::str::FromStr as _;

use crate::error::Error;
use crate::storage::model::{Deposit, EvmWithdraw};

/// Operation tag of a deposit batch.
pub const DEPOSIT_OPERATION: u8 = b'd';

/// Width of the transaction hash field: a `0x`-prefixed 32-byte hash.
const TX_HASH_WIDTH: usize = 66;

/// Width of the token field: an EVM `0x` + 40 hex address; Bitcoin output
/// addresses are right-padded or truncated to fit.
const TOKEN_WIDTH: usize = 42;

/// Encode a deposit batch exactly as Zex and the validators expect it:
///
/// ```text
/// header:  u8 version | u8 op | char[3] chain_symbol_lower | u16 n
/// deposit: char[66] tx_hash | char[42] token | bytes[32] value_be |
///          u8 decimals | u32 sa_timestamp | u64 user_id | u8 reserved
/// ```
pub fn encode_deposit_batch(
    version: u8,
    operation: u8,
    deposits: &[Deposit],
    chain_symbol: &str,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(7 + deposits.len() * (TX_HASH_WIDTH + TOKEN_WIDTH + 47));

    out.push(version);
    out.push(operation);
    out.extend_from_slice(&fixed_ascii::<3>(&chain_symbol.to_lowercase()));
    out.extend_from_slice(&(deposits.len() as u16).to_be_bytes());

    for deposit in deposits {
        out.extend_from_slice(&fixed_ascii::<TX_HASH_WIDTH>(&deposit.transfer.tx_hash));
        out.extend_from_slice(&fixed_ascii::<TOKEN_WIDTH>(&deposit.transfer.token));
        out.extend_from_slice(&deposit.transfer.value.to_be_bytes::<32>());
        out.push(deposit.decimals);
        out.extend_from_slice(&(deposit.sa_timestamp.unwrap_or(0) as u32).to_be_bytes());
        out.extend_from_slice(&deposit.user_id.to_be_bytes());
        out.push(0);
    }

    out
}

/// The lowercase hex sha256 of an encoded batch, as carried in the round's
/// `message_hash`.
pub fn deposit_batch_hash(encoded: &[u8]) -> String {
    hex::encode(Sha256::digest(encoded))
}

/// The hash a validator signs off for an EVM withdraw:
/// `keccak256(abi.encodePacked(recipient, token, amount, nonce, chain_id))`,
/// lowercase hex without a `0x` prefix.
pub fn evm_withdraw_hash(withdraw: &EvmWithdraw) -> Result<String, Error> {
    let recipient = alloy_primitives::Address::from_str(&withdraw.recipient)
        .map_err(|error| Error::InvalidValue(format!("recipient: {error}")))?;
    let token = alloy_primitives::Address::from_str(&withdraw.token_address)
        .map_err(|error| Error::InvalidValue(format!("token: {error}")))?;

    let mut packed = Vec::with_capacity(20 + 20 + 32 + 32 + 32);
    packed.extend_from_slice(recipient.as_slice());
    packed.extend_from_slice(token.as_slice());
    packed.extend_from_slice(&withdraw.amount.to_be_bytes::<32>());
    packed.extend_from_slice(&U256::from(withdraw.nonce).to_be_bytes::<32>());
    packed.extend_from_slice(&U256::from(withdraw.chain_id).to_be_bytes::<32>());

    Ok(hex::encode(keccak256(&packed)))
}

/// Pack a string into a fixed-width ASCII field, zero-padded on the right
/// and truncated when longer.
fn fixed_ascii<const N: usize>(value: &str) -> [u8; N] {
    let mut field = [0u8; N];
    let bytes = value.as_bytes();
    let len = bytes.len().min(N);
    field[..len].copy_from_slice(&bytes[..len]);
    field
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::model::DepositStatus;
    use clients::Transfer;

    fn vector_deposit() -> Deposit {
        Deposit {
            transfer: Transfer {
                tx_hash: format!("0x{}", "a".repeat(64)),
                value: U256::from(2u8).pow(U256::from(200u64)),
                chain_symbol: "SEP".to_owned(),
                token: format!("0x{}", "b".repeat(40)),
                to: "0x0".to_owned(),
                block_number: 1,
                vout: None,
            },
            user_id: 7,
            decimals: 18,
            status: DepositStatus::Verified,
            sa_timestamp: Some(1),
        }
    }

    #[test]
    fn encodes_the_known_vector() {
        let deposit = vector_deposit();
        let encoded = encode_deposit_batch(1, DEPOSIT_OPERATION, &[deposit.clone()], "sep");

        // Header: version, 'd', "sep", n = 1.
        assert_eq!(&encoded[..7], &[0x01, 0x64, 0x73, 0x65, 0x70, 0x00, 0x01]);

        let body = &encoded[7..];
        assert_eq!(&body[..66], format!("0x{}", "a".repeat(64)).as_bytes());
        assert_eq!(&body[66..108], format!("0x{}", "b".repeat(40)).as_bytes());
        assert_eq!(
            &body[108..140],
            &deposit.transfer.value.to_be_bytes::<32>()
        );
        assert_eq!(body[140], 0x12);
        assert_eq!(&body[141..145], &[0, 0, 0, 1]);
        assert_eq!(&body[145..153], &[0, 0, 0, 0, 0, 0, 0, 7]);
        assert_eq!(body[153], 0x00);
        assert_eq!(encoded.len(), 7 + 154);
    }

    #[test]
    fn short_fields_are_zero_padded_on_the_right() {
        let mut deposit = vector_deposit();
        // A Bitcoin txid has no 0x prefix and is 64 chars; the field is 66.
        deposit.transfer.tx_hash = "f".repeat(64);
        deposit.transfer.token = "bcrt1qshortaddr".to_owned();

        let encoded = encode_deposit_batch(1, DEPOSIT_OPERATION, &[deposit], "btc");
        let body = &encoded[7..];
        assert_eq!(&body[64..66], &[0, 0]);
        assert_eq!(&body[66..81], b"bcrt1qshortaddr");
        assert_eq!(body[81], 0);
    }

    #[test]
    fn batch_hash_is_stable() {
        let encoded = encode_deposit_batch(1, DEPOSIT_OPERATION, &[vector_deposit()], "sep");
        assert_eq!(deposit_batch_hash(&encoded), deposit_batch_hash(&encoded));
        assert_eq!(deposit_batch_hash(&encoded).len(), 64);
    }

    #[test]
    fn evm_withdraw_hash_packs_all_five_fields() {
        let withdraw = EvmWithdraw {
            chain_symbol: "SEP".to_owned(),
            nonce: 42,
            amount: U256::from(1_000_000u64),
            recipient: "0xfB6916095ca1df60bB79Ce92cE3Ea74c37c5d359".to_owned(),
            token_address: "0x0000000000000000000000000000000000000001".to_owned(),
            chain_id: 11155111,
            status: crate::storage::model::WithdrawStatus::Pending,
            tx_hash: None,
        };

        let hash = evm_withdraw_hash(&withdraw).unwrap();
        assert_eq!(hash.len(), 64);
        assert!(!hash.starts_with("0x"));
        assert_eq!(hash, evm_withdraw_hash(&withdraw).unwrap());

        // Any field change moves the hash.
        let mut other = withdraw.clone();
        other.nonce = 43;
        assert_ne!(hash, evm_withdraw_hash(&other).unwrap());
    }
}
