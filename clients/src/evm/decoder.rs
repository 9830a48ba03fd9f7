//! ERC-20 calldata decoding.
//!
//! The observer only recognizes the two ERC-20 entry points that move
//! value into a deposit address; everything else in a block is skipped.

use alloy_primitives::{Address, U256};
use alloy_sol_types::{sol, SolCall as _};

sol! {
    /// The ERC-20 surface the bridge interacts with.
    interface IERC20 {
        function transfer(address to, uint256 value) external returns (bool);
        function transferFrom(address from, address to, uint256 value) external returns (bool);
        function balanceOf(address owner) external view returns (uint256);
        function decimals() external view returns (uint8);
    }
}

/// The destination and value carried by a recognized ERC-20 call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedTransfer {
    /// The recipient of the token transfer.
    pub to: Address,
    /// The transferred token amount.
    pub value: U256,
}

/// Why a transaction input did not decode into a transfer.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The function selector is not `transfer` or `transferFrom`.
    #[error("unrecognized function selector")]
    NotRecognized,
    /// The selector matched but the argument data is garbled.
    #[error("malformed calldata: {0}")]
    Invalid(String),
}

/// Decode a transaction input into the ERC-20 transfer it encodes.
pub fn decode_transfer_input(input: &[u8]) -> Result<DecodedTransfer, DecodeError> {
    let Some(selector) = input.get(..4) else {
        return Err(DecodeError::NotRecognized);
    };

    match selector {
        sel if sel == IERC20::transferCall::SELECTOR => IERC20::transferCall::abi_decode(input)
            .map(|call| DecodedTransfer { to: call.to, value: call.value })
            .map_err(|error| DecodeError::Invalid(error.to_string())),
        sel if sel == IERC20::transferFromCall::SELECTOR => {
            IERC20::transferFromCall::abi_decode(input)
                .map(|call| DecodedTransfer { to: call.to, value: call.value })
                .map_err(|error| DecodeError::Invalid(error.to_string()))
        }
        _ => Err(DecodeError::NotRecognized),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr as _;

    #[test]
    fn decodes_transfer_calldata() {
        let to = Address::from_str("0xbBbBBBBbbBBBbbbBbbBbbbbBBbBbbbbBbBbbBBbB").unwrap();
        let value = U256::from(1_000_000u64);
        let input = IERC20::transferCall { to, value }.abi_encode();

        let decoded = decode_transfer_input(&input).unwrap();
        assert_eq!(decoded.to, to);
        assert_eq!(decoded.value, value);
    }

    #[test]
    fn decodes_transfer_from_calldata() {
        let from = Address::from_str("0xaAaAaAaaAaAaAaaAaAAAAAAAAaaaAaAaAaaAaaAa").unwrap();
        let to = Address::from_str("0xbBbBBBBbbBBBbbbBbbBbbbbBBbBbbbbBbBbbBBbB").unwrap();
        let value = U256::from(42u64);
        let input = IERC20::transferFromCall { from, to, value }.abi_encode();

        let decoded = decode_transfer_input(&input).unwrap();
        assert_eq!(decoded.to, to);
        assert_eq!(decoded.value, value);
    }

    #[test]
    fn rejects_unknown_selector() {
        let input = [0xde, 0xad, 0xbe, 0xef, 0x00];
        assert!(matches!(
            decode_transfer_input(&input),
            Err(DecodeError::NotRecognized)
        ));
    }

    #[test]
    fn rejects_truncated_arguments() {
        let mut input = IERC20::transferCall {
            to: Address::ZERO,
            value: U256::from(7u64),
        }
        .abi_encode();
        input.truncate(20);

        assert!(matches!(
            decode_transfer_input(&input),
            Err(DecodeError::Invalid(_))
        ));
    }
}
