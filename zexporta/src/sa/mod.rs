//! # Signature aggregator roles
//!
//! The SA drives threshold-signature rounds with the validator set: one
//! round per finalized deposit batch, one per withdraw request. Each
//! round either completes fully (signed result submitted and state
//! transitioned through idempotent upserts) or aborts with an explicit
//! outcome the loop handles; nothing is retried silently on a
//! state-changing path.

pub mod contracts;
pub mod deposit;
pub mod evm_sender;
pub mod vault_depositor;
pub mod withdraw_btc;
pub mod withdraw_evm;

/// Decode a payload into the latin-1 string Zex expects: every byte maps
/// to the unicode code point of the same value.
pub fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&byte| byte as char).collect()
}
