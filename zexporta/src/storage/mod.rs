//! # Coordinator storage
//!
//! This module contains the `DbRead` and `DbWrite` traits representing
//! the interface between the coordinator roles and their shared database.
//!
//! The canonical implementation is [`mongo::MongoStore`], backed by the
//! document store; [`memory::SharedStore`] implements the same traits over
//! an in-process map for unit tests.
//!
//! Every mutation is an idempotent upsert keyed by the row's uniqueness
//! key, or a status-scoped update (`WHERE status = <prev>` semantics), so
//! concurrent writers converge and re-running a role over the same window
//! cannot duplicate or regress rows.

pub mod memory;
pub mod model;
pub mod mongo;

use std::collections::HashMap;
use std::future::Future;

use clients::{Address, BlockNumber, TxHash, UserId};

use crate::error::Error;
use model::{
    BtcWithdraw, ChainKind, Deposit, DepositStatus, EvmWithdraw, UserAddress, Utxo, UtxoStatus,
    WithdrawStatus,
};

/// Represents the ability to read coordinator state.
pub trait DbRead {
    /// The chain's observation cursor, if one has been persisted.
    fn last_observed_block(
        &self,
        chain: &str,
    ) -> impl Future<Output = Result<Option<BlockNumber>, Error>> + Send;

    /// The chain's withdraw-nonce cursor; `-1` when nothing was processed.
    fn last_withdraw_nonce(
        &self,
        chain: &str,
    ) -> impl Future<Output = Result<i64, Error>> + Send;

    /// Snapshot of active deposit addresses for the address filter step.
    fn active_addresses(
        &self,
        kind: ChainKind,
    ) -> impl Future<Output = Result<HashMap<Address, UserId>, Error>> + Send;

    /// Highest user id with a derived address, per chain family.
    fn max_user_id(
        &self,
        kind: ChainKind,
    ) -> impl Future<Output = Result<Option<UserId>, Error>> + Send;

    /// Cached token decimals.
    fn token_decimals(
        &self,
        chain: &str,
        token: &str,
    ) -> impl Future<Output = Result<Option<u8>, Error>> + Send;

    /// Deposits in the given status, sorted by block ascending.
    fn deposits_by_status(
        &self,
        kind: ChainKind,
        chain: &str,
        status: DepositStatus,
        from_block: Option<BlockNumber>,
        limit: Option<usize>,
    ) -> impl Future<Output = Result<Vec<Deposit>, Error>> + Send;

    /// Distinct block numbers of PENDING deposits at or below the given
    /// finalized block, sorted ascending.
    fn pending_deposit_blocks(
        &self,
        kind: ChainKind,
        chain: &str,
        max_block: BlockNumber,
    ) -> impl Future<Output = Result<Vec<BlockNumber>, Error>> + Send;

    /// EVM withdraws in the given status, sorted by nonce ascending.
    fn evm_withdraws_by_status(
        &self,
        chain: &str,
        status: WithdrawStatus,
    ) -> impl Future<Output = Result<Vec<EvmWithdraw>, Error>> + Send;

    /// Bitcoin withdraws in the given status, sorted by nonce ascending.
    fn btc_withdraws_by_status(
        &self,
        chain: &str,
        status: WithdrawStatus,
    ) -> impl Future<Output = Result<Vec<BtcWithdraw>, Error>> + Send;

    /// UTXOs in the given status, sorted by amount descending.
    fn utxos_by_status(
        &self,
        status: UtxoStatus,
    ) -> impl Future<Output = Result<Vec<Utxo>, Error>> + Send;

    /// Confirmed withdraw shapes referencing any of the given outpoints.
    fn sa_withdraws_sharing_utxos(
        &self,
        outpoints: &[(TxHash, u32)],
    ) -> impl Future<Output = Result<Vec<BtcWithdraw>, Error>> + Send;

    /// The sequencer-confirmed withdraw shape for a nonce, if recorded.
    fn sa_withdraw_by_nonce(
        &self,
        chain: &str,
        nonce: u64,
    ) -> impl Future<Output = Result<Option<BtcWithdraw>, Error>> + Send;

    /// Whether the store is reachable.
    fn ping(&self) -> impl Future<Output = Result<(), Error>> + Send;
}

/// Represents the ability to write coordinator state.
pub trait DbWrite {
    /// Insert deposits that are not yet present; existing rows are left
    /// untouched.
    fn insert_deposits_if_missing(
        &self,
        kind: ChainKind,
        deposits: &[Deposit],
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Upsert deposits by their uniqueness key, replacing existing rows.
    fn upsert_deposits(
        &self,
        kind: ChainKind,
        deposits: &[Deposit],
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Promote PENDING deposits at or below the finalized block whose
    /// transaction is in the given set to FINALIZED.
    fn finalize_deposits(
        &self,
        kind: ChainKind,
        chain: &str,
        finalized_block: BlockNumber,
        tx_hashes: &[TxHash],
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Demote deposits in `[from_block, to_block]` still in `prev` to
    /// REORG.
    fn reorg_deposits_in_range(
        &self,
        kind: ChainKind,
        chain: &str,
        from_block: BlockNumber,
        to_block: BlockNumber,
        prev: DepositStatus,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Demote deposits with the given tx hashes still in `prev` to REORG.
    fn reorg_deposits_by_tx(
        &self,
        kind: ChainKind,
        chain: &str,
        tx_hashes: &[TxHash],
        prev: DepositStatus,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Insert derived addresses; duplicates are ignored.
    fn insert_user_addresses(
        &self,
        kind: ChainKind,
        addresses: &[UserAddress],
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Write-through a token's decimals.
    fn insert_token_decimals(
        &self,
        chain: &str,
        token: &str,
        decimals: u8,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Advance the observation cursor.
    fn set_last_observed_block(
        &self,
        chain: &str,
        block: BlockNumber,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Advance the withdraw-nonce cursor.
    fn set_last_withdraw_nonce(
        &self,
        chain: &str,
        nonce: i64,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Insert UTXOs that are not yet present.
    fn insert_utxos_if_missing(
        &self,
        utxos: &[Utxo],
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Move a UTXO to a new status.
    fn set_utxo_status(
        &self,
        tx_hash: &str,
        index: u32,
        status: UtxoStatus,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Insert EVM withdraws that are not yet present.
    fn insert_evm_withdraws_if_missing(
        &self,
        withdraws: &[EvmWithdraw],
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Insert Bitcoin withdraws that are not yet present.
    fn insert_btc_withdraws_if_missing(
        &self,
        withdraws: &[BtcWithdraw],
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Upsert an EVM withdraw by `(chain_symbol, nonce)`.
    fn upsert_evm_withdraw(
        &self,
        withdraw: &EvmWithdraw,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Upsert a Bitcoin withdraw by `(chain_symbol, nonce)`.
    fn upsert_btc_withdraw(
        &self,
        withdraw: &BtcWithdraw,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Record the sequencer-confirmed withdraw shape if absent and return
    /// the stored row.
    fn insert_sa_withdraw_if_missing(
        &self,
        withdraw: &BtcWithdraw,
    ) -> impl Future<Output = Result<BtcWithdraw, Error>> + Send;
}
