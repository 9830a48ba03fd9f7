//! In-memory store, used by unit tests.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use clients::{Address, BlockNumber, ChainSymbol, TxHash, UserId};

use crate::error::Error;

use super::model::{
    BtcWithdraw, ChainKind, Deposit, DepositStatus, EvmWithdraw, UserAddress, Utxo, UtxoStatus,
    WithdrawStatus,
};
use super::{DbRead, DbWrite};

type DepositKey = (ChainSymbol, TxHash, Option<u32>);
type NonceKey = (ChainSymbol, u64);

/// The backing maps of the in-memory store.
#[derive(Debug, Default)]
pub struct Store {
    /// EVM deposits by `(chain, tx_hash, vout)`.
    pub evm_deposits: HashMap<DepositKey, Deposit>,
    /// Bitcoin deposits by `(chain, tx_hash, vout)`.
    pub btc_deposits: HashMap<DepositKey, Deposit>,
    /// Derived EVM addresses by user id.
    pub evm_addresses: HashMap<UserId, UserAddress>,
    /// Derived Bitcoin addresses by user id.
    pub btc_addresses: HashMap<UserId, UserAddress>,
    /// Token decimal cache by `(chain, token)`.
    pub tokens: HashMap<(ChainSymbol, Address), u8>,
    /// Observation cursors per chain.
    pub last_observed_blocks: HashMap<ChainSymbol, BlockNumber>,
    /// Withdraw-nonce cursors per chain.
    pub last_withdraw_nonces: HashMap<ChainSymbol, i64>,
    /// Vault UTXO pool by outpoint.
    pub utxos: HashMap<(TxHash, u32), Utxo>,
    /// EVM withdraws by `(chain, nonce)`.
    pub evm_withdraws: HashMap<NonceKey, EvmWithdraw>,
    /// Bitcoin withdraws by `(chain, nonce)`.
    pub btc_withdraws: HashMap<NonceKey, BtcWithdraw>,
    /// Sequencer-confirmed withdraw shapes by `(chain, nonce)`.
    pub sa_withdraws: HashMap<NonceKey, BtcWithdraw>,
}

impl Store {
    /// Create a new shared, empty store.
    pub fn new_shared() -> SharedStore {
        Arc::new(Mutex::new(Self::default()))
    }

    fn deposits(&self, kind: ChainKind) -> &HashMap<DepositKey, Deposit> {
        match kind {
            ChainKind::Evm => &self.evm_deposits,
            ChainKind::Btc => &self.btc_deposits,
        }
    }

    fn deposits_mut(&mut self, kind: ChainKind) -> &mut HashMap<DepositKey, Deposit> {
        match kind {
            ChainKind::Evm => &mut self.evm_deposits,
            ChainKind::Btc => &mut self.btc_deposits,
        }
    }

    fn addresses(&self, kind: ChainKind) -> &HashMap<UserId, UserAddress> {
        match kind {
            ChainKind::Evm => &self.evm_addresses,
            ChainKind::Btc => &self.btc_addresses,
        }
    }

    fn addresses_mut(&mut self, kind: ChainKind) -> &mut HashMap<UserId, UserAddress> {
        match kind {
            ChainKind::Evm => &mut self.evm_addresses,
            ChainKind::Btc => &mut self.btc_addresses,
        }
    }
}

/// A handle to a [`Store`] shared between tasks.
pub type SharedStore = Arc<Mutex<Store>>;

fn deposit_key(chain: &str, deposit: &Deposit) -> DepositKey {
    (
        chain.to_owned(),
        deposit.transfer.tx_hash.clone(),
        deposit.transfer.vout,
    )
}

impl DbRead for SharedStore {
    async fn last_observed_block(&self, chain: &str) -> Result<Option<BlockNumber>, Error> {
        Ok(self.lock().await.last_observed_blocks.get(chain).copied())
    }

    async fn last_withdraw_nonce(&self, chain: &str) -> Result<i64, Error> {
        Ok(self
            .lock()
            .await
            .last_withdraw_nonces
            .get(chain)
            .copied()
            .unwrap_or(-1))
    }

    async fn active_addresses(
        &self,
        kind: ChainKind,
    ) -> Result<HashMap<Address, UserId>, Error> {
        Ok(self
            .lock()
            .await
            .addresses(kind)
            .values()
            .filter(|row| row.is_active)
            .map(|row| (row.address.clone(), row.user_id))
            .collect())
    }

    async fn max_user_id(&self, kind: ChainKind) -> Result<Option<UserId>, Error> {
        Ok(self.lock().await.addresses(kind).keys().max().copied())
    }

    async fn token_decimals(&self, chain: &str, token: &str) -> Result<Option<u8>, Error> {
        Ok(self
            .lock()
            .await
            .tokens
            .get(&(chain.to_owned(), token.to_owned()))
            .copied())
    }

    async fn deposits_by_status(
        &self,
        kind: ChainKind,
        chain: &str,
        status: DepositStatus,
        from_block: Option<BlockNumber>,
        limit: Option<usize>,
    ) -> Result<Vec<Deposit>, Error> {
        let store = self.lock().await;
        let mut rows: Vec<Deposit> = store
            .deposits(kind)
            .values()
            .filter(|deposit| {
                deposit.transfer.chain_symbol == chain
                    && deposit.status == status
                    && from_block.is_none_or(|from| deposit.transfer.block_number >= from)
            })
            .cloned()
            .collect();

        rows.sort_by_key(|deposit| (deposit.transfer.block_number, deposit.sort_key()));
        if let Some(limit) = limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn pending_deposit_blocks(
        &self,
        kind: ChainKind,
        chain: &str,
        max_block: BlockNumber,
    ) -> Result<Vec<BlockNumber>, Error> {
        let store = self.lock().await;
        let mut blocks: Vec<BlockNumber> = store
            .deposits(kind)
            .values()
            .filter(|deposit| {
                deposit.transfer.chain_symbol == chain
                    && deposit.status == DepositStatus::Pending
                    && deposit.transfer.block_number <= max_block
            })
            .map(|deposit| deposit.transfer.block_number)
            .collect();

        blocks.sort_unstable();
        blocks.dedup();
        Ok(blocks)
    }

    async fn evm_withdraws_by_status(
        &self,
        chain: &str,
        status: WithdrawStatus,
    ) -> Result<Vec<EvmWithdraw>, Error> {
        let store = self.lock().await;
        let mut rows: Vec<EvmWithdraw> = store
            .evm_withdraws
            .values()
            .filter(|withdraw| withdraw.chain_symbol == chain && withdraw.status == status)
            .cloned()
            .collect();
        rows.sort_by_key(|withdraw| withdraw.nonce);
        Ok(rows)
    }

    async fn btc_withdraws_by_status(
        &self,
        chain: &str,
        status: WithdrawStatus,
    ) -> Result<Vec<BtcWithdraw>, Error> {
        let store = self.lock().await;
        let mut rows: Vec<BtcWithdraw> = store
            .btc_withdraws
            .values()
            .filter(|withdraw| withdraw.chain_symbol == chain && withdraw.status == status)
            .cloned()
            .collect();
        rows.sort_by_key(|withdraw| withdraw.nonce);
        Ok(rows)
    }

    async fn utxos_by_status(&self, status: UtxoStatus) -> Result<Vec<Utxo>, Error> {
        let store = self.lock().await;
        let mut rows: Vec<Utxo> = store
            .utxos
            .values()
            .filter(|utxo| utxo.status == status)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.amount.cmp(&a.amount));
        Ok(rows)
    }

    async fn sa_withdraws_sharing_utxos(
        &self,
        outpoints: &[(TxHash, u32)],
    ) -> Result<Vec<BtcWithdraw>, Error> {
        let store = self.lock().await;
        let rows = store
            .sa_withdraws
            .values()
            .filter(|withdraw| {
                withdraw.utxos.iter().any(|utxo| {
                    outpoints
                        .iter()
                        .any(|(hash, index)| utxo.tx_hash == *hash && utxo.index == *index)
                })
            })
            .cloned()
            .collect();
        Ok(rows)
    }

    async fn sa_withdraw_by_nonce(
        &self,
        chain: &str,
        nonce: u64,
    ) -> Result<Option<BtcWithdraw>, Error> {
        Ok(self
            .lock()
            .await
            .sa_withdraws
            .get(&(chain.to_owned(), nonce))
            .cloned())
    }

    async fn ping(&self) -> Result<(), Error> {
        Ok(())
    }
}

impl DbWrite for SharedStore {
    async fn insert_deposits_if_missing(
        &self,
        kind: ChainKind,
        deposits: &[Deposit],
    ) -> Result<(), Error> {
        let mut store = self.lock().await;
        for deposit in deposits {
            let key = deposit_key(&deposit.transfer.chain_symbol, deposit);
            store
                .deposits_mut(kind)
                .entry(key)
                .or_insert_with(|| deposit.clone());
        }
        Ok(())
    }

    async fn upsert_deposits(&self, kind: ChainKind, deposits: &[Deposit]) -> Result<(), Error> {
        let mut store = self.lock().await;
        for deposit in deposits {
            let key = deposit_key(&deposit.transfer.chain_symbol, deposit);
            store.deposits_mut(kind).insert(key, deposit.clone());
        }
        Ok(())
    }

    async fn finalize_deposits(
        &self,
        kind: ChainKind,
        chain: &str,
        finalized_block: BlockNumber,
        tx_hashes: &[TxHash],
    ) -> Result<(), Error> {
        let mut store = self.lock().await;
        for deposit in store.deposits_mut(kind).values_mut() {
            if deposit.transfer.chain_symbol == chain
                && deposit.status == DepositStatus::Pending
                && deposit.transfer.block_number <= finalized_block
                && tx_hashes.contains(&deposit.transfer.tx_hash)
            {
                deposit.status = DepositStatus::Finalized;
            }
        }
        Ok(())
    }

    async fn reorg_deposits_in_range(
        &self,
        kind: ChainKind,
        chain: &str,
        from_block: BlockNumber,
        to_block: BlockNumber,
        prev: DepositStatus,
    ) -> Result<(), Error> {
        let mut store = self.lock().await;
        for deposit in store.deposits_mut(kind).values_mut() {
            if deposit.transfer.chain_symbol == chain
                && deposit.status == prev
                && deposit.transfer.block_number >= from_block
                && deposit.transfer.block_number <= to_block
            {
                deposit.status = DepositStatus::Reorg;
            }
        }
        Ok(())
    }

    async fn reorg_deposits_by_tx(
        &self,
        kind: ChainKind,
        chain: &str,
        tx_hashes: &[TxHash],
        prev: DepositStatus,
    ) -> Result<(), Error> {
        let mut store = self.lock().await;
        for deposit in store.deposits_mut(kind).values_mut() {
            if deposit.transfer.chain_symbol == chain
                && deposit.status == prev
                && tx_hashes.contains(&deposit.transfer.tx_hash)
            {
                deposit.status = DepositStatus::Reorg;
            }
        }
        Ok(())
    }

    async fn insert_user_addresses(
        &self,
        kind: ChainKind,
        addresses: &[UserAddress],
    ) -> Result<(), Error> {
        let mut store = self.lock().await;
        for address in addresses {
            store
                .addresses_mut(kind)
                .entry(address.user_id)
                .or_insert_with(|| address.clone());
        }
        Ok(())
    }

    async fn insert_token_decimals(
        &self,
        chain: &str,
        token: &str,
        decimals: u8,
    ) -> Result<(), Error> {
        self.lock()
            .await
            .tokens
            .insert((chain.to_owned(), token.to_owned()), decimals);
        Ok(())
    }

    async fn set_last_observed_block(
        &self,
        chain: &str,
        block: BlockNumber,
    ) -> Result<(), Error> {
        self.lock()
            .await
            .last_observed_blocks
            .insert(chain.to_owned(), block);
        Ok(())
    }

    async fn set_last_withdraw_nonce(&self, chain: &str, nonce: i64) -> Result<(), Error> {
        self.lock()
            .await
            .last_withdraw_nonces
            .insert(chain.to_owned(), nonce);
        Ok(())
    }

    async fn insert_utxos_if_missing(&self, utxos: &[Utxo]) -> Result<(), Error> {
        let mut store = self.lock().await;
        for utxo in utxos {
            store
                .utxos
                .entry((utxo.tx_hash.clone(), utxo.index))
                .or_insert_with(|| utxo.clone());
        }
        Ok(())
    }

    async fn set_utxo_status(
        &self,
        tx_hash: &str,
        index: u32,
        status: UtxoStatus,
    ) -> Result<(), Error> {
        let mut store = self.lock().await;
        if let Some(utxo) = store.utxos.get_mut(&(tx_hash.to_owned(), index)) {
            utxo.status = status;
        }
        Ok(())
    }

    async fn insert_evm_withdraws_if_missing(
        &self,
        withdraws: &[EvmWithdraw],
    ) -> Result<(), Error> {
        let mut store = self.lock().await;
        for withdraw in withdraws {
            store
                .evm_withdraws
                .entry((withdraw.chain_symbol.clone(), withdraw.nonce))
                .or_insert_with(|| withdraw.clone());
        }
        Ok(())
    }

    async fn insert_btc_withdraws_if_missing(
        &self,
        withdraws: &[BtcWithdraw],
    ) -> Result<(), Error> {
        let mut store = self.lock().await;
        for withdraw in withdraws {
            store
                .btc_withdraws
                .entry((withdraw.chain_symbol.clone(), withdraw.nonce))
                .or_insert_with(|| withdraw.clone());
        }
        Ok(())
    }

    async fn upsert_evm_withdraw(&self, withdraw: &EvmWithdraw) -> Result<(), Error> {
        self.lock().await.evm_withdraws.insert(
            (withdraw.chain_symbol.clone(), withdraw.nonce),
            withdraw.clone(),
        );
        Ok(())
    }

    async fn upsert_btc_withdraw(&self, withdraw: &BtcWithdraw) -> Result<(), Error> {
        self.lock().await.btc_withdraws.insert(
            (withdraw.chain_symbol.clone(), withdraw.nonce),
            withdraw.clone(),
        );
        Ok(())
    }

    async fn insert_sa_withdraw_if_missing(
        &self,
        withdraw: &BtcWithdraw,
    ) -> Result<BtcWithdraw, Error> {
        let mut store = self.lock().await;
        let row = store
            .sa_withdraws
            .entry((withdraw.chain_symbol.clone(), withdraw.nonce))
            .or_insert_with(|| withdraw.clone());
        Ok(row.clone())
    }
}
