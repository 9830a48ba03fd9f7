//! # Finalizer
//!
//! Promotes PENDING deposits whose block has passed the finality depth
//! and whose transaction is still present on-chain to FINALIZED, and
//! demotes the rest of each window to REORG. This demotion is the only
//! mechanism by which orphaned transactions are handled; the observer
//! cursor never moves backward.
//!
//! Chains can attach a middleware that runs on every promotion and
//! demotion; Bitcoin uses it to materialize the UTXO pool
//! (PROCESSING → UNSPENT on finalize, → REJECTED on reorg).

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use futures::future::try_join_all;

use clients::{ChainClient, ClientError, TxHash};

use crate::error::Error;
use crate::storage::model::{ChainKind, Deposit, DepositStatus, UtxoStatus};
use crate::storage::{DbRead, DbWrite};

/// Hook invoked around each finalization window.
pub trait FinalizerMiddleware<S>: Send + Sync {
    /// Called with the deposits about to be promoted to FINALIZED.
    fn on_finalized(
        &self,
        store: &S,
        deposits: &[Deposit],
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Called with the deposits about to be demoted to REORG.
    fn on_reorg(
        &self,
        store: &S,
        deposits: &[Deposit],
    ) -> impl Future<Output = Result<(), Error>> + Send;
}

/// No-op middleware for chains without side effects.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMiddleware;

impl<S: Sync> FinalizerMiddleware<S> for NoMiddleware {
    async fn on_finalized(&self, _store: &S, _deposits: &[Deposit]) -> Result<(), Error> {
        Ok(())
    }

    async fn on_reorg(&self, _store: &S, _deposits: &[Deposit]) -> Result<(), Error> {
        Ok(())
    }
}

/// Bitcoin middleware: moves the backing UTXO rows in lockstep with the
/// deposit state machine.
#[derive(Debug, Clone, Copy, Default)]
pub struct BtcUtxoMiddleware;

impl<S: DbWrite + Sync> FinalizerMiddleware<S> for BtcUtxoMiddleware {
    async fn on_finalized(&self, store: &S, deposits: &[Deposit]) -> Result<(), Error> {
        for deposit in deposits {
            store
                .set_utxo_status(
                    &deposit.transfer.tx_hash,
                    deposit.transfer.vout.unwrap_or(0),
                    UtxoStatus::Unspent,
                )
                .await?;
        }
        Ok(())
    }

    async fn on_reorg(&self, store: &S, deposits: &[Deposit]) -> Result<(), Error> {
        for deposit in deposits {
            store
                .set_utxo_status(
                    &deposit.transfer.tx_hash,
                    deposit.transfer.vout.unwrap_or(0),
                    UtxoStatus::Rejected,
                )
                .await?;
        }
        Ok(())
    }
}

/// Per-chain finalizer parameters.
#[derive(Debug, Clone)]
pub struct FinalizerConfig {
    /// The chain symbol rows are keyed by.
    pub chain_symbol: String,
    /// The chain family, selecting the deposit collection.
    pub kind: ChainKind,
    /// Loop delay.
    pub delay: Duration,
    /// Blocks checked per window.
    pub batch_block_size: u64,
}

/// The finalizer for a single chain.
#[derive(Debug)]
pub struct Finalizer<C, S, M> {
    /// Chain RPC client.
    pub client: C,
    /// Shared storage.
    pub store: S,
    /// Chain-specific side effects.
    pub middleware: M,
    /// Loop parameters.
    pub config: FinalizerConfig,
}

impl<C, S, M> Finalizer<C, S, M>
where
    C: ChainClient,
    S: DbRead + DbWrite + Sync,
    M: FinalizerMiddleware<S>,
{
    /// Run the finalizer loop.
    #[tracing::instrument(skip_all, fields(chain = %self.config.chain_symbol))]
    pub async fn run(self) {
        tracing::info!("starting finalizer");
        loop {
            if let Err(error) = self.tick().await {
                tracing::warn!(%error, "finalizer iteration failed; backing off");
                tokio::time::sleep(self.config.delay).await;
            }
        }
    }

    /// A single finalization iteration.
    pub async fn tick(&self) -> Result<(), Error> {
        let chain = &self.config.chain_symbol;
        let finalized = self.client.finalized_block().await?;

        let blocks = self
            .store
            .pending_deposit_blocks(self.config.kind, chain, finalized)
            .await?;
        if blocks.is_empty() {
            tracing::debug!(finalized, "no pending deposits below the finalized block");
            tokio::time::sleep(self.config.delay).await;
            return Ok(());
        }

        for window in blocks.chunks(self.config.batch_block_size as usize) {
            self.finalize_window(window, finalized).await?;
        }

        Ok(())
    }

    async fn finalize_window(&self, window: &[u64], finalized: u64) -> Result<(), Error> {
        let chain = &self.config.chain_symbol;
        let (window_min, window_max) = match (window.first(), window.last()) {
            (Some(first), Some(last)) => (*first, *last),
            _ => return Ok(()),
        };

        // A block the chain no longer knows about has no surviving
        // transactions; its deposits fall through to the reorg demotion.
        let hash_sets = try_join_all(window.iter().map(|&block| async move {
            match self.client.block_tx_hashes(block).await {
                Ok(hashes) => Ok(hashes),
                Err(ClientError::NotFound(_)) => Ok(Vec::new()),
                Err(error) => Err(error),
            }
        }))
        .await?;
        let on_chain: HashSet<TxHash> = hash_sets.into_iter().flatten().collect();

        let pending = self
            .store
            .deposits_by_status(self.config.kind, chain, DepositStatus::Pending, None, None)
            .await?;

        let in_window = |deposit: &Deposit| {
            let block = deposit.transfer.block_number;
            block >= window_min && block <= window_max
        };
        let (promoted, demoted): (Vec<Deposit>, Vec<Deposit>) = pending
            .into_iter()
            .filter(in_window)
            .partition(|deposit| {
                deposit.transfer.block_number <= finalized
                    && on_chain.contains(&deposit.transfer.tx_hash)
            });

        if !promoted.is_empty() {
            tracing::info!(count = promoted.len(), finalized, "finalizing deposits");
            self.middleware.on_finalized(&self.store, &promoted).await?;

            let tx_hashes: Vec<TxHash> = promoted
                .iter()
                .map(|deposit| deposit.transfer.tx_hash.clone())
                .collect();
            self.store
                .finalize_deposits(self.config.kind, chain, finalized, &tx_hashes)
                .await?;
        }

        if !demoted.is_empty() {
            tracing::warn!(count = demoted.len(), window_min, window_max, "demoting reorged deposits");
            self.middleware.on_reorg(&self.store, &demoted).await?;
        }
        self.store
            .reorg_deposits_in_range(
                self.config.kind,
                chain,
                window_min,
                window_max,
                DepositStatus::Pending,
            )
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::{SharedStore, Store};
    use crate::storage::model::Utxo;
    use crate::testing::{deposit, transfer, MockChain};
    use test_log::test;

    fn finalizer(
        chain: MockChain,
        store: SharedStore,
        kind: ChainKind,
        symbol: &str,
    ) -> Finalizer<MockChain, SharedStore, NoMiddleware> {
        Finalizer {
            client: chain,
            store,
            middleware: NoMiddleware,
            config: FinalizerConfig {
                chain_symbol: symbol.to_owned(),
                kind,
                delay: Duration::ZERO,
                batch_block_size: 5,
            },
        }
    }

    #[test(tokio::test)]
    async fn promotes_surviving_deposits_below_the_finalized_block() {
        let mut chain = MockChain::new("SEP", 105, 101);
        chain.add_transfer(transfer("SEP", "0xd1", "0xAAA", 100));

        let store = Store::new_shared();
        store
            .insert_deposits_if_missing(
                ChainKind::Evm,
                &[deposit("SEP", "0xd1", "0xAAA", 100, 7, DepositStatus::Pending)],
            )
            .await
            .unwrap();

        finalizer(chain, store.clone(), ChainKind::Evm, "SEP")
            .tick()
            .await
            .unwrap();

        let finalized = store
            .deposits_by_status(ChainKind::Evm, "SEP", DepositStatus::Finalized, None, None)
            .await
            .unwrap();
        assert_eq!(finalized.len(), 1);
    }

    #[test(tokio::test)]
    async fn demotes_deposits_whose_tx_vanished() {
        // Block 200 no longer carries the deposit's transaction.
        let mut chain = MockChain::new("SEP", 206, 205);
        chain.add_transfer(transfer("SEP", "0xgone", "0xAAA", 200));
        chain.missing.insert("0xgone".to_owned());

        let store = Store::new_shared();
        store
            .insert_deposits_if_missing(
                ChainKind::Evm,
                &[deposit("SEP", "0xgone", "0xAAA", 200, 7, DepositStatus::Pending)],
            )
            .await
            .unwrap();

        finalizer(chain, store.clone(), ChainKind::Evm, "SEP")
            .tick()
            .await
            .unwrap();

        let reorged = store
            .deposits_by_status(ChainKind::Evm, "SEP", DepositStatus::Reorg, None, None)
            .await
            .unwrap();
        assert_eq!(reorged.len(), 1);

        // A reorged deposit can never become verified.
        let verified = store
            .deposits_by_status(ChainKind::Evm, "SEP", DepositStatus::Verified, None, None)
            .await
            .unwrap();
        assert!(verified.is_empty());
    }

    #[test(tokio::test)]
    async fn pending_deposits_above_finality_are_left_alone() {
        let mut chain = MockChain::new("SEP", 105, 101);
        chain.add_transfer(transfer("SEP", "0xd2", "0xAAA", 104));

        let store = Store::new_shared();
        store
            .insert_deposits_if_missing(
                ChainKind::Evm,
                &[deposit("SEP", "0xd2", "0xAAA", 104, 7, DepositStatus::Pending)],
            )
            .await
            .unwrap();

        finalizer(chain, store.clone(), ChainKind::Evm, "SEP")
            .tick()
            .await
            .unwrap();

        let pending = store
            .deposits_by_status(ChainKind::Evm, "SEP", DepositStatus::Pending, None, None)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[test(tokio::test)]
    async fn btc_middleware_materializes_utxos() {
        let mut chain = MockChain::new("BTC", 105, 101);
        let mut surviving = transfer("BTC", "f1", "bcrt1qaaa", 100);
        surviving.vout = Some(0);
        chain.add_transfer(surviving);
        let mut gone = transfer("BTC", "f2", "bcrt1qbbb", 100);
        gone.vout = Some(0);
        chain.add_transfer(gone);
        chain.missing.insert("f2".to_owned());

        let store = Store::new_shared();
        let mut d1 = deposit("BTC", "f1", "bcrt1qaaa", 100, 1, DepositStatus::Pending);
        d1.transfer.vout = Some(0);
        let mut d2 = deposit("BTC", "f2", "bcrt1qbbb", 100, 2, DepositStatus::Pending);
        d2.transfer.vout = Some(0);
        store
            .insert_deposits_if_missing(ChainKind::Btc, &[d1.clone(), d2.clone()])
            .await
            .unwrap();
        store
            .insert_utxos_if_missing(&[
                Utxo {
                    tx_hash: "f1".to_owned(),
                    index: 0,
                    amount: 5000,
                    address: "bcrt1qaaa".to_owned(),
                    status: UtxoStatus::Processing,
                    user_id: 1,
                },
                Utxo {
                    tx_hash: "f2".to_owned(),
                    index: 0,
                    amount: 7000,
                    address: "bcrt1qbbb".to_owned(),
                    status: UtxoStatus::Processing,
                    user_id: 2,
                },
            ])
            .await
            .unwrap();

        let finalizer = Finalizer {
            client: chain,
            store: store.clone(),
            middleware: BtcUtxoMiddleware,
            config: FinalizerConfig {
                chain_symbol: "BTC".to_owned(),
                kind: ChainKind::Btc,
                delay: Duration::ZERO,
                batch_block_size: 5,
            },
        };
        finalizer.tick().await.unwrap();

        let unspent = store.utxos_by_status(UtxoStatus::Unspent).await.unwrap();
        assert_eq!(unspent.len(), 1);
        assert_eq!(unspent[0].tx_hash, "f1");

        let rejected = store.utxos_by_status(UtxoStatus::Rejected).await.unwrap();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].tx_hash, "f2");
    }
}
