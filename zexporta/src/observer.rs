//! # Deposit observer
//!
//! One observer task runs per chain. It owns the durable
//! `last_observed_block` cursor, drives the explorer forward in bounded
//! windows, persists the resulting PENDING deposits (and, for Bitcoin,
//! the PROCESSING UTXO rows), and only then advances the cursor. Reorgs
//! are never handled by rewinding: the cursor is monotonic and orphaned
//! deposits are demoted by the finalizer.

use std::time::Duration;

use clients::ChainClient;

use crate::error::Error;
use crate::explorer;
use crate::registry::AddressRegistry;
use crate::storage::model::{ChainKind, Deposit, Utxo, UtxoStatus};
use crate::storage::{DbRead, DbWrite};
use crate::zex::ZexClient;

/// Per-chain observer parameters.
#[derive(Debug, Clone)]
pub struct ObserverConfig {
    /// The chain symbol rows are keyed by.
    pub chain_symbol: String,
    /// The chain family, selecting the deposit collection.
    pub kind: ChainKind,
    /// Loop delay.
    pub delay: Duration,
    /// Window size for explorer batches and cursor advancement.
    pub batch_block_size: u64,
}

/// The deposit observer for a single chain.
#[derive(Debug)]
pub struct DepositObserver<C, S> {
    /// Chain RPC client.
    pub client: C,
    /// Shared storage.
    pub store: S,
    /// Zex client used by the registry sync.
    pub zex: ZexClient,
    /// Deposit-address registry.
    pub registry: AddressRegistry,
    /// Loop parameters.
    pub config: ObserverConfig,
}

impl<C, S> DepositObserver<C, S>
where
    C: ChainClient,
    S: DbRead + DbWrite + Sync,
{
    /// Run the observer loop. Errors are logged and the loop restarts
    /// after a short backoff; the cursor only moves after a fully
    /// persisted iteration.
    #[tracing::instrument(skip_all, fields(chain = %self.config.chain_symbol))]
    pub async fn run(self) {
        tracing::info!("starting deposit observer");
        loop {
            if let Err(error) = self.tick().await {
                tracing::warn!(%error, "observer iteration failed; backing off");
                tokio::time::sleep(self.config.delay).await;
            }
        }
    }

    /// A single observation iteration.
    pub async fn tick(&self) -> Result<(), Error> {
        let chain = &self.config.chain_symbol;
        let latest = self.client.latest_block().await?;
        let last_observed = self.store.last_observed_block(chain).await?;

        if last_observed == Some(latest) {
            tracing::debug!(block = latest, "tip already observed");
            tokio::time::sleep(self.config.delay).await;
            return Ok(());
        }

        let last_observed = last_observed.unwrap_or_else(|| latest.saturating_sub(1));
        let to_block = latest.min(last_observed + self.config.batch_block_size);
        if last_observed >= to_block {
            tracing::warn!(last_observed, to_block, "cursor is ahead of the window");
            tokio::time::sleep(self.config.delay).await;
            return Ok(());
        }

        // Registry failures must not stall observation.
        if let Err(error) = self.registry.sync(&self.store, &self.zex).await {
            tracing::warn!(%error, "address registry sync failed");
        }

        let accepted = self
            .registry
            .active_addresses(&self.store, self.config.kind)
            .await?;
        let deposits = explorer::explore(
            &self.client,
            &self.store,
            last_observed + 1,
            to_block,
            &accepted,
            self.config.batch_block_size,
            self.config.delay,
        )
        .await?;

        if !deposits.is_empty() {
            tracing::info!(count = deposits.len(), to_block, "persisting observed deposits");
            self.store
                .insert_deposits_if_missing(self.config.kind, &deposits)
                .await?;

            if self.config.kind == ChainKind::Btc {
                let utxos = utxos_from_deposits(&deposits);
                self.store.insert_utxos_if_missing(&utxos).await?;
            }
        }

        // The cursor moves last: a crash before this line re-observes the
        // same window, which the upserts make harmless.
        self.store.set_last_observed_block(chain, to_block).await?;

        tokio::time::sleep(self.config.delay).await;
        Ok(())
    }
}

/// The PROCESSING UTXO rows backing freshly observed Bitcoin deposits.
pub fn utxos_from_deposits(deposits: &[Deposit]) -> Vec<Utxo> {
    deposits
        .iter()
        .map(|deposit| Utxo {
            tx_hash: deposit.transfer.tx_hash.clone(),
            index: deposit.transfer.vout.unwrap_or(0),
            amount: u64::try_from(deposit.transfer.value).unwrap_or(u64::MAX),
            address: deposit.transfer.to.clone(),
            status: UtxoStatus::Processing,
            user_id: deposit.user_id,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::{SharedStore, Store};
    use crate::storage::model::DepositStatus;
    use crate::testing::{transfer, MockChain};
    use url::Url;

    const FACTORY: &str = "0x4e59b44847b379578588920cA78FbF26c0B4956C";
    const CODE_HASH: &str = "0x21c35dbe1b344a2488cf3321d6ce542f8e9f305544ff09e4993a62319a497c1f";

    async fn observer(
        chain: MockChain,
        store: SharedStore,
        server: &mockito::Server,
    ) -> DepositObserver<MockChain, SharedStore> {
        DepositObserver {
            client: chain,
            store,
            zex: ZexClient::new(Url::parse(&format!("{}/", server.url())).unwrap()).unwrap(),
            registry: AddressRegistry::new(
                FACTORY.to_owned(),
                CODE_HASH.to_owned(),
                None,
                bitcoin::Network::Regtest,
            )
            .unwrap(),
            config: ObserverConfig {
                chain_symbol: "SEP".to_owned(),
                kind: ChainKind::Evm,
                delay: Duration::ZERO,
                batch_block_size: 5,
            },
        }
    }

    async fn zex_without_users() -> mockito::ServerGuard {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/users/latest-id")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body("{}")
            .create_async()
            .await;
        server
    }

    #[tokio::test]
    async fn observes_new_blocks_and_advances_the_cursor() {
        let server = zex_without_users().await;
        let mut chain = MockChain::new("SEP", 101, 100);
        chain.add_transfer(transfer("SEP", "0xd1", "0xAAA", 100));

        let store = Store::new_shared();
        store.set_last_observed_block("SEP", 99).await.unwrap();
        store
            .insert_user_addresses(
                ChainKind::Evm,
                &[crate::storage::model::UserAddress {
                    user_id: 7,
                    address: "0xAAA".to_owned(),
                    is_active: true,
                }],
            )
            .await
            .unwrap();

        let observer = observer(chain, store.clone(), &server).await;
        observer.tick().await.unwrap();

        let rows = store
            .deposits_by_status(ChainKind::Evm, "SEP", DepositStatus::Pending, None, None)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].user_id, 7);
        assert_eq!(store.last_observed_block("SEP").await.unwrap(), Some(101));
    }

    #[tokio::test]
    async fn reobserving_the_same_window_is_idempotent() {
        let server = zex_without_users().await;
        let mut chain = MockChain::new("SEP", 101, 100);
        chain.add_transfer(transfer("SEP", "0xd1", "0xAAA", 100));

        let store = Store::new_shared();
        store
            .insert_user_addresses(
                ChainKind::Evm,
                &[crate::storage::model::UserAddress {
                    user_id: 7,
                    address: "0xAAA".to_owned(),
                    is_active: true,
                }],
            )
            .await
            .unwrap();

        // Simulate a crash after persisting deposits but before the
        // cursor advanced: the cursor still points at the old block.
        let observer = observer(chain, store.clone(), &server).await;
        store.set_last_observed_block("SEP", 99).await.unwrap();
        observer.tick().await.unwrap();
        store.set_last_observed_block("SEP", 99).await.unwrap();
        observer.tick().await.unwrap();

        let rows = store
            .deposits_by_status(ChainKind::Evm, "SEP", DepositStatus::Pending, None, None)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1, "no duplicate rows after re-observation");
    }

    #[test]
    fn btc_deposits_materialize_processing_utxos() {
        let mut deposit = crate::testing::deposit(
            "BTC",
            "f1",
            "bcrt1qaaa",
            10,
            3,
            DepositStatus::Pending,
        );
        deposit.transfer.vout = Some(2);

        let utxos = utxos_from_deposits(&[deposit]);
        assert_eq!(utxos.len(), 1);
        assert_eq!(utxos[0].index, 2);
        assert_eq!(utxos[0].status, UtxoStatus::Processing);
        assert_eq!(utxos[0].user_id, 3);
    }
}
