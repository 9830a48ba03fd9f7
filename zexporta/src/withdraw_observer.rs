//! # Withdraw observer
//!
//! Pulls new withdraw requests from Zex per chain, strictly in nonce
//! order, and persists them for the SA rounds. The per-chain nonce
//! cursor never moves backward; a page shorter than the gap simply
//! re-fetches the tail next tick, which the `(chain, nonce)` uniqueness
//! key makes harmless.

use std::time::Duration;

use crate::error::Error;
use crate::storage::model::{BtcWithdraw, ChainKind, EvmWithdraw, WithdrawStatus};
use crate::storage::{DbRead, DbWrite};
use crate::zex::{ZexClient, ZexWithdraw};

/// Per-chain withdraw-observer parameters.
#[derive(Debug, Clone)]
pub struct WithdrawObserverConfig {
    /// The chain symbol rows are keyed by.
    pub chain_symbol: String,
    /// The chain family.
    pub kind: ChainKind,
    /// Numeric chain id (EVM only), bound into withdraw hashes.
    pub chain_id: Option<u64>,
    /// Loop delay.
    pub delay: Duration,
}

/// The withdraw observer for a single chain.
#[derive(Debug)]
pub struct WithdrawObserver<S> {
    /// Shared storage.
    pub store: S,
    /// Zex client.
    pub zex: ZexClient,
    /// Loop parameters.
    pub config: WithdrawObserverConfig,
}

impl<S> WithdrawObserver<S>
where
    S: DbRead + DbWrite + Sync,
{
    /// Run the observer loop.
    #[tracing::instrument(skip_all, fields(chain = %self.config.chain_symbol))]
    pub async fn run(self) {
        tracing::info!("starting withdraw observer");
        loop {
            if let Err(error) = self.tick().await {
                tracing::warn!(%error, "withdraw observation failed; backing off");
            }
            tokio::time::sleep(self.config.delay).await;
        }
    }

    /// A single observation iteration.
    pub async fn tick(&self) -> Result<(), Error> {
        let chain = &self.config.chain_symbol;

        let last = self.store.last_withdraw_nonce(chain).await?;
        let zex_last = self.zex.last_withdraw_nonce(chain).await?;
        if last >= zex_last {
            tracing::debug!(last, "no new withdraws");
            return Ok(());
        }

        let withdraws = self.zex.withdraws(chain, last + 1, None).await?;
        if withdraws.is_empty() {
            return Ok(());
        }
        let count = withdraws.len() as i64;

        match self.config.kind {
            ChainKind::Evm => {
                let rows = withdraws
                    .iter()
                    .map(|raw| self.into_evm_withdraw(raw))
                    .collect::<Result<Vec<EvmWithdraw>, Error>>()?;
                self.store.insert_evm_withdraws_if_missing(&rows).await?;
            }
            ChainKind::Btc => {
                let rows = withdraws
                    .iter()
                    .map(|raw| self.into_btc_withdraw(raw))
                    .collect::<Result<Vec<BtcWithdraw>, Error>>()?;
                self.store.insert_btc_withdraws_if_missing(&rows).await?;
            }
        }

        tracing::info!(count, from_nonce = last + 1, "observed new withdraws");
        self.store
            .set_last_withdraw_nonce(chain, last + count)
            .await?;
        Ok(())
    }

    fn into_evm_withdraw(&self, raw: &ZexWithdraw) -> Result<EvmWithdraw, Error> {
        Ok(EvmWithdraw {
            chain_symbol: self.config.chain_symbol.clone(),
            nonce: raw.nonce,
            amount: raw.evm_amount()?,
            recipient: clients::evm::checksum_address(&raw.destination)?,
            token_address: clients::evm::checksum_address(
                raw.token_contract
                    .as_deref()
                    .ok_or_else(|| Error::InvalidValue("withdraw has no token contract".into()))?,
            )?,
            chain_id: self
                .config
                .chain_id
                .ok_or_else(|| Error::Config("evm chain without chain id".into()))?,
            status: WithdrawStatus::Pending,
            tx_hash: None,
        })
    }

    /// Bitcoin withdraws enter the pipeline in PROCESSING: phase A of
    /// the withdraw round owns the PROCESSING → PENDING transition.
    fn into_btc_withdraw(&self, raw: &ZexWithdraw) -> Result<BtcWithdraw, Error> {
        Ok(BtcWithdraw {
            chain_symbol: self.config.chain_symbol.clone(),
            nonce: raw.nonce,
            amount: raw.btc_amount_sats()?,
            recipient: raw.destination.clone(),
            status: WithdrawStatus::Processing,
            tx_hash: None,
            utxos: Vec::new(),
            sat_per_byte: None,
            zellular_index: None,
        })
    }
}
