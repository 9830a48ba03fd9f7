//! # SA deposit round
//!
//! Batches FINALIZED deposits per chain, drives a threshold-signature
//! round with the validator set over the batch's transaction hashes, and
//! on success submits the signed, deterministically encoded batch to Zex
//! and promotes the deposits to VERIFIED. Deposits the validators did not
//! confirm lost the race and are demoted to REORG.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use alloy_signer_local::PrivateKeySigner;

use clients::TxHash;

use crate::encoder::{self, DEPOSIT_OPERATION};
use crate::error::Error;
use crate::sa::evm_sender::shield_sign;
use crate::sa::latin1;
use crate::storage::model::{sort_deposits, ChainKind, Deposit, DepositStatus};
use crate::storage::{DbRead, DbWrite};
use crate::threshold::{DkgKey, SigningRequest, ThresholdSigner};
use crate::zex::ZexClient;

/// Per-chain deposit-round parameters.
#[derive(Debug, Clone)]
pub struct DepositRoundConfig {
    /// The chain symbol rows are keyed by.
    pub chain_symbol: String,
    /// The chain family, selecting the deposit collection.
    pub kind: ChainKind,
    /// Pause between rounds.
    pub delay: Duration,
    /// How many finalized deposits one round signs over.
    pub batch_size: usize,
    /// Version byte of the batch encoding.
    pub encode_version: u8,
}

/// The deposit-round driver for a single chain.
#[derive(Debug)]
pub struct SaDepositRound<S, T> {
    /// Shared storage.
    pub store: S,
    /// Threshold-signature capability.
    pub signer: T,
    /// Zex client for batch submission.
    pub zex: ZexClient,
    /// The DKG key the validators hold shares of.
    pub dkg_key: DkgKey,
    /// The SA's shield key.
    pub shield: PrivateKeySigner,
    /// Round parameters.
    pub config: DepositRoundConfig,
}

impl<S, T> SaDepositRound<S, T>
where
    S: DbRead + DbWrite + Sync,
    T: ThresholdSigner,
{
    /// Run the round loop. Each outcome arm is handled explicitly; no
    /// state is mutated on an aborted round.
    #[tracing::instrument(skip_all, fields(chain = %self.config.chain_symbol))]
    pub async fn run(self) {
        tracing::info!("starting SA deposit rounds");
        loop {
            match self.tick().await {
                Ok(true) => {}
                Ok(false) => tokio::time::sleep(self.config.delay).await,
                Err(Error::DifferentHash { ours, theirs }) => {
                    tracing::error!(%ours, %theirs, "validators hashed a different batch; aborting round");
                    tokio::time::sleep(self.config.delay).await;
                }
                Err(Error::ValidatorReject(reason)) => {
                    tracing::warn!(%reason, "validators rejected the round");
                    tokio::time::sleep(self.config.delay).await;
                }
                Err(error) => {
                    tracing::warn!(%error, "deposit round failed; backing off");
                    tokio::time::sleep(self.config.delay).await;
                }
            }
        }
    }

    /// Run one round. Returns whether there was a batch to process.
    pub async fn tick(&self) -> Result<bool, Error> {
        let chain = &self.config.chain_symbol;

        let batch = self
            .store
            .deposits_by_status(
                self.config.kind,
                chain,
                DepositStatus::Finalized,
                None,
                Some(self.config.batch_size),
            )
            .await?;
        let Some(last) = batch.last() else {
            tracing::debug!("no finalized deposits to sign");
            return Ok(false);
        };

        let finalized_block = last.transfer.block_number;
        let mut txs: Vec<TxHash> = batch
            .iter()
            .map(|deposit| deposit.transfer.tx_hash.clone())
            .collect();
        txs.dedup();

        let timestamp = unix_now();
        tracing::info!(count = txs.len(), finalized_block, "starting deposit round");

        let nonces = self.signer.request_nonces(&self.dkg_key.party).await?;
        let request = SigningRequest {
            method: "deposit".to_owned(),
            data: serde_json::json!({
                "txs": txs,
                "timestamp": timestamp,
                "chain_symbol": chain,
                "finalized_block_number": finalized_block,
            }),
        };

        let reply = self
            .signer
            .request_signature(&self.dkg_key, &nonces, &request, &self.dkg_key.party)
            .await?;
        if !reply.is_successful() {
            return Err(Error::ValidatorReject(reply.result));
        }

        let mut deposits: Vec<Deposit> = reply
            .node_data()
            .and_then(|data| data.get("deposits"))
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|error| Error::ValidatorReject(format!("undecodable deposits: {error}")))?
            .unwrap_or_default();
        sort_deposits(&mut deposits);

        let encoded = encoder::encode_deposit_batch(
            self.config.encode_version,
            DEPOSIT_OPERATION,
            &deposits,
            chain,
        );
        let our_hash = encoder::deposit_batch_hash(&encoded);
        if our_hash != reply.message_hash {
            return Err(Error::DifferentHash {
                ours: our_hash,
                theirs: reply.message_hash,
            });
        }

        // Payload: encoded_data ‖ nonce ‖ signature ‖ shield_signature.
        let mut payload = encoded.clone();
        payload.extend_from_slice(reply.nonce.as_bytes());
        payload.extend_from_slice(&reply.signature_u256()?.to_be_bytes::<32>());
        payload.extend_from_slice(shield_sign(&self.shield, &encoded)?.as_bytes());

        self.zex.send_deposit(latin1(&payload)).await?;

        // Both transitions are idempotent: the upsert carries VERIFIED
        // with the round's timestamp, and the demotion only touches rows
        // the validators left FINALIZED.
        self.store.upsert_deposits(self.config.kind, &deposits).await?;
        self.store
            .reorg_deposits_by_tx(self.config.kind, chain, &txs, DepositStatus::Finalized)
            .await?;

        tracing::info!(verified = deposits.len(), "deposit round complete");
        Ok(true)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}
