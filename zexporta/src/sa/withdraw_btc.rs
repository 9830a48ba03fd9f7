//! # Bitcoin withdraw round
//!
//! Two phases, because UTXO selection is non-local across nodes.
//!
//! Phase A runs once per withdraw, on rows in PROCESSING: the SA selects
//! inputs from the UNSPENT pool largest-first, marks them SPEND, commits
//! the proposed transaction shape to the sequencer, records the returned
//! index, and moves the row to PENDING.
//!
//! Phase B runs on PENDING rows: the validators replay the
//! sequencer-confirmed shape and agree on the exact serialized
//! transaction; the threshold key then signs each input's taproot digest
//! and the SA broadcasts. A hash mismatch rejects the withdraw and the
//! committed UTXOs deliberately stay SPEND: they are never recycled
//! automatically, a double spend is worse than a stuck withdraw.

use std::time::Duration;

use bitcoin::sighash::TapSighashType;

use clients::btc::BtcClient;
use clients::ChainClient as _;

use crate::error::Error;
use crate::sequencer::Sequencer;
use crate::storage::model::{BtcWithdraw, UtxoStatus, WithdrawStatus};
use crate::storage::{DbRead, DbWrite};
use crate::threshold::{DkgKey, SigningRequest, ThresholdSigner};
use crate::utxo::{build_withdraw_tx, select_utxos, WithdrawTransaction};

/// Bitcoin withdraw-round parameters.
#[derive(Debug, Clone)]
pub struct BtcWithdrawConfig {
    /// The chain symbol rows are keyed by.
    pub chain_symbol: String,
    /// Vault taproot address, receiving change.
    pub vault_address: String,
    /// The address network.
    pub network: bitcoin::Network,
    /// Pause between rounds.
    pub delay: Duration,
}

/// The Bitcoin withdraw driver.
#[derive(Debug)]
pub struct BtcWithdrawRound<S, T, Q> {
    /// Shared storage.
    pub store: S,
    /// Threshold-signature capability.
    pub signer: T,
    /// Ordering service for UTXO commits.
    pub sequencer: Q,
    /// Bitcoin client for fees and broadcast.
    pub client: BtcClient,
    /// The DKG key the validators hold shares of.
    pub dkg_key: DkgKey,
    /// Round parameters.
    pub config: BtcWithdrawConfig,
}

impl<S, T, Q> BtcWithdrawRound<S, T, Q>
where
    S: DbRead + DbWrite + Sync,
    T: ThresholdSigner,
    Q: Sequencer,
{
    /// Run the two-phase loop.
    #[tracing::instrument(skip_all, fields(chain = %self.config.chain_symbol))]
    pub async fn run(self) {
        tracing::info!("starting bitcoin withdraw rounds");
        loop {
            if let Err(error) = self.phase_a().await {
                tracing::warn!(%error, "phase A failed; retrying next round");
            }
            if let Err(error) = self.phase_b().await {
                tracing::warn!(%error, "phase B failed; retrying next round");
            }
            tokio::time::sleep(self.config.delay).await;
        }
    }

    /// Phase A: selection and sequencer commit for PROCESSING rows.
    pub async fn phase_a(&self) -> Result<(), Error> {
        let withdraws = self
            .store
            .btc_withdraws_by_status(&self.config.chain_symbol, WithdrawStatus::Processing)
            .await?;

        for mut withdraw in withdraws {
            // An earlier attempt may have committed inputs already; a
            // retry must reuse them instead of double-selecting.
            if withdraw.utxos.is_empty() {
                let sat_per_byte = self.client.fee_per_byte().await?;
                let unspent = self.store.utxos_by_status(UtxoStatus::Unspent).await?;
                let (selected, fee) = select_utxos(
                    &unspent,
                    withdraw.amount,
                    &withdraw.recipient,
                    &self.config.vault_address,
                    self.config.network,
                    sat_per_byte,
                )?;
                tracing::info!(
                    nonce = withdraw.nonce,
                    inputs = selected.len(),
                    fee,
                    sat_per_byte,
                    "selected withdraw inputs"
                );

                for utxo in &selected {
                    self.store
                        .set_utxo_status(&utxo.tx_hash, utxo.index, UtxoStatus::Spend)
                        .await?;
                }

                withdraw.utxos = selected;
                withdraw.sat_per_byte = Some(sat_per_byte);
                self.store.upsert_btc_withdraw(&withdraw).await?;
            }

            let entry = serde_json::to_value(&withdraw)
                .map_err(|error| Error::Sequencer(error.to_string()))?;
            let index = self.sequencer.post_entry(&entry).await?;

            withdraw.zellular_index = Some(index);
            withdraw.status = WithdrawStatus::Pending;
            self.store.upsert_btc_withdraw(&withdraw).await?;
            tracing::info!(nonce = withdraw.nonce, index, "withdraw committed to sequencer");
        }

        Ok(())
    }

    /// Phase B: agreement, signing, and broadcast for PENDING rows.
    pub async fn phase_b(&self) -> Result<(), Error> {
        let withdraws = self
            .store
            .btc_withdraws_by_status(&self.config.chain_symbol, WithdrawStatus::Pending)
            .await?;

        for mut withdraw in withdraws {
            let nonce = withdraw.nonce;
            match self.process(&mut withdraw).await {
                Ok(()) => tracing::info!(nonce, "withdraw broadcast"),
                Err(error @ Error::DifferentHash { .. }) => {
                    // The committed inputs stay SPEND; operators recycle
                    // them manually after investigating.
                    tracing::error!(nonce, %error, "rejecting withdraw");
                    withdraw.status = WithdrawStatus::Rejected;
                    self.store.upsert_btc_withdraw(&withdraw).await?;
                }
                Err(error) => return Err(error),
            }
        }

        Ok(())
    }

    async fn process(&self, withdraw: &mut BtcWithdraw) -> Result<(), Error> {
        let sat_per_byte = withdraw
            .sat_per_byte
            .ok_or_else(|| Error::InvalidValue("withdraw has no committed fee rate".into()))?;

        let mut built = build_withdraw_tx(
            &withdraw.utxos,
            withdraw.amount,
            &withdraw.recipient,
            &self.config.vault_address,
            self.config.network,
            sat_per_byte,
        )?;

        // Agreement round over the exact serialized transaction.
        let nonces = self.signer.request_nonces(&self.dkg_key.party).await?;
        let request = SigningRequest {
            method: "withdraw".to_owned(),
            data: serde_json::to_value(&withdraw)
                .map_err(|error| Error::InvalidValue(error.to_string()))?,
        };
        let reply = self
            .signer
            .request_signature(&self.dkg_key, &nonces, &request, &self.dkg_key.party)
            .await?;
        if !reply.is_successful() {
            return Err(Error::ValidatorReject(reply.result));
        }

        let our_hex = built.to_hex();
        if reply.message_hash != our_hex {
            return Err(Error::DifferentHash {
                ours: our_hex,
                theirs: reply.message_hash,
            });
        }

        let signatures = self.sign_inputs(withdraw, &built).await?;
        built.attach_witnesses(signatures);

        // Broadcast failures leave the row PENDING; the next round
        // rebuilds the identical transaction and tries again.
        let txid = self.client.send_raw(&built.to_hex()).await?;
        withdraw.tx_hash = Some(txid);
        withdraw.status = WithdrawStatus::Successful;
        self.store.upsert_btc_withdraw(withdraw).await?;
        Ok(())
    }

    /// One threshold signing round per input, over that input's taproot
    /// `SIGHASH_ALL` digest.
    async fn sign_inputs(
        &self,
        withdraw: &BtcWithdraw,
        built: &WithdrawTransaction,
    ) -> Result<Vec<bitcoin::taproot::Signature>, Error> {
        let mut signatures = Vec::with_capacity(built.sighashes.len());

        for (input_index, digest) in built.sighashes.iter().enumerate() {
            let nonces = self.signer.request_nonces(&self.dkg_key.party).await?;
            let request = SigningRequest {
                method: "withdraw".to_owned(),
                data: serde_json::json!({
                    "chain_symbol": self.config.chain_symbol,
                    "sa_withdraw_nonce": withdraw.nonce,
                    "input_index": input_index,
                    "sighash": hex::encode(digest),
                }),
            };

            let reply = self
                .signer
                .request_signature(&self.dkg_key, &nonces, &request, &self.dkg_key.party)
                .await?;
            if !reply.is_successful() {
                return Err(Error::ValidatorReject(format!(
                    "input {input_index}: {}",
                    reply.result
                )));
            }

            let bytes = reply.signature_bytes()?;
            let signature = bitcoin::secp256k1::schnorr::Signature::from_slice(&bytes)
                .map_err(|error| Error::InvalidValue(format!("schnorr signature: {error}")))?;
            signatures.push(bitcoin::taproot::Signature {
                signature,
                sighash_type: TapSighashType::All,
            });
        }

        Ok(signatures)
    }
}
