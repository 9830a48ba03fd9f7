//! # EVM withdraw round
//!
//! Processes PENDING withdraws strictly in nonce order. For each one the
//! validators independently pull the same nonce from Zex and return the
//! packed withdraw hash; on agreement the SA calls the vault contract
//! with the aggregated signature and the shield signature. A hash
//! mismatch or a contract revert rejects the withdraw and the nonce
//! cursor of the pipeline moves past it.

use std::str::FromStr as _;
use std::time::Duration;

use alloy_primitives::{Address, Bytes, U256};
use alloy_signer_local::PrivateKeySigner;
use alloy_sol_types::SolCall as _;

use crate::encoder::evm_withdraw_hash;
use crate::error::Error;
use crate::sa::contracts::IVault;
use crate::sa::evm_sender::{shield_sign, EvmSender};
use crate::storage::model::{EvmWithdraw, WithdrawStatus};
use crate::storage::{DbRead, DbWrite};
use crate::threshold::{DkgKey, SigningRequest, ThresholdSigner};

/// Per-chain withdraw-round parameters.
#[derive(Debug, Clone)]
pub struct EvmWithdrawConfig {
    /// The chain symbol rows are keyed by.
    pub chain_symbol: String,
    /// Vault contract address.
    pub vault_address: String,
    /// Pause between rounds.
    pub delay: Duration,
    /// Receipt polling attempts before giving up the wait.
    pub receipt_attempts: u32,
    /// Receipt polling interval, roughly the chain's block time.
    pub receipt_interval: Duration,
}

/// The EVM withdraw driver for a single chain.
#[derive(Debug)]
pub struct EvmWithdrawRound<S, T> {
    /// Shared storage.
    pub store: S,
    /// Threshold-signature capability.
    pub signer: T,
    /// The DKG key the validators hold shares of.
    pub dkg_key: DkgKey,
    /// The SA's shield key.
    pub shield: PrivateKeySigner,
    /// The submitting account.
    pub sender: EvmSender,
    /// Round parameters.
    pub config: EvmWithdrawConfig,
}

impl<S, T> EvmWithdrawRound<S, T>
where
    S: DbRead + DbWrite + Sync,
    T: ThresholdSigner,
{
    /// Run the withdraw loop.
    #[tracing::instrument(skip_all, fields(chain = %self.config.chain_symbol))]
    pub async fn run(self) {
        tracing::info!("starting EVM withdraw rounds");
        loop {
            if let Err(error) = self.tick().await {
                tracing::warn!(%error, "withdraw iteration failed; backing off");
            }
            tokio::time::sleep(self.config.delay).await;
        }
    }

    /// Process the PENDING queue in nonce order. A transient failure
    /// stops the pass so ordering is preserved; a rejected withdraw is
    /// recorded and the pass continues.
    pub async fn tick(&self) -> Result<(), Error> {
        let withdraws = self
            .store
            .evm_withdraws_by_status(&self.config.chain_symbol, WithdrawStatus::Pending)
            .await?;

        for mut withdraw in withdraws {
            let nonce = withdraw.nonce;
            match self.process(&mut withdraw).await {
                Ok(()) => {
                    tracing::info!(nonce, "withdraw successful");
                }
                Err(error @ (Error::DifferentHash { .. } | Error::ContractError(_))) => {
                    tracing::error!(nonce, %error, "rejecting withdraw");
                    withdraw.status = WithdrawStatus::Rejected;
                    self.store.upsert_evm_withdraw(&withdraw).await?;
                }
                Err(error) => return Err(error),
            }
        }

        Ok(())
    }

    async fn process(&self, withdraw: &mut EvmWithdraw) -> Result<(), Error> {
        let nonces = self.signer.request_nonces(&self.dkg_key.party).await?;
        let request = SigningRequest {
            method: "withdraw".to_owned(),
            data: serde_json::json!({
                "chain_symbol": self.config.chain_symbol,
                "sa_withdraw_nonce": withdraw.nonce,
            }),
        };

        let reply = self
            .signer
            .request_signature(&self.dkg_key, &nonces, &request, &self.dkg_key.party)
            .await?;
        if !reply.is_successful() {
            return Err(Error::ValidatorReject(reply.result));
        }

        // The validators hashed what Zex served them; it must match what
        // we believe the request is, or the request itself is suspect.
        let our_hash = evm_withdraw_hash(withdraw)?;
        if reply.message_hash != our_hash {
            return Err(Error::DifferentHash {
                ours: our_hash,
                theirs: reply.message_hash,
            });
        }

        let signature_nonce = Address::from_str(&reply.nonce)
            .map_err(|error| Error::InvalidValue(format!("signature nonce: {error}")))?;
        let hash_bytes = hex::decode(&our_hash)
            .map_err(|error| Error::InvalidValue(format!("withdraw hash: {error}")))?;
        let shield_sig = shield_sign(&self.shield, &hash_bytes)?;

        let calldata = IVault::withdrawCall {
            token: Address::from_str(&withdraw.token_address)
                .map_err(|error| Error::InvalidValue(format!("token: {error}")))?,
            amount: withdraw.amount,
            recipient: Address::from_str(&withdraw.recipient)
                .map_err(|error| Error::InvalidValue(format!("recipient: {error}")))?,
            nonce: U256::from(withdraw.nonce),
            signature: reply.signature_u256()?,
            nonceTaAddr: signature_nonce,
            shieldSig: Bytes::from(
                hex::decode(shield_sig.trim_start_matches("0x"))
                    .map_err(|error| Error::InvalidValue(error.to_string()))?,
            ),
        }
        .abi_encode();

        let tx_hash = self
            .sender
            .submit_call(&self.config.vault_address, calldata)
            .await?;

        // Persist the hash before waiting: a crash mid-wait leaves a
        // recoverable PROCESSING row instead of a lost transaction.
        withdraw.tx_hash = Some(tx_hash.clone());
        withdraw.status = WithdrawStatus::Processing;
        self.store.upsert_evm_withdraw(withdraw).await?;

        let receipt = self
            .sender
            .wait_for_receipt(
                &tx_hash,
                self.config.receipt_attempts,
                self.config.receipt_interval,
            )
            .await?;
        if !receipt.is_success() {
            return Err(Error::ContractError(format!(
                "withdraw transaction {tx_hash} reverted"
            )));
        }

        withdraw.status = WithdrawStatus::Successful;
        self.store.upsert_evm_withdraw(withdraw).await?;
        Ok(())
    }
}
