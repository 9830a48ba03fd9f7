//! # Vault depositor
//!
//! Walks VERIFIED EVM deposits and sweeps them into the vault: if the
//! user's deposit contract is not deployed yet it is deployed through the
//! CREATE2 factory with `salt = user_id`, then the deposited token is
//! moved with `transferERC20`. On a confirmed sweep the deposit reaches
//! its terminal SUCCESSFUL state.

use std::str::FromStr as _;
use std::time::Duration;

use alloy_primitives::{Address, U256};
use alloy_sol_types::SolCall as _;

use crate::error::Error;
use crate::sa::contracts::{IFactory, IUserDeposit};
use crate::sa::evm_sender::EvmSender;
use crate::storage::model::{ChainKind, Deposit, DepositStatus};
use crate::storage::{DbRead, DbWrite};

/// Vault-depositor parameters.
#[derive(Debug, Clone)]
pub struct VaultDepositorConfig {
    /// The chain symbol rows are keyed by.
    pub chain_symbol: String,
    /// CREATE2 factory address.
    pub factory_address: String,
    /// Pause between passes.
    pub delay: Duration,
    /// Receipt polling attempts.
    pub receipt_attempts: u32,
    /// Receipt polling interval.
    pub receipt_interval: Duration,
}

/// The vault depositor for a single EVM chain.
#[derive(Debug)]
pub struct VaultDepositor<S> {
    /// Shared storage.
    pub store: S,
    /// The submitting account.
    pub sender: EvmSender,
    /// Role parameters.
    pub config: VaultDepositorConfig,
}

impl<S> VaultDepositor<S>
where
    S: DbRead + DbWrite + Sync,
{
    /// Run the sweep loop.
    #[tracing::instrument(skip_all, fields(chain = %self.config.chain_symbol))]
    pub async fn run(self) {
        tracing::info!("starting vault depositor");
        loop {
            if let Err(error) = self.tick().await {
                tracing::warn!(%error, "sweep pass failed; backing off");
            }
            tokio::time::sleep(self.config.delay).await;
        }
    }

    /// Sweep every VERIFIED deposit once.
    pub async fn tick(&self) -> Result<(), Error> {
        let deposits = self
            .store
            .deposits_by_status(
                ChainKind::Evm,
                &self.config.chain_symbol,
                DepositStatus::Verified,
                None,
                None,
            )
            .await?;

        for mut deposit in deposits {
            match self.sweep(&deposit).await {
                Ok(()) => {
                    deposit.status = DepositStatus::Successful;
                    self.store
                        .upsert_deposits(ChainKind::Evm, &[deposit])
                        .await?;
                }
                Err(Error::ContractError(reason)) => {
                    tracing::error!(
                        tx_hash = %deposit.transfer.tx_hash,
                        %reason,
                        "sweep reverted; leaving deposit verified"
                    );
                }
                Err(error) => return Err(error),
            }
        }

        Ok(())
    }

    async fn sweep(&self, deposit: &Deposit) -> Result<(), Error> {
        if deposit.transfer.token.eq_ignore_ascii_case(clients::types::NATIVE_TOKEN) {
            tracing::debug!(
                tx_hash = %deposit.transfer.tx_hash,
                "native deposits are swept by the vault itself"
            );
            return Ok(());
        }

        let contract = &deposit.transfer.to;
        self.ensure_deployed(contract, deposit.user_id).await?;

        let calldata = IUserDeposit::transferERC20Call {
            token: Address::from_str(&deposit.transfer.token)
                .map_err(|error| Error::InvalidValue(format!("token: {error}")))?,
            amount: deposit.transfer.value,
        }
        .abi_encode();

        let tx_hash = self.sender.submit_call(contract, calldata).await?;
        let receipt = self
            .sender
            .wait_for_receipt(
                &tx_hash,
                self.config.receipt_attempts,
                self.config.receipt_interval,
            )
            .await?;
        if !receipt.is_success() {
            return Err(Error::ContractError(format!("sweep {tx_hash} reverted")));
        }

        tracing::info!(%tx_hash, contract = %contract, "deposit swept into vault");
        Ok(())
    }

    /// Deploy the user-deposit contract when the derived address holds no
    /// code yet.
    async fn ensure_deployed(&self, contract: &str, user_id: u64) -> Result<(), Error> {
        let code = self.sender.client().get_code(contract).await?;
        if code != "0x" && !code.is_empty() {
            return Ok(());
        }

        tracing::info!(contract = %contract, user_id, "deploying user-deposit contract");
        let calldata = IFactory::deployCall {
            salt: U256::from(user_id),
        }
        .abi_encode();

        let tx_hash = self
            .sender
            .submit_call(&self.config.factory_address, calldata)
            .await?;
        let receipt = self
            .sender
            .wait_for_receipt(
                &tx_hash,
                self.config.receipt_attempts,
                self.config.receipt_interval,
            )
            .await?;
        if !receipt.is_success() {
            return Err(Error::ContractError(format!("deploy {tx_hash} reverted")));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::{SharedStore, Store};
    use crate::testing::deposit;
    use clients::evm::EvmClient;
    use clients::types::NATIVE_TOKEN;
    use mockito::Matcher;
    use url::Url;

    const WITHDRAWER_KEY: &str =
        "0x4c0883a69102937d6231471b5dbb6204fe51296170827936ea5cce4b76994b0f";
    const USER_CONTRACT: &str = "0xfB6916095ca1df60bB79Ce92cE3Ea74c37c5d359";

    fn depositor(store: SharedStore, server: &mockito::Server) -> VaultDepositor<SharedStore> {
        let client = EvmClient::new(
            "SEP",
            Url::parse(&server.url()).unwrap(),
            11155111,
            Some(1),
        )
        .unwrap();

        VaultDepositor {
            store,
            sender: EvmSender::new(client, WITHDRAWER_KEY).unwrap(),
            config: VaultDepositorConfig {
                chain_symbol: "SEP".to_owned(),
                factory_address: "0x4e59b44847b379578588920cA78FbF26c0B4956C".to_owned(),
                delay: std::time::Duration::ZERO,
                receipt_attempts: 1,
                receipt_interval: std::time::Duration::ZERO,
            },
        }
    }

    fn verified_deposit(token: &str) -> Deposit {
        let mut row = deposit("SEP", "0xd1", USER_CONTRACT, 100, 7, DepositStatus::Verified);
        row.transfer.token = token.to_owned();
        row
    }

    /// Mock one JSON-RPC method on the node.
    async fn rpc_mock(server: &mut mockito::Server, method: &str, result: &str) -> mockito::Mock {
        server
            .mock("POST", "/")
            .match_body(Matcher::PartialJson(serde_json::json!({"method": method})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(format!(r#"{{"jsonrpc":"2.0","id":1,"result":{result}}}"#))
            .create_async()
            .await
    }

    #[tokio::test]
    async fn native_deposits_are_skipped_without_touching_the_chain() {
        let mut server = mockito::Server::new_async().await;
        let rpc = server.mock("POST", "/").expect(0).create_async().await;

        let store = Store::new_shared();
        store
            .insert_deposits_if_missing(ChainKind::Evm, &[verified_deposit(NATIVE_TOKEN)])
            .await
            .unwrap();

        depositor(store.clone(), &server).tick().await.unwrap();

        rpc.assert_async().await;
        let successful = store
            .deposits_by_status(ChainKind::Evm, "SEP", DepositStatus::Successful, None, None)
            .await
            .unwrap();
        assert_eq!(successful.len(), 1);
    }

    #[tokio::test]
    async fn a_confirmed_sweep_promotes_the_deposit_to_successful() {
        let mut server = mockito::Server::new_async().await;
        // The contract is already deployed, so no factory call happens.
        rpc_mock(&mut server, "eth_getCode", r#""0x6080""#).await;
        rpc_mock(&mut server, "eth_getTransactionCount", r#""0x1""#).await;
        rpc_mock(&mut server, "eth_gasPrice", r#""0x3b9aca00""#).await;
        rpc_mock(&mut server, "eth_estimateGas", r#""0x13880""#).await;
        let broadcast = rpc_mock(
            &mut server,
            "eth_sendRawTransaction",
            &format!(r#""0x{}""#, "ab".repeat(32)),
        )
        .await;
        rpc_mock(
            &mut server,
            "eth_getTransactionReceipt",
            r#"{"status": "0x1"}"#,
        )
        .await;

        let store = Store::new_shared();
        store
            .insert_deposits_if_missing(
                ChainKind::Evm,
                &[verified_deposit("0x0000000000000000000000000000000000000001")],
            )
            .await
            .unwrap();

        depositor(store.clone(), &server).tick().await.unwrap();

        broadcast.assert_async().await;
        let successful = store
            .deposits_by_status(ChainKind::Evm, "SEP", DepositStatus::Successful, None, None)
            .await
            .unwrap();
        assert_eq!(successful.len(), 1);
        assert!(store
            .deposits_by_status(ChainKind::Evm, "SEP", DepositStatus::Verified, None, None)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn a_reverted_sweep_leaves_the_deposit_verified() {
        let mut server = mockito::Server::new_async().await;
        rpc_mock(&mut server, "eth_getCode", r#""0x6080""#).await;
        rpc_mock(&mut server, "eth_getTransactionCount", r#""0x1""#).await;
        rpc_mock(&mut server, "eth_gasPrice", r#""0x3b9aca00""#).await;
        rpc_mock(&mut server, "eth_estimateGas", r#""0x13880""#).await;
        server
            .mock("POST", "/")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "method": "eth_sendRawTransaction"
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"jsonrpc":"2.0","id":1,"error":{"code":3,"message":"execution reverted: NotDeposited"}}"#,
            )
            .create_async()
            .await;

        let store = Store::new_shared();
        store
            .insert_deposits_if_missing(
                ChainKind::Evm,
                &[verified_deposit("0x0000000000000000000000000000000000000001")],
            )
            .await
            .unwrap();

        // The revert is handled inside the pass, not propagated.
        depositor(store.clone(), &server).tick().await.unwrap();

        let verified = store
            .deposits_by_status(ChainKind::Evm, "SEP", DepositStatus::Verified, None, None)
            .await
            .unwrap();
        assert_eq!(verified.len(), 1);
        assert!(store
            .deposits_by_status(ChainKind::Evm, "SEP", DepositStatus::Successful, None, None)
            .await
            .unwrap()
            .is_empty());
    }
}
