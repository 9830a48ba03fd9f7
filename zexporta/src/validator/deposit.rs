//! Validator deposit handler.
//!
//! Invoked on each validator when the SA proposes a deposit batch. The
//! validator never trusts the proposal: it refuses rounds claiming a
//! finality it has not seen itself, rebuilds every deposit from its own
//! chain view, and hashes the canonical encoding. The signer only
//! contributes a share when this hash matches the SA's.

use serde::Deserialize;

use clients::{ChainClient, ClientError, Transfer, TxHash};

use crate::encoder::{self, DEPOSIT_OPERATION};
use crate::error::Error;
use crate::explorer;
use crate::registry::AddressRegistry;
use crate::storage::model::{sort_deposits, ChainKind, DepositStatus};
use crate::storage::{DbRead, DbWrite};
use crate::zex::ZexClient;

/// The batch proposal the SA asks validators to confirm.
#[derive(Debug, Clone, Deserialize)]
pub struct SaDepositRequest {
    /// The transaction hashes of the proposed batch.
    pub txs: Vec<TxHash>,
    /// The round's timestamp, stamped into every confirmed deposit.
    pub timestamp: u64,
    /// The chain the batch belongs to.
    pub chain_symbol: String,
    /// The finality the SA claims the batch is below.
    pub finalized_block_number: u64,
}

/// What a validator hands back to the signing machinery.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ValidatorReply {
    /// The hash this validator is willing to sign.
    pub hash: String,
    /// The data backing the hash, for the SA to persist.
    pub data: serde_json::Value,
}

/// Rebuild and confirm a proposed deposit batch against local chain
/// state.
pub async fn handle_deposit<C, S>(
    client: &C,
    store: &S,
    registry: &AddressRegistry,
    zex: &ZexClient,
    kind: ChainKind,
    encode_version: u8,
    request: SaDepositRequest,
) -> Result<ValidatorReply, Error>
where
    C: ChainClient,
    S: DbRead + DbWrite + Sync,
{
    if request.txs.is_empty() {
        return Err(Error::ValidatorReject("empty transaction set".into()));
    }

    let local_finalized = client.finalized_block().await?;
    if request.finalized_block_number > local_finalized {
        return Err(Error::ValidatorReject(format!(
            "claimed finalized block {} is beyond local {local_finalized}",
            request.finalized_block_number
        )));
    }

    if let Err(error) = registry.sync(store, zex).await {
        tracing::warn!(%error, "address registry sync failed");
    }
    let accepted = store.active_addresses(kind).await?;

    let mut transfers: Vec<Transfer> = Vec::new();
    for tx_hash in &request.txs {
        match client.transfers_by_tx_hash(tx_hash).await {
            Ok(found) => transfers.extend(found),
            Err(ClientError::NotFound(_) | ClientError::TransferNotValid(_)) => {
                tracing::debug!(%tx_hash, "proposed transaction is not a confirmable transfer");
            }
            Err(error) => return Err(error.into()),
        }
    }
    transfers.retain(|transfer| transfer.block_number <= local_finalized);

    let mut deposits = explorer::accepted_deposits(
        client,
        store,
        transfers,
        &accepted,
        DepositStatus::Verified,
        Some(request.timestamp),
    )
    .await?;
    sort_deposits(&mut deposits);

    let encoded = encoder::encode_deposit_batch(
        encode_version,
        DEPOSIT_OPERATION,
        &deposits,
        &request.chain_symbol,
    );

    Ok(ValidatorReply {
        hash: encoder::deposit_batch_hash(&encoded),
        data: serde_json::json!({ "deposits": deposits }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::Store;
    use crate::storage::model::UserAddress;
    use crate::testing::{transfer, MockChain};
    use url::Url;

    const FACTORY: &str = "0x4e59b44847b379578588920cA78FbF26c0B4956C";
    const CODE_HASH: &str = "0x21c35dbe1b344a2488cf3321d6ce542f8e9f305544ff09e4993a62319a497c1f";

    fn registry() -> AddressRegistry {
        AddressRegistry::new(
            FACTORY.to_owned(),
            CODE_HASH.to_owned(),
            None,
            bitcoin::Network::Regtest,
        )
        .unwrap()
    }

    async fn zex_without_users() -> (mockito::ServerGuard, ZexClient) {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/users/latest-id")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body("{}")
            .create_async()
            .await;
        let zex = ZexClient::new(Url::parse(&format!("{}/", server.url())).unwrap()).unwrap();
        (server, zex)
    }

    #[tokio::test]
    async fn rejects_rounds_beyond_local_finality() {
        let (_server, zex) = zex_without_users().await;
        let chain = MockChain::new("SEP", 495, 490);
        let store = Store::new_shared();

        let request = SaDepositRequest {
            txs: vec!["0xd1".to_owned()],
            timestamp: 1,
            chain_symbol: "SEP".to_owned(),
            finalized_block_number: 500,
        };

        let error = handle_deposit(&chain, &store, &registry(), &zex, ChainKind::Evm, 1, request)
            .await
            .unwrap_err();
        assert!(matches!(error, Error::ValidatorReject(_)));
    }

    #[tokio::test]
    async fn confirms_deposits_it_can_see_itself() {
        let (_server, zex) = zex_without_users().await;
        let mut chain = MockChain::new("SEP", 105, 101);
        chain.add_transfer(transfer("SEP", "0xd1", "0xAAA", 100));

        let store = Store::new_shared();
        store
            .insert_user_addresses(
                ChainKind::Evm,
                &[UserAddress {
                    user_id: 7,
                    address: "0xAAA".to_owned(),
                    is_active: true,
                }],
            )
            .await
            .unwrap();

        let request = SaDepositRequest {
            txs: vec!["0xd1".to_owned(), "0xunknown".to_owned()],
            timestamp: 99,
            chain_symbol: "SEP".to_owned(),
            finalized_block_number: 100,
        };

        let reply = handle_deposit(&chain, &store, &registry(), &zex, ChainKind::Evm, 1, request)
            .await
            .unwrap();

        let deposits = reply.data["deposits"].as_array().unwrap();
        assert_eq!(deposits.len(), 1);
        assert_eq!(deposits[0]["status"], "verified");
        assert_eq!(deposits[0]["sa_timestamp"], 99);
        assert_eq!(reply.hash.len(), 64);
    }

    #[tokio::test]
    async fn the_validator_hash_matches_the_sa_encoding() {
        let (_server, zex) = zex_without_users().await;
        let mut chain = MockChain::new("SEP", 105, 101);
        chain.add_transfer(transfer("SEP", "0xd1", "0xAAA", 100));

        let store = Store::new_shared();
        store
            .insert_user_addresses(
                ChainKind::Evm,
                &[UserAddress {
                    user_id: 7,
                    address: "0xAAA".to_owned(),
                    is_active: true,
                }],
            )
            .await
            .unwrap();

        let request = SaDepositRequest {
            txs: vec!["0xd1".to_owned()],
            timestamp: 99,
            chain_symbol: "SEP".to_owned(),
            finalized_block_number: 100,
        };

        let reply = handle_deposit(&chain, &store, &registry(), &zex, ChainKind::Evm, 1, request)
            .await
            .unwrap();

        // The SA re-encodes the returned deposits with the shared
        // encoder; both sides must land on the same hash.
        let mut deposits: Vec<crate::storage::model::Deposit> =
            serde_json::from_value(reply.data["deposits"].clone()).unwrap();
        sort_deposits(&mut deposits);
        let encoded = encoder::encode_deposit_batch(1, DEPOSIT_OPERATION, &deposits, "SEP");
        assert_eq!(encoder::deposit_batch_hash(&encoded), reply.hash);
    }
}
