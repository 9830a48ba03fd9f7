//! Validator withdraw handlers.
//!
//! EVM: the validator pulls the same nonce from Zex itself and returns
//! the packed withdraw hash, so the SA cannot substitute amounts or
//! recipients.
//!
//! Bitcoin: the validator replays the sequencer-confirmed transaction
//! shape at the given index, checks every input address against its own
//! derivation, refuses any outpoint already referenced by a different
//! nonce, rebuilds the transaction, and returns its exact serialization.

use serde::Deserialize;

use crate::encoder::evm_withdraw_hash;
use crate::error::Error;
use crate::registry::AddressRegistry;
use crate::sequencer::Sequencer;
use crate::storage::model::{BtcWithdraw, ChainKind, EvmWithdraw, WithdrawStatus};
use crate::storage::{DbRead, DbWrite};
use crate::utxo::build_withdraw_tx;
use crate::validator::deposit::ValidatorReply;
use crate::zex::ZexClient;

/// The withdraw proposal for EVM chains: just the nonce; everything else
/// is re-read from Zex.
#[derive(Debug, Clone, Deserialize)]
pub struct SaWithdrawRequest {
    /// The chain the withdraw belongs to.
    pub chain_symbol: String,
    /// The withdraw nonce to confirm.
    pub sa_withdraw_nonce: u64,
}

/// A per-input signing request in the Bitcoin phase-B rounds.
#[derive(Debug, Clone, Deserialize)]
pub struct SaInputRequest {
    /// The chain the withdraw belongs to.
    pub chain_symbol: String,
    /// The withdraw nonce being signed.
    pub sa_withdraw_nonce: u64,
    /// Which input the digest belongs to.
    pub input_index: usize,
    /// The claimed taproot digest, hex encoded.
    pub sighash: String,
}

/// Confirm an EVM withdraw by re-reading it from Zex and hashing it.
pub async fn handle_evm_withdraw(
    zex: &ZexClient,
    chain_id: u64,
    request: SaWithdrawRequest,
) -> Result<ValidatorReply, Error> {
    let withdraws = zex
        .withdraws(&request.chain_symbol, request.sa_withdraw_nonce as i64, Some(1))
        .await?;
    let raw = withdraws
        .first()
        .ok_or_else(|| Error::ValidatorReject(format!("no withdraw at nonce {}", request.sa_withdraw_nonce)))?;
    if raw.nonce != request.sa_withdraw_nonce {
        return Err(Error::ValidatorReject(format!(
            "zex served nonce {} instead of {}",
            raw.nonce, request.sa_withdraw_nonce
        )));
    }

    let withdraw = EvmWithdraw {
        chain_symbol: request.chain_symbol,
        nonce: raw.nonce,
        amount: raw.evm_amount()?,
        recipient: clients::evm::checksum_address(&raw.destination)?,
        token_address: clients::evm::checksum_address(
            raw.token_contract
                .as_deref()
                .ok_or_else(|| Error::ValidatorReject("withdraw has no token contract".into()))?,
        )?,
        chain_id,
        status: WithdrawStatus::Pending,
        tx_hash: None,
    };

    let hash = evm_withdraw_hash(&withdraw)?;
    tracing::info!(nonce = withdraw.nonce, %hash, "confirmed evm withdraw");

    Ok(ValidatorReply {
        hash,
        data: serde_json::to_value(&withdraw)
            .map_err(|error| Error::InvalidValue(error.to_string()))?,
    })
}

/// Confirm a Bitcoin withdraw shape against the sequencer's finalized
/// log and return the exact transaction serialization.
pub async fn handle_btc_withdraw<S, Q>(
    store: &S,
    sequencer: &Q,
    registry: &AddressRegistry,
    vault_address: &str,
    network: bitcoin::Network,
    withdraw: BtcWithdraw,
) -> Result<ValidatorReply, Error>
where
    S: DbRead + DbWrite + Sync,
    Q: Sequencer,
{
    let index = withdraw
        .zellular_index
        .ok_or_else(|| Error::ValidatorReject("withdraw carries no sequencer index".into()))?;
    let entry = sequencer
        .get_finalized(index)
        .await?
        .ok_or_else(|| Error::ValidatorReject(format!("index {index} is not finalized yet")))?;
    let confirmed: BtcWithdraw = serde_json::from_value(entry)
        .map_err(|error| Error::ValidatorReject(format!("undecodable sequencer entry: {error}")))?;

    if confirmed.nonce != withdraw.nonce {
        return Err(Error::ValidatorReject(format!(
            "sequencer entry is for nonce {}, proposal says {}",
            confirmed.nonce, withdraw.nonce
        )));
    }

    // First sight of this shape pins it; a later proposal with a
    // different UTXO set for the same nonce is refused.
    let stored = store.insert_sa_withdraw_if_missing(&confirmed).await?;
    if stored.utxos != confirmed.utxos {
        return Err(Error::ValidatorReject("diverging utxo set for nonce".into()));
    }

    let outpoints: Vec<(String, u32)> = confirmed
        .utxos
        .iter()
        .map(|utxo| (utxo.tx_hash.clone(), utxo.index))
        .collect();
    let sharing = store.sa_withdraws_sharing_utxos(&outpoints).await?;
    if sharing.iter().any(|other| other.nonce != confirmed.nonce) {
        return Err(Error::ValidatorReject(
            "utxo already committed to another withdraw".into(),
        ));
    }

    for utxo in &confirmed.utxos {
        let derived = registry.derive(ChainKind::Btc, utxo.user_id)?;
        if derived != utxo.address {
            return Err(Error::ValidatorReject(format!(
                "utxo {}:{} address does not derive from user {}",
                utxo.tx_hash, utxo.index, utxo.user_id
            )));
        }
    }

    let sat_per_byte = confirmed
        .sat_per_byte
        .ok_or_else(|| Error::ValidatorReject("confirmed shape has no fee rate".into()))?;
    let built = build_withdraw_tx(
        &confirmed.utxos,
        confirmed.amount,
        &confirmed.recipient,
        vault_address,
        network,
        sat_per_byte,
    )?;

    Ok(ValidatorReply {
        hash: built.to_hex(),
        data: serde_json::to_value(&confirmed)
            .map_err(|error| Error::InvalidValue(error.to_string()))?,
    })
}

/// Confirm one input digest of an agreed Bitcoin withdraw: the digest
/// must fall out of the pinned transaction shape.
pub async fn handle_btc_input<S>(
    store: &S,
    vault_address: &str,
    network: bitcoin::Network,
    request: SaInputRequest,
) -> Result<ValidatorReply, Error>
where
    S: DbRead + DbWrite + Sync,
{
    let pinned = store
        .sa_withdraw_by_nonce(&request.chain_symbol, request.sa_withdraw_nonce)
        .await?
        .ok_or_else(|| {
            Error::ValidatorReject(format!(
                "no agreed shape for nonce {}",
                request.sa_withdraw_nonce
            ))
        })?;

    let sat_per_byte = pinned
        .sat_per_byte
        .ok_or_else(|| Error::ValidatorReject("pinned shape has no fee rate".into()))?;
    let built = build_withdraw_tx(
        &pinned.utxos,
        pinned.amount,
        &pinned.recipient,
        vault_address,
        network,
        sat_per_byte,
    )?;

    let digest = built
        .sighashes
        .get(request.input_index)
        .ok_or_else(|| Error::ValidatorReject(format!("no input {}", request.input_index)))?;
    if hex::encode(digest) != request.sighash {
        return Err(Error::ValidatorReject(format!(
            "digest for input {} does not match the agreed transaction",
            request.input_index
        )));
    }

    Ok(ValidatorReply {
        hash: request.sighash,
        data: serde_json::Value::Null,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::Store;
    use crate::storage::model::{Utxo, UtxoStatus};
    use clients::btc::{derive_deposit_address, parse_group_key};
    use url::Url;

    const GROUP_KEY: &str = "79be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798";
    const NETWORK: bitcoin::Network = bitcoin::Network::Regtest;
    const FACTORY: &str = "0x4e59b44847b379578588920cA78FbF26c0B4956C";
    const CODE_HASH: &str = "0x21c35dbe1b344a2488cf3321d6ce542f8e9f305544ff09e4993a62319a497c1f";

    fn registry() -> AddressRegistry {
        AddressRegistry::new(
            FACTORY.to_owned(),
            CODE_HASH.to_owned(),
            Some(GROUP_KEY),
            NETWORK,
        )
        .unwrap()
    }

    fn vault() -> String {
        let key = parse_group_key(GROUP_KEY).unwrap();
        derive_deposit_address(&key, 0, NETWORK).unwrap()
    }

    fn recipient() -> String {
        use std::str::FromStr as _;
        let pubkey = bitcoin::secp256k1::PublicKey::from_str(
            "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798",
        )
        .unwrap();
        bitcoin::Address::p2wpkh(&bitcoin::CompressedPublicKey(pubkey), NETWORK).to_string()
    }

    fn committed_utxo(user_id: u64) -> Utxo {
        let key = parse_group_key(GROUP_KEY).unwrap();
        Utxo {
            tx_hash: "a".repeat(64),
            index: 0,
            amount: 7_000_000,
            address: derive_deposit_address(&key, user_id, NETWORK).unwrap(),
            status: UtxoStatus::Spend,
            user_id,
        }
    }

    fn shape(utxos: Vec<Utxo>, zellular_index: Option<u64>) -> BtcWithdraw {
        BtcWithdraw {
            chain_symbol: "BTC".to_owned(),
            nonce: 42,
            amount: 6_000_000,
            recipient: recipient(),
            status: WithdrawStatus::Pending,
            tx_hash: None,
            utxos,
            sat_per_byte: Some(10),
            zellular_index,
        }
    }

    /// A sequencer serving one fixed finalized entry.
    struct OneEntry(serde_json::Value);

    impl Sequencer for OneEntry {
        async fn post_entry(&self, _entry: &serde_json::Value) -> Result<u64, Error> {
            Ok(0)
        }

        async fn get_finalized(&self, _index: u64) -> Result<Option<serde_json::Value>, Error> {
            Ok(Some(self.0.clone()))
        }
    }

    #[tokio::test]
    async fn evm_withdraw_hash_comes_from_zex_data() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/withdraws?chain=SEP&offset=3&limit=1")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"[{
                    "amount": 1000000,
                    "nonce": 3,
                    "destination": "0xfB6916095ca1df60bB79Ce92cE3Ea74c37c5d359",
                    "tokenContract": "0x0000000000000000000000000000000000000001"
                }]"#,
            )
            .create_async()
            .await;

        let zex = ZexClient::new(Url::parse(&format!("{}/", server.url())).unwrap()).unwrap();
        let reply = handle_evm_withdraw(
            &zex,
            11155111,
            SaWithdrawRequest {
                chain_symbol: "SEP".to_owned(),
                sa_withdraw_nonce: 3,
            },
        )
        .await
        .unwrap();

        let rebuilt: EvmWithdraw = serde_json::from_value(reply.data).unwrap();
        assert_eq!(reply.hash, evm_withdraw_hash(&rebuilt).unwrap());
    }

    #[tokio::test]
    async fn btc_withdraw_is_replayed_from_the_sequencer() {
        let store = Store::new_shared();
        let shape = shape(vec![committed_utxo(1)], Some(5));
        let sequencer = OneEntry(serde_json::to_value(&shape).unwrap());

        let reply = handle_btc_withdraw(&store, &sequencer, &registry(), &vault(), NETWORK, shape.clone())
            .await
            .unwrap();

        let expected = build_withdraw_tx(
            &shape.utxos,
            shape.amount,
            &shape.recipient,
            &vault(),
            NETWORK,
            10,
        )
        .unwrap();
        assert_eq!(reply.hash, expected.to_hex());

        // The shape is pinned for the per-input rounds.
        let pinned = store.sa_withdraw_by_nonce("BTC", 42).await.unwrap().unwrap();
        assert_eq!(pinned.utxos, shape.utxos);
    }

    #[tokio::test]
    async fn btc_withdraw_with_foreign_address_is_refused() {
        let store = Store::new_shared();
        let mut bad = committed_utxo(1);
        bad.address = vault(); // not user 1's derived address
        let shape = shape(vec![bad], Some(5));
        let sequencer = OneEntry(serde_json::to_value(&shape).unwrap());

        let error =
            handle_btc_withdraw(&store, &sequencer, &registry(), &vault(), NETWORK, shape)
                .await
                .unwrap_err();
        assert!(matches!(error, Error::ValidatorReject(_)));
    }

    #[tokio::test]
    async fn btc_input_digests_must_match_the_pinned_shape() {
        let store = Store::new_shared();
        let shape = shape(vec![committed_utxo(1)], Some(5));
        store.insert_sa_withdraw_if_missing(&shape).await.unwrap();

        let built = build_withdraw_tx(
            &shape.utxos,
            shape.amount,
            &shape.recipient,
            &vault(),
            NETWORK,
            10,
        )
        .unwrap();

        let good = handle_btc_input(
            &store,
            &vault(),
            NETWORK,
            SaInputRequest {
                chain_symbol: "BTC".to_owned(),
                sa_withdraw_nonce: 42,
                input_index: 0,
                sighash: hex::encode(built.sighashes[0]),
            },
        )
        .await;
        assert!(good.is_ok());

        let bad = handle_btc_input(
            &store,
            &vault(),
            NETWORK,
            SaInputRequest {
                chain_symbol: "BTC".to_owned(),
                sa_withdraw_nonce: 42,
                input_index: 0,
                sighash: "00".repeat(32),
            },
        )
        .await;
        assert!(matches!(bad, Err(Error::ValidatorReject(_))));
    }
}
