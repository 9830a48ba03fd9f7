//! MongoDB-backed store.
//!
//! One collection per row family, with the unique indexes carrying the
//! idempotence guarantees the roles rely on: re-inserting an observed
//! deposit, address, or withdraw is a no-op, and status transitions are
//! status-scoped `update_many` calls.

use std::collections::HashMap;

use bson::{doc, Bson, Document};
use futures::TryStreamExt as _;
use mongodb::options::{FindOneOptions, FindOptions, IndexOptions, UpdateOptions};
use mongodb::{Collection, Database, IndexModel};
use serde::de::DeserializeOwned;
use serde::Serialize;

use clients::{Address, BlockNumber, TxHash, UserId};

use crate::config::MongoSettings;
use crate::error::Error;

use super::model::{
    BtcWithdraw, ChainKind, Deposit, DepositStatus, EvmWithdraw, UserAddress, Utxo, UtxoStatus,
    WithdrawStatus,
};
use super::{DbRead, DbWrite};

/// The production store.
#[derive(Debug, Clone)]
pub struct MongoStore {
    db: Database,
}

impl MongoStore {
    /// Connect to the configured database and ensure the unique indexes
    /// exist.
    pub async fn connect(settings: &MongoSettings) -> Result<Self, Error> {
        let client = mongodb::Client::with_uri_str(settings.uri()).await?;
        let store = Self {
            db: client.database(&settings.db_name),
        };
        store.ensure_indexes().await?;
        Ok(store)
    }

    fn deposits(&self, kind: ChainKind) -> Collection<Document> {
        match kind {
            ChainKind::Evm => self.db.collection("evm_deposit"),
            ChainKind::Btc => self.db.collection("btc_deposit"),
        }
    }

    fn addresses(&self, kind: ChainKind) -> Collection<Document> {
        match kind {
            ChainKind::Evm => self.db.collection("evm_address"),
            ChainKind::Btc => self.db.collection("btc_address"),
        }
    }

    fn chain(&self) -> Collection<Document> {
        self.db.collection("chain")
    }

    fn token(&self) -> Collection<Document> {
        self.db.collection("token")
    }

    fn utxos(&self) -> Collection<Document> {
        self.db.collection("btc_utxo")
    }

    fn evm_withdraws(&self) -> Collection<Document> {
        self.db.collection("evm_withdraw")
    }

    fn btc_withdraws(&self) -> Collection<Document> {
        self.db.collection("btc_withdraw")
    }

    fn sa_withdraws(&self) -> Collection<Document> {
        self.db.collection("sa_withdraw")
    }

    async fn ensure_indexes(&self) -> Result<(), Error> {
        let unique = |keys: Document| {
            IndexModel::builder()
                .keys(keys)
                .options(IndexOptions::builder().unique(true).build())
                .build()
        };

        for kind in [ChainKind::Evm, ChainKind::Btc] {
            self.deposits(kind)
                .create_index(
                    unique(doc! {"chain_symbol": 1, "tx_hash": 1, "vout": 1}),
                    None,
                )
                .await?;
            self.addresses(kind)
                .create_index(unique(doc! {"user_id": 1}), None)
                .await?;
        }

        self.chain()
            .create_index(unique(doc! {"chain_symbol": 1}), None)
            .await?;
        self.token()
            .create_index(unique(doc! {"chain_symbol": 1, "token_address": 1}), None)
            .await?;
        self.utxos()
            .create_index(unique(doc! {"tx_hash": 1, "index": 1}), None)
            .await?;
        self.evm_withdraws()
            .create_index(unique(doc! {"chain_symbol": 1, "nonce": 1}), None)
            .await?;
        self.btc_withdraws()
            .create_index(unique(doc! {"chain_symbol": 1, "nonce": 1}), None)
            .await?;
        self.sa_withdraws()
            .create_index(unique(doc! {"chain_symbol": 1, "nonce": 1}), None)
            .await?;

        Ok(())
    }
}

fn to_document<T: Serialize>(row: &T) -> Result<Document, Error> {
    Ok(bson::to_document(row)?)
}

async fn collect_rows<T: DeserializeOwned>(
    cursor: mongodb::Cursor<Document>,
) -> Result<Vec<T>, Error> {
    let documents: Vec<Document> = cursor.try_collect().await?;
    documents
        .into_iter()
        .map(|document| Ok(bson::from_document(document)?))
        .collect()
}

fn deposit_filter(deposit: &Deposit) -> Document {
    let mut filter = doc! {
        "chain_symbol": &deposit.transfer.chain_symbol,
        "tx_hash": &deposit.transfer.tx_hash,
    };
    match deposit.transfer.vout {
        Some(vout) => filter.insert("vout", vout as i64),
        None => filter.insert("vout", Bson::Null),
    };
    filter
}

fn upsert() -> UpdateOptions {
    UpdateOptions::builder().upsert(true).build()
}

impl DbRead for MongoStore {
    async fn last_observed_block(&self, chain: &str) -> Result<Option<BlockNumber>, Error> {
        let row = self
            .chain()
            .find_one(doc! {"chain_symbol": chain}, None)
            .await?;
        Ok(row
            .and_then(|document| document.get("last_observed_block").cloned())
            .and_then(|value| value.as_i64())
            .map(|value| value as BlockNumber))
    }

    async fn last_withdraw_nonce(&self, chain: &str) -> Result<i64, Error> {
        let row = self
            .chain()
            .find_one(doc! {"chain_symbol": chain}, None)
            .await?;
        Ok(row
            .and_then(|document| document.get("last_withdraw_nonce").cloned())
            .and_then(|value| value.as_i64())
            .unwrap_or(-1))
    }

    async fn active_addresses(
        &self,
        kind: ChainKind,
    ) -> Result<HashMap<Address, UserId>, Error> {
        let cursor = self
            .addresses(kind)
            .find(doc! {"is_active": true}, None)
            .await?;
        let rows: Vec<UserAddress> = collect_rows(cursor).await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.address, row.user_id))
            .collect())
    }

    async fn max_user_id(&self, kind: ChainKind) -> Result<Option<UserId>, Error> {
        let options = FindOneOptions::builder()
            .sort(doc! {"user_id": -1})
            .build();
        let row = self.addresses(kind).find_one(doc! {}, options).await?;
        Ok(row
            .and_then(|document| document.get("user_id").cloned())
            .and_then(|value| value.as_i64())
            .map(|value| value as UserId))
    }

    async fn token_decimals(&self, chain: &str, token: &str) -> Result<Option<u8>, Error> {
        let row = self
            .token()
            .find_one(doc! {"chain_symbol": chain, "token_address": token}, None)
            .await?;
        Ok(row
            .and_then(|document| document.get("decimals").cloned())
            .and_then(|value| value.as_i32())
            .map(|value| value as u8))
    }

    async fn deposits_by_status(
        &self,
        kind: ChainKind,
        chain: &str,
        status: DepositStatus,
        from_block: Option<BlockNumber>,
        limit: Option<usize>,
    ) -> Result<Vec<Deposit>, Error> {
        let filter = doc! {
            "chain_symbol": chain,
            "status": status.to_string(),
            "block_number": {"$gte": from_block.unwrap_or(0) as i64},
        };
        let options = FindOptions::builder()
            .sort(doc! {"block_number": 1, "tx_hash": 1, "vout": 1})
            .limit(limit.map(|limit| limit as i64))
            .build();

        let cursor = self.deposits(kind).find(filter, options).await?;
        collect_rows(cursor).await
    }

    async fn pending_deposit_blocks(
        &self,
        kind: ChainKind,
        chain: &str,
        max_block: BlockNumber,
    ) -> Result<Vec<BlockNumber>, Error> {
        let filter = doc! {
            "chain_symbol": chain,
            "status": DepositStatus::Pending.to_string(),
            "block_number": {"$lte": max_block as i64},
        };
        let values = self
            .deposits(kind)
            .distinct("block_number", filter, None)
            .await?;

        let mut blocks: Vec<BlockNumber> = values
            .into_iter()
            .filter_map(|value| value.as_i64())
            .map(|value| value as BlockNumber)
            .collect();
        blocks.sort_unstable();
        Ok(blocks)
    }

    async fn evm_withdraws_by_status(
        &self,
        chain: &str,
        status: WithdrawStatus,
    ) -> Result<Vec<EvmWithdraw>, Error> {
        let filter = doc! {"chain_symbol": chain, "status": status.to_string()};
        let options = FindOptions::builder().sort(doc! {"nonce": 1}).build();
        let cursor = self.evm_withdraws().find(filter, options).await?;
        collect_rows(cursor).await
    }

    async fn btc_withdraws_by_status(
        &self,
        chain: &str,
        status: WithdrawStatus,
    ) -> Result<Vec<BtcWithdraw>, Error> {
        let filter = doc! {"chain_symbol": chain, "status": status.to_string()};
        let options = FindOptions::builder().sort(doc! {"nonce": 1}).build();
        let cursor = self.btc_withdraws().find(filter, options).await?;
        collect_rows(cursor).await
    }

    async fn utxos_by_status(&self, status: UtxoStatus) -> Result<Vec<Utxo>, Error> {
        let filter = doc! {"status": status.to_string()};
        let options = FindOptions::builder().sort(doc! {"amount": -1}).build();
        let cursor = self.utxos().find(filter, options).await?;
        collect_rows(cursor).await
    }

    async fn sa_withdraws_sharing_utxos(
        &self,
        outpoints: &[(TxHash, u32)],
    ) -> Result<Vec<BtcWithdraw>, Error> {
        if outpoints.is_empty() {
            return Ok(Vec::new());
        }

        let alternatives: Vec<Document> = outpoints
            .iter()
            .map(|(tx_hash, index)| doc! {"tx_hash": tx_hash, "index": *index as i64})
            .collect();
        let filter = doc! {"utxos": {"$elemMatch": {"$or": alternatives}}};

        let cursor = self.sa_withdraws().find(filter, None).await?;
        collect_rows(cursor).await
    }

    async fn sa_withdraw_by_nonce(
        &self,
        chain: &str,
        nonce: u64,
    ) -> Result<Option<BtcWithdraw>, Error> {
        let filter = doc! {"chain_symbol": chain, "nonce": nonce as i64};
        let row = self.sa_withdraws().find_one(filter, None).await?;
        row.map(|document| Ok(bson::from_document(document)?))
            .transpose()
    }

    async fn ping(&self) -> Result<(), Error> {
        self.db.run_command(doc! {"ping": 1}, None).await?;
        Ok(())
    }
}

impl DbWrite for MongoStore {
    async fn insert_deposits_if_missing(
        &self,
        kind: ChainKind,
        deposits: &[Deposit],
    ) -> Result<(), Error> {
        let collection = self.deposits(kind);
        for deposit in deposits {
            let update = doc! {"$setOnInsert": to_document(deposit)?};
            collection
                .update_one(deposit_filter(deposit), update, upsert())
                .await?;
        }
        Ok(())
    }

    async fn upsert_deposits(&self, kind: ChainKind, deposits: &[Deposit]) -> Result<(), Error> {
        let collection = self.deposits(kind);
        for deposit in deposits {
            let update = doc! {"$set": to_document(deposit)?};
            collection
                .update_one(deposit_filter(deposit), update, upsert())
                .await?;
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
        let filter = doc! {
            "chain_symbol": chain,
            "status": DepositStatus::Pending.to_string(),
            "block_number": {"$lte": finalized_block as i64},
            "tx_hash": {"$in": tx_hashes},
        };
        let update = doc! {"$set": {"status": DepositStatus::Finalized.to_string()}};
        self.deposits(kind).update_many(filter, update, None).await?;
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
        let filter = doc! {
            "chain_symbol": chain,
            "status": prev.to_string(),
            "block_number": {"$gte": from_block as i64, "$lte": to_block as i64},
        };
        let update = doc! {"$set": {"status": DepositStatus::Reorg.to_string()}};
        self.deposits(kind).update_many(filter, update, None).await?;
        Ok(())
    }

    async fn reorg_deposits_by_tx(
        &self,
        kind: ChainKind,
        chain: &str,
        tx_hashes: &[TxHash],
        prev: DepositStatus,
    ) -> Result<(), Error> {
        let filter = doc! {
            "chain_symbol": chain,
            "status": prev.to_string(),
            "tx_hash": {"$in": tx_hashes},
        };
        let update = doc! {"$set": {"status": DepositStatus::Reorg.to_string()}};
        self.deposits(kind).update_many(filter, update, None).await?;
        Ok(())
    }

    async fn insert_user_addresses(
        &self,
        kind: ChainKind,
        addresses: &[UserAddress],
    ) -> Result<(), Error> {
        let collection = self.addresses(kind);
        for address in addresses {
            let filter = doc! {"user_id": address.user_id as i64};
            let update = doc! {"$setOnInsert": to_document(address)?};
            collection.update_one(filter, update, upsert()).await?;
        }
        Ok(())
    }

    async fn insert_token_decimals(
        &self,
        chain: &str,
        token: &str,
        decimals: u8,
    ) -> Result<(), Error> {
        let filter = doc! {"chain_symbol": chain, "token_address": token};
        let update = doc! {"$set": {
            "chain_symbol": chain,
            "token_address": token,
            "decimals": decimals as i32,
        }};
        self.token().update_one(filter, update, upsert()).await?;
        Ok(())
    }

    async fn set_last_observed_block(
        &self,
        chain: &str,
        block: BlockNumber,
    ) -> Result<(), Error> {
        let filter = doc! {"chain_symbol": chain};
        let update = doc! {"$set": {"last_observed_block": block as i64}};
        self.chain().update_one(filter, update, upsert()).await?;
        Ok(())
    }

    async fn set_last_withdraw_nonce(&self, chain: &str, nonce: i64) -> Result<(), Error> {
        let filter = doc! {"chain_symbol": chain};
        let update = doc! {"$set": {"last_withdraw_nonce": nonce}};
        self.chain().update_one(filter, update, upsert()).await?;
        Ok(())
    }

    async fn insert_utxos_if_missing(&self, utxos: &[Utxo]) -> Result<(), Error> {
        let collection = self.utxos();
        for utxo in utxos {
            let filter = doc! {"tx_hash": &utxo.tx_hash, "index": utxo.index as i64};
            let update = doc! {"$setOnInsert": to_document(utxo)?};
            collection.update_one(filter, update, upsert()).await?;
        }
        Ok(())
    }

    async fn set_utxo_status(
        &self,
        tx_hash: &str,
        index: u32,
        status: UtxoStatus,
    ) -> Result<(), Error> {
        let filter = doc! {"tx_hash": tx_hash, "index": index as i64};
        let update = doc! {"$set": {"status": status.to_string()}};
        self.utxos().update_one(filter, update, None).await?;
        Ok(())
    }

    async fn insert_evm_withdraws_if_missing(
        &self,
        withdraws: &[EvmWithdraw],
    ) -> Result<(), Error> {
        let collection = self.evm_withdraws();
        for withdraw in withdraws {
            let filter = doc! {"chain_symbol": &withdraw.chain_symbol, "nonce": withdraw.nonce as i64};
            let update = doc! {"$setOnInsert": to_document(withdraw)?};
            collection.update_one(filter, update, upsert()).await?;
        }
        Ok(())
    }

    async fn insert_btc_withdraws_if_missing(
        &self,
        withdraws: &[BtcWithdraw],
    ) -> Result<(), Error> {
        let collection = self.btc_withdraws();
        for withdraw in withdraws {
            let filter = doc! {"chain_symbol": &withdraw.chain_symbol, "nonce": withdraw.nonce as i64};
            let update = doc! {"$setOnInsert": to_document(withdraw)?};
            collection.update_one(filter, update, upsert()).await?;
        }
        Ok(())
    }

    async fn upsert_evm_withdraw(&self, withdraw: &EvmWithdraw) -> Result<(), Error> {
        let filter = doc! {"chain_symbol": &withdraw.chain_symbol, "nonce": withdraw.nonce as i64};
        let update = doc! {"$set": to_document(withdraw)?};
        self.evm_withdraws()
            .update_one(filter, update, upsert())
            .await?;
        Ok(())
    }

    async fn upsert_btc_withdraw(&self, withdraw: &BtcWithdraw) -> Result<(), Error> {
        let filter = doc! {"chain_symbol": &withdraw.chain_symbol, "nonce": withdraw.nonce as i64};
        let update = doc! {"$set": to_document(withdraw)?};
        self.btc_withdraws()
            .update_one(filter, update, upsert())
            .await?;
        Ok(())
    }

    async fn insert_sa_withdraw_if_missing(
        &self,
        withdraw: &BtcWithdraw,
    ) -> Result<BtcWithdraw, Error> {
        let filter = doc! {"chain_symbol": &withdraw.chain_symbol, "nonce": withdraw.nonce as i64};
        let update = doc! {"$setOnInsert": to_document(withdraw)?};
        self.sa_withdraws()
            .update_one(filter.clone(), update, upsert())
            .await?;

        let stored = self
            .sa_withdraws()
            .find_one(filter, None)
            .await?
            .ok_or_else(|| Error::Storage("sa_withdraw row vanished after upsert".into()))?;
        Ok(bson::from_document(stored)?)
    }
}
