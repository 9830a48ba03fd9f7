//! Deposit-address registry.
//!
//! Derivation is pure and deterministic from the per-family group key and
//! the user id; `sync` fills in mappings for users Zex has assigned since
//! the last run. Uniqueness is enforced at the storage layer, so
//! concurrent syncs converge.

use std::collections::HashMap;

use secp256k1::XOnlyPublicKey;

use clients::{btc, evm, Address, UserId};

use crate::error::Error;
use crate::storage::model::{ChainKind, UserAddress};
use crate::storage::{DbRead, DbWrite};
use crate::zex::ZexClient;

/// Derives and maintains per-user deposit addresses.
#[derive(Debug, Clone)]
pub struct AddressRegistry {
    factory_address: String,
    bytecode_hash: String,
    btc_group_key: Option<XOnlyPublicKey>,
    btc_network: bitcoin::Network,
}

impl AddressRegistry {
    /// Build a registry from the CREATE2 factory parameters and, when a
    /// Bitcoin chain is configured, the taproot group key.
    pub fn new(
        factory_address: String,
        bytecode_hash: String,
        btc_group_key: Option<&str>,
        btc_network: bitcoin::Network,
    ) -> Result<Self, Error> {
        let btc_group_key = btc_group_key.map(btc::parse_group_key).transpose()?;

        Ok(Self {
            factory_address,
            bytecode_hash,
            btc_group_key,
            btc_network,
        })
    }

    /// The chain families this registry can derive addresses for.
    pub fn kinds(&self) -> Vec<ChainKind> {
        let mut kinds = vec![ChainKind::Evm];
        if self.btc_group_key.is_some() {
            kinds.push(ChainKind::Btc);
        }
        kinds
    }

    /// The Nth user's deposit address for a chain family.
    pub fn derive(&self, kind: ChainKind, user_id: UserId) -> Result<Address, Error> {
        match kind {
            ChainKind::Evm => Ok(evm::derive_deposit_address(
                &self.factory_address,
                &self.bytecode_hash,
                user_id,
            )?),
            ChainKind::Btc => {
                let group_key = self
                    .btc_group_key
                    .as_ref()
                    .ok_or_else(|| Error::Config("no bitcoin group key configured".into()))?;
                Ok(btc::derive_deposit_address(
                    group_key,
                    user_id,
                    self.btc_network,
                )?)
            }
        }
    }

    /// Snapshot of the active deposit addresses for the filter step.
    pub async fn active_addresses<S: DbRead>(
        &self,
        store: &S,
        kind: ChainKind,
    ) -> Result<HashMap<Address, UserId>, Error> {
        store.active_addresses(kind).await
    }

    /// Fetch Zex's highest known user id and insert every missing mapping
    /// for each derivable chain family.
    ///
    /// Callers treat a failure as a logged no-op; it must never abort an
    /// observer loop.
    pub async fn sync<S>(&self, store: &S, zex: &ZexClient) -> Result<(), Error>
    where
        S: DbRead + DbWrite,
    {
        let Some(last_user_id) = zex.last_user_id().await? else {
            return Ok(());
        };

        for kind in self.kinds() {
            let first = match store.max_user_id(kind).await? {
                Some(max) => max + 1,
                None => 0,
            };
            if first > last_user_id {
                continue;
            }

            let mut rows = Vec::with_capacity((last_user_id - first + 1) as usize);
            for user_id in first..=last_user_id {
                rows.push(UserAddress {
                    user_id,
                    address: self.derive(kind, user_id)?,
                    is_active: true,
                });
            }

            tracing::info!(?kind, count = rows.len(), "registering new deposit addresses");
            store.insert_user_addresses(kind, &rows).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::Store;
    use url::Url;

    const FACTORY: &str = "0x4e59b44847b379578588920cA78FbF26c0B4956C";
    const CODE_HASH: &str = "0x21c35dbe1b344a2488cf3321d6ce542f8e9f305544ff09e4993a62319a497c1f";
    const GROUP_KEY: &str = "79be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798";

    fn registry() -> AddressRegistry {
        AddressRegistry::new(
            FACTORY.to_owned(),
            CODE_HASH.to_owned(),
            Some(GROUP_KEY),
            bitcoin::Network::Regtest,
        )
        .unwrap()
    }

    #[test]
    fn derivation_is_deterministic_per_family() {
        let registry = registry();
        for kind in [ChainKind::Evm, ChainKind::Btc] {
            assert_eq!(
                registry.derive(kind, 7).unwrap(),
                registry.derive(kind, 7).unwrap()
            );
        }
        assert_ne!(
            registry.derive(ChainKind::Evm, 7).unwrap(),
            registry.derive(ChainKind::Evm, 8).unwrap()
        );
    }

    #[tokio::test]
    async fn sync_fills_the_gap_from_the_stored_maximum() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/users/latest-id")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id": 3}"#)
            .create_async()
            .await;

        let zex = ZexClient::new(Url::parse(&format!("{}/", server.url())).unwrap()).unwrap();
        let store = Store::new_shared();
        let registry = registry();

        registry.sync(&store, &zex).await.unwrap();

        for kind in [ChainKind::Evm, ChainKind::Btc] {
            let addresses = store.active_addresses(kind).await.unwrap();
            assert_eq!(addresses.len(), 4, "users 0..=3 for {kind:?}");
            assert_eq!(store.max_user_id(kind).await.unwrap(), Some(3));
        }

        // A second sync with the same Zex answer inserts nothing new.
        registry.sync(&store, &zex).await.unwrap();
        let addresses = store.active_addresses(ChainKind::Evm).await.unwrap();
        assert_eq!(addresses.len(), 4);
    }
}
