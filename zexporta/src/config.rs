//! Typed configuration.
//!
//! Settings are layered from an optional `zexporta.toml` in the working
//! directory and `ZEXPORTA__`-prefixed environment variables, using `__`
//! as the section separator (`ZEXPORTA__MONGO__HOST=db` overrides
//! `[mongo] host`).

use std::path::PathBuf;

use serde::Deserialize;
use url::Url;

use clients::{btc::BtcClient, evm::EvmClient, ChainSymbol, Client};

use crate::error::Error;

/// Deployment environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Local development.
    Dev,
    /// Production.
    Prod,
    /// Automated tests.
    Test,
}

/// Root configuration for every role.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Deployment environment.
    pub env: Environment,
    /// Zex API settings.
    pub zex: ZexSettings,
    /// Document store settings.
    pub mongo: MongoSettings,
    /// DKG key material location.
    pub dkg: DkgSettings,
    /// Signature-aggregator settings.
    pub sa: SaSettings,
    /// On-chain withdrawer account.
    pub withdrawer: WithdrawerSettings,
    /// User-deposit factory parameters for CREATE2 derivation.
    pub user_deposit: UserDepositSettings,
    /// Threshold-signature gateway.
    pub threshold: ThresholdSettings,
    /// Sequencer used by the Bitcoin withdraw pipeline.
    pub sequencer: SequencerSettings,
    /// Exposed HTTP surface.
    #[serde(default)]
    pub api: ApiSettings,
    /// The chains this deployment serves.
    pub chains: Vec<ChainSettings>,
}

/// Zex API section.
#[derive(Debug, Clone, Deserialize)]
pub struct ZexSettings {
    /// Base URL of the Zex HTTP API.
    pub base_url: Url,
    /// Version byte used in the deposit batch encoding.
    pub encode_version: u8,
}

/// MongoDB section.
#[derive(Debug, Clone, Deserialize)]
pub struct MongoSettings {
    /// Database host.
    pub host: String,
    /// Database port.
    #[serde(default = "default_mongo_port")]
    pub port: u16,
    /// Database name.
    #[serde(default = "default_db_name")]
    pub db_name: String,
}

impl MongoSettings {
    /// The connection string for this database.
    pub fn uri(&self) -> String {
        format!("mongodb://{}:{}/", self.host, self.port)
    }
}

/// DKG key material section.
#[derive(Debug, Clone, Deserialize)]
pub struct DkgSettings {
    /// Path to the JSON file holding the generated DKG keys.
    pub json_path: PathBuf,
    /// Name of the key entry to use.
    pub name: String,
}

/// Signature-aggregator section.
#[derive(Debug, Clone, Deserialize)]
pub struct SaSettings {
    /// How many finalized block numbers a deposit round may span.
    #[serde(default = "default_batch_block_number_size")]
    pub batch_block_number_size: usize,
    /// How many finalized deposits a single round signs over.
    #[serde(default = "default_transactions_batch_size")]
    pub transactions_batch_size: usize,
    /// ECDSA key producing the shield signature sent along to Zex.
    pub shield_private_key: String,
    /// Signature round timeout, seconds.
    #[serde(default = "default_sa_timeout")]
    pub timeout: u64,
    /// Pause between rounds, seconds.
    #[serde(default = "default_sa_delay")]
    pub delay: u64,
}

/// Withdrawer account section.
#[derive(Debug, Clone, Deserialize)]
pub struct WithdrawerSettings {
    /// Private key of the EOA submitting vault calls.
    pub private_key: String,
}

/// User-deposit factory section.
#[derive(Debug, Clone, Deserialize)]
pub struct UserDepositSettings {
    /// CREATE2 factory contract address.
    pub factory_address: String,
    /// keccak256 of the user-deposit contract creation bytecode.
    pub bytecode_hash: String,
}

/// Threshold-signature gateway section.
#[derive(Debug, Clone, Deserialize)]
pub struct ThresholdSettings {
    /// Base URL of the FROST aggregation gateway.
    pub gateway_url: Url,
}

/// Sequencer section.
#[derive(Debug, Clone, Deserialize)]
pub struct SequencerSettings {
    /// Base URL of the sequencer node.
    pub base_url: Url,
    /// Application namespace within the sequencer.
    pub app_name: String,
}

/// HTTP surface section.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiSettings {
    /// Listen address of the deposit API.
    #[serde(default = "default_api_listen")]
    pub listen: String,
    /// Listen address of the validator service.
    #[serde(default = "default_validator_listen")]
    pub validator_listen: String,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            listen: default_api_listen(),
            validator_listen: default_validator_listen(),
        }
    }
}

/// Per-chain configuration, discriminated by chain family.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "family", rename_all = "lowercase")]
pub enum ChainSettings {
    /// An EVM network.
    Evm(EvmChainSettings),
    /// Bitcoin.
    Btc(BtcChainSettings),
}

/// EVM chain section.
#[derive(Debug, Clone, Deserialize)]
pub struct EvmChainSettings {
    /// Chain symbol, e.g. "SEP".
    pub symbol: ChainSymbol,
    /// JSON-RPC endpoint.
    pub rpc: Url,
    /// Numeric chain id.
    pub chain_id: u64,
    /// Vault contract address.
    pub vault_address: String,
    /// Depth-based finality; `None` uses the node's `finalized` tag.
    #[serde(default)]
    pub finalize_block_count: Option<u64>,
    /// Loop delay, seconds.
    #[serde(default = "default_delay")]
    pub delay: u64,
    /// Blocks fetched per explorer window.
    #[serde(default = "default_batch_block_size")]
    pub batch_block_size: u64,
    /// Whether the chain runs proof-of-authority.
    #[serde(default)]
    pub poa: bool,
}

/// Bitcoin chain section.
#[derive(Debug, Clone, Deserialize)]
pub struct BtcChainSettings {
    /// Chain symbol, normally "BTC".
    pub symbol: ChainSymbol,
    /// bitcoind JSON-RPC endpoint.
    pub rpc: Url,
    /// Blockbook indexer endpoint.
    pub indexer: Url,
    /// Vault taproot address.
    pub vault_address: String,
    /// The group public key deposit addresses are tweaked from.
    pub group_pub_key: String,
    /// Address network: bitcoin, testnet, signet, or regtest.
    #[serde(default = "default_btc_network")]
    pub network: String,
    /// Depth-based finality.
    #[serde(default = "default_btc_finalize_count")]
    pub finalize_block_count: u64,
    /// Loop delay, seconds.
    #[serde(default = "default_delay")]
    pub delay: u64,
    /// Blocks fetched per explorer window.
    #[serde(default = "default_batch_block_size")]
    pub batch_block_size: u64,
}

impl BtcChainSettings {
    /// The parsed address network.
    pub fn parsed_network(&self) -> Result<bitcoin::Network, Error> {
        self.network
            .parse()
            .map_err(|_| Error::Config(format!("unknown bitcoin network {}", self.network)))
    }
}

impl ChainSettings {
    /// The chain's symbol.
    pub fn symbol(&self) -> &str {
        match self {
            ChainSettings::Evm(chain) => &chain.symbol,
            ChainSettings::Btc(chain) => &chain.symbol,
        }
    }

    /// Loop delay in seconds.
    pub fn delay(&self) -> u64 {
        match self {
            ChainSettings::Evm(chain) => chain.delay,
            ChainSettings::Btc(chain) => chain.delay,
        }
    }

    /// Blocks per explorer window.
    pub fn batch_block_size(&self) -> u64 {
        match self {
            ChainSettings::Evm(chain) => chain.batch_block_size,
            ChainSettings::Btc(chain) => chain.batch_block_size,
        }
    }

    /// Whether this is the Bitcoin chain.
    pub fn is_btc(&self) -> bool {
        matches!(self, ChainSettings::Btc(_))
    }

    /// Build the RPC client for this chain.
    pub fn build_client(&self) -> Result<Client, Error> {
        match self {
            ChainSettings::Evm(chain) => {
                let client = EvmClient::new(
                    chain.symbol.clone(),
                    chain.rpc.clone(),
                    chain.chain_id,
                    chain.finalize_block_count,
                )?;
                Ok(Client::Evm(client))
            }
            ChainSettings::Btc(chain) => {
                let client = BtcClient::new(
                    chain.symbol.clone(),
                    chain.rpc.clone(),
                    chain.indexer.clone(),
                    chain.finalize_block_count,
                    chain.parsed_network()?,
                )?;
                Ok(Client::Btc(client))
            }
        }
    }
}

impl Settings {
    /// Load settings from `zexporta.toml` plus the environment.
    pub fn new() -> Result<Self, Error> {
        Self::from_file("zexporta")
    }

    /// Load settings from the named config file plus the environment.
    pub fn from_file(name: &str) -> Result<Self, Error> {
        config::Config::builder()
            .add_source(config::File::with_name(name).required(false))
            .add_source(config::Environment::with_prefix("ZEXPORTA").separator("__"))
            .build()
            .and_then(config::Config::try_deserialize)
            .map_err(|error| Error::Config(error.to_string()))
    }

    /// The configured chain entry with the given symbol.
    pub fn chain(&self, symbol: &str) -> Option<&ChainSettings> {
        self.chains.iter().find(|chain| chain.symbol() == symbol)
    }
}

fn default_mongo_port() -> u16 {
    27017
}

fn default_db_name() -> String {
    "transaction_database".to_owned()
}

fn default_batch_block_number_size() -> usize {
    100
}

fn default_transactions_batch_size() -> usize {
    2
}

fn default_sa_timeout() -> u64 {
    60
}

fn default_sa_delay() -> u64 {
    20
}

fn default_api_listen() -> String {
    "0.0.0.0:8080".to_owned()
}

fn default_validator_listen() -> String {
    "0.0.0.0:8090".to_owned()
}

fn default_delay() -> u64 {
    3
}

fn default_batch_block_size() -> u64 {
    5
}

fn default_btc_network() -> String {
    "bitcoin".to_owned()
}

fn default_btc_finalize_count() -> u64 {
    6
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_sections_deserialize_by_family() {
        let toml = r#"
            env = "test"

            [zex]
            base_url = "http://zex.local/"
            encode_version = 1

            [mongo]
            host = "localhost"

            [dkg]
            json_path = "./dkgs.json"
            name = "ethereum"

            [sa]
            shield_private_key = "0x01"

            [withdrawer]
            private_key = "0x02"

            [user_deposit]
            factory_address = "0x4e59b44847b379578588920cA78FbF26c0B4956C"
            bytecode_hash = "0x21c35dbe1b344a2488cf3321d6ce542f8e9f305544ff09e4993a62319a497c1f"

            [threshold]
            gateway_url = "http://frost.local/"

            [sequencer]
            base_url = "http://sequencer.local/"
            app_name = "zexporta"

            [[chains]]
            family = "evm"
            symbol = "SEP"
            rpc = "http://sepolia.local/"
            chain_id = 11155111
            vault_address = "0x0000000000000000000000000000000000000001"
            finalize_block_count = 1

            [[chains]]
            family = "btc"
            symbol = "BTC"
            rpc = "http://bitcoind.local/"
            indexer = "http://blockbook.local/"
            vault_address = "bcrt1pexample"
            group_pub_key = "79be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798"
            network = "regtest"
        "#;

        let settings: Settings = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .and_then(config::Config::try_deserialize)
            .unwrap();

        assert_eq!(settings.env, Environment::Test);
        assert_eq!(settings.chains.len(), 2);
        assert_eq!(settings.mongo.port, 27017);
        assert_eq!(settings.sa.transactions_batch_size, 2);

        let sep = settings.chain("SEP").unwrap();
        assert!(!sep.is_btc());
        assert_eq!(sep.batch_block_size(), 5);

        let btc = settings.chain("BTC").unwrap();
        assert!(btc.is_btc());
        match btc {
            ChainSettings::Btc(chain) => {
                assert_eq!(chain.finalize_block_count, 6);
                assert_eq!(chain.parsed_network().unwrap(), bitcoin::Network::Regtest);
            }
            ChainSettings::Evm(_) => unreachable!(),
        }
    }
}
