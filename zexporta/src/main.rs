//! Zexporta entrypoint: one subcommand per role, one task per chain.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use clients::{btc::BtcClient, evm::EvmClient};

use zexporta::api::{self, ApiContext};
use zexporta::config::{ChainSettings, Settings};
use zexporta::error::Error;
use zexporta::finalizer::{BtcUtxoMiddleware, Finalizer, FinalizerConfig, NoMiddleware};
use zexporta::observer::{DepositObserver, ObserverConfig};
use zexporta::registry::AddressRegistry;
use zexporta::sa::deposit::{DepositRoundConfig, SaDepositRound};
use zexporta::sa::evm_sender::{shield_signer, EvmSender};
use zexporta::sa::vault_depositor::{VaultDepositor, VaultDepositorConfig};
use zexporta::sa::withdraw_btc::{BtcWithdrawConfig, BtcWithdrawRound};
use zexporta::sa::withdraw_evm::{EvmWithdrawConfig, EvmWithdrawRound};
use zexporta::sequencer::HttpSequencer;
use zexporta::storage::model::ChainKind;
use zexporta::storage::mongo::MongoStore;
use zexporta::threshold::{load_dkg_key, DkgKey, HttpThresholdSigner};
use zexporta::validator::{self, ChainHandle, ValidatorContext};
use zexporta::withdraw_observer::{WithdrawObserver, WithdrawObserverConfig};
use zexporta::zex::ZexClient;

#[derive(Debug, Parser)]
#[command(name = "zexporta", version = zexporta::VERSION, about = "Zex deposit/withdraw bridge coordinator")]
struct Cli {
    #[command(subcommand)]
    role: Role,
}

#[derive(Debug, Subcommand)]
enum Role {
    /// Observe chain tips and persist incoming deposits.
    Observer,
    /// Promote finalized deposits and demote reorged ones.
    Finalizer,
    /// Drive threshold-signature rounds over finalized deposit batches.
    SaDeposit,
    /// Pull new withdraw requests from Zex.
    WithdrawObserver,
    /// Drive threshold-signature rounds over withdraw requests.
    WithdrawSa,
    /// Sweep verified EVM deposits into the vault.
    VaultDepositor,
    /// Serve the validator verification endpoints.
    Validator,
    /// Serve the health and inspection API.
    Api,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let settings = match Settings::new() {
        Ok(settings) => settings,
        Err(error) => {
            tracing::error!(%error, "failed to load configuration");
            std::process::exit(1);
        }
    };

    if let Err(error) = run(cli.role, settings).await {
        tracing::error!(%error, "fatal error");
        std::process::exit(1);
    }
}

async fn run(role: Role, settings: Settings) -> Result<(), Error> {
    let store = MongoStore::connect(&settings.mongo).await?;
    let zex = ZexClient::new(settings.zex.base_url.clone())?;
    let registry = build_registry(&settings)?;

    match role {
        Role::Observer => run_observer(settings, store, zex, registry).await,
        Role::Finalizer => run_finalizer(settings, store).await,
        Role::SaDeposit => run_sa_deposit(settings, store, zex).await,
        Role::WithdrawObserver => run_withdraw_observer(settings, store, zex).await,
        Role::WithdrawSa => run_withdraw_sa(settings, store).await,
        Role::VaultDepositor => run_vault_depositor(settings, store).await,
        Role::Validator => run_validator(settings, store, zex, registry).await,
        Role::Api => run_api(settings, store, zex).await,
    }
}

fn build_registry(settings: &Settings) -> Result<AddressRegistry, Error> {
    let btc = settings.chains.iter().find_map(|chain| match chain {
        ChainSettings::Btc(chain) => Some(chain),
        ChainSettings::Evm(_) => None,
    });

    let network = btc
        .map(|chain| chain.parsed_network())
        .transpose()?
        .unwrap_or(bitcoin::Network::Bitcoin);

    AddressRegistry::new(
        settings.user_deposit.factory_address.clone(),
        settings.user_deposit.bytecode_hash.clone(),
        btc.map(|chain| chain.group_pub_key.as_str()),
        network,
    )
}

fn kind_of(chain: &ChainSettings) -> ChainKind {
    if chain.is_btc() {
        ChainKind::Btc
    } else {
        ChainKind::Evm
    }
}

fn threshold_signer(settings: &Settings) -> Result<(HttpThresholdSigner, DkgKey), Error> {
    let signer = HttpThresholdSigner::new(
        settings.threshold.gateway_url.clone(),
        Duration::from_secs(settings.sa.timeout),
    )?;
    let dkg_key = load_dkg_key(&settings.dkg.json_path, &settings.dkg.name)?;
    Ok((signer, dkg_key))
}

async fn wait_for_shutdown(handles: Vec<tokio::task::JoinHandle<()>>) -> Result<(), Error> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|error| Error::Config(format!("signal handler: {error}")))?;
    tracing::info!("shutdown signal received");
    for handle in handles {
        handle.abort();
    }
    Ok(())
}

async fn run_observer(
    settings: Settings,
    store: MongoStore,
    zex: ZexClient,
    registry: AddressRegistry,
) -> Result<(), Error> {
    let mut handles = Vec::new();

    for chain in &settings.chains {
        let observer = DepositObserver {
            client: chain.build_client()?,
            store: store.clone(),
            zex: zex.clone(),
            registry: registry.clone(),
            config: ObserverConfig {
                chain_symbol: chain.symbol().to_owned(),
                kind: kind_of(chain),
                delay: Duration::from_secs(chain.delay()),
                batch_block_size: chain.batch_block_size(),
            },
        };
        handles.push(tokio::spawn(observer.run()));
    }

    wait_for_shutdown(handles).await
}

async fn run_finalizer(settings: Settings, store: MongoStore) -> Result<(), Error> {
    let mut handles = Vec::new();

    for chain in &settings.chains {
        let config = FinalizerConfig {
            chain_symbol: chain.symbol().to_owned(),
            kind: kind_of(chain),
            delay: Duration::from_secs(chain.delay()),
            batch_block_size: chain.batch_block_size(),
        };
        let client = chain.build_client()?;

        let handle = match chain {
            ChainSettings::Btc(_) => tokio::spawn(
                Finalizer {
                    client,
                    store: store.clone(),
                    middleware: BtcUtxoMiddleware,
                    config,
                }
                .run(),
            ),
            ChainSettings::Evm(_) => tokio::spawn(
                Finalizer {
                    client,
                    store: store.clone(),
                    middleware: NoMiddleware,
                    config,
                }
                .run(),
            ),
        };
        handles.push(handle);
    }

    wait_for_shutdown(handles).await
}

async fn run_sa_deposit(
    settings: Settings,
    store: MongoStore,
    zex: ZexClient,
) -> Result<(), Error> {
    let (signer, dkg_key) = threshold_signer(&settings)?;
    let shield = shield_signer(&settings.sa.shield_private_key)?;
    let mut handles = Vec::new();

    for chain in &settings.chains {
        let round = SaDepositRound {
            store: store.clone(),
            signer: signer.clone(),
            zex: zex.clone(),
            dkg_key: dkg_key.clone(),
            shield: shield.clone(),
            config: DepositRoundConfig {
                chain_symbol: chain.symbol().to_owned(),
                kind: kind_of(chain),
                delay: Duration::from_secs(settings.sa.delay),
                batch_size: settings.sa.transactions_batch_size,
                encode_version: settings.zex.encode_version,
            },
        };
        handles.push(tokio::spawn(round.run()));
    }

    wait_for_shutdown(handles).await
}

async fn run_withdraw_observer(
    settings: Settings,
    store: MongoStore,
    zex: ZexClient,
) -> Result<(), Error> {
    let mut handles = Vec::new();

    for chain in &settings.chains {
        let chain_id = match chain {
            ChainSettings::Evm(chain) => Some(chain.chain_id),
            ChainSettings::Btc(_) => None,
        };
        let observer = WithdrawObserver {
            store: store.clone(),
            zex: zex.clone(),
            config: WithdrawObserverConfig {
                chain_symbol: chain.symbol().to_owned(),
                kind: kind_of(chain),
                chain_id,
                delay: Duration::from_secs(chain.delay()),
            },
        };
        handles.push(tokio::spawn(observer.run()));
    }

    wait_for_shutdown(handles).await
}

async fn run_withdraw_sa(settings: Settings, store: MongoStore) -> Result<(), Error> {
    let (signer, dkg_key) = threshold_signer(&settings)?;
    let shield = shield_signer(&settings.sa.shield_private_key)?;
    let sequencer = HttpSequencer::new(
        settings.sequencer.base_url.clone(),
        settings.sequencer.app_name.clone(),
    )?;
    let mut handles = Vec::new();

    for chain in &settings.chains {
        match chain {
            ChainSettings::Evm(chain) => {
                let client = EvmClient::new(
                    chain.symbol.clone(),
                    chain.rpc.clone(),
                    chain.chain_id,
                    chain.finalize_block_count,
                )?;
                let round = EvmWithdrawRound {
                    store: store.clone(),
                    signer: signer.clone(),
                    dkg_key: dkg_key.clone(),
                    shield: shield.clone(),
                    sender: EvmSender::new(client, &settings.withdrawer.private_key)?,
                    config: EvmWithdrawConfig {
                        chain_symbol: chain.symbol.clone(),
                        vault_address: chain.vault_address.clone(),
                        delay: Duration::from_secs(settings.sa.delay),
                        receipt_attempts: 20,
                        receipt_interval: Duration::from_secs(chain.delay),
                    },
                };
                handles.push(tokio::spawn(round.run()));
            }
            ChainSettings::Btc(chain) => {
                let network = chain.parsed_network()?;
                let client = BtcClient::new(
                    chain.symbol.clone(),
                    chain.rpc.clone(),
                    chain.indexer.clone(),
                    chain.finalize_block_count,
                    network,
                )?;
                let round = BtcWithdrawRound {
                    store: store.clone(),
                    signer: signer.clone(),
                    sequencer: sequencer.clone(),
                    client,
                    dkg_key: dkg_key.clone(),
                    config: BtcWithdrawConfig {
                        chain_symbol: chain.symbol.clone(),
                        vault_address: chain.vault_address.clone(),
                        network,
                        delay: Duration::from_secs(settings.sa.delay),
                    },
                };
                handles.push(tokio::spawn(round.run()));
            }
        }
    }

    wait_for_shutdown(handles).await
}

async fn run_vault_depositor(settings: Settings, store: MongoStore) -> Result<(), Error> {
    let mut handles = Vec::new();

    for chain in &settings.chains {
        let ChainSettings::Evm(chain) = chain else {
            continue;
        };

        let client = EvmClient::new(
            chain.symbol.clone(),
            chain.rpc.clone(),
            chain.chain_id,
            chain.finalize_block_count,
        )?;
        let depositor = VaultDepositor {
            store: store.clone(),
            sender: EvmSender::new(client, &settings.withdrawer.private_key)?,
            config: VaultDepositorConfig {
                chain_symbol: chain.symbol.clone(),
                factory_address: settings.user_deposit.factory_address.clone(),
                delay: Duration::from_secs(chain.delay.max(10)),
                receipt_attempts: 20,
                receipt_interval: Duration::from_secs(chain.delay),
            },
        };
        handles.push(tokio::spawn(depositor.run()));
    }

    wait_for_shutdown(handles).await
}

async fn run_validator(
    settings: Settings,
    store: MongoStore,
    zex: ZexClient,
    registry: AddressRegistry,
) -> Result<(), Error> {
    let sequencer = HttpSequencer::new(
        settings.sequencer.base_url.clone(),
        settings.sequencer.app_name.clone(),
    )?;

    let mut chains = HashMap::new();
    for chain in &settings.chains {
        let handle = match chain {
            ChainSettings::Evm(chain_settings) => ChainHandle {
                client: chain.build_client()?,
                kind: ChainKind::Evm,
                chain_id: Some(chain_settings.chain_id),
                vault_address: chain_settings.vault_address.clone(),
                network: None,
            },
            ChainSettings::Btc(chain_settings) => ChainHandle {
                client: chain.build_client()?,
                kind: ChainKind::Btc,
                chain_id: None,
                vault_address: chain_settings.vault_address.clone(),
                network: Some(chain_settings.parsed_network()?),
            },
        };
        chains.insert(chain.symbol().to_owned(), handle);
    }

    let context = Arc::new(ValidatorContext {
        store,
        zex,
        registry,
        sequencer,
        chains,
        encode_version: settings.zex.encode_version,
    });

    let listener = tokio::net::TcpListener::bind(&settings.api.validator_listen)
        .await
        .map_err(|error| Error::Config(format!("validator listen: {error}")))?;
    tracing::info!(listen = %settings.api.validator_listen, "validator service up");

    axum::serve(listener, validator::router(context))
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await
        .map_err(|error| Error::Config(format!("validator server: {error}")))
}

async fn run_api(settings: Settings, store: MongoStore, zex: ZexClient) -> Result<(), Error> {
    let chains = settings
        .chains
        .iter()
        .map(|chain| (chain.symbol().to_owned(), kind_of(chain)))
        .collect();

    let context = Arc::new(ApiContext { store, zex, chains });

    let listener = tokio::net::TcpListener::bind(&settings.api.listen)
        .await
        .map_err(|error| Error::Config(format!("api listen: {error}")))?;
    tracing::info!(listen = %settings.api.listen, "deposit api up");

    axum::serve(listener, api::router(context))
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await
        .map_err(|error| Error::Config(format!("api server: {error}")))
}
