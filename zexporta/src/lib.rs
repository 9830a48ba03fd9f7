//! # Zexporta
//!
//! Multi-chain deposit/withdraw bridge coordinator for the Zex exchange.
//! For each supported chain the coordinator derives per-user deposit
//! addresses from a single group key, observes the chain tip for incoming
//! transfers, walks each transfer through the deposit state machine, runs
//! threshold-signature rounds with the validator set over finalized
//! batches and withdraw requests, and submits the signed results to Zex
//! and on-chain.
//!
//! Every role (observer, finalizer, SA deposit round, withdraw observer,
//! withdraw SA, vault depositor, validator, API) is a subcommand of the
//! `zexporta` binary and spawns one cooperative task per configured chain.

#![deny(missing_docs)]

pub mod api;
pub mod config;
pub mod encoder;
pub mod error;
pub mod explorer;
pub mod finalizer;
pub mod observer;
pub mod registry;
pub mod sa;
pub mod sequencer;
pub mod storage;
#[cfg(test)]
pub(crate) mod testing;
pub mod threshold;
pub mod utxo;
pub mod validator;
pub mod withdraw_observer;
pub mod zex;

/// Package version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
