//! Vault UTXO selection and Bitcoin transaction construction.
//!
//! A withdraw transaction always has the same shape: one input per chosen
//! vault UTXO, the payout output first, and the change back to the vault
//! taproot address second. The fee estimator prices the unsigned shape
//! plus ~30 bytes of witness per input, so selection and the final
//! transaction agree on the fee.

use std::str::FromStr as _;

use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash as _;
use bitcoin::sighash::{Prevouts, SighashCache, TapSighashType};
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};

use crate::error::Error;
use crate::storage::model::Utxo;

/// Extra virtual bytes budgeted per input for its future schnorr witness.
const SIGNATURE_VSIZE: usize = 30;

/// An unsigned withdraw transaction with its per-input taproot digests.
#[derive(Debug, Clone)]
pub struct WithdrawTransaction {
    /// The unsigned transaction.
    pub tx: Transaction,
    /// `SIGHASH_ALL` key-spend digest per input, in input order.
    pub sighashes: Vec<[u8; 32]>,
    /// The fee the shape pays, in satoshis.
    pub fee: u64,
}

impl WithdrawTransaction {
    /// The serialized transaction as consensus hex — the bytes every
    /// validator must agree on.
    pub fn to_hex(&self) -> String {
        bitcoin::consensus::encode::serialize_hex(&self.tx)
    }

    /// The transaction id of the unsigned shape.
    pub fn txid(&self) -> String {
        self.tx.compute_txid().to_string()
    }

    /// Attach one key-spend witness per input, in input order.
    pub fn attach_witnesses(&mut self, signatures: Vec<bitcoin::taproot::Signature>) {
        for (input, signature) in self.tx.input.iter_mut().zip(signatures) {
            input.witness = Witness::p2tr_key_spend(&signature);
        }
    }
}

fn address_script(address: &str, network: bitcoin::Network) -> Result<ScriptBuf, Error> {
    Ok(clients::btc::script_pubkey(address, network)?)
}

fn parse_outpoint(utxo: &Utxo) -> Result<OutPoint, Error> {
    let txid = Txid::from_str(&utxo.tx_hash)
        .map_err(|error| Error::InvalidValue(format!("txid {}: {error}", utxo.tx_hash)))?;
    Ok(OutPoint::new(txid, utxo.index))
}

fn unsigned_shape(
    utxos: &[Utxo],
    amount: u64,
    change: u64,
    recipient_script: ScriptBuf,
    vault_script: ScriptBuf,
) -> Result<Transaction, Error> {
    let input = utxos
        .iter()
        .map(|utxo| {
            Ok(TxIn {
                previous_output: parse_outpoint(utxo)?,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            })
        })
        .collect::<Result<Vec<TxIn>, Error>>()?;

    let output = vec![
        TxOut {
            value: Amount::from_sat(amount),
            script_pubkey: recipient_script,
        },
        TxOut {
            value: Amount::from_sat(change),
            script_pubkey: vault_script,
        },
    ];

    Ok(Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input,
        output,
    })
}

/// Price a withdraw shape over the given inputs at `sat_per_byte`.
pub fn estimate_fee(
    utxos: &[Utxo],
    amount: u64,
    recipient: &str,
    vault: &str,
    network: bitcoin::Network,
    sat_per_byte: u64,
) -> Result<u64, Error> {
    let shape = unsigned_shape(
        utxos,
        amount,
        0,
        address_script(recipient, network)?,
        address_script(vault, network)?,
    )?;

    let vsize = shape.vsize() + SIGNATURE_VSIZE * utxos.len();
    Ok(vsize as u64 * sat_per_byte)
}

/// Choose inputs for a withdraw, largest-first, until they cover the
/// amount plus the fee of the resulting shape.
///
/// `unspent` must be sorted by amount descending, as the storage layer
/// returns it.
pub fn select_utxos(
    unspent: &[Utxo],
    amount: u64,
    recipient: &str,
    vault: &str,
    network: bitcoin::Network,
    sat_per_byte: u64,
) -> Result<(Vec<Utxo>, u64), Error> {
    let mut chosen: Vec<Utxo> = Vec::new();
    let mut total: u64 = 0;

    for utxo in unspent {
        total += utxo.amount;
        chosen.push(utxo.clone());

        let fee = estimate_fee(&chosen, amount, recipient, vault, network, sat_per_byte)?;
        if total >= amount.saturating_add(fee) {
            return Ok((chosen, fee));
        }
    }

    let shortfall_fee = if chosen.is_empty() {
        0
    } else {
        estimate_fee(&chosen, amount, recipient, vault, network, sat_per_byte)?
    };
    Err(Error::NotEnoughInputs {
        required: amount.saturating_add(shortfall_fee),
        available: total,
    })
}

/// Build the unsigned withdraw transaction over an already-chosen UTXO
/// set, plus the taproot `SIGHASH_ALL` digest of every input.
///
/// Outputs, in order: the payout to `recipient`, and
/// `sum(inputs) − amount − fee` back to the vault.
pub fn build_withdraw_tx(
    utxos: &[Utxo],
    amount: u64,
    recipient: &str,
    vault: &str,
    network: bitcoin::Network,
    sat_per_byte: u64,
) -> Result<WithdrawTransaction, Error> {
    let total: u64 = utxos.iter().map(|utxo| utxo.amount).sum();
    let fee = estimate_fee(utxos, amount, recipient, vault, network, sat_per_byte)?;

    let change = total
        .checked_sub(amount)
        .and_then(|rest| rest.checked_sub(fee))
        .ok_or(Error::NotEnoughInputs {
            required: amount.saturating_add(fee),
            available: total,
        })?;

    let tx = unsigned_shape(
        utxos,
        amount,
        change,
        address_script(recipient, network)?,
        address_script(vault, network)?,
    )?;

    let prevouts: Vec<TxOut> = utxos
        .iter()
        .map(|utxo| {
            Ok(TxOut {
                value: Amount::from_sat(utxo.amount),
                script_pubkey: address_script(&utxo.address, network)?,
            })
        })
        .collect::<Result<_, Error>>()?;

    let mut cache = SighashCache::new(&tx);
    let sighashes = (0..utxos.len())
        .map(|index| {
            cache
                .taproot_key_spend_signature_hash(
                    index,
                    &Prevouts::All(&prevouts),
                    TapSighashType::All,
                )
                .map(|sighash| sighash.to_raw_hash().to_byte_array())
                .map_err(|error| Error::InvalidValue(format!("sighash: {error}")))
        })
        .collect::<Result<Vec<_>, Error>>()?;

    Ok(WithdrawTransaction { tx, sighashes, fee })
}
