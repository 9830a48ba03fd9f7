//! Application error type.

use clients::ClientError;

/// Top-level error for the coordinator roles.
///
/// The round-shaped variants (`DifferentHash`, `ValidatorReject`,
/// `RoundTimeout`) are the explicit outcomes a signature round can end
/// with; the caller loop handles each arm instead of unwinding.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A chain RPC failure, carrying the typed client family.
    #[error("chain client: {0}")]
    Client(#[from] ClientError),

    /// A storage layer failure.
    #[error("storage: {0}")]
    Storage(String),

    /// A Zex API failure.
    #[error("zex api: {0}")]
    Zex(#[from] crate::zex::ZexError),

    /// A threshold-signature gateway failure.
    #[error("threshold signer: {0}")]
    Threshold(#[from] crate::threshold::ThresholdError),

    /// A sequencer failure (Bitcoin withdraw phase A/B).
    #[error("sequencer: {0}")]
    Sequencer(String),

    /// The validators' hash does not match the locally computed one.
    #[error("hash mismatch: ours {ours}, validators {theirs}")]
    DifferentHash {
        /// The hash computed locally by the aggregator.
        ours: String,
        /// The hash returned by the validator set.
        theirs: String,
    },

    /// The validator set did not produce a successful round.
    #[error("validators rejected the round: {0}")]
    ValidatorReject(String),

    /// A signature round did not complete within the configured timeout.
    #[error("signature round timed out after {0} seconds")]
    RoundTimeout(u64),

    /// The UTXO pool cannot cover a withdraw amount plus its fee.
    #[error("not enough unspent inputs: need {required} sats, have {available}")]
    NotEnoughInputs {
        /// Amount plus estimated fee, in satoshis.
        required: u64,
        /// Sum of the available unspent pool, in satoshis.
        available: u64,
    },

    /// An address, hash, or key failed to parse.
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// The on-chain contract call reverted with a custom error.
    #[error("contract rejected the call: {0}")]
    ContractError(String),

    /// Configuration could not be loaded or is inconsistent.
    #[error("config: {0}")]
    Config(String),
}

impl From<mongodb::error::Error> for Error {
    fn from(error: mongodb::error::Error) -> Self {
        Error::Storage(error.to_string())
    }
}

impl From<bson::ser::Error> for Error {
    fn from(error: bson::ser::Error) -> Self {
        Error::Storage(error.to_string())
    }
}

impl From<bson::de::Error> for Error {
    fn from(error: bson::de::Error) -> Self {
        Error::Storage(error.to_string())
    }
}

impl Error {
    /// Whether the failure is worth retrying after a short backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Client(error) => error.is_transient(),
            Error::Storage(_) | Error::Zex(_) | Error::Sequencer(_) | Error::RoundTimeout(_) => {
                true
            }
            _ => false,
        }
    }
}
