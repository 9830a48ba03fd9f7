//! Typed error family for chain clients.

/// Errors surfaced by a [`crate::ChainClient`].
///
/// Callers retry the transient kinds (`Timeout`, `Connection`,
/// `BadResponse`) with bounded backoff; `TransferNotValid` is always
/// skip-and-log; `NotFound` is how a reorged transaction shows up.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The request did not complete within the per-request timeout.
    #[error("request timed out: {0}")]
    Timeout(String),

    /// The endpoint could not be reached.
    #[error("connection error: {0}")]
    Connection(String),

    /// The endpoint answered with something we could not interpret: a
    /// non-2xx status, malformed JSON, or an RPC-level error object.
    #[error("bad response: {0}")]
    BadResponse(String),

    /// The requested block or transaction does not exist on this node's
    /// view of the chain.
    #[error("not found: {0}")]
    NotFound(String),

    /// The transaction exists but does not decode into a transfer we
    /// recognize.
    #[error("transfer not valid: {0}")]
    TransferNotValid(String),
}

impl ClientError {
    /// Whether a caller should retry after a short backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ClientError::Timeout(_) | ClientError::Connection(_) | ClientError::BadResponse(_)
        )
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            ClientError::Timeout(error.to_string())
        } else if error.is_connect() {
            ClientError::Connection(error.to_string())
        } else {
            ClientError::BadResponse(error.to_string())
        }
    }
}
