//! Threshold-signature capability.
//!
//! The cryptographic primitive itself lives outside this repository; the
//! coordinator consumes it through the [`ThresholdSigner`] trait. The
//! production implementation is an HTTP gateway in front of the FROST
//! aggregation service: one call fetches one-time nonces from the DKG
//! party, the other drives a full signing round and returns the
//! aggregated result together with the validators' `message_hash`.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::time::Duration;

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};
use url::Url;

/// Errors from the threshold-signature gateway.
#[derive(Debug, thiserror::Error)]
pub enum ThresholdError {
    /// Transport-level failure.
    #[error("gateway request failed: {0}")]
    Http(String),
    /// The gateway answered with something unexpected.
    #[error("bad gateway response: {0}")]
    BadResponse(String),
    /// The DKG key material could not be loaded.
    #[error("dkg key: {0}")]
    Key(String),
}

impl From<reqwest::Error> for ThresholdError {
    fn from(error: reqwest::Error) -> Self {
        ThresholdError::Http(error.to_string())
    }
}

/// A pre-generated DKG keypair reference. The private key is never
/// reconstructed anywhere; only the public half and the party roster are
/// consumed here.
#[derive(Debug, Clone, Serialize)]
pub struct DkgKey {
    /// Name of the key entry in the DKG file.
    pub name: String,
    /// The shared public key, as the DKG ceremony emitted it.
    pub public_key: serde_json::Value,
    /// Identifiers of the validators holding shares.
    pub party: Vec<String>,
}

/// Load the named key from a DKG ceremony output file.
pub fn load_dkg_key(path: &Path, name: &str) -> Result<DkgKey, ThresholdError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|error| ThresholdError::Key(format!("{}: {error}", path.display())))?;
    let all: serde_json::Value = serde_json::from_str(&raw)
        .map_err(|error| ThresholdError::Key(format!("{}: {error}", path.display())))?;

    let entry = all
        .get(name)
        .ok_or_else(|| ThresholdError::Key(format!("no dkg entry named {name}")))?;

    let party = entry
        .get("party")
        .and_then(serde_json::Value::as_array)
        .ok_or_else(|| ThresholdError::Key(format!("{name}: missing party roster")))?
        .iter()
        .filter_map(|id| id.as_str().map(str::to_owned))
        .collect();

    Ok(DkgKey {
        name: name.to_owned(),
        public_key: entry.get("public_key").cloned().unwrap_or_default(),
        party,
    })
}

/// What the aggregator asks the validator set to verify and sign.
#[derive(Debug, Clone, Serialize)]
pub struct SigningRequest {
    /// The validator handler to dispatch to ("deposit" / "withdraw").
    pub method: String,
    /// Handler-specific payload.
    pub data: serde_json::Value,
}

/// The aggregated outcome of a signing round.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SignatureReply {
    /// "SUCCESSFUL" when enough shares agreed.
    #[serde(default)]
    pub result: String,
    /// The hash every signing validator committed to.
    #[serde(default)]
    pub message_hash: String,
    /// The aggregated signature nonce.
    #[serde(default)]
    pub nonce: String,
    /// The aggregated signature, hex encoded.
    #[serde(default)]
    pub signature: String,
    /// Each signing validator's returned data, keyed by node id.
    #[serde(default)]
    pub signature_data_from_node: HashMap<String, serde_json::Value>,
}

impl SignatureReply {
    /// Whether the round reached the signing threshold.
    pub fn is_successful(&self) -> bool {
        self.result == "SUCCESSFUL"
    }

    /// One validator's returned data; every honest validator returns the
    /// same bytes, so any entry serves.
    pub fn node_data(&self) -> Option<&serde_json::Value> {
        self.signature_data_from_node.values().next()
    }

    /// The aggregated signature as a 256-bit scalar.
    pub fn signature_u256(&self) -> Result<U256, ThresholdError> {
        U256::from_str_radix(self.signature.trim_start_matches("0x"), 16)
            .map_err(|error| ThresholdError::BadResponse(format!("signature: {error}")))
    }

    /// The aggregated signature as raw bytes (64 for schnorr).
    pub fn signature_bytes(&self) -> Result<Vec<u8>, ThresholdError> {
        hex::decode(self.signature.trim_start_matches("0x"))
            .map_err(|error| ThresholdError::BadResponse(format!("signature: {error}")))
    }
}

/// The threshold-signature capability consumed by the SA rounds.
pub trait ThresholdSigner: Send + Sync {
    /// Request one-time nonces from the DKG party.
    fn request_nonces(
        &self,
        party: &[String],
    ) -> impl Future<Output = Result<serde_json::Value, ThresholdError>> + Send;

    /// Drive a signing round over the given request.
    fn request_signature(
        &self,
        key: &DkgKey,
        nonces: &serde_json::Value,
        request: &SigningRequest,
        party: &[String],
    ) -> impl Future<Output = Result<SignatureReply, ThresholdError>> + Send;
}

/// HTTP gateway implementation of [`ThresholdSigner`].
#[derive(Debug, Clone)]
pub struct HttpThresholdSigner {
    http: reqwest::Client,
    base_url: Url,
    round_timeout: Duration,
}

impl HttpThresholdSigner {
    /// Create a gateway client; `round_timeout` bounds a full signing
    /// round.
    pub fn new(base_url: Url, round_timeout: Duration) -> Result<Self, ThresholdError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|error| ThresholdError::Http(error.to_string()))?;
        Ok(Self {
            http,
            base_url,
            round_timeout,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ThresholdError> {
        self.base_url
            .join(path)
            .map_err(|error| ThresholdError::BadResponse(error.to_string()))
    }
}

impl ThresholdSigner for HttpThresholdSigner {
    async fn request_nonces(&self, party: &[String]) -> Result<serde_json::Value, ThresholdError> {
        let response = self
            .http
            .post(self.endpoint("v1/nonces")?)
            .timeout(Duration::from_secs(15))
            .json(&serde_json::json!({"party": party, "count": 1}))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn request_signature(
        &self,
        key: &DkgKey,
        nonces: &serde_json::Value,
        request: &SigningRequest,
        party: &[String],
    ) -> Result<SignatureReply, ThresholdError> {
        let body = serde_json::json!({
            "dkg": {"name": key.name, "public_key": key.public_key},
            "nonces": nonces,
            "request": request,
            "party": party,
        });

        let response = self
            .http
            .post(self.endpoint("v1/sign")?)
            .timeout(self.round_timeout)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_success_requires_the_exact_marker() {
        let reply = SignatureReply {
            result: "SUCCESSFUL".to_owned(),
            ..SignatureReply::default()
        };
        assert!(reply.is_successful());

        let reply = SignatureReply {
            result: "TIMEOUT".to_owned(),
            ..SignatureReply::default()
        };
        assert!(!reply.is_successful());
    }

    #[test]
    fn signature_parses_as_scalar_and_bytes() {
        let reply = SignatureReply {
            signature: "0x0000000000000000000000000000000000000000000000000000000000000007"
                .to_owned(),
            ..SignatureReply::default()
        };
        assert_eq!(reply.signature_u256().unwrap(), U256::from(7u64));
        assert_eq!(reply.signature_bytes().unwrap().len(), 32);
    }

    #[test]
    fn dkg_key_loads_by_name() {
        let dir = std::env::temp_dir().join("zexporta-dkg-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("dkgs.json");
        std::fs::write(
            &path,
            r#"{"ethereum": {"public_key": 123, "party": ["1", "2", "3"]}}"#,
        )
        .unwrap();

        let key = load_dkg_key(&path, "ethereum").unwrap();
        assert_eq!(key.party, vec!["1", "2", "3"]);
        assert_eq!(key.public_key, serde_json::json!(123));

        assert!(load_dkg_key(&path, "missing").is_err());
    }
}
