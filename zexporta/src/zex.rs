//! Zex HTTP API client.

use std::str::FromStr as _;
use std::time::Duration;

use alloy_primitives::U256;
use serde::Deserialize;
use url::Url;

use clients::{BlockNumber, UserId};

/// Satoshis per bitcoin, for converting Zex's BTC-denominated amounts.
const SATS_PER_BTC: f64 = 100_000_000.0;

/// Errors talking to Zex.
#[derive(Debug, thiserror::Error)]
pub enum ZexError {
    /// Transport-level failure or non-2xx status.
    #[error("request failed: {0}")]
    Http(String),
    /// The response body was not what we expect.
    #[error("bad response: {0}")]
    BadResponse(String),
}

impl From<reqwest::Error> for ZexError {
    fn from(error: reqwest::Error) -> Self {
        ZexError::Http(error.to_string())
    }
}

/// A withdraw request as Zex serves it.
#[derive(Debug, Clone, Deserialize)]
pub struct ZexWithdraw {
    /// Requested amount; integer token units for EVM, BTC for Bitcoin.
    pub amount: serde_json::Value,
    /// Chain-scoped withdraw nonce.
    pub nonce: u64,
    /// Destination address.
    pub destination: String,
    /// Token contract to pay out from.
    #[serde(rename = "tokenContract", default)]
    pub token_contract: Option<String>,
}

impl ZexWithdraw {
    /// The amount as EVM token units.
    pub fn evm_amount(&self) -> Result<U256, ZexError> {
        match &self.amount {
            serde_json::Value::Number(number) => number
                .as_u64()
                .map(U256::from)
                .ok_or_else(|| ZexError::BadResponse(format!("amount {number} is not integral"))),
            serde_json::Value::String(raw) => U256::from_str(raw)
                .map_err(|error| ZexError::BadResponse(format!("amount {raw}: {error}"))),
            other => Err(ZexError::BadResponse(format!("amount {other} unsupported"))),
        }
    }

    /// The amount converted from BTC to satoshis.
    pub fn btc_amount_sats(&self) -> Result<u64, ZexError> {
        let btc = self
            .amount
            .as_f64()
            .ok_or_else(|| ZexError::BadResponse(format!("amount {} is not numeric", self.amount)))?;
        Ok((btc * SATS_PER_BTC).round() as u64)
    }
}

/// A user's asset balance snapshot on Zex.
#[derive(Debug, Clone, Deserialize)]
pub struct ZexUserAsset {
    /// Asset symbol.
    pub asset: String,
    /// Freely withdrawable balance.
    pub free: String,
    /// Balance locked in orders.
    pub locked: String,
    /// Frozen balance.
    pub freeze: String,
    /// Balance in in-flight withdraws.
    pub withdrawing: String,
}

/// The Zex API client.
#[derive(Debug, Clone)]
pub struct ZexClient {
    http: reqwest::Client,
    base_url: Url,
}

impl ZexClient {
    /// Create a client for the given base URL.
    pub fn new(base_url: Url) -> Result<Self, ZexError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|error| ZexError::Http(error.to_string()))?;
        Ok(Self { http, base_url })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ZexError> {
        self.base_url
            .join(path)
            .map_err(|error| ZexError::BadResponse(error.to_string()))
    }

    /// The highest user id Zex has assigned, if any.
    pub async fn last_user_id(&self) -> Result<Option<UserId>, ZexError> {
        let response = self
            .http
            .get(self.endpoint("users/latest-id")?)
            .send()
            .await?
            .error_for_status()?;
        let body: serde_json::Value = response.json().await?;
        Ok(body.get("id").and_then(serde_json::Value::as_u64))
    }

    /// Submit a signed deposit batch. The payload is the latin-1 decoding
    /// of `encoded_data ‖ nonce ‖ signature ‖ shield_sig`.
    pub async fn send_deposit(&self, payload: String) -> Result<(), ZexError> {
        self.http
            .post(self.endpoint("deposit")?)
            .json(&vec![payload])
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Zex's view of the latest processed block for a chain.
    pub async fn latest_block(&self, chain: &str) -> Result<Option<BlockNumber>, ZexError> {
        let response = self
            .http
            .get(self.endpoint("block/latest")?)
            .query(&[("chain", chain)])
            .send()
            .await?
            .error_for_status()?;
        let body: serde_json::Value = response.json().await?;
        Ok(body.get("block").and_then(serde_json::Value::as_u64))
    }

    /// The last withdraw nonce Zex knows for a chain; `-1` when there has
    /// never been one (served as a 404).
    pub async fn last_withdraw_nonce(&self, chain: &str) -> Result<i64, ZexError> {
        let response = self
            .http
            .get(self.endpoint("withdraw/nonce/last")?)
            .query(&[("chain", chain)])
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(-1);
        }

        let body: serde_json::Value = response.error_for_status()?.json().await?;
        body.get("nonce")
            .and_then(serde_json::Value::as_i64)
            .ok_or_else(|| ZexError::BadResponse("nonce missing".into()))
    }

    /// Withdraw requests for a chain starting at the given nonce offset.
    pub async fn withdraws(
        &self,
        chain: &str,
        offset: i64,
        limit: Option<u64>,
    ) -> Result<Vec<ZexWithdraw>, ZexError> {
        let mut request = self
            .http
            .get(self.endpoint("withdraws")?)
            .query(&[("chain", chain)])
            .query(&[("offset", offset)]);
        if let Some(limit) = limit {
            request = request.query(&[("limit", limit)]);
        }

        let response = request.send().await?.error_for_status()?;
        Ok(response.json().await?)
    }

    /// A user's next withdraw nonce on a chain.
    pub async fn user_withdraw_nonce(&self, chain: &str, user_id: UserId) -> Result<u64, ZexError> {
        let response = self
            .http
            .get(self.endpoint("user/withdraws/nonce")?)
            .query(&[("id", user_id.to_string()), ("chain", chain.to_owned())])
            .send()
            .await?
            .error_for_status()?;
        let body: serde_json::Value = response.json().await?;
        body.get("nonce")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| ZexError::BadResponse("nonce missing".into()))
    }

    /// A user's asset balances.
    pub async fn user_assets(&self, user_id: UserId) -> Result<Vec<ZexUserAsset>, ZexError> {
        let response = self
            .http
            .get(self.endpoint("asset/getUserAsset")?)
            .query(&[("id", user_id)])
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    /// Submit signed withdraw payloads.
    pub async fn send_withdraws(&self, payloads: Vec<String>) -> Result<(), ZexError> {
        self.http
            .post(self.endpoint("withdraw")?)
            .json(&payloads)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(server: &mockito::Server) -> ZexClient {
        ZexClient::new(Url::parse(&format!("{}/", server.url())).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn missing_withdraw_nonce_maps_to_minus_one() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/withdraw/nonce/last?chain=SEP")
            .with_status(404)
            .create_async()
            .await;

        assert_eq!(client(&server).last_withdraw_nonce("SEP").await.unwrap(), -1);
    }

    #[tokio::test]
    async fn withdraws_parse_the_zex_shape() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/withdraws?chain=SEP&offset=3")
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

        let withdraws = client(&server).withdraws("SEP", 3, None).await.unwrap();
        assert_eq!(withdraws.len(), 1);
        assert_eq!(withdraws[0].nonce, 3);
        assert_eq!(withdraws[0].evm_amount().unwrap(), U256::from(1_000_000u64));
    }

    #[test]
    fn btc_amounts_convert_to_satoshis() {
        let withdraw = ZexWithdraw {
            amount: serde_json::json!(0.06),
            nonce: 42,
            destination: "bcrt1qexample".to_owned(),
            token_contract: None,
        };
        assert_eq!(withdraw.btc_amount_sats().unwrap(), 6_000_000);
    }
}
