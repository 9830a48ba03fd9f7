//! Sequencer capability.
//!
//! The Bitcoin withdraw pipeline commits its proposed transaction shape
//! to an external ordering service before signing, so every validator
//! reproduces the exact same UTXO set from the sequencer's finalized log
//! instead of from its own (possibly divergent) view of the pool.

use std::future::Future;
use std::time::Duration;

use url::Url;

use crate::error::Error;

/// The ordering-service capability.
pub trait Sequencer: Send + Sync {
    /// Append an entry to the app's log, returning its assigned index.
    fn post_entry(
        &self,
        entry: &serde_json::Value,
    ) -> impl Future<Output = Result<u64, Error>> + Send;

    /// Read the finalized entry at the given index, if it exists yet.
    fn get_finalized(
        &self,
        index: u64,
    ) -> impl Future<Output = Result<Option<serde_json::Value>, Error>> + Send;
}

/// HTTP implementation against a sequencer node.
#[derive(Debug, Clone)]
pub struct HttpSequencer {
    http: reqwest::Client,
    base_url: Url,
    app_name: String,
}

impl HttpSequencer {
    /// Create a client for the given node and application namespace.
    pub fn new(base_url: Url, app_name: String) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|error| Error::Sequencer(error.to_string()))?;
        Ok(Self {
            http,
            base_url,
            app_name,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, Error> {
        self.base_url
            .join(path)
            .map_err(|error| Error::Sequencer(error.to_string()))
    }
}

impl Sequencer for HttpSequencer {
    async fn post_entry(&self, entry: &serde_json::Value) -> Result<u64, Error> {
        let response = self
            .http
            .post(self.endpoint(&format!("node/{}/batches", self.app_name))?)
            .json(&vec![entry])
            .send()
            .await
            .map_err(|error| Error::Sequencer(error.to_string()))?
            .error_for_status()
            .map_err(|error| Error::Sequencer(error.to_string()))?;

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|error| Error::Sequencer(error.to_string()))?;
        body.get("index")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| Error::Sequencer("post: no index in response".into()))
    }

    async fn get_finalized(&self, index: u64) -> Result<Option<serde_json::Value>, Error> {
        let response = self
            .http
            .get(self.endpoint(&format!(
                "node/{}/batches/finalized/{index}",
                self.app_name
            ))?)
            .send()
            .await
            .map_err(|error| Error::Sequencer(error.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let body = response
            .error_for_status()
            .map_err(|error| Error::Sequencer(error.to_string()))?
            .json()
            .await
            .map_err(|error| Error::Sequencer(error.to_string()))?;
        Ok(Some(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn post_returns_the_assigned_index() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/node/zexporta/batches")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"index": 17}"#)
            .create_async()
            .await;

        let sequencer = HttpSequencer::new(
            Url::parse(&format!("{}/", server.url())).unwrap(),
            "zexporta".to_owned(),
        )
        .unwrap();

        let index = sequencer
            .post_entry(&serde_json::json!({"nonce": 42}))
            .await
            .unwrap();
        assert_eq!(index, 17);
    }

    #[tokio::test]
    async fn missing_finalized_entries_read_as_none() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/node/zexporta/batches/finalized/9")
            .with_status(404)
            .create_async()
            .await;

        let sequencer = HttpSequencer::new(
            Url::parse(&format!("{}/", server.url())).unwrap(),
            "zexporta".to_owned(),
        )
        .unwrap();

        assert!(sequencer.get_finalized(9).await.unwrap().is_none());
    }
}
