//! Exposed HTTP surface: the health endpoint and a read-only deposit
//! inspection route.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;

use crate::storage::model::{ChainKind, Deposit, DepositStatus};
use crate::storage::DbRead;
use crate::zex::ZexClient;

/// Shared state of the deposit API.
#[derive(Debug)]
pub struct ApiContext<S> {
    /// Shared storage.
    pub store: S,
    /// Zex client, probed by the health check.
    pub zex: ZexClient,
    /// Configured chains by symbol.
    pub chains: HashMap<String, ChainKind>,
}

/// Build the API router.
pub fn router<S>(context: Arc<ApiContext<S>>) -> Router
where
    S: DbRead + Send + Sync + 'static,
{
    Router::new()
        .route("/_health", get(health::<S>))
        .route("/v1/deposits/finalized/{chain}", get(finalized_deposits::<S>))
        .with_state(context)
}

async fn health<S>(
    State(context): State<Arc<ApiContext<S>>>,
) -> (StatusCode, Json<serde_json::Value>)
where
    S: DbRead + Send + Sync + 'static,
{
    let storage_ok = context.store.ping().await.is_ok();
    let zex_ok = context.zex.last_user_id().await.is_ok();

    if storage_ok && zex_ok {
        (StatusCode::OK, Json(serde_json::json!({"status": "ok"})))
    } else {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({
                "status": "error",
                "storage": storage_ok,
                "zex": zex_ok,
            })),
        )
    }
}

#[derive(Debug, Deserialize)]
struct DepositsQuery {
    #[serde(default)]
    from_block: Option<u64>,
    #[serde(default)]
    status: Option<DepositStatus>,
}

async fn finalized_deposits<S>(
    State(context): State<Arc<ApiContext<S>>>,
    Path(chain): Path<String>,
    Query(query): Query<DepositsQuery>,
) -> Result<Json<Vec<Deposit>>, (StatusCode, String)>
where
    S: DbRead + Send + Sync + 'static,
{
    let kind = *context
        .chains
        .get(&chain)
        .ok_or((StatusCode::NOT_FOUND, format!("unknown chain {chain}")))?;

    let status = query.status.unwrap_or(DepositStatus::Finalized);
    context
        .store
        .deposits_by_status(kind, &chain, status, query.from_block, None)
        .await
        .map(Json)
        .map_err(|error| (StatusCode::INTERNAL_SERVER_ERROR, error.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::Store;
    use crate::storage::model::DepositStatus;
    use crate::storage::DbWrite;
    use crate::testing::deposit;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt as _;
    use url::Url;

    async fn context(server: &mockito::Server) -> Arc<ApiContext<crate::storage::memory::SharedStore>> {
        let store = Store::new_shared();
        store
            .insert_deposits_if_missing(
                ChainKind::Evm,
                &[
                    deposit("SEP", "0xd1", "0xAAA", 100, 7, DepositStatus::Finalized),
                    deposit("SEP", "0xd2", "0xAAA", 101, 7, DepositStatus::Pending),
                ],
            )
            .await
            .unwrap();

        Arc::new(ApiContext {
            store,
            zex: ZexClient::new(Url::parse(&format!("{}/", server.url())).unwrap()).unwrap(),
            chains: HashMap::from([("SEP".to_owned(), ChainKind::Evm)]),
        })
    }

    #[tokio::test]
    async fn health_reflects_dependency_state() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/users/latest-id")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id": 1}"#)
            .create_async()
            .await;

        let app = router(context(&server).await);
        let response = app
            .oneshot(Request::get("/_health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn finalized_deposits_filter_by_status_and_block() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/users/latest-id")
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let app = router(context(&server).await);
        let response = app
            .oneshot(
                Request::get("/v1/deposits/finalized/SEP?from_block=0")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let rows: Vec<Deposit> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].transfer.tx_hash, "0xd1");
    }

    #[tokio::test]
    async fn unknown_chains_are_404() {
        let server = mockito::Server::new_async().await;
        let app = router(context(&server).await);
        let response = app
            .oneshot(
                Request::get("/v1/deposits/finalized/NOPE")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
