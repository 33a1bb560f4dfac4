//! HTTP surface: intent submission, blacklist management, intent status,
//! the rolled log and the healthcheck.
//!
//! Every `/tx`-family response is HTTP 200 with `{result, success}`;
//! `result` carries either the payload or a plain error message.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::header;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use eyre::{eyre, Result};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};

use crate::admission::{IntentAdmit, IntentRequest};
use crate::config::AppConfig;
use crate::store::{Store, StoreError};
use crate::types::BlacklistEntry;

#[derive(Clone)]
pub struct AppState {
    pub admit: Arc<IntentAdmit>,
    pub store: Arc<dyn Store>,
    pub app_name: String,
    pub log_path: PathBuf,
}

#[derive(Debug, Serialize)]
pub struct ApiResponse {
    pub result: serde_json::Value,
    pub success: bool,
}

impl ApiResponse {
    fn ok(result: impl Serialize) -> Self {
        Self {
            result: serde_json::to_value(result).unwrap_or(serde_json::Value::Null),
            success: true,
        }
    }

    fn err(message: impl Into<String>) -> Self {
        Self {
            result: serde_json::Value::String(message.into()),
            success: false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct BlacklistRequest {
    address: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(healthcheck))
        .route("/tx", post(post_tx))
        .route("/tx/{id}", get(get_tx))
        .route("/blacklist", post(post_blacklist))
        .route("/log", get(get_log))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Bind and serve the API. TLS is terminated in front of the portal; the
/// TLS_* options only gate startup.
pub async fn serve(state: AppState, app: AppConfig) -> Result<()> {
    if app.tls_enable {
        return Err(eyre!(
            "in-process TLS is not supported; terminate TLS at the ingress or unset TLS_ENABLE"
        ));
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], app.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "API server listening");

    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn healthcheck(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "name": state.app_name,
        "success": true,
    }))
}

async fn post_tx(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> Json<ApiResponse> {
    let request: IntentRequest = match serde_json::from_value(body) {
        Ok(request) => request,
        Err(e) => return Json(ApiResponse::err(format!("bind error: {}", e))),
    };

    match state.admit.admit(&request).await {
        Ok(intent) => Json(ApiResponse::ok(intent)),
        Err(e) => Json(ApiResponse::err(e.to_string())),
    }
}

async fn get_tx(State(state): State<AppState>, Path(id): Path<String>) -> Json<ApiResponse> {
    let intent = match state.store.get_intent(&id).await {
        Ok(Some(intent)) => intent,
        Ok(None) => return Json(ApiResponse::err(format!("no intent found for id {}", id))),
        Err(e) => {
            error!(id, error = %e, "Failed to look up intent");
            return Json(ApiResponse::err(e.to_string()));
        }
    };

    if !intent.completed {
        return Json(ApiResponse::err("still processing"));
    }

    Json(ApiResponse::ok(intent))
}

async fn post_blacklist(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> Json<ApiResponse> {
    let request: BlacklistRequest = match serde_json::from_value(body) {
        Ok(request) => request,
        Err(e) => return Json(ApiResponse::err(format!("bind error: {}", e))),
    };

    if !state.admit.is_valid_address(&request.address) {
        return Json(ApiResponse::err(format!(
            "not a valid address: {}",
            request.address
        )));
    }

    match state.store.find_blacklist(&request.address).await {
        Ok(Some(_)) => {
            return Json(ApiResponse::err("the address is already in blacklist"));
        }
        Ok(None) => {}
        Err(e) => {
            error!(address = %request.address, error = %e, "Blacklist lookup failed");
            return Json(ApiResponse::err(e.to_string()));
        }
    }

    let entry = BlacklistEntry::new(request.address);
    match state.store.insert_blacklist(&entry).await {
        Ok(()) => {
            info!(address = %entry.address, "Address blacklisted");
            Json(ApiResponse::ok(entry))
        }
        Err(StoreError::Conflict) => Json(ApiResponse::err("the address is already in blacklist")),
        Err(e) => {
            error!(address = %entry.address, error = %e, "Blacklist insert failed");
            Json(ApiResponse::err(e.to_string()))
        }
    }
}

/// The rolled log file rendered as HTML.
async fn get_log(State(state): State<AppState>) -> Html<String> {
    match tokio::fs::read_to_string(&state.log_path).await {
        Ok(content) => Html(content.replace('\n', "<br>")),
        Err(e) => Html(format!("cannot read log file: {}", e)),
    }
}

async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to encode metrics",
        )
            .into_response();
    }

    match Response::builder()
        .header(header::CONTENT_TYPE, encoder.format_type())
        .body(axum::body::Body::from(buffer))
    {
        Ok(response) => response,
        Err(_) => (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to build metrics response",
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;
    use crate::types::{Intent, Network};
    use bigdecimal::BigDecimal;
    use std::str::FromStr;
    use tokio::sync::mpsc;

    fn state() -> (AppState, Arc<MemStore>) {
        let store = Arc::new(MemStore::new());
        let (tx, _rx) = mpsc::channel(8);
        let admit = Arc::new(IntentAdmit::new(store.clone(), tx, "darc").unwrap());
        (
            AppState {
                admit,
                store: store.clone(),
                app_name: "swap-portal".to_string(),
                log_path: PathBuf::from("does-not-exist.log"),
            },
            store,
        )
    }

    #[tokio::test]
    async fn test_post_tx_accepts_valid_request() {
        let (state, _store) = state();
        let body = json!({
            "from_address": "0x1111111111111111111111111111111111111111",
            "from_network": "evm",
            "to_address": "darc1qqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqq",
            "to_network": "cos",
            "amount": 1.5,
        });

        let Json(response) = post_tx(State(state), Json(body)).await;
        assert!(response.success, "result = {:?}", response.result);
        assert_eq!(response.result["amount"], json!("1.5"));
    }

    #[tokio::test]
    async fn test_post_tx_rejects_excess_precision_with_http_200_shape() {
        let (state, _store) = state();
        let body = json!({
            "from_address": "0x1111111111111111111111111111111111111111",
            "from_network": "evm",
            "to_address": "darc1qqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqq",
            "to_network": "cos",
            "amount": 0.123456,
        });

        let Json(response) = post_tx(State(state), Json(body)).await;
        assert!(!response.success);
        assert!(response
            .result
            .as_str()
            .unwrap()
            .contains("less than 5 decimals"));
    }

    #[tokio::test]
    async fn test_post_tx_missing_field_is_bind_error() {
        let (state, _store) = state();
        let Json(response) = post_tx(State(state), Json(json!({"amount": 1.0}))).await;
        assert!(!response.success);
        assert!(response.result.as_str().unwrap().starts_with("bind error"));
    }

    #[tokio::test]
    async fn test_get_tx_reports_processing_until_completed() {
        let (state, store) = state();
        let mut intent = Intent::new(
            "0x1111111111111111111111111111111111111111".into(),
            "darc1qqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqq".into(),
            Network::Evm,
            Network::Cos,
            BigDecimal::from_str("1.5").unwrap(),
        );
        store.insert_intent(&intent).await.unwrap();

        let Json(response) = get_tx(State(state.clone()), Path(intent.id.clone())).await;
        assert!(!response.success);
        assert_eq!(response.result, json!("still processing"));

        intent.mark_completed();
        store.update_intent(&intent).await.unwrap();

        let Json(response) = get_tx(State(state), Path(intent.id.clone())).await;
        assert!(response.success);
    }

    #[tokio::test]
    async fn test_get_tx_unknown_id() {
        let (state, _store) = state();
        let Json(response) = get_tx(State(state), Path("missing".to_string())).await;
        assert!(!response.success);
    }

    #[tokio::test]
    async fn test_blacklist_validates_and_rejects_duplicates() {
        let (state, _store) = state();

        let Json(response) =
            post_blacklist(State(state.clone()), Json(json!({"address": "nonsense"}))).await;
        assert!(!response.success);

        let evm_addr = json!({"address": "0x2222222222222222222222222222222222222222"});
        let Json(response) = post_blacklist(State(state.clone()), Json(evm_addr.clone())).await;
        assert!(response.success);

        let Json(response) = post_blacklist(State(state.clone()), Json(evm_addr)).await;
        assert!(!response.success);
        assert_eq!(response.result, json!("the address is already in blacklist"));

        // COS-form addresses are accepted too
        let cos_addr = json!({"address": "darc1qqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqq"});
        let Json(response) = post_blacklist(State(state), Json(cos_addr)).await;
        assert!(response.success);
    }
}
