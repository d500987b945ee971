//! Reference implementation of the receiving side of the sync protocol.
//!
//! Every route upserts by `response_id`, so a client resending after a lost
//! acknowledgement leaves one record holding the latest payload.

pub mod error;
pub mod store;

use std::future::Future;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpListener;

use crate::error::{Error, Result};
use crate::model::Response;
use crate::sync::remote::{BatchReply, ItemResult};

pub use error::ApiError;
pub use store::{ReceivedResponse, ServerStore};

/// Path the reference server accepts responses on.
pub const RESPONSES_PATH: &str = "/api/v1/responses";

#[derive(Clone)]
pub struct AppState {
    store: ServerStore,
}

pub fn app_router(store: ServerStore) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route(RESPONSES_PATH, post(upsert_response))
        .route(&format!("{RESPONSES_PATH}/batch"), post(upsert_batch))
        .route(&format!("{RESPONSES_PATH}/{{response_id}}"), get(get_response))
        .with_state(AppState { store })
}

/// Serve on an already bound listener until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, store: ServerStore, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        log::info!("Accepting responses at http://{addr}{RESPONSES_PATH}");
    }
    axum::serve(listener, app_router(store))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| Error::Network(format!("server stopped: {e}")))
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: i64,
}

async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().timestamp(),
    })
}

#[derive(Debug, Serialize)]
struct UpsertReply {
    response_id: String,
    revision: u32,
}

async fn upsert_response(
    State(state): State<AppState>,
    body: std::result::Result<Json<Response>, JsonRejection>,
) -> std::result::Result<(StatusCode, Json<UpsertReply>), ApiError> {
    let Json(response) = body?;
    validate(&response).map_err(ApiError::unprocessable)?;

    let response_id = response.response_id.clone();
    let revision = state.store.upsert(response).await?;
    log::info!("Stored response {response_id} (revision {revision})");

    let status = if revision == 1 {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(UpsertReply {
            response_id,
            revision,
        }),
    ))
}

/// Items are parsed and stored one by one so a bad item only fails itself.
async fn upsert_batch(
    State(state): State<AppState>,
    body: std::result::Result<Json<Vec<Value>>, JsonRejection>,
) -> std::result::Result<Json<BatchReply>, ApiError> {
    let Json(items) = body?;
    let mut results = Vec::with_capacity(items.len());

    for item in items {
        let claimed_id = item
            .get("response_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let response: Response = match serde_json::from_value(item) {
            Ok(response) => response,
            Err(e) => {
                results.push(ItemResult::failed(claimed_id, e.to_string()));
                continue;
            }
        };
        if let Err(message) = validate(&response) {
            results.push(ItemResult::failed(claimed_id, message));
            continue;
        }
        match state.store.upsert(response).await {
            Ok(_) => results.push(ItemResult::ok(claimed_id)),
            Err(e) => {
                log::error!("Failed to store batch item {claimed_id}: {e}");
                results.push(ItemResult::failed(claimed_id, "storage error"));
            }
        }
    }

    let accepted = results.iter().filter(|r| r.ok).count();
    log::info!("Stored {accepted}/{} batch items", results.len());
    Ok(Json(BatchReply { results }))
}

async fn get_response(
    State(state): State<AppState>,
    Path(response_id): Path<String>,
) -> std::result::Result<Json<ReceivedResponse>, ApiError> {
    state
        .store
        .get(&response_id)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound(response_id))
}

fn validate(response: &Response) -> std::result::Result<(), String> {
    if response.response_id.trim().is_empty() {
        return Err("response_id is required".into());
    }
    if response.survey_id.trim().is_empty() {
        return Err("survey_id is required".into());
    }
    if response.session_id.trim().is_empty() {
        return Err("session_id is required".into());
    }
    Ok(())
}
