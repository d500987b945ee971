//! Client side of the sync wire protocol.
//!
//! `POST <endpoint>` carries one response as JSON; `POST <endpoint>/batch`
//! carries an array and gets a per-item result list back. The server upserts by
//! `response_id`, so resending after a lost acknowledgement is harmless.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};
use crate::model::Response;
use crate::server::RESPONSES_PATH;

/// Outcome for one response inside a batch request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemResult {
    pub response_id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ItemResult {
    pub fn ok(response_id: impl Into<String>) -> Self {
        Self {
            response_id: response_id.into(),
            ok: true,
            error: None,
        }
    }

    pub fn failed(response_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            response_id: response_id.into(),
            ok: false,
            error: Some(error.into()),
        }
    }
}

/// Body of a successful batch reply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchReply {
    pub results: Vec<ItemResult>,
}

/// The remote upsert API as the processor sees it.
#[async_trait]
pub trait RemoteEndpoint: Send + Sync {
    /// Upsert one response. Any error is a failed attempt.
    async fn upsert(&self, response: &Response) -> Result<()>;

    /// Upsert each response independently. An `Err` means the whole request
    /// failed; otherwise there is one result per input, in input order.
    async fn upsert_batch(&self, responses: &[Response]) -> Result<Vec<ItemResult>>;
}

/// `RemoteEndpoint` over HTTP with a per-request timeout.
#[derive(Clone)]
pub struct HttpEndpoint {
    endpoint: Url,
    batch_url: Url,
    health_url: Url,
    client: reqwest::Client,
}

impl HttpEndpoint {
    pub fn new(endpoint: Url, timeout: Duration) -> Result<Self> {
        let mut batch_url = endpoint.clone();
        batch_url
            .path_segments_mut()
            .map_err(|_| Error::Config(format!("endpoint {endpoint} cannot carry a path")))?
            .pop_if_empty()
            .push("batch");
        let health_url = health_url_for(&endpoint)?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;
        Ok(Self {
            endpoint,
            batch_url,
            health_url,
            client,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Whether the server answers its health check. Used as the reachability signal.
    pub async fn probe(&self) -> bool {
        match self.client.get(self.health_url.clone()).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                log::debug!("Health probe to {} failed: {e}", self.health_url);
                false
            }
        }
    }
}

#[async_trait]
impl RemoteEndpoint for HttpEndpoint {
    async fn upsert(&self, response: &Response) -> Result<()> {
        let resp = self
            .client
            .post(self.endpoint.clone())
            .header("Accept", "application/json")
            .json(response)
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(rejection(status, &body));
        }
        log::debug!(
            "Upserted response {} ({}): {}",
            response.response_id,
            status.as_u16(),
            body.trim()
        );
        Ok(())
    }

    async fn upsert_batch(&self, responses: &[Response]) -> Result<Vec<ItemResult>> {
        let resp = self
            .client
            .post(self.batch_url.clone())
            .header("Accept", "application/json")
            .json(responses)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(rejection(status, &body));
        }
        let reply: BatchReply = resp.json().await?;
        Ok(align_results(responses, reply.results))
    }
}

/// One result per input, in input order. Items the server did not mention
/// count as failed so they stay queued.
fn align_results(responses: &[Response], mut reported: Vec<ItemResult>) -> Vec<ItemResult> {
    responses
        .iter()
        .map(|r| {
            match reported
                .iter()
                .position(|item| item.response_id == r.response_id)
            {
                Some(idx) => reported.swap_remove(idx),
                None => ItemResult::failed(&r.response_id, "no result reported by server"),
            }
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
    message: Option<String>,
}

fn rejection(status: StatusCode, body: &str) -> Error {
    let message = serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|b| b.message.or(b.error))
        .unwrap_or_else(|| body.trim().to_string());
    let message = if message.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        message
    };
    Error::RemoteRejection {
        status: status.as_u16(),
        message,
    }
}

/// `/healthz` sits next to the `/api/v1/responses` mount, so a server behind a
/// path prefix is probed under that prefix. Any other endpoint path is probed
/// at the host root.
fn health_url_for(endpoint: &Url) -> Result<Url> {
    let path = endpoint.path().trim_end_matches('/');
    let prefix = path.strip_suffix(RESPONSES_PATH).unwrap_or_default();
    endpoint
        .join(&format!("{prefix}/healthz"))
        .map_err(|e| Error::Config(format!("cannot derive health URL: {e}")))
}
