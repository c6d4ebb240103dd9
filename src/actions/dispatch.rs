//! Action API client
//!
//! Sends approved requests to the operations API. The request id travels
//! as the `Idempotency-Key` header so a retried dispatch is applied once.

use crate::error::OrchestrationError;
use crate::models::{ActionRequest, ActionState, ActionVerb};
use crate::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct DispatchReceipt {
    pub status: u16,
    pub message: String,
    pub body: Value,
}

#[async_trait]
pub trait ActionApi: Send + Sync {
    /// Apply an approved request. Never called for any other state.
    async fn dispatch(&self, request: &ActionRequest) -> Result<DispatchReceipt>;
}

#[derive(Clone)]
pub struct OpsApiClient {
    client: Client,
    base_url: String,
    operator: String,
}

impl OpsApiClient {
    pub fn new(base_url: &str, operator: &str) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(15))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            operator: operator.to_string(),
        })
    }

    pub fn endpoint(verb: ActionVerb) -> &'static str {
        match verb {
            ActionVerb::Pause => "/pause_item",
            ActionVerb::Unpause => "/unpause_item",
            ActionVerb::UpdateHours => "/update_hours",
        }
    }

    pub fn payload(&self, request: &ActionRequest) -> Value {
        let details = match request.verb {
            ActionVerb::UpdateHours => {
                let days = request.parameters.get("days").map(String::as_str).unwrap_or("");
                let open = request.parameters.get("open").map(String::as_str).unwrap_or("");
                let close = request.parameters.get("close").map(String::as_str).unwrap_or("");
                Some(format!("{} {}-{}", days, open, close))
            }
            _ => None,
        };

        json!({
            "type": request.verb.as_str(),
            "operator": self.operator,
            "item": request.target,
            "details": details,
            "parameters": request.parameters,
            "original_query": request.original_query,
            "request_id": request.request_id,
            "requester": request.requester,
        })
    }
}

#[async_trait]
impl ActionApi for OpsApiClient {
    async fn dispatch(&self, request: &ActionRequest) -> Result<DispatchReceipt> {
        if request.state != ActionState::Approved {
            return Err(OrchestrationError::InvalidTransition {
                from: request.state,
                to: ActionState::Dispatched,
            });
        }

        let path = Self::endpoint(request.verb);
        let url = format!("{}{}", self.base_url, path);

        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .header("Idempotency-Key", request.request_id.to_string())
            .json(&self.payload(request))
            .send()
            .await
            .map_err(|e| {
                error!(request_id = %request.request_id, error = %e, "Ops API unreachable");
                OrchestrationError::DispatchFailed(format!("ops API request failed for {}: {}", path, e))
            })?;

        let status = response.status();
        let body = response.json::<Value>().await.unwrap_or(Value::Null);

        if !status.is_success() {
            let detail = body
                .get("detail")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| body.to_string());
            error!(request_id = %request.request_id, status = %status, detail = %detail, "Ops API rejected action");
            return Err(OrchestrationError::DispatchFailed(format!(
                "ops API returned {} for {}: {}",
                status, path, detail
            )));
        }

        if body.get("ok").and_then(Value::as_bool) == Some(false) {
            let detail = body
                .get("error")
                .or_else(|| body.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("action refused")
                .to_string();
            warn!(request_id = %request.request_id, detail = %detail, "Ops API reported failure");
            return Err(OrchestrationError::DispatchFailed(format!(
                "ops API refused {}: {}",
                path, detail
            )));
        }

        let message = body
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("ok")
            .to_string();

        info!(request_id = %request.request_id, status = %status, "Action dispatched");

        Ok(DispatchReceipt {
            status: status.as_u16(),
            message,
            body,
        })
    }
}
