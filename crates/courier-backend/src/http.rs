//! Hubfeed backend client over HTTPS.
//!
//! Every request carries the agent token as a bearer credential plus the
//! version and capability headers the backend uses for routing. Transport
//! failures map to `NetworkError` so the loop logs and retries them; only
//! an explicit 401/403 on verify counts as a rejected token.

use async_trait::async_trait;
use courier_core::config::BackendConfig;
use courier_core::error::CourierError;
use courier_core::model::{AvatarSync, ExecutionReport, Job, TokenVerification};
use courier_core::traits::BackendClient;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

/// Agent version reported to the backend.
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Platforms this build can drive.
pub const SUPPORTED_PLATFORMS: &[&str] = &["telegram"];

/// Commands this build understands.
pub const SUPPORTED_COMMANDS: &[&str] = &["telegram.get_messages", "telegram.list_dialogs"];

const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

pub struct HttpBackend {
    base_url: String,
    token: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpBackend {
    pub fn new(config: &BackendConfig, token: String) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token,
            client: reqwest::Client::new(),
            timeout: Duration::from_secs(config.request_timeout_secs),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{path}", self.base_url))
            .bearer_auth(&self.token)
            .header("User-Agent", format!("HubfeedAgent/{AGENT_VERSION}"))
            .header("X-Agent-Version", AGENT_VERSION)
            .header("X-Agent-Capabilities", SUPPORTED_PLATFORMS.join(","))
            .timeout(self.timeout)
    }
}

/// Capability block sent with every verification.
fn capabilities_payload() -> Value {
    json!({
        "capabilities": {
            "version": AGENT_VERSION,
            "platforms": SUPPORTED_PLATFORMS,
            "commands": SUPPORTED_COMMANDS,
        }
    })
}

#[async_trait]
impl BackendClient for HttpBackend {
    async fn verify_token(&self) -> Result<TokenVerification, CourierError> {
        let resp = self
            .request(reqwest::Method::POST, "/api/agent/verify")
            .json(&capabilities_payload())
            .send()
            .await
            .map_err(|e| CourierError::Network(format!("verify request failed: {e}")))?;

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
        {
            debug!("backend rejected agent token ({status})");
            return Ok(TokenVerification {
                accepted: false,
                platform_config: None,
            });
        }
        if !status.is_success() {
            return Err(CourierError::Network(format!("verify returned {status}")));
        }

        let body: VerifyResponse = resp
            .json()
            .await
            .map_err(|e| CourierError::Network(format!("verify parse failed: {e}")))?;
        Ok(TokenVerification {
            accepted: true,
            platform_config: body.config,
        })
    }

    async fn fetch_jobs(&self) -> Result<Vec<Job>, CourierError> {
        let resp = self
            .request(reqwest::Method::GET, "/api/agent/tasks")
            .send()
            .await
            .map_err(|e| CourierError::Network(format!("task fetch failed: {e}")))?;

        if let Some(required) = resp.headers().get("X-Upgrade-Required") {
            warn!(
                "backend requests an agent upgrade: {}",
                required.to_str().unwrap_or("unknown version")
            );
        }

        let status = resp.status();
        if !status.is_success() {
            return Err(CourierError::Network(format!("task fetch returned {status}")));
        }

        let body: TasksResponse = resp
            .json()
            .await
            .map_err(|e| CourierError::Network(format!("task parse failed: {e}")))?;
        Ok(body.tasks)
    }

    async fn submit_result(&self, report: &ExecutionReport) -> Result<(), CourierError> {
        let resp = self
            .request(reqwest::Method::POST, "/api/agent/results")
            .json(report)
            .send()
            .await
            .map_err(|e| CourierError::Network(format!("result submit failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(CourierError::Network(format!(
                "result submit returned {status}"
            )));
        }
        debug!("submitted result for job {}", report.job_id);
        Ok(())
    }

    async fn sync_avatars(&self, avatars: &[AvatarSync]) -> Result<(), CourierError> {
        let resp = self
            .request(reqwest::Method::POST, "/api/agent/avatars/sync")
            .json(&json!({ "avatars": avatars }))
            .send()
            .await
            .map_err(|e| CourierError::Network(format!("avatar sync failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(CourierError::Network(format!(
                "avatar sync returned {status}"
            )));
        }
        debug!("synced {} avatar(s)", avatars.len());
        Ok(())
    }

    async fn health_check(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self.client.get(&url).timeout(HEALTH_TIMEOUT).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}

// ---------- backend wire types ----------

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    /// Platform configuration pushed by the backend.
    config: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct TasksResponse {
    #[serde(default)]
    tasks: Vec<Job>,
}
