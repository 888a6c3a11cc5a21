use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::{Client, RequestBuilder, Response, header};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::ControlPlaneConfig;
use crate::error::{AppError, AppResult};
use crate::models::{
    Command, CronSyncRequest, LeaseRenewal, MachineRequest, PollResponse, ResultReport,
    TelemetryEnvelope,
};
use crate::services::sse::decode_events;

/// SSE event type carrying one command per event
const COMMAND_EVENT: &str = "command";
const MAX_ERROR_BODY: usize = 512;

/// Every call the bridge makes to the control plane
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn poll_commands(&self, machine_id: &str) -> AppResult<Vec<Command>>;

    /// Claim the lease. 409/410 mean another bridge holds it.
    async fn ack(&self, machine_id: &str, command_id: &str) -> AppResult<()>;

    /// Extend the lease on a running command.
    async fn heartbeat(&self, machine_id: &str, command_id: &str) -> AppResult<LeaseRenewal>;

    async fn report_result(&self, command_id: &str, report: &ResultReport) -> AppResult<()>;

    async fn push_cron_diff(&self, request: &CronSyncRequest) -> AppResult<()>;

    async fn send_telemetry(&self, envelope: &TelemetryEnvelope) -> AppResult<()>;
}

/// HTTP implementation of [`ControlPlane`]
#[derive(Debug, Clone)]
pub struct HttpControlPlane {
    client: Client,
    config: ControlPlaneConfig,
}

impl HttpControlPlane {
    pub fn new(config: ControlPlaneConfig, request_timeout: Duration) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .connect_timeout(request_timeout)
            .user_agent(format!("openclaw-bridge/{}", crate::BRIDGE_VERSION))
            .build()?;

        Ok(Self { client, config })
    }

    fn post<B: Serialize + ?Sized>(&self, url: &str, body: &B) -> RequestBuilder {
        let request = self.client.post(url).json(body);
        match &self.config.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, url: &str, request: RequestBuilder) -> AppResult<Response> {
        let response = request.send().await.map_err(|e| transport_error(url, e))?;
        let status = response.status();
        debug!(url, status = status.as_u16(), "control plane response");

        if status.is_success() {
            return Ok(response);
        }

        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        Err(AppError::control_plane(status.as_u16(), body))
    }

    async fn post_discard<B: Serialize + ?Sized>(&self, url: &str, body: &B) -> AppResult<()> {
        self.send(url, self.post(url, body)).await?;
        Ok(())
    }

    async fn read_commands(&self, url: &str, response: Response) -> AppResult<Vec<Command>> {
        let is_stream = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("text/event-stream"));

        if !is_stream {
            let parsed: PollResponse = parse_lenient(url, response).await?;
            return Ok(parsed.commands);
        }

        // An event stream may be held open past the request timeout; whatever
        // arrived before it was cut off is still a valid batch.
        let events = decode_events(response.bytes_stream().map_err(|e| transport_error(url, e)));
        futures::pin_mut!(events);
        let mut commands = Vec::new();
        loop {
            let event = match events.try_next().await {
                Ok(Some(event)) => event,
                Ok(None) => break,
                Err(AppError::Timeout(_)) => {
                    debug!(url, received = commands.len(), "command stream held open until timeout");
                    break;
                }
                Err(e) => {
                    warn!(url, received = commands.len(), error = %e, "command stream interrupted");
                    break;
                }
            };
            if event.event_type() != COMMAND_EVENT {
                continue;
            }
            match serde_json::from_str::<Command>(&event.data) {
                Ok(command) => commands.push(command),
                Err(e) => warn!(url, error = %e, "skipping malformed command event"),
            }
        }
        Ok(commands)
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn poll_commands(&self, machine_id: &str) -> AppResult<Vec<Command>> {
        let url = self.config.get_api_url(&self.config.poll_path);
        let body = MachineRequest {
            machine_id: machine_id.to_string(),
        };
        let request = self
            .post(&url, &body)
            .header(header::ACCEPT, "application/json, text/event-stream");
        let response = self.send(&url, request).await?;
        self.read_commands(&url, response).await
    }

    async fn ack(&self, machine_id: &str, command_id: &str) -> AppResult<()> {
        let url = self
            .config
            .command_url(&self.config.ack_path_template, command_id);
        let body = MachineRequest {
            machine_id: machine_id.to_string(),
        };
        self.post_discard(&url, &body).await
    }

    async fn heartbeat(&self, machine_id: &str, command_id: &str) -> AppResult<LeaseRenewal> {
        let url = self
            .config
            .command_url(&self.config.heartbeat_path_template, command_id);
        let body = MachineRequest {
            machine_id: machine_id.to_string(),
        };
        let response = self.send(&url, self.post(&url, &body)).await?;
        parse_lenient(&url, response).await
    }

    async fn report_result(&self, command_id: &str, report: &ResultReport) -> AppResult<()> {
        let url = self
            .config
            .command_url(&self.config.result_path_template, command_id);
        self.post_discard(&url, report).await
    }

    async fn push_cron_diff(&self, request: &CronSyncRequest) -> AppResult<()> {
        let url = self.config.get_api_url(&self.config.cron_sync_path);
        self.post_discard(&url, request).await
    }

    async fn send_telemetry(&self, envelope: &TelemetryEnvelope) -> AppResult<()> {
        let url = self.config.get_api_url(&self.config.telemetry_path);
        self.post_discard(&url, envelope).await
    }
}

fn transport_error(url: &str, error: reqwest::Error) -> AppError {
    if error.is_timeout() {
        AppError::timeout(format!("request to {} timed out", url))
    } else {
        AppError::Http(error)
    }
}

/// An empty body decodes as the type's default.
async fn parse_lenient<T: DeserializeOwned + Default>(url: &str, response: Response) -> AppResult<T> {
    let bytes = response.bytes().await.map_err(|e| transport_error(url, e))?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    Ok(serde_json::from_slice(&bytes)?)
}
