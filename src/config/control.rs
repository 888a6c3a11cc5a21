use chrono::{DateTime, TimeZone, Utc};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::{Deserialize, Serialize};

/// Characters escaped when a command id is substituted into a path template.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

const COMMAND_ID_PLACEHOLDER: &str = "{commandId}";

/// Control plane connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPlaneConfig {
    /// Control plane base URL
    pub base_url: String,
    /// Bearer token, sent on every request when present
    pub token: Option<String>,
    /// Token expiry, RFC 3339 or epoch milliseconds
    pub token_expires_at: Option<String>,
    pub poll_path: String,
    pub ack_path_template: String,
    pub heartbeat_path_template: String,
    pub result_path_template: String,
    pub cron_sync_path: String,
    pub telemetry_path: String,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:9700".to_string(),
            token: None,
            token_expires_at: None,
            poll_path: "/openclaw/bridge/commands/poll".to_string(),
            ack_path_template: "/openclaw/bridge/commands/{commandId}/ack".to_string(),
            heartbeat_path_template: "/openclaw/bridge/commands/{commandId}/heartbeat"
                .to_string(),
            result_path_template: "/openclaw/bridge/commands/{commandId}/result".to_string(),
            cron_sync_path: "/openclaw/bridge/cron-sync".to_string(),
            telemetry_path: "/openclaw/bridge/telemetry".to_string(),
        }
    }
}

impl ControlPlaneConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.base_url.is_empty() {
            return Err("control plane base_url must not be empty".to_string());
        }

        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err("control plane base_url must start with http:// or https://".to_string());
        }

        for (name, template) in [
            ("ack_path_template", &self.ack_path_template),
            ("heartbeat_path_template", &self.heartbeat_path_template),
            ("result_path_template", &self.result_path_template),
        ] {
            if !template.contains(COMMAND_ID_PLACEHOLDER) {
                return Err(format!("{} must contain {}", name, COMMAND_ID_PLACEHOLDER));
            }
        }

        for (name, path) in [
            ("poll_path", &self.poll_path),
            ("cron_sync_path", &self.cron_sync_path),
            ("telemetry_path", &self.telemetry_path),
        ] {
            if path.is_empty() {
                return Err(format!("{} must not be empty", name));
            }
        }

        if matches!(&self.token, Some(t) if t.trim().is_empty()) {
            return Err("token is set but empty".to_string());
        }

        Ok(())
    }

    /// Full URL for an endpoint path
    pub fn get_api_url(&self, endpoint: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        let endpoint = endpoint.trim_start_matches('/');
        format!("{}/{}", base, endpoint)
    }

    /// Full URL for a per-command path template
    pub fn command_url(&self, template: &str, command_id: &str) -> String {
        let encoded = utf8_percent_encode(command_id, PATH_SEGMENT).to_string();
        self.get_api_url(&template.replace(COMMAND_ID_PLACEHOLDER, &encoded))
    }

    /// Parsed token expiry, `None` when unset.
    pub fn token_expiry(&self) -> Result<Option<DateTime<Utc>>, String> {
        let Some(raw) = self.token_expires_at.as_deref().map(str::trim) else {
            return Ok(None);
        };
        if raw.is_empty() {
            return Ok(None);
        }

        if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
            return Ok(Some(parsed.with_timezone(&Utc)));
        }

        raw.parse::<i64>()
            .ok()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
            .map(Some)
            .ok_or_else(|| format!("TOKEN_EXPIRES_AT is not a valid timestamp: {}", raw))
    }
}
