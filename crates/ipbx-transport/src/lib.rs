//! Connection settings and the JSON-over-POST transport for the InsidePBX REST API.

use std::fmt;
use std::time::Duration;

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use ipbx_core::DEFAULT_TIMEZONE;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ipbx-transport";

pub const DEFAULT_BASE_URL: &str = "https://portal.insidetelecom.ro/InsideTelecom_api/v1.4/api";
pub const DEFAULT_USER_TYPE: &str = "TENANT";

const WINDOW_FORMAT: &str = "%Y-%m-%d-%H:%M";

#[derive(Clone)]
pub struct PbxConfig {
    /// API root without a trailing `/`.
    pub base_url: String,
    pub tenant_id: String,
    pub user_type: String,
    pub token: String,
    /// Zone the PBX reports local timestamps in.
    pub timezone: Tz,
    pub connect_timeout: Duration,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl fmt::Debug for PbxConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PbxConfig")
            .field("base_url", &self.base_url)
            .field("tenant_id", &self.tenant_id)
            .field("user_type", &self.user_type)
            .field("token", &"<redacted>")
            .field("timezone", &self.timezone)
            .field("connect_timeout", &self.connect_timeout)
            .field("timeout", &self.timeout)
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

/// Reads `IPBX_TIMEZONE`, falling back to the PBX default zone.
pub fn timezone_from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Tz> {
    match lookup("IPBX_TIMEZONE") {
        Some(name) => name
            .parse::<Tz>()
            .map_err(|err| anyhow!("invalid IPBX_TIMEZONE {name:?}: {err}")),
        None => Ok(DEFAULT_TIMEZONE),
    }
}

impl PbxConfig {
    pub fn new(
        base_url: impl Into<String>,
        tenant_id: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tenant_id: tenant_id.into(),
            user_type: DEFAULT_USER_TYPE.to_string(),
            token: token.into(),
            timezone: DEFAULT_TIMEZONE,
            connect_timeout: Duration::from_secs(10),
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }

    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let token = lookup("IPBX_TOKEN")
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| anyhow!("IPBX_TOKEN must be set"))?;
        let mut config = Self::new(
            lookup("IPBX_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            lookup("IPBX_TENANT_ID").unwrap_or_default(),
            token,
        );
        if let Some(user_type) = lookup("IPBX_USER_TYPE") {
            config.user_type = user_type;
        }
        config.timezone = timezone_from_lookup(&lookup)?;
        config.connect_timeout = Duration::from_secs(
            lookup("IPBX_CONNECT_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
        );
        config.timeout = Duration::from_secs(
            lookup("IPBX_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
        );
        config.user_agent = lookup("IPBX_USER_AGENT");
        Ok(config)
    }

    pub fn endpoint_url(&self, command: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            command.trim_start_matches('/')
        )
    }

    /// `{verb}/{user_type}/{operation}`, e.g. `add/TENANT/createNumber`.
    pub fn command_path(&self, verb: &str, operation: &str) -> String {
        format!("{verb}/{}/{operation}", self.user_type)
    }

    pub fn call_log_path(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> String {
        format!(
            "info/{}/{}/{}/callLog",
            self.format_window_bound(start),
            self.format_window_bound(end),
            self.user_type
        )
    }

    fn format_window_bound(&self, at: DateTime<Utc>) -> String {
        at.with_timezone(&self.timezone)
            .format(WINDOW_FORMAT)
            .to_string()
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid JSON from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl TransportError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            Self::Request(err) => err.status().map(|s| s.as_u16()),
            Self::Decode { .. } => None,
        }
    }
}

/// Anything outside 200..=299 is an error.
pub fn check_status(status: StatusCode, url: &str) -> Result<(), TransportError> {
    if status.is_success() {
        return Ok(());
    }
    Err(TransportError::HttpStatus {
        status: status.as_u16(),
        url: url.to_string(),
    })
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub url: String,
    pub body: Vec<u8>,
}

impl ApiResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, TransportError> {
        serde_json::from_slice(&self.body).map_err(|source| TransportError::Decode {
            url: self.url.clone(),
            source,
        })
    }
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    config: PbxConfig,
}

impl HttpTransport {
    pub fn new(config: PbxConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .connect_timeout(config.connect_timeout)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &PbxConfig {
        &self.config
    }

    /// POST `params` plus the API token as a JSON object to `command`. Never retried.
    pub async fn post_command(
        &self,
        command: &str,
        params: Map<String, JsonValue>,
    ) -> Result<ApiResponse, TransportError> {
        let request_id = Uuid::new_v4();
        let url = self.config.endpoint_url(command);
        let span = info_span!("pbx_command", %request_id, command);

        async move {
            let mut body = Map::new();
            body.insert(
                "token_id".to_string(),
                JsonValue::String(self.config.token.clone()),
            );
            body.extend(params);

            let resp = self
                .client
                .post(&url)
                .json(&JsonValue::Object(body))
                .send()
                .await?;
            let status = resp.status();
            check_status(status, &url)?;

            let body = resp.bytes().await?.to_vec();
            debug!(status = status.as_u16(), bytes = body.len(), "pbx command completed");
            Ok(ApiResponse { status, url, body })
        }
        .instrument(span)
        .await
    }
}
