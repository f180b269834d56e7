//! Typed InsidePBX API operations: call log, extensions, phonebook and call callbacks.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use indexmap::IndexMap;
use ipbx_core::{
    detect_abandoned_calls, normalize_phone_number, parse_pbx_timestamp, strip_tenant_prefix,
    AbandonedCallReport, CallDirection, CallRecord, CallStatus, DetectError, DetectionObserver,
    MalformedRecord, QueueSelection,
};
use ipbx_transport::{HttpTransport, PbxConfig, TransportError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "ipbx-api";

pub const STATUS_SUCCESS: &str = "SUCCESS";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("{command} rejected by the PBX (status {status:?})")]
    Rejected {
        command: String,
        status: Option<String>,
    },
    #[error(transparent)]
    Detect(#[from] DetectError),
}

/// Envelope shared by every API response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiEnvelope {
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_u64")]
    pub count: Option<u64>,
    #[serde(default)]
    pub data: Option<JsonValue>,
}

impl ApiEnvelope {
    pub fn is_success(&self) -> bool {
        self.status.as_deref() == Some(STATUS_SUCCESS)
    }

    fn into_entries(self) -> Vec<JsonValue> {
        match self.data {
            Some(JsonValue::Array(items)) => items,
            _ => Vec::new(),
        }
    }
}

/// One `callLog` entry as sent by the PBX.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLogEntry {
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub unique_token: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub hangup_by: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub forward: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub forward_name: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub caller: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub caller_name: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub call_direction: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub start_date: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_u64")]
    pub call_sec: Option<u64>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub hangup_reason: Option<String>,
}

impl RawLogEntry {
    pub fn into_call_record(self, tz: Tz) -> Result<CallRecord, MalformedRecord> {
        let id = self
            .unique_token
            .ok_or(MalformedRecord::MissingField("unique_token"))?;
        Ok(CallRecord {
            direction: self.call_direction.as_deref().and_then(CallDirection::parse),
            answer_time: self
                .start_date
                .as_deref()
                .and_then(|text| parse_pbx_timestamp(text, tz)),
            duration_seconds: self.call_sec,
            hangup_reason: self.hangup_reason,
            caller_name: self.caller_name,
            caller_number: self.caller,
            forward_target: self.forward,
            forward_name: self.forward_name,
            hangup_by: self.hangup_by,
            ..CallRecord::new(id)
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CallLogBatch {
    pub records: Vec<CallRecord>,
    /// Entries dropped as malformed.
    pub skipped: usize,
}

/// Turn a `callLog` response into call records. A non-SUCCESS envelope is an empty batch.
pub fn parse_call_log(envelope: ApiEnvelope, tz: Tz) -> CallLogBatch {
    if !envelope.is_success() {
        warn!(status = ?envelope.status, "call log not successful; treating window as empty");
        return CallLogBatch::default();
    }
    if envelope.count == Some(0) {
        return CallLogBatch::default();
    }

    let mut batch = CallLogBatch::default();
    for (position, entry) in envelope.into_entries().into_iter().enumerate() {
        let parsed = serde_json::from_value::<RawLogEntry>(entry)
            .map_err(|err| MalformedRecord::Undecodable(err.to_string()))
            .and_then(|raw| raw.into_call_record(tz));
        match parsed {
            Ok(record) => batch.records.push(record),
            Err(err) => {
                warn!(position, error = %err, "skipping malformed call-log entry");
                batch.skipped += 1;
            }
        }
    }
    batch
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Extension {
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub ext_number: Option<String>,
    #[serde(flatten)]
    pub details: Map<String, JsonValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhonebookEntry {
    #[serde(
        rename = "Phone Number",
        default,
        deserialize_with = "lenient::opt_string"
    )]
    pub phone_number: Option<String>,
    #[serde(flatten)]
    pub details: Map<String, JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPhonebookEntry {
    pub first_name: String,
    pub last_name: String,
    pub display_name: String,
    pub phone_number: String,
}

impl NewPhonebookEntry {
    fn to_params(&self) -> Map<String, JsonValue> {
        let mut params = Map::new();
        params.insert("pb_first_name".into(), self.first_name.clone().into());
        params.insert("pb_last_name".into(), self.last_name.clone().into());
        params.insert("pb_display_name".into(), self.display_name.clone().into());
        params.insert("pb_phone_number".into(), self.phone_number.clone().into());
        params
    }
}

/// Keep entries that carry a phone number, keyed by the normalized number.
pub fn parse_phonebook(envelope: ApiEnvelope) -> IndexMap<String, PhonebookEntry> {
    let mut phonebook = IndexMap::new();
    if !envelope.is_success() {
        warn!(status = ?envelope.status, "phonebook not successful; treating as empty");
        return phonebook;
    }
    for (position, entry) in envelope.into_entries().into_iter().enumerate() {
        let mut entry = match serde_json::from_value::<PhonebookEntry>(entry) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(position, error = %err, "skipping malformed phonebook entry");
                continue;
            }
        };
        let Some(number) = entry.phone_number.as_deref().map(normalize_phone_number) else {
            continue;
        };
        if number.is_empty() {
            continue;
        }
        entry.phone_number = Some(number.clone());
        phonebook.insert(number, entry);
    }
    phonebook
}

pub fn parse_extensions(envelope: ApiEnvelope) -> Vec<Extension> {
    if !envelope.is_success() {
        warn!(status = ?envelope.status, "extension list not successful; treating as empty");
        return Vec::new();
    }
    envelope
        .into_entries()
        .into_iter()
        .enumerate()
        .filter_map(|(position, entry)| match serde_json::from_value::<Extension>(entry) {
            Ok(extension) => Some(extension),
            Err(err) => {
                warn!(position, error = %err, "skipping malformed extension entry");
                None
            }
        })
        .collect()
}

/// Build a call record from a real-time callback's form fields. Empty values count as absent.
pub fn call_record_from_callback(
    params: &HashMap<String, String>,
    tenant_id: &str,
    tz: Tz,
) -> Result<CallRecord, MalformedRecord> {
    let field = |name: &str| {
        params
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };
    let id = field("uuid").ok_or(MalformedRecord::MissingField("uuid"))?;
    Ok(CallRecord {
        extension: field("extension_number").map(|ext| strip_tenant_prefix(&ext, tenant_id)),
        direction: field("call_direction").and_then(|d| CallDirection::parse(&d)),
        status: field("call_status").map(|s| CallStatus::parse(&s)),
        answer_time: field("call_answer_time").and_then(|t| parse_pbx_timestamp(&t, tz)),
        duration_seconds: field("call_duration").and_then(|d| d.parse().ok()),
        hangup_reason: field("reason"),
        caller_name: field("caller_name"),
        caller_number: field("caller_number"),
        ..CallRecord::new(id)
    })
}

#[async_trait]
pub trait CallLogSource: Send + Sync {
    async fn fetch_call_log(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<CallRecord>, ApiError>;
}

#[async_trait]
pub trait ExtensionDirectory: Send + Sync {
    /// Every known agent extension number.
    async fn list_extensions(&self) -> Result<HashSet<String>, ApiError>;
}

/// Fetch extensions and the call log for `[start, end]`, then run abandoned-call detection.
pub async fn find_abandoned_calls<S, D>(
    source: &S,
    directory: &D,
    selection: &QueueSelection,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    observer: &dyn DetectionObserver,
) -> Result<AbandonedCallReport, ApiError>
where
    S: CallLogSource + ?Sized,
    D: ExtensionDirectory + ?Sized,
{
    selection.validate()?;
    let known_extensions = directory.list_extensions().await?;
    let records = source.fetch_call_log(start, end).await?;
    let report = detect_abandoned_calls(&records, selection, &known_extensions, observer)?;
    info!(
        scanned = records.len(),
        queues = report.by_queue.len(),
        abandoned = report.total(),
        "abandoned-call detection finished"
    );
    Ok(report)
}

#[derive(Debug, Clone)]
pub struct InsidePbxClient {
    transport: HttpTransport,
}

impl InsidePbxClient {
    pub fn new(config: PbxConfig) -> Result<Self> {
        Ok(Self::from_transport(HttpTransport::new(config)?))
    }

    pub fn from_transport(transport: HttpTransport) -> Self {
        Self { transport }
    }

    pub fn config(&self) -> &PbxConfig {
        self.transport.config()
    }

    async fn request(
        &self,
        command: &str,
        params: Map<String, JsonValue>,
    ) -> Result<ApiEnvelope, ApiError> {
        let resp = self.transport.post_command(command, params).await?;
        Ok(resp.json()?)
    }

    /// Like `request`, but a 2xx body that is not an envelope reads as an empty result.
    async fn read(&self, command: &str) -> Result<ApiEnvelope, ApiError> {
        let resp = self.transport.post_command(command, Map::new()).await?;
        match resp.json::<ApiEnvelope>() {
            Ok(envelope) => Ok(envelope),
            Err(err) => {
                warn!(command, error = %err, "undecodable pbx response; treating as empty");
                Ok(ApiEnvelope::default())
            }
        }
    }

    async fn mutate(&self, command: &str, params: Map<String, JsonValue>) -> Result<(), ApiError> {
        let envelope = self.request(command, params).await?;
        if envelope.is_success() {
            return Ok(());
        }
        warn!(command, status = ?envelope.status, "pbx rejected command");
        Err(ApiError::Rejected {
            command: command.to_string(),
            status: envelope.status,
        })
    }

    pub async fn call_log(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<CallLogBatch, ApiError> {
        let command = self.config().call_log_path(start, end);
        let envelope = self.read(&command).await?;
        Ok(parse_call_log(envelope, self.config().timezone))
    }

    pub async fn extensions(&self) -> Result<Vec<Extension>, ApiError> {
        let command = self.config().command_path("info", "getExtension");
        let envelope = self.read(&command).await?;
        Ok(parse_extensions(envelope))
    }

    pub async fn phonebook(&self) -> Result<IndexMap<String, PhonebookEntry>, ApiError> {
        let command = self.config().command_path("info", "getPhoneNumber");
        let envelope = self.read(&command).await?;
        Ok(parse_phonebook(envelope))
    }

    pub async fn create_phonebook_entry(&self, entry: &NewPhonebookEntry) -> Result<(), ApiError> {
        let command = self.config().command_path("add", "createNumber");
        self.mutate(&command, entry.to_params()).await
    }

    pub async fn delete_phonebook_entry(&self, phonebook_id: u64) -> Result<(), ApiError> {
        let command = self.config().command_path("delete", "deletePhoneNumber");
        let mut params = Map::new();
        params.insert("phonebook_id".into(), phonebook_id.into());
        self.mutate(&command, params).await
    }

    /// Replace an entry by deleting it and creating it anew; the vendor update endpoint
    /// does not apply changes reliably.
    pub async fn update_phonebook_entry(
        &self,
        phonebook_id: u64,
        entry: &NewPhonebookEntry,
    ) -> Result<(), ApiError> {
        self.delete_phonebook_entry(phonebook_id).await?;
        self.create_phonebook_entry(entry).await
    }

    pub async fn abandoned_calls(
        &self,
        selection: &QueueSelection,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        observer: &dyn DetectionObserver,
    ) -> Result<AbandonedCallReport, ApiError> {
        find_abandoned_calls(self, self, selection, start, end, observer).await
    }
}

#[async_trait]
impl CallLogSource for InsidePbxClient {
    async fn fetch_call_log(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<CallRecord>, ApiError> {
        Ok(self.call_log(start, end).await?.records)
    }
}

#[async_trait]
impl ExtensionDirectory for InsidePbxClient {
    async fn list_extensions(&self) -> Result<HashSet<String>, ApiError> {
        Ok(self
            .extensions()
            .await?
            .into_iter()
            .filter_map(|extension| extension.ext_number)
            .collect())
    }
}

/// Field decoders that accept the PBX's mix of strings, numbers and nulls.
mod lenient {
    use serde::{Deserialize, Deserializer};
    use serde_json::Value as JsonValue;

    pub fn opt_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        Ok(match Option::<JsonValue>::deserialize(d)? {
            Some(JsonValue::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Some(JsonValue::Number(n)) => Some(n.to_string()),
            _ => None,
        })
    }

    pub fn opt_u64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
        Ok(match Option::<JsonValue>::deserialize(d)? {
            Some(JsonValue::Number(n)) => n.as_u64(),
            Some(JsonValue::String(s)) => s.trim().parse().ok(),
            _ => None,
        })
    }
}
