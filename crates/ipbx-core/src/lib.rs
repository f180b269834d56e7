//! Call-record model, phone-number helpers and abandoned-call detection for the InsidePBX client.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "ipbx-core";

/// `hangup_by` label reported when the caller disconnected first.
pub const HANGUP_BY_CALLER: &str = "CALLER";

pub const REASON_NORMAL_CLEARING: &str = "NORMAL_CLEARING";
pub const REASON_ORIGINATOR_CANCEL: &str = "ORIGINATOR_CANCEL";
pub const REASON_USER_BUSY: &str = "USER_BUSY";

/// Local timestamp layout used by the PBX for call-log and callback times.
pub const PBX_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const DEFAULT_TIMEZONE: Tz = chrono_tz::Europe::Bucharest;

pub const DEFAULT_MIN_PHONE_DIGITS: usize = 10;
/// E.164 caps numbers at 15 digits.
pub const DEFAULT_MAX_PHONE_DIGITS: usize = 15;

const ZERO_TIMESTAMP: &str = "0000-00-00 00:00:00";
const DISQUALIFIED_BY_LATER_ANSWER: &str = "same caller answered later by a known extension";

/// Strip formatting characters and rewrite a leading `+<digit>` to the `00` dial prefix.
pub fn normalize_phone_number(raw: &str) -> String {
    let mut normalized: String = raw
        .chars()
        .filter(|c| !matches!(c, ' ' | '.' | '-' | '(' | ')'))
        .collect();
    let mut chars = normalized.chars();
    if chars.next() == Some('+') && chars.next().is_some_and(|c| c.is_ascii_digit()) {
        normalized.replace_range(0..1, "00");
    }
    normalized
}

/// True when the normalized number is all ASCII digits with a length in `[min_digits, max_digits]`.
pub fn is_valid_phone_number(raw: &str, min_digits: usize, max_digits: usize) -> bool {
    let normalized = normalize_phone_number(raw);
    normalized.bytes().all(|b| b.is_ascii_digit())
        && (min_digits..=max_digits).contains(&normalized.len())
}

pub fn is_valid_phone_number_default(raw: &str) -> bool {
    is_valid_phone_number(raw, DEFAULT_MIN_PHONE_DIGITS, DEFAULT_MAX_PHONE_DIGITS)
}

/// Remove the tenant id from the start of a tenant-qualified extension (`1000101` -> `101` for tenant `1000`).
pub fn strip_tenant_prefix(extension: &str, tenant_id: &str) -> String {
    if tenant_id.is_empty() {
        return extension.to_string();
    }
    extension
        .strip_prefix(tenant_id)
        .unwrap_or(extension)
        .to_string()
}

/// Parse a PBX-local timestamp into UTC.
///
/// The zero date, malformed text and local times skipped by a DST jump yield `None`.
/// Ambiguous local times resolve to the earlier instant.
pub fn parse_pbx_timestamp(text: &str, tz: Tz) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if text.is_empty() || text == ZERO_TIMESTAMP {
        return None;
    }
    let naive = NaiveDateTime::parse_from_str(text, PBX_TIMESTAMP_FORMAT).ok()?;
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Inbound,
    Outbound,
}

impl CallDirection {
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "inbound" => Some(Self::Inbound),
            "outbound" => Some(Self::Outbound),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }
}

impl fmt::Display for CallDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Call state label. Upstream may send states outside the known set; those are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CallStatus {
    Ring,
    Hangup,
    Dial,
    Answer,
    Abandoned,
    Other(String),
}

impl CallStatus {
    pub fn parse(label: &str) -> Self {
        let label = label.trim();
        match label.to_ascii_lowercase().as_str() {
            "ring" => Self::Ring,
            "hangup" => Self::Hangup,
            "dial" => Self::Dial,
            "answer" => Self::Answer,
            "abandoned" => Self::Abandoned,
            _ => Self::Other(label.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Ring => "Ring",
            Self::Hangup => "Hangup",
            Self::Dial => "Dial",
            Self::Answer => "Answer",
            Self::Abandoned => "ABANDONED",
            Self::Other(label) => label,
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for CallStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for CallStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let label = String::deserialize(deserializer)?;
        Ok(Self::parse(&label))
    }
}

/// One completed call, built from a call-log entry or a webhook callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRecord {
    pub id: String,
    /// Agent extension, only reported by callbacks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension: Option<String>,
    pub direction: Option<CallDirection>,
    /// Absent for call-log entries until detection classifies them.
    pub status: Option<CallStatus>,
    pub answer_time: Option<DateTime<Utc>>,
    pub duration_seconds: Option<u64>,
    pub hangup_reason: Option<String>,
    pub caller_name: Option<String>,
    pub caller_number: Option<String>,
    /// Extension or queue the call was routed to (`forward`).
    pub forward_target: Option<String>,
    /// Display label of the routing target (`forward_name`).
    pub forward_name: Option<String>,
    pub hangup_by: Option<String>,
}

impl CallRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            extension: None,
            direction: None,
            status: None,
            answer_time: None,
            duration_seconds: None,
            hangup_reason: None,
            caller_name: None,
            caller_number: None,
            forward_target: None,
            forward_name: None,
            hangup_by: None,
        }
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        let answered = self.answer_time?;
        let seconds = i64::try_from(self.duration_seconds?).ok()?;
        answered.checked_add_signed(Duration::seconds(seconds))
    }

    pub fn hung_up_by_caller(&self) -> bool {
        self.hangup_by.as_deref() == Some(HANGUP_BY_CALLER)
    }

    pub fn is_inbound(&self) -> bool {
        self.direction == Some(CallDirection::Inbound)
    }

    /// Normalized caller number used to correlate legs of the same caller.
    pub fn caller_key(&self) -> Option<String> {
        self.caller_number
            .as_deref()
            .map(normalize_phone_number)
            .filter(|n| !n.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedRecord {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("undecodable entry: {0}")]
    Undecodable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DetectError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Queues to report on, plus after-hours labels whose calls count as caller hangups.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSelection {
    pub queue_names: Vec<String>,
    #[serde(default)]
    pub after_hours_labels: Vec<String>,
}

impl QueueSelection {
    pub fn new<I, S>(queue_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            queue_names: queue_names.into_iter().map(Into::into).collect(),
            after_hours_labels: Vec::new(),
        }
    }

    pub fn with_after_hours<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.after_hours_labels = labels.into_iter().map(Into::into).collect();
        self
    }

    pub fn validate(&self) -> Result<(), DetectError> {
        if self.queue_names.is_empty() {
            return Err(DetectError::InvalidInput(
                "queue selection must name at least one queue".to_string(),
            ));
        }
        Ok(())
    }

    pub fn is_after_hours(&self, forward_name: &str) -> bool {
        self.after_hours_labels.iter().any(|label| label == forward_name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AbandonedCallReport {
    /// One entry per requested queue, in request order.
    pub by_queue: IndexMap<String, Vec<CallRecord>>,
    /// After-hours labels that were not also requested as queues.
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    pub after_hours: IndexMap<String, Vec<CallRecord>>,
}

impl AbandonedCallReport {
    pub fn calls(&self, queue: &str) -> &[CallRecord] {
        self.by_queue.get(queue).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn total(&self) -> usize {
        self.by_queue.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectionEvent {
    AfterHoursForced {
        call_id: String,
        label: String,
    },
    Candidate {
        call_id: String,
        queue: String,
    },
    Disqualified {
        call_id: String,
        queue: String,
        superseded_by: String,
        reason: &'static str,
    },
    Ignored {
        call_id: String,
    },
}

pub trait DetectionObserver: Send + Sync {
    fn observe(&self, event: &DetectionEvent);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl DetectionObserver for NoopObserver {
    fn observe(&self, _event: &DetectionEvent) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl DetectionObserver for TracingObserver {
    fn observe(&self, event: &DetectionEvent) {
        match event {
            DetectionEvent::AfterHoursForced { call_id, label } => {
                debug!(%call_id, %label, "after-hours call attributed to caller hangup");
            }
            DetectionEvent::Candidate { call_id, queue } => {
                debug!(%call_id, %queue, "abandoned-call candidate");
            }
            DetectionEvent::Disqualified {
                call_id,
                queue,
                superseded_by,
                reason,
            } => {
                debug!(%call_id, %queue, %superseded_by, reason, "candidate disqualified");
            }
            DetectionEvent::Ignored { call_id } => {
                debug!(%call_id, "call neither abandoned nor answered by an agent");
            }
        }
    }
}

/// Collects events in memory; handy for inspecting a single detection run.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<DetectionEvent>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<DetectionEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl DetectionObserver for RecordingObserver {
    fn observe(&self, event: &DetectionEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event.clone()),
            Err(poisoned) => poisoned.into_inner().push(event.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct IndexedCandidate {
    answer_time: Option<DateTime<Utc>>,
    list: usize,
    slot: usize,
}

/// Infer abandoned queue calls from a call-log batch.
///
/// A record is a candidate when the caller hung up, the call was not forwarded to a known
/// extension, its `forward_name` is a selected queue or after-hours label, and it is inbound.
/// A later record from the same caller that reached a known extension removes every earlier
/// candidate of that caller. Input records are never mutated.
pub fn detect_abandoned_calls(
    records: &[CallRecord],
    selection: &QueueSelection,
    known_extensions: &HashSet<String>,
    observer: &dyn DetectionObserver,
) -> Result<AbandonedCallReport, DetectError> {
    selection.validate()?;

    let mut lists: IndexMap<&str, Vec<Option<CallRecord>>> = IndexMap::new();
    for name in &selection.queue_names {
        lists.entry(name.as_str()).or_default();
    }
    let queue_count = lists.len();
    for label in &selection.after_hours_labels {
        lists.entry(label.as_str()).or_default();
    }

    let mut caller_index: HashMap<String, Vec<IndexedCandidate>> = HashMap::new();

    for source in records {
        let mut record = source.clone();

        if let Some(label) = record
            .forward_name
            .as_deref()
            .filter(|name| selection.is_after_hours(name))
        {
            observer.observe(&DetectionEvent::AfterHoursForced {
                call_id: record.id.clone(),
                label: label.to_string(),
            });
            record.hangup_by = Some(HANGUP_BY_CALLER.to_string());
        }

        let reached_agent = record
            .forward_target
            .as_deref()
            .is_some_and(|target| known_extensions.contains(target));
        let list = record
            .forward_name
            .as_deref()
            .and_then(|name| lists.get_index_of(name));

        match list {
            Some(list) if record.hung_up_by_caller() && !reached_agent && record.is_inbound() => {
                record.status = Some(CallStatus::Abandoned);
                let caller = record.caller_key();
                let answer_time = record.answer_time;
                let (queue, slots) = match lists.get_index_mut(list) {
                    Some(entry) => entry,
                    None => continue,
                };
                observer.observe(&DetectionEvent::Candidate {
                    call_id: record.id.clone(),
                    queue: queue.to_string(),
                });
                slots.push(Some(record));
                if let Some(caller) = caller {
                    caller_index.entry(caller).or_default().push(IndexedCandidate {
                        answer_time,
                        list,
                        slot: slots.len() - 1,
                    });
                }
            }
            _ if reached_agent => {
                let (Some(caller), Some(answered_at)) = (record.caller_key(), record.answer_time)
                else {
                    continue;
                };
                let Some(candidates) = caller_index.get(&caller) else {
                    continue;
                };
                for candidate in candidates {
                    let Some(rang_at) = candidate.answer_time else {
                        continue;
                    };
                    if rang_at >= answered_at {
                        continue;
                    }
                    let Some((queue, slots)) = lists.get_index_mut(candidate.list) else {
                        continue;
                    };
                    if let Some(removed) = slots.get_mut(candidate.slot).and_then(Option::take) {
                        observer.observe(&DetectionEvent::Disqualified {
                            call_id: removed.id,
                            queue: queue.to_string(),
                            superseded_by: record.id.clone(),
                            reason: DISQUALIFIED_BY_LATER_ANSWER,
                        });
                    }
                }
            }
            _ => observer.observe(&DetectionEvent::Ignored {
                call_id: record.id.clone(),
            }),
        }
    }

    let mut report = AbandonedCallReport::default();
    for (position, (name, slots)) in lists.into_iter().enumerate() {
        let mut seen = HashSet::new();
        let calls: Vec<CallRecord> = slots
            .into_iter()
            .flatten()
            .filter(|call| seen.insert(call.id.clone()))
            .collect();
        if position < queue_count {
            report.by_queue.insert(name.to_string(), calls);
        } else {
            report.after_hours.insert(name.to_string(), calls);
        }
    }
    Ok(report)
}
