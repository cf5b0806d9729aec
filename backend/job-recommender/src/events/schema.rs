//! Inbound event schema
//!
//! Events arrive as `{event_type, timestamp, data}` JSON. They are decoded
//! once, at the transport boundary, into [`IndexEvent`]; handlers never see
//! raw JSON.

use crate::error::EventError;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

pub const JOB_CREATED: &str = "job.created";
pub const JOB_UPDATED: &str = "job.updated";
pub const PROFILE_UPDATED: &str = "profile.updated";

#[derive(Debug, Deserialize)]
pub struct EventEnvelope {
    pub event_type: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct RawJobData {
    job_id: Option<String>,
    job_expiration: Option<String>,
    job_detail: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawProfileData {
    user_id: Option<String>,
    profile_detail: Option<String>,
}

/// Payload of `job.created` and `job.updated`
#[derive(Debug, Clone, PartialEq)]
pub struct JobChanged {
    pub job_id: Uuid,
    pub expires_at: Option<DateTime<Utc>>,
    pub detail: String,
}

/// Payload of `profile.updated`
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileUpdated {
    pub user_id: Uuid,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IndexEvent {
    JobCreated(JobChanged),
    JobUpdated(JobChanged),
    ProfileUpdated(ProfileUpdated),
    /// Well-formed envelope with an event type this service does not handle
    Unrecognized(String),
}

impl IndexEvent {
    /// Decode a message body
    pub fn decode(payload: &[u8]) -> Result<Self, EventError> {
        let envelope: EventEnvelope = serde_json::from_slice(payload)?;

        if let Some(ts) = envelope.timestamp.as_deref() {
            parse_timestamp(ts)
                .ok_or_else(|| EventError::Malformed(format!("invalid timestamp: {}", ts)))?;
        }

        match envelope.event_type.as_str() {
            JOB_CREATED => Ok(IndexEvent::JobCreated(job_changed(envelope.data)?)),
            JOB_UPDATED => Ok(IndexEvent::JobUpdated(job_changed(envelope.data)?)),
            PROFILE_UPDATED => Ok(IndexEvent::ProfileUpdated(profile_updated(envelope.data)?)),
            other => Ok(IndexEvent::Unrecognized(other.to_string())),
        }
    }

    /// Metric label for the event kind
    pub fn kind(&self) -> &'static str {
        match self {
            IndexEvent::JobCreated(_) => "job_created",
            IndexEvent::JobUpdated(_) => "job_updated",
            IndexEvent::ProfileUpdated(_) => "profile_updated",
            IndexEvent::Unrecognized(_) => "unrecognized",
        }
    }
}

fn job_changed(data: serde_json::Value) -> Result<JobChanged, EventError> {
    let raw: RawJobData = serde_json::from_value(data)?;

    let job_id = required_uuid(raw.job_id, "job_id")?;
    let detail = required_text(raw.job_detail, "job_detail")?;
    let expires_at = match raw.job_expiration.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(value) => Some(parse_timestamp(value).ok_or_else(|| {
            EventError::Malformed(format!("invalid job_expiration: {}", value))
        })?),
    };

    Ok(JobChanged {
        job_id,
        expires_at,
        detail,
    })
}

fn profile_updated(data: serde_json::Value) -> Result<ProfileUpdated, EventError> {
    let raw: RawProfileData = serde_json::from_value(data)?;
    Ok(ProfileUpdated {
        user_id: required_uuid(raw.user_id, "user_id")?,
        detail: required_text(raw.profile_detail, "profile_detail")?,
    })
}

fn required_uuid(value: Option<String>, field: &str) -> Result<Uuid, EventError> {
    let value = value.ok_or_else(|| EventError::Malformed(format!("missing {}", field)))?;
    Uuid::parse_str(value.trim())
        .map_err(|e| EventError::Malformed(format!("invalid {}: {}", field, e)))
}

fn required_text(value: Option<String>, field: &str) -> Result<String, EventError> {
    match value {
        Some(text) if !text.trim().is_empty() => Ok(text),
        Some(_) => Err(EventError::Malformed(format!("blank {}", field))),
        None => Err(EventError::Malformed(format!("missing {}", field))),
    }
}

/// RFC 3339, or naive ISO-8601 read as UTC
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
        .map(|naive| naive.and_utc())
}
