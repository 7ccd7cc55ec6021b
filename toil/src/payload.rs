//! The storable representation of a job.
//!
//! Every job travels through the store as a JSON envelope recording which
//! job type to run, its argument bag, and the retry/deadline policy that was
//! in force when it was enqueued. The wire keys (`job`, `data`, `maxTries`,
//! `timeout`, `createdAt`) are part of the persisted contract: rows written
//! by one deployment must decode in the next.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("error encoding or decoding a job payload")]
    Json(#[from] serde_json::Error),
}

/// The decoded payload envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDescriptor {
    /// The job type name used to resolve an implementation at dequeue time.
    pub job: String,
    /// The argument bag handed back to the job when it runs.
    pub data: serde_json::Value,
    /// The retry ceiling baked in at enqueue time.
    ///
    /// Absent on rows written before the ceiling was recorded; the retry
    /// policy then falls back to the service default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tries: Option<u32>,
    /// The execution deadline in seconds, when one was declared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// When the envelope was created.
    pub created_at: DateTime<Utc>,
}

/// Encode a descriptor into its storable form.
pub fn encode(descriptor: &JobDescriptor) -> Result<String, CodecError> {
    Ok(serde_json::to_string(descriptor)?)
}

/// Decode a stored payload.
///
/// For every descriptor `d`, `decode(&encode(&d)?)? == d`.
pub fn decode(payload: &str) -> Result<JobDescriptor, CodecError> {
    Ok(serde_json::from_str(payload)?)
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn descriptor() -> JobDescriptor {
        JobDescriptor {
            job: "send_reminder".to_owned(),
            data: json!({"user_id": 42, "channel": "email"}),
            max_tries: Some(3),
            timeout: Some(60),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn round_trips_a_full_envelope() {
        let original = descriptor();
        let decoded = decode(&encode(&original).unwrap()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn round_trips_without_optional_fields() {
        let original = JobDescriptor {
            max_tries: None,
            timeout: None,
            ..descriptor()
        };
        let encoded = encode(&original).unwrap();
        assert!(!encoded.contains("maxTries"));
        assert!(!encoded.contains("timeout"));
        assert_eq!(decode(&encoded).unwrap(), original);
    }

    #[test]
    fn wire_keys_are_camel_case() {
        let value = serde_json::to_value(descriptor()).unwrap();
        let object = value.as_object().unwrap();
        for key in ["job", "data", "maxTries", "timeout", "createdAt"] {
            assert!(object.contains_key(key), "missing wire key {key}");
        }
        assert_eq!(object.len(), 5);
    }

    #[test]
    fn decode_tolerates_rows_missing_the_policy_keys() {
        let payload = r#"{
            "job": "send_reminder",
            "data": {"user_id": 1},
            "createdAt": "2024-04-07T09:30:00Z"
        }"#;
        let decoded = decode(payload).unwrap();
        assert_eq!(decoded.job, "send_reminder");
        assert_eq!(decoded.max_tries, None);
        assert_eq!(decoded.timeout, None);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert_matches!(decode("not a payload"), Err(CodecError::Json(_)));
    }
}
