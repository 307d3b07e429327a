use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{JobFailure, JobState};

/// Frames the Agent pushes to a connection outside of any request/response
/// exchange.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushMessage {
    /// One slice of an outbound channel. The final slice has `last` set.
    #[serde(rename_all = "camelCase")]
    ChannelChunk {
        job_guid: Uuid,
        name: String,
        offset: u64,
        total: u64,
        hash: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
        last: bool,
    },
    /// The Agent needs this channel; the receiver should send it.
    #[serde(rename_all = "camelCase")]
    ChannelWanted { job_guid: Uuid, name: String },
    #[serde(rename_all = "camelCase")]
    JobUpdate {
        job_guid: Uuid,
        state: JobState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failure: Option<JobFailure>,
    },
}

impl PushMessage {
    pub fn job_guid(&self) -> Uuid {
        match self {
            PushMessage::ChannelChunk { job_guid, .. }
            | PushMessage::ChannelWanted { job_guid, .. }
            | PushMessage::JobUpdate { job_guid, .. } => *job_guid,
        }
    }
}

/// Serde adapter carrying raw bytes as standard base64 text.
pub mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_data_is_base64_on_the_wire() {
        let msg = PushMessage::ChannelChunk {
            job_guid: Uuid::nil(),
            name: "scene".into(),
            offset: 0,
            total: 3,
            hash: "abc".into(),
            data: vec![1, 2, 3],
            last: true,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "channel_chunk");
        assert_eq!(json["data"], "AQID");
        assert_eq!(json["jobGuid"], Uuid::nil().to_string());

        let back: PushMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_job_update_omits_missing_failure() {
        let msg = PushMessage::JobUpdate {
            job_guid: Uuid::nil(),
            state: JobState::Executing,
            failure: None,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["state"], "executing");
        assert!(json.get("failure").is_none());
    }
}
