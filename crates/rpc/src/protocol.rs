use farm_core::{Error, PushMessage, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Longest accepted frame on either transport. Channel payloads larger
/// than this must use `sendChannelChunk`.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// One JSON frame. Both transports carry the same frames: one per line on
/// the local socket, one per text message on the websocket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    Request {
        id: u64,
        method: String,
        #[serde(default)]
        params: Value,
    },
    Response {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Push {
        message: PushMessage,
    },
}

impl Frame {
    pub fn request(id: u64, method: impl Into<String>, params: Value) -> Self {
        Frame::Request {
            id,
            method: method.into(),
            params,
        }
    }

    pub fn reply(id: u64, outcome: Result<Value>) -> Self {
        match outcome {
            Ok(value) => Frame::Response {
                id,
                result: Some(value),
                error: None,
            },
            Err(e) => Frame::Response {
                id,
                result: None,
                error: Some(e.to_string()),
            },
        }
    }

    pub fn parse(line: &str) -> Result<Self> {
        serde_json::from_str(line).map_err(|e| Error::Protocol(format!("malformed frame: {}", e)))
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
