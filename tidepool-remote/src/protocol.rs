//! Binary request/response protocol spoken by [`WsRemote`](crate::ws::WsRemote).
//!
//! Wire format (bincode-encoded, one frame per WebSocket binary message):
//! ```text
//! client ──► ┌────────┬──────────┬─────────────────────────────┐
//!            │ id u64 │ auth str │ Get | Set | List            │
//!            └────────┴──────────┴─────────────────────────────┘
//! server ──► ┌────────┬─────────────────────────────────────────┐
//!            │ id u64 │ Value | Ack | Keys | Unauthorized | Error│
//!            └────────┴─────────────────────────────────────────┘
//! ```
//!
//! Responses carry the id of the request they answer and may arrive in
//! any order.

use serde::{Deserialize, Serialize};
use tidepool_core::Blob;

use crate::api::RemoteError;
use crate::key::RemotePath;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteRequest {
    Get {
        scope: String,
        path: RemotePath,
    },
    Set {
        scope: String,
        path: RemotePath,
        value: Blob,
    },
    List {
        scope: String,
        path: Option<RemotePath>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteResponse {
    /// Answer to `Get`
    Value(Option<Blob>),
    /// Answer to `Set`
    Ack,
    /// Answer to `List`
    Keys(Vec<String>),
    Unauthorized,
    Error(String),
}

impl RemoteResponse {
    /// Map failure responses onto [`RemoteError`].
    pub fn into_result(self) -> Result<RemoteResponse, RemoteError> {
        match self {
            RemoteResponse::Unauthorized => Err(RemoteError::Unauthorized),
            RemoteResponse::Error(message) => Err(RemoteError::Rejected(message)),
            other => Ok(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: u64,
    /// Bearer token, empty for anonymous calls
    pub auth: String,
    pub request: RemoteRequest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: u64,
    pub response: RemoteResponse,
}

impl RequestFrame {
    pub fn encode(&self) -> Result<Vec<u8>, RemoteError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, RemoteError> {
        decode(bytes)
    }
}

impl ResponseFrame {
    pub fn encode(&self) -> Result<Vec<u8>, RemoteError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, RemoteError> {
        decode(bytes)
    }
}

fn encode<T: Serialize>(frame: &T) -> Result<Vec<u8>, RemoteError> {
    bincode::serde::encode_to_vec(frame, bincode::config::standard())
        .map_err(|e| RemoteError::Protocol(format!("encode: {e}")))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, RemoteError> {
    let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| RemoteError::Protocol(format!("decode: {e}")))?;
    Ok(frame)
}
