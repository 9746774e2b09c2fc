//! Control-channel frames.
//!
//! Every request and reply on the pipe service's control connection is a
//! data message holding a JSON-encoded [`Frame`] prefixed by its magic
//! number. Links are never embedded in frames; they follow as separate
//! link messages.

use crate::PipeError;
use core_types::{IsolateId, ServerInstanceId};
use links::LinkMessage;
use serde::{Deserialize, Serialize};

pub const MAGIC_REGISTER_PIPE_SERVER: u32 = 0x4958_7001;
pub const MAGIC_REGISTER_PIPE_CLIENT: u32 = 0x4958_7002;
pub const MAGIC_CLOSE_PIPE_SERVER: u32 = 0x4958_7003;
pub const MAGIC_ACCEPT_PIPE_SERVER: u32 = 0x4958_7004;
pub const MAGIC_OK: u32 = 0x4958_7011;
pub const MAGIC_FAIL: u32 = 0x4958_7012;

/// Payload carried by an `Ok` reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OkPayload {
    /// Negotiated server version, in reply to a client registration
    Version(String),
    /// Issued server instance, in reply to a server registration
    ServerInstance(ServerInstanceId),
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frame {
    RegisterServer {
        server_name: String,
        server_version: String,
        caller: IsolateId,
    },
    RegisterClient {
        server_name: String,
        requested_version: String,
        caller: IsolateId,
    },
    AcceptServer {
        server: ServerInstanceId,
    },
    CloseServer {
        server: ServerInstanceId,
    },
    Ok {
        payload: OkPayload,
    },
    Fail {
        reason: String,
    },
}

#[derive(Serialize, Deserialize)]
struct WireFrame {
    magic: u32,
    frame: Frame,
}

impl Frame {
    pub fn ok(payload: OkPayload) -> Self {
        Frame::Ok { payload }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Frame::Fail {
            reason: reason.into(),
        }
    }

    pub fn magic(&self) -> u32 {
        match self {
            Frame::RegisterServer { .. } => MAGIC_REGISTER_PIPE_SERVER,
            Frame::RegisterClient { .. } => MAGIC_REGISTER_PIPE_CLIENT,
            Frame::AcceptServer { .. } => MAGIC_ACCEPT_PIPE_SERVER,
            Frame::CloseServer { .. } => MAGIC_CLOSE_PIPE_SERVER,
            Frame::Ok { .. } => MAGIC_OK,
            Frame::Fail { .. } => MAGIC_FAIL,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, PipeError> {
        let wire = WireFrame {
            magic: self.magic(),
            frame: self.clone(),
        };
        Ok(serde_json::to_vec(&wire)?)
    }

    /// Decodes a frame, rejecting a magic that disagrees with its kind
    pub fn decode(bytes: &[u8]) -> Result<Self, PipeError> {
        let wire: WireFrame = serde_json::from_slice(bytes)?;
        if wire.magic != wire.frame.magic() {
            return Err(PipeError::Frame(format!(
                "magic {:#x} does not match frame kind (expected {:#x})",
                wire.magic,
                wire.frame.magic()
            )));
        }
        Ok(wire.frame)
    }

    pub fn to_message(&self) -> Result<LinkMessage, PipeError> {
        Ok(LinkMessage::new_data_message(&self.encode()?))
    }

    pub fn from_message(message: &LinkMessage) -> Result<Self, PipeError> {
        let bytes = message
            .extract_data()
            .map_err(|e| PipeError::Protocol(format!("expected a frame: {}", e)))?;
        Self::decode(&bytes)
    }
}
