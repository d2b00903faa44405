//! The wire envelope.
//!
//! Every physical frame carries one JSON-encoded `Message`. All fields are
//! optional; which one is set decides how the frame is routed.

use crate::{AppImage, CoreError, Packet, PacketType, RegistryAuth};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Messages exchanged between the build client and the build executor.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Message {
    /// File transfer message for this sync session.
    #[serde(rename = "fileSessionID", skip_serializing_if = "String::is_empty")]
    pub file_session_id: String,
    /// Progress message for this status session.
    #[serde(rename = "statusSessionID", skip_serializing_if = "String::is_empty")]
    pub status_session_id: String,
    /// Build done.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_image: Option<AppImage>,
    /// Build failed.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
    /// Request for, or response with, a file from the client's working directory.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub read_file: String,
    /// Executor asking for a registry credential, or client answering.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub registry_server_address: String,

    #[serde(skip_serializing_if = "is_false")]
    pub file_session_close: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry_auth: Option<RegistryAuth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_options: Option<SyncOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packet: Option<Packet>,
    /// Compressed payload of `packet.data`, set only on the wire.
    #[serde(with = "crate::base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub packet_data: Vec<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<SolveStatus>,
    #[serde(skip_serializing_if = "is_false")]
    pub compress: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// What a message is for, in dispatch priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Error,
    AppImage,
    Status,
    FileSession,
    Credential,
    ReadFile,
}

impl Message {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            ..Default::default()
        }
    }

    pub fn app_image(image: AppImage) -> Self {
        Self {
            app_image: Some(image),
            ..Default::default()
        }
    }

    pub fn status(session_id: impl Into<String>, status: SolveStatus) -> Self {
        Self {
            status_session_id: session_id.into(),
            status: Some(status),
            ..Default::default()
        }
    }

    /// Announces a new file-sync session.
    pub fn file_session_start(session_id: impl Into<String>, options: SyncOptions) -> Self {
        Self {
            file_session_id: session_id.into(),
            sync_options: Some(options),
            ..Default::default()
        }
    }

    pub fn file_packet(session_id: impl Into<String>, packet: Packet, compress: bool) -> Self {
        Self {
            file_session_id: session_id.into(),
            packet: Some(packet),
            compress,
            ..Default::default()
        }
    }

    pub fn file_session_close(session_id: impl Into<String>) -> Self {
        Self {
            file_session_id: session_id.into(),
            file_session_close: true,
            ..Default::default()
        }
    }

    pub fn credential_request(address: impl Into<String>) -> Self {
        Self {
            registry_server_address: address.into(),
            ..Default::default()
        }
    }

    /// Answer to a credential request; `None` means the client has nothing for this host.
    pub fn credential_response(address: impl Into<String>, auth: Option<RegistryAuth>) -> Self {
        Self {
            registry_server_address: address.into(),
            registry_auth: auth,
            ..Default::default()
        }
    }

    pub fn read_file_request(path: impl Into<String>) -> Self {
        Self {
            read_file: path.into(),
            ..Default::default()
        }
    }

    pub fn read_file_response(path: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            read_file: path.into(),
            packet: Some(Packet::data(0, data)),
            ..Default::default()
        }
    }

    /// Routing discriminant. `None` marks a spurious frame that must not be routed.
    pub fn kind(&self) -> Option<MessageKind> {
        if !self.error.is_empty() {
            Some(MessageKind::Error)
        } else if self.app_image.is_some() {
            Some(MessageKind::AppImage)
        } else if !self.status_session_id.is_empty() || self.status.is_some() {
            Some(MessageKind::Status)
        } else if !self.file_session_id.is_empty() {
            Some(MessageKind::FileSession)
        } else if !self.registry_server_address.is_empty() {
            Some(MessageKind::Credential)
        } else if !self.read_file.is_empty() {
            Some(MessageKind::ReadFile)
        } else {
            None
        }
    }

    /// A copy safe for logging.
    pub fn redacted(&self) -> Message {
        let mut copy = self.clone();
        if copy.registry_auth.is_some() {
            copy.registry_auth = Some(RegistryAuth::redacted());
        }
        copy
    }

    /// Serialize for one physical frame, compressing file data when asked to.
    pub fn encode(&self) -> Result<String, CoreError> {
        let compressible = self.compress
            && self
                .packet
                .as_ref()
                .is_some_and(|p| p.kind == PacketType::Data && !p.data.is_empty());
        if !compressible {
            return Ok(serde_json::to_string(self)?);
        }

        let mut wire = self.clone();
        if let Some(packet) = wire.packet.as_mut() {
            let raw = std::mem::take(&mut packet.data);
            wire.packet_data =
                zstd::encode_all(raw.as_slice(), 0).map_err(CoreError::Compression)?;
        }
        Ok(serde_json::to_string(&wire)?)
    }

    /// Parse one physical frame, restoring compressed file data.
    pub fn decode(frame: &str) -> Result<Message, CoreError> {
        let mut msg: Message = serde_json::from_str(frame)?;
        if msg.packet_data.is_empty() {
            return Ok(msg);
        }

        let compressed = std::mem::take(&mut msg.packet_data);
        let packet = msg.packet.as_mut().ok_or(CoreError::OrphanPacketData)?;
        packet.data = zstd::decode_all(compressed.as_slice()).map_err(CoreError::Compression)?;
        Ok(msg)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(&self.redacted()) {
            Ok(s) => f.write_str(&s),
            Err(_) => write!(f, "{:?}", self.redacted()),
        }
    }
}

/// Parameters announced at the start of a file-sync session.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SyncOptions {
    pub context: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub additional_contexts: BTreeMap<String, String>,
    pub dockerfile: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub dockerfile_contents: String,
    pub override_excludes: Vec<String>,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub follow_paths: Vec<String>,
    pub dir_name: Vec<String>,
    pub exporter_meta_prefix: Vec<String>,
    pub compress: bool,
}

/// A batch of build progress events.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SolveStatus {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub vertexes: Vec<Vertex>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<VertexLog>,
}

/// One step of a build.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Vertex {
    pub digest: String,
    pub name: String,
    pub started: bool,
    pub completed: bool,
    pub cached: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// Output written by a build step.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VertexLog {
    pub vertex: String,
    pub stream: u32,
    #[serde(with = "crate::base64_bytes")]
    pub data: Vec<u8>,
}
