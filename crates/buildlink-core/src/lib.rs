//! Core types for buildlink.
//!
//! This crate provides the protocol primitives shared by the build client and
//! the build executor: the wire `Message` envelope, directory-sync packets,
//! progress events, and the build/app-image records carried by tokens and
//! results. It performs no I/O.

mod build;
mod error;
mod image;
mod message;
mod packet;
mod registry;

pub use build::{BuildRequest, BuildSpec, ImageBuild};
pub use error::CoreError;
pub use image::{AppImage, ImageData, Platform, PlatformParseError, RegistryAuth};
pub use message::{Message, MessageKind, SolveStatus, SyncOptions, Vertex, VertexLog};
pub use packet::{Packet, PacketType, Stat};
pub use registry::normalize_server_address;

/// Request header carrying the sealed build token.
pub const BUILD_TOKEN_HEADER: &str = "x-acorn-build-token";

/// Base64 (standard alphabet) encoding for byte fields in JSON frames.
pub(crate) mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}
