//! Directory-sync frames.
//!
//! A sync session is a diff-copy conversation between a sender (the side that
//! owns the files) and a receiver:
//!
//! 1. The sender lists every entry as a `Stat` packet, ending with an empty
//!    `Stat` packet.
//! 2. The receiver asks for file contents with `Req` packets carrying the
//!    entry id (its index in the listing).
//! 3. The sender answers each request with `Data` packets followed by an
//!    empty `Data` packet.
//! 4. The receiver finishes with `Fin`; the sender acknowledges with `Fin`.
//!
//! Either side may abort with an `Err` packet whose data is a UTF-8 message.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacketType {
    #[default]
    Stat,
    Req,
    Data,
    Fin,
    Err,
}

/// Metadata for one synced entry.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Stat {
    /// Slash-separated path relative to the synced root.
    pub path: String,
    /// Unix mode bits, including the file type bits.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    /// Modification time in nanoseconds since the epoch.
    pub mod_time: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub linkname: String,
}

impl Stat {
    pub const MODE_TYPE_MASK: u32 = 0o170000;
    pub const MODE_DIR: u32 = 0o040000;
    pub const MODE_SYMLINK: u32 = 0o120000;

    pub fn is_dir(&self) -> bool {
        self.mode & Self::MODE_TYPE_MASK == Self::MODE_DIR
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & Self::MODE_TYPE_MASK == Self::MODE_SYMLINK
    }

    pub fn is_file(&self) -> bool {
        !self.is_dir() && !self.is_symlink()
    }

    /// Permission bits only.
    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }
}

/// One frame of the directory-sync protocol.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Packet {
    #[serde(rename = "type")]
    pub kind: PacketType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stat: Option<Stat>,
    #[serde(skip_serializing_if = "is_zero")]
    pub id: u32,
    #[serde(with = "crate::base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<u8>,
}

fn is_zero(id: &u32) -> bool {
    *id == 0
}

impl Packet {
    pub fn stat(stat: Stat) -> Self {
        Self {
            kind: PacketType::Stat,
            stat: Some(stat),
            ..Default::default()
        }
    }

    /// The empty `Stat` packet terminating a listing.
    pub fn end_of_listing() -> Self {
        Self {
            kind: PacketType::Stat,
            ..Default::default()
        }
    }

    pub fn request(id: u32) -> Self {
        Self {
            kind: PacketType::Req,
            id,
            ..Default::default()
        }
    }

    pub fn data(id: u32, data: Vec<u8>) -> Self {
        Self {
            kind: PacketType::Data,
            id,
            data,
            ..Default::default()
        }
    }

    pub fn fin() -> Self {
        Self {
            kind: PacketType::Fin,
            ..Default::default()
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            kind: PacketType::Err,
            data: message.into().into_bytes(),
            ..Default::default()
        }
    }

    /// The error text of an `Err` packet.
    pub fn error_message(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_classification() {
        let dir = Stat {
            mode: Stat::MODE_DIR | 0o755,
            ..Default::default()
        };
        assert!(dir.is_dir());
        assert!(!dir.is_file());
        assert_eq!(dir.permissions(), 0o755);

        let link = Stat {
            mode: Stat::MODE_SYMLINK | 0o777,
            linkname: "target".into(),
            ..Default::default()
        };
        assert!(link.is_symlink());

        let file = Stat {
            mode: 0o100644,
            ..Default::default()
        };
        assert!(file.is_file());
    }

    #[test]
    fn data_is_base64_on_the_wire() {
        let json = serde_json::to_string(&Packet::data(3, b"hi".to_vec())).unwrap();
        assert_eq!(json, r#"{"type":"data","id":3,"data":"aGk="}"#);
    }
}
