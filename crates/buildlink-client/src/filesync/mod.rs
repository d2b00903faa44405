//! Directory sync tunnelled over the shared transport.
//!
//! The executor side ([`FileServer`]) opens a session per directory request
//! and relays packets between its local receiver and the bus. The client side
//! ([`FileSyncClient`]) answers each session by sending the requested
//! directory from its working tree.

mod client;
mod diffcopy;
mod patterns;
mod server;

pub use client::FileSyncClient;
pub use diffcopy::{receive_dir, send_dir};
pub use patterns::PathFilter;
pub use server::FileServer;

use crate::error::SyncError;
use async_trait::async_trait;
use buildlink_core::{Packet, Stat};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::mpsc;

/// Name of the directory holding the build context.
pub const CONTEXT_DIR: &str = "context";
/// Name of the directory holding the dockerfile.
pub const DOCKERFILE_DIR: &str = "dockerfile";

/// A bidirectional stream of sync packets.
#[async_trait]
pub trait PacketStream: Send {
    async fn send(&mut self, packet: Packet) -> Result<(), SyncError>;
    /// `Ok(None)` once the peer is gone.
    async fn recv(&mut self) -> Result<Option<Packet>, SyncError>;
}

/// One end of an in-process packet pipe.
pub struct PacketChannel {
    tx: mpsc::Sender<Packet>,
    rx: mpsc::Receiver<Packet>,
}

impl PacketChannel {
    pub fn into_parts(self) -> (mpsc::Sender<Packet>, mpsc::Receiver<Packet>) {
        (self.tx, self.rx)
    }
}

/// Two connected packet channels.
pub fn packet_pipe(capacity: usize) -> (PacketChannel, PacketChannel) {
    let (a_tx, b_rx) = mpsc::channel(capacity);
    let (b_tx, a_rx) = mpsc::channel(capacity);
    (
        PacketChannel { tx: a_tx, rx: a_rx },
        PacketChannel { tx: b_tx, rx: b_rx },
    )
}

#[async_trait]
impl PacketStream for PacketChannel {
    async fn send(&mut self, packet: Packet) -> Result<(), SyncError> {
        self.tx
            .send(packet)
            .await
            .map_err(|_| SyncError::Disconnected)
    }

    async fn recv(&mut self) -> Result<Option<Packet>, SyncError> {
        Ok(self.rx.recv().await)
    }
}

/// Rewrites an entry before it is listed; returning false drops it.
pub type StatMap = fn(&mut Stat) -> bool;

/// Sent entries are owned by root on the receiving side.
pub fn reset_uid_and_gid(stat: &mut Stat) -> bool {
    stat.uid = 0;
    stat.gid = 0;
    true
}

/// A local directory offered for syncing.
#[derive(Debug, Clone)]
pub struct SyncedDir {
    pub dir: PathBuf,
    pub map: Option<StatMap>,
}

/// Synced directories by name.
pub type DirSource = BTreeMap<String, SyncedDir>;

/// What the build engine asks for when it opens a sync session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncRequest {
    pub override_excludes: Vec<String>,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub follow_paths: Vec<String>,
    pub dir_name: Vec<String>,
    pub exporter_meta_prefix: Vec<String>,
}

impl SyncRequest {
    /// Request the whole of one named directory.
    pub fn dir(name: impl Into<String>) -> Self {
        Self {
            dir_name: vec![name.into()],
            ..Default::default()
        }
    }
}
