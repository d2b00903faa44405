use super::{PacketChannel, SyncRequest};
use crate::error::SyncError;
use crate::transport::Messages;
use buildlink_core::{ImageBuild, Message, SyncOptions};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Executor-side bridge for one image build: each [`diff_copy`](Self::diff_copy)
/// call asks the client to send a directory and relays the session.
pub struct FileServer {
    messages: Arc<dyn Messages>,
    context: String,
    additional_contexts: BTreeMap<String, String>,
    dockerfile: String,
    dockerfile_contents: String,
}

impl FileServer {
    pub fn new(messages: Arc<dyn Messages>, build: &ImageBuild) -> Self {
        Self {
            messages,
            context: build.context.clone(),
            additional_contexts: build.additional_contexts.clone(),
            dockerfile: build.dockerfile.clone(),
            dockerfile_contents: build.dockerfile_contents.clone(),
        }
    }

    fn sync_options(&self, request: SyncRequest) -> SyncOptions {
        SyncOptions {
            context: self.context.clone(),
            additional_contexts: self.additional_contexts.clone(),
            dockerfile: self.dockerfile.clone(),
            dockerfile_contents: self.dockerfile_contents.clone(),
            override_excludes: request.override_excludes,
            include_patterns: request.include_patterns,
            exclude_patterns: request.exclude_patterns,
            follow_paths: request.follow_paths,
            dir_name: request.dir_name,
            exporter_meta_prefix: request.exporter_meta_prefix,
            compress: true,
        }
    }

    /// Open a session and relay packets between `local` and the client until
    /// the client closes the session or the bus ends.
    pub async fn diff_copy(
        &self,
        request: SyncRequest,
        local: PacketChannel,
    ) -> Result<(), SyncError> {
        let session_id = uuid::Uuid::new_v4().to_string();
        // Subscribe before announcing so no reply can be missed.
        let mut inbound = self.messages.recv();

        let options = self.sync_options(request);
        tracing::debug!(session = %session_id, dirs = ?options.dir_name, "starting file session");
        self.messages
            .send(&Message::file_session_start(&session_id, options))
            .await?;

        let (to_local, mut from_local) = local.into_parts();
        let messages = self.messages.clone();
        let outbound_session = session_id.clone();
        let forward = tokio::spawn(async move {
            while let Some(packet) = from_local.recv().await {
                let msg = Message::file_packet(&outbound_session, packet, false);
                if let Err(e) = messages.send(&msg).await {
                    tracing::debug!(session = %outbound_session, error = %e, "forwarding packet");
                    break;
                }
            }
        });

        while let Some(msg) = inbound.recv().await {
            if msg.file_session_id != session_id {
                continue;
            }
            if msg.file_session_close {
                tracing::debug!(session = %session_id, "file session closed by client");
                break;
            }
            if let Some(packet) = &msg.packet {
                // The local side may already be done; later packets are dropped.
                let _ = to_local.send(packet.clone()).await;
            }
        }

        forward.abort();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::{PacketStream, packet_pipe};
    use super::*;
    use crate::transport::testing::pair;
    use buildlink_core::Packet;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn relays_one_session_in_order() {
        let (client, server) = pair().await;
        let cancel = CancellationToken::new();
        let mut announcements = client.recv();
        client.start(&cancel);
        server.start(&cancel);

        let files = FileServer::new(server.clone(), &ImageBuild::new(".", "Dockerfile"));
        let (local, mut responder) = packet_pipe(32);
        let relay =
            tokio::spawn(async move { files.diff_copy(SyncRequest::dir("context"), local).await });

        let start = announcements.recv().await.unwrap();
        let options = start.sync_options.clone().unwrap();
        assert!(options.compress);
        assert_eq!(options.dir_name, vec!["context".to_string()]);
        let session = start.file_session_id.clone();

        // Unrelated traffic for another session is ignored.
        client
            .send(&Message::file_packet("other", Packet::fin(), false))
            .await
            .unwrap();
        for i in 1..=5u32 {
            client
                .send(&Message::file_packet(&session, Packet::data(i, vec![i as u8]), true))
                .await
                .unwrap();
        }
        client
            .send(&Message::file_session_close(&session))
            .await
            .unwrap();

        for i in 1..=5u32 {
            let packet = responder.recv().await.unwrap().unwrap();
            assert_eq!(packet.id, i);
            assert_eq!(packet.data, vec![i as u8]);
        }
        tokio::time::timeout(Duration::from_secs(5), relay)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        // Packets from the local side reach the client tagged with the session.
        let (local, mut responder) = packet_pipe(4);
        let files = FileServer::new(server.clone(), &ImageBuild::new(".", "Dockerfile"));
        let relay =
            tokio::spawn(async move { files.diff_copy(SyncRequest::dir("context"), local).await });
        let start = announcements.recv().await.unwrap();
        responder.send(Packet::request(3)).await.unwrap();
        let req = announcements.recv().await.unwrap();
        assert_eq!(req.file_session_id, start.file_session_id);
        assert_eq!(req.packet, Some(Packet::request(3)));

        server.close().await;
        tokio::time::timeout(Duration::from_secs(5), relay)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
