use super::{
    CONTEXT_DIR, DOCKERFILE_DIR, DirSource, PacketStream, PathFilter, SyncedDir,
    reset_uid_and_gid, send_dir,
};
use crate::broadcast::Subscription;
use crate::error::SyncError;
use crate::transport::Messages;
use async_trait::async_trait;
use buildlink_core::{Message, Packet, SyncOptions};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::task::JoinHandle;

/// Local files never offered to the executor.
const IGNORED_LOCAL_FILES: &[&str] = &[".dockerignore"];

/// Client-side responder for one file session.
pub struct FileSyncClient {
    // Held so an inline dockerfile outlives the session.
    _scratch: Option<TempDir>,
    task: JoinHandle<()>,
}

impl FileSyncClient {
    /// Prepare the requested directories and start sending them. Runs inside
    /// the transport's message handler, so the session subscription exists
    /// before the announcement is delivered to anyone.
    pub fn start(
        cwd: &Path,
        session_id: &str,
        messages: Arc<dyn Messages>,
        options: &SyncOptions,
    ) -> Result<Self, SyncError> {
        let (scratch, dirs) = create_file_map_input(cwd, options)?;
        let synced = prepare_synced_dirs(&dirs, &options.dir_name, &options.follow_paths)?;

        let filter = PathFilter::new(
            options
                .include_patterns
                .iter()
                .chain(&options.follow_paths),
            exclude_patterns(options).iter(),
        );
        let dir_name = options
            .dir_name
            .first()
            .cloned()
            .unwrap_or_else(|| CONTEXT_DIR.to_string());

        let mut stream = BusPacketStream {
            session_id: session_id.to_string(),
            inbound: messages.recv(),
            messages: messages.clone(),
            compress: options.compress,
        };
        let session = session_id.to_string();
        tracing::debug!(session = %session, dir = %dir_name, "serving file session");

        let task = tokio::spawn(async move {
            let result = match synced.get(&dir_name) {
                Some(dir) => send_dir(dir, &filter, &mut stream).await,
                None => {
                    let err = SyncError::UnknownDir(dir_name.clone());
                    let _ = stream.send(Packet::err(err.to_string())).await;
                    Err(err)
                }
            };
            if let Err(e) = result {
                tracing::error!(session = %session, error = %e, "failed to sync files");
                messages.close().await;
            }
            if let Err(e) = messages.send(&Message::file_session_close(&session)).await {
                tracing::debug!(session = %session, error = %e, "closing file session");
            }
        });

        Ok(Self {
            _scratch: scratch,
            task,
        })
    }

}

/// Dropping a syncer stops it and removes any scratch files.
impl Drop for FileSyncClient {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct BusPacketStream {
    session_id: String,
    messages: Arc<dyn Messages>,
    inbound: Subscription<Arc<Message>>,
    compress: bool,
}

#[async_trait]
impl PacketStream for BusPacketStream {
    async fn send(&mut self, packet: Packet) -> Result<(), SyncError> {
        let msg = Message::file_packet(&self.session_id, packet, self.compress);
        self.messages.send(&msg).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Packet>, SyncError> {
        while let Some(msg) = self.inbound.recv().await {
            if msg.file_session_id != self.session_id {
                continue;
            }
            if let Some(packet) = &msg.packet {
                return Ok(Some(packet.clone()));
            }
        }
        Ok(None)
    }
}

/// Override excludes, when given, replace the excludes read from the build.
fn exclude_patterns(options: &SyncOptions) -> &[String] {
    if options.override_excludes.is_empty() {
        &options.exclude_patterns
    } else {
        &options.override_excludes
    }
}

/// Map directory names to local paths, writing an inline dockerfile to a
/// scratch directory when one is given.
fn create_file_map_input(
    cwd: &Path,
    options: &SyncOptions,
) -> Result<(Option<TempDir>, BTreeMap<String, PathBuf>), SyncError> {
    let context = cwd.join(&options.context);
    let mut dockerfile_dir = if options.dockerfile.is_empty() {
        context.clone()
    } else {
        cwd.join(&options.dockerfile)
            .parent()
            .map_or_else(|| cwd.to_path_buf(), Path::to_path_buf)
    };

    let mut scratch = None;
    if !options.dockerfile_contents.is_empty() {
        let dir = tempfile::Builder::new().prefix("buildlink").tempdir()?;
        std::fs::write(dir.path().join("Dockerfile"), &options.dockerfile_contents)?;
        dockerfile_dir = dir.path().to_path_buf();
        scratch = Some(dir);
    }

    let mut dirs = BTreeMap::new();
    if let Some(first) = options.dir_name.first() {
        if first == CONTEXT_DIR {
            dirs.insert(CONTEXT_DIR.to_string(), context);
        } else if let Some(dir) = options.additional_contexts.get(first) {
            dirs.insert(first.clone(), cwd.join(dir));
        }
    }
    dirs.insert(DOCKERFILE_DIR.to_string(), dockerfile_dir);
    Ok((scratch, dirs))
}

/// Check (or create) every directory about to be synced, along with any
/// missing follow paths below it.
fn prepare_synced_dirs(
    dirs: &BTreeMap<String, PathBuf>,
    dir_names: &[String],
    follow_paths: &[String],
) -> Result<DirSource, SyncError> {
    let mut synced = DirSource::new();
    for (name, dir) in dirs {
        match std::fs::metadata(dir) {
            Ok(meta) if !meta.is_dir() => {
                return Err(SyncError::NotADirectory(dir.display().to_string()));
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                std::fs::create_dir_all(dir)?;
            }
            Err(source) => {
                return Err(SyncError::Stat {
                    path: dir.display().to_string(),
                    source,
                });
            }
        }

        if name != DOCKERFILE_DIR && dir_names.contains(name) {
            for path in follow_paths {
                if path.contains(['*', '?']) || IGNORED_LOCAL_FILES.contains(&path.as_str()) {
                    continue;
                }
                let full = dir.join(path);
                if !full.exists() {
                    std::fs::create_dir_all(full)?;
                }
            }
        }

        synced.insert(
            name.clone(),
            SyncedDir {
                dir: dir.clone(),
                map: Some(reset_uid_and_gid),
            },
        );
    }
    Ok(synced)
}
