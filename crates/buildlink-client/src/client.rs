//! The build client: drives one remote build over one connection.

use crate::error::{BoxError, ClientError, TransportError};
use crate::filesync::FileSyncClient;
use crate::transport::{Messages, WebsocketMessages};
use async_trait::async_trait;
use buildlink_core::{
    AppImage, BUILD_TOKEN_HEADER, Message, MessageKind, RegistryAuth, SolveStatus,
    normalize_server_address,
};
use std::collections::{BTreeSet, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_util::sync::CancellationToken;

/// Answers the executor's registry credential requests from local storage.
#[async_trait]
pub trait CredentialLookup: Send + Sync {
    /// `Ok(None)` when nothing is stored for this host.
    async fn lookup(&self, server_address: &str) -> Result<Option<RegistryAuth>, BoxError>;
}

/// Fixed credentials keyed by registry host.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    entries: HashMap<String, RegistryAuth>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, server_address: &str, auth: RegistryAuth) {
        self.entries
            .insert(normalize_server_address(server_address), auth);
    }
}

#[async_trait]
impl CredentialLookup for StaticCredentials {
    async fn lookup(&self, server_address: &str) -> Result<Option<RegistryAuth>, BoxError> {
        Ok(self
            .entries
            .get(&normalize_server_address(server_address))
            .cloned())
    }
}

/// Receives build progress as it streams in.
pub trait Progress: Send {
    fn display(&mut self, session_id: &str, status: &SolveStatus);

    /// Called once at the end of a build with every registry answered from
    /// local credentials.
    fn credentials_used(&mut self, hosts: &[String]) {
        tracing::info!(hosts = %hosts.join(", "), "used local credentials");
    }
}

/// Writes progress to the log.
#[derive(Debug, Default)]
pub struct LogProgress;

impl Progress for LogProgress {
    fn display(&mut self, session_id: &str, status: &SolveStatus) {
        for vertex in &status.vertexes {
            let step = vertex.name.as_str();
            if !vertex.error.is_empty() {
                tracing::warn!(session = session_id, step, error = %vertex.error, "build step failed");
            } else if vertex.completed {
                tracing::info!(session = session_id, step, cached = vertex.cached, "build step done");
            } else if vertex.started {
                tracing::debug!(session = session_id, step, "build step started");
            }
        }
        for log in &status.logs {
            let output = String::from_utf8_lossy(&log.data);
            tracing::debug!(session = session_id, vertex = %log.vertex, "{}", output.trim_end());
        }
    }
}

/// Rewrite an http(s) URL to the matching ws(s) scheme.
pub fn ws_url(url: &str) -> String {
    match url.strip_prefix("http") {
        Some(rest) => format!("ws{rest}"),
        None => url.to_string(),
    }
}

type Syncers = Arc<Mutex<HashMap<String, FileSyncClient>>>;

pub struct BuildClient {
    cwd: PathBuf,
    credentials: Option<Arc<dyn CredentialLookup>>,
}

impl BuildClient {
    /// Build from `cwd`: synced directories and read-file requests resolve
    /// against it.
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            credentials: None,
        }
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialLookup>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Dial the executor at `build_url` presenting `token`, then run the build.
    pub async fn connect(
        &self,
        build_url: &str,
        token: &str,
        progress: &mut dyn Progress,
        cancel: &CancellationToken,
    ) -> Result<AppImage, ClientError> {
        let mut request = ws_url(build_url)
            .into_client_request()
            .map_err(TransportError::from)?;
        let token = HeaderValue::from_str(token)
            .map_err(|e| TransportError::Connection(format!("invalid token: {e}")))?;
        request.headers_mut().insert(BUILD_TOKEN_HEADER, token);

        let ws = match tokio_tungstenite::connect_async(request).await {
            Ok((ws, _)) => ws,
            Err(tungstenite::Error::Http(response)) => {
                let body = response
                    .body()
                    .as_deref()
                    .map(|b| String::from_utf8_lossy(b).trim().to_string())
                    .unwrap_or_default();
                return Err(ClientError::Rejected {
                    status: response.status().as_u16(),
                    body,
                });
            }
            Err(e) => return Err(TransportError::from(e).into()),
        };
        tracing::debug!(url = build_url, "connected to builder");

        self.run(WebsocketMessages::from_websocket(ws), progress, cancel)
            .await
    }

    /// Serve one build over an established transport. Returns the app image,
    /// the executor's error verbatim, or [`ClientError::BuildFailed`] when the
    /// connection ends with neither.
    pub async fn run(
        &self,
        messages: Arc<WebsocketMessages>,
        progress: &mut dyn Progress,
        cancel: &CancellationToken,
    ) -> Result<AppImage, ClientError> {
        let syncers = Syncers::default();
        let mut inbound = messages.recv();

        // Sessions are created synchronously so a syncer subscribes before
        // the session's first packet can be delivered.
        let bus: Arc<dyn Messages> = messages.clone();
        let registry = syncers.clone();
        let cwd = self.cwd.clone();
        messages.on_message(Box::new(move |msg| {
            if msg.file_session_id.is_empty() {
                return Ok(());
            }
            let mut syncers = registry.lock().unwrap_or_else(PoisonError::into_inner);
            if syncers.contains_key(&msg.file_session_id) {
                return Ok(());
            }
            let Some(options) = &msg.sync_options else {
                tracing::debug!(session = %msg.file_session_id, "dropping frame for unknown file session");
                return Ok(());
            };
            let syncer = FileSyncClient::start(&cwd, &msg.file_session_id, bus.clone(), options)?;
            syncers.insert(msg.file_session_id.clone(), syncer);
            Ok(())
        }))?;
        messages.start(cancel);

        let mut hits = BTreeSet::new();
        let mut result = Err(ClientError::BuildFailed);
        while let Some(msg) = inbound.recv().await {
            match self.handle(&*messages, &msg, progress, &mut hits).await {
                Ok(Some(image)) => {
                    result = Ok(image);
                    break;
                }
                Ok(None) => {}
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }

        inbound.close();
        messages.close().await;
        syncers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        if !hits.is_empty() {
            progress.credentials_used(&hits.into_iter().collect::<Vec<_>>());
        }
        result
    }

    async fn handle(
        &self,
        messages: &dyn Messages,
        msg: &Message,
        progress: &mut dyn Progress,
        hits: &mut BTreeSet<String>,
    ) -> Result<Option<AppImage>, ClientError> {
        match msg.kind() {
            Some(MessageKind::Status) => {
                if let Some(status) = &msg.status {
                    progress.display(&msg.status_session_id, status);
                }
            }
            Some(MessageKind::AppImage) => return Ok(msg.app_image.clone()),
            Some(MessageKind::Credential) => {
                let address = &msg.registry_server_address;
                let auth = self.lookup_credential(address).await;
                if auth.is_some() {
                    hits.insert(address.clone());
                }
                messages
                    .send(&Message::credential_response(address, auth))
                    .await?;
            }
            Some(MessageKind::ReadFile) => {
                let data = self.read_file(&msg.read_file).await?;
                messages
                    .send(&Message::read_file_response(&msg.read_file, data))
                    .await?;
            }
            Some(MessageKind::Error) => return Err(ClientError::Build(msg.error.clone())),
            Some(MessageKind::FileSession) | None => {}
        }
        Ok(None)
    }

    async fn lookup_credential(&self, address: &str) -> Option<RegistryAuth> {
        let credentials = self.credentials.as_ref()?;
        match credentials.lookup(address).await {
            Ok(auth) => auth,
            Err(e) => {
                tracing::error!(host = address, error = %e, "failed to look up credential");
                None
            }
        }
    }

    async fn read_file(&self, rel: &str) -> Result<Vec<u8>, ClientError> {
        let inside = Path::new(rel)
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !inside {
            return Err(ClientError::ReadFile {
                path: rel.to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "path leaves the working directory",
                ),
            });
        }
        tokio::fs::read(self.cwd.join(rel))
            .await
            .map_err(|source| ClientError::ReadFile {
                path: rel.to_string(),
                source,
            })
    }
}
