use buildlink_core::CoreError;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error type returned by synchronous message handlers.
pub type HandlerError = BoxError;

/// Errors from the duplex transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("connection error: {0}")]
    Connection(String),
    #[error(transparent)]
    Codec(#[from] CoreError),
    #[error("only one message handler is supported")]
    HandlerAlreadySet,
    #[error("message handler failed: {0}")]
    Handler(HandlerError),
}

/// Errors from a directory-sync session.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("could not find {path}: {source}")]
    Stat {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{0} not a directory")]
    NotADirectory(String),
    #[error("no synced directory named {0:?}")]
    UnknownDir(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unexpected packet: {0}")]
    Protocol(String),
    #[error("remote sync error: {0}")]
    Remote(String),
    #[error("sync stream ended before the session finished")]
    Disconnected,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Errors surfaced to the caller of a remote build.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("builder rejected connection: status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error("failed to read {path}: {source}")]
    ReadFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// Error reported by the executor, verbatim.
    #[error("{0}")]
    Build(String),
    #[error("build failed")]
    BuildFailed,
}
