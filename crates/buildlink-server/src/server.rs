//! HTTP front end of the build executor.
//!
//! `GET /ping` answers `pong`. Every other path verifies the build token and
//! upgrades to the websocket that carries the whole build.

use crate::build::Builder;
use crate::config::ServerConfig;
use crate::error::{BuildError, ServerError};
use crate::keychain::{DEFAULT_CREDENTIAL_TIMEOUT, Keychain, RemoteKeychain, StaticKeychain};
use crate::token::{KeyPair, Token, TokenVerifier, token_from_headers};
use axum::Router;
use axum::extract::State;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message as Frame, WebSocket, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::get;
use buildlink_client::{Messages, TransportError, WebsocketMessages};
use buildlink_core::Message;
use futures_util::{SinkExt, StreamExt, TryStreamExt, future};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Shared state for every connection.
pub struct AppState {
    verifier: TokenVerifier,
    builder: Builder,
    namespace: Option<String>,
    push_repo: String,
    fallback: Arc<dyn Keychain>,
    credential_timeout: Duration,
}

impl AppState {
    pub fn new(verifier: TokenVerifier, builder: Builder) -> Self {
        Self {
            verifier,
            builder,
            namespace: None,
            push_repo: String::new(),
            fallback: Arc::new(StaticKeychain::default()),
            credential_timeout: DEFAULT_CREDENTIAL_TIMEOUT,
        }
    }

    pub fn from_config(config: &ServerConfig, keys: &KeyPair, builder: Builder) -> Self {
        let mut state = Self::new(TokenVerifier::new(&config.builder_uuid, keys), builder)
            .with_push_repo(&config.push_repo)
            .with_fallback(Arc::new(config.fallback_keychain()))
            .with_credential_timeout(config.credential_timeout());
        if let Some(namespace) = config.namespace.as_deref().filter(|ns| !ns.is_empty()) {
            state = state.with_namespace(namespace);
        }
        state
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_push_repo(mut self, push_repo: impl Into<String>) -> Self {
        self.push_repo = push_repo.into();
        self
    }

    pub fn with_fallback(mut self, keychain: Arc<dyn Keychain>) -> Self {
        self.fallback = keychain;
        self
    }

    pub fn with_credential_timeout(mut self, timeout: Duration) -> Self {
        self.credential_timeout = timeout;
        self
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .fallback(build)
        .with_state(state)
}

/// Serve until the listener fails.
pub async fn serve(listener: tokio::net::TcpListener, state: Arc<AppState>) -> anyhow::Result<()> {
    tracing::info!("Listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn ping() -> &'static str {
    "pong"
}

async fn build(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, ServerError> {
    let token = admit(&state, &headers)?;
    let upgrade = upgrade.map_err(|e| ServerError::Upgrade(e.to_string()))?;

    tracing::info!(
        "Starting build [{}/{}] [{}]",
        token.build.namespace,
        token.build.name,
        token.build.uid
    );
    Ok(upgrade.on_upgrade(move |socket| run_build(state, token, socket)))
}

/// Verify the request's build token and apply the executor's namespace.
fn admit(state: &AppState, headers: &HeaderMap) -> Result<Token, ServerError> {
    let mut token = state.verifier.verify(token_from_headers(headers)?)?;
    if let Some(namespace) = &state.namespace {
        token.build.namespace = namespace.clone();
    }
    Ok(token)
}

async fn run_build(state: Arc<AppState>, token: Token, socket: WebSocket) {
    let messages = websocket_messages(socket);
    let cancel = CancellationToken::new();
    messages.start(&cancel);
    let bus: Arc<dyn Messages> = messages.clone();

    let result = execute(&state, &token, bus.clone()).await;
    let reply = match result {
        Ok(image) => {
            tracing::info!(
                build = %token.build.name,
                id = %image.id,
                "build finished"
            );
            Message::app_image(image)
        }
        Err(e) => {
            tracing::error!(build = %token.build.name, error = %e, "build failed");
            Message::error(e.to_string())
        }
    };
    if let Err(e) = bus.send(&reply).await {
        tracing::warn!(error = %e, "sending build result");
    }
    messages.close().await;
}

async fn execute(
    state: &AppState,
    token: &Token,
    bus: Arc<dyn Messages>,
) -> Result<buildlink_core::AppImage, BuildError> {
    let push_repo = if token.push_repo.is_empty() {
        state.push_repo.as_str()
    } else {
        token.push_repo.as_str()
    };
    if push_repo.is_empty() {
        return Err(BuildError::MissingPushRepo(token.build.name.clone()));
    }

    let keychain =
        RemoteKeychain::with_timeout(bus.clone(), state.fallback.clone(), state.credential_timeout);
    state
        .builder
        .build(bus, push_repo, &token.build.spec, &keychain)
        .await
}

/// Adapt an accepted axum websocket to the shared transport.
fn websocket_messages(socket: WebSocket) -> Arc<WebsocketMessages> {
    let (sink, stream) = socket.split();
    let sink = sink
        .sink_map_err(|e| TransportError::Connection(e.to_string()))
        .with(|text: String| future::ready(Ok::<_, TransportError>(Frame::Text(text.into()))));
    let stream = stream
        .map_err(|e| TransportError::Connection(e.to_string()))
        .try_take_while(|frame| future::ready(Ok(!matches!(frame, Frame::Close(_)))))
        .try_filter_map(|frame| {
            future::ready(Ok(match frame {
                Frame::Text(text) => Some(text.as_str().to_owned()),
                Frame::Binary(data) => String::from_utf8(data.to_vec()).ok(),
                _ => None,
            }))
        });
    WebsocketMessages::new(sink, stream)
}
