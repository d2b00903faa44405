//! Build executor front end for buildlink.
//!
//! Accepts sealed build tokens over HTTP, upgrades to the shared websocket
//! transport, pulls build contexts from the client, resolves registry
//! credentials through the client, and answers with the assembled app image.

pub mod build;
pub mod config;
mod error;
pub mod keychain;
pub mod manifest;
pub mod server;
pub mod token;

pub use build::{BuildEngine, Builder, SolveJob, StagingEngine, StatusWriter};
pub use config::ServerConfig;
pub use error::{BuildError, ManifestError, ServerError, TokenError};
pub use keychain::{Keychain, RemoteKeychain, StaticKeychain};
pub use manifest::{MemoryRegistry, Reference, Registry};
pub use server::{AppState, router, serve};
pub use token::{KeyPair, Token, TokenVerifier};

#[cfg(test)]
pub(crate) mod testing {
    use buildlink_client::WebsocketMessages;
    use std::sync::Arc;
    use tokio_tungstenite::WebSocketStream;
    use tokio_tungstenite::tungstenite::protocol::Role;

    /// A client and an executor transport over an in-memory pipe, not yet started.
    pub(crate) async fn connected() -> (Arc<WebsocketMessages>, Arc<WebsocketMessages>) {
        let (a, b) = tokio::io::duplex(1 << 20);
        let (client, executor) = tokio::join!(
            WebSocketStream::from_raw_socket(a, Role::Client, None),
            WebSocketStream::from_raw_socket(b, Role::Server, None),
        );
        (
            WebsocketMessages::from_websocket(client),
            WebsocketMessages::from_websocket(executor),
        )
    }
}
