//! Connection-side machinery for buildlink.
//!
//! Everything here runs over one physical websocket:
//!
//! - [`Broadcaster`]: fans inbound messages out to every subscriber.
//! - [`WebsocketMessages`]: the duplex transport behind the [`Messages`] trait.
//! - [`filesync`]: directory sync sessions tunnelled over the transport.
//! - [`BuildClient`]: the build client's main loop.
//!
//! The executor side uses the same transport and [`filesync::FileServer`].

mod broadcast;
mod client;
mod error;
pub mod filesync;
mod transport;

pub use broadcast::{Broadcaster, SUBSCRIPTION_CAPACITY, Subscription};
pub use client::{
    BuildClient, CredentialLookup, LogProgress, Progress, StaticCredentials, ws_url,
};
pub use error::{BoxError, ClientError, HandlerError, SyncError, TransportError};
pub use transport::{MessageHandler, Messages, WebsocketMessages};
