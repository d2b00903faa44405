//! Registry credentials for the executor.
//!
//! The executor never sees the client's credential store. When it needs to
//! talk to a registry it asks the client over the connection and waits for
//! the answer, falling back to its own keychain when the client has nothing.

use crate::error::BuildError;
use async_trait::async_trait;
use buildlink_client::Messages;
use buildlink_core::{Message, RegistryAuth, normalize_server_address};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// How long to wait for the client before using the fallback keychain.
pub const DEFAULT_CREDENTIAL_TIMEOUT: Duration = Duration::from_secs(15);

#[async_trait]
pub trait Keychain: Send + Sync {
    /// Credentials for a registry host, `None` for anonymous access.
    async fn resolve(&self, host: &str) -> Result<Option<RegistryAuth>, BuildError>;
}

/// Fixed credentials keyed by normalized registry host.
#[derive(Debug, Clone, Default)]
pub struct StaticKeychain {
    entries: HashMap<String, RegistryAuth>,
}

impl StaticKeychain {
    pub fn new(entries: impl IntoIterator<Item = (String, RegistryAuth)>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|(host, auth)| (normalize_server_address(&host), auth))
                .collect(),
        }
    }
}

#[async_trait]
impl Keychain for StaticKeychain {
    async fn resolve(&self, host: &str) -> Result<Option<RegistryAuth>, BuildError> {
        Ok(self.entries.get(&normalize_server_address(host)).cloned())
    }
}

#[derive(Default)]
struct Answers {
    entries: HashMap<String, Option<RegistryAuth>>,
    closed: bool,
}

/// Asks the client for credentials, once per host.
pub struct RemoteKeychain {
    messages: Arc<dyn Messages>,
    answers: watch::Sender<Answers>,
    sent: Mutex<HashSet<String>>,
    next: Arc<dyn Keychain>,
    timeout: Duration,
    listener: JoinHandle<()>,
}

impl RemoteKeychain {
    pub fn new(messages: Arc<dyn Messages>, next: Arc<dyn Keychain>) -> Self {
        Self::with_timeout(messages, next, DEFAULT_CREDENTIAL_TIMEOUT)
    }

    pub fn with_timeout(
        messages: Arc<dyn Messages>,
        next: Arc<dyn Keychain>,
        timeout: Duration,
    ) -> Self {
        let (answers, _) = watch::channel(Answers::default());
        let mut inbound = messages.recv();
        let writer = answers.clone();
        let listener = tokio::spawn(async move {
            while let Some(msg) = inbound.recv().await {
                if msg.registry_server_address.is_empty() {
                    continue;
                }
                writer.send_modify(|answers| {
                    answers
                        .entries
                        .insert(msg.registry_server_address.clone(), msg.registry_auth.clone());
                });
            }
            tracing::debug!("credential listener finished");
            writer.send_modify(|answers| answers.closed = true);
        });

        Self {
            messages,
            answers,
            sent: Mutex::new(HashSet::new()),
            next,
            timeout,
            listener,
        }
    }
}

impl Drop for RemoteKeychain {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

#[async_trait]
impl Keychain for RemoteKeychain {
    async fn resolve(&self, host: &str) -> Result<Option<RegistryAuth>, BuildError> {
        let address = normalize_server_address(host);
        let mut answers = self.answers.subscribe();

        let known = answers.borrow().entries.contains_key(&address);
        if !known {
            let first = self
                .sent
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(address.clone());
            if first {
                tracing::debug!(host = %address, "requesting credentials from client");
                self.messages
                    .send(&Message::credential_request(&address))
                    .await?;
            }
        }

        let answered = answers.wait_for(|a| a.closed || a.entries.contains_key(&address));
        let answer = match tokio::time::timeout(self.timeout, answered).await {
            Ok(Ok(state)) => state.entries.get(&address).cloned(),
            Ok(Err(_)) => None,
            Err(_) => {
                tracing::debug!(host = %address, "timed out waiting for credentials");
                Some(None)
            }
        };

        match answer {
            Some(Some(auth)) => {
                tracing::debug!(
                    host = %address,
                    username = %auth.username,
                    password_len = auth.password.len(),
                    "credentials resolved by client"
                );
                Ok(Some(auth))
            }
            Some(None) => self.next.resolve(&address).await,
            None => Err(BuildError::CredentialsUnavailable(address)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::connected;
    use buildlink_core::MessageKind;
    use tokio_util::sync::CancellationToken;

    fn fallback() -> Arc<dyn Keychain> {
        Arc::new(StaticKeychain::new([(
            "ghcr.io".to_string(),
            RegistryAuth::new("robot", "fallback"),
        )]))
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_request() {
        let (client, executor) = connected().await;
        let cancel = CancellationToken::new();
        let mut requests = client.recv();
        client.start(&cancel);
        executor.start(&cancel);

        let keychain = Arc::new(RemoteKeychain::new(executor.clone(), fallback()));
        let callers: Vec<_> = (0..5)
            .map(|_| {
                let keychain = keychain.clone();
                tokio::spawn(async move { keychain.resolve("docker.io").await })
            })
            .collect();

        let request = requests.recv().await.unwrap();
        assert_eq!(request.kind(), Some(MessageKind::Credential));
        assert_eq!(request.registry_server_address, "index.docker.io");
        client
            .send(&Message::credential_response(
                "index.docker.io",
                Some(RegistryAuth::new("bob", "hunter2")),
            ))
            .await
            .unwrap();

        for caller in callers {
            let auth = caller.await.unwrap().unwrap();
            assert_eq!(auth, Some(RegistryAuth::new("bob", "hunter2")));
        }

        // Later lookups are answered from the map without asking again.
        let again = keychain.resolve("registry-1.docker.io").await.unwrap();
        assert_eq!(again, Some(RegistryAuth::new("bob", "hunter2")));
        client.close().await;
        assert!(requests.recv().await.is_none());
    }

    #[tokio::test]
    async fn empty_answer_falls_through() {
        let (client, executor) = connected().await;
        let cancel = CancellationToken::new();
        let mut requests = client.recv();
        client.start(&cancel);
        executor.start(&cancel);

        let keychain = RemoteKeychain::new(executor.clone(), fallback());
        let responder = tokio::spawn(async move {
            let request = requests.recv().await.unwrap();
            client
                .send(&Message::credential_response(
                    &request.registry_server_address,
                    None,
                ))
                .await
                .unwrap();
        });

        let auth = keychain.resolve("ghcr.io").await.unwrap();
        assert_eq!(auth, Some(RegistryAuth::new("robot", "fallback")));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn silent_client_times_out_to_fallback() {
        let (client, executor) = connected().await;
        let cancel = CancellationToken::new();
        client.start(&cancel);
        executor.start(&cancel);

        let keychain =
            RemoteKeychain::with_timeout(executor.clone(), fallback(), Duration::from_millis(50));
        let auth = keychain.resolve("ghcr.io").await.unwrap();
        assert_eq!(auth, Some(RegistryAuth::new("robot", "fallback")));
        assert_eq!(keychain.resolve("quay.io").await.unwrap(), None);
    }

    #[tokio::test]
    async fn closed_connection_is_an_error() {
        let (client, executor) = connected().await;
        let cancel = CancellationToken::new();
        client.start(&cancel);
        executor.start(&cancel);

        let keychain = RemoteKeychain::new(executor.clone(), fallback());
        client.close().await;

        assert!(matches!(
            keychain.resolve("ghcr.io").await,
            Err(BuildError::CredentialsUnavailable(_)) | Err(BuildError::Transport(_))
        ));
    }
}
