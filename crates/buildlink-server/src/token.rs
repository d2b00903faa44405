//! Single-use build tokens.
//!
//! A token is a JSON record sealed to the executor's public key with an
//! anonymous box, so the issuer needs no key of its own and only the target
//! executor can read it. Executors accept a token once, within a short window
//! of its issue time.

use crate::error::TokenError;
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use buildlink_core::{BUILD_TOKEN_HEADER, BuildRequest};
use crypto_box::aead::OsRng;
use crypto_box::{PublicKey, SecretKey};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use time::{Duration, OffsetDateTime};

/// How far a token's issue time may be from the verifier's clock.
pub const FRESHNESS_WINDOW: Duration = Duration::seconds(10);
/// How long a presented token is remembered.
pub const DEDUP_TTL: Duration = Duration::seconds(30);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    #[serde(rename = "builderUUID", default, skip_serializing_if = "String::is_empty")]
    pub builder_uuid: String,
    #[serde(with = "time::serde::rfc3339")]
    pub time: OffsetDateTime,
    #[serde(default)]
    pub build: BuildRequest,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub push_repo: String,
}

impl Token {
    /// A token issued now.
    pub fn new(
        builder_uuid: impl Into<String>,
        build: BuildRequest,
        push_repo: impl Into<String>,
    ) -> Self {
        Self {
            builder_uuid: builder_uuid.into(),
            time: OffsetDateTime::now_utc(),
            build,
            push_repo: push_repo.into(),
        }
    }

    /// Seal to `recipient`, returning the URL-safe token string.
    pub fn seal(&self, recipient: &PublicKey) -> Result<String, TokenError> {
        let plain = serde_json::to_vec(self)?;
        let sealed = recipient
            .seal(&mut OsRng, &plain)
            .map_err(|_| TokenError::Seal)?;
        Ok(URL_SAFE_NO_PAD.encode(sealed))
    }
}

/// An executor's key pair. Only the public half is handed to token issuers.
pub struct KeyPair {
    secret: SecretKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        Self {
            secret: SecretKey::generate(&mut OsRng),
        }
    }

    /// Load from the standard-base64 secret key.
    pub fn from_base64(secret: &str) -> Result<Self, TokenError> {
        Ok(Self {
            secret: SecretKey::from(decode_key(secret)?),
        })
    }

    pub fn public_key(&self) -> PublicKey {
        self.secret.public_key()
    }

    pub fn public_base64(&self) -> String {
        STANDARD.encode(self.public_key().as_bytes())
    }

    pub fn secret_base64(&self) -> String {
        STANDARD.encode(self.secret.to_bytes())
    }

    fn secret_key(&self) -> SecretKey {
        SecretKey::from(self.secret.to_bytes())
    }
}

pub fn public_key_from_base64(key: &str) -> Result<PublicKey, TokenError> {
    Ok(PublicKey::from(decode_key(key)?))
}

fn decode_key(key: &str) -> Result<[u8; 32], TokenError> {
    let bytes = STANDARD.decode(key.trim())?;
    <[u8; 32]>::try_from(bytes.as_slice())
        .map_err(|_| TokenError::Key(format!("expected 32 bytes, got {}", bytes.len())))
}

/// Checks presented tokens. One verifier holds the replay cache for its
/// whole process.
pub struct TokenVerifier {
    builder_uuid: String,
    secret: SecretKey,
    seen: Mutex<HashMap<Vec<u8>, OffsetDateTime>>,
}

impl TokenVerifier {
    /// An empty `builder_uuid` accepts tokens issued for any builder.
    pub fn new(builder_uuid: impl Into<String>, keys: &KeyPair) -> Self {
        Self {
            builder_uuid: builder_uuid.into(),
            secret: keys.secret_key(),
            seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn verify(&self, raw: &str) -> Result<Token, TokenError> {
        self.verify_at(raw, OffsetDateTime::now_utc())
    }

    pub fn verify_at(&self, raw: &str, now: OffsetDateTime) -> Result<Token, TokenError> {
        let sealed = URL_SAFE_NO_PAD.decode(raw.trim())?;
        {
            let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
            seen.retain(|_, at| now - *at < DEDUP_TTL);
            if seen.contains_key(&sealed) {
                return Err(TokenError::Duplicate);
            }
            seen.insert(sealed.clone(), now);
        }

        let plain = self
            .secret
            .unseal(&sealed)
            .map_err(|_| TokenError::Unsealed)?;
        let token: Token = serde_json::from_slice(&plain)?;

        if !self.builder_uuid.is_empty() && token.builder_uuid != self.builder_uuid {
            return Err(TokenError::BuilderMismatch {
                want: self.builder_uuid.clone(),
                got: token.builder_uuid,
            });
        }
        if (now - token.time).abs() > FRESHNESS_WINDOW {
            return Err(TokenError::Expired { issued: token.time });
        }
        Ok(token)
    }
}

/// The raw token from the build-token header, or a bearer authorization.
pub fn token_from_headers(headers: &HeaderMap) -> Result<&str, TokenError> {
    if let Some(value) = headers.get(BUILD_TOKEN_HEADER)
        && let Ok(token) = value.to_str()
        && !token.is_empty()
    {
        return Ok(token);
    }
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            let (scheme, token) = v.split_once(' ')?;
            scheme.eq_ignore_ascii_case("bearer").then_some(token.trim())
        })
        .filter(|t| !t.is_empty())
        .ok_or(TokenError::Missing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn request() -> BuildRequest {
        BuildRequest {
            name: "web".into(),
            namespace: "acorn".into(),
            uid: "1234".into(),
            ..Default::default()
        }
    }

    #[test]
    fn fresh_token_is_accepted_exactly_once() {
        let keys = KeyPair::generate();
        let verifier = TokenVerifier::new("builder-1", &keys);
        let token = Token::new("builder-1", request(), "registry.local/acorn/web");
        let raw = token.seal(&keys.public_key()).unwrap();

        let opened = verifier.verify(&raw).unwrap();
        assert_eq!(opened.build, request());
        assert_eq!(opened.push_repo, "registry.local/acorn/web");

        assert!(matches!(verifier.verify(&raw), Err(TokenError::Duplicate)));
    }

    #[test]
    fn resealed_token_expires_after_the_window() {
        let keys = KeyPair::generate();
        let verifier = TokenVerifier::new("", &keys);
        let token = Token::new("builder-1", request(), "");

        let first = token.seal(&keys.public_key()).unwrap();
        let second = token.seal(&keys.public_key()).unwrap();
        assert_ne!(first, second);

        verifier.verify_at(&first, token.time).unwrap();
        let later = token.time + Duration::seconds(11);
        assert!(matches!(
            verifier.verify_at(&second, later),
            Err(TokenError::Expired { .. })
        ));
    }

    #[test]
    fn replay_cache_forgets_after_ttl() {
        let keys = KeyPair::generate();
        let verifier = TokenVerifier::new("", &keys);
        let token = Token::new("", request(), "");
        let raw = token.seal(&keys.public_key()).unwrap();

        verifier.verify_at(&raw, token.time).unwrap();
        // Forgotten by the cache, but by then far too old anyway.
        let later = token.time + DEDUP_TTL + Duration::seconds(1);
        assert!(matches!(
            verifier.verify_at(&raw, later),
            Err(TokenError::Expired { .. })
        ));
    }

    #[test]
    fn wrong_key_and_wrong_builder_are_rejected() {
        let keys = KeyPair::generate();
        let other = KeyPair::generate();
        let verifier = TokenVerifier::new("builder-1", &keys);

        let raw = Token::new("builder-1", request(), "")
            .seal(&other.public_key())
            .unwrap();
        assert!(matches!(verifier.verify(&raw), Err(TokenError::Unsealed)));

        let raw = Token::new("builder-2", request(), "")
            .seal(&keys.public_key())
            .unwrap();
        assert!(matches!(
            verifier.verify(&raw),
            Err(TokenError::BuilderMismatch { .. })
        ));

        assert!(matches!(
            verifier.verify("!!not base64!!"),
            Err(TokenError::Encoding(_))
        ));
    }

    #[test]
    fn keys_survive_base64() {
        let keys = KeyPair::generate();
        let loaded = KeyPair::from_base64(&keys.secret_base64()).unwrap();
        assert_eq!(loaded.public_base64(), keys.public_base64());
        let public = public_key_from_base64(&keys.public_base64()).unwrap();
        assert_eq!(public.as_bytes(), keys.public_key().as_bytes());
        assert!(matches!(
            KeyPair::from_base64("c2hvcnQ="),
            Err(TokenError::Key(_))
        ));
    }

    #[test]
    fn token_header_then_bearer() {
        let mut headers = HeaderMap::new();
        assert!(matches!(
            token_from_headers(&headers),
            Err(TokenError::Missing)
        ));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(token_from_headers(&headers).unwrap(), "abc");

        headers.insert(BUILD_TOKEN_HEADER, HeaderValue::from_static("xyz"));
        assert_eq!(token_from_headers(&headers).unwrap(), "xyz");

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert!(token_from_headers(&headers).is_err());
    }
}
