//! Caller identity to notification channel.
//!
//! Every deferred task belongs to the channel of the caller that submitted
//! it. Status events for the task are published on that channel, and only
//! that channel may read the task's result.
//!
//! A [`ChannelResolver`] turns request parts into a channel name. The stock
//! resolver, [`BearerChannelResolver`], reads an `Authorization: Bearer`
//! token, hands it to a [`TokenVerifier`] and prefixes the verified subject:
//!
//! ```text
//! Authorization: Bearer eyJhbGciOi...   ──►  sub = "42"  ──►  "user:42"
//! ```

use crate::error::AppError;
use async_trait::async_trait;
use axum::http::{header::AUTHORIZATION, request::Parts, HeaderMap};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::collections::HashMap;
use thiserror::Error;

/// Default prefix of user channels.
pub const DEFAULT_CHANNEL_PREFIX: &str = "user:";

/// Channel resolution failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelNameError {
    /// The request carries no usable credentials.
    #[error("No valid token found in request for channel name resolution.")]
    NoIdentity,
}

impl From<ChannelNameError> for AppError {
    fn from(err: ChannelNameError) -> Self {
        Self::unauthorized(err.to_string())
    }
}

/// Maps a request to the caller's private channel.
#[async_trait]
pub trait ChannelResolver: Send + Sync {
    /// Resolve the channel of the caller that issued `parts`.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelNameError::NoIdentity`] when the caller cannot be
    /// identified.
    async fn resolve(&self, parts: &Parts) -> Result<String, ChannelNameError>;
}

/// Verifies a bearer token and returns its subject.
pub trait TokenVerifier: Send + Sync {
    /// Verify `token`.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelNameError::NoIdentity`] when the token is invalid.
    fn verify(&self, token: &str) -> Result<String, ChannelNameError>;
}

/// Claims read from a channel token.
#[derive(Debug, Deserialize)]
struct ChannelClaims {
    sub: String,
}

/// HS256 JWT verifier.
///
/// Expiry is validated; the subject (`sub`) identifies the caller.
#[derive(Clone)]
pub struct JwtVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    /// Create a verifier for tokens signed with `secret`.
    #[must_use]
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;

        Self {
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        }
    }
}

impl TokenVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<String, ChannelNameError> {
        let data = decode::<ChannelClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| {
                tracing::debug!(error = %e, "Channel token rejected");
                ChannelNameError::NoIdentity
            })?;

        if data.claims.sub.is_empty() {
            return Err(ChannelNameError::NoIdentity);
        }
        Ok(data.claims.sub)
    }
}

/// Fixed token to subject table, for development and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenVerifier {
    tokens: HashMap<String, String>,
}

impl StaticTokenVerifier {
    /// Create an empty verifier (rejects everything).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `token` as `subject`.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>, subject: impl Into<String>) -> Self {
        self.tokens.insert(token.into(), subject.into());
        self
    }
}

impl TokenVerifier for StaticTokenVerifier {
    fn verify(&self, token: &str) -> Result<String, ChannelNameError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or(ChannelNameError::NoIdentity)
    }
}

/// Resolves `Authorization: Bearer <token>` to `"{prefix}{subject}"`.
#[derive(Debug, Clone)]
pub struct BearerChannelResolver<V> {
    verifier: V,
    prefix: String,
}

impl<V: TokenVerifier> BearerChannelResolver<V> {
    /// Create a resolver with the default `user:` prefix.
    #[must_use]
    pub fn new(verifier: V) -> Self {
        Self {
            verifier,
            prefix: DEFAULT_CHANNEL_PREFIX.to_string(),
        }
    }

    /// Override the channel prefix.
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Resolve directly from headers.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelNameError::NoIdentity`] if the header is missing,
    /// malformed or carries a token the verifier rejects.
    pub fn channel_for(&self, headers: &HeaderMap) -> Result<String, ChannelNameError> {
        let token = bearer_token(headers).ok_or(ChannelNameError::NoIdentity)?;
        let subject = self.verifier.verify(token)?;
        Ok(format!("{}{subject}", self.prefix))
    }
}

#[async_trait]
impl<V: TokenVerifier> ChannelResolver for BearerChannelResolver<V> {
    async fn resolve(&self, parts: &Parts) -> Result<String, ChannelNameError> {
        self.channel_for(&parts.headers)
    }
}

/// Token of an `Authorization: Bearer` header (scheme is case-insensitive).
#[must_use]
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::http::{HeaderValue, Request};
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;

    const SECRET: &[u8] = b"channel-test-secret";

    #[derive(Serialize)]
    struct Claims<'a> {
        sub: &'a str,
        exp: i64,
    }

    fn token(sub: &str, exp_offset: i64) -> String {
        let claims = Claims {
            sub,
            exp: chrono::Utc::now().timestamp() + exp_offset,
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET)).unwrap()
    }

    fn parts_with_auth(value: Option<&str>) -> Parts {
        let mut builder = Request::builder().uri("/api/v1/x/");
        if let Some(value) = value {
            builder = builder.header(AUTHORIZATION, value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[tokio::test]
    async fn test_jwt_subject_becomes_user_channel() {
        let resolver = BearerChannelResolver::new(JwtVerifier::new(SECRET));
        let parts = parts_with_auth(Some(&format!("Bearer {}", token("42", 600))));

        assert_eq!(resolver.resolve(&parts).await.unwrap(), "user:42");
    }

    #[tokio::test]
    async fn test_expired_or_foreign_tokens_have_no_identity() {
        let resolver = BearerChannelResolver::new(JwtVerifier::new(SECRET));

        let expired = parts_with_auth(Some(&format!("Bearer {}", token("42", -3600))));
        assert_eq!(resolver.resolve(&expired).await, Err(ChannelNameError::NoIdentity));

        let foreign = encode(
            &Header::default(),
            &Claims { sub: "42", exp: chrono::Utc::now().timestamp() + 600 },
            &EncodingKey::from_secret(b"other-secret"),
        )
        .unwrap();
        let parts = parts_with_auth(Some(&format!("Bearer {foreign}")));
        assert_eq!(resolver.resolve(&parts).await, Err(ChannelNameError::NoIdentity));
    }

    #[tokio::test]
    async fn test_missing_header_has_no_identity() {
        let resolver = BearerChannelResolver::new(StaticTokenVerifier::new().with_token("t", "1"));
        let err = resolver.resolve(&parts_with_auth(None)).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "No valid token found in request for channel name resolution."
        );
    }

    #[tokio::test]
    async fn test_custom_prefix() {
        let resolver = BearerChannelResolver::new(StaticTokenVerifier::new().with_token("t", "7"))
            .with_prefix("tenant-a:");
        let parts = parts_with_auth(Some("bearer t"));
        assert_eq!(resolver.resolve(&parts).await.unwrap(), "tenant-a:7");
    }

    #[test]
    fn test_bearer_token_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("BEARER abc.def"));
        assert_eq!(bearer_token(&headers), Some("abc.def"));
    }

    #[test]
    fn test_identity_error_is_unauthorized() {
        let err = AppError::from(ChannelNameError::NoIdentity);
        assert_eq!(err.status(), axum::http::StatusCode::UNAUTHORIZED);
    }
}
