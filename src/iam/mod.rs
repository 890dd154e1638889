//! IAM database authentication.
//!
//! A [`TokenSigner`] mints a short-lived [`AuthToken`] that stands in for a
//! database password. The pool asks for a new token every time it opens a
//! physical connection; tokens are never cached or shared.

mod credentials;
mod signer;
mod sigv4;

use async_trait::async_trait;
use thiserror::Error;

pub use credentials::{AwsCredentials, AwsCredentialsProvider, CredentialsError};
pub use signer::{RdsIamSigner, TOKEN_TTL_SECS};

/// Opaque, time-limited bearer credential.
///
/// `Debug` is redacted so a token never ends up in a log line.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Borrow the raw token, e.g. to hand it to a connection handshake.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AuthToken(<redacted>)")
    }
}

/// Failure to produce a token.
#[derive(Debug, Error)]
pub enum SigningError {
    #[error("could not resolve AWS credentials")]
    Credentials(#[from] CredentialsError),

    #[error("invalid signing configuration: {0}")]
    InvalidConfig(String),
}

/// Produces a fresh authentication token on every call.
///
/// Implementations must be safe to call concurrently and must not retry
/// internally; the caller decides what a failure means.
#[async_trait]
pub trait TokenSigner: Send + Sync {
    async fn auth_token(&self) -> Result<AuthToken, SigningError>;
}
