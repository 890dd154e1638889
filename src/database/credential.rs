use std::sync::Arc;
use tracing::{debug, error};

use super::error::ConnectError;
use crate::error::error_chain;
use crate::iam::{AuthToken, TokenSigner};

/// The pool's password hook: one fresh token per new physical connection.
///
/// Queries never come through here; only connection attempts do.
#[derive(Clone)]
pub struct CredentialProvider {
    signer: Arc<dyn TokenSigner>,
}

impl CredentialProvider {
    pub fn new(signer: Arc<dyn TokenSigner>) -> Self {
        Self { signer }
    }

    pub async fn password(&self) -> Result<AuthToken, ConnectError> {
        debug!("pool requesting new connection, generating IAM auth token");
        match self.signer.auth_token().await {
            Ok(token) => {
                debug!("IAM auth token generated");
                Ok(token)
            }
            Err(e) => {
                error!(error = %error_chain(&e), "failed to generate IAM auth token");
                Err(ConnectError::Credential(e))
            }
        }
    }
}
