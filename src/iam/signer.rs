use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::credentials::{AwsCredentials, AwsCredentialsProvider};
use super::sigv4::{self, PresignRequest};
use super::{AuthToken, SigningError, TokenSigner};
use crate::config::DatabaseEndpointConfig;

/// Lifetime RDS grants an IAM auth token, in seconds.
pub const TOKEN_TTL_SECS: u64 = 900;

const RDS_SERVICE: &str = "rds-db";

/// Mints RDS IAM authentication tokens for one (host, port, user, region).
pub struct RdsIamSigner {
    host: String,
    user: String,
    region: String,
    credentials: AwsCredentialsProvider,
}

impl RdsIamSigner {
    pub fn new(endpoint: &DatabaseEndpointConfig, credentials: AwsCredentialsProvider) -> Self {
        Self {
            host: format!("{}:{}", endpoint.host, endpoint.port),
            user: endpoint.user.clone(),
            region: endpoint.region.clone(),
            credentials,
        }
    }

    fn token_at(&self, credentials: &AwsCredentials, now: DateTime<Utc>) -> AuthToken {
        let request = PresignRequest {
            host: &self.host,
            region: &self.region,
            service: RDS_SERVICE,
            params: &[("Action", "connect"), ("DBUser", self.user.as_str())],
            expires_in_secs: TOKEN_TTL_SECS,
        };
        AuthToken::new(sigv4::presign(&request, credentials, now))
    }
}

#[async_trait]
impl TokenSigner for RdsIamSigner {
    async fn auth_token(&self) -> Result<AuthToken, SigningError> {
        if self.region.is_empty() {
            return Err(SigningError::InvalidConfig("region is empty".into()));
        }
        let credentials = self.credentials.credentials().await?;
        debug!(host = %self.host, user = %self.user, "signing RDS auth token");
        Ok(self.token_at(&credentials, Utc::now()))
    }
}
