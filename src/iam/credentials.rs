// AWS credential resolution for token signing.

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::Deserialize;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};
use url::Url;

/// Link-local endpoint ECS exposes task-role credentials on.
const CONTAINER_CREDENTIALS_HOST: &str = "http://169.254.170.2";

/// EC2 instance metadata service.
const INSTANCE_METADATA_HOST: &str = "http://169.254.169.254";

const IMDS_TOKEN_PATH: &str = "/latest/api/token";
const IMDS_ROLE_PATH: &str = "/latest/meta-data/iam/security-credentials/";
const IMDS_TOKEN_TTL_SECS: &str = "21600";

const STS_API_VERSION: &str = "2011-06-15";
const DEFAULT_ROLE_SESSION_NAME: &str = "iam-todo";

/// Fetched credentials are refreshed this long before they expire.
const REFRESH_MARGIN_MINUTES: i64 = 5;

const CONNECT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(1);
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// A resolved identity used to sign requests.
#[derive(Clone)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl AwsCredentials {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => now + Duration::minutes(REFRESH_MARGIN_MINUTES) < expires_at,
            None => true,
        }
    }
}

impl std::fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum CredentialsError {
    #[error("no AWS credentials found: tried environment keys, shared profile, web identity, container endpoint and instance metadata")]
    NotFound,

    #[error("invalid credentials endpoint {uri}: {reason}")]
    InvalidEndpoint { uri: String, reason: String },

    #[error("AWS profile {profile:?} not usable from {}: {reason}", .path.display())]
    Profile {
        profile: String,
        path: PathBuf,
        reason: String,
    },

    #[error("cannot read web identity token file {}", .path.display())]
    TokenFile { path: PathBuf, source: io::Error },

    #[error("credentials request failed")]
    Http(#[from] reqwest::Error),

    #[error("credentials endpoint returned HTTP {0}")]
    Status(u16),

    #[error("instance metadata reports no IAM role")]
    NoInstanceRole,
}

/// Wire shape shared by the ECS container endpoint and instance metadata.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RoleCredentialsResponse {
    access_key_id: String,
    secret_access_key: String,
    token: Option<String>,
    expiration: Option<DateTime<Utc>>,
}

impl From<RoleCredentialsResponse> for AwsCredentials {
    fn from(body: RoleCredentialsResponse) -> Self {
        Self {
            access_key_id: body.access_key_id,
            secret_access_key: body.secret_access_key,
            session_token: body.token,
            expires_at: body.expiration,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AssumeRoleWithWebIdentityEnvelope {
    assume_role_with_web_identity_response: AssumeRoleWithWebIdentityResponse,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AssumeRoleWithWebIdentityResponse {
    assume_role_with_web_identity_result: AssumeRoleWithWebIdentityResult,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AssumeRoleWithWebIdentityResult {
    credentials: StsCredentials,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: String,
    expiration: StsExpiration,
}

/// STS reports expiry as epoch seconds in JSON mode, RFC 3339 elsewhere.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StsExpiration {
    Epoch(f64),
    Timestamp(DateTime<Utc>),
}

impl StsExpiration {
    fn to_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Epoch(secs) => Utc.timestamp_opt(*secs as i64, 0).single(),
            Self::Timestamp(at) => Some(*at),
        }
    }
}

enum CredentialSource {
    /// Keys from the environment or a shared credentials file.
    Static {
        origin: &'static str,
        credentials: AwsCredentials,
    },
    /// ECS task role.
    Container {
        client: reqwest::Client,
        endpoint: Url,
        authorization: Option<String>,
    },
    /// `sts:AssumeRoleWithWebIdentity` with a projected token file (EKS).
    WebIdentity {
        client: reqwest::Client,
        endpoint: Url,
        role_arn: String,
        session_name: String,
        token_file: PathBuf,
    },
    /// EC2 instance role over IMDSv2.
    InstanceMetadata { client: reqwest::Client, endpoint: Url },
}

/// Where signing credentials come from.
///
/// Remote sources are cached until close to expiry.
pub struct AwsCredentialsProvider {
    source: CredentialSource,
    cached: Mutex<Option<AwsCredentials>>,
}

impl AwsCredentialsProvider {
    /// Resolve the credential source from the process environment.
    ///
    /// Nothing is fetched over the network here.
    pub fn from_env() -> Result<Self, CredentialsError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Walks the chain in order: environment keys, shared credentials file,
    /// web identity, container endpoint, instance metadata.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, CredentialsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let (Some(access_key_id), Some(secret_access_key)) =
            (var("AWS_ACCESS_KEY_ID"), var("AWS_SECRET_ACCESS_KEY"))
        {
            debug!("using AWS credentials from environment");
            return Ok(Self::from_source(CredentialSource::Static {
                origin: "environment",
                credentials: AwsCredentials {
                    access_key_id,
                    secret_access_key,
                    session_token: var("AWS_SESSION_TOKEN"),
                    expires_at: None,
                },
            }));
        }

        if let Some(credentials) = profile_credentials(&var)? {
            return Ok(Self::from_source(CredentialSource::Static {
                origin: "profile",
                credentials,
            }));
        }

        if let (Some(token_file), Some(role_arn)) =
            (var("AWS_WEB_IDENTITY_TOKEN_FILE"), var("AWS_ROLE_ARN"))
        {
            let endpoint = match var("AWS_ENDPOINT_URL_STS") {
                Some(custom) => parse_endpoint(&custom)?,
                None => {
                    let host = match var("AWS_REGION").or_else(|| var("AWS_DEFAULT_REGION")) {
                        Some(region) => format!("https://sts.{}.amazonaws.com/", region),
                        None => "https://sts.amazonaws.com/".to_string(),
                    };
                    parse_endpoint(&host)?
                }
            };
            let session_name =
                var("AWS_ROLE_SESSION_NAME").unwrap_or_else(|| DEFAULT_ROLE_SESSION_NAME.to_string());
            debug!(role_arn = %role_arn, endpoint = %endpoint, "using web identity credentials");
            return Self::web_identity(endpoint, role_arn, session_name, PathBuf::from(token_file));
        }

        if let Some(relative) = var("AWS_CONTAINER_CREDENTIALS_RELATIVE_URI") {
            let endpoint = Url::parse(CONTAINER_CREDENTIALS_HOST)
                .and_then(|base| base.join(&relative))
                .map_err(|e| CredentialsError::InvalidEndpoint {
                    uri: relative.clone(),
                    reason: e.to_string(),
                })?;
            debug!(endpoint = %endpoint, "using container credentials endpoint");
            return Self::container(endpoint, var("AWS_CONTAINER_AUTHORIZATION_TOKEN"));
        }
        if let Some(full) = var("AWS_CONTAINER_CREDENTIALS_FULL_URI") {
            let endpoint = parse_endpoint(&full)?;
            debug!(endpoint = %endpoint, "using container credentials endpoint");
            return Self::container(endpoint, var("AWS_CONTAINER_AUTHORIZATION_TOKEN"));
        }

        let imds_disabled = var("AWS_EC2_METADATA_DISABLED")
            .map(|v| v.trim().eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        if imds_disabled {
            return Err(CredentialsError::NotFound);
        }
        let endpoint = parse_endpoint(
            &var("AWS_EC2_METADATA_SERVICE_ENDPOINT").unwrap_or_else(|| INSTANCE_METADATA_HOST.to_string()),
        )?;
        debug!(endpoint = %endpoint, "falling back to instance metadata credentials");
        Self::instance_metadata(endpoint)
    }

    /// Fixed credentials that never expire.
    pub fn from_static(credentials: AwsCredentials) -> Self {
        Self::from_source(CredentialSource::Static {
            origin: "static",
            credentials,
        })
    }

    pub fn container(endpoint: Url, authorization: Option<String>) -> Result<Self, CredentialsError> {
        Ok(Self::from_source(CredentialSource::Container {
            client: http_client()?,
            endpoint,
            authorization,
        }))
    }

    pub fn web_identity(
        endpoint: Url,
        role_arn: String,
        session_name: String,
        token_file: PathBuf,
    ) -> Result<Self, CredentialsError> {
        Ok(Self::from_source(CredentialSource::WebIdentity {
            client: http_client()?,
            endpoint,
            role_arn,
            session_name,
            token_file,
        }))
    }

    pub fn instance_metadata(endpoint: Url) -> Result<Self, CredentialsError> {
        Ok(Self::from_source(CredentialSource::InstanceMetadata {
            client: http_client()?,
            endpoint,
        }))
    }

    fn from_source(source: CredentialSource) -> Self {
        Self {
            source,
            cached: Mutex::new(None),
        }
    }

    /// Short label for logs.
    pub fn source_name(&self) -> &'static str {
        match &self.source {
            CredentialSource::Static { origin, .. } => *origin,
            CredentialSource::Container { .. } => "container",
            CredentialSource::WebIdentity { .. } => "web-identity",
            CredentialSource::InstanceMetadata { .. } => "instance-metadata",
        }
    }

    /// Current credentials, fetching from the source when the cached set is
    /// missing or about to expire.
    pub async fn credentials(&self) -> Result<AwsCredentials, CredentialsError> {
        if let CredentialSource::Static { credentials, .. } = &self.source {
            return Ok(credentials.clone());
        }

        // Held across the fetch so concurrent connection attempts share one request.
        let mut cached = self.cached.lock().await;
        if let Some(credentials) = cached.as_ref() {
            if credentials.is_fresh(Utc::now()) {
                return Ok(credentials.clone());
            }
        }

        let credentials = self.fetch().await?;
        info!(
            source = self.source_name(),
            expires_at = ?credentials.expires_at,
            "refreshed AWS credentials"
        );
        *cached = Some(credentials.clone());
        Ok(credentials)
    }

    async fn fetch(&self) -> Result<AwsCredentials, CredentialsError> {
        match &self.source {
            CredentialSource::Static { credentials, .. } => Ok(credentials.clone()),
            CredentialSource::Container {
                client,
                endpoint,
                authorization,
            } => {
                let mut request = client.get(endpoint.clone());
                if let Some(token) = authorization {
                    request = request.header(reqwest::header::AUTHORIZATION, token);
                }
                let response = checked(request.send().await?)?;
                let body: RoleCredentialsResponse = response.json().await?;
                Ok(body.into())
            }
            CredentialSource::WebIdentity {
                client,
                endpoint,
                role_arn,
                session_name,
                token_file,
            } => {
                // Re-read each time; the orchestrator rotates the file.
                let token = tokio::fs::read_to_string(token_file)
                    .await
                    .map_err(|source| CredentialsError::TokenFile {
                        path: token_file.clone(),
                        source,
                    })?;
                let request = client
                    .get(endpoint.clone())
                    .header(reqwest::header::ACCEPT, "application/json")
                    .query(&[
                        ("Action", "AssumeRoleWithWebIdentity"),
                        ("Version", STS_API_VERSION),
                        ("RoleArn", role_arn.as_str()),
                        ("RoleSessionName", session_name.as_str()),
                        ("WebIdentityToken", token.trim()),
                    ]);
                let response = checked(request.send().await?)?;
                let body: AssumeRoleWithWebIdentityEnvelope = response.json().await?;
                let sts = body
                    .assume_role_with_web_identity_response
                    .assume_role_with_web_identity_result
                    .credentials;
                Ok(AwsCredentials {
                    expires_at: sts.expiration.to_datetime(),
                    access_key_id: sts.access_key_id,
                    secret_access_key: sts.secret_access_key,
                    session_token: Some(sts.session_token),
                })
            }
            CredentialSource::InstanceMetadata { client, endpoint } => {
                let token_url = join_endpoint(endpoint, IMDS_TOKEN_PATH)?;
                let session = checked(
                    client
                        .put(token_url)
                        .header("X-aws-ec2-metadata-token-ttl-seconds", IMDS_TOKEN_TTL_SECS)
                        .send()
                        .await?,
                )?
                .text()
                .await?;

                let roles_url = join_endpoint(endpoint, IMDS_ROLE_PATH)?;
                let roles = checked(
                    client
                        .get(roles_url)
                        .header("X-aws-ec2-metadata-token", session.as_str())
                        .send()
                        .await?,
                )?
                .text()
                .await?;
                let role = roles
                    .lines()
                    .map(str::trim)
                    .find(|line| !line.is_empty())
                    .ok_or(CredentialsError::NoInstanceRole)?;

                let credentials_url = join_endpoint(endpoint, &format!("{}{}", IMDS_ROLE_PATH, role))?;
                let response = checked(
                    client
                        .get(credentials_url)
                        .header("X-aws-ec2-metadata-token", session.as_str())
                        .send()
                        .await?,
                )?;
                let body: RoleCredentialsResponse = response.json().await?;
                Ok(body.into())
            }
        }
    }
}

fn http_client() -> Result<reqwest::Client, CredentialsError> {
    Ok(reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(REQUEST_TIMEOUT)
        .build()?)
}

fn checked(response: reqwest::Response) -> Result<reqwest::Response, CredentialsError> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(CredentialsError::Status(response.status().as_u16()))
    }
}

fn parse_endpoint(raw: &str) -> Result<Url, CredentialsError> {
    Url::parse(raw).map_err(|e| CredentialsError::InvalidEndpoint {
        uri: raw.to_string(),
        reason: e.to_string(),
    })
}

fn join_endpoint(base: &Url, path: &str) -> Result<Url, CredentialsError> {
    base.join(path).map_err(|e| CredentialsError::InvalidEndpoint {
        uri: format!("{}{}", base, path),
        reason: e.to_string(),
    })
}

/// Keys for the selected profile in the shared credentials file, if any.
///
/// A missing file or profile falls through to the next source unless
/// `AWS_PROFILE` named it explicitly.
fn profile_credentials<F>(var: &F) -> Result<Option<AwsCredentials>, CredentialsError>
where
    F: Fn(&str) -> Option<String>,
{
    let explicit = var("AWS_PROFILE");
    let profile = explicit.clone().unwrap_or_else(|| "default".to_string());
    let path = match var("AWS_SHARED_CREDENTIALS_FILE") {
        Some(path) => PathBuf::from(path),
        None => match var("HOME") {
            Some(home) => Path::new(&home).join(".aws").join("credentials"),
            None => return Ok(None),
        },
    };

    let unusable = |reason: &str| CredentialsError::Profile {
        profile: profile.clone(),
        path: path.clone(),
        reason: reason.to_string(),
    };

    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound && explicit.is_none() => return Ok(None),
        Err(e) => return Err(unusable(&e.to_string())),
    };

    let section = parse_profile(&contents, &profile);
    let access_key_id = section.iter().find(|(k, _)| k == "aws_access_key_id");
    let secret_access_key = section.iter().find(|(k, _)| k == "aws_secret_access_key");
    match (access_key_id, secret_access_key) {
        (Some((_, access_key_id)), Some((_, secret_access_key))) => {
            debug!(profile = %profile, path = %path.display(), "using AWS credentials from shared profile");
            Ok(Some(AwsCredentials {
                access_key_id: access_key_id.clone(),
                secret_access_key: secret_access_key.clone(),
                session_token: section
                    .iter()
                    .find(|(k, _)| k == "aws_session_token")
                    .map(|(_, v)| v.clone()),
                expires_at: None,
            }))
        }
        _ if explicit.is_some() => Err(unusable("profile has no access keys")),
        _ => Ok(None),
    }
}

/// `key = value` pairs of one `[section]` in an INI-style credentials file.
fn parse_profile(contents: &str, profile: &str) -> Vec<(String, String)> {
    let mut in_section = false;
    let mut pairs = Vec::new();
    for line in contents.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            in_section = name.trim() == profile;
            continue;
        }
        if !in_section {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            pairs.push((key.trim().to_ascii_lowercase(), value.trim().to_string()));
        }
    }
    pairs
}
