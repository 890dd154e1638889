use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use uuid::Uuid;

use crate::config::SecurityConfig;

/// Name of the session cookie.
pub const SESSION_COOKIE: &str = "session";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionClaims {
    pub sid: Uuid,
    pub iat: i64,
    pub exp: i64,
}

impl SessionClaims {
    pub fn new(ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            sid: Uuid::new_v4(),
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session secret is empty")]
    InvalidSecret,

    #[error("failed to sign session: {0}")]
    TokenGeneration(String),

    #[error("invalid session: {0}")]
    Invalid(String),

    #[error("session has been logged out")]
    Revoked,
}

/// Issues and checks the signed session cookie.
///
/// A session is valid while its signature checks out, `exp` has not passed and
/// it has not been logged out. Logged-out session ids are remembered in memory
/// until their `exp`, so a restart forgets them.
pub struct SessionManager {
    encoding: EncodingKey,
    decoding: DecodingKey,
    password_digest: [u8; 32],
    ttl: Duration,
    secure: bool,
    revoked: Mutex<HashMap<Uuid, i64>>,
}

impl SessionManager {
    pub fn new(security: &SecurityConfig) -> Result<Self, SessionError> {
        if security.session_secret.is_empty() {
            return Err(SessionError::InvalidSecret);
        }
        let secret = security.session_secret.as_bytes();

        Ok(Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            password_digest: digest(&security.app_password),
            ttl: Duration::hours(security.session_ttl_hours),
            secure: security.secure_cookies,
            revoked: Mutex::new(HashMap::new()),
        })
    }

    /// Compares digests so the check does not depend on password length.
    pub fn verify_password(&self, candidate: &str) -> bool {
        digest(candidate) == self.password_digest
    }

    pub fn issue(&self) -> Result<String, SessionError> {
        encode(&Header::default(), &SessionClaims::new(self.ttl), &self.encoding)
            .map_err(|e| SessionError::TokenGeneration(e.to_string()))
    }

    pub fn validate(&self, token: &str) -> Result<SessionClaims, SessionError> {
        let claims = decode::<SessionClaims>(token, &self.decoding, &Validation::default())
            .map(|data| data.claims)
            .map_err(|e| SessionError::Invalid(e.to_string()))?;
        if self.revoked().contains_key(&claims.sid) {
            return Err(SessionError::Revoked);
        }
        Ok(claims)
    }

    /// Refuse this session from now on, even though its cookie still verifies.
    pub fn revoke(&self, claims: &SessionClaims) {
        let now = Utc::now().timestamp();
        let mut revoked = self.revoked();
        // Expired entries would fail validation anyway.
        revoked.retain(|_, exp| *exp > now);
        revoked.insert(claims.sid, claims.exp);
    }

    fn revoked(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, i64>> {
        self.revoked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `Set-Cookie` value carrying a freshly issued session.
    pub fn session_cookie(&self, token: &str) -> String {
        let mut cookie = format!(
            "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
            SESSION_COOKIE,
            token,
            self.ttl.num_seconds()
        );
        if self.secure {
            cookie.push_str("; Secure");
        }
        cookie
    }

    pub fn clear_cookie(&self) -> String {
        let mut cookie = format!("{}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0", SESSION_COOKIE);
        if self.secure {
            cookie.push_str("; Secure");
        }
        cookie
    }
}

fn digest(value: &str) -> [u8; 32] {
    Sha256::digest(value.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn security(secure: bool) -> SecurityConfig {
        SecurityConfig {
            app_password: "example".into(),
            session_secret: "test-secret".into(),
            secure_cookies: secure,
            session_ttl_hours: 24,
        }
    }

    #[test]
    fn issued_session_validates() {
        let sessions = SessionManager::new(&security(false)).unwrap();
        let token = sessions.issue().unwrap();
        let claims = sessions.validate(&token).unwrap();
        assert_eq!(claims.exp - claims.iat, 24 * 3600);
    }

    #[test]
    fn session_from_other_secret_is_rejected() {
        let sessions = SessionManager::new(&security(false)).unwrap();
        let mut other = security(false);
        other.session_secret = "another-secret".into();
        let token = SessionManager::new(&other).unwrap().issue().unwrap();

        assert!(matches!(sessions.validate(&token), Err(SessionError::Invalid(_))));
        assert!(sessions.validate("garbage").is_err());
    }

    #[test]
    fn revoked_session_no_longer_validates() {
        let sessions = SessionManager::new(&security(false)).unwrap();
        let logged_out = sessions.issue().unwrap();
        let other = sessions.issue().unwrap();

        let claims = sessions.validate(&logged_out).unwrap();
        sessions.revoke(&claims);

        assert!(matches!(sessions.validate(&logged_out), Err(SessionError::Revoked)));
        assert!(sessions.validate(&other).is_ok());
    }

    #[test]
    fn expired_revocations_are_pruned() {
        let sessions = SessionManager::new(&security(false)).unwrap();
        let stale = SessionClaims {
            sid: Uuid::new_v4(),
            iat: 0,
            exp: 1,
        };
        sessions.revoke(&stale);
        sessions.revoke(&sessions.validate(&sessions.issue().unwrap()).unwrap());

        let revoked = sessions.revoked();
        assert_eq!(revoked.len(), 1);
        assert!(!revoked.contains_key(&stale.sid));
    }

    #[test]
    fn password_check() {
        let sessions = SessionManager::new(&security(false)).unwrap();
        assert!(sessions.verify_password("example"));
        assert!(!sessions.verify_password("Example"));
        assert!(!sessions.verify_password(""));
    }

    #[test]
    fn cookie_attributes() {
        let plain = SessionManager::new(&security(false)).unwrap();
        assert_eq!(
            plain.session_cookie("abc"),
            "session=abc; Path=/; HttpOnly; SameSite=Lax; Max-Age=86400"
        );
        assert!(plain.clear_cookie().contains("Max-Age=0"));

        let secure = SessionManager::new(&security(true)).unwrap();
        assert!(secure.session_cookie("abc").ends_with("; Secure"));
    }

    #[test]
    fn empty_secret_is_rejected() {
        let mut config = security(false);
        config.session_secret.clear();
        assert!(matches!(SessionManager::new(&config), Err(SessionError::InvalidSecret)));
    }
}
