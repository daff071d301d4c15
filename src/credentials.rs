// src/credentials.rs
//! Time-limited TURN credentials (REST API for TURN services scheme).
//!
//! A credential is never stored. The username embeds its own expiry as
//! `<unix-expiry>:<label>` and the password is `base64(HMAC-SHA1(secret, username))`,
//! so the TURN engine recomputes the password from the username alone at
//! authentication time.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use tracing::debug;

use crate::config::TurnConfig;
use crate::error::CredentialError;
use crate::stun::auth::constant_time_eq;

type HmacSha1 = Hmac<Sha1>;

/// Credential handed to a client by `GET /api/turn`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnCredential {
    pub username: String,
    pub password: String,
    pub ttl: u64,
    pub realm: String,
    pub uris: Vec<String>,
}

/// Stateless issuer/verifier of TURN credentials
#[derive(Clone)]
pub struct CredentialIssuer {
    secret: Vec<u8>,
    realm: String,
    uris: Vec<String>,
}

impl std::fmt::Debug for CredentialIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialIssuer")
            .field("realm", &self.realm)
            .field("uris", &self.uris)
            .finish_non_exhaustive()
    }
}

impl CredentialIssuer {
    /// Create an issuer for the given secret, realm and advertised relay URIs
    pub fn new(secret: impl Into<Vec<u8>>, realm: impl Into<String>, uris: Vec<String>) -> Self {
        Self {
            secret: secret.into(),
            realm: realm.into(),
            uris,
        }
    }

    /// Build the issuer the server uses from its TURN configuration
    pub fn from_config(config: &TurnConfig, domain: &str) -> Self {
        Self::new(
            config.shared_secret.as_bytes().to_vec(),
            config.realm.clone(),
            config.relay_uris(domain),
        )
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    /// Issue a credential valid for `ttl` seconds from now
    pub fn issue(&self, label: &str, ttl: u64) -> Result<TurnCredential, CredentialError> {
        self.issue_at(label, ttl, Utc::now().timestamp())
    }

    /// Issue a credential valid for `ttl` seconds from `now` (unix seconds)
    pub fn issue_at(&self, label: &str, ttl: u64, now: i64) -> Result<TurnCredential, CredentialError> {
        if ttl == 0 {
            return Err(CredentialError::InvalidRequest("ttl must be positive".into()));
        }
        let ttl_secs = i64::try_from(ttl)
            .map_err(|_| CredentialError::InvalidRequest(format!("ttl {} out of range", ttl)))?;
        let expiry = now
            .checked_add(ttl_secs)
            .ok_or_else(|| CredentialError::InvalidRequest(format!("ttl {} out of range", ttl)))?;

        let username = format!("{}:{}", expiry, label);
        let password = self.password_for(&username);
        debug!("Issued TURN credential {} (ttl {}s)", username, ttl);

        Ok(TurnCredential {
            username,
            password,
            ttl,
            realm: self.realm.clone(),
            uris: self.uris.clone(),
        })
    }

    /// Verify a username and return the password derived from the secret
    pub fn verify(&self, username: &str) -> Result<String, CredentialError> {
        self.verify_at(username, Utc::now().timestamp())
    }

    /// Verify a username against `now` (unix seconds)
    pub fn verify_at(&self, username: &str, now: i64) -> Result<String, CredentialError> {
        let expiry = parse_expiry(username)?;
        if expiry < now {
            return Err(CredentialError::ExpiredCredential { expiry, now });
        }
        Ok(self.password_for(username))
    }

    /// Verify a username/password pair, comparing passwords in constant time
    pub fn check_password(&self, username: &str, password: &str) -> Result<(), CredentialError> {
        let expected = self.verify(username)?;
        if constant_time_eq(expected.as_bytes(), password.as_bytes()) {
            Ok(())
        } else {
            Err(CredentialError::PasswordMismatch)
        }
    }

    /// `base64(HMAC-SHA1(secret, username))`
    pub fn password_for(&self, username: &str) -> String {
        let mut mac = <HmacSha1 as Mac>::new_from_slice(&self.secret)
            .expect("HMAC can take key of any size");
        mac.update(username.as_bytes());
        STANDARD.encode(mac.finalize().into_bytes())
    }
}

/// Leading integer of `<expiry>:<label>`
fn parse_expiry(username: &str) -> Result<i64, CredentialError> {
    let (prefix, _label) = username
        .split_once(':')
        .ok_or_else(|| CredentialError::InvalidCredential(username.to_string()))?;
    prefix
        .parse::<i64>()
        .map_err(|_| CredentialError::InvalidCredential(username.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issuer() -> CredentialIssuer {
        CredentialIssuer::new(
            b"north-secret".to_vec(),
            "example.org",
            vec!["turn:198.51.100.1:3478?transport=udp".into()],
        )
    }

    #[test]
    fn test_issue_known_vector() {
        let cred = issuer().issue_at("alice", 3600, 1_700_000_000).unwrap();
        assert_eq!(cred.username, "1700003600:alice");
        assert_eq!(cred.password, "Ji4axghh2/aljHmsPgH9mtDGVLw=");
        assert_eq!(cred.ttl, 3600);
        assert_eq!(cred.realm, "example.org");
        assert_eq!(cred.uris.len(), 1);
    }

    #[test]
    fn test_verify_until_expiry() {
        let issuer = issuer();
        let cred = issuer.issue_at("alice", 60, 1_000).unwrap();

        assert_eq!(issuer.verify_at(&cred.username, 1_000).unwrap(), cred.password);
        assert_eq!(issuer.verify_at(&cred.username, 1_060).unwrap(), cred.password);
        assert_eq!(
            issuer.verify_at(&cred.username, 1_061),
            Err(CredentialError::ExpiredCredential { expiry: 1_060, now: 1_061 })
        );
    }

    #[test]
    fn test_verify_fresh_credential_now() {
        let issuer = issuer();
        let cred = issuer.issue("bob", 30).unwrap();
        assert!(issuer.verify(&cred.username).is_ok());
        assert!(issuer.check_password(&cred.username, &cred.password).is_ok());
        assert_eq!(
            issuer.check_password(&cred.username, "not-the-password"),
            Err(CredentialError::PasswordMismatch)
        );
    }

    #[test]
    fn test_invalid_usernames() {
        let issuer = issuer();
        assert!(matches!(issuer.verify_at("alice", 0), Err(CredentialError::InvalidCredential(_))));
        assert!(matches!(issuer.verify_at("soon:alice", 0), Err(CredentialError::InvalidCredential(_))));
        assert!(matches!(issuer.verify_at(":alice", 0), Err(CredentialError::InvalidCredential(_))));
    }

    #[test]
    fn test_label_may_contain_colons() {
        let issuer = issuer();
        let cred = issuer.issue_at("room:7:carol", 10, 100).unwrap();
        assert_eq!(cred.username, "110:room:7:carol");
        assert!(issuer.verify_at(&cred.username, 105).is_ok());
    }

    #[test]
    fn test_different_secret_different_password() {
        let other = CredentialIssuer::new(b"south-secret".to_vec(), "example.org", vec![]);
        let a = issuer().issue_at("alice", 10, 0).unwrap();
        let b = other.issue_at("alice", 10, 0).unwrap();
        assert_eq!(a.username, b.username);
        assert_ne!(a.password, b.password);
    }

    #[test]
    fn test_zero_ttl_rejected() {
        assert!(matches!(issuer().issue("alice", 0), Err(CredentialError::InvalidRequest(_))));
    }
}
