// src/turn/auth.rs
//! Long-term credential authentication of TURN requests
//!
//! Usernames and passwords come from the [`CredentialIssuer`]; the password
//! is recomputed from the username, so nothing is looked up per user.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::credentials::CredentialIssuer;
use crate::error::TurnError;
use crate::stun::auth::{long_term_key, NonceManager};
use crate::stun::{AttributeType, Message};

/// Identity of an authenticated request
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub username: String,
    /// `MD5(username:realm:password)`, signs the response
    pub key: Vec<u8>,
}

/// Authenticates requests against time-limited credentials
#[derive(Debug)]
pub struct TurnAuthenticator {
    issuer: Arc<CredentialIssuer>,
    nonces: NonceManager,
}

impl TurnAuthenticator {
    pub fn new(issuer: Arc<CredentialIssuer>, nonce_lifetime: Duration) -> Self {
        Self {
            issuer,
            nonces: NonceManager::new(nonce_lifetime),
        }
    }

    pub fn realm(&self) -> &str {
        self.issuer.realm()
    }

    /// Fresh nonce for a 401/438 challenge
    pub fn challenge_nonce(&self, client_ip: IpAddr) -> String {
        self.nonces.generate_nonce(client_ip)
    }

    /// Authenticate a request decoded from `raw`
    pub fn authenticate(&self, request: &Message, raw: &[u8], client_ip: IpAddr) -> Result<AuthContext, TurnError> {
        if !request.has_attribute(AttributeType::MessageIntegrity) {
            return Err(TurnError::Unauthenticated("missing MESSAGE-INTEGRITY".into()));
        }

        let username = request
            .username()
            .ok_or_else(|| TurnError::BadRequest("missing USERNAME".into()))?;
        let realm = request
            .realm()
            .ok_or_else(|| TurnError::BadRequest("missing REALM".into()))?;
        let nonce = request
            .nonce()
            .ok_or_else(|| TurnError::BadRequest("missing NONCE".into()))?;

        if !self.nonces.validate_nonce(nonce, client_ip) {
            debug!("Stale nonce from {}", client_ip);
            return Err(TurnError::StaleNonce);
        }

        if realm != self.issuer.realm() {
            return Err(TurnError::Unauthenticated(format!("unknown realm {}", realm)));
        }

        let password = self.issuer.verify(username)?;
        let key = long_term_key(username, realm, &password);

        let valid = request
            .verify_integrity(&key, raw)
            .map_err(|e| TurnError::BadRequest(e.to_string()))?;
        if !valid {
            return Err(TurnError::Unauthenticated(format!("bad MESSAGE-INTEGRITY for {}", username)));
        }

        Ok(AuthContext {
            username: username.to_string(),
            key,
        })
    }
}
