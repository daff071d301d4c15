// src/stun/auth.rs
//! STUN long-term credential primitives (RFC 5389 Section 10.2)
//!
//! - key derivation `MD5(username ":" realm ":" password)`
//! - MESSAGE-INTEGRITY helpers over HMAC-SHA1
//! - stateless nonces bound to the client IP

use std::net::IpAddr;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use rand::RngCore;
use sha1::Sha1;
use sha2::Sha256;

use crate::error::StunError;

type HmacSha256 = Hmac<Sha256>;

/// Derive the long-term credential key
pub fn long_term_key(username: &str, realm: &str, password: &str) -> Vec<u8> {
    let mut hasher = Md5::new();
    hasher.update(username.as_bytes());
    hasher.update(b":");
    hasher.update(realm.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    hasher.finalize().to_vec()
}

/// Compute MESSAGE-INTEGRITY attribute value using SHA-1
pub fn compute_message_integrity_sha1(message: &[u8], key: &[u8]) -> Result<Vec<u8>, StunError> {
    let mut mac = Hmac::<Sha1>::new_from_slice(key)
        .map_err(|e| StunError::CryptographicError(format!("HMAC-SHA1 key error: {}", e)))?;

    mac.update(message);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Verify MESSAGE-INTEGRITY attribute value using SHA-1
pub fn verify_message_integrity_sha1(message: &[u8], expected_hmac: &[u8], key: &[u8]) -> Result<bool, StunError> {
    let computed_hmac = compute_message_integrity_sha1(message, key)?;
    Ok(constant_time_eq(&computed_hmac, expected_hmac))
}

/// Constant-time equality comparison
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }

    result == 0
}

const TIMESTAMP_LEN: usize = 8;
const NONCE_MAC_LEN: usize = 32;

/// Issues and validates stateless nonces.
///
/// A nonce is `base64url(timestamp || HMAC-SHA256(key, timestamp || client-ip))`,
/// so nothing is stored per client and validation only needs the key.
pub struct NonceManager {
    hmac_key: [u8; 32],
    lifetime: Duration,
}

impl NonceManager {
    /// Nonce manager with a fresh random key
    pub fn new(lifetime: Duration) -> Self {
        let mut hmac_key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut hmac_key);
        Self { hmac_key, lifetime }
    }

    /// Nonce manager with a caller-supplied key
    pub fn with_key(hmac_key: [u8; 32], lifetime: Duration) -> Self {
        Self { hmac_key, lifetime }
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    /// Generate new nonce for client
    pub fn generate_nonce(&self, client_ip: IpAddr) -> String {
        self.generate_nonce_at(client_ip, unix_now())
    }

    pub fn generate_nonce_at(&self, client_ip: IpAddr, now: u64) -> String {
        let timestamp = now.to_be_bytes();
        let mac = self.sign(&timestamp, client_ip);

        let mut raw = Vec::with_capacity(TIMESTAMP_LEN + NONCE_MAC_LEN);
        raw.extend_from_slice(&timestamp);
        raw.extend_from_slice(&mac);
        URL_SAFE_NO_PAD.encode(raw)
    }

    /// Validate nonce
    pub fn validate_nonce(&self, nonce: &[u8], client_ip: IpAddr) -> bool {
        self.validate_nonce_at(nonce, client_ip, unix_now())
    }

    pub fn validate_nonce_at(&self, nonce: &[u8], client_ip: IpAddr, now: u64) -> bool {
        let raw = match URL_SAFE_NO_PAD.decode(nonce) {
            Ok(raw) if raw.len() == TIMESTAMP_LEN + NONCE_MAC_LEN => raw,
            _ => return false,
        };

        let (timestamp, mac) = raw.split_at(TIMESTAMP_LEN);
        let mut ts_bytes = [0u8; TIMESTAMP_LEN];
        ts_bytes.copy_from_slice(timestamp);
        let issued = u64::from_be_bytes(ts_bytes);

        if issued > now || now - issued > self.lifetime.as_secs() {
            return false;
        }

        constant_time_eq(&self.sign(timestamp, client_ip), mac)
    }

    fn sign(&self, timestamp: &[u8], client_ip: IpAddr) -> [u8; NONCE_MAC_LEN] {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.hmac_key)
            .expect("HMAC can take key of any size");
        mac.update(timestamp);
        match client_ip {
            IpAddr::V4(ip) => mac.update(&ip.octets()),
            IpAddr::V6(ip) => mac.update(&ip.octets()),
        }
        let mut out = [0u8; NONCE_MAC_LEN];
        out.copy_from_slice(&mac.finalize().into_bytes());
        out
    }
}

impl std::fmt::Debug for NonceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NonceManager")
            .field("lifetime", &self.lifetime)
            .finish_non_exhaustive()
    }
}

fn unix_now() -> u64 {
    u64::try_from(Utc::now().timestamp()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_long_term_key() {
        let key = long_term_key("1700003600:alice", "example.org", "Ji4axghh2/aljHmsPgH9mtDGVLw=");
        let hex: String = key.iter().map(|b| format!("{:02x}", b)).collect();
        assert_eq!(hex, "9b35a4edb5f57f881d1806fbe0c8e333");
    }

    #[test]
    fn test_nonce_manager() {
        let manager = NonceManager::new(Duration::from_secs(3600));
        let client_ip: IpAddr = "192.168.1.1".parse().unwrap();

        let nonce = manager.generate_nonce(client_ip);
        assert!(manager.validate_nonce(nonce.as_bytes(), client_ip));

        // Should fail with wrong IP
        let wrong_ip: IpAddr = "192.168.1.2".parse().unwrap();
        assert!(!manager.validate_nonce(nonce.as_bytes(), wrong_ip));
    }

    #[test]
    fn test_nonce_expiry() {
        let manager = NonceManager::with_key([7u8; 32], Duration::from_secs(60));
        let client_ip: IpAddr = "2001:db8::1".parse().unwrap();
        let nonce = manager.generate_nonce_at(client_ip, 1_000);

        assert!(manager.validate_nonce_at(nonce.as_bytes(), client_ip, 1_060));
        assert!(!manager.validate_nonce_at(nonce.as_bytes(), client_ip, 1_061));
        // Issued in the future
        assert!(!manager.validate_nonce_at(nonce.as_bytes(), client_ip, 999));
    }

    #[test]
    fn test_nonce_from_other_key_rejected() {
        let client_ip: IpAddr = "10.0.0.1".parse().unwrap();
        let a = NonceManager::with_key([1u8; 32], Duration::from_secs(60));
        let b = NonceManager::with_key([2u8; 32], Duration::from_secs(60));
        let nonce = a.generate_nonce_at(client_ip, 500);

        assert!(!b.validate_nonce_at(nonce.as_bytes(), client_ip, 500));
        assert!(!a.validate_nonce_at(b"not-a-nonce", client_ip, 500));
    }

    #[test]
    fn test_message_integrity_sha1() {
        let key = long_term_key("user", "realm", "pass");
        let mac = compute_message_integrity_sha1(b"message", &key).unwrap();
        assert_eq!(mac.len(), 20);
        assert!(verify_message_integrity_sha1(b"message", &mac, &key).unwrap());
        assert!(!verify_message_integrity_sha1(b"tampered", &mac, &key).unwrap());
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"hello", b"hello"));
        assert!(!constant_time_eq(b"hello", b"world"));
        assert!(!constant_time_eq(b"hello", b"hello!"));
    }
}
