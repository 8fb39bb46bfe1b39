// src/stun/auth.rs
//! Long-term credential mechanism (RFC 8489 Section 9.2)
//!
//! Keys are never stored: the password is fetched from the host through
//! [`Observer::get_password`] for each message and dropped afterwards.

use std::net::SocketAddr;

use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use rand::{distributions::Alphanumeric, Rng};
use sha1::Sha1;
use tracing::{debug, trace};

use super::protocol::{
    find_attribute_position, AttributeType, AttributeValue, Message, HEADER_SIZE, INTEGRITY_SIZE,
};
use crate::error::{StunError, StunResult};
use crate::turn::Observer;

/// Length of nonces issued in 401 challenges
pub const NONCE_LENGTH: usize = 16;

/// Long-term key: MD5(username ":" realm ":" password)
pub fn long_term_key(username: &str, realm: &str, password: &str) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(username.as_bytes());
    hasher.update(b":");
    hasher.update(realm.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    hasher.finalize().into()
}

/// Random alphanumeric nonce for a challenge
pub fn generate_nonce() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(NONCE_LENGTH)
        .map(char::from)
        .collect()
}

/// Check MESSAGE-INTEGRITY of an encoded message against `key`.
///
/// The hash covers everything before the attribute, with the header length
/// rewritten to end right after it. Comparison is constant-time.
pub fn verify_integrity(raw: &[u8], key: &[u8]) -> StunResult<()> {
    let position =
        find_attribute_position(raw, AttributeType::MessageIntegrity).ok_or(StunError::NotIntegrity)?;
    let end = position + 4 + INTEGRITY_SIZE;
    if end > raw.len() {
        return Err(StunError::InvalidInput);
    }

    let mut covered = raw[..position].to_vec();
    let adjusted = (end - HEADER_SIZE) as u16;
    covered[2..4].copy_from_slice(&adjusted.to_be_bytes());

    let mut mac = Hmac::<Sha1>::new_from_slice(key).map_err(|_| StunError::ShaFailed)?;
    mac.update(&covered);
    mac.verify_slice(&raw[position + 4..end])
        .map_err(|_| StunError::IntegrityFailed)
}

/// Identity resolved for an authenticated request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    /// Key used to sign the response
    pub key: [u8; 16],
}

/// Verifies requests of one realm
#[derive(Debug, Clone)]
pub struct CredentialVerifier {
    realm: String,
}

impl CredentialVerifier {
    pub fn new(realm: impl Into<String>) -> Self {
        Self {
            realm: realm.into(),
        }
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    /// Authenticate `message` (decoded from `raw`) sent by `source`.
    ///
    /// Suspends while the host resolves the password. A missing password
    /// and a wrong one both yield `IntegrityFailed`.
    pub async fn verify(
        &self,
        observer: &dyn Observer,
        message: &Message,
        raw: &[u8],
        source: &SocketAddr,
    ) -> StunResult<Credential> {
        if !message.has_integrity() {
            return Err(StunError::NotIntegrity);
        }

        // Signed but unattributable: the USERNAME was stripped or mangled
        let username = message.username().ok_or(StunError::IntegrityFailed)?;

        if let Some(AttributeValue::Realm(realm)) =
            message.get_attribute(AttributeType::Realm).map(|a| &a.value)
        {
            if realm != &self.realm {
                debug!("Realm mismatch from {}", source);
                return Err(StunError::IntegrityFailed);
            }
        }

        let password = match observer.get_password(source, username).await {
            Some(password) => password,
            None => {
                trace!("No credential for request from {}", source);
                return Err(StunError::IntegrityFailed);
            }
        };

        let key = long_term_key(username, &self.realm, &password);
        verify_integrity(raw, &key)?;

        Ok(Credential {
            username: username.to_string(),
            key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stun::protocol::{MessageType, TransactionId};
    use async_trait::async_trait;

    struct StaticPassword;

    #[async_trait]
    impl Observer for StaticPassword {
        async fn get_password(&self, _addr: &SocketAddr, username: &str) -> Option<String> {
            (username == "alice").then(|| "secret".to_string())
        }
    }

    fn source() -> SocketAddr {
        "198.51.100.7:40000".parse().unwrap()
    }

    fn signed_request(username: &str, password: &str) -> Vec<u8> {
        let key = long_term_key(username, "example.org", password);
        Message::new(MessageType::ALLOCATE_REQUEST, TransactionId::new())
            .with(AttributeType::Username, AttributeValue::Username(username.into()))
            .with(AttributeType::Realm, AttributeValue::Realm("example.org".into()))
            .encode(Some(&key), true)
            .unwrap()
            .to_vec()
    }

    #[test]
    fn test_long_term_key_known_vector() {
        // MD5("user:realm:pass")
        let key = long_term_key("user", "realm", "pass");
        assert_eq!(
            key,
            [
                0x84, 0x93, 0xfb, 0xc5, 0x3b, 0xa5, 0x82, 0xfb, 0x4c, 0x04, 0x4c, 0x45, 0x6b, 0xdc,
                0x40, 0xeb
            ]
        );
    }

    #[test]
    fn test_nonce_shape() {
        let nonce = generate_nonce();
        assert_eq!(nonce.len(), NONCE_LENGTH);
        assert!(nonce.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[tokio::test]
    async fn test_verify_accepts_valid_credentials() {
        let raw = signed_request("alice", "secret");
        let msg = Message::decode(&raw).unwrap();
        let verifier = CredentialVerifier::new("example.org");

        let credential = verifier.verify(&StaticPassword, &msg, &raw, &source()).await.unwrap();
        assert_eq!(credential.username, "alice");
        assert_eq!(credential.key, long_term_key("alice", "example.org", "secret"));
    }

    #[tokio::test]
    async fn test_missing_integrity() {
        let raw = Message::new(MessageType::ALLOCATE_REQUEST, TransactionId::new())
            .with(AttributeType::Username, AttributeValue::Username("alice".into()))
            .encode(None, false)
            .unwrap();
        let msg = Message::decode(&raw).unwrap();
        let verifier = CredentialVerifier::new("example.org");

        assert_eq!(
            verifier.verify(&StaticPassword, &msg, &raw, &source()).await,
            Err(StunError::NotIntegrity)
        );
    }

    #[tokio::test]
    async fn test_unknown_user_and_wrong_password_look_alike() {
        let verifier = CredentialVerifier::new("example.org");

        let unknown = signed_request("mallory", "secret");
        let msg = Message::decode(&unknown).unwrap();
        let a = verifier.verify(&StaticPassword, &msg, &unknown, &source()).await;

        let wrong = signed_request("alice", "guess");
        let msg = Message::decode(&wrong).unwrap();
        let b = verifier.verify(&StaticPassword, &msg, &wrong, &source()).await;

        assert_eq!(a, Err(StunError::IntegrityFailed));
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_realm_mismatch() {
        let raw = signed_request("alice", "secret");
        let msg = Message::decode(&raw).unwrap();
        let verifier = CredentialVerifier::new("other.org");

        assert_eq!(
            verifier.verify(&StaticPassword, &msg, &raw, &source()).await,
            Err(StunError::IntegrityFailed)
        );
    }

    #[tokio::test]
    async fn test_mangled_username_type_fails_integrity() {
        let key = long_term_key("alice", "example.org", "secret");
        let raw = Message::new(MessageType::ALLOCATE_REQUEST, TransactionId::new())
            .with(AttributeType::Username, AttributeValue::Username("alice".into()))
            .encode(Some(&key), false)
            .unwrap();
        assert_eq!(&raw[20..22], &[0x00, 0x06]);

        let mut tampered = raw.to_vec();
        tampered[21] = 0x07;
        let msg = Message::decode(&tampered).unwrap();
        assert!(msg.username().is_none());
        assert!(msg.has_integrity());

        let verifier = CredentialVerifier::new("example.org");
        assert_eq!(
            verifier.verify(&StaticPassword, &msg, &tampered, &source()).await,
            Err(StunError::IntegrityFailed)
        );
    }

    #[test]
    fn test_tampered_byte_fails_integrity() {
        let key = long_term_key("alice", "example.org", "secret");
        let raw = Message::new(MessageType::REFRESH_REQUEST, TransactionId::new())
            .with(AttributeType::Username, AttributeValue::Username("alice".into()))
            .with(AttributeType::Lifetime, AttributeValue::Lifetime(600))
            .encode(Some(&key), false)
            .unwrap();
        assert!(verify_integrity(&raw, &key).is_ok());

        // USERNAME value and padding, then the LIFETIME value
        for i in (24..32).chain(36..40) {
            let mut tampered = raw.to_vec();
            tampered[i] ^= 0x20;
            assert_eq!(verify_integrity(&tampered, &key), Err(StunError::IntegrityFailed));
        }
    }
}
