// src/stun/mod.rs
//! STUN message codec and credential checks
//!
//! - RFC 8489 message framing, XOR address encoding and FINGERPRINT
//! - RFC 8656 ChannelData framing
//! - Long-term credentials with MESSAGE-INTEGRITY (HMAC-SHA1)

pub mod auth;
pub mod channel;
pub mod protocol;

pub use auth::{long_term_key, verify_integrity, Credential, CredentialVerifier};
pub use channel::{decode, is_valid_channel_number, ChannelData, Payload};
pub use protocol::{
    Attribute, AttributeType, AttributeValue, Message, MessageClass, MessageType, Method,
    TransactionId, MAGIC_COOKIE,
};
