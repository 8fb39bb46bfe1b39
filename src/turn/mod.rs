// src/turn/mod.rs
//! TURN relay core (RFC 8656).
//!
//! The core never touches sockets. A host hands inbound packets to a
//! [`Processor`] and sends whatever [`Response`] comes back; relay sockets
//! and credential storage stay with the host behind the [`Observer`] hooks.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

pub mod allocation_manager;
pub mod permission_channel_manager;
pub mod processor;
pub mod service;

pub use allocation_manager::{Allocation, AllocationTable, PortPool};
pub use permission_channel_manager::{ChannelBinding, ChannelTable, Permission, PermissionTable};
pub use processor::{Processor, ProcessorStats};
pub use service::Service;

/// Default allocation lifetime
pub const DEFAULT_ALLOCATION_LIFETIME: Duration = Duration::from_secs(600);

/// Upper bound for requested allocation lifetimes
pub const MAX_ALLOCATION_LIFETIME: Duration = Duration::from_secs(3600);

/// Permission lifetime (RFC 8656 Section 9)
pub const PERMISSION_LIFETIME: Duration = Duration::from_secs(300);

/// Channel binding lifetime (RFC 8656 Section 12)
pub const CHANNEL_BIND_LIFETIME: Duration = Duration::from_secs(600);

/// REQUESTED-TRANSPORT protocol number for UDP
pub const TRANSPORT_UDP: u8 = 17;

/// Host capability the core calls into.
///
/// Only `get_password` returns a value; the rest are notifications and may
/// be left at their no-op defaults. `get_password` must complete in bounded
/// time, the core applies no timeout of its own.
#[async_trait]
pub trait Observer: Send + Sync {
    /// Password for `username` as seen from `addr`, `None` if unknown
    async fn get_password(&self, addr: &SocketAddr, username: &str) -> Option<String>;

    /// An allocation was created and assigned relay `port`
    fn allocated(&self, _addr: &SocketAddr, _name: &str, _port: u16) {}

    /// A Binding request was answered
    fn binding(&self, _addr: &SocketAddr) {}

    /// `channel` was bound or refreshed
    fn channel_bind(&self, _addr: &SocketAddr, _name: &str, _channel: u16) {}

    /// A permission for `peer` was installed or refreshed
    fn create_permission(&self, _addr: &SocketAddr, _name: &str, _peer: &SocketAddr) {}

    /// An allocation was refreshed to `lifetime` seconds
    fn refresh(&self, _addr: &SocketAddr, _name: &str, _lifetime: u32) {}

    /// An allocation was deleted or expired
    fn abort(&self, _addr: &SocketAddr, _name: &str) {}
}

/// Transport protocol of a 5-tuple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    Udp,
    Tcp,
}

/// Client 5-tuple: client address, server address, transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiveTuple {
    pub client: SocketAddr,
    pub server: SocketAddr,
    pub protocol: TransportProtocol,
}

impl FiveTuple {
    pub fn udp(client: SocketAddr, server: SocketAddr) -> Self {
        Self {
            client,
            server,
            protocol: TransportProtocol::Udp,
        }
    }
}

/// Framing of a response payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseKind {
    /// STUN message, or payload relayed from a Send indication
    Msg,
    /// ChannelData, or payload relayed from ChannelData
    Channel,
}

/// Bytes the host should send.
///
/// With `relay` and `interface` unset the data goes back to the packet
/// source through the receiving interface. Otherwise it is sent to `relay`
/// from the local address `interface`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub data: Bytes,
    pub kind: ResponseKind,
    pub relay: Option<SocketAddr>,
    pub interface: Option<SocketAddr>,
}

impl Response {
    /// Reply to the packet source
    pub fn reply(data: Bytes) -> Self {
        Self {
            data,
            kind: ResponseKind::Msg,
            relay: None,
            interface: None,
        }
    }

    /// Payload to send to `to` from local address `from`
    pub fn relayed(data: Bytes, kind: ResponseKind, to: SocketAddr, from: SocketAddr) -> Self {
        Self {
            data,
            kind,
            relay: Some(to),
            interface: Some(from),
        }
    }

    pub fn is_reply(&self) -> bool {
        self.relay.is_none()
    }
}

/// Helper utilities for building responses
pub(crate) mod utils {
    use crate::stun::{Attribute, AttributeType, AttributeValue, Message};

    /// Standard reason phrase for an error code
    pub fn reason_phrase(code: u16) -> &'static str {
        match code {
            400 => "Bad Request",
            401 => "Unauthorized",
            437 => "Allocation Mismatch",
            440 => "Address Family not Supported",
            441 => "Wrong Credentials",
            442 => "Unsupported Transport Protocol",
            508 => "Insufficient Capacity",
            _ => "Error",
        }
    }

    pub fn build_error_response(req: &Message, code: u16) -> Message {
        let mut resp = Message::new(req.message_type.error(), req.transaction_id);
        resp.add_attribute(Attribute::new(
            AttributeType::ErrorCode,
            AttributeValue::ErrorCode {
                code,
                reason: reason_phrase(code).to_string(),
            },
        ));
        resp
    }
}
