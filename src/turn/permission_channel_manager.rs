// src/turn/permission_channel_manager.rs
//! Permission and Channel management for TURN relay
//!
//! Implements:
//! - RFC 8656 Permission management (Section 9)
//! - RFC 8656 Channel management (Section 12)
//!
//! Both tables belong to one allocation and are guarded by the allocation
//! table lock. Entries expire lazily: every read takes `now` and ignores
//! stale entries, `reap` removes them.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::error::{StunError, StunResult};
use crate::stun::is_valid_channel_number;

/// Permission for one peer IP
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permission {
    pub peer_ip: IpAddr,
    pub expires_at: Instant,
}

impl Permission {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Peer IP -> permission
#[derive(Debug)]
pub struct PermissionTable {
    permissions: HashMap<IpAddr, Permission>,
    lifetime: Duration,
}

impl PermissionTable {
    pub fn new(lifetime: Duration) -> Self {
        Self {
            permissions: HashMap::new(),
            lifetime,
        }
    }

    /// Install or extend the permission for `peer_ip`. Returns true if new.
    pub fn install(&mut self, peer_ip: IpAddr, now: Instant) -> bool {
        let expires_at = now + self.lifetime;
        match self.permissions.get_mut(&peer_ip) {
            Some(permission) if !permission.is_expired(now) => {
                permission.expires_at = expires_at;
                false
            }
            _ => {
                self.permissions.insert(peer_ip, Permission { peer_ip, expires_at });
                true
            }
        }
    }

    /// Extend an unexpired permission, leaving absent ones absent
    pub fn touch(&mut self, peer_ip: IpAddr, now: Instant) -> bool {
        match self.permissions.get_mut(&peer_ip) {
            Some(permission) if !permission.is_expired(now) => {
                permission.expires_at = now + self.lifetime;
                true
            }
            _ => false,
        }
    }

    pub fn is_permitted(&self, peer_ip: IpAddr, now: Instant) -> bool {
        self.permissions
            .get(&peer_ip)
            .map_or(false, |p| !p.is_expired(now))
    }

    pub fn get(&self, peer_ip: IpAddr) -> Option<&Permission> {
        self.permissions.get(&peer_ip)
    }

    /// Drop expired permissions, returning how many were removed
    pub fn reap(&mut self, now: Instant) -> usize {
        let before = self.permissions.len();
        self.permissions.retain(|_, p| !p.is_expired(now));
        before - self.permissions.len()
    }

    pub fn len(&self) -> usize {
        self.permissions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.permissions.is_empty()
    }
}

/// Channel bound to a peer transport address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelBinding {
    /// Channel number (0x4000-0x7FFF)
    pub channel_number: u16,
    pub peer_addr: SocketAddr,
    pub expires_at: Instant,
}

impl ChannelBinding {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Channel number <-> peer address, one-to-one
#[derive(Debug)]
pub struct ChannelTable {
    channels: HashMap<u16, ChannelBinding>,
    peers: HashMap<SocketAddr, u16>,
    lifetime: Duration,
}

impl ChannelTable {
    pub fn new(lifetime: Duration) -> Self {
        Self {
            channels: HashMap::new(),
            peers: HashMap::new(),
            lifetime,
        }
    }

    /// Bind `channel` to `peer`, or refresh the existing identical binding.
    ///
    /// Fails with `InvalidInput` when the number is out of range, already
    /// bound to another peer, or the peer already holds another channel.
    /// Nothing is modified on failure. Returns true if the binding is new.
    pub fn bind(&mut self, channel: u16, peer: SocketAddr, now: Instant) -> StunResult<bool> {
        if !is_valid_channel_number(channel) {
            return Err(StunError::InvalidInput);
        }

        self.reap(now);

        if let Some(existing) = self.channels.get(&channel) {
            if existing.peer_addr != peer {
                trace!("Channel {:#06x} already bound to {}", channel, existing.peer_addr);
                return Err(StunError::InvalidInput);
            }
        }

        if let Some(number) = self.peers.get(&peer) {
            if *number != channel {
                trace!("Peer {} already bound to channel {:#06x}", peer, number);
                return Err(StunError::InvalidInput);
            }
        }

        let binding = ChannelBinding {
            channel_number: channel,
            peer_addr: peer,
            expires_at: now + self.lifetime,
        };

        let is_new = self.channels.insert(channel, binding).is_none();
        self.peers.insert(peer, channel);
        Ok(is_new)
    }

    /// Peer bound to `channel`
    pub fn peer(&self, channel: u16, now: Instant) -> Option<SocketAddr> {
        self.channels
            .get(&channel)
            .filter(|b| !b.is_expired(now))
            .map(|b| b.peer_addr)
    }

    /// Channel bound to `peer`
    pub fn channel(&self, peer: &SocketAddr, now: Instant) -> Option<u16> {
        let number = *self.peers.get(peer)?;
        self.channels
            .get(&number)
            .filter(|b| !b.is_expired(now))
            .map(|b| b.channel_number)
    }

    pub fn get(&self, channel: u16) -> Option<&ChannelBinding> {
        self.channels.get(&channel)
    }

    /// Drop expired bindings, returning how many were removed
    pub fn reap(&mut self, now: Instant) -> usize {
        let expired: Vec<ChannelBinding> = self
            .channels
            .values()
            .filter(|b| b.is_expired(now))
            .copied()
            .collect();

        for binding in &expired {
            self.channels.remove(&binding.channel_number);
            self.peers.remove(&binding.peer_addr);
        }

        expired.len()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
