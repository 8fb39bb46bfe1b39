// src/turn/allocation_manager.rs
//! Allocation table and relay port pool
//!
//! One [`AllocationTable`] per processor maps client 5-tuples to
//! allocations. Relay ports come from a [`PortPool`] that processors sharing
//! an external IP also share. The table is a plain data structure; the
//! processor serializes access to it and passes the clock in explicitly.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, info, warn};

use super::permission_channel_manager::{ChannelTable, PermissionTable};
use super::FiveTuple;
use crate::config::PortRange;
use crate::error::{StunError, StunResult};

/// Relay ports of one external IP
#[derive(Debug)]
pub struct PortPool {
    range: PortRange,
    in_use: Mutex<HashSet<u16>>,
}

impl PortPool {
    pub fn new(range: PortRange) -> Self {
        Self {
            range,
            in_use: Mutex::new(HashSet::new()),
        }
    }

    /// Take a free port, starting the search at a random offset
    pub fn acquire(&self) -> Option<u16> {
        let capacity = self.range.len();
        if capacity == 0 {
            return None;
        }

        let mut in_use = self.in_use.lock();
        if in_use.len() >= capacity {
            warn!("Relay port pool {}-{} exhausted", self.range.start, self.range.end);
            return None;
        }

        let offset = rand::thread_rng().gen_range(0..capacity);
        (0..capacity)
            .map(|i| self.range.start + ((offset + i) % capacity) as u16)
            .find(|port| in_use.insert(*port))
    }

    pub fn release(&self, port: u16) {
        self.in_use.lock().remove(&port);
    }

    pub fn in_use(&self) -> usize {
        self.in_use.lock().len()
    }

    pub fn available(&self) -> usize {
        self.range.len() - self.in_use()
    }
}

/// A TURN allocation with its permissions and channels
#[derive(Debug)]
pub struct Allocation {
    pub five_tuple: FiveTuple,
    pub username: String,
    /// External IP and relay port
    pub relay_addr: SocketAddr,
    pub created_at: Instant,
    pub expires_at: Instant,
    pub permissions: PermissionTable,
    pub channels: ChannelTable,
}

impl Allocation {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// Seconds until expiry
    pub fn remaining(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }
}

/// Result of an Allocate against the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocateOutcome {
    Created(SocketAddr),
    /// Same 5-tuple and username already allocated; expiry was extended
    Refreshed(SocketAddr),
}

impl AllocateOutcome {
    pub fn relay_addr(&self) -> SocketAddr {
        match self {
            Self::Created(addr) | Self::Refreshed(addr) => *addr,
        }
    }
}

/// Result of a Refresh against the table
#[derive(Debug)]
pub enum RefreshOutcome {
    Refreshed,
    Deleted(Allocation),
}

/// Per-processor allocation state
#[derive(Debug)]
pub struct AllocationTable {
    allocations: HashMap<FiveTuple, Allocation>,
    relay_ports: HashMap<u16, FiveTuple>,
    relay_ip: IpAddr,
    pool: Arc<PortPool>,
    permission_lifetime: Duration,
    channel_lifetime: Duration,
}

impl AllocationTable {
    pub fn new(
        relay_ip: IpAddr,
        pool: Arc<PortPool>,
        permission_lifetime: Duration,
        channel_lifetime: Duration,
    ) -> Self {
        Self {
            allocations: HashMap::new(),
            relay_ports: HashMap::new(),
            relay_ip,
            pool,
            permission_lifetime,
            channel_lifetime,
        }
    }

    pub fn relay_ip(&self) -> IpAddr {
        self.relay_ip
    }

    /// Create an allocation, or extend the existing one of the same user.
    ///
    /// An expired entry is never extended; it is dropped and replaced.
    /// Callers wanting `abort` notifications reap first.
    pub fn allocate(
        &mut self,
        five_tuple: FiveTuple,
        username: &str,
        lifetime: Duration,
        now: Instant,
    ) -> StunResult<AllocateOutcome> {
        if self.allocations.get(&five_tuple).map_or(false, |a| a.is_expired(now)) {
            if let Some(expired) = self.remove(&five_tuple) {
                info!(
                    "Allocation expired: {} -> {} (user: {})",
                    expired.five_tuple.client, expired.relay_addr, expired.username
                );
            }
        }

        if let Some(existing) = self.allocations.get_mut(&five_tuple) {
            if existing.username != username {
                return Err(StunError::IntegrityFailed);
            }

            existing.expires_at = now + lifetime;
            debug!("Allocate retransmit from {} treated as refresh", five_tuple.client);
            return Ok(AllocateOutcome::Refreshed(existing.relay_addr));
        }

        let port = self.pool.acquire().ok_or(StunError::InvalidInput)?;
        let relay_addr = SocketAddr::new(self.relay_ip, port);

        self.allocations.insert(
            five_tuple,
            Allocation {
                five_tuple,
                username: username.to_string(),
                relay_addr,
                created_at: now,
                expires_at: now + lifetime,
                permissions: PermissionTable::new(self.permission_lifetime),
                channels: ChannelTable::new(self.channel_lifetime),
            },
        );
        self.relay_ports.insert(port, five_tuple);

        info!(
            "Allocation created: {} -> {} (user: {}, lifetime: {:?})",
            five_tuple.client, relay_addr, username, lifetime
        );
        Ok(AllocateOutcome::Created(relay_addr))
    }

    /// Extend an allocation; a zero lifetime deletes it.
    pub fn refresh(
        &mut self,
        five_tuple: &FiveTuple,
        username: &str,
        lifetime: Duration,
        now: Instant,
    ) -> StunResult<RefreshOutcome> {
        let allocation = self.owned_mut(five_tuple, username, now)?;
        if !lifetime.is_zero() {
            allocation.expires_at = now + lifetime;
            return Ok(RefreshOutcome::Refreshed);
        }

        let removed = self.remove(five_tuple).ok_or(StunError::FatalError)?;
        info!("Allocation deleted: {} -> {}", five_tuple.client, removed.relay_addr);
        Ok(RefreshOutcome::Deleted(removed))
    }

    /// Install or extend a permission. Returns true if new.
    pub fn create_permission(
        &mut self,
        five_tuple: &FiveTuple,
        username: &str,
        peer_ip: IpAddr,
        now: Instant,
    ) -> StunResult<bool> {
        let allocation = self.owned_mut(five_tuple, username, now)?;
        Ok(allocation.permissions.install(peer_ip, now))
    }

    /// Bind a channel and install the matching permission. Returns true if
    /// the binding is new.
    pub fn channel_bind(
        &mut self,
        five_tuple: &FiveTuple,
        username: &str,
        channel: u16,
        peer: SocketAddr,
        now: Instant,
    ) -> StunResult<bool> {
        let allocation = self.owned_mut(five_tuple, username, now)?;
        let is_new = allocation.channels.bind(channel, peer, now)?;
        allocation.permissions.install(peer.ip(), now);
        Ok(is_new)
    }

    /// Live allocation of a 5-tuple
    pub fn find_relay(&self, five_tuple: &FiveTuple, now: Instant) -> Option<&Allocation> {
        self.allocations
            .get(five_tuple)
            .filter(|a| !a.is_expired(now))
    }

    /// Live allocation owning relay `port`
    pub fn find_by_relay_port(&self, port: u16, now: Instant) -> Option<&Allocation> {
        let five_tuple = self.relay_ports.get(&port)?;
        self.find_relay(five_tuple, now)
    }

    pub fn is_permitted(&self, five_tuple: &FiveTuple, peer_ip: IpAddr, now: Instant) -> bool {
        self.find_relay(five_tuple, now)
            .map_or(false, |a| a.permissions.is_permitted(peer_ip, now))
    }

    /// Extend a live permission (outgoing Send). Returns false without one.
    pub fn touch_permission(&mut self, five_tuple: &FiveTuple, peer_ip: IpAddr, now: Instant) -> bool {
        match self.allocations.get_mut(five_tuple) {
            Some(allocation) if !allocation.is_expired(now) => {
                allocation.permissions.touch(peer_ip, now)
            }
            _ => false,
        }
    }

    /// Peer bound to `channel` on the allocation of `five_tuple`
    pub fn lookup_by_channel(
        &self,
        five_tuple: &FiveTuple,
        channel: u16,
        now: Instant,
    ) -> Option<SocketAddr> {
        self.find_relay(five_tuple, now)?.channels.peer(channel, now)
    }

    /// Evict expired allocations, permissions and channels.
    ///
    /// Returns the evicted allocations so the caller can notify the host.
    pub fn reap(&mut self, now: Instant) -> Vec<Allocation> {
        let expired: Vec<FiveTuple> = self
            .allocations
            .iter()
            .filter(|(_, a)| a.is_expired(now))
            .map(|(k, _)| *k)
            .collect();

        let evicted: Vec<Allocation> = expired.iter().filter_map(|k| self.remove(k)).collect();
        for allocation in &evicted {
            info!(
                "Allocation expired: {} -> {} (user: {})",
                allocation.five_tuple.client, allocation.relay_addr, allocation.username
            );
        }

        for allocation in self.allocations.values_mut() {
            allocation.permissions.reap(now);
            allocation.channels.reap(now);
        }

        evicted
    }

    /// Remove an allocation and return its port to the pool
    pub fn remove(&mut self, five_tuple: &FiveTuple) -> Option<Allocation> {
        let allocation = self.allocations.remove(five_tuple)?;
        let port = allocation.relay_addr.port();
        self.relay_ports.remove(&port);
        self.pool.release(port);
        Some(allocation)
    }

    /// Remove everything, returning ports to the pool
    pub fn clear(&mut self) -> Vec<Allocation> {
        let keys: Vec<FiveTuple> = self.allocations.keys().copied().collect();
        keys.iter().filter_map(|k| self.remove(k)).collect()
    }

    pub fn len(&self) -> usize {
        self.allocations.len()
    }

    /// Allocations not yet expired at `now`
    pub fn live_count(&self, now: Instant) -> usize {
        self.allocations.values().filter(|a| !a.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }

    fn owned_mut(
        &mut self,
        five_tuple: &FiveTuple,
        username: &str,
        now: Instant,
    ) -> StunResult<&mut Allocation> {
        match self.allocations.get_mut(five_tuple) {
            Some(allocation) if !allocation.is_expired(now) => {
                if allocation.username != username {
                    return Err(StunError::IntegrityFailed);
                }

                Ok(allocation)
            }
            _ => Err(StunError::InvalidInput),
        }
    }
}

impl Drop for AllocationTable {
    fn drop(&mut self) {
        for (port, _) in self.relay_ports.drain() {
            self.pool.release(port);
        }
    }
}
