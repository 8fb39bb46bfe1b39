// src/turn/processor.rs
//! Method dispatcher for one (interface, external) endpoint.
//!
//! Request flow: decode, reap expired state, pre-check routing state under
//! a short lock, await the host for credentials with no lock held, then
//! re-lock and let the table re-validate before mutating. Observer
//! notifications fire after the lock is released.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, instrument, trace, warn};

use super::allocation_manager::{
    AllocateOutcome, Allocation, AllocationTable, PortPool, RefreshOutcome,
};
use super::utils::build_error_response;
use super::{FiveTuple, Observer, Response, ResponseKind, TRANSPORT_UDP};
use crate::config::TurnConfig;
use crate::error::{StunError, StunResult};
use crate::stun::auth::{generate_nonce, Credential, CredentialVerifier};
use crate::stun::{
    self, Attribute, AttributeType, AttributeValue, ChannelData, Message, MessageClass,
    MessageType, Method, Payload, TransactionId,
};

/// Snapshot of processor counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessorStats {
    pub messages_processed: u64,
    pub errors: u64,
    pub allocations_created: u64,
    /// Deleted by Refresh(0), expired, or released on shutdown
    pub allocations_removed: u64,
    pub bytes_relayed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    messages_processed: AtomicU64,
    errors: AtomicU64,
    allocations_created: AtomicU64,
    allocations_removed: AtomicU64,
    bytes_relayed: AtomicU64,
}

/// TURN processor: owns the allocations reachable through one endpoint
pub struct Processor {
    interface: SocketAddr,
    external: SocketAddr,
    config: Arc<TurnConfig>,
    verifier: CredentialVerifier,
    table: Mutex<AllocationTable>,
    observer: Arc<dyn Observer>,
    counters: Counters,
}

impl Processor {
    pub fn new(
        interface: SocketAddr,
        external: SocketAddr,
        config: Arc<TurnConfig>,
        pool: Arc<PortPool>,
        observer: Arc<dyn Observer>,
    ) -> Self {
        let table = AllocationTable::new(
            external.ip(),
            pool,
            config.permission_lifetime(),
            config.channel_lifetime(),
        );

        Self {
            interface,
            external,
            verifier: CredentialVerifier::new(config.realm.clone()),
            config,
            table: Mutex::new(table),
            observer,
            counters: Counters::default(),
        }
    }

    pub fn interface(&self) -> SocketAddr {
        self.interface
    }

    pub fn external(&self) -> SocketAddr {
        self.external
    }

    /// Handle one inbound packet from `source`.
    ///
    /// `Ok(None)` means the packet is consumed with nothing to send.
    #[instrument(skip(self, bytes), fields(len = bytes.len()), level = "debug")]
    pub async fn process(&self, bytes: &[u8], source: SocketAddr) -> StunResult<Option<Response>> {
        self.counters.messages_processed.fetch_add(1, Ordering::Relaxed);
        self.reap();

        let result = match stun::decode(bytes) {
            Ok(Payload::Message(message)) => self.handle_message(message, bytes, source).await,
            Ok(Payload::ChannelData(data)) => self.handle_channel_data(data, source),
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
            if e.is_auth_failure() {
                debug!("Authentication failed for request from {}", source);
            } else {
                debug!("Packet from {} rejected: {}", source, e);
            }
        }

        result
    }

    /// [`Processor::process`] with the source given as a string
    pub async fn process_from(&self, bytes: &[u8], source: &str) -> StunResult<Option<Response>> {
        let source: SocketAddr = source.parse().map_err(|_| StunError::InvalidInput)?;
        self.process(bytes, source).await
    }

    /// STUN error response for a request that failed with `error`.
    ///
    /// Authentication failures all produce the same 401 challenge. `None`
    /// for indications, ChannelData, undecodable input and fatal errors.
    pub fn reject(&self, bytes: &[u8], source: SocketAddr, error: StunError) -> Option<Response> {
        let code = error.error_code()?;
        let request = Message::decode(bytes).ok()?;
        if request.message_type.class != MessageClass::Request {
            return None;
        }

        debug!("Answering {:?} from {} with {}", request.message_type.method, source, code);

        let mut response = build_error_response(&request, code);
        if error.is_auth_failure() {
            response.add_attribute(Attribute::new(
                AttributeType::Realm,
                AttributeValue::Realm(self.config.realm.clone()),
            ));
            response.add_attribute(Attribute::new(
                AttributeType::Nonce,
                AttributeValue::Nonce(generate_nonce()),
            ));
        }

        response.add_attribute(self.software());
        let data = response.encode(None, true).ok()?;
        Some(Response::reply(data))
    }

    /// Wrap a datagram that arrived on relay `relay_port` from `peer` for
    /// delivery to the owning client.
    ///
    /// ChannelData when a channel is bound to `peer`, a Data indication
    /// otherwise. `None` without a live allocation or permission, or when
    /// the payload does not fit a 16-bit length.
    pub fn relay_from_peer(&self, relay_port: u16, peer: SocketAddr, payload: &[u8]) -> Option<Response> {
        if payload.len() > u16::MAX as usize {
            debug!("Datagram of {} bytes from {} too large to relay", payload.len(), peer);
            return None;
        }

        self.reap();

        let now = Instant::now();
        let (client, channel) = {
            let table = self.table.lock();
            let allocation = table.find_by_relay_port(relay_port, now)?;
            if !allocation.permissions.is_permitted(peer.ip(), now) {
                trace!("No permission for {} on relay port {}", peer, relay_port);
                return None;
            }

            (allocation.five_tuple.client, allocation.channels.channel(&peer, now))
        };

        let (data, kind) = match channel {
            Some(number) => (
                ChannelData::new(number, Bytes::copy_from_slice(payload)).encode(false),
                ResponseKind::Channel,
            ),
            None => {
                let indication = Message::new(MessageType::DATA_INDICATION, TransactionId::new())
                    .with(AttributeType::XorPeerAddress, AttributeValue::XorPeerAddress(peer))
                    .with(AttributeType::Data, AttributeValue::Raw(payload.to_vec()));
                (indication.encode(None, false).ok()?, ResponseKind::Msg)
            }
        };

        self.counters.bytes_relayed.fetch_add(payload.len() as u64, Ordering::Relaxed);
        Some(Response::relayed(data, kind, client, self.interface))
    }

    pub fn stats(&self) -> ProcessorStats {
        ProcessorStats {
            messages_processed: self.counters.messages_processed.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            allocations_created: self.counters.allocations_created.load(Ordering::Relaxed),
            allocations_removed: self.counters.allocations_removed.load(Ordering::Relaxed),
            bytes_relayed: self.counters.bytes_relayed.load(Ordering::Relaxed),
        }
    }

    /// Live allocations
    pub fn allocation_count(&self) -> usize {
        self.table.lock().live_count(Instant::now())
    }

    /// Release every allocation, returning ports to the pool
    pub fn shutdown(&self) {
        let released = self.table.lock().clear();
        for allocation in released {
            self.counters.allocations_removed.fetch_add(1, Ordering::Relaxed);
            self.observer.abort(&allocation.five_tuple.client, &allocation.username);
        }

        info!("Processor {} -> {} shut down", self.interface, self.external);
    }

    async fn handle_message(
        &self,
        message: Message,
        raw: &[u8],
        source: SocketAddr,
    ) -> StunResult<Option<Response>> {
        let five_tuple = FiveTuple::udp(source, self.interface);
        let MessageType { method, class } = message.message_type;

        match (method, class) {
            (Method::Binding, MessageClass::Request) => self.handle_binding(&message, source),
            (Method::Binding, MessageClass::Indication) => Ok(None),
            (Method::Allocate, MessageClass::Request) => {
                self.handle_allocate(&message, raw, five_tuple).await
            }
            (Method::Refresh, MessageClass::Request) => {
                self.handle_refresh(&message, raw, five_tuple).await
            }
            (Method::CreatePermission, MessageClass::Request) => {
                self.handle_create_permission(&message, raw, five_tuple).await
            }
            (Method::ChannelBind, MessageClass::Request) => {
                self.handle_channel_bind(&message, raw, five_tuple).await
            }
            (Method::Send, MessageClass::Indication) => self.handle_send_indication(&message, five_tuple),
            _ => {
                warn!("Unsupported STUN type {:?} from {}", message.message_type, source);
                Err(StunError::UnknownMethod)
            }
        }
    }

    /// Handle Binding request (RFC 8489 Section 6.3)
    fn handle_binding(&self, request: &Message, source: SocketAddr) -> StunResult<Option<Response>> {
        let response = Message::new(request.message_type.success(), request.transaction_id)
            .with(AttributeType::XorMappedAddress, AttributeValue::XorMappedAddress(source))
            .with(AttributeType::MappedAddress, AttributeValue::MappedAddress(source))
            .with(AttributeType::ResponseOrigin, AttributeValue::ResponseOrigin(self.external))
            .with(AttributeType::Software, self.software().value);

        let data = response.encode(None, true)?;
        self.observer.binding(&source);
        Ok(Some(Response::reply(data)))
    }

    /// Handle Allocate request (RFC 8656 Section 7.2)
    #[instrument(skip(self, request, raw), level = "debug")]
    async fn handle_allocate(
        &self,
        request: &Message,
        raw: &[u8],
        five_tuple: FiveTuple,
    ) -> StunResult<Option<Response>> {
        let source = five_tuple.client;
        let credential = self.authenticate(request, raw, source).await?;

        if request.requested_transport() != Some(TRANSPORT_UDP) {
            debug!("Unsupported REQUESTED-TRANSPORT from {}", source);
            return Err(StunError::InvalidInput);
        }

        if let Some(family) = request.requested_address_family() {
            if family != family_byte(self.external.ip()) {
                return Err(StunError::UnsupportedIpFamily);
            }
        }

        let lifetime = self.allocation_lifetime(request.lifetime());
        let (evicted, outcome) = {
            let now = Instant::now();
            let mut table = self.table.lock();
            let evicted = table.reap(now);
            (evicted, table.allocate(five_tuple, &credential.username, lifetime, now))
        };
        self.notify_evicted(evicted);
        let outcome = outcome?;

        let seconds = lifetime.as_secs() as u32;
        match outcome {
            AllocateOutcome::Created(relay) => {
                self.counters.allocations_created.fetch_add(1, Ordering::Relaxed);
                self.observer.allocated(&source, &credential.username, relay.port());
            }
            AllocateOutcome::Refreshed(_) => {
                self.observer.refresh(&source, &credential.username, seconds);
            }
        }

        let response = Message::new(request.message_type.success(), request.transaction_id)
            .with(
                AttributeType::XorRelayedAddress,
                AttributeValue::XorRelayedAddress(outcome.relay_addr()),
            )
            .with(AttributeType::XorMappedAddress, AttributeValue::XorMappedAddress(source))
            .with(AttributeType::Lifetime, AttributeValue::Lifetime(seconds))
            .with(AttributeType::Software, self.software().value);

        self.signed_reply(response, &credential)
    }

    /// Handle Refresh request (RFC 8656 Section 8)
    #[instrument(skip(self, request, raw), level = "debug")]
    async fn handle_refresh(
        &self,
        request: &Message,
        raw: &[u8],
        five_tuple: FiveTuple,
    ) -> StunResult<Option<Response>> {
        self.require_allocation(&five_tuple)?;

        let source = five_tuple.client;
        let credential = self.authenticate(request, raw, source).await?;

        let lifetime = match request.lifetime() {
            Some(0) => Duration::ZERO,
            requested => self.allocation_lifetime(requested),
        };

        let outcome = self
            .table
            .lock()
            .refresh(&five_tuple, &credential.username, lifetime, Instant::now())?;

        let seconds = lifetime.as_secs() as u32;
        match outcome {
            RefreshOutcome::Refreshed => {
                debug!("Allocation of {} refreshed for {}s", source, seconds);
                self.observer.refresh(&source, &credential.username, seconds);
            }
            RefreshOutcome::Deleted(_) => {
                self.counters.allocations_removed.fetch_add(1, Ordering::Relaxed);
                self.observer.abort(&source, &credential.username);
            }
        }

        let response = Message::new(request.message_type.success(), request.transaction_id)
            .with(AttributeType::Lifetime, AttributeValue::Lifetime(seconds))
            .with(AttributeType::Software, self.software().value);

        self.signed_reply(response, &credential)
    }

    /// Handle CreatePermission request (RFC 8656 Section 10)
    #[instrument(skip(self, request, raw), level = "debug")]
    async fn handle_create_permission(
        &self,
        request: &Message,
        raw: &[u8],
        five_tuple: FiveTuple,
    ) -> StunResult<Option<Response>> {
        let relay_ip = self.require_allocation(&five_tuple)?;

        let source = five_tuple.client;
        let credential = self.authenticate(request, raw, source).await?;

        let peers = request.peer_addresses();
        if peers.is_empty() {
            return Err(StunError::InvalidInput);
        }

        if peers.iter().any(|peer| !same_family(peer.ip(), relay_ip)) {
            return Err(StunError::UnsupportedIpFamily);
        }

        {
            let mut table = self.table.lock();
            let now = Instant::now();
            for peer in &peers {
                table.create_permission(&five_tuple, &credential.username, peer.ip(), now)?;
            }
        }

        for peer in &peers {
            debug!("Permission installed for {} -> {}", source, peer.ip());
            self.observer.create_permission(&source, &credential.username, peer);
        }

        let response = Message::new(request.message_type.success(), request.transaction_id)
            .with(AttributeType::Software, self.software().value);

        self.signed_reply(response, &credential)
    }

    /// Handle ChannelBind request (RFC 8656 Section 11)
    #[instrument(skip(self, request, raw), level = "debug")]
    async fn handle_channel_bind(
        &self,
        request: &Message,
        raw: &[u8],
        five_tuple: FiveTuple,
    ) -> StunResult<Option<Response>> {
        let relay_ip = self.require_allocation(&five_tuple)?;

        let source = five_tuple.client;
        let credential = self.authenticate(request, raw, source).await?;

        let channel = request.channel_number().ok_or(StunError::InvalidInput)?;
        let peer = *request.peer_addresses().first().ok_or(StunError::InvalidInput)?;
        if !same_family(peer.ip(), relay_ip) {
            return Err(StunError::UnsupportedIpFamily);
        }

        self.table
            .lock()
            .channel_bind(&five_tuple, &credential.username, channel, peer, Instant::now())?;

        info!("Bound channel {:#06x} for {} -> {}", channel, source, peer);
        self.observer.channel_bind(&source, &credential.username, channel);

        let response = Message::new(request.message_type.success(), request.transaction_id)
            .with(AttributeType::Software, self.software().value);

        self.signed_reply(response, &credential)
    }

    /// Handle Send indication (RFC 8656 Section 11.2). Never errors.
    fn handle_send_indication(
        &self,
        indication: &Message,
        five_tuple: FiveTuple,
    ) -> StunResult<Option<Response>> {
        let (peer, data) = match (indication.peer_addresses().first(), indication.data()) {
            (Some(peer), Some(data)) => (*peer, data),
            _ => {
                debug!("Send indication from {} missing peer or data", five_tuple.client);
                return Ok(None);
            }
        };

        let now = Instant::now();
        let relay_addr = {
            let mut table = self.table.lock();
            let relay_addr = match table.find_relay(&five_tuple, now) {
                Some(allocation) => allocation.relay_addr,
                None => return Ok(None),
            };

            if !table.touch_permission(&five_tuple, peer.ip(), now) {
                debug!("Send indication to {} dropped: no permission", peer);
                return Ok(None);
            }

            relay_addr
        };

        self.counters.bytes_relayed.fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(Some(Response::relayed(
            Bytes::copy_from_slice(data),
            ResponseKind::Msg,
            peer,
            relay_addr,
        )))
    }

    /// Relay ChannelData from the client to its bound peer
    fn handle_channel_data(&self, data: ChannelData, source: SocketAddr) -> StunResult<Option<Response>> {
        let five_tuple = FiveTuple::udp(source, self.interface);
        let now = Instant::now();

        let (peer, relay_addr) = {
            let table = self.table.lock();
            let allocation = table.find_relay(&five_tuple, now).ok_or(StunError::InvalidInput)?;
            let peer = allocation
                .channels
                .peer(data.number, now)
                .ok_or(StunError::InvalidInput)?;

            if !allocation.permissions.is_permitted(peer.ip(), now) {
                trace!("ChannelData to {} dropped: permission expired", peer);
                return Ok(None);
            }

            (peer, allocation.relay_addr)
        };

        self.counters.bytes_relayed.fetch_add(data.payload.len() as u64, Ordering::Relaxed);
        Ok(Some(Response::relayed(data.payload, ResponseKind::Channel, peer, relay_addr)))
    }

    /// Relay IP of the live allocation of `five_tuple`, checked before any
    /// credential lookup
    fn require_allocation(&self, five_tuple: &FiveTuple) -> StunResult<IpAddr> {
        self.table
            .lock()
            .find_relay(five_tuple, Instant::now())
            .map(|a| a.relay_addr.ip())
            .ok_or(StunError::InvalidInput)
    }

    async fn authenticate(
        &self,
        request: &Message,
        raw: &[u8],
        source: SocketAddr,
    ) -> StunResult<Credential> {
        self.verifier
            .verify(self.observer.as_ref(), request, raw, &source)
            .await
    }

    fn signed_reply(&self, response: Message, credential: &Credential) -> StunResult<Option<Response>> {
        let data = response.encode(Some(&credential.key), true)?;
        Ok(Some(Response::reply(data)))
    }

    /// Evict expired allocations and notify the host
    fn reap(&self) {
        let evicted = self.table.lock().reap(Instant::now());
        self.notify_evicted(evicted);
    }

    fn notify_evicted(&self, evicted: Vec<Allocation>) {
        for allocation in evicted {
            self.counters.allocations_removed.fetch_add(1, Ordering::Relaxed);
            self.observer.abort(&allocation.five_tuple.client, &allocation.username);
        }
    }

    /// Requested lifetime clamped to [default, max]; absent means default
    fn allocation_lifetime(&self, requested: Option<u32>) -> Duration {
        let default = self.config.default_lifetime;
        let seconds = requested.map_or(default, |s| s.max(default).min(self.config.max_lifetime));
        Duration::from_secs(seconds as u64)
    }

    fn software(&self) -> Attribute {
        Attribute::new(
            AttributeType::Software,
            AttributeValue::Software(self.config.software.clone()),
        )
    }
}

fn family_byte(ip: IpAddr) -> u8 {
    match ip {
        IpAddr::V4(_) => 0x01,
        IpAddr::V6(_) => 0x02,
    }
}

fn same_family(a: IpAddr, b: IpAddr) -> bool {
    a.is_ipv4() == b.is_ipv4()
}
