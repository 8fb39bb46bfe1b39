// tests/integration_tests.rs
//! End-to-end tests driving the TURN core through `Service`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::sleep;
use tracing::info;

use turn_core::stun::{
    long_term_key, AttributeType, AttributeValue, ChannelData, Message, MessageClass, MessageType,
    TransactionId,
};
use turn_core::{
    Observer, Processor, ResponseKind, Service, StunError, StunResult, TurnConfig,
};

const REALM: &str = "example.org";
const EXTERNAL: &str = "203.0.113.1:3478";
const INTERFACE: &str = "10.0.0.1:3478";

/// Setup test logging
fn setup_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    GetPassword(String),
    Allocated(SocketAddr, String, u16),
    Binding(SocketAddr),
    ChannelBind(SocketAddr, String, u16),
    CreatePermission(SocketAddr, String, SocketAddr),
    Refresh(SocketAddr, String, u32),
    Abort(SocketAddr, String),
}

/// Observer knowing alice and bob, recording every hook
#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<Event>>,
    /// Applied to every password lookup while set
    delay: Mutex<Option<Duration>>,
    /// Next lookup signals `entered`, then waits for `release`
    gate: Mutex<Option<Gate>>,
}

#[derive(Clone, Default)]
struct Gate {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

impl Recorder {
    fn slow_lookups(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    fn hold_next_lookup(&self) -> Gate {
        let gate = Gate::default();
        *self.gate.lock() = Some(gate.clone());
        gate
    }

    fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    fn clear(&self) {
        self.events.lock().clear();
    }

    fn push(&self, event: Event) {
        self.events.lock().push(event);
    }
}

#[async_trait]
impl Observer for Recorder {
    async fn get_password(&self, _addr: &SocketAddr, username: &str) -> Option<String> {
        self.push(Event::GetPassword(username.to_string()));

        let gate = self.gate.lock().take();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            sleep(delay).await;
        }

        match username {
            "alice" => Some("wonderland".to_string()),
            "bob" => Some("builder".to_string()),
            _ => None,
        }
    }

    fn allocated(&self, addr: &SocketAddr, name: &str, port: u16) {
        self.push(Event::Allocated(*addr, name.to_string(), port));
    }

    fn binding(&self, addr: &SocketAddr) {
        self.push(Event::Binding(*addr));
    }

    fn channel_bind(&self, addr: &SocketAddr, name: &str, channel: u16) {
        self.push(Event::ChannelBind(*addr, name.to_string(), channel));
    }

    fn create_permission(&self, addr: &SocketAddr, name: &str, peer: &SocketAddr) {
        self.push(Event::CreatePermission(*addr, name.to_string(), *peer));
    }

    fn refresh(&self, addr: &SocketAddr, name: &str, lifetime: u32) {
        self.push(Event::Refresh(*addr, name.to_string(), lifetime));
    }

    fn abort(&self, addr: &SocketAddr, name: &str) {
        self.push(Event::Abort(*addr, name.to_string()));
    }
}

/// Client-side request builder
struct Client {
    addr: SocketAddr,
    username: String,
    password: String,
}

impl Client {
    fn alice() -> Self {
        Self::new("198.51.100.7:40000", "alice", "wonderland")
    }

    fn new(addr: &str, username: &str, password: &str) -> Self {
        Self {
            addr: addr.parse().unwrap(),
            username: username.into(),
            password: password.into(),
        }
    }

    fn signed(&self, message: Message) -> Vec<u8> {
        let key = long_term_key(&self.username, REALM, &self.password);
        message
            .with(AttributeType::Username, AttributeValue::Username(self.username.clone()))
            .with(AttributeType::Realm, AttributeValue::Realm(REALM.into()))
            .with(AttributeType::Nonce, AttributeValue::Nonce("abcdefghijklmnop".into()))
            .encode(Some(&key), true)
            .unwrap()
            .to_vec()
    }

    fn allocate(&self) -> Vec<u8> {
        self.signed(
            Message::new(MessageType::ALLOCATE_REQUEST, TransactionId::new()).with(
                AttributeType::RequestedTransport,
                AttributeValue::RequestedTransport(17),
            ),
        )
    }

    fn refresh(&self, lifetime: u32) -> Vec<u8> {
        self.signed(
            Message::new(MessageType::REFRESH_REQUEST, TransactionId::new())
                .with(AttributeType::Lifetime, AttributeValue::Lifetime(lifetime)),
        )
    }

    fn create_permission(&self, peers: &[SocketAddr]) -> Vec<u8> {
        let mut message = Message::new(MessageType::CREATE_PERMISSION_REQUEST, TransactionId::new());
        for peer in peers {
            message = message.with(AttributeType::XorPeerAddress, AttributeValue::XorPeerAddress(*peer));
        }
        self.signed(message)
    }

    fn channel_bind(&self, channel: u16, peer: SocketAddr) -> Vec<u8> {
        self.signed(
            Message::new(MessageType::CHANNEL_BIND_REQUEST, TransactionId::new())
                .with(AttributeType::ChannelNumber, AttributeValue::ChannelNumber(channel))
                .with(AttributeType::XorPeerAddress, AttributeValue::XorPeerAddress(peer)),
        )
    }

    fn send(&self, peer: SocketAddr, data: &[u8]) -> Vec<u8> {
        Message::new(MessageType::SEND_INDICATION, TransactionId::new())
            .with(AttributeType::XorPeerAddress, AttributeValue::XorPeerAddress(peer))
            .with(AttributeType::Data, AttributeValue::Raw(data.to_vec()))
            .encode(None, false)
            .unwrap()
            .to_vec()
    }

    fn channel_data(&self, channel: u16, data: &[u8]) -> Vec<u8> {
        ChannelData::new(channel, bytes::Bytes::copy_from_slice(data))
            .encode(false)
            .to_vec()
    }
}

fn peer(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

fn setup() -> (Arc<Recorder>, Service, Arc<Processor>) {
    setup_test_logging();
    let recorder = Arc::new(Recorder::default());
    let service = Service::create(REALM, &[EXTERNAL], recorder.clone()).unwrap();
    let processor = service.get_processor(INTERFACE, EXTERNAL).unwrap();
    (recorder, service, processor)
}

async fn allocate(processor: &Processor, client: &Client) -> StunResult<u16> {
    let response = processor
        .process(&client.allocate(), client.addr)
        .await?
        .ok_or(StunError::FatalError)?;
    let message = Message::decode(&response.data)?;
    match message.get_attribute(AttributeType::XorRelayedAddress).map(|a| &a.value) {
        Some(AttributeValue::XorRelayedAddress(relay)) => Ok(relay.port()),
        _ => Err(StunError::FatalError),
    }
}

#[tokio::test]
async fn test_binding_echoes_source() -> StunResult<()> {
    let (recorder, _service, processor) = setup();
    let client = Client::alice();
    let request = Message::new(MessageType::BINDING_REQUEST, TransactionId::new()).encode(None, false)?;

    let response = processor.process(&request, client.addr).await?.unwrap();
    assert!(response.is_reply());

    let message = Message::decode(&response.data)?;
    assert_eq!(message.message_type, MessageType::BINDING_REQUEST.success());
    assert_eq!(
        message.get_attribute(AttributeType::XorMappedAddress).map(|a| &a.value),
        Some(&AttributeValue::XorMappedAddress(client.addr))
    );
    assert_eq!(recorder.events(), vec![Event::Binding(client.addr)]);
    Ok(())
}

#[tokio::test]
async fn test_allocate_with_valid_credentials() -> StunResult<()> {
    let (recorder, _service, processor) = setup();
    let client = Client::alice();

    let port = allocate(&processor, &client).await?;
    info!("Allocated relay port {}", port);

    assert_ne!(port, 0);
    assert_eq!(processor.allocation_count(), 1);
    assert_eq!(
        recorder.events(),
        vec![
            Event::GetPassword("alice".into()),
            Event::Allocated(client.addr, "alice".into(), port),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn test_duplicate_allocate_is_refresh() -> StunResult<()> {
    let (recorder, service, processor) = setup();
    let client = Client::alice();

    let first = allocate(&processor, &client).await?;
    let second = allocate(&processor, &client).await?;

    assert_eq!(first, second);
    assert_eq!(processor.allocation_count(), 1);
    assert_eq!(processor.stats().allocations_created, 1);
    assert_eq!(service.ports_in_use(peer(EXTERNAL).ip()), 1);
    assert!(recorder
        .events()
        .contains(&Event::Refresh(client.addr, "alice".into(), 600)));
    Ok(())
}

#[tokio::test]
async fn test_allocate_from_other_user_on_same_five_tuple() -> StunResult<()> {
    let (_recorder, _service, processor) = setup();
    let alice = Client::alice();
    allocate(&processor, &alice).await?;

    // Valid credentials of another user from the same 5-tuple
    let impostor = Client::new("198.51.100.7:40000", "bob", "builder");
    assert_eq!(
        processor.process(&impostor.allocate(), impostor.addr).await,
        Err(StunError::IntegrityFailed)
    );
    assert_eq!(processor.allocation_count(), 1);
    Ok(())
}

#[tokio::test]
async fn test_unknown_user_is_integrity_failure() {
    let (recorder, _service, processor) = setup();
    let mallory = Client::new("198.51.100.9:40000", "mallory", "whatever");

    let result = processor.process(&mallory.allocate(), mallory.addr).await;
    assert_eq!(result, Err(StunError::IntegrityFailed));
    assert_eq!(recorder.events(), vec![Event::GetPassword("mallory".into())]);

    // Wire response is the generic 401 challenge
    let response = processor
        .reject(&mallory.allocate(), mallory.addr, StunError::IntegrityFailed)
        .unwrap();
    let message = Message::decode(&response.data).unwrap();
    assert_eq!(message.message_type.class, MessageClass::ErrorResponse);
    assert_eq!(
        message.get_attribute(AttributeType::ErrorCode).map(|a| &a.value),
        Some(&AttributeValue::ErrorCode {
            code: 401,
            reason: "Unauthorized".into()
        })
    );
}

#[tokio::test]
async fn test_create_permission_without_allocation() {
    let (recorder, _service, processor) = setup();
    let client = Client::alice();

    let result = processor
        .process(&client.create_permission(&[peer("203.0.113.9:0")]), client.addr)
        .await;

    assert_eq!(result, Err(StunError::InvalidInput));
    assert!(recorder.events().is_empty());
}

#[tokio::test]
async fn test_create_permission_and_send() -> StunResult<()> {
    let (recorder, _service, processor) = setup();
    let client = Client::alice();
    let relay_port = allocate(&processor, &client).await?;
    let peer_a = peer("203.0.113.9:5000");
    let peer_b = peer("203.0.113.10:5000");

    // No permission yet: silent drop
    assert_eq!(processor.process(&client.send(peer_a, b"early"), client.addr).await?, None);

    recorder.clear();
    let response = processor
        .process(&client.create_permission(&[peer_a, peer_b]), client.addr)
        .await?
        .unwrap();
    assert_eq!(
        Message::decode(&response.data)?.message_type,
        MessageType::CREATE_PERMISSION_REQUEST.success()
    );
    assert_eq!(
        recorder.events(),
        vec![
            Event::GetPassword("alice".into()),
            Event::CreatePermission(client.addr, "alice".into(), peer_a),
            Event::CreatePermission(client.addr, "alice".into(), peer_b),
        ]
    );

    let relayed = processor
        .process(&client.send(peer_a, b"hello"), client.addr)
        .await?
        .unwrap();
    assert_eq!(&relayed.data[..], b"hello");
    assert_eq!(relayed.kind, ResponseKind::Msg);
    assert_eq!(relayed.relay, Some(peer_a));
    assert_eq!(relayed.interface.map(|a| a.port()), Some(relay_port));
    assert_eq!(processor.stats().bytes_relayed, 5);
    Ok(())
}

#[tokio::test]
async fn test_create_permission_family_mismatch() -> StunResult<()> {
    let (_recorder, _service, processor) = setup();
    let client = Client::alice();
    allocate(&processor, &client).await?;

    let result = processor
        .process(&client.create_permission(&[peer("[2001:db8::1]:5000")]), client.addr)
        .await;
    assert_eq!(result, Err(StunError::UnsupportedIpFamily));
    Ok(())
}

#[tokio::test]
async fn test_channel_bind_conflict_keeps_first_binding() -> StunResult<()> {
    let (recorder, _service, processor) = setup();
    let client = Client::alice();
    allocate(&processor, &client).await?;
    let peer_a = peer("203.0.113.9:5000");
    let peer_b = peer("203.0.113.10:5000");

    processor.process(&client.channel_bind(0x4001, peer_a), client.addr).await?;
    // Idempotent for the same triple
    processor.process(&client.channel_bind(0x4001, peer_a), client.addr).await?;

    let result = processor.process(&client.channel_bind(0x4001, peer_b), client.addr).await;
    assert_eq!(result, Err(StunError::InvalidInput));

    let binds: Vec<_> = recorder
        .events()
        .into_iter()
        .filter(|e| matches!(e, Event::ChannelBind(..)))
        .collect();
    assert_eq!(binds.len(), 2);

    let relayed = processor
        .process(&client.channel_data(0x4001, b"ping"), client.addr)
        .await?
        .unwrap();
    assert_eq!(relayed.relay, Some(peer_a));
    assert_eq!(relayed.kind, ResponseKind::Channel);
    assert_eq!(&relayed.data[..], b"ping");
    Ok(())
}

#[tokio::test]
async fn test_channel_bind_out_of_range() -> StunResult<()> {
    let (_recorder, _service, processor) = setup();
    let client = Client::alice();
    allocate(&processor, &client).await?;

    let result = processor
        .process(&client.channel_bind(0x3000, peer("203.0.113.9:5000")), client.addr)
        .await;
    assert_eq!(result, Err(StunError::InvalidInput));
    Ok(())
}

#[tokio::test]
async fn test_unbound_channel_data_is_error() -> StunResult<()> {
    let (_recorder, _service, processor) = setup();
    let client = Client::alice();
    allocate(&processor, &client).await?;

    let result = processor.process(&client.channel_data(0x4002, b"x"), client.addr).await;
    assert_eq!(result, Err(StunError::InvalidInput));
    Ok(())
}

#[tokio::test]
async fn test_refresh_zero_deletes_allocation() -> StunResult<()> {
    let (recorder, service, processor) = setup();
    let client = Client::alice();
    allocate(&processor, &client).await?;
    let peer_a = peer("203.0.113.9:5000");
    processor.process(&client.channel_bind(0x4001, peer_a), client.addr).await?;

    recorder.clear();
    let response = processor.process(&client.refresh(0), client.addr).await?.unwrap();
    assert_eq!(Message::decode(&response.data)?.lifetime(), Some(0));
    assert_eq!(
        recorder.events(),
        vec![
            Event::GetPassword("alice".into()),
            Event::Abort(client.addr, "alice".into()),
        ]
    );
    assert_eq!(processor.allocation_count(), 0);
    assert_eq!(service.ports_in_use(peer(EXTERNAL).ip()), 0);

    assert_eq!(
        processor.process(&client.channel_data(0x4001, b"x"), client.addr).await,
        Err(StunError::InvalidInput)
    );
    assert_eq!(processor.process(&client.send(peer_a, b"x"), client.addr).await?, None);
    Ok(())
}

#[tokio::test]
async fn test_refresh_extends_lifetime() -> StunResult<()> {
    let (recorder, _service, processor) = setup();
    let client = Client::alice();
    allocate(&processor, &client).await?;

    let response = processor.process(&client.refresh(1800), client.addr).await?.unwrap();
    assert_eq!(Message::decode(&response.data)?.lifetime(), Some(1800));
    assert!(recorder
        .events()
        .contains(&Event::Refresh(client.addr, "alice".into(), 1800)));
    Ok(())
}

#[tokio::test]
async fn test_tampered_request_fails_integrity() -> StunResult<()> {
    let (_recorder, _service, processor) = setup();
    let client = Client::alice();
    let mut request = client.allocate();

    // Flip a bit in the REQUESTED-TRANSPORT value, then drop FINGERPRINT so
    // the codec accepts the frame and the integrity check sees the change.
    request[24] ^= 0x01;
    request.truncate(request.len() - 8);
    let len = (request.len() - 20) as u16;
    request[2..4].copy_from_slice(&len.to_be_bytes());

    assert_eq!(
        processor.process(&request, client.addr).await,
        Err(StunError::IntegrityFailed)
    );
    assert_eq!(processor.allocation_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_relay_from_peer() -> StunResult<()> {
    let (_recorder, _service, processor) = setup();
    let client = Client::alice();
    let relay_port = allocate(&processor, &client).await?;
    let peer_a = peer("203.0.113.9:5000");
    let peer_b = peer("203.0.113.10:5000");

    assert!(processor.relay_from_peer(relay_port, peer_a, b"nope").is_none());

    processor.process(&client.create_permission(&[peer_a]), client.addr).await?;
    let data = processor.relay_from_peer(relay_port, peer_a, b"hi").unwrap();
    assert_eq!(data.kind, ResponseKind::Msg);
    assert_eq!(data.relay, Some(client.addr));
    assert_eq!(data.interface, Some(peer(INTERFACE)));

    let indication = Message::decode(&data.data)?;
    assert_eq!(indication.message_type, MessageType::DATA_INDICATION);
    assert_eq!(indication.data(), Some(&b"hi"[..]));
    assert_eq!(indication.peer_addresses(), vec![peer_a]);

    processor.process(&client.channel_bind(0x4005, peer_b), client.addr).await?;
    let framed = processor.relay_from_peer(relay_port, peer_b, b"yo").unwrap();
    assert_eq!(framed.kind, ResponseKind::Channel);
    assert_eq!(ChannelData::decode(&framed.data)?, ChannelData::new(0x4005, "yo".into()));
    Ok(())
}

#[tokio::test]
async fn test_processors_are_independent() -> StunResult<()> {
    setup_test_logging();
    let recorder = Arc::new(Recorder::default());
    let service = Service::create(REALM, &[EXTERNAL, "203.0.113.1:3479"], recorder).unwrap();
    let first = service.get_processor(INTERFACE, EXTERNAL).unwrap();
    let second = service.get_processor("10.0.0.1:3479", "203.0.113.1:3479").unwrap();
    let client = Client::alice();

    let a = allocate(&first, &client).await?;
    let b = allocate(&second, &client).await?;

    // Same external IP: ports come from one pool
    assert_ne!(a, b);
    assert_eq!(first.allocation_count(), 1);
    assert_eq!(second.allocation_count(), 1);
    assert_eq!(service.ports_in_use(peer(EXTERNAL).ip()), 2);

    service.remove_processor("10.0.0.1:3479", "203.0.113.1:3479").unwrap();
    assert_eq!(service.ports_in_use(peer(EXTERNAL).ip()), 1);
    Ok(())
}

#[tokio::test]
async fn test_expired_allocation_is_reaped() -> StunResult<()> {
    setup_test_logging();
    let recorder = Arc::new(Recorder::default());
    let mut config = TurnConfig::new(REALM, &[EXTERNAL]);
    config.default_lifetime = 1;
    config.max_lifetime = 1;
    let service = Service::new(config, recorder.clone()).unwrap();
    let processor = service.get_processor(INTERFACE, EXTERNAL).unwrap();
    let client = Client::alice();

    allocate(&processor, &client).await?;
    sleep(Duration::from_millis(1100)).await;

    let binding = Message::new(MessageType::BINDING_REQUEST, TransactionId::new()).encode(None, false)?;
    processor.process(&binding, client.addr).await?;

    assert!(recorder.events().contains(&Event::Abort(client.addr, "alice".into())));
    assert_eq!(processor.allocation_count(), 0);
    assert_eq!(processor.stats().allocations_removed, 1);
    Ok(())
}

#[tokio::test]
async fn test_allocate_after_expiry_during_lookup() -> StunResult<()> {
    setup_test_logging();
    let recorder = Arc::new(Recorder::default());
    let mut config = TurnConfig::new(REALM, &[EXTERNAL]);
    config.default_lifetime = 1;
    config.max_lifetime = 1;
    let service = Service::new(config, recorder.clone()).unwrap();
    let processor = service.get_processor(INTERFACE, EXTERNAL).unwrap();
    let client = Client::alice();

    let first = allocate(&processor, &client).await?;

    // The allocation lapses while the second request waits on its password
    recorder.slow_lookups(Duration::from_millis(1200));
    let second = allocate(&processor, &client).await?;

    let events = recorder.events();
    info!("Events: {:?}", events);
    assert_eq!(
        events,
        vec![
            Event::GetPassword("alice".into()),
            Event::Allocated(client.addr, "alice".into(), first),
            Event::GetPassword("alice".into()),
            Event::Abort(client.addr, "alice".into()),
            Event::Allocated(client.addr, "alice".into(), second),
        ]
    );

    let stats = processor.stats();
    assert_eq!(stats.allocations_created, 2);
    assert_eq!(stats.allocations_removed, 1);
    assert_eq!(processor.allocation_count(), 1);
    assert_eq!(service.ports_in_use(peer(EXTERNAL).ip()), 1);
    Ok(())
}

#[tokio::test]
async fn test_allocation_deleted_while_request_awaits_credentials() -> StunResult<()> {
    let (recorder, service, processor) = setup();
    let client = Arc::new(Client::alice());
    allocate(&processor, &client).await?;
    let peer_a = peer("203.0.113.9:5000");

    let gate = recorder.hold_next_lookup();
    let pending = {
        let processor = processor.clone();
        let client = client.clone();
        tokio::spawn(async move {
            processor
                .process(&client.create_permission(&[peer_a]), client.addr)
                .await
        })
    };
    gate.entered.notified().await;

    processor.process(&client.refresh(0), client.addr).await?;
    assert_eq!(processor.allocation_count(), 0);

    recorder.clear();
    gate.release.notify_one();
    let result = pending.await.unwrap();

    assert_eq!(result, Err(StunError::InvalidInput));
    assert!(recorder.events().is_empty());
    assert_eq!(processor.allocation_count(), 0);
    assert_eq!(service.ports_in_use(peer(EXTERNAL).ip()), 0);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_allocations() {
    let (_recorder, service, processor) = setup();

    let mut handles = Vec::new();
    for i in 0..16 {
        let processor = processor.clone();
        handles.push(tokio::spawn(async move {
            let client = Client::new(&format!("198.51.100.{}:40000", i + 1), "alice", "wonderland");
            allocate(&processor, &client).await
        }));
    }

    let mut ports = Vec::new();
    for handle in handles {
        ports.push(handle.await.unwrap().unwrap());
    }
    ports.sort_unstable();
    ports.dedup();

    assert_eq!(ports.len(), 16);
    assert_eq!(processor.allocation_count(), 16);
    assert_eq!(service.ports_in_use(peer(EXTERNAL).ip()), 16);
}
