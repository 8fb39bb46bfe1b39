use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use turn_core::{init_logging, Observer, Processor, Response, Service, TurnConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "TURN relay server", long_about = None)]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address
    #[arg(short, long, default_value = "0.0.0.0:3478")]
    bind: SocketAddr,

    /// Advertised external address, overrides the config file
    #[arg(short, long)]
    external: Option<String>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Relay socket lifecycle requests raised by the core
#[derive(Debug)]
enum RelayEvent {
    Open { client: SocketAddr, port: u16 },
    Close { client: SocketAddr },
}

/// Credentials from the config file; relay sockets via an event channel
struct StaticUsers {
    users: HashMap<String, String>,
    events: mpsc::UnboundedSender<RelayEvent>,
}

#[async_trait]
impl Observer for StaticUsers {
    async fn get_password(&self, _addr: &SocketAddr, username: &str) -> Option<String> {
        self.users.get(username).cloned()
    }

    fn allocated(&self, addr: &SocketAddr, name: &str, port: u16) {
        tracing::info!("{} ({}) allocated relay port {}", addr, name, port);
        let _ = self.events.send(RelayEvent::Open { client: *addr, port });
    }

    fn binding(&self, addr: &SocketAddr) {
        tracing::debug!("Binding request from {}", addr);
    }

    fn channel_bind(&self, addr: &SocketAddr, name: &str, channel: u16) {
        tracing::debug!("{} ({}) bound channel {:#06x}", addr, name, channel);
    }

    fn create_permission(&self, addr: &SocketAddr, name: &str, peer: &SocketAddr) {
        tracing::debug!("{} ({}) permitted {}", addr, name, peer);
    }

    fn refresh(&self, addr: &SocketAddr, name: &str, lifetime: u32) {
        tracing::debug!("{} ({}) refreshed for {}s", addr, name, lifetime);
    }

    fn abort(&self, addr: &SocketAddr, name: &str) {
        tracing::info!("{} ({}) allocation closed", addr, name);
        let _ = self.events.send(RelayEvent::Close { client: *addr });
    }
}

struct Relay {
    socket: Arc<UdpSocket>,
    reader: JoinHandle<()>,
}

/// Relay sockets by port, plus the port each client owns
#[derive(Default)]
struct RelaySockets {
    by_port: RwLock<HashMap<u16, Relay>>,
    by_client: RwLock<HashMap<SocketAddr, u16>>,
}

impl RelaySockets {
    fn socket(&self, port: u16) -> Option<Arc<UdpSocket>> {
        self.by_port.read().get(&port).map(|r| r.socket.clone())
    }
}

struct TurnServer {
    socket: Arc<UdpSocket>,
    processor: Arc<Processor>,
    relays: Arc<RelaySockets>,
}

impl TurnServer {
    async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<RelayEvent>) -> Result<()> {
        tracing::info!("TURN server listening on {}", self.socket.local_addr()?);

        let server = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let Err(e) = server.handle_relay_event(event).await {
                    tracing::warn!("Relay socket error: {}", e);
                }
            }
        });

        let mut buffer = vec![0u8; 65536];
        loop {
            match self.socket.recv_from(&mut buffer).await {
                Ok((size, from)) => {
                    let packet = buffer[..size].to_vec();
                    let server = self.clone();
                    tokio::spawn(async move { server.handle_packet(packet, from).await });
                }
                Err(e) => {
                    tracing::error!("Socket error: {}", e);
                }
            }
        }
    }

    async fn handle_packet(&self, packet: Vec<u8>, from: SocketAddr) {
        let response = match self.processor.process(&packet, from).await {
            Ok(Some(response)) => response,
            Ok(None) => return,
            Err(e) => match self.processor.reject(&packet, from, e) {
                Some(response) => response,
                None => return,
            },
        };

        if let Err(e) = self.send(response, from).await {
            tracing::warn!("Send failed: {}", e);
        }
    }

    async fn send(&self, response: Response, from: SocketAddr) -> Result<()> {
        match (response.relay, response.interface) {
            (Some(peer), Some(local)) => {
                let socket = self
                    .relays
                    .socket(local.port())
                    .with_context(|| format!("no relay socket for {}", local))?;
                socket.send_to(&response.data, peer).await?;
            }
            _ => {
                self.socket.send_to(&response.data, from).await?;
            }
        }

        Ok(())
    }

    async fn handle_relay_event(self: &Arc<Self>, event: RelayEvent) -> Result<()> {
        match event {
            RelayEvent::Open { client, port } => {
                let bind = SocketAddr::new(self.socket.local_addr()?.ip(), port);
                let socket = Arc::new(UdpSocket::bind(bind).await?);
                let reader = tokio::spawn(self.clone().read_relay(socket.clone(), port));

                self.relays.by_port.write().insert(port, Relay { socket, reader });
                self.relays.by_client.write().insert(client, port);
            }
            RelayEvent::Close { client } => {
                let port = self.relays.by_client.write().remove(&client);
                if let Some(relay) = port.and_then(|p| self.relays.by_port.write().remove(&p)) {
                    relay.reader.abort();
                }
            }
        }

        Ok(())
    }

    /// Feed datagrams from peers back through the processor
    async fn read_relay(self: Arc<Self>, socket: Arc<UdpSocket>, port: u16) {
        let mut buffer = vec![0u8; 65536];
        loop {
            let (size, peer) = match socket.recv_from(&mut buffer).await {
                Ok(received) => received,
                Err(e) => {
                    tracing::warn!("Relay port {} error: {}", port, e);
                    continue;
                }
            };

            if let Some(response) = self.processor.relay_from_peer(port, peer, &buffer[..size]) {
                if let Some(client) = response.relay {
                    let _ = self.socket.send_to(&response.data, client).await;
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let mut config = match &args.config {
        Some(path) => TurnConfig::from_file(path)
            .with_context(|| format!("Failed to load config {:?}", path))?,
        None => TurnConfig::default(),
    };

    if let Some(external) = &args.external {
        config.externals = vec![external.clone()];
    }
    if config.externals.is_empty() {
        config.externals = vec![args.bind.to_string()];
    }

    let external = config.externals[0].clone();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let observer = Arc::new(StaticUsers {
        users: config.users.clone(),
        events: events_tx,
    });

    let service = Service::new(config, observer)?;
    let processor = service
        .get_processor(&args.bind.to_string(), &external)
        .context("Failed to create processor")?;

    let server = Arc::new(TurnServer {
        socket: Arc::new(UdpSocket::bind(args.bind).await?),
        processor,
        relays: Arc::new(RelaySockets::default()),
    });

    server.run(events_rx).await
}
