// src/turn/service.rs
//! Service: configuration plus the processors created from it

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::allocation_manager::PortPool;
use super::processor::Processor;
use super::Observer;
use crate::config::TurnConfig;
use crate::error::{TurnError, TurnResult};

/// Owns one processor per (interface, external) pair.
///
/// Processors are handed out as `Arc`s. Dropping the service drops its
/// references; a processor still held by the host keeps answering with
/// its own table.
pub struct Service {
    config: Arc<TurnConfig>,
    externals: Vec<SocketAddr>,
    observer: Arc<dyn Observer>,
    pools: RwLock<HashMap<IpAddr, Arc<PortPool>>>,
    processors: RwLock<HashMap<(SocketAddr, SocketAddr), Arc<Processor>>>,
}

impl Service {
    /// Create a service from a validated configuration
    pub fn new(config: TurnConfig, observer: Arc<dyn Observer>) -> TurnResult<Self> {
        config.validate()?;
        let externals = config.external_addrs()?;

        info!(
            "TURN service created: realm {}, externals {:?}",
            config.realm, externals
        );

        Ok(Self {
            config: Arc::new(config),
            externals,
            observer,
            pools: RwLock::new(HashMap::new()),
            processors: RwLock::new(HashMap::new()),
        })
    }

    /// Create a service from a realm and external addresses, `None` if
    /// either fails validation
    pub fn create(realm: &str, externals: &[&str], observer: Arc<dyn Observer>) -> Option<Self> {
        match Self::new(TurnConfig::new(realm, externals), observer) {
            Ok(service) => Some(service),
            Err(e) => {
                warn!("TURN service rejected: {}", e);
                None
            }
        }
    }

    pub fn config(&self) -> &TurnConfig {
        &self.config
    }

    pub fn realm(&self) -> &str {
        &self.config.realm
    }

    pub fn externals(&self) -> &[SocketAddr] {
        &self.externals
    }

    /// Processor for an endpoint, created on first use.
    ///
    /// `None` if either address does not parse or `external` is not one of
    /// the advertised externals.
    pub fn get_processor(&self, interface: &str, external: &str) -> Option<Arc<Processor>> {
        let interface: SocketAddr = interface.parse().ok()?;
        let external: SocketAddr = external.parse().ok()?;
        if !self.externals.contains(&external) {
            debug!("External {} is not advertised", external);
            return None;
        }

        if let Some(processor) = self.processors.read().get(&(interface, external)) {
            return Some(processor.clone());
        }

        let mut processors = self.processors.write();
        let processor = processors
            .entry((interface, external))
            .or_insert_with(|| {
                info!("Processor created: {} -> {}", interface, external);
                Arc::new(Processor::new(
                    interface,
                    external,
                    self.config.clone(),
                    self.pool(external.ip()),
                    self.observer.clone(),
                ))
            })
            .clone();

        Some(processor)
    }

    /// Drop a processor and release its allocations
    pub fn remove_processor(&self, interface: &str, external: &str) -> TurnResult<bool> {
        let interface: SocketAddr = interface
            .parse()
            .map_err(|_| TurnError::InvalidAddress(interface.to_string()))?;
        let external: SocketAddr = external
            .parse()
            .map_err(|_| TurnError::InvalidAddress(external.to_string()))?;

        let removed = self.processors.write().remove(&(interface, external));
        match removed {
            Some(processor) => {
                processor.shutdown();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn processor_count(&self) -> usize {
        self.processors.read().len()
    }

    /// Ports in use across every processor sharing `ip`
    pub fn ports_in_use(&self, ip: IpAddr) -> usize {
        self.pools.read().get(&ip).map_or(0, |pool| pool.in_use())
    }

    fn pool(&self, ip: IpAddr) -> Arc<PortPool> {
        self.pools
            .write()
            .entry(ip)
            .or_insert_with(|| Arc::new(PortPool::new(self.config.port_range)))
            .clone()
    }
}
