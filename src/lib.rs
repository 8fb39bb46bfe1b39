//! TURN relay core (lib.rs)
//!
//! Classifies, authenticates and relays STUN/TURN traffic for many client
//! sessions. The host owns the sockets and the credential store; the core
//! owns allocation state and produces the bytes to send.
//!
//! ```no_run
//! use std::sync::Arc;
//! use turn_core::{Observer, Service};
//!
//! struct Users;
//!
//! #[async_trait::async_trait]
//! impl Observer for Users {
//!     async fn get_password(&self, _addr: &std::net::SocketAddr, _name: &str) -> Option<String> {
//!         Some("secret".into())
//!     }
//! }
//!
//! # async fn run(packet: &[u8], source: std::net::SocketAddr) {
//! let service = Service::create("example.org", &["203.0.113.1:3478"], Arc::new(Users)).unwrap();
//! let processor = service.get_processor("10.0.0.1:3478", "203.0.113.1:3478").unwrap();
//! match processor.process(packet, source).await {
//!     Ok(Some(response)) => { /* send response.data */ }
//!     Ok(None) => {}
//!     Err(e) => { let _ = processor.reject(packet, source, e); }
//! }
//! # }
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod stun;
pub mod turn;

pub use config::{PortRange, TurnConfig};
pub use error::{StunError, StunResult, TurnError, TurnResult};
pub use turn::{
    FiveTuple, Observer, Processor, ProcessorStats, Response, ResponseKind, Service,
    TransportProtocol,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize logging system with custom configuration
///
/// `RUST_LOG` takes precedence over `level`; an unparsable level falls back
/// to `info`.
///
/// # Example
/// ```
/// turn_core::init_logging("info");
/// ```
pub fn init_logging(level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_ansi(true),
        )
        .with(filter)
        .try_init();
}
