//! # dhtnat
//!
//! NAT traversal for DHT nodes.
//!
//! A node that cannot accept unsolicited datagrams binds to a reachable peer
//! acting as its rendezvous and keeps that binding alive with heartbeats.
//! Anyone wanting to reach the node asks the rendezvous to coordinate a
//! simultaneous-open punch: the rendezvous tells the target to fire probes
//! toward the originator while the originator fires probes toward the target.
//!
//! This crate provides:
//! - Rendezvous binding management with self-test, heartbeats and cool-down
//! - Rendezvous-side serving of bound clients
//! - Punch sessions with coalescing, candidate ordering and deadlines
//! - Puncher chaining (primary and secondary)
//! - Listener fan-out for binding and session events
//! - A UDP transport and an in-process network simulation
//!
//! The DHT itself stays outside: it plugs in through the traits in [`ports`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use dhtnat::{InboundHandler, NatPuncher, PuncherConfig, UdpDirectory};
//! use std::sync::Arc;
//!
//! # async fn run() -> dhtnat::Result<()> {
//! let directory = UdpDirectory::bind("0.0.0.0:7400".parse().unwrap(), None).await?;
//! directory.add_rendezvous("203.0.113.7:7400".parse().unwrap());
//!
//! let puncher = NatPuncher::builder(directory.clone())
//!     .config(PuncherConfig::default())
//!     .build()?;
//! let handler: Arc<dyn InboundHandler> = puncher.clone();
//! directory.spawn_receiver(Arc::downgrade(&handler));
//! puncher.start()?;
//!
//! let target = "198.51.100.4:7400".parse().unwrap();
//! let result = puncher.punch("connect", &target, None, None).await?;
//! println!("reachable at {:?}", result.reachable_addr());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod binding;
pub mod chain;
pub mod config;
pub mod contact;
pub mod engine;
pub mod error;
pub mod listener;
pub mod messenger;
pub mod oracle;
pub mod ports;
pub mod probe;
pub mod puncher;
pub mod server;
pub mod session;
pub mod stats;
pub mod transport;
pub mod wire;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use chain::{FallbackChain, Puncher};
pub use config::{PuncherConfig, PuncherRole};
pub use contact::{Contact, NodeId};
pub use error::{FailureReason, PuncherError, Result, TransportError};
pub use listener::{ChannelListener, ListenerSet, PuncherEvent, PuncherListener};
pub use oracle::{IdentityOracle, LatencyOracle};
pub use ports::{ContactDirectory, InboundHandler, ProximityOracle, PuncherAdapter};
pub use puncher::{NatPuncher, NatPuncherBuilder, PuncherState};
pub use session::{AddressPunch, PunchOutcome, PunchResult};
pub use stats::{PuncherStats, StatsSnapshot};
pub use transport::UdpDirectory;
pub use wire::{ClientData, WireMessage};
