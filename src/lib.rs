//! Sensor to manager messaging with failover
//!
//! Sensors emit events to one or more managers over an authenticated, framed binary
//! protocol. When managers can't be reached, nothing is lost: events are kept in on-disk
//! spools and re-sent, oldest first, once a manager is back.
//!
//! The crate is layered bottom-up:
//! - [`framing`]: the wire format, an async [`MessageSocket`](framing::MessageSocket)
//!   Stream + Sink, and a streaming writer for messages too large to buffer.
//! - [`spool`]: the crash-safe append-only queue used for failover.
//! - [`timer`]: cooperative timers and the reconnection backoff policy.
//! - [`connection`]: one authenticated link to a manager, with permission checks.
//! - [`manager`]: routing over an `a && b || c` topology, failover and recovery.
//! - [`options`]: the administrative GET/SET/LIST channel riding on the same links.
//! - [`async_send`]: a background worker so producers never block on the network.
//! - [`config`] and [`client`]: settings, and the context a sensor builds at startup.
//!
//! ## Topology
//!
//! The connection string lists alternatives separated by `||`, each a chain of
//! endpoints joined by `&&`. Events go to every member of the first chain that has a live
//! member. A member that can't take an event keeps it in its own spool; if every chain is
//! down, events go to a global spool and the sensor runs in failsafe mode until a chain
//! recovers.

pub mod async_send;
pub mod client;
pub mod config;
pub mod connection;
pub mod framing;
pub mod manager;
pub mod options;
pub mod spool;
pub mod timer;

pub use client::ClientContext;
pub use config::Settings;
pub use connection::Connection;
pub use framing::{Message, MessageSocket};
pub use manager::{ConnectionManager, SendOutcome};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Framing(#[from] framing::FramingError),
    #[error(transparent)]
    Spool(#[from] spool::SpoolError),
    #[error(transparent)]
    Connection(#[from] connection::ConnectionError),
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Manager(#[from] manager::ManagerError),
    #[error(transparent)]
    Option(#[from] options::OptionError),
}
