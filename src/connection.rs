//! One authenticated link to a manager.
//!
//! A [`Connection`] is either `Initial` (no transport) or `Established`. Every send first
//! checks, without blocking, whether the peer already closed its side: a stream keeps
//! accepting writes after the peer's FIN, so a dead peer would otherwise go unnoticed.

mod address;
mod permission;
mod transport;

pub use address::{Address, DEFAULT_PORT};
pub use permission::{Direction, ParsePermissionError, Permission};
pub use transport::{
    AuthOutcome, Authenticator, BoxTransport, Connector, Established, PlaintextAuthenticator,
    TcpConnector, Transport,
};

use crate::framing::{
    FramingError, Message, MessageSink, MessageSocket, MessageTag, Priority, ReadStatus,
    SinkError,
};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::str::FromStr;
use strum_macros::Display;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Field of an identity message carrying our analyzer id
pub const ID_DECLARE: u8 = 3;

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Invalid address '{0}': {1}")]
    InvalidAddress(String, String),
    #[error("Can't resolve {addr}")]
    CantResolve {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Connection to {addr} failed")]
    Transport {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Timed out connecting to {0}")]
    Timeout(String),
    #[error("Authentication with {addr} failed: {reason}")]
    AuthFailed { addr: String, reason: String },
    #[error("Insufficient permission on {addr}: granted {granted}, required {required}. {}", remediation(.addr, .required))]
    InsufficientPermission {
        addr: String,
        required: Permission,
        granted: Permission,
    },
    #[error("Permission {required} is needed to {direction} {tag} messages, {addr} has {granted}")]
    Profile {
        addr: String,
        tag: MessageTag,
        direction: Direction,
        required: Permission,
        granted: Permission,
    },
    #[error("Connection to {0} is not established")]
    NotConnected(String),
    #[error("Peer {0} closed the connection")]
    Closed(String),
    #[error(transparent)]
    Framing(#[from] FramingError),
}

fn remediation(addr: &str, required: &Permission) -> String {
    format!(
        "The analyzer must be registered again with the \"{}\" permission, \
         e.g. prelude-admin register <profile> \"{}\" {}",
        required, required, addr
    )
}

impl ConnectionError {
    /// Errors a reconnection can recover from. The others are about the message or the
    /// setup, and the link itself is still fine.
    pub fn is_retryable(&self) -> bool {
        match self {
            ConnectionError::InvalidAddress(..) | ConnectionError::Profile { .. } => false,
            ConnectionError::Framing(FramingError::Io { .. }) => true,
            ConnectionError::Framing(_) => false,
            _ => true,
        }
    }

    /// Errors no amount of retrying fixes without operator action
    pub fn needs_setup(&self) -> bool {
        matches!(self, ConnectionError::InsufficientPermission { .. })
    }
}

#[derive(Eq, PartialEq, Copy, Clone, Debug, Display)]
pub enum ConnectionState {
    Initial,
    Established,
}

pub struct Connection {
    address: Address,
    socket: Option<MessageSocket<BoxTransport>>,
    permission: Permission,
    peer_id: Option<u64>,
    local_addr: Option<String>,
    /// Messages read early by the half-close check
    inbound: VecDeque<Message>,
}

impl Connection {
    /// Parses `addr` (`unix`, `unix:<path>` or `host[:port]`). Nothing is resolved yet.
    pub fn new(addr: &str) -> Result<Self, ConnectionError> {
        Ok(Self::from_address(Address::from_str(addr)?))
    }

    pub fn from_address(address: Address) -> Self {
        Self {
            address,
            socket: None,
            permission: Permission::empty(),
            peer_id: None,
            local_addr: None,
            inbound: VecDeque::new(),
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn state(&self) -> ConnectionState {
        match self.socket {
            Some(_) => ConnectionState::Established,
            None => ConnectionState::Initial,
        }
    }

    pub fn is_established(&self) -> bool {
        self.socket.is_some()
    }

    /// Permission granted by the peer on the last successful connect
    pub fn permission(&self) -> Permission {
        self.permission
    }

    pub fn peer_id(&self) -> Option<u64> {
        self.peer_id
    }

    pub fn local_addr(&self) -> Option<&str> {
        self.local_addr.as_deref()
    }

    /// Opens the transport, authenticates and declares `analyzer_id` to the peer.
    /// Fails unless the peer grants at least `required`.
    pub async fn connect(
        &mut self,
        connector: &dyn Connector,
        auth: &dyn Authenticator,
        required: Permission,
        analyzer_id: u64,
    ) -> Result<(), ConnectionError> {
        self.close();
        let addr = self.address.to_string();
        let Established {
            mut transport,
            local_addr,
        } = connector.connect(&self.address).await?;
        let outcome = auth
            .authenticate(&self.address, &mut transport, required)
            .await?;
        if !outcome.granted.contains(required) {
            return Err(ConnectionError::InsufficientPermission {
                addr,
                required,
                granted: outcome.granted,
            });
        }

        let mut socket = MessageSocket::new(transport);
        let mut declare = Message::new(MessageTag::Id, Priority::High);
        declare.encode_u64(ID_DECLARE, analyzer_id)?;
        declare.mark_end();
        socket.send(declare).await?;

        self.socket = Some(socket);
        self.permission = outcome.granted;
        self.peer_id = Some(outcome.peer_id);
        self.local_addr = local_addr;
        info!(
            "Connected to {} (peer 0x{:x}, permission {})",
            addr, outcome.peer_id, outcome.granted
        );
        Ok(())
    }

    fn check_permission(&self, tag: MessageTag, direction: Direction) -> Result<(), ConnectionError> {
        let required = Permission::required_for(tag, direction);
        if self.permission.contains(required) {
            return Ok(());
        }
        Err(ConnectionError::Profile {
            addr: self.address.to_string(),
            tag,
            direction,
            required,
            granted: self.permission,
        })
    }

    /// Drains whatever the peer already sent, and fails if it closed its side
    fn check_peer_alive(&mut self) -> Result<(), ConnectionError> {
        loop {
            let socket = match self.socket.as_mut() {
                Some(socket) => socket,
                None => return Err(ConnectionError::NotConnected(self.address.to_string())),
            };
            match socket.try_recv() {
                Ok(ReadStatus::Finished(msg)) => self.inbound.push_back(msg),
                Ok(ReadStatus::Unfinished) => return Ok(()),
                Ok(ReadStatus::Eof) => {
                    warn!("{} closed its side of the connection", self.address);
                    self.close();
                    return Err(ConnectionError::Closed(self.address.to_string()));
                }
                Err(e) => {
                    self.close();
                    return Err(e.into());
                }
            }
        }
    }

    pub async fn send(&mut self, msg: Message) -> Result<(), ConnectionError> {
        if !self.is_established() {
            return Err(ConnectionError::NotConnected(self.address.to_string()));
        }
        self.check_permission(msg.tag, Direction::Send)?;
        self.check_peer_alive()?;

        let socket = match self.socket.as_mut() {
            Some(socket) => socket,
            None => return Err(ConnectionError::NotConnected(self.address.to_string())),
        };
        if let Err(e) = socket.send(msg).await {
            let e = ConnectionError::from(e);
            warn!("Error sending message to {}: {}", self.address, e);
            if e.is_retryable() {
                self.close();
            }
            return Err(e);
        }
        Ok(())
    }

    /// Waits for the next message the connection is allowed to receive.
    /// A message above our permission is dropped and reported as a profile error.
    pub async fn recv(&mut self) -> Result<Message, ConnectionError> {
        let msg = match self.inbound.pop_front() {
            Some(msg) => msg,
            None => {
                let socket = match self.socket.as_mut() {
                    Some(socket) => socket,
                    None => return Err(ConnectionError::NotConnected(self.address.to_string())),
                };
                match socket.next().await {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        self.close();
                        return Err(e.into());
                    }
                    None => {
                        self.close();
                        return Err(ConnectionError::Closed(self.address.to_string()));
                    }
                }
            }
        };
        self.check_permission(msg.tag, Direction::Receive)?;
        Ok(msg)
    }

    /// Non-blocking [`recv`](Self::recv): `None` when nothing complete is available yet
    pub fn try_recv(&mut self) -> Result<Option<Message>, ConnectionError> {
        if self.inbound.is_empty() {
            self.check_peer_alive()?;
        }
        match self.inbound.pop_front() {
            Some(msg) => {
                self.check_permission(msg.tag, Direction::Receive)?;
                Ok(Some(msg))
            }
            None => Ok(None),
        }
    }

    /// Drops the transport without waiting, back to the `Initial` state
    pub fn close(&mut self) {
        if self.socket.take().is_some() {
            debug!("Closed connection to {}", self.address);
        }
        self.inbound.clear();
    }

    /// Flushes and shuts the transport down, then frees the connection
    pub async fn destroy(mut self) -> Result<(), ConnectionError> {
        if let Some(mut socket) = self.socket.take() {
            socket.close().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl MessageSink for Connection {
    async fn send_message(&mut self, msg: Message) -> Result<(), SinkError> {
        Ok(self.send(msg).await?)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::framing::message::extract_u64;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;

    /// What a fake manager saw, in arrival order
    #[derive(Debug)]
    pub struct Received {
        pub manager: String,
        pub msg: Message,
    }

    struct Endpoint {
        reachable: bool,
        grant: Permission,
        /// The peer hangs up after forwarding this many messages
        hangup_after: Option<usize>,
    }

    /// In-memory managers: every connect spawns a peer that authenticates the client,
    /// checks its identity declaration and forwards everything else to a channel.
    /// Replies queued with [`MockNetwork::push`] are sent right after the handshake.
    #[derive(Clone)]
    pub struct MockNetwork {
        endpoints: Arc<Mutex<HashMap<String, Endpoint>>>,
        replies: Arc<Mutex<HashMap<String, Vec<Message>>>>,
        peers: Arc<Mutex<HashMap<String, Vec<JoinHandle<()>>>>>,
        tx: mpsc::UnboundedSender<Received>,
    }

    impl MockNetwork {
        pub fn new() -> (Self, mpsc::UnboundedReceiver<Received>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let net = Self {
                endpoints: Default::default(),
                replies: Default::default(),
                peers: Default::default(),
                tx,
            };
            (net, rx)
        }

        pub fn set_reachable(&self, addr: &str, reachable: bool) {
            let mut endpoints = self.endpoints.lock().unwrap();
            let ep = endpoints.entry(addr.to_owned()).or_insert(Endpoint {
                reachable,
                grant: Permission::all(),
                hangup_after: None,
            });
            ep.reachable = reachable;
        }

        pub fn set_grant(&self, addr: &str, grant: Permission) {
            let mut endpoints = self.endpoints.lock().unwrap();
            endpoints
                .entry(addr.to_owned())
                .or_insert(Endpoint {
                    reachable: true,
                    grant,
                    hangup_after: None,
                })
                .grant = grant;
        }

        /// Connections opened from now on hang up after `after` messages,
        /// right after the handshake with `Some(0)`
        pub fn set_hangup(&self, addr: &str, after: Option<usize>) {
            let mut endpoints = self.endpoints.lock().unwrap();
            endpoints
                .entry(addr.to_owned())
                .or_insert(Endpoint {
                    reachable: true,
                    grant: Permission::all(),
                    hangup_after: None,
                })
                .hangup_after = after;
        }

        pub fn push(&self, addr: &str, msg: Message) {
            self.replies
                .lock()
                .unwrap()
                .entry(addr.to_owned())
                .or_default()
                .push(msg);
        }

        /// Drops the manager side of every open connection to `addr`
        pub async fn disconnect(&self, addr: &str) {
            let peers = self.peers.lock().unwrap().remove(addr).unwrap_or_default();
            for peer in peers {
                peer.abort();
                let _ = peer.await;
            }
        }
    }

    #[async_trait]
    impl Connector for MockNetwork {
        async fn connect(&self, addr: &Address) -> Result<Established, ConnectionError> {
            let name = addr.to_string();
            let (grant, hangup_after) = match self.endpoints.lock().unwrap().get(&name) {
                Some(ep) if ep.reachable => (ep.grant, ep.hangup_after),
                _ => {
                    return Err(ConnectionError::Transport {
                        addr: name,
                        source: std::io::ErrorKind::ConnectionRefused.into(),
                    })
                }
            };
            let replies = self.replies.lock().unwrap().remove(&name).unwrap_or_default();
            let (client, mut server) = tokio::io::duplex(1 << 20);
            let tx = self.tx.clone();
            let peer_name = name.clone();
            let peer = tokio::spawn(async move {
                PlaintextAuthenticator::serve(&mut server, 0xAAAA, move |_, _| Ok(grant))
                    .await
                    .unwrap();
                let mut socket = MessageSocket::new(server);
                let mut declare = socket.next().await.unwrap().unwrap();
                assert_eq!(declare.tag, MessageTag::Id);
                let field = declare.get_field().unwrap().unwrap();
                assert_eq!(field.tag, ID_DECLARE);
                extract_u64(&field.payload).unwrap();
                for reply in replies {
                    socket.send(reply).await.unwrap();
                }
                let mut forwarded = 0;
                while hangup_after.map_or(true, |n| forwarded < n) {
                    let msg = match socket.next().await {
                        Some(Ok(msg)) => msg,
                        _ => break,
                    };
                    forwarded += 1;
                    if tx
                        .send(Received {
                            manager: peer_name.clone(),
                            msg,
                        })
                        .is_err()
                    {
                        break;
                    }
                }
            });
            self.peers
                .lock()
                .unwrap()
                .entry(name)
                .or_default()
                .push(peer);
            Ok(Established {
                transport: Box::new(client),
                local_addr: None,
            })
        }
    }
}
