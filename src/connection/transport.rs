//! Seams to the outside world: opening a byte stream and authenticating over it

use crate::connection::{Address, ConnectionError, Permission};
use crate::framing::record::{read_record, write_record};
use async_trait::async_trait;
use byteorder::{ByteOrder, BE};
use bytes::{BufMut, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// Any byte stream a connection can run over
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxTransport = Box<dyn Transport>;

/// A freshly opened transport
pub struct Established {
    pub transport: BoxTransport,
    /// Our side of the stream, when the transport knows it
    pub local_addr: Option<String>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, addr: &Address) -> Result<Established, ConnectionError>;
}

/// Result of a successful authentication
#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub struct AuthOutcome {
    pub peer_id: u64,
    pub granted: Permission,
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(
        &self,
        addr: &Address,
        transport: &mut BoxTransport,
        required: Permission,
    ) -> Result<AuthOutcome, ConnectionError>;
}

/// Plain TCP and local socket connector
pub struct TcpConnector {
    timeout: Duration,
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
        }
    }
}

impl TcpConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn connect_inet(&self, host: &str, port: u16) -> Result<Established, ConnectionError> {
        let addrs: Vec<_> = tokio::net::lookup_host((host, port))
            .await
            .map_err(|source| ConnectionError::CantResolve {
                addr: host.to_owned(),
                source,
            })?
            .collect();
        if addrs.is_empty() {
            return Err(ConnectionError::CantResolve {
                addr: host.to_owned(),
                source: std::io::ErrorKind::NotFound.into(),
            });
        }

        let target = format!("{}:{}", host, port);
        let mut last_err = None;
        for sa in addrs {
            trace!("Trying {} for {}", sa, target);
            match tokio::time::timeout(self.timeout, TcpStream::connect(sa)).await {
                Ok(Ok(stream)) => {
                    stream.set_nodelay(true).map_err(|source| ConnectionError::Transport {
                        addr: target.clone(),
                        source,
                    })?;
                    let local_addr = stream.local_addr().ok().map(|a| a.to_string());
                    return Ok(Established {
                        transport: Box::new(stream),
                        local_addr,
                    });
                }
                Ok(Err(source)) => {
                    last_err = Some(ConnectionError::Transport {
                        addr: target.clone(),
                        source,
                    })
                }
                Err(_) => last_err = Some(ConnectionError::Timeout(target.clone())),
            }
        }
        Err(last_err.unwrap_or(ConnectionError::Timeout(target)))
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, addr: &Address) -> Result<Established, ConnectionError> {
        match addr {
            Address::Inet { host, port } => self.connect_inet(host, *port).await,
            #[cfg(unix)]
            Address::Unix(path) => {
                let stream = tokio::time::timeout(self.timeout, tokio::net::UnixStream::connect(path))
                    .await
                    .map_err(|_| ConnectionError::Timeout(addr.to_string()))?
                    .map_err(|source| ConnectionError::Transport {
                        addr: addr.to_string(),
                        source,
                    })?;
                Ok(Established {
                    transport: Box::new(stream),
                    local_addr: None,
                })
            }
            #[cfg(not(unix))]
            Address::Unix(_) => Err(ConnectionError::Transport {
                addr: addr.to_string(),
                source: std::io::ErrorKind::Unsupported.into(),
            }),
        }
    }
}

const AUTH_OK: u8 = 0;

/// Authentication without credentials: both sides exchange identities in setup records
///
/// The client sends its analyzer id and the permission it asks for. The peer answers
/// with a status byte, its own id and the permission it grants, or a reason on refusal.
pub struct PlaintextAuthenticator {
    analyzer_id: u64,
    requested: Permission,
}

impl PlaintextAuthenticator {
    pub fn new(analyzer_id: u64, requested: Permission) -> Self {
        Self {
            analyzer_id,
            requested,
        }
    }

    /// Peer side of the exchange. `grant` decides, from the client's id and request,
    /// what to grant, or refuses with a reason. Returns the client's id and request.
    pub async fn serve<IO, F>(
        io: &mut IO,
        our_id: u64,
        grant: F,
    ) -> Result<(u64, Permission), ConnectionError>
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send,
        F: FnOnce(u64, Permission) -> Result<Permission, String> + Send,
    {
        let hello = read_record(io).await?;
        if hello.len() != 9 {
            return Err(ConnectionError::AuthFailed {
                addr: "client".into(),
                reason: format!("hello has 0x{:x} bytes", hello.len()),
            });
        }
        let client_id = BE::read_u64(&hello[..8]);
        let requested = Permission::from_bits_truncate(hello[8]);

        let mut reply = BytesMut::new();
        match grant(client_id, requested) {
            Ok(granted) => {
                reply.put_u8(AUTH_OK);
                reply.put_u64(our_id);
                reply.put_u8(granted.bits());
            }
            Err(reason) => {
                reply.put_u8(1);
                reply.put_slice(reason.as_bytes());
            }
        }
        write_record(io, &reply).await?;
        Ok((client_id, requested))
    }
}

#[async_trait]
impl Authenticator for PlaintextAuthenticator {
    async fn authenticate(
        &self,
        addr: &Address,
        transport: &mut BoxTransport,
        required: Permission,
    ) -> Result<AuthOutcome, ConnectionError> {
        let mut hello = BytesMut::with_capacity(9);
        hello.put_u64(self.analyzer_id);
        hello.put_u8((self.requested | required).bits());
        write_record(transport, &hello).await?;

        let reply = read_record(transport).await?;
        let refused = |reason: String| ConnectionError::AuthFailed {
            addr: addr.to_string(),
            reason,
        };
        match reply.split_first() {
            Some((&AUTH_OK, rest)) if rest.len() == 9 => {
                let outcome = AuthOutcome {
                    peer_id: BE::read_u64(&rest[..8]),
                    granted: Permission::from_bits_truncate(rest[8]),
                };
                debug!(
                    "Authenticated with {} (peer 0x{:x}, granted {})",
                    addr, outcome.peer_id, outcome.granted
                );
                Ok(outcome)
            }
            Some((&AUTH_OK, _)) => Err(refused("malformed reply".into())),
            Some((_, reason)) => Err(refused(String::from_utf8_lossy(reason).into_owned())),
            None => Err(refused("empty reply".into())),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use anyhow::Result;

    #[test_log::test(tokio::test)]
    async fn plaintext_exchange() -> Result<()> {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut client: BoxTransport = Box::new(client);
        let addr: Address = "127.0.0.1".parse()?;

        let peer = tokio::spawn(async move {
            PlaintextAuthenticator::serve(&mut server, 0x1111, |_, req| Ok(req)).await
        });
        let auth = PlaintextAuthenticator::new(0x2222, Permission::IDMEF_WRITE);
        let outcome = auth
            .authenticate(&addr, &mut client, Permission::ADMIN_READ)
            .await?;
        assert_eq!(outcome.peer_id, 0x1111);
        assert_eq!(
            outcome.granted,
            Permission::IDMEF_WRITE | Permission::ADMIN_READ
        );
        let (client_id, _) = peer.await??;
        assert_eq!(client_id, 0x2222);
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn plaintext_refusal() -> Result<()> {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut client: BoxTransport = Box::new(client);
        let addr: Address = "127.0.0.1".parse()?;

        tokio::spawn(async move {
            PlaintextAuthenticator::serve(&mut server, 1, |_, _| Err("unknown analyzer".into())).await
        });
        let auth = PlaintextAuthenticator::new(2, Permission::IDMEF_WRITE);
        let err = auth
            .authenticate(&addr, &mut client, Permission::empty())
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::AuthFailed { reason, .. } if reason == "unknown analyzer"));
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn unresolvable_host() {
        let connector = TcpConnector::new(Duration::from_secs(1));
        let addr: Address = "no-such-host.invalid:4690".parse().unwrap();
        assert!(matches!(
            connector.connect(&addr).await,
            Err(ConnectionError::CantResolve { .. })
        ));
    }
}
