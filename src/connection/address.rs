use crate::connection::ConnectionError;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Port managers listen on unless told otherwise
pub const DEFAULT_PORT: u16 = 4690;
const UNIX_SOCKET_PREFIX: &str = "/tmp/.prelude-unix";

/// Where a manager can be reached
///
/// Accepted forms: `unix`, `unix:<path>`, `host`, `host:port`, `[v6addr]` and `[v6addr]:port`.
/// Host names are resolved when connecting, not when parsing.
#[derive(Eq, PartialEq, Clone, Debug, Hash)]
pub enum Address {
    Unix(PathBuf),
    Inet { host: String, port: u16 },
}

impl Address {
    /// Local socket path used for a bare `unix` endpoint
    pub fn default_unix_path(port: u16) -> PathBuf {
        PathBuf::from(format!("{}-{}", UNIX_SOCKET_PREFIX, port))
    }

    pub fn is_unix(&self) -> bool {
        matches!(self, Address::Unix(_))
    }
}

impl FromStr for Address {
    type Err = ConnectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |why: &str| ConnectionError::InvalidAddress(s.to_owned(), why.to_owned());
        let s = s.trim();
        if s.is_empty() {
            return Err(invalid("empty address"));
        }

        if s == "unix" {
            return Ok(Address::Unix(Self::default_unix_path(DEFAULT_PORT)));
        }
        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Ok(Address::Unix(Self::default_unix_path(DEFAULT_PORT)));
            }
            return Ok(Address::Unix(PathBuf::from(path)));
        }

        let parse_port = |p: &str| p.parse::<u16>().map_err(|_| invalid("bad port number"));
        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, after) = rest
                .split_once(']')
                .ok_or_else(|| invalid("unterminated IPv6 literal"))?;
            let port = match after {
                "" => DEFAULT_PORT,
                _ => parse_port(
                    after
                        .strip_prefix(':')
                        .ok_or_else(|| invalid("garbage after IPv6 literal"))?,
                )?,
            };
            (host, port)
        } else {
            match s.split_once(':') {
                // Several colons without brackets: a bare IPv6 address
                Some((_, port)) if port.contains(':') => (s, DEFAULT_PORT),
                Some((host, port)) => (host, parse_port(port)?),
                None => (s, DEFAULT_PORT),
            }
        };
        if host.is_empty() {
            return Err(invalid("empty host"));
        }
        Ok(Address::Inet {
            host: host.to_owned(),
            port,
        })
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Unix(path) => write!(f, "unix:{}", path.display()),
            Address::Inet { host, port } if host.contains(':') => write!(f, "[{}]:{}", host, port),
            Address::Inet { host, port } => write!(f, "{}:{}", host, port),
        }
    }
}
