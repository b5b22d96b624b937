use crate::framing::MessageTag;
use bitflags::bitflags;
use std::fmt;
use std::str::FromStr;
use strum_macros::Display;

bitflags! {
    /// What a connection may send and receive, as granted by the peer
    #[derive(Eq, PartialEq, Copy, Clone, Debug, Hash)]
    pub struct Permission: u8 {
        const IDMEF_READ = 0x01;
        const ADMIN_READ = 0x02;
        const IDMEF_WRITE = 0x04;
        const ADMIN_WRITE = 0x08;
    }
}

#[derive(Eq, PartialEq, Copy, Clone, Debug, Display)]
pub enum Direction {
    #[strum(serialize = "send")]
    Send,
    #[strum(serialize = "receive")]
    Receive,
}

impl Permission {
    /// Permission a message category needs in one direction.
    /// Identity, capability and authentication messages need none.
    ///
    /// `admin:r` lets a peer be administered: it receives requests and answers them.
    /// `admin:w` lets it administer others: it sends requests and reads the replies.
    pub fn required_for(tag: MessageTag, direction: Direction) -> Permission {
        match (tag, direction) {
            (MessageTag::Idmef, Direction::Send) => Permission::IDMEF_WRITE,
            (MessageTag::Idmef, Direction::Receive) => Permission::IDMEF_READ,
            (MessageTag::OptionRequest, Direction::Receive)
            | (MessageTag::OptionReply, Direction::Send) => Permission::ADMIN_READ,
            (MessageTag::OptionRequest, Direction::Send)
            | (MessageTag::OptionReply, Direction::Receive) => Permission::ADMIN_WRITE,
            _ => Permission::empty(),
        }
    }
}

const CATEGORIES: [(&str, Permission, Permission); 2] = [
    ("idmef", Permission::IDMEF_READ, Permission::IDMEF_WRITE),
    ("admin", Permission::ADMIN_READ, Permission::ADMIN_WRITE),
];

#[derive(thiserror::Error, Debug, Eq, PartialEq)]
#[error("Invalid permission '{0}', expected e.g. \"idmef:rw admin:r\"")]
pub struct ParsePermissionError(String);

/// Parses whitespace separated `category:modes` items, e.g. `idmef:rw admin:r`
impl FromStr for Permission {
    type Err = ParsePermissionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut perm = Permission::empty();
        for item in s.split_whitespace() {
            let err = || ParsePermissionError(item.to_owned());
            let (name, modes) = item.split_once(':').ok_or_else(err)?;
            let (_, read, write) = CATEGORIES
                .iter()
                .find(|(n, _, _)| *n == name)
                .ok_or_else(err)?;
            if modes.is_empty() {
                return Err(err());
            }
            for mode in modes.chars() {
                match mode {
                    'r' => perm |= *read,
                    'w' => perm |= *write,
                    _ => return Err(err()),
                }
            }
        }
        Ok(perm)
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut items = Vec::new();
        for (name, read, write) in CATEGORIES {
            let modes = match (self.contains(read), self.contains(write)) {
                (true, true) => "rw",
                (true, false) => "r",
                (false, true) => "w",
                (false, false) => continue,
            };
            items.push(format!("{}:{}", name, modes));
        }
        if items.is_empty() {
            return f.write_str("none");
        }
        f.write_str(&items.join(" "))
    }
}
