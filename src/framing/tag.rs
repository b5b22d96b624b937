use strum_macros::{Display, EnumCount, FromRepr};

/// Top-level category of a message, carried in the frame header
///
/// The category decides which permission a connection needs to send or receive the message.
#[repr(u8)]
#[derive(Eq, PartialEq, Copy, Clone, Debug, Hash, Display, EnumCount, FromRepr)]
pub enum MessageTag {
    /// Serialized IDMEF event data, the bulk of sensor traffic
    Idmef,
    /// Administrative request (GET/SET/LIST of a remote option)
    OptionRequest,
    /// Reply to an administrative request
    OptionReply,
    /// Identity declaration sent right after authentication
    Id,
    /// Capability announcement during connection setup
    ConnectionCapability,
    /// Authentication exchange
    Auth,
    /// Tags this crate doesn't know about are kept as-is
    Other(u8),
}

impl From<MessageTag> for u8 {
    fn from(tag: MessageTag) -> Self {
        match tag {
            MessageTag::Idmef => 0,
            MessageTag::OptionRequest => 1,
            MessageTag::OptionReply => 2,
            MessageTag::Id => 3,
            MessageTag::ConnectionCapability => 4,
            MessageTag::Auth => 5,
            MessageTag::Other(x) => x,
        }
    }
}

impl From<&MessageTag> for u8 {
    fn from(tag: &MessageTag) -> Self {
        u8::from(*tag)
    }
}

impl From<u8> for MessageTag {
    fn from(value: u8) -> Self {
        match value {
            x if x == Self::Idmef => Self::Idmef,
            x if x == Self::OptionRequest => Self::OptionRequest,
            x if x == Self::OptionReply => Self::OptionReply,
            x if x == Self::Id => Self::Id,
            x if x == Self::ConnectionCapability => Self::ConnectionCapability,
            x if x == Self::Auth => Self::Auth,
            x => Self::Other(x),
        }
    }
}

impl PartialEq<u8> for MessageTag {
    fn eq(&self, other: &u8) -> bool {
        u8::from(self) == *other
    }
}

impl PartialEq<MessageTag> for u8 {
    fn eq(&self, other: &MessageTag) -> bool {
        u8::from(other) == *self
    }
}

impl std::fmt::LowerHex for MessageTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let val: u8 = self.into();
        std::fmt::LowerHex::fmt(&val, f)
    }
}

impl std::fmt::UpperHex for MessageTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let val: u8 = self.into();
        std::fmt::UpperHex::fmt(&val, f)
    }
}

/// Delivery priority stored in the frame header (0 is the most urgent)
#[repr(u8)]
#[derive(Eq, PartialEq, Ord, PartialOrd, Copy, Clone, Debug, Default, Display, FromRepr)]
pub enum Priority {
    High = 0,
    #[default]
    Mid = 1,
    Low = 2,
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> Self {
        p as u8
    }
}
