use crate::framing::message::{extract_str, extract_u32, extract_u64};
use crate::framing::{Message, MessageSink, MessageTag, MessageWriter, Priority, SinkError};
use crate::options::{Listing, OptionError, OptionPath};
use strum_macros::{Display, FromRepr};

/// Field tags of option requests and replies
#[repr(u8)]
#[derive(Eq, PartialEq, Copy, Clone, Debug, Display, FromRepr)]
pub enum OptionTag {
    Get = 0,
    Set = 1,
    List = 2,
    Value = 3,
    Error = 4,
    SourceId = 5,
    TargetId = 6,
    RequestId = 7,
    Name = 8,
    Desc = 9,
    Start = 10,
    End = 11,
    Path = 12,
}

impl From<OptionTag> for u8 {
    fn from(tag: OptionTag) -> Self {
        tag as u8
    }
}

#[derive(Eq, PartialEq, Copy, Clone, Debug, Display)]
pub enum RequestKind {
    Get,
    Set,
    List,
}

impl From<RequestKind> for OptionTag {
    fn from(kind: RequestKind) -> Self {
        match kind {
            RequestKind::Get => OptionTag::Get,
            RequestKind::Set => OptionTag::Set,
            RequestKind::List => OptionTag::List,
        }
    }
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub struct OptionRequest {
    pub request_id: u32,
    /// Analyzer sending the request
    pub source_id: u64,
    /// Analyzer the request is for, 0 for whoever receives it
    pub target_id: u64,
    pub kind: RequestKind,
    /// Missing on a LIST of the whole tree
    pub path: Option<OptionPath>,
    pub value: Option<String>,
}

impl OptionRequest {
    pub fn get(request_id: u32, source_id: u64, target_id: u64, path: OptionPath) -> Self {
        Self {
            request_id,
            source_id,
            target_id,
            kind: RequestKind::Get,
            path: Some(path),
            value: None,
        }
    }

    pub fn set(request_id: u32, source_id: u64, target_id: u64, path: OptionPath, value: &str) -> Self {
        Self {
            kind: RequestKind::Set,
            value: Some(value.to_owned()),
            ..Self::get(request_id, source_id, target_id, path)
        }
    }

    pub fn list(request_id: u32, source_id: u64, target_id: u64, path: Option<OptionPath>) -> Self {
        Self {
            request_id,
            source_id,
            target_id,
            kind: RequestKind::List,
            path,
            value: None,
        }
    }

    pub fn to_message(&self) -> Result<Message, OptionError> {
        let mut msg = Message::new(MessageTag::OptionRequest, Priority::High);
        msg.encode_u32(OptionTag::RequestId.into(), self.request_id)?;
        msg.encode_u64(OptionTag::SourceId.into(), self.source_id)?;
        msg.encode_u64(OptionTag::TargetId.into(), self.target_id)?;
        msg.encode_field(OptionTag::from(self.kind).into(), &[])?;
        if let Some(path) = &self.path {
            msg.encode_str(OptionTag::Path.into(), &path.to_string())?;
        }
        if let Some(value) = &self.value {
            msg.encode_str(OptionTag::Value.into(), value)?;
        }
        msg.mark_end();
        Ok(msg)
    }
}

/// Request fields as found on the wire, before validation
#[derive(Debug, Default)]
pub(crate) struct RawRequest {
    pub request_id: Option<u32>,
    pub source_id: Option<u64>,
    pub target_id: Option<u64>,
    kind: Option<RequestKind>,
    path: Option<String>,
    value: Option<String>,
}

impl RawRequest {
    /// Reads what it can. Fields are kept up to the first error so a reply can still
    /// be addressed.
    pub fn parse(msg: &mut Message) -> (Self, Result<(), OptionError>) {
        let mut raw = Self::default();
        let outcome = raw.fill(msg);
        (raw, outcome)
    }

    fn fill(&mut self, msg: &mut Message) -> Result<(), OptionError> {
        msg.rewind();
        while let Some(field) = msg.get_field()? {
            let p = &field.payload[..];
            match OptionTag::from_repr(field.tag) {
                Some(OptionTag::RequestId) => self.request_id = Some(extract_u32(p)?),
                Some(OptionTag::SourceId) => self.source_id = Some(extract_u64(p)?),
                Some(OptionTag::TargetId) => self.target_id = Some(extract_u64(p)?),
                Some(OptionTag::Get) => self.kind = Some(RequestKind::Get),
                Some(OptionTag::Set) => self.kind = Some(RequestKind::Set),
                Some(OptionTag::List) => self.kind = Some(RequestKind::List),
                Some(OptionTag::Path) => self.path = Some(extract_str(p)?.to_owned()),
                Some(OptionTag::Value) => self.value = Some(extract_str(p)?.to_owned()),
                _ => return Err(OptionError::UnexpectedField(field.tag)),
            }
        }
        Ok(())
    }

    pub fn into_request(self) -> Result<OptionRequest, OptionError> {
        let kind = self.kind.ok_or(OptionError::MissingField("request kind"))?;
        let path = self.path.map(|p| p.parse::<OptionPath>()).transpose()?;
        if kind != RequestKind::List && path.is_none() {
            return Err(OptionError::MissingField("option path"));
        }
        if kind == RequestKind::Set && self.value.is_none() {
            return Err(OptionError::MissingField("value"));
        }
        Ok(OptionRequest {
            request_id: self.request_id.ok_or(OptionError::MissingField("request id"))?,
            source_id: self.source_id.unwrap_or(0),
            target_id: self.target_id.unwrap_or(0),
            kind,
            path,
            value: self.value,
        })
    }
}

impl OptionRequest {
    pub fn from_message(msg: &mut Message) -> Result<Self, OptionError> {
        let (raw, outcome) = RawRequest::parse(msg);
        outcome?;
        raw.into_request()
    }
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub enum ReplyBody {
    /// SET succeeded
    Done,
    Value(String),
    List(Vec<Listing>),
    Error(String),
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub struct OptionReply {
    pub request_id: u32,
    /// Analyzer that answered
    pub source_id: u64,
    /// Analyzer that asked
    pub target_id: u64,
    pub body: ReplyBody,
}

impl OptionReply {
    /// Streams the reply to `sink`, split in fragments if the listing is large
    pub async fn write<S>(&self, sink: &mut S) -> Result<(), SinkError>
    where
        S: MessageSink + ?Sized,
    {
        let mut w = MessageWriter::new(sink, MessageTag::OptionReply, Priority::High);
        w.encode_u32(OptionTag::RequestId.into(), self.request_id).await?;
        w.encode_u64(OptionTag::SourceId.into(), self.source_id).await?;
        w.encode_u64(OptionTag::TargetId.into(), self.target_id).await?;
        match &self.body {
            ReplyBody::Done => {}
            ReplyBody::Value(value) => w.encode_str(OptionTag::Value.into(), value).await?,
            ReplyBody::Error(text) => w.encode_str(OptionTag::Error.into(), text).await?,
            ReplyBody::List(entries) => {
                // Marks the reply as a listing, even an empty one
                w.encode_field(OptionTag::List.into(), &[]).await?;
                // Depth first, each entry between START and END
                let mut stack: Vec<std::slice::Iter<Listing>> = vec![entries.iter()];
                while let Some(iter) = stack.last_mut() {
                    match iter.next() {
                        Some(entry) => {
                            w.encode_field(OptionTag::Start.into(), &[]).await?;
                            w.encode_str(OptionTag::Name.into(), &entry.name).await?;
                            if !entry.description.is_empty() {
                                w.encode_str(OptionTag::Desc.into(), &entry.description)
                                    .await?;
                            }
                            if let Some(value) = &entry.value {
                                w.encode_str(OptionTag::Value.into(), value).await?;
                            }
                            stack.push(entry.children.iter());
                        }
                        None => {
                            stack.pop();
                            if !stack.is_empty() {
                                w.encode_field(OptionTag::End.into(), &[]).await?;
                            }
                        }
                    }
                }
            }
        }
        w.finish().await?;
        Ok(())
    }

    pub fn from_message(msg: &mut Message) -> Result<Self, OptionError> {
        if msg.tag != MessageTag::OptionReply {
            return Err(OptionError::UnexpectedMessage(msg.tag));
        }
        msg.rewind();
        let mut request_id = None;
        let mut source_id = 0;
        let mut target_id = 0;
        let mut value = None;
        let mut error = None;
        // Children of the entries still open, the bottom level holds the result
        let mut stack: Vec<Vec<Listing>> = vec![Vec::new()];
        let mut open: Vec<Listing> = Vec::new();
        let mut listed = false;

        while let Some(field) = msg.get_field()? {
            let p = &field.payload[..];
            match OptionTag::from_repr(field.tag) {
                Some(OptionTag::RequestId) => request_id = Some(extract_u32(p)?),
                Some(OptionTag::SourceId) => source_id = extract_u64(p)?,
                Some(OptionTag::TargetId) => target_id = extract_u64(p)?,
                Some(OptionTag::Error) => error = Some(extract_str(p)?.to_owned()),
                Some(OptionTag::List) => listed = true,
                Some(OptionTag::Start) => {
                    listed = true;
                    open.push(Listing::default());
                    stack.push(Vec::new());
                }
                Some(OptionTag::Name) => match open.last_mut() {
                    Some(entry) => entry.name = extract_str(p)?.to_owned(),
                    None => return Err(OptionError::UnexpectedField(field.tag)),
                },
                Some(OptionTag::Desc) => match open.last_mut() {
                    Some(entry) => entry.description = extract_str(p)?.to_owned(),
                    None => return Err(OptionError::UnexpectedField(field.tag)),
                },
                Some(OptionTag::Value) => match open.last_mut() {
                    Some(entry) => entry.value = Some(extract_str(p)?.to_owned()),
                    None => value = Some(extract_str(p)?.to_owned()),
                },
                Some(OptionTag::End) => {
                    let (mut entry, children) = match (open.pop(), stack.pop()) {
                        (Some(entry), Some(children)) => (entry, children),
                        _ => return Err(OptionError::UnexpectedField(field.tag)),
                    };
                    entry.children = children;
                    match stack.last_mut() {
                        Some(parent) => parent.push(entry),
                        None => return Err(OptionError::UnexpectedField(field.tag)),
                    }
                }
                _ => return Err(OptionError::UnexpectedField(field.tag)),
            }
        }
        if !open.is_empty() {
            return Err(OptionError::MissingField("end of listing"));
        }

        let body = match (error, value, listed) {
            (Some(text), _, _) => ReplyBody::Error(text),
            (None, _, true) => ReplyBody::List(stack.pop().unwrap_or_default()),
            (None, Some(value), false) => ReplyBody::Value(value),
            (None, None, false) => ReplyBody::Done,
        };
        Ok(Self {
            request_id: request_id.ok_or(OptionError::MissingField("request id"))?,
            source_id,
            target_id,
            body,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::framing::{MessageCodec, ReadStatus};
    use anyhow::Result;
    use async_trait::async_trait;
    use bytes::{BufMut, BytesMut};

    #[derive(Default)]
    struct Wire(BytesMut);

    #[async_trait]
    impl MessageSink for Wire {
        async fn send_message(&mut self, msg: Message) -> Result<(), SinkError> {
            self.0.put_slice(&msg.to_buf());
            Ok(())
        }
    }

    impl Wire {
        fn read(&mut self) -> Message {
            match MessageCodec::new().read(&mut self.0, false).unwrap() {
                ReadStatus::Finished(msg) => msg,
                other => panic!("expected a message, got {:?}", other),
            }
        }
    }

    #[test]
    fn request_fields() -> Result<()> {
        let req = OptionRequest::set(9, 1, 2, "manager.address".parse()?, "10.0.0.1");
        let mut msg = req.to_message()?;
        assert_eq!(msg.tag, MessageTag::OptionRequest);
        assert_eq!(OptionRequest::from_message(&mut msg)?, req);

        let req = OptionRequest::list(10, 1, 0, None);
        assert_eq!(OptionRequest::from_message(&mut req.to_message()?)?, req);
        Ok(())
    }

    #[test]
    fn incomplete_requests_keep_their_id() -> Result<()> {
        let mut msg = Message::new(MessageTag::OptionRequest, Priority::High);
        msg.encode_u32(OptionTag::RequestId.into(), 77)?;
        msg.encode_field(OptionTag::Set.into(), &[])?;
        msg.encode_str(OptionTag::Path.into(), "a.b")?;
        msg.mark_end();

        let (raw, outcome) = RawRequest::parse(&mut msg);
        assert!(outcome.is_ok());
        assert_eq!(raw.request_id, Some(77));
        assert!(matches!(
            raw.into_request(),
            Err(OptionError::MissingField("value"))
        ));
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn nested_listing_survives_fragmentation() -> Result<()> {
        let entries: Vec<Listing> = (0..200)
            .map(|i| Listing {
                name: format!("section{}", i),
                description: "A section".into(),
                value: None,
                children: vec![Listing {
                    name: "option".into(),
                    description: String::new(),
                    value: Some(format!("{}", i)),
                    children: vec![],
                }],
            })
            .collect();
        let reply = OptionReply {
            request_id: 5,
            source_id: 1,
            target_id: 2,
            body: ReplyBody::List(entries),
        };
        let mut wire = Wire::default();
        reply.write(&mut wire).await?;
        assert!(wire.0.len() > crate::framing::DEFAULT_FRAGMENT_SIZE);

        let mut msg = wire.read();
        assert_eq!(OptionReply::from_message(&mut msg)?, reply);
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn every_reply_kind_reads_back() -> Result<()> {
        for body in [
            ReplyBody::Done,
            ReplyBody::Value("x".into()),
            ReplyBody::Error("Unknown option 'a'".into()),
            ReplyBody::List(Vec::new()),
        ] {
            let reply = OptionReply {
                request_id: 1,
                source_id: 2,
                target_id: 3,
                body,
            };
            let mut wire = Wire::default();
            reply.write(&mut wire).await?;
            assert_eq!(OptionReply::from_message(&mut wire.read())?, reply);
        }
        Ok(())
    }
}
