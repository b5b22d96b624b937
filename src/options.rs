//! Remote option administration
//!
//! An administrator sends an option request (GET, SET or LIST on a dotted option path)
//! through a manager. The [`OptionServer`] answers it from the analyzer's [`OptionTree`]
//! on the connection the request came from.

mod path;
mod request;
mod tree;

pub use path::{OptionPath, Segment};
pub use request::{OptionReply, OptionRequest, OptionTag, ReplyBody, RequestKind};
pub use tree::{Listing, OptionNode, OptionTree};

use crate::connection::{Connection, ConnectionError};
use crate::framing::{FramingError, Message, MessageSink, MessageTag, SinkError};
use async_trait::async_trait;
use request::RawRequest;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum OptionError {
    #[error("Invalid option path '{0}'")]
    InvalidPath(String),
    #[error("Unknown option '{0}'")]
    UnknownOption(String),
    #[error("Option '{0}' has several instances, one must be named")]
    InstanceRequired(String),
    #[error("Option '{0}' has no instances")]
    NotMultiple(String),
    #[error("Option '{0}' has no instance '{1}'")]
    UnknownInstance(String, String),
    #[error("'{0}' is a section, not a value")]
    NotAValue(String),
    #[error("Option '{0}' has no value")]
    NoValue(String),
    #[error("Option '{0}' is read-only")]
    ReadOnly(String),
    #[error("Missing {0} in option message")]
    MissingField(&'static str),
    #[error("Unexpected field {0:#x} in option message")]
    UnexpectedField(u8),
    #[error("Expected an option reply, got a {0} message")]
    UnexpectedMessage(MessageTag),
    #[error("Peer answered: {0}")]
    Remote(String),
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Sink(#[from] SinkError),
}

/// Receives the option requests read from manager connections
#[async_trait]
pub trait RequestHandler: Send {
    /// Handles one request. Replies go to `reply_to`, the connection it came from.
    async fn handle(&mut self, request: Message, reply_to: &mut dyn MessageSink)
        -> Result<(), SinkError>;
}

/// Answers option requests addressed to one analyzer
pub struct OptionServer {
    tree: Arc<Mutex<OptionTree>>,
    analyzer_id: u64,
}

impl OptionServer {
    pub fn new(tree: Arc<Mutex<OptionTree>>, analyzer_id: u64) -> Self {
        Self { tree, analyzer_id }
    }

    pub fn tree(&self) -> &Arc<Mutex<OptionTree>> {
        &self.tree
    }

    fn apply(&self, request: &OptionRequest) -> Result<ReplyBody, OptionError> {
        if request.target_id != 0 && request.target_id != self.analyzer_id {
            return Err(OptionError::Remote(format!(
                "request is for analyzer {}, this is {}",
                request.target_id, self.analyzer_id
            )));
        }
        let mut tree = match self.tree.lock() {
            Ok(tree) => tree,
            Err(poisoned) => poisoned.into_inner(),
        };
        match (request.kind, &request.path, &request.value) {
            (RequestKind::Get, Some(path), _) => Ok(ReplyBody::Value(tree.get(path)?)),
            (RequestKind::Set, Some(path), Some(value)) => {
                tree.set(path, value)?;
                Ok(ReplyBody::Done)
            }
            (RequestKind::List, path, _) => Ok(ReplyBody::List(tree.list(path.as_ref())?)),
            _ => Err(OptionError::MissingField("option path")),
        }
    }

    /// Builds the reply to a raw request message. Errors become error replies.
    pub fn answer(&self, mut msg: Message) -> OptionReply {
        let (raw, parsed) = RawRequest::parse(&mut msg);
        let request_id = raw.request_id.unwrap_or(0);
        let target_id = raw.source_id.unwrap_or(0);
        let body = match parsed.and_then(|_| raw.into_request()) {
            Ok(request) => {
                debug!(
                    "{} request {} from {}: {:?}",
                    request.kind, request.request_id, request.source_id, request.path
                );
                self.apply(&request)
                    .unwrap_or_else(|e| ReplyBody::Error(e.to_string()))
            }
            Err(e) => {
                warn!("Malformed option request {}: {}", request_id, e);
                ReplyBody::Error(e.to_string())
            }
        };
        OptionReply {
            request_id,
            source_id: self.analyzer_id,
            target_id,
            body,
        }
    }
}

#[async_trait]
impl RequestHandler for OptionServer {
    async fn handle(
        &mut self,
        request: Message,
        reply_to: &mut dyn MessageSink,
    ) -> Result<(), SinkError> {
        let reply = self.answer(request);
        reply.write(reply_to).await
    }
}

/// Sends `request` on `cnx` and waits for the reply with the same request id.
/// Unrelated messages received meanwhile are dropped.
pub async fn send_request(
    cnx: &mut Connection,
    request: &OptionRequest,
) -> Result<OptionReply, OptionError> {
    cnx.send(request.to_message()?).await?;
    loop {
        let mut msg = cnx.recv().await?;
        if msg.tag != MessageTag::OptionReply {
            debug!("Ignoring {} message while waiting for an option reply", msg.tag);
            continue;
        }
        let reply = OptionReply::from_message(&mut msg)?;
        if reply.request_id == request.request_id {
            return Ok(reply);
        }
        debug!("Ignoring reply to option request {}", reply.request_id);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::connection::testing::MockNetwork;
    use crate::connection::{Connector, PlaintextAuthenticator, Permission};
    use crate::framing::{MessageCodec, Priority, ReadStatus};
    use anyhow::Result;
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

    fn server() -> OptionServer {
        let mut tree = OptionTree::new();
        tree.add(
            OptionNode::section("manager", "Manager connection")
                .with_child(OptionNode::value("address", "Manager address", Some("unix"))),
        );
        OptionServer::new(Arc::new(Mutex::new(tree)), 42)
    }

    async fn roundtrip(server: &mut OptionServer, request: &OptionRequest) -> Result<OptionReply> {
        let mut wire = Wire::default();
        server.handle(request.to_message()?, &mut wire).await?;
        let mut msg = match MessageCodec::new().read(&mut wire.0, false)? {
            ReadStatus::Finished(msg) => msg,
            other => panic!("expected a reply, got {:?}", other),
        };
        Ok(OptionReply::from_message(&mut msg)?)
    }

    #[test_log::test(tokio::test)]
    async fn get_set_list() -> Result<()> {
        let mut server = server();
        let path: OptionPath = "manager.address".parse()?;

        let reply = roundtrip(&mut server, &OptionRequest::get(1, 7, 42, path.clone())).await?;
        assert_eq!(reply.request_id, 1);
        assert_eq!(reply.source_id, 42);
        assert_eq!(reply.target_id, 7);
        assert_eq!(reply.body, ReplyBody::Value("unix".into()));

        let reply = roundtrip(&mut server, &OptionRequest::set(2, 7, 0, path.clone(), "b")).await?;
        assert_eq!(reply.body, ReplyBody::Done);
        assert_eq!(server.tree().lock().unwrap().get(&path)?, "b");

        let reply = roundtrip(&mut server, &OptionRequest::list(3, 7, 42, None)).await?;
        match reply.body {
            ReplyBody::List(entries) => {
                assert_eq!(entries[0].name, "manager");
                assert_eq!(entries[0].children[0].value.as_deref(), Some("b"));
            }
            other => panic!("expected a listing, got {:?}", other),
        }
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn listing_an_empty_tree() -> Result<()> {
        let mut server = OptionServer::new(Arc::new(Mutex::new(OptionTree::new())), 42);
        let reply = roundtrip(&mut server, &OptionRequest::list(8, 7, 42, None)).await?;
        assert_eq!(reply.body, ReplyBody::List(Vec::new()));
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn failures_become_error_replies() -> Result<()> {
        let mut server = server();
        let reply =
            roundtrip(&mut server, &OptionRequest::get(4, 7, 42, "nope".parse()?)).await?;
        assert!(matches!(reply.body, ReplyBody::Error(text) if text.contains("nope")));

        // Addressed to someone else
        let reply = roundtrip(
            &mut server,
            &OptionRequest::get(5, 7, 99, "manager.address".parse()?),
        )
        .await?;
        assert!(matches!(reply.body, ReplyBody::Error(_)));

        // No request kind: still answered with the request id
        let mut msg = Message::new(MessageTag::OptionRequest, Priority::High);
        msg.encode_u32(OptionTag::RequestId.into(), 6)?;
        msg.mark_end();
        let reply = server.answer(msg);
        assert_eq!(reply.request_id, 6);
        assert!(matches!(reply.body, ReplyBody::Error(_)));
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn request_over_a_connection() -> Result<()> {
        let (net, _rx) = MockNetwork::new();
        let mut reply = Message::new(MessageTag::OptionReply, Priority::High);
        reply.encode_u32(OptionTag::RequestId.into(), 11)?;
        reply.encode_str(OptionTag::Value.into(), "10")?;
        reply.mark_end();
        net.push("10.0.0.1:4690", reply);
        let all = Permission::all();
        net.set_grant("10.0.0.1:4690", all);

        let mut cnx = Connection::new("10.0.0.1")?;
        let connector: &dyn Connector = &net;
        cnx.connect(connector, &PlaintextAuthenticator::new(1, all), all, 1)
            .await?;
        let request = OptionRequest::get(11, 1, 42, "a.b".parse()?);
        let reply = send_request(&mut cnx, &request).await?;
        assert_eq!(reply.body, ReplyBody::Value("10".into()));
        Ok(())
    }
}
