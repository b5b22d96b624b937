//! The sensor side application context
//!
//! A [`ClientContext`] is built once at startup from [`Settings`] and owns everything the
//! sensor needs to emit: the connection manager, the option tree answering administrative
//! requests, and optionally a background send queue.

use crate::async_send::{AsyncQueue, Callback};
use crate::config::Settings;
use crate::connection::{Authenticator, Connector, PlaintextAuthenticator, TcpConnector};
use crate::framing::{Message, SinkError};
use crate::manager::{ConnectionManager, SendOutcome};
use crate::options::{OptionNode, OptionServer, OptionTree};
use crate::Error;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::info;

pub struct ClientContext {
    settings: Settings,
    manager: Arc<Mutex<ConnectionManager>>,
    options: Arc<std::sync::Mutex<OptionTree>>,
    queue: Option<AsyncQueue>,
}

/// Options every sensor exposes, on top of its own
fn builtin_options(settings: &Settings) -> OptionNode {
    let id = settings.analyzer_id.to_string();
    OptionNode::section("prelude", "Connection to the managers")
        .with_child(
            OptionNode::value(
                "analyzer-id",
                "Identifier declared to managers",
                Some(id.as_str()),
            )
            .read_only(),
        )
        .with_child(
            OptionNode::value(
                "server-addr",
                "Managers to send events to",
                Some(settings.connection.as_str()),
            )
            .read_only(),
        )
}

impl ClientContext {
    /// Connects to the configured managers with the given transport and authentication
    pub async fn start(
        settings: Settings,
        connector: Box<dyn Connector>,
        auth: Box<dyn Authenticator>,
        mut options: OptionTree,
    ) -> Result<Self, Error> {
        let config = settings.manager_config()?;
        options.add(builtin_options(&settings));
        let options = Arc::new(std::sync::Mutex::new(options));

        let mut manager = ConnectionManager::new(config, connector, auth);
        manager.set_request_handler(Box::new(OptionServer::new(
            options.clone(),
            settings.analyzer_id,
        )));
        manager.init().await?;
        info!(
            "Analyzer {} ready, sending to {}",
            settings.analyzer_id,
            manager.topology()
        );

        Ok(Self {
            settings,
            manager: Arc::new(Mutex::new(manager)),
            options,
            queue: None,
        })
    }

    /// [`start`](Self::start) over plain TCP and local sockets
    pub async fn start_plaintext(settings: Settings, options: OptionTree) -> Result<Self, Error> {
        let auth =
            PlaintextAuthenticator::new(settings.analyzer_id, settings.required_permission()?);
        Self::start(
            settings,
            Box::new(TcpConnector::default()),
            Box::new(auth),
            options,
        )
        .await
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn manager(&self) -> &Arc<Mutex<ConnectionManager>> {
        &self.manager
    }

    pub fn options(&self) -> &Arc<std::sync::Mutex<OptionTree>> {
        &self.options
    }

    /// Routes a message right away, waiting for the manager
    pub async fn send(&self, msg: Message) -> SendOutcome {
        self.manager.lock().await.send(msg).await
    }

    /// Starts the background worker. From then on the worker ticks the manager.
    pub fn enable_async(&mut self) {
        if self.queue.is_none() {
            let poll_interval = self.settings.poll_interval();
            self.queue = Some(AsyncQueue::start(self.manager.clone(), poll_interval));
        }
    }

    /// Hands a message to the background worker. Fails if it wasn't started.
    pub fn send_async(&self, msg: Message, callback: Option<Callback>) -> Result<(), SinkError> {
        match &self.queue {
            Some(queue) => queue.submit(msg, callback),
            None => Err(SinkError::Unavailable),
        }
    }

    /// Runs the manager's due timers, for callers driving it without the worker
    pub async fn tick(&self) -> Option<Instant> {
        self.manager.lock().await.tick(Instant::now()).await
    }

    /// Sends what is still queued, then closes every connection
    pub async fn shutdown(self) {
        if let Some(queue) = self.queue {
            queue.shutdown().await;
        }
        match Arc::try_unwrap(self.manager) {
            Ok(manager) => manager.into_inner().shutdown().await,
            Err(_) => info!("Manager still shared, leaving connections open"),
        }
    }
}
