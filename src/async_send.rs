//! Deferred emission through a background worker
//!
//! Producers hand messages to an [`AsyncQueue`] and return immediately. A single worker
//! task owns the right to drive the [`ConnectionManager`]: it sends queued messages in
//! submission order and, whenever the queue is idle, ticks the manager once per poll
//! interval so that reconnections and input polling keep happening.

use crate::framing::{FramingError, Message, MessageSink, SinkError};
use crate::manager::{ConnectionManager, SendOutcome};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, trace};

/// Called by the worker once a message has been routed
pub type Callback = Box<dyn FnOnce(SendOutcome) + Send>;

struct Job {
    msg: Message,
    callback: Option<Callback>,
}

pub struct AsyncQueue {
    tx: mpsc::UnboundedSender<Job>,
    worker: JoinHandle<()>,
}

impl AsyncQueue {
    /// Spawns the worker on the current runtime
    pub fn start(manager: Arc<Mutex<ConnectionManager>>, poll_interval: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run(manager, rx, poll_interval));
        Self { tx, worker }
    }

    /// Queues a message. Fails only if the worker is gone.
    pub fn submit(&self, msg: Message, callback: Option<Callback>) -> Result<(), SinkError> {
        self.tx
            .send(Job { msg, callback })
            .map_err(|_| SinkError::Closed)
    }

    /// Stops accepting messages, lets the worker send what is queued, and waits for it
    pub async fn shutdown(self) {
        drop(self.tx);
        if let Err(e) = self.worker.await {
            error!("Send worker failed: {}", e);
        }
    }
}

#[async_trait]
impl MessageSink for AsyncQueue {
    /// Queued messages are routed one by one, so they must be complete
    async fn send_message(&mut self, msg: Message) -> Result<(), SinkError> {
        if !msg.is_ended() {
            return Err(FramingError::InvalidMessage(
                "fragments can't be queued, only terminated messages".into(),
            )
            .into());
        }
        self.submit(msg, None)
    }
}

async fn run(
    manager: Arc<Mutex<ConnectionManager>>,
    mut rx: mpsc::UnboundedReceiver<Job>,
    poll_interval: Duration,
) {
    let mut timer = tokio::time::interval(poll_interval);
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    debug!("Send worker started");

    loop {
        tokio::select! {
            biased;

            job = rx.recv() => {
                let Job { msg, callback } = match job {
                    Some(job) => job,
                    None => break,
                };
                let outcome = manager.lock().await.send(msg).await;
                trace!("Queued message {}", outcome);
                if let Some(callback) = callback {
                    callback(outcome);
                }
            }

            _ = timer.tick() => {
                manager.lock().await.tick(Instant::now()).await;
            }
        }
    }
    debug!("Send worker stopped, queue drained");
}
