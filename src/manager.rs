//! Routing of outgoing messages over a topology of manager connections
//!
//! The topology is an ordered list of AND-chains. A message goes to every member of the
//! first chain that still has a live member; a member that can't take it keeps it in its
//! own spool. When no chain is usable the message is queued in the global spool and the
//! manager is in failsafe mode until some chain recovers.
//!
//! Nothing runs in the background: [`ConnectionManager::tick`] must be called
//! periodically to reconnect dead members and to poll live ones for administrative input.

mod topology;

pub use topology::Topology;

use crate::config::ConfigError;
use crate::connection::{
    Address, Authenticator, Connection, ConnectionError, Connector, Permission,
};
use crate::framing::{Message, MessageSink, MessageTag, SinkError};
use crate::options::RequestHandler;
use crate::spool::{spool_dir_name, Spool, SpoolError};
use crate::timer::{BackoffPolicy, TimerList};
use async_trait::async_trait;
use bitflags::bitflags;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use strum_macros::Display;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const GLOBAL_SPOOL: &str = "global";

bitflags! {
    #[derive(Eq, PartialEq, Copy, Clone, Debug)]
    pub struct PoolFlags: u8 {
        /// Arm a reconnection timer for every dead connection
        const RECONNECT = 1;
        /// Spool messages that can't be delivered
        const FAILOVER = 2;
    }
}

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("Failed to open spool")]
    Spool(#[from] SpoolError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("No connection {0} in this manager")]
    UnknownConnection(ConnectionId),
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub topology: Topology,
    /// Identifier declared on every connection
    pub analyzer_id: u64,
    /// Root of the spools: `global` and one directory per destination
    pub spool_dir: PathBuf,
    pub quota: Option<u64>,
    /// Permission every manager must grant
    pub required: Permission,
    pub backoff: BackoffPolicy,
    pub poll_interval: Duration,
    pub flags: PoolFlags,
}

/// Stable handle on a connection of the manager, valid until the next reconfiguration
#[derive(Eq, PartialEq, Hash, Copy, Clone, Debug)]
pub struct ConnectionId(usize);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Display)]
pub enum PoolEvent {
    Alive,
    Dead,
    /// A message read while polling that no request handler took
    Input(Message),
}

pub type EventHandler = Box<dyn FnMut(PoolEvent, &Connection) + Send>;

/// What became of a message handed to [`ConnectionManager::send`]
#[derive(Eq, PartialEq, Copy, Clone, Debug, Display)]
pub enum SendOutcome {
    /// Every member of the selected chain took it
    Delivered,
    /// Some members took it, the others kept it in their own spool
    Spooled,
    /// No chain was usable, the message waits in the global spool
    Queued,
    /// No chain was usable and the message couldn't be spooled
    Lost,
}

#[derive(Eq, PartialEq, Clone, Debug)]
pub struct ChainStatus {
    pub members: Vec<ConnectionId>,
    pub dead: usize,
}

#[derive(Eq, PartialEq, Copy, Clone, Debug)]
enum TimerKind {
    Reconnect(ConnectionId),
    CheckInput,
}

struct Slot {
    cnx: Connection,
    spool: Option<Spool>,
    chain: usize,
    dead: bool,
    /// Polled for inbound messages
    registered: bool,
    /// Alive again, but not polled until the global spool drains through its chain
    held: bool,
    /// Delay of the next reconnection attempt
    backoff: Duration,
}

struct Chain {
    members: Vec<ConnectionId>,
    dead: usize,
}

impl Chain {
    fn is_viable(&self) -> bool {
        self.dead < self.members.len()
    }
}

struct Pool {
    config: ManagerConfig,
    connector: Box<dyn Connector>,
    auth: Box<dyn Authenticator>,
    slots: Vec<Slot>,
    chains: Vec<Chain>,
    timers: TimerList<TimerKind>,
    event_handler: Option<EventHandler>,
}

impl Pool {
    fn emit(&mut self, event: PoolEvent, id: ConnectionId) {
        if let Some(handler) = self.event_handler.as_mut() {
            handler(event, &self.slots[id.0].cnx);
        }
    }

    fn notify_dead(&mut self, id: ConnectionId, reason: &dyn fmt::Display, now: Instant) {
        let slot = &mut self.slots[id.0];
        if slot.dead {
            return;
        }
        warn!(
            "Connection error with {}: {}. Failover enabled.",
            slot.cnx.address(),
            reason
        );
        slot.dead = true;
        slot.registered = false;
        slot.held = false;
        slot.cnx.close();
        self.chains[slot.chain].dead += 1;
        if self.config.flags.contains(PoolFlags::RECONNECT) {
            self.timers.init(TimerKind::Reconnect(id), slot.backoff, now);
        }
        self.emit(PoolEvent::Dead, id);
    }

    fn mark_alive(&mut self, id: ConnectionId) {
        let slot = &mut self.slots[id.0];
        if !slot.dead {
            return;
        }
        slot.dead = false;
        self.chains[slot.chain].dead -= 1;
        self.timers.destroy(&TimerKind::Reconnect(id));
        self.emit(PoolEvent::Alive, id);
    }

    /// Sends `msg` to every member of `chain`. A member that can't take it is marked dead
    /// and keeps the message in its own spool; the others are still tried.
    /// Returns whether every member took it.
    async fn broadcast(&mut self, chain: usize, msg: &Message, now: Instant) -> bool {
        let mut delivered = true;
        for i in 0..self.chains[chain].members.len() {
            let id = self.chains[chain].members[i];
            let slot = &mut self.slots[id.0];
            let result = match slot.dead {
                true => None,
                false => Some(slot.cnx.send(msg.clone()).await),
            };
            match result {
                Some(Ok(())) => continue,
                Some(Err(e)) if !e.is_retryable() => {
                    // The link is fine, this message can't go through it
                    error!("Dropping message for {}: {}", slot.cnx.address(), e);
                    delivered = false;
                    continue;
                }
                Some(Err(e)) => self.notify_dead(id, &e, now),
                None => {}
            }
            delivered = false;
            self.save_member(id, msg).await;
        }
        delivered
    }

    async fn save_member(&mut self, id: ConnectionId, msg: &Message) {
        let slot = &mut self.slots[id.0];
        match slot.spool.as_mut() {
            Some(spool) => {
                if let Err(e) = spool.save(msg).await {
                    error!(
                        "Failed to spool message for {} in {}: {}. Message lost.",
                        slot.cnx.address(),
                        spool.path().display(),
                        e
                    );
                }
            }
            None => warn!(
                "Failover disabled, message for {} is lost",
                slot.cnx.address()
            ),
        }
    }

    /// Re-sends a member's own spool. Returns false if the connection dropped meanwhile.
    async fn flush_own_spool(&mut self, id: ConnectionId, now: Instant) -> bool {
        let slot = &mut self.slots[id.0];
        if let Some(spool) = slot.spool.as_mut() {
            if let Err(e) = spool.flush(&mut slot.cnx).await {
                error!("Failed to flush {}: {}", spool.path().display(), e);
            }
        }
        if slot.cnx.is_established() {
            return true;
        }
        let reason = format!("connection lost while flushing {}", slot.cnx.address());
        self.notify_dead(id, &reason, now);
        false
    }
}

/// Delivers to a whole chain, as long as none of its members is dead
struct ChainSink<'a> {
    pool: &'a mut Pool,
    chain: usize,
    now: Instant,
}

#[async_trait]
impl<'a> MessageSink for ChainSink<'a> {
    async fn send_message(&mut self, msg: Message) -> Result<(), SinkError> {
        if self.pool.chains[self.chain].dead > 0 {
            return Err(SinkError::Unavailable);
        }
        self.pool.broadcast(self.chain, &msg, self.now).await;
        Ok(())
    }
}

pub struct ConnectionManager {
    pool: Pool,
    global_spool: Option<Spool>,
    request_handler: Option<Box<dyn RequestHandler>>,
    failsafe: bool,
}

impl ConnectionManager {
    /// Nothing is opened or connected until [`init`](Self::init)
    pub fn new(
        config: ManagerConfig,
        connector: Box<dyn Connector>,
        auth: Box<dyn Authenticator>,
    ) -> Self {
        Self {
            pool: Pool {
                config,
                connector,
                auth,
                slots: Vec::new(),
                chains: Vec::new(),
                timers: TimerList::new(),
                event_handler: None,
            },
            global_spool: None,
            request_handler: None,
            failsafe: false,
        }
    }

    pub fn set_event_handler(&mut self, handler: EventHandler) {
        self.pool.event_handler = Some(handler);
    }

    /// Receives the option requests read while polling
    pub fn set_request_handler(&mut self, handler: Box<dyn RequestHandler>) {
        self.request_handler = Some(handler);
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.pool.config
    }

    /// Connects every endpoint of the topology and flushes the global spool through the
    /// first chain that came up complete.
    ///
    /// Unreachable endpoints are not an error: they start dead, with their reconnection
    /// timer armed. An endpoint refusing our permission is, since retrying can't fix it.
    pub async fn init(&mut self) -> Result<(), ManagerError> {
        let now = Instant::now();
        let config = &self.pool.config;
        if config.flags.contains(PoolFlags::FAILOVER) && self.global_spool.is_none() {
            let dir = config.spool_dir.join(GLOBAL_SPOOL);
            self.global_spool = Some(Spool::open(dir, config.quota).await?);
        }

        let topology = self.pool.config.topology.clone();
        info!("Connecting to {}", topology);
        for (c, group) in topology.groups().iter().enumerate() {
            self.pool.chains.push(Chain {
                members: Vec::with_capacity(group.len()),
                dead: 0,
            });
            for address in group {
                self.add_slot(c, address, now).await?;
            }
        }

        for c in 0..self.pool.chains.len() {
            if self.pool.chains[c].dead > 0 {
                continue;
            }
            if self.flush_global(c, now).await {
                break;
            }
        }
        self.update_failsafe();

        let poll_interval = self.pool.config.poll_interval;
        self.pool
            .timers
            .init(TimerKind::CheckInput, poll_interval, now);
        Ok(())
    }

    async fn add_slot(
        &mut self,
        chain: usize,
        address: &Address,
        now: Instant,
    ) -> Result<(), ManagerError> {
        let pool = &mut self.pool;
        let spool = match pool.config.flags.contains(PoolFlags::FAILOVER) {
            true => {
                let dir = pool
                    .config
                    .spool_dir
                    .join(spool_dir_name(&address.to_string()));
                Some(Spool::open(dir, pool.config.quota).await?)
            }
            false => None,
        };
        let mut cnx = Connection::from_address(address.clone());
        let result = cnx
            .connect(
                &*pool.connector,
                &*pool.auth,
                pool.config.required,
                pool.config.analyzer_id,
            )
            .await;

        let id = ConnectionId(pool.slots.len());
        pool.slots.push(Slot {
            cnx,
            spool,
            chain,
            dead: false,
            registered: false,
            held: false,
            backoff: pool.config.backoff.initial,
        });
        pool.chains[chain].members.push(id);

        match result {
            Ok(()) => {
                pool.emit(PoolEvent::Alive, id);
                if pool.flush_own_spool(id, now).await {
                    pool.slots[id.0].registered = true;
                }
                Ok(())
            }
            Err(e) => {
                pool.notify_dead(id, &e, now);
                match e.needs_setup() {
                    true => Err(e.into()),
                    false => Ok(()),
                }
            }
        }
    }

    /// Sends the global spool through `chain`. Returns true once nothing is left in it.
    async fn flush_global(&mut self, chain: usize, now: Instant) -> bool {
        let spool = match self.global_spool.as_mut() {
            Some(spool) => spool,
            None => return true,
        };
        let mut sink = ChainSink {
            pool: &mut self.pool,
            chain,
            now,
        };
        match spool.flush(&mut sink).await {
            Ok(report) => report.is_complete(),
            Err(e) => {
                error!("Failed to flush {}: {}", spool.path().display(), e);
                false
            }
        }
    }

    fn update_failsafe(&mut self) {
        let failsafe = !self.pool.chains.iter().any(Chain::is_viable);
        if failsafe == self.failsafe {
            return;
        }
        self.failsafe = failsafe;
        if failsafe {
            warn!(
                "Can't contact any configured manager ({}), enabling failsafe mode",
                self.pool.config.topology
            );
        } else {
            info!("A manager is reachable again, leaving failsafe mode");
        }
    }

    /// True while every chain is dead
    pub fn is_failsafe(&self) -> bool {
        self.failsafe
    }

    /// Routes a message. The message is terminated first if it wasn't.
    ///
    /// Failures never surface as errors: they end up in a spool, and the outcome tells
    /// where the message went.
    pub async fn send(&mut self, mut msg: Message) -> SendOutcome {
        msg.mark_end();
        let now = Instant::now();
        self.update_failsafe();

        let outcome = match self.pool.chains.iter().position(Chain::is_viable) {
            Some(chain) => match self.pool.broadcast(chain, &msg, now).await {
                true => SendOutcome::Delivered,
                false => SendOutcome::Spooled,
            },
            None => match self.global_spool.as_mut() {
                Some(spool) => match spool.save(&msg).await {
                    Ok(()) => SendOutcome::Queued,
                    Err(e) => {
                        error!(
                            "Failed to queue message in {}: {}. Message lost.",
                            spool.path().display(),
                            e
                        );
                        SendOutcome::Lost
                    }
                },
                None => SendOutcome::Lost,
            },
        };
        self.update_failsafe();
        outcome
    }

    /// Runs every timer expired at `now`: reconnection attempts and input polling.
    /// Returns when the next timer is due.
    pub async fn tick(&mut self, now: Instant) -> Option<Instant> {
        for (timer, expire) in self.pool.timers.poll_expired(now) {
            match timer {
                TimerKind::Reconnect(id) => self.reconnect(id, expire, now).await,
                TimerKind::CheckInput => {
                    self.check_input().await;
                    let poll_interval = self.pool.config.poll_interval;
                    self.pool
                        .timers
                        .init(TimerKind::CheckInput, poll_interval, now);
                }
            }
        }
        self.pool.timers.next_deadline()
    }

    async fn reconnect(&mut self, id: ConnectionId, expire: Duration, now: Instant) {
        let pool = &mut self.pool;
        let slot = match pool.slots.get_mut(id.0) {
            Some(slot) if slot.dead => slot,
            _ => return,
        };
        let result = slot
            .cnx
            .connect(
                &*pool.connector,
                &*pool.auth,
                pool.config.required,
                pool.config.analyzer_id,
            )
            .await;
        match result {
            Ok(()) => self.recover(id, now).await,
            Err(e) => {
                slot.backoff = pool.config.backoff.next(expire);
                warn!(
                    "Could not reconnect to {}: {}. Next attempt in {:?}",
                    slot.cnx.address(),
                    e,
                    slot.backoff
                );
                pool.timers
                    .init(TimerKind::Reconnect(id), slot.backoff, now);
            }
        }
    }

    /// Brings a reconnected member back: own spool first, then the global spool if its
    /// chain is now complete. The member is polled again only once both are drained.
    async fn recover(&mut self, id: ConnectionId, now: Instant) {
        self.pool.mark_alive(id);
        if !self.pool.flush_own_spool(id, now).await {
            self.update_failsafe();
            return;
        }
        let chain = self.pool.slots[id.0].chain;
        let drained = match self.pool.chains[chain].dead {
            0 => self.flush_global(chain, now).await,
            _ => true,
        };

        let initial = self.pool.config.backoff.initial;
        let slot = &mut self.pool.slots[id.0];
        if !slot.dead {
            slot.backoff = initial;
            slot.held = !drained;
        }
        if drained {
            // Members held back by an earlier incomplete flush of this chain come back too
            for i in 0..self.pool.chains[chain].members.len() {
                let member = self.pool.chains[chain].members[i];
                let slot = &mut self.pool.slots[member.0];
                if !slot.dead && (slot.held || member == id) {
                    slot.held = false;
                    slot.registered = true;
                }
            }
        } else {
            debug!(
                "Not polling {} until the global spool is flushed",
                self.pool.slots[id.0].cnx.address()
            );
        }
        self.update_failsafe();
    }

    /// Drains the messages waiting on every polled connection. Option requests go to the
    /// request handler, anything else is reported as an input event.
    async fn check_input(&mut self) {
        for i in 0..self.pool.slots.len() {
            let id = ConnectionId(i);
            loop {
                let slot = &mut self.pool.slots[i];
                if !slot.registered {
                    break;
                }
                let msg = match slot.cnx.try_recv() {
                    Ok(Some(msg)) => msg,
                    Ok(None) => break,
                    Err(e @ ConnectionError::Profile { .. }) => {
                        warn!("Rejected message: {}", e);
                        continue;
                    }
                    Err(e) => {
                        warn!(
                            "Error reading from {}: {}. No longer polling it.",
                            slot.cnx.address(),
                            e
                        );
                        slot.registered = false;
                        break;
                    }
                };
                match (msg.tag, self.request_handler.as_mut()) {
                    (MessageTag::OptionRequest, Some(handler)) => {
                        let cnx = &mut self.pool.slots[i].cnx;
                        if let Err(e) = handler.handle(msg, &mut *cnx).await {
                            warn!("Failed to answer option request from {}: {}", cnx.address(), e);
                        }
                    }
                    _ => self.pool.emit(PoolEvent::Input(msg), id),
                }
            }
        }
    }

    fn slot_index(&self, id: ConnectionId) -> Result<usize, ManagerError> {
        match id.0 < self.pool.slots.len() {
            true => Ok(id.0),
            false => Err(ManagerError::UnknownConnection(id)),
        }
    }

    /// Marks a connection dead after a failure noticed outside the manager
    pub fn set_connection_dead(&mut self, id: ConnectionId) -> Result<(), ManagerError> {
        self.slot_index(id)?;
        self.pool
            .notify_dead(id, &"marked dead by caller", Instant::now());
        self.update_failsafe();
        Ok(())
    }

    /// Brings a dead connection back right away, reconnecting it if needed, and flushes
    /// what was spooled for it
    pub async fn set_connection_alive(&mut self, id: ConnectionId) -> Result<(), ManagerError> {
        let i = self.slot_index(id)?;
        let now = Instant::now();
        let pool = &mut self.pool;
        let slot = &mut pool.slots[i];
        if !slot.dead {
            return Ok(());
        }
        if !slot.cnx.is_established() {
            slot.cnx
                .connect(
                    &*pool.connector,
                    &*pool.auth,
                    pool.config.required,
                    pool.config.analyzer_id,
                )
                .await?;
        }
        self.recover(id, now).await;
        Ok(())
    }

    /// Replaces the topology. Current connections and their timers are torn down first;
    /// spools persist on disk and are picked up by endpoints that remain.
    pub async fn reconfigure(&mut self, topology: Topology) -> Result<(), ManagerError> {
        info!("Switching to {}", topology);
        self.teardown().await;
        self.pool.config.topology = topology;
        self.init().await
    }

    /// [`reconfigure`](Self::reconfigure) from a connection string
    pub async fn set_connection_string(&mut self, connection: &str) -> Result<(), ManagerError> {
        let topology = connection.parse().map_err(ManagerError::Config)?;
        self.reconfigure(topology).await
    }

    async fn teardown(&mut self) {
        self.pool.timers.clear();
        self.pool.chains.clear();
        for slot in self.pool.slots.drain(..) {
            let address = slot.cnx.address().to_string();
            if let Err(e) = slot.cnx.destroy().await {
                debug!("Error closing connection to {}: {}", address, e);
            }
        }
    }

    /// Closes every connection
    pub async fn shutdown(mut self) {
        self.teardown().await;
    }

    pub fn topology(&self) -> &Topology {
        &self.pool.config.topology
    }

    pub fn connections(&self) -> impl Iterator<Item = (ConnectionId, &Connection)> {
        self.pool
            .slots
            .iter()
            .enumerate()
            .map(|(i, slot)| (ConnectionId(i), &slot.cnx))
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.pool.slots.get(id.0).map(|slot| &slot.cnx)
    }

    pub fn find(&self, address: &Address) -> Option<ConnectionId> {
        self.pool
            .slots
            .iter()
            .position(|slot| slot.cnx.address() == address)
            .map(ConnectionId)
    }

    pub fn is_dead(&self, id: ConnectionId) -> bool {
        self.pool.slots.get(id.0).map_or(false, |slot| slot.dead)
    }

    /// Delay before the next reconnection attempt, if one is scheduled
    pub fn retry_delay(&self, id: ConnectionId) -> Option<Duration> {
        self.pool.timers.expire(&TimerKind::Reconnect(id))
    }

    pub fn chains(&self) -> Vec<ChainStatus> {
        self.pool
            .chains
            .iter()
            .map(|chain| ChainStatus {
                members: chain.members.clone(),
                dead: chain.dead,
            })
            .collect()
    }

    pub fn spool(&self, id: ConnectionId) -> Option<&Spool> {
        self.pool.slots.get(id.0)?.spool.as_ref()
    }

    pub fn global_spool(&self) -> Option<&Spool> {
        self.global_spool.as_ref()
    }
}
