//! Dynamic channel manager
//!
//! `DynamicChannelManager` is the public entry point. Every public call and
//! every transport event becomes a `Command` on one queue; a single task
//! owns the service registry and all links and processes the commands in
//! order. Results reach callers as callbacks posted to the `Handler` they
//! passed in.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use l2cap_dyn::*;
//! # async fn demo(transport: Arc<dyn Transport>, gate: Arc<dyn SecurityGate>) -> L2capResult<()> {
//! let manager = DynamicChannelManager::new(ManagerConfig::default(), transport, gate)?;
//! let handler = Handler::new();
//! let address: Address = "00:11:22:33:44:55".parse()?;
//!
//! manager.connect_channel(
//!     address,
//!     Psm::new(0x1001),
//!     |channel| println!("open: {:?}", channel),
//!     |reason| println!("failed: {}", reason),
//!     &handler,
//! );
//! # Ok(())
//! # }
//! ```

use super::channel::{DynamicChannel, PendingConnection};
use super::link_manager::LinkManager;
use super::psm::Psm;
use super::security::SecurityGate;
use super::service::{
    release_claim, ClaimedPsms, DynamicChannelService, PendingRegistration, ServiceEntry,
    ServiceRegistry,
};
use super::signaling::SignalingMessage;
use super::transport::Transport;
use super::types::{ChannelId, ChannelState, Direction, LinkState, SecurityPolicy};
use crate::address::Address;
use crate::config::ManagerConfig;
use crate::error::{ConnectionFailure, L2capError, L2capResult};
use crate::handler::Handler;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Work item for the manager's queue
pub(crate) enum Command {
    ConnectChannel {
        address: Address,
        pending: PendingConnection,
    },
    RegisterService {
        psm: Psm,
        pending: PendingRegistration,
    },
    UnregisterService {
        psm: Psm,
    },
    CloseChannel {
        address: Address,
        cid: ChannelId,
    },
    SendData {
        address: Address,
        cid: ChannelId,
        payload: Vec<u8>,
    },
    DisconnectLink {
        address: Address,
    },
    ConnectionComplete {
        address: Address,
        success: bool,
    },
    Disconnected {
        address: Address,
    },
    Signal {
        address: Address,
        message: SignalingMessage,
    },
    SignalFrame {
        address: Address,
        frame: Vec<u8>,
    },
    Data {
        address: Address,
        cid: ChannelId,
        payload: Vec<u8>,
    },
    ChannelTimeout {
        address: Address,
        cid: ChannelId,
        seq: u64,
    },
    LinkTimeout {
        address: Address,
        seq: u64,
    },
    SecurityResult {
        address: Address,
        cid: ChannelId,
        allowed: bool,
    },
    Snapshot {
        reply: oneshot::Sender<ManagerSnapshot>,
    },
    Shutdown {
        done: Option<oneshot::Sender<()>>,
    },
}

/// An open dynamic channel, handed to the user through the open callback
pub struct ChannelHandle {
    address: Address,
    psm: Psm,
    local_cid: ChannelId,
    remote_cid: ChannelId,
    local_mtu: u16,
    remote_mtu: u16,
    incoming: mpsc::UnboundedReceiver<Vec<u8>>,
    open: Arc<AtomicBool>,
    commands: mpsc::UnboundedSender<Command>,
}

impl ChannelHandle {
    pub(crate) fn new(
        channel: &DynamicChannel,
        incoming: mpsc::UnboundedReceiver<Vec<u8>>,
        open: Arc<AtomicBool>,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            address: channel.address(),
            psm: channel.psm(),
            local_cid: channel.local_cid(),
            remote_cid: channel.remote_cid(),
            local_mtu: channel.local_mtu(),
            remote_mtu: channel.remote_mtu(),
            incoming,
            open,
            commands,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn psm(&self) -> Psm {
        self.psm
    }

    pub fn local_cid(&self) -> ChannelId {
        self.local_cid
    }

    pub fn remote_cid(&self) -> ChannelId {
        self.remote_cid
    }

    /// Largest payload we accept
    pub fn local_mtu(&self) -> u16 {
        self.local_mtu
    }

    /// Largest payload the peer accepts
    pub fn remote_mtu(&self) -> u16 {
        self.remote_mtu
    }

    /// False once the channel has closed, from either side
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Queue `payload` for the peer
    pub fn send(&self, payload: Vec<u8>) -> L2capResult<()> {
        if !self.is_open() {
            return Err(L2capError::NotConnected);
        }
        if payload.len() > self.remote_mtu as usize {
            return Err(L2capError::MtuExceeded {
                len: payload.len(),
                mtu: self.remote_mtu,
            });
        }
        self.commands
            .send(Command::SendData {
                address: self.address,
                cid: self.local_cid,
                payload,
            })
            .map_err(|_| L2capError::ManagerStopped)
    }

    /// Next payload from the peer, or `None` once the channel has closed
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.incoming.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Vec<u8>> {
        self.incoming.try_recv().ok()
    }

    /// Disconnect the channel. Returns false if the manager has stopped.
    pub fn close(&self) -> bool {
        self.commands
            .send(Command::CloseChannel {
                address: self.address,
                cid: self.local_cid,
            })
            .is_ok()
    }
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("address", &self.address)
            .field("psm", &self.psm)
            .field("local_cid", &format_args!("0x{:04X}", self.local_cid))
            .field("remote_cid", &format_args!("0x{:04X}", self.remote_cid))
            .field("local_mtu", &self.local_mtu)
            .field("remote_mtu", &self.remote_mtu)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Inbound side of the `Transport` seam.
///
/// The transport reports link and signaling events here; each call only
/// queues the event for the manager.
#[derive(Clone)]
pub struct TransportEvents {
    commands: mpsc::UnboundedSender<Command>,
}

impl fmt::Debug for TransportEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportEvents")
            .field("closed", &self.commands.is_closed())
            .finish()
    }
}

impl TransportEvents {
    fn push(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("Manager stopped, dropping transport event");
        }
    }

    /// Outcome of `Transport::create_connection`, or an inbound link coming up
    pub fn on_connection_complete(&self, address: Address, success: bool) {
        self.push(Command::ConnectionComplete { address, success });
    }

    pub fn on_disconnected(&self, address: Address) {
        self.push(Command::Disconnected { address });
    }

    /// A decoded signaling command
    pub fn on_signal(&self, address: Address, message: SignalingMessage) {
        self.push(Command::Signal { address, message });
    }

    /// One raw signaling command, decoded on the manager's queue
    pub fn on_signal_frame(&self, address: Address, frame: &[u8]) {
        self.push(Command::SignalFrame {
            address,
            frame: frame.to_vec(),
        });
    }

    /// Payload received on the dynamic channel we know as `local_cid`
    pub fn on_data(&self, address: Address, local_cid: ChannelId, payload: Vec<u8>) {
        self.push(Command::Data {
            address,
            cid: local_cid,
            payload,
        });
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSnapshot {
    pub local_cid: ChannelId,
    pub remote_cid: ChannelId,
    pub psm: Psm,
    pub direction: Direction,
    pub policy: SecurityPolicy,
    pub state: ChannelState,
    pub local_mtu: u16,
    pub remote_mtu: u16,
}

impl From<&DynamicChannel> for ChannelSnapshot {
    fn from(channel: &DynamicChannel) -> Self {
        Self {
            local_cid: channel.local_cid(),
            remote_cid: channel.remote_cid(),
            psm: channel.psm(),
            direction: channel.direction(),
            policy: channel.policy(),
            state: channel.state(),
            local_mtu: channel.local_mtu(),
            remote_mtu: channel.remote_mtu(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSnapshot {
    pub address: Address,
    pub state: LinkState,
    pub channels: Vec<ChannelSnapshot>,
    /// Requests waiting for the link to connect
    pub pending: usize,
}

/// Point-in-time view of the manager's state
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ManagerSnapshot {
    pub links: Vec<LinkSnapshot>,
    pub services: Vec<Psm>,
}

impl ManagerSnapshot {
    pub fn link(&self, address: Address) -> Option<&LinkSnapshot> {
        self.links.iter().find(|link| link.address == address)
    }
}

/// State owned by the manager's queue
struct ManagerCore {
    registry: ServiceRegistry,
    links: LinkManager,
    claimed: ClaimedPsms,
    commands: mpsc::UnboundedSender<Command>,
}

impl ManagerCore {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        info!("Dynamic channel manager started");
        while let Some(command) = rx.recv().await {
            if let Command::Shutdown { done } = command {
                self.shutdown();
                rx.close();
                while let Ok(command) = rx.try_recv() {
                    Self::cancel(command);
                }
                if let Some(done) = done {
                    let _ = done.send(());
                }
                break;
            }
            self.handle(command);
        }
        info!("Dynamic channel manager stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::ConnectChannel { address, pending } => {
                self.links
                    .enqueue_pending_connection(address, pending, &self.registry);
            }
            Command::RegisterService { psm, pending } => self.register_service(psm, pending),
            Command::UnregisterService { psm } => self.unregister_service(psm),
            Command::CloseChannel { address, cid } => self.links.close_channel(address, cid),
            Command::SendData {
                address,
                cid,
                payload,
            } => self.links.send_data(address, cid, payload),
            Command::DisconnectLink { address } => self.links.disconnect_link(address),
            Command::ConnectionComplete { address, success } => {
                self.links
                    .on_connection_complete(address, success, &self.registry);
            }
            Command::Disconnected { address } => {
                self.links.on_disconnected(address, &self.registry);
            }
            Command::Signal { address, message } => {
                self.links.on_signal(address, message, &self.registry);
            }
            Command::SignalFrame { address, frame } => {
                self.links.on_signal_frame(address, &frame, &self.registry);
            }
            Command::Data {
                address,
                cid,
                payload,
            } => self.links.on_data(address, cid, payload),
            Command::ChannelTimeout { address, cid, seq } => {
                self.links.on_channel_timeout(address, cid, seq);
            }
            Command::LinkTimeout { address, seq } => self.links.on_link_timeout(address, seq),
            Command::SecurityResult {
                address,
                cid,
                allowed,
            } => self.links.on_security_result(address, cid, allowed),
            Command::Snapshot { reply } => {
                let _ = reply.send(ManagerSnapshot {
                    links: self.links.snapshot(),
                    services: self.registry.psms(),
                });
            }
            Command::Shutdown { .. } => {}
        }
    }

    fn register_service(&mut self, psm: Psm, pending: PendingRegistration) {
        let PendingRegistration {
            policy,
            on_registration_complete,
            on_connection_open,
            handler,
        } = pending;
        let entry = ServiceEntry {
            psm,
            policy,
            on_connection_open,
            handler: handler.clone(),
        };

        let outcome = match self.registry.register(entry) {
            Ok(()) => Ok(DynamicChannelService::new(
                psm,
                self.commands.clone(),
                self.claimed.clone(),
            )),
            Err(err) => {
                if !matches!(err, L2capError::PsmAlreadyRegistered(_)) {
                    self.claimed.lock().remove(&psm);
                }
                Err(err)
            }
        };
        handler.post(move || on_registration_complete(outcome));
    }

    /// The claim on `psm` was already released when this was queued
    fn unregister_service(&mut self, psm: Psm) {
        if let Err(err) = self.registry.unregister(psm) {
            debug!("unregister_service: {}", err);
        }
    }

    fn shutdown(&mut self) {
        info!("Shutting down dynamic channel manager");
        self.links.shutdown();
        self.registry.clear();
        self.claimed.lock().clear();
    }

    /// Fail a command that arrived after shutdown
    fn cancel(command: Command) {
        match command {
            Command::ConnectChannel { pending, .. } => {
                pending.deliver_failure(ConnectionFailure::Cancelled);
            }
            Command::RegisterService { pending, .. } => {
                let on_complete = pending.on_registration_complete;
                pending
                    .handler
                    .post(move || on_complete(Err(L2capError::ManagerStopped)));
            }
            Command::Shutdown { done: Some(done) } => {
                let _ = done.send(());
            }
            _ => {}
        }
    }
}

/// Manages dynamic L2CAP channels over ACL links provided by a `Transport`
pub struct DynamicChannelManager {
    commands: mpsc::UnboundedSender<Command>,
    claimed: ClaimedPsms,
    task: Option<JoinHandle<()>>,
}

impl DynamicChannelManager {
    /// Start a manager on the current tokio runtime
    pub fn new(
        config: ManagerConfig,
        transport: Arc<dyn Transport>,
        security: Arc<dyn SecurityGate>,
    ) -> L2capResult<Self> {
        config.validate()?;

        let (commands, rx) = mpsc::unbounded_channel();
        let claimed = ClaimedPsms::default();
        let core = ManagerCore {
            registry: ServiceRegistry::new(),
            links: LinkManager::new(Arc::new(config), transport, security, commands.clone()),
            claimed: claimed.clone(),
            commands: commands.clone(),
        };
        let task = tokio::spawn(core.run(rx));

        Ok(Self {
            commands,
            claimed,
            task: Some(task),
        })
    }

    fn submit(&self, command: Command) -> bool {
        if self.commands.send(command).is_err() {
            warn!("Dynamic channel manager has stopped");
            return false;
        }
        true
    }

    /// Open a channel to `psm` on `address`, creating the ACL link if needed.
    ///
    /// Exactly one of `on_open` or `on_fail` is later posted to `handler`.
    /// Returns false, without calling either, if the PSM is malformed or the
    /// manager has stopped.
    pub fn connect_channel<O, F>(
        &self,
        address: Address,
        psm: Psm,
        on_open: O,
        on_fail: F,
        handler: &Handler,
    ) -> bool
    where
        O: FnOnce(ChannelHandle) + Send + 'static,
        F: FnOnce(ConnectionFailure) + Send + 'static,
    {
        if !psm.is_valid() {
            warn!("connect_channel: invalid PSM {}", psm);
            return false;
        }
        let pending = PendingConnection::new(
            psm,
            Box::new(on_open),
            Box::new(on_fail),
            handler.clone(),
        );
        self.submit(Command::ConnectChannel { address, pending })
    }

    /// Register a service accepting inbound channels on `psm`.
    ///
    /// Returns false if `psm` is malformed or already registered. Otherwise
    /// `on_registration_complete` is posted to `handler` once the service is
    /// live, and `on_connection_open` is posted to `handler` for every
    /// inbound channel that opens.
    pub fn register_service<C, O>(
        &self,
        psm: Psm,
        policy: SecurityPolicy,
        on_registration_complete: C,
        on_connection_open: O,
        handler: &Handler,
    ) -> bool
    where
        C: FnOnce(L2capResult<DynamicChannelService>) + Send + 'static,
        O: Fn(ChannelHandle) + Send + Sync + 'static,
    {
        if !psm.is_valid() {
            warn!("register_service: invalid PSM {}", psm);
            return false;
        }
        // Claim and queue under one lock so claims follow queue order
        let mut claimed = self.claimed.lock();
        if !claimed.insert(psm) {
            debug!("register_service: PSM {} already registered", psm);
            return false;
        }

        let pending = PendingRegistration {
            policy,
            on_registration_complete: Box::new(on_registration_complete),
            on_connection_open: Arc::new(on_connection_open),
            handler: handler.clone(),
        };
        if !self.submit(Command::RegisterService { psm, pending }) {
            claimed.remove(&psm);
            return false;
        }
        true
    }

    /// Stop accepting inbound channels on `psm`. Open channels are unaffected.
    pub fn unregister_service(&self, psm: Psm) -> bool {
        if !release_claim(&self.claimed, &self.commands, psm) {
            warn!("Dynamic channel manager has stopped");
            return false;
        }
        true
    }

    /// Close every channel on the link to `address` and tear the link down.
    ///
    /// Channels still opening fail with `ConnectionFailure::Cancelled`.
    pub fn disconnect_link(&self, address: Address) -> bool {
        self.submit(Command::DisconnectLink { address })
    }

    /// Sink for the transport's events
    pub fn transport_events(&self) -> TransportEvents {
        TransportEvents {
            commands: self.commands.clone(),
        }
    }

    /// Current links, channels and registered services
    pub async fn snapshot(&self) -> L2capResult<ManagerSnapshot> {
        let (reply, rx) = oneshot::channel();
        if !self.submit(Command::Snapshot { reply }) {
            return Err(L2capError::ManagerStopped);
        }
        rx.await.map_err(|_| L2capError::ManagerStopped)
    }

    /// Cancel everything in flight, close all links and stop the queue
    pub async fn shutdown(mut self) {
        let (done, rx) = oneshot::channel();
        if self.submit(Command::Shutdown { done: Some(done) }) {
            let _ = rx.await;
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for DynamicChannelManager {
    fn drop(&mut self) {
        if self.task.is_some() {
            let _ = self.commands.send(Command::Shutdown { done: None });
        }
    }
}

impl fmt::Debug for DynamicChannelManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicChannelManager")
            .field("services", &self.claimed.lock().len())
            .field("running", &!self.commands.is_closed())
            .finish()
    }
}
