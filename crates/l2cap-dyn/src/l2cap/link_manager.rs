//! ACL link bookkeeping and channel action execution
//!
//! The `LinkManager` keeps one `Link` per remote device, brings links up
//! on demand, routes inbound signaling to the owning channel and performs
//! the `Action`s the channel state machines emit. It runs exclusively on
//! the manager's queue.

use super::channel::{Action, Completion, DynamicChannel, PendingConnection, TimerKind};
use super::constants::*;
use super::link::{Link, SignalIdAllocator};
use super::psm::Psm;
use super::manager::{ChannelHandle, ChannelSnapshot, Command, LinkSnapshot};
use super::security::SecurityGate;
use super::service::ServiceRegistry;
use super::signaling::{malformed_target, SignalingMessage};
use super::transport::Transport;
use super::types::*;
use crate::address::Address;
use crate::config::ManagerConfig;
use crate::error::ConnectionFailure;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct LinkManager {
    links: HashMap<Address, Link>,
    config: Arc<ManagerConfig>,
    transport: Arc<dyn Transport>,
    security: Arc<dyn SecurityGate>,
    /// Loop-back into the manager's queue for timers and security answers
    commands: mpsc::UnboundedSender<Command>,
}

impl LinkManager {
    pub(crate) fn new(
        config: Arc<ManagerConfig>,
        transport: Arc<dyn Transport>,
        security: Arc<dyn SecurityGate>,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            links: HashMap::new(),
            config,
            transport,
            security,
            commands,
        }
    }

    /// Existing link to `address`, or a new one with connection creation started
    fn get_or_create_link(&mut self, address: Address) -> &mut Link {
        let Self {
            links,
            config,
            transport,
            commands,
            ..
        } = self;
        links.entry(address).or_insert_with(|| {
            info!("Creating ACL link to {}", address);
            let mut link = Link::new(address);
            link.set_state(LinkState::Connecting);
            arm_link_timer(&mut link, config.link_connect_timeout(), commands);
            transport.create_connection(address);
            link
        })
    }

    /// Queue an outgoing request, or start it right away on a connected link
    pub(crate) fn enqueue_pending_connection(
        &mut self,
        address: Address,
        pending: PendingConnection,
        registry: &ServiceRegistry,
    ) {
        let link = self.get_or_create_link(address);
        if link.is_connected() {
            self.open_outgoing(address, pending, registry);
        } else {
            debug!(
                "Queueing connection to PSM {} until link {} is up ({})",
                pending.psm,
                address,
                link.state()
            );
            link.enqueue(pending);
        }
    }

    fn open_outgoing(
        &mut self,
        address: Address,
        pending: PendingConnection,
        registry: &ServiceRegistry,
    ) {
        let policy = registry.effective_policy(pending.psm);
        let Some(link) = self.links.get_mut(&address) else {
            pending.deliver_failure(ConnectionFailure::LinkFailure);
            return;
        };
        let Some(local_cid) = link.allocate_cid() else {
            warn!("No free channel IDs on link {}", address);
            pending.deliver_failure(ConnectionFailure::LinkFailure);
            return;
        };

        debug!(
            "Opening channel 0x{:04X} to {} on PSM {}",
            local_cid, address, pending.psm
        );
        let mut channel =
            DynamicChannel::new_outgoing(address, local_cid, policy, &self.config, pending);
        let mut actions = Vec::new();
        channel.start(&mut link.signal_ids, &mut actions);
        link.insert_channel(channel);
        self.run_actions(address, local_cid, actions);
    }

    pub(crate) fn on_connection_complete(
        &mut self,
        address: Address,
        success: bool,
        registry: &ServiceRegistry,
    ) {
        let Some(link) = self.links.get_mut(&address) else {
            if success {
                info!("Inbound ACL link from {}", address);
                let mut link = Link::new(address);
                link.set_state(LinkState::Connected);
                // Released if the peer opens nothing before this fires
                arm_link_timer(&mut link, self.config.link_connect_timeout(), &self.commands);
                self.links.insert(address, link);
            }
            return;
        };

        if link.state() != LinkState::Connecting {
            debug!(
                "Ignoring connection complete for {} in state {}",
                address,
                link.state()
            );
            return;
        }
        link.disarm_connect_timer();

        if !success {
            warn!("ACL link to {} failed", address);
            self.fail_link(address, ConnectionFailure::LinkFailure);
            return;
        }

        info!("ACL link to {} is up", address);
        link.set_state(LinkState::Connected);
        for pending in link.drain_pending() {
            self.open_outgoing(address, pending, registry);
        }
        self.maybe_release_link(address);
    }

    pub(crate) fn on_disconnected(&mut self, address: Address, registry: &ServiceRegistry) {
        let Some(link) = self.links.get_mut(&address) else {
            debug!("Disconnect for unknown link {}", address);
            return;
        };

        if link.state() == LinkState::Disconnecting && link.channel_count() == 0 {
            let waiting = link.drain_pending();
            self.remove_link(address);
            if !waiting.is_empty() {
                debug!(
                    "Re-creating link to {} for {} queued requests",
                    address,
                    waiting.len()
                );
                for pending in waiting {
                    self.enqueue_pending_connection(address, pending, registry);
                }
            }
            return;
        }

        warn!("ACL link to {} lost", address);
        self.fail_link(address, ConnectionFailure::LinkFailure);
    }

    pub(crate) fn on_link_timeout(&mut self, address: Address, seq: u64) {
        let Some(link) = self.links.get_mut(&address) else {
            return;
        };
        if !link.connect_timer_matches(seq) {
            return;
        }
        link.disarm_connect_timer();
        match link.state() {
            LinkState::Connecting => {
                warn!("Timed out creating ACL link to {}", address);
                self.transport.disconnect(address);
                self.fail_link(address, ConnectionFailure::LinkFailure);
            }
            LinkState::Connected => self.maybe_release_link(address),
            _ => {}
        }
    }

    /// Close everything on the link locally and start tearing it down
    pub(crate) fn disconnect_link(&mut self, address: Address) {
        let Some(link) = self.links.get(&address) else {
            debug!("disconnect_link: no link to {}", address);
            return;
        };
        let state = link.state();
        info!("Disconnecting link {} ({})", address, state);

        match state {
            LinkState::Connecting => {
                self.transport.disconnect(address);
                self.fail_link(address, ConnectionFailure::Cancelled);
            }
            LinkState::Connected => {
                if let Some(link) = self.links.get_mut(&address) {
                    Self::abort_all(link, ConnectionFailure::Cancelled);
                    link.set_state(LinkState::Disconnecting);
                }
                self.transport.disconnect(address);
            }
            _ => {}
        }
    }

    /// Abort every channel and pending request with `reason` and forget the link
    fn fail_link(&mut self, address: Address, reason: ConnectionFailure) {
        if let Some(link) = self.links.get_mut(&address) {
            Self::abort_all(link, reason);
        }
        self.remove_link(address);
    }

    fn abort_all(link: &mut Link, reason: ConnectionFailure) {
        for pending in link.drain_pending() {
            pending.deliver_failure(reason);
        }
        for local_cid in link.channel_ids() {
            let mut actions = Vec::new();
            if let Some(channel) = link.channel_mut(local_cid) {
                channel.abort(reason, &mut actions);
            }
            for action in actions {
                if let Action::Closed(reason) = action {
                    if let Some(channel) = link.remove_channel(local_cid) {
                        Self::complete_closed(channel, reason);
                    }
                }
            }
        }
    }

    fn remove_link(&mut self, address: Address) {
        if let Some(mut link) = self.links.remove(&address) {
            link.set_state(LinkState::Closed);
        }
    }

    /// Start disconnecting a connected link that carries nothing
    fn maybe_release_link(&mut self, address: Address) {
        let Some(link) = self.links.get_mut(&address) else {
            return;
        };
        if link.is_connected() && link.is_idle() {
            debug!("Link {} is idle, disconnecting", address);
            link.set_state(LinkState::Disconnecting);
            self.transport.disconnect(address);
        }
    }

    pub(crate) fn shutdown(&mut self) {
        let addresses: Vec<Address> = self.links.keys().copied().collect();
        for address in addresses {
            let connected = self
                .links
                .get(&address)
                .map(|link| matches!(link.state(), LinkState::Connecting | LinkState::Connected))
                .unwrap_or(false);
            if connected {
                self.transport.disconnect(address);
            }
            self.fail_link(address, ConnectionFailure::Cancelled);
        }
    }

    pub(crate) fn on_signal_frame(
        &mut self,
        address: Address,
        frame: &[u8],
        registry: &ServiceRegistry,
    ) {
        match SignalingMessage::parse(frame) {
            Ok(message) => self.on_signal(address, message, registry),
            Err(err) => {
                warn!(
                    "Malformed signaling command from {}: {} [{}]",
                    address,
                    err,
                    hex::encode(frame)
                );
                let Some((identifier, target)) = malformed_target(frame) else {
                    return;
                };
                // Never reject a reject
                if frame[0] == L2CAP_COMMAND_REJECT {
                    return;
                }
                self.transport.send_signal(
                    address,
                    SignalingMessage::CommandReject {
                        identifier,
                        reason: L2CAP_REJECT_NOT_UNDERSTOOD,
                        data: Vec::new(),
                    },
                );
                if let Some(local_cid) = target {
                    self.close_channel_with(address, local_cid, ConnectionFailure::PeerDisconnected);
                }
            }
        }
    }

    pub(crate) fn on_signal(
        &mut self,
        address: Address,
        message: SignalingMessage,
        registry: &ServiceRegistry,
    ) {
        if !self.links.contains_key(&address) {
            if !matches!(message, SignalingMessage::ConnectionRequest { .. }) {
                self.on_stray_signal(address, message);
                return;
            }
            // A connection request implies the ACL link is up
            let mut link = Link::new(address);
            link.set_state(LinkState::Connected);
            self.links.insert(address, link);
        }

        self.dispatch_signal(address, message, registry);
        self.maybe_release_link(address);
    }

    /// Answer signaling from a device we hold no link to
    fn on_stray_signal(&mut self, address: Address, message: SignalingMessage) {
        debug!("Signaling from {} without a link: {:?}", address, message);
        match message {
            SignalingMessage::ConfigureRequest {
                identifier,
                destination_cid,
                ..
            } => self.reject_invalid_cid(address, identifier, destination_cid, 0),
            SignalingMessage::DisconnectionRequest {
                identifier,
                destination_cid,
                source_cid,
            } => self.reject_invalid_cid(address, identifier, destination_cid, source_cid),
            _ => {}
        }
    }

    fn dispatch_signal(
        &mut self,
        address: Address,
        message: SignalingMessage,
        registry: &ServiceRegistry,
    ) {
        match message {
            SignalingMessage::ConnectionRequest {
                identifier,
                psm,
                source_cid,
            } => self.on_connection_request(address, identifier, psm, source_cid, registry),

            SignalingMessage::ConnectionResponse {
                identifier,
                destination_cid,
                source_cid,
                result,
                status,
            } => {
                let found = self.with_channel(address, source_cid, |channel, ids, out| {
                    channel.on_connection_response(
                        identifier,
                        destination_cid,
                        result,
                        status,
                        ids,
                        out,
                    )
                });
                if !found && result == ConnectionResult::Success {
                    debug!(
                        "Late connection response for 0x{:04X} from {}, disconnecting",
                        source_cid, address
                    );
                    self.send_unsolicited_disconnect(address, destination_cid, source_cid);
                }
            }

            SignalingMessage::ConfigureRequest {
                identifier,
                destination_cid,
                flags,
                options,
            } => {
                let found = self.with_channel(address, destination_cid, |channel, _, out| {
                    channel.on_configure_request(identifier, flags, &options, out)
                });
                if !found {
                    self.reject_invalid_cid(address, identifier, destination_cid, 0);
                }
            }

            SignalingMessage::ConfigureResponse {
                identifier,
                source_cid,
                result,
                options,
                ..
            } => {
                let found = self.with_channel(address, source_cid, |channel, ids, out| {
                    channel.on_configure_response(identifier, result, &options, ids, out)
                });
                if !found {
                    debug!(
                        "Configure response for unknown channel 0x{:04X} from {}",
                        source_cid, address
                    );
                }
            }

            SignalingMessage::DisconnectionRequest {
                identifier,
                destination_cid,
                source_cid,
            } => {
                let matches = self
                    .links
                    .get(&address)
                    .and_then(|link| link.channel(destination_cid))
                    .map(|channel| channel.remote_cid() == source_cid)
                    .unwrap_or(false);
                if matches {
                    self.with_channel(address, destination_cid, |channel, _, out| {
                        channel.on_disconnection_request(identifier, out)
                    });
                } else {
                    self.reject_invalid_cid(address, identifier, destination_cid, source_cid);
                }
            }

            SignalingMessage::DisconnectionResponse {
                identifier,
                source_cid,
                ..
            } => {
                self.with_channel(address, source_cid, |channel, _, out| {
                    channel.on_disconnection_response(identifier, out)
                });
            }

            SignalingMessage::CommandReject {
                identifier, reason, ..
            } => {
                debug!(
                    "Command reject from {} for id {} (reason 0x{:04X})",
                    address, identifier, reason
                );
                let target = self
                    .links
                    .get(&address)
                    .and_then(|link| link.find_by_pending_id(identifier));
                if let Some(local_cid) = target {
                    self.with_channel(address, local_cid, |channel, _, out| {
                        channel.on_command_reject(identifier, out)
                    });
                }
            }
        }
    }

    fn on_connection_request(
        &mut self,
        address: Address,
        identifier: SignalId,
        psm: Psm,
        source_cid: ChannelId,
        registry: &ServiceRegistry,
    ) {
        let refuse = |result: ConnectionResult| SignalingMessage::ConnectionResponse {
            identifier,
            destination_cid: 0,
            source_cid,
            result,
            status: L2CAP_CONN_STATUS_NO_INFO,
        };

        let Some(service) = registry.lookup(psm) else {
            info!("Refusing connection from {}: PSM {} not registered", address, psm);
            self.transport
                .send_signal(address, refuse(ConnectionResult::PsmNotSupported));
            return;
        };
        if source_cid < L2CAP_DYNAMIC_CID_MIN {
            self.transport
                .send_signal(address, refuse(ConnectionResult::InvalidSourceCid));
            return;
        }

        let Some(link) = self.links.get_mut(&address) else {
            return;
        };
        if link.find_by_remote_cid(source_cid).is_some() {
            self.transport
                .send_signal(address, refuse(ConnectionResult::SourceCidInUse));
            return;
        }
        let Some(local_cid) = link.allocate_cid() else {
            warn!("No free channel IDs for {} on PSM {}", address, psm);
            self.transport
                .send_signal(address, refuse(ConnectionResult::NoResources));
            return;
        };

        debug!(
            "Accepting channel 0x{:04X} <- 0x{:04X} from {} on PSM {}",
            local_cid, source_cid, address, psm
        );
        let mut channel = DynamicChannel::new_incoming(
            address,
            local_cid,
            source_cid,
            &self.config,
            service.clone(),
        );
        let mut actions = Vec::new();
        channel.accept(identifier, &mut link.signal_ids, &mut actions);
        link.insert_channel(channel);
        self.run_actions(address, local_cid, actions);
    }

    fn send_unsolicited_disconnect(
        &mut self,
        address: Address,
        remote_cid: ChannelId,
        local_cid: ChannelId,
    ) {
        let Some(link) = self.links.get_mut(&address) else {
            return;
        };
        let identifier = link.signal_ids.next();
        self.transport.send_signal(
            address,
            SignalingMessage::DisconnectionRequest {
                identifier,
                destination_cid: remote_cid,
                source_cid: local_cid,
            },
        );
    }

    fn reject_invalid_cid(
        &self,
        address: Address,
        identifier: SignalId,
        local_cid: ChannelId,
        remote_cid: ChannelId,
    ) {
        debug!(
            "Rejecting command {} from {}: invalid CID 0x{:04X}",
            identifier, address, local_cid
        );
        let mut data = Vec::with_capacity(4);
        data.extend_from_slice(&local_cid.to_le_bytes());
        data.extend_from_slice(&remote_cid.to_le_bytes());
        self.transport.send_signal(
            address,
            SignalingMessage::CommandReject {
                identifier,
                reason: L2CAP_REJECT_INVALID_CID,
                data,
            },
        );
    }

    pub(crate) fn on_data(&mut self, address: Address, local_cid: ChannelId, payload: Vec<u8>) {
        let delivered = self
            .links
            .get(&address)
            .and_then(|link| link.channel(local_cid))
            .map(|channel| channel.deliver_data(payload))
            .unwrap_or(false);
        if !delivered {
            debug!("Dropping data for 0x{:04X} from {}", local_cid, address);
        }
    }

    pub(crate) fn send_data(&mut self, address: Address, local_cid: ChannelId, payload: Vec<u8>) {
        let Some(channel) = self
            .links
            .get(&address)
            .and_then(|link| link.channel(local_cid))
        else {
            debug!("send on closed channel 0x{:04X} to {}", local_cid, address);
            return;
        };
        if !channel.is_open() {
            debug!(
                "send on channel 0x{:04X} to {} in state {}",
                local_cid,
                address,
                channel.state()
            );
            return;
        }
        if payload.len() > channel.remote_mtu() as usize {
            warn!(
                "Dropping {} byte payload over peer MTU {} on 0x{:04X}",
                payload.len(),
                channel.remote_mtu(),
                local_cid
            );
            return;
        }
        self.transport
            .send_data(address, channel.remote_cid(), payload);
    }

    pub(crate) fn close_channel(&mut self, address: Address, local_cid: ChannelId) {
        self.close_channel_with(address, local_cid, ConnectionFailure::Cancelled);
    }

    fn close_channel_with(&mut self, address: Address, local_cid: ChannelId, reason: ConnectionFailure) {
        self.with_channel(address, local_cid, |channel, ids, out| {
            channel.close(reason, ids, out)
        });
    }

    pub(crate) fn on_channel_timeout(&mut self, address: Address, local_cid: ChannelId, seq: u64) {
        let current = self
            .links
            .get(&address)
            .and_then(|link| link.channel(local_cid))
            .map(|channel| channel.timer_matches(seq))
            .unwrap_or(false);
        if !current {
            return;
        }
        self.with_channel(address, local_cid, |channel, ids, out| {
            channel.on_timeout(ids, out)
        });
    }

    pub(crate) fn on_security_result(&mut self, address: Address, local_cid: ChannelId, allowed: bool) {
        debug!(
            "Security check for 0x{:04X} on {}: {}",
            local_cid,
            address,
            if allowed { "granted" } else { "denied" }
        );
        self.with_channel(address, local_cid, |channel, ids, out| {
            channel.on_security_result(allowed, ids, out)
        });
    }

    /// Drive one channel's state machine and carry out what it asks for.
    ///
    /// Returns false if the link or channel does not exist.
    fn with_channel<F>(&mut self, address: Address, local_cid: ChannelId, f: F) -> bool
    where
        F: FnOnce(&mut DynamicChannel, &mut SignalIdAllocator, &mut Vec<Action>),
    {
        let mut actions = Vec::new();
        {
            let Some(link) = self.links.get_mut(&address) else {
                return false;
            };
            let Some((channel, ids)) = link.channel_with_ids(local_cid) else {
                return false;
            };
            f(channel, ids, &mut actions);
        }
        self.run_actions(address, local_cid, actions);
        true
    }

    fn run_actions(&mut self, address: Address, local_cid: ChannelId, actions: Vec<Action>) {
        let mut closed = false;

        for action in actions {
            match action {
                Action::Send(message) => self.transport.send_signal(address, message),
                Action::ArmTimer(kind) => self.arm_channel_timer(address, local_cid, kind),
                Action::DisarmTimer => {
                    if let Some(channel) = self.channel_mut(address, local_cid) {
                        channel.disarm_timer();
                    }
                }
                Action::CheckSecurity(policy) => {
                    let security = self.security.clone();
                    let commands = self.commands.clone();
                    tokio::spawn(async move {
                        let allowed = security.check_security(address, policy).await;
                        let _ = commands.send(Command::SecurityResult {
                            address,
                            cid: local_cid,
                            allowed,
                        });
                    });
                }
                Action::Opened => self.deliver_opened(address, local_cid),
                Action::Closed(reason) => {
                    let removed = self
                        .links
                        .get_mut(&address)
                        .and_then(|link| link.remove_channel(local_cid));
                    if let Some(channel) = removed {
                        info!(
                            "Channel 0x{:04X} to {} closed: {}",
                            local_cid, address, reason
                        );
                        Self::complete_closed(channel, reason);
                    }
                    closed = true;
                }
            }
        }

        if closed {
            self.maybe_release_link(address);
        }
    }

    fn channel_mut(&mut self, address: Address, local_cid: ChannelId) -> Option<&mut DynamicChannel> {
        self.links
            .get_mut(&address)
            .and_then(|link| link.channel_mut(local_cid))
    }

    fn arm_channel_timer(&mut self, address: Address, local_cid: ChannelId, kind: TimerKind) {
        let duration = match kind {
            TimerKind::Response => self.config.response_timeout(),
            TimerKind::ExtendedResponse => self.config.extended_response_timeout(),
            TimerKind::Security => self.config.security_timeout(),
        };
        let commands = self.commands.clone();
        let Some(channel) = self.channel_mut(address, local_cid) else {
            return;
        };
        let seq = channel.next_timer_seq();
        let task = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = commands.send(Command::ChannelTimeout {
                address,
                cid: local_cid,
                seq,
            });
        });
        channel.set_timer(task.abort_handle());
    }

    fn deliver_opened(&mut self, address: Address, local_cid: ChannelId) {
        let commands = self.commands.clone();
        let Some(channel) = self.channel_mut(address, local_cid) else {
            return;
        };
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        let open_flag = Arc::new(AtomicBool::new(true));
        channel.attach_data_sender(data_tx, open_flag.clone());

        info!(
            "Channel 0x{:04X} -> 0x{:04X} to {} is OPEN (PSM {}, MTU {}/{})",
            channel.local_cid(),
            channel.remote_cid(),
            address,
            channel.psm(),
            channel.local_mtu(),
            channel.remote_mtu()
        );
        let handle = ChannelHandle::new(channel, data_rx, open_flag, commands);
        match channel.take_completion() {
            Some(Completion::Outgoing(pending)) => pending.deliver_open(handle),
            Some(Completion::Incoming(service)) => service.notify_open(handle),
            None => {}
        }
    }

    /// Report a closed channel to whoever is still waiting on it
    fn complete_closed(mut channel: DynamicChannel, reason: ConnectionFailure) {
        channel.disarm_timer();
        channel.detach_data_sender();
        if let Some(Completion::Outgoing(pending)) = channel.take_completion() {
            pending.deliver_failure(reason);
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<LinkSnapshot> {
        let mut links: Vec<LinkSnapshot> = self
            .links
            .values()
            .map(|link| LinkSnapshot {
                address: link.address(),
                state: link.state(),
                pending: link.pending_count(),
                channels: link
                    .channel_ids()
                    .into_iter()
                    .filter_map(|cid| link.channel(cid))
                    .map(ChannelSnapshot::from)
                    .collect(),
            })
            .collect();
        links.sort_by_key(|link| link.address.bytes);
        links
    }
}

fn arm_link_timer(link: &mut Link, duration: Duration, commands: &mpsc::UnboundedSender<Command>) {
    let address = link.address();
    let seq = link.next_connect_timer_seq();
    let commands = commands.clone();
    let task = tokio::spawn(async move {
        tokio::time::sleep(duration).await;
        let _ = commands.send(Command::LinkTimeout { address, seq });
    });
    link.set_connect_timer(task.abort_handle());
}
