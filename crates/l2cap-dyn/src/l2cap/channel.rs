//! Dynamic channel state machine
//!
//! A `DynamicChannel` tracks one connection-oriented channel through the
//! connect, security, configuration and disconnect exchanges. It performs
//! no I/O: every step pushes `Action`s that the link manager carries out
//! (sending commands, arming timers, asking the security gate, delivering
//! the result to the caller).

use super::link::SignalIdAllocator;
use super::manager::ChannelHandle;
use super::psm::Psm;
use super::service::ServiceEntry;
use super::signaling::SignalingMessage;
use super::types::*;
use crate::address::Address;
use crate::config::ManagerConfig;
use crate::error::ConnectionFailure;
use crate::handler::Handler;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

/// Called on the caller's handler when a requested channel opens
pub type OnConnectionOpen = Box<dyn FnOnce(ChannelHandle) + Send + 'static>;

/// Called on the caller's handler when a requested channel cannot open
pub type OnConnectionFailure = Box<dyn FnOnce(ConnectionFailure) + Send + 'static>;

/// Outgoing connection request waiting for its result
pub(crate) struct PendingConnection {
    pub(crate) psm: Psm,
    on_open: OnConnectionOpen,
    on_fail: OnConnectionFailure,
    handler: Handler,
}

impl PendingConnection {
    pub(crate) fn new(
        psm: Psm,
        on_open: OnConnectionOpen,
        on_fail: OnConnectionFailure,
        handler: Handler,
    ) -> Self {
        Self {
            psm,
            on_open,
            on_fail,
            handler,
        }
    }

    pub(crate) fn deliver_open(self, channel: ChannelHandle) {
        let on_open = self.on_open;
        self.handler.post(move || on_open(channel));
    }

    pub(crate) fn deliver_failure(self, reason: ConnectionFailure) {
        let on_fail = self.on_fail;
        self.handler.post(move || on_fail(reason));
    }
}

/// Who hears about the channel once it opens or fails
pub(crate) enum Completion {
    Outgoing(PendingConnection),
    Incoming(ServiceEntry),
}

/// Which timeout a timer uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerKind {
    Response,
    ExtendedResponse,
    Security,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Action {
    Send(SignalingMessage),
    ArmTimer(TimerKind),
    DisarmTimer,
    CheckSecurity(SecurityPolicy),
    Opened,
    Closed(ConnectionFailure),
}

pub struct DynamicChannel {
    /// Key of the owning link
    address: Address,
    psm: Psm,
    policy: SecurityPolicy,
    direction: Direction,
    local_cid: ChannelId,
    remote_cid: ChannelId,
    state: ChannelState,
    /// MTU for data we receive
    local_mtu: u16,
    /// MTU for data we send
    remote_mtu: u16,
    min_mtu: u16,
    /// Identifier of our outstanding request
    pending_id: Option<SignalId>,
    /// Identifier of the peer's connection request, answered after security
    connect_id: Option<SignalId>,
    local_config_done: bool,
    remote_config_done: bool,
    config_retries: u8,
    max_config_retries: u8,
    /// Reported once a locally started disconnect finishes
    close_reason: ConnectionFailure,
    completion: Option<Completion>,
    timer: Option<AbortHandle>,
    timer_seq: u64,
    data_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    /// Shared with the user's handle, cleared on close
    open_flag: Option<Arc<AtomicBool>>,
}

impl DynamicChannel {
    fn new(
        address: Address,
        psm: Psm,
        policy: SecurityPolicy,
        direction: Direction,
        local_cid: ChannelId,
        config: &ManagerConfig,
        completion: Completion,
    ) -> Self {
        Self {
            address,
            psm,
            policy,
            direction,
            local_cid,
            remote_cid: 0,
            state: ChannelState::WaitConnect,
            local_mtu: config.local_mtu,
            remote_mtu: super::constants::L2CAP_DEFAULT_MTU,
            min_mtu: config.min_mtu,
            pending_id: None,
            connect_id: None,
            local_config_done: false,
            remote_config_done: false,
            config_retries: 0,
            max_config_retries: config.max_config_retries,
            close_reason: ConnectionFailure::Cancelled,
            completion: Some(completion),
            timer: None,
            timer_seq: 0,
            data_tx: None,
            open_flag: None,
        }
    }

    /// Channel we are about to request from the peer
    pub(crate) fn new_outgoing(
        address: Address,
        local_cid: ChannelId,
        policy: SecurityPolicy,
        config: &ManagerConfig,
        pending: PendingConnection,
    ) -> Self {
        let psm = pending.psm;
        Self::new(
            address,
            psm,
            policy,
            Direction::Outgoing,
            local_cid,
            config,
            Completion::Outgoing(pending),
        )
    }

    /// Channel the peer requested for a registered service
    pub(crate) fn new_incoming(
        address: Address,
        local_cid: ChannelId,
        remote_cid: ChannelId,
        config: &ManagerConfig,
        service: ServiceEntry,
    ) -> Self {
        let mut channel = Self::new(
            address,
            service.psm,
            service.policy,
            Direction::Incoming,
            local_cid,
            config,
            Completion::Incoming(service),
        );
        channel.remote_cid = remote_cid;
        channel
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn psm(&self) -> Psm {
        self.psm
    }

    pub fn policy(&self) -> SecurityPolicy {
        self.policy
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn local_cid(&self) -> ChannelId {
        self.local_cid
    }

    pub fn remote_cid(&self) -> ChannelId {
        self.remote_cid
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn local_mtu(&self) -> u16 {
        self.local_mtu
    }

    pub fn remote_mtu(&self) -> u16 {
        self.remote_mtu
    }

    pub fn is_open(&self) -> bool {
        self.state == ChannelState::Open
    }

    /// Whether our outstanding request carries `identifier`
    pub(crate) fn awaits(&self, identifier: SignalId) -> bool {
        self.pending_id == Some(identifier)
    }

    fn set_state(&mut self, state: ChannelState) {
        trace!(
            "{} cid 0x{:04X}: {} -> {}",
            self.address,
            self.local_cid,
            self.state,
            state
        );
        self.state = state;
    }

    fn finish(&mut self, reason: ConnectionFailure, out: &mut Vec<Action>) {
        if self.state == ChannelState::Closed {
            return;
        }
        self.set_state(ChannelState::Closed);
        self.pending_id = None;
        out.push(Action::Closed(reason));
    }

    /// Send a disconnection request without waiting for the answer
    fn send_disconnect(&mut self, ids: &mut SignalIdAllocator, out: &mut Vec<Action>) {
        if self.remote_cid == 0 {
            return;
        }
        out.push(Action::Send(SignalingMessage::DisconnectionRequest {
            identifier: ids.next(),
            destination_cid: self.remote_cid,
            source_cid: self.local_cid,
        }));
    }

    fn send_connection_response(&self, result: ConnectionResult, status: u16, out: &mut Vec<Action>) {
        let Some(identifier) = self.connect_id else {
            return;
        };
        out.push(Action::Send(SignalingMessage::ConnectionResponse {
            identifier,
            destination_cid: self.local_cid,
            source_cid: self.remote_cid,
            result,
            status,
        }));
    }

    fn request_security(&mut self, out: &mut Vec<Action>) {
        self.set_state(ChannelState::SecurityPending);
        out.push(Action::CheckSecurity(self.policy));
        out.push(Action::ArmTimer(TimerKind::Security));
    }

    fn begin_config(&mut self, ids: &mut SignalIdAllocator, out: &mut Vec<Action>) {
        self.set_state(ChannelState::Config);
        self.send_config_request(ids, out);
    }

    fn send_config_request(&mut self, ids: &mut SignalIdAllocator, out: &mut Vec<Action>) {
        let identifier = ids.next();
        self.pending_id = Some(identifier);
        out.push(Action::Send(SignalingMessage::ConfigureRequest {
            identifier,
            destination_cid: self.remote_cid,
            flags: ConfigFlags::empty(),
            options: ConfigOptions::with_mtu(self.local_mtu),
        }));
        out.push(Action::ArmTimer(TimerKind::Response));
    }

    fn fail_configuration(&mut self, ids: &mut SignalIdAllocator, out: &mut Vec<Action>) {
        warn!(
            "{} cid 0x{:04X}: configuration failed after {} retries",
            self.address, self.local_cid, self.config_retries
        );
        self.send_disconnect(ids, out);
        self.finish(ConnectionFailure::ConfigurationFailure, out);
    }

    fn maybe_open(&mut self, out: &mut Vec<Action>) {
        if self.state != ChannelState::Config {
            return;
        }
        if self.local_config_done && self.remote_config_done {
            self.set_state(ChannelState::Open);
            out.push(Action::DisarmTimer);
            out.push(Action::Opened);
        } else if self.local_config_done {
            // Our side is done, the peer still owes its request
            out.push(Action::ArmTimer(TimerKind::Response));
        }
    }

    /// Send the connection request for an outgoing channel
    pub(crate) fn start(&mut self, ids: &mut SignalIdAllocator, out: &mut Vec<Action>) {
        if self.direction != Direction::Outgoing || self.state != ChannelState::WaitConnect {
            return;
        }
        let identifier = ids.next();
        self.pending_id = Some(identifier);
        out.push(Action::Send(SignalingMessage::ConnectionRequest {
            identifier,
            psm: self.psm,
            source_cid: self.local_cid,
        }));
        self.set_state(ChannelState::WaitConnectRsp);
        out.push(Action::ArmTimer(TimerKind::Response));
    }

    /// Answer the peer's connection request for an incoming channel
    pub(crate) fn accept(
        &mut self,
        identifier: SignalId,
        ids: &mut SignalIdAllocator,
        out: &mut Vec<Action>,
    ) {
        if self.direction != Direction::Incoming || self.state != ChannelState::WaitConnect {
            return;
        }
        self.connect_id = Some(identifier);
        if self.policy.requires_check() {
            self.send_connection_response(
                ConnectionResult::Pending,
                self.policy.pending_status(),
                out,
            );
            self.request_security(out);
        } else {
            self.send_connection_response(ConnectionResult::Success, 0, out);
            self.begin_config(ids, out);
        }
    }

    pub(crate) fn on_connection_response(
        &mut self,
        identifier: SignalId,
        destination_cid: ChannelId,
        result: ConnectionResult,
        status: u16,
        ids: &mut SignalIdAllocator,
        out: &mut Vec<Action>,
    ) {
        if self.state != ChannelState::WaitConnectRsp || self.pending_id != Some(identifier) {
            debug!(
                "{} cid 0x{:04X}: ignoring connection response id {} in state {}",
                self.address, self.local_cid, identifier, self.state
            );
            return;
        }

        match result {
            ConnectionResult::Success => {
                self.remote_cid = destination_cid;
                self.pending_id = None;
                out.push(Action::DisarmTimer);
                if self.policy.requires_check() {
                    self.request_security(out);
                } else {
                    self.begin_config(ids, out);
                }
            }
            ConnectionResult::Pending => {
                debug!(
                    "{} cid 0x{:04X}: peer reports pending (status {})",
                    self.address, self.local_cid, status
                );
                out.push(Action::ArmTimer(TimerKind::ExtendedResponse));
            }
            refused => {
                debug!(
                    "{} cid 0x{:04X}: connection to PSM {} refused: {:?}",
                    self.address, self.local_cid, self.psm, refused
                );
                self.finish(ConnectionFailure::PeerDisconnected, out);
            }
        }
    }

    pub(crate) fn on_security_result(
        &mut self,
        allowed: bool,
        ids: &mut SignalIdAllocator,
        out: &mut Vec<Action>,
    ) {
        if self.state != ChannelState::SecurityPending {
            return;
        }
        out.push(Action::DisarmTimer);

        match (self.direction, allowed) {
            (Direction::Outgoing, true) => self.begin_config(ids, out),
            (Direction::Outgoing, false) => {
                self.send_disconnect(ids, out);
                self.finish(ConnectionFailure::SecurityFailure, out);
            }
            (Direction::Incoming, true) => {
                self.send_connection_response(ConnectionResult::Success, 0, out);
                self.begin_config(ids, out);
            }
            (Direction::Incoming, false) => {
                self.send_connection_response(ConnectionResult::SecurityBlock, 0, out);
                self.finish(ConnectionFailure::SecurityFailure, out);
            }
        }
    }

    pub(crate) fn on_configure_request(
        &mut self,
        identifier: SignalId,
        flags: ConfigFlags,
        options: &ConfigOptions,
        out: &mut Vec<Action>,
    ) {
        let remote_cid = self.remote_cid;
        let respond = |result: ConfigureResult, flags: ConfigFlags, options: ConfigOptions| {
            Action::Send(SignalingMessage::ConfigureResponse {
                identifier,
                source_cid: remote_cid,
                flags,
                result,
                options,
            })
        };

        if !matches!(
            self.state,
            ChannelState::SecurityPending | ChannelState::Config | ChannelState::Open
        ) || self.remote_cid == 0
        {
            out.push(respond(
                ConfigureResult::Rejected,
                ConfigFlags::empty(),
                ConfigOptions::default(),
            ));
            return;
        }

        if !options.unknown.is_empty() {
            let echoed = ConfigOptions {
                unknown: options.unknown.clone(),
                ..Default::default()
            };
            out.push(respond(ConfigureResult::UnknownOptions, ConfigFlags::empty(), echoed));
            return;
        }

        if let Some(mtu) = options.mtu {
            if mtu < self.min_mtu {
                out.push(respond(
                    ConfigureResult::UnacceptableParameters,
                    ConfigFlags::empty(),
                    ConfigOptions::with_mtu(self.min_mtu),
                ));
                return;
            }
            self.remote_mtu = mtu;
        }

        if flags.contains(ConfigFlags::CONTINUATION) {
            out.push(respond(
                ConfigureResult::Success,
                ConfigFlags::CONTINUATION,
                ConfigOptions::default(),
            ));
            return;
        }

        out.push(respond(
            ConfigureResult::Success,
            ConfigFlags::empty(),
            ConfigOptions::default(),
        ));
        self.remote_config_done = true;
        self.maybe_open(out);
    }

    pub(crate) fn on_configure_response(
        &mut self,
        identifier: SignalId,
        result: ConfigureResult,
        options: &ConfigOptions,
        ids: &mut SignalIdAllocator,
        out: &mut Vec<Action>,
    ) {
        if self.state != ChannelState::Config || self.pending_id != Some(identifier) {
            debug!(
                "{} cid 0x{:04X}: ignoring configure response id {} in state {}",
                self.address, self.local_cid, identifier, self.state
            );
            return;
        }

        match result {
            ConfigureResult::Success => {
                self.pending_id = None;
                self.local_config_done = true;
                out.push(Action::DisarmTimer);
                self.maybe_open(out);
            }
            ConfigureResult::Pending => {
                out.push(Action::ArmTimer(TimerKind::ExtendedResponse));
            }
            ConfigureResult::UnacceptableParameters => {
                self.config_retries += 1;
                if self.config_retries > self.max_config_retries {
                    self.fail_configuration(ids, out);
                    return;
                }
                if let Some(mtu) = options.mtu {
                    if mtu < self.min_mtu {
                        self.fail_configuration(ids, out);
                        return;
                    }
                    self.local_mtu = mtu;
                }
                debug!(
                    "{} cid 0x{:04X}: renegotiating MTU {} (attempt {})",
                    self.address, self.local_cid, self.local_mtu, self.config_retries
                );
                self.send_config_request(ids, out);
            }
            other => {
                debug!(
                    "{} cid 0x{:04X}: configuration refused: {:?}",
                    self.address, self.local_cid, other
                );
                self.fail_configuration(ids, out);
            }
        }
    }

    pub(crate) fn on_disconnection_request(&mut self, identifier: SignalId, out: &mut Vec<Action>) {
        out.push(Action::Send(SignalingMessage::DisconnectionResponse {
            identifier,
            destination_cid: self.local_cid,
            source_cid: self.remote_cid,
        }));
        let reason = if self.state == ChannelState::WaitDisconnect {
            self.close_reason
        } else {
            ConnectionFailure::PeerDisconnected
        };
        self.finish(reason, out);
    }

    pub(crate) fn on_disconnection_response(&mut self, identifier: SignalId, out: &mut Vec<Action>) {
        if self.state == ChannelState::WaitDisconnect && self.pending_id == Some(identifier) {
            let reason = self.close_reason;
            self.finish(reason, out);
        }
    }

    pub(crate) fn on_command_reject(&mut self, identifier: SignalId, out: &mut Vec<Action>) {
        if self.pending_id != Some(identifier) {
            return;
        }
        let reason = if self.state == ChannelState::WaitDisconnect {
            self.close_reason
        } else {
            ConnectionFailure::PeerDisconnected
        };
        self.finish(reason, out);
    }

    pub(crate) fn on_timeout(&mut self, ids: &mut SignalIdAllocator, out: &mut Vec<Action>) {
        match self.state {
            ChannelState::Closed | ChannelState::Open => {}
            ChannelState::WaitDisconnect => {
                let reason = self.close_reason;
                self.finish(reason, out);
            }
            ChannelState::SecurityPending if self.direction == Direction::Incoming => {
                self.send_connection_response(ConnectionResult::SecurityBlock, 0, out);
                self.finish(ConnectionFailure::Timeout, out);
            }
            state => {
                warn!(
                    "{} cid 0x{:04X}: timed out in state {}",
                    self.address, self.local_cid, state
                );
                self.send_disconnect(ids, out);
                self.finish(ConnectionFailure::Timeout, out);
            }
        }
    }

    /// Locally requested close
    pub(crate) fn close(
        &mut self,
        reason: ConnectionFailure,
        ids: &mut SignalIdAllocator,
        out: &mut Vec<Action>,
    ) {
        match self.state {
            ChannelState::Closed | ChannelState::WaitDisconnect => {}
            ChannelState::WaitConnect | ChannelState::SecurityPending
                if self.direction == Direction::Incoming =>
            {
                self.send_connection_response(ConnectionResult::NoResources, 0, out);
                self.finish(reason, out);
            }
            _ if self.remote_cid == 0 => self.finish(reason, out),
            _ => {
                let identifier = ids.next();
                self.pending_id = Some(identifier);
                self.close_reason = reason;
                out.push(Action::Send(SignalingMessage::DisconnectionRequest {
                    identifier,
                    destination_cid: self.remote_cid,
                    source_cid: self.local_cid,
                }));
                self.set_state(ChannelState::WaitDisconnect);
                out.push(Action::ArmTimer(TimerKind::Response));
            }
        }
    }

    /// Close without signaling, the link is gone
    pub(crate) fn abort(&mut self, reason: ConnectionFailure, out: &mut Vec<Action>) {
        self.finish(reason, out);
    }

    pub(crate) fn take_completion(&mut self) -> Option<Completion> {
        self.completion.take()
    }

    pub(crate) fn attach_data_sender(
        &mut self,
        data_tx: mpsc::UnboundedSender<Vec<u8>>,
        open_flag: Arc<AtomicBool>,
    ) {
        self.data_tx = Some(data_tx);
        self.open_flag = Some(open_flag);
    }

    pub(crate) fn detach_data_sender(&mut self) {
        if let Some(flag) = self.open_flag.take() {
            flag.store(false, Ordering::Release);
        }
        self.data_tx = None;
    }

    /// Forward an inbound payload to the channel's user
    pub(crate) fn deliver_data(&self, payload: Vec<u8>) -> bool {
        if self.state != ChannelState::Open {
            return false;
        }
        if payload.len() > self.local_mtu as usize {
            warn!(
                "{} cid 0x{:04X}: dropping {} byte payload over MTU {}",
                self.address,
                self.local_cid,
                payload.len(),
                self.local_mtu
            );
            return false;
        }
        match &self.data_tx {
            Some(data_tx) => data_tx.send(payload).is_ok(),
            None => false,
        }
    }

    /// Start a new timer generation, cancelling the running timer
    pub(crate) fn next_timer_seq(&mut self) -> u64 {
        self.disarm_timer();
        self.timer_seq += 1;
        self.timer_seq
    }

    pub(crate) fn set_timer(&mut self, timer: AbortHandle) {
        self.timer = Some(timer);
    }

    pub(crate) fn disarm_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    pub(crate) fn timer_matches(&self, seq: u64) -> bool {
        self.timer.is_some() && self.timer_seq == seq
    }
}

impl Drop for DynamicChannel {
    fn drop(&mut self) {
        self.disarm_timer();
        self.detach_data_sender();
    }
}
