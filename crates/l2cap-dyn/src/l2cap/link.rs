//! Per-device ACL link
//!
//! A `Link` owns every dynamic channel to one remote device, the CID and
//! signal identifier spaces they share, and the connection requests that
//! arrived before the ACL link was up.

use super::channel::{DynamicChannel, PendingConnection};
use super::constants::{L2CAP_DYNAMIC_CID_MAX, L2CAP_DYNAMIC_CID_MIN};
use super::types::{ChannelId, LinkState, SignalId};
use crate::address::Address;
use std::collections::{HashMap, VecDeque};
use tokio::task::AbortHandle;
use tracing::debug;

/// Hands out signaling identifiers 1..=255, never 0
#[derive(Debug)]
pub(crate) struct SignalIdAllocator {
    next: SignalId,
}

impl Default for SignalIdAllocator {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl SignalIdAllocator {
    pub(crate) fn next(&mut self) -> SignalId {
        let id = self.next;
        self.next = self.next.wrapping_add(1);
        if self.next == 0 {
            self.next = 1;
        }
        id
    }
}

pub struct Link {
    address: Address,
    state: LinkState,
    /// Channels mapped by local CID
    channels: HashMap<ChannelId, DynamicChannel>,
    /// Requests waiting for the link to connect
    pending: VecDeque<PendingConnection>,
    next_cid: ChannelId,
    pub(crate) signal_ids: SignalIdAllocator,
    connect_timer: Option<AbortHandle>,
    connect_timer_seq: u64,
}

impl Link {
    pub(crate) fn new(address: Address) -> Self {
        Self {
            address,
            state: LinkState::Idle,
            channels: HashMap::new(),
            pending: VecDeque::new(),
            next_cid: L2CAP_DYNAMIC_CID_MIN,
            signal_ids: SignalIdAllocator::default(),
            connect_timer: None,
            connect_timer_seq: 0,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: LinkState) {
        debug!("Link {}: {} -> {}", self.address, self.state, state);
        self.state = state;
    }

    pub fn is_connected(&self) -> bool {
        self.state == LinkState::Connected
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// No channels and nothing waiting, the link may be released
    pub fn is_idle(&self) -> bool {
        self.channels.is_empty() && self.pending.is_empty()
    }

    /// Allocate a new dynamic CID not used on this link
    pub(crate) fn allocate_cid(&mut self) -> Option<ChannelId> {
        let starting_cid = self.next_cid;

        loop {
            let candidate = self.next_cid;
            self.next_cid = if self.next_cid == L2CAP_DYNAMIC_CID_MAX {
                L2CAP_DYNAMIC_CID_MIN
            } else {
                self.next_cid + 1
            };

            if !self.channels.contains_key(&candidate) {
                return Some(candidate);
            }
            if self.next_cid == starting_cid {
                return None;
            }
        }
    }

    pub(crate) fn insert_channel(&mut self, channel: DynamicChannel) {
        self.channels.insert(channel.local_cid(), channel);
    }

    pub fn channel(&self, local_cid: ChannelId) -> Option<&DynamicChannel> {
        self.channels.get(&local_cid)
    }

    pub(crate) fn channel_mut(&mut self, local_cid: ChannelId) -> Option<&mut DynamicChannel> {
        self.channels.get_mut(&local_cid)
    }

    /// A channel together with the identifier space it signals with
    pub(crate) fn channel_with_ids(
        &mut self,
        local_cid: ChannelId,
    ) -> Option<(&mut DynamicChannel, &mut SignalIdAllocator)> {
        let channel = self.channels.get_mut(&local_cid)?;
        Some((channel, &mut self.signal_ids))
    }

    /// Local CID of the channel whose outstanding request used `identifier`
    pub(crate) fn find_by_pending_id(&self, identifier: SignalId) -> Option<ChannelId> {
        self.channels
            .values()
            .find(|channel| channel.awaits(identifier))
            .map(|channel| channel.local_cid())
    }

    pub(crate) fn remove_channel(&mut self, local_cid: ChannelId) -> Option<DynamicChannel> {
        self.channels.remove(&local_cid)
    }

    /// Local CID of the channel the peer knows as `remote_cid`
    pub fn find_by_remote_cid(&self, remote_cid: ChannelId) -> Option<ChannelId> {
        self.channels
            .values()
            .find(|channel| channel.remote_cid() == remote_cid)
            .map(|channel| channel.local_cid())
    }

    pub fn channel_ids(&self) -> Vec<ChannelId> {
        let mut ids: Vec<ChannelId> = self.channels.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub(crate) fn enqueue(&mut self, pending: PendingConnection) {
        self.pending.push_back(pending);
    }

    pub(crate) fn drain_pending(&mut self) -> Vec<PendingConnection> {
        self.pending.drain(..).collect()
    }

    pub(crate) fn next_connect_timer_seq(&mut self) -> u64 {
        self.disarm_connect_timer();
        self.connect_timer_seq += 1;
        self.connect_timer_seq
    }

    pub(crate) fn set_connect_timer(&mut self, timer: AbortHandle) {
        self.connect_timer = Some(timer);
    }

    pub(crate) fn disarm_connect_timer(&mut self) {
        if let Some(timer) = self.connect_timer.take() {
            timer.abort();
        }
    }

    pub(crate) fn connect_timer_matches(&self, seq: u64) -> bool {
        self.connect_timer.is_some() && self.connect_timer_seq == seq
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.disarm_connect_timer();
    }
}
