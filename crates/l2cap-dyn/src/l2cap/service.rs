//! Registry of services listening for inbound dynamic channels

use super::manager::{ChannelHandle, Command};
use super::psm::Psm;
use super::types::SecurityPolicy;
use crate::error::{L2capError, L2capResult};
use crate::handler::Handler;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Called on the service's handler for every inbound channel that opens
pub type OnServiceConnectionOpen = Arc<dyn Fn(ChannelHandle) + Send + Sync + 'static>;

/// Called once on the registering handler with the registration outcome
pub type OnRegistrationComplete =
    Box<dyn FnOnce(L2capResult<DynamicChannelService>) + Send + 'static>;

/// Registration request waiting for the manager's queue
pub(crate) struct PendingRegistration {
    pub(crate) policy: SecurityPolicy,
    pub(crate) on_registration_complete: OnRegistrationComplete,
    pub(crate) on_connection_open: OnServiceConnectionOpen,
    pub(crate) handler: Handler,
}

/// A registered service
#[derive(Clone)]
pub struct ServiceEntry {
    pub psm: Psm,
    pub policy: SecurityPolicy,
    pub(crate) on_connection_open: OnServiceConnectionOpen,
    pub(crate) handler: Handler,
}

impl fmt::Debug for ServiceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceEntry")
            .field("psm", &self.psm)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl ServiceEntry {
    /// Post the open callback for `channel` to the service's handler
    pub(crate) fn notify_open(&self, channel: ChannelHandle) {
        let on_open = self.on_connection_open.clone();
        self.handler.post(move || on_open(channel));
    }
}

/// Maps PSM to registered service. Owned by the manager's queue.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: HashMap<Psm, ServiceEntry>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service. The first registration of a PSM wins.
    pub fn register(&mut self, entry: ServiceEntry) -> L2capResult<()> {
        if !entry.psm.is_valid() {
            return Err(L2capError::InvalidPsm(entry.psm));
        }
        if self.lookup(entry.psm).is_some() {
            debug!("Rejecting duplicate registration of PSM {}", entry.psm);
            return Err(L2capError::PsmAlreadyRegistered(entry.psm));
        }

        info!("Registered service on PSM {} ({:?})", entry.psm, entry.policy);
        self.services.insert(entry.psm, entry);
        Ok(())
    }

    /// Remove a service. Channels it already accepted stay open.
    pub fn unregister(&mut self, psm: Psm) -> L2capResult<ServiceEntry> {
        let entry = self
            .services
            .remove(&psm)
            .ok_or(L2capError::PsmNotRegistered(psm))?;
        info!("Unregistered service on PSM {}", psm);
        Ok(entry)
    }

    pub fn lookup(&self, psm: Psm) -> Option<&ServiceEntry> {
        self.services.get(&psm)
    }

    /// Policy applied to an outgoing channel on `psm`
    pub fn effective_policy(&self, psm: Psm) -> SecurityPolicy {
        self.lookup(psm)
            .map(|entry| entry.policy)
            .unwrap_or(SecurityPolicy::None)
    }

    /// Registered PSMs in ascending order
    pub fn psms(&self) -> Vec<Psm> {
        let mut psms: Vec<Psm> = self.services.keys().copied().collect();
        psms.sort();
        psms
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.services.clear();
    }
}

/// PSMs with a registration accepted or in flight, shared by the façade
/// and the manager's queue
pub(crate) type ClaimedPsms = Arc<Mutex<HashSet<Psm>>>;

/// Queue an unregistration and free `psm` for the next `register_service`.
///
/// The claim is released while holding its lock, so a registration that
/// observes the free PSM is always queued behind the unregistration.
pub(crate) fn release_claim(
    claimed: &ClaimedPsms,
    commands: &mpsc::UnboundedSender<Command>,
    psm: Psm,
) -> bool {
    let mut claimed = claimed.lock();
    if commands.send(Command::UnregisterService { psm }).is_err() {
        return false;
    }
    claimed.remove(&psm);
    true
}

/// Handed to the registering caller once its service is live
#[derive(Clone)]
pub struct DynamicChannelService {
    psm: Psm,
    commands: mpsc::UnboundedSender<Command>,
    claimed: ClaimedPsms,
}

impl fmt::Debug for DynamicChannelService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicChannelService")
            .field("psm", &self.psm)
            .finish_non_exhaustive()
    }
}

impl DynamicChannelService {
    pub(crate) fn new(
        psm: Psm,
        commands: mpsc::UnboundedSender<Command>,
        claimed: ClaimedPsms,
    ) -> Self {
        Self {
            psm,
            commands,
            claimed,
        }
    }

    pub fn psm(&self) -> Psm {
        self.psm
    }

    /// Stop accepting inbound channels for this service.
    ///
    /// The PSM may be registered again right away. Returns false if the
    /// manager has already stopped.
    pub fn unregister(self) -> bool {
        release_claim(&self.claimed, &self.commands, self.psm)
    }
}
