//! Security enforcement seam
//!
//! The manager does not authenticate or encrypt links itself. Before a
//! channel whose policy is not `SecurityPolicy::None` may configure, the
//! manager asks the `SecurityGate` and suspends the channel until it answers.

use super::types::SecurityPolicy;
use crate::address::Address;
use async_trait::async_trait;

/// Decides whether the link to `address` satisfies `policy`.
///
/// Implementations may run pairing or encryption procedures before
/// answering. The call is made from a spawned task, never from the
/// manager's queue.
#[async_trait]
pub trait SecurityGate: Send + Sync + 'static {
    async fn check_security(&self, address: Address, policy: SecurityPolicy) -> bool;
}
