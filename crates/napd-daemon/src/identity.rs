//! Identity resolution.
//!
//! Turning a caller's bus identity into identity tokens takes two
//! independent bus lookups (security context, user id) followed by local
//! account resolution (user name, primary group, group name). The bus
//! lookups complete exactly once each and tolerate a transiently
//! unavailable bus as a normal failure.
//!
//! The two lookups are deliberately sequential in the orchestrator: the
//! group id is derived from the resolved user id, and token building needs
//! both before the app can be subscribed.

use std::sync::Arc;

use crate::bus::{BusError, PolicyBus};

/// Thin request/response wrapper over the bus identity queries.
#[derive(Clone)]
pub struct IdentityResolver {
    bus: Arc<dyn PolicyBus>,
}

impl IdentityResolver {
    /// Create a resolver over the given transport.
    #[must_use]
    pub fn new(bus: Arc<dyn PolicyBus>) -> Self {
        Self { bus }
    }

    /// Resolves the peer's mandatory-access-control context string.
    ///
    /// `Ok(None)` means the peer carries no label, which is an expected case
    /// on label-less systems.
    ///
    /// # Errors
    ///
    /// [`BusError::Transport`] when the call cannot be dispatched,
    /// [`BusError::Protocol`] when the response shape is wrong.
    pub async fn security_label(&self, peer: &str) -> Result<Option<String>, BusError> {
        let raw = self.bus.peer_security_context(peer).await?;
        if raw.is_empty() {
            return Ok(None);
        }
        let context = String::from_utf8(raw)
            .map_err(|_| BusError::protocol("security context is not valid UTF-8"))?;
        Ok(Some(context))
    }

    /// Resolves the peer's numeric user id.
    ///
    /// # Errors
    ///
    /// Same failure taxonomy as [`security_label`](Self::security_label).
    pub async fn user_id(&self, peer: &str) -> Result<u32, BusError> {
        self.bus.peer_user_id(peer).await
    }
}

/// Extracts the identity component from a security context.
///
/// Contexts have the shape `user:role:type[:level]`; the type component is
/// what identifies the application (domain transitions carry the executable
/// type onto the running process). Contexts with fewer than three fields
/// yield no identity.
#[must_use]
pub fn context_identity(context: &str) -> Option<&str> {
    context.split(':').nth(2)
}

/// A resolved user account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAccount {
    /// Login name.
    pub name: String,
    /// Primary group id.
    pub primary_gid: u32,
}

/// Local account database lookups.
///
/// Both lookups are synchronous; the system implementation reads the local
/// account database. Tests substitute a static table.
pub trait AccountDirectory: Send + Sync {
    /// Looks up a user by uid.
    fn user_by_uid(&self, uid: u32) -> Option<UserAccount>;

    /// Looks up a group name by gid.
    fn group_name(&self, gid: u32) -> Option<String>;
}

/// [`AccountDirectory`] backed by the system account database.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemAccounts;

impl AccountDirectory for SystemAccounts {
    fn user_by_uid(&self, uid: u32) -> Option<UserAccount> {
        let user = nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
            .ok()
            .flatten()?;
        Some(UserAccount {
            name: user.name,
            primary_gid: user.gid.as_raw(),
        })
    }

    fn group_name(&self, gid: u32) -> Option<String> {
        nix::unistd::Group::from_gid(nix::unistd::Gid::from_raw(gid))
            .ok()
            .flatten()
            .map(|group| group.name)
    }
}
