//! Bus transport seam.
//!
//! The daemon never owns a bus connection; the platform transport is an
//! external collaborator reached through the [`PolicyBus`] trait. The trait
//! covers exactly what the policy engine needs from it:
//!
//! - the daemon's own unique identity, for the self-policy short circuit
//! - the two peer identity queries (security context, user id)
//! - disconnect watches, delivered back via
//!   [`PolicyService::peer_disconnected`](crate::service::PolicyService::peer_disconnected)
//! - point-to-point `Update` notification delivery to agent notify targets
//!
//! Timeouts on bus calls are the transport's responsibility; they surface
//! here as ordinary [`BusError::Transport`] failures.

use async_trait::async_trait;
use napd_core::codec::WireValue;
use thiserror::Error;

/// Bus-level failures.
///
/// Transport failures (bus unreachable, call not dispatched) are expected
/// during startup races and peer churn; protocol failures indicate a
/// malformed response shape. Both are reported to the pending caller as a
/// generic failure, never escalated to a crash.
#[derive(Debug, Error)]
pub enum BusError {
    /// The request could not be dispatched or the bus is unreachable.
    #[error("bus transport failure: {message}")]
    Transport {
        /// Description of the transport failure.
        message: String,
    },

    /// The response did not have the expected shape.
    #[error("bus protocol failure: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },
}

impl BusError {
    /// Create a transport error.
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a protocol error.
    #[must_use]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Returns `true` for transient transport failures.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}

/// The transport collaborator.
///
/// Implementations must be cheap to share; the engine holds one behind an
/// `Arc` and calls it from interleaved request chains.
#[async_trait]
pub trait PolicyBus: Send + Sync {
    /// The daemon's own unique identity on the bus.
    fn unique_name(&self) -> &str;

    /// Raw mandatory-access-control context of a peer.
    ///
    /// An empty result means the peer carries no label, which is an expected
    /// case on label-less systems and is not an error.
    async fn peer_security_context(&self, peer: &str) -> Result<Vec<u8>, BusError>;

    /// Numeric user id of a peer.
    async fn peer_user_id(&self, peer: &str) -> Result<u32, BusError>;

    /// Asks the transport to report when this peer disconnects.
    ///
    /// Watches are delivered as plain peer names; the service layer routes
    /// them to the registry's cleanup. Watching the same peer twice is
    /// harmless.
    fn watch_disconnect(&self, peer: &str);

    /// Delivers an `Update` notification to an agent's notify target.
    async fn send_update(
        &self,
        agent_owner: &str,
        notify_path: &str,
        app_owner: &str,
        policy: &WireValue,
    ) -> Result<(), BusError>;
}

/// Placeholder transport for deployments where no platform bus integration
/// is wired in.
///
/// Every peer operation fails with a transport error; disconnect watches go
/// nowhere. The daemon still starts, validates its policy files and serves
/// the resync trigger, which lets the storage pipeline be exercised before
/// the platform transport lands.
#[derive(Debug)]
pub struct OfflineBus {
    name: String,
}

impl Default for OfflineBus {
    fn default() -> Self {
        Self::new()
    }
}

impl OfflineBus {
    /// Create an offline transport with a fixed unique name.
    #[must_use]
    pub fn new() -> Self {
        Self { name: ":0".into() }
    }
}

#[async_trait]
impl PolicyBus for OfflineBus {
    fn unique_name(&self) -> &str {
        &self.name
    }

    async fn peer_security_context(&self, _peer: &str) -> Result<Vec<u8>, BusError> {
        Err(BusError::transport("no bus transport configured"))
    }

    async fn peer_user_id(&self, _peer: &str) -> Result<u32, BusError> {
        Err(BusError::transport("no bus transport configured"))
    }

    fn watch_disconnect(&self, _peer: &str) {}

    async fn send_update(
        &self,
        _agent_owner: &str,
        _notify_path: &str,
        _app_owner: &str,
        _policy: &WireValue,
    ) -> Result<(), BusError> {
        Err(BusError::transport("no bus transport configured"))
    }
}
