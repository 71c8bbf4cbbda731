//! Service dispatch.
//!
//! The bus-facing surface is three request operations plus the outbound
//! `Update` notification the registry sends on its own. The transport
//! collaborator decodes incoming calls into [`ServiceRequest`] values,
//! hands them to [`PolicyService::dispatch`] together with the sender's
//! unique identity, and encodes the returned [`ServiceReply`].
//!
//! Disconnect watches installed through the bus come back through
//! [`PolicyService::peer_disconnected`]; the external resync trigger
//! (historically a Unix signal) comes in through
//! [`PolicyService::trigger_resync`].

use std::sync::Arc;

use napd_core::codec::WireValue;
use tracing::{debug, info, warn};

use crate::orchestrator::PolicyEngine;

/// An incoming request, already decoded by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceRequest {
    /// Resolve the policy configuration for an app; the sender is the
    /// app's agent.
    GetPolicyConfig {
        /// Unique bus identity of the app being asked about.
        app_owner: String,
    },

    /// Record where the sending agent wants `Update` notifications.
    RegisterAgent {
        /// Notification target path of the agent.
        notify_path: String,
    },

    /// Drop the sending agent's registration.
    UnregisterAgent {
        /// Notification target path given at registration time.
        notify_path: String,
    },
}

/// The reply the transport encodes back to the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceReply {
    /// A resolved policy document in wire form.
    PolicyConfig(WireValue),

    /// Success without a payload.
    Ack,

    /// An error reply for this one request.
    Error {
        /// Caller-safe description.
        message: String,
    },
}

/// Routes decoded requests into the engine.
pub struct PolicyService {
    engine: Arc<PolicyEngine>,
}

impl PolicyService {
    /// Wraps an engine.
    #[must_use]
    pub fn new(engine: Arc<PolicyEngine>) -> Self {
        Self { engine }
    }

    /// The wrapped engine.
    #[must_use]
    pub fn engine(&self) -> &Arc<PolicyEngine> {
        &self.engine
    }

    /// Dispatches one request from the given sender.
    ///
    /// Every failure becomes an [`ServiceReply::Error`] for this request;
    /// nothing propagates further.
    pub async fn dispatch(&self, sender: &str, request: ServiceRequest) -> ServiceReply {
        match request {
            ServiceRequest::GetPolicyConfig { app_owner } => {
                match self.engine.get_policy_config(sender, &app_owner).await {
                    Ok(policy) => ServiceReply::PolicyConfig(policy),
                    Err(e) => {
                        info!(app = app_owner.as_str(), "policy request failed: {e}");
                        ServiceReply::Error {
                            message: e.to_string(),
                        }
                    }
                }
            }
            ServiceRequest::RegisterAgent { notify_path } => {
                match self.engine.register_agent(sender, &notify_path).await {
                    Ok(()) => ServiceReply::Ack,
                    Err(e) => ServiceReply::Error {
                        message: e.to_string(),
                    },
                }
            }
            ServiceRequest::UnregisterAgent { notify_path } => {
                match self.engine.unregister_agent(sender, &notify_path).await {
                    Ok(()) => ServiceReply::Ack,
                    Err(e) => {
                        info!(agent = sender, "agent could not be unregistered");
                        ServiceReply::Error {
                            message: e.to_string(),
                        }
                    }
                }
            }
        }
    }

    /// Feeds a fired disconnect watch into the cleanup.
    pub async fn peer_disconnected(&self, owner: &str) {
        debug!(peer = owner, "peer disconnected");
        self.engine.handle_disconnect(owner).await;
    }

    /// Runs one explicitly triggered resync; failures are logged, nobody
    /// is waiting on a reply.
    pub async fn trigger_resync(&self) {
        debug!("explicit policy resync triggered");
        match self.engine.resync().await {
            Ok(()) => debug!("policy update from server successful"),
            Err(e) => warn!("policy update from server failed: {e}"),
        }
    }
}
