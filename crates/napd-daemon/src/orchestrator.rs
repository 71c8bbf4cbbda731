//! Request orchestration.
//!
//! A policy-config request runs through a fixed asynchronous chain:
//!
//! ```text
//! START -> SELF_CHECK -> FRESHNESS_CHECK -> [REMOTE_SYNC]
//!       -> LABEL_LOOKUP -> USER_LOOKUP -> RESOLVE -> REPLIED
//! ```
//!
//! The suspension points are exactly the two identity lookups and the
//! remote fetch; everything else is synchronous against the shared state.
//! Multiple requests may be in flight at once; each owns its own
//! [`ConfigRequest`] context and touches the store and registry only
//! through the single state lock, so interleavings at the suspension
//! points are the only source of ordering.
//!
//! The two identity lookups are sequential on purpose: the group id is
//! derived from the resolved user id, and token building needs both
//! before the subscription is installed. Their failure handling is
//! asymmetric on purpose as well: a missing or failed
//! mandatory-access-control label is an expected case (label-less
//! system) and the chain continues without it, while a failed user
//! lookup ends the request with an error reply.

use std::sync::Arc;
use std::time::Duration;

use napd_core::codec::{self, WireValue};
use napd_core::token::{IdentityToken, Namespace};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::bus::{BusError, PolicyBus};
use crate::identity::{context_identity, AccountDirectory, IdentityResolver};
use crate::registry::{AgentRegistry, RegistryError};
use crate::storage::PolicyStorage;
use crate::store::PolicyStore;
use crate::sync::{parse_policy_set, PolicySource, SyncError};

/// Reasons a policy-config request ends in an error reply.
///
/// Every variant maps to exactly one error reply on the pending request;
/// nothing here crashes the daemon.
#[derive(Debug, Error)]
pub enum ConfigFailure {
    /// The mandatory resync ahead of resolution failed; the request never
    /// falls back to resolving against stale data.
    #[error("policy update from server failed: {0}")]
    Sync(#[from] SyncError),

    /// The user-id lookup failed. Unlike the label lookup, this is fatal.
    #[error("retrieving user id failed: {0}")]
    UserLookup(#[source] BusError),

    /// The resolved uid has no entry in the account database.
    #[error("unknown user id {uid}")]
    UnknownUser {
        /// The unresolvable uid.
        uid: u32,
    },

    /// The derived gid has no entry in the account database.
    #[error("unknown group id {gid}")]
    UnknownGroup {
        /// The unresolvable gid.
        gid: u32,
    },
}

/// Ephemeral per-request context.
///
/// Lives for one orchestration chain, is never persisted and never shared
/// between concurrent requests.
#[derive(Debug)]
struct ConfigRequest {
    agent_owner: String,
    app_owner: String,
    label: Option<String>,
    uid: u32,
    gid: u32,
}

/// Shared mutable state: the policy store and the agent/app registry.
///
/// Both live behind one lock; their APIs are synchronous, so every
/// critical section is a straight-line sequence between suspension
/// points.
struct EngineState {
    store: PolicyStore,
    registry: AgentRegistry,
}

/// The policy-resolution engine.
///
/// Owns the shared state and the collaborator handles; the service layer
/// calls into it per request. Constructed once at startup, injected into
/// the service, no global singletons.
pub struct PolicyEngine {
    bus: Arc<dyn PolicyBus>,
    source: Arc<dyn PolicySource>,
    accounts: Arc<dyn AccountDirectory>,
    storage: PolicyStorage,
    staleness: Duration,
    state: tokio::sync::Mutex<EngineState>,
}

impl PolicyEngine {
    /// Assembles the engine from its collaborators and an initial store.
    #[must_use]
    pub fn new(
        bus: Arc<dyn PolicyBus>,
        source: Arc<dyn PolicySource>,
        accounts: Arc<dyn AccountDirectory>,
        storage: PolicyStorage,
        staleness: Duration,
        store: PolicyStore,
    ) -> Self {
        Self {
            bus,
            source,
            accounts,
            storage,
            staleness,
            state: tokio::sync::Mutex::new(EngineState {
                store,
                registry: AgentRegistry::new(),
            }),
        }
    }

    /// The transport this engine is wired to.
    #[must_use]
    pub fn bus(&self) -> &Arc<dyn PolicyBus> {
        &self.bus
    }

    /// Resolves the policy configuration for an app on behalf of its
    /// agent, subscribing the app for future pushes along the way.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigFailure`] that the service layer turns into an
    /// error reply for this one request.
    pub async fn get_policy_config(
        &self,
        agent_owner: &str,
        app_owner: &str,
    ) -> Result<WireValue, ConfigFailure> {
        debug!(app = app_owner, agent = agent_owner, "policy requested");

        // SELF_CHECK: the daemon asked about itself answers from the self
        // policy without identity resolution or subscription.
        if app_owner == self.bus.unique_name() {
            debug!("daemon queried about its own policy");
            let state = self.state.lock().await;
            return Ok(codec::encode(state.store.self_policy().content()));
        }

        // FRESHNESS_CHECK -> [REMOTE_SYNC]
        if self.storage_is_stale() {
            debug!("local policies are stale, resyncing before resolution");
            self.resync().await?;
        } else {
            debug!("local policies are fresh, no resync needed");
        }

        let resolver = IdentityResolver::new(Arc::clone(&self.bus));

        // LABEL_LOOKUP: absence of a label is an expected case.
        let label = match resolver.security_label(app_owner).await {
            Ok(Some(context)) => context_identity(&context).map(str::to_owned),
            Ok(None) => None,
            Err(e) => {
                debug!(app = app_owner, "label lookup failed, continuing without label: {e}");
                None
            }
        };

        // USER_LOOKUP: this one is fatal on failure.
        let uid = resolver
            .user_id(app_owner)
            .await
            .map_err(ConfigFailure::UserLookup)?;
        let account = self
            .accounts
            .user_by_uid(uid)
            .ok_or(ConfigFailure::UnknownUser { uid })?;
        let gid = account.primary_gid;
        let group = self
            .accounts
            .group_name(gid)
            .ok_or(ConfigFailure::UnknownGroup { gid })?;

        let request = ConfigRequest {
            agent_owner: agent_owner.to_owned(),
            app_owner: app_owner.to_owned(),
            label,
            uid,
            gid,
        };
        debug!(
            app = request.app_owner.as_str(),
            uid = request.uid,
            gid = request.gid,
            label = request.label.as_deref().unwrap_or(""),
            user = account.name.as_str(),
            group = group.as_str(),
            "identity resolved"
        );

        // RESOLVE: subscribe, select, memoize, reply.
        let mut candidates = Vec::with_capacity(3);
        if let Some(label) = request.label.as_deref() {
            candidates.push(format!("selinux:{label}"));
        }
        candidates.push(format!("user:{}", account.name));
        candidates.push(format!("group:{group}"));

        let mut state = self.state.lock().await;
        let EngineState { store, registry } = &mut *state;

        registry.subscribe(
            &request.agent_owner,
            &request.app_owner,
            &candidates,
            store,
            self.bus.as_ref(),
        );

        let app_id = format!("{}/{}", request.agent_owner, request.app_owner);
        // Defensive: the app can only be gone again if its disconnect watch
        // fired between subscribe and here, which the single lock rules
        // out, but a missing entry still must not bring the daemon down.
        let tokens = registry
            .app(&app_id)
            .map(|app| app.tokens().to_vec())
            .unwrap_or_default();

        if store.active_policy(&tokens).has_empty_id() {
            if let Some(user_token) = IdentityToken::new(Namespace::User, &account.name) {
                store.retitle_default_if_empty(&user_token);
            }
        }

        let policy = store.active_policy(&tokens);
        debug!(
            app = request.app_owner.as_str(),
            agent = request.agent_owner.as_str(),
            policy = policy.id(),
            "policy resolved and sent"
        );
        Ok(codec::encode(policy.content()))
    }

    /// Fetches the remote policy set, persists it, reloads the store and
    /// runs one push cycle.
    ///
    /// Fetch, persist and reload failures abort the sync; a push-cycle
    /// failure is logged and left for the next cycle, since delivery to
    /// third parties is not part of the triggering caller's contract.
    ///
    /// # Errors
    ///
    /// Returns the first [`SyncError`] along the pipeline.
    pub async fn resync(&self) -> Result<(), SyncError> {
        let payload = self.source.fetch().await?;
        let documents = parse_policy_set(&payload)?;
        self.storage.replace_all(&documents)?;

        let mut state = self.state.lock().await;
        let EngineState { store, registry } = &mut *state;

        store.reload(documents)?;
        debug!(count = store.len(), "policy store reloaded from server");

        registry.mark_pending_updates(store);
        if let Err(e) = registry.push_updates(self.bus.as_ref(), store).await {
            warn!("policy push cycle stopped early: {e}");
        }
        Ok(())
    }

    /// Registers an agent's notify target.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::AgentAlreadyRegistered`] on duplicates.
    pub async fn register_agent(
        &self,
        agent_owner: &str,
        notify_target: &str,
    ) -> Result<(), RegistryError> {
        let mut state = self.state.lock().await;
        state
            .registry
            .register_agent(agent_owner, notify_target, self.bus.as_ref())
    }

    /// Unregisters an agent, cascading like a disconnect.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::TargetMismatch`] when the target differs
    /// from the stored one.
    pub async fn unregister_agent(
        &self,
        agent_owner: &str,
        notify_target: &str,
    ) -> Result<(), RegistryError> {
        let mut state = self.state.lock().await;
        state.registry.unregister_agent(agent_owner, notify_target)
    }

    /// Routes a peer disconnect into the registry cleanup.
    pub async fn handle_disconnect(&self, owner: &str) {
        let mut state = self.state.lock().await;
        state.registry.handle_disconnect(owner);
    }

    /// Runs a read-only closure against the current registry state.
    pub async fn with_registry<R>(&self, f: impl FnOnce(&AgentRegistry) -> R) -> R {
        let state = self.state.lock().await;
        f(&state.registry)
    }

    /// Runs a read-only closure against the current store state.
    pub async fn with_store<R>(&self, f: impl FnOnce(&PolicyStore) -> R) -> R {
        let state = self.state.lock().await;
        f(&state.store)
    }

    fn storage_is_stale(&self) -> bool {
        match self.storage.age() {
            Ok(age) => age > self.staleness,
            Err(e) => {
                // An uninspectable policy directory counts as fresh;
                // resolution proceeds against the in-memory set.
                error!("cannot inspect policy storage: {e}");
                false
            }
        }
    }
}
