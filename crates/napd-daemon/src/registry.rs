//! Agent and app registry.
//!
//! Tracks which agent represents which app, where each agent wants its
//! `Update` notifications delivered, which identity tokens an app is
//! subscribed under, and the last policy content pushed to each app.
//! Disconnects drive the cleanup: an agent going away removes its
//! registration and every app it represents; an app going away removes
//! just that app.
//!
//! # Invariants
//!
//! - An app's candidate tokens contain only valid `namespace:value`
//!   tokens; invalid ones are dropped at subscription time without
//!   surfacing an error to the caller.
//! - The token index, the app map and the pending set stay consistent by
//!   construction: every mutation updates all of them together.
//! - Disconnect cascades match on the exact agent-owner segment of the
//!   app id, never on a string prefix, so an agent whose identity happens
//!   to be a prefix of another's cannot take the wrong apps down with it.

use std::collections::{BTreeMap, HashMap};

use napd_core::codec;
use napd_core::token::IdentityToken;
use thiserror::Error;
use tracing::debug;

use crate::bus::{BusError, PolicyBus};
use crate::store::PolicyStore;

/// Registry-level failures.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The agent already has a registration.
    #[error("agent {owner} is already registered")]
    AgentAlreadyRegistered {
        /// The agent's bus identity.
        owner: String,
    },

    /// The unregister call named a different notify target than the one on
    /// record (or the agent was never registered).
    #[error("agent {owner} is not registered with the given notify target")]
    TargetMismatch {
        /// The agent's bus identity.
        owner: String,
    },

    /// A push-cycle delivery had no registered target to go to.
    #[error("agent {owner} has no registered notify target")]
    NoNotifyTarget {
        /// The agent-owner segment of the undeliverable app.
        owner: String,
    },

    /// A push-cycle delivery failed at the transport.
    #[error("policy push to app {app_id} failed")]
    PushFailed {
        /// The app the delivery was meant for.
        app_id: String,
        /// Underlying bus failure.
        #[source]
        source: BusError,
    },
}

/// An app as seen by the daemon, keyed by `agent_owner/app_owner`.
#[derive(Debug, Clone)]
pub struct AgentApp {
    id: String,
    agent_owner: String,
    app_owner: String,
    tokens: Vec<IdentityToken>,
    last_pushed: String,
}

impl AgentApp {
    /// The composite `agent_owner/app_owner` id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The agent-owner segment.
    #[must_use]
    pub fn agent_owner(&self) -> &str {
        &self.agent_owner
    }

    /// The app-owner segment.
    #[must_use]
    pub fn app_owner(&self) -> &str {
        &self.app_owner
    }

    /// The validated candidate tokens, in subscription order.
    #[must_use]
    pub fn tokens(&self) -> &[IdentityToken] {
        &self.tokens
    }

    /// Serialized content of the policy last delivered to this app.
    #[must_use]
    pub fn last_pushed(&self) -> &str {
        &self.last_pushed
    }
}

/// Registry of agents, their apps and pending policy pushes.
#[derive(Debug, Default)]
pub struct AgentRegistry {
    /// Agent owner to notify target.
    agents: HashMap<String, String>,
    /// App id to app. Ordered so push cycles and update marking walk the
    /// apps deterministically.
    apps: BTreeMap<String, AgentApp>,
    /// Token to subscribed app ids, in subscription order.
    subscribers: HashMap<IdentityToken, Vec<String>>,
    /// Apps whose active policy diverged from the last pushed content.
    /// Recomputed from scratch by [`mark_pending_updates`]
    /// and drained by [`push_updates`].
    ///
    /// [`mark_pending_updates`]: Self::mark_pending_updates
    /// [`push_updates`]: Self::push_updates
    pending: Vec<String>,
}

impl AgentRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records where to deliver push notifications for an agent and
    /// installs its disconnect watch.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::AgentAlreadyRegistered`] without touching
    /// the existing registration.
    pub fn register_agent(
        &mut self,
        agent_owner: &str,
        notify_target: &str,
        bus: &dyn PolicyBus,
    ) -> Result<(), RegistryError> {
        if self.agents.contains_key(agent_owner) {
            debug!(agent = agent_owner, "agent registration refused, already registered");
            return Err(RegistryError::AgentAlreadyRegistered {
                owner: agent_owner.to_owned(),
            });
        }

        self.agents
            .insert(agent_owner.to_owned(), notify_target.to_owned());
        bus.watch_disconnect(agent_owner);
        debug!(agent = agent_owner, target = notify_target, "agent registered");
        Ok(())
    }

    /// Removes an agent registration, verifying the caller names the
    /// stored notify target. Success cascades exactly like a disconnect.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::TargetMismatch`] when the target differs
    /// or the agent is unknown.
    pub fn unregister_agent(
        &mut self,
        agent_owner: &str,
        notify_target: &str,
    ) -> Result<(), RegistryError> {
        match self.agents.get(agent_owner) {
            Some(stored) if stored.as_str() == notify_target => {
                self.agents.remove(agent_owner);
                self.remove_agent_apps(agent_owner);
                debug!(agent = agent_owner, "agent unregistered");
                Ok(())
            }
            _ => Err(RegistryError::TargetMismatch {
                owner: agent_owner.to_owned(),
            }),
        }
    }

    /// Subscribes an app under its candidate tokens.
    ///
    /// Idempotent: a second subscription for the same
    /// `(agent_owner, app_owner)` pair is a no-op. Candidates that do not
    /// parse as identity tokens are dropped with a log line and no error.
    /// The app's last-pushed baseline starts as the active policy at
    /// subscription time, and a disconnect watch is installed for the app
    /// owner independently of its agent's watch.
    pub fn subscribe(
        &mut self,
        agent_owner: &str,
        app_owner: &str,
        candidates: &[String],
        store: &PolicyStore,
        bus: &dyn PolicyBus,
    ) {
        let app_id = app_id(agent_owner, app_owner);
        if self.apps.contains_key(&app_id) {
            return;
        }

        let mut tokens = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            match IdentityToken::parse(candidate) {
                Some(token) => tokens.push(token),
                None => {
                    debug!(token = candidate.as_str(), "dropping invalid identity token");
                }
            }
        }

        for token in &tokens {
            let subscribed = self.subscribers.entry(token.clone()).or_default();
            if !subscribed.contains(&app_id) {
                subscribed.push(app_id.clone());
            }
        }

        let last_pushed = store.active_policy(&tokens).text().to_owned();
        self.apps.insert(
            app_id.clone(),
            AgentApp {
                id: app_id.clone(),
                agent_owner: agent_owner.to_owned(),
                app_owner: app_owner.to_owned(),
                tokens,
                last_pushed,
            },
        );
        bus.watch_disconnect(app_owner);
        debug!(app = app_id.as_str(), "app subscribed");
    }

    /// Looks up an app by its composite id.
    #[must_use]
    pub fn app(&self, app_id: &str) -> Option<&AgentApp> {
        self.apps.get(app_id)
    }

    /// The notify target registered for an agent, if any.
    #[must_use]
    pub fn agent_target(&self, agent_owner: &str) -> Option<&str> {
        self.agents.get(agent_owner).map(String::as_str)
    }

    /// Number of registered apps.
    #[must_use]
    pub fn app_count(&self) -> usize {
        self.apps.len()
    }

    /// App ids subscribed under a token, in subscription order.
    #[must_use]
    pub fn subscribers(&self, token: &IdentityToken) -> &[String] {
        self.subscribers.get(token).map_or(&[], Vec::as_slice)
    }

    /// App ids currently marked for a push.
    #[must_use]
    pub fn pending(&self) -> &[String] {
        &self.pending
    }

    /// Routes a peer disconnect to the matching cleanup.
    ///
    /// If the peer was a registered agent, the registration goes away along
    /// with every app whose agent-owner segment equals the peer exactly.
    /// Independently, any app whose app-owner segment equals the peer is
    /// removed; its agent may well still be connected.
    pub fn handle_disconnect(&mut self, owner: &str) {
        if self.agents.remove(owner).is_some() {
            debug!(agent = owner, "agent disconnected");
            self.remove_agent_apps(owner);
        }
        self.remove_apps_where(|app| app.app_owner == owner);
    }

    /// Removes every app represented by the given agent.
    fn remove_agent_apps(&mut self, agent_owner: &str) {
        self.remove_apps_where(|app| app.agent_owner == agent_owner);
    }

    fn remove_apps_where(&mut self, predicate: impl Fn(&AgentApp) -> bool) {
        let doomed: Vec<String> = self
            .apps
            .values()
            .filter(|app| predicate(app))
            .map(|app| app.id.clone())
            .collect();

        for app_id in doomed {
            if let Some(app) = self.apps.remove(&app_id) {
                debug!(app = app.id(), "removing app");
                for token in &app.tokens {
                    if let Some(subscribed) = self.subscribers.get_mut(token) {
                        subscribed.retain(|id| id != &app_id);
                        if subscribed.is_empty() {
                            self.subscribers.remove(token);
                        }
                    }
                }
            }
            self.pending.retain(|id| id != &app_id);
        }
    }

    /// Recomputes the pending-update set from scratch.
    ///
    /// An app is pending when the serialized content of its active policy
    /// differs from what was last pushed to it.
    pub fn mark_pending_updates(&mut self, store: &PolicyStore) {
        self.pending.clear();
        for (id, app) in &self.apps {
            if store.active_policy(&app.tokens).text() != app.last_pushed {
                self.pending.push(id.clone());
            }
        }
        debug!(count = self.pending.len(), "apps marked for policy update");
    }

    /// Pushes the active policy to every pending app.
    ///
    /// Deliveries are point-to-point `Update` notifications to each app's
    /// agent target. The cycle is fail-fast by contract: the first
    /// delivery failure (including a missing agent target) stops the cycle
    /// and leaves the remaining apps un-pushed, so callers can detect
    /// partial application from the error. Successful deliveries update
    /// the per-app baseline immediately and survive a later failure in the
    /// same cycle.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NoNotifyTarget`] or
    /// [`RegistryError::PushFailed`] for the first failing delivery.
    pub async fn push_updates(
        &mut self,
        bus: &dyn PolicyBus,
        store: &PolicyStore,
    ) -> Result<usize, RegistryError> {
        let queue = std::mem::take(&mut self.pending);
        let mut delivered = 0;
        let mut remaining = queue.into_iter();

        while let Some(app_id) = remaining.next() {
            // The app may have disconnected since it was marked.
            let Some(app) = self.apps.get(&app_id) else {
                continue;
            };
            let agent_owner = app.agent_owner.clone();
            let app_owner = app.app_owner.clone();
            let tokens = app.tokens.clone();

            let Some(target) = self.agents.get(&agent_owner).cloned() else {
                self.pending = std::iter::once(app_id.clone()).chain(remaining).collect();
                return Err(RegistryError::NoNotifyTarget { owner: agent_owner });
            };

            let policy = store.active_policy(&tokens);
            let wire = codec::encode(policy.content());
            debug!(app = app_id.as_str(), agent = agent_owner.as_str(), "pushing policy update");

            if let Err(source) = bus
                .send_update(&agent_owner, &target, &app_owner, &wire)
                .await
            {
                self.pending = std::iter::once(app_id.clone()).chain(remaining).collect();
                return Err(RegistryError::PushFailed { app_id, source });
            }

            let text = policy.text().to_owned();
            if let Some(app) = self.apps.get_mut(&app_id) {
                app.last_pushed = text;
            }
            delivered += 1;
        }

        Ok(delivered)
    }
}

fn app_id(agent_owner: &str, app_owner: &str) -> String {
    format!("{agent_owner}/{app_owner}")
}
