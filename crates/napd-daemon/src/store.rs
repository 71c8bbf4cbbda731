//! Policy store.
//!
//! Owns the set of loaded policies: the synced documents keyed by id, plus
//! the default and self policies loaded from their well-known files at
//! startup. Selection of the active policy for a set of candidate tokens is
//! a pure function over the current store content and is recomputed on
//! every call; nothing about it is cached on the apps beyond the last
//! pushed serialization.

use std::collections::HashMap;

use napd_core::policy::{PolicyDocument, PolicyError};
use napd_core::token::IdentityToken;
use serde_json::Value;
use tracing::debug;

use crate::storage::{PolicyStorage, StorageError};

/// The loaded policy set.
#[derive(Debug)]
pub struct PolicyStore {
    /// Synced policies by id.
    policies: HashMap<String, PolicyDocument>,
    /// Fallback when no candidate token matches.
    default_policy: PolicyDocument,
    /// Served when the daemon is asked about itself.
    self_policy: PolicyDocument,
}

impl PolicyStore {
    /// Creates a store around the two well-known policies.
    #[must_use]
    pub fn new(default_policy: PolicyDocument, self_policy: PolicyDocument) -> Self {
        Self {
            policies: HashMap::new(),
            default_policy,
            self_policy,
        }
    }

    /// Loads the store from disk: default policy, self policy and the
    /// synced set. Any failure is fatal to startup.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] when a file cannot be read or validated.
    pub fn load(storage: &PolicyStorage) -> Result<Self, StorageError> {
        let mut store = Self::new(storage.load_default()?, storage.load_self()?);
        store
            .reload(storage.load_documents()?)
            .map_err(|source| StorageError::Document {
                path: storage.policy_dir().to_owned(),
                source,
            })?;
        Ok(store)
    }

    /// Looks up a synced policy by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&PolicyDocument> {
        self.policies.get(id)
    }

    /// The fallback policy.
    #[must_use]
    pub const fn default_policy(&self) -> &PolicyDocument {
        &self.default_policy
    }

    /// The daemon's own policy.
    #[must_use]
    pub const fn self_policy(&self) -> &PolicyDocument {
        &self.self_policy
    }

    /// Number of synced policies.
    #[must_use]
    pub fn len(&self) -> usize {
        self.policies.len()
    }

    /// Whether the synced set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// Replaces the synced policy set from a batch of parsed documents.
    ///
    /// Every document is validated before any shared state changes; a
    /// malformed document fails the whole reload and leaves the previously
    /// loaded set fully intact. The swap itself is atomic from the daemon's
    /// point of view.
    ///
    /// # Errors
    ///
    /// Returns the first document's [`PolicyError`].
    pub fn reload(&mut self, documents: Vec<Value>) -> Result<(), PolicyError> {
        let mut parsed = Vec::with_capacity(documents.len());
        for document in documents {
            parsed.push(PolicyDocument::from_value(document)?);
        }

        self.policies.clear();
        for policy in parsed {
            debug!(id = policy.id(), "loading policy");
            self.policies.insert(policy.id().to_owned(), policy);
        }
        Ok(())
    }

    /// Selects the active policy for an app's candidate tokens.
    ///
    /// Only tokens with a matching policy in the store take part; they are
    /// scored by namespace priority and the highest wins. Ties are broken
    /// by first occurrence in the candidate list. With no match at all the
    /// default policy applies.
    #[must_use]
    pub fn active_policy(&self, tokens: &[IdentityToken]) -> &PolicyDocument {
        let mut best: Option<(&PolicyDocument, u8)> = None;
        for token in tokens {
            let Some(policy) = self.policies.get(&token.as_policy_id()) else {
                continue;
            };
            let priority = token.priority();
            // Strict comparison keeps the first occurrence on ties.
            if best.is_none_or(|(_, current)| priority > current) {
                best = Some((policy, priority));
            }
        }
        best.map_or(&self.default_policy, |(policy, _)| policy)
    }

    /// Memoizes an identity onto the default policy if its id is empty.
    ///
    /// Synced policies are reachable through
    /// [`active_policy`](Self::active_policy) only via non-empty token ids,
    /// so the default policy is the only selectable policy that can carry
    /// an empty id. The
    /// first time it is served to a concretely identified app it
    /// permanently takes that app's user token as its id, so the caller
    /// sees a policy named after itself.
    pub fn retitle_default_if_empty(&mut self, token: &IdentityToken) {
        self.default_policy.retitle_if_empty(token);
    }
}
