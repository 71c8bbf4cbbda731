//! Shared test doubles for daemon integration tests.
//!
//! [`TestBus`] stands in for the platform transport: peer identities are
//! configured up front, deliveries and watches are recorded, and selected
//! operations can be made to fail. [`QueuedSource`] replays canned fetch
//! results. [`StaticAccounts`] is a fixed account table.

// Each test binary compiles this module but uses only a slice of it.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use napd_core::codec::WireValue;
use napd_core::config::StorageConfig;
use napd_daemon::bus::{BusError, PolicyBus};
use napd_daemon::identity::{AccountDirectory, UserAccount};
use napd_daemon::orchestrator::PolicyEngine;
use napd_daemon::service::PolicyService;
use napd_daemon::storage::PolicyStorage;
use napd_daemon::store::PolicyStore;
use napd_daemon::sync::{PolicySource, SyncError};
use tempfile::TempDir;

/// A recorded `Update` delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub agent_owner: String,
    pub notify_path: String,
    pub app_owner: String,
    pub policy: WireValue,
}

/// Transport double with configurable peer identities.
#[derive(Default)]
pub struct TestBus {
    unique_name: String,
    labels: Mutex<HashMap<String, Vec<u8>>>,
    uids: Mutex<HashMap<String, u32>>,
    label_failures: Mutex<HashSet<String>>,
    uid_failures: Mutex<HashSet<String>>,
    fail_updates: Mutex<bool>,
    pub updates: Mutex<Vec<Delivery>>,
    pub watches: Mutex<Vec<String>>,
}

impl TestBus {
    pub fn new(unique_name: &str) -> Self {
        Self {
            unique_name: unique_name.to_owned(),
            ..Self::default()
        }
    }

    pub fn set_label(&self, peer: &str, context: &str) {
        self.labels
            .lock()
            .unwrap()
            .insert(peer.to_owned(), context.as_bytes().to_vec());
    }

    pub fn set_uid(&self, peer: &str, uid: u32) {
        self.uids.lock().unwrap().insert(peer.to_owned(), uid);
    }

    pub fn fail_label_for(&self, peer: &str) {
        self.label_failures.lock().unwrap().insert(peer.to_owned());
    }

    pub fn fail_uid_for(&self, peer: &str) {
        self.uid_failures.lock().unwrap().insert(peer.to_owned());
    }

    pub fn fail_updates(&self, fail: bool) {
        *self.fail_updates.lock().unwrap() = fail;
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.updates.lock().unwrap().clone()
    }
}

#[async_trait]
impl PolicyBus for TestBus {
    fn unique_name(&self) -> &str {
        &self.unique_name
    }

    async fn peer_security_context(&self, peer: &str) -> Result<Vec<u8>, BusError> {
        if self.label_failures.lock().unwrap().contains(peer) {
            return Err(BusError::transport("label lookup failed"));
        }
        Ok(self
            .labels
            .lock()
            .unwrap()
            .get(peer)
            .cloned()
            .unwrap_or_default())
    }

    async fn peer_user_id(&self, peer: &str) -> Result<u32, BusError> {
        if self.uid_failures.lock().unwrap().contains(peer) {
            return Err(BusError::transport("uid lookup failed"));
        }
        self.uids
            .lock()
            .unwrap()
            .get(peer)
            .copied()
            .ok_or_else(|| BusError::protocol("unknown peer"))
    }

    fn watch_disconnect(&self, peer: &str) {
        self.watches.lock().unwrap().push(peer.to_owned());
    }

    async fn send_update(
        &self,
        agent_owner: &str,
        notify_path: &str,
        app_owner: &str,
        policy: &WireValue,
    ) -> Result<(), BusError> {
        if *self.fail_updates.lock().unwrap() {
            return Err(BusError::transport("agent unreachable"));
        }
        self.updates.lock().unwrap().push(Delivery {
            agent_owner: agent_owner.to_owned(),
            notify_path: notify_path.to_owned(),
            app_owner: app_owner.to_owned(),
            policy: policy.clone(),
        });
        Ok(())
    }
}

/// Account table with a handful of fixed entries.
pub struct StaticAccounts {
    users: HashMap<u32, UserAccount>,
    groups: HashMap<u32, String>,
}

impl StaticAccounts {
    pub fn new() -> Self {
        let mut users = HashMap::new();
        users.insert(
            1000,
            UserAccount {
                name: "alice".to_owned(),
                primary_gid: 2000,
            },
        );
        users.insert(
            1001,
            UserAccount {
                name: "bob".to_owned(),
                primary_gid: 2000,
            },
        );
        let mut groups = HashMap::new();
        groups.insert(2000, "eng".to_owned());
        Self { users, groups }
    }
}

impl AccountDirectory for StaticAccounts {
    fn user_by_uid(&self, uid: u32) -> Option<UserAccount> {
        self.users.get(&uid).cloned()
    }

    fn group_name(&self, gid: u32) -> Option<String> {
        self.groups.get(&gid).cloned()
    }
}

/// Replays canned fetch results in order; an exhausted queue fails.
#[derive(Default)]
pub struct QueuedSource {
    responses: Mutex<VecDeque<Result<String, String>>>,
}

impl QueuedSource {
    pub fn push_ok(&self, payload: &str) {
        self.responses
            .lock()
            .unwrap()
            .push_back(Ok(payload.to_owned()));
    }

    pub fn push_err(&self, message: &str) {
        self.responses
            .lock()
            .unwrap()
            .push_back(Err(message.to_owned()));
    }
}

#[async_trait]
impl PolicySource for QueuedSource {
    async fn fetch(&self) -> Result<String, SyncError> {
        match self.responses.lock().unwrap().pop_front() {
            Some(Ok(payload)) => Ok(payload),
            Some(Err(message)) => Err(SyncError::Fetch { message }),
            None => Err(SyncError::Fetch {
                message: "no response queued".to_owned(),
            }),
        }
    }
}

/// A fully wired daemon over test doubles and a temporary storage layout.
pub struct TestDaemon {
    pub service: PolicyService,
    pub bus: Arc<TestBus>,
    pub source: Arc<QueuedSource>,
    pub storage: PolicyStorage,
    // Held for the lifetime of the daemon so the layout stays on disk.
    _dir: TempDir,
}

impl TestDaemon {
    pub fn engine(&self) -> &Arc<PolicyEngine> {
        self.service.engine()
    }
}

pub struct TestDaemonBuilder {
    unique_name: String,
    default_policy: String,
    self_policy: String,
    synced: Vec<String>,
    staleness: Duration,
}

impl TestDaemonBuilder {
    pub fn default_policy(mut self, json: &str) -> Self {
        self.default_policy = json.to_owned();
        self
    }

    pub fn synced_policy(mut self, json: &str) -> Self {
        self.synced.push(json.to_owned());
        self
    }

    pub fn staleness(mut self, staleness: Duration) -> Self {
        self.staleness = staleness;
        self
    }

    pub fn build(self) -> TestDaemon {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = StorageConfig {
            dir: dir.path().to_owned(),
            policy_dir: None,
            default_policy: None,
            self_policy: None,
        };
        let storage = PolicyStorage::new(&config);
        storage.ensure_policy_dir().expect("policy dir");

        std::fs::write(config.default_policy_path(), &self.default_policy)
            .expect("default policy");
        std::fs::write(config.self_policy_path(), &self.self_policy).expect("self policy");
        for (index, json) in self.synced.iter().enumerate() {
            std::fs::write(storage.policy_dir().join(format!("{index}.policy")), json)
                .expect("synced policy");
        }

        let store = PolicyStore::load(&storage).expect("store loads");
        let bus = Arc::new(TestBus::new(&self.unique_name));
        let source = Arc::new(QueuedSource::default());
        let engine = Arc::new(PolicyEngine::new(
            bus.clone(),
            source.clone(),
            Arc::new(StaticAccounts::new()),
            storage.clone(),
            self.staleness,
            store,
        ));

        TestDaemon {
            service: PolicyService::new(engine),
            bus,
            source,
            storage,
            _dir: dir,
        }
    }
}

/// Starts a builder with an empty-id default policy, a self policy and a
/// generous staleness threshold (tests opt into staleness explicitly).
pub fn daemon() -> TestDaemonBuilder {
    TestDaemonBuilder {
        unique_name: ":1.0".to_owned(),
        default_policy: r#"{"Id": "", "RoamingPolicy": "forbidden"}"#.to_owned(),
        self_policy: r#"{"Id": "", "ConnectionType": "internal"}"#.to_owned(),
        synced: Vec::new(),
        staleness: Duration::from_secs(3600),
    }
}
