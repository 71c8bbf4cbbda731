//! napd-daemon - Network Access Policy Daemon.
//!
//! The daemon decides, per requesting application, which network-access
//! policy applies, based on the caller's security identity (mandatory-
//! access-control label, user, group), and keeps the registered agent
//! processes informed when that policy changes.
//!
//! # Modules
//!
//! - [`bus`]: transport collaborator seam and its error taxonomy
//! - [`identity`]: identity resolution (bus lookups, account database)
//! - [`storage`]: persisted policy files and the freshness marker
//! - [`store`]: loaded policy set and active-policy selection
//! - [`registry`]: agents, apps, subscriptions and the push cycle
//! - [`sync`]: remote policy source
//! - [`orchestrator`]: the per-request state machine
//! - [`service`]: request dispatch for the transport layer
//!
//! # Concurrency
//!
//! All shared state sits behind one lock inside the engine. Request
//! chains suspend only at the two identity lookups and the remote fetch;
//! every store or registry mutation happens in a straight-line critical
//! section, so no finer-grained locking exists anywhere.

pub mod bus;
pub mod identity;
pub mod orchestrator;
pub mod registry;
pub mod service;
pub mod storage;
pub mod store;
pub mod sync;

pub use bus::{BusError, PolicyBus};
pub use orchestrator::{ConfigFailure, PolicyEngine};
pub use registry::{AgentRegistry, RegistryError};
pub use service::{PolicyService, ServiceReply, ServiceRequest};
pub use storage::{PolicyStorage, StorageError};
pub use store::PolicyStore;
pub use sync::{HttpPolicySource, PolicySource, SyncError};
