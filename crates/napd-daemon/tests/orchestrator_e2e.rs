//! End-to-end orchestration tests over stub collaborators.
//!
//! These drive the full request chain through the service layer: self
//! check, freshness check and resync, identity resolution, subscription,
//! active-policy selection and the reply, plus the disconnect-driven
//! cleanup and the push cycle.

mod common;

use std::time::Duration;

use napd_core::codec::{decode, WireValue};
use napd_daemon::service::{ServiceReply, ServiceRequest};
use serde_json::json;

use common::daemon;

const AGENT: &str = ":1.10";
const APP: &str = ":1.20";

fn get_policy(app_owner: &str) -> ServiceRequest {
    ServiceRequest::GetPolicyConfig {
        app_owner: app_owner.to_owned(),
    }
}

fn reply_json(reply: &ServiceReply) -> serde_json::Value {
    match reply {
        ServiceReply::PolicyConfig(wire) => decode(wire),
        other => panic!("expected a policy reply, got {other:?}"),
    }
}

#[tokio::test]
async fn self_query_short_circuits_to_self_policy() {
    let daemon = daemon().build();
    // Identity lookups would fail loudly if the self check did not short
    // circuit before them.
    daemon.bus.fail_label_for(":1.0");
    daemon.bus.fail_uid_for(":1.0");

    let reply = daemon.service.dispatch(AGENT, get_policy(":1.0")).await;
    let policy = reply_json(&reply);
    assert_eq!(policy["ConnectionType"], json!("internal"));

    // No subscription is installed for the daemon itself.
    let apps = daemon.engine().with_registry(|r| r.app_count()).await;
    assert_eq!(apps, 0);
}

#[tokio::test]
async fn group_policy_wins_when_nothing_better_matches() {
    let daemon = daemon()
        .synced_policy(r#"{"Id": "group:eng", "RoamingPolicy": "national"}"#)
        .build();
    daemon.bus.set_label(APP, "system_u:object_r:navi_t:s0");
    daemon.bus.set_uid(APP, 1000);

    let reply = daemon.service.dispatch(AGENT, get_policy(APP)).await;
    let policy = reply_json(&reply);
    assert_eq!(policy["Id"], json!("group:eng"));
    assert_eq!(policy["RoamingPolicy"], json!("national"));

    // The app is registered under all three tokens for future pushes.
    let tokens = daemon
        .engine()
        .with_registry(|r| {
            r.app(":1.10/:1.20")
                .expect("app registered")
                .tokens()
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
        })
        .await;
    assert_eq!(tokens, ["selinux:navi_t", "user:alice", "group:eng"]);

    // Both the app and (implicitly) its disconnect watch exist.
    assert!(daemon.bus.watches.lock().unwrap().contains(&APP.to_owned()));
}

#[tokio::test]
async fn selinux_policy_outranks_user_and_group() {
    let daemon = daemon()
        .synced_policy(r#"{"Id": "selinux:navi_t", "Rank": "label"}"#)
        .synced_policy(r#"{"Id": "user:alice", "Rank": "user"}"#)
        .synced_policy(r#"{"Id": "group:eng", "Rank": "group"}"#)
        .build();
    daemon.bus.set_label(APP, "system_u:object_r:navi_t:s0");
    daemon.bus.set_uid(APP, 1000);

    let reply = daemon.service.dispatch(AGENT, get_policy(APP)).await;
    assert_eq!(reply_json(&reply)["Rank"], json!("label"));
}

#[tokio::test]
async fn default_policy_is_retitled_to_the_user_token() {
    let daemon = daemon().build();
    daemon.bus.set_uid(APP, 1000);

    let reply = daemon.service.dispatch(AGENT, get_policy(APP)).await;
    let policy = reply_json(&reply);
    // The caller sees the default policy named after itself.
    assert_eq!(policy["Id"], json!("user:alice"));
    assert_eq!(policy["RoamingPolicy"], json!("forbidden"));

    // The store's default policy is permanently retitled.
    let default_id = daemon
        .engine()
        .with_store(|s| s.default_policy().id().to_owned())
        .await;
    assert_eq!(default_id, "user:alice");

    // A different caller later on does not rename it again.
    daemon.bus.set_uid(":1.30", 1001);
    let reply = daemon.service.dispatch(AGENT, get_policy(":1.30")).await;
    assert_eq!(reply_json(&reply)["Id"], json!("user:alice"));
}

#[tokio::test]
async fn label_lookup_failure_is_tolerated() {
    let daemon = daemon()
        .synced_policy(r#"{"Id": "user:alice", "Rank": "user"}"#)
        .build();
    daemon.bus.fail_label_for(APP);
    daemon.bus.set_uid(APP, 1000);

    let reply = daemon.service.dispatch(AGENT, get_policy(APP)).await;
    assert_eq!(reply_json(&reply)["Rank"], json!("user"));

    // Only user and group tokens were subscribed.
    let tokens = daemon
        .engine()
        .with_registry(|r| r.app(":1.10/:1.20").expect("app registered").tokens().len())
        .await;
    assert_eq!(tokens, 2);
}

#[tokio::test]
async fn user_lookup_failure_fails_the_request() {
    let daemon = daemon().build();
    daemon.bus.fail_uid_for(APP);

    let reply = daemon.service.dispatch(AGENT, get_policy(APP)).await;
    assert!(matches!(reply, ServiceReply::Error { .. }));

    // Nothing was subscribed for the failed request.
    let apps = daemon.engine().with_registry(|r| r.app_count()).await;
    assert_eq!(apps, 0);
}

#[tokio::test]
async fn stale_storage_resyncs_and_pushes_to_subscribed_apps() {
    let daemon = daemon()
        .synced_policy(r#"{"Id": "user:alice", "Rank": "old"}"#)
        .staleness(Duration::from_secs(1))
        .build();
    daemon.bus.set_uid(APP, 1000);
    daemon.bus.set_uid(":1.30", 1001);

    // Register the agent and subscribe the first app while fresh.
    let reply = daemon
        .service
        .dispatch(AGENT, ServiceRequest::RegisterAgent {
            notify_path: "/agent/1".to_owned(),
        })
        .await;
    assert_eq!(reply, ServiceReply::Ack);
    let reply = daemon.service.dispatch(AGENT, get_policy(APP)).await;
    assert_eq!(reply_json(&reply)["Rank"], json!("old"));

    // Let the storage go stale, then serve another request with a new
    // policy set queued on the remote source.
    std::thread::sleep(Duration::from_millis(1300));
    daemon
        .source
        .push_ok(r#"[{"Id": "user:alice", "Rank": "new"}, {"Id": "user:bob", "Rank": "new"}]"#);

    let reply = daemon.service.dispatch(AGENT, get_policy(":1.30")).await;
    assert_eq!(reply_json(&reply)["Rank"], json!("new"));

    // The resync pushed the changed policy to the already-subscribed app.
    let deliveries = daemon.bus.deliveries();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].agent_owner, AGENT);
    assert_eq!(deliveries[0].notify_path, "/agent/1");
    assert_eq!(deliveries[0].app_owner, APP);
    assert_eq!(decode(&deliveries[0].policy)["Rank"], json!("new"));

    // And the new set was persisted.
    let on_disk = daemon.storage.load_documents().expect("load");
    assert_eq!(on_disk.len(), 2);
}

#[tokio::test]
async fn failed_resync_aborts_the_request() {
    let daemon = daemon()
        .synced_policy(r#"{"Id": "user:alice", "Rank": "old"}"#)
        .staleness(Duration::from_millis(50))
        .build();
    daemon.bus.set_uid(APP, 1000);
    std::thread::sleep(Duration::from_millis(150));
    daemon.source.push_err("connection refused");

    let reply = daemon.service.dispatch(AGENT, get_policy(APP)).await;
    assert!(matches!(reply, ServiceReply::Error { .. }));

    // The request never fell back to resolving against stale data: no
    // subscription was installed.
    let apps = daemon.engine().with_registry(|r| r.app_count()).await;
    assert_eq!(apps, 0);

    // The previously persisted set is untouched.
    let on_disk = daemon.storage.load_documents().expect("load");
    assert_eq!(on_disk, vec![json!({"Id": "user:alice", "Rank": "old"})]);
}

#[tokio::test]
async fn push_failure_during_resync_does_not_fail_the_request() {
    let daemon = daemon()
        .synced_policy(r#"{"Id": "user:alice", "Rank": "old"}"#)
        .staleness(Duration::from_secs(1))
        .build();
    daemon.bus.set_uid(APP, 1000);
    daemon.bus.set_uid(":1.30", 1000);

    daemon
        .service
        .dispatch(AGENT, ServiceRequest::RegisterAgent {
            notify_path: "/agent/1".to_owned(),
        })
        .await;
    daemon.service.dispatch(AGENT, get_policy(APP)).await;

    std::thread::sleep(Duration::from_millis(1300));
    daemon
        .source
        .push_ok(r#"[{"Id": "user:alice", "Rank": "new"}]"#);
    daemon.bus.fail_updates(true);

    // Delivery to the already-subscribed app fails, but the triggering
    // request still resolves against the freshly synced set.
    let reply = daemon.service.dispatch(AGENT, get_policy(":1.30")).await;
    assert_eq!(reply_json(&reply)["Rank"], json!("new"));

    // Nothing was delivered; the first app stays pending for the next
    // push cycle.
    assert!(daemon.bus.deliveries().is_empty());
    let pending = daemon
        .engine()
        .with_registry(|r| r.pending().to_vec())
        .await;
    assert_eq!(pending, [":1.10/:1.20"]);
}

#[tokio::test]
async fn agent_disconnect_removes_only_its_apps() {
    let daemon = daemon().build();
    for (peer, uid) in [(":1.20", 1000), (":1.21", 1000), (":1.30", 1001)] {
        daemon.bus.set_uid(peer, uid);
    }

    daemon
        .service
        .dispatch(":1.10", ServiceRequest::RegisterAgent {
            notify_path: "/agent/a".to_owned(),
        })
        .await;
    daemon
        .service
        .dispatch(":1.11", ServiceRequest::RegisterAgent {
            notify_path: "/agent/b".to_owned(),
        })
        .await;

    daemon.service.dispatch(":1.10", get_policy(":1.20")).await;
    daemon.service.dispatch(":1.10", get_policy(":1.21")).await;
    daemon.service.dispatch(":1.11", get_policy(":1.30")).await;

    let apps = daemon.engine().with_registry(|r| r.app_count()).await;
    assert_eq!(apps, 3);

    daemon.service.peer_disconnected(":1.10").await;

    let (apps, survivor, agent_a, agent_b) = daemon
        .engine()
        .with_registry(|r| {
            (
                r.app_count(),
                r.app(":1.11/:1.30").map(|a| a.id().to_owned()),
                r.agent_target(":1.10").map(str::to_owned),
                r.agent_target(":1.11").map(str::to_owned),
            )
        })
        .await;
    assert_eq!(apps, 1);
    assert_eq!(survivor.as_deref(), Some(":1.11/:1.30"));
    assert_eq!(agent_a, None);
    assert_eq!(agent_b.as_deref(), Some("/agent/b"));
}

#[tokio::test]
async fn duplicate_agent_registration_is_refused() {
    let daemon = daemon().build();

    let first = daemon
        .service
        .dispatch(AGENT, ServiceRequest::RegisterAgent {
            notify_path: "/agent/1".to_owned(),
        })
        .await;
    assert_eq!(first, ServiceReply::Ack);

    let second = daemon
        .service
        .dispatch(AGENT, ServiceRequest::RegisterAgent {
            notify_path: "/agent/2".to_owned(),
        })
        .await;
    assert!(matches!(second, ServiceReply::Error { .. }));
}

#[tokio::test]
async fn unregister_requires_the_registered_target() {
    let daemon = daemon().build();
    daemon.bus.set_uid(APP, 1000);

    daemon
        .service
        .dispatch(AGENT, ServiceRequest::RegisterAgent {
            notify_path: "/agent/1".to_owned(),
        })
        .await;
    daemon.service.dispatch(AGENT, get_policy(APP)).await;

    let mismatch = daemon
        .service
        .dispatch(AGENT, ServiceRequest::UnregisterAgent {
            notify_path: "/agent/other".to_owned(),
        })
        .await;
    assert!(matches!(mismatch, ServiceReply::Error { .. }));

    let ok = daemon
        .service
        .dispatch(AGENT, ServiceRequest::UnregisterAgent {
            notify_path: "/agent/1".to_owned(),
        })
        .await;
    assert_eq!(ok, ServiceReply::Ack);

    // Unregistering cascades like a disconnect.
    let apps = daemon.engine().with_registry(|r| r.app_count()).await;
    assert_eq!(apps, 0);
}

#[tokio::test]
async fn resubscription_is_idempotent_across_requests() {
    let daemon = daemon().build();
    daemon.bus.set_uid(APP, 1000);

    daemon.service.dispatch(AGENT, get_policy(APP)).await;
    daemon.service.dispatch(AGENT, get_policy(APP)).await;

    let apps = daemon.engine().with_registry(|r| r.app_count()).await;
    assert_eq!(apps, 1);
}

#[tokio::test]
async fn explicit_trigger_resyncs_without_a_request() {
    let daemon = daemon().build();
    daemon.source.push_ok(r#"[{"Id": "group:eng"}]"#);

    daemon.service.trigger_resync().await;

    let loaded = daemon.engine().with_store(|s| s.get("group:eng").is_some()).await;
    assert!(loaded);
    assert_eq!(daemon.storage.load_documents().expect("load").len(), 1);
}

#[tokio::test]
async fn reply_is_wire_encoded() {
    let daemon = daemon()
        .synced_policy(r#"{"Id": "user:alice", "AllowedBearers": ["wifi", "cellular"]}"#)
        .build();
    daemon.bus.set_uid(APP, 1000);

    let reply = daemon.service.dispatch(AGENT, get_policy(APP)).await;
    let ServiceReply::PolicyConfig(wire) = reply else {
        panic!("expected policy reply");
    };

    // The top level is an ordered dict with variant-wrapped values.
    let WireValue::Dict(entries) = &wire else {
        panic!("expected dict, got {wire:?}");
    };
    assert_eq!(entries[0].0, "Id");
    assert!(matches!(entries[0].1, WireValue::Variant(_)));
}
