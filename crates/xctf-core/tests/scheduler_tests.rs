mod common;

use std::collections::HashMap;
use std::time::Duration;

use xctf_core::engine::SandboxEngine;
use xctf_core::firewall::fake::FakeFirewall;
use xctf_core::firewall::Firewall;
use xctf_core::lock::DistributedMutex;
use xctf_core::notify::Notifier;
use xctf_core::runtime::fake::FakeRuntime;
use xctf_core::scheduler::Scheduler;
use xctf_core::session::SessionRegistry;
use xctf_core::volume::fake::FakeVolumes;

fn engine(
    store: xctf_core::store::Store,
    mutex: DistributedMutex,
    firewall: FakeFirewall,
) -> SandboxEngine<FakeVolumes, FakeRuntime, FakeFirewall> {
    let mut host_ports = HashMap::new();
    host_ports.insert(8000u16, 41000u16);
    SandboxEngine::new(
        store,
        mutex,
        FakeVolumes::new(std::env::temp_dir().join("xctf-scheduler-tests")),
        FakeRuntime::new(host_ports),
        firewall,
        Duration::from_secs(5),
        Duration::from_secs(5),
    )
}

#[tokio::test(flavor = "multi_thread")]
async fn reap_non_static_sandboxes_collects_past_lifetime() {
    let db = common::test_store().await;
    let lock = common::test_mutex().await;
    let challenge = common::insert_challenge(&db.store, "reap-chal", false, true).await;
    let user = common::insert_user(&db.store, "reap-user").await;

    let firewall = FakeFirewall::new();
    let eng = engine(db.store.clone(), lock.mutex.clone(), firewall.clone());

    eng.get_or_create_sandbox(&challenge, Some(user.id), Some("10.0.0.1"))
        .await
        .expect("get_or_create_sandbox failed");

    let sessions = SessionRegistry::new(db.store.clone(), firewall.clone(), 3600);
    let notifier = Notifier::new("redis://127.0.0.1:1/0", db.store.clone()).unwrap();
    // max_lifetime_secs = 0 means every active non-static sandbox is reapable immediately.
    let scheduler = Scheduler::new(db.store.clone(), eng, firewall.clone(), sessions, notifier, 0);

    let reaped = scheduler.reap_non_static_sandboxes().await.expect("reap_non_static_sandboxes failed");
    assert_eq!(reaped, 1);

    let active = db.store.find_active_sandbox(challenge.id, Some(user.id)).await.unwrap();
    assert!(active.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn clean_orphan_firewall_ports_removes_ports_with_no_active_sandbox() {
    let db = common::test_store().await;
    let lock = common::test_mutex().await;
    let challenge = common::insert_challenge(&db.store, "orphan-chal", false, true).await;
    let user = common::insert_user(&db.store, "orphan-user").await;

    let firewall = FakeFirewall::new();
    firewall.add_port_ip_mapping(50555, "10.0.0.1").await.unwrap();

    let eng = engine(db.store.clone(), lock.mutex.clone(), firewall.clone());
    eng.get_or_create_sandbox(&challenge, Some(user.id), Some("10.0.0.1"))
        .await
        .expect("get_or_create_sandbox failed");

    let sessions = SessionRegistry::new(db.store.clone(), firewall.clone(), 3600);
    let notifier = Notifier::new("redis://127.0.0.1:1/0", db.store.clone()).unwrap();
    let scheduler = Scheduler::new(db.store.clone(), eng, firewall.clone(), sessions, notifier, 7200);

    let cleaned = scheduler
        .clean_orphan_firewall_ports()
        .await
        .expect("clean_orphan_firewall_ports failed");
    assert_eq!(cleaned, 1, "port 50555 has no backing sandbox and must be swept");

    assert!(!firewall.sandbox_ports().contains(&50555));
}

#[tokio::test(flavor = "multi_thread")]
async fn refresh_sandboxes_skips_inactive_challenge() {
    let db = common::test_store().await;
    let lock = common::test_mutex().await;
    let challenge = common::insert_challenge(&db.store, "refresh-inactive", false, false).await;

    let firewall = FakeFirewall::new();
    let eng = engine(db.store.clone(), lock.mutex.clone(), firewall.clone());
    let sessions = SessionRegistry::new(db.store.clone(), firewall.clone(), 3600);
    let notifier = Notifier::new("redis://127.0.0.1:1/0", db.store.clone()).unwrap();
    let scheduler = Scheduler::new(db.store.clone(), eng, firewall.clone(), sessions, notifier, 7200);

    let refreshed = scheduler
        .refresh_sandboxes(&challenge.name)
        .await
        .expect("refresh_sandboxes failed");
    assert_eq!(refreshed, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn rebuild_firewall_from_state_reopens_persisted_mappings() {
    let db = common::test_store().await;
    let lock = common::test_mutex().await;
    let challenge = common::insert_challenge(&db.store, "rebuild-chal", false, true).await;
    let user = common::insert_user(&db.store, "rebuild-user").await;

    let firewall = FakeFirewall::new();
    let eng = engine(db.store.clone(), lock.mutex.clone(), firewall.clone());
    eng.get_or_create_sandbox(&challenge, Some(user.id), Some("10.0.0.7"))
        .await
        .expect("get_or_create_sandbox failed");

    // Simulate a cold restart: a fresh firewall with none of the mappings above.
    let fresh_firewall = FakeFirewall::new();
    let sessions = SessionRegistry::new(db.store.clone(), fresh_firewall.clone(), 3600);
    let notifier = Notifier::new("redis://127.0.0.1:1/0", db.store.clone()).unwrap();
    let scheduler = Scheduler::new(
        db.store.clone(),
        engine(db.store.clone(), lock.mutex.clone(), fresh_firewall.clone()),
        fresh_firewall.clone(),
        sessions,
        notifier,
        7200,
    );

    scheduler.rebuild_firewall_from_state().await.expect("rebuild_firewall_from_state failed");

    let active = db.store.find_active_sandbox(challenge.id, Some(user.id)).await.unwrap().unwrap();
    for port in active.all_ports() {
        assert!(fresh_firewall.has_mapping(port as u16, "10.0.0.7"));
    }
}

