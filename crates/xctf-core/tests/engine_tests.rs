mod common;

use std::collections::HashMap;
use std::time::Duration;

use xctf_core::engine::SandboxEngine;
use xctf_core::firewall::fake::FakeFirewall;
use xctf_core::lock::DistributedMutex;
use xctf_core::runtime::fake::FakeRuntime;
use xctf_core::volume::fake::FakeVolumes;

fn engine(
    store: xctf_core::store::Store,
    mutex: DistributedMutex,
) -> SandboxEngine<FakeVolumes, FakeRuntime, FakeFirewall> {
    let mut host_ports = HashMap::new();
    host_ports.insert(8000u16, 40000u16);
    SandboxEngine::new(
        store,
        mutex,
        FakeVolumes::new(std::env::temp_dir().join("xctf-engine-tests")),
        FakeRuntime::new(host_ports),
        FakeFirewall::new(),
        Duration::from_secs(5),
        Duration::from_secs(5),
    )
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_get_or_create_dedupes_per_user_sandbox() {
    let db = common::test_store().await;
    let lock = common::test_mutex().await;
    let challenge = common::insert_challenge(&db.store, "concurrent-sb1", false, true).await;
    let user = common::insert_user(&db.store, "sb1-user").await;

    let engine = engine(db.store.clone(), lock.mutex.clone());

    let (a, b) = tokio::join!(
        engine.get_or_create_sandbox(&challenge, Some(user.id), Some("10.0.0.1")),
        engine.get_or_create_sandbox(&challenge, Some(user.id), Some("10.0.0.1")),
    );
    let a = a.expect("first get_or_create_sandbox failed");
    let b = b.expect("second get_or_create_sandbox failed");

    assert_eq!(a.id, b.id, "SB-1: concurrent requests must dedupe to one sandbox");
    assert_eq!(a.user_id, Some(user.id));

    let active = db
        .store
        .find_active_sandbox(challenge.id, Some(user.id))
        .await
        .unwrap();
    assert!(active.is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn static_challenge_sandbox_is_shared_across_users() {
    let db = common::test_store().await;
    let lock = common::test_mutex().await;
    let challenge = common::insert_challenge(&db.store, "static-sb2", true, true).await;
    let alice = common::insert_user(&db.store, "sb2-alice").await;
    let bob = common::insert_user(&db.store, "sb2-bob").await;

    let engine = engine(db.store.clone(), lock.mutex.clone());

    let a = engine
        .get_or_create_sandbox(&challenge, Some(alice.id), Some("10.0.0.1"))
        .await
        .expect("alice's get_or_create_sandbox failed");
    let b = engine
        .get_or_create_sandbox(&challenge, Some(bob.id), Some("10.0.0.2"))
        .await
        .expect("bob's get_or_create_sandbox failed");

    assert_eq!(a.id, b.id, "SB-2: static challenges share a single sandbox");
    assert_eq!(a.user_id, None);
}

#[tokio::test(flavor = "multi_thread")]
async fn destroy_sandbox_tears_down_firewall_and_marks_row_inactive() {
    let db = common::test_store().await;
    let lock = common::test_mutex().await;
    let challenge = common::insert_challenge(&db.store, "destroy-me", false, true).await;
    let user = common::insert_user(&db.store, "destroy-user").await;

    let engine = engine(db.store.clone(), lock.mutex.clone());
    let sandbox = engine
        .get_or_create_sandbox(&challenge, Some(user.id), Some("10.0.0.5"))
        .await
        .expect("get_or_create_sandbox failed");

    engine.destroy_sandbox(&sandbox).await.expect("destroy_sandbox failed");

    let active = db
        .store
        .find_active_sandbox(challenge.id, Some(user.id))
        .await
        .unwrap();
    assert!(active.is_none(), "destroyed sandbox must no longer be active");
}

#[tokio::test(flavor = "multi_thread")]
async fn submit_flag_is_idempotent_once_solved() {
    let db = common::test_store().await;
    let lock = common::test_mutex().await;
    let challenge = common::insert_challenge(&db.store, "flag-chal", false, true).await;
    let user = common::insert_user(&db.store, "flag-user").await;

    let engine = engine(db.store.clone(), lock.mutex.clone());

    let wrong = engine.submit_flag(user.id, challenge.id, "wrong").await.unwrap();
    assert!(!wrong);

    let correct = engine.submit_flag(user.id, challenge.id, "flag{test}").await.unwrap();
    assert!(correct);

    // already solved: a further submission, even a correct one, reports false
    // rather than a different status (spec.md's "no oracle for enumeration").
    let repeat = engine.submit_flag(user.id, challenge.id, "flag{test}").await.unwrap();
    assert!(!repeat);

    assert!(engine.check_user_solved_challenge(user.id, challenge.id).await.unwrap());
}
