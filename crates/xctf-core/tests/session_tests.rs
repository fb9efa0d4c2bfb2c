mod common;

use xctf_core::firewall::fake::FakeFirewall;
use xctf_core::firewall::Firewall;
use xctf_core::model::PortMappings;
use xctf_core::session::SessionRegistry;

async fn insert_active_sandbox(
    store: &xctf_core::store::Store,
    challenge_id: i64,
    user_id: i64,
    port: i32,
) -> xctf_core::model::Sandbox {
    let mut tx = store.begin().await.unwrap();
    let sandbox = store
        .insert_sandbox(&mut tx, "container-id", port, challenge_id, Some(user_id), &PortMappings::default())
        .await
        .unwrap();
    tx.commit().await.unwrap();
    sandbox
}

#[tokio::test(flavor = "multi_thread")]
async fn login_from_new_ip_remaps_sandbox_firewall_mappings() {
    let db = common::test_store().await;
    let challenge = common::insert_challenge(&db.store, "handoff-chal", false, true).await;
    let user = common::insert_user(&db.store, "handoff-user").await;

    let firewall = FakeFirewall::new();
    firewall.add_port_ip_mapping(40100, "10.0.0.1").await.unwrap();
    insert_active_sandbox(&db.store, challenge.id, user.id, 40100).await;

    let registry = SessionRegistry::new(db.store.clone(), firewall, 3600);
    registry.login(user.id, "10.0.0.1").await.expect("first login failed");

    let outcome = registry
        .login(user.id, "10.0.0.2")
        .await
        .expect("second login failed");
    assert_eq!(outcome.migrated_sandboxes, 1);
    assert_eq!(outcome.session.ip_address, "10.0.0.2");

    let sessions_for_user = db.store.find_active_session_for_user(user.id).await.unwrap();
    assert_eq!(sessions_for_user.unwrap().id, outcome.session.id);
}

#[tokio::test(flavor = "multi_thread")]
async fn force_logout_banned_drops_session_and_mappings() {
    let db = common::test_store().await;
    let challenge = common::insert_challenge(&db.store, "ban-chal", false, true).await;
    let user = common::insert_user(&db.store, "ban-user").await;
    insert_active_sandbox(&db.store, challenge.id, user.id, 40200).await;

    let firewall = FakeFirewall::new();
    let registry = SessionRegistry::new(db.store.clone(), firewall, 3600);
    registry.login(user.id, "10.0.0.9").await.expect("login failed");

    registry.force_logout_banned(user.id).await.expect("force_logout_banned failed");

    let remaining = db.store.find_active_session_for_user(user.id).await.unwrap();
    assert!(remaining.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn reap_expired_deactivates_only_past_expiry() {
    let db = common::test_store().await;
    let user = common::insert_user(&db.store, "reap-user").await;

    let firewall = FakeFirewall::new();
    let registry = SessionRegistry::new(db.store.clone(), firewall, 0);
    registry.login(user.id, "10.0.0.1").await.expect("login failed");

    // session_ttl_secs = 0 means it expires immediately.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let reaped = registry.reap_expired().await.expect("reap_expired failed");
    assert_eq!(reaped, 1);

    let remaining = db.store.find_active_session_for_user(user.id).await.unwrap();
    assert!(remaining.is_none());
}
