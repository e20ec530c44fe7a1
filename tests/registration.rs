use std::time::Duration;

use common::Endpoint;
use ntest::timeout;
use register::{
    CoordinationStore, LeaseEnd, LeaseRegister, MemoryStore, MockCoordinationStore, RegisterError,
    RegisterSettings, RegistrationState, StoreError, service_prefix,
};

const KEY: &str = "/discovery/orders/10.0.0.5:18080";

fn settings() -> RegisterSettings {
    RegisterSettings {
        base_path: "/discovery".to_string(),
        service_name: "orders".to_string(),
        ttl: Duration::from_secs(5),
        default_timeout: Duration::from_secs(10),
        revoke_on_publish_failure: false,
    }
}

fn endpoint() -> Endpoint {
    Endpoint::new("10.0.0.5", 18080)
}

#[tokio::test(start_paused = true)]
async fn test_entry_disappears_after_ttl_without_renewal() {
    let store = MemoryStore::new();
    let mut register = LeaseRegister::new(store.clone(), settings(), Some(endpoint()));

    register.register().await.expect("registration should succeed");
    assert_eq!(register.key().as_deref(), Some(KEY));

    let value = store.get(KEY).await.expect("endpoint should be published");
    let published: serde_json::Value = serde_json::from_str(&value).unwrap();
    assert_eq!(published["ip"], "10.0.0.5");
    assert_eq!(published["port"], 18080);

    let lease_id = register.lease_id().unwrap();
    assert!(store.is_lease_active(lease_id).await);
    let listener = register.spawn_listener().unwrap();

    // Renewals keep the entry alive well past the TTL
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert!(store.get(KEY).await.is_some());

    // Without renewals the entry is gone once the TTL elapses
    store.sever_renewals().await;
    assert_eq!(listener.await.unwrap(), LeaseEnd::ConnectionLost);
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(store.get(KEY).await.is_none());
    assert!(!store.is_lease_active(lease_id).await);
    assert_eq!(register.state(), RegistrationState::ConnectionLost);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_removes_entry_and_stops_listener() {
    let store = MemoryStore::new();
    let mut register = LeaseRegister::new(store.clone(), settings(), Some(endpoint()));
    register.register().await.unwrap();
    let listener = register.spawn_listener().unwrap();

    tokio::time::sleep(Duration::from_secs(3)).await;
    register.close().await.expect("close should succeed");

    assert_eq!(listener.await.unwrap(), LeaseEnd::Revoked);
    assert_eq!(register.state(), RegistrationState::Revoked);
    assert!(store.get(KEY).await.is_none());
    assert!(store.is_closed().await);
}

#[tokio::test]
#[timeout(10000)]
async fn test_instances_of_one_service_register_side_by_side() {
    let store = MemoryStore::new();
    let mut first = LeaseRegister::new(store.clone(), settings(), Some(endpoint()));
    let mut second = LeaseRegister::new(
        store.clone(),
        settings(),
        Some(Endpoint::new("10.0.0.6", 18080).with_stage("canary")),
    );

    first.register().await.unwrap();
    second.register().await.unwrap();
    assert_ne!(first.lease_id(), second.lease_id());

    let prefix = service_prefix("/discovery", "orders");
    let keys = store.keys_with_prefix(&prefix).await;
    assert_eq!(
        keys,
        vec![
            "/discovery/orders/10.0.0.5:18080".to_string(),
            "/discovery/orders/10.0.0.6:18080".to_string(),
        ]
    );

    // Revoking one instance leaves the other in place
    store.revoke(first.lease_id().unwrap()).await.unwrap();
    let keys = store.keys_with_prefix(&prefix).await;
    assert_eq!(keys, vec!["/discovery/orders/10.0.0.6:18080".to_string()]);
}

#[tokio::test]
async fn test_nested_service_name_stays_one_level() {
    let store = MemoryStore::new();
    let mut settings = settings();
    settings.service_name = "team/orders".to_string();
    let mut register = LeaseRegister::new(store.clone(), settings, Some(endpoint()));

    register.register().await.unwrap();
    assert!(store.get("/discovery/team-orders/10.0.0.5:18080").await.is_some());
    assert!(store.keys_with_prefix("/discovery/team/").await.is_empty());
}

#[tokio::test]
async fn test_closed_store_fails_registration() {
    let store = MemoryStore::new();
    store.close().await.unwrap();
    let mut register = LeaseRegister::new(store, settings(), Some(endpoint()));

    let err = register.register().await.unwrap_err();
    assert!(matches!(err, RegisterError::Store(StoreError::Closed)));
    assert_eq!(register.state(), RegistrationState::Unregistered);
}

#[tokio::test]
async fn test_invalid_configuration_never_reaches_the_store() {
    let mut empty_base = settings();
    empty_base.base_path = String::new();

    for (settings, endpoint) in [(empty_base, Some(endpoint())), (settings(), None)] {
        // Any store call on an expectation-free mock panics
        let mut register = LeaseRegister::new(MockCoordinationStore::new(), settings, endpoint);
        assert!(matches!(
            register.register().await,
            Err(RegisterError::Configuration(_))
        ));
        assert!(matches!(
            register.spawn_listener(),
            Err(RegisterError::NotRegistered)
        ));
    }
}

#[tokio::test(start_paused = true)]
async fn test_lease_stays_alive_without_listener() {
    let store = MemoryStore::new();
    let mut register = LeaseRegister::new(store.clone(), settings(), Some(endpoint()));
    register.register().await.unwrap();
    let lease_id = register.lease_id().unwrap();

    // Nobody reads the renewal stream for ten TTLs
    tokio::time::sleep(Duration::from_secs(50)).await;
    assert!(store.is_lease_active(lease_id).await);
    assert!(store.get(KEY).await.is_some());
    assert_eq!(register.state(), RegistrationState::Renewing);

    // A late listener still observes the lease
    let listener = register.spawn_listener().unwrap();
    register.close().await.unwrap();
    assert_eq!(listener.await.unwrap(), LeaseEnd::Revoked);
}
