//! Key rotation scenario tests against the SQLite store

use chrono::{DateTime, TimeZone, Utc};
use idsrv_keys::{
    init_key_management, KeyError, KeyManagement, KeyManagementOptions, KeyPolicy, KeyStatus,
    KeyStore, KeyTable, ProtectionKey, RotationSchedule, SqliteKeyStore, StoredKey,
};
use std::time::Duration;

fn schedule() -> RotationSchedule {
    RotationSchedule::new(
        KeyPolicy::new(
            Duration::from_secs(20),
            Duration::from_secs(40),
            Duration::from_secs(80),
        ),
        Duration::from_secs(5),
        Duration::from_secs(10),
    )
}

/// Whole-second base so stored timestamps compare exactly
fn base() -> DateTime<Utc> {
    Utc.timestamp_opt(Utc::now().timestamp(), 0).unwrap()
}

fn secs(t0: DateTime<Utc>, s: i64) -> DateTime<Utc> {
    t0 + chrono::Duration::seconds(s)
}

async fn host(connection_string: &str, kek: &ProtectionKey) -> KeyManagement {
    let options =
        KeyManagementOptions::new(connection_string, schedule()).with_protection_key(kek.clone());
    init_key_management(options).await.unwrap()
}

fn status_of(keys: &[idsrv_keys::KeyInfo], id: &str) -> Option<KeyStatus> {
    keys.iter().find(|k| k.id == id).map(|k| k.status)
}

#[tokio::test]
async fn test_key_lifecycle_timeline() {
    let kek = ProtectionKey::generate("kek").unwrap();
    let km = host(":memory:", &kek).await;
    let manager = &km.manager;
    let t0 = base();

    // t=0: nothing stored, K1 generated and pending
    let report = manager.run_cycle(t0).await.unwrap();
    let k1 = report.generated.expect("K1 generated");
    let keys = manager.list_keys(t0).await.unwrap();
    assert_eq!(status_of(&keys, &k1), Some(KeyStatus::Pending));

    // t=25: K1 active and handed out for signing
    let report = manager.run_cycle(secs(t0, 25)).await.unwrap();
    assert!(report.generated.is_none());
    let active = manager.get_active_keys(secs(t0, 25)).await;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].kid(), k1);
    assert_eq!(manager.signing_key(secs(t0, 25)).await.unwrap().kid(), k1);

    // t=40: K1 retired, K2 generated
    let report = manager.run_cycle(secs(t0, 40)).await.unwrap();
    let k2 = report.generated.expect("K2 generated");
    assert_ne!(k1, k2);

    // t=45: K1 validates but does not sign, K2 is still propagating
    manager.run_cycle(secs(t0, 45)).await.unwrap();
    let keys = manager.list_keys(secs(t0, 45)).await.unwrap();
    assert_eq!(status_of(&keys, &k1), Some(KeyStatus::Retired));
    assert_eq!(status_of(&keys, &k2), Some(KeyStatus::Pending));

    let set = manager.get_key_set(secs(t0, 45)).await;
    assert!(set.find(&k1).is_some());
    assert!(matches!(
        set.require_signing_key(),
        Err(KeyError::NoSigningKeyAvailable)
    ));

    // t=60: K2 signs, K1 still verifies what it signed
    let k1_credential = manager.get_key_set(secs(t0, 25)).await.signing_key.unwrap();
    let old_signature = k1_credential.sign(b"token issued at t=25");

    let set = manager.get_key_set(secs(t0, 60)).await;
    assert_eq!(set.require_signing_key().unwrap().kid(), k2);
    assert!(set
        .find(&k1)
        .unwrap()
        .verify(b"token issued at t=25", &old_signature));

    // t=130: K1 expired and purged
    let report = manager.run_cycle(secs(t0, 130)).await.unwrap();
    assert_eq!(report.deleted, vec![k1.clone()]);
    let keys = manager.list_keys(secs(t0, 130)).await.unwrap();
    assert!(status_of(&keys, &k1).is_none());
    assert_eq!(status_of(&keys, &k2), Some(KeyStatus::Retired));
}

#[tokio::test]
async fn test_concurrent_hosts_share_one_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("idsrv.db");
    let path = path.to_str().unwrap();

    let kek = ProtectionKey::generate("kek").unwrap();
    let a = host(path, &kek).await;
    let b = host(path, &kek).await;
    let t0 = base();

    let (ra, rb) = tokio::join!(a.manager.run_cycle(t0), b.manager.run_cycle(t0));
    let (ra, rb) = (ra.unwrap(), rb.unwrap());
    assert!(ra.is_clean(), "host a failures: {:?}", ra.failures);
    assert!(rb.is_clean(), "host b failures: {:?}", rb.failures);

    let stored = a.manager.list_keys(t0).await.unwrap();
    assert!(!stored.is_empty());
    assert!(stored.iter().all(|k| k.status == KeyStatus::Pending));

    // each host can read keys the other one protected
    let later = secs(t0, 25);
    assert_eq!(a.manager.get_active_keys(later).await.len(), stored.len());
    assert_eq!(b.manager.get_active_keys(later).await.len(), stored.len());

    // both hosts pick the same signing key
    assert_eq!(
        a.manager.signing_key(later).await.unwrap().kid(),
        b.manager.signing_key(later).await.unwrap().kid()
    );
}

#[tokio::test]
async fn test_concurrent_purge_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("idsrv.db");
    let path = path.to_str().unwrap();

    let kek = ProtectionKey::generate("kek").unwrap();
    let a = host(path, &kek).await;
    let b = host(path, &kek).await;
    let t0 = base();

    a.manager.run_cycle(t0).await.unwrap();

    let later = secs(t0, 200);
    let (ra, rb) = tokio::join!(a.manager.purge_expired(later), b.manager.purge_expired(later));
    let (ra, rb) = (ra.unwrap(), rb.unwrap());
    assert!(ra.is_clean() && rb.is_clean());
    assert!(a.manager.list_keys(later).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_cache_picks_up_other_host_within_ttl() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("idsrv.db");
    let path = path.to_str().unwrap();

    let kek = ProtectionKey::generate("kek").unwrap();
    let reader = host(path, &kek).await;
    let writer = host(path, &kek).await;
    let t0 = base();

    // reader builds its snapshot before the key exists
    assert!(reader.manager.get_active_keys(secs(t0, -1)).await.is_empty());

    let k1 = writer.manager.run_cycle(t0).await.unwrap().generated.unwrap();

    // snapshot from t=-1 is still within its TTL
    assert!(reader.manager.get_key_set(secs(t0, 5)).await.find(&k1).is_none());

    // by activation + TTL the reader must see the key as active
    let active = reader.manager.get_active_keys(secs(t0, 31)).await;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].kid(), k1);
}

#[tokio::test]
async fn test_delete_twice_matches_delete_once() {
    let store = SqliteKeyStore::open(":memory:", KeyTable::SigningKeys).unwrap();
    store
        .put(&StoredKey::new("a", base(), "dmFsdWU="))
        .await
        .unwrap();
    store
        .put(&StoredKey::new("b", base(), "dmFsdWU="))
        .await
        .unwrap();

    store.delete("a").await.unwrap();
    let once = store.get_all().await.unwrap();

    store.delete("a").await.unwrap();
    let twice = store.get_all().await.unwrap();

    assert_eq!(once, twice);
    assert_eq!(twice.len(), 1);

    store.delete("never-existed").await.unwrap();
}

#[tokio::test]
async fn test_rotated_master_key_keeps_existing_keys_readable() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("idsrv.db");
    let path = path.to_str().unwrap();
    let t0 = base();

    let old_kek = ProtectionKey::generate("kek-2024").unwrap();
    let k1 = host(path, &old_kek)
        .await
        .manager
        .run_cycle(t0)
        .await
        .unwrap()
        .generated
        .unwrap();

    // restart with a new master key, old one retired
    let options = KeyManagementOptions::new(path, schedule())
        .with_protection_key(ProtectionKey::generate("kek-2025").unwrap())
        .with_retired_protection_key(old_kek);
    let restarted = init_key_management(options).await.unwrap();
    assert_eq!(
        restarted.manager.signing_key(secs(t0, 25)).await.unwrap().kid(),
        k1
    );

    // without the old master key K1 is unreadable and cannot sign
    let stranded = host(path, &ProtectionKey::generate("kek-2026").unwrap()).await;
    assert!(matches!(
        stranded.manager.signing_key(secs(t0, 25)).await,
        Err(KeyError::NoSigningKeyAvailable)
    ));

    // so the next cycle replaces it, and the replacement signs once active
    let report = stranded.manager.run_cycle(secs(t0, 25)).await.unwrap();
    let k2 = report.generated.clone().expect("replacement for unreadable key");
    assert_ne!(k2, k1);
    assert!(!report.is_clean());

    let report = stranded.manager.run_cycle(secs(t0, 30)).await.unwrap();
    assert!(report.generated.is_none());

    assert_eq!(
        stranded.manager.signing_key(secs(t0, 46)).await.unwrap().kid(),
        k2
    );
}
