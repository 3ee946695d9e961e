//! Session state surviving a server restart.

use std::sync::Arc;

use shellpod::db::Database;
use shellpod::lifecycle::{Phase, SessionRegistry};
use shellpod::store::{DurableStore, SqliteStore};
use tempfile::TempDir;

mod common;
use common::{FakeProbe, FakeRuntime, test_deps};

async fn open_registry(dir: &TempDir) -> (Arc<SqliteStore>, SessionRegistry) {
    let db = Database::new(&dir.path().join("shellpod.db")).await.unwrap();
    let store = Arc::new(SqliteStore::new(db.pool().clone()));
    let registry = SessionRegistry::new(test_deps(
        store.clone(),
        Arc::new(FakeRuntime::default()),
        Arc::new(FakeProbe::default()),
    ));
    (store, registry)
}

#[tokio::test]
async fn provisioned_session_is_rehydrated_after_restart() {
    let dir = TempDir::new().unwrap();

    {
        let (store, registry) = open_registry(&dir).await;
        let handle = registry.get_or_spawn("s1").unwrap();
        handle.set_identity("tenant-a").await.unwrap();
        assert!(store.get_alarm("s1").await.unwrap().is_some());
        registry.shutdown();
    }

    let (_store, registry) = open_registry(&dir).await;
    assert_eq!(registry.rehydrate().await.unwrap(), 1);

    let status = registry.get("s1").unwrap().status().await.unwrap();
    assert_eq!(status.phase, Phase::Active);
    assert_eq!(status.bucket_identifier.as_deref(), Some("tenant-a"));
    assert!(status.wakeup_scheduled);
}

#[tokio::test]
async fn destroyed_session_clears_itself_after_restart() {
    let dir = TempDir::new().unwrap();

    {
        let (store, registry) = open_registry(&dir).await;
        let handle = registry.get_or_spawn("s1").unwrap();
        handle.set_identity("tenant-a").await.unwrap();
        handle.destroy().await.unwrap();
        assert_eq!(store.keys("s1").await.unwrap(), vec!["destroyed".to_string()]);
        assert!(store.get_alarm("s1").await.unwrap().is_none());
        registry.shutdown();
    }

    let (store, registry) = open_registry(&dir).await;
    // No alarm was left behind, so nothing is restored.
    assert_eq!(registry.rehydrate().await.unwrap(), 0);

    let status = registry.get_or_spawn("s1").unwrap().status().await.unwrap();
    assert_eq!(status.phase, Phase::Orphan);
    assert!(store.keys("s1").await.unwrap().is_empty());
}
