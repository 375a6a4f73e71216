use super::*;
use crate::test_utils::row;
use crate::test_utils::test_caches;

#[test]
fn test_upsert_reports_added_updated_unchanged() {
    let caches = test_caches();
    let local = caches.local();
    let a = row("node-1", "api", 8080);

    assert_eq!(local.upsert(&a).unwrap(), Upsert::Added);
    assert_eq!(local.upsert(&a).unwrap(), Upsert::Unchanged);

    let mut moved = a.clone();
    moved.port = 9090;
    assert_eq!(local.upsert(&moved).unwrap(), Upsert::Updated);
    assert_eq!(local.find(&a.id).unwrap(), Some(moved));
    assert_eq!(local.len(), 1);
}

#[test]
fn test_remove_returns_previous_row() {
    let caches = test_caches();
    let a = row("node-1", "api", 8080);
    caches.local().upsert(&a).unwrap();

    assert_eq!(caches.local().remove(&a.id).unwrap(), Some(a.clone()));
    assert_eq!(caches.local().remove(&a.id).unwrap(), None);
    assert!(caches.local().is_empty());
}

#[test]
fn test_local_and_global_are_separate_tables() {
    let caches = test_caches();
    let a = row("node-1", "api", 8080);
    caches.local().upsert(&a).unwrap();

    assert!(caches.global().find(&a.id).unwrap().is_none());
    assert_eq!(caches.global().name(), "global_services");
}

#[test]
fn test_reconcile_converges_to_target() {
    let caches = test_caches();
    let global = caches.global();

    let a_stale = row("node-1", "a", 1000);
    let c = row("node-3", "c", 3000);
    global.upsert(&a_stale).unwrap();
    global.upsert(&c).unwrap();

    let a_fresh = row("node-1", "a", 1001);
    let b = row("node-2", "b", 2000);
    let summary = global.reconcile(vec![a_fresh.clone(), b.clone()]).unwrap();

    assert_eq!(
        summary,
        ReconcileSummary {
            added: 1,
            updated: 1,
            deleted: 1,
            skipped: 0,
        }
    );
    let mut rows = global.all().unwrap();
    rows.sort_by(|x, y| x.id.cmp(&y.id));
    assert_eq!(rows, vec![a_fresh, b]);
}

#[test]
fn test_reconcile_is_noop_when_equal() {
    let caches = test_caches();
    let a = row("node-1", "a", 1000);
    caches.global().upsert(&a).unwrap();

    let summary = caches.global().reconcile(vec![a]).unwrap();
    assert!(summary.is_noop());
}

#[test]
fn test_reconcile_leaves_rows_changed_after_snapshot() {
    let caches = test_caches();
    let global = caches.global();
    let a = row("node-1", "a", 1000);
    let gone = row("node-2", "gone", 2000);
    global.upsert(&a).unwrap();
    global.upsert(&gone).unwrap();
    let snapshot = global.all().unwrap();

    // a watch event lands between snapshot and commit
    let mut newer = a.clone();
    newer.port = 1002;
    global.upsert(&newer).unwrap();
    let mut revived = gone.clone();
    revived.hostname = "elsewhere".to_string();
    global.upsert(&revived).unwrap();

    let mut older = a.clone();
    older.port = 1001;
    let summary = global.reconcile_from(snapshot, vec![older]).unwrap();

    assert_eq!(summary.skipped, 2);
    assert_eq!(global.find(&a.id).unwrap(), Some(newer));
    assert_eq!(global.find(&gone.id).unwrap(), Some(revived));
}

#[test]
fn test_apply_is_idempotent() {
    let caches = test_caches();
    let a = row("node-1", "a", 1000);
    let b = row("node-2", "b", 2000);
    let changes = vec![
        CacheChange::Put(a.clone()),
        CacheChange::Put(b.clone()),
        CacheChange::Delete(b.id.clone()),
    ];

    let first = caches.global().apply(changes.clone()).unwrap();
    assert_eq!(first.added, 2);
    assert_eq!(first.deleted, 1);

    let replay = caches.global().apply(changes).unwrap();
    assert_eq!(replay.added, 1);
    assert_eq!(replay.deleted, 1);
    assert_eq!(caches.global().all().unwrap(), vec![a]);
}

#[tokio::test]
async fn test_open_persists_to_disk() {
    let dir = tempfile::tempdir().unwrap();
    let config = StorageConfig {
        db_path: Some(dir.path().join("caches")),
    };
    let a = row("node-1", "a", 1000);
    {
        let caches = ServiceCaches::open(&config).unwrap();
        caches.global().upsert(&a).unwrap();
        caches.local().upsert(&a).unwrap();
        caches.local().clear().unwrap();
        caches.flush().await.unwrap();
    }

    let reopened = ServiceCaches::open(&config).unwrap();
    assert_eq!(reopened.global().find(&a.id).unwrap(), Some(a));
    assert!(reopened.local().is_empty());
}
