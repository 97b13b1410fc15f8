//! End-to-end scenarios over the SQLite store: hydration, overlap,
//! retransformation, renames, fencing, and catch-up sufficiency.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::json;
use uuid::Uuid;

use viewsync::core::{ConfigPatch, Patch, PatchOp};
use viewsync::{
    ClientGroupId, ClientId, ConfigDrivenUpdater, CvrChanges, CvrStore, CvrVersion,
    FlushExpectation, PatchToVersion, QueryDrivenUpdater, QueryHash, ReceivedRow, RowChange,
    RowId, RowKey, SqliteCvrStore, StateVersion, StoreError, UpdateError,
};

fn group() -> ClientGroupId {
    ClientGroupId::new("g1").unwrap()
}

fn client(name: &str) -> ClientId {
    ClientId::new(name).unwrap()
}

fn hash(name: &str) -> QueryHash {
    QueryHash::new(name).unwrap()
}

fn issue_row(key: &str) -> RowId {
    RowId::new("public", "issues", RowKey::single("id", json!(key)).unwrap())
}

fn open_store(dir: &tempfile::TempDir, owner: u128) -> SqliteCvrStore {
    SqliteCvrStore::open(&dir.path().join("cvr.db"), Uuid::from_u128(owner)).unwrap()
}

fn undesire(store: &dyn CvrStore, client_id: &ClientId, query: &QueryHash, now: u64) {
    let snapshot = store.load(&group(), now).unwrap();
    let mut updater = ConfigDrivenUpdater::new(snapshot);
    updater.delete_desired_queries(client_id, &[query.clone()]);
    updater.flush(store, now).unwrap();
}

fn desire(store: &dyn CvrStore, client_id: &ClientId, queries: &[&QueryHash], now: u64) {
    let snapshot = store.load(&group(), now).unwrap();
    let mut updater = ConfigDrivenUpdater::new(snapshot);
    let desired: Vec<_> = queries
        .iter()
        .map(|q| ((*q).clone(), json!({"table": "issues"})))
        .collect();
    updater.put_desired_queries(client_id, &desired);
    updater.flush(store, now).unwrap();
}

fn hydrate(
    store: &dyn CvrStore,
    state_seq: u64,
    executed: &[(QueryHash, String)],
    removed: &[QueryHash],
    rows: BTreeMap<RowId, ReceivedRow>,
    now: u64,
) -> (CvrVersion, Vec<PatchToVersion>) {
    let snapshot = store.load(&group(), now).unwrap();
    let mut updater = QueryDrivenUpdater::new(
        snapshot,
        StateVersion::from_seq(state_seq),
        StateVersion::from_seq(0),
    )
    .unwrap();
    let (_, mut patches) = updater.track_queries(executed, removed).unwrap();
    patches.extend(updater.received(store, &rows).unwrap());
    patches.extend(updater.delete_unreferenced_rows(store).unwrap());
    let outcome = updater.flush(store, now).unwrap();
    outcome.cvr.check_invariants().unwrap();
    (outcome.cvr.version, patches)
}

fn received(deltas: &[(&QueryHash, i64)], version: &str, title: &str) -> ReceivedRow {
    ReceivedRow {
        version: version.to_string(),
        contents: json!({"title": title}),
        ref_count_deltas: deltas.iter().map(|(q, n)| ((*q).clone(), *n)).collect(),
        previous_id: None,
    }
}

// S1: a client desires one query, hydration delivers one row; catch-up
// from the minimum replays the whole configuration and the row.
#[test]
fn initial_hydration_and_catchup() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir, 1);
    let q = hash("q");
    desire(&store, &client("c1"), &[&q], 10);

    let mut rows = BTreeMap::new();
    rows.insert(issue_row("123"), received(&[(&q, 1)], "03", "hello"));
    let (version, _) = hydrate(&store, 1, &[(q.clone(), "h".to_string())], &[], rows, 20);
    assert_eq!(version.state_version, StateVersion::from_seq(1));

    let all_rows = store.scan_rows(&group()).unwrap();
    assert_eq!(all_rows.len(), 1);
    assert!(all_rows[0].is_live());

    // Catch-up from the minimum version re-delivers everything.
    let config = store
        .catchup_config_patches(&group(), &CvrVersion::MIN, &version)
        .unwrap();
    let has_client_put = config.iter().any(|p| {
        matches!(
            &p.patch,
            Patch::Config(ConfigPatch::Client { op: PatchOp::Put, .. })
        )
    });
    let has_desire_put = config.iter().any(|p| {
        matches!(
            &p.patch,
            Patch::Config(ConfigPatch::Query { op: PatchOp::Put, client_id: Some(_), .. })
        )
    });
    let has_got_put = config.iter().any(|p| {
        matches!(
            &p.patch,
            Patch::Config(ConfigPatch::Query { op: PatchOp::Put, client_id: None, .. })
        )
    });
    assert!(has_client_put && has_desire_put && has_got_put);
    // Ascending patch-version order.
    for pair in config.windows(2) {
        assert!(pair[0].to_version <= pair[1].to_version);
    }

    let batches = store
        .catchup_row_patches(&group(), &CvrVersion::MIN, &version, &BTreeSet::new(), 100)
        .unwrap();
    let records: Vec<_> = batches.into_iter().flatten().collect();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, issue_row("123"));
}

// S2: a row referenced by two queries survives the removal of one and
// dies with the second.
#[test]
fn overlapping_queries_refcount_to_zero() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir, 1);
    let (q1, q2) = (hash("q1"), hash("q2"));
    desire(&store, &client("c1"), &[&q1, &q2], 10);

    let mut rows = BTreeMap::new();
    rows.insert(issue_row("123"), received(&[(&q1, 1), (&q2, 1)], "01", "x"));
    hydrate(
        &store,
        1,
        &[(q1.clone(), "h1".into()), (q2.clone(), "h2".into())],
        &[],
        rows,
        20,
    );

    let stored = &store.scan_rows(&group()).unwrap()[0];
    assert_eq!(stored.ref_counts.as_ref().unwrap().len(), 2);

    undesire(&store, &client("c1"), &q1, 25);
    hydrate(&store, 2, &[], &[q1.clone()], BTreeMap::new(), 30);
    let stored = &store.scan_rows(&group()).unwrap()[0];
    assert!(stored.is_live());

    undesire(&store, &client("c1"), &q2, 35);
    let (version, patches) = hydrate(&store, 3, &[], &[q2.clone()], BTreeMap::new(), 40);
    let stored = &store.scan_rows(&group()).unwrap()[0];
    assert!(stored.is_tombstone());
    assert_eq!(stored.patch_version, version);
    assert!(patches.iter().any(|p| matches!(
        &p.patch,
        Patch::Row(RowChange::Del { id }) if id == &issue_row("123")
    )));
}

// S3: transformation change re-receives the surviving rows without
// patches, patches changed rows, and tombstones the rest.
#[test]
fn transformation_change_produces_minimal_patches() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir, 1);
    let q = hash("q");
    desire(&store, &client("c1"), &[&q], 10);

    let mut rows = BTreeMap::new();
    rows.insert(issue_row("same"), received(&[(&q, 1)], "01", "same"));
    rows.insert(issue_row("bumped"), received(&[(&q, 1)], "01", "old"));
    rows.insert(issue_row("dropped"), received(&[(&q, 1)], "01", "bye"));
    let (v1, _) = hydrate(&store, 1, &[(q.clone(), "h1".into())], &[], rows, 20);

    let mut rows = BTreeMap::new();
    rows.insert(issue_row("same"), received(&[(&q, 0)], "01", "same"));
    rows.insert(issue_row("bumped"), received(&[(&q, 0)], "02", "new"));
    let (v2, patches) = hydrate(&store, 2, &[(q.clone(), "h2".into())], &[], rows, 30);

    let row_patches: Vec<_> = patches
        .iter()
        .filter_map(|p| match &p.patch {
            Patch::Row(change) => Some((change.row_id().clone(), p.to_version.clone())),
            _ => None,
        })
        .collect();
    // "same" re-emits at its original version (reconnects skip it),
    // "bumped" moves to the new version, "dropped" is deleted.
    assert!(row_patches.contains(&(issue_row("same"), v1.clone())));
    assert!(row_patches.contains(&(issue_row("bumped"), v2.clone())));
    assert!(patches.iter().any(|p| matches!(
        &p.patch,
        Patch::Row(RowChange::Del { id }) if id == &issue_row("dropped")
    )));

    let stored: BTreeMap<_, _> = store
        .scan_rows(&group())
        .unwrap()
        .into_iter()
        .map(|r| (r.id.clone(), r))
        .collect();
    assert_eq!(stored[&issue_row("same")].patch_version, v1);
    assert_eq!(stored[&issue_row("bumped")].patch_version, v2);
    assert!(stored[&issue_row("dropped")].is_tombstone());
}

// S4: upstream signals a primary-key change; the record moves to the new
// key keeping its references, no tombstone is left for the old key.
#[test]
fn row_key_change_replaces_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir, 1);
    let q = hash("q");
    desire(&store, &client("c1"), &[&q], 10);

    let mut rows = BTreeMap::new();
    rows.insert(issue_row("123"), received(&[(&q, 1)], "01", "x"));
    hydrate(&store, 1, &[(q.clone(), "h".into())], &[], rows, 20);

    let mut rows = BTreeMap::new();
    rows.insert(
        issue_row("1foo"),
        ReceivedRow {
            version: "02".to_string(),
            contents: json!({"title": "renamed"}),
            ref_count_deltas: [(q.clone(), 0)].into(),
            previous_id: Some(issue_row("123")),
        },
    );
    let (v2, patches) = hydrate(&store, 2, &[(q.clone(), "h".into())], &[], rows, 30);

    let stored = store.scan_rows(&group()).unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].id, issue_row("1foo"));
    assert_eq!(stored[0].ref_counts.as_ref().unwrap().get(&q), Some(&1));

    let puts: Vec<_> = patches
        .iter()
        .filter(|p| matches!(&p.patch, Patch::Row(RowChange::Put { .. })))
        .collect();
    assert_eq!(puts.len(), 1);
    assert_eq!(puts[0].to_version, v2);
}

// S5: process B loads with a later connect time; A's in-flight update
// must fail its flush with an ownership error and leave nothing behind.
#[test]
fn ownership_fencing_across_processes() {
    let dir = tempfile::tempdir().unwrap();
    let store_a = open_store(&dir, 1);
    let store_b = open_store(&dir, 2);

    let q = hash("q");
    desire(&store_a, &client("c1"), &[&q], 100);

    // A starts an update...
    let snapshot_a = store_a.load(&group(), 100).unwrap();
    let version_before = snapshot_a.cvr.version.clone();
    let mut updater = QueryDrivenUpdater::new(
        snapshot_a,
        StateVersion::from_seq(1),
        StateVersion::from_seq(0),
    )
    .unwrap();
    updater
        .track_queries(&[(q.clone(), "h".into())], &[])
        .unwrap();
    let mut rows = BTreeMap::new();
    rows.insert(issue_row("123"), received(&[(&q, 1)], "01", "x"));
    updater.received(&store_a, &rows).unwrap();

    // ...then B seizes the lease.
    store_b.load(&group(), 200).unwrap();

    let err = updater.flush(&store_a, 150).unwrap_err();
    assert!(matches!(
        err,
        UpdateError::Store(StoreError::Ownership { .. })
    ));

    // No partial writes: version unchanged, no rows.
    let row = store_a.inspect(&group()).unwrap().unwrap();
    assert_eq!(row.version, version_before);
    assert_eq!(row.owner, Some(Uuid::from_u128(2)));
    assert!(store_a.scan_rows(&group()).unwrap().is_empty());
}

// Exactly one of two racing flushes from the same epoch wins.
#[test]
fn concurrent_flushes_from_one_epoch() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir, 1);
    let snapshot = store.load(&group(), 10).unwrap();

    let expected = FlushExpectation {
        group: group(),
        version: snapshot.cvr.version.clone(),
        epoch: snapshot.epoch,
    };
    let bump = CvrChanges {
        version: Some(snapshot.cvr.version.next_minor()),
        ..CvrChanges::default()
    };
    store.flush(&expected, &bump, 11).unwrap();
    let err = store.flush(&expected, &bump, 12).unwrap_err();
    assert!(matches!(err, StoreError::ConcurrentModification { .. }));
}

// Property 1 + 3: versions of successful flushes strictly increase and a
// reload observes exactly what was flushed.
#[test]
fn flush_versions_are_monotone_and_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir, 1);
    let q = hash("q");
    let mut seen = Vec::new();

    desire(&store, &client("c1"), &[&q], 10);
    seen.push(store.load(&group(), 11).unwrap().cvr.version);

    let (v, _) = hydrate(&store, 1, &[(q.clone(), "h1".into())], &[], BTreeMap::new(), 20);
    seen.push(v);
    let (v, _) = hydrate(&store, 2, &[(q.clone(), "h2".into())], &[], BTreeMap::new(), 30);
    seen.push(v);

    desire(&store, &client("c2"), &[&q], 40);
    seen.push(store.load(&group(), 41).unwrap().cvr.version);

    for pair in seen.windows(2) {
        assert!(pair[0] < pair[1], "{} !< {}", pair[0], pair[1]);
    }

    // Round-trip: what load returns equals what the last flush produced.
    let reloaded = store.load(&group(), 50).unwrap();
    reloaded.cvr.check_invariants().unwrap();
    assert_eq!(&reloaded.cvr.version, seen.last().unwrap());
    assert_eq!(reloaded.cvr.clients.len(), 2);
    assert_eq!(reloaded.cvr.queries.len(), 1);
}

// Property 4 (shape): a reconnecting client replaying catch-up patches in
// order converges on the live clients' view of which rows exist.
#[test]
fn catchup_reaches_the_live_row_set() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir, 1);
    let q = hash("q");
    desire(&store, &client("c1"), &[&q], 10);

    let mut rows = BTreeMap::new();
    rows.insert(issue_row("a"), received(&[(&q, 1)], "01", "a"));
    rows.insert(issue_row("b"), received(&[(&q, 1)], "01", "b"));
    let (v0, _) = hydrate(&store, 1, &[(q.clone(), "h1".into())], &[], rows, 20);

    // The client disconnects at v0; upstream keeps moving: "b" goes away,
    // "c" appears.
    let mut rows = BTreeMap::new();
    rows.insert(issue_row("a"), received(&[(&q, 0)], "01", "a"));
    rows.insert(issue_row("c"), received(&[(&q, 1)], "02", "c"));
    let (v1, _) = hydrate(&store, 2, &[(q.clone(), "h2".into())], &[], rows, 30);

    let batches = store
        .catchup_row_patches(&group(), &v0, &v1, &BTreeSet::new(), 100)
        .unwrap();
    let records: Vec<_> = batches.into_iter().flatten().collect();

    // Replay: start from the v0 row set, apply the interval.
    let mut live: BTreeSet<RowId> = [issue_row("a"), issue_row("b")].into();
    for record in &records {
        if record.is_tombstone() {
            live.remove(&record.id);
        } else {
            live.insert(record.id.clone());
        }
    }
    let expected: BTreeSet<RowId> = [issue_row("a"), issue_row("c")].into();
    assert_eq!(live, expected);

    // "a" did not change in the interval and is not re-sent.
    assert!(records.iter().all(|r| r.id != issue_row("a")));
}
