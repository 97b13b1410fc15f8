//! Row-set transitions under a declared set of executed/removed queries.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;
use tracing::warn;
use xxhash_rust::xxh3::xxh3_128;

use crate::core::{
    ConfigPatch, Cvr, CvrVersion, PatchOp, PatchToVersion, QueryHash, RowChange, RowId,
    RowRecord, StateVersion, merge_ref_counts,
};
use crate::store::{CvrSnapshot, CvrStore};

use super::{CvrUpdater, FlushOutcome, UpdateError};

/// One row as reported by the hydration pipeline.
#[derive(Clone, Debug)]
pub struct ReceivedRow {
    /// Replica version of the row contents.
    pub version: String,
    pub contents: Value,
    /// Per-query reference deltas. Zero asserts continued reference with
    /// an unchanged count; positive adds, negative removes.
    pub ref_count_deltas: crate::core::RefCounts,
    /// Set when the upstream signals that this row replaces a prior key
    /// (primary-key value change with retained identity).
    pub previous_id: Option<RowId>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Loaded,
    Tracking,
    Receiving,
}

impl Phase {
    fn name(self) -> &'static str {
        match self {
            Phase::Loaded => "loaded",
            Phase::Tracking => "tracking",
            Phase::Receiving => "receiving",
        }
    }
}

/// Applies query-result updates against the CVR at a target state version.
///
/// Legal call order is `track_queries`, any number of `received` /
/// `delete_unreferenced_rows`, then `flush`. Anything else fails with
/// [`UpdateError::InvalidState`].
#[derive(Debug)]
pub struct QueryDrivenUpdater {
    inner: CvrUpdater,
    phase: Phase,
    /// Store-backed view of row records, populated lazily. `None` marks a
    /// confirmed miss so each row is fetched at most once.
    row_cache: BTreeMap<RowId, Option<RowRecord>>,
    /// Dedupe ledger: contents hash of each row processed this update.
    received_hashes: BTreeMap<RowId, u128>,
    /// Queries dropped from the got set this update.
    removed_queries: BTreeSet<QueryHash>,
    /// Queries whose transformation hash changed this update.
    retransformed_queries: BTreeSet<QueryHash>,
}

impl QueryDrivenUpdater {
    /// Enters an update targeting `state_version` on the replica identified
    /// by `replica_version`. A CVR bound to a different replica refuses the
    /// update unless it is still at the minimum version (first hydration
    /// adopts the replica).
    pub fn new(
        snapshot: CvrSnapshot,
        state_version: StateVersion,
        replica_version: StateVersion,
    ) -> Result<Self, UpdateError> {
        if let Some(stored) = &snapshot.cvr.replica_version
            && stored != &replica_version
            && !snapshot.cvr.version.is_min()
        {
            return Err(UpdateError::ReplicaVersionMismatch {
                stored: stored.clone(),
                supplied: replica_version,
            });
        }

        let mut inner = CvrUpdater::new(snapshot);
        if inner.cvr.replica_version.as_ref() != Some(&replica_version) {
            inner.replica_version = Some(replica_version.clone());
            inner.cvr.replica_version = Some(replica_version);
        }
        if state_version > inner.expected_version.state_version {
            inner.new_version = inner.expected_version.advance(state_version)?;
        } else if state_version < inner.expected_version.state_version {
            return Err(UpdateError::Version(
                crate::core::VersionError::NonMonotonic {
                    from: inner.expected_version.to_cookie(),
                    to: state_version.to_string(),
                },
            ));
        }

        Ok(Self {
            inner,
            phase: Phase::Loaded,
            row_cache: BTreeMap::new(),
            received_hashes: BTreeMap::new(),
            removed_queries: BTreeSet::new(),
            retransformed_queries: BTreeSet::new(),
        })
    }

    pub fn cvr(&self) -> &Cvr {
        self.inner.cvr()
    }

    pub fn updated_version(&self) -> &CvrVersion {
        self.inner.updated_version()
    }

    fn require_phase(
        &self,
        operation: &'static str,
        allowed: &[Phase],
    ) -> Result<(), UpdateError> {
        if allowed.contains(&self.phase) {
            Ok(())
        } else {
            Err(UpdateError::InvalidState {
                operation,
                phase: self.phase.name(),
            })
        }
    }

    /// Declares which queries this update hydrates and which it drops.
    /// Returns the new version and the got-set patches.
    pub fn track_queries(
        &mut self,
        executed: &[(QueryHash, String)],
        removed: &[QueryHash],
    ) -> Result<(CvrVersion, Vec<PatchToVersion>), UpdateError> {
        self.require_phase("track_queries", &[Phase::Loaded])?;
        self.phase = Phase::Tracking;

        let mut patches = Vec::new();
        for hash in removed {
            let Some(query) = self.inner.cvr.queries.get_mut(hash) else {
                warn!(group = %self.inner.cvr.id, query = %hash, "removed query unknown");
                continue;
            };
            if query.deleted {
                continue;
            }
            let version = self.inner.ensure_new_version();
            let query = self
                .inner
                .cvr
                .queries
                .get_mut(hash)
                .expect("checked above");
            // Removal only happens once no client desires the query, so
            // desired_by is already empty here.
            query.deleted = true;
            query.transformation_hash = None;
            query.transformation_version = None;
            query.patch_version = Some(version.clone());
            self.removed_queries.insert(hash.clone());
            self.inner.touched_queries.insert(hash.clone());
            patches.push(PatchToVersion::config(
                ConfigPatch::Query {
                    op: PatchOp::Del,
                    id: hash.clone(),
                    client_id: None,
                    ast: None,
                },
                version,
            ));
        }

        for (hash, transformation_hash) in executed {
            let Some(query) = self.inner.cvr.queries.get(hash) else {
                warn!(group = %self.inner.cvr.id, query = %hash, "executed query unknown");
                continue;
            };
            if query.deleted {
                warn!(group = %self.inner.cvr.id, query = %hash, "executed query is deleted");
                continue;
            }
            if query.transformation_hash.as_ref() != Some(transformation_hash) {
                if query.transformation_hash.is_some() {
                    self.retransformed_queries.insert(hash.clone());
                }
                let version = self.inner.ensure_new_version();
                let query = self
                    .inner
                    .cvr
                    .queries
                    .get_mut(hash)
                    .expect("checked above");
                query.transformation_hash = Some(transformation_hash.clone());
                query.transformation_version = Some(version.clone());
                if query.patch_version.is_none() {
                    query.patch_version = Some(version);
                }
                self.inner.touched_queries.insert(hash.clone());
            }
            let query = &self.inner.cvr.queries[hash];
            let patch_version = query
                .patch_version
                .clone()
                .expect("hydrated query has a patch version");
            patches.push(PatchToVersion::config(
                ConfigPatch::Query {
                    op: PatchOp::Put,
                    id: hash.clone(),
                    client_id: None,
                    ast: Some(query.ast.clone()),
                },
                patch_version,
            ));
        }

        Ok((self.inner.new_version.clone(), patches))
    }

    /// Applies a batch of emitted rows, merging reference deltas and
    /// emitting the minimal patch set. The patch a row is emitted at may be
    /// older than the update's version when the row was already present:
    /// that is what lets a reconnecting client skip rows below its cookie.
    pub fn received(
        &mut self,
        store: &dyn CvrStore,
        rows: &BTreeMap<RowId, ReceivedRow>,
    ) -> Result<Vec<PatchToVersion>, UpdateError> {
        self.require_phase("received", &[Phase::Tracking, Phase::Receiving])?;
        self.phase = Phase::Receiving;

        let mut to_fetch: Vec<RowId> = Vec::new();
        for (id, received) in rows {
            if !self.row_cache.contains_key(id) && !self.inner.pending_rows.contains_key(id) {
                to_fetch.push(id.clone());
            }
            if let Some(previous) = &received.previous_id
                && !self.row_cache.contains_key(previous)
                && !self.inner.pending_rows.contains_key(previous)
            {
                to_fetch.push(previous.clone());
            }
        }
        if !to_fetch.is_empty() {
            let fetched = store.load_rows(&self.inner.cvr.id, &to_fetch)?;
            for id in to_fetch {
                let record = fetched.get(&id).cloned();
                self.row_cache.insert(id, record);
            }
        }

        let mut patches = Vec::new();
        for (id, received) in rows {
            let contents_hash = contents_hash(received);
            if self.received_hashes.get(id) == Some(&contents_hash) {
                continue;
            }
            self.received_hashes.insert(id.clone(), contents_hash);

            // A signaled key rename adopts the previous record in place.
            let existing = if let Some(previous) = &received.previous_id {
                let adopted = self.take_record(previous);
                if adopted.is_some() {
                    self.inner.pending_row_deletes.insert(previous.clone());
                }
                adopted.or_else(|| self.peek_record(id))
            } else {
                self.peek_record(id)
            };

            let was_live = existing.as_ref().is_some_and(RowRecord::is_live);
            let renamed = received.previous_id.is_some();
            let merged = merge_ref_counts(
                existing.as_ref().and_then(|r| r.ref_counts.as_ref()),
                &received.ref_count_deltas,
            );

            match merged {
                None => {
                    if !was_live {
                        // Retracting an unknown or dead row changes nothing.
                        continue;
                    }
                    let version = self.inner.ensure_new_version();
                    self.inner.pending_rows.insert(
                        id.clone(),
                        RowRecord {
                            id: id.clone(),
                            row_version: received.version.clone(),
                            patch_version: version.clone(),
                            ref_counts: None,
                        },
                    );
                    patches.push(PatchToVersion::row(RowChange::Del { id: id.clone() }, version));
                }
                Some(counts) => {
                    let version_changed = match &existing {
                        Some(record) => received.version > record.row_version,
                        None => true,
                    };
                    let patch_version = if !was_live || version_changed || renamed {
                        self.inner.ensure_new_version()
                    } else {
                        existing
                            .as_ref()
                            .map(|r| r.patch_version.clone())
                            .expect("live row has a record")
                    };
                    self.inner.pending_rows.insert(
                        id.clone(),
                        RowRecord {
                            id: id.clone(),
                            row_version: received.version.clone(),
                            patch_version: patch_version.clone(),
                            ref_counts: Some(counts),
                        },
                    );
                    patches.push(PatchToVersion::row(
                        RowChange::Put {
                            id: id.clone(),
                            contents: received.contents.clone(),
                        },
                        patch_version,
                    ));
                }
            }
        }
        Ok(patches)
    }

    /// Drops the references held by removed and retransformed queries from
    /// every row this update did not re-receive, tombstoning rows whose
    /// reference count reaches zero.
    pub fn delete_unreferenced_rows(
        &mut self,
        store: &dyn CvrStore,
    ) -> Result<Vec<PatchToVersion>, UpdateError> {
        self.require_phase(
            "delete_unreferenced_rows",
            &[Phase::Tracking, Phase::Receiving],
        )?;
        self.phase = Phase::Receiving;

        let mut invalidated = self.removed_queries.clone();
        invalidated.extend(self.retransformed_queries.iter().cloned());

        let mut patches = Vec::new();

        // Received rows keep their (delta-adjusted) references except those
        // of queries removed outright.
        if !self.removed_queries.is_empty() {
            let removed = self.removed_queries.clone();
            let pending_ids: Vec<RowId> = self.inner.pending_rows.keys().cloned().collect();
            for id in pending_ids {
                if let Some(patch) = self.strip_refs(&id, &removed) {
                    patches.push(patch);
                }
            }
        }

        if !invalidated.is_empty() {
            for record in store.scan_rows(&self.inner.cvr.id)? {
                let id = record.id.clone();
                if self.inner.pending_rows.contains_key(&id)
                    || self.received_hashes.contains_key(&id)
                    || self.inner.pending_row_deletes.contains(&id)
                {
                    continue;
                }
                self.row_cache.entry(id.clone()).or_insert(Some(record));
                if let Some(patch) = self.strip_refs(&id, &invalidated) {
                    patches.push(patch);
                }
            }
        }
        Ok(patches)
    }

    /// Persists the update. Legal once tracking has happened; the updater
    /// is consumed either way.
    pub fn flush(self, store: &dyn CvrStore, now: u64) -> Result<FlushOutcome, UpdateError> {
        self.require_phase("flush", &[Phase::Tracking, Phase::Receiving])?;
        self.inner.flush(store, now)
    }

    /// Removes `queries` references from the row, tombstoning at zero.
    /// Returns the `del` patch when the row dies.
    fn strip_refs(&mut self, id: &RowId, queries: &BTreeSet<QueryHash>) -> Option<PatchToVersion> {
        let record = self
            .inner
            .pending_rows
            .get(id)
            .cloned()
            .or_else(|| self.peek_record(id))?;
        let counts = record.ref_counts.as_ref()?;
        if !counts.keys().any(|q| queries.contains(q)) {
            return None;
        }
        let remaining: crate::core::RefCounts = counts
            .iter()
            .filter(|(q, _)| !queries.contains(*q))
            .map(|(q, n)| (q.clone(), *n))
            .collect();
        if remaining.is_empty() {
            let version = self.inner.ensure_new_version();
            self.inner.pending_rows.insert(
                id.clone(),
                RowRecord {
                    id: id.clone(),
                    row_version: record.row_version,
                    patch_version: version.clone(),
                    ref_counts: None,
                },
            );
            Some(PatchToVersion::row(RowChange::Del { id: id.clone() }, version))
        } else {
            // Internal refcount change: the row stays visible at its
            // existing patch version.
            self.inner.pending_rows.insert(
                id.clone(),
                RowRecord {
                    ref_counts: Some(remaining),
                    ..record
                },
            );
            None
        }
    }

    fn peek_record(&self, id: &RowId) -> Option<RowRecord> {
        self.inner
            .pending_rows
            .get(id)
            .cloned()
            .or_else(|| self.row_cache.get(id).cloned().flatten())
    }

    fn take_record(&mut self, id: &RowId) -> Option<RowRecord> {
        if let Some(record) = self.inner.pending_rows.remove(id) {
            return Some(record);
        }
        self.row_cache.get(id).cloned().flatten()
    }
}

fn contents_hash(received: &ReceivedRow) -> u128 {
    let encoded = serde_json::to_string(&received.contents).expect("json value serializes");
    let mut seed = Vec::with_capacity(encoded.len() + received.version.len() + 1);
    seed.extend_from_slice(received.version.as_bytes());
    seed.push(0);
    seed.extend_from_slice(encoded.as_bytes());
    xxh3_128(&seed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ClientGroupId, ClientId, RowKey};
    use crate::store::{CvrStore, MemoryCvrStore};
    use crate::updater::ConfigDrivenUpdater;
    use serde_json::json;
    use uuid::Uuid;

    fn group() -> ClientGroupId {
        ClientGroupId::new("g1").unwrap()
    }

    fn hash(name: &str) -> QueryHash {
        QueryHash::new(name).unwrap()
    }

    fn row_id(key: &str) -> RowId {
        RowId::new("public", "issues", RowKey::single("id", json!(key)).unwrap())
    }

    fn received_row(deltas: &[(&QueryHash, i64)], version: &str) -> ReceivedRow {
        ReceivedRow {
            version: version.to_string(),
            contents: json!({"title": "hello"}),
            ref_count_deltas: deltas.iter().map(|(q, n)| ((*q).clone(), *n)).collect(),
            previous_id: None,
        }
    }

    /// Seeds the store with one client desiring the given queries.
    fn seed_desires(store: &MemoryCvrStore, queries: &[&QueryHash]) {
        let snapshot = store.load(&group(), 1).unwrap();
        let mut updater = ConfigDrivenUpdater::new(snapshot);
        let desired: Vec<_> = queries
            .iter()
            .map(|q| ((*q).clone(), json!({"table": "issues"})))
            .collect();
        updater.put_desired_queries(&ClientId::new("c1").unwrap(), &desired);
        updater.flush(store, 2).unwrap();
    }

    /// Withdraws a desire the way the config path would before the
    /// pipeline drops the query.
    fn undesire(store: &MemoryCvrStore, query: &QueryHash) {
        let snapshot = store.load(&group(), 2).unwrap();
        let mut updater = ConfigDrivenUpdater::new(snapshot);
        updater.delete_desired_queries(&ClientId::new("c1").unwrap(), &[query.clone()]);
        updater.flush(store, 2).unwrap();
    }

    fn hydrate(
        store: &MemoryCvrStore,
        state_seq: u64,
        executed: &[(QueryHash, String)],
        removed: &[QueryHash],
        rows: BTreeMap<RowId, ReceivedRow>,
    ) -> (CvrVersion, Vec<PatchToVersion>) {
        let snapshot = store.load(&group(), 3).unwrap();
        let mut updater = QueryDrivenUpdater::new(
            snapshot,
            StateVersion::from_seq(state_seq),
            StateVersion::from_seq(0),
        )
        .unwrap();
        let (version, mut patches) = updater.track_queries(executed, removed).unwrap();
        patches.extend(updater.received(store, &rows).unwrap());
        patches.extend(updater.delete_unreferenced_rows(store).unwrap());
        let outcome = updater.flush(store, 4).unwrap();
        assert_eq!(&outcome.cvr.version, &version);
        (version, patches)
    }

    #[test]
    fn initial_hydration_creates_live_row() {
        let store = MemoryCvrStore::new(Uuid::from_u128(1));
        let q = hash("q1");
        seed_desires(&store, &[&q]);

        let mut rows = BTreeMap::new();
        rows.insert(row_id("123"), received_row(&[(&q, 1)], "03"));
        let (version, patches) = hydrate(
            &store,
            1,
            &[(q.clone(), "h1".to_string())],
            &[],
            rows,
        );
        assert_eq!(version.state_version, StateVersion::from_seq(1));
        assert_eq!(version.minor, 0);

        let stored = store.scan_rows(&group()).unwrap();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].is_live());
        assert_eq!(stored[0].row_version, "03");
        assert_eq!(
            stored[0].ref_counts.as_ref().unwrap().get(&q),
            Some(&1)
        );

        // One got-query put and one row put.
        assert!(patches.iter().any(|p| matches!(
            &p.patch,
            crate::core::Patch::Config(ConfigPatch::Query { op: PatchOp::Put, client_id: None, .. })
        )));
        assert!(patches.iter().any(|p| matches!(
            &p.patch,
            crate::core::Patch::Row(RowChange::Put { .. })
        )));
    }

    #[test]
    fn overlapping_queries_share_rows() {
        let store = MemoryCvrStore::new(Uuid::from_u128(1));
        let q1 = hash("q1");
        let q2 = hash("q2");
        seed_desires(&store, &[&q1, &q2]);

        let mut rows = BTreeMap::new();
        rows.insert(row_id("123"), received_row(&[(&q1, 1), (&q2, 1)], "01"));
        hydrate(
            &store,
            1,
            &[
                (q1.clone(), "h1".to_string()),
                (q2.clone(), "h2".to_string()),
            ],
            &[],
            rows,
        );

        let stored = store.scan_rows(&group()).unwrap();
        assert_eq!(stored[0].ref_counts.as_ref().unwrap().len(), 2);

        // Dropping q1 leaves the row alive.
        undesire(&store, &q1);
        let (_, patches) = hydrate(&store, 2, &[], &[q1.clone()], BTreeMap::new());
        let stored = store.scan_rows(&group()).unwrap();
        assert!(stored[0].is_live());
        assert!(!patches.iter().any(|p| matches!(
            &p.patch,
            crate::core::Patch::Row(RowChange::Del { .. })
        )));

        // Dropping q2 tombstones it.
        undesire(&store, &q2);
        let (version, patches) = hydrate(&store, 3, &[], &[q2.clone()], BTreeMap::new());
        let stored = store.scan_rows(&group()).unwrap();
        assert!(stored[0].is_tombstone());
        assert_eq!(stored[0].patch_version, version);
        assert!(patches.iter().any(|p| matches!(
            &p.patch,
            crate::core::Patch::Row(RowChange::Del { .. })
        )));
    }

    #[test]
    fn retransformation_diffs_the_row_set() {
        let store = MemoryCvrStore::new(Uuid::from_u128(1));
        let q = hash("q1");
        seed_desires(&store, &[&q]);

        let mut rows = BTreeMap::new();
        rows.insert(row_id("a"), received_row(&[(&q, 1)], "01"));
        rows.insert(row_id("b"), received_row(&[(&q, 1)], "01"));
        let (v1, _) = hydrate(&store, 1, &[(q.clone(), "h1".to_string())], &[], rows);

        // Retransform: row "a" is re-received unchanged, row "c" is new,
        // row "b" disappears.
        let mut rows = BTreeMap::new();
        rows.insert(row_id("a"), received_row(&[(&q, 0)], "01"));
        rows.insert(row_id("c"), received_row(&[(&q, 1)], "02"));
        let (v2, patches) = hydrate(&store, 2, &[(q.clone(), "h2".to_string())], &[], rows);
        assert!(v2 > v1);

        let stored: BTreeMap<_, _> = store
            .scan_rows(&group())
            .unwrap()
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();
        // "a" kept its original patch version: reconnects skip it.
        assert_eq!(stored[&row_id("a")].patch_version, v1);
        assert!(stored[&row_id("a")].is_live());
        assert_eq!(stored[&row_id("c")].patch_version, v2);
        assert!(stored[&row_id("b")].is_tombstone());

        // Patch for "a" points at the old version, "c" at the new one.
        let put_version = |key: &str| {
            patches
                .iter()
                .find_map(|p| match &p.patch {
                    crate::core::Patch::Row(RowChange::Put { id, .. }) if id == &row_id(key) => {
                        Some(p.to_version.clone())
                    }
                    _ => None,
                })
                .unwrap()
        };
        assert_eq!(put_version("a"), v1);
        assert_eq!(put_version("c"), v2);
        assert!(patches.iter().any(|p| matches!(
            &p.patch,
            crate::core::Patch::Row(RowChange::Del { id }) if id == &row_id("b")
        )));
    }

    #[test]
    fn received_is_idempotent() {
        let store = MemoryCvrStore::new(Uuid::from_u128(1));
        let q = hash("q1");
        seed_desires(&store, &[&q]);

        let snapshot = store.load(&group(), 3).unwrap();
        let mut updater = QueryDrivenUpdater::new(
            snapshot,
            StateVersion::from_seq(1),
            StateVersion::from_seq(0),
        )
        .unwrap();
        updater
            .track_queries(&[(q.clone(), "h1".to_string())], &[])
            .unwrap();

        let mut rows = BTreeMap::new();
        rows.insert(row_id("123"), received_row(&[(&q, 1)], "01"));
        let first = updater.received(&store, &rows).unwrap();
        assert_eq!(first.len(), 1);

        // Same row, same contents: nothing further is emitted.
        let mut again = BTreeMap::new();
        again.insert(row_id("123"), received_row(&[(&q, 0)], "01"));
        let second = updater.received(&store, &again).unwrap();
        assert!(second.is_empty());

        updater.flush(&store, 4).unwrap();
        let stored = store.scan_rows(&group()).unwrap();
        assert_eq!(stored[0].ref_counts.as_ref().unwrap().get(&q), Some(&1));
    }

    #[test]
    fn row_key_rename_preserves_refcounts() {
        let store = MemoryCvrStore::new(Uuid::from_u128(1));
        let q = hash("q1");
        seed_desires(&store, &[&q]);

        let mut rows = BTreeMap::new();
        rows.insert(row_id("123"), received_row(&[(&q, 1)], "01"));
        hydrate(&store, 1, &[(q.clone(), "h1".to_string())], &[], rows);

        let mut rows = BTreeMap::new();
        rows.insert(
            row_id("1foo"),
            ReceivedRow {
                version: "02".to_string(),
                contents: json!({"title": "renamed"}),
                ref_count_deltas: [(q.clone(), 0)].into(),
                previous_id: Some(row_id("123")),
            },
        );
        let (v2, patches) = hydrate(&store, 2, &[(q.clone(), "h1".to_string())], &[], rows);

        let stored = store.scan_rows(&group()).unwrap();
        // Old key is gone entirely (no tombstone), new key carries the refs.
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, row_id("1foo"));
        assert_eq!(stored[0].ref_counts.as_ref().unwrap().get(&q), Some(&1));
        assert_eq!(stored[0].patch_version, v2);

        let puts: Vec<_> = patches
            .iter()
            .filter(|p| matches!(&p.patch, crate::core::Patch::Row(RowChange::Put { .. })))
            .collect();
        assert_eq!(puts.len(), 1);
        assert_eq!(puts[0].to_version, v2);
    }

    #[test]
    fn replica_mismatch_is_refused_after_first_hydration() {
        let store = MemoryCvrStore::new(Uuid::from_u128(1));
        let q = hash("q1");
        seed_desires(&store, &[&q]);
        hydrate(&store, 1, &[(q.clone(), "h1".to_string())], &[], BTreeMap::new());

        let snapshot = store.load(&group(), 5).unwrap();
        let err = QueryDrivenUpdater::new(
            snapshot,
            StateVersion::from_seq(2),
            StateVersion::from_seq(9),
        )
        .unwrap_err();
        assert!(matches!(err, UpdateError::ReplicaVersionMismatch { .. }));
    }

    #[test]
    fn out_of_order_calls_are_invalid() {
        let store = MemoryCvrStore::new(Uuid::from_u128(1));
        seed_desires(&store, &[&hash("q1")]);
        let snapshot = store.load(&group(), 3).unwrap();
        let mut updater = QueryDrivenUpdater::new(
            snapshot,
            StateVersion::from_seq(1),
            StateVersion::from_seq(0),
        )
        .unwrap();

        let err = updater.received(&store, &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, UpdateError::InvalidState { .. }));

        updater.track_queries(&[], &[]).unwrap();
        let err = updater.track_queries(&[], &[]).unwrap_err();
        assert!(matches!(err, UpdateError::InvalidState { .. }));
    }

    #[test]
    fn flush_before_tracking_is_invalid() {
        let store = MemoryCvrStore::new(Uuid::from_u128(1));
        seed_desires(&store, &[&hash("q1")]);
        let snapshot = store.load(&group(), 3).unwrap();
        let updater = QueryDrivenUpdater::new(
            snapshot,
            StateVersion::from_seq(1),
            StateVersion::from_seq(0),
        )
        .unwrap();
        let err = updater.flush(&store, 4).unwrap_err();
        assert!(matches!(err, UpdateError::InvalidState { .. }));
    }
}
