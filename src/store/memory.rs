//! In-memory CVR store for tests and single-process embedding.
//!
//! Matches the observable semantics of the SQLite backend, including
//! fencing and optimistic concurrency, so updater and pipeline tests can
//! run against it interchangeably.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

use uuid::Uuid;

use crate::core::{
    ClientGroupId, ClientId, ClientRecord, Cvr, CvrVersion, PatchToVersion, QueryHash,
    QueryRecord, RowId, RowRecord, StateVersion,
};

use super::{
    ConfigState, CvrChanges, CvrSnapshot, CvrStore, DesireRow, FlushExpectation, FlushStats,
    InstanceRow, OwnershipEpoch, StoreError, config_patches_in_range, may_claim,
    only_referenced_by,
};

#[derive(Clone, Debug, Default)]
struct GroupState {
    version: CvrVersion,
    replica_version: Option<StateVersion>,
    last_active: u64,
    epoch: Option<OwnershipEpoch>,
    clients: BTreeMap<ClientId, ClientRecord>,
    queries: BTreeMap<QueryHash, QueryRecord>,
    desires: BTreeMap<(ClientId, QueryHash), DesireRow>,
    rows: BTreeMap<RowId, RowRecord>,
    rows_version: CvrVersion,
}

#[derive(Clone)]
pub struct MemoryCvrStore {
    groups: Arc<RwLock<BTreeMap<ClientGroupId, GroupState>>>,
    owner: Uuid,
}

impl MemoryCvrStore {
    pub fn new(owner: Uuid) -> Self {
        Self {
            groups: Arc::new(RwLock::new(BTreeMap::new())),
            owner,
        }
    }

    /// A handle over the same state claiming leases as a different owner.
    /// Lets tests model two syncer processes sharing one database.
    pub fn peer(&self, owner: Uuid) -> Self {
        Self {
            groups: Arc::clone(&self.groups),
            owner,
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<ClientGroupId, GroupState>> {
        self.groups.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<ClientGroupId, GroupState>> {
        self.groups.write().unwrap_or_else(|p| p.into_inner())
    }
}

impl CvrStore for MemoryCvrStore {
    fn owner(&self) -> Uuid {
        self.owner
    }

    fn load(&self, group: &ClientGroupId, last_connect: u64) -> Result<CvrSnapshot, StoreError> {
        let mut groups = self.write();
        let state = groups.entry(group.clone()).or_insert_with(|| GroupState {
            last_active: last_connect,
            ..GroupState::default()
        });

        if !may_claim(state.epoch.as_ref(), self.owner, last_connect) {
            let held = state.epoch.expect("claim refused only against a holder");
            return Err(StoreError::Ownership {
                group: group.clone(),
                owner: self.owner,
                holder: Some(held.owner),
                granted_at: Some(held.granted_at),
            });
        }
        let granted_at = match state.epoch {
            Some(epoch) if epoch.owner == self.owner => epoch.granted_at.max(last_connect),
            _ => last_connect,
        };
        let epoch = OwnershipEpoch {
            owner: self.owner,
            granted_at,
        };
        state.epoch = Some(epoch);

        let mut cvr = Cvr::new(group.clone());
        cvr.version = state.version.clone();
        cvr.replica_version = state.replica_version.clone();
        cvr.last_active = state.last_active;
        cvr.clients = state.clients.clone();
        cvr.queries = state.queries.clone();
        for desire in state.desires.values() {
            if desire.deleted {
                continue;
            }
            if let Some(query) = cvr.queries.get_mut(&desire.query_hash) {
                query
                    .desired_by
                    .insert(desire.client_id.clone(), desire.patch_version.clone());
            }
            if let Some(client) = cvr.clients.get_mut(&desire.client_id) {
                client.desired_query_ids.insert(desire.query_hash.clone());
            }
        }

        Ok(CvrSnapshot { cvr, epoch })
    }

    fn flush(
        &self,
        expected: &FlushExpectation,
        changes: &CvrChanges,
        last_active: u64,
    ) -> Result<FlushStats, StoreError> {
        let mut groups = self.write();
        let state = groups
            .get_mut(&expected.group)
            .ok_or_else(|| StoreError::Corrupt {
                group: expected.group.clone(),
                detail: "instance row vanished".to_string(),
            })?;

        if state.epoch != Some(expected.epoch) {
            return Err(StoreError::Ownership {
                group: expected.group.clone(),
                owner: self.owner,
                holder: state.epoch.map(|e| e.owner),
                granted_at: state.epoch.map(|e| e.granted_at),
            });
        }
        if state.version != expected.version {
            return Err(StoreError::ConcurrentModification {
                group: expected.group.clone(),
                expected: expected.version.to_cookie(),
                actual: state.version.to_cookie(),
            });
        }
        let new_version = changes
            .version
            .clone()
            .unwrap_or_else(|| expected.version.clone());
        if new_version < expected.version {
            return Err(StoreError::Corrupt {
                group: expected.group.clone(),
                detail: format!(
                    "version would regress: {} -> {}",
                    expected.version, new_version
                ),
            });
        }

        let mut stats = FlushStats::default();
        state.version = new_version.clone();
        if let Some(replica) = &changes.replica_version {
            state.replica_version = Some(replica.clone());
        }
        state.last_active = last_active;

        for client in &changes.clients {
            state.clients.insert(client.id.clone(), strip_desires(client));
            stats.clients += 1;
        }
        for query in &changes.queries {
            state
                .queries
                .insert(query.id.clone(), strip_desired_by(query));
            stats.queries += 1;
        }
        for desire in &changes.desires {
            state.desires.insert(
                (desire.client_id.clone(), desire.query_hash.clone()),
                desire.clone(),
            );
            stats.desires += 1;
        }
        for row in &changes.rows {
            state.rows.insert(row.id.clone(), row.clone());
            stats.rows += 1;
        }
        for id in &changes.row_deletes {
            if state.rows.remove(id).is_some() {
                stats.rows_deleted += 1;
            }
        }
        if !changes.rows.is_empty() || !changes.row_deletes.is_empty() {
            state.rows_version = new_version;
        }
        Ok(stats)
    }

    fn load_rows(
        &self,
        group: &ClientGroupId,
        ids: &[RowId],
    ) -> Result<BTreeMap<RowId, RowRecord>, StoreError> {
        let groups = self.read();
        let Some(state) = groups.get(group) else {
            return Ok(BTreeMap::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| state.rows.get(id).map(|r| (id.clone(), r.clone())))
            .collect())
    }

    fn scan_rows(&self, group: &ClientGroupId) -> Result<Vec<RowRecord>, StoreError> {
        let groups = self.read();
        Ok(groups
            .get(group)
            .map(|state| state.rows.values().cloned().collect())
            .unwrap_or_default())
    }

    fn catchup_config_patches(
        &self,
        group: &ClientGroupId,
        after: &CvrVersion,
        upto: &CvrVersion,
    ) -> Result<Vec<PatchToVersion>, StoreError> {
        let groups = self.read();
        let Some(state) = groups.get(group) else {
            return Ok(Vec::new());
        };
        let config = ConfigState {
            clients: state.clients.values().cloned().collect(),
            queries: state.queries.values().cloned().collect(),
            desires: state.desires.values().cloned().collect(),
        };
        Ok(config_patches_in_range(&config, after, upto))
    }

    fn catchup_row_patches(
        &self,
        group: &ClientGroupId,
        after: &CvrVersion,
        upto: &CvrVersion,
        exclude_queries: &BTreeSet<QueryHash>,
        batch_size: usize,
    ) -> Result<Vec<Vec<RowRecord>>, StoreError> {
        let groups = self.read();
        let Some(state) = groups.get(group) else {
            return Ok(Vec::new());
        };
        let batch_size = batch_size.max(1);
        let mut records: Vec<RowRecord> = state
            .rows
            .values()
            .filter(|r| &r.patch_version > after && &r.patch_version <= upto)
            .filter(|r| !only_referenced_by(r, exclude_queries))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.patch_version.cmp(&b.patch_version));
        let mut batches = Vec::new();
        while !records.is_empty() {
            let rest = records.split_off(records.len().min(batch_size));
            batches.push(std::mem::replace(&mut records, rest));
        }
        Ok(batches)
    }

    fn inspect(&self, group: &ClientGroupId) -> Result<Option<InstanceRow>, StoreError> {
        let groups = self.read();
        Ok(groups.get(group).map(|state| InstanceRow {
            group: group.clone(),
            version: state.version.clone(),
            replica_version: state.replica_version.clone(),
            last_active: state.last_active,
            owner: state.epoch.map(|e| e.owner),
            granted_at: state.epoch.map(|e| e.granted_at),
        }))
    }
}

/// Desires are persisted in their own table; the client row itself does
/// not duplicate them.
fn strip_desires(client: &ClientRecord) -> ClientRecord {
    let mut stored = client.clone();
    stored.desired_query_ids.clear();
    stored
}

fn strip_desired_by(query: &QueryRecord) -> QueryRecord {
    let mut stored = query.clone();
    stored.desired_by.clear();
    stored
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn group() -> ClientGroupId {
        ClientGroupId::new("g1").unwrap()
    }

    #[test]
    fn load_flush_round_trip_matches_sqlite_semantics() {
        let store = MemoryCvrStore::new(Uuid::from_u128(1));
        let snapshot = store.load(&group(), 10).unwrap();
        assert!(snapshot.cvr.version.is_min());

        let v1 = CvrVersion::MIN.next_minor();
        let client_id = ClientId::new("c1").unwrap();
        let hash = QueryHash::new("q1").unwrap();
        let mut client = ClientRecord::new(client_id.clone(), v1.clone());
        client.desired_query_ids.insert(hash.clone());
        let mut query = QueryRecord::new(hash.clone(), json!({"table": "t"}));
        query.desired_by.insert(client_id.clone(), v1.clone());

        store
            .flush(
                &FlushExpectation {
                    group: group(),
                    version: CvrVersion::MIN,
                    epoch: snapshot.epoch,
                },
                &CvrChanges {
                    version: Some(v1.clone()),
                    clients: vec![client],
                    queries: vec![query],
                    desires: vec![DesireRow {
                        client_id: client_id.clone(),
                        query_hash: hash.clone(),
                        patch_version: v1.clone(),
                        deleted: false,
                    }],
                    ..CvrChanges::default()
                },
                11,
            )
            .unwrap();

        let reloaded = store.load(&group(), 12).unwrap();
        assert_eq!(reloaded.cvr.version, v1);
        assert!(
            reloaded.cvr.clients[&client_id]
                .desired_query_ids
                .contains(&hash)
        );
        assert_eq!(
            reloaded.cvr.queries[&hash].desired_by.get(&client_id),
            Some(&v1)
        );
        reloaded.cvr.check_invariants().unwrap();
    }

    #[test]
    fn peer_fencing() {
        let a = MemoryCvrStore::new(Uuid::from_u128(1));
        let b = a.peer(Uuid::from_u128(2));

        let snapshot_a = a.load(&group(), 100).unwrap();
        b.load(&group(), 200).unwrap();

        let err = a
            .flush(
                &FlushExpectation {
                    group: group(),
                    version: snapshot_a.cvr.version.clone(),
                    epoch: snapshot_a.epoch,
                },
                &CvrChanges::default(),
                300,
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::Ownership { .. }));
        assert!(a.load(&group(), 150).is_err());
    }

    #[test]
    fn empty_flush_only_touches_last_active() {
        let store = MemoryCvrStore::new(Uuid::from_u128(1));
        let snapshot = store.load(&group(), 10).unwrap();
        store
            .flush(
                &FlushExpectation {
                    group: group(),
                    version: CvrVersion::MIN,
                    epoch: snapshot.epoch,
                },
                &CvrChanges::default(),
                99,
            )
            .unwrap();
        let row = store.inspect(&group()).unwrap().unwrap();
        assert!(row.version.is_min());
        assert_eq!(row.last_active, 99);
    }
}
