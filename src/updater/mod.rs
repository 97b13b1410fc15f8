//! State transitions over a loaded CVR snapshot.
//!
//! Three shapes share a base: a bare updater that only refreshes
//! `last_active`, a config-driven updater for client/query membership, and
//! a query-driven updater (own module) for row-set changes. An updater
//! borrows the snapshot for the duration of one update; after its flush
//! the snapshot is spent and the caller reloads.

mod query_driven;

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::core::{
    ClientGroupId, ClientId, ClientRecord, ConfigPatch, Cvr, CvrVersion, PatchOp,
    PatchToVersion, QueryHash, QueryRecord, RowId, RowRecord, StateVersion, VersionError,
};
use crate::error::{Effect, Transience};
use crate::store::{
    CvrChanges, CvrSnapshot, CvrStore, DesireRow, FlushExpectation, FlushStats, OwnershipEpoch,
    StoreError,
};

pub use query_driven::{QueryDrivenUpdater, ReceivedRow};

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Version(#[from] VersionError),
    #[error("{operation} is not valid in phase {phase}")]
    InvalidState {
        operation: &'static str,
        phase: &'static str,
    },
    #[error("cvr tracks replica {stored}, update supplied {supplied}; reset required")]
    ReplicaVersionMismatch {
        stored: StateVersion,
        supplied: StateVersion,
    },
}

impl UpdateError {
    pub fn transience(&self) -> Transience {
        match self {
            UpdateError::Store(e) => e.transience(),
            UpdateError::Version(_) => Transience::Permanent,
            // Updater misuse is a programming error, never retried.
            UpdateError::InvalidState { .. } => Transience::Permanent,
            UpdateError::ReplicaVersionMismatch { .. } => Transience::Permanent,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            UpdateError::Store(e) => e.effect(),
            _ => Effect::None,
        }
    }
}

/// Result of a successful flush: the post-flush CVR plus write stats.
#[derive(Clone, Debug)]
pub struct FlushOutcome {
    pub cvr: Cvr,
    pub stats: FlushStats,
}

/// Base updater: owns the snapshot, tracks the version transition and the
/// pending write set keyed for dedup.
#[derive(Debug)]
pub struct CvrUpdater {
    cvr: Cvr,
    epoch: OwnershipEpoch,
    expected_version: CvrVersion,
    new_version: CvrVersion,
    replica_version: Option<StateVersion>,
    touched_clients: BTreeSet<ClientId>,
    touched_queries: BTreeSet<QueryHash>,
    pending_desires: BTreeMap<(ClientId, QueryHash), DesireRow>,
    pending_rows: BTreeMap<RowId, RowRecord>,
    pending_row_deletes: BTreeSet<RowId>,
}

impl CvrUpdater {
    pub fn new(snapshot: CvrSnapshot) -> Self {
        let expected_version = snapshot.cvr.version.clone();
        Self {
            cvr: snapshot.cvr,
            epoch: snapshot.epoch,
            new_version: expected_version.clone(),
            expected_version,
            replica_version: None,
            touched_clients: BTreeSet::new(),
            touched_queries: BTreeSet::new(),
            pending_desires: BTreeMap::new(),
            pending_rows: BTreeMap::new(),
            pending_row_deletes: BTreeSet::new(),
        }
    }

    pub fn cvr(&self) -> &Cvr {
        &self.cvr
    }

    pub fn group(&self) -> &ClientGroupId {
        &self.cvr.id
    }

    pub fn updated_version(&self) -> &CvrVersion {
        &self.new_version
    }

    /// First effective change of a flush bumps the minor version; later
    /// ones reuse it. Query-driven updates may have pre-advanced the state
    /// version, in which case this is already distinct from the expected
    /// version and sticks.
    fn ensure_new_version(&mut self) -> CvrVersion {
        if self.new_version == self.expected_version {
            self.new_version = self.expected_version.next_minor();
        }
        self.new_version.clone()
    }

    fn has_changes(&self) -> bool {
        self.new_version != self.expected_version
            || !self.touched_clients.is_empty()
            || !self.touched_queries.is_empty()
            || !self.pending_desires.is_empty()
            || !self.pending_rows.is_empty()
            || !self.pending_row_deletes.is_empty()
            || self.replica_version.is_some()
    }

    /// Persists all pending mutations in one store transaction and returns
    /// the post-flush CVR. With no pending changes this still refreshes
    /// `last_active` (presence recording).
    pub fn flush(mut self, store: &dyn CvrStore, now: u64) -> Result<FlushOutcome, UpdateError> {
        let expected = FlushExpectation {
            group: self.cvr.id.clone(),
            version: self.expected_version.clone(),
            epoch: self.epoch,
        };
        let changes = CvrChanges {
            version: (self.new_version != self.expected_version)
                .then(|| self.new_version.clone()),
            replica_version: self.replica_version.take(),
            clients: self
                .touched_clients
                .iter()
                .filter_map(|id| self.cvr.clients.get(id).cloned())
                .collect(),
            queries: self
                .touched_queries
                .iter()
                .filter_map(|id| self.cvr.queries.get(id).cloned())
                .collect(),
            desires: self.pending_desires.values().cloned().collect(),
            rows: self.pending_rows.values().cloned().collect(),
            row_deletes: self.pending_row_deletes.iter().cloned().collect(),
        };
        let stats = store.flush(&expected, &changes, now)?;
        self.cvr.version = self.new_version.clone();
        self.cvr.last_active = now;
        debug!(
            group = %self.cvr.id,
            version = %self.cvr.version,
            changed = self.has_changes(),
            "cvr update flushed"
        );
        Ok(FlushOutcome {
            cvr: self.cvr,
            stats,
        })
    }
}

/// Applies client/query configuration edits, emitting the externally
/// visible patches for each operation.
pub struct ConfigDrivenUpdater {
    inner: CvrUpdater,
}

impl ConfigDrivenUpdater {
    pub fn new(snapshot: CvrSnapshot) -> Self {
        Self {
            inner: CvrUpdater::new(snapshot),
        }
    }

    pub fn cvr(&self) -> &Cvr {
        self.inner.cvr()
    }

    pub fn updated_version(&self) -> &CvrVersion {
        self.inner.updated_version()
    }

    /// Registers `queries` as desired by `client_id`, creating the client
    /// on first contact and resurrecting soft-deleted queries. Returns the
    /// patches describing every effective change, in application order.
    pub fn put_desired_queries(
        &mut self,
        client_id: &ClientId,
        queries: &[(QueryHash, Value)],
    ) -> Vec<PatchToVersion> {
        let mut patches = Vec::new();

        let client_known = self
            .inner
            .cvr
            .clients
            .get(client_id)
            .is_some_and(|c| !c.deleted);
        if !client_known {
            let version = self.inner.ensure_new_version();
            let record = self
                .inner
                .cvr
                .clients
                .entry(client_id.clone())
                .or_insert_with(|| ClientRecord::new(client_id.clone(), version.clone()));
            record.deleted = false;
            record.patch_version = version.clone();
            self.inner.touched_clients.insert(client_id.clone());
            patches.push(PatchToVersion::config(
                ConfigPatch::Client {
                    op: PatchOp::Put,
                    id: client_id.clone(),
                },
                version,
            ));
        }

        for (hash, ast) in queries {
            let already_desired = self
                .inner
                .cvr
                .queries
                .get(hash)
                .is_some_and(|q| !q.deleted && q.desired_by.contains_key(client_id));
            if already_desired {
                continue;
            }
            let version = self.inner.ensure_new_version();
            let query = self
                .inner
                .cvr
                .queries
                .entry(hash.clone())
                .or_insert_with(|| QueryRecord::new(hash.clone(), ast.clone()));
            if query.deleted {
                // Resurrection resets the query to "not got"; it will be
                // re-hydrated under a fresh transformation.
                query.deleted = false;
                query.transformation_hash = None;
                query.transformation_version = None;
                query.patch_version = None;
                query.ast = ast.clone();
            }
            query.desired_by.insert(client_id.clone(), version.clone());
            self.inner
                .cvr
                .clients
                .get_mut(client_id)
                .expect("client upserted above")
                .desired_query_ids
                .insert(hash.clone());
            self.inner.touched_queries.insert(hash.clone());
            self.inner.pending_desires.insert(
                (client_id.clone(), hash.clone()),
                DesireRow {
                    client_id: client_id.clone(),
                    query_hash: hash.clone(),
                    patch_version: version.clone(),
                    deleted: false,
                },
            );
            patches.push(PatchToVersion::config(
                ConfigPatch::Query {
                    op: PatchOp::Put,
                    id: hash.clone(),
                    client_id: Some(client_id.clone()),
                    ast: Some(ast.clone()),
                },
                version,
            ));
        }
        patches
    }

    /// Withdraws desires; a query nobody desires and that was never
    /// hydrated is soft-deleted on the spot (hydrated ones are removed by
    /// the query-driven updater once the pipeline drops them).
    pub fn delete_desired_queries(
        &mut self,
        client_id: &ClientId,
        queries: &[QueryHash],
    ) -> Vec<PatchToVersion> {
        let mut patches = Vec::new();
        for hash in queries {
            let desired = self
                .inner
                .cvr
                .clients
                .get(client_id)
                .is_some_and(|c| c.desired_query_ids.contains(hash));
            if !desired {
                continue;
            }
            let version = self.inner.ensure_new_version();
            if let Some(client) = self.inner.cvr.clients.get_mut(client_id) {
                client.desired_query_ids.remove(hash);
            }
            self.inner.pending_desires.insert(
                (client_id.clone(), hash.clone()),
                DesireRow {
                    client_id: client_id.clone(),
                    query_hash: hash.clone(),
                    patch_version: version.clone(),
                    deleted: true,
                },
            );
            patches.push(PatchToVersion::config(
                ConfigPatch::Query {
                    op: PatchOp::Del,
                    id: hash.clone(),
                    client_id: Some(client_id.clone()),
                    ast: None,
                },
                version.clone(),
            ));

            if let Some(query) = self.inner.cvr.queries.get_mut(hash) {
                query.desired_by.remove(client_id);
                if query.desired_by.is_empty() && !query.is_got() && !query.internal {
                    query.deleted = true;
                    query.patch_version = Some(version);
                    self.inner.touched_queries.insert(hash.clone());
                }
            }
        }
        patches
    }

    pub fn clear_desired_queries(&mut self, client_id: &ClientId) -> Vec<PatchToVersion> {
        let current: Vec<QueryHash> = self
            .inner
            .cvr
            .clients
            .get(client_id)
            .map(|c| c.desired_query_ids.iter().cloned().collect())
            .unwrap_or_default();
        self.delete_desired_queries(client_id, &current)
    }

    /// Records a confirmed mutation id for a client without emitting any
    /// patch; travels to clients through `lastMutationIDChanges`.
    pub fn record_mutation_id(&mut self, client_id: &ClientId, last_mutation_id: u64) {
        if let Some(client) = self.inner.cvr.clients.get_mut(client_id)
            && client.last_mutation_id < last_mutation_id
        {
            client.last_mutation_id = last_mutation_id;
            self.inner.touched_clients.insert(client_id.clone());
        }
    }

    pub fn flush(self, store: &dyn CvrStore, now: u64) -> Result<FlushOutcome, UpdateError> {
        self.inner.flush(store, now)
    }
}
