//! CVR persistence boundary.
//!
//! The store owns everything durable about a client group: the instance
//! row (version + ownership lease), client/query/desire configuration, and
//! the row records. Two backends share the trait: SQLite for the daemon
//! and an in-memory map for tests. Writes go through optimistic
//! concurrency (version check) plus ownership fencing (owner, granted_at),
//! so a fleet of stateless syncers can never double-write one CVR.

mod memory;
mod sqlite;

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;
use uuid::Uuid;

use crate::core::{
    ClientGroupId, ClientId, ClientRecord, Cvr, CvrVersion, PatchToVersion, QueryHash,
    QueryRecord, RowId, RowRecord, StateVersion, VersionError,
};
use crate::error::{Effect, Transience};

pub use memory::MemoryCvrStore;
pub use sqlite::SqliteCvrStore;

/// The lease under which a syncer instance may mutate a CVR.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OwnershipEpoch {
    pub owner: Uuid,
    pub granted_at: u64,
}

/// Result of [`CvrStore::load`]: the config snapshot plus the lease epoch
/// that subsequent flushes must present.
#[derive(Clone, Debug)]
pub struct CvrSnapshot {
    pub cvr: Cvr,
    pub epoch: OwnershipEpoch,
}

/// What a flush asserts about the instance row before writing.
#[derive(Clone, Debug)]
pub struct FlushExpectation {
    pub group: ClientGroupId,
    pub version: CvrVersion,
    pub epoch: OwnershipEpoch,
}

/// One desire edge (client wants query) as persisted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DesireRow {
    pub client_id: ClientId,
    pub query_hash: QueryHash,
    pub patch_version: CvrVersion,
    pub deleted: bool,
}

/// Pending writes accumulated by an updater, applied in one transaction.
#[derive(Clone, Debug, Default)]
pub struct CvrChanges {
    /// New head version. Equal to the expected version for a
    /// lastActive-only flush.
    pub version: Option<CvrVersion>,
    pub replica_version: Option<StateVersion>,
    pub clients: Vec<ClientRecord>,
    pub queries: Vec<QueryRecord>,
    pub desires: Vec<DesireRow>,
    pub rows: Vec<RowRecord>,
    /// Hard deletes, used when an upstream row-key rename replaces a
    /// record in place (no tombstone is left behind).
    pub row_deletes: Vec<RowId>,
}

impl CvrChanges {
    pub fn is_config_empty(&self) -> bool {
        self.clients.is_empty() && self.queries.is_empty() && self.desires.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.is_config_empty()
            && self.rows.is_empty()
            && self.row_deletes.is_empty()
            && self.version.is_none()
            && self.replica_version.is_none()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub clients: usize,
    pub queries: usize,
    pub desires: usize,
    pub rows: usize,
    pub rows_deleted: usize,
}

/// Instance-row view for operational surfaces (`store status`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceRow {
    pub group: ClientGroupId,
    pub version: CvrVersion,
    pub replica_version: Option<StateVersion>,
    pub last_active: u64,
    pub owner: Option<Uuid>,
    pub granted_at: Option<u64>,
}

pub trait CvrStore: Send + Sync {
    /// Identity this store handle claims leases under.
    fn owner(&self) -> Uuid;

    /// Atomically reads the group's configuration and claims ownership at
    /// `last_connect`. A missing instance row is created at the minimum
    /// version. Fails with [`StoreError::Ownership`] when another owner
    /// holds a lease granted at or after `last_connect`.
    fn load(&self, group: &ClientGroupId, last_connect: u64) -> Result<CvrSnapshot, StoreError>;

    /// Applies `changes` in a single transaction after verifying the
    /// expected version and lease epoch. An empty change set still bumps
    /// `last_active`. Nothing is partially visible on failure.
    fn flush(
        &self,
        expected: &FlushExpectation,
        changes: &CvrChanges,
        last_active: u64,
    ) -> Result<FlushStats, StoreError>;

    /// Point-reads the row records for `ids`; absent rows are omitted.
    fn load_rows(
        &self,
        group: &ClientGroupId,
        ids: &[RowId],
    ) -> Result<BTreeMap<RowId, RowRecord>, StoreError>;

    /// All row records of the group, live and tombstoned.
    fn scan_rows(&self, group: &ClientGroupId) -> Result<Vec<RowRecord>, StoreError>;

    /// Configuration changes with patch version in `(after, upto]`,
    /// ascending by patch version.
    fn catchup_config_patches(
        &self,
        group: &ClientGroupId,
        after: &CvrVersion,
        upto: &CvrVersion,
    ) -> Result<Vec<PatchToVersion>, StoreError>;

    /// Row records with patch version in `(after, upto]`, batched. Rows
    /// whose only references are in `exclude_queries` are skipped; their
    /// contents arrive through the live hydration path instead. Intra-batch
    /// order is arbitrary but no record is omitted.
    fn catchup_row_patches(
        &self,
        group: &ClientGroupId,
        after: &CvrVersion,
        upto: &CvrVersion,
        exclude_queries: &BTreeSet<QueryHash>,
        batch_size: usize,
    ) -> Result<Vec<Vec<RowRecord>>, StoreError>;

    fn inspect(&self, group: &ClientGroupId) -> Result<Option<InstanceRow>, StoreError>;
}

/// Flat view of a group's persisted configuration, used to compute
/// catch-up patches identically across backends.
#[derive(Clone, Debug, Default)]
pub(crate) struct ConfigState {
    pub clients: Vec<ClientRecord>,
    pub queries: Vec<QueryRecord>,
    pub desires: Vec<DesireRow>,
}

pub(crate) fn config_patches_in_range(
    state: &ConfigState,
    after: &CvrVersion,
    upto: &CvrVersion,
) -> Vec<PatchToVersion> {
    use crate::core::{ConfigPatch, PatchOp};

    let in_range = |v: &CvrVersion| v > after && v <= upto;
    let ast_of = |hash: &QueryHash| {
        state
            .queries
            .iter()
            .find(|q| &q.id == hash)
            .map(|q| q.ast.clone())
    };

    let mut patches = Vec::new();
    for client in &state.clients {
        if in_range(&client.patch_version) {
            patches.push(PatchToVersion::config(
                ConfigPatch::Client {
                    op: if client.deleted { PatchOp::Del } else { PatchOp::Put },
                    id: client.id.clone(),
                },
                client.patch_version.clone(),
            ));
        }
    }
    for desire in &state.desires {
        if in_range(&desire.patch_version) {
            let op = if desire.deleted { PatchOp::Del } else { PatchOp::Put };
            patches.push(PatchToVersion::config(
                ConfigPatch::Query {
                    op,
                    id: desire.query_hash.clone(),
                    client_id: Some(desire.client_id.clone()),
                    ast: match op {
                        PatchOp::Put => ast_of(&desire.query_hash),
                        PatchOp::Del => None,
                    },
                },
                desire.patch_version.clone(),
            ));
        }
    }
    for query in &state.queries {
        if query.internal {
            continue;
        }
        if let Some(patch_version) = &query.patch_version
            && in_range(patch_version)
        {
            let op = if query.deleted { PatchOp::Del } else { PatchOp::Put };
            patches.push(PatchToVersion::config(
                ConfigPatch::Query {
                    op,
                    id: query.id.clone(),
                    client_id: None,
                    ast: match op {
                        PatchOp::Put => Some(query.ast.clone()),
                        PatchOp::Del => None,
                    },
                },
                patch_version.clone(),
            ));
        }
    }
    crate::core::sort_by_version(&mut patches);
    patches
}

/// Decides whether a loader may claim the lease.
///
/// A newer `last_connect` always wins; the same owner may re-claim its own
/// lease at the same instant (idempotent reconnect).
pub(crate) fn may_claim(
    current: Option<&OwnershipEpoch>,
    owner: Uuid,
    last_connect: u64,
) -> bool {
    match current {
        None => true,
        Some(epoch) => epoch.granted_at < last_connect || epoch.owner == owner,
    }
}

/// Whether a row record should be withheld from catch-up because every
/// reference it holds belongs to a query the client is re-hydrating.
pub(crate) fn only_referenced_by(record: &RowRecord, queries: &BTreeSet<QueryHash>) -> bool {
    match &record.ref_counts {
        None => false,
        Some(counts) => {
            !counts.is_empty() && counts.keys().all(|q| queries.contains(q))
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cvr {group} is owned by {holder:?} (granted at {granted_at:?}, we are {owner})")]
    Ownership {
        group: ClientGroupId,
        owner: Uuid,
        holder: Option<Uuid>,
        granted_at: Option<u64>,
    },
    #[error("cvr {group} was modified concurrently: expected {expected}, found {actual}")]
    ConcurrentModification {
        group: ClientGroupId,
        expected: String,
        actual: String,
    },
    #[error("stored version is invalid: {0}")]
    Version(#[from] VersionError),
    #[error("cvr {group} is corrupt: {detail}")]
    Corrupt { group: ClientGroupId, detail: String },
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl StoreError {
    pub fn transience(&self) -> Transience {
        match self {
            // A newer lease exists; retrying from this instance can never win.
            StoreError::Ownership { .. } => Transience::Permanent,
            // Reload and retry on a fresh snapshot.
            StoreError::ConcurrentModification { .. } => Transience::Retryable,
            StoreError::Version(_) | StoreError::Corrupt { .. } => Transience::Permanent,
            StoreError::Sqlite(_) => Transience::Unknown,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            // Flush and load are transactional: a failure leaves no writes.
            StoreError::Ownership { .. } | StoreError::ConcurrentModification { .. } => {
                Effect::None
            }
            StoreError::Version(_) | StoreError::Corrupt { .. } => Effect::None,
            StoreError::Sqlite(_) => Effect::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn claim_rules() {
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);
        let held = OwnershipEpoch {
            owner: a,
            granted_at: 100,
        };
        assert!(may_claim(None, b, 50));
        assert!(may_claim(Some(&held), b, 101));
        assert!(!may_claim(Some(&held), b, 100));
        assert!(!may_claim(Some(&held), b, 99));
        // Same owner re-claims its own lease.
        assert!(may_claim(Some(&held), a, 100));
    }

    #[test]
    fn exclusion_requires_every_reference() {
        let id = RowId::new(
            "public",
            "issues",
            crate::core::RowKey::single("id", json!("1")).unwrap(),
        );
        let q1 = QueryHash::new("q1").unwrap();
        let q2 = QueryHash::new("q2").unwrap();
        let mut counts = crate::core::RefCounts::new();
        counts.insert(q1.clone(), 1);
        counts.insert(q2.clone(), 1);
        let record = RowRecord {
            id: id.clone(),
            row_version: "01".into(),
            patch_version: CvrVersion::MIN,
            ref_counts: Some(counts),
        };

        let only_q1: BTreeSet<_> = [q1.clone()].into();
        let both: BTreeSet<_> = [q1, q2].into();
        assert!(!only_referenced_by(&record, &only_q1));
        assert!(only_referenced_by(&record, &both));

        let tombstone = RowRecord {
            id,
            row_version: "01".into(),
            patch_version: CvrVersion::MIN,
            ref_counts: None,
        };
        // Tombstones always replay through catch-up.
        assert!(!only_referenced_by(&tombstone, &both));
    }
}
