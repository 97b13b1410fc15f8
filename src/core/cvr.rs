//! The client view record: what every client in a group currently holds.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::ids::{ClientGroupId, ClientId, QueryHash, RowId};
use super::version::{CvrVersion, StateVersion};

/// Per-client bookkeeping inside a CVR.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRecord {
    pub id: ClientId,
    /// CVR version at which this client became known (or was deleted).
    pub patch_version: CvrVersion,
    pub desired_query_ids: BTreeSet<QueryHash>,
    /// Highest mutation id confirmed for this client. Used to validate
    /// reconnects: a client claiming a higher lmid than we recorded is
    /// talking about a different group incarnation.
    pub last_mutation_id: u64,
    pub deleted: bool,
}

impl ClientRecord {
    pub fn new(id: ClientId, patch_version: CvrVersion) -> Self {
        Self {
            id,
            patch_version,
            desired_query_ids: BTreeSet::new(),
            last_mutation_id: 0,
            deleted: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRecord {
    pub id: QueryHash,
    pub ast: Value,
    /// Set once the query has been hydrated ("got"); cleared again when a
    /// soft-deleted query is resurrected.
    pub transformation_hash: Option<String>,
    pub transformation_version: Option<CvrVersion>,
    /// Version at which the query entered (or left) the got set.
    pub patch_version: Option<CvrVersion>,
    pub desired_by: BTreeMap<ClientId, CvrVersion>,
    pub internal: bool,
    pub deleted: bool,
}

impl QueryRecord {
    pub fn new(id: QueryHash, ast: Value) -> Self {
        Self {
            id,
            ast,
            transformation_hash: None,
            transformation_version: None,
            patch_version: None,
            desired_by: BTreeMap::new(),
            internal: false,
            deleted: false,
        }
    }

    pub fn is_got(&self) -> bool {
        self.transformation_hash.is_some()
    }

    pub fn is_desired(&self) -> bool {
        !self.desired_by.is_empty()
    }
}

/// Reference counts a row holds per query, or `None` for a tombstone.
pub type RefCounts = BTreeMap<QueryHash, i64>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowRecord {
    pub id: RowId,
    /// Version of the row contents as reported by the replica.
    pub row_version: String,
    /// CVR version at which this row last changed visibly.
    pub patch_version: CvrVersion,
    /// `None` marks a tombstone retained for catch-up deletion replay.
    pub ref_counts: Option<RefCounts>,
}

impl RowRecord {
    pub fn is_live(&self) -> bool {
        self.ref_counts
            .as_ref()
            .is_some_and(|counts| counts.values().any(|&n| n > 0))
    }

    pub fn is_tombstone(&self) -> bool {
        self.ref_counts.is_none()
    }
}

/// Merges refcount deltas into an existing count map.
///
/// A delta of zero asserts continued reference without changing the count.
/// Entries whose count reaches zero are dropped; an empty result collapses
/// to `None` (the row is no longer referenced by any query).
pub fn merge_ref_counts(existing: Option<&RefCounts>, deltas: &RefCounts) -> Option<RefCounts> {
    let mut merged = existing.cloned().unwrap_or_default();
    for (query, delta) in deltas {
        let entry = merged.entry(query.clone()).or_insert(0);
        *entry += delta;
        if *entry <= 0 {
            merged.remove(query);
        }
    }
    if merged.is_empty() { None } else { Some(merged) }
}

/// In-memory snapshot of a CVR. Row records stay in the store and are read
/// lazily; they are never part of this aggregate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cvr {
    pub id: ClientGroupId,
    pub version: CvrVersion,
    /// Replica identity at first hydration; a mismatch on a later update
    /// forces the caller to reset.
    pub replica_version: Option<StateVersion>,
    pub last_active: u64,
    pub clients: BTreeMap<ClientId, ClientRecord>,
    pub queries: BTreeMap<QueryHash, QueryRecord>,
}

impl Cvr {
    pub fn new(id: ClientGroupId) -> Self {
        Self {
            id,
            version: CvrVersion::MIN,
            replica_version: None,
            last_active: 0,
            clients: BTreeMap::new(),
            queries: BTreeMap::new(),
        }
    }

    /// Queries currently desired by at least one non-deleted client.
    pub fn desired_queries(&self) -> impl Iterator<Item = &QueryRecord> {
        self.queries.values().filter(|q| {
            !q.deleted
                && q.desired_by
                    .keys()
                    .any(|c| self.clients.get(c).is_some_and(|c| !c.deleted))
        })
    }

    /// Checks the structural invariants that must hold after every flush.
    pub fn check_invariants(&self) -> Result<(), CvrIntegrityError> {
        for client in self.clients.values() {
            if client.deleted {
                continue;
            }
            for query_id in &client.desired_query_ids {
                let query = self.queries.get(query_id).ok_or_else(|| {
                    CvrIntegrityError::DanglingDesire {
                        client: client.id.clone(),
                        query: query_id.clone(),
                    }
                })?;
                if !query.desired_by.contains_key(&client.id) {
                    return Err(CvrIntegrityError::AsymmetricDesire {
                        client: client.id.clone(),
                        query: query_id.clone(),
                    });
                }
            }
        }
        for query in self.queries.values() {
            for (version, what) in [
                (query.patch_version.as_ref(), "patch"),
                (query.transformation_version.as_ref(), "transformation"),
            ] {
                if let Some(version) = version
                    && version > &self.version
                {
                    return Err(CvrIntegrityError::VersionAhead {
                        what,
                        version: version.clone(),
                        head: self.version.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CvrIntegrityError {
    #[error("client {client} desires unknown query {query}")]
    DanglingDesire { client: ClientId, query: QueryHash },
    #[error("query {query} does not list desiring client {client}")]
    AsymmetricDesire { client: ClientId, query: QueryHash },
    #[error("{what} version {version} is ahead of CVR head {head}")]
    VersionAhead {
        what: &'static str,
        version: CvrVersion,
        head: CvrVersion,
    },
}
