//! Internal patch records produced by updaters and catch-up reads.
//!
//! These are the pre-wire form: they reference rows by [`RowId`] and carry
//! the CVR version the patch brings a client up to. The poke pipeline
//! translates them into client-visible frames.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ids::{ClientId, QueryHash, RowId};
use super::version::CvrVersion;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOp {
    Put,
    Del,
}

/// Configuration-level patch: membership of clients and queries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ConfigPatch {
    Client {
        op: PatchOp,
        id: ClientId,
    },
    /// A query patch scoped to one client describes a *desire*; unscoped it
    /// describes the group-wide *got* set.
    Query {
        op: PatchOp,
        id: QueryHash,
        #[serde(skip_serializing_if = "Option::is_none")]
        client_id: Option<ClientId>,
        #[serde(skip_serializing_if = "Option::is_none")]
        ast: Option<Value>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum RowChange {
    Put {
        id: RowId,
        contents: Value,
    },
    Del {
        id: RowId,
    },
}

impl RowChange {
    pub fn row_id(&self) -> &RowId {
        match self {
            RowChange::Put { id, .. } | RowChange::Del { id } => id,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Patch {
    Config(ConfigPatch),
    Row(RowChange),
}

/// A patch together with the version it advances a client to.
///
/// `to_version` may lag the CVR head: a row already present at an older
/// version keeps its original patch version, which lets reconnecting
/// clients skip everything at or below their cookie.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchToVersion {
    pub patch: Patch,
    pub to_version: CvrVersion,
}

impl PatchToVersion {
    pub fn config(patch: ConfigPatch, to_version: CvrVersion) -> Self {
        Self {
            patch: Patch::Config(patch),
            to_version,
        }
    }

    pub fn row(change: RowChange, to_version: CvrVersion) -> Self {
        Self {
            patch: Patch::Row(change),
            to_version,
        }
    }
}

/// Ascending patch-version order with a stable tie-break so one flush's
/// emissions keep their insertion order.
pub fn sort_by_version(patches: &mut Vec<PatchToVersion>) {
    patches.sort_by(|a, b| a.to_version.cmp(&b.to_version));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::version::StateVersion;

    fn v(seq: u64, minor: u64) -> CvrVersion {
        CvrVersion::new(StateVersion::from_seq(seq), minor)
    }

    #[test]
    fn sort_is_stable_within_a_version() {
        let c1 = ClientId::new("c1").unwrap();
        let q1 = QueryHash::new("q1").unwrap();
        let q2 = QueryHash::new("q2").unwrap();
        let mut patches = vec![
            PatchToVersion::config(
                ConfigPatch::Query {
                    op: PatchOp::Put,
                    id: q1.clone(),
                    client_id: Some(c1.clone()),
                    ast: None,
                },
                v(1, 1),
            ),
            PatchToVersion::config(
                ConfigPatch::Query {
                    op: PatchOp::Put,
                    id: q2.clone(),
                    client_id: Some(c1.clone()),
                    ast: None,
                },
                v(1, 1),
            ),
            PatchToVersion::config(
                ConfigPatch::Client {
                    op: PatchOp::Put,
                    id: c1,
                },
                v(1, 0),
            ),
        ];
        sort_by_version(&mut patches);
        assert_eq!(patches[0].to_version, v(1, 0));
        // q1 was inserted before q2 at the same version and stays first.
        match &patches[1].patch {
            Patch::Config(ConfigPatch::Query { id, .. }) => assert_eq!(id, &q1),
            other => panic!("unexpected patch {other:?}"),
        }
        match &patches[2].patch {
            Patch::Config(ConfigPatch::Query { id, .. }) => assert_eq!(id, &q2),
            other => panic!("unexpected patch {other:?}"),
        }
    }
}
