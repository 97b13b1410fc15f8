//! Poke frame and patch-op wire types (JSON, camelCase).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{ClientId, CvrVersion};

use super::PokeError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaVersions {
    pub min_supported: u32,
    pub max_supported: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PokeStart {
    #[serde(rename = "pokeID")]
    pub poke_id: String,
    /// Absent when the poke starts from the minimum version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_cookie: Option<String>,
    pub cookie: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_versions: Option<SchemaVersions>,
}

impl PokeStart {
    pub fn base_version(&self) -> Result<CvrVersion, PokeError> {
        match &self.base_cookie {
            None => Ok(CvrVersion::MIN),
            Some(cookie) => Ok(CvrVersion::from_cookie(cookie)?),
        }
    }

    pub fn cookie_version(&self) -> Result<CvrVersion, PokeError> {
        Ok(CvrVersion::from_cookie(&self.cookie)?)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PokePart {
    #[serde(rename = "pokeID")]
    pub poke_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_mutation_id_changes: Option<BTreeMap<ClientId, u64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clients_patch: Option<Vec<ClientPatchOp>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_queries_patches: Option<BTreeMap<ClientId, Vec<QueryPatchOp>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub got_queries_patch: Option<Vec<QueryPatchOp>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows_patch: Option<Vec<RowPatchOp>>,
}

impl PokePart {
    pub fn new(poke_id: impl Into<String>) -> Self {
        Self {
            poke_id: poke_id.into(),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.last_mutation_id_changes.is_none()
            && self.clients_patch.is_none()
            && self.desired_queries_patches.is_none()
            && self.got_queries_patch.is_none()
            && self.rows_patch.is_none()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PokeEnd {
    #[serde(rename = "pokeID")]
    pub poke_id: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cancel: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum ClientPatchOp {
    Put {
        #[serde(rename = "clientID")]
        client_id: ClientId,
    },
    Del {
        #[serde(rename = "clientID")]
        client_id: ClientId,
    },
    Clear,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum QueryPatchOp {
    Put {
        hash: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ast: Option<Value>,
    },
    Del {
        hash: String,
    },
    Clear,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum RowPatchOp {
    Put {
        table_name: String,
        value: Value,
    },
    Del {
        table_name: String,
        id: String,
    },
    Update {
        table_name: String,
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        merge: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        constrain: Option<Vec<String>>,
    },
    Clear,
}

/// A fully accumulated poke: the start frame plus its committed parts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PokeBody {
    pub start: PokeStart,
    pub parts: Vec<PokePart>,
}

impl PokeBody {
    pub fn new(start: PokeStart) -> Self {
        Self {
            start,
            parts: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frames_serialize_camel_case() {
        let start = PokeStart {
            poke_id: "p1".to_string(),
            base_cookie: Some("00".to_string()),
            cookie: "01".to_string(),
            schema_versions: None,
        };
        let encoded = serde_json::to_value(&start).unwrap();
        assert_eq!(
            encoded,
            json!({"pokeID": "p1", "baseCookie": "00", "cookie": "01"})
        );
    }

    #[test]
    fn row_patch_ops_are_tagged() {
        let op = RowPatchOp::Del {
            table_name: "issues".to_string(),
            id: "e/issues/123".to_string(),
        };
        let encoded = serde_json::to_value(&op).unwrap();
        assert_eq!(
            encoded,
            json!({"op": "del", "tableName": "issues", "id": "e/issues/123"})
        );
    }

    #[test]
    fn end_frame_omits_default_cancel() {
        let end = PokeEnd {
            poke_id: "p1".to_string(),
            cancel: false,
        };
        assert_eq!(
            serde_json::to_value(&end).unwrap(),
            json!({"pokeID": "p1"})
        );
        let cancelled: PokeEnd =
            serde_json::from_value(json!({"pokeID": "p1", "cancel": true})).unwrap();
        assert!(cancelled.cancel);
    }

    #[test]
    fn absent_base_cookie_is_minimum() {
        let start = PokeStart {
            poke_id: "p".to_string(),
            base_cookie: None,
            cookie: "00".to_string(),
            schema_versions: None,
        };
        assert!(start.base_version().unwrap().is_min());
    }
}
