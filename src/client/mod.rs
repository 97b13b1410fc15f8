//! Per-client connection handling: connect validation, socket registry,
//! patch translation, and catch-up.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::core::{
    ClientGroupId, ClientId, ConfigPatch, Cvr, CvrVersion, Patch, PatchOp, PatchToVersion,
    QueryHash, RowChange, RowRecord, StateVersion, client_row_id,
};
use crate::error::{Effect, Transience};
use crate::poke::{
    ClientPatchOp, PokeEnd, PokeError, PokePart, PokeStart, QueryPatchOp, RowPatchOp,
};
use crate::store::{CvrStore, StoreError};

/// Rows per poke part during catch-up.
pub const CATCHUP_BATCH_SIZE: usize = 256;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("method {0} not allowed")]
    MethodNotAllowed(String),
    #[error("malformed connect request: {0}")]
    BadRequest(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("client group deleted")]
    Gone,
    #[error("unexpected lmid: client {client} claims {claimed}, record has {recorded}")]
    UnexpectedLmid {
        client: ClientId,
        claimed: u64,
        recorded: u64,
    },
    #[error("unexpected base cookie {cookie} ahead of cvr version {version}")]
    UnexpectedBaseCookie { cookie: String, version: String },
    #[error("table {0} is not in the schema map")]
    UnknownTable(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Poke(#[from] PokeError),
    #[error("send to {client} failed: {reason}")]
    Send { client: ClientId, reason: String },
}

impl ClientError {
    /// HTTP status for the pre-upgrade phase of a connect request.
    pub fn status(&self) -> u16 {
        match self {
            ClientError::MethodNotAllowed(_) => 405,
            ClientError::BadRequest(_) => 400,
            ClientError::Unauthorized(_) => 401,
            ClientError::Gone => 410,
            _ => 500,
        }
    }

    pub fn transience(&self) -> Transience {
        match self {
            ClientError::Store(e) => e.transience(),
            ClientError::Poke(e) => e.transience(),
            ClientError::Send { .. } => Transience::Retryable,
            _ => Transience::Permanent,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            ClientError::Store(e) => e.effect(),
            ClientError::Send { .. } => Effect::Unknown,
            _ => Effect::None,
        }
    }
}

/// Parsed connect request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectParams {
    pub client_id: ClientId,
    pub base_cookie: Option<CvrVersion>,
    pub lmid: u64,
    pub ts: u64,
    pub user_id: Option<String>,
}

#[derive(Deserialize)]
struct IdentityClaims {
    #[serde(rename = "userID")]
    user_id: String,
}

/// Parses the upgrade request line: method, URL query string, and the
/// base64url identity header.
pub fn parse_connect(
    method: &str,
    query: &str,
    identity_header: Option<&str>,
) -> Result<ConnectParams, ClientError> {
    if method != "GET" {
        return Err(ClientError::MethodNotAllowed(method.to_string()));
    }

    let mut params: HashMap<&str, &str> = HashMap::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        params.insert(key, value);
    }

    let client_id = params
        .get("clientID")
        .ok_or_else(|| ClientError::BadRequest("missing clientID".to_string()))
        .and_then(|raw| {
            ClientId::new(*raw).map_err(|e| ClientError::BadRequest(e.to_string()))
        })?;
    let base_cookie = params
        .get("baseCookie")
        .filter(|raw| !raw.is_empty())
        .map(|raw| parse_cookie_param(raw))
        .transpose()?;
    let lmid = parse_int_param(&params, "lmid")?;
    let ts = parse_int_param(&params, "ts")?;

    let user_id = identity_header
        .map(|header| {
            let bytes = URL_SAFE_NO_PAD
                .decode(header)
                .map_err(|e| ClientError::Unauthorized(format!("bad identity encoding: {e}")))?;
            let claims: IdentityClaims = serde_json::from_slice(&bytes)
                .map_err(|e| ClientError::Unauthorized(format!("bad identity payload: {e}")))?;
            Ok::<_, ClientError>(claims.user_id)
        })
        .transpose()?;

    Ok(ConnectParams {
        client_id,
        base_cookie,
        lmid,
        ts,
        user_id,
    })
}

/// Cookies arrive either in canonical form or, from older clients, as a
/// plain integer state sequence.
fn parse_cookie_param(raw: &str) -> Result<CvrVersion, ClientError> {
    if let Ok(version) = CvrVersion::from_cookie(raw) {
        return Ok(version);
    }
    raw.parse::<u64>()
        .map(|seq| CvrVersion::new(StateVersion::from_seq(seq), 0))
        .map_err(|_| ClientError::BadRequest(format!("bad baseCookie {raw:?}")))
}

fn parse_int_param(params: &HashMap<&str, &str>, key: &str) -> Result<u64, ClientError> {
    params
        .get(key)
        .ok_or_else(|| ClientError::BadRequest(format!("missing {key}")))?
        .parse::<u64>()
        .map_err(|_| ClientError::BadRequest(format!("bad {key}")))
}

/// Checks a parsed connect request against the loaded CVR.
pub fn validate_connect(cvr: &Cvr, params: &ConnectParams) -> Result<(), ClientError> {
    let recorded = cvr
        .clients
        .get(&params.client_id)
        .map(|c| c.last_mutation_id)
        .unwrap_or(0);
    if params.lmid > recorded {
        // The group was likely deleted and recreated; the client's state
        // belongs to the old incarnation.
        return Err(ClientError::UnexpectedLmid {
            client: params.client_id.clone(),
            claimed: params.lmid,
            recorded,
        });
    }
    if let Some(base) = &params.base_cookie
        && base > &cvr.version
    {
        return Err(ClientError::UnexpectedBaseCookie {
            cookie: base.to_cookie(),
            version: cvr.version.to_cookie(),
        });
    }
    Ok(())
}

/// Frames sent down a client socket.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Downstream {
    Connected {
        #[serde(rename = "clientID")]
        client_id: ClientId,
        ts: u64,
    },
    PokeStart(PokeStart),
    PokePart(PokePart),
    PokeEnd(PokeEnd),
    Error {
        kind: String,
        message: String,
    },
}

/// Transport half of one client connection. The real daemon wraps a
/// WebSocket; tests use an in-memory recorder.
pub trait ClientConnection: Send {
    fn send(&mut self, frame: &Downstream) -> Result<(), String>;
    fn close(&mut self, reason: &str);
}

/// Live sockets of a client group. Reconnects replace the previous socket
/// atomically, closing the old one.
#[derive(Default)]
pub struct ClientRegistry {
    inner: Mutex<BTreeMap<ClientId, Box<dyn ClientConnection>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, client_id: ClientId, connection: Box<dyn ClientConnection>) {
        let mut inner = self.lock();
        if let Some(mut previous) = inner.insert(client_id.clone(), connection) {
            info!(client = %client_id, "replacing existing connection");
            previous.close("connection superseded");
        }
    }

    pub fn remove(&self, client_id: &ClientId) {
        self.lock().remove(client_id);
    }

    pub fn contains(&self, client_id: &ClientId) -> bool {
        self.lock().contains_key(client_id)
    }

    pub fn send_to(&self, client_id: &ClientId, frame: &Downstream) -> Result<(), ClientError> {
        let mut inner = self.lock();
        let Some(connection) = inner.get_mut(client_id) else {
            return Ok(());
        };
        if let Err(reason) = connection.send(frame) {
            inner.remove(client_id);
            return Err(ClientError::Send {
                client: client_id.clone(),
                reason,
            });
        }
        Ok(())
    }

    /// Sends to every connected client, dropping sockets that fail.
    pub fn broadcast(&self, frame: &Downstream) {
        let mut inner = self.lock();
        let mut dead = Vec::new();
        for (client_id, connection) in inner.iter_mut() {
            if let Err(reason) = connection.send(frame) {
                debug!(client = %client_id, reason, "dropping dead connection");
                dead.push(client_id.clone());
            }
        }
        for client_id in dead {
            inner.remove(&client_id);
        }
    }

    pub fn close_all(&self, reason: &str) {
        let mut inner = self.lock();
        for connection in inner.values_mut() {
            connection.close(reason);
        }
        inner.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<ClientId, Box<dyn ClientConnection>>> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Primary-key declarations used to derive client-visible row ids.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SchemaMap {
    tables: BTreeMap<String, Vec<String>>,
}

impl SchemaMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, table: impl Into<String>, primary_key: &[&str]) -> Self {
        self.tables.insert(
            table.into(),
            primary_key.iter().map(|c| c.to_string()).collect(),
        );
        self
    }

    pub fn primary_key(&self, table: &str) -> Option<&[String]> {
        self.tables.get(table).map(Vec::as_slice)
    }
}

/// Translates internal patches into one poke part. Patches at or below
/// `base` are skipped: the receiving client already holds them.
pub fn build_poke_part(
    poke_id: &str,
    base: &CvrVersion,
    patches: &[PatchToVersion],
    schema: &SchemaMap,
) -> Result<PokePart, ClientError> {
    let mut part = PokePart::new(poke_id);
    for entry in patches {
        if &entry.to_version <= base {
            continue;
        }
        match &entry.patch {
            Patch::Config(ConfigPatch::Client { op, id }) => {
                let op = match op {
                    PatchOp::Put => ClientPatchOp::Put {
                        client_id: id.clone(),
                    },
                    PatchOp::Del => ClientPatchOp::Del {
                        client_id: id.clone(),
                    },
                };
                part.clients_patch.get_or_insert_with(Vec::new).push(op);
            }
            Patch::Config(ConfigPatch::Query {
                op,
                id,
                client_id,
                ast,
            }) => {
                let wire_op = match op {
                    PatchOp::Put => QueryPatchOp::Put {
                        hash: id.as_str().to_string(),
                        ast: ast.clone(),
                    },
                    PatchOp::Del => QueryPatchOp::Del {
                        hash: id.as_str().to_string(),
                    },
                };
                match client_id {
                    Some(client) => part
                        .desired_queries_patches
                        .get_or_insert_with(BTreeMap::new)
                        .entry(client.clone())
                        .or_default()
                        .push(wire_op),
                    None => part
                        .got_queries_patch
                        .get_or_insert_with(Vec::new)
                        .push(wire_op),
                }
            }
            Patch::Row(change) => {
                let op = row_patch_op(change, schema)?;
                part.rows_patch.get_or_insert_with(Vec::new).push(op);
            }
        }
    }
    Ok(part)
}

fn row_patch_op(change: &RowChange, schema: &SchemaMap) -> Result<RowPatchOp, ClientError> {
    let row_id = change.row_id();
    let primary_key = schema
        .primary_key(&row_id.table)
        .ok_or_else(|| ClientError::UnknownTable(row_id.table.clone()))?;
    match change {
        RowChange::Put { contents, .. } => Ok(RowPatchOp::Put {
            table_name: row_id.table.clone(),
            value: contents.clone(),
        }),
        RowChange::Del { id } => {
            let client_id = client_row_id(&id.table, primary_key, &id.row_key)
                .ok_or_else(|| ClientError::UnknownTable(id.table.clone()))?;
            Ok(RowPatchOp::Del {
                table_name: id.table.clone(),
                id: client_id,
            })
        }
    }
}

fn row_record_patch(record: &RowRecord) -> PatchToVersion {
    let change = match &record.ref_counts {
        // Catch-up for live rows re-sends the identifying key; contents
        // stream through the hydration path.
        Some(_) => RowChange::Put {
            id: record.id.clone(),
            contents: serde_json::Value::Object(
                record
                    .id
                    .row_key
                    .columns()
                    .map(|(k, v)| (k.to_string(), v.clone()))
                    .collect(),
            ),
        },
        None => RowChange::Del {
            id: record.id.clone(),
        },
    };
    PatchToVersion::row(change, record.patch_version.clone())
}

/// Builds the catch-up poke frames for one client: configuration patches
/// in `(base, cvr.version]`, then row patches in the same interval, minus
/// rows owned solely by currently-hydrating queries.
#[allow(clippy::too_many_arguments)]
pub fn catchup_frames(
    store: &dyn CvrStore,
    group: &ClientGroupId,
    cvr: &Cvr,
    base: &CvrVersion,
    hydrating: &BTreeSet<QueryHash>,
    schema: &SchemaMap,
    poke_id: &str,
    batch_size: usize,
) -> Result<Vec<Downstream>, ClientError> {
    let mut frames = Vec::new();
    frames.push(Downstream::PokeStart(PokeStart {
        poke_id: poke_id.to_string(),
        base_cookie: (!base.is_min()).then(|| base.to_cookie()),
        cookie: cvr.version.to_cookie(),
        schema_versions: None,
    }));

    let config = store.catchup_config_patches(group, base, &cvr.version)?;
    let config_part = build_poke_part(poke_id, &CvrVersion::MIN, &config, schema)?;
    if !config_part.is_empty() {
        frames.push(Downstream::PokePart(config_part));
    }

    let batches = store.catchup_row_patches(group, base, &cvr.version, hydrating, batch_size)?;
    for batch in batches {
        let patches: Vec<PatchToVersion> = batch.iter().map(row_record_patch).collect();
        let part = build_poke_part(poke_id, &CvrVersion::MIN, &patches, schema)?;
        if !part.is_empty() {
            frames.push(Downstream::PokePart(part));
        }
    }

    frames.push(Downstream::PokeEnd(PokeEnd {
        poke_id: poke_id.to_string(),
        cancel: false,
    }));
    Ok(frames)
}
