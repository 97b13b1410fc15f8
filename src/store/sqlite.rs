//! SQLite-backed CVR store.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OpenFlags, OptionalExtension, Transaction, params};
use tracing::debug;
use uuid::Uuid;

use crate::core::{
    ClientGroupId, ClientId, ClientRecord, Cvr, CvrVersion, PatchToVersion, QueryHash,
    QueryRecord, RowId, RowKey, RowRecord, StateVersion,
};

use super::{
    ConfigState, CvrChanges, CvrSnapshot, CvrStore, DesireRow, FlushExpectation, FlushStats,
    InstanceRow, OwnershipEpoch, StoreError, config_patches_in_range, may_claim,
    only_referenced_by,
};

const SCHEMA_VERSION: u32 = 1;
const BUSY_TIMEOUT_MS: u64 = 5_000;
const CACHE_SIZE_KB: i64 = -8_000;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS instances (
    client_group_id TEXT PRIMARY KEY,
    version         TEXT NOT NULL,
    replica_version TEXT,
    last_active     INTEGER NOT NULL,
    owner           TEXT,
    granted_at      INTEGER
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS clients (
    client_group_id  TEXT NOT NULL,
    client_id        TEXT NOT NULL,
    patch_version    TEXT NOT NULL,
    last_mutation_id INTEGER NOT NULL DEFAULT 0,
    deleted          INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (client_group_id, client_id)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS queries (
    client_group_id        TEXT NOT NULL,
    query_hash             TEXT NOT NULL,
    client_ast             TEXT NOT NULL,
    transformation_hash    TEXT,
    transformation_version TEXT,
    patch_version          TEXT,
    internal               INTEGER NOT NULL DEFAULT 0,
    deleted                INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (client_group_id, query_hash)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS desires (
    client_group_id TEXT NOT NULL,
    client_id       TEXT NOT NULL,
    query_hash      TEXT NOT NULL,
    patch_version   TEXT NOT NULL,
    deleted         INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (client_group_id, client_id, query_hash)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS rows (
    client_group_id TEXT NOT NULL,
    schema          TEXT NOT NULL,
    tbl             TEXT NOT NULL,
    row_key         TEXT NOT NULL,
    row_version     TEXT NOT NULL,
    ref_counts      TEXT,
    patch_version   TEXT NOT NULL,
    PRIMARY KEY (client_group_id, schema, tbl, row_key)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS rows_by_patch_version
    ON rows (client_group_id, patch_version);

CREATE TABLE IF NOT EXISTS rows_version (
    client_group_id TEXT PRIMARY KEY,
    version         TEXT NOT NULL
) WITHOUT ROWID;
";

pub struct SqliteCvrStore {
    conn: Mutex<Connection>,
    owner: Uuid,
}

impl SqliteCvrStore {
    pub fn open(path: &Path, owner: Uuid) -> Result<Self, StoreError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )?;
        Self::init(conn, owner)
    }

    pub fn open_in_memory(owner: Uuid) -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, owner)
    }

    fn init(conn: Connection, owner: Uuid) -> Result<Self, StoreError> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "cache_size", CACHE_SIZE_KB)?;
        conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS))?;
        conn.execute_batch(SCHEMA)?;

        let stored: Option<String> = conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        match stored {
            None => {
                conn.execute(
                    "INSERT INTO meta (key, value) VALUES ('schema_version', ?1)",
                    params![SCHEMA_VERSION.to_string()],
                )?;
            }
            Some(value) if value == SCHEMA_VERSION.to_string() => {}
            Some(value) => {
                return Err(StoreError::Corrupt {
                    group: ClientGroupId::new("-").expect("static id"),
                    detail: format!(
                        "schema version mismatch: expected {SCHEMA_VERSION}, got {value}"
                    ),
                });
            }
        }

        Ok(Self {
            conn: Mutex::new(conn),
            owner,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CvrStore for SqliteCvrStore {
    fn owner(&self) -> Uuid {
        self.owner
    }

    fn load(&self, group: &ClientGroupId, last_connect: u64) -> Result<CvrSnapshot, StoreError> {
        let mut conn = self.lock();
        let txn = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

        let instance = read_instance(&txn, group)?;
        let epoch = match &instance {
            None => {
                txn.execute(
                    "INSERT INTO instances \
                     (client_group_id, version, replica_version, last_active, owner, granted_at) \
                     VALUES (?1, '', NULL, ?2, ?3, ?4)",
                    params![
                        group.as_str(),
                        last_connect,
                        self.owner.to_string(),
                        last_connect
                    ],
                )?;
                debug!(group = %group, "created cvr instance");
                OwnershipEpoch {
                    owner: self.owner,
                    granted_at: last_connect,
                }
            }
            Some(row) => {
                let current = row.epoch();
                if !may_claim(current.as_ref(), self.owner, last_connect) {
                    return Err(StoreError::Ownership {
                        group: group.clone(),
                        owner: self.owner,
                        holder: row.owner,
                        granted_at: row.granted_at,
                    });
                }
                // Keep the later grant when re-claiming our own lease.
                let granted_at = match &current {
                    Some(epoch) if epoch.owner == self.owner => {
                        epoch.granted_at.max(last_connect)
                    }
                    _ => last_connect,
                };
                txn.execute(
                    "UPDATE instances SET owner = ?2, granted_at = ?3 \
                     WHERE client_group_id = ?1",
                    params![group.as_str(), self.owner.to_string(), granted_at],
                )?;
                OwnershipEpoch {
                    owner: self.owner,
                    granted_at,
                }
            }
        };

        let mut cvr = match instance {
            Some(row) => Cvr {
                id: group.clone(),
                version: row.version,
                replica_version: row.replica_version,
                last_active: row.last_active,
                clients: BTreeMap::new(),
                queries: BTreeMap::new(),
            },
            None => Cvr::new(group.clone()),
        };

        let config = read_config(&txn, group)?;
        for client in config.clients {
            cvr.clients.insert(client.id.clone(), client);
        }
        for query in config.queries {
            cvr.queries.insert(query.id.clone(), query);
        }
        for desire in config.desires {
            if desire.deleted {
                continue;
            }
            if let Some(query) = cvr.queries.get_mut(&desire.query_hash) {
                query
                    .desired_by
                    .insert(desire.client_id.clone(), desire.patch_version.clone());
            }
            if let Some(client) = cvr.clients.get_mut(&desire.client_id) {
                client.desired_query_ids.insert(desire.query_hash);
            }
        }

        txn.commit()?;
        Ok(CvrSnapshot { cvr, epoch })
    }

    fn flush(
        &self,
        expected: &FlushExpectation,
        changes: &CvrChanges,
        last_active: u64,
    ) -> Result<FlushStats, StoreError> {
        let group = &expected.group;
        let mut conn = self.lock();
        let txn = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

        let instance = read_instance(&txn, group)?.ok_or_else(|| StoreError::Corrupt {
            group: group.clone(),
            detail: "instance row vanished".to_string(),
        })?;
        if instance.epoch() != Some(expected.epoch) {
            return Err(StoreError::Ownership {
                group: group.clone(),
                owner: self.owner,
                holder: instance.owner,
                granted_at: instance.granted_at,
            });
        }
        if instance.version != expected.version {
            return Err(StoreError::ConcurrentModification {
                group: group.clone(),
                expected: expected.version.to_cookie(),
                actual: instance.version.to_cookie(),
            });
        }

        let new_version = changes.version.as_ref().unwrap_or(&expected.version);
        if new_version < &expected.version {
            return Err(StoreError::Corrupt {
                group: group.clone(),
                detail: format!(
                    "version would regress: {} -> {}",
                    expected.version, new_version
                ),
            });
        }
        let replica_version = changes
            .replica_version
            .clone()
            .or(instance.replica_version);

        txn.execute(
            "UPDATE instances SET version = ?2, replica_version = ?3, last_active = ?4 \
             WHERE client_group_id = ?1",
            params![
                group.as_str(),
                new_version.to_cookie(),
                replica_version.as_ref().map(StateVersion::as_str),
                last_active
            ],
        )?;

        let mut stats = FlushStats::default();
        for client in &changes.clients {
            txn.execute(
                "INSERT OR REPLACE INTO clients \
                 (client_group_id, client_id, patch_version, last_mutation_id, deleted) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    group.as_str(),
                    client.id.as_str(),
                    client.patch_version.to_cookie(),
                    client.last_mutation_id,
                    client.deleted
                ],
            )?;
            stats.clients += 1;
        }
        for query in &changes.queries {
            txn.execute(
                "INSERT OR REPLACE INTO queries \
                 (client_group_id, query_hash, client_ast, transformation_hash, \
                  transformation_version, patch_version, internal, deleted) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    group.as_str(),
                    query.id.as_str(),
                    serde_json::to_string(&query.ast).map_err(|e| StoreError::Corrupt {
                        group: group.clone(),
                        detail: format!("unserializable ast: {e}"),
                    })?,
                    query.transformation_hash,
                    query
                        .transformation_version
                        .as_ref()
                        .map(CvrVersion::to_cookie),
                    query.patch_version.as_ref().map(CvrVersion::to_cookie),
                    query.internal,
                    query.deleted
                ],
            )?;
            stats.queries += 1;
        }
        for desire in &changes.desires {
            txn.execute(
                "INSERT OR REPLACE INTO desires \
                 (client_group_id, client_id, query_hash, patch_version, deleted) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    group.as_str(),
                    desire.client_id.as_str(),
                    desire.query_hash.as_str(),
                    desire.patch_version.to_cookie(),
                    desire.deleted
                ],
            )?;
            stats.desires += 1;
        }
        for row in &changes.rows {
            let ref_counts = row
                .ref_counts
                .as_ref()
                .map(|counts| {
                    serde_json::to_string(counts).map_err(|e| StoreError::Corrupt {
                        group: group.clone(),
                        detail: format!("unserializable refcount map: {e}"),
                    })
                })
                .transpose()?;
            txn.execute(
                "INSERT OR REPLACE INTO rows \
                 (client_group_id, schema, tbl, row_key, row_version, ref_counts, patch_version) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    group.as_str(),
                    row.id.schema,
                    row.id.table,
                    row.id.row_key.canonical_json(),
                    row.row_version,
                    ref_counts,
                    row.patch_version.to_cookie()
                ],
            )?;
            stats.rows += 1;
        }
        for id in &changes.row_deletes {
            stats.rows_deleted += txn.execute(
                "DELETE FROM rows WHERE client_group_id = ?1 AND schema = ?2 \
                 AND tbl = ?3 AND row_key = ?4",
                params![
                    group.as_str(),
                    id.schema,
                    id.table,
                    id.row_key.canonical_json()
                ],
            )?;
        }
        if !changes.rows.is_empty() || !changes.row_deletes.is_empty() {
            txn.execute(
                "INSERT OR REPLACE INTO rows_version (client_group_id, version) VALUES (?1, ?2)",
                params![group.as_str(), new_version.to_cookie()],
            )?;
        }

        txn.commit()?;
        debug!(group = %group, version = %new_version, ?stats, "flushed cvr");
        Ok(stats)
    }

    fn load_rows(
        &self,
        group: &ClientGroupId,
        ids: &[RowId],
    ) -> Result<BTreeMap<RowId, RowRecord>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT row_version, ref_counts, patch_version FROM rows \
             WHERE client_group_id = ?1 AND schema = ?2 AND tbl = ?3 AND row_key = ?4",
        )?;
        let mut out = BTreeMap::new();
        for id in ids {
            let found = stmt
                .query_row(
                    params![
                        group.as_str(),
                        id.schema,
                        id.table,
                        id.row_key.canonical_json()
                    ],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, Option<String>>(1)?,
                            row.get::<_, String>(2)?,
                        ))
                    },
                )
                .optional()?;
            if let Some((row_version, ref_counts, patch_version)) = found {
                out.insert(
                    id.clone(),
                    RowRecord {
                        id: id.clone(),
                        row_version,
                        patch_version: parse_cookie(group, &patch_version)?,
                        ref_counts: decode_ref_counts(group, ref_counts.as_deref())?,
                    },
                );
            }
        }
        Ok(out)
    }

    fn scan_rows(&self, group: &ClientGroupId) -> Result<Vec<RowRecord>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT schema, tbl, row_key, row_version, ref_counts, patch_version \
             FROM rows WHERE client_group_id = ?1",
        )?;
        let mut rows = stmt.query(params![group.as_str()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(decode_row(group, row)?);
        }
        Ok(out)
    }

    fn catchup_config_patches(
        &self,
        group: &ClientGroupId,
        after: &CvrVersion,
        upto: &CvrVersion,
    ) -> Result<Vec<PatchToVersion>, StoreError> {
        let state = {
            let mut conn = self.lock();
            let txn = conn.transaction()?;
            let state = read_config(&txn, group)?;
            txn.commit()?;
            state
        };
        Ok(config_patches_in_range(&state, after, upto))
    }

    fn catchup_row_patches(
        &self,
        group: &ClientGroupId,
        after: &CvrVersion,
        upto: &CvrVersion,
        exclude_queries: &BTreeSet<QueryHash>,
        batch_size: usize,
    ) -> Result<Vec<Vec<RowRecord>>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT schema, tbl, row_key, row_version, ref_counts, patch_version \
             FROM rows WHERE client_group_id = ?1 \
             AND patch_version > ?2 AND patch_version <= ?3 \
             ORDER BY patch_version",
        )?;
        let mut rows = stmt.query(params![
            group.as_str(),
            after.to_cookie(),
            upto.to_cookie()
        ])?;
        let batch_size = batch_size.max(1);
        let mut batches: Vec<Vec<RowRecord>> = Vec::new();
        let mut current: Vec<RowRecord> = Vec::new();
        while let Some(row) = rows.next()? {
            let record = decode_row(group, row)?;
            if only_referenced_by(&record, exclude_queries) {
                continue;
            }
            current.push(record);
            if current.len() == batch_size {
                batches.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            batches.push(current);
        }
        Ok(batches)
    }

    fn inspect(&self, group: &ClientGroupId) -> Result<Option<InstanceRow>, StoreError> {
        let conn = self.lock();
        let found = conn
            .query_row(
                "SELECT version, replica_version, last_active, owner, granted_at \
                 FROM instances WHERE client_group_id = ?1",
                params![group.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, u64>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<u64>>(4)?,
                    ))
                },
            )
            .optional()?;
        match found {
            None => Ok(None),
            Some((version, replica, last_active, owner, granted_at)) => Ok(Some(InstanceRow {
                group: group.clone(),
                version: parse_cookie(group, &version)?,
                replica_version: replica
                    .map(|r| StateVersion::parse(&r))
                    .transpose()?,
                last_active,
                owner: decode_owner(group, owner)?,
                granted_at,
            })),
        }
    }
}

struct RawInstance {
    version: CvrVersion,
    replica_version: Option<StateVersion>,
    last_active: u64,
    owner: Option<Uuid>,
    granted_at: Option<u64>,
}

impl RawInstance {
    fn epoch(&self) -> Option<OwnershipEpoch> {
        match (self.owner, self.granted_at) {
            (Some(owner), Some(granted_at)) => Some(OwnershipEpoch { owner, granted_at }),
            _ => None,
        }
    }
}

fn read_instance(
    txn: &Transaction<'_>,
    group: &ClientGroupId,
) -> Result<Option<RawInstance>, StoreError> {
    let found = txn
        .query_row(
            "SELECT version, replica_version, last_active, owner, granted_at \
             FROM instances WHERE client_group_id = ?1",
            params![group.as_str()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, u64>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<u64>>(4)?,
                ))
            },
        )
        .optional()?;
    match found {
        None => Ok(None),
        Some((version, replica, last_active, owner, granted_at)) => Ok(Some(RawInstance {
            version: parse_cookie(group, &version)?,
            replica_version: replica.map(|r| StateVersion::parse(&r)).transpose()?,
            last_active,
            owner: decode_owner(group, owner)?,
            granted_at,
        })),
    }
}

fn read_config(txn: &Transaction<'_>, group: &ClientGroupId) -> Result<ConfigState, StoreError> {
    let mut state = ConfigState::default();

    let mut stmt = txn.prepare_cached(
        "SELECT client_id, patch_version, last_mutation_id, deleted \
         FROM clients WHERE client_group_id = ?1",
    )?;
    let mut rows = stmt.query(params![group.as_str()])?;
    while let Some(row) = rows.next()? {
        let id: String = row.get(0)?;
        let patch_version: String = row.get(1)?;
        let mut client = ClientRecord::new(
            decode_id(group, ClientId::new(id))?,
            parse_cookie(group, &patch_version)?,
        );
        client.last_mutation_id = row.get(2)?;
        client.deleted = row.get(3)?;
        state.clients.push(client);
    }
    drop(rows);
    drop(stmt);

    let mut stmt = txn.prepare_cached(
        "SELECT query_hash, client_ast, transformation_hash, transformation_version, \
                patch_version, internal, deleted \
         FROM queries WHERE client_group_id = ?1",
    )?;
    let mut rows = stmt.query(params![group.as_str()])?;
    while let Some(row) = rows.next()? {
        let hash: String = row.get(0)?;
        let ast_text: String = row.get(1)?;
        let ast = serde_json::from_str(&ast_text).map_err(|e| StoreError::Corrupt {
            group: group.clone(),
            detail: format!("query {hash}: bad ast: {e}"),
        })?;
        let mut query = QueryRecord::new(decode_id(group, QueryHash::new(hash))?, ast);
        query.transformation_hash = row.get(2)?;
        query.transformation_version = row
            .get::<_, Option<String>>(3)?
            .map(|v| parse_cookie(group, &v))
            .transpose()?;
        query.patch_version = row
            .get::<_, Option<String>>(4)?
            .map(|v| parse_cookie(group, &v))
            .transpose()?;
        query.internal = row.get(5)?;
        query.deleted = row.get(6)?;
        state.queries.push(query);
    }
    drop(rows);
    drop(stmt);

    let mut stmt = txn.prepare_cached(
        "SELECT client_id, query_hash, patch_version, deleted \
         FROM desires WHERE client_group_id = ?1",
    )?;
    let mut rows = stmt.query(params![group.as_str()])?;
    while let Some(row) = rows.next()? {
        let client_id: String = row.get(0)?;
        let query_hash: String = row.get(1)?;
        let patch_version: String = row.get(2)?;
        state.desires.push(DesireRow {
            client_id: decode_id(group, ClientId::new(client_id))?,
            query_hash: decode_id(group, QueryHash::new(query_hash))?,
            patch_version: parse_cookie(group, &patch_version)?,
            deleted: row.get(3)?,
        });
    }
    Ok(state)
}

fn decode_row(group: &ClientGroupId, row: &rusqlite::Row<'_>) -> Result<RowRecord, StoreError> {
    let schema: String = row.get(0)?;
    let table: String = row.get(1)?;
    let key_json: String = row.get(2)?;
    let row_version: String = row.get(3)?;
    let ref_counts: Option<String> = row.get(4)?;
    let patch_version: String = row.get(5)?;

    let row_key = RowKey::parse_canonical(&key_json).map_err(|e| StoreError::Corrupt {
        group: group.clone(),
        detail: format!("bad row key {key_json:?}: {e}"),
    })?;
    Ok(RowRecord {
        id: RowId::new(schema, table, row_key),
        row_version,
        patch_version: parse_cookie(group, &patch_version)?,
        ref_counts: decode_ref_counts(group, ref_counts.as_deref())?,
    })
}

fn decode_ref_counts(
    group: &ClientGroupId,
    text: Option<&str>,
) -> Result<Option<crate::core::RefCounts>, StoreError> {
    text.map(|t| {
        serde_json::from_str(t).map_err(|e| StoreError::Corrupt {
            group: group.clone(),
            detail: format!("bad refcount map: {e}"),
        })
    })
    .transpose()
}

fn decode_owner(
    group: &ClientGroupId,
    owner: Option<String>,
) -> Result<Option<Uuid>, StoreError> {
    owner
        .map(|o| {
            Uuid::parse_str(&o).map_err(|e| StoreError::Corrupt {
                group: group.clone(),
                detail: format!("bad owner uuid {o:?}: {e}"),
            })
        })
        .transpose()
}

fn decode_id<T>(
    group: &ClientGroupId,
    result: Result<T, crate::core::IdError>,
) -> Result<T, StoreError> {
    result.map_err(|e| StoreError::Corrupt {
        group: group.clone(),
        detail: e.to_string(),
    })
}

fn parse_cookie(group: &ClientGroupId, cookie: &str) -> Result<CvrVersion, StoreError> {
    CvrVersion::from_cookie(cookie).map_err(|e| StoreError::Corrupt {
        group: group.clone(),
        detail: format!("bad version cookie {cookie:?}: {e}"),
    })
}
