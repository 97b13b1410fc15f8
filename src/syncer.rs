//! The view-syncer service: one store handle, many client groups.
//!
//! Per group the syncer is single-threaded cooperative: exactly one CVR
//! update runs at a time, against a snapshot loaded for that update.
//! Different groups proceed independently. Pokes produced by an update are
//! broadcast to every connected client of the group; freshly connecting
//! clients catch up from the store instead.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::client::{
    ClientConnection, ClientError, ClientRegistry, Downstream, SchemaMap, build_poke_part,
    catchup_frames, parse_connect, validate_connect,
};
use crate::core::{
    ClientGroupId, ClientId, CvrVersion, PatchToVersion, QueryHash, RowId, StateVersion,
};
use crate::poke::{PokeEnd, PokeStart};
use crate::store::{CvrStore, StoreError};
use crate::updater::{
    ConfigDrivenUpdater, CvrUpdater, FlushOutcome, QueryDrivenUpdater, ReceivedRow, UpdateError,
};

/// Callback fired when this instance loses a CVR lease. The process is
/// expected to stop serving the group (typically by shutting down).
pub type FailureHandler = Box<dyn Fn(&ClientGroupId, &UpdateError) + Send + Sync>;

struct GroupContext {
    registry: Arc<ClientRegistry>,
}

impl GroupContext {
    fn new() -> Self {
        Self {
            registry: Arc::new(ClientRegistry::new()),
        }
    }
}

pub struct ViewSyncer {
    store: Arc<dyn CvrStore>,
    schema: SchemaMap,
    groups: Mutex<HashMap<ClientGroupId, GroupContext>>,
    on_failure: Option<FailureHandler>,
    catchup_batch_size: usize,
}

impl ViewSyncer {
    pub fn new(store: Arc<dyn CvrStore>, schema: SchemaMap) -> Self {
        Self {
            store,
            schema,
            groups: Mutex::new(HashMap::new()),
            on_failure: None,
            catchup_batch_size: crate::client::CATCHUP_BATCH_SIZE,
        }
    }

    pub fn with_failure_handler(mut self, handler: FailureHandler) -> Self {
        self.on_failure = Some(handler);
        self
    }

    pub fn with_catchup_batch_size(mut self, batch_size: usize) -> Self {
        self.catchup_batch_size = batch_size.max(1);
        self
    }

    pub fn store(&self) -> &Arc<dyn CvrStore> {
        &self.store
    }

    fn registry(&self, group: &ClientGroupId) -> Arc<ClientRegistry> {
        let mut groups = self.groups.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(
            &groups
                .entry(group.clone())
                .or_insert_with(GroupContext::new)
                .registry,
        )
    }

    fn report_failure(&self, group: &ClientGroupId, err: &UpdateError) {
        if matches!(
            err,
            UpdateError::Store(StoreError::Ownership { .. })
        ) {
            warn!(group = %group, error = %err, "cvr lease lost");
            if let Some(handler) = &self.on_failure {
                handler(group, err);
            }
        }
    }

    /// Loads a snapshot for an update, reporting a lost lease.
    fn load_for_update(
        &self,
        group: &ClientGroupId,
        now: u64,
    ) -> Result<crate::store::CvrSnapshot, UpdateError> {
        self.store
            .load(group, now)
            .map_err(UpdateError::from)
            .inspect_err(|err| self.report_failure(group, err))
    }

    /// Handles a connect request end to end: parse, load, validate,
    /// register the socket, confirm, and stream catch-up.
    pub fn connect(
        &self,
        group: &ClientGroupId,
        method: &str,
        query: &str,
        identity_header: Option<&str>,
        connection: Box<dyn ClientConnection>,
    ) -> Result<(), ClientError> {
        let params = parse_connect(method, query, identity_header)?;
        let snapshot = self.store.load(group, params.ts)?;
        validate_connect(&snapshot.cvr, &params)?;

        let registry = self.registry(group);
        registry.register(params.client_id.clone(), connection);
        registry.send_to(
            &params.client_id,
            &Downstream::Connected {
                client_id: params.client_id.clone(),
                ts: params.ts,
            },
        )?;
        info!(group = %group, client = %params.client_id, "client connected");

        // Queries currently hydrated re-deliver their rows through the live
        // path; catch-up only owes everything else in the interval.
        let hydrating: BTreeSet<QueryHash> = snapshot
            .cvr
            .queries
            .values()
            .filter(|q| q.is_got() && !q.deleted)
            .map(|q| q.id.clone())
            .collect();
        let base = params.base_cookie.clone().unwrap_or(CvrVersion::MIN);
        let frames = catchup_frames(
            self.store.as_ref(),
            group,
            &snapshot.cvr,
            &base,
            &hydrating,
            &self.schema,
            &next_poke_id(),
            self.catchup_batch_size,
        )?;
        for frame in &frames {
            registry.send_to(&params.client_id, frame)?;
        }

        // Presence only: refresh last_active without touching the version.
        let now = params.ts;
        if let Err(err) = CvrUpdater::new(snapshot).flush(self.store.as_ref(), now) {
            self.report_failure(group, &err);
            warn!(group = %group, error = %err, "presence flush failed");
        }
        Ok(())
    }

    pub fn disconnect(&self, group: &ClientGroupId, client_id: &ClientId) {
        self.registry(group).remove(client_id);
    }

    /// Registers desired queries for a client and pokes the whole group
    /// with the resulting configuration patches.
    pub fn put_desired_queries(
        &self,
        group: &ClientGroupId,
        client_id: &ClientId,
        queries: &[(QueryHash, Value)],
        now: u64,
    ) -> Result<FlushOutcome, UpdateError> {
        self.config_update(group, now, |updater| {
            updater.put_desired_queries(client_id, queries)
        })
    }

    pub fn delete_desired_queries(
        &self,
        group: &ClientGroupId,
        client_id: &ClientId,
        queries: &[QueryHash],
        now: u64,
    ) -> Result<FlushOutcome, UpdateError> {
        self.config_update(group, now, |updater| {
            updater.delete_desired_queries(client_id, queries)
        })
    }

    pub fn clear_desired_queries(
        &self,
        group: &ClientGroupId,
        client_id: &ClientId,
        now: u64,
    ) -> Result<FlushOutcome, UpdateError> {
        self.config_update(group, now, |updater| updater.clear_desired_queries(client_id))
    }

    fn config_update(
        &self,
        group: &ClientGroupId,
        now: u64,
        edit: impl FnOnce(&mut ConfigDrivenUpdater) -> Vec<PatchToVersion>,
    ) -> Result<FlushOutcome, UpdateError> {
        let snapshot = self.load_for_update(group, now)?;
        let base = snapshot.cvr.version.clone();
        let mut updater = ConfigDrivenUpdater::new(snapshot);
        let patches = edit(&mut updater);
        let outcome = updater.flush(self.store.as_ref(), now).inspect_err(|err| {
            self.report_failure(group, err);
        })?;
        if !patches.is_empty() {
            self.broadcast_poke(group, &base, &outcome.cvr.version, &patches, None)?;
        }
        Ok(outcome)
    }

    /// One full query-driven update: track, receive, prune, flush, poke.
    #[allow(clippy::too_many_arguments)]
    pub fn apply_query_results(
        &self,
        group: &ClientGroupId,
        state_version: StateVersion,
        replica_version: StateVersion,
        executed: &[(QueryHash, String)],
        removed: &[QueryHash],
        rows: &BTreeMap<RowId, ReceivedRow>,
        lmid_changes: Option<&BTreeMap<ClientId, u64>>,
        now: u64,
    ) -> Result<FlushOutcome, UpdateError> {
        let snapshot = self.load_for_update(group, now)?;
        let base = snapshot.cvr.version.clone();
        let mut updater = QueryDrivenUpdater::new(snapshot, state_version, replica_version)?;
        let (_, mut patches) = updater.track_queries(executed, removed)?;
        patches.extend(updater.received(self.store.as_ref(), rows)?);
        patches.extend(updater.delete_unreferenced_rows(self.store.as_ref())?);
        let outcome = updater.flush(self.store.as_ref(), now).inspect_err(|err| {
            self.report_failure(group, err);
        })?;

        if !patches.is_empty() || lmid_changes.is_some() {
            self.broadcast_poke(
                group,
                &base,
                &outcome.cvr.version,
                &patches,
                lmid_changes,
            )?;
        }
        Ok(outcome)
    }

    /// Keeps the lease warm for a group without changing anything.
    pub fn heartbeat(&self, group: &ClientGroupId, now: u64) -> Result<(), UpdateError> {
        let snapshot = self.load_for_update(group, now)?;
        CvrUpdater::new(snapshot)
            .flush(self.store.as_ref(), now)
            .inspect_err(|err| self.report_failure(group, err))?;
        Ok(())
    }

    /// Sends one poke advancing the group's connected clients from `base`
    /// to `cookie`. Patches already at or below `base` are elided.
    fn broadcast_poke(
        &self,
        group: &ClientGroupId,
        base: &CvrVersion,
        cookie: &CvrVersion,
        patches: &[PatchToVersion],
        lmid_changes: Option<&BTreeMap<ClientId, u64>>,
    ) -> Result<(), UpdateError> {
        let registry = self.registry(group);
        let poke_id = next_poke_id();
        let mut part = match build_poke_part(&poke_id, base, patches, &self.schema) {
            Ok(part) => part,
            Err(err) => {
                warn!(group = %group, error = %err, "poke translation failed");
                return Ok(());
            }
        };
        if let Some(changes) = lmid_changes {
            part.last_mutation_id_changes = Some(changes.clone());
        }

        registry.broadcast(&Downstream::PokeStart(PokeStart {
            poke_id: poke_id.clone(),
            base_cookie: (!base.is_min()).then(|| base.to_cookie()),
            cookie: cookie.to_cookie(),
            schema_versions: None,
        }));
        if !part.is_empty() {
            registry.broadcast(&Downstream::PokePart(part));
        }
        registry.broadcast(&Downstream::PokeEnd(PokeEnd {
            poke_id,
            cancel: false,
        }));
        Ok(())
    }

    /// Groups with at least one live socket, for heartbeat scheduling.
    pub fn active_groups(&self) -> Vec<ClientGroupId> {
        let groups = self.groups.lock().unwrap_or_else(|p| p.into_inner());
        groups.keys().cloned().collect()
    }

    pub fn shutdown(&self, reason: &str) {
        let groups = self.groups.lock().unwrap_or_else(|p| p.into_inner());
        for context in groups.values() {
            context.registry.close_all(reason);
        }
    }
}

fn next_poke_id() -> String {
    Uuid::new_v4().to_string()
}
