#![forbid(unsafe_code)]

pub mod cli;
pub mod client;
pub mod config;
pub mod core;
pub mod error;
pub mod poke;
pub mod runner;
pub mod store;
pub mod syncer;
pub mod telemetry;
pub mod updater;

pub use error::{Effect, Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export core types at crate root for convenience
pub use crate::client::{
    ClientConnection, ClientError, ClientRegistry, ConnectParams, Downstream, SchemaMap,
};
pub use crate::core::{
    ClientGroupId, ClientId, ClientRecord, ConfigPatch, Cvr, CvrVersion, Patch, PatchOp,
    PatchToVersion, QueryHash, QueryRecord, RefCounts, RowChange, RowId, RowKey, RowRecord,
    StateVersion, VersionError, client_row_id,
};
pub use crate::poke::{
    PokeAccumulator, PokeBody, PokeEnd, PokeError, PokeHandler, PokePart, PokeStart, PokeSink,
    merge_pokes,
};
pub use crate::runner::{ConnectionLoop, ConnectionSlots, RunnerConfig, RunnerError};
pub use crate::store::{
    CvrChanges, CvrSnapshot, CvrStore, DesireRow, FlushExpectation, FlushStats, InstanceRow,
    MemoryCvrStore, OwnershipEpoch, SqliteCvrStore, StoreError,
};
pub use crate::syncer::ViewSyncer;
pub use crate::updater::{
    ConfigDrivenUpdater, CvrUpdater, FlushOutcome, QueryDrivenUpdater, ReceivedRow, UpdateError,
};
