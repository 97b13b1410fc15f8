//! Core data model: versions, identifiers, patches, and the CVR aggregate.

mod cvr;
mod ids;
mod patch;
mod version;

pub use cvr::{
    ClientRecord, Cvr, CvrIntegrityError, QueryRecord, RefCounts, RowRecord, merge_ref_counts,
};
pub use ids::{ClientGroupId, ClientId, IdError, QueryHash, RowId, RowKey, client_row_id};
pub use patch::{ConfigPatch, Patch, PatchOp, PatchToVersion, RowChange, sort_by_version};
pub use version::{CvrVersion, StateVersion, VersionError, cmp};
