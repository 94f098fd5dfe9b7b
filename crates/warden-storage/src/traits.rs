use std::future::Future;
use std::sync::Arc;

use warden_core::schema::{Schema, SchemaVersion};
use warden_core::tuple::{SnapshotToken, TenantId, Tuple, TupleFilter};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("delete filter must have at least one field set")]
    EmptyDeleteFilter,
    #[error("snapshot {requested} is ahead of current {current}")]
    SnapshotAhead { requested: u64, current: u64 },
    #[error("duplicate tuple: {0}")]
    DuplicateTuple(String),
    #[error("internal storage error: {0}")]
    Internal(String),
}

pub trait RelationshipStore: Send + Sync {
    /// Applies `deletes` then `writes` as one transaction and returns the
    /// snapshot that first sees the result.
    fn write(
        &self,
        writes: &[Tuple],
        deletes: &[TupleFilter],
    ) -> impl Future<Output = Result<SnapshotToken, StorageError>> + Send;

    /// Tuples matching `filter` at `snapshot` (head when `None`), in
    /// insertion order.
    fn read(
        &self,
        filter: &TupleFilter,
        snapshot: Option<SnapshotToken>,
        limit: Option<usize>,
    ) -> impl Future<Output = Result<Vec<Tuple>, StorageError>> + Send;

    fn snapshot(&self) -> impl Future<Output = Result<SnapshotToken, StorageError>> + Send;

    /// Distinct ids of entities of `entity_type` that appear in any visible
    /// tuple, in first-seen order.
    fn list_entity_ids(
        &self,
        entity_type: &str,
        snapshot: Option<SnapshotToken>,
        limit: Option<usize>,
    ) -> impl Future<Output = Result<Vec<String>, StorageError>> + Send;
}

pub trait SchemaStore: Send + Sync {
    /// Stores `schema` as a new version.
    fn write_schema(
        &self,
        schema: Schema,
    ) -> impl Future<Output = Result<SchemaVersion, StorageError>> + Send;

    /// Reads `version`, or the head version when `None`. Returns `None` when
    /// no such version exists.
    fn read_schema(
        &self,
        version: Option<SchemaVersion>,
    ) -> impl Future<Output = Result<Option<(Arc<Schema>, SchemaVersion)>, StorageError>> + Send;
}

pub trait StoreFactory: Send + Sync {
    type Store: RelationshipStore + SchemaStore;

    fn for_tenant(&self, tenant_id: &TenantId) -> Self::Store;
}
