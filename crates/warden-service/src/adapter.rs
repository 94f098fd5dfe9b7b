use std::sync::Arc;

use warden_core::engine::{CheckError, SchemaReader, TupleReader};
use warden_core::schema::{EntityDefinition, SchemaVersion};
use warden_core::tuple::{EntityRef, SnapshotToken, Tuple, TupleFilter};
use warden_storage::{RelationshipStore, SchemaStore, StorageError};

fn storage_error(err: StorageError) -> CheckError {
    match err {
        StorageError::SnapshotAhead { .. } => CheckError::InvalidRequest(err.to_string()),
        other => CheckError::Storage(other.to_string()),
    }
}

pub struct StoreTupleReader<S: RelationshipStore> {
    store: Arc<S>,
}

impl<S: RelationshipStore> StoreTupleReader<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

impl<S: RelationshipStore> TupleReader for StoreTupleReader<S> {
    async fn query_tuples(
        &self,
        entity: &EntityRef,
        relation: &str,
        snapshot: SnapshotToken,
    ) -> Result<Vec<Tuple>, CheckError> {
        let filter = TupleFilter::for_relation(entity, relation);
        self.store
            .read(&filter, Some(snapshot), None)
            .await
            .map_err(storage_error)
    }

    async fn head_snapshot(&self) -> Result<SnapshotToken, CheckError> {
        self.store.snapshot().await.map_err(storage_error)
    }
}

pub struct StoreSchemaReader<S: SchemaStore> {
    store: Arc<S>,
}

impl<S: SchemaStore> StoreSchemaReader<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

impl<S: SchemaStore> SchemaReader for StoreSchemaReader<S> {
    async fn read_entity_definition(
        &self,
        entity_type: &str,
        version: Option<SchemaVersion>,
    ) -> Result<(Arc<EntityDefinition>, SchemaVersion), CheckError> {
        let (schema, served) = self
            .store
            .read_schema(version)
            .await
            .map_err(storage_error)?
            .ok_or_else(|| {
                CheckError::SchemaNotFound(match version {
                    Some(version) => format!("version {version}"),
                    None => "no schema written".to_string(),
                })
            })?;
        let definition = schema
            .entity(entity_type)
            .cloned()
            .ok_or_else(|| CheckError::EntityNotFound(entity_type.to_string()))?;
        Ok((definition, served))
    }
}
