use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use warden_core::schema::{Schema, SchemaVersion};
use warden_core::tuple::{SnapshotToken, TenantId, Tuple, TupleFilter};

use crate::traits::{RelationshipStore, SchemaStore, StorageError, StoreFactory};

const ACTIVE_TX_ID: u64 = u64::MAX;

#[derive(Debug, Clone)]
struct StoredTuple {
    tuple: Tuple,
    created_tx_id: u64,
    deleted_tx_id: u64,
}

impl StoredTuple {
    fn is_active(&self) -> bool {
        self.deleted_tx_id == ACTIVE_TX_ID
    }

    fn visible_at(&self, snapshot: u64) -> bool {
        self.created_tx_id <= snapshot && self.deleted_tx_id > snapshot
    }
}

#[derive(Debug, Default)]
struct InnerState {
    current_tx: u64,
    tuples: Vec<StoredTuple>,
    schemas: Vec<Arc<Schema>>,
}

impl InnerState {
    fn resolve_snapshot(&self, snapshot: Option<SnapshotToken>) -> Result<u64, StorageError> {
        match snapshot {
            Some(token) if token.value() > self.current_tx => Err(StorageError::SnapshotAhead {
                requested: token.value(),
                current: self.current_tx,
            }),
            Some(token) => Ok(token.value()),
            None => Ok(self.current_tx),
        }
    }

    fn visible(&self, snapshot: u64) -> impl Iterator<Item = &Tuple> {
        self.tuples
            .iter()
            .filter(move |t| t.visible_at(snapshot))
            .map(|t| &t.tuple)
    }
}

/// Reference store keeping every tuple version in memory. Each write is one
/// transaction; a snapshot token is the id of the last transaction it sees.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<InnerState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RelationshipStore for InMemoryStore {
    async fn write(
        &self,
        writes: &[Tuple],
        deletes: &[TupleFilter],
    ) -> Result<SnapshotToken, StorageError> {
        if deletes.iter().any(TupleFilter::is_empty) {
            return Err(StorageError::EmptyDeleteFilter);
        }

        let mut seen = HashSet::with_capacity(writes.len());
        for write in writes {
            if !seen.insert(write) {
                return Err(StorageError::DuplicateTuple(write.to_string()));
            }
        }

        let mut state = self.state.lock();

        // Tuples surviving the deletes of this transaction must not be
        // written again.
        for write in writes {
            let active_dup = state.tuples.iter().any(|t| {
                t.is_active() && t.tuple == *write && !deletes.iter().any(|f| f.matches(&t.tuple))
            });
            if active_dup {
                return Err(StorageError::DuplicateTuple(write.to_string()));
            }
        }

        state.current_tx += 1;
        let tx_id = state.current_tx;

        let mut deleted = 0usize;
        for stored in &mut state.tuples {
            if stored.is_active() && deletes.iter().any(|f| f.matches(&stored.tuple)) {
                stored.deleted_tx_id = tx_id;
                deleted += 1;
            }
        }

        state.tuples.extend(writes.iter().map(|write| StoredTuple {
            tuple: write.clone(),
            created_tx_id: tx_id,
            deleted_tx_id: ACTIVE_TX_ID,
        }));

        tracing::debug!(tx_id, written = writes.len(), deleted, "relationships written");
        Ok(SnapshotToken::new(tx_id))
    }

    async fn read(
        &self,
        filter: &TupleFilter,
        snapshot: Option<SnapshotToken>,
        limit: Option<usize>,
    ) -> Result<Vec<Tuple>, StorageError> {
        let state = self.state.lock();
        let snapshot = state.resolve_snapshot(snapshot)?;

        Ok(state
            .visible(snapshot)
            .filter(|t| filter.matches(t))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn snapshot(&self) -> Result<SnapshotToken, StorageError> {
        let state = self.state.lock();
        Ok(SnapshotToken::new(state.current_tx))
    }

    async fn list_entity_ids(
        &self,
        entity_type: &str,
        snapshot: Option<SnapshotToken>,
        limit: Option<usize>,
    ) -> Result<Vec<String>, StorageError> {
        let state = self.state.lock();
        let snapshot = state.resolve_snapshot(snapshot)?;

        let mut seen = HashSet::new();
        Ok(state
            .visible(snapshot)
            .filter(|t| t.entity.entity_type == entity_type)
            .filter(|t| seen.insert(t.entity.entity_id.as_str()))
            .take(limit.unwrap_or(usize::MAX))
            .map(|t| t.entity.entity_id.clone())
            .collect())
    }
}

impl SchemaStore for InMemoryStore {
    async fn write_schema(&self, schema: Schema) -> Result<SchemaVersion, StorageError> {
        let mut state = self.state.lock();
        state.schemas.push(Arc::new(schema));
        let version = SchemaVersion::new(state.schemas.len() as u64);
        tracing::debug!(%version, "schema written");
        Ok(version)
    }

    async fn read_schema(
        &self,
        version: Option<SchemaVersion>,
    ) -> Result<Option<(Arc<Schema>, SchemaVersion)>, StorageError> {
        let state = self.state.lock();
        let version = match version {
            Some(version) => version,
            None => SchemaVersion::new(state.schemas.len() as u64),
        };
        let found = usize::try_from(version.value())
            .ok()
            .and_then(|v| v.checked_sub(1))
            .and_then(|index| state.schemas.get(index))
            .map(|schema| (Arc::clone(schema), version));
        Ok(found)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryStoreFactory {
    stores: Mutex<HashMap<TenantId, InMemoryStore>>,
}

impl InMemoryStoreFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StoreFactory for InMemoryStoreFactory {
    type Store = InMemoryStore;

    fn for_tenant(&self, tenant_id: &TenantId) -> InMemoryStore {
        self.stores
            .lock()
            .entry(tenant_id.clone())
            .or_default()
            .clone()
    }
}
