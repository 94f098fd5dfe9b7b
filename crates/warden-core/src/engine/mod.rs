mod cancel;
mod check;
mod expand;
mod lookup_schema;
mod visit;

#[cfg(test)]
mod test_support;

pub use cancel::{CancelHandle, CancelToken};
pub use check::{CheckEngine, CheckRequest, CheckResult};
pub use expand::{ExpandEngine, ExpandRequest, ExpandResult, ExpandTree, Operation, Target};
pub use lookup_schema::{LookupSchemaEngine, evaluate};

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::schema::types::{EntityDefinition, Schema, SchemaVersion};
use crate::tuple::{EntityRef, SnapshotToken, Tuple};

/// Depth used when a request does not set one.
pub const DEFAULT_DEPTH: u32 = 20;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CheckError {
    #[error("schema not found: {0}")]
    SchemaNotFound(String),

    #[error("entity type not found: {0}")]
    EntityNotFound(String),

    #[error("permission '{permission}' not found on type '{entity_type}'")]
    PermissionNotFound {
        entity_type: String,
        permission: String,
    },

    #[error("relation '{relation}' not found on type '{entity_type}'")]
    RelationNotFound {
        entity_type: String,
        relation: String,
    },

    #[error("max depth exceeded: request started with depth {0}")]
    DepthExceeded(u32),

    #[error("evaluation canceled")]
    Canceled,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Coarse classification an outer protocol layer maps onto its own status
/// codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    DepthExceeded,
    Canceled,
    Upstream,
}

impl CheckError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidRequest(_) => ErrorKind::Validation,
            Self::SchemaNotFound(_)
            | Self::EntityNotFound(_)
            | Self::PermissionNotFound { .. }
            | Self::RelationNotFound { .. } => ErrorKind::NotFound,
            Self::DepthExceeded(_) => ErrorKind::DepthExceeded,
            Self::Canceled => ErrorKind::Canceled,
            Self::Storage(_) => ErrorKind::Upstream,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Children of one rewrite node or leaf evaluated at the same time.
    pub max_concurrent_branches: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_branches: 10,
        }
    }
}

impl EngineConfig {
    fn branch_limit(&self) -> usize {
        self.max_concurrent_branches.max(1)
    }
}

/// Read access to stored relation tuples.
pub trait TupleReader: Send + Sync {
    /// Tuples `(entity, relation, *)` visible at `snapshot`, in a stable order.
    fn query_tuples(
        &self,
        entity: &EntityRef,
        relation: &str,
        snapshot: SnapshotToken,
    ) -> impl Future<Output = Result<Vec<Tuple>, CheckError>> + Send;

    fn head_snapshot(&self) -> impl Future<Output = Result<SnapshotToken, CheckError>> + Send;
}

/// Read access to compiled, versioned schemas.
pub trait SchemaReader: Send + Sync {
    /// Returns the definition of `entity_type` at `version`, or at the head
    /// version when `version` is `None`, together with the version served.
    fn read_entity_definition(
        &self,
        entity_type: &str,
        version: Option<SchemaVersion>,
    ) -> impl Future<Output = Result<(Arc<EntityDefinition>, SchemaVersion), CheckError>> + Send;
}

/// A single schema version held in memory.
#[derive(Debug, Clone)]
pub struct StaticSchema {
    schema: Arc<Schema>,
    version: SchemaVersion,
}

impl StaticSchema {
    pub fn new(schema: Schema, version: SchemaVersion) -> Self {
        Self {
            schema: Arc::new(schema),
            version,
        }
    }
}

impl SchemaReader for StaticSchema {
    async fn read_entity_definition(
        &self,
        entity_type: &str,
        version: Option<SchemaVersion>,
    ) -> Result<(Arc<EntityDefinition>, SchemaVersion), CheckError> {
        if let Some(requested) = version
            && requested != self.version
        {
            return Err(CheckError::SchemaNotFound(requested.to_string()));
        }
        let definition = self
            .schema
            .entity(entity_type)
            .cloned()
            .ok_or_else(|| CheckError::EntityNotFound(entity_type.to_string()))?;
        Ok((definition, self.version))
    }
}

/// Entity definitions read for one request, pinned to one schema version.
pub(crate) struct Definitions<'a, S> {
    reader: &'a S,
    version: SchemaVersion,
    cache: Mutex<HashMap<String, Arc<EntityDefinition>>>,
}

impl<'a, S: SchemaReader> Definitions<'a, S> {
    pub(crate) fn new(reader: &'a S, first: Arc<EntityDefinition>, version: SchemaVersion) -> Self {
        let mut cache = HashMap::new();
        cache.insert(first.name.clone(), first);
        Self {
            reader,
            version,
            cache: Mutex::new(cache),
        }
    }

    pub(crate) fn version(&self) -> SchemaVersion {
        self.version
    }

    pub(crate) async fn get(
        &self,
        entity_type: &str,
        cancel: &CancelToken,
    ) -> Result<Arc<EntityDefinition>, CheckError> {
        let cached = self.cache.lock().get(entity_type).cloned();
        if let Some(definition) = cached {
            return Ok(definition);
        }
        let (definition, _) = cancel
            .guard(
                self.reader
                    .read_entity_definition(entity_type, Some(self.version)),
            )
            .await?;
        self.cache
            .lock()
            .insert(entity_type.to_string(), Arc::clone(&definition));
        Ok(definition)
    }
}

/// Resolves the schema version and entity definition a request starts from.
pub(crate) async fn load_root<S: SchemaReader>(
    reader: &S,
    entity_type: &str,
    version: Option<SchemaVersion>,
    cancel: &CancelToken,
) -> Result<(Arc<EntityDefinition>, SchemaVersion), CheckError> {
    cancel
        .guard(reader.read_entity_definition(entity_type, version))
        .await
}

/// Resolves the snapshot a request reads at.
pub(crate) async fn load_snapshot<T: TupleReader>(
    reader: &T,
    snapshot: Option<SnapshotToken>,
    cancel: &CancelToken,
) -> Result<SnapshotToken, CheckError> {
    match snapshot {
        Some(snapshot) => Ok(snapshot),
        None => cancel.guard(reader.head_snapshot()).await,
    }
}

/// Spends one unit of depth. Reaching zero aborts the evaluation.
pub(crate) fn consume(depth: u32, initial: u32) -> Result<u32, CheckError> {
    let remaining = depth.saturating_sub(1);
    if remaining == 0 {
        tracing::debug!(initial, "depth exhausted");
        return Err(CheckError::DepthExceeded(initial));
    }
    Ok(remaining)
}

pub(crate) fn validate_depth(depth: u32) -> Result<(), CheckError> {
    if depth == 0 {
        return Err(CheckError::InvalidRequest(
            "depth must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::types::RelationDef;

    fn schema() -> StaticSchema {
        StaticSchema::new(
            Schema::new(vec![EntityDefinition::new(
                "doc",
                vec![RelationDef::new("owner", vec![])],
                vec![],
            )]),
            SchemaVersion::new(3),
        )
    }

    #[test]
    fn error_kinds() {
        assert_eq!(CheckError::Canceled.kind(), ErrorKind::Canceled);
        assert_eq!(CheckError::DepthExceeded(8).kind(), ErrorKind::DepthExceeded);
        assert_eq!(CheckError::Storage("boom".into()).kind(), ErrorKind::Upstream);
        assert_eq!(
            CheckError::EntityNotFound("doc".into()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            CheckError::InvalidRequest("depth".into()).kind(),
            ErrorKind::Validation
        );
    }

    #[test]
    fn consume_fails_when_budget_runs_out() {
        assert_eq!(consume(3, 3), Ok(2));
        assert_eq!(consume(2, 3), Ok(1));
        assert_eq!(consume(1, 3), Err(CheckError::DepthExceeded(3)));
    }

    #[tokio::test]
    async fn static_schema_serves_head_and_pinned_version() {
        let reader = schema();

        let (def, version) = reader.read_entity_definition("doc", None).await.unwrap();
        assert_eq!(def.name, "doc");
        assert_eq!(version, SchemaVersion::new(3));

        let pinned = reader
            .read_entity_definition("doc", Some(SchemaVersion::new(3)))
            .await;
        assert!(pinned.is_ok());
    }

    #[tokio::test]
    async fn static_schema_errors() {
        let reader = schema();

        let err = reader
            .read_entity_definition("doc", Some(SchemaVersion::new(4)))
            .await
            .unwrap_err();
        assert!(matches!(err, CheckError::SchemaNotFound(_)), "got: {err}");

        let err = reader.read_entity_definition("folder", None).await.unwrap_err();
        assert!(
            matches!(err, CheckError::EntityNotFound(ref t) if t == "folder"),
            "got: {err}"
        );
    }
}
