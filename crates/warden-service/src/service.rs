use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt, TryStreamExt};
use warden_core::engine::{
    CancelToken, CheckEngine, CheckError, CheckRequest, DEFAULT_DEPTH, EngineConfig, ExpandEngine,
    ExpandRequest, ExpandTree, LookupSchemaEngine, SchemaReader,
};
use warden_core::schema::{
    EntityDefinition, Schema, SchemaLimits, SchemaVersion, detect_breaking_changes,
    validate_schema, validate_schema_limits,
};
use warden_core::tuple::{
    EntityRef, SnapshotToken, Subject, SubjectRelation, TenantId, Tuple, TupleFilter,
};
use warden_storage::{RelationshipStore, SchemaStore, StorageError, StoreFactory};

use crate::adapter::{StoreSchemaReader, StoreTupleReader};
use crate::error::ApiError;

const DEFAULT_LOOKUP_LIMIT: usize = 1000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Consistency {
    #[default]
    FullConsistency,
    MinimizeLatency,
    AtLeastAsFresh(SnapshotToken),
    AtExactSnapshot(SnapshotToken),
}

/// Bounds on the depth a caller may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthPolicy {
    pub default: u32,
    pub min: u32,
    pub max: u32,
}

impl Default for DepthPolicy {
    fn default() -> Self {
        Self {
            default: DEFAULT_DEPTH,
            min: 3,
            max: 50,
        }
    }
}

impl DepthPolicy {
    pub fn resolve(&self, requested: Option<u32>) -> Result<u32, ApiError> {
        let depth = requested.unwrap_or(self.default);
        if depth < self.min || depth > self.max {
            return Err(ApiError::InvalidDepth {
                depth,
                min: self.min,
                max: self.max,
            });
        }
        Ok(depth)
    }
}

#[derive(Debug, Clone)]
pub struct CheckInput {
    pub entity: EntityRef,
    pub permission: String,
    pub subject: Subject,
    pub depth: Option<u32>,
    pub consistency: Consistency,
    pub schema_version: Option<SchemaVersion>,
}

impl CheckInput {
    pub fn new(entity: EntityRef, permission: impl Into<String>, subject: Subject) -> Self {
        Self {
            entity,
            permission: permission.into(),
            subject,
            depth: None,
            consistency: Consistency::default(),
            schema_version: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutput {
    pub allowed: bool,
    pub remaining_depth: u32,
    pub check_count: u32,
    pub snapshot: SnapshotToken,
    pub schema_version: SchemaVersion,
}

#[derive(Debug, Clone)]
pub struct ExpandInput {
    pub entity: EntityRef,
    pub permission: String,
    pub depth: Option<u32>,
    pub consistency: Consistency,
    pub schema_version: Option<SchemaVersion>,
}

impl ExpandInput {
    pub fn new(entity: EntityRef, permission: impl Into<String>) -> Self {
        Self {
            entity,
            permission: permission.into(),
            depth: None,
            consistency: Consistency::default(),
            schema_version: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpandOutput {
    pub tree: ExpandTree,
    pub snapshot: SnapshotToken,
    pub schema_version: SchemaVersion,
}

#[derive(Debug, Clone)]
pub struct LookupSchemaInput {
    pub entity_type: String,
    pub relations: Vec<String>,
    pub schema_version: Option<SchemaVersion>,
}

#[derive(Debug, Clone)]
pub struct SubjectPermissionsInput {
    pub entity: EntityRef,
    pub subject: Subject,
    pub consistency: Consistency,
}

#[derive(Debug, Clone)]
pub struct LookupSubjectsInput {
    pub entity: EntityRef,
    pub permission: String,
    pub subject_type: String,
    pub consistency: Consistency,
}

#[derive(Debug, Clone)]
pub struct LookupEntitiesInput {
    pub entity_type: String,
    pub permission: String,
    pub subject: Subject,
    pub consistency: Consistency,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteSchemaOutput {
    pub version: SchemaVersion,
    pub breaking_changes_overridden: bool,
}

/// Tenant-aware entry point to the engines. Every call resolves the tenant's
/// store, pins a snapshot and applies the depth policy and deadline before
/// handing off to an engine.
pub struct PermissionService<F: StoreFactory> {
    factory: Arc<F>,
    engine_config: EngineConfig,
    depth_policy: DepthPolicy,
    schema_limits: SchemaLimits,
    timeout: Option<Duration>,
}

impl<F: StoreFactory> PermissionService<F> {
    pub fn new(factory: Arc<F>, engine_config: EngineConfig, schema_limits: SchemaLimits) -> Self {
        Self {
            factory,
            engine_config,
            depth_policy: DepthPolicy::default(),
            schema_limits,
            timeout: None,
        }
    }

    pub fn with_depth_policy(mut self, depth_policy: DepthPolicy) -> Self {
        self.depth_policy = depth_policy;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn check(
        &self,
        tenant_id: &TenantId,
        input: CheckInput,
    ) -> Result<CheckOutput, ApiError> {
        self.check_cancellable(tenant_id, input, CancelToken::never())
            .await
    }

    pub async fn check_cancellable(
        &self,
        tenant_id: &TenantId,
        input: CheckInput,
        cancel: CancelToken,
    ) -> Result<CheckOutput, ApiError> {
        let depth = self.depth_policy.resolve(input.depth)?;
        let store = self.store(tenant_id);
        let snapshot = resolve_snapshot(store.as_ref(), input.consistency).await?;

        let mut request =
            CheckRequest::new(input.entity, input.permission, input.subject).with_depth(depth);
        if let Some(snapshot) = snapshot {
            request = request.at_snapshot(snapshot);
        }
        if let Some(version) = input.schema_version {
            request = request.with_schema_version(version);
        }

        let result = self
            .check_engine(&store)
            .check_cancellable(&request, &self.deadline(cancel))
            .await?;

        tracing::debug!(
            allowed = result.allowed,
            check_count = result.check_count,
            snapshot = %result.snapshot,
            "check completed"
        );

        Ok(CheckOutput {
            allowed: result.allowed,
            remaining_depth: result.remaining_depth,
            check_count: result.check_count,
            snapshot: result.snapshot,
            schema_version: result.schema_version,
        })
    }

    pub async fn expand(
        &self,
        tenant_id: &TenantId,
        input: ExpandInput,
    ) -> Result<ExpandOutput, ApiError> {
        self.expand_cancellable(tenant_id, input, CancelToken::never())
            .await
    }

    pub async fn expand_cancellable(
        &self,
        tenant_id: &TenantId,
        input: ExpandInput,
        cancel: CancelToken,
    ) -> Result<ExpandOutput, ApiError> {
        let depth = self.depth_policy.resolve(input.depth)?;
        let store = self.store(tenant_id);
        let snapshot = resolve_snapshot(store.as_ref(), input.consistency).await?;

        let mut request = ExpandRequest::new(input.entity, input.permission).with_depth(depth);
        if let Some(snapshot) = snapshot {
            request = request.at_snapshot(snapshot);
        }
        if let Some(version) = input.schema_version {
            request = request.with_schema_version(version);
        }

        let engine = ExpandEngine::new(
            Arc::new(StoreTupleReader::new(Arc::clone(&store))),
            Arc::new(StoreSchemaReader::new(store)),
            self.engine_config.clone(),
        );
        let result = engine
            .expand_cancellable(&request, &self.deadline(cancel))
            .await?;

        Ok(ExpandOutput {
            tree: result.tree,
            snapshot: result.snapshot,
            schema_version: result.schema_version,
        })
    }

    pub async fn lookup_schema(
        &self,
        tenant_id: &TenantId,
        input: LookupSchemaInput,
    ) -> Result<Vec<String>, ApiError> {
        let engine = LookupSchemaEngine::new(Arc::new(StoreSchemaReader::new(
            self.store(tenant_id),
        )));
        Ok(engine
            .lookup(&input.entity_type, &input.relations, input.schema_version)
            .await?)
    }

    /// Every permission of the entity's type the subject holds, in
    /// declaration order.
    pub async fn subject_permissions(
        &self,
        tenant_id: &TenantId,
        input: SubjectPermissionsInput,
    ) -> Result<Vec<String>, ApiError> {
        let store = self.store(tenant_id);
        let snapshot = pin_snapshot(store.as_ref(), input.consistency).await?;
        let (definition, version) = self
            .definition(&store, &input.entity.entity_type, None)
            .await?;
        let engine = self.check_engine(&store);
        let cancel = self.deadline(CancelToken::never());
        let depth = self.depth_policy.default;

        let (engine, cancel, entity, subject) = (&engine, &cancel, &input.entity, &input.subject);
        let checks = definition.permissions().iter().map(|permission| async move {
            let request = CheckRequest::new(entity.clone(), &permission.name, subject.clone())
                .with_depth(depth)
                .at_snapshot(snapshot)
                .with_schema_version(version);
            let result = engine.check_cancellable(&request, cancel).await?;
            Ok::<_, ApiError>(result.allowed.then(|| permission.name.clone()))
        });

        let granted: Vec<Option<String>> = stream::iter(checks)
            .buffered(self.branch_limit())
            .try_collect()
            .await?;
        Ok(granted.into_iter().flatten().collect())
    }

    /// Concrete subjects of `subject_type` holding the permission, collected
    /// from the expansion tree.
    pub async fn lookup_subjects(
        &self,
        tenant_id: &TenantId,
        input: LookupSubjectsInput,
    ) -> Result<Vec<EntityRef>, ApiError> {
        let expanded = self
            .expand(
                tenant_id,
                ExpandInput {
                    consistency: input.consistency,
                    ..ExpandInput::new(input.entity, input.permission)
                },
            )
            .await?;

        Ok(expanded
            .tree
            .concrete_subjects(&input.subject_type)
            .into_iter()
            .collect())
    }

    /// Ids of entities of a type on which the subject holds the permission,
    /// in storage order and bounded by `limit`.
    pub async fn lookup_entities(
        &self,
        tenant_id: &TenantId,
        input: LookupEntitiesInput,
    ) -> Result<Vec<String>, ApiError> {
        let store = self.store(tenant_id);
        let snapshot = pin_snapshot(store.as_ref(), input.consistency).await?;
        let (definition, version) = self.definition(&store, &input.entity_type, None).await?;
        if definition.reference(&input.permission).is_none() {
            return Err(CheckError::PermissionNotFound {
                entity_type: input.entity_type,
                permission: input.permission,
            }
            .into());
        }

        let ids = store
            .list_entity_ids(&input.entity_type, Some(snapshot), None)
            .await?;
        let limit = input.limit.unwrap_or(DEFAULT_LOOKUP_LIMIT);
        let engine = self.check_engine(&store);
        let cancel = self.deadline(CancelToken::never());
        let depth = self.depth_policy.default;

        let (engine, cancel, input) = (&engine, &cancel, &input);
        let mut checks = stream::iter(ids.into_iter().map(|entity_id| async move {
            let request = CheckRequest::new(
                EntityRef::new(input.entity_type.as_str(), entity_id.as_str()),
                input.permission.as_str(),
                input.subject.clone(),
            )
            .with_depth(depth)
            .at_snapshot(snapshot)
            .with_schema_version(version);
            let result = engine.check_cancellable(&request, cancel).await?;
            Ok::<_, ApiError>((entity_id, result.allowed))
        }))
        .buffered(self.branch_limit());

        let mut allowed = Vec::new();
        while allowed.len() < limit
            && let Some(next) = checks.next().await
        {
            let (entity_id, granted) = next?;
            if granted {
                allowed.push(entity_id);
            }
        }
        Ok(allowed)
    }

    /// Writes tuples after checking each against the head schema.
    pub async fn write_relationships(
        &self,
        tenant_id: &TenantId,
        writes: &[Tuple],
        deletes: &[TupleFilter],
    ) -> Result<SnapshotToken, ApiError> {
        let store = self.factory.for_tenant(tenant_id);

        if !writes.is_empty() {
            let (schema, _) = store
                .read_schema(None)
                .await?
                .ok_or(ApiError::SchemaNotFound)?;
            for tuple in writes {
                validate_relationship(&schema, tuple)?;
            }
        }

        let token = store.write(writes, deletes).await?;
        tracing::debug!(
            written = writes.len(),
            delete_filters = deletes.len(),
            %token,
            "relationships written"
        );
        Ok(token)
    }

    pub async fn read_relationships(
        &self,
        tenant_id: &TenantId,
        filter: &TupleFilter,
        consistency: Consistency,
        limit: Option<usize>,
    ) -> Result<Vec<Tuple>, ApiError> {
        let store = self.factory.for_tenant(tenant_id);
        let snapshot = resolve_snapshot(&store, consistency).await?;
        Ok(store.read(filter, snapshot, limit).await?)
    }

    pub async fn delete_relationships(
        &self,
        tenant_id: &TenantId,
        filters: &[TupleFilter],
    ) -> Result<SnapshotToken, ApiError> {
        self.write_relationships(tenant_id, &[], filters).await
    }

    /// Validates and stores a new schema version. Breaking changes against
    /// the head version are refused unless `force` is set.
    pub async fn write_schema(
        &self,
        tenant_id: &TenantId,
        schema: Schema,
        force: bool,
    ) -> Result<WriteSchemaOutput, ApiError> {
        validate_schema_limits(&schema, &self.schema_limits).map_err(ApiError::Validation)?;
        validate_schema(&schema).map_err(ApiError::Validation)?;

        let store = self.factory.for_tenant(tenant_id);
        let mut breaking_changes_overridden = false;

        if let Some((existing, _)) = store.read_schema(None).await? {
            let breaking = detect_breaking_changes(&existing, &schema);
            if !breaking.is_empty() {
                if !force {
                    return Err(ApiError::BreakingChanges(breaking));
                }
                tracing::warn!(count = breaking.len(), "overriding breaking schema changes");
                breaking_changes_overridden = true;
            }
        }

        let version = store.write_schema(schema).await?;
        tracing::info!(%version, "schema written");

        Ok(WriteSchemaOutput {
            version,
            breaking_changes_overridden,
        })
    }

    pub async fn read_schema(
        &self,
        tenant_id: &TenantId,
        version: Option<SchemaVersion>,
    ) -> Result<(Arc<Schema>, SchemaVersion), ApiError> {
        let store = self.factory.for_tenant(tenant_id);
        store
            .read_schema(version)
            .await?
            .ok_or(ApiError::SchemaNotFound)
    }

    fn store(&self, tenant_id: &TenantId) -> Arc<F::Store> {
        Arc::new(self.factory.for_tenant(tenant_id))
    }

    fn check_engine(
        &self,
        store: &Arc<F::Store>,
    ) -> CheckEngine<StoreTupleReader<F::Store>, StoreSchemaReader<F::Store>> {
        CheckEngine::new(
            Arc::new(StoreTupleReader::new(Arc::clone(store))),
            Arc::new(StoreSchemaReader::new(Arc::clone(store))),
            self.engine_config.clone(),
        )
    }

    async fn definition(
        &self,
        store: &Arc<F::Store>,
        entity_type: &str,
        version: Option<SchemaVersion>,
    ) -> Result<(Arc<EntityDefinition>, SchemaVersion), ApiError> {
        Ok(StoreSchemaReader::new(Arc::clone(store))
            .read_entity_definition(entity_type, version)
            .await?)
    }

    fn deadline(&self, cancel: CancelToken) -> CancelToken {
        match self.timeout {
            Some(timeout) => cancel.with_timeout(timeout),
            None => cancel,
        }
    }

    fn branch_limit(&self) -> usize {
        self.engine_config.max_concurrent_branches.max(1)
    }
}

async fn resolve_snapshot<S: RelationshipStore>(
    store: &S,
    consistency: Consistency,
) -> Result<Option<SnapshotToken>, ApiError> {
    match consistency {
        Consistency::FullConsistency => Ok(Some(store.snapshot().await?)),
        Consistency::MinimizeLatency => Ok(None),
        Consistency::AtLeastAsFresh(token) => {
            let head = store.snapshot().await?;
            if token > head {
                return Err(StorageError::SnapshotAhead {
                    requested: token.value(),
                    current: head.value(),
                }
                .into());
            }
            Ok(Some(head))
        }
        Consistency::AtExactSnapshot(token) => Ok(Some(token)),
    }
}

/// Like [`resolve_snapshot`] but always yields a concrete token, so that
/// several checks of one call agree on what they see.
async fn pin_snapshot<S: RelationshipStore>(
    store: &S,
    consistency: Consistency,
) -> Result<SnapshotToken, ApiError> {
    match resolve_snapshot(store, consistency).await? {
        Some(snapshot) => Ok(snapshot),
        None => Ok(store.snapshot().await?),
    }
}

fn validate_relationship(schema: &Schema, tuple: &Tuple) -> Result<(), ApiError> {
    let invalid = |reason: String| ApiError::InvalidRelationship {
        tuple: tuple.to_string(),
        reason,
    };

    let entity_type = &tuple.entity.entity_type;
    let definition = schema
        .entity(entity_type)
        .ok_or_else(|| invalid(format!("unknown entity type '{entity_type}'")))?;
    let relation = definition.relation(&tuple.relation).ok_or_else(|| {
        invalid(format!(
            "'{}' is not a relation of '{entity_type}'",
            tuple.relation
        ))
    })?;

    let subject = &tuple.subject;
    let allowed = relation.subject_types.iter().any(|allowed| {
        allowed.type_name == subject.entity.entity_type
            && match (&allowed.relation, &subject.relation) {
                (None, SubjectRelation::None | SubjectRelation::Ellipsis) => true,
                (Some(expected), SubjectRelation::Named(actual)) => expected == actual,
                _ => false,
            }
    });
    if !allowed {
        return Err(invalid(format!(
            "subject '{subject}' not allowed on '{entity_type}#{}'",
            tuple.relation
        )));
    }
    Ok(())
}
