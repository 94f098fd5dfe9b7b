use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use tracing::Instrument;

use crate::schema::types::{Reference, RewriteRule, SchemaVersion};
use crate::tuple::{EntityRef, SnapshotToken, Subject, Tuple};

use super::visit::{Path, VisitKey, VisitMap};
use super::{
    CancelToken, CheckError, DEFAULT_DEPTH, Definitions, EngineConfig, SchemaReader, TupleReader,
    consume, load_root, load_snapshot, validate_depth,
};

#[derive(Debug, Clone)]
pub struct CheckRequest {
    pub entity: EntityRef,
    pub permission: String,
    pub subject: Subject,
    pub depth: u32,
    pub snapshot: Option<SnapshotToken>,
    pub schema_version: Option<SchemaVersion>,
}

impl CheckRequest {
    pub fn new(entity: EntityRef, permission: impl Into<String>, subject: Subject) -> Self {
        Self {
            entity,
            permission: permission.into(),
            subject,
            depth: DEFAULT_DEPTH,
            snapshot: None,
            schema_version: None,
        }
    }

    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    pub fn at_snapshot(mut self, snapshot: SnapshotToken) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    pub fn with_schema_version(mut self, version: SchemaVersion) -> Self {
        self.schema_version = Some(version);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub allowed: bool,
    /// Depth left at the point the decision was made.
    pub remaining_depth: u32,
    /// Tuple queries issued while deciding.
    pub check_count: u32,
    pub snapshot: SnapshotToken,
    pub schema_version: SchemaVersion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Decision {
    allowed: bool,
    remaining: u32,
    /// Set when a cycle was cut somewhere below; such decisions depend on the
    /// path they were reached through and are never memoized.
    cycle_cut: bool,
}

impl Decision {
    fn allowed(remaining: u32) -> Self {
        Self {
            allowed: true,
            remaining,
            cycle_cut: false,
        }
    }

    fn denied(remaining: u32) -> Self {
        Self {
            allowed: false,
            remaining,
            cycle_cut: false,
        }
    }

    fn invert_if(self, exclusion: bool) -> Self {
        if exclusion {
            Self {
                allowed: !self.allowed,
                ..self
            }
        } else {
            self
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Memo {
    allowed: bool,
    consumed: u32,
}

impl Memo {
    /// Replays the memo at `depth`, unless the original evaluation needed
    /// more depth than is left.
    fn at(self, depth: u32) -> Option<Decision> {
        (self.consumed < depth).then(|| Decision {
            allowed: self.allowed,
            remaining: depth - self.consumed,
            cycle_cut: false,
        })
    }
}

struct CheckContext<'a, S> {
    subject: &'a Subject,
    snapshot: SnapshotToken,
    initial_depth: u32,
    definitions: Definitions<'a, S>,
    visits: VisitMap<VisitKey, Memo>,
    check_count: AtomicU32,
    cancel: &'a CancelToken,
}

pub struct CheckEngine<T: TupleReader, S: SchemaReader> {
    tuples: Arc<T>,
    schema: Arc<S>,
    config: EngineConfig,
}

impl<T: TupleReader, S: SchemaReader> CheckEngine<T, S> {
    pub fn new(tuples: Arc<T>, schema: Arc<S>, config: EngineConfig) -> Self {
        Self {
            tuples,
            schema,
            config,
        }
    }

    pub async fn check(&self, request: &CheckRequest) -> Result<CheckResult, CheckError> {
        self.check_cancellable(request, &CancelToken::never()).await
    }

    pub async fn check_cancellable(
        &self,
        request: &CheckRequest,
        cancel: &CancelToken,
    ) -> Result<CheckResult, CheckError> {
        let span = tracing::debug_span!(
            "check",
            entity = %request.entity,
            permission = %request.permission,
            subject = %request.subject,
            depth = request.depth,
        );
        self.run(request, cancel).instrument(span).await
    }

    async fn run(
        &self,
        request: &CheckRequest,
        cancel: &CancelToken,
    ) -> Result<CheckResult, CheckError> {
        validate_depth(request.depth)?;

        let (root, version) = load_root(
            self.schema.as_ref(),
            &request.entity.entity_type,
            request.schema_version,
            cancel,
        )
        .await?;
        if root.reference(&request.permission).is_none() {
            return Err(CheckError::PermissionNotFound {
                entity_type: request.entity.entity_type.clone(),
                permission: request.permission.clone(),
            });
        }
        let snapshot = load_snapshot(self.tuples.as_ref(), request.snapshot, cancel).await?;

        let ctx = CheckContext {
            subject: &request.subject,
            snapshot,
            initial_depth: request.depth,
            definitions: Definitions::new(self.schema.as_ref(), root, version),
            visits: VisitMap::new(),
            check_count: AtomicU32::new(0),
            cancel,
        };

        let decision = self
            .resolve(
                &request.entity,
                &request.permission,
                request.depth,
                Path::default(),
                &ctx,
            )
            .await?;

        let check_count = ctx.check_count.load(Ordering::Relaxed);
        tracing::debug!(
            allowed = decision.allowed,
            remaining_depth = decision.remaining,
            check_count,
            "check resolved"
        );

        Ok(CheckResult {
            allowed: decision.allowed,
            remaining_depth: decision.remaining,
            check_count,
            snapshot,
            schema_version: ctx.definitions.version(),
        })
    }

    /// Decides whether the request subject holds `name` (a relation or a
    /// permission) on `entity`.
    fn resolve<'a>(
        &'a self,
        entity: &'a EntityRef,
        name: &'a str,
        depth: u32,
        path: Path,
        ctx: &'a CheckContext<'a, S>,
    ) -> BoxFuture<'a, Result<Decision, CheckError>> {
        Box::pin(async move {
            if let Subject::Userset {
                entity: subject_entity,
                relation,
            } = ctx.subject
                && subject_entity == entity
                && relation == name
            {
                return Ok(Decision::allowed(depth));
            }

            let key = VisitKey::new(entity, name);
            if path.contains(&key) {
                tracing::debug!(%entity, relation = name, "cycle cut");
                return Ok(Decision {
                    allowed: false,
                    remaining: depth,
                    cycle_cut: true,
                });
            }
            if let Some(decision) = ctx.visits.get(&key).and_then(|memo| memo.at(depth)) {
                tracing::debug!(%entity, relation = name, "memo hit");
                return Ok(decision);
            }

            let definition = ctx
                .definitions
                .get(&entity.entity_type, ctx.cancel)
                .await?;
            let path = path.push(key.clone());

            let decision = match definition.reference(name) {
                Some(Reference::Permission(permission)) => {
                    self.eval_rule(&permission.rule, entity, depth, &path, ctx)
                        .await?
                }
                Some(Reference::Relation(_)) => {
                    self.eval_direct(entity, name, depth, &path, ctx).await?
                }
                None => {
                    return Err(CheckError::RelationNotFound {
                        entity_type: entity.entity_type.clone(),
                        relation: name.to_string(),
                    });
                }
            };

            if !decision.cycle_cut {
                ctx.visits.insert(
                    key,
                    Memo {
                        allowed: decision.allowed,
                        consumed: depth.saturating_sub(decision.remaining),
                    },
                );
            }
            Ok(decision)
        })
    }

    fn eval_rule<'a>(
        &'a self,
        rule: &'a RewriteRule,
        entity: &'a EntityRef,
        depth: u32,
        path: &'a Path,
        ctx: &'a CheckContext<'a, S>,
    ) -> BoxFuture<'a, Result<Decision, CheckError>> {
        Box::pin(async move {
            let depth = consume(depth, ctx.initial_depth)?;
            match rule {
                RewriteRule::Union(children) => {
                    let branches = children
                        .iter()
                        .map(|child| self.eval_rule(child, entity, depth, path, ctx))
                        .collect();
                    any_of(branches, depth, self.config.branch_limit(), ctx.cancel).await
                }
                RewriteRule::Intersection(children) => {
                    let branches = children
                        .iter()
                        .map(|child| self.eval_rule(child, entity, depth, path, ctx))
                        .collect();
                    all_of(branches, depth, self.config.branch_limit(), ctx.cancel).await
                }
                RewriteRule::ComputedUserset {
                    relation,
                    exclusion,
                } => {
                    let decision = self
                        .resolve(entity, relation, depth, path.clone(), ctx)
                        .await?;
                    Ok(decision.invert_if(*exclusion))
                }
                RewriteRule::TupleToUserset {
                    tupleset,
                    computed,
                    exclusion,
                } => {
                    let decision = self
                        .eval_tuple_to_userset(entity, tupleset, computed, depth, path, ctx)
                        .await?;
                    Ok(decision.invert_if(*exclusion))
                }
            }
        })
    }

    async fn eval_direct(
        &self,
        entity: &EntityRef,
        relation: &str,
        depth: u32,
        path: &Path,
        ctx: &CheckContext<'_, S>,
    ) -> Result<Decision, CheckError> {
        let tuples = self.read(entity, relation, ctx).await?;

        let mut usersets = Vec::new();
        for tuple in &tuples {
            match tuple.subject.resolve(None) {
                subject if subject == *ctx.subject => return Ok(Decision::allowed(depth)),
                Subject::Userset { entity, relation } => usersets.push((entity, relation)),
                Subject::Concrete(_) => {}
            }
        }

        self.any_userset(&usersets, depth, path, ctx).await
    }

    async fn eval_tuple_to_userset(
        &self,
        entity: &EntityRef,
        tupleset: &str,
        computed: &str,
        depth: u32,
        path: &Path,
        ctx: &CheckContext<'_, S>,
    ) -> Result<Decision, CheckError> {
        let tuples = self.read(entity, tupleset, ctx).await?;

        let mut usersets = Vec::new();
        for tuple in &tuples {
            match tuple.subject.resolve(Some(computed)) {
                subject if subject == *ctx.subject => return Ok(Decision::allowed(depth)),
                Subject::Userset { entity, relation } => usersets.push((entity, relation)),
                Subject::Concrete(_) => {}
            }
        }

        self.any_userset(&usersets, depth, path, ctx).await
    }

    /// Recurses into each userset; every hop spends one unit of depth.
    async fn any_userset(
        &self,
        usersets: &[(EntityRef, String)],
        depth: u32,
        path: &Path,
        ctx: &CheckContext<'_, S>,
    ) -> Result<Decision, CheckError> {
        let branches = usersets
            .iter()
            .map(|(entity, relation)| {
                let branch: Branch<'_> = Box::pin(async move {
                    let depth = consume(depth, ctx.initial_depth)?;
                    self.resolve(entity, relation, depth, path.clone(), ctx)
                        .await
                });
                branch
            })
            .collect();
        any_of(branches, depth, self.config.branch_limit(), ctx.cancel).await
    }

    async fn read(
        &self,
        entity: &EntityRef,
        relation: &str,
        ctx: &CheckContext<'_, S>,
    ) -> Result<Vec<Tuple>, CheckError> {
        ctx.check_count.fetch_add(1, Ordering::Relaxed);
        ctx.cancel
            .guard(self.tuples.query_tuples(entity, relation, ctx.snapshot))
            .await
    }
}

type Branch<'a> = BoxFuture<'a, Result<Decision, CheckError>>;

/// ALLOWED on the first ALLOWED branch; dropping the stream cancels the rest.
async fn any_of(
    branches: Vec<Branch<'_>>,
    depth: u32,
    limit: usize,
    cancel: &CancelToken,
) -> Result<Decision, CheckError> {
    if branches.is_empty() {
        return Ok(Decision::denied(depth));
    }

    let mut results = stream::iter(branches).buffer_unordered(limit);
    let mut denied = Decision::denied(depth);
    while let Some(result) = cancel.next(&mut results).await? {
        let decision = result?;
        if decision.allowed {
            return Ok(decision);
        }
        denied.remaining = denied.remaining.min(decision.remaining);
        denied.cycle_cut |= decision.cycle_cut;
    }
    Ok(denied)
}

/// DENIED on the first DENIED branch.
async fn all_of(
    branches: Vec<Branch<'_>>,
    depth: u32,
    limit: usize,
    cancel: &CancelToken,
) -> Result<Decision, CheckError> {
    if branches.is_empty() {
        return Ok(Decision::denied(depth));
    }

    let mut results = stream::iter(branches).buffer_unordered(limit);
    let mut allowed = Decision::allowed(depth);
    while let Some(result) = cancel.next(&mut results).await? {
        let decision = result?;
        if !decision.allowed {
            return Ok(decision);
        }
        allowed.remaining = allowed.remaining.min(decision.remaining);
        allowed.cycle_cut |= decision.cycle_cut;
    }
    Ok(allowed)
}
