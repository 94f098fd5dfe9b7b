use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use serde::{Serialize, Serializer};
use tracing::Instrument;

use crate::schema::types::{Reference, RewriteRule, SchemaVersion};
use crate::tuple::{EntityRef, SnapshotToken, Subject, Tuple};

use super::visit::{Path, VisitKey, VisitMap};
use super::{
    CancelToken, CheckError, DEFAULT_DEPTH, Definitions, EngineConfig, SchemaReader, TupleReader,
    consume, load_root, load_snapshot, validate_depth,
};

#[derive(Debug, Clone)]
pub struct ExpandRequest {
    pub entity: EntityRef,
    pub permission: String,
    pub depth: u32,
    pub snapshot: Option<SnapshotToken>,
    pub schema_version: Option<SchemaVersion>,
}

impl ExpandRequest {
    pub fn new(entity: EntityRef, permission: impl Into<String>) -> Self {
        Self {
            entity,
            permission: permission.into(),
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
pub struct ExpandResult {
    pub tree: ExpandTree,
    pub snapshot: SnapshotToken,
    pub schema_version: SchemaVersion,
}

/// `entity#relation` a tree node was built for. Tuple-to-userset leaves use
/// the dotted `tupleset.computed` form as their relation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub entity: EntityRef,
    pub relation: String,
}

impl Target {
    pub fn new(entity: &EntityRef, relation: impl Into<String>) -> Self {
        Self {
            entity: entity.clone(),
            relation: relation.into(),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.entity, self.relation)
    }
}

impl Serialize for Target {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Union,
    Intersection,
}

/// Resolution tree mirroring a permission's rewrite structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExpandTree {
    Rewrite {
        target: Target,
        operation: Operation,
        children: Vec<ExpandTree>,
    },
    Leaf {
        target: Target,
        subjects: Vec<Subject>,
        exclusion: bool,
        /// Expansions of the userset subjects, in subject order. Usersets
        /// already being expanded higher up the tree are listed but skipped.
        #[serde(skip_serializing_if = "Vec::is_empty")]
        expanded: Vec<ExpandTree>,
    },
}

impl ExpandTree {
    pub fn target(&self) -> &Target {
        match self {
            Self::Rewrite { target, .. } | Self::Leaf { target, .. } => target,
        }
    }

    fn is_excluded(&self) -> bool {
        matches!(self, Self::Leaf { exclusion: true, .. })
    }

    /// Concrete subjects of `subject_type` the tree grants.
    ///
    /// Union and intersection nodes act as set union and intersection.
    /// Excluded leaves subtract from the intersection they sit in and are
    /// ignored elsewhere.
    pub fn concrete_subjects(&self, subject_type: &str) -> BTreeSet<EntityRef> {
        if self.is_excluded() {
            return BTreeSet::new();
        }
        self.granted(subject_type)
    }

    fn granted(&self, subject_type: &str) -> BTreeSet<EntityRef> {
        match self {
            Self::Leaf {
                subjects, expanded, ..
            } => subjects
                .iter()
                .filter_map(|subject| match subject {
                    Subject::Concrete(entity) if entity.entity_type == subject_type => {
                        Some(entity.clone())
                    }
                    _ => None,
                })
                .chain(expanded.iter().flat_map(|tree| tree.concrete_subjects(subject_type)))
                .collect(),
            Self::Rewrite {
                operation: Operation::Union,
                children,
                ..
            } => children
                .iter()
                .flat_map(|child| child.concrete_subjects(subject_type))
                .collect(),
            Self::Rewrite {
                operation: Operation::Intersection,
                children,
                ..
            } => {
                let (excluded, included): (Vec<_>, Vec<_>) =
                    children.iter().partition(|child| child.is_excluded());
                let mut sets = included.iter().map(|child| child.granted(subject_type));
                let Some(first) = sets.next() else {
                    return BTreeSet::new();
                };
                let mut result =
                    sets.fold(first, |acc, set| acc.intersection(&set).cloned().collect());
                for child in excluded {
                    for entity in child.granted(subject_type) {
                        result.remove(&entity);
                    }
                }
                result
            }
        }
    }
}

struct Expanded {
    tree: ExpandTree,
    /// Lowest depth left anywhere in the subtree.
    remaining: u32,
    cycle_cut: bool,
}

#[derive(Debug, Clone)]
struct ExpandMemo {
    tree: ExpandTree,
    consumed: u32,
}

impl ExpandMemo {
    /// Replays the memo at `depth`, unless building the tree needed more
    /// depth than is left.
    fn at(self, depth: u32) -> Option<Expanded> {
        (self.consumed < depth).then(|| Expanded {
            tree: self.tree,
            remaining: depth - self.consumed,
            cycle_cut: false,
        })
    }
}

struct Collected {
    trees: Vec<ExpandTree>,
    remaining: u32,
    cycle_cut: bool,
}

struct ExpandContext<'a, S> {
    snapshot: SnapshotToken,
    initial_depth: u32,
    definitions: Definitions<'a, S>,
    visits: VisitMap<VisitKey, ExpandMemo>,
    cancel: &'a CancelToken,
}

pub struct ExpandEngine<T: TupleReader, S: SchemaReader> {
    tuples: Arc<T>,
    schema: Arc<S>,
    config: EngineConfig,
}

impl<T: TupleReader, S: SchemaReader> ExpandEngine<T, S> {
    pub fn new(tuples: Arc<T>, schema: Arc<S>, config: EngineConfig) -> Self {
        Self {
            tuples,
            schema,
            config,
        }
    }

    pub async fn expand(&self, request: &ExpandRequest) -> Result<ExpandResult, CheckError> {
        self.expand_cancellable(request, &CancelToken::never()).await
    }

    pub async fn expand_cancellable(
        &self,
        request: &ExpandRequest,
        cancel: &CancelToken,
    ) -> Result<ExpandResult, CheckError> {
        let span = tracing::debug_span!(
            "expand",
            entity = %request.entity,
            permission = %request.permission,
            depth = request.depth,
        );
        self.run(request, cancel).instrument(span).await
    }

    async fn run(
        &self,
        request: &ExpandRequest,
        cancel: &CancelToken,
    ) -> Result<ExpandResult, CheckError> {
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

        let ctx = ExpandContext {
            snapshot,
            initial_depth: request.depth,
            definitions: Definitions::new(self.schema.as_ref(), root, version),
            visits: VisitMap::new(),
            cancel,
        };

        let expanded = self
            .expand_name(
                &request.entity,
                &request.permission,
                request.depth,
                Path::default(),
                &ctx,
            )
            .await?;

        Ok(ExpandResult {
            tree: expanded.tree,
            snapshot,
            schema_version: ctx.definitions.version(),
        })
    }

    fn expand_name<'a>(
        &'a self,
        entity: &'a EntityRef,
        name: &'a str,
        depth: u32,
        path: Path,
        ctx: &'a ExpandContext<'a, S>,
    ) -> BoxFuture<'a, Result<Expanded, CheckError>> {
        Box::pin(async move {
            let key = VisitKey::new(entity, name);
            if path.contains(&key) {
                tracing::debug!(%entity, relation = name, "cycle cut");
                return Ok(Expanded {
                    tree: ExpandTree::Leaf {
                        target: Target::new(entity, name),
                        subjects: vec![],
                        exclusion: false,
                        expanded: vec![],
                    },
                    remaining: depth,
                    cycle_cut: true,
                });
            }
            if let Some(expanded) = ctx.visits.get(&key).and_then(|memo| memo.at(depth)) {
                tracing::debug!(%entity, relation = name, "memo hit");
                return Ok(expanded);
            }

            let definition = ctx
                .definitions
                .get(&entity.entity_type, ctx.cancel)
                .await?;
            let path = path.push(key.clone());

            let expanded = match definition.reference(name) {
                Some(Reference::Permission(permission)) => {
                    self.expand_rule(&permission.rule, entity, name, depth, &path, ctx)
                        .await?
                }
                Some(Reference::Relation(_)) => {
                    self.expand_direct(entity, name, depth, &path, ctx).await?
                }
                None => {
                    return Err(CheckError::RelationNotFound {
                        entity_type: entity.entity_type.clone(),
                        relation: name.to_string(),
                    });
                }
            };

            if !expanded.cycle_cut {
                ctx.visits.insert(
                    key,
                    ExpandMemo {
                        tree: expanded.tree.clone(),
                        consumed: depth.saturating_sub(expanded.remaining),
                    },
                );
            }
            Ok(expanded)
        })
    }

    fn expand_rule<'a>(
        &'a self,
        rule: &'a RewriteRule,
        entity: &'a EntityRef,
        permission: &'a str,
        depth: u32,
        path: &'a Path,
        ctx: &'a ExpandContext<'a, S>,
    ) -> BoxFuture<'a, Result<Expanded, CheckError>> {
        Box::pin(async move {
            let depth = consume(depth, ctx.initial_depth)?;
            match rule {
                RewriteRule::Union(children) => {
                    self.expand_rewrite(
                        Operation::Union,
                        children,
                        entity,
                        permission,
                        depth,
                        path,
                        ctx,
                    )
                    .await
                }
                RewriteRule::Intersection(children) => {
                    self.expand_rewrite(
                        Operation::Intersection,
                        children,
                        entity,
                        permission,
                        depth,
                        path,
                        ctx,
                    )
                    .await
                }
                RewriteRule::ComputedUserset {
                    relation,
                    exclusion,
                } => {
                    let inner = self
                        .expand_name(entity, relation, depth, path.clone(), ctx)
                        .await?;
                    let tree = match inner.tree {
                        // A negated leaf referenced through `not` cancels out.
                        ExpandTree::Leaf {
                            target,
                            subjects,
                            exclusion: inner_exclusion,
                            expanded,
                        } => ExpandTree::Leaf {
                            target,
                            subjects,
                            exclusion: inner_exclusion != *exclusion,
                            expanded,
                        },
                        rewrite => ExpandTree::Leaf {
                            target: Target::new(entity, relation.as_str()),
                            subjects: vec![Subject::userset(entity.clone(), relation.as_str())],
                            exclusion: *exclusion,
                            expanded: vec![rewrite],
                        },
                    };
                    Ok(Expanded {
                        tree,
                        remaining: inner.remaining,
                        cycle_cut: inner.cycle_cut,
                    })
                }
                RewriteRule::TupleToUserset {
                    tupleset,
                    computed,
                    exclusion,
                } => {
                    let tuples = self.read(entity, tupleset, ctx).await?;
                    let subjects: Vec<_> = tuples
                        .iter()
                        .map(|tuple| tuple.subject.resolve(Some(computed)))
                        .collect();
                    let usersets = self.expand_usersets(&subjects, depth, path, ctx).await?;
                    Ok(Expanded {
                        tree: ExpandTree::Leaf {
                            target: Target::new(entity, format!("{tupleset}.{computed}")),
                            subjects,
                            exclusion: *exclusion,
                            expanded: usersets.trees,
                        },
                        remaining: usersets.remaining,
                        cycle_cut: usersets.cycle_cut,
                    })
                }
            }
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn expand_rewrite(
        &self,
        operation: Operation,
        children: &[RewriteRule],
        entity: &EntityRef,
        permission: &str,
        depth: u32,
        path: &Path,
        ctx: &ExpandContext<'_, S>,
    ) -> Result<Expanded, CheckError> {
        let branches: Vec<BoxFuture<'_, Result<Expanded, CheckError>>> = children
            .iter()
            .map(|child| self.expand_rule(child, entity, permission, depth, path, ctx))
            .collect();
        let collected = self.collect(branches, depth, ctx).await?;

        Ok(Expanded {
            tree: ExpandTree::Rewrite {
                target: Target::new(entity, permission),
                operation,
                children: collected.trees,
            },
            remaining: collected.remaining,
            cycle_cut: collected.cycle_cut,
        })
    }

    async fn expand_direct(
        &self,
        entity: &EntityRef,
        relation: &str,
        depth: u32,
        path: &Path,
        ctx: &ExpandContext<'_, S>,
    ) -> Result<Expanded, CheckError> {
        let tuples = self.read(entity, relation, ctx).await?;
        let subjects: Vec<_> = tuples
            .iter()
            .map(|tuple| tuple.subject.resolve(None))
            .collect();
        let usersets = self.expand_usersets(&subjects, depth, path, ctx).await?;

        Ok(Expanded {
            tree: ExpandTree::Leaf {
                target: Target::new(entity, relation),
                subjects,
                exclusion: false,
                expanded: usersets.trees,
            },
            remaining: usersets.remaining,
            cycle_cut: usersets.cycle_cut,
        })
    }

    async fn expand_usersets(
        &self,
        subjects: &[Subject],
        depth: u32,
        path: &Path,
        ctx: &ExpandContext<'_, S>,
    ) -> Result<Collected, CheckError> {
        let mut cycle_cut = false;
        let mut branches = Vec::new();
        for subject in subjects {
            let Subject::Userset { entity, relation } = subject else {
                continue;
            };
            if path.contains(&VisitKey::new(entity, relation)) {
                tracing::debug!(%entity, relation = relation.as_str(), "cycle cut");
                cycle_cut = true;
                continue;
            }
            let branch: BoxFuture<'_, Result<Expanded, CheckError>> = Box::pin(async move {
                let depth = consume(depth, ctx.initial_depth)?;
                self.expand_name(entity, relation, depth, path.clone(), ctx)
                    .await
            });
            branches.push(branch);
        }

        let mut collected = self.collect(branches, depth, ctx).await?;
        collected.cycle_cut |= cycle_cut;
        Ok(collected)
    }

    /// Drives `branches` in order, keeping the lowest depth any of them left.
    async fn collect(
        &self,
        branches: Vec<BoxFuture<'_, Result<Expanded, CheckError>>>,
        depth: u32,
        ctx: &ExpandContext<'_, S>,
    ) -> Result<Collected, CheckError> {
        let mut results = stream::iter(branches).buffered(self.config.branch_limit());
        let mut collected = Collected {
            trees: Vec::new(),
            remaining: depth,
            cycle_cut: false,
        };
        while let Some(result) = ctx.cancel.next(&mut results).await? {
            let expanded = result?;
            collected.remaining = collected.remaining.min(expanded.remaining);
            collected.cycle_cut |= expanded.cycle_cut;
            collected.trees.push(expanded.tree);
        }
        Ok(collected)
    }

    async fn read(
        &self,
        entity: &EntityRef,
        relation: &str,
        ctx: &ExpandContext<'_, S>,
    ) -> Result<Vec<Tuple>, CheckError> {
        ctx.cancel
            .guard(self.tuples.query_tuples(entity, relation, ctx.snapshot))
            .await
    }
}
