use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::schema::types::{
    EntityDefinition, PermissionDef, RelationDef, RewriteRule, Schema, SchemaVersion,
};
use crate::tuple::{EntityRef, SnapshotToken, Tuple, TupleFilter};

use super::{CheckError, StaticSchema, TupleReader};

pub(crate) struct TestStore {
    tuples: Vec<Tuple>,
    queries: AtomicUsize,
    delay: Option<Duration>,
    failing_relation: Option<String>,
}

impl TestStore {
    pub(crate) fn new(tuples: Vec<Tuple>) -> Self {
        Self {
            tuples,
            queries: AtomicUsize::new(0),
            delay: None,
            failing_relation: None,
        }
    }

    /// Every query sleeps for `delay` before answering.
    pub(crate) fn slow(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queries on `relation` fail with a storage error.
    pub(crate) fn failing_on(mut self, relation: &str) -> Self {
        self.failing_relation = Some(relation.to_string());
        self
    }

    pub(crate) fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

impl TupleReader for TestStore {
    async fn query_tuples(
        &self,
        entity: &EntityRef,
        relation: &str,
        _snapshot: SnapshotToken,
    ) -> Result<Vec<Tuple>, CheckError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing_relation.as_deref() == Some(relation) {
            return Err(CheckError::Storage(format!("{entity}#{relation} unavailable")));
        }
        let filter = TupleFilter::for_relation(entity, relation);
        Ok(self
            .tuples
            .iter()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect())
    }

    async fn head_snapshot(&self) -> Result<SnapshotToken, CheckError> {
        Ok(SnapshotToken::new(1))
    }
}

pub(crate) fn tuples(lines: &[&str]) -> Vec<Tuple> {
    lines.iter().map(|line| line.parse().unwrap()).collect()
}

pub(crate) fn leaf(text: &str) -> RewriteRule {
    text.parse().unwrap()
}

pub(crate) fn relation(name: &str, subject_types: &[&str]) -> RelationDef {
    RelationDef::new(
        name,
        subject_types.iter().map(|s| s.parse().unwrap()).collect(),
    )
}

pub(crate) fn static_schema(entities: Vec<EntityDefinition>) -> StaticSchema {
    StaticSchema::new(Schema::new(entities), SchemaVersion::new(1))
}

/// Drive-style schema: documents inherit access from folders, folders from
/// organizations.
pub(crate) fn drive_schema() -> StaticSchema {
    static_schema(vec![
        EntityDefinition::new("user", vec![], vec![]),
        EntityDefinition::new(
            "organization",
            vec![relation("admin", &["user"]), relation("member", &["user"])],
            vec![],
        ),
        EntityDefinition::new(
            "folder",
            vec![
                relation("parent", &["organization"]),
                relation("creator", &["user"]),
                relation("collaborator", &["user"]),
                relation("admin", &["user"]),
            ],
            vec![
                PermissionDef::new("read", leaf("collaborator")),
                PermissionDef::new(
                    "delete",
                    RewriteRule::Union(vec![leaf("creator"), leaf("parent.admin")]),
                ),
            ],
        ),
        EntityDefinition::new(
            "doc",
            vec![relation("parent", &["folder"]), relation("owner", &["user"])],
            vec![
                PermissionDef::new(
                    "read",
                    RewriteRule::Union(vec![
                        RewriteRule::Union(vec![leaf("owner"), leaf("parent.collaborator")]),
                        leaf("parent.admin"),
                    ]),
                ),
                PermissionDef::new(
                    "update",
                    RewriteRule::Intersection(vec![leaf("owner"), leaf("parent.admin")]),
                ),
            ],
        ),
    ])
}

/// GitHub-style schema with organization admins nested through memberships.
pub(crate) fn github_schema() -> StaticSchema {
    static_schema(vec![
        EntityDefinition::new("user", vec![], vec![]),
        EntityDefinition::new(
            "organization",
            vec![
                relation("admin", &["user", "organization#member"]),
                relation("member", &["user", "organization#member"]),
            ],
            vec![
                PermissionDef::new(
                    "create_repository",
                    RewriteRule::Union(vec![leaf("admin"), leaf("member")]),
                ),
                PermissionDef::new("delete", leaf("admin")),
            ],
        ),
        EntityDefinition::new(
            "repository",
            vec![
                relation("parent", &["organization"]),
                relation("owner", &["user", "organization#admin"]),
            ],
            vec![PermissionDef::new("push", leaf("owner"))],
        ),
    ])
}

pub(crate) fn drive_tuples() -> Vec<Tuple> {
    tuples(&[
        "doc:1#parent@folder:1",
        "folder:1#collaborator@user:1",
        "folder:1#collaborator@user:3",
        "doc:1#owner@user:2",
        "folder:1#admin@user:1",
    ])
}

pub(crate) fn github_tuples() -> Vec<Tuple> {
    tuples(&[
        "repository:1#owner@organization:2#admin",
        "organization:2#admin@organization:3#member",
        "organization:3#member@user:1",
    ])
}
