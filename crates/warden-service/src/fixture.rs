use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::Deserialize;
use warden_core::engine::CancelToken;
use warden_core::schema::Schema;
use warden_core::tuple::{EntityRef, ParseTupleError, Subject, TenantId, Tuple};
use warden_storage::StoreFactory;

use crate::error::ApiError;
use crate::service::{CheckInput, PermissionService};

/// A self-contained scenario: a compiled schema, the relationships to store
/// and the checks expected to hold.
///
/// ```toml
/// relationships = ["doc:1#owner@user:1"]
///
/// [[schema.entities]]
/// name = "user"
///
/// [[schema.entities]]
/// name = "doc"
/// relations = [{ name = "owner", subject_types = ["user"] }]
/// permissions = [{ name = "read", rule = { union = ["owner"] } }]
///
/// [assertions]
/// "doc:1#read@user:1" = true
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct Fixture {
    pub schema: Schema,
    #[serde(default)]
    pub relationships: Vec<String>,
    #[serde(default)]
    pub assertions: BTreeMap<String, bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assertion {
    pub entity: EntityRef,
    pub permission: String,
    pub subject: Subject,
    pub expected: bool,
}

impl fmt::Display for Assertion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{}@{} = {}",
            self.entity, self.permission, self.subject, self.expected
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub assertion: Assertion,
    pub actual: bool,
}

impl Outcome {
    pub fn passed(&self) -> bool {
        self.assertion.expected == self.actual
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FixtureError {
    #[error("failed to read fixture '{0}': {1}")]
    ReadFile(String, String),

    #[error("failed to parse fixture: {0}")]
    Parse(String),

    #[error("invalid relationship in fixture: {0}")]
    Relationship(#[from] ParseTupleError),

    #[error(transparent)]
    Api(#[from] ApiError),
}

impl Fixture {
    pub fn load(path: &Path) -> Result<Self, FixtureError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| FixtureError::ReadFile(path.display().to_string(), e.to_string()))?;
        Self::parse(&contents)
    }

    pub fn parse(text: &str) -> Result<Self, FixtureError> {
        toml::from_str(text).map_err(|e| FixtureError::Parse(e.to_string()))
    }

    pub fn tuples(&self) -> Result<Vec<Tuple>, FixtureError> {
        self.relationships
            .iter()
            .map(|text| text.parse().map_err(FixtureError::from))
            .collect()
    }

    /// Assertions in key order. Keys use the relationship syntax with the
    /// permission in the relation position.
    pub fn assertions(&self) -> Result<Vec<Assertion>, FixtureError> {
        self.assertions
            .iter()
            .map(|(key, &expected)| {
                let tuple: Tuple = key.parse()?;
                Ok(Assertion {
                    subject: tuple.subject.resolve(None),
                    entity: tuple.entity,
                    permission: tuple.relation,
                    expected,
                })
            })
            .collect()
    }

    /// Writes the schema and relationships into the tenant's store.
    pub async fn install<F: StoreFactory>(
        &self,
        service: &PermissionService<F>,
        tenant_id: &TenantId,
    ) -> Result<(), FixtureError> {
        let tuples = self.tuples()?;
        service
            .write_schema(tenant_id, self.schema.clone(), false)
            .await?;
        if !tuples.is_empty() {
            service.write_relationships(tenant_id, &tuples, &[]).await?;
        }
        tracing::debug!(relationships = tuples.len(), "fixture installed");
        Ok(())
    }

    /// Runs every assertion against an installed fixture.
    pub async fn verify<F: StoreFactory>(
        &self,
        service: &PermissionService<F>,
        tenant_id: &TenantId,
        cancel: &CancelToken,
    ) -> Result<Vec<Outcome>, FixtureError> {
        let mut outcomes = Vec::new();
        for assertion in self.assertions()? {
            let input = CheckInput::new(
                assertion.entity.clone(),
                assertion.permission.as_str(),
                assertion.subject.clone(),
            );
            let output = service
                .check_cancellable(tenant_id, input, cancel.clone())
                .await?;
            outcomes.push(Outcome {
                assertion,
                actual: output.allowed,
            });
        }
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use warden_core::engine::EngineConfig;
    use warden_core::schema::SchemaLimits;
    use warden_storage::InMemoryStoreFactory;

    const FIXTURE: &str = r#"
relationships = [
    "doc:1#owner@user:alice",
    "doc:1#viewer@group:eng#member",
    "group:eng#member@user:carol",
]

[[schema.entities]]
name = "user"

[[schema.entities]]
name = "group"
relations = [{ name = "member", subject_types = ["user"] }]

[[schema.entities]]
name = "doc"
relations = [
    { name = "owner", subject_types = ["user"] },
    { name = "viewer", subject_types = ["user", "group#member"] },
    { name = "banned", subject_types = ["user"] },
]
permissions = [
    { name = "read", rule = { intersection = [{ union = ["owner", "viewer"] }, "not banned"] } },
]

[assertions]
"doc:1#read@user:alice" = true
"doc:1#read@user:carol" = true
"doc:1#read@user:mallory" = false
"#;

    fn service() -> PermissionService<InMemoryStoreFactory> {
        PermissionService::new(
            Arc::new(InMemoryStoreFactory::new()),
            EngineConfig::default(),
            SchemaLimits::default(),
        )
    }

    #[test]
    fn parses_schema_relationships_and_assertions() {
        let fixture = Fixture::parse(FIXTURE).unwrap();

        assert_eq!(fixture.schema.entities().len(), 3);
        assert_eq!(fixture.tuples().unwrap().len(), 3);
        let assertions = fixture.assertions().unwrap();
        assert_eq!(assertions.len(), 3);
        assert_eq!(assertions[0].subject, Subject::concrete("user", "alice"));
        assert_eq!(assertions[0].permission, "read");
    }

    #[test]
    fn userset_assertion_keeps_relation() {
        let fixture = Fixture::parse(
            r#"
[schema]
entities = []

[assertions]
"doc:1#read@group:eng#member" = true
"#,
        )
        .unwrap();

        let assertions = fixture.assertions().unwrap();

        assert_eq!(
            assertions[0].subject,
            Subject::userset(EntityRef::new("group", "eng"), "member")
        );
    }

    #[test]
    fn malformed_relationship_is_reported() {
        let fixture = Fixture::parse(
            r#"
relationships = ["doc:1"]

[schema]
entities = []
"#,
        )
        .unwrap();

        assert!(matches!(
            fixture.tuples(),
            Err(FixtureError::Relationship(_))
        ));
    }

    #[test]
    fn invalid_toml_is_a_parse_error() {
        assert!(matches!(
            Fixture::parse("relationships = ["),
            Err(FixtureError::Parse(_))
        ));
    }

    #[test]
    fn load_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fixture.toml");
        std::fs::write(&path, FIXTURE).unwrap();

        let fixture = Fixture::load(&path).unwrap();

        assert_eq!(fixture.relationships.len(), 3);
        assert!(matches!(
            Fixture::load(&dir.path().join("missing.toml")),
            Err(FixtureError::ReadFile(..))
        ));
    }

    #[tokio::test]
    async fn installed_fixture_satisfies_its_assertions() {
        let service = service();
        let tenant_id = TenantId::new(uuid::Uuid::new_v4());
        let fixture = Fixture::parse(FIXTURE).unwrap();

        fixture.install(&service, &tenant_id).await.unwrap();
        let outcomes = fixture
            .verify(&service, &tenant_id, &CancelToken::never())
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(Outcome::passed), "{outcomes:?}");
    }

    #[tokio::test]
    async fn failing_assertion_is_reported_not_raised() {
        let service = service();
        let tenant_id = TenantId::new(uuid::Uuid::new_v4());
        let mut fixture = Fixture::parse(FIXTURE).unwrap();
        fixture
            .assertions
            .insert("doc:1#read@user:mallory".to_string(), true);

        fixture.install(&service, &tenant_id).await.unwrap();
        let outcomes = fixture
            .verify(&service, &tenant_id, &CancelToken::never())
            .await
            .unwrap();

        let failed: Vec<_> = outcomes.iter().filter(|o| !o.passed()).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].assertion.subject, Subject::concrete("user", "mallory"));
    }
}
