use std::collections::HashSet;
use std::sync::Arc;

use crate::schema::types::{RewriteRule, SchemaVersion};

use super::{CheckError, SchemaReader};

/// Evaluates `rule` against a fixed set of relation names the subject is
/// known to hold.
///
/// Computed-userset leaves test their relation name, tuple-to-userset leaves
/// the dotted `tupleset.computed` name. Empty unions and intersections are
/// false.
pub fn evaluate(rule: &RewriteRule, known: &HashSet<&str>) -> bool {
    match rule {
        RewriteRule::Union(children) => children.iter().any(|child| evaluate(child, known)),
        RewriteRule::Intersection(children) => {
            !children.is_empty() && children.iter().all(|child| evaluate(child, known))
        }
        RewriteRule::ComputedUserset {
            relation,
            exclusion,
        } => known.contains(relation.as_str()) != *exclusion,
        RewriteRule::TupleToUserset {
            tupleset,
            computed,
            exclusion,
        } => known.contains(format!("{tupleset}.{computed}").as_str()) != *exclusion,
    }
}

/// Answers "which permissions of this entity type follow from these
/// relations" without touching stored tuples.
pub struct LookupSchemaEngine<S: SchemaReader> {
    schema: Arc<S>,
}

impl<S: SchemaReader> LookupSchemaEngine<S> {
    pub fn new(schema: Arc<S>) -> Self {
        Self { schema }
    }

    /// Permission names of `entity_type` satisfied by `known_relations`, in
    /// declaration order.
    pub async fn lookup(
        &self,
        entity_type: &str,
        known_relations: &[String],
        version: Option<SchemaVersion>,
    ) -> Result<Vec<String>, CheckError> {
        let (definition, _) = self
            .schema
            .read_entity_definition(entity_type, version)
            .await?;
        let known: HashSet<&str> = known_relations.iter().map(String::as_str).collect();

        Ok(definition
            .permissions()
            .iter()
            .filter(|permission| evaluate(&permission.rule, &known))
            .map(|permission| permission.name.clone())
            .collect())
    }
}
