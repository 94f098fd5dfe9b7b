use std::collections::HashSet;
use std::fmt;

use super::types::{EntityDefinition, Reference, RewriteRule, Schema};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaLimits {
    pub max_types: usize,
    pub max_relations_per_type: usize,
    pub max_permissions_per_type: usize,
}

impl Default for SchemaLimits {
    fn default() -> Self {
        Self {
            max_types: 50,
            max_relations_per_type: 30,
            max_permissions_per_type: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("too many types: {count} exceeds limit of {limit}")]
    TooManyTypes { count: usize, limit: usize },
    #[error("too many relations in type '{type_name}': {count} exceeds limit of {limit}")]
    TooManyRelations {
        type_name: String,
        count: usize,
        limit: usize,
    },
    #[error("too many permissions in type '{type_name}': {count} exceeds limit of {limit}")]
    TooManyPermissions {
        type_name: String,
        count: usize,
        limit: usize,
    },
    #[error("duplicate entity type '{0}'")]
    DuplicateType(String),
    #[error("duplicate name '{name}' in type '{type_name}'")]
    DuplicateName { type_name: String, name: String },
    #[error("permission '{type_name}#{permission}' references unknown name '{name}'")]
    UnknownReference {
        type_name: String,
        permission: String,
        name: String,
    },
    #[error("permission '{type_name}#{permission}' walks '{tupleset}', which is not a relation")]
    TuplesetNotRelation {
        type_name: String,
        permission: String,
        tupleset: String,
    },
    #[error(
        "permission '{type_name}#{permission}' walks to '{subject_type}', which declares no '{computed}'"
    )]
    UnknownComputed {
        type_name: String,
        permission: String,
        subject_type: String,
        computed: String,
    },
    #[error("relation '{type_name}#{relation}' allows unknown subject type '{subject_type}'")]
    UnknownSubjectType {
        type_name: String,
        relation: String,
        subject_type: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakingChange {
    TypeRemoved { type_name: String },
    RelationRemoved { type_name: String, relation: String },
    SubjectTypesChanged { type_name: String, relation: String },
}

impl fmt::Display for BreakingChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TypeRemoved { type_name } => write!(f, "type '{type_name}' removed"),
            Self::RelationRemoved {
                type_name,
                relation,
            } => write!(f, "relation '{type_name}#{relation}' removed"),
            Self::SubjectTypesChanged {
                type_name,
                relation,
            } => write!(f, "subject types of '{type_name}#{relation}' changed"),
        }
    }
}

pub fn validate_schema_limits(
    schema: &Schema,
    limits: &SchemaLimits,
) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if schema.entities().len() > limits.max_types {
        errors.push(ValidationError::TooManyTypes {
            count: schema.entities().len(),
            limit: limits.max_types,
        });
    }

    for entity in schema.entities() {
        if entity.relations().len() > limits.max_relations_per_type {
            errors.push(ValidationError::TooManyRelations {
                type_name: entity.name.clone(),
                count: entity.relations().len(),
                limit: limits.max_relations_per_type,
            });
        }
        if entity.permissions().len() > limits.max_permissions_per_type {
            errors.push(ValidationError::TooManyPermissions {
                type_name: entity.name.clone(),
                count: entity.permissions().len(),
                limit: limits.max_permissions_per_type,
            });
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Checks that every name a schema uses is declared: rule leaves, tuplesets
/// and the subject types relations allow.
pub fn validate_schema(schema: &Schema) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let mut seen_types = HashSet::new();

    for entity in schema.entities() {
        if !seen_types.insert(entity.name.as_str()) {
            errors.push(ValidationError::DuplicateType(entity.name.clone()));
            continue;
        }

        let mut seen_names = HashSet::new();
        let names = entity
            .relations()
            .iter()
            .map(|r| &r.name)
            .chain(entity.permissions().iter().map(|p| &p.name));
        for name in names {
            if !seen_names.insert(name.as_str()) {
                errors.push(ValidationError::DuplicateName {
                    type_name: entity.name.clone(),
                    name: name.clone(),
                });
            }
        }

        for relation in entity.relations() {
            for subject_type in &relation.subject_types {
                let known = match schema.entity(&subject_type.type_name) {
                    None => false,
                    Some(target) => subject_type
                        .relation
                        .as_deref()
                        .is_none_or(|r| target.reference(r).is_some()),
                };
                if !known {
                    errors.push(ValidationError::UnknownSubjectType {
                        type_name: entity.name.clone(),
                        relation: relation.name.clone(),
                        subject_type: subject_type.to_string(),
                    });
                }
            }
        }

        for permission in entity.permissions() {
            validate_rule(schema, entity, &permission.name, &permission.rule, &mut errors);
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_rule(
    schema: &Schema,
    entity: &EntityDefinition,
    permission: &str,
    rule: &RewriteRule,
    errors: &mut Vec<ValidationError>,
) {
    match rule {
        RewriteRule::Union(children) | RewriteRule::Intersection(children) => {
            for child in children {
                validate_rule(schema, entity, permission, child, errors);
            }
        }
        RewriteRule::ComputedUserset { relation, .. } => {
            if entity.reference(relation).is_none() {
                errors.push(ValidationError::UnknownReference {
                    type_name: entity.name.clone(),
                    permission: permission.to_string(),
                    name: relation.clone(),
                });
            }
        }
        RewriteRule::TupleToUserset {
            tupleset, computed, ..
        } => match entity.reference(tupleset) {
            None => errors.push(ValidationError::UnknownReference {
                type_name: entity.name.clone(),
                permission: permission.to_string(),
                name: tupleset.clone(),
            }),
            Some(Reference::Permission(_)) => {
                errors.push(ValidationError::TuplesetNotRelation {
                    type_name: entity.name.clone(),
                    permission: permission.to_string(),
                    tupleset: tupleset.clone(),
                })
            }
            Some(Reference::Relation(relation)) => {
                // Userset subject types keep their own relation when walked.
                let direct_types = relation
                    .subject_types
                    .iter()
                    .filter(|st| st.relation.is_none());
                for subject_type in direct_types {
                    let declares = schema
                        .entity(&subject_type.type_name)
                        .is_some_and(|target| target.reference(computed).is_some());
                    if !declares {
                        errors.push(ValidationError::UnknownComputed {
                            type_name: entity.name.clone(),
                            permission: permission.to_string(),
                            subject_type: subject_type.type_name.clone(),
                            computed: computed.clone(),
                        });
                    }
                }
            }
        },
    }
}

pub fn detect_breaking_changes(old: &Schema, new: &Schema) -> Vec<BreakingChange> {
    let mut changes = Vec::new();

    for old_type in old.entities() {
        match new.entity(&old_type.name) {
            None => {
                changes.push(BreakingChange::TypeRemoved {
                    type_name: old_type.name.clone(),
                });
            }
            Some(new_type) => {
                for old_rel in old_type.relations() {
                    match new_type.relation(&old_rel.name) {
                        None => {
                            changes.push(BreakingChange::RelationRemoved {
                                type_name: old_type.name.clone(),
                                relation: old_rel.name.clone(),
                            });
                        }
                        Some(new_rel) => {
                            if old_rel.subject_types != new_rel.subject_types {
                                changes.push(BreakingChange::SubjectTypesChanged {
                                    type_name: old_type.name.clone(),
                                    relation: old_rel.name.clone(),
                                });
                            }
                        }
                    }
                }
            }
        }
    }

    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::types::{PermissionDef, RelationDef, SubjectTypeRef};

    fn relation(name: &str, subject_types: &[&str]) -> RelationDef {
        RelationDef::new(
            name,
            subject_types.iter().map(|s| s.parse().unwrap()).collect(),
        )
    }

    fn permission(name: &str, rule: RewriteRule) -> PermissionDef {
        PermissionDef::new(name, rule)
    }

    fn leaf(text: &str) -> RewriteRule {
        text.parse().unwrap()
    }

    fn drive_schema() -> Schema {
        Schema::new(vec![
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
                    relation("collaborator", &["user", "organization#member"]),
                ],
                vec![permission(
                    "delete",
                    RewriteRule::Union(vec![leaf("collaborator"), leaf("parent.admin")]),
                )],
            ),
        ])
    }

    fn limits_with(max_types: usize, max_rels: usize, max_perms: usize) -> SchemaLimits {
        SchemaLimits {
            max_types,
            max_relations_per_type: max_rels,
            max_permissions_per_type: max_perms,
        }
    }

    #[test]
    fn well_formed_schema_passes() {
        assert_eq!(validate_schema(&drive_schema()), Ok(()));
    }

    #[test]
    fn unknown_leaf_reference_rejected() {
        let schema = Schema::new(vec![EntityDefinition::new(
            "doc",
            vec![relation("owner", &[])],
            vec![permission("read", leaf("viewer"))],
        )]);

        let errors = validate_schema(&schema).unwrap_err();

        assert_eq!(
            errors,
            vec![ValidationError::UnknownReference {
                type_name: "doc".to_string(),
                permission: "read".to_string(),
                name: "viewer".to_string(),
            }]
        );
    }

    #[test]
    fn tupleset_must_be_a_relation() {
        let schema = Schema::new(vec![EntityDefinition::new(
            "doc",
            vec![relation("owner", &[])],
            vec![
                permission("read", leaf("owner")),
                permission("edit", leaf("read.owner")),
            ],
        )]);

        let errors = validate_schema(&schema).unwrap_err();

        assert!(matches!(
            &errors[0],
            ValidationError::TuplesetNotRelation { tupleset, .. } if tupleset == "read"
        ));
    }

    #[test]
    fn computed_name_must_exist_on_walked_type() {
        let schema = Schema::new(vec![
            EntityDefinition::new("organization", vec![relation("admin", &[])], vec![]),
            EntityDefinition::new(
                "repository",
                vec![relation("parent", &["organization"])],
                vec![permission("delete", leaf("parent.owner"))],
            ),
        ]);

        let errors = validate_schema(&schema).unwrap_err();

        assert_eq!(
            errors,
            vec![ValidationError::UnknownComputed {
                type_name: "repository".to_string(),
                permission: "delete".to_string(),
                subject_type: "organization".to_string(),
                computed: "owner".to_string(),
            }]
        );
    }

    #[test]
    fn unknown_subject_type_rejected() {
        let schema = Schema::new(vec![EntityDefinition::new(
            "doc",
            vec![relation("owner", &["user"]), relation("editor", &["doc#viewer"])],
            vec![],
        )]);

        let errors = validate_schema(&schema).unwrap_err();

        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| matches!(e, ValidationError::UnknownSubjectType { .. })));
    }

    #[test]
    fn duplicate_names_rejected() {
        let schema = Schema::new(vec![
            EntityDefinition::new(
                "doc",
                vec![relation("owner", &[])],
                vec![permission("owner", leaf("owner"))],
            ),
            EntityDefinition::new("doc", vec![], vec![]),
        ]);

        let errors = validate_schema(&schema).unwrap_err();

        assert!(errors.contains(&ValidationError::DuplicateName {
            type_name: "doc".to_string(),
            name: "owner".to_string(),
        }));
        assert!(errors.contains(&ValidationError::DuplicateType("doc".to_string())));
    }

    #[test]
    fn schema_within_limits_passes() {
        assert!(validate_schema_limits(&drive_schema(), &SchemaLimits::default()).is_ok());
    }

    #[test]
    fn exceeding_max_types_rejected() {
        let limits = limits_with(2, 30, 30);

        let errors = validate_schema_limits(&drive_schema(), &limits).unwrap_err();

        assert_eq!(
            errors,
            vec![ValidationError::TooManyTypes { count: 3, limit: 2 }]
        );
    }

    #[test]
    fn exceeding_max_relations_and_permissions_rejected() {
        let limits = limits_with(50, 1, 0);

        let errors = validate_schema_limits(&drive_schema(), &limits).unwrap_err();

        assert!(errors.iter().any(|e| matches!(
            e,
            ValidationError::TooManyRelations { type_name, count: 2, limit: 1 } if type_name == "folder"
        )));
        assert!(errors.iter().any(|e| matches!(
            e,
            ValidationError::TooManyPermissions { type_name, count: 1, limit: 0 } if type_name == "folder"
        )));
    }

    #[test]
    fn adding_new_type_is_safe() {
        let old = Schema::new(vec![EntityDefinition::new("user", vec![], vec![])]);

        assert!(detect_breaking_changes(&old, &drive_schema()).is_empty());
    }

    #[test]
    fn removing_type_is_breaking() {
        let new = Schema::new(vec![EntityDefinition::new("user", vec![], vec![])]);

        let changes = detect_breaking_changes(&drive_schema(), &new);

        assert!(changes.contains(&BreakingChange::TypeRemoved {
            type_name: "folder".to_string()
        }));
    }

    #[test]
    fn removing_relation_is_breaking() {
        let old = Schema::new(vec![EntityDefinition::new(
            "doc",
            vec![relation("owner", &["user"]), relation("editor", &["user"])],
            vec![],
        )]);
        let new = Schema::new(vec![EntityDefinition::new(
            "doc",
            vec![relation("owner", &["user"])],
            vec![],
        )]);

        let changes = detect_breaking_changes(&old, &new);

        assert_eq!(
            changes,
            vec![BreakingChange::RelationRemoved {
                type_name: "doc".to_string(),
                relation: "editor".to_string(),
            }]
        );
    }

    #[test]
    fn changing_subject_types_is_breaking() {
        let old = Schema::new(vec![EntityDefinition::new(
            "doc",
            vec![relation("editor", &["user", "group#member"])],
            vec![],
        )]);
        let new = Schema::new(vec![EntityDefinition::new(
            "doc",
            vec![RelationDef::new("editor", vec![SubjectTypeRef::direct("user")])],
            vec![],
        )]);

        let changes = detect_breaking_changes(&old, &new);

        assert_eq!(
            changes,
            vec![BreakingChange::SubjectTypesChanged {
                type_name: "doc".to_string(),
                relation: "editor".to_string(),
            }]
        );
        assert_eq!(changes[0].to_string(), "subject types of 'doc#editor' changed");
    }

    #[test]
    fn changing_permission_rule_is_not_breaking() {
        let old = Schema::new(vec![EntityDefinition::new(
            "doc",
            vec![relation("owner", &["user"]), relation("editor", &["user"])],
            vec![permission("edit", leaf("owner"))],
        )]);
        let new = Schema::new(vec![EntityDefinition::new(
            "doc",
            vec![relation("owner", &["user"]), relation("editor", &["user"])],
            vec![permission(
                "edit",
                RewriteRule::Union(vec![leaf("owner"), leaf("editor")]),
            )],
        )]);

        assert!(detect_breaking_changes(&old, &new).is_empty());
    }
}
