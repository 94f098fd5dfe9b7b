use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SchemaVersion(u64);

impl SchemaVersion {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An immutable set of entity definitions, indexed by entity type.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Schema {
    entities: Vec<Arc<EntityDefinition>>,
    index: HashMap<String, usize>,
}

impl Schema {
    /// Builds the schema index. When two definitions share a name the first
    /// one is indexed; `validate_schema` reports the duplicate.
    pub fn new(entities: Vec<EntityDefinition>) -> Self {
        let entities: Vec<_> = entities.into_iter().map(Arc::new).collect();
        let mut index = HashMap::with_capacity(entities.len());
        for (position, entity) in entities.iter().enumerate() {
            index.entry(entity.name.clone()).or_insert(position);
        }
        Self { entities, index }
    }

    pub fn entity(&self, name: &str) -> Option<&Arc<EntityDefinition>> {
        self.index.get(name).map(|&position| &self.entities[position])
    }

    pub fn entities(&self) -> &[Arc<EntityDefinition>] {
        &self.entities
    }
}

impl<'de> Deserialize<'de> for Schema {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Repr {
            #[serde(default)]
            entities: Vec<EntityDefinition>,
        }

        Repr::deserialize(deserializer).map(|repr| Self::new(repr.entities))
    }
}

/// A name declared on an entity type, resolved through the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reference<'a> {
    Relation(&'a RelationDef),
    Permission(&'a PermissionDef),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Relation(usize),
    Permission(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "EntityRepr")]
pub struct EntityDefinition {
    pub name: String,
    relations: Vec<RelationDef>,
    permissions: Vec<PermissionDef>,
    index: HashMap<String, Slot>,
}

#[derive(Deserialize)]
struct EntityRepr {
    name: String,
    #[serde(default)]
    relations: Vec<RelationDef>,
    #[serde(default)]
    permissions: Vec<PermissionDef>,
}

impl From<EntityRepr> for EntityDefinition {
    fn from(repr: EntityRepr) -> Self {
        Self::new(repr.name, repr.relations, repr.permissions)
    }
}

impl EntityDefinition {
    pub fn new(
        name: impl Into<String>,
        relations: Vec<RelationDef>,
        permissions: Vec<PermissionDef>,
    ) -> Self {
        let mut index = HashMap::with_capacity(relations.len() + permissions.len());
        for (position, relation) in relations.iter().enumerate() {
            index
                .entry(relation.name.clone())
                .or_insert(Slot::Relation(position));
        }
        for (position, permission) in permissions.iter().enumerate() {
            index
                .entry(permission.name.clone())
                .or_insert(Slot::Permission(position));
        }
        Self {
            name: name.into(),
            relations,
            permissions,
            index,
        }
    }

    /// Relations in declaration order.
    pub fn relations(&self) -> &[RelationDef] {
        &self.relations
    }

    /// Permissions in declaration order.
    pub fn permissions(&self) -> &[PermissionDef] {
        &self.permissions
    }

    pub fn reference(&self, name: &str) -> Option<Reference<'_>> {
        self.index.get(name).map(|slot| match *slot {
            Slot::Relation(position) => Reference::Relation(&self.relations[position]),
            Slot::Permission(position) => Reference::Permission(&self.permissions[position]),
        })
    }

    pub fn relation(&self, name: &str) -> Option<&RelationDef> {
        match self.reference(name)? {
            Reference::Relation(relation) => Some(relation),
            Reference::Permission(_) => None,
        }
    }

    pub fn permission(&self, name: &str) -> Option<&PermissionDef> {
        match self.reference(name)? {
            Reference::Permission(permission) => Some(permission),
            Reference::Relation(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RelationDef {
    pub name: String,
    #[serde(default)]
    pub subject_types: Vec<SubjectTypeRef>,
}

impl RelationDef {
    pub fn new(name: impl Into<String>, subject_types: Vec<SubjectTypeRef>) -> Self {
        Self {
            name: name.into(),
            subject_types,
        }
    }
}

/// An allowed subject type of a relation: `user` or `group#member`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub struct SubjectTypeRef {
    pub type_name: String,
    pub relation: Option<String>,
}

impl SubjectTypeRef {
    pub fn direct(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            relation: None,
        }
    }

    pub fn userset(type_name: impl Into<String>, relation: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            relation: Some(relation.into()),
        }
    }
}

impl fmt::Display for SubjectTypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.relation {
            Some(relation) => write!(f, "{}#{relation}", self.type_name),
            None => write!(f, "{}", self.type_name),
        }
    }
}

impl FromStr for SubjectTypeRef {
    type Err = InvalidRuleText;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (type_name, relation) = match s.split_once('#') {
            Some((type_name, relation)) => (type_name, Some(relation)),
            None => (s, None),
        };
        if !is_identifier(type_name) || relation.is_some_and(|r| !is_identifier(r)) {
            return Err(InvalidRuleText(s.to_string()));
        }
        Ok(Self {
            type_name: type_name.to_string(),
            relation: relation.map(str::to_string),
        })
    }
}

impl TryFrom<String> for SubjectTypeRef {
    type Error = InvalidRuleText;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PermissionDef {
    pub name: String,
    pub rule: RewriteRule,
}

impl PermissionDef {
    pub fn new(name: impl Into<String>, rule: RewriteRule) -> Self {
        Self {
            name: name.into(),
            rule,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid rule text '{0}'")]
pub struct InvalidRuleText(pub String);

/// Compiled permission expression.
///
/// Exclusion lives on leaves only: a leaf with `exclusion` set contributes
/// the negation of its result to the enclosing node.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RuleRepr")]
pub enum RewriteRule {
    Union(Vec<RewriteRule>),
    Intersection(Vec<RewriteRule>),
    ComputedUserset {
        relation: String,
        exclusion: bool,
    },
    TupleToUserset {
        tupleset: String,
        computed: String,
        exclusion: bool,
    },
}

impl RewriteRule {
    pub fn computed(relation: impl Into<String>) -> Self {
        Self::ComputedUserset {
            relation: relation.into(),
            exclusion: false,
        }
    }

    pub fn tuple_to_userset(tupleset: impl Into<String>, computed: impl Into<String>) -> Self {
        Self::TupleToUserset {
            tupleset: tupleset.into(),
            computed: computed.into(),
            exclusion: false,
        }
    }

    /// Marks a leaf as excluded. Union and intersection nodes are returned
    /// unchanged.
    pub fn excluded(self) -> Self {
        match self {
            Self::ComputedUserset { relation, .. } => Self::ComputedUserset {
                relation,
                exclusion: true,
            },
            Self::TupleToUserset {
                tupleset, computed, ..
            } => Self::TupleToUserset {
                tupleset,
                computed,
                exclusion: true,
            },
            node => node,
        }
    }
}

impl fmt::Display for RewriteRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |f: &mut fmt::Formatter<'_>, children: &[RewriteRule], op: &str| {
            write!(f, "(")?;
            for (i, child) in children.iter().enumerate() {
                if i > 0 {
                    write!(f, " {op} ")?;
                }
                write!(f, "{child}")?;
            }
            write!(f, ")")
        };
        match self {
            Self::Union(children) => join(f, children, "or"),
            Self::Intersection(children) => join(f, children, "and"),
            Self::ComputedUserset {
                relation,
                exclusion,
            } => {
                if *exclusion {
                    write!(f, "not ")?;
                }
                write!(f, "{relation}")
            }
            Self::TupleToUserset {
                tupleset,
                computed,
                exclusion,
            } => {
                if *exclusion {
                    write!(f, "not ")?;
                }
                write!(f, "{tupleset}.{computed}")
            }
        }
    }
}

/// Parses a single leaf: `owner`, `parent.admin`, `not banned`.
impl FromStr for RewriteRule {
    type Err = InvalidRuleText;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidRuleText(s.to_string());

        let text = s.trim();
        let (exclusion, text) = match text.strip_prefix("not ") {
            Some(rest) => (true, rest.trim_start()),
            None => (false, text),
        };

        let leaf = match text.split_once('.') {
            Some((tupleset, computed)) => {
                if !is_identifier(tupleset) || !is_identifier(computed) {
                    return Err(invalid());
                }
                Self::tuple_to_userset(tupleset, computed)
            }
            None => {
                if !is_identifier(text) {
                    return Err(invalid());
                }
                Self::computed(text)
            }
        };

        Ok(if exclusion { leaf.excluded() } else { leaf })
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RuleRepr {
    Leaf(String),
    Union { union: Vec<RewriteRule> },
    Intersection { intersection: Vec<RewriteRule> },
}

impl TryFrom<RuleRepr> for RewriteRule {
    type Error = InvalidRuleText;

    fn try_from(repr: RuleRepr) -> Result<Self, Self::Error> {
        match repr {
            RuleRepr::Leaf(text) => text.parse(),
            RuleRepr::Union { union } => Ok(Self::Union(union)),
            RuleRepr::Intersection { intersection } => Ok(Self::Intersection(intersection)),
        }
    }
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}
