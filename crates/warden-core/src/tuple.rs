use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Serializer};
use uuid::Uuid;

/// Stored subject relation meaning "whatever relation the traversal is
/// currently resolving".
pub const ELLIPSIS: &str = "...";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TenantId(Uuid);

impl TenantId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl From<Uuid> for TenantId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseTupleError {
    #[error("invalid entity '{0}': expected 'type:id'")]
    InvalidEntity(String),
    #[error("invalid subject '{0}': expected 'type:id' or 'type:id#relation'")]
    InvalidSubject(String),
    #[error("invalid tuple '{0}': expected 'type:id#relation@subject'")]
    InvalidTuple(String),
}

/// A concrete object subject to access control, e.g. `document:42`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityRef {
    pub entity_type: String,
    pub entity_id: String,
}

impl EntityRef {
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.entity_id)
    }
}

impl FromStr for EntityRef {
    type Err = ParseTupleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((entity_type, entity_id))
                if is_identifier(entity_type) && is_entity_id(entity_id) =>
            {
                Ok(Self::new(entity_type, entity_id))
            }
            _ => Err(ParseTupleError::InvalidEntity(s.to_string())),
        }
    }
}

impl Serialize for EntityRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Relation of a stored tuple subject, as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SubjectRelation {
    None,
    Ellipsis,
    Named(String),
}

impl SubjectRelation {
    fn parse(relation: Option<&str>) -> Self {
        match relation {
            None => Self::None,
            Some(ELLIPSIS) => Self::Ellipsis,
            Some(name) => Self::Named(name.to_string()),
        }
    }
}

/// The subject side of a stored tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TupleSubject {
    pub entity: EntityRef,
    pub relation: SubjectRelation,
}

impl TupleSubject {
    pub fn direct(subject_type: impl Into<String>, subject_id: impl Into<String>) -> Self {
        Self {
            entity: EntityRef::new(subject_type, subject_id),
            relation: SubjectRelation::None,
        }
    }

    pub fn userset(
        subject_type: impl Into<String>,
        subject_id: impl Into<String>,
        relation: impl Into<String>,
    ) -> Self {
        Self {
            entity: EntityRef::new(subject_type, subject_id),
            relation: SubjectRelation::Named(relation.into()),
        }
    }

    pub fn ellipsis(subject_type: impl Into<String>, subject_id: impl Into<String>) -> Self {
        Self {
            entity: EntityRef::new(subject_type, subject_id),
            relation: SubjectRelation::Ellipsis,
        }
    }

    /// Resolves the stored subject into a typed [`Subject`].
    ///
    /// `computed` is the second segment of the leaf being evaluated
    /// (`admin` in `parent.admin`). An ellipsis or missing stored relation
    /// takes the computed relation; a named stored relation is kept as-is.
    /// Without a computed relation an ellipsis subject stands for the
    /// subject entity itself.
    pub fn resolve(&self, computed: Option<&str>) -> Subject {
        match (&self.relation, computed) {
            (SubjectRelation::Named(relation), _) => {
                Subject::userset(self.entity.clone(), relation.clone())
            }
            (SubjectRelation::None | SubjectRelation::Ellipsis, Some(computed)) => {
                Subject::userset(self.entity.clone(), computed)
            }
            (SubjectRelation::None | SubjectRelation::Ellipsis, None) => {
                Subject::Concrete(self.entity.clone())
            }
        }
    }
}

impl fmt::Display for TupleSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.entity)?;
        match &self.relation {
            SubjectRelation::None => Ok(()),
            SubjectRelation::Ellipsis => write!(f, "#{ELLIPSIS}"),
            SubjectRelation::Named(rel) => write!(f, "#{rel}"),
        }
    }
}

impl FromStr for TupleSubject {
    type Err = ParseTupleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (entity, relation) = match s.split_once('#') {
            Some((entity, relation)) => (entity, Some(relation)),
            None => (s, None),
        };
        if relation.is_some_and(|r| r != ELLIPSIS && !is_identifier(r)) {
            return Err(ParseTupleError::InvalidSubject(s.to_string()));
        }
        let entity = entity
            .parse()
            .map_err(|_| ParseTupleError::InvalidSubject(s.to_string()))?;
        Ok(Self {
            entity,
            relation: SubjectRelation::parse(relation),
        })
    }
}

/// A typed subject: either a concrete principal or "everyone holding
/// `relation` on `entity`".
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Subject {
    Concrete(EntityRef),
    Userset { entity: EntityRef, relation: String },
}

impl Subject {
    pub fn concrete(subject_type: impl Into<String>, subject_id: impl Into<String>) -> Self {
        Self::Concrete(EntityRef::new(subject_type, subject_id))
    }

    pub fn userset(entity: EntityRef, relation: impl Into<String>) -> Self {
        Self::Userset {
            entity,
            relation: relation.into(),
        }
    }

    pub fn entity(&self) -> &EntityRef {
        match self {
            Self::Concrete(entity) | Self::Userset { entity, .. } => entity,
        }
    }

    pub fn is_userset(&self) -> bool {
        matches!(self, Self::Userset { .. })
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Concrete(entity) => write!(f, "{entity}"),
            Self::Userset { entity, relation } => write!(f, "{entity}#{relation}"),
        }
    }
}

impl FromStr for Subject {
    type Err = ParseTupleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let stored: TupleSubject = s.parse()?;
        match stored.relation {
            SubjectRelation::Ellipsis => Err(ParseTupleError::InvalidSubject(s.to_string())),
            _ => Ok(stored.resolve(None)),
        }
    }
}

impl Serialize for Subject {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// The stored fact "subject has relation on entity".
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tuple {
    pub entity: EntityRef,
    pub relation: String,
    pub subject: TupleSubject,
}

impl Tuple {
    pub fn new(entity: EntityRef, relation: impl Into<String>, subject: TupleSubject) -> Self {
        Self {
            entity,
            relation: relation.into(),
            subject,
        }
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}@{}", self.entity, self.relation, self.subject)
    }
}

impl FromStr for Tuple {
    type Err = ParseTupleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseTupleError::InvalidTuple(s.to_string());

        let (left, subject) = s.split_once('@').ok_or_else(invalid)?;
        let (entity, relation) = left.split_once('#').ok_or_else(invalid)?;
        if !is_identifier(relation) {
            return Err(invalid());
        }

        Ok(Self {
            entity: entity.parse()?,
            relation: relation.to_string(),
            subject: subject.parse()?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TupleFilter {
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub relation: Option<String>,
    pub subject_type: Option<String>,
    pub subject_id: Option<String>,
    pub subject_relation: Option<SubjectRelation>,
}

impl TupleFilter {
    pub fn for_relation(entity: &EntityRef, relation: &str) -> Self {
        Self {
            entity_type: Some(entity.entity_type.clone()),
            entity_id: Some(entity.entity_id.clone()),
            relation: Some(relation.to_string()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn matches(&self, tuple: &Tuple) -> bool {
        if let Some(ref et) = self.entity_type
            && et != &tuple.entity.entity_type
        {
            return false;
        }
        if let Some(ref ei) = self.entity_id
            && ei != &tuple.entity.entity_id
        {
            return false;
        }
        if let Some(ref r) = self.relation
            && r != &tuple.relation
        {
            return false;
        }
        if let Some(ref st) = self.subject_type
            && st != &tuple.subject.entity.entity_type
        {
            return false;
        }
        if let Some(ref si) = self.subject_id
            && si != &tuple.subject.entity.entity_id
        {
            return false;
        }
        if let Some(ref sr) = self.subject_relation
            && sr != &tuple.subject.relation
        {
            return false;
        }
        true
    }
}

/// Opaque, monotonically ordered marker of the tuples visible at a point in
/// time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnapshotToken(u64);

impl SnapshotToken {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SnapshotToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn is_entity_id(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '|' | '='))
}
