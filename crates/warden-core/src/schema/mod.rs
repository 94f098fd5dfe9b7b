pub mod types;
pub mod validation;

pub use types::{
    EntityDefinition, InvalidRuleText, PermissionDef, Reference, RelationDef, RewriteRule, Schema,
    SchemaVersion, SubjectTypeRef,
};
pub use validation::{
    BreakingChange, SchemaLimits, ValidationError, detect_breaking_changes, validate_schema,
    validate_schema_limits,
};
