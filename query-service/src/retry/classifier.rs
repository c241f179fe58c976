//! Recognises "relation does not exist" failures.

use regex::Regex;

use crate::session::QueryError;

/// SQLSTATE `undefined_table`.
pub const UNDEFINED_TABLE: &str = "42P01";

/// Target of a relation-not-found failure.
///
/// Both fields are `None` when the failure class is known but the message
/// could not be parsed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelationFailure {
    /// Schema named by the query; `None` for unqualified references.
    pub schema: Option<String>,
    /// Relation name.
    pub relation: Option<String>,
}

impl RelationFailure {
    pub fn qualified(schema: impl Into<String>, relation: impl Into<String>) -> Self {
        Self {
            schema: Some(schema.into()),
            relation: Some(relation.into()),
        }
    }

    pub fn unqualified(relation: impl Into<String>) -> Self {
        Self {
            schema: None,
            relation: Some(relation.into()),
        }
    }
}

/// Decides whether a query error means "relation not found".
pub trait ErrorClassifier: Send + Sync {
    /// Returns `None` for every other kind of failure.
    fn classify(&self, err: &QueryError) -> Option<RelationFailure>;
}

/// Classifier for PostgreSQL error responses.
#[derive(Debug, Clone)]
pub struct PostgresClassifier {
    qualified: Regex,
    bare: Regex,
}

impl PostgresClassifier {
    pub fn new() -> Self {
        Self {
            qualified: Regex::new(r#"^relation "(.*)\.(.*)" does not exist$"#)
                .expect("static regex"),
            bare: Regex::new(r#"^relation "(.*)" does not exist$"#).expect("static regex"),
        }
    }
}

impl Default for PostgresClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorClassifier for PostgresClassifier {
    fn classify(&self, err: &QueryError) -> Option<RelationFailure> {
        let QueryError::Database { code, message } = err else {
            return None;
        };
        if code.as_deref() != Some(UNDEFINED_TABLE) {
            return None;
        }

        if let Some(caps) = self.qualified.captures(message) {
            return Some(RelationFailure::qualified(&caps[1], &caps[2]));
        }
        if let Some(caps) = self.bare.captures(message) {
            return Some(RelationFailure::unqualified(&caps[1]));
        }
        Some(RelationFailure::default())
    }
}
