//! Required-scope enforcement.

use crate::error::FilterError;
use std::collections::BTreeSet;

/// Scopes an operation requires, in declaration order.
///
/// Empty and whitespace-only entries are dropped, so `[""]` (the historical
/// way to say "any valid token") is the same as no requirement at all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequiredScopes(Vec<String>);

impl RequiredScopes {
    pub fn new<I, S>(scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut kept: Vec<String> = Vec::new();
        for scope in scopes {
            let scope = scope.into();
            let trimmed = scope.trim();
            if trimmed.is_empty() || kept.iter().any(|s| s == trimmed) {
                continue;
            }
            kept.push(trimmed.to_string());
        }
        RequiredScopes(kept)
    }

    /// Authentication only, no scope requirement.
    pub fn none() -> Self {
        RequiredScopes(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    /// Check that every required scope was granted.
    ///
    /// Comparison is exact and case-sensitive. On failure the error lists
    /// all missing scopes, in the order they were declared.
    pub fn enforce(&self, granted: &BTreeSet<String>) -> Result<(), FilterError> {
        let missing: Vec<String> = self
            .0
            .iter()
            .filter(|s| !granted.contains(s.as_str()))
            .cloned()
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(FilterError::InsufficientScope { missing })
        }
    }
}

impl<S: Into<String>> FromIterator<S> for RequiredScopes {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        RequiredScopes::new(iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn granted(scopes: &[&str]) -> BTreeSet<String> {
        scopes.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_empty_string_means_authenticated_only() {
        let required = RequiredScopes::new([""]);
        assert!(required.is_empty());
        assert!(required.enforce(&granted(&[])).is_ok());
        assert_eq!(RequiredScopes::new(["", "  "]), RequiredScopes::none());
    }

    #[test]
    fn test_subset_passes() {
        let required = RequiredScopes::new(["a", "b"]);
        assert!(required.enforce(&granted(&["a", "b", "c"])).is_ok());
    }

    #[test]
    fn test_missing_scopes_in_declaration_order() {
        let required = RequiredScopes::new(["c", "a", "b"]);
        let err = required.enforce(&granted(&["a"])).unwrap_err();
        assert_eq!(
            err,
            FilterError::InsufficientScope {
                missing: vec!["c".to_string(), "b".to_string()]
            }
        );
    }

    #[test]
    fn test_case_sensitive() {
        let required = RequiredScopes::new(["Read"]);
        assert!(required.enforce(&granted(&["read"])).is_err());
    }

    #[test]
    fn test_duplicates_collapse() {
        let required: RequiredScopes = ["a", "a", "b"].into_iter().collect();
        assert_eq!(required.as_slice(), &["a".to_string(), "b".to_string()]);
    }
}
