use crate::{pattern, PatternError};
use serde::Deserialize;

/// A single authorization rule for some kind of cloud resource.
pub trait Rule {
    type Resource: ?Sized;

    /// Indicates whether this rule grants `resource` to identities in `namespace`.
    fn allows(&self, namespace: &str, resource: &Self::Resource) -> Result<bool, PatternError>;
}

/// An ordered list of rules.
///
/// Rules are evaluated in order and the first matching rule grants access. An empty list of rules
/// grants everything, whereas a non-empty list in which no rule matches denies.
#[derive(Clone, Debug, Deserialize)]
#[serde(transparent)]
pub struct Rules<R>(Vec<R>);

// === impl Rules ===

impl<R: Rule> Rules<R> {
    pub fn allow(&self, namespace: &str, resource: &R::Resource) -> Result<bool, PatternError> {
        for rule in self.0.iter() {
            if rule.allows(namespace, resource)? {
                return Ok(true);
            }
        }

        Ok(self.0.is_empty())
    }
}

impl<R> Rules<R> {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl<R> Default for Rules<R> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<R> From<Vec<R>> for Rules<R> {
    fn from(rules: Vec<R>) -> Self {
        Self(rules)
    }
}

impl<R> FromIterator<R> for Rules<R> {
    fn from_iter<I: IntoIterator<Item = R>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Returns true if `name` matches any of `patterns`. An empty list matches nothing.
pub(crate) fn matches_any(patterns: &[String], name: &str) -> Result<bool, PatternError> {
    for p in patterns.iter() {
        if pattern::matches(p, name)? {
            return Ok(true);
        }
    }
    Ok(false)
}
