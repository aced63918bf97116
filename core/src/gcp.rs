//! Authorization of GCP roleset bindings.

use crate::{rules, ParseError, PatternError, Rule, Rules};
use serde::Deserialize;
use std::{collections::BTreeMap, fmt::Write};

/// The annotation on a ServiceAccount naming the project its roleset belongs to.
pub const PROJECT_ANNOTATION: &str = "vault.uw.systems/gcp-project";

/// The annotation on a ServiceAccount describing the roleset's bindings, as YAML.
pub const BINDINGS_ANNOTATION: &str = "vault.uw.systems/gcp-bindings";

pub type GcpRules = Rules<GcpRule>;

/// Allows ServiceAccounts in matching namespaces to create bindings in specific projects.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GcpRule {
    #[serde(default)]
    pub namespace_patterns: Vec<String>,

    #[serde(default)]
    pub projects: Vec<String>,
}

/// Roleset bindings: each resource name maps to a non-empty list of roles.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bindings(BTreeMap<String, Vec<String>>);

// === impl GcpRule ===

impl Rule for GcpRule {
    type Resource = str;

    fn allows(&self, namespace: &str, project: &str) -> Result<bool, PatternError> {
        let namespace_allowed = rules::matches_any(&self.namespace_patterns, namespace)?;
        Ok(namespace_allowed && self.projects.iter().any(|p| p == project))
    }
}

// === impl Bindings ===

impl Bindings {
    pub fn from_yaml(yaml: &str) -> Result<Self, ParseError> {
        let bindings = serde_yaml::from_str::<Option<BTreeMap<String, Vec<String>>>>(yaml)
            .map_err(|e| ParseError::Bindings(e.to_string()))?
            .unwrap_or_default();

        if bindings.is_empty() {
            return Err(ParseError::Bindings("bindings are empty".to_string()));
        }
        if let Some((resource, _)) = bindings.iter().find(|(_, roles)| roles.is_empty()) {
            return Err(ParseError::Bindings(format!(
                "roles can't be empty for resource {}",
                resource
            )));
        }

        Ok(Self(bindings))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.0.iter()
    }

    /// Renders the bindings as HCL resource blocks, as expected by Vault's GCP secrets engine.
    pub fn to_hcl(&self) -> String {
        let mut out = String::new();
        for (i, (resource, roles)) in self.0.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            let roles = roles
                .iter()
                .map(|r| quote(r))
                .collect::<Vec<_>>()
                .join(", ");
            // Writing to a String cannot fail.
            let _ = write!(
                out,
                "resource {} {{\n  roles = [{}]\n}}\n",
                quote(resource),
                roles
            );
        }
        out
    }
}

/// Quotes `s` as an HCL string literal. Template sequences are escaped so that they're taken
/// literally.
fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '$' | '%' if chars.peek() == Some(&'{') => {
                out.push(c);
                out.push(c);
            }
            c if c.is_control() => {
                let mut buf = [0u16; 2];
                for unit in c.encode_utf16(&mut buf) {
                    let _ = write!(out, "\\u{:04x}", unit);
                }
            }
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(ns: &[&str], projects: &[&str]) -> GcpRule {
        GcpRule {
            namespace_patterns: ns.iter().map(|s| s.to_string()).collect(),
            projects: projects.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn empty_rules_allow_everything() {
        assert!(GcpRules::default().allow("any", "any-project").unwrap());
    }

    #[test]
    fn namespace_and_project_must_match() {
        let rules = GcpRules::from(vec![rule(&["team-*"], &["project-a", "project-b"])]);
        assert!(rules.allow("team-a", "project-a").unwrap());
        assert!(rules.allow("team-b", "project-b").unwrap());
        assert!(!rules.allow("team-a", "project-c").unwrap());
        assert!(!rules.allow("other", "project-a").unwrap());
        // Projects are compared literally.
        assert!(!GcpRules::from(vec![rule(&["*"], &["project-*"])])
            .allow("team-a", "project-a")
            .unwrap());
    }

    #[test]
    fn empty_dimensions_never_match() {
        let rules = GcpRules::from(vec![rule(&[], &["project-a"]), rule(&["*"], &[])]);
        assert!(!rules.allow("team-a", "project-a").unwrap());
        assert!(!rules.allow("", "").unwrap());
    }

    #[test]
    fn first_match_wins() {
        let rules = GcpRules::from(vec![rule(&["team-a"], &["p"]), rule(&["[a-"], &["p"])]);
        assert!(rules.allow("team-a", "p").unwrap());
        assert!(rules.allow("team-b", "p").is_err());
    }

    #[test]
    fn parse_bindings() {
        let bindings = Bindings::from_yaml(
            r#"
//cloudresourcemanager.googleapis.com/projects/my-project:
  - roles/viewer
//storage.googleapis.com/buckets/my-bucket:
  - roles/storage.objectAdmin
  - roles/storage.legacyBucketReader
"#,
        )
        .unwrap();
        assert_eq!(bindings.iter().count(), 2);
    }

    #[test]
    fn reject_invalid_bindings() {
        for yaml in &[
            "",
            "{}",
            "foo",
            "- roles/viewer",
            "resource: roles/viewer",
            "resource: []",
            "resource:\n  foo: bar",
        ] {
            assert!(
                Bindings::from_yaml(yaml).is_err(),
                "{:?} must be rejected",
                yaml
            );
        }
    }

    #[test]
    fn render_hcl() {
        let bindings = Bindings::from_yaml(
            r#"
b-resource: [roles/a]
a-resource: [roles/b, roles/c]
"#,
        )
        .unwrap();
        assert_eq!(
            bindings.to_hcl(),
            "resource \"a-resource\" {\n  roles = [\"roles/b\", \"roles/c\"]\n}\n\nresource \"b-resource\" {\n  roles = [\"roles/a\"]\n}\n"
        );
    }

    #[test]
    fn hcl_escapes_strings() {
        assert_eq!(quote("roles/viewer"), r#""roles/viewer""#);
        assert_eq!(quote(r#"a"b\c"#), r#""a\"b\\c""#);
        assert_eq!(quote("a\nb\tc"), r#""a\nb\tc""#);
        assert_eq!(quote("\u{1}x\u{7f}"), r#""\u0001x\u007f""#);
        assert_eq!(quote("${var} %{if} $5 %d"), r#""$${var} %%{if} $5 %d""#);

        let bindings = Bindings::from_yaml("\"res\\\"x\": [\"roles/a\\u0002\"]").unwrap();
        assert_eq!(
            bindings.to_hcl(),
            "resource \"res\\\"x\" {\n  roles = [\"roles/a\\u0002\"]\n}\n"
        );
    }
}
