//! Authorization of AWS IAM roles.

use crate::{rules, ParseError, PatternError, Rule, RuleError, Rules};
use serde::Deserialize;
use std::{fmt, str::FromStr};

/// The annotation on a ServiceAccount naming the role it wants to assume.
pub const ROLE_ANNOTATION: &str = "vault.uw.systems/aws-role";

pub type AwsRules = Rules<AwsRule>;

/// Restricts the roles that ServiceAccounts in matching namespaces may assume.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwsRule {
    #[serde(default)]
    pub namespace_patterns: Vec<String>,

    #[serde(default)]
    pub role_name_patterns: Vec<String>,

    /// When empty, roles in any account are permitted.
    #[serde(default, rename = "accountIDs")]
    pub account_ids: Vec<String>,
}

/// The components of an Amazon Resource Name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Arn {
    pub partition: String,
    pub service: String,
    pub region: String,
    pub account_id: String,
    pub resource: String,
}

// === impl AwsRules ===

impl Rules<AwsRule> {
    /// Parses `role_arn` and evaluates it against the rules.
    pub fn allow_arn(&self, namespace: &str, role_arn: &str) -> Result<bool, RuleError> {
        let arn = role_arn.parse::<Arn>()?;
        Ok(self.allow(namespace, &arn)?)
    }
}

// === impl AwsRule ===

impl Rule for AwsRule {
    type Resource = Arn;

    fn allows(&self, namespace: &str, arn: &Arn) -> Result<bool, PatternError> {
        let account_allowed =
            self.account_ids.is_empty() || self.account_ids.iter().any(|id| *id == arn.account_id);

        let namespace_allowed = rules::matches_any(&self.namespace_patterns, namespace)?;

        let role_allowed = match arn.role_name() {
            Some(name) => rules::matches_any(&self.role_name_patterns, name)?,
            None => false,
        };

        Ok(account_allowed && namespace_allowed && role_allowed)
    }
}

// === impl Arn ===

impl Arn {
    /// Returns the role name if this ARN refers to an IAM role.
    pub fn role_name(&self) -> Option<&str> {
        self.resource.strip_prefix("role/")
    }
}

impl FromStr for Arn {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, ParseError> {
        let invalid = |reason| ParseError::Arn {
            arn: s.to_string(),
            reason,
        };

        let rest = s
            .strip_prefix("arn:")
            .ok_or_else(|| invalid("must start with 'arn:'"))?;
        let mut sections = rest.splitn(5, ':');
        let mut next = |name| sections.next().ok_or_else(|| invalid(name));
        let partition = next("missing partition")?.to_string();
        let service = next("missing service")?.to_string();
        let region = next("missing region")?.to_string();
        let account_id = next("missing account id")?.to_string();
        let resource = next("missing resource")?.to_string();

        Ok(Self {
            partition,
            service,
            region,
            account_id,
            resource,
        })
    }
}

impl fmt::Display for Arn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "arn:{}:{}:{}:{}:{}",
            self.partition, self.service, self.region, self.account_id, self.resource
        )
    }
}
