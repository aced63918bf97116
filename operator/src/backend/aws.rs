use super::{Annotations, Backend, PolicyTemplate};
use anyhow::{Context, Result};
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tracing::{debug, warn};
use vkcc_core::aws::{AwsRules, ROLE_ANNOTATION};
use vkcc_vault::Vault;

const POLICY: &str = include_str!("../../templates/aws-policy.hcl");

/// Grants ServiceAccounts an IAM role, by ARN, through Vault's AWS secrets engine.
pub struct AwsBackend {
    vault: Arc<dyn Vault>,
    policy: PolicyTemplate,
    default_ttl: Duration,
    rules: AwsRules,
}

// === impl AwsBackend ===

impl AwsBackend {
    pub fn new(
        vault: Arc<dyn Vault>,
        path: impl Into<String>,
        default_ttl: Duration,
        rules: AwsRules,
    ) -> Result<Self> {
        let path = path.into();
        anyhow::ensure!(!path.is_empty(), "path can't be empty");
        Ok(Self {
            vault,
            policy: PolicyTemplate::new(POLICY, path)?,
            default_ttl,
            rules,
        })
    }

    fn role_path(&self, key: &str) -> String {
        format!("{}/roles/{}", self.policy.path(), key)
    }
}

#[async_trait::async_trait]
impl Backend for AwsBackend {
    fn name(&self) -> &'static str {
        "aws"
    }

    fn admit(&self, namespace: &str, name: &str, annotations: &Annotations) -> bool {
        let role_arn = match annotations.get(ROLE_ANNOTATION) {
            Some(arn) if !arn.is_empty() => arn,
            _ => return false,
        };
        match self.rules.allow_arn(namespace, role_arn) {
            Ok(allowed) => {
                debug!(%namespace, %name, %role_arn, allowed, "Evaluated rules");
                allowed
            }
            Err(error) => {
                warn!(%namespace, %name, %role_arn, %error, "Failed to match role ARN against rules");
                false
            }
        }
    }

    async fn write_role(&self, key: &str, annotations: &Annotations) -> Result<()> {
        let role_arn = annotations
            .get(ROLE_ANNOTATION)
            .with_context(|| format!("missing annotation {}", ROLE_ANNOTATION))?;
        let data = json!({
            "default_sts_ttl": self.default_ttl.as_secs(),
            "role_arns": [role_arn],
            "credential_type": "assumed_role",
        });
        self.vault.write(&self.role_path(key), data).await?;
        Ok(())
    }

    async fn delete_role(&self, key: &str) -> Result<()> {
        self.vault.delete(&self.role_path(key)).await?;
        Ok(())
    }

    async fn list_roles(&self) -> Result<Vec<String>> {
        let roles = self
            .vault
            .list(&format!("{}/roles", self.policy.path()))
            .await?;
        Ok(roles)
    }

    fn render_policy(&self, key: &str) -> Result<String> {
        self.policy.render(key)
    }
}
