use super::{Annotations, Backend, PolicyTemplate};
use anyhow::{Context, Result};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};
use vkcc_core::gcp::{Bindings, GcpRules, BINDINGS_ANNOTATION, PROJECT_ANNOTATION};
use vkcc_vault::Vault;

const POLICY: &str = include_str!("../../templates/gcp-policy.hcl");

const TOKEN_SCOPES: &[&str] = &["https://www.googleapis.com/auth/cloud-platform"];

/// Grants ServiceAccounts a roleset, bound to resources in a project, through Vault's GCP secrets
/// engine.
pub struct GcpBackend {
    vault: Arc<dyn Vault>,
    policy: PolicyTemplate,
    rules: GcpRules,
}

// === impl GcpBackend ===

impl GcpBackend {
    pub fn new(vault: Arc<dyn Vault>, path: impl Into<String>, rules: GcpRules) -> Result<Self> {
        let path = path.into();
        anyhow::ensure!(!path.is_empty(), "path can't be empty");
        Ok(Self {
            vault,
            policy: PolicyTemplate::new(POLICY, path)?,
            rules,
        })
    }

    fn roleset_path(&self, key: &str) -> String {
        format!("{}/roleset/{}", self.policy.path(), key)
    }
}

#[async_trait::async_trait]
impl Backend for GcpBackend {
    fn name(&self) -> &'static str {
        "gcp"
    }

    fn admit(&self, namespace: &str, name: &str, annotations: &Annotations) -> bool {
        let project = match annotations.get(PROJECT_ANNOTATION) {
            Some(p) if !p.is_empty() => p,
            _ => return false,
        };

        let bindings = annotations
            .get(BINDINGS_ANNOTATION)
            .map(String::as_str)
            .unwrap_or_default();
        if let Err(error) = Bindings::from_yaml(bindings) {
            warn!(%namespace, %name, %error, "Not admitting ServiceAccount with invalid bindings");
            return false;
        }

        match self.rules.allow(namespace, project) {
            Ok(allowed) => {
                debug!(%namespace, %name, %project, allowed, "Evaluated rules");
                allowed
            }
            Err(error) => {
                warn!(%namespace, %name, %project, %error, "Failed to match project against rules");
                false
            }
        }
    }

    async fn write_role(&self, key: &str, annotations: &Annotations) -> Result<()> {
        let project = annotations
            .get(PROJECT_ANNOTATION)
            .with_context(|| format!("missing annotation {}", PROJECT_ANNOTATION))?;
        let bindings = annotations
            .get(BINDINGS_ANNOTATION)
            .with_context(|| format!("missing annotation {}", BINDINGS_ANNOTATION))?;
        let bindings = Bindings::from_yaml(bindings)?;

        let data = json!({
            "secret_type": "access_token",
            "project": project,
            "bindings": bindings.to_hcl(),
            "token_scopes": TOKEN_SCOPES,
        });
        self.vault.write(&self.roleset_path(key), data).await?;
        Ok(())
    }

    async fn delete_role(&self, key: &str) -> Result<()> {
        self.vault.delete(&self.roleset_path(key)).await?;
        Ok(())
    }

    async fn list_roles(&self) -> Result<Vec<String>> {
        let rolesets = self
            .vault
            .list(&format!("{}/roleset", self.policy.path()))
            .await?;
        Ok(rolesets)
    }

    fn render_policy(&self, key: &str) -> Result<String> {
        self.policy.render(key)
    }
}
