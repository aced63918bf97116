//! Vault secrets engines that issue cloud credentials.

mod aws;
mod gcp;

pub use self::{aws::AwsBackend, gcp::GcpBackend};
use anyhow::Result;
use minijinja::{context, Environment};
use std::collections::BTreeMap;

/// A ServiceAccount's annotations.
pub type Annotations = BTreeMap<String, String>;

/// Manages roles in one of Vault's secrets engines on behalf of ServiceAccounts.
#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    /// Names the backend in managed keys and logs.
    fn name(&self) -> &'static str;

    /// Indicates whether a ServiceAccount should be granted a role.
    ///
    /// Invalid annotations and rule evaluation errors are logged and deny the ServiceAccount.
    fn admit(&self, namespace: &str, name: &str, annotations: &Annotations) -> bool;

    /// Creates or updates the role for `key` from an admitted ServiceAccount's annotations.
    async fn write_role(&self, key: &str, annotations: &Annotations) -> Result<()>;

    /// Deletes the role for `key`, if it exists.
    async fn delete_role(&self, key: &str) -> Result<()>;

    async fn list_roles(&self) -> Result<Vec<String>>;

    /// Renders a policy that grants access to credentials for the role `key`, and nothing else.
    fn render_policy(&self, key: &str) -> Result<String>;
}

/// A policy template rendered with the engine's mount path and a role name.
#[derive(Debug)]
struct PolicyTemplate {
    env: Environment<'static>,
    path: String,
}

// === impl PolicyTemplate ===

impl PolicyTemplate {
    const NAME: &'static str = "policy";

    fn new(source: &'static str, path: String) -> Result<Self> {
        let mut env = Environment::new();
        env.add_template(Self::NAME, source)?;
        Ok(Self { env, path })
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn render(&self, name: &str) -> Result<String> {
        let policy = self
            .env
            .get_template(Self::NAME)?
            .render(context! { path => &self.path, name => name })?;
        Ok(policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_template() {
        let tmpl = PolicyTemplate::new(
            r#"path "{{ path }}/x/{{ name }}" {}"#,
            "mount".to_string(),
        )
        .unwrap();
        assert_eq!(tmpl.render("key").unwrap(), r#"path "mount/x/key" {}"#);
    }

    #[test]
    fn invalid_template() {
        assert!(PolicyTemplate::new("{{ path ", "mount".to_string()).is_err());
    }
}
