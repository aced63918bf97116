use crate::backend::{Annotations, Backend};
use anyhow::{Context, Result};
use serde_json::json;
use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};
use tracing::{debug, info, instrument};
use vkcc_core::{IdentityRef, KeyCodec};
use vkcc_vault::Vault;

/// The TTL, in seconds, of sessions issued by managed login roles.
const LOGIN_TTL_SECS: u64 = 900;

/// Keeps the policy, login role and backend role of each admitted ServiceAccount in Vault.
pub struct Reconciler {
    backend: Arc<dyn Backend>,
    vault: Arc<dyn Vault>,
    codec: KeyCodec,
    kube_auth_backend: String,
}

/// Indicates whether a change from `old` to `new` is relevant to `backend`.
///
/// A change is relevant if either state is admitted, so that a ServiceAccount that stops being
/// admitted has its objects removed. A missing state (on creation or deletion) is never admitted.
pub fn admits(
    backend: &dyn Backend,
    id: &IdentityRef,
    old: Option<&Annotations>,
    new: Option<&Annotations>,
) -> bool {
    let admit = |a: Option<&Annotations>| {
        a.map_or(false, |a| backend.admit(&id.namespace, &id.name, a))
    };
    admit(old) || admit(new)
}

// === impl Reconciler ===

impl Reconciler {
    pub fn new(
        backend: Arc<dyn Backend>,
        vault: Arc<dyn Vault>,
        prefix: &str,
        kube_auth_backend: impl Into<String>,
    ) -> Result<Self> {
        let codec = KeyCodec::new(prefix, backend.name())?;
        Ok(Self {
            backend,
            vault,
            codec,
            kube_auth_backend: kube_auth_backend.into(),
        })
    }

    pub fn backend(&self) -> &dyn Backend {
        &*self.backend
    }

    pub fn key(&self, id: &IdentityRef) -> String {
        self.codec.encode(&id.namespace, &id.name)
    }

    /// Converges Vault with the current state of a ServiceAccount, where `None` indicates that
    /// the ServiceAccount no longer exists.
    #[instrument(
        skip(self, id, annotations),
        fields(backend = %self.backend.name(), ns = %id.namespace, name = %id.name)
    )]
    pub async fn reconcile(&self, id: &IdentityRef, annotations: Option<&Annotations>) -> Result<()> {
        self.vault.reload_token();
        match annotations {
            Some(a) if self.backend.admit(&id.namespace, &id.name, a) => self.write(id, a).await,
            _ => self.remove(id).await,
        }
    }

    /// Removes every object owned by this backend that doesn't belong to a live, admitted
    /// ServiceAccount. Objects that aren't owned by this backend are ignored.
    ///
    /// Nothing is removed unless all objects can be listed. Returns the number of ServiceAccounts
    /// whose objects were removed.
    #[instrument(skip(self, live), fields(backend = %self.backend.name()))]
    pub async fn collect_garbage(&self, live: &HashMap<IdentityRef, Annotations>) -> Result<usize> {
        self.vault.reload_token();

        let roles = self
            .backend
            .list_roles()
            .await
            .context("listing backend roles")?;
        let login_roles = self
            .vault
            .list(&self.login_roles_path())
            .await
            .context("listing login roles")?;
        let policies = self
            .vault
            .list("sys/policy")
            .await
            .context("listing policies")?;

        let orphans = roles
            .iter()
            .chain(login_roles.iter())
            .chain(policies.iter())
            .filter_map(|key| self.codec.decode(key))
            .filter(|id| match live.get(id) {
                Some(a) => !self.backend.admit(&id.namespace, &id.name, a),
                None => true,
            })
            .collect::<BTreeSet<_>>();

        for id in &orphans {
            debug!(ns = %id.namespace, name = %id.name, "Collecting orphan");
            self.remove(id).await?;
        }
        info!(removed = orphans.len(), "Collected garbage");
        Ok(orphans.len())
    }

    async fn write(&self, id: &IdentityRef, annotations: &Annotations) -> Result<()> {
        let key = self.key(id);

        let policy = self
            .backend
            .render_policy(&key)
            .context("rendering policy")?;
        self.vault
            .write(&policy_path(&key), json!({ "policy": policy }))
            .await
            .context("writing policy")?;
        info!(%key, "Wrote policy");

        let login_role = json!({
            "bound_service_account_names": [id.name],
            "bound_service_account_namespaces": [id.namespace],
            "policies": ["default", key],
            "ttl": LOGIN_TTL_SECS,
        });
        self.vault
            .write(&self.login_role_path(&key), login_role)
            .await
            .context("writing login role")?;
        info!(%key, "Wrote login role");

        self.backend
            .write_role(&key, annotations)
            .await
            .context("writing backend role")?;
        info!(%key, "Wrote backend role");

        Ok(())
    }

    async fn remove(&self, id: &IdentityRef) -> Result<()> {
        let key = self.key(id);

        self.backend
            .delete_role(&key)
            .await
            .context("deleting backend role")?;
        info!(%key, "Deleted backend role");

        self.vault
            .delete(&self.login_role_path(&key))
            .await
            .context("deleting login role")?;
        info!(%key, "Deleted login role");

        self.vault
            .delete(&policy_path(&key))
            .await
            .context("deleting policy")?;
        info!(%key, "Deleted policy");

        Ok(())
    }

    fn login_roles_path(&self) -> String {
        format!("auth/{}/role", self.kube_auth_backend)
    }

    fn login_role_path(&self, key: &str) -> String {
        format!("{}/{}", self.login_roles_path(), key)
    }
}

fn policy_path(key: &str) -> String {
    format!("sys/policy/{}", key)
}
