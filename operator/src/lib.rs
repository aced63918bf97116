#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! vkcc operator
//!
//! The operator watches ServiceAccounts and, for each one whose annotations request cloud
//! credentials that the configured rules allow, writes a policy, a Kubernetes auth login role and
//! a secrets engine role to Vault. Objects belonging to ServiceAccounts that are deleted or no
//! longer admitted are removed, and orphans left behind while the operator was down are garbage
//! collected.

pub mod backend;
pub mod config;
mod index;
pub mod k8s;
pub mod reconcile;

pub use self::config::Config;
use self::{
    backend::{AwsBackend, Backend, GcpBackend},
    reconcile::Reconciler,
};
use anyhow::{Context, Result};
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;
use vkcc_core::backoff::ExponentialBackoff;
use vkcc_vault::Vault;

const RETRY_MIN: Duration = Duration::from_secs(1);
const RETRY_MAX: Duration = Duration::from_secs(5 * 60);
const RETRY_JITTER: f64 = 0.5;

/// Reconciles ServiceAccounts against Vault until `drain` is signaled.
///
/// `ready` is set once the initial listing of ServiceAccounts has been reconciled and garbage has
/// been collected for every backend.
pub async fn run(
    config: &Config,
    service_accounts: k8s::Watch<k8s::ServiceAccount>,
    vault: Arc<dyn Vault>,
    ready: watch::Sender<bool>,
    drain: drain::Watch,
) -> Result<()> {
    let reconcilers = reconcilers(config, vault)?;
    let backoff = ExponentialBackoff::new(RETRY_MIN, RETRY_MAX, RETRY_JITTER)?;
    let index = index::Index::new(reconcilers, backoff, config.gc_interval, ready);
    index.index(service_accounts, drain).await
}

/// Builds a reconciler for each enabled backend.
pub fn reconcilers(config: &Config, vault: Arc<dyn Vault>) -> Result<Vec<Reconciler>> {
    let mut backends = Vec::<Arc<dyn Backend>>::new();
    if config.aws.enabled {
        let aws = AwsBackend::new(
            vault.clone(),
            config.aws.path.as_str(),
            config.aws.default_ttl,
            config.aws.rules.clone(),
        )
        .context("configuring the aws backend")?;
        backends.push(Arc::new(aws));
    }
    if config.gcp.enabled {
        let gcp = GcpBackend::new(vault.clone(), config.gcp.path.as_str(), config.gcp.rules.clone())
            .context("configuring the gcp backend")?;
        backends.push(Arc::new(gcp));
    }
    anyhow::ensure!(!backends.is_empty(), "at least one backend must be enabled");

    backends
        .into_iter()
        .map(|backend| {
            Reconciler::new(
                backend,
                vault.clone(),
                &config.prefix,
                config.kubernetes_auth_backend.as_str(),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use vkcc_vault::mock::MockVault;

    #[test]
    fn builds_enabled_backends() {
        let vault = Arc::new(MockVault::new());
        let config = Config::from_yaml("aws: {enabled: true}\ngcp: {enabled: true}").unwrap();
        let names = reconcilers(&config, vault.clone())
            .unwrap()
            .iter()
            .map(|r| r.backend().name())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["aws", "gcp"]);

        let config = Config::from_yaml("gcp: {enabled: true}").unwrap();
        assert_eq!(reconcilers(&config, vault).unwrap().len(), 1);
    }
}
