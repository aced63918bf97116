#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! vkcc sidecar
//!
//! Logs in to Vault as the pod's ServiceAccount, keeps a fresh set of cloud credentials and
//! serves them locally over the protocol that the cloud provider's SDKs already know how to
//! consume.

pub mod lease;
pub mod provider;
pub mod server;
pub mod token;

pub use self::{
    lease::{Lease, LeaseManager, Login},
    provider::{AwsProvider, GcpProvider, Protocol, Provider},
};
use anyhow::{bail, Context, Result};
use std::{net::SocketAddr, path::Path, sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::{error, info_span, Instrument};
use vkcc_core::{backoff::ExponentialBackoff, KeyCodec};
use vkcc_vault::Vault;

const RETRY_MIN: Duration = Duration::from_secs(1);
const RETRY_MAX: Duration = Duration::from_secs(60);
const RETRY_JITTER: f64 = 0.5;

#[derive(Clone, Debug)]
pub struct Config {
    pub login: Login,
    pub listen_addr: SocketAddr,
}

/// Keeps credentials fresh and serves them until `drain` is signaled.
///
/// `ready` is set once the first credentials have been obtained.
pub async fn run(
    config: Config,
    provider: Arc<dyn Provider>,
    vault: Arc<dyn Vault>,
    ready: watch::Sender<bool>,
    drain: drain::Watch,
) -> Result<()> {
    let backoff = ExponentialBackoff::new(RETRY_MIN, RETRY_MAX, RETRY_JITTER)?;
    let protocol = provider.protocol();
    let (manager, leases) = LeaseManager::new(vault, provider, config.login, backoff);
    let mut renewal = tokio::spawn(manager.run(drain.clone()).instrument(info_span!("lease")));

    let mut first = leases.clone();
    tokio::spawn(async move {
        if first.wait_for(Option::is_some).await.is_ok() {
            let _ = ready.send(true);
        }
    });

    let server = server::serve(config.listen_addr, protocol, leases, drain)
        .instrument(info_span!("server"));
    tokio::pin!(server);

    tokio::select! {
        res = &mut server => {
            if res.is_err() {
                renewal.abort();
            }
            res
        }
        res = &mut renewal => {
            // Renewal only stops once drain is signaled, so the server is shutting down too.
            if let Err(error) = res {
                error!(%error, "Credential renewal failed");
                bail!("credential renewal failed: {}", error);
            }
            server.await
        }
    }
}

/// Returns the name the operator gives to Vault objects for the ServiceAccount that owns the token
/// at `token_path`.
pub fn own_key(prefix: &str, backend: &str, token_path: &Path) -> Result<String> {
    let codec = KeyCodec::new(prefix, backend)?;
    let id = token::identity_from_file(token_path)
        .context("determining the pod's ServiceAccount")?;
    Ok(codec.encode(&id.namespace, &id.name))
}
