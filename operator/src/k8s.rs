use crate::backend::Annotations;
use futures::prelude::*;
use kube::api::Api;
use kube_runtime::watcher;
use std::pin::Pin;
use tokio::time;
use tracing::info;
use vkcc_core::IdentityRef;

pub use k8s_openapi::{
    api::core::v1::ServiceAccount, apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
pub use kube::api::ResourceExt;
pub use kube_runtime::watcher::{Event, Result};

/// Wraps an event stream that should never terminate.
pub struct Watch<T>(Pin<Box<dyn Stream<Item = Result<Event<T>>> + Send + 'static>>);

// === impl Watch ===

impl<T, W> From<W> for Watch<T>
where
    W: Stream<Item = Result<Event<T>>> + Send + 'static,
{
    fn from(watch: W) -> Self {
        Watch(watch.boxed())
    }
}

impl<T> Watch<T> {
    /// Receive the next event in the stream.
    ///
    /// If the stream fails, log the error and sleep for 1s before polling for a reset event.
    /// Returns `None` only if the stream terminates.
    pub async fn recv(&mut self) -> Option<Event<T>> {
        loop {
            match self.0.next().await? {
                Ok(ev) => return Some(ev),
                Err(error) => {
                    info!(%error, "Disconnected");
                    time::sleep(time::Duration::from_secs(1)).await;
                }
            }
        }
    }
}

/// Watches all ServiceAccounts in the cluster.
pub fn service_accounts(client: kube::Client) -> Watch<ServiceAccount> {
    watcher(Api::all(client), watcher::Config::default()).into()
}

/// Returns the identity of a ServiceAccount, or `None` if it isn't namespaced.
pub(crate) fn identity(sa: &ServiceAccount) -> Option<IdentityRef> {
    let namespace = sa.namespace().filter(|ns| !ns.is_empty())?;
    Some(IdentityRef::new(namespace, sa.name_any()))
}

pub(crate) fn annotations(sa: ServiceAccount) -> Annotations {
    sa.metadata.annotations.unwrap_or_default()
}
