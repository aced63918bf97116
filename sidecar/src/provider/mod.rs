//! Issues cloud credentials through Vault's secrets engines.

mod aws;
mod gcp;

pub use self::{
    aws::{AwsCredentials, AwsProvider},
    gcp::{GcpCredentials, GcpProvider},
};
use std::time::Duration;
use vkcc_vault::{Error, Secret, Vault};

/// The local protocol through which credentials are served.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Protocol {
    /// The ECS container credentials endpoint.
    AwsContainer,

    /// The GCE metadata server.
    GcpMetadata,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Credentials {
    Aws(AwsCredentials),
    Gcp(GcpCredentials),
}

/// Credentials along with how long they remain valid.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Issued {
    pub credentials: Credentials,
    pub lease_duration: Duration,
    pub renewable: bool,
}

#[async_trait::async_trait]
pub trait Provider: Send + Sync + 'static {
    fn protocol(&self) -> Protocol;

    /// Issues a fresh set of credentials with the current Vault session.
    async fn issue(&self, vault: &dyn Vault) -> Result<Issued, Error>;
}

/// Returns the string at `key` in the secret's data or fails.
fn require<'s>(secret: &'s Secret, path: &str, key: &str) -> Result<&'s str, Error> {
    secret
        .data_str(key)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::Response {
            path: path.to_string(),
            reason: format!("missing {}", key),
        })
}

fn missing(path: &str) -> Error {
    Error::Response {
        path: path.to_string(),
        reason: "no secret returned".to_string(),
    }
}
