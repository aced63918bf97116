use super::{missing, require, Credentials, Issued, Protocol, Provider};
use serde_json::json;
use std::time::Duration;
use tracing::debug;
use vkcc_vault::{Error, Vault};

/// Issues AWS credentials from the AWS secrets engine.
#[derive(Clone, Debug)]
pub struct AwsProvider {
    path: String,
    role: String,
    role_arn: Option<String>,
}

/// An AWS access key pair, with a session token when the credentials are temporary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub token: Option<String>,
}

// === impl AwsProvider ===

impl AwsProvider {
    /// Issues credentials for `role` from the engine mounted at `path`.
    ///
    /// When `role_arn` is set, credentials are issued through STS for that ARN, which must be one
    /// of the role's ARNs.
    pub fn new(path: impl Into<String>, role: impl Into<String>, role_arn: Option<String>) -> Self {
        Self {
            path: path.into().trim_matches('/').to_string(),
            role: role.into(),
            role_arn: role_arn.filter(|arn| !arn.is_empty()),
        }
    }
}

#[async_trait::async_trait]
impl Provider for AwsProvider {
    fn protocol(&self) -> Protocol {
        Protocol::AwsContainer
    }

    async fn issue(&self, vault: &dyn Vault) -> Result<Issued, Error> {
        let (path, secret) = match self.role_arn.as_deref() {
            Some(arn) => {
                let path = format!("{}/sts/{}", self.path, self.role);
                let secret = vault.write(&path, json!({ "role_arn": arn })).await?;
                (path, secret)
            }
            None => {
                let path = format!("{}/creds/{}", self.path, self.role);
                let secret = vault.read(&path).await?;
                (path, secret)
            }
        };
        let secret = secret.ok_or_else(|| missing(&path))?;

        let credentials = AwsCredentials {
            access_key_id: require(&secret, &path, "access_key")?.to_string(),
            secret_access_key: require(&secret, &path, "secret_key")?.to_string(),
            token: secret
                .data_str("security_token")
                .or_else(|| secret.data_str("session_token"))
                .filter(|t| !t.is_empty())
                .map(String::from),
        };
        debug!(%path, lease = secret.lease_duration, "Issued AWS credentials");
        Ok(Issued {
            credentials: Credentials::Aws(credentials),
            lease_duration: Duration::from_secs(secret.lease_duration),
            renewable: secret.renewable,
        })
    }
}
