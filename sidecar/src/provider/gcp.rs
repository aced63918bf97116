use super::{missing, require, Credentials, Issued, Protocol, Provider};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::debug;
use vkcc_vault::{Error, Secret, Vault};

/// Issues OAuth2 access tokens from a roleset of the GCP secrets engine.
#[derive(Clone, Debug)]
pub struct GcpProvider {
    path: String,
    roleset: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GcpCredentials {
    pub access_token: String,

    /// The service account the token acts as.
    pub email: String,
    pub project: String,
}

// === impl GcpProvider ===

impl GcpProvider {
    pub fn new(path: impl Into<String>, roleset: impl Into<String>) -> Self {
        Self {
            path: path.into().trim_matches('/').to_string(),
            roleset: roleset.into(),
        }
    }

    fn token_lifetime(secret: &Secret, now: DateTime<Utc>) -> Duration {
        let num = |key: &str| secret.data.get(key).and_then(serde_json::Value::as_i64);
        if let Some(ttl) = num("token_ttl").filter(|ttl| *ttl > 0) {
            return Duration::from_secs(ttl as u64);
        }
        if let Some(expires) = num("expires_at_seconds") {
            let remaining = expires - now.timestamp();
            return Duration::from_secs(remaining.max(0) as u64);
        }
        Duration::from_secs(secret.lease_duration)
    }
}

#[async_trait::async_trait]
impl Provider for GcpProvider {
    fn protocol(&self) -> Protocol {
        Protocol::GcpMetadata
    }

    async fn issue(&self, vault: &dyn Vault) -> Result<Issued, Error> {
        let token_path = format!("{}/token/{}", self.path, self.roleset);
        let token = vault
            .read(&token_path)
            .await?
            .ok_or_else(|| missing(&token_path))?;
        let access_token = require(&token, &token_path, "token")?.to_string();

        let roleset_path = format!("{}/roleset/{}", self.path, self.roleset);
        let roleset = vault
            .read(&roleset_path)
            .await?
            .ok_or_else(|| missing(&roleset_path))?;
        let email = require(&roleset, &roleset_path, "service_account_email")?.to_string();
        let project = require(&roleset, &roleset_path, "project")?.to_string();

        let lease_duration = Self::token_lifetime(&token, Utc::now());
        debug!(path = %token_path, ?lease_duration, %email, "Issued GCP token");
        Ok(Issued {
            credentials: Credentials::Gcp(GcpCredentials {
                access_token,
                email,
                project,
            }),
            lease_duration,
            renewable: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use vkcc_vault::mock::{MockVault, Op};

    fn mk_vault(token: serde_json::Value) -> MockVault {
        let vault = MockVault::new();
        vault.insert("gcp/token/vkcc_gcp_ns_sa", token);
        vault.insert(
            "gcp/roleset/vkcc_gcp_ns_sa",
            json!({
                "secret_type": "access_token",
                "project": "my-project",
                "service_account_email": "vaultvkcc@my-project.iam.gserviceaccount.com",
            }),
        );
        vault
    }

    #[tokio::test]
    async fn issues_token() {
        let vault = mk_vault(json!({
            "token": "ya29.token",
            "token_ttl": 3599,
            "expires_at_seconds": 1_700_003_599i64,
        }));
        let issued = GcpProvider::new("gcp", "vkcc_gcp_ns_sa")
            .issue(&vault)
            .await
            .unwrap();
        assert_eq!(
            issued.credentials,
            Credentials::Gcp(GcpCredentials {
                access_token: "ya29.token".to_string(),
                email: "vaultvkcc@my-project.iam.gserviceaccount.com".to_string(),
                project: "my-project".to_string(),
            })
        );
        assert_eq!(issued.lease_duration, Duration::from_secs(3599));
        assert!(!issued.renewable);
    }

    #[test]
    fn lifetime_from_expiry() {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let secret = |data: serde_json::Value| Secret {
            lease_duration: 60,
            data: match data {
                serde_json::Value::Object(map) => map,
                _ => unreachable!(),
            },
            ..Secret::default()
        };
        assert_eq!(
            GcpProvider::token_lifetime(&secret(json!({"expires_at_seconds": 1_700_000_600i64})), now),
            Duration::from_secs(600)
        );
        assert_eq!(
            GcpProvider::token_lifetime(&secret(json!({"expires_at_seconds": 1_600_000_000i64})), now),
            Duration::ZERO
        );
        assert_eq!(
            GcpProvider::token_lifetime(&secret(json!({})), now),
            Duration::from_secs(60)
        );
    }

    #[tokio::test]
    async fn missing_roleset() {
        let vault = MockVault::new();
        vault.insert("gcp/token/rs", json!({"token": "t", "token_ttl": 60}));
        let err = GcpProvider::new("gcp", "rs").issue(&vault).await.unwrap_err();
        assert!(err.to_string().contains("gcp/roleset/rs"), "{}", err);

        vault.fail(Op::Read, "gcp/token", 500);
        let err = GcpProvider::new("gcp", "rs").issue(&vault).await.unwrap_err();
        assert_eq!(err.status(), Some(500));
    }
}
