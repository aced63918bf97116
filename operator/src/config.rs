use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::{path::Path, time::Duration};
use vkcc_core::{aws::AwsRules, gcp::GcpRules, KeyCodec};

/// The operator's configuration file.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// The mount path of Vault's Kubernetes auth method.
    pub kubernetes_auth_backend: String,

    /// Prefixes the names of every object written to Vault.
    pub prefix: String,

    pub aws: AwsConfig,
    pub gcp: GcpConfig,

    /// When set, garbage collection is repeated at this interval.
    #[serde(with = "humantime_serde")]
    pub gc_interval: Option<Duration>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AwsConfig {
    pub enabled: bool,
    pub path: String,

    /// The TTL of STS credentials issued for managed roles.
    #[serde(rename = "defaultTTL", with = "humantime_serde")]
    pub default_ttl: Duration,

    pub rules: AwsRules,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GcpConfig {
    pub enabled: bool,
    pub path: String,
    pub rules: GcpRules,
}

// === impl Config ===

impl Default for Config {
    fn default() -> Self {
        Self {
            kubernetes_auth_backend: "kubernetes".to_string(),
            prefix: "vkcc".to_string(),
            aws: AwsConfig::default(),
            gcp: GcpConfig::default(),
            gc_interval: None,
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_yaml(&yaml).with_context(|| format!("loading config file {}", path.display()))
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config = serde_yaml::from_str::<Option<Self>>(yaml)
            .context("parsing config")?
            .unwrap_or_default();
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        KeyCodec::new(self.prefix.as_str(), "aws")?;
        if self.kubernetes_auth_backend.is_empty() {
            bail!("kubernetesAuthBackend must not be empty");
        }
        if self.aws.enabled && self.aws.path.is_empty() {
            bail!("aws.path must not be empty");
        }
        if self.gcp.enabled && self.gcp.path.is_empty() {
            bail!("gcp.path must not be empty");
        }
        if !self.aws.enabled && !self.gcp.enabled {
            bail!("at least one backend must be enabled");
        }
        if self.gc_interval == Some(Duration::ZERO) {
            bail!("gcInterval must be positive");
        }
        Ok(())
    }
}

// === impl AwsConfig ===

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: "aws".to_string(),
            default_ttl: Duration::from_secs(15 * 60),
            rules: AwsRules::default(),
        }
    }
}

// === impl GcpConfig ===

impl Default for GcpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: "gcp".to_string(),
            rules: GcpRules::default(),
        }
    }
}
