use crate::{Auth, Error, Secret, Vault};
use parking_lot::RwLock;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, trace};

const DEFAULT_ADDR: &str = "https://127.0.0.1:8200";
const TOKEN_HEADER: &str = "X-Vault-Token";

/// Connection settings, typically read from the environment.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Config {
    pub addr: String,
    pub token: Option<String>,
    /// A PEM-encoded CA bundle used to verify Vault's certificate.
    pub ca_cert: Option<Vec<u8>>,
}

/// A [`Vault`] backed by Vault's HTTP API.
pub struct Client {
    http: reqwest::Client,
    addr: String,
    token: RwLock<Option<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errors: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Keys {
    #[serde(default)]
    keys: Vec<String>,
}

// === impl Config ===

impl Config {
    /// Reads `VAULT_ADDR`, `VAULT_TOKEN` and `VAULT_CACERT`.
    pub fn from_env() -> Result<Self, Error> {
        let addr = std::env::var("VAULT_ADDR")
            .ok()
            .filter(|a| !a.is_empty())
            .unwrap_or_else(|| DEFAULT_ADDR.to_string());

        let ca_cert = match std::env::var("VAULT_CACERT").ok().filter(|p| !p.is_empty()) {
            Some(path) => Some(std::fs::read(&path).map_err(|e| {
                Error::Config(format!("failed to read VAULT_CACERT {}: {}", path, e))
            })?),
            None => None,
        };

        Ok(Self {
            addr,
            token: token_from_env(),
            ca_cert,
        })
    }
}

fn token_from_env() -> Option<String> {
    std::env::var("VAULT_TOKEN").ok().filter(|t| !t.is_empty())
}

// === impl Client ===

impl Client {
    pub fn new(config: Config) -> Result<Self, Error> {
        let mut builder = reqwest::Client::builder();
        if let Some(pem) = config.ca_cert.as_ref() {
            let cert = reqwest::Certificate::from_pem(pem)
                .map_err(|e| Error::Config(format!("invalid CA certificate: {}", e)))?;
            builder = builder.add_root_certificate(cert);
        }
        let http = builder
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            addr: config.addr.trim_end_matches('/').to_string(),
            token: RwLock::new(config.token),
        })
    }

    pub fn set_token(&self, token: impl Into<String>) {
        *self.token.write() = Some(token.into());
    }

    /// Picks up a token that was rotated in the environment since the client was created.
    pub fn reload_token_from_env(&self) {
        if let Some(token) = token_from_env() {
            let mut current = self.token.write();
            if current.as_deref() != Some(token.as_str()) {
                debug!("Reloaded Vault token from the environment");
                *current = Some(token);
            }
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.addr, path.trim_start_matches('/'))
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> Result<Option<Secret>, Error> {
        trace!(%method, %path, "Request");
        let mut req = self.http.request(method, self.url(path)).query(query);
        if let Some(token) = self.token.read().as_ref() {
            req = req.header(TOKEN_HEADER, token);
        }
        if let Some(body) = body {
            req = req.json(body);
        }

        let transport = |source| Error::Transport {
            path: path.to_string(),
            source,
        };
        let rsp = req.send().await.map_err(transport)?;
        let status = rsp.status();
        let bytes = rsp.bytes().await.map_err(transport)?;

        if !status.is_success() {
            let body = serde_json::from_slice::<ErrorBody>(&bytes).unwrap_or_default();
            return Err(Error::Status {
                path: path.to_string(),
                status: status.as_u16(),
                errors: body.errors,
            });
        }

        if status == StatusCode::NO_CONTENT || bytes.is_empty() {
            return Ok(None);
        }
        let secret = serde_json::from_slice(&bytes).map_err(|e| Error::Response {
            path: path.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Some(secret))
    }
}

#[async_trait::async_trait]
impl Vault for Client {
    async fn read(&self, path: &str) -> Result<Option<Secret>, Error> {
        match self.request(Method::GET, path, &[], None).await {
            Err(e) if e.is_not_found() => Ok(None),
            res => res,
        }
    }

    async fn write(&self, path: &str, data: Value) -> Result<Option<Secret>, Error> {
        self.request(Method::POST, path, &[], Some(&data)).await
    }

    async fn delete(&self, path: &str) -> Result<(), Error> {
        match self.request(Method::DELETE, path, &[], None).await {
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
            Ok(_) => Ok(()),
        }
    }

    async fn list(&self, path: &str) -> Result<Vec<String>, Error> {
        let secret = match self.request(Method::GET, path, &[("list", "true")], None).await {
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            res => res?,
        };
        let data = match secret {
            Some(s) => Value::Object(s.data),
            None => return Ok(Vec::new()),
        };
        let keys = serde_json::from_value::<Keys>(data).map_err(|e| Error::Response {
            path: path.to_string(),
            reason: e.to_string(),
        })?;
        Ok(keys.keys)
    }

    async fn login_kubernetes(&self, mount: &str, role: &str, jwt: &str) -> Result<Auth, Error> {
        let path = format!("auth/{}/login", mount);
        let body = json!({ "role": role, "jwt": jwt });
        let auth = self
            .request(Method::POST, &path, &[], Some(&body))
            .await?
            .and_then(|s| s.auth)
            .ok_or_else(|| Error::Response {
                path: path.clone(),
                reason: "login response has no auth".to_string(),
            })?;
        self.set_token(auth.client_token.clone());
        debug!(%path, policies = ?auth.policies, lease_duration = auth.lease_duration, "Logged in");
        Ok(auth)
    }

    fn reload_token(&self) {
        self.reload_token_from_env();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls() {
        let client = Client::new(Config {
            addr: "http://vault:8200/".to_string(),
            ..Config::default()
        })
        .unwrap();
        assert_eq!(
            client.url("sys/policy/foo"),
            "http://vault:8200/v1/sys/policy/foo"
        );
        assert_eq!(
            client.url("/auth/kubernetes/role"),
            "http://vault:8200/v1/auth/kubernetes/role"
        );
    }

    #[test]
    fn set_token() {
        let client = Client::new(Config::default()).unwrap();
        assert_eq!(*client.token.read(), None);
        client.set_token("t");
        assert_eq!(client.token.read().as_deref(), Some("t"));
    }
}
