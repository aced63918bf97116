#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! A minimal client for the parts of Vault's HTTP API used by vkcc.

mod client;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use self::client::{Client, Config};
use serde::Deserialize;
use serde_json::{Map, Value};

/// Vault's logical API.
///
/// Paths are relative to `/v1/`, e.g. `sys/policy/foo`.
#[async_trait::async_trait]
pub trait Vault: Send + Sync {
    /// Reads the secret at `path`, returning `None` if nothing exists there.
    async fn read(&self, path: &str) -> Result<Option<Secret>, Error>;

    /// Writes `data` to `path`, returning the response body if there is one.
    async fn write(&self, path: &str, data: Value) -> Result<Option<Secret>, Error>;

    /// Deletes `path`. Deleting a path that doesn't exist is not an error.
    async fn delete(&self, path: &str) -> Result<(), Error>;

    /// Lists the keys under `path`. Listing a path that doesn't exist returns no keys.
    async fn list(&self, path: &str) -> Result<Vec<String>, Error>;

    /// Authenticates with the Kubernetes auth method mounted at `mount`.
    ///
    /// On success, subsequent requests are made with the returned client token.
    async fn login_kubernetes(&self, mount: &str, role: &str, jwt: &str) -> Result<Auth, Error>;

    /// Picks up a token rotated outside of the process, if the client supports it.
    fn reload_token(&self) {}
}

/// A response from Vault's logical API.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct Secret {
    #[serde(default)]
    pub lease_id: String,

    /// Seconds.
    #[serde(default)]
    pub lease_duration: u64,

    #[serde(default)]
    pub renewable: bool,

    #[serde(default, deserialize_with = "null_as_default")]
    pub data: Map<String, Value>,

    #[serde(default)]
    pub auth: Option<Auth>,
}

/// Describes an authenticated Vault session.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct Auth {
    pub client_token: String,

    #[serde(default)]
    pub accessor: String,

    #[serde(default)]
    pub policies: Vec<String>,

    /// Seconds.
    #[serde(default)]
    pub lease_duration: u64,

    #[serde(default)]
    pub renewable: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("request to {path} failed: {source}")]
    Transport {
        path: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{path} returned {status}: {}", errors.join("; "))]
    Status {
        path: String,
        status: u16,
        errors: Vec<String>,
    },

    #[error("invalid response from {path}: {reason}")]
    Response { path: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),
}

// === impl Secret ===

impl Secret {
    /// Returns the string at `key` in the secret's data.
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

// === impl Error ===

impl Error {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    /// Indicates that the request's token is missing, expired or lacks permission.
    pub fn is_permission_denied(&self) -> bool {
        matches!(self.status(), Some(401) | Some(403))
    }
}

fn null_as_default<'de, D, T>(de: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(de)?.unwrap_or_default())
}
