//! An in-memory stand-in for Vault.

use crate::{Auth, Error, Secret, Vault};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Op {
    Read,
    Write,
    Delete,
    List,
    Login,
}

/// Stores written objects by path and answers reads and lists from them.
///
/// Canned responses may be registered for paths that issue credentials, and failures may be
/// injected by operation and path prefix.
#[derive(Debug, Default)]
pub struct MockVault {
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<String, Map<String, Value>>,
    responses: HashMap<String, Secret>,
    failures: Vec<Failure>,
    login: Option<Auth>,
    logins: Vec<(String, String, String)>,
    require_login: bool,
    authenticated: bool,
    calls: Vec<(Op, String)>,
}

#[derive(Debug)]
struct Failure {
    op: Op,
    prefix: String,
    status: u16,
    remaining: Option<usize>,
}

// === impl MockVault ===

impl MockVault {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects every request but logins with a 403 until a login succeeds.
    pub fn require_login(self) -> Self {
        self.state.lock().require_login = true;
        self
    }

    /// Sets the session returned by logins. Logins fail with a 400 until this is set.
    pub fn set_login(&self, auth: Auth) {
        self.state.lock().login = Some(auth);
    }

    /// Invalidates the current session.
    pub fn revoke_token(&self) {
        self.state.lock().authenticated = false;
    }

    /// Returns `secret` for reads and writes of `path`.
    pub fn set_response(&self, path: impl Into<String>, secret: Secret) {
        self.state.lock().responses.insert(path.into(), secret);
    }

    /// Stores an object directly, bypassing failure injection.
    pub fn insert(&self, path: impl Into<String>, data: Value) {
        let data = match data {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        self.state.lock().objects.insert(path.into(), data);
    }

    /// Fails every `op` on paths starting with `prefix`.
    pub fn fail(&self, op: Op, prefix: impl Into<String>, status: u16) {
        self.push_failure(op, prefix.into(), status, None);
    }

    /// Fails the next `times` requests for `op` on paths starting with `prefix`.
    pub fn fail_times(&self, op: Op, prefix: impl Into<String>, status: u16, times: usize) {
        self.push_failure(op, prefix.into(), status, Some(times));
    }

    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    pub fn get(&self, path: &str) -> Option<Map<String, Value>> {
        self.state.lock().objects.get(path).cloned()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.state.lock().objects.contains_key(path)
    }

    pub fn paths(&self) -> Vec<String> {
        self.state.lock().objects.keys().cloned().collect()
    }

    /// Returns the (mount, role, jwt) of each login attempt.
    pub fn logins(&self) -> Vec<(String, String, String)> {
        self.state.lock().logins.clone()
    }

    pub fn calls(&self) -> Vec<(Op, String)> {
        self.state.lock().calls.clone()
    }

    fn push_failure(&self, op: Op, prefix: String, status: u16, remaining: Option<usize>) {
        self.state.lock().failures.push(Failure {
            op,
            prefix,
            status,
            remaining,
        });
    }
}

#[async_trait::async_trait]
impl Vault for MockVault {
    async fn read(&self, path: &str) -> Result<Option<Secret>, Error> {
        let mut state = self.state.lock();
        state.check(Op::Read, path)?;
        if let Some(secret) = state.responses.get(path) {
            return Ok(Some(secret.clone()));
        }
        Ok(state.objects.get(path).map(|data| Secret {
            data: data.clone(),
            ..Secret::default()
        }))
    }

    async fn write(&self, path: &str, data: Value) -> Result<Option<Secret>, Error> {
        let mut state = self.state.lock();
        state.check(Op::Write, path)?;
        let data = match data {
            Value::Object(map) => map,
            _ => {
                return Err(Error::Status {
                    path: path.to_string(),
                    status: 400,
                    errors: vec!["body must be an object".to_string()],
                })
            }
        };
        state.objects.insert(path.to_string(), data);
        Ok(state.responses.get(path).cloned())
    }

    async fn delete(&self, path: &str) -> Result<(), Error> {
        let mut state = self.state.lock();
        state.check(Op::Delete, path)?;
        state.objects.remove(path);
        Ok(())
    }

    async fn list(&self, path: &str) -> Result<Vec<String>, Error> {
        let mut state = self.state.lock();
        state.check(Op::List, path)?;
        let dir = format!("{}/", path.trim_end_matches('/'));
        let mut keys = state
            .objects
            .keys()
            .filter_map(|p| p.strip_prefix(&dir))
            .map(|rest| match rest.find('/') {
                Some(i) => rest[..=i].to_string(),
                None => rest.to_string(),
            })
            .collect::<Vec<_>>();
        keys.dedup();
        Ok(keys)
    }

    async fn login_kubernetes(&self, mount: &str, role: &str, jwt: &str) -> Result<Auth, Error> {
        let path = format!("auth/{}/login", mount);
        let mut state = self.state.lock();
        state
            .logins
            .push((mount.to_string(), role.to_string(), jwt.to_string()));
        state.check(Op::Login, &path)?;
        let auth = state.login.clone().ok_or_else(|| Error::Status {
            path,
            status: 400,
            errors: vec!["invalid role name".to_string()],
        })?;
        state.authenticated = true;
        Ok(auth)
    }
}

// === impl State ===

impl State {
    fn check(&mut self, op: Op, path: &str) -> Result<(), Error> {
        self.calls.push((op, path.to_string()));

        let status = self
            .failures
            .iter_mut()
            .find(|f| f.op == op && path.starts_with(&f.prefix) && f.remaining != Some(0))
            .map(|f| {
                if let Some(n) = f.remaining.as_mut() {
                    *n -= 1;
                }
                f.status
            })
            .or_else(|| {
                let unauthenticated = self.require_login && !self.authenticated;
                (op != Op::Login && unauthenticated).then(|| 403)
            });

        match status {
            Some(status) => Err(Error::Status {
                path: path.to_string(),
                status,
                errors: vec!["injected failure".to_string()],
            }),
            None => Ok(()),
        }
    }
}
