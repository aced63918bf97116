use crate::provider::{Credentials, Provider};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rand::{rngs::StdRng, SeedableRng};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::{
    sync::watch,
    time::{self, Instant},
};
use tracing::{debug, info, instrument, warn};
use vkcc_core::backoff::{renewal_delay, ExponentialBackoff};
use vkcc_vault::Vault;

/// A credential grant as served to the workload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lease {
    pub credentials: Credentials,
    pub issued_at: DateTime<Utc>,
    pub duration: Duration,
    pub renewable: bool,
}

/// How the sidecar authenticates to Vault.
#[derive(Clone, Debug)]
pub struct Login {
    /// The mount of the Kubernetes auth method.
    pub mount: String,
    pub role: String,

    /// The ServiceAccount token presented on login.
    pub token_path: PathBuf,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    /// No Vault session; the next renewal logs in first.
    Unauthenticated,

    /// Holds a current lease.
    Active,

    /// Obtaining a fresh lease to replace the current one.
    Renewing,

    /// The last attempt failed and will be retried. The last lease, if any, is still served.
    Failed,
}

/// Keeps a fresh lease published for the local server.
pub struct LeaseManager {
    vault: Arc<dyn Vault>,
    provider: Arc<dyn Provider>,
    login: Login,
    backoff: ExponentialBackoff,
    rng: StdRng,

    state: State,
    failures: u32,
    session: Option<Session>,
    leases: watch::Sender<Option<Arc<Lease>>>,
}

#[derive(Copy, Clone, Debug)]
struct Session {
    /// When the Vault token expires, if it does.
    expires_at: Option<Instant>,
}

// === impl Lease ===

impl Lease {
    pub fn expires_at(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.duration)
            .ok()
            .and_then(|d| self.issued_at.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

// === impl LeaseManager ===

impl LeaseManager {
    pub fn new(
        vault: Arc<dyn Vault>,
        provider: Arc<dyn Provider>,
        login: Login,
        backoff: ExponentialBackoff,
    ) -> (Self, watch::Receiver<Option<Arc<Lease>>>) {
        let (leases, rx) = watch::channel(None);
        let manager = Self {
            vault,
            provider,
            login,
            backoff,
            rng: StdRng::from_entropy(),
            state: State::Unauthenticated,
            failures: 0,
            session: None,
            leases,
        };
        (manager, rx)
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Renews the lease until `drain` is signaled.
    pub async fn run(mut self, drain: drain::Watch) {
        let shutdown = drain.signaled();
        tokio::pin!(shutdown);

        loop {
            let delay = tokio::select! {
                delay = self.renew() => delay,
                _release = &mut shutdown => break,
            };
            tokio::select! {
                _ = time::sleep(delay) => {}
                _release = &mut shutdown => break,
            }
        }
        info!("Renewal stopped");
    }

    /// Attempts to obtain a fresh lease, logging in first if there is no live session.
    ///
    /// Returns how long to wait before the next attempt: a jittered fraction of the lease's
    /// duration on success, or a backoff delay on failure. A failure never clears the published
    /// lease.
    #[instrument(skip(self), fields(role = %self.login.role))]
    pub async fn renew(&mut self) -> Duration {
        if self.state == State::Active {
            self.state = State::Renewing;
        }

        match self.try_renew().await {
            Ok(lease) => {
                self.state = State::Active;
                self.failures = 0;
                // Leases shorter than the backoff minimum are renewed no sooner than it.
                let delay = renewal_delay(lease.duration, &mut self.rng).max(self.backoff.min());
                info!(expires_at = %lease.expires_at(), ?delay, "Obtained credentials");
                self.leases.send_replace(Some(Arc::new(lease)));
                delay
            }
            Err(error) => {
                let denied = error
                    .downcast_ref::<vkcc_vault::Error>()
                    .map_or(false, vkcc_vault::Error::is_permission_denied);
                if denied {
                    self.session = None;
                    self.state = State::Unauthenticated;
                } else if self.session.is_some() {
                    self.state = State::Failed;
                } else {
                    self.state = State::Unauthenticated;
                }

                let delay = self.backoff.delay(self.failures, &mut self.rng);
                self.failures = self.failures.saturating_add(1);
                let stale = self.leases.borrow().is_some();
                warn!(?error, ?delay, stale, "Failed to obtain credentials");
                delay
            }
        }
    }

    async fn try_renew(&mut self) -> Result<Lease> {
        let expired = match self.session {
            None => true,
            Some(Session { expires_at }) => expires_at.map_or(false, |t| t <= Instant::now()),
        };
        if expired {
            self.session = None;
            self.login().await?;
        }

        let issued = self
            .provider
            .issue(self.vault.as_ref())
            .await
            .context("issuing credentials")?;
        Ok(Lease {
            credentials: issued.credentials,
            issued_at: Utc::now(),
            duration: issued.lease_duration,
            renewable: issued.renewable,
        })
    }

    async fn login(&mut self) -> Result<()> {
        let path = &self.login.token_path;
        let jwt = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading token {}", path.display()))?;
        let auth = self
            .vault
            .login_kubernetes(&self.login.mount, &self.login.role, jwt.trim())
            .await
            .with_context(|| format!("logging in to auth/{}", self.login.mount))?;

        let expires_at = (auth.lease_duration > 0)
            .then(|| Instant::now() + Duration::from_secs(auth.lease_duration));
        debug!(accessor = %auth.accessor, ttl = auth.lease_duration, "Logged in");
        self.session = Some(Session { expires_at });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::AwsProvider;
    use serde_json::json;
    use vkcc_vault::{
        mock::{MockVault, Op},
        Auth, Secret,
    };

    struct Fixture {
        vault: Arc<MockVault>,
        manager: LeaseManager,
        leases: watch::Receiver<Option<Arc<Lease>>>,
        _token: TokenFile,
    }

    struct TokenFile(PathBuf);

    impl Fixture {
        fn new(name: &str) -> Self {
            let token_path =
                std::env::temp_dir().join(format!("vkcc-lease-{}-{}", name, std::process::id()));
            std::fs::write(&token_path, "jwt\n").unwrap();

            let vault = Arc::new(MockVault::new().require_login());
            let login = Login {
                mount: "kubernetes".to_string(),
                role: "role".to_string(),
                token_path: token_path.clone(),
            };
            let backoff =
                ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60), 0.5)
                    .unwrap();
            let (manager, leases) = LeaseManager::new(
                vault.clone(),
                Arc::new(AwsProvider::new("aws", "role", None)),
                login,
                backoff,
            );
            let f = Self {
                vault,
                manager,
                leases,
                _token: TokenFile(token_path),
            };
            f.set_lease_duration(3600);
            f
        }

        fn set_lease_duration(&self, secs: u64) {
            self.vault.set_response(
                "aws/creds/role",
                Secret {
                    lease_duration: secs,
                    renewable: true,
                    data: match json!({"access_key": "AKIA", "secret_key": "s"}) {
                        serde_json::Value::Object(map) => map,
                        _ => unreachable!(),
                    },
                    ..Secret::default()
                },
            );
        }

        fn allow_login(&self, ttl: u64) {
            self.vault.set_login(Auth {
                client_token: "hvs.token".to_string(),
                lease_duration: ttl,
                ..Auth::default()
            });
        }

        fn current(&self) -> Option<Arc<Lease>> {
            self.leases.borrow().clone()
        }
    }

    impl Drop for TokenFile {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
        }
    }

    #[tokio::test]
    async fn logs_in_and_issues() {
        let mut f = Fixture::new("issue");
        f.allow_login(0);
        assert_eq!(f.manager.state(), State::Unauthenticated);

        let delay = f.manager.renew().await;
        assert!(delay >= Duration::from_secs(30 * 60), "{:?}", delay);
        assert!(delay < Duration::from_secs(50 * 60), "{:?}", delay);
        assert_eq!(f.manager.state(), State::Active);
        assert_eq!(
            f.vault.logins(),
            vec![(
                "kubernetes".to_string(),
                "role".to_string(),
                "jwt".to_string()
            )]
        );

        let lease = f.current().expect("lease must be published");
        assert_eq!(lease.duration, Duration::from_secs(3600));
        assert_eq!(
            lease.expires_at(),
            lease.issued_at + chrono::Duration::seconds(3600)
        );

        // Renewal reuses the session.
        f.manager.renew().await;
        assert_eq!(f.vault.logins().len(), 1);
        assert!(!Arc::ptr_eq(&lease, &f.current().unwrap()));
    }

    #[tokio::test]
    async fn keeps_stale_lease_on_failure() {
        let mut f = Fixture::new("stale");
        f.allow_login(0);
        f.manager.renew().await;
        let lease = f.current().unwrap();

        f.vault.fail_times(Op::Read, "aws/creds", 500, 2);
        let first = f.manager.renew().await;
        assert!(first <= Duration::from_secs(1), "{:?}", first);
        let second = f.manager.renew().await;
        assert!(second >= Duration::from_secs(1), "{:?}", second);
        assert!(second <= Duration::from_secs(2), "{:?}", second);
        assert_eq!(f.manager.state(), State::Failed);
        assert!(Arc::ptr_eq(&lease, &f.current().unwrap()));

        f.manager.renew().await;
        assert_eq!(f.manager.state(), State::Active);
        assert!(!Arc::ptr_eq(&lease, &f.current().unwrap()));
        assert_eq!(f.vault.logins().len(), 1);
    }

    #[tokio::test]
    async fn logs_in_again_when_denied() {
        let mut f = Fixture::new("denied");
        f.allow_login(0);
        f.manager.renew().await;

        f.vault.revoke_token();
        f.manager.renew().await;
        assert_eq!(f.manager.state(), State::Unauthenticated);
        assert!(f.current().is_some());

        f.manager.renew().await;
        assert_eq!(f.manager.state(), State::Active);
        assert_eq!(f.vault.logins().len(), 2);
    }

    #[tokio::test]
    async fn logs_in_again_when_session_expires() {
        time::pause();
        let mut f = Fixture::new("expired");
        f.allow_login(60);
        f.manager.renew().await;
        f.manager.renew().await;
        assert_eq!(f.vault.logins().len(), 1);

        time::advance(Duration::from_secs(61)).await;
        f.manager.renew().await;
        assert_eq!(f.vault.logins().len(), 2);
        assert_eq!(f.manager.state(), State::Active);
    }

    #[tokio::test]
    async fn backs_off_while_login_fails() {
        let mut f = Fixture::new("backoff");
        let mut delays = Vec::new();
        for _ in 0..4 {
            delays.push(f.manager.renew().await);
            assert_eq!(f.manager.state(), State::Unauthenticated);
        }
        assert!(f.current().is_none());
        assert_eq!(f.vault.logins().len(), 4);
        for (attempt, delay) in delays.into_iter().enumerate() {
            let max = Duration::from_secs(1 << attempt);
            assert!(delay <= max && delay >= max / 2, "{}: {:?}", attempt, delay);
        }

        f.allow_login(0);
        f.manager.renew().await;
        assert_eq!(f.manager.state(), State::Active);
    }

    #[tokio::test]
    async fn short_leases_renew_no_sooner_than_backoff_min() {
        let mut f = Fixture::new("short");
        f.allow_login(0);

        f.set_lease_duration(0);
        assert_eq!(f.manager.renew().await, Duration::from_secs(1));

        f.set_lease_duration(1);
        assert_eq!(f.manager.renew().await, Duration::from_secs(1));

        f.set_lease_duration(90);
        let delay = f.manager.renew().await;
        assert!(delay >= Duration::from_secs(45), "{:?}", delay);
        assert!(delay < Duration::from_secs(75), "{:?}", delay);
    }

    #[tokio::test]
    async fn stops_on_drain() {
        let f = Fixture::new("drain");
        f.allow_login(0);
        let Fixture {
            manager,
            mut leases,
            _token,
            ..
        } = f;
        let (signal, watch) = drain::channel();
        let task = tokio::spawn(manager.run(watch));

        leases.wait_for(Option::is_some).await.unwrap();
        signal.drain().await;
        task.await.unwrap();
    }
}
