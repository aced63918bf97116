#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod admin;

use anyhow::{anyhow, bail, Context, Result};
use futures::{future, prelude::*};
use std::{net::SocketAddr, path::PathBuf, str::FromStr, sync::Arc};
use structopt::StructOpt;
use tokio::sync::watch;
use tracing::{error, info, info_span, Instrument};
use tracing_subscriber::EnvFilter;
use vkcc_sidecar::{AwsProvider, GcpProvider, Login, Provider};
use vkcc_vault::Vault;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "vkcc",
    about = "Cloud provider credentials for Kubernetes workloads, brokered through Vault"
)]
struct Args {
    /// Either `plain` or `json`.
    #[structopt(long, default_value = "plain")]
    log_format: LogFormat,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Manages Vault policies and roles for annotated ServiceAccounts.
    Operator {
        #[structopt(long, parse(from_os_str))]
        config_file: PathBuf,

        #[structopt(long, default_value = "0.0.0.0:8099")]
        operational_address: SocketAddr,
    },

    /// Serves AWS credentials to the pod over the container credentials protocol.
    AwsSidecar {
        #[structopt(flatten)]
        sidecar: SidecarArgs,

        /// Mount path of the AWS secrets engine.
        #[structopt(long, default_value = "aws")]
        backend: String,

        /// Assume this role through STS rather than reading the role's credentials.
        #[structopt(long)]
        role_arn: Option<String>,

        /// Defaults to the role the operator creates for the pod's ServiceAccount.
        #[structopt(long)]
        role: Option<String>,
    },

    /// Serves GCP access tokens to the pod by emulating the metadata server.
    GcpSidecar {
        #[structopt(flatten)]
        sidecar: SidecarArgs,

        /// Mount path of the GCP secrets engine.
        #[structopt(long, default_value = "gcp")]
        backend: String,

        /// Defaults to the roleset the operator creates for the pod's ServiceAccount.
        #[structopt(long)]
        roleset: Option<String>,
    },
}

#[derive(Debug, StructOpt)]
struct SidecarArgs {
    /// The prefix the operator uses to name Vault objects.
    #[structopt(long, default_value = "vkcc")]
    prefix: String,

    /// Defaults to the login role the operator creates for the pod's ServiceAccount.
    #[structopt(long)]
    kube_auth_role: Option<String>,

    #[structopt(long, default_value = "kubernetes")]
    kube_auth_backend: String,

    #[structopt(
        long,
        parse(from_os_str),
        default_value = "/var/run/secrets/kubernetes.io/serviceaccount/token"
    )]
    kube_token_path: PathBuf,

    #[structopt(long, default_value = "127.0.0.1:8000")]
    listen_address: SocketAddr,

    #[structopt(long, default_value = "0.0.0.0:8099")]
    operational_address: SocketAddr,
}

#[derive(Copy, Clone, Debug)]
enum LogFormat {
    Plain,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    let Args {
        log_format,
        command,
    } = Args::from_args();
    log_format.init()?;

    let (drain_tx, drain_rx) = drain::channel();
    let (ready_tx, ready_rx) = watch::channel(false);

    let (admin_addr, task) = match command {
        Command::Operator {
            config_file,
            operational_address,
        } => {
            let task = operator(config_file, ready_tx, drain_rx.clone())
                .instrument(info_span!("operator"))
                .boxed();
            (operational_address, task)
        }

        Command::AwsSidecar {
            sidecar,
            backend,
            role_arn,
            role,
        } => {
            let role = match role {
                Some(role) => role,
                None => sidecar.own_key("aws")?,
            };
            let provider = AwsProvider::new(backend, role, role_arn);
            let addr = sidecar.operational_address;
            let task = self::sidecar(sidecar, "aws", Arc::new(provider), ready_tx, drain_rx.clone())?
                .instrument(info_span!("aws"))
                .boxed();
            (addr, task)
        }

        Command::GcpSidecar {
            sidecar,
            backend,
            roleset,
        } => {
            let roleset = match roleset {
                Some(roleset) => roleset,
                None => sidecar.own_key("gcp")?,
            };
            let provider = GcpProvider::new(backend, roleset);
            let addr = sidecar.operational_address;
            let task = self::sidecar(sidecar, "gcp", Arc::new(provider), ready_tx, drain_rx.clone())?
                .instrument(info_span!("gcp"))
                .boxed();
            (addr, task)
        }
    };

    let admin = tokio::spawn(
        admin::serve(admin_addr, ready_rx, drain_rx).instrument(info_span!("admin")),
    );
    let mut task = tokio::spawn(task);

    let res = tokio::select! {
        _ = shutdown_signal() => {
            info!("Received shutdown signal");
            drain_tx.drain().await;
            (&mut task).await
        }
        res = &mut task => {
            drain_tx.drain().await;
            res
        }
    };

    match admin.await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => error!(?error, "Admin server failed"),
        Err(error) => error!(%error, "Admin server panicked"),
    }
    res.context("task panicked")?
}

async fn operator(
    config_file: PathBuf,
    ready: watch::Sender<bool>,
    drain: drain::Watch,
) -> Result<()> {
    let config = vkcc_operator::Config::load(&config_file)?;
    let vault = vault_client()?;
    let client = kube::Client::try_default()
        .await
        .context("failed to initialize the Kubernetes client")?;
    let service_accounts = vkcc_operator::k8s::service_accounts(client);
    vkcc_operator::run(&config, service_accounts, vault, ready, drain).await
}

fn sidecar(
    args: SidecarArgs,
    backend: &str,
    provider: Arc<dyn Provider>,
    ready: watch::Sender<bool>,
    drain: drain::Watch,
) -> Result<impl Future<Output = Result<()>>> {
    let role = match args.kube_auth_role.clone() {
        Some(role) => role,
        None => args.own_key(backend)?,
    };
    let config = vkcc_sidecar::Config {
        login: Login {
            mount: args.kube_auth_backend,
            role,
            token_path: args.kube_token_path,
        },
        listen_addr: args.listen_address,
    };
    let vault = vault_client()?;
    Ok(vkcc_sidecar::run(config, provider, vault, ready, drain))
}

fn vault_client() -> Result<Arc<dyn Vault>> {
    let config = vkcc_vault::Config::from_env()?;
    let client = vkcc_vault::Client::new(config)?;
    Ok(Arc::new(client))
}

async fn shutdown_signal() {
    let term = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(error) => {
                error!(%error, "Failed to register SIGTERM handler");
                future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term => {}
    }
}

// === impl SidecarArgs ===

impl SidecarArgs {
    fn own_key(&self, backend: &str) -> Result<String> {
        vkcc_sidecar::own_key(&self.prefix, backend, &self.kube_token_path)
    }
}

// === impl LogFormat ===

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "plain" => Ok(Self::Plain),
            "json" => Ok(Self::Json),
            _ => bail!("invalid log format: {}", s),
        }
    }
}

impl LogFormat {
    fn init(self) -> Result<()> {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let builder = tracing_subscriber::fmt().with_env_filter(filter);
        match self {
            Self::Plain => builder.try_init(),
            Self::Json => builder.json().try_init(),
        }
        .map_err(|e| anyhow!("failed to initialize logging: {}", e))
    }
}
