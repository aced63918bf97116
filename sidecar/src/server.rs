//! Serves the current lease over the protocol the workload's SDK expects.

use crate::{
    lease::Lease,
    provider::{AwsCredentials, Credentials, GcpCredentials, Protocol},
};
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use futures::{future, prelude::*};
use hyper::{
    header::{HeaderValue, CONTENT_TYPE},
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, StatusCode,
};
use serde_json::json;
use std::{convert::Infallible, net::SocketAddr, sync::Arc};
use tokio::sync::watch;
use tracing::{debug, info};

const METADATA_FLAVOR: &str = "metadata-flavor";
const GOOGLE: &str = "Google";
const COMPUTE_METADATA: &str = "/computeMetadata/";
const SERVICE_ACCOUNTS: &str = "/computeMetadata/v1/instance/service-accounts/";
const PROJECT_ID: &str = "/computeMetadata/v1/project/project-id";

/// Serves the latest lease published on `leases` until `drain` is signaled.
pub async fn serve(
    addr: SocketAddr,
    protocol: Protocol,
    leases: watch::Receiver<Option<Arc<Lease>>>,
    drain: drain::Watch,
) -> Result<()> {
    let make_svc = make_service_fn(move |_| {
        let leases = leases.clone();
        future::ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
            let lease = leases.borrow().clone();
            let rsp = respond(protocol, lease.as_deref(), &req, Utc::now());
            debug!(method = %req.method(), path = %req.uri().path(), status = %rsp.status());
            future::ok::<_, Infallible>(rsp)
        }))
    });

    let server = hyper::Server::try_bind(&addr)
        .with_context(|| format!("binding {}", addr))?
        .serve(make_svc)
        .with_graceful_shutdown(drain.clone().signaled().map(|_release| ()));
    info!(%addr, ?protocol, "Serving credentials");
    drain
        .ignore_signaled()
        .release_after(server)
        .await
        .context("serving credentials")
}

/// Answers a request from a snapshot of the lease.
pub fn respond(
    protocol: Protocol,
    lease: Option<&Lease>,
    req: &Request<Body>,
    now: DateTime<Utc>,
) -> Response<Body> {
    let rsp = if req.method() != Method::GET {
        text(StatusCode::METHOD_NOT_ALLOWED, "method not allowed\n")
    } else {
        match protocol {
            Protocol::AwsContainer => aws(lease, req.uri().path(), now),
            Protocol::GcpMetadata => gcp(lease, req, now),
        }
    };
    match protocol {
        Protocol::AwsContainer => rsp,
        Protocol::GcpMetadata => with_flavor(rsp),
    }
}

fn aws(lease: Option<&Lease>, path: &str, now: DateTime<Utc>) -> Response<Body> {
    if path.trim_end_matches('/') != "/credentials" {
        return not_found();
    }
    let lease = match lease {
        Some(lease) => lease,
        None => return unavailable(),
    };
    let creds = match &lease.credentials {
        Credentials::Aws(creds) => creds,
        _ => return unavailable(),
    };
    if lease.expires_at() <= now {
        debug!(expires_at = %lease.expires_at(), "Serving expired credentials");
    }

    let AwsCredentials {
        access_key_id,
        secret_access_key,
        token,
    } = creds;
    let mut body = json!({
        "AccessKeyId": access_key_id,
        "SecretAccessKey": secret_access_key,
        "Expiration": lease.expires_at().to_rfc3339_opts(SecondsFormat::Secs, true),
    });
    if let Some(token) = token {
        body["Token"] = json!(token);
    }
    self::json(body)
}

fn gcp(lease: Option<&Lease>, req: &Request<Body>, now: DateTime<Utc>) -> Response<Body> {
    let path = req.uri().path();
    if path == "/" {
        return text(StatusCode::OK, "ok\n");
    }
    if !path.starts_with(COMPUTE_METADATA) {
        return not_found();
    }

    let flavor = req
        .headers()
        .get(METADATA_FLAVOR)
        .map_or(false, |v| v.as_bytes().eq_ignore_ascii_case(GOOGLE.as_bytes()));
    if !flavor {
        return text(StatusCode::FORBIDDEN, "missing Metadata-Flavor: Google header\n");
    }

    let creds = match lease {
        Some(Lease {
            credentials: Credentials::Gcp(creds),
            ..
        }) => Some(creds),
        _ => None,
    };

    if path == PROJECT_ID {
        return match creds {
            Some(creds) => text(StatusCode::OK, creds.project.clone()),
            None => unavailable(),
        };
    }

    let (account, item) = match path
        .strip_prefix(SERVICE_ACCOUNTS)
        .and_then(|rest| rest.trim_end_matches('/').split_once('/'))
    {
        Some(parts) => parts,
        None => return not_found(),
    };
    if !matches!(item, "token" | "email") {
        return not_found();
    }
    let (lease, creds) = match (lease, creds) {
        (Some(lease), Some(creds)) => (lease, creds),
        _ => return unavailable(),
    };
    if account != "default" && account != creds.email {
        return not_found();
    }

    let GcpCredentials {
        access_token,
        email,
        ..
    } = creds;
    match item {
        "email" => text(StatusCode::OK, email.clone()),
        _ => {
            let expires_in = (lease.expires_at() - now).num_seconds().max(0);
            self::json(json!({
                "access_token": access_token,
                "expires_in": expires_in,
                "token_type": "Bearer",
            }))
        }
    }
}

fn with_flavor(mut rsp: Response<Body>) -> Response<Body> {
    rsp.headers_mut()
        .insert(METADATA_FLAVOR, HeaderValue::from_static(GOOGLE));
    rsp
}

fn json(body: serde_json::Value) -> Response<Body> {
    let mut rsp = Response::new(Body::from(body.to_string()));
    rsp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    rsp
}

fn text(status: StatusCode, body: impl Into<Body>) -> Response<Body> {
    let mut rsp = Response::new(body.into());
    *rsp.status_mut() = status;
    rsp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    rsp
}

fn not_found() -> Response<Body> {
    text(StatusCode::NOT_FOUND, "not found\n")
}

fn unavailable() -> Response<Body> {
    text(StatusCode::SERVICE_UNAVAILABLE, "credentials not yet available\n")
}
