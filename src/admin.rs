use anyhow::{Context, Result};
use futures::{future, prelude::*};
use hyper::{
    header::{HeaderValue, CONTENT_TYPE},
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, StatusCode,
};
use std::{convert::Infallible, net::SocketAddr};
use tokio::sync::watch;
use tracing::info;

/// Serves liveness and readiness probes until `drain` is signaled.
pub async fn serve(addr: SocketAddr, ready: watch::Receiver<bool>, drain: drain::Watch) -> Result<()> {
    let make_svc = make_service_fn(move |_| {
        let ready = ready.clone();
        future::ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
            let rsp = respond(&req, *ready.borrow());
            future::ok::<_, Infallible>(rsp)
        }))
    });

    let server = hyper::Server::try_bind(&addr)
        .with_context(|| format!("binding {}", addr))?
        .serve(make_svc)
        .with_graceful_shutdown(drain.clone().signaled().map(|_release| ()));
    info!(%addr, "Serving probes");
    drain
        .ignore_signaled()
        .release_after(server)
        .await
        .context("serving probes")
}

fn respond(req: &Request<Body>, ready: bool) -> Response<Body> {
    if req.method() != Method::GET {
        return text(StatusCode::METHOD_NOT_ALLOWED, "method not allowed\n");
    }
    match req.uri().path() {
        "/live" => text(StatusCode::OK, "live\n"),
        "/ready" if ready => text(StatusCode::OK, "ready\n"),
        "/ready" => text(StatusCode::SERVICE_UNAVAILABLE, "not ready\n"),
        _ => text(StatusCode::NOT_FOUND, "not found\n"),
    }
}

fn text(status: StatusCode, body: &'static str) -> Response<Body> {
    let mut rsp = Response::new(Body::from(body));
    *rsp.status_mut() = status;
    rsp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    rsp
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get(path: &str) -> Request<Body> {
        Request::get(path).body(Body::empty()).unwrap()
    }

    #[test]
    fn probes() {
        assert_eq!(respond(&get("/live"), false).status(), StatusCode::OK);
        assert_eq!(
            respond(&get("/ready"), false).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(respond(&get("/ready"), true).status(), StatusCode::OK);
        assert_eq!(respond(&get("/metrics"), true).status(), StatusCode::NOT_FOUND);
        let post = Request::post("/live").body(Body::empty()).unwrap();
        assert_eq!(
            respond(&post, true).status(),
            StatusCode::METHOD_NOT_ALLOWED
        );
    }

    #[tokio::test]
    async fn stops_on_drain() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (_ready_tx, ready_rx) = watch::channel(false);
        let (signal, watch) = drain::channel();
        let task = tokio::spawn(serve(addr, ready_rx, watch));
        signal.drain().await;
        task.await.unwrap().unwrap();
    }
}
