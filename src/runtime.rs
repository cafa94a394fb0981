//! Local serving runtime
//!
//! Every route gets a loopback listener on an ephemeral port with an HTTP
//! server bound to its proxy; the overlay terminates TLS per service and
//! forwards to these listeners. A single shared redirect server answers the
//! plain-HTTP side of every service with a 308 to the HTTPS URL.

use crate::config::{Config, Route};
use crate::error::{full_body, ProxyBody};
use crate::localapi::service_name_for_route;
use crate::route_proxy::RouteProxy;
use crate::transport::TransportFactory;
use anyhow::Context;
use hyper::body::Incoming;
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

const READ_HEADER_TIMEOUT: Duration = Duration::from_secs(10);

/// The live serving state for one route: its loopback listener and the
/// proxy behind it, co-terminous in lifetime with the gateway
#[derive(Debug)]
pub struct RouteRuntime {
    pub name: String,
    pub service_name: String,
    pub backend: String,
    pub port: u16,
    listener: TcpListener,
    proxy: Arc<RouteProxy>,
}

/// Build a runtime per declared route. Listeners bound so far are closed
/// on the way out of any failure (dropping them closes the sockets).
pub async fn build_route_runtimes(
    routes: &[Route],
    config: &Config,
    factory: &TransportFactory,
) -> anyhow::Result<(Vec<RouteRuntime>, BTreeMap<String, u16>, Vec<String>)> {
    let mut runtimes = Vec::with_capacity(routes.len());
    let mut route_ports = BTreeMap::new();
    let mut service_names = Vec::with_capacity(routes.len());

    for route in routes {
        let proxy = RouteProxy::new(&route.name, &route.backend, config, factory)
            .with_context(|| format!("route {}: create proxy", route.name))?;

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .with_context(|| format!("route {}: bind loopback listener", route.name))?;
        let port = listener
            .local_addr()
            .with_context(|| format!("route {}: listener address", route.name))?
            .port();

        route_ports.insert(route.name.clone(), port);
        service_names.push(service_name_for_route(&route.name));
        runtimes.push(RouteRuntime {
            name: route.name.clone(),
            service_name: service_name_for_route(&route.name),
            backend: route.backend.clone(),
            port,
            listener,
            proxy: Arc::new(proxy),
        });
    }

    service_names.sort();

    Ok((runtimes, route_ports, service_names))
}

impl RouteRuntime {
    /// Accept and serve connections until shutdown is signalled, then drain
    /// in-flight connections. Callers bound the drain with their shutdown
    /// deadline and abort on expiry.
    pub async fn serve(self, shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<()> {
        info!(
            route = %self.name,
            port = self.port,
            backend = %self.backend,
            "Route listener serving"
        );

        let proxy = self.proxy;
        serve_loop(self.listener, shutdown_rx, move |remote| {
            let proxy = Arc::clone(&proxy);
            service_fn(move |req: Request<Incoming>| {
                let proxy = Arc::clone(&proxy);
                async move { Ok::<_, Infallible>(proxy.handle(req, remote).await) }
            })
        })
        .await
    }
}

/// Shared redirect endpoint: answers any plain-HTTP request with a 308 to
/// the HTTPS URL for the same host, path, and query
pub struct RedirectServer {
    listener: TcpListener,
    pub url: String,
}

impl RedirectServer {
    pub async fn bind() -> anyhow::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("bind redirect listener")?;
        let port = listener.local_addr().context("redirect address")?.port();
        Ok(Self {
            listener,
            url: format!("http://127.0.0.1:{}", port),
        })
    }

    pub async fn serve(self, shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<()> {
        info!(url = %self.url, "Redirect listener serving");

        serve_loop(self.listener, shutdown_rx, move |_remote| {
            service_fn(|req: Request<Incoming>| async move {
                Ok::<_, Infallible>(redirect_response(&req))
            })
        })
        .await
    }
}

/// Build the `308 Permanent Redirect` to the HTTPS URL, preserving the
/// inbound host, path, and query
fn redirect_response<B>(req: &Request<B>) -> Response<ProxyBody> {
    let host = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .unwrap_or("localhost");

    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let location = format!("https://{}{}", host, path_and_query);

    let mut response = Response::builder()
        .status(StatusCode::PERMANENT_REDIRECT)
        .body(full_body(""))
        .expect("valid response with static parts");
    if let Ok(value) = HeaderValue::from_str(&location) {
        response
            .headers_mut()
            .insert(hyper::header::LOCATION, value);
    }
    response
}

/// Accept loop shared by route and redirect servers: spawn one task per
/// connection, stop accepting on shutdown, then wait for in-flight
/// connections to finish their graceful shutdown.
async fn serve_loop<F, S>(
    listener: TcpListener,
    mut shutdown_rx: watch::Receiver<bool>,
    make_service: F,
) -> anyhow::Result<()>
where
    F: Fn(SocketAddr) -> S,
    S: hyper::service::Service<
            Request<Incoming>,
            Response = Response<ProxyBody>,
            Error = Infallible,
        > + Send
        + 'static,
    S::Future: Send + 'static,
{
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, remote)) => {
                        let service = make_service(remote);
                        let conn_shutdown = shutdown_rx.clone();
                        connections.spawn(serve_connection(stream, service, conn_shutdown));
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
            changed = shutdown_rx.changed() => {
                // A dropped sender counts as a shutdown request
                if changed.is_err() || *shutdown_rx.borrow() {
                    debug!("Listener shutting down");
                    break;
                }
            }
        }
    }

    // If the caller aborts us past its deadline, dropping the JoinSet
    // force-closes every remaining connection.
    while connections.join_next().await.is_some() {}

    Ok(())
}

/// Serve a single connection with HTTP/1.1 + HTTP/2 and upgrade support,
/// switching to a keep-alive-disabling graceful shutdown when signalled
async fn serve_connection<S>(stream: TcpStream, service: S, mut shutdown_rx: watch::Receiver<bool>)
where
    S: hyper::service::Service<
            Request<Incoming>,
            Response = Response<ProxyBody>,
            Error = Infallible,
        > + Send
        + 'static,
    S::Future: Send + 'static,
{
    let io = TokioIo::new(stream);

    let mut builder = AutoBuilder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(READ_HEADER_TIMEOUT)
        .preserve_header_case(true);

    let conn = builder.serve_connection_with_upgrades(io, service);
    tokio::pin!(conn);

    loop {
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    debug!(error = %e, "Connection ended with error");
                }
                return;
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    // Stops accepting new requests on the connection and
                    // finishes the in-flight ones
                    conn.as_mut().graceful_shutdown();
                    break;
                }
            }
        }
    }

    if let Err(e) = conn.await {
        debug!(error = %e, "Connection ended with error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redirect_preserves_host_path_query() {
        let req = Request::builder()
            .uri("/a/b?x=1&y=2")
            .header("host", "app.example.ts.net:80")
            .body(())
            .unwrap();

        let response = redirect_response(&req);
        assert_eq!(response.status(), StatusCode::PERMANENT_REDIRECT);
        assert_eq!(
            response.headers().get("location").unwrap(),
            "https://app.example.ts.net:80/a/b?x=1&y=2"
        );
    }

    #[test]
    fn test_redirect_host_fallback() {
        let req = Request::builder().uri("/p").body(()).unwrap();
        let response = redirect_response(&req);
        assert_eq!(
            response.headers().get("location").unwrap(),
            "https://localhost/p"
        );
    }

    #[tokio::test]
    async fn test_build_route_runtimes_binds_each_route() {
        let config: Config = toml::from_str(
            r#"
routes = ["app=http://127.0.0.1:18080", "api=http://127.0.0.1:18081"]

[oauth]
client_id = "id"
client_secret = "secret"
"#,
        )
        .unwrap();
        let factory = TransportFactory::from_config(&config);
        let routes = config.parsed_routes().unwrap();

        let (runtimes, ports, service_names) =
            build_route_runtimes(&routes, &config, &factory).await.unwrap();

        assert_eq!(runtimes.len(), 2);
        assert_eq!(ports.len(), 2);
        assert!(ports.values().all(|p| *p > 0));
        // Service names come out sorted
        assert_eq!(service_names, vec!["svc:api", "svc:app"]);
        for rt in &runtimes {
            assert_eq!(rt.service_name, format!("svc:{}", rt.name));
            assert_eq!(ports[&rt.name], rt.port);
        }
    }

    #[tokio::test]
    async fn test_bad_backend_fails_before_binding() {
        let config: Config = toml::from_str(
            r#"
routes = ["app=http://127.0.0.1:18080"]

[oauth]
client_id = "id"
client_secret = "secret"
"#,
        )
        .unwrap();
        let factory = TransportFactory::from_config(&config);
        let routes = vec![Route {
            name: "bad".to_string(),
            backend: "http://[::1:80/".to_string(),
        }];

        let err = build_route_runtimes(&routes, &config, &factory)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("create proxy"));
    }
}
