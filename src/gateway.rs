//! Gateway orchestrator
//!
//! Assembles the node, the reconciler, and the per-route runtimes; runs
//! until a server fails or shutdown is requested; then tears everything
//! down inside a bounded deadline. Ordering matters: local listeners are
//! bound before the overlay advertises anything, so an advertised service
//! always has a live local backing listener, and teardown reverses that.

use crate::authkey::AuthApiClient;
use crate::config::Config;
use crate::localapi::LocalControl;
use crate::node::NodeHost;
use crate::reconcile;
use crate::runtime::{build_route_runtimes, RedirectServer};
use crate::transport::TransportFactory;
use anyhow::Context;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Bound on the whole shutdown sequence; past it connections are
/// force-closed so long-lived streams cannot wedge the process
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(15);

pub struct Gateway {
    config: Config,
}

impl Gateway {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run the gateway until failure or shutdown. Returns the first error
    /// observed, or `Ok(())` on a clean shutdown.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<()> {
        // Fails before anything is bound or spawned
        let routes = self.config.parsed_routes()?;

        let auth = AuthApiClient::new(&self.config)?;

        let node = NodeHost::new(&self.config.state_dir, self.config.force_cleanup);
        node.start().await.context("start overlay node")?;
        let local = node.local_client();

        let result = self
            .run_with_node(&node, &local, &auth, routes, &mut shutdown_rx)
            .await;

        node.close().await;
        result
    }

    async fn run_with_node(
        &self,
        node: &NodeHost,
        local: &dyn LocalControl,
        auth: &AuthApiClient,
        routes: Vec<crate::config::Route>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        node.bring_up(local, auth, shutdown_rx)
            .await
            .context("bring up overlay node")?;

        let magic_suffix = reconcile::magic_dns_suffix(local, &self.config.domain).await?;

        let factory = TransportFactory::from_config(&self.config);

        let redirect = RedirectServer::bind().await?;
        let redirect_url = redirect.url.clone();

        let (runtimes, route_ports, service_names) =
            build_route_runtimes(&routes, &self.config, &factory).await?;

        let configured: Vec<(String, String, String)> = runtimes
            .iter()
            .map(|rt| (rt.name.clone(), rt.service_name.clone(), rt.backend.clone()))
            .collect();

        // Servers stop on this internal channel so teardown order stays in
        // the gateway's hands for both the failure and the shutdown path.
        let (server_shutdown_tx, server_shutdown_rx) = watch::channel(false);
        let (err_tx, mut err_rx) = mpsc::channel::<(String, anyhow::Result<()>)>(runtimes.len() + 1);

        let mut servers = JoinSet::new();
        {
            let err_tx = err_tx.clone();
            let rx = server_shutdown_rx.clone();
            servers.spawn(async move {
                let result = redirect.serve(rx).await;
                let _ = err_tx.send(("redirect".to_string(), result)).await;
            });
        }
        for rt in runtimes {
            let err_tx = err_tx.clone();
            let rx = server_shutdown_rx.clone();
            let name = rt.name.clone();
            servers.spawn(async move {
                let result = rt.serve(rx).await;
                let _ = err_tx.send((name, result)).await;
            });
        }
        drop(err_tx);

        // Advertise only after every local listener is bound
        let startup = async {
            let serve_config = reconcile::build_serve_config(
                &route_ports,
                &magic_suffix,
                &redirect_url,
                self.config.http_port,
                self.config.https_port,
            );
            reconcile::apply_serve_config(local, &service_names, serve_config).await
        }
        .await;

        let mut failure: Option<anyhow::Error> = match startup {
            Ok(()) => {
                for (name, service, backend) in &configured {
                    info!(
                        service = %service,
                        fqdn = %format!("{}.{}", name, magic_suffix),
                        http_port = self.config.http_port,
                        https_port = self.config.https_port,
                        backend = %backend,
                        "Service configured"
                    );
                }
                None
            }
            Err(e) => Some(e),
        };

        if failure.is_none() {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    info!("Shutdown requested; stopping");
                }
                msg = err_rx.recv() => {
                    failure = Some(match msg {
                        Some((name, Ok(()))) => {
                            anyhow::anyhow!("{} server stopped unexpectedly", name)
                        }
                        Some((name, Err(e))) => e.context(format!("{} server failed", name)),
                        None => anyhow::anyhow!("all servers stopped unexpectedly"),
                    });
                }
            }
        }

        // Bounded teardown on a fresh deadline so cleanup itself is not
        // subject to the cancelled root context
        let deadline = tokio::time::Instant::now() + SHUTDOWN_DEADLINE;

        if tokio::time::timeout_at(
            deadline,
            reconcile::cleanup_serve_config(local, &service_names),
        )
        .await
        .is_err()
        {
            warn!("Serve-config cleanup did not finish before the shutdown deadline");
        }

        let _ = server_shutdown_tx.send(true);

        let drained = tokio::time::timeout_at(deadline, async {
            while servers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                deadline_secs = SHUTDOWN_DEADLINE.as_secs(),
                "Graceful shutdown deadline exceeded; forcing close"
            );
            servers.abort_all();
            while servers.join_next().await.is_some() {}
            if failure.is_none() {
                failure = Some(anyhow::anyhow!("graceful shutdown deadline exceeded"));
            }
        }

        // Drain any remaining serve results; during shutdown an Ok exit is
        // expected, an Err still surfaces
        while let Ok((name, result)) = err_rx.try_recv() {
            if let Err(e) = result {
                if failure.is_none() {
                    failure = Some(e.context(format!("{} server failed", name)));
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
