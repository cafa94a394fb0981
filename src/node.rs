//! Overlay node host
//!
//! Owns the node's persistent state directory and the overlay daemon bound
//! to it, supervised as a child process with its control socket inside the
//! state directory. Bring-up is opportunistic: start against existing state
//! and only issue a fresh auth key when the node reports `NeedsLogin`, so
//! the device identity survives restarts.

use crate::authkey::AuthApiClient;
use crate::localapi::{BackendState, LocalApiClient, LocalControl, Status};
use anyhow::Context;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, trace, warn};

/// Daemon binary expected on PATH
const DAEMON_BIN: &str = "tailscaled";

/// Poll interval while waiting for the node to come up
const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Bound on waiting for the daemon's control socket after spawn
const SOCKET_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound on confirming end-to-end connectivity once Running
const UP_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace period between SIGTERM and SIGKILL at node close
const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// The single embedded overlay node hosting every route's service
pub struct NodeHost {
    state_dir: PathBuf,
    socket_path: PathBuf,
    force_cleanup: bool,
    child: Mutex<Option<Child>>,
}

impl NodeHost {
    pub fn new(state_dir: impl Into<PathBuf>, force_cleanup: bool) -> Self {
        let state_dir = state_dir.into();
        let socket_path = state_dir.join("tailscaled.sock");
        Self {
            state_dir,
            socket_path,
            force_cleanup,
            child: Mutex::new(None),
        }
    }

    /// Local-control client bound to this node's socket
    pub fn local_client(&self) -> LocalApiClient {
        LocalApiClient::new(&self.socket_path)
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Spawn the overlay daemon against the state directory and wait for
    /// its control socket to accept connections.
    pub async fn start(&self) -> anyhow::Result<()> {
        if self.force_cleanup {
            warn!(dir = %self.state_dir.display(), "Force cleanup enabled; removing node state directory");
            match std::fs::remove_dir_all(&self.state_dir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("remove state dir {}", self.state_dir.display())
                    });
                }
            }
        }

        std::fs::create_dir_all(&self.state_dir)
            .with_context(|| format!("create state dir {}", self.state_dir.display()))?;

        let state_file = self.state_dir.join("tailscaled.state");

        let mut cmd = Command::new(DAEMON_BIN);
        cmd.arg(format!("--state={}", state_file.display()))
            .arg(format!("--socket={}", self.socket_path.display()))
            .arg(format!("--statedir={}", self.state_dir.display()))
            .arg("--tun=userspace-networking")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn {} (is it on PATH?)", DAEMON_BIN))?;
        let pid = child.id().unwrap_or(0);
        info!(pid, dir = %self.state_dir.display(), "Overlay node daemon spawned");

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(source = "node", "{}", line);
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    trace!(source = "node", "{}", line);
                }
            });
        }

        *self.child.lock().await = Some(child);

        if let Err(e) = self.wait_for_socket().await {
            self.close().await;
            return Err(e);
        }

        Ok(())
    }

    async fn wait_for_socket(&self) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + SOCKET_WAIT_TIMEOUT;
        loop {
            if tokio::net::UnixStream::connect(&self.socket_path).await.is_ok() {
                debug!(socket = %self.socket_path.display(), "Node control socket is up");
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!(
                    "node control socket {} did not come up within {:?}",
                    self.socket_path.display(),
                    SOCKET_WAIT_TIMEOUT
                );
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Drive the node to `Running`: poll status once a second, issue an
    /// auth key and log in at most once per bring-up when the node reports
    /// `NeedsLogin`, then confirm connectivity. The node is closed before
    /// returning any error.
    pub async fn bring_up(
        &self,
        local: &dyn LocalControl,
        auth: &AuthApiClient,
        shutdown: &mut watch::Receiver<bool>,
    ) -> anyhow::Result<Status> {
        match self.bring_up_inner(local, auth, shutdown).await {
            Ok(status) => Ok(status),
            Err(e) => {
                self.close().await;
                Err(e)
            }
        }
    }

    async fn bring_up_inner(
        &self,
        local: &dyn LocalControl,
        auth: &AuthApiClient,
        shutdown: &mut watch::Receiver<bool>,
    ) -> anyhow::Result<Status> {
        let mut login_done = false;

        loop {
            let status = local
                .status_without_peers()
                .await
                .context("get status from local control")?;

            match status.state() {
                BackendState::Running => {
                    debug!("Overlay node is running");
                    break;
                }
                BackendState::NeedsLogin if !login_done => {
                    let key = auth.create_auth_key("tsgw").await?;

                    info!("Logging in with new auth key");
                    local
                        .start_with_auth_key(&key)
                        .await
                        .map_err(with_device_scope_hint)
                        .context("authenticate with new auth key")?;
                    local
                        .start_login_interactive()
                        .await
                        .context("start interactive login")?;
                    login_done = true;
                }
                state => {
                    trace!(?state, "Waiting for overlay node");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(STATUS_POLL_INTERVAL) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        anyhow::bail!("node bring-up cancelled");
                    }
                }
            }
        }

        self.up(local).await
    }

    /// Confirm end-to-end connectivity after the backend reports Running
    async fn up(&self, local: &dyn LocalControl) -> anyhow::Result<Status> {
        let confirm = async {
            loop {
                let status = local.status_without_peers().await?;
                if status.state() == BackendState::Running && status.magic_dns_suffix().is_some() {
                    return anyhow::Ok(status);
                }
                tokio::time::sleep(STATUS_POLL_INTERVAL).await;
            }
        };

        tokio::time::timeout(UP_TIMEOUT, confirm)
            .await
            .map_err(|_| anyhow::anyhow!("node did not confirm connectivity within {:?}", UP_TIMEOUT))?
            .map_err(with_device_scope_hint)
    }

    /// Stop the daemon: SIGTERM, bounded wait, then SIGKILL
    pub async fn close(&self) {
        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };

        if let Some(pid) = child.id() {
            info!(pid, "Stopping overlay node daemon");
            #[cfg(unix)]
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
            #[cfg(not(unix))]
            {
                let _ = child.start_kill();
            }
        }

        match tokio::time::timeout(STOP_GRACE_PERIOD, child.wait()).await {
            Ok(Ok(status)) => {
                info!(?status, "Overlay node daemon exited");
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Error waiting for node daemon to exit");
            }
            Err(_) => {
                warn!(
                    grace_secs = STOP_GRACE_PERIOD.as_secs(),
                    "Grace period exceeded, killing node daemon"
                );
                let _ = child.kill().await;
            }
        }
    }
}

/// Attach the actionable hint for the common misconfiguration where the
/// OAuth client cannot authenticate devices
fn with_device_scope_hint(err: anyhow::Error) -> anyhow::Error {
    // Match against the whole chain; the backend's message sits below our
    // own context layers.
    if format!("{:#}", err).contains("key cannot be used for node auth") {
        err.context(
            "the OAuth client cannot authenticate nodes; enable the 'Devices' \
             scope for it in the admin console",
        )
    } else {
        err
    }
}
