//! Control-plane reconciliation
//!
//! Keeps the tailnet's declared state in line with the configured routes:
//! the advertised service-name set and the per-service serve configuration.
//! Writes are read-merge-write with ETag carry-over so concurrent operator
//! edits are not clobbered, and no-diff cases never write at all. Service
//! names are always written in sorted order to keep diffs stable.

use crate::localapi::{service_name_for_route, LocalControl, MaskedPrefs, ServeConfig};
use anyhow::Context;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info, warn};

/// Discover the tailnet's MagicDNS suffix. The control plane is
/// authoritative; a configured domain that disagrees only produces a
/// warning. An empty suffix means services cannot be configured at all.
pub async fn magic_dns_suffix(
    local: &dyn LocalControl,
    configured_domain: &str,
) -> anyhow::Result<String> {
    let status = local.status_without_peers().await.context("get status")?;
    let suffix = status.magic_dns_suffix().unwrap_or_default().to_string();

    let configured = configured_domain.trim().trim_start_matches('.');
    if !configured.is_empty() && !suffix.is_empty() && configured != suffix {
        warn!(
            configured,
            magic_dns_suffix = %suffix,
            "Configured domain does not match the tailnet's MagicDNS suffix; using the discovered value"
        );
    }

    if suffix.is_empty() {
        anyhow::bail!(
            "tailnet MagicDNS suffix is empty; cannot configure services \
             (is MagicDNS enabled and is this node fully connected?)"
        );
    }

    Ok(suffix)
}

/// Ensure every desired service name is advertised, preserving names that
/// are already present. No write is issued when the merged set equals the
/// current one.
pub async fn ensure_advertise_services(
    local: &dyn LocalControl,
    desired: &[String],
) -> anyhow::Result<()> {
    let prefs = local.get_prefs().await.context("get prefs")?;

    let mut merged: Vec<String> = prefs
        .advertise_services
        .iter()
        .chain(desired.iter())
        .cloned()
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    merged.sort();

    if merged == prefs.advertise_services {
        debug!("Advertised services already up to date");
        return Ok(());
    }

    local
        .edit_prefs(&MaskedPrefs::advertise_services(merged.clone()))
        .await
        .context("edit prefs")?;

    info!(services = ?merged, "Updated advertised services");
    Ok(())
}

/// Withdraw exactly the given service names, keeping any the operator
/// added out-of-band
pub async fn remove_advertise_services(
    local: &dyn LocalControl,
    to_remove: &[String],
) -> anyhow::Result<()> {
    let prefs = local.get_prefs().await.context("get prefs")?;

    let remove: HashSet<&str> = to_remove.iter().map(String::as_str).collect();
    let kept: Vec<String> = prefs
        .advertise_services
        .iter()
        .filter(|s| !remove.contains(s.as_str()))
        .cloned()
        .collect();

    if kept == prefs.advertise_services {
        return Ok(());
    }

    local
        .edit_prefs(&MaskedPrefs::advertise_services(kept.clone()))
        .await
        .context("edit prefs")?;

    info!(services = ?kept, "Updated advertised services (removed)");
    Ok(())
}

/// Build the serve configuration for the configured routes: each HTTPS port
/// terminates TLS and proxies to the route's loopback listener; the HTTP
/// port, when enabled, proxies to the shared redirect endpoint without TLS.
pub fn build_serve_config(
    route_ports: &BTreeMap<String, u16>,
    magic_suffix: &str,
    redirect_url: &str,
    http_port: u16,
    https_port: u16,
) -> ServeConfig {
    let mut config = ServeConfig::default();

    for (route, local_port) in route_ports {
        let service = service_name_for_route(route);
        let dns_name = format!("{}.{}", route, magic_suffix);
        let proxy_url = format!("http://127.0.0.1:{}", local_port);

        if http_port != 0 {
            config.set_web_handler(&service, &dns_name, http_port, "/", redirect_url, false);
        }
        if https_port != 0 {
            config.set_web_handler(&service, &dns_name, https_port, "/", &proxy_url, true);
        }
    }

    config
}

/// Advertise the service names and publish the serve configuration. The
/// current config's ETag is carried into the write; an unchanged config is
/// not rewritten.
pub async fn apply_serve_config(
    local: &dyn LocalControl,
    service_names: &[String],
    mut new_config: ServeConfig,
) -> anyhow::Result<()> {
    ensure_advertise_services(local, service_names).await?;

    if let Ok(current) = local.get_serve_config().await {
        if current.services == new_config.services {
            debug!("Serve config already up to date");
            return Ok(());
        }
        new_config.etag = current.etag;
    }

    local
        .set_serve_config(&new_config)
        .await
        .context("set serve config")?;

    Ok(())
}

/// Best-effort shutdown reconciliation: withdraw our service names and
/// delete our serve-config entries, leaving anything the operator added.
/// Failures are logged and ignored.
pub async fn cleanup_serve_config(local: &dyn LocalControl, service_names: &[String]) {
    if let Err(e) = remove_advertise_services(local, service_names).await {
        warn!(error = %e, "Failed to withdraw advertised services");
    }

    let mut current = match local.get_serve_config().await {
        Ok(config) => config,
        Err(e) => {
            warn!(error = %e, "Failed to fetch serve config for cleanup");
            return;
        }
    };

    let mut changed = false;
    for name in service_names {
        if current.services.remove(name).is_some() {
            changed = true;
        }
    }

    if changed {
        if let Err(e) = local.set_serve_config(&current).await {
            warn!(error = %e, "Failed to clean up serve config");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::localapi::{MaskedPrefs, Prefs, Status};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// In-memory control plane for reconciliation tests
    #[derive(Default)]
    pub(crate) struct FakeControl {
        pub status: Mutex<Status>,
        pub prefs: Mutex<Prefs>,
        pub serve: Mutex<ServeConfig>,
        pub edit_prefs_calls: AtomicUsize,
        pub set_serve_calls: AtomicUsize,
    }

    impl FakeControl {
        pub fn with_suffix(suffix: &str) -> Self {
            let fake = Self::default();
            *fake.status.lock().unwrap() = serde_json::from_str(&format!(
                r#"{{"BackendState":"Running","CurrentTailnet":{{"MagicDNSSuffix":"{}"}}}}"#,
                suffix
            ))
            .unwrap();
            fake
        }
    }

    #[async_trait]
    impl LocalControl for FakeControl {
        async fn status_without_peers(&self) -> anyhow::Result<Status> {
            Ok(self.status.lock().unwrap().clone())
        }

        async fn get_prefs(&self) -> anyhow::Result<Prefs> {
            Ok(self.prefs.lock().unwrap().clone())
        }

        async fn edit_prefs(&self, masked: &MaskedPrefs) -> anyhow::Result<Prefs> {
            self.edit_prefs_calls.fetch_add(1, Ordering::SeqCst);
            let mut prefs = self.prefs.lock().unwrap();
            if masked.advertise_services_set {
                prefs.advertise_services = masked.advertise_services.clone();
            }
            Ok(prefs.clone())
        }

        async fn get_serve_config(&self) -> anyhow::Result<ServeConfig> {
            Ok(self.serve.lock().unwrap().clone())
        }

        async fn set_serve_config(&self, config: &ServeConfig) -> anyhow::Result<()> {
            self.set_serve_calls.fetch_add(1, Ordering::SeqCst);
            *self.serve.lock().unwrap() = config.clone();
            Ok(())
        }

        async fn start_with_auth_key(&self, _auth_key: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn start_login_interactive(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_advertise_merges_sorts_and_dedups() {
        let fake = FakeControl::default();
        fake.prefs.lock().unwrap().advertise_services = names(&["svc:zeta", "svc:app"]);

        ensure_advertise_services(&fake, &names(&["svc:app", "svc:api"]))
            .await
            .unwrap();

        assert_eq!(
            fake.prefs.lock().unwrap().advertise_services,
            names(&["svc:api", "svc:app", "svc:zeta"])
        );
        assert_eq!(fake.edit_prefs_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_advertise_no_diff_short_circuit() {
        let fake = FakeControl::default();

        ensure_advertise_services(&fake, &names(&["svc:api", "svc:app"]))
            .await
            .unwrap();
        ensure_advertise_services(&fake, &names(&["svc:api", "svc:app"]))
            .await
            .unwrap();

        assert_eq!(fake.edit_prefs_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_remove_preserves_operator_services() {
        let fake = FakeControl::default();
        fake.prefs.lock().unwrap().advertise_services =
            names(&["svc:api", "svc:app", "svc:operator"]);

        remove_advertise_services(&fake, &names(&["svc:api", "svc:app"]))
            .await
            .unwrap();

        assert_eq!(
            fake.prefs.lock().unwrap().advertise_services,
            names(&["svc:operator"])
        );
    }

    #[test]
    fn test_build_serve_config_entries() {
        let mut ports = BTreeMap::new();
        ports.insert("app".to_string(), 40123u16);
        ports.insert("api".to_string(), 40456u16);

        let config = build_serve_config(&ports, "example.ts.net", "http://127.0.0.1:40999", 80, 443);

        let app = config.services.get("svc:app").unwrap();
        assert_eq!(
            app.web
                .get("app.example.ts.net:443")
                .unwrap()
                .handlers
                .get("/")
                .unwrap()
                .proxy,
            "http://127.0.0.1:40123"
        );
        assert!(app.tcp.get(&443).unwrap().https);
        assert_eq!(
            app.web
                .get("app.example.ts.net:80")
                .unwrap()
                .handlers
                .get("/")
                .unwrap()
                .proxy,
            "http://127.0.0.1:40999"
        );
        assert!(app.tcp.get(&80).unwrap().http);
        assert!(config.services.contains_key("svc:api"));
    }

    #[test]
    fn test_build_serve_config_http_disabled() {
        let mut ports = BTreeMap::new();
        ports.insert("app".to_string(), 40123u16);

        let config = build_serve_config(&ports, "example.ts.net", "http://127.0.0.1:40999", 0, 8443);

        let app = config.services.get("svc:app").unwrap();
        assert!(!app.tcp.contains_key(&80));
        assert!(app.web.keys().all(|k| k.ends_with(":8443")));
    }

    #[tokio::test]
    async fn test_apply_serve_config_carries_etag_and_short_circuits() {
        let fake = FakeControl::default();
        fake.serve.lock().unwrap().etag = Some("v1".to_string());

        let mut ports = BTreeMap::new();
        ports.insert("app".to_string(), 40123u16);
        let config = build_serve_config(&ports, "example.ts.net", "http://127.0.0.1:40999", 0, 443);
        let service_names = names(&["svc:app"]);

        apply_serve_config(&fake, &service_names, config.clone())
            .await
            .unwrap();
        assert_eq!(fake.set_serve_calls.load(Ordering::SeqCst), 1);
        assert_eq!(fake.serve.lock().unwrap().etag, Some("v1".to_string()));

        // Identical desired state: nothing written the second time
        apply_serve_config(&fake, &service_names, config)
            .await
            .unwrap();
        assert_eq!(fake.set_serve_calls.load(Ordering::SeqCst), 1);
        assert_eq!(fake.edit_prefs_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_our_entries() {
        let fake = FakeControl::default();
        fake.prefs.lock().unwrap().advertise_services = names(&["svc:app", "svc:operator"]);
        {
            let mut serve = fake.serve.lock().unwrap();
            serve.set_web_handler(
                "svc:app",
                "app.example.ts.net",
                443,
                "/",
                "http://127.0.0.1:40123",
                true,
            );
            serve.set_web_handler(
                "svc:operator",
                "operator.example.ts.net",
                443,
                "/",
                "http://127.0.0.1:50000",
                true,
            );
        }

        cleanup_serve_config(&fake, &names(&["svc:app"])).await;

        let serve = fake.serve.lock().unwrap();
        assert!(!serve.services.contains_key("svc:app"));
        assert!(serve.services.contains_key("svc:operator"));
        assert_eq!(
            fake.prefs.lock().unwrap().advertise_services,
            names(&["svc:operator"])
        );
    }

    #[tokio::test]
    async fn test_cleanup_no_entries_no_write() {
        let fake = FakeControl::default();
        cleanup_serve_config(&fake, &names(&["svc:app"])).await;
        assert_eq!(fake.set_serve_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_magic_dns_suffix_required() {
        let fake = FakeControl::with_suffix("example.ts.net");
        let suffix = magic_dns_suffix(&fake, "other.ts.net").await.unwrap();
        // Discovered value wins over the configured one
        assert_eq!(suffix, "example.ts.net");

        let empty = FakeControl::default();
        assert!(magic_dns_suffix(&empty, "").await.is_err());
    }
}
