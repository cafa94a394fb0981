use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Tailnet domain the routes are expected to live under (informational;
    /// the MagicDNS suffix discovered from the node is authoritative)
    #[serde(default)]
    pub domain: String,

    /// HTTP port advertised per service (default: 80, set to 0 to disable
    /// the HTTP-to-HTTPS redirect path)
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// HTTPS port advertised per service (default: 443)
    #[serde(default = "default_https_port")]
    pub https_port: u16,

    /// Routes in `name=backend_url` form
    #[serde(default)]
    pub routes: Vec<String>,

    /// Tag assigned to issued auth keys and devices (default: tsgw;
    /// the `tag:` prefix is added if absent)
    #[serde(default = "default_tag")]
    pub tag: String,

    /// Directory for the overlay node's persistent state. Losing it loses
    /// the device registration.
    #[serde(default = "default_state_dir")]
    pub state_dir: String,

    /// Delete the state directory before starting (forces re-registration)
    #[serde(default)]
    pub force_cleanup: bool,

    /// Skip TLS certificate verification for HTTPS backends
    #[serde(default)]
    pub skip_tls_verify: bool,

    /// Backend connect timeout in seconds (default: 30)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Per-request timeout in seconds (default: 0 = disabled, recommended
    /// for long-lived streams)
    #[serde(default)]
    pub request_timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format ("console" or "json")
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// OAuth client credentials for the control-plane API
    #[serde(default)]
    pub oauth: OauthConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct OauthConfig {
    /// OAuth client ID
    #[serde(default)]
    pub client_id: String,

    /// OAuth client secret
    #[serde(default)]
    pub client_secret: String,

    /// OAuth issuer URL (defaults to the Tailscale control plane)
    pub issuer: Option<String>,
}

/// A single declared route: a short service name and its private backend.
/// Immutable after startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Lowercase DNS-label-safe name; becomes `svc:<name>` on the overlay
    pub name: String,
    /// Backend URL, `http://` or `https://`
    pub backend: String,
}

fn default_http_port() -> u16 {
    80
}

fn default_https_port() -> u16 {
    443
}

fn default_tag() -> String {
    "tsgw".to_string()
}

fn default_state_dir() -> String {
    "./tsgw-state".to_string()
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "console".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration, collecting every error before failing
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.oauth.client_id.is_empty() {
            errors.push("oauth.client_id is required".to_string());
        }
        if self.oauth.client_secret.is_empty() {
            errors.push("oauth.client_secret is required".to_string());
        }
        if self.routes.is_empty() {
            errors.push("at least one route is required".to_string());
        }
        if self.https_port == 0 {
            errors.push("https_port must be greater than 0".to_string());
        }
        if let Err(e) = self.parsed_routes() {
            errors.push(e.to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    /// Parse and validate the declared routes. Names are forced to
    /// lowercase; duplicates are a fatal configuration error.
    pub fn parsed_routes(&self) -> anyhow::Result<Vec<Route>> {
        parse_routes(&self.routes)
    }

    /// The device tag, with the `tag:` prefix ensured
    pub fn ts_tag(&self) -> String {
        if self.tag.starts_with("tag:") {
            self.tag.clone()
        } else {
            format!("tag:{}", self.tag)
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Per-request timeout; `None` means no deadline
    pub fn request_timeout(&self) -> Option<Duration> {
        if self.request_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.request_timeout_secs))
        }
    }
}

/// Parse route specs in `name=backend_url` form
pub fn parse_routes(specs: &[String]) -> anyhow::Result<Vec<Route>> {
    let mut routes = Vec::with_capacity(specs.len());
    let mut seen = HashSet::new();
    let mut errors = Vec::new();

    for spec in specs {
        let Some((name, backend)) = spec.split_once('=') else {
            errors.push(format!(
                "invalid route '{}', expected 'name=backend_url'",
                spec
            ));
            continue;
        };

        let name = name.trim().to_lowercase();
        let backend = backend.trim().to_string();

        if let Err(e) = validate_route_name(&name) {
            errors.push(format!("route '{}': {}", spec, e));
            continue;
        }
        if !backend.starts_with("http://") && !backend.starts_with("https://") {
            errors.push(format!(
                "route '{}': backend must start with http:// or https://",
                name
            ));
            continue;
        }
        if !seen.insert(name.clone()) {
            errors.push(format!("duplicate route '{}'", name));
            continue;
        }

        routes.push(Route { name, backend });
    }

    if !errors.is_empty() {
        anyhow::bail!("route parsing errors: {}", errors.join("; "));
    }

    Ok(routes)
}

/// Route names become DNS labels on the overlay, so they must be valid ones
fn validate_route_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("name is empty".to_string());
    }
    if name.len() > 63 {
        return Err("name exceeds 63 characters".to_string());
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err("name must not start or end with '-'".to_string());
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err("name must contain only [a-z0-9-]".to_string());
    }
    Ok(())
}

/// Mask a secret for logging: values longer than 8 bytes are truncated to
/// the first 8 followed by `...`. Lossy decoding keeps the cut safe when it
/// lands inside a multibyte character.
pub fn mask_secret(s: &str) -> String {
    if s.len() <= 8 {
        s.to_string()
    } else {
        format!("{}...", String::from_utf8_lossy(&s.as_bytes()[..8]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        toml::from_str(
            r#"
domain = "example.ts.net"
routes = ["app=http://127.0.0.1:8080"]

[oauth]
client_id = "kClientId12345"
client_secret = "tskey-client-secret"
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_parse_config_defaults() {
        let config = valid_config();
        assert_eq!(config.http_port, 80);
        assert_eq!(config.https_port, 443);
        assert_eq!(config.tag, "tsgw");
        assert_eq!(config.state_dir, "./tsgw-state");
        assert_eq!(config.connect_timeout_secs, 30);
        assert_eq!(config.request_timeout_secs, 0);
        assert!(!config.skip_tls_verify);
        assert!(!config.force_cleanup);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_routes() {
        let routes = parse_routes(&[
            "app=http://127.0.0.1:8080".to_string(),
            "API=https://10.0.0.2:8443".to_string(),
        ])
        .unwrap();

        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].name, "app");
        assert_eq!(routes[0].backend, "http://127.0.0.1:8080");
        // Names are forced to lowercase
        assert_eq!(routes[1].name, "api");
    }

    #[test]
    fn test_duplicate_route_is_fatal() {
        let err = parse_routes(&[
            "app=http://127.0.0.1:8080".to_string(),
            "app=http://127.0.0.1:9090".to_string(),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("duplicate route 'app'"));
    }

    #[test]
    fn test_backend_scheme_required() {
        let err = parse_routes(&["app=127.0.0.1:8080".to_string()]).unwrap_err();
        assert!(err.to_string().contains("http:// or https://"));
    }

    #[test]
    fn test_route_name_must_be_dns_label() {
        assert!(parse_routes(&["my_app=http://127.0.0.1:1".to_string()]).is_err());
        assert!(parse_routes(&["-app=http://127.0.0.1:1".to_string()]).is_err());
        assert!(parse_routes(&["=http://127.0.0.1:1".to_string()]).is_err());
        assert!(parse_routes(&["a.b=http://127.0.0.1:1".to_string()]).is_err());
        assert!(parse_routes(&["app-2=http://127.0.0.1:1".to_string()]).is_ok());
    }

    #[test]
    fn test_missing_credentials_rejected() {
        let config: Config = toml::from_str(
            r#"
routes = ["app=http://127.0.0.1:8080"]
"#,
        )
        .unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("client_id"));
        assert!(err.contains("client_secret"));
    }

    #[test]
    fn test_tag_prefix() {
        let mut config = valid_config();
        assert_eq!(config.ts_tag(), "tag:tsgw");
        config.tag = "tag:edge".to_string();
        assert_eq!(config.ts_tag(), "tag:edge");
    }

    #[test]
    fn test_request_timeout_zero_disables() {
        let mut config = valid_config();
        assert_eq!(config.request_timeout(), None);
        config.request_timeout_secs = 30;
        assert_eq!(config.request_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_mask_secret() {
        assert_eq!(mask_secret(""), "");
        assert_eq!(mask_secret("short"), "short");
        assert_eq!(mask_secret("12345678"), "12345678");
        assert_eq!(mask_secret("123456789"), "12345678...");
        assert_eq!(mask_secret("kClientId12345"), "kClientI...");
    }

    #[test]
    fn test_mask_secret_multibyte_boundary() {
        // Byte 8 falls inside the two-byte 'é'; must not panic
        let masked = mask_secret("1234567é89");
        assert!(masked.starts_with("1234567"));
        assert!(masked.ends_with("..."));
    }
}
