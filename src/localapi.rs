//! Local-control interface to the overlay node
//!
//! The gateway observes and configures its node exclusively through the
//! daemon's local API. [`LocalControl`] is the subset of that surface the
//! gateway consumes; [`LocalApiClient`] is the production implementation,
//! speaking HTTP over the daemon's Unix socket.

use anyhow::Context as _;
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::HeaderValue;
use hyper::{HeaderMap, Method, Request, StatusCode, Uri};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::net::UnixStream;
use tracing::debug;

/// Host value the daemon expects on local API requests
const LOCAL_API_HOST: &str = "local-tailscaled.sock";

/// Node backend state as reported by the status endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendState {
    NoState,
    NeedsLogin,
    Starting,
    Running,
    Stopped,
    /// States this gateway has no special handling for (e.g. transient
    /// intermediate states); treated like `Starting`
    Other(String),
}

impl From<&str> for BackendState {
    fn from(s: &str) -> Self {
        match s {
            "NoState" => BackendState::NoState,
            "NeedsLogin" => BackendState::NeedsLogin,
            "Starting" => BackendState::Starting,
            "Running" => BackendState::Running,
            "Stopped" => BackendState::Stopped,
            other => BackendState::Other(other.to_string()),
        }
    }
}

/// Subset of the node status the gateway reads
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Status {
    #[serde(rename = "BackendState", default)]
    pub backend_state: String,

    #[serde(rename = "CurrentTailnet", default)]
    pub current_tailnet: Option<CurrentTailnet>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CurrentTailnet {
    #[serde(rename = "MagicDNSSuffix", default)]
    pub magic_dns_suffix: String,
}

impl Status {
    pub fn state(&self) -> BackendState {
        BackendState::from(self.backend_state.as_str())
    }

    /// The tailnet's MagicDNS suffix, if the node knows it yet
    pub fn magic_dns_suffix(&self) -> Option<&str> {
        self.current_tailnet
            .as_ref()
            .map(|t| t.magic_dns_suffix.as_str())
            .filter(|s| !s.is_empty())
    }
}

/// Node preferences (the slice the gateway reads and edits)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Prefs {
    #[serde(rename = "AdvertiseServices", default)]
    pub advertise_services: Vec<String>,
}

/// A masked preferences edit: only the fields whose `*Set` flag is true are
/// applied by the daemon
#[derive(Debug, Clone, Serialize)]
pub struct MaskedPrefs {
    #[serde(rename = "AdvertiseServices")]
    pub advertise_services: Vec<String>,
    #[serde(rename = "AdvertiseServicesSet")]
    pub advertise_services_set: bool,
}

impl MaskedPrefs {
    pub fn advertise_services(services: Vec<String>) -> Self {
        Self {
            advertise_services: services,
            advertise_services_set: true,
        }
    }
}

/// Per-service serve configuration: how inbound traffic on each
/// (host, port) pair is terminated and proxied
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServeConfig {
    #[serde(rename = "Services", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub services: BTreeMap<String, ServiceConfig>,

    /// Optimistic-concurrency tag carried between get and set; transported
    /// in headers, not the body
    #[serde(skip)]
    pub etag: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(rename = "TCP", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tcp: BTreeMap<u16, TcpPortHandler>,

    #[serde(rename = "Web", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub web: BTreeMap<String, WebServerConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TcpPortHandler {
    #[serde(rename = "HTTPS", default, skip_serializing_if = "std::ops::Not::not")]
    pub https: bool,

    #[serde(rename = "HTTP", default, skip_serializing_if = "std::ops::Not::not")]
    pub http: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WebServerConfig {
    #[serde(rename = "Handlers", default)]
    pub handlers: BTreeMap<String, HttpHandler>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpHandler {
    #[serde(rename = "Proxy", default, skip_serializing_if = "String::is_empty")]
    pub proxy: String,
}

impl ServeConfig {
    /// Declare a web handler for a service: terminate on `port` (TLS or
    /// plain per `use_tls`) for `<dns_name>:<port>` and proxy `mount_path`
    /// to `proxy_url`.
    pub fn set_web_handler(
        &mut self,
        service: &str,
        dns_name: &str,
        port: u16,
        mount_path: &str,
        proxy_url: &str,
        use_tls: bool,
    ) {
        let svc = self.services.entry(service.to_string()).or_default();

        svc.tcp.insert(
            port,
            TcpPortHandler {
                https: use_tls,
                http: !use_tls,
            },
        );

        svc.web
            .entry(format!("{}:{}", dns_name, port))
            .or_default()
            .handlers
            .insert(
                mount_path.to_string(),
                HttpHandler {
                    proxy: proxy_url.to_string(),
                },
            );
    }
}

/// Derive the overlay service name for a route
pub fn service_name_for_route(route: &str) -> String {
    format!("svc:{}", route)
}

/// The local-control operations the gateway consumes from the overlay node
#[async_trait]
pub trait LocalControl: Send + Sync {
    async fn status_without_peers(&self) -> anyhow::Result<Status>;
    async fn get_prefs(&self) -> anyhow::Result<Prefs>;
    async fn edit_prefs(&self, masked: &MaskedPrefs) -> anyhow::Result<Prefs>;
    async fn get_serve_config(&self) -> anyhow::Result<ServeConfig>;
    async fn set_serve_config(&self, config: &ServeConfig) -> anyhow::Result<()>;
    /// Restart the node's login flow with a fresh auth key
    async fn start_with_auth_key(&self, auth_key: &str) -> anyhow::Result<()>;
    async fn start_login_interactive(&self) -> anyhow::Result<()>;
}

/// Connector that routes every request to a fixed Unix socket; lets the
/// standard pooled client speak HTTP over UDS.
#[derive(Clone)]
struct UnixConnector {
    socket_path: PathBuf,
}

impl tower::Service<Uri> for UnixConnector {
    type Response = TokioIo<UnixStream>;
    type Error = std::io::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _uri: Uri) -> Self::Future {
        let path = self.socket_path.clone();
        Box::pin(async move {
            let stream = UnixStream::connect(&path).await?;
            Ok(TokioIo::new(stream))
        })
    }
}

/// Local API client over the daemon's Unix socket
pub struct LocalApiClient {
    client: Client<UnixConnector, Full<Bytes>>,
    socket_path: PathBuf,
}

impl LocalApiClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        let socket_path = socket_path.into();
        let client = Client::builder(TokioExecutor::new()).build(UnixConnector {
            socket_path: socket_path.clone(),
        });
        Self {
            client,
            socket_path,
        }
    }

    pub fn socket_path(&self) -> &PathBuf {
        &self.socket_path
    }

    async fn request(
        &self,
        method: Method,
        path_and_query: &str,
        body: Option<Bytes>,
        if_match: Option<&str>,
    ) -> anyhow::Result<(StatusCode, HeaderMap, Bytes)> {
        let uri: Uri = format!("http://{}{}", LOCAL_API_HOST, path_and_query)
            .parse()
            .context("build local API URI")?;

        let mut builder = Request::builder()
            .method(method.clone())
            .uri(uri)
            .header(hyper::header::HOST, LOCAL_API_HOST);
        if body.is_some() {
            builder = builder.header(hyper::header::CONTENT_TYPE, "application/json");
        }
        if let Some(etag) = if_match {
            builder = builder.header(
                hyper::header::IF_MATCH,
                HeaderValue::from_str(etag).context("serve-config etag header")?,
            );
        }

        let request = builder
            .body(Full::new(body.unwrap_or_default()))
            .context("build local API request")?;

        debug!(method = %method, path = path_and_query, "Local API request");

        let response = self
            .client
            .request(request)
            .await
            .with_context(|| format!("local API {} {}", method, path_and_query))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .into_body()
            .collect()
            .await
            .context("read local API response")?
            .to_bytes();

        if !status.is_success() {
            anyhow::bail!(
                "local API {} {}: {} {}",
                method,
                path_and_query,
                status,
                String::from_utf8_lossy(&body)
            );
        }

        Ok((status, headers, body))
    }
}

#[async_trait]
impl LocalControl for LocalApiClient {
    async fn status_without_peers(&self) -> anyhow::Result<Status> {
        let (_, _, body) = self
            .request(Method::GET, "/localapi/v0/status?peers=false", None, None)
            .await?;
        serde_json::from_slice(&body).context("decode status")
    }

    async fn get_prefs(&self) -> anyhow::Result<Prefs> {
        let (_, _, body) = self
            .request(Method::GET, "/localapi/v0/prefs", None, None)
            .await?;
        serde_json::from_slice(&body).context("decode prefs")
    }

    async fn edit_prefs(&self, masked: &MaskedPrefs) -> anyhow::Result<Prefs> {
        let payload = serde_json::to_vec(masked).context("encode masked prefs")?;
        let (_, _, body) = self
            .request(
                Method::PATCH,
                "/localapi/v0/prefs",
                Some(Bytes::from(payload)),
                None,
            )
            .await?;
        serde_json::from_slice(&body).context("decode prefs")
    }

    async fn get_serve_config(&self) -> anyhow::Result<ServeConfig> {
        let (_, headers, body) = self
            .request(Method::GET, "/localapi/v0/serve-config", None, None)
            .await?;
        let mut config: ServeConfig =
            serde_json::from_slice(&body).context("decode serve config")?;
        config.etag = headers
            .get(hyper::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        Ok(config)
    }

    async fn set_serve_config(&self, config: &ServeConfig) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(config).context("encode serve config")?;
        self.request(
            Method::POST,
            "/localapi/v0/serve-config",
            Some(Bytes::from(payload)),
            config.etag.as_deref(),
        )
        .await?;
        Ok(())
    }

    async fn start_with_auth_key(&self, auth_key: &str) -> anyhow::Result<()> {
        let payload =
            serde_json::to_vec(&serde_json::json!({ "AuthKey": auth_key })).expect("static shape");
        self.request(
            Method::POST,
            "/localapi/v0/start",
            Some(Bytes::from(payload)),
            None,
        )
        .await?;
        Ok(())
    }

    async fn start_login_interactive(&self) -> anyhow::Result<()> {
        self.request(
            Method::POST,
            "/localapi/v0/login-interactive",
            Some(Bytes::new()),
            None,
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_state_parsing() {
        assert_eq!(BackendState::from("Running"), BackendState::Running);
        assert_eq!(BackendState::from("NeedsLogin"), BackendState::NeedsLogin);
        assert_eq!(BackendState::from("NoState"), BackendState::NoState);
        assert_eq!(
            BackendState::from("NeedsMachineAuth"),
            BackendState::Other("NeedsMachineAuth".to_string())
        );
    }

    #[test]
    fn test_service_name_for_route() {
        assert_eq!(service_name_for_route("app"), "svc:app");
    }

    #[test]
    fn test_status_suffix() {
        let status: Status = serde_json::from_str(
            r#"{"BackendState":"Running","CurrentTailnet":{"MagicDNSSuffix":"example.ts.net"}}"#,
        )
        .unwrap();
        assert_eq!(status.state(), BackendState::Running);
        assert_eq!(status.magic_dns_suffix(), Some("example.ts.net"));

        let empty: Status = serde_json::from_str(r#"{"BackendState":"Starting"}"#).unwrap();
        assert_eq!(empty.magic_dns_suffix(), None);
    }

    #[test]
    fn test_set_web_handler_shape() {
        let mut config = ServeConfig::default();
        config.set_web_handler(
            "svc:app",
            "app.example.ts.net",
            443,
            "/",
            "http://127.0.0.1:40123",
            true,
        );
        config.set_web_handler(
            "svc:app",
            "app.example.ts.net",
            80,
            "/",
            "http://127.0.0.1:40999",
            false,
        );

        let svc = config.services.get("svc:app").unwrap();
        assert!(svc.tcp.get(&443).unwrap().https);
        assert!(!svc.tcp.get(&443).unwrap().http);
        assert!(svc.tcp.get(&80).unwrap().http);
        assert_eq!(
            svc.web
                .get("app.example.ts.net:443")
                .unwrap()
                .handlers
                .get("/")
                .unwrap()
                .proxy,
            "http://127.0.0.1:40123"
        );
    }

    #[test]
    fn test_serve_config_json_shape() {
        let mut config = ServeConfig::default();
        config.set_web_handler(
            "svc:app",
            "app.example.ts.net",
            443,
            "/",
            "http://127.0.0.1:40123",
            true,
        );

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(
            json["Services"]["svc:app"]["TCP"]["443"]["HTTPS"],
            serde_json::Value::Bool(true)
        );
        assert_eq!(
            json["Services"]["svc:app"]["Web"]["app.example.ts.net:443"]["Handlers"]["/"]["Proxy"],
            serde_json::Value::String("http://127.0.0.1:40123".to_string())
        );

        // ETag travels in headers, never in the body
        let text = serde_json::to_string(&config).unwrap();
        assert!(!text.contains("etag"));

        let round: ServeConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(round, config);
    }
}
