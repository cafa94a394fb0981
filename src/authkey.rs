//! Auth-key issuance against the control-plane REST API
//!
//! Uses OAuth2 client credentials to mint one-shot, pre-authorized device
//! keys tagged for the gateway. Key material is secret and never logged;
//! client identifiers are masked before logging.

use crate::config::{mask_secret, Config};
use anyhow::Context;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info};

const DEFAULT_CONTROL_URL: &str = "https://login.tailscale.com";
const DEFAULT_API_BASE: &str = "https://api.tailscale.com";
const TOKEN_URL_PATH: &str = "/api/v2/oauth/token";

/// Client for the control-plane admin API, authenticated with OAuth2
/// client credentials
pub struct AuthApiClient {
    http: reqwest::Client,
    token_url: String,
    api_base: String,
    client_id: String,
    client_secret: String,
    tag: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct KeyResponse {
    key: String,
}

impl AuthApiClient {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        info!(
            client_id = %mask_secret(&config.oauth.client_id),
            "Creating control-plane API client for auth key management"
        );

        let (token_url, api_base) = match &config.oauth.issuer {
            Some(issuer) if !issuer.is_empty() => {
                info!(issuer = %issuer, "Using custom OAuth issuer");
                let issuer = issuer.trim_end_matches('/');
                (format!("{}{}", issuer, TOKEN_URL_PATH), issuer.to_string())
            }
            _ => (
                format!("{}{}", DEFAULT_CONTROL_URL, TOKEN_URL_PATH),
                DEFAULT_API_BASE.to_string(),
            ),
        };

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("tsgw")
            .build()
            .context("build HTTP client")?;

        Ok(Self {
            http,
            token_url,
            api_base,
            client_id: config.oauth.client_id.clone(),
            client_secret: config.oauth.client_secret.clone(),
            tag: config.ts_tag(),
        })
    }

    /// Create a one-shot, non-reusable, pre-authorized device auth key
    /// tagged for the gateway. The returned key is secret.
    pub async fn create_auth_key(&self, route_name: &str) -> anyhow::Result<String> {
        info!(route = route_name, "Creating auth key programmatically");

        let token = self.access_token().await?;

        let body = json!({
            "capabilities": {
                "devices": {
                    "create": {
                        "reusable": false,
                        "ephemeral": false,
                        "preauthorized": true,
                        "tags": [self.tag],
                    }
                }
            },
            "description": sanitize_description(&format!(
                "Auth key for TSGW route: {}",
                route_name
            )),
        });

        let url = format!("{}/api/v2/tailnet/-/keys", self.api_base);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await
            .context("send create-key request")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            if status == reqwest::StatusCode::FORBIDDEN {
                anyhow::bail!(
                    "create auth key: {} {}. Ensure the OAuth client has the \
                     'Devices' write scope enabled in the admin console",
                    status,
                    text
                );
            }
            anyhow::bail!("create auth key: {} {}", status, text);
        }

        let key: KeyResponse = response.json().await.context("decode create-key response")?;
        info!(route = route_name, "Auth key created successfully");
        Ok(key.key)
    }

    async fn access_token(&self) -> anyhow::Result<String> {
        debug!(
            client_id = %mask_secret(&self.client_id),
            "Requesting OAuth access token"
        );

        let response = self
            .http
            .post(&self.token_url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await
            .context("send token request")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("oauth token request: {} {}", status, text);
        }

        let token: TokenResponse = response.json().await.context("decode token response")?;
        Ok(token.access_token)
    }
}

/// The admin console only accepts a narrow character set in key
/// descriptions; everything outside `[A-Za-z0-9 _-]` becomes `_`.
pub fn sanitize_description(description: &str) -> String {
    description
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == ' ' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_issuer(issuer: Option<&str>) -> Config {
        let mut config: Config = toml::from_str(
            r#"
routes = ["app=http://127.0.0.1:8080"]

[oauth]
client_id = "kClientId12345"
client_secret = "tskey-client-secret"
"#,
        )
        .unwrap();
        config.oauth.issuer = issuer.map(String::from);
        config
    }

    #[test]
    fn test_sanitize_description() {
        assert_eq!(
            sanitize_description("Auth key for TSGW route: app"),
            "Auth key for TSGW route_ app"
        );
        assert_eq!(sanitize_description("a-b_c 9Z"), "a-b_c 9Z");
        assert_eq!(sanitize_description("a/b\\c:d!"), "a_b_c_d_");
        assert_eq!(sanitize_description("naïve"), "na_ve");
    }

    #[test]
    fn test_sanitize_is_identity_on_allowed_bytes() {
        let allowed = "ABCXYZabcxyz0189 _-";
        assert_eq!(sanitize_description(allowed), allowed);
    }

    #[test]
    fn test_default_endpoints() {
        let client = AuthApiClient::new(&config_with_issuer(None)).unwrap();
        assert_eq!(
            client.token_url,
            "https://login.tailscale.com/api/v2/oauth/token"
        );
        assert_eq!(client.api_base, "https://api.tailscale.com");
        assert_eq!(client.tag, "tag:tsgw");
    }

    #[test]
    fn test_custom_issuer_endpoints() {
        let client =
            AuthApiClient::new(&config_with_issuer(Some("https://control.example.com"))).unwrap();
        assert_eq!(
            client.token_url,
            "https://control.example.com/api/v2/oauth/token"
        );
        assert_eq!(client.api_base, "https://control.example.com");
    }
}
