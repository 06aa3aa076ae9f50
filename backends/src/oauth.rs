use crate::credentials::{TokenEndpoint, TokenGrant};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use std::time::Duration;
use tidevault_core::{Error, Result};
use tracing::debug;

pub const DEFAULT_AUTHORIZE_URL: &str = "https://login.live.com/oauth20_authorize.srf";
pub const DEFAULT_TOKEN_URL: &str = "https://login.microsoftonline.com/common/oauth2/v2.0/token";
pub const DEFAULT_SCOPE: &str = "offline_access Files.ReadWrite";

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub scope: String,
    pub authorize_url: String,
    pub token_url: String,
}

impl OAuthConfig {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>, redirect_uri: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            redirect_uri: redirect_uri.into(),
            scope: DEFAULT_SCOPE.to_string(),
            authorize_url: DEFAULT_AUTHORIZE_URL.to_string(),
            token_url: DEFAULT_TOKEN_URL.to_string(),
        }
    }
}

/// Authorization-code flow against the Microsoft identity platform.
pub struct OAuthClient {
    config: OAuthConfig,
    http: Client,
}

impl OAuthClient {
    pub fn new(config: OAuthConfig) -> Result<Self> {
        if config.client_id.is_empty() {
            return Err(Error::Config("OAuth client id is not set".to_string()));
        }
        let http = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { config, http })
    }

    async fn request_token(&self, context: &str, form: &[(&str, &str)]) -> Result<TokenGrant> {
        let response = self
            .http
            .post(&self.config.token_url)
            .form(form)
            .send()
            .await
            .map_err(|e| Error::Transport {
                context: context.to_string(),
                message: e.to_string(),
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| Error::Transport {
            context: context.to_string(),
            message: e.to_string(),
        })?;

        if status != StatusCode::OK {
            return Err(Error::UnexpectedStatus {
                context: context.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        debug!(context, "Token endpoint answered");
        serde_json::from_str(&body).map_err(|e| Error::Protocol(format!("{} response: {}", context, e)))
    }
}

#[async_trait]
impl TokenEndpoint for OAuthClient {
    fn authorization_url(&self) -> Result<String> {
        let url = Url::parse_with_params(
            &self.config.authorize_url,
            &[
                ("client_id", self.config.client_id.as_str()),
                ("scope", self.config.scope.as_str()),
                ("response_type", "code"),
                ("redirect_uri", self.config.redirect_uri.as_str()),
            ],
        )
        .map_err(|e| Error::Config(format!("invalid authorize url {}: {}", self.config.authorize_url, e)))?;
        Ok(url.to_string())
    }

    async fn exchange_code(&self, code: &str) -> Result<TokenGrant> {
        self.request_token(
            "code exchange",
            &[
                ("client_id", self.config.client_id.as_str()),
                ("redirect_uri", self.config.redirect_uri.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("code", code),
                ("grant_type", "authorization_code"),
            ],
        )
        .await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant> {
        self.request_token(
            "token refresh",
            &[
                ("client_id", self.config.client_id.as_str()),
                ("redirect_uri", self.config.redirect_uri.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ],
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authorization_url_is_encoded() {
        let client = OAuthClient::new(OAuthConfig::new("abc-123", "secret", "http://localhost:8080/callback")).unwrap();
        let url = Url::parse(&client.authorization_url().unwrap()).unwrap();

        assert_eq!(url.host_str(), Some("login.live.com"));
        let params: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(params.contains(&("client_id".to_string(), "abc-123".to_string())));
        assert!(params.contains(&("response_type".to_string(), "code".to_string())));
        assert!(params.contains(&("scope".to_string(), DEFAULT_SCOPE.to_string())));
        assert!(params.contains(&(
            "redirect_uri".to_string(),
            "http://localhost:8080/callback".to_string()
        )));
    }

    #[test]
    fn test_missing_client_id_is_config_error() {
        assert!(matches!(
            OAuthClient::new(OAuthConfig::new("", "secret", "http://localhost")),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_grant_parsing() {
        let grant: TokenGrant = serde_json::from_str(
            r#"{"token_type":"bearer","expires_in":3600,"access_token":"at","refresh_token":"rt","user_id":"u1"}"#,
        )
        .unwrap();
        assert_eq!(grant.access_token, "at");
        assert_eq!(grant.refresh_token.as_deref(), Some("rt"));
        assert_eq!(grant.user_id.as_deref(), Some("u1"));
    }
}
