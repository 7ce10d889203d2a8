//! App-only OAuth2 (client credentials) for the Reddit API.

use oauth2::basic::BasicClient;
use oauth2::{
    AuthUrl, ClientId, ClientSecret, HttpRequest, HttpResponse, TokenResponse, TokenUrl,
};
use personasim_core::{require_secret, CoreError, CorpusError, CorpusSettings};
use reqwest::header::USER_AGENT;
use reqwest::Client;
use std::time::{Duration, SystemTime};
use tracing::{debug, info};

const REDDIT_AUTH_URL: &str = "https://www.reddit.com/api/v1/authorize";
const REDDIT_TOKEN_URL: &str = "https://www.reddit.com/api/v1/access_token";

/// Refresh this long before the token actually expires.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct RedditCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub user_agent: String,
}

impl std::fmt::Debug for RedditCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedditCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

impl RedditCredentials {
    pub fn from_env(settings: &CorpusSettings) -> Result<Self, CoreError> {
        Ok(Self {
            client_id: require_secret(&settings.client_id_env)?,
            client_secret: require_secret(&settings.client_secret_env)?,
            user_agent: settings.user_agent.clone(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct AppToken {
    pub access_token: String,
    pub expires_at: SystemTime,
}

impl AppToken {
    pub fn new(access_token: String, expires_in: Duration) -> Self {
        Self {
            access_token,
            expires_at: SystemTime::now() + expires_in,
        }
    }

    pub fn is_expired(&self) -> bool {
        SystemTime::now() >= self.expires_at
    }

    pub fn needs_refresh(&self) -> bool {
        SystemTime::now() + EXPIRY_MARGIN >= self.expires_at
    }
}

pub(crate) fn oauth_client(credentials: &RedditCredentials) -> Result<BasicClient, CoreError> {
    let invalid = |e: oauth2::url::ParseError| CorpusError::AuthenticationFailed {
        reason: e.to_string(),
    };
    Ok(BasicClient::new(
        ClientId::new(credentials.client_id.clone()),
        Some(ClientSecret::new(credentials.client_secret.clone())),
        AuthUrl::new(REDDIT_AUTH_URL.to_string()).map_err(invalid)?,
        Some(TokenUrl::new(REDDIT_TOKEN_URL.to_string()).map_err(invalid)?),
    ))
}

/// Exchanges the client credentials for an app-only bearer token.
pub(crate) async fn request_app_token(
    oauth: &BasicClient,
    http_client: &Client,
    user_agent: &str,
) -> Result<AppToken, CoreError> {
    debug!("Requesting app-only Reddit token");
    let response = oauth
        .exchange_client_credentials()
        .request_async(|request| token_http_client(http_client.clone(), user_agent.to_string(), request))
        .await
        .map_err(|e| CorpusError::AuthenticationFailed {
            reason: e.to_string(),
        })?;

    let expires_in = response
        .expires_in()
        .unwrap_or(Duration::from_secs(3600));
    info!("Obtained Reddit app token valid for {:?}", expires_in);

    Ok(AppToken::new(
        response.access_token().secret().clone(),
        expires_in,
    ))
}

/// Token requests go through the shared client so Reddit sees our user agent.
async fn token_http_client(
    http_client: Client,
    user_agent: String,
    request: HttpRequest,
) -> Result<HttpResponse, reqwest::Error> {
    let response = http_client
        .request(request.method, request.url.as_str())
        .headers(request.headers)
        .header(USER_AGENT, user_agent)
        .body(request.body)
        .send()
        .await?;

    let status_code = response.status();
    let headers = response.headers().clone();
    let body = response.bytes().await?.to_vec();

    Ok(HttpResponse {
        status_code,
        headers,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_expiry() {
        let fresh = AppToken::new("abc".to_string(), Duration::from_secs(3600));
        assert!(!fresh.is_expired());
        assert!(!fresh.needs_refresh());

        let closing = AppToken::new("abc".to_string(), Duration::from_secs(30));
        assert!(!closing.is_expired());
        assert!(closing.needs_refresh());

        let expired = AppToken {
            access_token: "abc".to_string(),
            expires_at: SystemTime::now() - Duration::from_secs(1),
        };
        assert!(expired.is_expired());
    }

    #[test]
    fn test_credentials_debug_redacts_secret() {
        let credentials = RedditCredentials {
            client_id: "id".to_string(),
            client_secret: "hunter2".to_string(),
            user_agent: "personasim/0.1".to_string(),
        };
        let rendered = format!("{:?}", credentials);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_oauth_client_builds() {
        let credentials = RedditCredentials {
            client_id: "id".to_string(),
            client_secret: "secret".to_string(),
            user_agent: "personasim/0.1".to_string(),
        };
        assert!(oauth_client(&credentials).is_ok());
    }
}
