//! The provider exchange client: authorization-code exchange plus the
//! user-info fetch that follows it.

use oauth2::{
    basic::BasicClient, AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, RedirectUrl,
    Scope, TokenResponse, TokenUrl,
};
use thiserror::Error;

use crate::config::ProviderConfig;

/// Errors while talking to the OAuth provider.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("invalid {name} endpoint: {reason}")]
    Endpoint {
        name: &'static str,
        reason: String,
    },
    #[error("failed to construct http client: {0}")]
    Client(String),
    #[error("token exchange failed: {0}")]
    Exchange(String),
    #[error("user info fetch failed: {0}")]
    UserInfo(String),
}

/// Executes the provider side of a login.
///
/// Holds nothing but validated endpoints and an HTTP connection pool; no
/// state is retained between calls.
#[derive(Clone, Debug)]
pub struct ProviderClient {
    client_id: ClientId,
    client_secret: ClientSecret,
    auth_url: AuthUrl,
    token_url: TokenUrl,
    redirect_url: RedirectUrl,
    userinfo_url: reqwest::Url,
    scope: Scope,
    http: reqwest::Client,
}

impl ProviderClient {
    pub fn new(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let auth_url = AuthUrl::new(config.auth_url.clone()).map_err(|e| {
            ProviderError::Endpoint {
                name: "auth_url",
                reason: e.to_string(),
            }
        })?;
        let token_url = TokenUrl::new(config.token_url.clone()).map_err(|e| {
            ProviderError::Endpoint {
                name: "token_url",
                reason: e.to_string(),
            }
        })?;
        let redirect_url = RedirectUrl::new(config.redirect_url.clone()).map_err(|e| {
            ProviderError::Endpoint {
                name: "redirect_url",
                reason: e.to_string(),
            }
        })?;
        let userinfo_url = reqwest::Url::parse(&config.userinfo_url).map_err(|e| {
            ProviderError::Endpoint {
                name: "userinfo_url",
                reason: e.to_string(),
            }
        })?;

        // Following a redirect from the token endpoint would resubmit the
        // client credentials to wherever it points.
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ProviderError::Client(e.to_string()))?;

        Ok(Self {
            client_id: ClientId::new(config.client_id.clone()),
            client_secret: ClientSecret::new(config.client_secret.clone()),
            auth_url,
            token_url,
            redirect_url,
            userinfo_url,
            scope: Scope::new(config.scope.clone()),
            http,
        })
    }

    /// The URL an unauthenticated user is sent to. The state parameter is
    /// opaque and not checked on the way back.
    pub fn authorize_url(&self) -> String {
        let (url, _csrf) = BasicClient::new(self.client_id.clone())
            .set_auth_uri(self.auth_url.clone())
            .set_redirect_uri(self.redirect_url.clone())
            .authorize_url(CsrfToken::new_random)
            .add_scope(self.scope.clone())
            .url();

        url.to_string()
    }

    /// Exchange an authorization code for an access token, then fetch the
    /// raw user-info document with it.
    ///
    /// # Errors
    ///
    /// `Exchange` when the provider rejects the code, `UserInfo` when the
    /// subsequent fetch fails or answers with a non-success status.
    pub async fn exchange(&self, code: &str) -> Result<Vec<u8>, ProviderError> {
        let token = BasicClient::new(self.client_id.clone())
            .set_client_secret(self.client_secret.clone())
            .set_token_uri(self.token_url.clone())
            .set_redirect_uri(self.redirect_url.clone())
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .request_async(&self.http)
            .await
            .map_err(|e| ProviderError::Exchange(e.to_string()))?;

        let response = self
            .http
            .get(self.userinfo_url.clone())
            .bearer_auth(token.access_token().secret())
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| ProviderError::UserInfo(e.to_string()))?;

        let body = response
            .bytes()
            .await
            .map_err(|e| ProviderError::UserInfo(e.to_string()))?;

        Ok(body.to_vec())
    }
}
