//! OAUTHBEARER token providers
//!
//! librdkafka asks for a token from its own background thread, so
//! [`TokenProvider::token`] is synchronous. Tokens fetched over HTTP are
//! obtained on the tokio runtime captured at construction and handed back
//! through a channel with a bounded wait.

use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Lifetime advertised for tokens that carry no expiry of their own
pub const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(3600);

/// A bearer token and the instant it stops being valid
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    /// Raw bearer token
    pub token: String,
    /// Expiry instant, `None` if the issuer did not say
    pub expiry: Option<DateTime<Utc>>,
}

impl AccessToken {
    /// Whether the token can still be used given a refresh `margin`
    pub fn is_fresh(&self, margin: Duration) -> bool {
        match self.expiry {
            None => true,
            Some(expiry) => {
                let margin = chrono::Duration::from_std(margin)
                    .unwrap_or_else(|_| chrono::Duration::days(36_500));
                match expiry.checked_sub_signed(margin) {
                    Some(deadline) => deadline > Utc::now(),
                    None => false,
                }
            }
        }
    }

    /// Expiry in milliseconds since the epoch, as librdkafka expects it
    pub fn lifetime_ms(&self) -> i64 {
        let expiry = self.expiry.unwrap_or_else(|| {
            Utc::now()
                + chrono::Duration::from_std(DEFAULT_TOKEN_LIFETIME)
                    .unwrap_or(chrono::Duration::hours(1))
        });
        expiry.timestamp_millis()
    }
}

/// Supplies bearer tokens to a producer connection.
pub trait TokenProvider: Send + Sync {
    /// Return a valid token, fetching a new one if needed. Blocks the calling
    /// thread; never call it from inside an async task.
    fn token(&self) -> Result<AccessToken>;

    /// Cancel any outstanding refresh. Later calls to `token` fail.
    fn close(&self) {}
}

/// Fixed token configured by the operator
#[derive(Debug, Clone)]
pub struct StaticToken {
    token: String,
}

impl StaticToken {
    /// Wrap `token`
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl TokenProvider for StaticToken {
    fn token(&self) -> Result<AccessToken> {
        Ok(AccessToken {
            token: self.token.clone(),
            expiry: None,
        })
    }
}

/// Asynchronous source of fresh tokens
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Fetch a new token from the issuer
    async fn fetch(&self) -> Result<AccessToken>;
}

/// Caches the token from a [`TokenSource`] until it is within `margin` of its
/// expiry, then fetches a new one.
pub struct RefreshingToken {
    source: Arc<dyn TokenSource>,
    margin: Duration,
    wait: Duration,
    handle: Handle,
    cancel: CancellationToken,
    cached: Mutex<Option<AccessToken>>,
}

impl RefreshingToken {
    /// Build a provider that runs fetches on the current tokio runtime.
    /// Each fetch is waited on for at most `wait`.
    pub fn new(source: Arc<dyn TokenSource>, margin: Duration, wait: Duration) -> Result<Self> {
        let handle = Handle::try_current().map_err(|e| {
            Error::AuthError(format!("token refresh needs a tokio runtime: {}", e))
        })?;
        Ok(Self {
            source,
            margin,
            wait,
            handle,
            cancel: CancellationToken::new(),
            cached: Mutex::new(None),
        })
    }

    fn fetch(&self) -> Result<AccessToken> {
        let (tx, rx) = mpsc::channel();
        let source = Arc::clone(&self.source);
        let cancel = self.cancel.clone();
        self.handle.spawn(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    Err(Error::AuthError("token refresh cancelled".to_string()))
                }
                result = source.fetch() => result,
            };
            let _ = tx.send(result);
        });

        match rx.recv_timeout(self.wait) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(Error::Timeout(format!(
                "no token after {:?}",
                self.wait
            ))),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(Error::ChannelError(
                "token refresh task exited without a result".to_string(),
            )),
        }
    }
}

impl TokenProvider for RefreshingToken {
    fn token(&self) -> Result<AccessToken> {
        if self.cancel.is_cancelled() {
            return Err(Error::AuthError("token provider is closed".to_string()));
        }

        let mut cached = self.cached.lock();
        if let Some(token) = cached.as_ref() {
            if token.is_fresh(self.margin) {
                return Ok(token.clone());
            }
        }

        debug!("Refreshing OAuth token");
        let token = self.fetch()?;
        *cached = Some(token.clone());
        Ok(token)
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}

/// How client credentials are presented to the token endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStyle {
    /// Try HTTP basic auth first, fall back to form parameters on a 4xx
    AutoDetect,
    /// HTTP basic auth
    InHeader,
    /// `client_id` and `client_secret` form parameters
    InParams,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// OAuth2 client-credentials grant
pub struct ClientCredentials {
    client: reqwest::Client,
    client_id: String,
    client_secret: String,
    token_url: String,
    scopes: Vec<String>,
    params: BTreeMap<String, String>,
    auth_style: AuthStyle,
}

impl ClientCredentials {
    /// Create a grant against `token_url`. Requests time out after `timeout`.
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        token_url: impl Into<String>,
        auth_style: AuthStyle,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::AuthError(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            token_url: token_url.into(),
            scopes: Vec::new(),
            params: BTreeMap::new(),
            auth_style,
        })
    }

    /// Token endpoint of an Azure AD tenant
    pub fn azure_ad_token_url(tenant: &str) -> String {
        format!(
            "https://login.microsoftonline.com/{}/oauth2/v2.0/token",
            tenant
        )
    }

    /// Requested scopes, sent space separated
    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    /// Extra form parameters such as `audience`
    pub fn with_params(mut self, params: impl IntoIterator<Item = (String, String)>) -> Self {
        self.params.extend(params);
        self
    }

    async fn request(&self, in_header: bool) -> Result<reqwest::Response> {
        let mut form: Vec<(&str, &str)> = vec![("grant_type", "client_credentials")];
        let scope = self.scopes.join(" ");
        if !scope.is_empty() {
            form.push(("scope", scope.as_str()));
        }
        for (key, value) in &self.params {
            form.push((key.as_str(), value.as_str()));
        }

        let mut request = self.client.post(&self.token_url);
        if in_header {
            request = request.basic_auth(&self.client_id, Some(&self.client_secret));
        } else {
            form.push(("client_id", self.client_id.as_str()));
            form.push(("client_secret", self.client_secret.as_str()));
        }

        request
            .form(&form)
            .send()
            .await
            .map_err(|e| Error::AuthError(format!("token request failed: {}", e)))
    }

    async fn parse(response: reqwest::Response) -> Result<AccessToken> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::AuthError(format!(
                "token endpoint returned {}: {}",
                status, body
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::AuthError(format!("invalid token response: {}", e)))?;
        if body.access_token.is_empty() {
            return Err(Error::AuthError(
                "server response missing access_token".to_string(),
            ));
        }

        let expiry = body
            .expires_in
            .filter(|secs| *secs > 0)
            .and_then(chrono::Duration::try_seconds)
            .and_then(|lifetime| Utc::now().checked_add_signed(lifetime));
        Ok(AccessToken {
            token: body.access_token,
            expiry,
        })
    }
}

#[async_trait]
impl TokenSource for ClientCredentials {
    async fn fetch(&self) -> Result<AccessToken> {
        match self.auth_style {
            AuthStyle::InHeader => Self::parse(self.request(true).await?).await,
            AuthStyle::InParams => Self::parse(self.request(false).await?).await,
            AuthStyle::AutoDetect => {
                let response = self.request(true).await?;
                if response.status().is_client_error() {
                    debug!(
                        status = %response.status(),
                        "Token endpoint rejected basic auth, retrying with form credentials"
                    );
                    return Self::parse(self.request(false).await?).await;
                }
                Self::parse(response).await
            }
        }
    }
}
