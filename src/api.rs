//! HTTP client for the agent backend.
//!
//! Adds the bearer token to every request, turns non-success responses into
//! [`FetchError`]s using the backend's `detail` field, and clears the stored
//! token when the backend answers 401.

use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, Context, Result};
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::config::Config;
use crate::error::FetchError;
use crate::logging::{log, obj, v_str, Domain, Level};
use crate::retry::{retry_fetch, RetryConfig};

/// Bearer token holder, optionally persisted to a file.
#[derive(Debug, Default)]
pub struct CredentialStore {
    token: RwLock<Option<String>>,
    path: Option<PathBuf>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the token saved at `path`, if any; later changes are written back.
    pub fn with_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let token = match fs::read_to_string(&path) {
            Ok(s) => Some(s.trim().to_string()).filter(|t| !t.is_empty()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e).with_context(|| format!("reading token file {}", path.display())),
        };
        Ok(Self {
            token: RwLock::new(token),
            path: Some(path),
        })
    }

    pub fn token(&self) -> Option<String> {
        self.token.read().ok().and_then(|t| t.clone())
    }

    pub fn is_authenticated(&self) -> bool {
        self.token().is_some()
    }

    pub fn set(&self, token: &str) -> Result<()> {
        if let Some(path) = &self.path {
            fs::write(path, token).with_context(|| format!("writing token file {}", path.display()))?;
        }
        let mut guard = self.token.write().map_err(|_| anyhow!("credential lock poisoned"))?;
        *guard = Some(token.to_string());
        Ok(())
    }

    /// Forget the token. Called when the backend rejects it.
    pub fn clear(&self) {
        if let Ok(mut guard) = self.token.write() {
            *guard = None;
        }
        if let Some(path) = &self.path {
            if let Err(err) = fs::remove_file(path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    log(
                        Level::Warn,
                        Domain::Auth,
                        "token_file_remove_failed",
                        obj(&[("error", v_str(&err.to_string()))]),
                    );
                }
            }
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base: Url,
    credentials: Arc<CredentialStore>,
    retry: RetryConfig,
}

impl ApiClient {
    pub fn new(cfg: &Config, credentials: Arc<CredentialStore>) -> Result<Self> {
        let base = Url::parse(&cfg.api_base).with_context(|| format!("invalid API_BASE {}", cfg.api_base))?;
        if base.cannot_be_a_base() {
            return Err(anyhow!("API_BASE {} cannot carry a path", cfg.api_base));
        }
        let client = Client::builder()
            .timeout(cfg.http_timeout())
            .build()
            .context("building http client")?;
        Ok(Self {
            client,
            base,
            credentials,
            retry: cfg.retry(),
        })
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Absolute URL for `segments` under the base URL; segments are
    /// percent-encoded, so user ids and phone numbers can be passed as is.
    pub fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request(&self, method: Method, segments: &[&str]) -> RequestBuilder {
        let mut req = self.client.request(method, self.endpoint(segments));
        if let Some(token) = self.credentials.token() {
            req = req.bearer_auth(token);
        }
        req
    }

    async fn send(&self, req: RequestBuilder, label: &str) -> Result<Response, FetchError> {
        let resp = req.send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let reason = status.canonical_reason().unwrap_or("");
        let body = resp.text().await.unwrap_or_default();
        let err = FetchError::from_response(status.as_u16(), reason, &body);
        if err.is_auth() {
            log(
                Level::Warn,
                Domain::Auth,
                "session_expired",
                obj(&[("endpoint", v_str(label)), ("msg", v_str("clearing stored credentials"))]),
            );
            self.credentials.clear();
        }
        Err(err)
    }

    async fn read_json(resp: Response) -> Result<Value, FetchError> {
        let body = resp.text().await?;
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&body)?)
    }

    /// GET a JSON document, retrying transient failures.
    pub async fn get_json(&self, segments: &[&str]) -> Result<Value, FetchError> {
        let path = segments.join("/");
        let label = path.as_str();
        retry_fetch(&self.retry, label, || async move {
            let resp = self.send(self.request(Method::GET, segments), label).await?;
            Self::read_json(resp).await
        })
        .await
    }

    /// GET a JSON document and check it against `T`.
    pub async fn get_typed<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<T, FetchError> {
        let value = self.get_json(segments).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// GET a plain-text document, retrying transient failures.
    pub async fn get_text(&self, segments: &[&str]) -> Result<String, FetchError> {
        let path = segments.join("/");
        let label = path.as_str();
        retry_fetch(&self.retry, label, || async move {
            let resp = self.send(self.request(Method::GET, segments), label).await?;
            Ok(resp.text().await?)
        })
        .await
    }

    pub async fn post_json<B: Serialize + ?Sized>(&self, segments: &[&str], body: &B) -> Result<Value, FetchError> {
        let label = segments.join("/");
        let resp = self.send(self.request(Method::POST, segments).json(body), &label).await?;
        Self::read_json(resp).await
    }

    /// POST with the payload in the query string and no body.
    pub async fn post_query(&self, segments: &[&str], query: &[(&str, String)]) -> Result<Value, FetchError> {
        let label = segments.join("/");
        let resp = self.send(self.request(Method::POST, segments).query(query), &label).await?;
        Self::read_json(resp).await
    }

    pub async fn delete(&self, segments: &[&str]) -> Result<Value, FetchError> {
        let label = segments.join("/");
        let resp = self.send(self.request(Method::DELETE, segments), &label).await?;
        Self::read_json(resp).await
    }

    /// Exchange username and password for a bearer token and store it.
    pub async fn login(&self, username: &str, password: &str) -> Result<(), FetchError> {
        let form = [("username", username), ("password", password)];
        let resp = self
            .send(self.client.post(self.endpoint(&["token"])).form(&form), "token")
            .await?;
        let token: TokenResponse = serde_json::from_value(Self::read_json(resp).await?)?;
        self.credentials
            .set(&token.access_token)
            .map_err(|e| FetchError::decode(format!("{:#}", e)))?;
        log(Level::Info, Domain::Auth, "login", obj(&[("user", v_str(username))]));
        Ok(())
    }
}

/// Re-encode a typed payload as the opaque value stored in the cache.
pub fn to_value<T: Serialize>(payload: &T) -> Result<Value, FetchError> {
    serde_json::to_value(payload).map_err(FetchError::from)
}
