//! HTTP endpoints of the service: explain, help and share.
//!
//! None of these touch the run session; a failure here is reported to the
//! caller and nothing else.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use url::Url;

use crate::config::ClientConfig;
use crate::protocol::{ExplainResponse, HelpEntry, HelpResponse, ShareResponse};

/// Header carrying the anti-forgery token on non-safe requests
/// (`X-CSRFToken`; header names are case-insensitive).
pub const CSRF_HEADER: &str = "x-csrftoken";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Invalid CSRF token")]
    InvalidToken,

    #[error("Share failed")]
    ShareFailed,
}

/// Client for the HTTP side of the service.
pub struct ApiClient {
    http: reqwest::Client,
    base_url: Url,
    csrf_token: Option<String>,
    /// Help tables, fetched once per version.
    help_cache: HashMap<String, Arc<Vec<HelpEntry>>>,
}

impl ApiClient {
    pub fn new(base_url: Url, csrf_token: Option<String>) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url,
            csrf_token,
            help_cache: HashMap::new(),
        })
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self, ApiError> {
        let base_url = Url::parse(&config.server_url)?;
        Self::new(base_url, config.csrf_token.clone())
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        let mut base = self.base_url.clone();
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(base.join(path)?)
    }

    fn unsafe_headers(&self) -> Result<HeaderMap, ApiError> {
        let mut headers = HeaderMap::new();
        if let Some(token) = &self.csrf_token {
            let value = HeaderValue::from_str(token).map_err(|_| ApiError::InvalidToken)?;
            headers.insert(HeaderName::from_static(CSRF_HEADER), value);
        }
        Ok(headers)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::Status { status, body })
        }
    }

    /// Explanation of `code` for `version`. Empty code is not sent and
    /// yields `None`.
    pub async fn explain(&self, code: &str, version: &str) -> Result<Option<String>, ApiError> {
        if code.is_empty() {
            return Ok(None);
        }

        let url = self.endpoint("explain")?;
        debug!("[api] GET {}", url);
        let response = self
            .http
            .get(url)
            .query(&[("code", code), ("version", version)])
            .send()
            .await?;
        let explained: ExplainResponse = Self::check(response).await?.json().await?;
        Ok(Some(explained.text()))
    }

    /// Documentation for `version`. Cached for the lifetime of the client.
    pub async fn help(&mut self, version: &str) -> Result<Arc<Vec<HelpEntry>>, ApiError> {
        if let Some(entries) = self.help_cache.get(version) {
            return Ok(entries.clone());
        }

        let url = self.endpoint(&format!("help/{}", version))?;
        debug!("[api] GET {}", url);
        let response = self.http.get(url).send().await?;
        let help: HelpResponse = Self::check(response).await?.json().await?;

        let entries = Arc::new(help.data);
        self.help_cache
            .insert(version.to_string(), entries.clone());
        Ok(entries)
    }

    pub fn is_help_cached(&self, version: &str) -> bool {
        self.help_cache.contains_key(version)
    }

    /// Upload an image source (usually a `data:` URI) and return the public
    /// link.
    pub async fn share(&self, image_source: &str) -> Result<String, ApiError> {
        let url = self.endpoint("share")?;
        debug!("[api] POST {}", url);
        let response = self
            .http
            .post(url)
            .headers(self.unsafe_headers()?)
            .form(&[("data", image_source)])
            .send()
            .await?;
        let shared: ShareResponse = Self::check(response).await?.json().await?;

        match shared {
            ShareResponse {
                success: Some(true),
                link: Some(link),
            } => Ok(link),
            _ => Err(ApiError::ShareFailed),
        }
    }
}
