//! Outbound HTTP to the market-data provider.
//!
//! [`Transport`] is the only seam through which a request leaves the
//! process. The dispatcher owns the single instance; tests substitute
//! their own implementation to simulate provider behaviour.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};

use crate::request::FetchRequest;
use crate::{HeimdallError, Result};

/// Default base URL for the SensorTower REST API.
pub const DEFAULT_BASE_URL: &str = "https://api.sensortower.com/v1";

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum number of bytes of an error body kept in error messages.
const ERROR_BODY_LIMIT: usize = 200;

/// Performs one provider call. Implementations must not retry or cache;
/// the dispatcher does both.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Provider name for logs.
    fn name(&self) -> &str;

    /// Issue a GET for `request` and return the decoded JSON body.
    ///
    /// Errors are classified into [`HeimdallError`] variants so the
    /// dispatcher can tell transient from permanent failures.
    async fn get(&self, request: &FetchRequest) -> Result<serde_json::Value>;
}

/// Bearer-token HTTP client for the provider's REST API.
#[derive(Clone)]
pub struct HttpTransport {
    api_token: String,
    http: Client,
    base_url: String,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(api_token: impl Into<String>) -> Result<Self> {
        Self::with_base_url(api_token, DEFAULT_BASE_URL, DEFAULT_TIMEOUT)
    }

    /// Create a client with a custom base URL (for testing with wiremock).
    pub fn with_base_url(
        api_token: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let api_token = api_token.into();
        if api_token.trim().is_empty() {
            return Err(HeimdallError::Configuration(
                "API token must not be empty".to_string(),
            ));
        }
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HeimdallError::Configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            api_token,
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url_for(&self, request: &FetchRequest) -> String {
        format!("{}/{}", self.base_url, request.endpoint())
    }

    fn map_send_error(&self, err: reqwest::Error) -> HeimdallError {
        if err.is_timeout() {
            HeimdallError::Timeout(self.timeout)
        } else {
            HeimdallError::Http(err.to_string())
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn name(&self) -> &str {
        "sensortower"
    }

    async fn get(&self, request: &FetchRequest) -> Result<serde_json::Value> {
        let query: Vec<(&str, &str)> = request.params().iter().collect();
        let response = self
            .http
            .get(self.url_for(request))
            .bearer_auth(&self.api_token)
            .query(&query)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status, request, response).await);
        }

        let body = response.bytes().await.map_err(|e| self.map_send_error(e))?;
        serde_json::from_slice(&body).map_err(|e| HeimdallError::Api {
            status: status.as_u16(),
            message: format!("invalid JSON body: {e}"),
        })
    }
}

/// Map a non-success response onto the error taxonomy.
async fn classify_status(
    status: StatusCode,
    request: &FetchRequest,
    response: reqwest::Response,
) -> HeimdallError {
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let message = error_body(response).await;

    match status.as_u16() {
        401 => HeimdallError::AuthenticationFailed {
            status: 401,
            message,
        },
        // Plan-tier exclusions come back as 403.
        403 => HeimdallError::Forbidden {
            status: 403,
            message,
        },
        404 => HeimdallError::NotFound {
            endpoint: request.endpoint().to_string(),
        },
        429 => HeimdallError::RateLimited { retry_after },
        code => HeimdallError::Api {
            status: code,
            message,
        },
    }
}

async fn error_body(response: reqwest::Response) -> String {
    let status = response.status();
    match response.text().await {
        Ok(text) if !text.trim().is_empty() => {
            let mut text = text.trim().to_string();
            if text.len() > ERROR_BODY_LIMIT {
                let mut cut = ERROR_BODY_LIMIT;
                while !text.is_char_boundary(cut) {
                    cut -= 1;
                }
                text.truncate(cut);
                text.push('…');
            }
            text
        }
        _ => status.to_string(),
    }
}
