//! HTTP fetcher
//!
//! This module retrieves raw content for a work item and classifies the
//! outcome. It never retries on its own: a retryable failure goes back to
//! the orchestrator, which schedules the next attempt through the frontier.
//!
//! # Classification
//!
//! | Condition | Class |
//! |-----------|-------|
//! | 2xx | success |
//! | 408, 425, 429, 5xx | retryable |
//! | Timeout, connection failure, body read error | retryable |
//! | Other 4xx (404, 403, 410, ...) and unexpected 1xx/3xx | permanent |
//! | Malformed or non-http(s) address, redirect loop | permanent |

use crate::config::FetchConfig;
use crate::url::origin_host;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use reqwest::{header::CONTENT_TYPE, redirect::Policy, Client, StatusCode};
use std::num::NonZeroU32;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Maximum redirect hops before a fetch is treated as permanently failed
const MAX_REDIRECTS: usize = 10;

/// A classified fetch failure
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("retryable: {message}")]
    Retryable {
        status: Option<u16>,
        message: String,
    },

    #[error("permanent: {message}")]
    Permanent {
        status: Option<u16>,
        message: String,
    },
}

impl FetchError {
    fn retryable(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Retryable {
            status,
            message: message.into(),
        }
    }

    fn permanent(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Permanent {
            status,
            message: message.into(),
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Retryable { status, .. } | Self::Permanent { status, .. } => *status,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Retryable { message, .. } | Self::Permanent { message, .. } => message,
        }
    }
}

/// Coarse outcome class of a fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    Retryable,
    Permanent,
}

/// A successfully fetched document
#[derive(Debug, Clone)]
pub struct Document {
    /// The work item identifier that was requested
    pub identifier: String,
    /// Address after redirects; relative references resolve against it
    pub final_url: Url,
    /// Declared Content-Type, if any
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Success(Document),
    Failed(FetchError),
}

/// Result of a single fetch attempt
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub identifier: String,
    pub origin_host: String,
    pub outcome: FetchOutcome,
}

impl FetchResult {
    pub fn status_class(&self) -> StatusClass {
        match &self.outcome {
            FetchOutcome::Success(_) => StatusClass::Success,
            FetchOutcome::Failed(FetchError::Retryable { .. }) => StatusClass::Retryable,
            FetchOutcome::Failed(FetchError::Permanent { .. }) => StatusClass::Permanent,
        }
    }
}

/// Builds an HTTP client with the configured timeouts and user agent
pub fn build_http_client(config: &FetchConfig) -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(config.user_agent.clone())
        .timeout(Duration::from_millis(config.timeout_ms))
        .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
        .redirect(Policy::limited(MAX_REDIRECTS))
        .gzip(true)
        .brotli(true)
        .build()
}

/// Rate-limited HTTP fetcher shared by all workers
pub struct Fetcher {
    client: Client,
    rate_limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
}

impl Fetcher {
    /// Creates a fetcher allowing at most `requests_per_second` requests overall
    pub fn new(config: &FetchConfig, requests_per_second: u32) -> Result<Self, reqwest::Error> {
        let quota = Quota::per_second(NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN));
        Ok(Self {
            client: build_http_client(config)?,
            rate_limiter: RateLimiter::direct(quota),
        })
    }

    /// Fetches one identifier and classifies the outcome
    pub async fn fetch(&self, identifier: &str) -> FetchResult {
        let url = match Url::parse(identifier) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => url,
            Ok(url) => {
                return self.failed(
                    identifier,
                    String::new(),
                    FetchError::permanent(None, format!("unsupported scheme {}", url.scheme())),
                )
            }
            Err(e) => {
                return self.failed(
                    identifier,
                    String::new(),
                    FetchError::permanent(None, format!("malformed address: {}", e)),
                )
            }
        };
        let host = origin_host(&url).unwrap_or_default();

        self.rate_limiter.until_ready().await;

        let outcome = match self.client.get(url).send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    let final_url = response.url().clone();
                    let content_type = response
                        .headers()
                        .get(CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);

                    match response.bytes().await {
                        Ok(body) => FetchOutcome::Success(Document {
                            identifier: identifier.to_string(),
                            final_url,
                            content_type,
                            body: body.to_vec(),
                        }),
                        Err(e) => FetchOutcome::Failed(classify_transport_error(&e)),
                    }
                } else {
                    FetchOutcome::Failed(classify_status(status))
                }
            }
            Err(e) => FetchOutcome::Failed(classify_transport_error(&e)),
        };

        FetchResult {
            identifier: identifier.to_string(),
            origin_host: host,
            outcome,
        }
    }

    fn failed(&self, identifier: &str, host: String, error: FetchError) -> FetchResult {
        FetchResult {
            identifier: identifier.to_string(),
            origin_host: host,
            outcome: FetchOutcome::Failed(error),
        }
    }
}

/// Classifies a non-success HTTP status
pub fn classify_status(status: StatusCode) -> FetchError {
    let code = Some(status.as_u16());
    let message = format!("HTTP {}", status.as_u16());

    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.as_u16() == 425
    {
        FetchError::retryable(code, message)
    } else {
        FetchError::permanent(code, message)
    }
}

fn classify_transport_error(e: &reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::retryable(None, "request timeout")
    } else if e.is_connect() {
        FetchError::retryable(None, format!("connection failed: {}", e))
    } else if e.is_redirect() {
        FetchError::permanent(None, format!("redirect error: {}", e))
    } else if e.is_builder() {
        FetchError::permanent(None, format!("invalid request: {}", e))
    } else {
        FetchError::retryable(None, e.to_string())
    }
}
