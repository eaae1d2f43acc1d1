//! Shared outbound HTTP plumbing for provider adapters
//!
//! One `ProviderHttp` per adapter: a `reqwest` client with connect/total
//! timeouts and a `governor` quota limiter. Every call is bounded by the
//! caller's timeout, including the time spent waiting for a quota permit.

use crate::types::{ProviderError, ProviderId};
use governor::{Quota, RateLimiter};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use std::num::NonZeroU32;
use std::time::Duration;

pub const USER_AGENT: &str = concat!("Libris/", env!("CARGO_PKG_VERSION"));

/// Upper bound on a provider's Retry-After
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(60 * 60);

/// Browser-like agent for scraped HTML targets
pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

type DirectLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

pub struct ProviderHttp {
    provider: ProviderId,
    client: Client,
    rate_limiter: DirectLimiter,
}

impl ProviderHttp {
    pub fn new(provider: ProviderId, requests_per_second: u32, user_agent: &str) -> libris_common::Result<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| {
                libris_common::Error::Config(format!("{} HTTP client build failed: {}", provider, e))
            })?;

        let per_second = NonZeroU32::new(requests_per_second).ok_or_else(|| {
            libris_common::Error::Config(format!("{} requests_per_second must be non-zero", provider))
        })?;

        Ok(Self {
            provider,
            client,
            rate_limiter: RateLimiter::direct(Quota::per_second(per_second)),
        })
    }

    pub fn provider(&self) -> ProviderId {
        self.provider
    }

    /// GET returning the response body as text
    pub async fn get_text(
        &self,
        url: &str,
        query: &[(&str, String)],
        headers: &[(&str, String)],
        timeout: Duration,
    ) -> Result<String, ProviderError> {
        let request = async {
            self.rate_limiter.until_ready().await;

            tracing::debug!(provider = %self.provider, url = %url, "Provider request");

            let mut builder = self.client.get(url).query(query).timeout(timeout);
            for (name, value) in headers {
                builder = builder.header(*name, value);
            }

            let response = builder.send().await.map_err(map_reqwest_error)?;
            classify_status(response.status(), response.headers())?;
            response.text().await.map_err(map_reqwest_error)
        };

        match tokio::time::timeout(timeout, request).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout),
        }
    }

    /// GET returning a decoded JSON body; undecodable payloads are `Unavailable`
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
        headers: &[(&str, String)],
        timeout: Duration,
    ) -> Result<T, ProviderError> {
        let body = self.get_text(url, query, headers, timeout).await?;
        serde_json::from_str(&body).map_err(|e| {
            ProviderError::Unavailable(format!("{} returned unparseable JSON: {}", self.provider, e))
        })
    }
}

fn map_reqwest_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout
    } else {
        ProviderError::Unavailable(err.to_string())
    }
}

/// Map an HTTP status onto the provider error taxonomy
///
/// 404 -> NotFound, 429/503 -> RateLimited (with Retry-After seconds,
/// capped at `MAX_RETRY_AFTER`), any other non-success -> Unavailable.
pub fn classify_status(status: StatusCode, headers: &HeaderMap) -> Result<(), ProviderError> {
    if status.is_success() {
        return Ok(());
    }

    match status {
        StatusCode::NOT_FOUND => Err(ProviderError::NotFound),
        StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => {
            let retry_after = headers
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(|secs| Duration::from_secs(secs).min(MAX_RETRY_AFTER));
            Err(ProviderError::RateLimited { retry_after })
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ProviderError::Unavailable(
            format!("credentials rejected ({})", status.as_u16()),
        )),
        other => Err(ProviderError::Unavailable(format!(
            "unexpected status {}",
            other.as_u16()
        ))),
    }
}
