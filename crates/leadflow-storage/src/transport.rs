use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::{Method, StatusCode};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, Instrument};

/// Throttling and server faults are worth another attempt; other statuses
/// will not change on resend.
pub fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

pub fn is_transient_error(err: &reqwest::Error) -> bool {
    err.is_connect() || err.is_timeout() || err.is_request()
}

/// Doubling delays between resends, clamped to `ceiling`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySchedule {
    pub attempts: usize,
    pub first_delay: Duration,
    pub ceiling: Duration,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self {
            attempts: 3,
            first_delay: Duration::from_millis(250),
            ceiling: Duration::from_secs(5),
        }
    }
}

impl RetrySchedule {
    pub fn delay(&self, resend: usize) -> Duration {
        let shift = u32::try_from(resend).unwrap_or(u32::MAX);
        let factor = 2u32.checked_pow(shift).unwrap_or(u32::MAX);
        self.first_delay.saturating_mul(factor).min(self.ceiling)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Requests in flight at once across all callers of one fetcher.
    pub max_in_flight: usize,
    pub retry: RetrySchedule,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            max_in_flight: 32,
            retry: RetrySchedule::default(),
        }
    }
}

/// One call against the remote API: optional JSON body, optional bearer token.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub json_body: Option<JsonValue>,
    pub bearer_token: Option<String>,
}

impl ApiRequest {
    fn with_method(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            query: Vec::new(),
            json_body: None,
            bearer_token: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::with_method(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::with_method(Method::POST, url)
    }

    pub fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_owned(), value.to_string()));
        self
    }

    pub fn json(self, body: JsonValue) -> Self {
        Self {
            json_body: Some(body),
            ..self
        }
    }

    pub fn bearer(self, token: Option<&str>) -> Self {
        Self {
            bearer_token: token.map(str::to_owned),
            ..self
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("{url} answered {status}: {body}")]
    Status {
        status: u16,
        url: String,
        body: String,
    },
    #[error("http fetcher shut down")]
    Closed,
}

enum Attempt {
    Done(ApiResponse),
    Resend(FetchError),
    Fail(FetchError),
}

/// Shared reqwest client with an in-flight cap and resend on transient faults.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    permits: Arc<Semaphore>,
    retry: RetrySchedule,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let builder = reqwest::Client::builder()
            .timeout(config.timeout)
            .gzip(true)
            .brotli(true);
        let builder = match config.user_agent {
            Some(agent) => builder.user_agent(agent),
            None => builder,
        };
        Ok(Self {
            client: builder.build().context("building http client")?,
            permits: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            retry: config.retry,
        })
    }

    pub async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, FetchError> {
        let _permit = self.permits.acquire().await.map_err(|_| FetchError::Closed)?;
        let span = info_span!("api_request", method = %request.method, url = %request.url);
        async {
            let mut resends = 0;
            loop {
                match self.attempt(request).await {
                    Attempt::Done(response) => return Ok(response),
                    Attempt::Resend(err) if resends < self.retry.attempts => {
                        debug!(error = %err, resends, "resending request");
                        tokio::time::sleep(self.retry.delay(resends)).await;
                        resends += 1;
                    }
                    Attempt::Resend(err) | Attempt::Fail(err) => return Err(err),
                }
            }
        }
        .instrument(span)
        .await
    }

    fn build(&self, request: &ApiRequest) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .query(&request.query);
        if let Some(body) = &request.json_body {
            builder = builder.json(body);
        }
        if let Some(token) = &request.bearer_token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    async fn attempt(&self, request: &ApiRequest) -> Attempt {
        let response = match self.build(request).send().await {
            Ok(response) => response,
            Err(err) if is_transient_error(&err) => return Attempt::Resend(err.into()),
            Err(err) => return Attempt::Fail(err.into()),
        };

        let status = response.status();
        if status.is_success() {
            return match response.bytes().await {
                Ok(body) => Attempt::Done(ApiResponse {
                    status,
                    body: body.to_vec(),
                }),
                Err(err) => Attempt::Fail(err.into()),
            };
        }
        let err = status_error(response).await;
        if is_transient_status(status) {
            Attempt::Resend(err)
        } else {
            Attempt::Fail(err)
        }
    }
}

async fn status_error(response: reqwest::Response) -> FetchError {
    let status = response.status().as_u16();
    let url = response.url().to_string();
    let body = response.text().await.unwrap_or_default();
    FetchError::Status { status, url, body }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resend_delays_double_until_ceiling() {
        let schedule = RetrySchedule {
            attempts: 5,
            first_delay: Duration::from_millis(100),
            ceiling: Duration::from_millis(350),
        };
        let delays: Vec<_> = (0..4).map(|n| schedule.delay(n).as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 350, 350]);
        assert_eq!(schedule.delay(64), Duration::from_millis(350));
    }

    #[test]
    fn start_run_request_carries_query_body_and_token() {
        let req = ApiRequest::post("https://api.example.test/v2/acts/a~b/runs")
            .query("memory", 128)
            .query("timeout", 600)
            .json(serde_json::json!({"query": "plumber"}))
            .bearer(Some("tok"));
        assert_eq!(req.method, Method::POST);
        assert_eq!(
            req.query,
            vec![
                ("memory".to_string(), "128".to_string()),
                ("timeout".to_string(), "600".to_string())
            ]
        );
        assert_eq!(req.bearer_token.as_deref(), Some("tok"));
        assert_eq!(req.json_body, Some(serde_json::json!({"query": "plumber"})));
    }

    #[test]
    fn throttling_and_server_faults_are_transient() {
        assert!(is_transient_status(StatusCode::BAD_GATEWAY));
        assert!(is_transient_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_transient_status(StatusCode::NOT_FOUND));
        assert!(!is_transient_status(StatusCode::UNAUTHORIZED));
    }
}
