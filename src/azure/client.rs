//! Rate-limited Azure Resource Manager client.
//!
//! Every request runs through an ordered interceptor chain: the backpressure
//! interceptor first (may short-circuit without network I/O), then optional
//! metrics. reqwest performs no retries of its own on 429; retries are
//! governed by the gate and the controller's requeue.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::backpressure::BackpressureGate;
use super::credentials::Authorizer;
use super::retry_after;
use crate::error::{Result, SroError};
use crate::telemetry::metrics::Metrics;

/// Identity of one outbound call, as seen by interceptors.
#[derive(Debug, Clone)]
pub struct CallInfo {
    pub operation: &'static str,
    pub method: Method,
    pub url: String,
}

/// What came back from the wire.
#[derive(Debug)]
pub enum CallOutcome<'a> {
    Response {
        status: StatusCode,
        headers: &'a HeaderMap,
    },
    TransportError,
}

/// One link of the request chain.
pub trait Interceptor: Send + Sync {
    /// Runs before any network I/O. An error aborts the call.
    fn before(&self, _call: &CallInfo) -> Result<()> {
        Ok(())
    }

    /// Runs after the call, in chain order. Every interceptor sees the
    /// outcome even if an earlier one failed; the first error is returned.
    fn after(&self, _call: &CallInfo, _outcome: &CallOutcome<'_>, _elapsed: Duration) -> Result<()> {
        Ok(())
    }
}

/// Short-circuits calls while the gate is closed and closes it on 429.
pub struct BackpressureInterceptor {
    gate: Arc<BackpressureGate>,
}

impl BackpressureInterceptor {
    pub const fn new(gate: Arc<BackpressureGate>) -> Self {
        Self { gate }
    }
}

impl Interceptor for BackpressureInterceptor {
    fn before(&self, call: &CallInfo) -> Result<()> {
        if self.gate.can_proceed() {
            return Ok(());
        }
        let retry_at = self.gate.retry_after();
        debug!(
            operation = call.operation,
            retry_at = %retry_at,
            "Backpressure gate closed, skipping request"
        );
        Err(SroError::TooManyRequests {
            operation: call.operation.to_string(),
            retry_at,
        })
    }

    fn after(&self, call: &CallInfo, outcome: &CallOutcome<'_>, _elapsed: Duration) -> Result<()> {
        let CallOutcome::Response { status, headers } = outcome else {
            return Ok(());
        };
        if *status != StatusCode::TOO_MANY_REQUESTS {
            return Ok(());
        }

        let retry_at = retry_after::retry_at(headers, Utc::now());
        self.gate.not_before(retry_at);
        warn!(
            operation = call.operation,
            retry_at = %retry_at,
            "Azure API throttled request"
        );
        Err(SroError::TooManyRequests {
            operation: call.operation.to_string(),
            retry_at,
        })
    }
}

/// Records request latency and outcome.
pub struct MetricsInterceptor {
    metrics: Arc<Metrics>,
}

impl MetricsInterceptor {
    pub const fn new(metrics: Arc<Metrics>) -> Self {
        Self { metrics }
    }
}

impl Interceptor for MetricsInterceptor {
    fn before(&self, call: &CallInfo) -> Result<()> {
        self.metrics.record_api_attempt(call.operation);
        Ok(())
    }

    fn after(&self, call: &CallInfo, outcome: &CallOutcome<'_>, elapsed: Duration) -> Result<()> {
        let code = match outcome {
            CallOutcome::Response { status, .. } => status.as_u16().to_string(),
            CallOutcome::TransportError => "error".to_string(),
        };
        self.metrics
            .record_api_call(call.operation, &code, elapsed.as_secs_f64());
        Ok(())
    }
}

/// A response that passed the interceptor chain.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub operation: &'static str,
    pub status: StatusCode,
    pub body: String,
}

impl ApiResponse {
    pub fn is_not_found(&self) -> bool {
        self.status == StatusCode::NOT_FOUND
    }

    /// Fail with an Azure error unless the status is 2xx.
    pub fn error_for_status(self) -> Result<Self> {
        if self.status.is_success() {
            Ok(self)
        } else {
            Err(SroError::azure(
                self.operation,
                self.status.as_u16(),
                &self.body,
            ))
        }
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.body).map_err(|e| SroError::Azure {
            operation: self.operation.to_string(),
            status: self.status.as_u16(),
            message: format!("invalid response body: {e}"),
        })
    }
}

/// HTTP client bound to one credential and one rate-limit domain.
pub struct RateLimitedClient {
    http: reqwest::Client,
    endpoint: String,
    authorizer: Arc<dyn Authorizer>,
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl RateLimitedClient {
    /// Build a client. `interceptors` run in the given order.
    pub fn new(
        endpoint: &str,
        timeout: Duration,
        authorizer: Arc<dyn Authorizer>,
        interceptors: Vec<Arc<dyn Interceptor>>,
    ) -> Result<Self> {
        // reqwest never retries on its own; 429s surface to the interceptors once.
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SroError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            authorizer,
            interceptors,
        })
    }

    /// Absolute URL for an ARM resource path.
    pub fn url(&self, path: &str) -> String {
        if path.starts_with("https://") || path.starts_with("http://") {
            path.to_string()
        } else {
            format!("{}{}", self.endpoint, path)
        }
    }

    /// Send one request through the chain.
    pub async fn send(
        &self,
        operation: &'static str,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<ApiResponse> {
        let call = CallInfo {
            operation,
            method,
            url: self.url(path),
        };

        for interceptor in &self.interceptors {
            interceptor.before(&call)?;
        }

        let token = self.authorizer.bearer_token().await?;
        let mut request = self
            .http
            .request(call.method.clone(), &call.url)
            .bearer_auth(token);
        if let Some(body) = body {
            request = request.json(body);
        }

        let started = Instant::now();
        let sent = request.send().await;
        let elapsed = started.elapsed();

        let response = match sent {
            Ok(r) => r,
            Err(e) => {
                self.run_after(&call, &CallOutcome::TransportError, elapsed)?;
                return Err(SroError::transport(operation, e));
            }
        };

        let status = response.status();
        let headers = response.headers().clone();
        self.run_after(
            &call,
            &CallOutcome::Response {
                status,
                headers: &headers,
            },
            elapsed,
        )?;

        let body = response
            .text()
            .await
            .map_err(|e| SroError::transport(operation, e))?;

        debug!(operation, status = status.as_u16(), "Azure API call completed");
        Ok(ApiResponse {
            operation,
            status,
            body,
        })
    }

    fn run_after(&self, call: &CallInfo, outcome: &CallOutcome<'_>, elapsed: Duration) -> Result<()> {
        let mut first_err = None;
        for interceptor in &self.interceptors {
            if let Err(e) = interceptor.after(call, outcome, elapsed) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
