//! The provider HTTP client: every outbound call to the external
//! provider passes through the rate limiter, the circuit breaker, and
//! the retry wrapper, in that order.

use std::time::Duration;

use gpucp_common::error::{Error, Result};
use gpucp_domain::health_check::PortDeclaration;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::circuit_breaker::CircuitBreaker;
use crate::metrics::PROVIDER_METRICS;
use crate::rate_limiter::RequestQueue;
use crate::retry::{with_retry, RetryableOutcome};
use crate::wire::{
    CreateInstanceWireRequest, PagedResponse, ProviderInstance, ProviderJob, ProviderProduct,
    ProviderRegistryAuth, ProviderTemplate,
};

#[derive(Debug)]
struct CallError {
    status: Option<u16>,
    retry_after: Option<Duration>,
    message: String,
    code: String,
}

impl RetryableOutcome for CallError {
    fn http_status(&self) -> Option<u16> {
        self.status
    }
    fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }
}

impl From<CallError> for Error {
    fn from(err: CallError) -> Self {
        match err.status {
            Some(429) => Error::RateLimit {
                retry_after_secs: err.retry_after.map(|d| d.as_secs()).unwrap_or(1),
            },
            Some(status) => Error::ProviderClient {
                status,
                code: err.code,
                details: err.message,
            },
            None => Error::Network {
                message: err.message,
                retryable: true,
            },
        }
    }
}

pub struct ProviderClient {
    http: reqwest::Client,
    base_url: String,
    api_credential: String,
    queue: RequestQueue,
    breaker: CircuitBreaker,
    max_retries: u32,
    retry_base_delay: Duration,
    retry_max_delay: Duration,
}

pub struct ProviderClientConfig {
    pub base_url: String,
    pub api_credential: String,
    pub request_timeout: Duration,
    pub rate_limit_window: Duration,
    pub rate_limit_max_requests: u32,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_timeout: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl ProviderClient {
    pub fn new(config: ProviderClientConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            http,
            base_url: config.base_url,
            api_credential: config.api_credential,
            queue: RequestQueue::new(config.rate_limit_window, config.rate_limit_max_requests),
            breaker: CircuitBreaker::new(
                config.circuit_breaker_threshold,
                config.circuit_breaker_timeout,
            ),
            max_retries: config.max_retries,
            retry_base_delay: config.retry_base_delay,
            retry_max_delay: Duration::from_secs(30),
        })
    }

    /// Run a single HTTP call through the three interposing layers:
    /// request queue, circuit breaker, retry.
    #[instrument(skip(self, correlation_id, cancel, build))]
    async fn call<T, F>(
        &self,
        method: Method,
        path: &str,
        correlation_id: Uuid,
        cancel: &CancellationToken,
        build: F,
    ) -> Result<T>
    where
        T: DeserializeOwned,
        F: Fn(reqwest::RequestBuilder) -> reqwest::RequestBuilder,
    {
        if !self.breaker.should_allow_request() {
            PROVIDER_METRICS.circuit_open_total.inc();
            return Err(Error::CircuitOpen);
        }

        if self.queue.acquire(cancel).await.is_none() {
            return Err(Error::Network {
                message: "request cancelled while waiting for rate limiter".into(),
                retryable: false,
            });
        }

        let url = format!("{}{}", self.base_url, path);
        let result = with_retry(
            self.max_retries,
            self.retry_base_delay,
            self.retry_max_delay,
            || async {
                let request = build(
                    self.http
                        .request(method.clone(), &url)
                        .bearer_auth(&self.api_credential)
                        .header("X-Correlation-Id", correlation_id.to_string()),
                );

                let response = request.send().await.map_err(|e| CallError {
                    status: e.status().map(|s| s.as_u16()),
                    retry_after: None,
                    message: e.to_string(),
                    code: "REQUEST_FAILED".into(),
                })?;

                let status = response.status();
                if status.is_success() {
                    response.json::<T>().await.map_err(|e| CallError {
                        status: Some(status.as_u16()),
                        retry_after: None,
                        message: e.to_string(),
                        code: "DECODE_FAILED".into(),
                    })
                } else {
                    let retry_after = retry_after_header(&response);
                    let body = response.text().await.unwrap_or_default();
                    Err(CallError {
                        status: Some(status.as_u16()),
                        retry_after,
                        message: body,
                        code: status_code_name(status),
                    })
                }
            },
        )
        .await;

        match result {
            Ok(value) => {
                self.breaker.record_success();
                PROVIDER_METRICS.requests_total.inc();
                Ok(value)
            }
            Err(err) => {
                if err.status.map(|s| s >= 500).unwrap_or(true) {
                    self.breaker.record_failure();
                }
                PROVIDER_METRICS.failures_total.inc();
                warn!(status = ?err.status, "provider call failed");
                Err(err.into())
            }
        }
    }

    pub async fn list_products(
        &self,
        name: Option<&str>,
        region: Option<&str>,
        billing_method: Option<&str>,
        correlation_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Vec<ProviderProduct>> {
        let response: PagedResponse<ProviderProduct> = self
            .call(
                Method::GET,
                "/v1/products",
                correlation_id,
                cancel,
                |req| {
                    let mut req = req;
                    if let Some(name) = name {
                        req = req.query(&[("name", name)]);
                    }
                    if let Some(region) = region {
                        req = req.query(&[("region", region)]);
                    }
                    if let Some(billing_method) = billing_method {
                        req = req.query(&[("billingMethod", billing_method)]);
                    }
                    req
                },
            )
            .await?;
        Ok(response.items)
    }

    pub async fn get_template(
        &self,
        template_id: &str,
        correlation_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<ProviderTemplate> {
        let path = format!("/v1/template/{template_id}");
        self.call(Method::GET, &path, correlation_id, cancel, |req| req)
            .await
    }

    pub async fn list_registry_auths(
        &self,
        correlation_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Vec<ProviderRegistryAuth>> {
        self.call(
            Method::GET,
            "/v1/repository/auths",
            correlation_id,
            cancel,
            |req| req,
        )
        .await
    }

    pub async fn create_instance(
        &self,
        request: &CreateInstanceWireRequest,
        correlation_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<ProviderInstance> {
        self.call(
            Method::POST,
            "/v1/instances/create",
            correlation_id,
            cancel,
            |req| req.json(request),
        )
        .await
    }

    pub async fn get_instance(
        &self,
        provider_id: &str,
        correlation_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<ProviderInstance> {
        let path = format!("/v1/instances/{provider_id}");
        self.call(Method::GET, &path, correlation_id, cancel, |req| req)
            .await
    }

    pub async fn list_instances(
        &self,
        page_token: Option<&str>,
        correlation_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<PagedResponse<ProviderInstance>> {
        self.call(
            Method::GET,
            "/v1/instances",
            correlation_id,
            cancel,
            |req| match page_token {
                Some(token) => req.query(&[("pageToken", token)]),
                None => req,
            },
        )
        .await
    }

    pub async fn start_instance(
        &self,
        provider_id: &str,
        correlation_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<ProviderInstance> {
        let path = format!("/v1/instances/{provider_id}/start");
        self.call(Method::POST, &path, correlation_id, cancel, |req| req)
            .await
    }

    pub async fn stop_instance(
        &self,
        provider_id: &str,
        correlation_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<ProviderInstance> {
        let path = format!("/v1/instances/{provider_id}/stop");
        self.call(Method::POST, &path, correlation_id, cancel, |req| req)
            .await
    }

    pub async fn delete_instance(
        &self,
        provider_id: &str,
        correlation_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let path = format!("/v1/instances/{provider_id}/delete");
        self.call::<serde_json::Value, _>(Method::POST, &path, correlation_id, cancel, |req| req)
            .await?;
        Ok(())
    }

    pub async fn migrate_instance(
        &self,
        provider_id: &str,
        correlation_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<ProviderInstance> {
        let path = format!("/v1/instances/{provider_id}/migrate");
        self.call(Method::POST, &path, correlation_id, cancel, |req| req)
            .await
    }

    pub async fn list_jobs(
        &self,
        correlation_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Vec<ProviderJob>> {
        self.call(Method::GET, "/v1/jobs", correlation_id, cancel, |req| req)
            .await
    }

    /// Health-check ping against a resolved endpoint set is performed
    /// by `gpucp-core`'s health-check engine directly (it needs
    /// tcp/udp transports the provider client doesn't speak); this
    /// client only exposes the provider's own liveness endpoint.
    pub async fn ping(&self, correlation_id: Uuid, cancel: &CancellationToken) -> Result<()> {
        self.call::<serde_json::Value, _>(Method::GET, "/v1/ping", correlation_id, cancel, |req| {
            req
        })
        .await?;
        Ok(())
    }

    pub fn breaker_state(&self) -> crate::circuit_breaker::CircuitState {
        self.breaker.state()
    }
}

fn retry_after_header(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn status_code_name(status: StatusCode) -> String {
    status
        .canonical_reason()
        .unwrap_or("UNKNOWN")
        .to_uppercase()
        .replace(' ', "_")
}

/// Resolve the optimal product for a create-instance request: filter
/// by name/region/billing method, pick the cheapest available; if
/// none, walk the region-fallback list in priority order.
pub async fn resolve_product(
    client: &ProviderClient,
    product_name: &str,
    primary_region: &str,
    region_fallback: &[String],
    billing_method: Option<&str>,
    correlation_id: Uuid,
    cancel: &CancellationToken,
) -> Result<crate::wire::ProviderProduct> {
    for region in std::iter::once(primary_region).chain(region_fallback.iter().map(String::as_str))
    {
        let products = client
            .list_products(
                Some(product_name),
                Some(region),
                billing_method,
                correlation_id,
                cancel,
            )
            .await?;

        if let Some(cheapest) = products
            .into_iter()
            .filter(|p| p.available)
            .min_by(|a, b| a.price_per_hour.total_cmp(&b.price_per_hour))
        {
            return Ok(cheapest);
        }
    }

    Err(Error::ResourceConstraints(format!(
        "no available product '{product_name}' in {primary_region} or fallback regions"
    )))
}

/// Flatten a template's port groups for the health-check engine.
pub fn template_ports(template: &ProviderTemplate) -> Vec<PortDeclaration> {
    template.flattened_ports()
}
