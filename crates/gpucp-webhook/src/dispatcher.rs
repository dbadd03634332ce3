//! Sends HTTP POST requests to caller-supplied webhook URLs with HMAC
//! signatures over typed lifecycle payloads.

use std::time::{Duration, Instant};

use gpucp_common::{exponential_backoff, sign_hmac};
use gpucp_domain::webhook::WebhookPayload;
use reqwest::Client;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct DeliveryOutcome {
    pub success: bool,
    pub status_code: Option<u16>,
    pub attempts: u32,
    pub duration_ms: u64,
    pub error_message: Option<String>,
}

pub struct WebhookDispatcher {
    client: Client,
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    default_secret: String,
}

impl WebhookDispatcher {
    pub fn new(
        timeout: Duration,
        max_attempts: u32,
        base_delay: Duration,
        default_secret: String,
    ) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            max_attempts,
            base_delay,
            max_delay: Duration::from_secs(30),
            default_secret,
        })
    }

    /// Deliver one lifecycle payload, retrying on network errors and
    /// 5xx. A 4xx response is terminal: the caller's endpoint rejected
    /// the payload and retrying it won't change that. Delivery is
    /// best-effort: the final outcome is reported but never turned
    /// into an `Err` that would interrupt the instance state machine.
    pub async fn dispatch(
        &self,
        url: &str,
        payload: &WebhookPayload,
        secret_override: Option<&str>,
    ) -> DeliveryOutcome {
        let start = Instant::now();
        let secret = secret_override.unwrap_or(&self.default_secret);

        let body = match serde_json::to_string(payload) {
            Ok(body) => body,
            Err(e) => {
                return DeliveryOutcome {
                    success: false,
                    status_code: None,
                    attempts: 0,
                    duration_ms: start.elapsed().as_millis() as u64,
                    error_message: Some(format!("failed to serialize payload: {e}")),
                }
            }
        };

        let signature = format!("sha256={}", sign_hmac(&body, secret));
        let timestamp = chrono::Utc::now().timestamp().to_string();

        let mut last_status = None;
        let mut last_error = None;

        for attempt in 1..=self.max_attempts {
            debug!(url = %redact_url(url), attempt, "dispatching webhook");

            let result = self
                .client
                .post(url)
                .header("Content-Type", "application/json")
                .header("X-Webhook-Signature", signature.clone())
                .header("X-Webhook-Timestamp", timestamp.clone())
                .body(body.clone())
                .send()
                .await;

            match result {
                Ok(response) => {
                    let status = response.status();
                    last_status = Some(status.as_u16());

                    if status.is_success() {
                        info!(
                            url = %redact_url(url),
                            status = status.as_u16(),
                            attempt,
                            "webhook delivered"
                        );
                        return DeliveryOutcome {
                            success: true,
                            status_code: last_status,
                            attempts: attempt,
                            duration_ms: start.elapsed().as_millis() as u64,
                            error_message: None,
                        };
                    }

                    if !status.is_server_error()
                        && status.as_u16() != 408
                        && status.as_u16() != 429
                    {
                        warn!(
                            url = %redact_url(url),
                            status = status.as_u16(),
                            "webhook rejected, not retrying"
                        );
                        return DeliveryOutcome {
                            success: false,
                            status_code: last_status,
                            attempts: attempt,
                            duration_ms: start.elapsed().as_millis() as u64,
                            error_message: Some(format!("endpoint returned {status}")),
                        };
                    }

                    last_error = Some(format!("endpoint returned {status}"));
                }
                Err(e) => {
                    last_error = Some(e.to_string());
                }
            }

            if attempt < self.max_attempts {
                let delay = exponential_backoff(attempt, self.base_delay, self.max_delay);
                tokio::time::sleep(delay).await;
            }
        }

        warn!(
            url = %redact_url(url),
            attempts = self.max_attempts,
            "webhook delivery exhausted retries"
        );
        DeliveryOutcome {
            success: false,
            status_code: last_status,
            attempts: self.max_attempts,
            duration_ms: start.elapsed().as_millis() as u64,
            error_message: last_error,
        }
    }
}

/// Webhook URLs are caller-supplied and may embed credentials in the
/// query string; only the scheme and host are worth logging.
fn redact_url(url: &str) -> String {
    reqwest::Url::parse(url)
        .map(|u| format!("{}://{}", u.scheme(), u.host_str().unwrap_or("?")))
        .unwrap_or_else(|_| "invalid-url".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpucp_domain::webhook::WebhookEventKind;
    use uuid::Uuid;

    fn payload() -> WebhookPayload {
        WebhookPayload::new(Uuid::new_v4(), WebhookEventKind::Ready)
    }

    #[tokio::test]
    async fn delivers_successfully_on_2xx() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/hook")
            .with_status(200)
            .create_async()
            .await;

        let dispatcher =
            WebhookDispatcher::new(Duration::from_secs(5), 3, Duration::from_millis(1), "s".into())
                .unwrap();
        let outcome = dispatcher
            .dispatch(&format!("{}/hook", server.url()), &payload(), None)
            .await;

        mock.assert_async().await;
        assert!(outcome.success);
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn does_not_retry_4xx() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/hook")
            .with_status(400)
            .expect(1)
            .create_async()
            .await;

        let dispatcher =
            WebhookDispatcher::new(Duration::from_secs(5), 3, Duration::from_millis(1), "s".into())
                .unwrap();
        let outcome = dispatcher
            .dispatch(&format!("{}/hook", server.url()), &payload(), None)
            .await;

        mock.assert_async().await;
        assert!(!outcome.success);
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn retries_on_5xx_then_succeeds() {
        let mut server = mockito::Server::new_async().await;
        let fail = server
            .mock("POST", "/hook")
            .with_status(503)
            .expect(1)
            .create_async()
            .await;
        let ok = server
            .mock("POST", "/hook")
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let dispatcher =
            WebhookDispatcher::new(Duration::from_secs(5), 3, Duration::from_millis(1), "s".into())
                .unwrap();
        let outcome = dispatcher
            .dispatch(&format!("{}/hook", server.url()), &payload(), None)
            .await;

        fail.assert_async().await;
        ok.assert_async().await;
        assert!(outcome.success);
        assert_eq!(outcome.attempts, 2);
    }

    #[test]
    fn redact_url_strips_query_and_path() {
        assert_eq!(
            redact_url("https://example.com/hook?token=secret"),
            "https://example.com"
        );
    }
}
