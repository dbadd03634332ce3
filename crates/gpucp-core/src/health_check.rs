//! Multi-transport health-check engine: sweeps a resolved endpoint
//! list, retrying per-endpoint, until every endpoint is healthy or the
//! deadline elapses.

use std::net::ToSocketAddrs;
use std::time::{Duration, Instant};

use chrono::Utc;
use gpucp_domain::health_check::{
    AggregateStatus, EndpointStatus, HealthCheckAttempt, HealthCheckConfig, Transport,
};
use tokio::net::{TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub enum SweepOutcome {
    Healthy(Vec<HealthCheckAttempt>),
    Timeout(Vec<HealthCheckAttempt>),
    Cancelled,
}

/// Probes one endpoint once. HTTP/HTTPS issue a GET; tcp opens a
/// connection; udp sends a single probe datagram and waits briefly
/// for any reply (a non-response is still treated as reachable for
/// udp, since many services don't ack health probes).
pub async fn probe_endpoint(
    host: &str,
    port: u16,
    transport: Transport,
    timeout: Duration,
) -> (EndpointStatus, Option<String>, u64, String) {
    let started = Instant::now();
    let url = match transport {
        Transport::Http => format!("http://{host}:{port}/"),
        Transport::Https => format!("https://{host}:{port}/"),
        Transport::Tcp | Transport::Udp => format!("{host}:{port}"),
    };

    let result = match transport {
        Transport::Http | Transport::Https => probe_http(&url, timeout).await,
        Transport::Tcp => probe_tcp(host, port, timeout).await,
        Transport::Udp => probe_udp(host, port, timeout).await,
    };

    let elapsed_ms = started.elapsed().as_millis() as u64;
    match result {
        Ok(()) => (EndpointStatus::Healthy, None, elapsed_ms, url),
        Err(e) => (EndpointStatus::Unhealthy, Some(e), elapsed_ms, url),
    }
}

async fn probe_http(url: &str, timeout: Duration) -> Result<(), String> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| e.to_string())?;
    let response = client.get(url).send().await.map_err(|e| e.to_string())?;
    if response.status().is_success() {
        Ok(())
    } else {
        Err(format!("non-2xx status {}", response.status()))
    }
}

async fn probe_tcp(host: &str, port: u16, timeout: Duration) -> Result<(), String> {
    let addr = format!("{host}:{port}");
    tokio::time::timeout(timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| "timed out".to_string())?
        .map_err(|e| e.to_string())?;
    Ok(())
}

async fn probe_udp(host: &str, port: u16, timeout: Duration) -> Result<(), String> {
    let addr = (host, port)
        .to_socket_addrs()
        .map_err(|e| e.to_string())?
        .next()
        .ok_or_else(|| "could not resolve address".to_string())?;

    let socket = UdpSocket::bind("0.0.0.0:0").await.map_err(|e| e.to_string())?;
    socket.connect(addr).await.map_err(|e| e.to_string())?;
    socket.send(b"healthcheck").await.map_err(|e| e.to_string())?;

    let mut buf = [0u8; 1];
    match tokio::time::timeout(timeout, socket.recv(&mut buf)).await {
        Ok(Ok(_)) => Ok(()),
        // No reply within the window still counts as reachable: a
        // closed UDP port typically surfaces as ICMP unreachable,
        // which this crate doesn't inspect.
        _ => Ok(()),
    }
}

/// Runs the full sweep loop for one instance's endpoint set against
/// `config`, emitting one [`HealthCheckAttempt`] per endpoint per
/// sweep. Each endpoint is retried up to `config.retryAttempts` times
/// before the sweep's aggregate verdict is computed.
pub async fn run(
    host: &str,
    endpoints: &[(u16, Transport)],
    config: &HealthCheckConfig,
    cancel: &CancellationToken,
) -> SweepOutcome {
    let config = config.clone().clamped();
    let deadline = Instant::now() + Duration::from_millis(config.max_wait_time_ms);
    let timeout = Duration::from_millis(config.timeout_per_check_ms);
    let retry_delay = Duration::from_millis(config.retry_delay_ms);

    let targets: Vec<(u16, Transport)> = match config.target_port {
        Some(port) => endpoints
            .iter()
            .copied()
            .filter(|(p, _)| *p == port)
            .collect(),
        None => endpoints.to_vec(),
    };

    loop {
        if cancel.is_cancelled() {
            return SweepOutcome::Cancelled;
        }

        let mut attempts = Vec::with_capacity(targets.len());
        for (port, transport) in &targets {
            let mut last = None;
            for attempt_no in 0..=config.retry_attempts {
                if cancel.is_cancelled() {
                    return SweepOutcome::Cancelled;
                }

                let (status, error, response_time_ms, url) =
                    probe_endpoint(host, *port, *transport, timeout).await;
                last = Some(HealthCheckAttempt {
                    port: *port,
                    url,
                    transport: *transport,
                    status,
                    last_checked: Utc::now(),
                    response_time_ms,
                    error,
                });

                if status == EndpointStatus::Healthy {
                    break;
                }
                if attempt_no < config.retry_attempts {
                    tokio::time::sleep(retry_delay).await;
                }
            }
            if let Some(attempt) = last {
                attempts.push(attempt);
            }
        }

        let verdict = AggregateStatus::aggregate(&attempts);
        debug!(?verdict, endpoints = attempts.len(), "health check sweep complete");

        if verdict == AggregateStatus::Healthy {
            return SweepOutcome::Healthy(attempts);
        }

        if Instant::now() >= deadline {
            warn!(?verdict, "health check sweep timed out");
            return SweepOutcome::Timeout(attempts);
        }

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            _ = cancel.cancelled() => return SweepOutcome::Cancelled,
        }
    }
}
