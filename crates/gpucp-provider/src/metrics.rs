//! Prometheus metrics for the provider client.

use lazy_static::lazy_static;
use prometheus::{opts, register_int_counter, IntCounter};

pub struct ProviderMetrics {
    pub requests_total: IntCounter,
    pub failures_total: IntCounter,
    pub circuit_open_total: IntCounter,
}

lazy_static! {
    pub static ref PROVIDER_METRICS: ProviderMetrics = ProviderMetrics {
        requests_total: register_int_counter!(opts!(
            "provider_requests_total",
            "Total successful provider requests"
        ))
        .expect("metric can be created"),
        failures_total: register_int_counter!(opts!(
            "provider_failures_total",
            "Total failed provider requests"
        ))
        .expect("metric can be created"),
        circuit_open_total: register_int_counter!(opts!(
            "provider_circuit_open_total",
            "Total calls rejected by an open circuit breaker"
        ))
        .expect("metric can be created"),
    };
}
