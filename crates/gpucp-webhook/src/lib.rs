//! # gpucp-webhook
//!
//! Best-effort delivery of HMAC-signed lifecycle payloads to
//! caller-supplied webhook URLs.

pub mod dispatcher;
pub mod lifecycle;

pub use dispatcher::{DeliveryOutcome, WebhookDispatcher};
