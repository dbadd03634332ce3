//! Axum application state: the same [`ServiceRegistry`] composition
//! root `gpucp-core`'s daemon builds, plus a readiness flag owned by
//! this process (the registry's own flag only flips once its worker
//! pool is running, which this binary never starts).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use gpucp_core::ServiceRegistry;

#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<ServiceRegistry>,
    ready: Arc<AtomicBool>,
}

impl ApiState {
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self {
            registry,
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}
