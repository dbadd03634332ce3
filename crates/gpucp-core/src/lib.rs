//! The control-plane daemon: instance state store, job workers, and
//! the auto-stop/migration schedulers.

pub mod cache;
pub mod health_check;
pub mod merge;
pub mod registry;
pub mod runtime_health;
pub mod scheduler;
pub mod startup;
pub mod store;
pub mod workers;

pub use registry::ServiceRegistry;
pub use store::{InstanceFilter, InstanceStore};
