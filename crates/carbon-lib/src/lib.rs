//! Carbon accounting pipeline for cloud compute
//!
//! This crate provides the core functionality for:
//! - Per-account metrics collection scheduling
//! - An in-process event bus between pipeline stages
//! - Emission factor datasets and their resolution per region and instance kind
//! - Operational and embodied emissions calculation
//! - Health checks and observability

pub mod bus;
pub mod cache;
pub mod calculator;
pub mod factors;
pub mod health;
pub mod models;
pub mod observability;
pub mod provider;
pub mod scheduler;

pub use bus::{Event, EventBus, EventHandler, Topic};
pub use cache::{CachedResource, ResourceCache};
pub use calculator::{CalcError, CalculationReport, Calculator, MetricOutcome};
pub use factors::{DatasetStore, FactorError, FactorStore};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{CarbonMetrics, EmissionsReporter, StructuredLogger};
pub use provider::{ProviderCollaborator, SnapshotProvider};
pub use scheduler::{Scheduler, SchedulerBuilder, SchedulerConfig, SchedulerState};
