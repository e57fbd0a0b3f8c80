//! Cloud provider collaborators
//!
//! A collaborator discovers an account's compute instances and samples
//! their utilization. Concrete cloud SDK clients live outside this crate;
//! they plug into the scheduler through [`ProviderCollaborator`].

mod snapshot;

pub use snapshot::SnapshotProvider;

use crate::models::{Instance, Provider};
use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Contract the scheduler requires from a provider client
#[async_trait]
pub trait ProviderCollaborator: Send + Sync {
    /// Provider this collaborator talks to
    fn provider(&self) -> Provider;

    /// Discover the account's resources and refresh the resource cache
    async fn refresh(&self, account: &str) -> Result<()>;

    /// Current utilization metrics of known instances over `interval`
    async fn metrics_for_instances(&self, interval: Duration) -> Result<Vec<Instance>>;

    /// Flush and stop background work such as metric exporters
    async fn shutdown(&self) {}

    /// Release clients and connections
    async fn close(&self) -> Result<()>;
}
