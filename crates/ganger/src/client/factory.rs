//! One profile, every provisioning operation.

use crate::address::SocketAddress;
use crate::bootstrap::BootstrapProfile;
use crate::client::{SharedWorker, Worker, WorkerPool};
use crate::error::Result;
use crate::status::WorkerStatus;

/// Facade binding a [`BootstrapProfile`] to the client-side operations, so
/// call sites name only the worker type and address.
#[derive(Debug, Clone, Default)]
pub struct WorkerFactory {
    profile: BootstrapProfile,
}

impl WorkerFactory {
    pub fn new(profile: BootstrapProfile) -> Self {
        Self { profile }
    }

    pub fn profile(&self) -> &BootstrapProfile {
        &self.profile
    }

    pub fn profile_mut(&mut self) -> &mut BootstrapProfile {
        &mut self.profile
    }

    pub async fn create_worker(&self, type_name: &str) -> Result<Worker> {
        Worker::spawn(&self.profile, type_name).await
    }

    pub async fn create_worker_with_expression(&self, expression: &str) -> Result<Worker> {
        Worker::spawn_with_expression(&self.profile, expression).await
    }

    pub async fn create_worker_pool(
        &self,
        type_name: &str,
        count: Option<usize>,
    ) -> Result<WorkerPool> {
        WorkerPool::spawn(&self.profile, type_name, count).await
    }

    pub async fn create_worker_pool_with_expression(
        &self,
        expression: &str,
        count: Option<usize>,
    ) -> Result<WorkerPool> {
        WorkerPool::spawn_with_expression(&self.profile, expression, count).await
    }

    pub async fn connect_to_shared_worker(
        &self,
        address: impl Into<SocketAddress>,
        type_name: &str,
    ) -> Result<SharedWorker> {
        SharedWorker::connect_or_launch(address.into(), &self.profile, type_name).await
    }

    pub async fn connect_to_shared_worker_with_expression(
        &self,
        address: impl Into<SocketAddress>,
        expression: &str,
    ) -> Result<SharedWorker> {
        SharedWorker::connect_or_launch_with_expression(address.into(), &self.profile, expression)
            .await
    }

    pub async fn start_shared_worker(
        &self,
        address: impl Into<SocketAddress>,
        type_name: &str,
    ) -> Result<()> {
        SharedWorker::start(&address.into(), &self.profile, type_name).await
    }

    pub async fn stop_shared_worker(&self, address: impl Into<SocketAddress>) -> Result<bool> {
        SharedWorker::stop_worker(&address.into(), &self.profile).await
    }

    pub async fn query_shared_worker(
        &self,
        address: impl Into<SocketAddress>,
    ) -> Result<WorkerStatus> {
        SharedWorker::query_worker(&address.into(), &self.profile).await
    }
}
