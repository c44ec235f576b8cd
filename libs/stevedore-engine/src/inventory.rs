use crate::client::RuntimeClient;
use crate::error::CoreResult;
use std::sync::Arc;
use stevedore_common::types::ContainerSummary;
use tracing::debug;

/// Read-only view of the containers the engine knows about
#[derive(Clone)]
pub struct ContainerInventory {
    client: Arc<dyn RuntimeClient>,
}

impl ContainerInventory {
    pub fn new(client: Arc<dyn RuntimeClient>) -> Self {
        Self { client }
    }

    /// Every container, stopped ones included, as the engine reports them
    #[tracing::instrument(skip(self))]
    pub async fn list_all(&self) -> CoreResult<Vec<ContainerSummary>> {
        let containers = self.client.list_containers(true).await?;
        debug!(count = containers.len(), "Listed containers");
        Ok(containers)
    }
}
