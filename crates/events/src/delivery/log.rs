use async_trait::async_trait;

use super::{Collaborator, DeliveryError};
use crate::StorefrontEvent;

/// Collaborator that only writes accepted events to the log.
///
/// Stands in for a collaborator whose endpoint is not configured.
#[derive(Debug, Clone)]
pub struct TracingCollaborator {
    name: String,
    event_types: &'static [&'static str],
}

impl TracingCollaborator {
    pub fn new(name: impl Into<String>, event_types: &'static [&'static str]) -> Self {
        Self {
            name: name.into(),
            event_types,
        }
    }
}

#[async_trait]
impl Collaborator for TracingCollaborator {
    fn name(&self) -> &str {
        &self.name
    }

    fn accepts(&self, event: &StorefrontEvent) -> bool {
        self.event_types.contains(&event.event_type())
    }

    async fn deliver(&self, event: &StorefrontEvent) -> Result<(), DeliveryError> {
        tracing::info!(
            collaborator = %self.name,
            event_type = event.event_type(),
            order_id = %event.order_id(),
            "storefront event"
        );
        Ok(())
    }
}
