//! Link roles, their role-specific settings, and the handles callers get
//! back from [`crate::scope::ConnectionScope`] (spec.md §3, §6).

pub mod naming;
pub mod opener;

use fe2o3_amqp::{Receiver, Sender};
use fe2o3_amqp_management::client::MgmtClient;

use crate::error::Result;
use crate::registry::{ActiveLinkRegistry, LinkHandleId};
use std::sync::Arc;

/// Options recognised when opening a consumer link (spec.md §6).
#[derive(Debug, Clone, Default)]
pub struct ConsumerOptions {
    /// Link credit; `auto_flow` is derived as `prefetch_count > 0`.
    pub prefetch_count: u32,
    /// Exclusive epoch consumer ownership level, if any.
    pub owner_level: Option<i64>,
    /// Whether to request the `TrackLastEnqueuedEventInformation` desired
    /// capability.
    pub track_last_enqueued_event_information: bool,
}

impl ConsumerOptions {
    pub fn auto_flow(&self) -> bool {
        self.prefetch_count > 0
    }
}

/// A request/response link attached to the service-defined management
/// address. Never authorized via CBS (spec.md §3).
pub struct ManagementLink {
    pub(crate) client: MgmtClient,
    pub(crate) id: LinkHandleId,
    pub(crate) name: String,
    pub(crate) registry: Arc<ActiveLinkRegistry>,
}

impl ManagementLink {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn client_mut(&mut self) -> &mut MgmtClient {
        &mut self.client
    }

    pub async fn close(mut self) -> Result<()> {
        self.registry.remove_and_dispose(self.id).await;
        let _ = self.client.close().await;
        Ok(())
    }
}

/// A sending link.
pub struct ProducerLink {
    pub(crate) sender: Sender,
    pub(crate) id: LinkHandleId,
    pub(crate) name: String,
    pub(crate) registry: Arc<ActiveLinkRegistry>,
}

impl ProducerLink {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sender_mut(&mut self) -> &mut Sender {
        &mut self.sender
    }

    pub async fn close(mut self) -> Result<()> {
        self.registry.remove_and_dispose(self.id).await;
        let _ = self.sender.close().await;
        Ok(())
    }
}

/// A receiving link.
pub struct ConsumerLink {
    pub(crate) receiver: Receiver,
    pub(crate) id: LinkHandleId,
    pub(crate) name: String,
    pub(crate) registry: Arc<ActiveLinkRegistry>,
}

impl ConsumerLink {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn receiver_mut(&mut self) -> &mut Receiver {
        &mut self.receiver
    }

    pub async fn close(mut self) -> Result<()> {
        self.registry.remove_and_dispose(self.id).await;
        let _ = self.receiver.close().await;
        Ok(())
    }
}
