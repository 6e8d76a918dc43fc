//! Loopback bus for tests and standalone runs.

use std::{collections::HashMap, sync::Arc};

use tokio::sync::{RwLock, mpsc};

use wsbridge_protocol::BusMessage;

use crate::{Bus, BusError};

/// In-process bus: published messages are delivered to every local
/// subscriber of the channel and dropped when there is none.
#[derive(Clone, Default)]
pub struct MemoryBus {
    subscribers: Arc<RwLock<HashMap<String, Vec<mpsc::UnboundedSender<BusMessage>>>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, channel: &str, message: BusMessage) -> Result<(), BusError> {
        let mut guard = self.subscribers.write().await;
        if let Some(senders) = guard.get_mut(channel) {
            senders.retain(|sender| sender.send(message.clone()).is_ok());
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: &str,
    ) -> Result<mpsc::UnboundedReceiver<BusMessage>, BusError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers
            .write()
            .await
            .entry(channel.to_string())
            .or_default()
            .push(sender);
        Ok(receiver)
    }
}
