use crate::types::NodeRef;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Pub/sub abstraction matching message/signal/user/manual events to waiting
/// nodes. Keys come from [`Event::registry_key`](crate::types::Event).
#[async_trait]
pub trait EventRegistry: Send + Sync {
    async fn subscribe(&self, key: &str, subscriber: NodeRef) -> Result<()>;

    /// Remove and return every subscriber waiting on `key`.
    async fn drain(&self, key: &str) -> Result<Vec<NodeRef>>;

    /// Remove a single subscriber from `key` (targeted task completion).
    async fn unsubscribe(&self, key: &str, subscriber: &NodeRef) -> Result<()>;

    /// Drop all subscriptions of one process instance (teardown on
    /// terminate/failure).
    async fn forget_instance(&self, instance_id: Uuid) -> Result<()>;
}

/// In-memory registry over a single RwLock.
#[derive(Default)]
pub struct InMemoryEventRegistry {
    subscriptions: RwLock<HashMap<String, Vec<NodeRef>>>,
}

impl InMemoryEventRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventRegistry for InMemoryEventRegistry {
    async fn subscribe(&self, key: &str, subscriber: NodeRef) -> Result<()> {
        self.subscriptions
            .write()
            .await
            .entry(key.to_string())
            .or_default()
            .push(subscriber);
        Ok(())
    }

    async fn drain(&self, key: &str) -> Result<Vec<NodeRef>> {
        Ok(self
            .subscriptions
            .write()
            .await
            .remove(key)
            .unwrap_or_default())
    }

    async fn unsubscribe(&self, key: &str, subscriber: &NodeRef) -> Result<()> {
        let mut subs = self.subscriptions.write().await;
        if let Some(waiters) = subs.get_mut(key) {
            waiters.retain(|r| r != subscriber);
            if waiters.is_empty() {
                subs.remove(key);
            }
        }
        Ok(())
    }

    async fn forget_instance(&self, instance_id: Uuid) -> Result<()> {
        let mut subs = self.subscriptions.write().await;
        for waiters in subs.values_mut() {
            waiters.retain(|r| r.process_instance_id != instance_id);
        }
        subs.retain(|_, waiters| !waiters.is_empty());
        Ok(())
    }
}
