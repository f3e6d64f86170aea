use crate::definition::ProcessDefinition;
use crate::events::RuntimeEvent;
use crate::store::ProcessStore;
use crate::types::{NodeRef, Properties, State};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    /// "{group}:{process_id}" → definition.
    processes: HashMap<String, ProcessDefinition>,
    /// NodeRef key → suspended state.
    states: HashMap<String, State>,
    /// "{instance_id}:{gateway_id}" → (arrive count, merged branch memory).
    joins: HashMap<String, (u16, Properties)>,
    /// instance_id → ordered event log.
    events: HashMap<Uuid, Vec<RuntimeEvent>>,
}

/// In-memory store. Safe within one process (single RwLock over the maps);
/// makes no cross-process claims.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn process_key(group: &str, process_id: &str) -> String {
        format!("{group}:{process_id}")
    }

    fn join_key(instance_id: Uuid, gateway_id: &str) -> String {
        format!("{instance_id}:{gateway_id}")
    }
}

#[async_trait]
impl ProcessStore for MemoryStore {
    async fn write_process(&self, group: &str, definition: &ProcessDefinition) -> Result<()> {
        let key = Self::process_key(group, &definition.id);
        self.inner
            .write()
            .await
            .processes
            .insert(key, definition.clone());
        Ok(())
    }

    async fn read_process(
        &self,
        group: &str,
        process_id: &str,
    ) -> Result<Option<ProcessDefinition>> {
        let key = Self::process_key(group, process_id);
        Ok(self.inner.read().await.processes.get(&key).cloned())
    }

    async fn delete_process(&self, group: &str, process_id: &str) -> Result<()> {
        let key = Self::process_key(group, process_id);
        self.inner.write().await.processes.remove(&key);
        Ok(())
    }

    async fn write_state(&self, state: &State) -> Result<()> {
        self.inner
            .write()
            .await
            .states
            .insert(state.node_ref.key(), state.clone());
        Ok(())
    }

    async fn read_state(&self, node_ref: &NodeRef) -> Result<Option<State>> {
        Ok(self.inner.read().await.states.get(&node_ref.key()).cloned())
    }

    async fn delete_state(&self, node_ref: &NodeRef) -> Result<()> {
        self.inner.write().await.states.remove(&node_ref.key());
        Ok(())
    }

    async fn count_states(&self, instance_id: Uuid) -> Result<u64> {
        Ok(self
            .inner
            .read()
            .await
            .states
            .values()
            .filter(|s| s.node_ref.process_instance_id == instance_id)
            .count() as u64)
    }

    async fn join_arrive(
        &self,
        instance_id: Uuid,
        gateway_id: &str,
        properties: &Properties,
    ) -> Result<(u16, Properties)> {
        let key = Self::join_key(instance_id, gateway_id);
        let mut inner = self.inner.write().await;
        let (count, merged) = inner
            .joins
            .entry(key)
            .or_insert_with(|| (0, Properties::new()));
        *count += 1;
        for (k, v) in properties {
            merged.insert(k.clone(), v.clone());
        }
        Ok((*count, merged.clone()))
    }

    async fn join_reset(&self, instance_id: Uuid, gateway_id: &str) -> Result<()> {
        let key = Self::join_key(instance_id, gateway_id);
        self.inner.write().await.joins.remove(&key);
        Ok(())
    }

    async fn append_event(&self, instance_id: Uuid, event: &RuntimeEvent) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let log = inner.events.entry(instance_id).or_default();
        log.push(event.clone());
        Ok(log.len() as u64 - 1)
    }

    async fn read_events(
        &self,
        instance_id: Uuid,
        from_seq: u64,
    ) -> Result<Vec<(u64, RuntimeEvent)>> {
        let inner = self.inner.read().await;
        let log = inner.events.get(&instance_id).cloned().unwrap_or_default();
        Ok(log
            .into_iter()
            .enumerate()
            .map(|(i, e)| (i as u64, e))
            .filter(|(i, _)| *i >= from_seq)
            .collect())
    }
}
