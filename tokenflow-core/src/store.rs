use crate::definition::ProcessDefinition;
use crate::events::RuntimeEvent;
use crate::types::{NodeRef, Properties, State};
use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

/// Persistence trait for definitions and in-flight state.
///
/// The engine operates exclusively through this trait, enabling pluggable
/// backends (MemoryStore for tests and single-process use, Postgres behind
/// the `postgres` feature).
#[async_trait]
pub trait ProcessStore: Send + Sync {
    // ── Definitions ──

    async fn write_process(&self, group: &str, definition: &ProcessDefinition) -> Result<()>;
    async fn read_process(&self, group: &str, process_id: &str)
        -> Result<Option<ProcessDefinition>>;
    async fn delete_process(&self, group: &str, process_id: &str) -> Result<()>;

    // ── Suspended state ──

    async fn write_state(&self, state: &State) -> Result<()>;
    async fn read_state(&self, node_ref: &NodeRef) -> Result<Option<State>>;
    async fn delete_state(&self, node_ref: &NodeRef) -> Result<()>;

    /// Number of suspended states held for an instance. Zero means no token
    /// of the instance is parked.
    async fn count_states(&self, instance_id: Uuid) -> Result<u64>;

    // ── Join barriers ──

    /// Record a token's arrival at a converging gateway, folding its working
    /// memory into the barrier snapshot. Returns the new count and the merged
    /// memory of every arrival so far.
    async fn join_arrive(
        &self,
        instance_id: Uuid,
        gateway_id: &str,
        properties: &Properties,
    ) -> Result<(u16, Properties)>;
    async fn join_reset(&self, instance_id: Uuid, gateway_id: &str) -> Result<()>;

    // ── Event log (append-only) ──

    /// Append an event and return its sequence number.
    async fn append_event(&self, instance_id: Uuid, event: &RuntimeEvent) -> Result<u64>;
    async fn read_events(
        &self,
        instance_id: Uuid,
        from_seq: u64,
    ) -> Result<Vec<(u64, RuntimeEvent)>>;
}
