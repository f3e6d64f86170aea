use crate::types::{NodeRef, Timestamp};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Runtime events — the durable audit trail for every process instance.
/// Appended by the engine as it applies actions; never read back on the hot
/// path.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RuntimeEvent {
    InstanceStarted {
        instance_id: Uuid,
        process_id: String,
        definition_version: [u8; 32],
    },
    NodeEntered {
        node_id: String,
        is_reentry: bool,
    },
    NodeCompleted {
        node_id: String,
    },
    GatewayTaken {
        gateway_id: String,
        edge_to: String,
        is_default: bool,
    },
    JoinArrived {
        gateway_id: String,
        arrived: u16,
        expected: u16,
    },
    JoinReleased {
        gateway_id: String,
    },
    /// Token suspended awaiting an external event.
    StateSuspended {
        node_id: String,
        event_key: String,
    },
    EventSubscribed {
        event_key: String,
        subscriber: NodeRef,
    },
    EventDelivered {
        event_key: String,
        resumed: NodeRef,
    },
    /// An event arrived with no suspended state behind the subscription.
    GhostSignal {
        event_key: String,
        subscriber: NodeRef,
    },
    EventEmitted {
        event_key: String,
        source_node: String,
    },
    ErrorRaised {
        code: String,
        source_node: String,
    },
    SubprocessLaunched {
        child_instance_id: Uuid,
        process_id: String,
        parent_node: String,
    },
    ParentResumed {
        parent: NodeRef,
        child_instance_id: Uuid,
    },
    InstanceCompleted {
        at: Timestamp,
    },
    /// Terminate end reached — every pending token dropped.
    InstanceTerminated {
        at: Timestamp,
        node_id: String,
    },
    InstanceFailed {
        code: String,
        at: Timestamp,
    },
}
