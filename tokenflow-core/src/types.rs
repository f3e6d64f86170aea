use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

// ─── Scalar aliases ───────────────────────────────────────────

/// Epoch milliseconds (UTC).
pub type Timestamp = i64;

/// Mutable working memory of a process instance. Values are opaque JSON —
/// the engine never interprets them beyond gateway conditions.
pub type Properties = BTreeMap<String, serde_json::Value>;

// ─── NodeRef ──────────────────────────────────────────────────

/// Identifies one node of one process instance. Used as the lookup key for
/// suspended state in the [`ProcessStore`](crate::store::ProcessStore).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeRef {
    pub group: String,
    pub process_id: String,
    pub process_instance_id: Uuid,
    pub node_id: String,
}

impl NodeRef {
    pub fn new(
        group: impl Into<String>,
        process_id: impl Into<String>,
        process_instance_id: Uuid,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            process_id: process_id.into(),
            process_instance_id,
            node_id: node_id.into(),
        }
    }

    /// Store key — colon-joined identifiers.
    pub fn key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.group, self.process_id, self.process_instance_id, self.node_id
        )
    }
}

impl std::fmt::Display for NodeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key())
    }
}

// ─── State ────────────────────────────────────────────────────

/// The token carried through a process graph: working memory plus a pointer
/// to the node it currently sits on.
///
/// Transitions produce new values (`with_node_ref`, `reentered`); the engine
/// persists a State only at wait points and deletes it on resume.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub properties: Properties,
    pub node_ref: NodeRef,
    /// True when control returns to an already-visited waiting node.
    pub is_reentry: bool,
    /// Set on child instances started by a call activity; the engine resumes
    /// the referenced parent node when the child completes.
    pub parent_reference: Option<NodeRef>,
    pub header: BTreeMap<String, String>,
}

impl State {
    pub fn new(node_ref: NodeRef) -> Self {
        Self {
            properties: Properties::new(),
            node_ref,
            is_reentry: false,
            parent_reference: None,
            header: BTreeMap::new(),
        }
    }

    /// A fresh token at `node_id` within the same instance. Resets reentry.
    pub fn with_node_ref(&self, node_id: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.node_ref.node_id = node_id.into();
        next.is_reentry = false;
        next
    }

    /// Marks the state as a reentry (external event delivered).
    pub fn reentered(mut self) -> Self {
        self.is_reentry = true;
        self
    }

    /// Merge an event payload into the working memory. Payload keys win.
    pub fn merged(mut self, payload: &Properties) -> Self {
        for (k, v) in payload {
            self.properties.insert(k.clone(), v.clone());
        }
        self
    }

    pub fn property(&self, key: &str) -> Option<&serde_json::Value> {
        self.properties.get(key)
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.properties.insert(key.into(), value);
    }
}

// ─── Event ────────────────────────────────────────────────────

/// Integration events. Message and Signal are broadcast within a group;
/// Manual and User target one node of one process definition; Error is
/// routed by the engine, not the registry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Event {
    Message { group: String, name: String },
    Signal { group: String, name: String },
    Error { group: String, code: String },
    Manual { group: String, process_id: String, node_id: String },
    User { group: String, process_id: String, node_id: String },
    None,
}

impl Event {
    /// Subscription key for the event registry.
    pub fn registry_key(&self) -> String {
        match self {
            Event::Message { group, name } => format!("{group}:message:{name}"),
            Event::Signal { group, name } => format!("{group}:signal:{name}"),
            Event::Error { group, code } => format!("{group}:error:{code}"),
            Event::Manual {
                group,
                process_id,
                node_id,
            } => format!("{group}:{process_id}:manual:{node_id}"),
            Event::User {
                group,
                process_id,
                node_id,
            } => format!("{group}:{process_id}:user:{node_id}"),
            Event::None => "none".to_string(),
        }
    }
}

// ─── Action ───────────────────────────────────────────────────

/// The result of a node's execution. The engine applies actions strictly in
/// the order returned; side effects (persistence, subscriptions, child
/// launches) happen only here, never inside `Node::execute`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Action {
    /// Advance a token to `node_id`.
    Continue { node_id: String },
    /// The current node is done. `save_state` persists the state snapshot.
    Complete { save_state: bool },
    /// Suspend the token until `event` is delivered.
    Queue { event: Event, save_state: bool },
    /// Throw an event (message/signal broadcast, or an error).
    Emit { event: Event },
    /// Arrival at a converging parallel gateway barrier.
    Join { gateway_id: String },
    /// Start a child process instance; the token suspends until it completes.
    Launch { group: String, process_id: String },
}
