pub mod bpmn_xml;
pub mod validate;
pub mod yaml;

use crate::error::EngineError;
use crate::nodes::{build_node, Node};
use crate::types::Properties;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;

// ── Helper defaults for serde ──

fn is_false(v: &bool) -> bool {
    !v
}

// ─── Top-level definition ─────────────────────────────────────

/// A process graph as authored: nodes plus directed edges. This is the form
/// persisted by [`ProcessStore::write_process`](crate::store::ProcessStore).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessDefinition {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<DefinitionMeta>,
    pub nodes: Vec<NodeSpec>,
    pub edges: Vec<EdgeSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefinitionMeta {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

// ─── Edges ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_default: bool,
}

impl EdgeSpec {
    /// An unconditioned edge.
    pub fn direct(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: None,
            is_default: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub property: String,
    pub op: ConditionOp,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionOp {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Neq,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">")]
    Gt,
}

impl Condition {
    /// Evaluate against working memory. Missing properties compare as JSON
    /// null; ordered comparisons require both sides numeric.
    pub fn evaluate(&self, properties: &Properties) -> bool {
        let actual = properties
            .get(&self.property)
            .unwrap_or(&serde_json::Value::Null);
        match self.op {
            ConditionOp::Eq => actual == &self.value,
            ConditionOp::Neq => actual != &self.value,
            ConditionOp::Lt => match (actual.as_f64(), self.value.as_f64()) {
                (Some(a), Some(b)) => a < b,
                _ => false,
            },
            ConditionOp::Gt => match (actual.as_f64(), self.value.as_f64()) {
                (Some(a), Some(b)) => a > b,
                _ => false,
            },
        }
    }
}

// ─── Nodes (tagged enum) ──────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GatewayDirection {
    Diverging,
    Converging,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum NodeSpec {
    Start {
        id: String,
    },
    End {
        id: String,
        #[serde(default)]
        terminate: bool,
    },
    ErrorEnd {
        id: String,
        code: String,
    },
    ServiceTask {
        id: String,
        task_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_code: Option<String>,
    },
    ScriptTask {
        id: String,
        source: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_code: Option<String>,
    },
    BusinessRuleTask {
        id: String,
        decision: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_code: Option<String>,
    },
    UserTask {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        assignee: Option<String>,
    },
    ManualTask {
        id: String,
    },
    ExclusiveGateway {
        id: String,
    },
    ParallelGateway {
        id: String,
        direction: GatewayDirection,
    },
    MessageCatch {
        id: String,
        message: String,
    },
    MessageThrow {
        id: String,
        message: String,
    },
    SignalCatch {
        id: String,
        signal: String,
    },
    SignalThrow {
        id: String,
        signal: String,
    },
    CallActivity {
        id: String,
        process_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group: Option<String>,
    },
}

impl NodeSpec {
    pub fn id(&self) -> &str {
        match self {
            NodeSpec::Start { id }
            | NodeSpec::End { id, .. }
            | NodeSpec::ErrorEnd { id, .. }
            | NodeSpec::ServiceTask { id, .. }
            | NodeSpec::ScriptTask { id, .. }
            | NodeSpec::BusinessRuleTask { id, .. }
            | NodeSpec::UserTask { id, .. }
            | NodeSpec::ManualTask { id }
            | NodeSpec::ExclusiveGateway { id }
            | NodeSpec::ParallelGateway { id, .. }
            | NodeSpec::MessageCatch { id, .. }
            | NodeSpec::MessageThrow { id, .. }
            | NodeSpec::SignalCatch { id, .. }
            | NodeSpec::SignalThrow { id, .. }
            | NodeSpec::CallActivity { id, .. } => id,
        }
    }

    /// End nodes take no outgoing edges.
    pub fn is_end(&self) -> bool {
        matches!(self, NodeSpec::End { .. } | NodeSpec::ErrorEnd { .. })
    }
}

// ─── Compiled form ────────────────────────────────────────────

/// A validated definition with behaviors and edge indexes built, ready for
/// the engine. Not serialized — the DTO is what the store persists.
pub struct CompiledDefinition {
    definition: ProcessDefinition,
    version: [u8; 32],
    nodes: HashMap<String, Arc<dyn Node>>,
    specs: HashMap<String, NodeSpec>,
    outgoing: HashMap<String, Vec<EdgeSpec>>,
    incoming: HashMap<String, u16>,
    start_id: String,
}

impl CompiledDefinition {
    pub fn process_id(&self) -> &str {
        &self.definition.id
    }

    /// SHA-256 of the canonical JSON serialization — the version key.
    pub fn version(&self) -> [u8; 32] {
        self.version
    }

    pub fn definition(&self) -> &ProcessDefinition {
        &self.definition
    }

    pub fn start_id(&self) -> &str {
        &self.start_id
    }

    pub fn node(&self, id: &str) -> Option<Arc<dyn Node>> {
        self.nodes.get(id).cloned()
    }

    pub fn spec(&self, id: &str) -> Option<&NodeSpec> {
        self.specs.get(id)
    }

    pub fn outgoing(&self, id: &str) -> &[EdgeSpec] {
        self.outgoing.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn incoming_count(&self, id: &str) -> u16 {
        self.incoming.get(id).copied().unwrap_or(0)
    }
}

/// Compute the definition version hash.
pub fn definition_version(definition: &ProcessDefinition) -> [u8; 32] {
    let canonical = serde_json::to_vec(definition).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    hasher.finalize().into()
}

/// Validate and index a definition. All validation errors are reported at
/// once via [`EngineError::InvalidDefinition`].
pub fn compile(definition: ProcessDefinition) -> Result<CompiledDefinition, EngineError> {
    let errors = validate::validate(&definition);
    if !errors.is_empty() {
        return Err(EngineError::InvalidDefinition {
            id: definition.id,
            errors,
        });
    }

    let version = definition_version(&definition);

    let mut nodes = HashMap::new();
    let mut specs = HashMap::new();
    let mut start_id = String::new();
    for spec in &definition.nodes {
        if matches!(spec, NodeSpec::Start { .. }) {
            start_id = spec.id().to_string();
        }
        nodes.insert(spec.id().to_string(), build_node(spec));
        specs.insert(spec.id().to_string(), spec.clone());
    }

    let mut outgoing: HashMap<String, Vec<EdgeSpec>> = HashMap::new();
    let mut incoming: HashMap<String, u16> = HashMap::new();
    for edge in &definition.edges {
        outgoing.entry(edge.from.clone()).or_default().push(edge.clone());
        *incoming.entry(edge.to.clone()).or_insert(0) += 1;
    }

    Ok(CompiledDefinition {
        definition,
        version,
        nodes,
        specs,
        outgoing,
        incoming,
        start_id,
    })
}
