use crate::definition::{CompiledDefinition, EdgeSpec, NodeSpec};
use crate::error::EngineError;
use crate::handlers::HandlerRegistry;
use crate::nodes::Node;
use crate::registry::EventRegistry;
use std::sync::Arc;

/// Execution context handed to every node: the compiled definition (node and
/// outgoing-edge lookup), the behavior factories, and the event registry.
#[derive(Clone)]
pub struct Environment {
    group: String,
    definition: Arc<CompiledDefinition>,
    handlers: Arc<HandlerRegistry>,
    registry: Arc<dyn EventRegistry>,
}

impl Environment {
    pub fn new(
        group: impl Into<String>,
        definition: Arc<CompiledDefinition>,
        handlers: Arc<HandlerRegistry>,
        registry: Arc<dyn EventRegistry>,
    ) -> Self {
        Self {
            group: group.into(),
            definition,
            handlers,
            registry,
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn process_id(&self) -> &str {
        self.definition.process_id()
    }

    pub fn definition(&self) -> &CompiledDefinition {
        &self.definition
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub fn registry(&self) -> &Arc<dyn EventRegistry> {
        &self.registry
    }

    pub fn node(&self, id: &str) -> Result<Arc<dyn Node>, EngineError> {
        self.definition
            .node(id)
            .ok_or_else(|| EngineError::UnknownNode(id.to_string()))
    }

    pub fn spec(&self, id: &str) -> Option<&NodeSpec> {
        self.definition.spec(id)
    }

    pub fn outgoing(&self, id: &str) -> &[EdgeSpec] {
        self.definition.outgoing(id)
    }

    pub fn incoming_count(&self, id: &str) -> u16 {
        self.definition.incoming_count(id)
    }
}
