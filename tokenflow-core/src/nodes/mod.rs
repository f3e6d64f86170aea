mod events;
mod gateways;
mod subprocess;
mod tasks;

use crate::definition::NodeSpec;
use crate::environment::Environment;
use crate::error::EngineError;
use crate::types::{Action, State};
use async_trait::async_trait;
use std::sync::Arc;

/// The unit of a process graph.
///
/// `execute` takes the current token and the environment and returns the
/// (possibly updated) token plus the actions the engine must apply, in
/// order. Nodes never touch the store or the registry themselves — all side
/// effects happen when the engine interprets the actions.
#[async_trait]
pub trait Node: Send + Sync {
    fn id(&self) -> &str;

    async fn execute(
        &self,
        state: State,
        env: &Environment,
    ) -> Result<(State, Vec<Action>), EngineError>;
}

/// Build the behavior backing a node spec.
pub fn build_node(spec: &NodeSpec) -> Arc<dyn Node> {
    match spec {
        NodeSpec::Start { id } => Arc::new(events::StartEvent { id: id.clone() }),
        NodeSpec::End { id, .. } => Arc::new(events::EndEvent { id: id.clone() }),
        NodeSpec::ErrorEnd { id, code } => Arc::new(events::ErrorEndEvent {
            id: id.clone(),
            code: code.clone(),
        }),
        NodeSpec::ServiceTask {
            id,
            task_type,
            error_code,
        } => Arc::new(tasks::ServiceTask {
            id: id.clone(),
            task_type: task_type.clone(),
            error_code: error_code.clone(),
        }),
        NodeSpec::ScriptTask {
            id,
            source,
            error_code,
        } => Arc::new(tasks::ScriptTask {
            id: id.clone(),
            source: source.clone(),
            error_code: error_code.clone(),
        }),
        NodeSpec::BusinessRuleTask {
            id,
            decision,
            error_code,
        } => Arc::new(tasks::BusinessRuleTask {
            id: id.clone(),
            decision: decision.clone(),
            error_code: error_code.clone(),
        }),
        NodeSpec::UserTask { id, .. } => Arc::new(tasks::UserTask { id: id.clone() }),
        NodeSpec::ManualTask { id } => Arc::new(tasks::ManualTask { id: id.clone() }),
        NodeSpec::ExclusiveGateway { id } => {
            Arc::new(gateways::ExclusiveGateway { id: id.clone() })
        }
        NodeSpec::ParallelGateway { id, direction } => Arc::new(gateways::ParallelGateway {
            id: id.clone(),
            direction: *direction,
        }),
        NodeSpec::MessageCatch { id, message } => Arc::new(events::MessageCatchEvent {
            id: id.clone(),
            message: message.clone(),
        }),
        NodeSpec::MessageThrow { id, message } => Arc::new(events::MessageThrowEvent {
            id: id.clone(),
            message: message.clone(),
        }),
        NodeSpec::SignalCatch { id, signal } => Arc::new(events::SignalCatchEvent {
            id: id.clone(),
            signal: signal.clone(),
        }),
        NodeSpec::SignalThrow { id, signal } => Arc::new(events::SignalThrowEvent {
            id: id.clone(),
            signal: signal.clone(),
        }),
        NodeSpec::CallActivity {
            id,
            process_id,
            group,
        } => Arc::new(subprocess::CallActivity {
            id: id.clone(),
            process_id: process_id.clone(),
            group: group.clone(),
        }),
    }
}

/// One Continue per outgoing edge of `node_id`.
pub(crate) fn continue_outgoing(env: &Environment, node_id: &str) -> Vec<Action> {
    env.outgoing(node_id)
        .iter()
        .map(|edge| Action::Continue {
            node_id: edge.to.clone(),
        })
        .collect()
}
