use super::events::wait_or_continue;
use super::{continue_outgoing, Node};
use crate::environment::Environment;
use crate::error::EngineError;
use crate::types::{Action, Event, State};
use async_trait::async_trait;
use tracing::warn;

// ─── Automated tasks ──────────────────────────────────────────

/// Runs the registered [`ServiceBehavior`](crate::handlers::ServiceBehavior)
/// for its task type. Handler failures become an Error event, never a
/// propagated error.
pub struct ServiceTask {
    pub id: String,
    pub task_type: String,
    pub error_code: Option<String>,
}

#[async_trait]
impl Node for ServiceTask {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(
        &self,
        mut state: State,
        env: &Environment,
    ) -> Result<(State, Vec<Action>), EngineError> {
        let behavior = env
            .handlers()
            .get_service(&self.task_type)
            .ok_or_else(|| EngineError::MissingHandler(self.task_type.clone()))?;

        match behavior.run(&mut state.properties).await {
            Ok(()) => {
                let mut actions = continue_outgoing(env, &self.id);
                actions.push(Action::Complete { save_state: false });
                Ok((state, actions))
            }
            Err(err) => {
                warn!(node = %self.id, task_type = %self.task_type, error = %err, "service task failed");
                Ok((state, error_actions(env, &self.error_code, "SERVICE_ERROR")))
            }
        }
    }
}

/// Evaluates its source through the registered script runner.
pub struct ScriptTask {
    pub id: String,
    pub source: String,
    pub error_code: Option<String>,
}

#[async_trait]
impl Node for ScriptTask {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(
        &self,
        mut state: State,
        env: &Environment,
    ) -> Result<(State, Vec<Action>), EngineError> {
        let runner = env
            .handlers()
            .get_script_runner()
            .ok_or_else(|| EngineError::MissingHandler("script".to_string()))?;

        match runner.eval(&self.source, &mut state.properties).await {
            Ok(()) => {
                let mut actions = continue_outgoing(env, &self.id);
                actions.push(Action::Complete { save_state: false });
                Ok((state, actions))
            }
            Err(err) => {
                warn!(node = %self.id, error = %err, "script task failed");
                Ok((state, error_actions(env, &self.error_code, "SCRIPT_ERROR")))
            }
        }
    }
}

pub struct BusinessRuleTask {
    pub id: String,
    pub decision: String,
    pub error_code: Option<String>,
}

#[async_trait]
impl Node for BusinessRuleTask {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(
        &self,
        mut state: State,
        env: &Environment,
    ) -> Result<(State, Vec<Action>), EngineError> {
        let evaluator = env
            .handlers()
            .get_decision_evaluator()
            .ok_or_else(|| EngineError::MissingHandler("business-rule".to_string()))?;

        match evaluator.decide(&self.decision, &mut state.properties).await {
            Ok(()) => {
                let mut actions = continue_outgoing(env, &self.id);
                actions.push(Action::Complete { save_state: false });
                Ok((state, actions))
            }
            Err(err) => {
                warn!(node = %self.id, decision = %self.decision, error = %err, "business rule task failed");
                Ok((state, error_actions(env, &self.error_code, "RULE_ERROR")))
            }
        }
    }
}

fn error_actions(env: &Environment, error_code: &Option<String>, fallback: &str) -> Vec<Action> {
    vec![Action::Emit {
        event: Event::Error {
            group: env.group().to_string(),
            code: error_code.clone().unwrap_or_else(|| fallback.to_string()),
        },
    }]
}

// ─── Human tasks (two-phase waits) ────────────────────────────

pub struct UserTask {
    pub id: String,
}

#[async_trait]
impl Node for UserTask {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(
        &self,
        state: State,
        env: &Environment,
    ) -> Result<(State, Vec<Action>), EngineError> {
        let event = Event::User {
            group: env.group().to_string(),
            process_id: env.process_id().to_string(),
            node_id: self.id.clone(),
        };
        Ok(wait_or_continue(state, env, &self.id, event))
    }
}

pub struct ManualTask {
    pub id: String,
}

#[async_trait]
impl Node for ManualTask {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(
        &self,
        state: State,
        env: &Environment,
    ) -> Result<(State, Vec<Action>), EngineError> {
        let event = Event::Manual {
            group: env.group().to_string(),
            process_id: env.process_id().to_string(),
            node_id: self.id.clone(),
        };
        Ok(wait_or_continue(state, env, &self.id, event))
    }
}
