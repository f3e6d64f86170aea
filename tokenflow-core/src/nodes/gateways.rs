use super::{continue_outgoing, Node};
use crate::definition::GatewayDirection;
use crate::environment::Environment;
use crate::error::EngineError;
use crate::types::{Action, Event, State};
use async_trait::async_trait;

/// XOR: first outgoing edge whose condition matches, else the default edge.
pub struct ExclusiveGateway {
    pub id: String,
}

#[async_trait]
impl Node for ExclusiveGateway {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(
        &self,
        state: State,
        env: &Environment,
    ) -> Result<(State, Vec<Action>), EngineError> {
        let edges = env.outgoing(&self.id);

        let chosen = edges
            .iter()
            .filter(|e| !e.is_default)
            .find(|e| {
                e.condition
                    .as_ref()
                    .is_some_and(|c| c.evaluate(&state.properties))
            })
            .or_else(|| {
                edges
                    .iter()
                    .find(|e| e.is_default || e.condition.is_none())
            });

        let actions = match chosen {
            Some(edge) => vec![
                Action::Continue {
                    node_id: edge.to.clone(),
                },
                Action::Complete { save_state: false },
            ],
            // Validation guarantees a default for multi-edge gateways, but a
            // runtime mismatch still must not strand the token silently.
            None => vec![Action::Emit {
                event: Event::Error {
                    group: env.group().to_string(),
                    code: "NO_OUTGOING_FLOW".to_string(),
                },
            }],
        };
        Ok((state, actions))
    }
}

/// AND: diverging fans a token out per edge; converging arrives at the join
/// barrier and lets the engine count.
pub struct ParallelGateway {
    pub id: String,
    pub direction: GatewayDirection,
}

#[async_trait]
impl Node for ParallelGateway {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(
        &self,
        state: State,
        env: &Environment,
    ) -> Result<(State, Vec<Action>), EngineError> {
        let actions = match self.direction {
            GatewayDirection::Diverging => {
                let mut actions = continue_outgoing(env, &self.id);
                actions.push(Action::Complete { save_state: false });
                actions
            }
            GatewayDirection::Converging => vec![Action::Join {
                gateway_id: self.id.clone(),
            }],
        };
        Ok((state, actions))
    }
}
