use super::{continue_outgoing, Node};
use crate::environment::Environment;
use crate::error::EngineError;
use crate::types::{Action, Event, State};
use async_trait::async_trait;

// ─── Start / End ──────────────────────────────────────────────

pub struct StartEvent {
    pub id: String,
}

#[async_trait]
impl Node for StartEvent {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(
        &self,
        state: State,
        env: &Environment,
    ) -> Result<(State, Vec<Action>), EngineError> {
        let mut actions = continue_outgoing(env, &self.id);
        actions.push(Action::Complete { save_state: false });
        Ok((state, actions))
    }
}

pub struct EndEvent {
    pub id: String,
}

#[async_trait]
impl Node for EndEvent {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(
        &self,
        state: State,
        _env: &Environment,
    ) -> Result<(State, Vec<Action>), EngineError> {
        // Terminate is interpreted by the engine when it applies Complete
        // for a terminating end node.
        Ok((state, vec![Action::Complete { save_state: false }]))
    }
}

pub struct ErrorEndEvent {
    pub id: String,
    pub code: String,
}

#[async_trait]
impl Node for ErrorEndEvent {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(
        &self,
        state: State,
        env: &Environment,
    ) -> Result<(State, Vec<Action>), EngineError> {
        let actions = vec![
            Action::Emit {
                event: Event::Error {
                    group: env.group().to_string(),
                    code: self.code.clone(),
                },
            },
            Action::Complete { save_state: false },
        ];
        Ok((state, actions))
    }
}

// ─── Catch events (two-phase waits) ───────────────────────────

pub struct MessageCatchEvent {
    pub id: String,
    pub message: String,
}

#[async_trait]
impl Node for MessageCatchEvent {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(
        &self,
        state: State,
        env: &Environment,
    ) -> Result<(State, Vec<Action>), EngineError> {
        let event = Event::Message {
            group: env.group().to_string(),
            name: self.message.clone(),
        };
        Ok(wait_or_continue(state, env, &self.id, event))
    }
}

pub struct SignalCatchEvent {
    pub id: String,
    pub signal: String,
}

#[async_trait]
impl Node for SignalCatchEvent {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(
        &self,
        state: State,
        env: &Environment,
    ) -> Result<(State, Vec<Action>), EngineError> {
        let event = Event::Signal {
            group: env.group().to_string(),
            name: self.signal.clone(),
        };
        Ok(wait_or_continue(state, env, &self.id, event))
    }
}

/// The recurring two-phase idiom for waiting nodes: suspend on first visit,
/// continue on reentry.
pub(super) fn wait_or_continue(
    state: State,
    env: &Environment,
    node_id: &str,
    event: Event,
) -> (State, Vec<Action>) {
    if state.is_reentry {
        // The suspended state was already consumed on delivery.
        let mut actions = continue_outgoing(env, node_id);
        actions.push(Action::Complete { save_state: false });
        (state, actions)
    } else {
        (
            state,
            vec![Action::Queue {
                event,
                save_state: true,
            }],
        )
    }
}

// ─── Throw events ─────────────────────────────────────────────

pub struct MessageThrowEvent {
    pub id: String,
    pub message: String,
}

#[async_trait]
impl Node for MessageThrowEvent {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(
        &self,
        state: State,
        env: &Environment,
    ) -> Result<(State, Vec<Action>), EngineError> {
        let mut actions = vec![Action::Emit {
            event: Event::Message {
                group: env.group().to_string(),
                name: self.message.clone(),
            },
        }];
        actions.extend(continue_outgoing(env, &self.id));
        actions.push(Action::Complete { save_state: false });
        Ok((state, actions))
    }
}

pub struct SignalThrowEvent {
    pub id: String,
    pub signal: String,
}

#[async_trait]
impl Node for SignalThrowEvent {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(
        &self,
        state: State,
        env: &Environment,
    ) -> Result<(State, Vec<Action>), EngineError> {
        let mut actions = vec![Action::Emit {
            event: Event::Signal {
                group: env.group().to_string(),
                name: self.signal.clone(),
            },
        }];
        actions.extend(continue_outgoing(env, &self.id));
        actions.push(Action::Complete { save_state: false });
        Ok((state, actions))
    }
}
