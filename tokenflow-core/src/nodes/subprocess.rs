use super::{continue_outgoing, Node};
use crate::environment::Environment;
use crate::error::EngineError;
use crate::types::{Action, State};
use async_trait::async_trait;

/// Starts a child process instance and suspends until it completes. The
/// engine records this token as the child's `parent_reference` and reenters
/// it with the child's working memory merged in.
pub struct CallActivity {
    pub id: String,
    pub process_id: String,
    /// Callee group; defaults to the caller's.
    pub group: Option<String>,
}

#[async_trait]
impl Node for CallActivity {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(
        &self,
        state: State,
        env: &Environment,
    ) -> Result<(State, Vec<Action>), EngineError> {
        if state.is_reentry {
            let mut actions = continue_outgoing(env, &self.id);
            actions.push(Action::Complete { save_state: false });
            Ok((state, actions))
        } else {
            let group = self
                .group
                .clone()
                .unwrap_or_else(|| env.group().to_string());
            Ok((
                state,
                vec![Action::Launch {
                    group,
                    process_id: self.process_id.clone(),
                }],
            ))
        }
    }
}
