use crate::definition::{compile, CompiledDefinition, NodeSpec, ProcessDefinition};
use crate::environment::Environment;
use crate::error::EngineError;
use crate::events::RuntimeEvent;
use crate::handlers::HandlerRegistry;
use crate::registry::EventRegistry;
use crate::store::ProcessStore;
use crate::types::{Action, Event, NodeRef, Properties, State, Timestamp};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Recursive call activities are legal definitions; this bounds how deep the
/// synchronous launch chain may grow before the step budget would let it
/// exhaust the stack.
const MAX_CALL_DEPTH: usize = 64;

/// Terminal state of one engine run over one instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunStatus {
    /// All tokens consumed, nothing suspended.
    Completed,
    /// At least one token is parked awaiting an external event.
    Waiting,
    /// A terminate end dropped every pending token.
    Terminated,
    /// An unrouted error event ended the instance.
    Failed { code: String },
}

/// What a caller gets back from `start` / `deliver` / `complete_task`.
#[derive(Clone, Debug)]
pub struct ExecutionReport {
    pub instance_id: Uuid,
    pub process_id: String,
    pub status: RunStatus,
    /// Message/signal events thrown during the run (already delivered to any
    /// in-process subscribers).
    pub emitted: Vec<Event>,
    /// Working memory of the last executed token.
    pub properties: Properties,
}

struct RunOutcome {
    report: ExecutionReport,
    /// Parent state to reenter after a child instance finished.
    parent_resume: Option<State>,
    /// Thrown events with the thrower's working memory as payload.
    emitted: Vec<(Event, Properties)>,
}

/// The outer engine loop: reads the current State, resolves the Node through
/// the Environment, calls `execute`, applies the returned actions in order,
/// and repeats until no token is pending.
pub struct Engine {
    store: Arc<dyn ProcessStore>,
    registry: Arc<dyn EventRegistry>,
    handlers: Arc<HandlerRegistry>,
    max_steps: usize,
    definitions: RwLock<HashMap<String, Arc<CompiledDefinition>>>,
}

impl Engine {
    pub fn new(
        store: Arc<dyn ProcessStore>,
        registry: Arc<dyn EventRegistry>,
        handlers: Arc<HandlerRegistry>,
    ) -> Self {
        Self {
            store,
            registry,
            handlers,
            max_steps: 10_000,
            definitions: RwLock::new(HashMap::new()),
        }
    }

    /// Bound on node executions per run. Defends against definition cycles.
    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    // ── Public API ──

    /// Validate and persist a definition. Returns the version hash.
    pub async fn deploy(
        &self,
        group: &str,
        definition: ProcessDefinition,
    ) -> Result<[u8; 32], EngineError> {
        let compiled = Arc::new(compile(definition)?);
        self.store
            .write_process(group, compiled.definition())
            .await?;
        let version = compiled.version();
        let key = cache_key(group, compiled.process_id());
        self.definitions.write().await.insert(key, compiled);
        Ok(version)
    }

    /// Start a new process instance and run it to quiescence.
    pub async fn start(
        &self,
        group: &str,
        process_id: &str,
        properties: Properties,
    ) -> Result<ExecutionReport, EngineError> {
        let env = self.environment(group, process_id).await?;
        let instance_id = Uuid::now_v7();
        let node_ref = NodeRef::new(group, process_id, instance_id, env.definition().start_id());
        let mut state = State::new(node_ref);
        state.properties = properties;

        self.append(
            instance_id,
            &RuntimeEvent::InstanceStarted {
                instance_id,
                process_id: process_id.to_string(),
                definition_version: env.definition().version(),
            },
        )
        .await?;
        info!(%instance_id, process_id, group, "process instance started");

        let mut reports = self.drive(vec![state], Vec::new()).await?;
        // The root instance's report is first; event-resumed instances follow.
        Ok(reports.remove(0))
    }

    /// Deliver an external event to every waiting subscriber. Returns one
    /// report per resumed instance; ghost signals resume nothing.
    pub async fn deliver(
        &self,
        event: &Event,
        payload: &Properties,
    ) -> Result<Vec<ExecutionReport>, EngineError> {
        self.drive(Vec::new(), vec![(event.clone(), payload.clone())])
            .await
    }

    /// Targeted reentry for a user/manual task, bypassing the registry
    /// broadcast path.
    pub async fn complete_task(
        &self,
        node_ref: &NodeRef,
        payload: &Properties,
    ) -> Result<ExecutionReport, EngineError> {
        let state = self
            .store
            .read_state(node_ref)
            .await?
            .ok_or_else(|| EngineError::MissingState(node_ref.key()))?;
        self.store.delete_state(node_ref).await?;

        let env = self
            .environment(&node_ref.group, &node_ref.process_id)
            .await?;
        if let Some(event) = task_wait_event(&env, &node_ref.node_id) {
            let key = event.registry_key();
            self.registry.unsubscribe(&key, node_ref).await?;
            self.append(
                node_ref.process_instance_id,
                &RuntimeEvent::EventDelivered {
                    event_key: key,
                    resumed: node_ref.clone(),
                },
            )
            .await?;
        }

        let resumed = state.merged(payload).reentered();
        let mut reports = self.drive(vec![resumed], Vec::new()).await?;
        Ok(reports.remove(0))
    }

    /// The audit trail of an instance.
    pub async fn events(
        &self,
        instance_id: Uuid,
    ) -> Result<Vec<(u64, RuntimeEvent)>, EngineError> {
        Ok(self.store.read_events(instance_id, 0).await?)
    }

    // ── Internals ──

    async fn environment(
        &self,
        group: &str,
        process_id: &str,
    ) -> Result<Environment, EngineError> {
        let key = cache_key(group, process_id);
        let cached = self.definitions.read().await.get(&key).cloned();
        let compiled = match cached {
            Some(compiled) => compiled,
            None => {
                let definition = self
                    .store
                    .read_process(group, process_id)
                    .await?
                    .ok_or_else(|| EngineError::UnknownProcess {
                        group: group.to_string(),
                        process_id: process_id.to_string(),
                    })?;
                let compiled = Arc::new(compile(definition)?);
                self.definitions
                    .write()
                    .await
                    .insert(key, compiled.clone());
                compiled
            }
        };
        Ok(Environment::new(
            group,
            compiled,
            self.handlers.clone(),
            self.registry.clone(),
        ))
    }

    /// Worklist driver: runs instances, feeds parent resumes back in, and
    /// delivers emitted events to cross-instance subscribers.
    async fn drive(
        &self,
        initial: Vec<State>,
        events: Vec<(Event, Properties)>,
    ) -> Result<Vec<ExecutionReport>, EngineError> {
        let mut worklist: VecDeque<State> = initial.into();
        let mut pending_events: VecDeque<(Event, Properties)> = events.into();
        let mut reports = Vec::new();

        loop {
            if let Some(state) = worklist.pop_front() {
                let env = self
                    .environment(&state.node_ref.group, &state.node_ref.process_id)
                    .await?;
                let mut steps = 0usize;
                let outcome = self.run_instance(&env, state, &mut steps, 0).await?;
                if let Some(parent) = outcome.parent_resume {
                    worklist.push_back(parent);
                }
                pending_events.extend(outcome.emitted);
                reports.push(outcome.report);
            } else if let Some((event, payload)) = pending_events.pop_front() {
                let key = event.registry_key();
                for subscriber in self.registry.drain(&key).await? {
                    match self.store.read_state(&subscriber).await? {
                        None => {
                            warn!(event_key = %key, subscriber = %subscriber, "ghost signal: no suspended state");
                            self.append(
                                subscriber.process_instance_id,
                                &RuntimeEvent::GhostSignal {
                                    event_key: key.clone(),
                                    subscriber: subscriber.clone(),
                                },
                            )
                            .await?;
                        }
                        Some(state) => {
                            self.store.delete_state(&subscriber).await?;
                            self.append(
                                subscriber.process_instance_id,
                                &RuntimeEvent::EventDelivered {
                                    event_key: key.clone(),
                                    resumed: subscriber.clone(),
                                },
                            )
                            .await?;
                            worklist.push_back(state.merged(&payload).reentered());
                        }
                    }
                }
            } else {
                break;
            }
        }
        Ok(reports)
    }

    /// Run one instance's tokens to quiescence. `steps` is shared with child
    /// launches so the budget covers the whole synchronous run.
    async fn run_instance(
        &self,
        env: &Environment,
        initial: State,
        steps: &mut usize,
        depth: usize,
    ) -> Result<RunOutcome, EngineError> {
        let instance_id = initial.node_ref.process_instance_id;
        let parent_ref = initial.parent_reference.clone();
        let mut queue: VecDeque<State> = VecDeque::from([initial]);

        let mut emitted: Vec<(Event, Properties)> = Vec::new();
        let mut last_properties = Properties::new();
        let mut suspended = 0usize;
        let mut terminated = false;
        let mut failed: Option<String> = None;

        'tokens: while let Some(state) = queue.pop_front() {
            *steps += 1;
            if *steps > self.max_steps {
                return Err(EngineError::StepBudget(self.max_steps));
            }

            let node_id = state.node_ref.node_id.clone();
            self.append(
                instance_id,
                &RuntimeEvent::NodeEntered {
                    node_id: node_id.clone(),
                    is_reentry: state.is_reentry,
                },
            )
            .await?;
            debug!(%instance_id, node = %node_id, reentry = state.is_reentry, "executing node");

            let node = env.node(&node_id)?;
            let (state, actions) = node.execute(state, env).await?;
            last_properties = state.properties.clone();

            for action in actions {
                match action {
                    Action::Continue { node_id: target } => {
                        if matches!(env.spec(&node_id), Some(NodeSpec::ExclusiveGateway { .. })) {
                            let is_default = env
                                .outgoing(&node_id)
                                .iter()
                                .find(|e| e.to == target)
                                .map(|e| e.is_default)
                                .unwrap_or(false);
                            self.append(
                                instance_id,
                                &RuntimeEvent::GatewayTaken {
                                    gateway_id: node_id.clone(),
                                    edge_to: target.clone(),
                                    is_default,
                                },
                            )
                            .await?;
                        }
                        queue.push_back(state.with_node_ref(&target));
                    }

                    Action::Complete { save_state } => {
                        if save_state {
                            self.store.write_state(&state).await?;
                        }
                        self.append(
                            instance_id,
                            &RuntimeEvent::NodeCompleted {
                                node_id: node_id.clone(),
                            },
                        )
                        .await?;

                        if matches!(
                            env.spec(&node_id),
                            Some(NodeSpec::End { terminate: true, .. })
                        ) {
                            terminated = true;
                            queue.clear();
                            self.registry.forget_instance(instance_id).await?;
                            self.append(
                                instance_id,
                                &RuntimeEvent::InstanceTerminated {
                                    at: now_ms(),
                                    node_id: node_id.clone(),
                                },
                            )
                            .await?;
                            break 'tokens;
                        }
                    }

                    Action::Queue { event, save_state } => {
                        let key = event.registry_key();
                        if save_state {
                            self.store.write_state(&state).await?;
                        }
                        self.registry
                            .subscribe(&key, state.node_ref.clone())
                            .await?;
                        self.append(
                            instance_id,
                            &RuntimeEvent::StateSuspended {
                                node_id: node_id.clone(),
                                event_key: key.clone(),
                            },
                        )
                        .await?;
                        self.append(
                            instance_id,
                            &RuntimeEvent::EventSubscribed {
                                event_key: key,
                                subscriber: state.node_ref.clone(),
                            },
                        )
                        .await?;
                        suspended += 1;
                    }

                    Action::Emit { event } => match event {
                        Event::Error { code, .. } => {
                            self.append(
                                instance_id,
                                &RuntimeEvent::ErrorRaised {
                                    code: code.clone(),
                                    source_node: node_id.clone(),
                                },
                            )
                            .await?;
                            self.append(
                                instance_id,
                                &RuntimeEvent::InstanceFailed {
                                    code: code.clone(),
                                    at: now_ms(),
                                },
                            )
                            .await?;
                            info!(%instance_id, %code, "instance failed");
                            failed = Some(code);
                            queue.clear();
                            self.registry.forget_instance(instance_id).await?;
                            break 'tokens;
                        }
                        event => {
                            self.append(
                                instance_id,
                                &RuntimeEvent::EventEmitted {
                                    event_key: event.registry_key(),
                                    source_node: node_id.clone(),
                                },
                            )
                            .await?;
                            emitted.push((event, state.properties.clone()));
                        }
                    },

                    Action::Join { gateway_id } => {
                        let expected = env.incoming_count(&gateway_id);
                        let (arrived, branch_memory) = self
                            .store
                            .join_arrive(instance_id, &gateway_id, &state.properties)
                            .await?;
                        self.append(
                            instance_id,
                            &RuntimeEvent::JoinArrived {
                                gateway_id: gateway_id.clone(),
                                arrived,
                                expected,
                            },
                        )
                        .await?;
                        if arrived >= expected {
                            self.store.join_reset(instance_id, &gateway_id).await?;
                            self.append(
                                instance_id,
                                &RuntimeEvent::JoinReleased {
                                    gateway_id: gateway_id.clone(),
                                },
                            )
                            .await?;
                            self.append(
                                instance_id,
                                &RuntimeEvent::NodeCompleted {
                                    node_id: gateway_id.clone(),
                                },
                            )
                            .await?;
                            // Release with every branch's writes, not just
                            // the last arrival's.
                            let released = state.clone().merged(&branch_memory);
                            last_properties = released.properties.clone();
                            for edge in env.outgoing(&gateway_id) {
                                queue.push_back(released.with_node_ref(&edge.to));
                            }
                        }
                        // Otherwise the token is consumed by the barrier.
                    }

                    Action::Launch { group, process_id } => {
                        if depth >= MAX_CALL_DEPTH {
                            return Err(EngineError::CallDepth(MAX_CALL_DEPTH));
                        }
                        // Park the calling token, then run the child inline.
                        self.store.write_state(&state).await?;
                        let child_env = self.environment(&group, &process_id).await?;
                        let child_id = Uuid::now_v7();
                        let child_ref = NodeRef::new(
                            &group,
                            &process_id,
                            child_id,
                            child_env.definition().start_id(),
                        );
                        let mut child_state = State::new(child_ref);
                        child_state.properties = state.properties.clone();
                        child_state.header = state.header.clone();
                        child_state.parent_reference = Some(state.node_ref.clone());

                        self.append(
                            instance_id,
                            &RuntimeEvent::SubprocessLaunched {
                                child_instance_id: child_id,
                                process_id: process_id.clone(),
                                parent_node: node_id.clone(),
                            },
                        )
                        .await?;
                        self.append(
                            child_id,
                            &RuntimeEvent::InstanceStarted {
                                instance_id: child_id,
                                process_id: process_id.clone(),
                                definition_version: child_env.definition().version(),
                            },
                        )
                        .await?;

                        let child = Box::pin(self.run_instance(
                            &child_env,
                            child_state,
                            steps,
                            depth + 1,
                        ))
                        .await?;
                        emitted.extend(child.emitted);
                        match child.report.status {
                            RunStatus::Completed | RunStatus::Terminated => {
                                // The child already resolved our parked state.
                                if let Some(resume) = child.parent_resume {
                                    queue.push_back(resume);
                                }
                            }
                            RunStatus::Waiting => suspended += 1,
                            RunStatus::Failed { code } => {
                                self.store.delete_state(&state.node_ref).await?;
                                self.append(
                                    instance_id,
                                    &RuntimeEvent::InstanceFailed {
                                        code: code.clone(),
                                        at: now_ms(),
                                    },
                                )
                                .await?;
                                failed = Some(code);
                                queue.clear();
                                self.registry.forget_instance(instance_id).await?;
                                break 'tokens;
                            }
                        }
                    }
                }
            }
        }

        let mut status = if let Some(code) = failed {
            RunStatus::Failed { code }
        } else if terminated {
            RunStatus::Terminated
        } else if suspended > 0 {
            RunStatus::Waiting
        } else {
            RunStatus::Completed
        };

        let mut parent_resume = None;
        if status == RunStatus::Completed {
            // Tokens suspended in earlier runs may still be parked.
            if self.store.count_states(instance_id).await? > 0 {
                status = RunStatus::Waiting;
            } else {
                self.append(instance_id, &RuntimeEvent::InstanceCompleted { at: now_ms() })
                    .await?;
                info!(%instance_id, "instance completed");
                parent_resume = self
                    .resolve_parent(parent_ref, &last_properties, instance_id)
                    .await?;
            }
        } else if status == RunStatus::Terminated {
            parent_resume = self
                .resolve_parent(parent_ref, &last_properties, instance_id)
                .await?;
        }

        Ok(RunOutcome {
            report: ExecutionReport {
                instance_id,
                process_id: env.process_id().to_string(),
                status,
                emitted: emitted.iter().map(|(e, _)| e.clone()).collect(),
                properties: last_properties,
            },
            parent_resume,
            emitted,
        })
    }

    /// A completed child reenters its parent with the child's working memory
    /// merged in.
    async fn resolve_parent(
        &self,
        parent_ref: Option<NodeRef>,
        child_properties: &Properties,
        child_instance_id: Uuid,
    ) -> Result<Option<State>, EngineError> {
        let Some(parent_ref) = parent_ref else {
            return Ok(None);
        };
        match self.store.read_state(&parent_ref).await? {
            None => {
                warn!(parent = %parent_ref, "parent state vanished before child completion");
                Ok(None)
            }
            Some(parent_state) => {
                self.store.delete_state(&parent_ref).await?;
                self.append(
                    parent_ref.process_instance_id,
                    &RuntimeEvent::ParentResumed {
                        parent: parent_ref.clone(),
                        child_instance_id,
                    },
                )
                .await?;
                Ok(Some(parent_state.merged(child_properties).reentered()))
            }
        }
    }

    async fn append(&self, instance_id: Uuid, event: &RuntimeEvent) -> Result<(), EngineError> {
        self.store.append_event(instance_id, event).await?;
        Ok(())
    }
}

fn cache_key(group: &str, process_id: &str) -> String {
    format!("{group}:{process_id}")
}

/// The wait event a user/manual task subscribed with, if the node is one.
fn task_wait_event(env: &Environment, node_id: &str) -> Option<Event> {
    match env.spec(node_id)? {
        NodeSpec::UserTask { .. } => Some(Event::User {
            group: env.group().to_string(),
            process_id: env.process_id().to_string(),
            node_id: node_id.to_string(),
        }),
        NodeSpec::ManualTask { .. } => Some(Event::Manual {
            group: env.group().to_string(),
            process_id: env.process_id().to_string(),
            node_id: node_id.to_string(),
        }),
        _ => None,
    }
}

fn now_ms() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{
        Condition, ConditionOp, EdgeSpec, GatewayDirection, NodeSpec, ProcessDefinition,
    };
    use crate::handlers::ScriptRunner;
    use crate::registry::InMemoryEventRegistry;
    use crate::store_memory::MemoryStore;
    use anyhow::anyhow;
    use async_trait::async_trait;

    const GROUP: &str = "kyc";

    fn trace_init() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("tokenflow_core=debug")
            .with_test_writer()
            .try_init();
    }

    fn engine_with(handlers: HandlerRegistry) -> (Arc<MemoryStore>, Engine) {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(InMemoryEventRegistry::new());
        let engine = Engine::new(store.clone(), registry, Arc::new(handlers));
        (store, engine)
    }

    fn service(id: &str, task_type: &str) -> NodeSpec {
        NodeSpec::ServiceTask {
            id: id.to_string(),
            task_type: task_type.to_string(),
            error_code: None,
        }
    }

    fn linear_definition() -> ProcessDefinition {
        ProcessDefinition {
            id: "onboarding".to_string(),
            meta: None,
            nodes: vec![
                NodeSpec::Start { id: "start".to_string() },
                service("create_case", "create_case"),
                service("request_docs", "request_docs"),
                NodeSpec::End { id: "end".to_string(), terminate: false },
            ],
            edges: vec![
                EdgeSpec::direct("start", "create_case"),
                EdgeSpec::direct("create_case", "request_docs"),
                EdgeSpec::direct("request_docs", "end"),
            ],
        }
    }

    fn mark(key: &'static str) -> impl Fn(&mut Properties) -> anyhow::Result<()> + Send + Sync {
        move |props: &mut Properties| {
            props.insert(key.to_string(), serde_json::json!(true));
            Ok(())
        }
    }

    #[tokio::test]
    async fn linear_flow_completes() {
        trace_init();
        let handlers = HandlerRegistry::new()
            .service_fn("create_case", mark("case_created"))
            .service_fn("request_docs", mark("docs_requested"));
        let (store, engine) = engine_with(handlers);

        engine.deploy(GROUP, linear_definition()).await.unwrap();
        let report = engine
            .start(GROUP, "onboarding", Properties::new())
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.properties.get("case_created"), Some(&serde_json::json!(true)));
        assert_eq!(report.properties.get("docs_requested"), Some(&serde_json::json!(true)));

        let log = store.read_events(report.instance_id, 0).await.unwrap();
        assert!(matches!(log.first(), Some((_, RuntimeEvent::InstanceStarted { .. }))));
        assert!(matches!(log.last(), Some((_, RuntimeEvent::InstanceCompleted { .. }))));
        // No suspended state left behind
        assert_eq!(store.count_states(report.instance_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn deploy_rejects_invalid_definition() {
        let (_, engine) = engine_with(HandlerRegistry::new());
        let mut bad = linear_definition();
        bad.nodes.remove(0);
        let err = engine.deploy(GROUP, bad).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidDefinition { .. }));
    }

    #[tokio::test]
    async fn start_unknown_process_errors() {
        let (_, engine) = engine_with(HandlerRegistry::new());
        let err = engine
            .start(GROUP, "nope", Properties::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownProcess { .. }));
    }

    #[tokio::test]
    async fn missing_handler_is_structural() {
        let (_, engine) = engine_with(HandlerRegistry::new());
        engine.deploy(GROUP, linear_definition()).await.unwrap();
        let err = engine
            .start(GROUP, "onboarding", Properties::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::MissingHandler(t) if t == "create_case"));
    }

    fn user_task_definition() -> ProcessDefinition {
        ProcessDefinition {
            id: "approval".to_string(),
            meta: None,
            nodes: vec![
                NodeSpec::Start { id: "start".to_string() },
                NodeSpec::UserTask {
                    id: "approve".to_string(),
                    assignee: None,
                },
                NodeSpec::End { id: "end".to_string(), terminate: false },
            ],
            edges: vec![
                EdgeSpec::direct("start", "approve"),
                EdgeSpec::direct("approve", "end"),
            ],
        }
    }

    /// The two-phase waiting idiom: suspend with persisted state on first
    /// visit, continue and complete on reentry.
    #[tokio::test]
    async fn user_task_waits_then_resumes() {
        let (store, engine) = engine_with(HandlerRegistry::new());
        engine.deploy(GROUP, user_task_definition()).await.unwrap();

        let report = engine
            .start(GROUP, "approval", Properties::new())
            .await
            .unwrap();
        assert_eq!(report.status, RunStatus::Waiting);

        let node_ref = NodeRef::new(GROUP, "approval", report.instance_id, "approve");
        let parked = store.read_state(&node_ref).await.unwrap().unwrap();
        assert!(!parked.is_reentry);

        let payload = Properties::from([("approved".to_string(), serde_json::json!(true))]);
        let resumed = engine.complete_task(&node_ref, &payload).await.unwrap();
        assert_eq!(resumed.status, RunStatus::Completed);
        assert_eq!(resumed.instance_id, report.instance_id);
        assert_eq!(resumed.properties.get("approved"), Some(&serde_json::json!(true)));

        // State consumed on resume; a second completion is a ghost
        assert!(store.read_state(&node_ref).await.unwrap().is_none());
        let err = engine.complete_task(&node_ref, &payload).await.unwrap_err();
        assert!(matches!(err, EngineError::MissingState(_)));
    }

    fn message_definition() -> ProcessDefinition {
        ProcessDefinition {
            id: "shipping".to_string(),
            meta: None,
            nodes: vec![
                NodeSpec::Start { id: "start".to_string() },
                NodeSpec::MessageCatch {
                    id: "wait_payment".to_string(),
                    message: "payment_received".to_string(),
                },
                service("ship", "ship"),
                NodeSpec::End { id: "end".to_string(), terminate: false },
            ],
            edges: vec![
                EdgeSpec::direct("start", "wait_payment"),
                EdgeSpec::direct("wait_payment", "ship"),
                EdgeSpec::direct("ship", "end"),
            ],
        }
    }

    #[tokio::test]
    async fn message_delivery_resumes_subscriber() {
        let handlers = HandlerRegistry::new().service_fn("ship", mark("shipped"));
        let (_, engine) = engine_with(handlers);
        engine.deploy(GROUP, message_definition()).await.unwrap();

        let report = engine
            .start(GROUP, "shipping", Properties::new())
            .await
            .unwrap();
        assert_eq!(report.status, RunStatus::Waiting);

        let event = Event::Message {
            group: GROUP.to_string(),
            name: "payment_received".to_string(),
        };
        let payload = Properties::from([("amount".to_string(), serde_json::json!(99))]);
        let resumed = engine.deliver(&event, &payload).await.unwrap();
        assert_eq!(resumed.len(), 1);
        assert_eq!(resumed[0].status, RunStatus::Completed);
        assert_eq!(resumed[0].properties.get("amount"), Some(&serde_json::json!(99)));
        assert_eq!(resumed[0].properties.get("shipped"), Some(&serde_json::json!(true)));

        // Subscription drained — nothing resumes twice
        assert!(engine.deliver(&event, &payload).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn ghost_signal_is_recorded_not_fatal() {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(InMemoryEventRegistry::new());

        // Subscribe a node that has no suspended state behind it
        let ghost_ref = NodeRef::new(GROUP, "shipping", Uuid::now_v7(), "wait_payment");
        let event = Event::Message {
            group: GROUP.to_string(),
            name: "payment_received".to_string(),
        };
        registry
            .subscribe(&event.registry_key(), ghost_ref.clone())
            .await
            .unwrap();

        let engine = Engine::new(store.clone(), registry, Arc::new(HandlerRegistry::new()));

        let resumed = engine.deliver(&event, &Properties::new()).await.unwrap();
        assert!(resumed.is_empty());

        let log = store
            .read_events(ghost_ref.process_instance_id, 0)
            .await
            .unwrap();
        assert!(log
            .iter()
            .any(|(_, e)| matches!(e, RuntimeEvent::GhostSignal { .. })));
    }

    fn gateway_definition() -> ProcessDefinition {
        ProcessDefinition {
            id: "triage".to_string(),
            meta: None,
            nodes: vec![
                NodeSpec::Start { id: "start".to_string() },
                NodeSpec::ExclusiveGateway { id: "decide".to_string() },
                service("accept", "accept"),
                service("reject", "reject"),
                NodeSpec::End { id: "end".to_string(), terminate: false },
            ],
            edges: vec![
                EdgeSpec::direct("start", "decide"),
                EdgeSpec {
                    condition: Some(Condition {
                        property: "approved".to_string(),
                        op: ConditionOp::Eq,
                        value: serde_json::json!(true),
                    }),
                    ..EdgeSpec::direct("decide", "accept")
                },
                EdgeSpec {
                    is_default: true,
                    ..EdgeSpec::direct("decide", "reject")
                },
                EdgeSpec::direct("accept", "end"),
                EdgeSpec::direct("reject", "end"),
            ],
        }
    }

    #[tokio::test]
    async fn exclusive_gateway_condition_and_default() {
        let handlers = HandlerRegistry::new()
            .service_fn("accept", mark("accepted"))
            .service_fn("reject", mark("rejected"));
        let (store, engine) = engine_with(handlers);
        engine.deploy(GROUP, gateway_definition()).await.unwrap();

        let approved = Properties::from([("approved".to_string(), serde_json::json!(true))]);
        let report = engine.start(GROUP, "triage", approved).await.unwrap();
        assert_eq!(report.status, RunStatus::Completed);
        assert!(report.properties.contains_key("accepted"));
        assert!(!report.properties.contains_key("rejected"));

        let log = store.read_events(report.instance_id, 0).await.unwrap();
        assert!(log.iter().any(|(_, e)| matches!(
            e,
            RuntimeEvent::GatewayTaken { edge_to, is_default: false, .. } if edge_to == "accept"
        )));

        // No property set — default edge
        let report = engine
            .start(GROUP, "triage", Properties::new())
            .await
            .unwrap();
        assert!(report.properties.contains_key("rejected"));
    }

    fn parallel_definition() -> ProcessDefinition {
        ProcessDefinition {
            id: "checks".to_string(),
            meta: None,
            nodes: vec![
                NodeSpec::Start { id: "start".to_string() },
                NodeSpec::ParallelGateway {
                    id: "fork".to_string(),
                    direction: GatewayDirection::Diverging,
                },
                service("check_a", "check_a"),
                service("check_b", "check_b"),
                NodeSpec::ParallelGateway {
                    id: "join".to_string(),
                    direction: GatewayDirection::Converging,
                },
                NodeSpec::End { id: "end".to_string(), terminate: false },
            ],
            edges: vec![
                EdgeSpec::direct("start", "fork"),
                EdgeSpec::direct("fork", "check_a"),
                EdgeSpec::direct("fork", "check_b"),
                EdgeSpec::direct("check_a", "join"),
                EdgeSpec::direct("check_b", "join"),
                EdgeSpec::direct("join", "end"),
            ],
        }
    }

    #[tokio::test]
    async fn parallel_fork_and_join() {
        let handlers = HandlerRegistry::new()
            .service_fn("check_a", mark("a_done"))
            .service_fn("check_b", mark("b_done"));
        let (store, engine) = engine_with(handlers);
        engine.deploy(GROUP, parallel_definition()).await.unwrap();

        let report = engine
            .start(GROUP, "checks", Properties::new())
            .await
            .unwrap();
        assert_eq!(report.status, RunStatus::Completed);
        // Writes from BOTH branches survive the join barrier
        assert_eq!(report.properties.get("a_done"), Some(&serde_json::json!(true)));
        assert_eq!(report.properties.get("b_done"), Some(&serde_json::json!(true)));

        let log = store.read_events(report.instance_id, 0).await.unwrap();
        let arrivals = log
            .iter()
            .filter(|(_, e)| matches!(e, RuntimeEvent::JoinArrived { .. }))
            .count();
        let releases = log
            .iter()
            .filter(|(_, e)| matches!(e, RuntimeEvent::JoinReleased { .. }))
            .count();
        assert_eq!((arrivals, releases), (2, 1));
        // One end, not two
        let completions = log
            .iter()
            .filter(|(_, e)| matches!(e, RuntimeEvent::NodeCompleted { node_id } if node_id == "end"))
            .count();
        assert_eq!(completions, 1);
    }

    struct FailingScripts;

    #[async_trait]
    impl ScriptRunner for FailingScripts {
        async fn eval(&self, _source: &str, _properties: &mut Properties) -> anyhow::Result<()> {
            Err(anyhow!("syntax error"))
        }
    }

    /// Script errors are caught and converted to an error event, never
    /// propagated as an engine error.
    #[tokio::test]
    async fn script_error_fails_instance() {
        let handlers = HandlerRegistry::new().script_runner(FailingScripts);
        let (store, engine) = engine_with(handlers);

        let definition = ProcessDefinition {
            id: "scripted".to_string(),
            meta: None,
            nodes: vec![
                NodeSpec::Start { id: "start".to_string() },
                NodeSpec::ScriptTask {
                    id: "calc".to_string(),
                    source: "total = a + b".to_string(),
                    error_code: None,
                },
                NodeSpec::End { id: "end".to_string(), terminate: false },
            ],
            edges: vec![
                EdgeSpec::direct("start", "calc"),
                EdgeSpec::direct("calc", "end"),
            ],
        };
        engine.deploy(GROUP, definition).await.unwrap();

        let report = engine
            .start(GROUP, "scripted", Properties::new())
            .await
            .unwrap();
        assert_eq!(
            report.status,
            RunStatus::Failed { code: "SCRIPT_ERROR".to_string() }
        );

        let log = store.read_events(report.instance_id, 0).await.unwrap();
        assert!(log.iter().any(|(_, e)| matches!(
            e,
            RuntimeEvent::ErrorRaised { code, source_node } if code == "SCRIPT_ERROR" && source_node == "calc"
        )));
        assert!(log
            .iter()
            .any(|(_, e)| matches!(e, RuntimeEvent::InstanceFailed { .. })));
    }

    #[tokio::test]
    async fn error_end_event_fails_with_code() {
        let (_, engine) = engine_with(HandlerRegistry::new());
        let definition = ProcessDefinition {
            id: "strict".to_string(),
            meta: None,
            nodes: vec![
                NodeSpec::Start { id: "start".to_string() },
                NodeSpec::ErrorEnd {
                    id: "boom".to_string(),
                    code: "REJECTED".to_string(),
                },
            ],
            edges: vec![EdgeSpec::direct("start", "boom")],
        };
        engine.deploy(GROUP, definition).await.unwrap();

        let report = engine
            .start(GROUP, "strict", Properties::new())
            .await
            .unwrap();
        assert_eq!(report.status, RunStatus::Failed { code: "REJECTED".to_string() });
    }

    #[tokio::test]
    async fn terminate_end_drops_pending_tokens() {
        let (store, engine) = engine_with(HandlerRegistry::new());
        let definition = ProcessDefinition {
            id: "abort".to_string(),
            meta: None,
            nodes: vec![
                NodeSpec::Start { id: "start".to_string() },
                NodeSpec::ParallelGateway {
                    id: "fork".to_string(),
                    direction: GatewayDirection::Diverging,
                },
                NodeSpec::End { id: "halt".to_string(), terminate: true },
                NodeSpec::UserTask {
                    id: "never_reached".to_string(),
                    assignee: None,
                },
                NodeSpec::End { id: "end".to_string(), terminate: false },
            ],
            edges: vec![
                EdgeSpec::direct("start", "fork"),
                EdgeSpec::direct("fork", "halt"),
                EdgeSpec::direct("fork", "never_reached"),
                EdgeSpec::direct("never_reached", "end"),
            ],
        };
        engine.deploy(GROUP, definition).await.unwrap();

        let report = engine
            .start(GROUP, "abort", Properties::new())
            .await
            .unwrap();
        assert_eq!(report.status, RunStatus::Terminated);

        let log = store.read_events(report.instance_id, 0).await.unwrap();
        assert!(log
            .iter()
            .any(|(_, e)| matches!(e, RuntimeEvent::InstanceTerminated { .. })));
        // The user task token was dropped before it could suspend
        assert_eq!(store.count_states(report.instance_id).await.unwrap(), 0);
        assert!(!log
            .iter()
            .any(|(_, e)| matches!(e, RuntimeEvent::StateSuspended { .. })));
    }

    fn child_definition() -> ProcessDefinition {
        ProcessDefinition {
            id: "archive".to_string(),
            meta: None,
            nodes: vec![
                NodeSpec::Start { id: "start".to_string() },
                service("store_docs", "store_docs"),
                NodeSpec::End { id: "end".to_string(), terminate: false },
            ],
            edges: vec![
                EdgeSpec::direct("start", "store_docs"),
                EdgeSpec::direct("store_docs", "end"),
            ],
        }
    }

    fn caller_definition() -> ProcessDefinition {
        ProcessDefinition {
            id: "wrap_up".to_string(),
            meta: None,
            nodes: vec![
                NodeSpec::Start { id: "start".to_string() },
                NodeSpec::CallActivity {
                    id: "archive_call".to_string(),
                    process_id: "archive".to_string(),
                    group: None,
                },
                NodeSpec::End { id: "end".to_string(), terminate: false },
            ],
            edges: vec![
                EdgeSpec::direct("start", "archive_call"),
                EdgeSpec::direct("archive_call", "end"),
            ],
        }
    }

    #[tokio::test]
    async fn call_activity_resumes_parent_with_child_memory() {
        let handlers = HandlerRegistry::new().service_fn("store_docs", mark("archived"));
        let (store, engine) = engine_with(handlers);
        engine.deploy(GROUP, child_definition()).await.unwrap();
        engine.deploy(GROUP, caller_definition()).await.unwrap();

        let report = engine
            .start(GROUP, "wrap_up", Properties::new())
            .await
            .unwrap();
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.properties.get("archived"), Some(&serde_json::json!(true)));

        let log = store.read_events(report.instance_id, 0).await.unwrap();
        assert!(log
            .iter()
            .any(|(_, e)| matches!(e, RuntimeEvent::SubprocessLaunched { .. })));
        assert!(log
            .iter()
            .any(|(_, e)| matches!(e, RuntimeEvent::ParentResumed { .. })));
        // Parent call-activity state was consumed on resume
        assert_eq!(store.count_states(report.instance_id).await.unwrap(), 0);
    }

    /// Child suspends on a wait; the parent stays Waiting and resumes once
    /// the child's event arrives.
    #[tokio::test]
    async fn call_activity_with_waiting_child() {
        let handlers = HandlerRegistry::new().service_fn("ship", mark("shipped"));
        let (_, engine) = engine_with(handlers);
        engine.deploy(GROUP, message_definition()).await.unwrap();

        let caller = ProcessDefinition {
            id: "fulfil".to_string(),
            meta: None,
            nodes: vec![
                NodeSpec::Start { id: "start".to_string() },
                NodeSpec::CallActivity {
                    id: "ship_call".to_string(),
                    process_id: "shipping".to_string(),
                    group: None,
                },
                NodeSpec::End { id: "end".to_string(), terminate: false },
            ],
            edges: vec![
                EdgeSpec::direct("start", "ship_call"),
                EdgeSpec::direct("ship_call", "end"),
            ],
        };
        engine.deploy(GROUP, caller).await.unwrap();

        let report = engine
            .start(GROUP, "fulfil", Properties::new())
            .await
            .unwrap();
        assert_eq!(report.status, RunStatus::Waiting);

        let event = Event::Message {
            group: GROUP.to_string(),
            name: "payment_received".to_string(),
        };
        let resumed = engine.deliver(&event, &Properties::new()).await.unwrap();
        // Child resumed and completed, then the parent completed
        assert_eq!(resumed.len(), 2);
        assert_eq!(resumed[0].process_id, "shipping");
        assert_eq!(resumed[0].status, RunStatus::Completed);
        assert_eq!(resumed[1].process_id, "fulfil");
        assert_eq!(resumed[1].status, RunStatus::Completed);
        assert_eq!(resumed[1].properties.get("shipped"), Some(&serde_json::json!(true)));
    }

    fn self_calling_definition() -> ProcessDefinition {
        ProcessDefinition {
            id: "matryoshka".to_string(),
            meta: None,
            nodes: vec![
                NodeSpec::Start { id: "start".to_string() },
                NodeSpec::CallActivity {
                    id: "again".to_string(),
                    process_id: "matryoshka".to_string(),
                    group: None,
                },
                NodeSpec::End { id: "end".to_string(), terminate: false },
            ],
            edges: vec![
                EdgeSpec::direct("start", "again"),
                EdgeSpec::direct("again", "end"),
            ],
        }
    }

    /// Child launches count against the caller's step budget, so recursion
    /// through a call activity errors instead of growing without bound.
    #[tokio::test]
    async fn recursive_call_activity_exhausts_step_budget() {
        let (_, engine_base) = engine_with(HandlerRegistry::new());
        let engine = engine_base.with_max_steps(50);
        engine.deploy(GROUP, self_calling_definition()).await.unwrap();

        let err = engine
            .start(GROUP, "matryoshka", Properties::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::StepBudget(50)));
    }

    /// A generous step budget still cannot nest launches past the depth cap.
    #[tokio::test]
    async fn call_nesting_depth_is_capped() {
        let (_, engine) = engine_with(HandlerRegistry::new());
        engine.deploy(GROUP, self_calling_definition()).await.unwrap();

        let err = engine
            .start(GROUP, "matryoshka", Properties::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::CallDepth(_)));
    }

    /// A signal thrown by one instance resumes another within the same drive.
    #[tokio::test]
    async fn signal_throw_resumes_other_instance() {
        let (store, engine) = engine_with(HandlerRegistry::new());

        let waiter = ProcessDefinition {
            id: "waiter".to_string(),
            meta: None,
            nodes: vec![
                NodeSpec::Start { id: "start".to_string() },
                NodeSpec::SignalCatch {
                    id: "wait_go".to_string(),
                    signal: "go".to_string(),
                },
                NodeSpec::End { id: "end".to_string(), terminate: false },
            ],
            edges: vec![
                EdgeSpec::direct("start", "wait_go"),
                EdgeSpec::direct("wait_go", "end"),
            ],
        };
        let thrower = ProcessDefinition {
            id: "thrower".to_string(),
            meta: None,
            nodes: vec![
                NodeSpec::Start { id: "start".to_string() },
                NodeSpec::SignalThrow {
                    id: "announce".to_string(),
                    signal: "go".to_string(),
                },
                NodeSpec::End { id: "end".to_string(), terminate: false },
            ],
            edges: vec![
                EdgeSpec::direct("start", "announce"),
                EdgeSpec::direct("announce", "end"),
            ],
        };
        engine.deploy(GROUP, waiter).await.unwrap();
        engine.deploy(GROUP, thrower).await.unwrap();

        let waiting = engine
            .start(GROUP, "waiter", Properties::new())
            .await
            .unwrap();
        assert_eq!(waiting.status, RunStatus::Waiting);

        let thrown = engine
            .start(GROUP, "thrower", Properties::new())
            .await
            .unwrap();
        assert_eq!(thrown.status, RunStatus::Completed);
        assert_eq!(thrown.emitted.len(), 1);

        // The waiter was resumed inside the same drive
        let log = store.read_events(waiting.instance_id, 0).await.unwrap();
        assert!(log
            .iter()
            .any(|(_, e)| matches!(e, RuntimeEvent::EventDelivered { .. })));
        assert!(log
            .iter()
            .any(|(_, e)| matches!(e, RuntimeEvent::InstanceCompleted { .. })));
        let waiter_ref = NodeRef::new(GROUP, "waiter", waiting.instance_id, "wait_go");
        assert!(store.read_state(&waiter_ref).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn step_budget_stops_runaway_definitions() {
        let (_, engine_base) = engine_with(
            HandlerRegistry::new().service_fn("spin", |_props| Ok(())),
        );
        let engine = engine_base.with_max_steps(25);

        // xor loops back to the task while `done` stays unset
        let definition = ProcessDefinition {
            id: "spinner".to_string(),
            meta: None,
            nodes: vec![
                NodeSpec::Start { id: "start".to_string() },
                service("spin_task", "spin"),
                NodeSpec::ExclusiveGateway { id: "again".to_string() },
                NodeSpec::End { id: "end".to_string(), terminate: false },
            ],
            edges: vec![
                EdgeSpec::direct("start", "spin_task"),
                EdgeSpec::direct("spin_task", "again"),
                EdgeSpec {
                    condition: Some(Condition {
                        property: "done".to_string(),
                        op: ConditionOp::Eq,
                        value: serde_json::json!(true),
                    }),
                    ..EdgeSpec::direct("again", "end")
                },
                EdgeSpec {
                    is_default: true,
                    ..EdgeSpec::direct("again", "spin_task")
                },
            ],
        };
        engine.deploy(GROUP, definition).await.unwrap();

        let err = engine
            .start(GROUP, "spinner", Properties::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::StepBudget(25)));
    }

    /// Actions are applied strictly in the order a node returns them.
    #[tokio::test]
    async fn action_order_is_preserved() {
        let (store, engine) = engine_with(HandlerRegistry::new());
        let definition = ProcessDefinition {
            id: "emit_then_end".to_string(),
            meta: None,
            nodes: vec![
                NodeSpec::Start { id: "start".to_string() },
                NodeSpec::SignalThrow {
                    id: "announce".to_string(),
                    signal: "done".to_string(),
                },
                NodeSpec::End { id: "end".to_string(), terminate: false },
            ],
            edges: vec![
                EdgeSpec::direct("start", "announce"),
                EdgeSpec::direct("announce", "end"),
            ],
        };
        engine.deploy(GROUP, definition).await.unwrap();

        let report = engine
            .start(GROUP, "emit_then_end", Properties::new())
            .await
            .unwrap();

        // Emit precedes the throw node's completion in the audit trail
        let log = store.read_events(report.instance_id, 0).await.unwrap();
        let emit_seq = log
            .iter()
            .position(|(_, e)| matches!(e, RuntimeEvent::EventEmitted { .. }))
            .unwrap();
        let complete_seq = log
            .iter()
            .position(
                |(_, e)| matches!(e, RuntimeEvent::NodeCompleted { node_id } if node_id == "announce"),
            )
            .unwrap();
        assert!(emit_seq < complete_seq);
    }
}
