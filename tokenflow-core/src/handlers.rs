use crate::types::Properties;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

// ─── Behavior traits ──────────────────────────────────────────

/// Application code behind a service task, resolved by `task_type`.
#[async_trait]
pub trait ServiceBehavior: Send + Sync {
    async fn run(&self, properties: &mut Properties) -> Result<()>;
}

/// Evaluates script-task sources against the working memory.
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    async fn eval(&self, source: &str, properties: &mut Properties) -> Result<()>;
}

/// Evaluates business-rule decisions against the working memory.
#[async_trait]
pub trait DecisionEvaluator: Send + Sync {
    async fn decide(&self, decision: &str, properties: &mut Properties) -> Result<()>;
}

// ─── Closure adapters ─────────────────────────────────────────

struct ServiceFn<F>(F);

#[async_trait]
impl<F> ServiceBehavior for ServiceFn<F>
where
    F: Fn(&mut Properties) -> Result<()> + Send + Sync,
{
    async fn run(&self, properties: &mut Properties) -> Result<()> {
        (self.0)(properties)
    }
}

// ─── Registry ─────────────────────────────────────────────────

/// The factories exposed to nodes through the
/// [`Environment`](crate::environment::Environment): service behaviors keyed
/// by task type, plus optional script and business-rule engines.
#[derive(Default)]
pub struct HandlerRegistry {
    services: HashMap<String, Arc<dyn ServiceBehavior>>,
    script_runner: Option<Arc<dyn ScriptRunner>>,
    decision_evaluator: Option<Arc<dyn DecisionEvaluator>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service behavior under `task_type`. Builder-style.
    pub fn service(
        mut self,
        task_type: impl Into<String>,
        behavior: impl ServiceBehavior + 'static,
    ) -> Self {
        self.services.insert(task_type.into(), Arc::new(behavior));
        self
    }

    /// Register a plain closure as a service behavior.
    pub fn service_fn<F>(self, task_type: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut Properties) -> Result<()> + Send + Sync + 'static,
    {
        self.service(task_type, ServiceFn(f))
    }

    pub fn script_runner(mut self, runner: impl ScriptRunner + 'static) -> Self {
        self.script_runner = Some(Arc::new(runner));
        self
    }

    pub fn decision_evaluator(mut self, evaluator: impl DecisionEvaluator + 'static) -> Self {
        self.decision_evaluator = Some(Arc::new(evaluator));
        self
    }

    pub fn get_service(&self, task_type: &str) -> Option<Arc<dyn ServiceBehavior>> {
        self.services.get(task_type).cloned()
    }

    pub fn get_script_runner(&self) -> Option<Arc<dyn ScriptRunner>> {
        self.script_runner.clone()
    }

    pub fn get_decision_evaluator(&self) -> Option<Arc<dyn DecisionEvaluator>> {
        self.decision_evaluator.clone()
    }
}
