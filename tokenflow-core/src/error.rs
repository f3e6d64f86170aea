use crate::definition::validate::ValidationError;
use thiserror::Error;

/// Typed failures surfaced by the engine API. Store and registry plumbing
/// errors flow through the `anyhow` variant.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown process: {group}:{process_id}")]
    UnknownProcess { group: String, process_id: String },

    #[error("unknown node: {0}")]
    UnknownNode(String),

    #[error("no suspended state for {0}")]
    MissingState(String),

    #[error("no handler registered for task type '{0}'")]
    MissingHandler(String),

    #[error("definition '{id}' failed validation: {}", format_rules(.errors))]
    InvalidDefinition {
        id: String,
        errors: Vec<ValidationError>,
    },

    #[error("step budget exhausted after {0} node executions")]
    StepBudget(usize),

    #[error("call activity nesting exceeded {0} levels")]
    CallDepth(usize),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

fn format_rules(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
