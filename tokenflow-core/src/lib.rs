//! Token-passing workflow engine.
//!
//! A process is a graph of nodes and edges. Tokens ([`State`]) move along the
//! edges; each node's [`execute`](nodes::Node::execute) returns a list of
//! [`Action`]s that the [`Engine`] applies in order: advance the token,
//! persist it, suspend it against an external event, or throw one. Waiting
//! nodes (catch events, user and manual tasks) follow a two-phase pattern:
//! suspend with saved state on first visit, continue on reentry.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokenflow_core::{Engine, HandlerRegistry, InMemoryEventRegistry, MemoryStore, Properties};
//!
//! # async fn run() -> Result<(), tokenflow_core::EngineError> {
//! let handlers = HandlerRegistry::new().service_fn("send_invoice", |props| {
//!     props.insert("invoiced".into(), serde_json::json!(true));
//!     Ok(())
//! });
//! let engine = Engine::new(
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(InMemoryEventRegistry::new()),
//!     Arc::new(handlers),
//! );
//!
//! let yaml = r#"
//! id: invoice
//! nodes:
//!   - kind: Start
//!     id: start
//!   - kind: ServiceTask
//!     id: send
//!     task_type: send_invoice
//!   - kind: End
//!     id: end
//! edges:
//!   - { from: start, to: send }
//!   - { from: send, to: end }
//! "#;
//! let definition = tokenflow_core::definition::yaml::parse_definition_yaml(yaml)
//!     .map_err(tokenflow_core::EngineError::Internal)?;
//! engine.deploy("billing", definition).await?;
//! let report = engine.start("billing", "invoice", Properties::new()).await?;
//! # Ok(())
//! # }
//! ```

pub mod definition;
pub mod engine;
pub mod environment;
pub mod error;
pub mod events;
pub mod handlers;
pub mod nodes;
pub mod registry;
pub mod store;
pub mod store_memory;
#[cfg(feature = "postgres")]
pub mod store_postgres;
pub mod types;

pub use definition::{CompiledDefinition, ProcessDefinition};
pub use engine::{Engine, ExecutionReport, RunStatus};
pub use environment::Environment;
pub use error::EngineError;
pub use events::RuntimeEvent;
pub use handlers::{DecisionEvaluator, HandlerRegistry, ScriptRunner, ServiceBehavior};
pub use registry::{EventRegistry, InMemoryEventRegistry};
pub use store::ProcessStore;
pub use store_memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use store_postgres::PostgresStore;
pub use types::{Action, Event, NodeRef, Properties, State};
