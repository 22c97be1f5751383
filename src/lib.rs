//! Browser automation agent: observes a live page, asks a decision
//! service for the next action and carries it out with bounded retries.

pub mod brain;
pub mod config;
pub mod decision;
pub mod dom;
pub mod errors;
pub mod guard;
pub mod hands;
pub mod llm;
pub mod orchestrator;
pub mod rank;
pub mod recovery;
pub mod resolver;
pub mod rules;
pub mod subagent;
pub mod toolbox;
pub mod tools;
pub mod types;

pub use config::AgentConfig;
pub use errors::{AgentError, DecisionError, DriverError, ErrorKind, ServiceError};
pub use orchestrator::{AgentEvent, Orchestrator};
