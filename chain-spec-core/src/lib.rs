//! Declarative chain definitions: tasks, handlers, transitions, validation.
//!
//! This crate defines the wire shape of a task chain and the static checks
//! applied before execution. It does not depend on the runtime; the engine
//! crate interprets these types. Everything here is plain serde data.

mod chain;
mod handler;
mod transition;
mod validate;

pub use chain::{ChainDefinition, ComposeSpec, ExecuteConfig, HookSpec, TaskDefinition};
pub use handler::TaskHandler;
pub use transition::{TaskTransition, TransitionBranch, TransitionOperator, TERM_END, TERM_ERROR};
pub use validate::{validate_chain, ValidationError};
