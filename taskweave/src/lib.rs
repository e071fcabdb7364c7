//! taskweave: a runtime that executes declarative, LLM-centric task chains
//! against a federation of model-serving backends.
//!
//! Two subsystems form the core:
//!
//! - The **chain engine** ([`chain`]) interprets a [`chain_spec_core::ChainDefinition`]:
//!   it renders per-task prompt templates from prior outputs, dispatches typed
//!   handlers through the [`tasks`] executor, and drives the branching
//!   transition state machine until a terminal sentinel.
//! - The **runtime-state reconciler** ([`state`]) converges the observed state
//!   of each declared backend (ollama/vllm/openai/gemini) toward the declared
//!   model set, queueing downloads for missing models and publishing an
//!   immutable snapshot the [`provider`] resolver selects clients from.
//!
//! Around them: the [`download`] orchestrator (one pull at a time per backend,
//! cancellable over the bus), the [`hooks`] dispatcher (uniform `exec`
//! contract, also the tool surface for chat completions), the [`functions`]
//! cache (content-addressed compiled JS with a circuit-breaker sync loop),
//! and the [`events`] source.
//!
//! Persistence and messaging are consumed through the [`store`] and [`bus`]
//! contracts; in-memory implementations back the test suite and single-node
//! deployments.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use taskweave::bus::InMemoryBus;
//! use taskweave::chain::ChainEngine;
//! use taskweave::hooks::MultiHookRepo;
//! use taskweave::provider::ProviderResolver;
//! use taskweave::state::RuntimeStateService;
//! use taskweave::store::InMemoryStore;
//! use taskweave::tasks::TaskExecutor;
//! use taskweave::value::TypedValue;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(InMemoryStore::new());
//! let bus = Arc::new(InMemoryBus::new());
//! let state = Arc::new(RuntimeStateService::new(store.clone(), Default::default()));
//! let resolver = Arc::new(ProviderResolver::new(state.clone()));
//! let hooks = Arc::new(MultiHookRepo::new(vec![]));
//! let executor = TaskExecutor::new(resolver, hooks.clone());
//! let engine = ChainEngine::new(executor, hooks);
//!
//! let chain: taskweave::spec::ChainDefinition = serde_json::from_str("...")?;
//! let result = engine
//!     .execute(&CancellationToken::new(), &chain, TypedValue::string("hi"), vec![])
//!     .await?;
//! println!("{:?}", result.output);
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod chain;
pub mod download;
pub mod entities;
pub mod events;
pub mod functions;
pub mod history;
pub mod hooks;
pub mod provider;
pub mod runtime;
pub mod state;
pub mod store;
pub mod tasks;
pub mod value;

pub use chain_spec_core as spec;
