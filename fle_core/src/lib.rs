//! Session core for driving a factory simulation over its remote console.
//!
//! A [`Session`] connects to the simulation, loads the remote procedures,
//! keeps one [`Namespace`] per agent and turns production counters into
//! reward signals. Entity queries come back with connected networks folded
//! into groups.

pub mod config;
mod error;
pub mod grouping;
mod hooks;
mod namespace;
pub mod pricing;
mod procedure_cache;
pub mod profits;
mod session;
mod tools;
pub mod transport;
mod workers;

pub use config::{load_session_config_from_env, ConfigError, ProfitConfig, SessionConfig};
pub use error::SessionError;
pub use grouping::group_entities;
pub use hooks::{Hook, HookContext, HookPhase, HookTable};
pub use namespace::{EvalOutcome, Namespace, NamespaceState};
pub use pricing::price_list;
pub use procedure_cache::ProcedureCache;
pub use profits::{achievements, profits, Achievements, Profits};
pub use session::{ResetOptions, Session, StepReport};
pub use tools::Target;
pub use transport::{Channel, RconClient, Transport, TransportError};
pub use workers::WorkerSet;
