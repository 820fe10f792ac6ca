//! Data contracts shared by the session core, the runtime helpers and tooling.
//!
//! Everything here is plain serializable data; nothing depends on a live
//! connection to the simulation.

mod entities;
mod lua_compat;
mod production;
mod research;
mod state;

use thiserror::Error;

pub use entities::{Entity, EntityGroup, EntityView, NetworkKind, Position};
pub use lua_compat::seq_or_empty;
pub use production::{
    CraftEvent, ItemCounts, NewProductionFlow, ProductionFlow, Recipe, RecipeItem,
};
pub use research::{Ingredient, ResearchState, TechRecord};
pub use state::{
    EntityPayload, GameState, Inventory, Message, NamespaceSnapshot, GAME_STATE_VERSION,
};

#[derive(Debug, Error)]
pub enum StateError {
    #[error("{field} has {found} entries but the session has {expected} agents")]
    AgentCount {
        field: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("invalid research state: {0}")]
    Research(String),
    #[error("entity payload error: {0}")]
    Payload(String),
    #[error("unsupported game state version {0}")]
    UnsupportedVersion(u32),
    #[error("game state json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// JSON schema of the persisted [`GameState`] layout.
pub fn game_state_schema() -> schemars::schema::RootSchema {
    schemars::schema_for!(GameState)
}
