use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::lua_compat::seq_or_empty;
use crate::StateError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct Ingredient {
    pub name: String,
    pub amount: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct TechRecord {
    pub name: String,
    #[serde(default)]
    pub researched: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub level: u32,
    #[serde(default)]
    pub research_unit_count: u64,
    #[serde(default)]
    pub research_unit_energy: f64,
    #[serde(default, deserialize_with = "seq_or_empty")]
    #[schemars(with = "Vec<String>")]
    pub prerequisites: Vec<String>,
    #[serde(default, deserialize_with = "seq_or_empty")]
    #[schemars(with = "Vec<Ingredient>")]
    pub ingredients: Vec<Ingredient>,
}

fn default_enabled() -> bool {
    true
}

impl TechRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            researched: false,
            enabled: true,
            level: 1,
            research_unit_count: 0,
            research_unit_energy: 0.0,
            prerequisites: Vec::new(),
            ingredients: Vec::new(),
        }
    }
}

/// Research progress of the agents' force.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default, JsonSchema)]
pub struct ResearchState {
    #[serde(default)]
    pub technologies: BTreeMap<String, TechRecord>,
    #[serde(default)]
    pub current_research: Option<String>,
    #[serde(default)]
    pub research_progress: f64,
    #[serde(default, deserialize_with = "seq_or_empty")]
    #[schemars(with = "Vec<String>")]
    pub research_queue: Vec<String>,
    #[serde(default)]
    pub progress: BTreeMap<String, f64>,
}

impl ResearchState {
    /// State with nothing researched and nothing queued.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn researched(&self) -> impl Iterator<Item = &TechRecord> {
        self.technologies.values().filter(|tech| tech.researched)
    }

    pub fn validate(&self) -> Result<(), StateError> {
        if !(0.0..=1.0).contains(&self.research_progress) {
            return Err(StateError::Research(format!(
                "research_progress {} outside [0, 1]",
                self.research_progress
            )));
        }
        if let Some(current) = &self.current_research {
            if !self.technologies.contains_key(current) {
                return Err(StateError::Research(format!(
                    "current research '{current}' is not a known technology"
                )));
            }
            if self.research_queue.first() != Some(current) {
                return Err(StateError::Research(format!(
                    "current research '{current}' must head the research queue"
                )));
            }
        }
        Ok(())
    }
}
