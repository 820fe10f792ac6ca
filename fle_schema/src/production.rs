use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};

use crate::lua_compat::{seq_or_empty, sequence_index};

pub type ItemCounts = BTreeMap<String, f64>;

/// One crafting event reported by the simulation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct CraftEvent {
    #[serde(default, deserialize_with = "counts_or_empty")]
    #[schemars(with = "ItemCounts")]
    pub inputs: ItemCounts,
    #[serde(default, deserialize_with = "counts_or_empty")]
    #[schemars(with = "ItemCounts")]
    pub outputs: ItemCounts,
    pub crafted_count: f64,
}

/// Cumulative production counters sampled from the simulation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default, JsonSchema)]
pub struct ProductionFlow {
    #[serde(default, deserialize_with = "counts_or_empty")]
    #[schemars(with = "ItemCounts")]
    pub input: ItemCounts,
    #[serde(default, deserialize_with = "counts_or_empty")]
    #[schemars(with = "ItemCounts")]
    pub output: ItemCounts,
    #[serde(default, deserialize_with = "crafts_seq_or_map")]
    #[schemars(with = "Vec<CraftEvent>")]
    pub crafted: Vec<CraftEvent>,
    #[serde(default, deserialize_with = "counts_or_empty")]
    #[schemars(with = "ItemCounts")]
    pub harvested: ItemCounts,
    #[serde(default, deserialize_with = "counts_or_empty")]
    #[schemars(with = "ItemCounts")]
    pub price_list: ItemCounts,
}

impl ProductionFlow {
    pub fn price(&self, item: &str) -> f64 {
        self.price_list.get(item).copied().unwrap_or(0.0)
    }
}

/// One ingredient or product line of a recipe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecipeItem {
    pub name: String,
    pub amount: f64,
}

/// Recipe prototype as reported by the simulation; product amounts are
/// expected values (probability and amount ranges already folded in).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Recipe {
    pub name: String,
    #[serde(default)]
    pub energy: f64,
    #[serde(default, deserialize_with = "seq_or_empty")]
    pub ingredients: Vec<RecipeItem>,
    #[serde(default, deserialize_with = "seq_or_empty")]
    pub products: Vec<RecipeItem>,
}

/// Delta between two [`ProductionFlow`] samples: strictly positive counter
/// increases plus craft events not present in the earlier sample.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default, JsonSchema)]
pub struct NewProductionFlow {
    pub input: ItemCounts,
    pub output: ItemCounts,
    pub crafted: Vec<CraftEvent>,
    pub harvested: ItemCounts,
}

/// Decoded Lua tables arrive as `{}` when empty, which reads as a map; a
/// sequence of crafts may also arrive as an integer-keyed map.
fn crafts_seq_or_map<'de, D>(deserializer: D) -> Result<Vec<CraftEvent>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SeqOrMap {
        Seq(Vec<CraftEvent>),
        Map(BTreeMap<String, CraftEvent>),
    }

    Ok(match Option::<SeqOrMap>::deserialize(deserializer)? {
        Some(SeqOrMap::Seq(items)) => items,
        Some(SeqOrMap::Map(items)) => {
            let mut ordered: Vec<(String, CraftEvent)> = items.into_iter().collect();
            ordered.sort_by_key(|(key, _)| sequence_index(key));
            ordered.into_iter().map(|(_, craft)| craft).collect()
        }
        None => Vec::new(),
    })
}

/// Empty Lua tables decode as empty sequences or `nil` depending on the dumper.
fn counts_or_empty<'de, D>(deserializer: D) -> Result<ItemCounts, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum CountsOrSeq {
        Counts(ItemCounts),
        Seq(Vec<serde_json::Value>),
    }

    match Option::<CountsOrSeq>::deserialize(deserializer)? {
        Some(CountsOrSeq::Counts(counts)) => Ok(counts),
        Some(CountsOrSeq::Seq(items)) if items.is_empty() => Ok(ItemCounts::new()),
        Some(CountsOrSeq::Seq(_)) => Err(serde::de::Error::custom(
            "expected an item-count mapping, found a non-empty sequence",
        )),
        None => Ok(ItemCounts::new()),
    }
}
