//! Reward signals derived from two production samples.
//!
//! Static profit values deliberate crafting; dynamic profit values the net
//! change of the remaining flows. Achievements split newly created items the
//! same way.

use fle_schema::{CraftEvent, ItemCounts, NewProductionFlow, ProductionFlow};
use serde::Serialize;

use crate::config::ProfitConfig;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Profits {
    #[serde(rename = "static")]
    pub static_profit: f64,
    #[serde(rename = "dynamic")]
    pub dynamic_profit: f64,
    pub total: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Achievements {
    #[serde(rename = "static")]
    pub static_items: ItemCounts,
    #[serde(rename = "dynamic")]
    pub dynamic_items: ItemCounts,
}

/// Strictly positive counter increases between two samples plus the craft
/// events of `post` not matched by an equal event of `pre` (multiset
/// difference).
pub fn new_production_flows(pre: &ProductionFlow, post: &ProductionFlow) -> NewProductionFlow {
    let mut pre_crafted: Vec<&CraftEvent> = pre.crafted.iter().collect();
    let mut crafted = Vec::new();
    for craft in &post.crafted {
        match pre_crafted.iter().position(|known| *known == craft) {
            Some(index) => {
                pre_crafted.remove(index);
            }
            None => crafted.push(craft.clone()),
        }
    }

    NewProductionFlow {
        input: positive_deltas(&pre.input, &post.input),
        output: positive_deltas(&pre.output, &post.output),
        crafted,
        harvested: positive_deltas(&pre.harvested, &post.harvested),
    }
}

fn positive_deltas(pre: &ItemCounts, post: &ItemCounts) -> ItemCounts {
    post.iter()
        .filter_map(|(item, value)| {
            let diff = value - pre.get(item).copied().unwrap_or(0.0);
            (diff > 0.0).then(|| (item.clone(), diff))
        })
        .collect()
}

fn price(prices: &ItemCounts, item: &str) -> f64 {
    prices.get(item).copied().unwrap_or(0.0)
}

/// Subtract `amount` from `counts[item]` if present, dropping the entry when it
/// reaches exactly zero.
fn take_from(counts: &mut ItemCounts, item: &str, amount: f64) {
    if let Some(value) = counts.get_mut(item) {
        *value -= amount;
        if *value == 0.0 {
            counts.remove(item);
        }
    }
}

/// Profit of the new craft events. Harvested amounts and craft contributions
/// are removed from `flow` so the remainder can be valued dynamically.
///
/// Each craft contributes its unit profit times `min(cap, count)`; a cap of
/// zero or less disables the limit.
pub fn static_profits(flow: &mut NewProductionFlow, prices: &ItemCounts, cap: f64) -> f64 {
    for (item, value) in &flow.harvested {
        take_from(&mut flow.output, item, *value);
    }

    let mut profit = 0.0;
    for craft in &flow.crafted {
        let count = craft.crafted_count;
        if count <= 0.0 {
            continue;
        }
        let mut unit_profit = 0.0;
        for (item, value) in &craft.outputs {
            unit_profit += value / count * price(prices, item);
            take_from(&mut flow.output, item, *value);
        }
        for (item, value) in &craft.inputs {
            unit_profit -= value / count * price(prices, item);
            take_from(&mut flow.input, item, *value);
        }
        profit += if cap > 0.0 {
            unit_profit * cap.min(count)
        } else {
            unit_profit * count
        };
    }
    profit
}

/// Value of remaining outputs minus remaining inputs, scaled by `multiplier`.
pub fn dynamic_profits(flow: &NewProductionFlow, prices: &ItemCounts, multiplier: f64) -> f64 {
    let outputs: f64 = flow
        .output
        .iter()
        .map(|(item, value)| value * price(prices, item))
        .sum();
    let inputs: f64 = flow
        .input
        .iter()
        .map(|(item, value)| value * price(prices, item))
        .sum();
    (outputs - inputs) * multiplier
}

/// Static and dynamic profit between two samples, priced with `pre`'s list.
pub fn profits(pre: &ProductionFlow, post: &ProductionFlow, config: &ProfitConfig) -> Profits {
    let mut flow = new_production_flows(pre, post);
    let static_profit = static_profits(
        &mut flow,
        &pre.price_list,
        config.max_static_unit_profit_cap,
    );
    let dynamic_profit = dynamic_profits(&flow, &pre.price_list, config.dynamic_profit_multiplier);
    Profits {
        static_profit,
        dynamic_profit,
        total: static_profit + dynamic_profit,
    }
}

/// Items produced by harvesting or crafting since `pre`.
fn static_items(flow: &NewProductionFlow) -> ItemCounts {
    let mut items = flow.harvested.clone();
    for craft in &flow.crafted {
        for (item, value) in &craft.outputs {
            *items.entry(item.clone()).or_insert(0.0) += value;
        }
    }
    items
}

/// Split each item's output increase into the part explained by harvesting
/// and crafting (static) and the excess (dynamic). The static part never
/// exceeds the increase, so no unit is counted twice.
pub fn achievements(pre: &ProductionFlow, post: &ProductionFlow) -> Achievements {
    let statics = static_items(&new_production_flows(pre, post));
    let mut achievements = Achievements::default();

    for (item, post_value) in &post.output {
        let created = post_value - pre.output.get(item).copied().unwrap_or(0.0);
        if created <= 0.0 {
            continue;
        }
        let static_value = statics.get(item).copied().unwrap_or(0.0).min(created);
        if static_value > 0.0 {
            achievements.static_items.insert(item.clone(), static_value);
        }
        if created > static_value {
            achievements
                .dynamic_items
                .insert(item.clone(), created - static_value);
        }
    }
    achievements
}
