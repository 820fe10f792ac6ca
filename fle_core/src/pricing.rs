//! Item prices derived from recipe data.
//!
//! Raw resources carry fixed seed prices. Every other item costs the cheapest
//! recipe that makes it: the ingredient cost raised slightly above linear plus
//! a crafting-time surcharge, shared across the recipe's products.

use std::collections::{HashMap, HashSet};

use fle_schema::{ItemCounts, Recipe};

const INGREDIENT_EXPONENT: f64 = 1.025;

const SEED_PRICES: &[(&str, f64)] = &[
    ("iron-ore", 3.1),
    ("copper-ore", 3.6),
    ("coal", 3.0),
    ("stone", 2.4),
    ("wood", 3.2),
    ("crude-oil", 0.2),
    ("water", 0.001),
    ("steam", 0.001),
    ("uranium-ore", 8.2),
    ("raw-fish", 100.0),
];

pub fn seed_prices() -> ItemCounts {
    SEED_PRICES
        .iter()
        .map(|(item, price)| (item.to_string(), *price))
        .collect()
}

/// Prices for every item reachable from the seeds through `recipes`. Items
/// only obtainable through a recipe cycle, or from unpriced ingredients, are
/// left out.
pub fn price_list(recipes: &[Recipe]) -> ItemCounts {
    let mut producers: HashMap<&str, Vec<&Recipe>> = HashMap::new();
    for recipe in recipes {
        for product in &recipe.products {
            producers.entry(product.name.as_str()).or_default().push(recipe);
        }
    }

    let mut pricer = Pricer {
        producers,
        prices: seed_prices(),
        visiting: HashSet::new(),
    };
    let mut items: Vec<&str> = pricer.producers.keys().copied().collect();
    items.sort_unstable();
    for item in items {
        pricer.price(item);
    }
    pricer.prices
}

struct Pricer<'a> {
    producers: HashMap<&'a str, Vec<&'a Recipe>>,
    prices: ItemCounts,
    visiting: HashSet<&'a str>,
}

impl<'a> Pricer<'a> {
    fn price(&mut self, item: &'a str) -> Option<f64> {
        if let Some(price) = self.prices.get(item) {
            return Some(*price);
        }
        if !self.visiting.insert(item) {
            return None;
        }
        let recipes = self.producers.get(item).cloned().unwrap_or_default();
        let best = recipes
            .into_iter()
            .filter_map(|recipe| self.recipe_price(recipe))
            .fold(None, |best: Option<f64>, price| {
                Some(best.map_or(price, |best| best.min(price)))
            });
        self.visiting.remove(item);
        if let Some(price) = best {
            self.prices.insert(item.to_string(), price);
        }
        best
    }

    /// Per-unit price of the products of `recipe`.
    fn recipe_price(&mut self, recipe: &'a Recipe) -> Option<f64> {
        let produced: f64 = recipe.products.iter().map(|product| product.amount).sum();
        if produced <= 0.0 {
            return None;
        }
        let mut ingredient_cost = 0.0;
        for ingredient in &recipe.ingredients {
            ingredient_cost += self.price(&ingredient.name)? * ingredient.amount;
        }
        let surcharge = (recipe.energy.max(0.0) + 1.0).ln() * ingredient_cost.sqrt();
        Some((ingredient_cost.powf(INGREDIENT_EXPONENT) + surcharge) / produced)
    }
}
