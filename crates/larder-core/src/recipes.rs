//! Recipe feasibility against what is on hand.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::{loose_name_key, InventoryRecord, Recipe};

/// Recipes missing this many ingredients or more are left out of both tiers.
pub const MAX_MISSING_INGREDIENTS: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MissingIngredient {
    pub name: String,
    pub quantity_needed: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecipeMatch {
    pub recipe: Recipe,
    pub missing_ingredients: Vec<MissingIngredient>,
    pub available_ingredients: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecipeFeasibility {
    pub fully_makeable: Vec<RecipeMatch>,
    pub almost_makeable: Vec<RecipeMatch>,
}

/// Lower-cased names of everything in the inventory, regardless of quantity.
#[must_use]
pub fn names_on_hand(inventory: &[InventoryRecord]) -> HashSet<String> {
    inventory.iter().map(|record| loose_name_key(&record.display_name)).collect()
}

/// Split one recipe's ingredients into present and missing.
#[must_use]
pub fn match_recipe(on_hand: &HashSet<String>, recipe: &Recipe) -> RecipeMatch {
    let mut missing_ingredients = Vec::new();
    let mut available_ingredients = Vec::new();
    for ingredient in &recipe.ingredients {
        if on_hand.contains(&loose_name_key(&ingredient.name)) {
            available_ingredients.push(ingredient.name.clone());
        } else {
            missing_ingredients.push(MissingIngredient {
                name: ingredient.name.clone(),
                quantity_needed: ingredient.quantity.unwrap_or(1),
            });
        }
    }
    RecipeMatch { recipe: recipe.clone(), missing_ingredients, available_ingredients }
}

/// Split recipes into makeable now and one or two ingredients short.
///
/// Presence only: any inventory record with the ingredient's name counts, whatever its quantity.
#[must_use]
pub fn classify_recipes(inventory: &[InventoryRecord], recipes: &[Recipe]) -> RecipeFeasibility {
    let on_hand = names_on_hand(inventory);
    let mut feasibility = RecipeFeasibility::default();

    for recipe in recipes {
        let matched = match_recipe(&on_hand, recipe);
        match matched.missing_ingredients.len() {
            0 => feasibility.fully_makeable.push(matched),
            count if count < MAX_MISSING_INGREDIENTS => feasibility.almost_makeable.push(matched),
            _ => {}
        }
    }

    feasibility
}
