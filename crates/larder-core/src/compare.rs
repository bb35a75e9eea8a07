//! Shopping list vs. inventory satisfaction tiers.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{loose_name_key, GroceryEntry, InventoryRecord};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroceryStatus {
    pub name: String,
    pub quantity_needed: u32,
    pub quantity_available: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroceryComparison {
    pub fully_satisfied: Vec<GroceryStatus>,
    pub partially_satisfied: Vec<GroceryStatus>,
    pub missing: Vec<GroceryStatus>,
}

/// Sum inventory quantity per lower-cased display name.
pub(crate) fn quantities_by_name(inventory: &[InventoryRecord]) -> HashMap<String, u32> {
    let mut totals = HashMap::new();
    for record in inventory {
        let total = totals.entry(loose_name_key(&record.display_name)).or_insert(0_u32);
        *total = total.saturating_add(record.quantity);
    }
    totals
}

/// Bucket every grocery entry by how much of it the inventory already holds.
///
/// Entries keep their list order inside each bucket. An entry needing zero of something is
/// reported as missing even when stock exists.
#[must_use]
pub fn compare_grocery_list(
    inventory: &[InventoryRecord],
    groceries: &[GroceryEntry],
) -> GroceryComparison {
    let available_by_name = quantities_by_name(inventory);
    let mut comparison = GroceryComparison::default();

    for entry in groceries {
        let needed = entry.quantity_needed;
        let available =
            available_by_name.get(&loose_name_key(&entry.display_name)).copied().unwrap_or(0);
        let status = GroceryStatus {
            name: entry.display_name.clone(),
            quantity_needed: needed,
            quantity_available: available,
        };

        if needed > 0 && available >= needed {
            comparison.fully_satisfied.push(status);
        } else if available > 0 && available < needed {
            comparison.partially_satisfied.push(status);
        } else {
            comparison.missing.push(status);
        }
    }

    comparison
}
