//! Identity resolution and quantity accumulation for a single observation.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{display_name, generate_variants, loose_name_key, InventoryRecord, ItemId, ItemObservation};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum MergeAction {
    Inserted,
    Updated,
}

/// The record to write for one observation, and whether it replaces an existing row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MergePlan {
    pub action: MergeAction,
    pub record: InventoryRecord,
}

/// Whether `record` resolves to `canonical_key` by key equality or legacy display-name variant.
#[must_use]
pub fn record_matches(record: &InventoryRecord, canonical_key: &str) -> bool {
    record.canonical_key.as_deref() == Some(canonical_key)
        || generate_variants(canonical_key).contains(&loose_name_key(&record.display_name))
}

/// Pick exactly one record an observation resolves to.
///
/// Exact key matches win over variant-only matches; remaining ties are broken by canonical
/// key (absent keys last), then lower-cased display name, then item id.
#[must_use]
pub fn select_match<'a>(
    candidates: &'a [InventoryRecord],
    canonical_key: &str,
) -> Option<&'a InventoryRecord> {
    candidates.iter().filter(|record| record_matches(record, canonical_key)).min_by(|lhs, rhs| {
        let exact = |record: &InventoryRecord| record.canonical_key.as_deref() != Some(canonical_key);
        exact(lhs)
            .cmp(&exact(rhs))
            .then_with(|| lhs.canonical_key.is_none().cmp(&rhs.canonical_key.is_none()))
            .then_with(|| lhs.canonical_key.cmp(&rhs.canonical_key))
            .then_with(|| loose_name_key(&lhs.display_name).cmp(&loose_name_key(&rhs.display_name)))
            .then_with(|| lhs.item_id.cmp(&rhs.item_id))
    })
}

/// Fold one observation into its resolved record, or plan a fresh insert.
///
/// Only quantity accumulates; every other field takes the observation's value.
#[must_use]
pub fn merge_observation(
    existing: Option<&InventoryRecord>,
    observation: &ItemObservation,
    canonical_key: &str,
    image_ref: Option<&str>,
    detected_at: OffsetDateTime,
) -> MergePlan {
    let (action, item_id, quantity) = match existing {
        Some(record) => (
            MergeAction::Updated,
            record.item_id,
            record.quantity.saturating_add(observation.quantity),
        ),
        None => (MergeAction::Inserted, ItemId::new(), observation.quantity),
    };

    MergePlan {
        action,
        record: InventoryRecord {
            item_id,
            display_name: display_name(&observation.name),
            canonical_key: Some(canonical_key.to_string()),
            quantity,
            expires_in_days: observation.expires_in_days,
            category: observation.category.clone(),
            image_ref: image_ref.map(ToString::to_string),
            bounding_box: observation.bounding_box,
            detected_at,
        },
    }
}
