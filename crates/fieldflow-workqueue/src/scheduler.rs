//! Claim-ordering policy.
//!
//! Strict tier precedence, then weight, then FIFO. A continuous stream
//! of High-tier tasks can starve Normal-tier ones indefinitely; no
//! starvation guard exists.

use std::cmp::Ordering;

use crate::task::{PriorityTier, Task};

/// Tiers in the order `claim_next` drains them. The first tier with an
/// eligible task wins.
pub const TIER_PRECEDENCE: [PriorityTier; 2] = [PriorityTier::High, PriorityTier::Normal];

/// Ordering within a tier: higher weight first, ties broken by earlier
/// creation time. The SQLite store mirrors this in its `ORDER BY`.
pub fn within_tier_cmp(a: &Task, b: &Task) -> Ordering {
    b.weight
        .cmp(&a.weight)
        .then_with(|| a.created_at.cmp(&b.created_at))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_weight_wins_within_tier() {
        let light = Task::new("a", json!(null)).with_weight(1);
        let heavy = Task::new("b", json!(null)).with_weight(10);

        assert_eq!(within_tier_cmp(&heavy, &light), Ordering::Less);
        assert_eq!(within_tier_cmp(&light, &heavy), Ordering::Greater);
    }

    #[test]
    fn test_fifo_breaks_weight_ties() {
        let older = Task::new("a", json!(null));
        let mut newer = Task::new("b", json!(null));
        newer.created_at = older.created_at + chrono::Duration::seconds(5);

        assert_eq!(within_tier_cmp(&older, &newer), Ordering::Less);
    }

    #[test]
    fn test_high_tier_claimed_first() {
        assert_eq!(TIER_PRECEDENCE[0], PriorityTier::High);
        assert_eq!(TIER_PRECEDENCE[1], PriorityTier::Normal);
    }
}
