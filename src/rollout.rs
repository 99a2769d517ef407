//! Deterministic percentage rollout.
//!
//! A consumer's percentile is derived from its id alone, so inclusion never
//! needs stored per-consumer state and does not change across registry
//! rebuilds. The hash is the classic `h * 31 + c` over UTF-16 code units,
//! wrapped to signed 32 bits. It spreads ids evenly enough for staged
//! rollouts but is not collision resistant; ids chosen adversarially can land
//! in any bucket they like.

use crate::models::{RegistryEntry, RegistrySnapshot};

/// Stable 32-bit polynomial hash of `consumer_id`.
pub fn consumer_hash(consumer_id: &str) -> i32 {
    consumer_id
        .encode_utf16()
        .fold(0i32, |h, unit| h.wrapping_mul(31).wrapping_add(unit as i32))
}

/// The consumer's bucket in `0..100`.
pub fn percentile(consumer_id: &str) -> u8 {
    // Widen before abs so i32::MIN does not overflow.
    (i64::from(consumer_hash(consumer_id)).abs() % 100) as u8
}

/// Whether `consumer_id` falls inside a rollout of `rollout_percentage`.
///
/// Monotonic in the percentage: raising it only adds consumers. Values above
/// 100 behave like 100.
pub fn is_included(consumer_id: &str, rollout_percentage: u8) -> bool {
    percentile(consumer_id) < rollout_percentage
}

/// The entries of `registry` visible to `consumer_id`.
pub fn get_for_consumer<'a>(
    registry: &'a RegistrySnapshot,
    consumer_id: &str,
) -> Vec<&'a RegistryEntry> {
    let bucket = percentile(consumer_id);
    registry
        .entries
        .iter()
        .filter(|entry| bucket < entry.rollout_percentage)
        .collect()
}
