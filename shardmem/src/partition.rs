//! Deterministic, communication-free partition planning.
//!
//! Every rank computes the same plan from `(total, granularity, world_size)`.
//! Surplus units go to the lowest ranks: with `units = total / granularity`,
//! rank `r` gets `units / world_size` units, plus one if
//! `r < units % world_size`. Persisted sharded files depend on this rule, so
//! it must not change.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, ShardMemError};

/// One rank's contiguous share.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionEntry {
    pub offset: u64,
    pub size: u64,
}

impl PartitionEntry {
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    pub fn range(&self) -> Range<u64> {
        self.offset..self.end()
    }

    pub fn contains(&self, offset: u64) -> bool {
        self.range().contains(&offset)
    }
}

/// Ordered, contiguous, non-overlapping per-rank shares of a byte region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionPlan {
    total: u64,
    granularity: u64,
    entries: Vec<PartitionEntry>,
}

impl PartitionPlan {
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn granularity(&self) -> u64 {
        self.granularity
    }

    pub fn world_size(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[PartitionEntry] {
        &self.entries
    }

    pub fn entry(&self, rank: usize) -> Result<PartitionEntry> {
        self.entries.get(rank).copied().ok_or_else(|| {
            ShardMemError::InvalidInput(format!(
                "rank {} out of range for world size {}",
                rank,
                self.entries.len()
            ))
        })
    }

    pub fn sizes(&self) -> Vec<u64> {
        self.entries.iter().map(|e| e.size).collect()
    }

    /// True when every rank holds the same number of bytes.
    pub fn is_uniform(&self) -> bool {
        (self.total / self.granularity) % self.entries.len() as u64 == 0
    }

    /// Resolve a global byte offset into `(rank, local_offset)`.
    ///
    /// O(1) for uniform plans, binary search over rank boundaries otherwise.
    /// Ranks with an empty share never own an offset.
    pub fn locate(&self, offset: u64) -> Result<(usize, u64)> {
        if offset >= self.total {
            return Err(ShardMemError::InvalidInput(format!(
                "offset {} outside region of {} bytes",
                offset, self.total
            )));
        }

        let rank = if self.is_uniform() {
            (offset / self.entries[0].size) as usize
        } else {
            self.entries.partition_point(|e| e.end() <= offset)
        };

        Ok((rank, offset - self.entries[rank].offset))
    }
}

/// Compute the byte plan for `total` bytes split across `world_size` ranks in
/// units of `granularity`.
pub fn determine_partition_plan(
    total: u64,
    granularity: u64,
    world_size: usize,
) -> Result<PartitionPlan> {
    if granularity == 0 {
        return Err(ShardMemError::InvalidInput(
            "granularity must be non-zero".into(),
        ));
    }
    if world_size == 0 {
        return Err(ShardMemError::InvalidInput(
            "world size must be at least 1".into(),
        ));
    }
    if total % granularity != 0 {
        return Err(ShardMemError::InvalidInput(format!(
            "total size {} is not a multiple of granularity {}",
            total, granularity
        )));
    }

    let units = total / granularity;
    let entries = (0..world_size)
        .map(|rank| {
            let share = split(units, world_size, rank);
            PartitionEntry {
                offset: share.start * granularity,
                size: (share.end - share.start) * granularity,
            }
        })
        .collect();

    Ok(PartitionPlan {
        total,
        granularity,
        entries,
    })
}

/// The calling rank's `(first_entry, entry_count)` share of
/// `total_entry_count` logical records.
///
/// Same remainder rule as [`determine_partition_plan`], so a record never
/// straddles two ranks.
pub fn determine_entry_partition_plan(
    total_entry_count: u64,
    rank: usize,
    world_size: usize,
) -> Result<(u64, u64)> {
    if world_size == 0 {
        return Err(ShardMemError::InvalidInput(
            "world size must be at least 1".into(),
        ));
    }
    if rank >= world_size {
        return Err(ShardMemError::InvalidInput(format!(
            "rank {} out of range for world size {}",
            rank, world_size
        )));
    }

    let share = split(total_entry_count, world_size, rank);
    Ok((share.start, share.end - share.start))
}

fn split(units: u64, world_size: usize, rank: usize) -> Range<u64> {
    let world = world_size as u64;
    let rank = rank as u64;
    let base = units / world;
    let extra = units % world;

    let start = rank * base + rank.min(extra);
    let count = base + u64::from(rank < extra);
    start..start + count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorCode;
    use proptest::prelude::*;

    #[test]
    fn test_even_split() {
        let plan = determine_partition_plan(1024, 256, 4).unwrap();
        assert_eq!(plan.sizes(), vec![256, 256, 256, 256]);
        assert_eq!(
            plan.entries().iter().map(|e| e.offset).collect::<Vec<_>>(),
            vec![0, 256, 512, 768]
        );
        assert!(plan.is_uniform());
    }

    #[test]
    fn test_remainder_goes_to_lowest_ranks() {
        let plan = determine_partition_plan(1000, 100, 3).unwrap();
        assert_eq!(plan.sizes(), vec![400, 300, 300]);
        assert_eq!(plan.sizes().iter().sum::<u64>(), 1000);
        assert!(!plan.is_uniform());
    }

    #[test]
    fn test_more_ranks_than_units() {
        let plan = determine_partition_plan(200, 100, 4).unwrap();
        assert_eq!(plan.sizes(), vec![100, 100, 0, 0]);
        assert_eq!(plan.entry(3).unwrap().offset, 200);
    }

    #[test]
    fn test_invalid_inputs() {
        let err = determine_partition_plan(1000, 300, 2).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidInput);

        assert!(determine_partition_plan(1000, 0, 2).is_err());
        assert!(determine_partition_plan(1000, 100, 0).is_err());
        assert!(determine_entry_partition_plan(10, 3, 3).is_err());
    }

    #[test]
    fn test_entry_plan() {
        assert_eq!(determine_entry_partition_plan(10, 0, 3).unwrap(), (0, 4));
        assert_eq!(determine_entry_partition_plan(10, 1, 3).unwrap(), (4, 3));
        assert_eq!(determine_entry_partition_plan(10, 2, 3).unwrap(), (7, 3));
    }

    #[test]
    fn test_locate() {
        let plan = determine_partition_plan(1000, 100, 3).unwrap();
        assert_eq!(plan.locate(0).unwrap(), (0, 0));
        assert_eq!(plan.locate(399).unwrap(), (0, 399));
        assert_eq!(plan.locate(400).unwrap(), (1, 0));
        assert_eq!(plan.locate(999).unwrap(), (2, 299));
        assert!(plan.locate(1000).is_err());

        let uniform = determine_partition_plan(1024, 256, 4).unwrap();
        assert_eq!(uniform.locate(513).unwrap(), (2, 1));
    }

    #[test]
    fn test_locate_with_huge_granularity() {
        let plan = determine_partition_plan(1 << 62, 1 << 62, 8).unwrap();
        assert!(!plan.is_uniform());
        assert_eq!(plan.locate(0).unwrap(), (0, 0));
        assert_eq!(plan.locate((1 << 62) - 1).unwrap(), (0, (1 << 62) - 1));

        let plan = determine_partition_plan(1 << 63, 1 << 61, 4).unwrap();
        assert!(plan.is_uniform());
        assert_eq!(plan.locate(3 << 61).unwrap(), (3, 0));
    }

    #[test]
    fn test_locate_skips_empty_ranks() {
        let plan = determine_partition_plan(300, 100, 5).unwrap();
        assert_eq!(plan.sizes(), vec![100, 100, 100, 0, 0]);
        assert_eq!(plan.locate(299).unwrap(), (2, 99));
    }

    proptest! {
        #[test]
        fn prop_plan_sums_and_balances(
            units in 0u64..10_000,
            granularity in 1u64..4096,
            world_size in 1usize..64,
        ) {
            let total = units * granularity;
            let plan = determine_partition_plan(total, granularity, world_size).unwrap();
            let sizes = plan.sizes();

            prop_assert_eq!(sizes.iter().sum::<u64>(), total);
            let max = *sizes.iter().max().unwrap();
            let min = *sizes.iter().min().unwrap();
            prop_assert!(max - min <= granularity);
            prop_assert!(sizes.iter().all(|s| s % granularity == 0));

            let mut expected_offset = 0;
            for entry in plan.entries() {
                prop_assert_eq!(entry.offset, expected_offset);
                expected_offset = entry.end();
            }
        }

        #[test]
        fn prop_entry_plan_tiles(total in 0u64..100_000, world_size in 1usize..64) {
            let mut next = 0;
            for rank in 0..world_size {
                let (start, count) = determine_entry_partition_plan(total, rank, world_size).unwrap();
                prop_assert_eq!(start, next);
                next = start + count;
            }
            prop_assert_eq!(next, total);
        }

        #[test]
        fn prop_locate_matches_entries(
            units in 1u64..2_000,
            granularity in 1u64..64,
            world_size in 1usize..16,
            pick in any::<u64>(),
        ) {
            let total = units * granularity;
            let plan = determine_partition_plan(total, granularity, world_size).unwrap();
            let offset = pick % total;
            let (rank, local) = plan.locate(offset).unwrap();
            let entry = plan.entry(rank).unwrap();

            prop_assert!(entry.contains(offset));
            prop_assert_eq!(entry.offset + local, offset);
        }
    }
}
