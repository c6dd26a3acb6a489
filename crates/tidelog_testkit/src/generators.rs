//! Property-based test generators using proptest.
//!
//! Provides strategies for generating mutations, positions and log
//! configurations.

use proptest::prelude::*;
use std::time::Duration;
use tidelog_core::{CommitLogPosition, Compression, Mutation, SegmentId, SyncMode, TableId};

/// Strategy for generating table ids from a small set, so tables share segments.
pub fn table_id_strategy() -> impl Strategy<Value = TableId> {
    (1u32..=8).prop_map(TableId::new)
}

/// Strategy for generating mutation keys.
pub fn key_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..64)
}

/// Strategy for generating mutation values (arbitrary bytes).
pub fn value_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..2048)
}

/// Strategy for generating mutations.
pub fn mutation_strategy() -> impl Strategy<Value = Mutation> {
    (table_id_strategy(), key_strategy(), value_strategy())
        .prop_map(|(table, key, value)| Mutation::new(table, key, value))
}

/// Strategy for generating positions.
pub fn position_strategy() -> impl Strategy<Value = CommitLogPosition> {
    (1u64..1_000, any::<u32>())
        .prop_map(|(segment, offset)| CommitLogPosition::new(SegmentId::new(segment), offset))
}

/// Strategy for choosing a compression algorithm.
pub fn compression_strategy() -> impl Strategy<Value = Compression> {
    prop::sample::select(Compression::ALL.to_vec())
}

/// Strategy for choosing a sync mode with test-friendly timings.
pub fn sync_mode_strategy() -> impl Strategy<Value = SyncMode> {
    prop_oneof![
        (5u64..50).prop_map(|ms| SyncMode::Periodic {
            period: Duration::from_millis(ms)
        }),
        (0u64..3).prop_map(|ms| SyncMode::Batch {
            window: Duration::from_millis(ms)
        }),
        (1u64..5).prop_map(|ms| SyncMode::Group {
            window: Duration::from_millis(ms)
        }),
    ]
}
