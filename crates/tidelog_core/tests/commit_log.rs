//! End-to-end tests: write through a `CommitLog`, shut down, replay.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeSet;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::tempdir;
use tidelog_core::dir::{list_segments_in, read_manifest_in};
use tidelog_core::{
    CommitLog, CommitLogPosition, CommitLogReadHandler, CommitLogReader, Compression, Config,
    CoreError, CoreResult, Mutation, ReplayFilter, ReplayStats, SegmentDescriptor, SyncMode,
    TableId,
};

#[derive(Debug, Default, Clone, PartialEq)]
struct Recorded {
    mutations: Vec<(Mutation, CommitLogPosition)>,
}

impl CommitLogReadHandler for Recorded {
    fn handle_mutation(
        &mut self,
        mutation: Mutation,
        _size: usize,
        entry_location: u32,
        descriptor: &SegmentDescriptor,
    ) -> CoreResult<()> {
        let position = CommitLogPosition::new(descriptor.id, entry_location);
        self.mutations.push((mutation, position));
        Ok(())
    }
}

fn replay(config: &Config) -> (Recorded, ReplayStats) {
    let log = CommitLog::open(config.clone()).unwrap();
    let mut handler = Recorded::default();
    let stats = log.recover(&mut handler).unwrap();
    (handler, stats)
}

fn hash_mutation(mutation: &Mutation) -> u64 {
    let mut hasher = DefaultHasher::new();
    mutation.hash(&mut hasher);
    hasher.finish()
}

fn mutation(table: u32, i: usize, len: usize) -> Mutation {
    let value: Vec<u8> = (0..len).map(|j| (i * 31 + j) as u8).collect();
    Mutation::new(TableId::new(table), format!("key-{table}-{i}"), value)
}

fn sync_modes() -> Vec<SyncMode> {
    vec![
        SyncMode::Periodic {
            period: Duration::from_millis(20),
        },
        SyncMode::Batch {
            window: Duration::from_millis(1),
        },
        SyncMode::Group {
            window: Duration::from_millis(3),
        },
    ]
}

fn encryption_options() -> Vec<Option<tidelog_core::EncryptionKey>> {
    #[cfg(feature = "encryption")]
    {
        vec![None, Some(tidelog_core::EncryptionKey::generate())]
    }
    #[cfg(not(feature = "encryption"))]
    {
        vec![None]
    }
}

#[test]
fn round_trip_every_configuration() {
    for mode in sync_modes() {
        for compression in Compression::ALL {
            for key in encryption_options() {
                let temp = tempdir().unwrap();
                let mut config = Config::new()
                    .directory(temp.path())
                    .segment_size(16 * 1024)
                    .sync_mode(mode)
                    .compression(compression)
                    .reserve_segments(1);
                config.encryption = key;

                let written: Vec<Mutation> = (0..60).map(|i| mutation(1 + (i % 3) as u32, i, 300 + i)).collect();
                {
                    let log = CommitLog::open(config.clone()).unwrap();
                    for m in &written {
                        log.add(m).unwrap();
                    }
                    assert!(log.active_segment_names().len() > 1, "expected rollovers");
                    log.shutdown(true);
                }

                let (recorded, stats) = replay(&config);
                let replayed: Vec<Mutation> = recorded.mutations.into_iter().map(|(m, _)| m).collect();
                assert_eq!(
                    replayed, written,
                    "mode {} compression {compression} encrypted {}",
                    mode.name(),
                    config.encryption.is_some()
                );
                assert!(stats.is_complete());
            }
        }
    }
}

#[test]
fn concurrent_writers_hash_and_count_match() {
    let temp = tempdir().unwrap();
    let config = Config::new()
        .directory(temp.path())
        .segment_size(32 * 1024 * 1024)
        .sync_mode(SyncMode::batch());

    let log = Arc::new(CommitLog::open(config.clone()).unwrap());
    let handles: Vec<_> = (0..4)
        .map(|writer| {
            let log = Arc::clone(&log);
            thread::spawn(move || {
                let mut hash = 0u64;
                for i in 0..250 {
                    let m = Mutation::new(
                        TableId::new(1),
                        format!("w{writer}-{i}"),
                        vec![(writer * 7 + i) as u8; 1024],
                    );
                    log.add(&m).unwrap();
                    hash = hash.wrapping_add(hash_mutation(&m));
                }
                hash
            })
        })
        .collect();
    let written_hash = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .fold(0u64, u64::wrapping_add);
    log.shutdown(true);
    drop(log);

    let (recorded, stats) = replay(&config);
    let replayed_hash = recorded
        .mutations
        .iter()
        .map(|(m, _)| hash_mutation(m))
        .fold(0u64, u64::wrapping_add);
    assert_eq!(stats.replayed, 1000);
    assert_eq!(replayed_hash, written_hash);

    let positions: Vec<CommitLogPosition> = recorded.mutations.iter().map(|(_, p)| *p).collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn discarded_run_skips_everything_up_to_the_watermark() {
    let temp = tempdir().unwrap();
    let config = Config::new()
        .directory(temp.path())
        .segment_size(8 * 1024)
        .sync_mode(SyncMode::batch())
        .reserve_segments(1);

    let upper = {
        let log = CommitLog::open(config.clone()).unwrap();
        let mut upper = CommitLogPosition::NONE;
        for i in 0..100 {
            upper = upper.max(log.add(&mutation(1, i, 200)).unwrap());
            log.add(&mutation(2, i, 200)).unwrap();
        }
        log.discard_completed_segments(TableId::new(1), CommitLogPosition::NONE, upper)
            .unwrap();
        for i in 100..150 {
            log.add(&mutation(1, i, 200)).unwrap();
            log.add(&mutation(2, i, 200)).unwrap();
        }
        upper
    };

    let manifest = read_manifest_in(temp.path()).unwrap().unwrap();
    assert_eq!(manifest.watermark(TableId::new(1)).unwrap().upper, upper);

    let (recorded, stats) = replay(&config);
    let table1: Vec<&(Mutation, CommitLogPosition)> = recorded
        .mutations
        .iter()
        .filter(|(m, _)| m.table_id() == TableId::new(1))
        .collect();
    assert_eq!(table1.len(), 50);
    assert!(table1.iter().all(|(_, p)| *p > upper));
    assert_eq!(table1[0].0, mutation(1, 100, 200));

    let table2 = recorded.mutations.len() - table1.len();
    assert_eq!(table2, 150);
    assert_eq!(stats.discarded + stats.skipped, 100);
}

#[test]
fn fully_discarded_segments_are_reclaimed() {
    let temp = tempdir().unwrap();
    let config = Config::new()
        .directory(temp.path())
        .segment_size(4096)
        .sync_mode(SyncMode::batch())
        .reserve_segments(2);
    let log = CommitLog::open(config).unwrap();

    let mut last = CommitLogPosition::NONE;
    for i in 0..100 {
        last = log.add(&mutation(1, i, 150)).unwrap();
    }
    let before = log.active_segment_names().len();
    assert!(before > 3);

    log.discard_completed_segments(TableId::new(1), CommitLogPosition::NONE, last)
        .unwrap();
    log.request_extra_sync().wait().unwrap();
    log.await_management_tasks_completion();

    // only the active segment is left
    assert_eq!(log.active_segment_names().len(), 1);
    assert_eq!(log.stats().segments_reclaimed as usize, before - 1);
    assert_sizes_match(&log);
}

fn assert_sizes_match(log: &CommitLog) {
    let names = log.active_segment_names();
    let on_disk: u64 = names
        .iter()
        .map(|name| fs::metadata(log.path().join(name)).unwrap().len())
        .sum();
    assert_eq!(on_disk, log.active_on_disk_size());

    let files: BTreeSet<String> = list_segments_in(log.path())
        .unwrap()
        .into_iter()
        .map(|f| f.path.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    let active: BTreeSet<String> = names.into_iter().collect();
    assert_eq!(files, active);
}

#[test]
fn sizes_match_disk_when_quiescent() {
    for compression in [Compression::None, Compression::Zstd] {
        let temp = tempdir().unwrap();
        let config = Config::new()
            .directory(temp.path())
            .segment_size(8 * 1024)
            .compression(compression)
            .sync_mode(SyncMode::group());
        let log = CommitLog::open(config).unwrap();

        let mut discard_to = CommitLogPosition::NONE;
        for i in 0..200 {
            let position = log.add(&mutation(1 + (i % 2) as u32, i, 120)).unwrap();
            if i == 120 {
                discard_to = position;
            }
        }
        log.discard_completed_segments(TableId::new(1), CommitLogPosition::NONE, discard_to)
            .unwrap();
        log.discard_completed_segments(TableId::new(2), CommitLogPosition::NONE, discard_to)
            .unwrap();
        log.request_extra_sync().wait().unwrap();
        log.await_management_tasks_completion();

        assert_sizes_match(&log);
        assert!(log.active_content_size() > 0);
        for ratio in log.active_segment_compression_ratios().values() {
            assert!(*ratio > 0.0);
        }
    }
}

#[test]
fn replay_twice_gives_identical_invocations() {
    let temp = tempdir().unwrap();
    let config = Config::new()
        .directory(temp.path())
        .segment_size(4096)
        .compression(Compression::Lz4)
        .sync_mode(SyncMode::batch());
    {
        let log = CommitLog::open(config).unwrap();
        for i in 0..80 {
            log.add(&mutation(3, i, 64)).unwrap();
        }
    }

    let run = |dir: &Path| {
        let mut handler = Recorded::default();
        let filter = ReplayFilter::new();
        CommitLogReader::new()
            .with_filter(filter)
            .read_all_files(dir, &mut handler)
            .unwrap();
        handler
    };
    let first = run(temp.path());
    assert_eq!(first.mutations.len(), 80);
    assert_eq!(first, run(temp.path()));
}

fn boundary_config(dir: &Path) -> Config {
    Config::new()
        .directory(dir)
        .segment_size(4096)
        .sync_mode(SyncMode::batch())
        .reserve_segments(0)
}

/// Payload of a mutation with an empty key whose frame is `frame` bytes.
fn mutation_with_frame(frame: usize) -> Mutation {
    let overhead = 8 + Mutation::new(TableId::new(1), Vec::new(), Vec::new()).serialized_size();
    Mutation::new(TableId::new(1), Vec::new(), vec![0x5A; frame - overhead])
}

#[test]
fn record_filling_segment_exactly_does_not_roll_over() {
    let temp = tempdir().unwrap();
    let log = CommitLog::open(boundary_config(temp.path())).unwrap();

    let first = log.add(&mutation_with_frame(121)).unwrap();
    let remaining = 4096 - first.offset as usize;

    let under = log.add(&mutation_with_frame(remaining - 1)).unwrap();
    assert_eq!(under.segment_id, first.segment_id);
    assert_eq!(under.offset, 4095);

    // one byte left; anything bigger rolls over
    let next = log.add(&mutation_with_frame(21)).unwrap();
    assert!(next.segment_id > first.segment_id);
}

#[test]
fn record_one_byte_over_rolls_over() {
    let temp = tempdir().unwrap();
    let log = CommitLog::open(boundary_config(temp.path())).unwrap();

    let first = log.add(&mutation_with_frame(121)).unwrap();
    let remaining = 4096 - first.offset as usize;

    let exact = log.add(&mutation_with_frame(remaining)).unwrap();
    assert_eq!(exact.segment_id, first.segment_id);
    assert_eq!(exact.offset, 4096);

    let temp = tempdir().unwrap();
    let log = CommitLog::open(boundary_config(temp.path())).unwrap();
    let first = log.add(&mutation_with_frame(121)).unwrap();
    let over = log.add(&mutation_with_frame(remaining + 1)).unwrap();
    assert!(over.segment_id > first.segment_id);
    assert_eq!(over.offset as usize, 32 + remaining + 1);
}

#[test]
fn oversized_record_fails_without_side_effects() {
    let temp = tempdir().unwrap();
    let config = boundary_config(temp.path());
    let log = CommitLog::open(config.clone()).unwrap();
    let segment = log.current_segment_id();

    let too_big = mutation_with_frame(4096 - 32 + 1);
    for _ in 0..3 {
        let err = log.add(&too_big).unwrap_err();
        assert!(matches!(err, CoreError::RecordTooLarge { .. }));
        assert!(!err.is_fatal());
    }
    assert_eq!(log.current_segment_id(), segment);

    let largest = mutation_with_frame(4096 - 32);
    let position = log.add(&largest).unwrap();
    assert_eq!(position.offset, 4096);
    drop(log);

    let (recorded, _) = replay(&config);
    assert_eq!(recorded.mutations.len(), 1);
    assert_eq!(recorded.mutations[0].0, largest);
}

#[test]
fn torn_tail_is_reported_not_fatal() {
    let temp = tempdir().unwrap();
    let config = Config::new()
        .directory(temp.path())
        .sync_mode(SyncMode::batch())
        .reserve_segments(0);
    {
        let log = CommitLog::open(config.clone()).unwrap();
        for i in 0..30 {
            log.add(&mutation(1, i, 100)).unwrap();
        }
    }

    let segment = list_segments_in(temp.path()).unwrap().pop().unwrap();
    let data = fs::read(&segment.path).unwrap();
    // end marker plus the tail of the last chunk
    fs::write(&segment.path, &data[..data.len() - 40]).unwrap();

    let (recorded, stats) = replay(&config);
    assert_eq!(stats.corrupt_tails, 1);
    assert!(!stats.is_complete());
    assert!(stats.replayed < 30);
    for (i, (m, _)) in recorded.mutations.iter().enumerate() {
        assert_eq!(*m, mutation(1, i, 100));
    }
}

#[test]
fn periodic_shutdown_flushes_pending_writes() {
    let temp = tempdir().unwrap();
    let config = Config::new()
        .directory(temp.path())
        .sync_mode(SyncMode::Periodic {
            period: Duration::from_secs(3600),
        });
    {
        let log = CommitLog::open(config.clone()).unwrap();
        for i in 0..10 {
            log.add(&mutation(4, i, 50)).unwrap();
        }
        assert_eq!(log.durable_position(), CommitLogPosition::NONE);
        log.shutdown(true);
    }

    let (recorded, stats) = replay(&config);
    assert_eq!(stats.replayed, 10);
    assert_eq!(recorded.mutations.len(), 10);
}

#[test]
fn extra_sync_makes_periodic_writes_durable() {
    let temp = tempdir().unwrap();
    let config = Config::new()
        .directory(temp.path())
        .sync_mode(SyncMode::Periodic {
            period: Duration::from_secs(3600),
        });
    let log = CommitLog::open(config).unwrap();
    let position = log.add(&mutation(1, 0, 10)).unwrap();
    log.request_extra_sync().await_uninterruptibly().unwrap();
    assert!(log.durable_position() >= position);
}
