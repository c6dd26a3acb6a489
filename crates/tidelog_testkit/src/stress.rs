//! Stress harness for the commit log.
//!
//! Runs concurrent writers against a log, shuts it down, replays the
//! directory and checks that the replayed mutations hash and count the same
//! as what was written. Optionally performs a *discarded run*: the first
//! half of the writes is discarded for every table before the second half
//! is written, and must not come back on replay.

use crate::fixtures::replay_dir;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::ops::Range;
use std::thread;
use std::time::{Duration, Instant};
use tidelog_core::dir::list_segments_in;
use tidelog_core::{CommitLog, CommitLogPosition, Config, CoreResult, Mutation, TableId};

/// How large each mutation value is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PayloadSize {
    /// Every value has this many bytes.
    Fixed(usize),
    /// Values are uniformly sized in `min..=max`.
    Random {
        /// Smallest value.
        min: usize,
        /// Largest value.
        max: usize,
    },
}

/// Configuration for a stress run.
#[derive(Debug, Clone, Serialize)]
pub struct StressConfig {
    /// Number of concurrent writer threads.
    pub writers: usize,
    /// Mutations each writer adds.
    pub mutations_per_writer: usize,
    /// Value size.
    pub payload: PayloadSize,
    /// Number of tables the writers spread mutations over.
    pub tables: u32,
    /// Discard the first half of the writes before writing the second half.
    pub discarded_run: bool,
    /// Seed for payload generation.
    pub seed: u64,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            writers: 4,
            mutations_per_writer: 250,
            payload: PayloadSize::Fixed(1024),
            tables: 1,
            discarded_run: false,
            seed: 0,
        }
    }
}

/// Result of a stress run.
#[derive(Debug, Clone, Serialize)]
pub struct StressReport {
    /// Mutations expected back from replay.
    pub written_count: u64,
    /// Order-independent hash of those mutations.
    pub written_hash: u64,
    /// Mutations written and then discarded.
    pub discarded_writes: u64,
    /// Mutations handed to the replay handler.
    pub replayed_count: u64,
    /// Order-independent hash of the replayed mutations.
    pub replayed_hash: u64,
    /// Mutations replay dropped as discarded.
    pub replay_discarded: u64,
    /// Mutations replay dropped as skipped.
    pub replay_skipped: u64,
    /// Segments with a damaged tail.
    pub corrupt_tails: u64,
    /// Segment files left after shutdown.
    pub segments: usize,
    /// Whether file sizes matched the reported on-disk size before shutdown.
    pub sizes_consistent: bool,
    /// Time spent writing.
    pub write_millis: u64,
    /// Mutations per second while writing.
    pub ops_per_second: f64,
}

impl StressReport {
    /// Returns true if replay returned exactly what was expected.
    pub fn is_consistent(&self) -> bool {
        self.written_count == self.replayed_count
            && self.written_hash == self.replayed_hash
            && self.corrupt_tails == 0
            && self.sizes_consistent
    }

    /// Prints a summary of the run.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Written: {} (hash {:016x})", self.written_count, self.written_hash);
        println!("Replayed: {} (hash {:016x})", self.replayed_count, self.replayed_hash);
        println!(
            "Discarded: {} written, {} discarded + {} skipped on replay",
            self.discarded_writes, self.replay_discarded, self.replay_skipped
        );
        println!("Segments left: {}", self.segments);
        println!("Sizes consistent: {}", self.sizes_consistent);
        println!("Write time: {} ms", self.write_millis);
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
        println!("Consistent: {}", self.is_consistent());
    }
}

/// Order-independent hash of one mutation.
pub fn mutation_hash(mutation: &Mutation) -> u64 {
    let mut hasher = DefaultHasher::new();
    mutation.hash(&mut hasher);
    hasher.finish()
}

#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    count: u64,
    hash: u64,
    max_position: CommitLogPosition,
}

impl Tally {
    fn add(&mut self, mutation: &Mutation, position: CommitLogPosition) {
        self.count += 1;
        self.hash = self.hash.wrapping_add(mutation_hash(mutation));
        self.max_position = self.max_position.max(position);
    }

    fn merge(mut self, other: Self) -> Self {
        self.count += other.count;
        self.hash = self.hash.wrapping_add(other.hash);
        self.max_position = self.max_position.max(other.max_position);
        self
    }
}

/// Runs a stress test against a fresh log opened with `log_config`.
///
/// The directory should be empty; segments left by an earlier run would
/// be replayed too.
///
/// # Errors
///
/// Returns the first error a writer, the shutdown, or the replay hit.
pub fn run_stress(log_config: &Config, stress: &StressConfig) -> CoreResult<StressReport> {
    let log = CommitLog::open(log_config.clone())?;
    let started = Instant::now();

    let half = stress.mutations_per_writer / 2;
    let (discarded, expected) = if stress.discarded_run {
        let first = write_phase(&log, stress, 0..half)?;
        for table in 1..=stress.tables {
            log.discard_completed_segments(
                TableId::new(table),
                CommitLogPosition::NONE,
                first.max_position,
            )?;
        }
        let second = write_phase(&log, stress, half..stress.mutations_per_writer)?;
        (first, second)
    } else {
        let all = write_phase(&log, stress, 0..stress.mutations_per_writer)?;
        (Tally::default(), all)
    };
    let elapsed = started.elapsed();

    log.request_extra_sync().wait()?;
    log.await_management_tasks_completion();
    let sizes_consistent = sizes_match(&log)?;
    log.shutdown(true);
    drop(log);

    let (handler, replay) = replay_dir(&log_config.directory, log_config.encryption.clone())?;
    let replayed_hash = handler
        .mutations
        .iter()
        .fold(0u64, |hash, m| hash.wrapping_add(mutation_hash(&m.mutation)));

    let total = expected.count + discarded.count;
    Ok(StressReport {
        written_count: expected.count,
        written_hash: expected.hash,
        discarded_writes: discarded.count,
        replayed_count: replay.replayed,
        replayed_hash,
        replay_discarded: replay.discarded,
        replay_skipped: replay.skipped,
        corrupt_tails: replay.corrupt_tails,
        segments: list_segments_in(&log_config.directory)?.len(),
        sizes_consistent,
        write_millis: elapsed.as_millis() as u64,
        ops_per_second: ops_per_second(total, elapsed),
    })
}

/// Checks that the live segment files on disk add up to the log's reported
/// on-disk size, and that no other segment files exist.
///
/// Only meaningful while no writes or syncs are in flight.
pub fn sizes_match(log: &CommitLog) -> CoreResult<bool> {
    let names = log.active_segment_names();
    let mut on_disk = 0;
    for name in &names {
        on_disk += fs::metadata(log.path().join(name))?.len();
    }

    let mut files: Vec<String> = list_segments_in(log.path())?
        .into_iter()
        .filter_map(|f| f.path.file_name().map(|n| n.to_string_lossy().into_owned()))
        .collect();
    files.sort();
    let mut active = names;
    active.sort();

    Ok(on_disk == log.active_on_disk_size() && files == active)
}

fn write_phase(log: &CommitLog, stress: &StressConfig, range: Range<usize>) -> CoreResult<Tally> {
    thread::scope(|scope| {
        let handles: Vec<_> = (0..stress.writers)
            .map(|writer| {
                let range = range.clone();
                scope.spawn(move || write_range(log, stress, writer, range))
            })
            .collect();

        let mut total = Tally::default();
        for handle in handles {
            let tally = handle
                .join()
                .unwrap_or_else(|panic| std::panic::resume_unwind(panic))?;
            total = total.merge(tally);
        }
        Ok(total)
    })
}

fn write_range(
    log: &CommitLog,
    stress: &StressConfig,
    writer: usize,
    range: Range<usize>,
) -> CoreResult<Tally> {
    let mut rng = StdRng::seed_from_u64(stress.seed ^ ((writer as u64) << 32) ^ range.start as u64);
    let mut tally = Tally::default();
    let tables = stress.tables.max(1);

    for i in range {
        let len = match stress.payload {
            PayloadSize::Fixed(len) => len,
            PayloadSize::Random { min, max } => rng.gen_range(min..=max.max(min)),
        };
        let mut value = vec![0u8; len];
        rng.fill_bytes(&mut value);

        let table = TableId::new(1 + (i as u32 % tables));
        let mutation = Mutation::new(table, format!("w{writer}-{i}"), value);
        let position = log.add(&mutation)?;
        tally.add(&mutation, position);
    }
    Ok(tally)
}

fn ops_per_second(ops: u64, elapsed: Duration) -> f64 {
    if elapsed.as_secs_f64() > 0.0 {
        ops as f64 / elapsed.as_secs_f64()
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::test_config;
    use tempfile::TempDir;
    use tidelog_core::{Compression, SyncMode};

    #[test]
    fn batch_fixed_payloads() {
        let temp = TempDir::new().unwrap();
        let config = test_config(temp.path())
            .segment_size(32 * 1024 * 1024)
            .sync_mode(SyncMode::batch());
        let report = run_stress(&config, &StressConfig::default()).unwrap();

        assert_eq!(report.written_count, 1000);
        assert_eq!(report.replayed_count, 1000);
        assert_eq!(report.replayed_hash, report.written_hash);
        assert!(report.is_consistent());
    }

    #[test]
    fn periodic_random_payloads_many_segments() {
        let temp = TempDir::new().unwrap();
        let config = test_config(temp.path())
            .segment_size(16 * 1024)
            .compression(Compression::Snappy)
            .sync_mode(SyncMode::Periodic {
                period: Duration::from_millis(5),
            });
        let stress = StressConfig {
            writers: 3,
            mutations_per_writer: 200,
            payload: PayloadSize::Random { min: 0, max: 600 },
            tables: 3,
            seed: 42,
            ..StressConfig::default()
        };
        let report = run_stress(&config, &stress).unwrap();

        assert!(report.segments > 1);
        assert!(report.is_consistent(), "{report:?}");
    }

    #[test]
    fn discarded_run_replays_second_half_only() {
        let temp = TempDir::new().unwrap();
        let config = test_config(temp.path())
            .segment_size(8 * 1024)
            .sync_mode(SyncMode::group());
        let stress = StressConfig {
            writers: 2,
            mutations_per_writer: 100,
            payload: PayloadSize::Fixed(128),
            tables: 2,
            discarded_run: true,
            ..StressConfig::default()
        };
        let report = run_stress(&config, &stress).unwrap();

        assert_eq!(report.discarded_writes, 100);
        assert_eq!(report.written_count, 100);
        assert!(report.is_consistent(), "{report:?}");
        // most of the first half was in segments that have been reclaimed
        assert!(report.replay_discarded + report.replay_skipped < 100);
    }

    #[test]
    fn report_serializes() {
        let report = StressReport {
            written_count: 1,
            written_hash: 2,
            discarded_writes: 0,
            replayed_count: 1,
            replayed_hash: 2,
            replay_discarded: 0,
            replay_skipped: 0,
            corrupt_tails: 0,
            segments: 1,
            sizes_consistent: true,
            write_millis: 3,
            ops_per_second: 0.5,
        };
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"replayed_hash\":2"));
    }
}
