//! Stress command implementation.

use crate::error::{CliError, CliResult};
use std::fs;
use std::path::Path;
use tidelog_core::{Compression, Config, SyncMode};
use tidelog_testkit::{run_stress, PayloadSize, StressConfig};
use tracing::info;

/// Stress run parameters from the command line.
#[derive(Debug, Clone)]
pub struct StressOptions {
    /// Concurrent writers.
    pub writers: usize,
    /// Mutations per writer.
    pub mutations: usize,
    /// Value size, or the upper bound with `random_payload`.
    pub payload: usize,
    /// Draw value sizes from `0..=payload`.
    pub random_payload: bool,
    /// Tables to spread mutations over.
    pub tables: u32,
    /// Perform a discarded run.
    pub discarded: bool,
    /// Sync mode name.
    pub sync: String,
    /// Compression name.
    pub compression: String,
    /// Segment size.
    pub segment_size: u32,
    /// Payload seed.
    pub seed: u64,
    /// Print JSON instead of text.
    pub json: bool,
}

/// Parses a sync mode name, using the mode's default timing.
pub fn parse_sync_mode(name: &str) -> CliResult<SyncMode> {
    match name.to_ascii_lowercase().as_str() {
        "periodic" => Ok(SyncMode::periodic()),
        "batch" => Ok(SyncMode::batch()),
        "group" => Ok(SyncMode::group()),
        other => Err(CliError::Usage(format!(
            "unknown sync mode '{}' (expected periodic, batch or group)",
            other
        ))),
    }
}

/// Runs the stress command.
pub fn run(path: &Path, options: &StressOptions) -> CliResult<()> {
    if path.exists() && fs::read_dir(path)?.next().is_some() {
        return Err(CliError::Usage(format!(
            "stress needs an empty directory: {}",
            path.display()
        )));
    }

    let compression = Compression::from_name(&options.compression).ok_or_else(|| {
        CliError::Usage(format!("unknown compression '{}'", options.compression))
    })?;
    let config = Config::new()
        .directory(path)
        .segment_size(options.segment_size)
        .sync_mode(parse_sync_mode(&options.sync)?)
        .compression(compression);

    let stress = StressConfig {
        writers: options.writers,
        mutations_per_writer: options.mutations,
        payload: if options.random_payload {
            PayloadSize::Random {
                min: 0,
                max: options.payload,
            }
        } else {
            PayloadSize::Fixed(options.payload)
        },
        tables: options.tables,
        discarded_run: options.discarded,
        seed: options.seed,
    };

    info!(
        path = %path.display(),
        writers = stress.writers,
        mutations = stress.mutations_per_writer,
        sync_mode = config.sync_mode.name(),
        "starting stress run"
    );
    let report = run_stress(&config, &stress)?;
    if options.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        report.print_summary(&format!(
            "{} writers, {} sync, {}",
            stress.writers,
            config.sync_mode.name(),
            compression
        ));
    }

    if report.is_consistent() {
        Ok(())
    } else {
        Err(CliError::VerificationFailed(format!(
            "wrote {} (hash {:016x}), replayed {} (hash {:016x})",
            report.written_count, report.written_hash, report.replayed_count, report.replayed_hash
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn options() -> StressOptions {
        StressOptions {
            writers: 2,
            mutations: 50,
            payload: 256,
            random_payload: true,
            tables: 2,
            discarded: false,
            sync: "group".into(),
            compression: "zstd".into(),
            segment_size: 64 * 1024,
            seed: 7,
            json: true,
        }
    }

    #[test]
    fn sync_mode_names() {
        assert_eq!(parse_sync_mode("Batch").unwrap(), SyncMode::batch());
        assert!(matches!(parse_sync_mode("never"), Err(CliError::Usage(_))));
    }

    #[test]
    fn stress_into_fresh_directory() {
        let temp = tempdir().unwrap();
        run(&temp.path().join("log"), &options()).unwrap();
    }

    #[test]
    fn refuses_non_empty_directory() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join("something"), b"x").unwrap();
        assert!(matches!(run(temp.path(), &options()), Err(CliError::Usage(_))));
    }
}
