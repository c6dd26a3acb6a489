//! Dump command implementation.

use super::{hex_encode, load_key};
use crate::error::{CliError, CliResult};
use serde::Serialize;
use std::path::Path;
use tidelog_core::dir::{list_segments_in, read_manifest_in};
use tidelog_core::{
    CommitLogReadHandler, CommitLogReader, CoreError, CoreResult, Mutation, ReadError,
    ReplayFilter, SegmentDescriptor, SegmentId,
};

/// What to dump.
#[derive(Debug, Clone, Default)]
pub struct DumpOptions {
    /// Stop after this many mutations.
    pub limit: Option<usize>,
    /// Only this segment id.
    pub segment: Option<u64>,
    /// Ignore discard watermarks.
    pub include_discarded: bool,
    /// Print JSON instead of text.
    pub json: bool,
}

/// Mutation representation for output.
#[derive(Debug, Serialize)]
pub struct MutationInfo {
    /// Segment id.
    pub segment_id: u64,
    /// Logical offset just past the frame.
    pub offset: u32,
    /// Table id.
    pub table_id: u32,
    /// Key, hex-encoded.
    pub key: String,
    /// Value size in bytes.
    pub value_size: usize,
    /// Serialized payload size in bytes.
    pub payload_size: usize,
}

/// Collects mutations until the limit is hit.
struct DumpHandler {
    records: Vec<MutationInfo>,
    limit: usize,
    errors: Vec<ReadError>,
}

impl CommitLogReadHandler for DumpHandler {
    fn should_skip_segment_on_error(&mut self, error: &ReadError) -> bool {
        self.errors.push(error.clone());
        true
    }

    fn handle_mutation(
        &mut self,
        mutation: Mutation,
        size: usize,
        entry_location: u32,
        descriptor: &SegmentDescriptor,
    ) -> CoreResult<()> {
        if self.records.len() >= self.limit {
            return Err(CoreError::replay("dump limit reached"));
        }
        self.records.push(MutationInfo {
            segment_id: descriptor.id.as_u64(),
            offset: entry_location,
            table_id: mutation.table_id().as_u32(),
            key: hex_encode(mutation.key()),
            value_size: mutation.value().len(),
            payload_size: size,
        });
        Ok(())
    }
}

/// Reads the mutations selected by `options`.
pub fn read_mutations(
    path: &Path,
    key_file: Option<&Path>,
    options: &DumpOptions,
) -> CliResult<(Vec<MutationInfo>, Vec<ReadError>)> {
    let mut reader = CommitLogReader::new();
    if !options.include_discarded {
        if let Some(manifest) = read_manifest_in(path)? {
            reader = reader.with_filter(ReplayFilter::from_manifest(&manifest));
        }
    }
    if let Some(key) = load_key(key_file)? {
        reader = reader.with_key(key);
    }

    let mut files = list_segments_in(path)?;
    if let Some(segment) = options.segment {
        files.retain(|f| f.id == SegmentId::new(segment));
        if files.is_empty() {
            return Err(CliError::Usage(format!("no segment {} in {}", segment, path.display())));
        }
    }

    let mut handler = DumpHandler {
        records: Vec::new(),
        limit: options.limit.unwrap_or(usize::MAX),
        errors: Vec::new(),
    };
    match reader.read_files(&files, &mut handler) {
        Ok(()) | Err(CoreError::Replay { .. }) => {}
        Err(e) => return Err(e.into()),
    }
    Ok((handler.records, handler.errors))
}

/// Runs the dump command.
pub fn run(path: &Path, key_file: Option<&Path>, options: &DumpOptions) -> CliResult<()> {
    let (records, errors) = read_mutations(path, key_file, options)?;

    if options.json {
        println!("{}", serde_json::to_string_pretty(&records)?);
    } else {
        print_text_output(&records);
    }
    for error in &errors {
        eprintln!("skipped damaged segment: {}", error);
    }

    Ok(())
}

fn print_text_output(records: &[MutationInfo]) {
    println!(
        "{:>16}  {:>10}  {:>8}  {:>8}  KEY",
        "SEGMENT", "OFFSET", "TABLE", "VALUE"
    );
    for record in records {
        println!(
            "{:>16}  {:>10}  {:>8}  {:>8}  {}",
            record.segment_id, record.offset, record.table_id, record.value_size, record.key
        );
    }
    println!();
    println!("{} mutations", records.len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tidelog_core::{CommitLog, CommitLogPosition, Config, SyncMode, TableId};

    #[test]
    fn dump_respects_limit_and_watermarks() {
        let temp = tempdir().unwrap();
        {
            let log = CommitLog::open(Config::new().directory(temp.path()).sync_mode(SyncMode::batch()))
                .unwrap();
            let mut upper = CommitLogPosition::NONE;
            for i in 0..10u8 {
                let position = log.add(&Mutation::new(TableId::new(5), vec![i], vec![i; 3])).unwrap();
                if i == 3 {
                    upper = position;
                }
            }
            log.discard_completed_segments(TableId::new(5), CommitLogPosition::NONE, upper)
                .unwrap();
        }

        let (records, errors) = read_mutations(temp.path(), None, &DumpOptions::default()).unwrap();
        assert!(errors.is_empty());
        assert_eq!(records.len(), 6);
        assert_eq!(records[0].key, "04");

        let all = DumpOptions {
            include_discarded: true,
            limit: Some(7),
            ..DumpOptions::default()
        };
        let (records, _) = read_mutations(temp.path(), None, &all).unwrap();
        assert_eq!(records.len(), 7);
        assert_eq!(records[0].key, "00");
        assert_eq!(records[0].table_id, 5);
    }

    #[test]
    fn unknown_segment_is_a_usage_error() {
        let temp = tempdir().unwrap();
        let options = DumpOptions {
            segment: Some(1),
            ..DumpOptions::default()
        };
        assert!(matches!(
            read_mutations(temp.path(), None, &options),
            Err(CliError::Usage(_))
        ));
    }
}
