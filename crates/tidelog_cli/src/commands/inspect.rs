//! Inspect command implementation.

use crate::error::{CliError, CliResult};
use serde::Serialize;
use std::fs;
use std::path::Path;
use tidelog_core::dir::{list_segments_in, read_manifest_in};
use tidelog_core::segment::{ChunkHeader, SegmentHeader, CHUNK_HEADER_SIZE, HEADER_SIZE};

/// Log inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Log directory.
    pub path: String,
    /// Segment files in id order.
    pub segments: Vec<SegmentInfo>,
    /// Bytes in all segment files.
    pub total_on_disk: u64,
    /// Logical bytes in all segment files.
    pub total_content: u64,
    /// Highest segment id recorded in the manifest.
    pub manifest_last_segment: Option<u64>,
    /// Discard watermarks by table.
    pub watermarks: Vec<WatermarkInfo>,
}

/// Summary of one segment file, read without decoding any chunk.
#[derive(Debug, Serialize)]
pub struct SegmentInfo {
    /// File name.
    pub name: String,
    /// Segment id from the header.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    /// Chunk compression.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression: Option<String>,
    /// Whether chunks are encrypted.
    pub encrypted: bool,
    /// File size.
    pub file_size: u64,
    /// Logical size, header included.
    pub content_size: u64,
    /// Intact chunks.
    pub chunks: usize,
    /// `file_size / content_size`.
    pub compression_ratio: f64,
    /// Whether the segment ends with an end marker.
    pub clean_end: bool,
    /// Bytes after the last intact chunk.
    pub tail_bytes: u64,
    /// Why the header could not be read.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header_error: Option<String>,
}

/// Discard watermark of one table.
#[derive(Debug, Serialize)]
pub struct WatermarkInfo {
    /// Table id.
    pub table: u32,
    /// Lowest discarded position.
    pub lower: String,
    /// Highest discarded position.
    pub upper: String,
}

/// Runs the inspect command.
pub fn run(path: &Path, format: &str) -> CliResult<()> {
    let result = inspect(path)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

/// Reads the segment files and manifest in `path`.
pub fn inspect(path: &Path) -> CliResult<InspectResult> {
    if !path.is_dir() {
        return Err(CliError::Usage(format!("No commit log found at {}", path.display())));
    }

    let mut segments = Vec::new();
    for file in list_segments_in(path)? {
        let bytes = fs::read(&file.path)?;
        let name = file
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        segments.push(summarize_segment(name, &bytes));
    }

    let manifest = read_manifest_in(path)?;
    let watermarks = manifest
        .as_ref()
        .map(|m| {
            m.watermarks()
                .map(|(table, w)| WatermarkInfo {
                    table: table.as_u32(),
                    lower: w.lower.to_string(),
                    upper: w.upper.to_string(),
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(InspectResult {
        path: path.display().to_string(),
        total_on_disk: segments.iter().map(|s| s.file_size).sum(),
        total_content: segments.iter().map(|s| s.content_size).sum(),
        segments,
        manifest_last_segment: manifest.map(|m| m.last_segment_id().as_u64()),
        watermarks,
    })
}

/// Walks the chunk headers of one segment file.
pub fn summarize_segment(name: String, bytes: &[u8]) -> SegmentInfo {
    let mut info = SegmentInfo {
        name,
        id: None,
        compression: None,
        encrypted: false,
        file_size: bytes.len() as u64,
        content_size: 0,
        chunks: 0,
        compression_ratio: 0.0,
        clean_end: false,
        tail_bytes: 0,
        header_error: None,
    };

    let header = match SegmentHeader::decode(bytes) {
        Ok(header) => header,
        Err(e) => {
            info.header_error = Some(e.to_string());
            return info;
        }
    };
    info.id = Some(header.segment_id.as_u64());
    info.compression = Some(header.compression.name().to_string());
    info.encrypted = header.is_encrypted();
    info.content_size = HEADER_SIZE as u64;

    let mut cursor = HEADER_SIZE;
    while cursor < bytes.len() {
        let rest = &bytes[cursor..];
        let Some(chunk) = ChunkHeader::decode(rest) else {
            break;
        };
        if chunk.is_end_marker() {
            info.clean_end = true;
            cursor += CHUNK_HEADER_SIZE;
            break;
        }
        let end = CHUNK_HEADER_SIZE + chunk.stored_len as usize;
        match rest.get(CHUNK_HEADER_SIZE..end) {
            Some(stored) if chunk.verify(stored) => {
                info.chunks += 1;
                info.content_size += u64::from(chunk.content_len);
                cursor += end;
            }
            _ => break,
        }
    }
    info.tail_bytes = (bytes.len() - cursor) as u64;
    info.compression_ratio = info.file_size as f64 / info.content_size as f64;
    info
}

fn print_text_output(result: &InspectResult) {
    println!("tidelog Commit Log Inspection");
    println!("=============================");
    println!();
    println!("Path: {}", result.path);
    println!();
    println!("Segments: {}", result.segments.len());
    for segment in &result.segments {
        match &segment.header_error {
            Some(error) => println!("  {}  unreadable header: {}", segment.name, error),
            None => println!(
                "  {}  {} on disk, {} logical, ratio {:.3}, {} chunks, {}{}{}",
                segment.name,
                format_size(segment.file_size),
                format_size(segment.content_size),
                segment.compression_ratio,
                segment.chunks,
                segment.compression.as_deref().unwrap_or("none"),
                if segment.encrypted { ", encrypted" } else { "" },
                if segment.clean_end {
                    String::new()
                } else {
                    format!(", open ({} tail bytes)", segment.tail_bytes)
                },
            ),
        }
    }
    println!();
    println!("Storage:");
    println!("  On disk:  {}", format_size(result.total_on_disk));
    println!("  Logical:  {}", format_size(result.total_content));

    println!();
    match result.manifest_last_segment {
        Some(last) => println!("Discards (last segment id {}):", last),
        None => println!("Discards: none recorded"),
    }
    for watermark in &result.watermarks {
        println!(
            "  table:{}  {} .. {}",
            watermark.table, watermark.lower, watermark.upper
        );
    }
}

fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
