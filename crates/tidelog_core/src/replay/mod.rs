//! Reading segment files back.
//!
//! [`CommitLogReader`] scans segments in id order, validates every chunk
//! and frame, filters mutations against discard watermarks and hands the
//! survivors to a [`CommitLogReadHandler`].
//!
//! Damage is contained per segment:
//!
//! - A truncated or checksum-failing chunk ends the segment. This is the
//!   expected state of the last segment after a crash, so it is counted as
//!   tail loss and reading continues with the next segment.
//! - Anything else (unreadable header, wrong key, a chunk that passed its
//!   checksum but does not decode) is reported to the handler, which
//!   decides whether to skip the segment or abort.

mod filter;
mod handler;
mod reader;

pub use filter::{ReplayDecision, ReplayFilter};
pub use handler::{CommitLogReadHandler, ReadError, ReadErrorKind};
pub use reader::{CommitLogReader, ReplayStats};
