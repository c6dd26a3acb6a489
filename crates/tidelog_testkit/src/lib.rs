//! # tidelog testkit
//!
//! Test utilities for tidelog.
//!
//! This crate provides:
//! - Temporary-directory log fixtures and a collecting replay handler
//! - Property-based test generators using proptest
//! - A multi-writer stress harness with hash and count verification
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tidelog_testkit::prelude::*;
//!
//! #[test]
//! fn survives_restart() {
//!     let log = TestLog::open(SyncMode::batch());
//!     log.add(&Mutation::new(TableId::new(1), "k", "v")).unwrap();
//!     let (handler, _) = log.close().replay().unwrap();
//!     assert_eq!(handler.mutations.len(), 1);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::stress::*;
    pub use tidelog_core::{Mutation, SyncMode, TableId};
}

pub use fixtures::*;
pub use generators::*;
pub use stress::*;
