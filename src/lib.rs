// Cumulus backup system.
// Copyright 2006-2012 The Cumulus Developers.

// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

//! Cumulus: incremental, deduplicated filesystem snapshots for storage on
//! a dumb remote server.
//!
//! A snapshot is a collection of objects packed into TAR-format segments,
//! plus a textual metadata log describing every inode, a descriptor naming
//! the root of the log and the segments it reaches, and a local SQLite
//! database that lets later snapshots reuse unchanged data.

pub mod backup;
pub mod chunker;
pub mod errors;
pub mod filter;
pub mod format;
pub mod hashes;
pub mod localdb;
pub mod metadata;
pub mod reference;
pub mod remote;
pub mod rules;
pub mod snapshot;
pub mod store;
pub mod subfile;
pub mod tarfile;

pub use crate::backup::Backup;
pub use crate::errors::Error;
pub use crate::hashes::Hash;
pub use crate::localdb::LocalDb;
pub use crate::metadata::MetadataWriter;
pub use crate::reference::ObjectReference;
pub use crate::remote::RemoteStore;
pub use crate::rules::{PathFilterList, RuleType};
pub use crate::snapshot::{run_snapshot, SnapshotOptions};
pub use crate::store::SegmentStore;

pub type Result<T> = std::result::Result<T, Error>;

/// Version of the snapshot format written by this crate.
pub const FORMAT_VERSION: &str = "Cumulus Snapshot v0.11";

/// Target size for segments; a segment is closed once its estimated size
/// reaches this.
pub const SEGMENT_TARGET_SIZE: u64 = 4 * 1024 * 1024;

/// Files are read and deduplicated in blocks of this size.
pub const BLOCK_SIZE: usize = 1024 * 1024;

const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn version() -> &'static str {
    VERSION
}
