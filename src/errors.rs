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

//! Crate-wide error type.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors from any Cumulus operation.
///
/// Most of these abort the snapshot; per-file problems are handled with a
/// warning at the point they occur and never surface here.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum Error {
    #[error("Error opening local database {path:?}: {source}")]
    LocalDbOpen {
        path: PathBuf,
        source: rusqlite::Error,
    },

    #[error(
        "Local database does not have required schema version \
         (expected {expected_major}.{expected_minor}, found {found_major}.{found_minor})"
    )]
    SchemaVersionMismatch {
        expected_major: i64,
        expected_minor: i64,
        found_major: i64,
        found_minor: i64,
    },

    #[error("Local database error: {source}")]
    LocalDb {
        #[from]
        source: rusqlite::Error,
    },

    #[error("Object reference {reference:?} has no stored checksum or exact length")]
    IncompleteReference { reference: String },

    #[error("Error launching filter process {program:?}: {source}")]
    FilterSpawn { program: String, source: io::Error },

    #[error("Filter process {program:?} exited with status {status}")]
    FilterExited { program: String, status: i32 },

    #[error("Error writing segment data: {source}")]
    SegmentWrite { source: io::Error },

    #[error("Error creating staging file {path:?}: {source}")]
    StagingFile { path: PathBuf, source: io::Error },

    #[error("Error launching upload script {script:?}: {source}")]
    UploadSpawn { script: String, source: io::Error },

    #[error("Upload script failure: {message}")]
    UploadScript { message: String },

    #[error("Error writing statcache {path:?}: {source}")]
    Statcache { path: PathBuf, source: io::Error },

    #[error("Error creating temporary directory {path:?}: {source}")]
    TempDir { path: PathBuf, source: io::Error },

    #[error("I/O error on {path:?}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("{message}")]
    Config { message: String },
}
