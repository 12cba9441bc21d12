// Cumulus backup system.
// Copyright 2006-2009, 2012 The Cumulus Developers.

// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

//! End-to-end orchestration of one snapshot.
//!
//! Wires the uploader, local database, segment store, metadata writer,
//! and rule engine together, runs the walk, and emits the three summary
//! files: the `sha1sum -c`-compatible checksums list, the database-state
//! metadata dump, and finally the snapshot descriptor. The descriptor is
//! only written after a full uploader sync, so it can never reach the
//! server ahead of the files it names.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use time::OffsetDateTime;
use tracing::warn;

use crate::backup::Backup;
use crate::errors::Error;
use crate::filter::FileFilter;
use crate::format::{format_filename_timestamp, format_localtime};
use crate::hashes::Hash;
use crate::localdb::LocalDb;
use crate::metadata::MetadataWriter;
use crate::reference::generate_uuid;
use crate::remote::RemoteStore;
use crate::rules::{PathFilterList, RuleType};
use crate::store::{SegmentConfig, SegmentStore};
use crate::{Result, FORMAT_VERSION};

/// Everything configurable about one snapshot run.
#[derive(Clone, Debug)]
pub struct SnapshotOptions {
    /// Local destination directory; exactly one of this and
    /// `upload_script` must be set.
    pub dest: Option<PathBuf>,
    /// External transfer program, driven over the PUT/OK protocol.
    pub upload_script: Option<String>,
    /// Directory holding the local database and statcache; defaults to
    /// `dest`.
    pub localdb: Option<PathBuf>,
    /// Where to stage files when uploading via script; defaults to
    /// `$TMPDIR` or `/tmp`.
    pub tmpdir: Option<PathBuf>,
    /// Program segment data is piped through.
    pub filter: Option<String>,
    /// Extension appended after `.tar` to match the filter.
    pub filter_extension: String,
    /// Program the descriptor is piped through (e.g. a signer).
    pub signature_filter: Option<String>,
    /// Optional name distinguishing this backup series.
    pub scheme: String,
    /// Include/exclude/dir-merge rules, in command-line order.
    pub rules: Vec<(RuleType, String)>,
    /// Do not reuse metadata from previous snapshots.
    pub full_metadata: bool,
    /// Re-read all file data even when the statcache says it is unchanged.
    pub rebuild_statcache: bool,
    /// Trace each file to stdout as it is processed.
    pub verbose: bool,
    /// Paths to back up.
    pub paths: Vec<PathBuf>,
}

impl Default for SnapshotOptions {
    fn default() -> SnapshotOptions {
        SnapshotOptions {
            dest: None,
            upload_script: None,
            localdb: None,
            tmpdir: None,
            filter: Some("bzip2 -c".to_owned()),
            filter_extension: ".bz2".to_owned(),
            signature_filter: None,
            scheme: String::new(),
            rules: Vec::new(),
            full_metadata: false,
            rebuild_statcache: false,
            verbose: false,
            paths: Vec::new(),
        }
    }
}

/// Run a complete snapshot and return the name of the descriptor file.
pub fn run_snapshot(options: SnapshotOptions) -> Result<String> {
    // Capture the time first: it names the snapshot, and the local offset
    // must be read before any worker threads exist.
    let start_time = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    let timestamp = format_filename_timestamp(start_time);

    if options.dest.is_some() == options.upload_script.is_some() {
        return Err(Error::Config {
            message: "exactly one of a destination directory and an upload script is required"
                .to_owned(),
        });
    }
    if options.paths.is_empty() {
        return Err(Error::Config {
            message: "no paths to back up".to_owned(),
        });
    }

    // With an upload script, stage files in a freshly named temporary
    // directory; otherwise write directly into the destination.
    let staging_dir;
    let temp_dir = if options.upload_script.is_some() {
        let base = options
            .tmpdir
            .clone()
            .or_else(|| std::env::var_os("TMPDIR").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("/tmp"));
        let dir = base.join(format!("cumulus.{}", generate_uuid()));
        fs::create_dir(&dir).map_err(|source| Error::TempDir {
            path: dir.clone(),
            source,
        })?;
        staging_dir = dir.clone();
        Some(dir)
    } else {
        staging_dir = options.dest.clone().expect("dest checked above");
        fs::create_dir_all(&staging_dir).map_err(|source| Error::TempDir {
            path: staging_dir.clone(),
            source,
        })?;
        None
    };

    let localdb_dir = match options.localdb.clone().or_else(|| options.dest.clone()) {
        Some(dir) => dir,
        None => {
            return Err(Error::Config {
                message: "a local database path is required with an upload script".to_owned(),
            })
        }
    };
    fs::create_dir_all(&localdb_dir).map_err(|source| Error::TempDir {
        path: localdb_dir.clone(),
        source,
    })?;

    let remote = RemoteStore::new(&staging_dir, options.upload_script.clone());
    let db = LocalDb::open(
        &localdb_dir.join("localdb.sqlite"),
        &timestamp,
        &options.scheme,
        1.0,
    )?;
    let store = SegmentStore::new(SegmentConfig {
        filter_program: options.filter.clone(),
        filter_extension: options.filter_extension.clone(),
    });
    let metawriter = MetadataWriter::new(
        &localdb_dir,
        &timestamp,
        &options.scheme,
        options.full_metadata,
    )?;

    let mut rules = PathFilterList::new();
    for (rule_type, pattern) in &options.rules {
        rules.add_pattern(*rule_type, pattern.as_bytes(), b"");
    }

    let mut backup = Backup::new(
        remote,
        db,
        store,
        metawriter,
        rules,
        options.verbose,
        options.rebuild_statcache,
    );
    for path in &options.paths {
        backup.scan_path(path)?;
    }
    let (root, remote, db, store) = backup.finish()?;
    store.dump_stats();

    let snapshot_base = if options.scheme.is_empty() {
        format!("snapshot-{timestamp}")
    } else {
        format!("snapshot-{}-{timestamp}", options.scheme)
    };

    // Segment metadata is read out before the database closes; the
    // descriptor needs it afterwards.
    let used_segments = db.get_used_segments()?;
    let mut segment_metadata: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
    for segment in &used_segments {
        if let Some(dict) = db.get_segment_metadata(segment)? {
            segment_metadata.insert(segment.clone(), dict);
        } else {
            warn!(%segment, "segment has no recorded metadata");
        }
    }

    // Checksums file: one sha1sum-compatible line per segment.
    let checksums_file = remote.alloc_file(&format!("{snapshot_base}.sha1sums"), "meta")?;
    {
        let mut out = checksums_file.create()?;
        for dict in segment_metadata.values() {
            if let Some(hex) = dict["checksum"].strip_prefix("sha1=") {
                writeln!(out, "{hex}  *{}", dict["path"]).map_err(|source| Error::Io {
                    path: checksums_file.local_path().to_owned(),
                    source,
                })?;
            }
        }
    }
    let checksums_digest =
        Hash::hash_file(checksums_file.local_path()).map_err(|source| Error::Io {
            path: checksums_file.local_path().to_owned(),
            source,
        })?;
    checksums_file.send()?;

    // Database-state file: every used segment's metadata row, filtered
    // like segment data.
    let dbmeta_file = remote.alloc_file(
        &format!("{snapshot_base}.meta{}", options.filter_extension),
        "meta",
    )?;
    {
        let mut out = FileFilter::new(dbmeta_file.create()?, options.filter.as_deref())?;
        for dict in segment_metadata.values() {
            for (key, value) in dict {
                writeln!(out, "{key}: {value}").map_err(|source| Error::Io {
                    path: dbmeta_file.local_path().to_owned(),
                    source,
                })?;
            }
            writeln!(out).map_err(|source| Error::Io {
                path: dbmeta_file.local_path().to_owned(),
                source,
            })?;
        }
        out.finish()?;
    }
    let dbmeta_digest = Hash::hash_file(dbmeta_file.local_path()).map_err(|source| Error::Io {
        path: dbmeta_file.local_path().to_owned(),
        source,
    })?;
    dbmeta_file.send()?;

    db.close()?;

    // Everything the descriptor names must be confirmed on the server
    // before the descriptor itself is written.
    remote.sync()?;

    let descriptor_name = format!("{snapshot_base}.cumulus");
    let descriptor_file = remote.alloc_file(&descriptor_name, "snapshots")?;
    {
        let mut out = FileFilter::new(
            descriptor_file.create()?,
            options.signature_filter.as_deref(),
        )?;
        let write_err = |source| Error::Io {
            path: descriptor_file.local_path().to_owned(),
            source,
        };
        writeln!(out, "Format: {FORMAT_VERSION}").map_err(write_err)?;
        writeln!(out, "Producer: Cumulus {}", crate::version()).map_err(write_err)?;
        writeln!(out, "Date: {}", format_localtime(start_time)).map_err(write_err)?;
        if !options.scheme.is_empty() {
            writeln!(out, "Scheme: {}", options.scheme).map_err(write_err)?;
        }
        writeln!(out, "Root: {root}").map_err(write_err)?;
        writeln!(out, "Database-state: {dbmeta_digest}").map_err(write_err)?;
        writeln!(out, "Checksums: {checksums_digest}").map_err(write_err)?;
        writeln!(out, "Segments:").map_err(write_err)?;
        for segment in &used_segments {
            writeln!(out, "    {segment}").map_err(write_err)?;
        }
        out.finish()?;
    }
    descriptor_file.send()?;

    remote.sync()?;
    drop(remote);

    if let Some(temp_dir) = temp_dir {
        if let Err(err) = fs::remove_dir_all(&temp_dir) {
            warn!("Cannot delete temporary directory {}: {err}", temp_dir.display());
        }
    }

    Ok(descriptor_name)
}
