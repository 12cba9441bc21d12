// Cumulus backup system.
// Copyright 2007-2008 The Cumulus Developers.

// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

//! The metadata log: one textual record per inode, chunked into objects.
//!
//! Records are `Key: Value` lines, `name` first, separated by blank lines.
//! Accumulated records are flushed as objects in the `metadata` group; the
//! root object is a list of `@<ref>` lines pointing at them. A record that
//! is byte-identical to last snapshot's is not re-emitted: an indirect
//! `@<ref>` into the old log takes its place, with adjacent indirect
//! references merged.
//!
//! The statcache tracks where each record was written: a `@@<ref>` line
//! followed by the record text. Next snapshot reads it back to find both
//! the stat fields (to skip unchanged files) and the old location (to
//! reuse the log bytes).

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::errors::Error;
use crate::format::{parse_int, uri_decode};
use crate::localdb::LocalDb;
use crate::reference::ObjectReference;
use crate::remote::RemoteStore;
use crate::store::SegmentStore;
use crate::Result;

/// Flush the record queue once this much text has accumulated.
const METADATA_BLOCK_SIZE: usize = 64 * 1024;

/// A metadata record: ordered key/value pairs.
pub type Dictionary = BTreeMap<String, String>;

/// Stat fields compared against the statcache to decide whether a file is
/// unchanged.
#[derive(Clone, Debug)]
pub struct StatFields {
    pub ctime: i64,
    pub mtime: i64,
    pub size: i64,
    /// `<dev-major>/<dev-minor>/<inode>`, as written in the `inode` field.
    pub inode: String,
}

struct MetadataItem {
    text: String,
    offset: usize,
    reused: Option<ObjectReference>,
}

/// Writer for one snapshot's metadata log.
pub struct MetadataWriter {
    statcache_path: PathBuf,
    statcache_tmp_path: PathBuf,
    statcache_in: Option<BufReader<File>>,
    statcache_out: BufWriter<File>,
    old_metadata: Dictionary,
    old_metadata_loc: String,
    old_metadata_eof: bool,
    items: Vec<MetadataItem>,
    chunk_size: usize,
    root: String,
    full_metadata: bool,
}

/// Compare paths in filesystem-visit order: component-wise at `/`
/// boundaries, so `a/b` sorts before `a.x/b` even though `.` < `/` as a
/// byte.
pub fn pathcmp(a: &[u8], b: &[u8]) -> Ordering {
    let mut a_parts = a.split(|&c| c == b'/');
    let mut b_parts = b.split(|&c| c == b'/');
    loop {
        match (a_parts.next(), b_parts.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => match x.cmp(y) {
                Ordering::Equal => continue,
                other => return other,
            },
        }
    }
}

/// Render a record as `Key: Value` lines with `name` always first.
fn encode_dict(dict: &Dictionary) -> String {
    let mut out = String::new();
    if let Some(name) = dict.get("name") {
        out.push_str(&format!("name: {name}\n"));
    }
    for (key, value) in dict {
        if key == "name" {
            continue;
        }
        out.push_str(&format!("{key}: {value}\n"));
    }
    out
}

impl MetadataWriter {
    /// Open the statcache pair for this run.
    ///
    /// The old statcache is optional (a missing or unreadable one just
    /// disables reuse); failure to create the new one is fatal.
    pub fn new(
        localdb_dir: &Path,
        snapshot_name: &str,
        scheme: &str,
        full_metadata: bool,
    ) -> Result<MetadataWriter> {
        let mut basename = "statcache2".to_owned();
        if !scheme.is_empty() {
            basename.push('-');
            basename.push_str(scheme);
        }
        let statcache_path = localdb_dir.join(&basename);
        let statcache_tmp_path = localdb_dir.join(format!("{basename}.{snapshot_name}"));

        let statcache_in = File::open(&statcache_path).ok().map(BufReader::new);
        let statcache_out = File::create(&statcache_tmp_path)
            .map(BufWriter::new)
            .map_err(|source| Error::Statcache {
                path: statcache_tmp_path.clone(),
                source,
            })?;

        Ok(MetadataWriter {
            statcache_path,
            statcache_tmp_path,
            statcache_in,
            statcache_out,
            old_metadata: Dictionary::new(),
            old_metadata_loc: String::new(),
            old_metadata_eof: false,
            items: Vec::new(),
            chunk_size: 0,
            root: String::new(),
            full_metadata,
        })
    }

    /// Read the next entry from the old statcache into `old_metadata`.
    ///
    /// An entry is a `@@<ref>` line, then `Key: Value` lines (lines
    /// starting with whitespace continue the previous value), ended by a
    /// blank line. Read problems silently end the old data.
    fn read_statcache(&mut self) {
        let Some(input) = self.statcache_in.as_mut() else {
            self.old_metadata_eof = true;
            return;
        };
        self.old_metadata.clear();

        let mut line = String::new();
        match input.read_line(&mut line) {
            Ok(0) | Err(_) => {
                self.old_metadata_eof = true;
                return;
            }
            Ok(_) => {}
        }
        let line = line.trim_end_matches('\n');
        let Some(loc) = line.strip_prefix("@@") else {
            self.old_metadata_eof = true;
            return;
        };
        self.old_metadata_loc = loc.to_owned();

        let mut field = String::new();
        loop {
            let mut line = String::new();
            match input.read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let line = line.trim_end_matches('\n');
            if line.is_empty() {
                break;
            }
            if line.starts_with(|c: char| c.is_ascii_whitespace()) && !field.is_empty() {
                let value = self.old_metadata.entry(field.clone()).or_default();
                value.push('\n');
                value.push_str(line);
                continue;
            }
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            field = key.to_owned();
            self.old_metadata
                .insert(field.clone(), value.trim_start().to_owned());
        }

        if self.old_metadata.is_empty() {
            self.old_metadata_eof = true;
        }
    }

    /// Advance through the old statcache, in visit order, to the entry for
    /// `path`. Returns whether an entry with that exact name was found.
    pub fn find(&mut self, path: &[u8]) -> bool {
        while !self.old_metadata_eof {
            let old_name = uri_decode(self.old_metadata.get("name").map_or("", |s| s.as_str()));
            match pathcmp(&old_name, path) {
                Ordering::Equal => return true,
                Ordering::Greater => return false,
                Ordering::Less => self.read_statcache(),
            }
        }
        false
    }

    /// Does the found entry's stat information match the file's?
    ///
    /// An entry recorded as volatile is never considered unchanged.
    pub fn is_unchanged(&self, stat: &StatFields) -> bool {
        if let Some(v) = self.old_metadata.get("volatile") {
            if parse_int(v) != 0 {
                return false;
            }
        }
        let field_matches = |key: &str, expected: i64| {
            self.old_metadata
                .get(key)
                .is_some_and(|v| parse_int(v) == expected)
        };
        field_matches("ctime", stat.ctime)
            && field_matches("mtime", stat.mtime)
            && field_matches("size", stat.size)
            && self.old_metadata.get("inode").map(String::as_str) == Some(stat.inode.as_str())
    }

    /// Whole-file checksum recorded for the found entry.
    pub fn get_checksum(&self) -> Option<&str> {
        self.old_metadata.get("checksum").map(String::as_str)
    }

    /// Object references from the found entry's `data` list.
    pub fn get_blocks(&self) -> Vec<ObjectReference> {
        let Some(data) = self.old_metadata.get("data") else {
            return Vec::new();
        };
        data.split_ascii_whitespace()
            .filter_map(ObjectReference::parse)
            .collect()
    }

    /// Queue one record for the log.
    ///
    /// If the record is identical to the old statcache entry, full-metadata
    /// mode is off, and the old log location is still available, the queued
    /// item is marked for reuse by reference instead of re-emission.
    pub fn add(
        &mut self,
        info: Dictionary,
        store: &mut SegmentStore,
        remote: &RemoteStore,
        db: &LocalDb,
    ) -> Result<()> {
        let mut text = encode_dict(&info);
        text.push('\n');

        let mut reused = None;
        if !self.full_metadata && info == self.old_metadata {
            if let Some(reference) = ObjectReference::parse(&self.old_metadata_loc) {
                if db.is_available(&reference)? {
                    reused = Some(reference);
                }
            }
        }

        self.chunk_size += text.len();
        self.items.push(MetadataItem {
            text,
            offset: 0,
            reused,
        });

        if self.chunk_size > METADATA_BLOCK_SIZE {
            self.flush(store, remote, db)?;
        }
        Ok(())
    }

    /// Emit the queued records as one object in the `metadata` group.
    ///
    /// Runs of reusable records collapse to a single merged `@<ref>` line;
    /// a blank line separates an indirect reference from inlined text that
    /// follows it. Each record's location (fresh or reused) is appended to
    /// the new statcache.
    fn flush(
        &mut self,
        store: &mut SegmentStore,
        remote: &RemoteStore,
        db: &LocalDb,
    ) -> Result<()> {
        let mut offset = 0usize;
        let mut metadata = String::new();
        let mut indirect = ObjectReference::null();

        for item in &mut self.items {
            if let Some(reference) = &item.reused {
                // Indirect references reach into old segments; account them
                // so those segments stay live in this snapshot.
                db.use_object(reference)?;
            }

            let merged = match &item.reused {
                Some(reference) => indirect.merge(reference),
                None => false,
            };
            if !merged {
                if !indirect.is_null() {
                    let refstr = indirect.to_string();
                    metadata.push('@');
                    metadata.push_str(&refstr);
                    metadata.push('\n');
                    offset += refstr.len() + 2;
                    if item.reused.is_none() {
                        metadata.push('\n');
                        offset += 1;
                    }
                }
                indirect = match &item.reused {
                    Some(reference) => reference.clone(),
                    None => ObjectReference::null(),
                };
            }

            if item.reused.is_none() {
                metadata.push_str(&item.text);
                item.offset = offset;
                offset += item.text.len();
            }
        }
        if !indirect.is_null() {
            let refstr = indirect.to_string();
            metadata.push('@');
            metadata.push_str(&refstr);
            metadata.push('\n');
        }

        if metadata.is_empty() {
            return Ok(());
        }

        let reference =
            store.write_object(remote, db, metadata.as_bytes(), "metadata", None, 0.0)?;
        self.root.push('@');
        self.root.push_str(&reference.to_string());
        self.root.push('\n');
        db.use_object(&reference)?;

        for item in &self.items {
            let r = match &item.reused {
                Some(old) => old.clone(),
                None => {
                    let mut r = reference.clone();
                    r.set_range(item.offset as u64, item.text.len() as u64, false);
                    r
                }
            };
            write!(self.statcache_out, "@@{}\n{}", r, item.text).map_err(|source| {
                Error::Statcache {
                    path: self.statcache_tmp_path.clone(),
                    source,
                }
            })?;
        }

        self.chunk_size = 0;
        self.items.clear();
        Ok(())
    }

    /// Flush remaining records, write the root object, and move the new
    /// statcache into place. Returns the root reference.
    pub fn close(
        mut self,
        store: &mut SegmentStore,
        remote: &RemoteStore,
        db: &LocalDb,
    ) -> Result<ObjectReference> {
        self.flush(store, remote, db)?;
        let reference = store.write_object(remote, db, self.root.as_bytes(), "metadata", None, 0.0)?;
        db.use_object(&reference)?;

        self.statcache_out
            .flush()
            .map_err(|source| Error::Statcache {
                path: self.statcache_tmp_path.clone(),
                source,
            })?;
        fs::rename(&self.statcache_tmp_path, &self.statcache_path).map_err(|source| {
            Error::Statcache {
                path: self.statcache_path.clone(),
                source,
            }
        })?;
        Ok(reference)
    }
}
