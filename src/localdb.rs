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

//! The local database of everything ever written to the remote store.
//!
//! Remote storage is write-once and unindexed, so all the knowledge needed
//! to build an incremental snapshot lives here: every segment, every data
//! block with its checksum and size, sub-block chunk signatures, and per-
//! snapshot liveness accounting that an offline garbage collector can act
//! on. The whole backup run executes inside one transaction, committed at
//! close, so an aborted run leaves the database describing only completed
//! snapshots.

use std::collections::BTreeMap;
use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

use crate::errors::Error;
use crate::reference::ObjectReference;
use crate::Result;

const SCHEMA_MAJOR: i64 = 0;
const SCHEMA_MINOR: i64 = 11;

const SCHEMA_SQL: &str = "
create table schema_version (
    major integer not null,
    minor integer not null
);

create table snapshots (
    snapshotid integer primary key,
    name text not null,
    scheme text not null,
    timestamp real,
    intent real
);

create table segments (
    segmentid integer primary key,
    segment text unique not null,
    path text,
    checksum text,
    type text,
    data_size integer,
    disk_size integer,
    mtime real
);

create table block_index (
    blockid integer primary key,
    segmentid integer not null,
    object text not null,
    checksum text,
    size integer,
    timestamp real,
    expired integer
);
create index block_content_index on block_index(checksum);
create unique index block_name_index on block_index(segmentid, object);

create table subblock_signatures (
    blockid integer primary key,
    algorithm text not null,
    signatures blob not null
);

create table segment_utilization (
    snapshotid integer not null,
    segmentid integer not null,
    bytes_referenced integer,
    primary key (snapshotid, segmentid)
);
";

/// A block located by checksum that was once stored, live or expired.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OldObject {
    /// Age of the data, in Julian days.
    pub age: f64,
    /// Group number assigned when the block's segment was marked for
    /// repacking; `None` for live blocks.
    pub expired_group: Option<i64>,
}

/// Open handle on the reuse database, scoped to one snapshot run.
pub struct LocalDb {
    conn: Connection,
    snapshot_id: i64,
}

impl LocalDb {
    /// Open the database and begin the snapshot transaction.
    ///
    /// A brand-new (empty) database file is initialised with the current
    /// schema; any other schema version mismatch is fatal. A row for this
    /// snapshot is inserted immediately.
    pub fn open(path: &Path, snapshot_name: &str, scheme: &str, intent: f64) -> Result<LocalDb> {
        let conn = Connection::open(path).map_err(|source| Error::LocalDbOpen {
            path: path.to_owned(),
            source,
        })?;
        conn.execute_batch("begin")?;

        let tables: i64 = conn.query_row(
            "select count(*) from sqlite_master where type = 'table'",
            [],
            |row| row.get(0),
        )?;
        if tables == 0 {
            conn.execute_batch(SCHEMA_SQL)?;
            conn.execute(
                "insert into schema_version(major, minor) values (?1, ?2)",
                params![SCHEMA_MAJOR, SCHEMA_MINOR],
            )?;
        }

        let version: Option<(i64, i64)> = conn
            .query_row("select major, minor from schema_version", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .optional()
            .unwrap_or(None);
        match version {
            Some((major, minor)) if major == SCHEMA_MAJOR && minor == SCHEMA_MINOR => {}
            version => {
                let (found_major, found_minor) = version.unwrap_or((0, 0));
                return Err(Error::SchemaVersionMismatch {
                    expected_major: SCHEMA_MAJOR,
                    expected_minor: SCHEMA_MINOR,
                    found_major,
                    found_minor,
                });
            }
        }

        conn.execute(
            "insert into snapshots(name, scheme, timestamp, intent) \
             values (?1, ?2, julianday('now'), ?3)",
            params![snapshot_name, scheme, intent],
        )?;
        let snapshot_id = conn.last_insert_rowid();

        // Accumulates the objects this snapshot references; summarised into
        // segment_utilization at close.
        conn.execute_batch(
            "create temporary table snapshot_refs (
                segmentid integer not null,
                object text not null,
                size integer not null
            );
            create unique index snapshot_refs_index
                on snapshot_refs(segmentid, object);",
        )?;

        Ok(LocalDb { conn, snapshot_id })
    }

    /// Summarise this snapshot's references and commit the transaction.
    pub fn close(self) -> Result<()> {
        self.conn.execute(
            "insert or replace into segment_utilization \
             select ?1 as snapshotid, segmentid, sum(size) \
             from snapshot_refs group by segmentid",
            params![self.snapshot_id],
        )?;
        self.conn.execute_batch("commit")?;
        Ok(())
    }

    /// Map a segment UUID to its dense integer id, assigning one if new.
    pub fn segment_to_id(&self, segment: &str) -> Result<i64> {
        self.conn.execute(
            "insert or ignore into segments(segment) values (?1)",
            params![segment],
        )?;
        Ok(self.conn.query_row(
            "select segmentid from segments where segment = ?1",
            params![segment],
            |row| row.get(0),
        )?)
    }

    fn id_to_segment(&self, segment_id: i64) -> Result<String> {
        Ok(self.conn.query_row(
            "select segment from segments where segmentid = ?1",
            params![segment_id],
            |row| row.get(0),
        )?)
    }

    /// Record a newly stored object.
    ///
    /// The reference must carry a checksum and an exact range giving the
    /// object's size. `age` of 0.0 means "now".
    pub fn store_object(&self, reference: &ObjectReference, age: f64) -> Result<()> {
        let (Some(checksum), true) = (reference.checksum(), reference.range_is_exact()) else {
            return Err(Error::IncompleteReference {
                reference: reference.to_string(),
            });
        };
        let segment_id = self.segment_to_id(reference.segment())?;
        let size = reference.range_length() as i64;
        if age == 0.0 {
            self.conn.execute(
                "insert into block_index(segmentid, object, checksum, size, timestamp) \
                 values (?1, ?2, ?3, ?4, julianday('now'))",
                params![segment_id, reference.sequence(), checksum, size],
            )?;
        } else {
            self.conn.execute(
                "insert into block_index(segmentid, object, checksum, size, timestamp) \
                 values (?1, ?2, ?3, ?4, ?5)",
                params![segment_id, reference.sequence(), checksum, size, age],
            )?;
        }
        Ok(())
    }

    /// Find a live stored object with this checksum and size.
    ///
    /// The returned reference covers the whole object, with an exact range
    /// recording the size.
    pub fn find_object(&self, checksum: &str, size: u64) -> Result<Option<ObjectReference>> {
        let row: Option<(i64, String)> = self
            .conn
            .query_row(
                "select segmentid, object from block_index \
                 where checksum = ?1 and size = ?2 and expired is null",
                params![checksum, size as i64],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((segment_id, object)) = row else {
            return Ok(None);
        };
        let segment = self.id_to_segment(segment_id)?;
        let mut reference = ObjectReference::normal_str(&segment, &object);
        reference.set_range(0, size, true);
        Ok(Some(reference))
    }

    /// Look up any record (live or expired) of this checksum and size.
    pub fn is_old_object(&self, checksum: &str, size: u64) -> Result<Option<OldObject>> {
        Ok(self
            .conn
            .query_row(
                "select timestamp, expired from block_index \
                 where checksum = ?1 and size = ?2",
                params![checksum, size as i64],
                |row| {
                    Ok(OldObject {
                        age: row.get(0)?,
                        expired_group: row.get(1)?,
                    })
                },
            )
            .optional()?)
    }

    /// Is the referenced object still stored and not expired?
    ///
    /// Synthetic references (zero, null) are always available since they
    /// are never stored.
    pub fn is_available(&self, reference: &ObjectReference) -> Result<bool> {
        if !reference.is_normal() {
            return Ok(true);
        }
        let segment_id = self.segment_to_id(reference.segment())?;
        let count: i64 = self.conn.query_row(
            "select count(*) from block_index \
             where segmentid = ?1 and object = ?2 and expired is null",
            params![segment_id, reference.sequence()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Account one use of an object by the current snapshot.
    ///
    /// The recorded coverage for an object only grows, up to its size. It
    /// reaches the full size only when a whole-object reference is seen:
    /// partial ranges that happen to add up to the total stay capped one
    /// byte short, since overlap cannot be told apart from a complete
    /// cover.
    pub fn use_object(&self, reference: &ObjectReference) -> Result<()> {
        if !reference.is_normal() {
            return Ok(());
        }
        let segment_id = self.segment_to_id(reference.segment())?;

        let old_size: i64 = self
            .conn
            .query_row(
                "select size from snapshot_refs where segmentid = ?1 and object = ?2",
                params![segment_id, reference.sequence()],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0);

        let object_size: i64 = if reference.range_is_exact() {
            reference.range_length() as i64
        } else {
            match self
                .conn
                .query_row(
                    "select size from block_index where segmentid = ?1 and object = ?2",
                    params![segment_id, reference.sequence()],
                    |row| row.get(0),
                )
                .optional()?
            {
                Some(size) => size,
                None => {
                    warn!("no block found in block_index for {reference}");
                    0
                }
            }
        };

        let new_refs = if reference.has_range() {
            reference.range_length() as i64
        } else {
            object_size
        };
        let mut new_size = old_size + new_refs;
        if old_size < object_size && new_refs < object_size {
            new_size = new_size.min(object_size - 1);
        }
        new_size = new_size.min(object_size).max(0);

        if new_size != old_size {
            self.conn.execute(
                "insert or replace into snapshot_refs(segmentid, object, size) \
                 values (?1, ?2, ?3)",
                params![segment_id, reference.sequence(), new_size],
            )?;
        }
        Ok(())
    }

    /// Segments referenced so far by the current snapshot, sorted.
    pub fn get_used_segments(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "select segment from segments \
             where segmentid in (select segmentid from snapshot_refs) \
             order by segment",
        )?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        let mut segments = Vec::new();
        for row in rows {
            segments.push(row?);
        }
        Ok(segments)
    }

    /// Record a closed segment's location and checksum.
    ///
    /// `checksum` of `None` records the segment without integrity data (it
    /// then stays out of the checksums and dbmeta files). The modification
    /// time is only set the first time.
    pub fn set_segment_metadata(
        &self,
        segment: &str,
        path: &str,
        checksum: Option<&str>,
        file_type: &str,
        data_size: u64,
        disk_size: u64,
    ) -> Result<()> {
        let segment_id = self.segment_to_id(segment)?;
        self.conn.execute(
            "update segments set path = ?1, checksum = ?2, type = ?3, \
             data_size = ?4, disk_size = ?5, \
             mtime = coalesce(mtime, julianday('now')) \
             where segmentid = ?6",
            params![
                path,
                checksum,
                file_type,
                data_size as i64,
                disk_size as i64,
                segment_id
            ],
        )?;
        Ok(())
    }

    /// Full metadata dictionary for a segment, as written to the dbmeta
    /// file; `None` if the segment was never finalised with a checksum.
    pub fn get_segment_metadata(&self, segment: &str) -> Result<Option<BTreeMap<String, String>>> {
        let row = self
            .conn
            .query_row(
                "select path, checksum, type, data_size, disk_size, mtime \
                 from segments where segment = ?1",
                params![segment],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<i64>>(3)?,
                        row.get::<_, Option<i64>>(4)?,
                        row.get::<_, Option<f64>>(5)?,
                    ))
                },
            )
            .optional()?;
        let Some((path, checksum, file_type, data_size, disk_size, mtime)) = row else {
            return Ok(None);
        };
        let (Some(path), Some(checksum)) = (path, checksum) else {
            return Ok(None);
        };
        let mut dict = BTreeMap::new();
        dict.insert("segment".to_owned(), segment.to_owned());
        dict.insert("path".to_owned(), path);
        dict.insert("checksum".to_owned(), checksum);
        if let Some(file_type) = file_type {
            dict.insert("type".to_owned(), file_type);
        }
        if let Some(data_size) = data_size {
            dict.insert("data_size".to_owned(), data_size.to_string());
        }
        if let Some(disk_size) = disk_size {
            dict.insert("disk_size".to_owned(), disk_size.to_string());
        }
        if let Some(mtime) = mtime {
            dict.insert("mtime".to_owned(), format!("{mtime}"));
        }
        Ok(Some(dict))
    }

    /// Load the packed sub-block signatures stored for an object, with the
    /// algorithm they were computed under.
    pub fn load_chunk_signatures(
        &self,
        reference: &ObjectReference,
    ) -> Result<Option<(Vec<u8>, String)>> {
        let segment_id = self.segment_to_id(reference.segment())?;
        Ok(self
            .conn
            .query_row(
                "select signatures, algorithm from subblock_signatures \
                 where blockid = (select blockid from block_index \
                                  where segmentid = ?1 and object = ?2)",
                params![segment_id, reference.sequence()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?)
    }

    /// Store packed sub-block signatures for an already-indexed object,
    /// replacing any previous row.
    pub fn store_chunk_signatures(
        &self,
        reference: &ObjectReference,
        signatures: &[u8],
        algorithm: &str,
    ) -> Result<()> {
        let segment_id = self.segment_to_id(reference.segment())?;
        let block_id: i64 = self.conn.query_row(
            "select blockid from block_index where segmentid = ?1 and object = ?2",
            params![segment_id, reference.sequence()],
            |row| row.get(0),
        )?;
        self.conn.execute(
            "insert or replace into subblock_signatures(blockid, algorithm, signatures) \
             values (?1, ?2, ?3)",
            params![block_id, algorithm, signatures],
        )?;
        Ok(())
    }
}
