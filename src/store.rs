// Cumulus backup system.
// Copyright 2006-2008 The Cumulus Developers.

// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

//! Grouping of objects into segments.
//!
//! Objects are appended to one open segment per group tag, so data of a
//! similar kind and age stays together and the garbage collector can later
//! drop or repack whole segments. A segment is closed once its estimated
//! size reaches the target, on `sync`, or at shutdown; closing records the
//! segment's path, checksum, and sizes in the local database and queues the
//! file for upload.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, warn};

use crate::hashes::Hash;
use crate::localdb::LocalDb;
use crate::reference::{generate_uuid, ObjectReference};
use crate::remote::{RemoteFile, RemoteStore};
use crate::tarfile::Tarfile;
use crate::{Result, SEGMENT_TARGET_SIZE};

struct OpenSegment {
    name: String,
    remote_file: RemoteFile,
    tarfile: Tarfile,
    count: u32,
    data_size: u64,
}

#[derive(Clone, Copy, Debug, Default)]
struct GroupStats {
    segments: u64,
    data_size: u64,
    disk_size: u64,
}

/// Policy knobs for segment creation, fixed for the length of a run.
#[derive(Clone, Debug)]
pub struct SegmentConfig {
    /// Filter program segment data is piped through, if any.
    pub filter_program: Option<String>,
    /// Extension appended after `.tar` on segment files, matching the
    /// filter (e.g. `.bz2`); empty with no filter.
    pub filter_extension: String,
}

/// Packs objects into per-group segments and finalises them.
pub struct SegmentStore {
    config: SegmentConfig,
    segments: HashMap<String, OpenSegment>,
    stats: BTreeMap<String, GroupStats>,
}

impl SegmentStore {
    pub fn new(config: SegmentConfig) -> SegmentStore {
        SegmentStore {
            config,
            segments: HashMap::new(),
            stats: BTreeMap::new(),
        }
    }

    /// Append an object to the open segment for `group`, creating one if
    /// needed, and record it in the local database.
    ///
    /// `checksum` may carry a digest the caller already computed; otherwise
    /// one is computed here. The returned reference carries the checksum
    /// and an exact range giving the object's size. `age` is the recorded
    /// age of the data in Julian days, 0.0 for new data.
    pub fn write_object(
        &mut self,
        remote: &RemoteStore,
        db: &LocalDb,
        data: &[u8],
        group: &str,
        checksum: Option<String>,
        age: f64,
    ) -> Result<ObjectReference> {
        if !self.segments.contains_key(group) {
            let name = generate_uuid();
            let filename = format!("{}.tar{}", name, self.config.filter_extension);
            let remote_file = remote.alloc_file(&filename, "segments")?;
            let file = remote_file.create()?;
            let tarfile = Tarfile::new(
                file,
                remote_file.local_path().to_owned(),
                &name,
                self.config.filter_program.as_deref(),
            )?;
            debug!(segment = %name, group, "starting new segment");
            self.segments.insert(
                group.to_owned(),
                OpenSegment {
                    name,
                    remote_file,
                    tarfile,
                    count: 0,
                    data_size: 0,
                },
            );
        }
        let segment = self.segments.get_mut(group).expect("segment just inserted");

        let id = segment.count;
        segment.tarfile.write_object(id, data)?;
        segment.count += 1;
        segment.data_size += data.len() as u64;

        let checksum = checksum.unwrap_or_else(|| {
            let mut hash = Hash::new_default();
            hash.update(data);
            hash.digest_str()
        });
        let mut reference = ObjectReference::normal(&segment.name, id);
        reference.set_checksum(&checksum);
        reference.set_range(0, data.len() as u64, true);
        db.store_object(&reference, age)?;

        if segment.tarfile.size_estimate() >= SEGMENT_TARGET_SIZE {
            self.close_segment(remote, db, group)?;
        }

        Ok(reference)
    }

    /// Close every open segment.
    pub fn sync(&mut self, remote: &RemoteStore, db: &LocalDb) -> Result<()> {
        let groups: Vec<String> = self.segments.keys().cloned().collect();
        for group in groups {
            self.close_segment(remote, db, &group)?;
        }
        Ok(())
    }

    fn close_segment(&mut self, _remote: &RemoteStore, db: &LocalDb, group: &str) -> Result<()> {
        let Some(segment) = self.segments.remove(group) else {
            return Ok(());
        };
        debug!(segment = %segment.name, group, "closing segment");

        segment.tarfile.finish()?;

        let local_path = segment.remote_file.local_path().to_owned();
        let disk_size = std::fs::metadata(&local_path).map(|m| m.len()).unwrap_or(0);
        let checksum = match Hash::hash_file_with("sha1", &local_path) {
            Ok(Some(checksum)) => Some(checksum),
            Ok(None) => None,
            Err(err) => {
                warn!(segment = %segment.name, "cannot hash segment file: {err}");
                None
            }
        };
        db.set_segment_metadata(
            &segment.name,
            segment.remote_file.remote_path(),
            checksum.as_deref(),
            "tar",
            segment.data_size,
            disk_size,
        )?;
        segment.remote_file.send()?;

        let stats = self.stats.entry(group.to_owned()).or_default();
        stats.segments += 1;
        stats.data_size += segment.data_size;
        stats.disk_size += disk_size;
        Ok(())
    }

    /// Print cumulative per-group sizes for the run.
    pub fn dump_stats(&self) {
        let mut total = GroupStats::default();
        println!("Segment statistics:");
        for (group, stats) in &self.stats {
            println!(
                "    {}: {} segments, {} bytes data, {} bytes on disk",
                group, stats.segments, stats.data_size, stats.disk_size
            );
            total.segments += stats.segments;
            total.data_size += stats.data_size;
            total.disk_size += stats.disk_size;
        }
        println!(
            "    total: {} segments, {} bytes data, {} bytes on disk",
            total.segments, total.data_size, total.disk_size
        );
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::Read;

    use tempfile::TempDir;

    use super::*;

    fn fixture() -> (TempDir, RemoteStore, LocalDb, SegmentStore) {
        let dir = TempDir::new().unwrap();
        let remote = RemoteStore::new(&dir.path().join("dest"), None);
        let db = LocalDb::open(
            &dir.path().join("localdb.sqlite"),
            "20240101T000000",
            "",
            1.0,
        )
        .unwrap();
        let store = SegmentStore::new(SegmentConfig {
            filter_program: None,
            filter_extension: String::new(),
        });
        (dir, remote, db, store)
    }

    #[test]
    fn objects_share_a_segment_per_group() {
        let (dir, remote, db, mut store) = fixture();
        let a = store
            .write_object(&remote, &db, b"object a", "data", None, 0.0)
            .unwrap();
        let b = store
            .write_object(&remote, &db, b"object b", "data", None, 0.0)
            .unwrap();
        let m = store
            .write_object(&remote, &db, b"meta", "metadata", None, 0.0)
            .unwrap();

        assert_eq!(a.segment(), b.segment());
        assert_ne!(a.segment(), m.segment());
        assert_eq!(a.sequence(), "00000000");
        assert_eq!(b.sequence(), "00000001");
        assert!(a.has_checksum());
        assert!(a.range_is_exact());
        assert_eq!(a.range_length(), 8);

        store.sync(&remote, &db).unwrap();
        remote.sync().unwrap();

        // Both segments landed under dest/segments/ as plain tar files.
        let seg_path = dir
            .path()
            .join("dest/segments")
            .join(format!("{}.tar", a.segment()));
        let mut archive = tar::Archive::new(File::open(&seg_path).unwrap());
        let mut contents = Vec::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let mut data = Vec::new();
            entry.read_to_end(&mut data).unwrap();
            contents.push(data);
        }
        assert_eq!(contents, vec![b"object a".to_vec(), b"object b".to_vec()]);

        // Segment metadata was recorded with a sha1 checksum.
        let dict = db.get_segment_metadata(a.segment()).unwrap().unwrap();
        assert!(dict["checksum"].starts_with("sha1="));
        assert_eq!(dict["data_size"], "16");
        assert_eq!(dict["path"], format!("segments/{}.tar", a.segment()));
        db.close().unwrap();
    }

    #[test]
    fn segments_rotate_at_target_size() {
        let (_dir, remote, db, mut store) = fixture();
        let chunk = vec![0x5au8; 1024 * 1024];
        let mut segments = std::collections::BTreeSet::new();
        for _ in 0..5 {
            let r = store
                .write_object(&remote, &db, &chunk, "data", None, 0.0)
                .unwrap();
            segments.insert(r.segment().to_owned());
        }
        // 5 MiB of incompressible-ish data with no filter must have crossed
        // the 4 MiB target at least once.
        assert!(segments.len() >= 2, "expected rotation, got {segments:?}");
        store.sync(&remote, &db).unwrap();
        remote.sync().unwrap();
        db.close().unwrap();
    }

    #[test]
    fn written_objects_are_deduplicable() {
        let (_dir, remote, db, mut store) = fixture();
        let r = store
            .write_object(&remote, &db, b"some data", "data", None, 0.0)
            .unwrap();
        let found = db
            .find_object(r.checksum().unwrap(), r.range_length())
            .unwrap()
            .unwrap();
        assert_eq!(found.basename(), r.basename());
        store.sync(&remote, &db).unwrap();
        remote.sync().unwrap();
        db.close().unwrap();
    }
}
