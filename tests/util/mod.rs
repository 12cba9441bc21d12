// Cumulus backup system.
// Copyright 2006-2012 The Cumulus Developers.

//! Utilities shared by the integration tests.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use cumulus::snapshot::SnapshotOptions;

/// A temporary source tree, deleted when dropped.
pub struct TreeFixture {
    pub root: PathBuf,
    _tempdir: TempDir,
}

impl TreeFixture {
    pub fn new() -> TreeFixture {
        let tempdir = TempDir::with_prefix("cumulus_TreeFixture").unwrap();
        let root = tempdir.path().to_path_buf();
        TreeFixture {
            _tempdir: tempdir,
            root,
        }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn create_file(&self, relative_path: &str, contents: &[u8]) {
        fs::write(self.root.join(relative_path), contents).unwrap();
    }

    pub fn create_dir(&self, relative_path: &str) {
        fs::create_dir(self.root.join(relative_path)).unwrap();
    }

    #[allow(dead_code)]
    pub fn create_symlink(&self, relative_path: &str, target: &str) {
        std::os::unix::fs::symlink(target, self.root.join(relative_path)).unwrap();
    }
}

impl Default for TreeFixture {
    fn default() -> Self {
        TreeFixture::new()
    }
}

/// Options for a test snapshot into `dest`, unfiltered so the results can
/// be inspected directly.
pub fn test_options(dest: &Path, source: &Path) -> SnapshotOptions {
    SnapshotOptions {
        dest: Some(dest.to_path_buf()),
        filter: None,
        filter_extension: String::new(),
        paths: vec![source.to_path_buf()],
        ..SnapshotOptions::default()
    }
}

/// Parsed fields of a snapshot descriptor.
pub struct Descriptor {
    pub root: String,
    pub segments: BTreeSet<String>,
    pub checksums: String,
    pub database_state: String,
}

pub fn read_descriptor(dest: &Path, name: &str) -> Descriptor {
    let text = fs::read_to_string(dest.join("snapshots").join(name)).unwrap();
    let mut root = None;
    let mut checksums = None;
    let mut database_state = None;
    let mut segments = BTreeSet::new();
    let mut in_segments = false;
    assert!(text.starts_with("Format: Cumulus Snapshot v0.11\n"));
    for line in text.lines() {
        if in_segments {
            segments.insert(line.trim().to_owned());
        } else if let Some(value) = line.strip_prefix("Root: ") {
            root = Some(value.to_owned());
        } else if let Some(value) = line.strip_prefix("Checksums: ") {
            checksums = Some(value.to_owned());
        } else if let Some(value) = line.strip_prefix("Database-state: ") {
            database_state = Some(value.to_owned());
        } else if line == "Segments:" {
            in_segments = true;
        }
    }
    Descriptor {
        root: root.expect("descriptor has a Root header"),
        segments,
        checksums: checksums.expect("descriptor has a Checksums header"),
        database_state: database_state.expect("descriptor has a Database-state header"),
    }
}

/// Segment UUIDs currently present under `dest/segments`.
pub fn list_segments(dest: &Path) -> BTreeSet<String> {
    let mut segments = BTreeSet::new();
    for entry in fs::read_dir(dest.join("segments")).unwrap() {
        let name = entry.unwrap().file_name().into_string().unwrap();
        segments.insert(name.trim_end_matches(".tar").to_owned());
    }
    segments
}

/// Total bytes stored under `dest/segments`.
pub fn total_segment_bytes(dest: &Path) -> u64 {
    fs::read_dir(dest.join("segments"))
        .unwrap()
        .map(|entry| entry.unwrap().metadata().unwrap().len())
        .sum()
}

/// The statcache written by the last run, holding every record's text.
pub fn read_statcache(localdb_dir: &Path) -> String {
    fs::read_to_string(localdb_dir.join("statcache2")).unwrap()
}
