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

//! End-to-end snapshot scenarios.

use std::fs;
use std::thread::sleep;
use std::time::Duration;

use tempfile::TempDir;

use cumulus::hashes::Hash;
use cumulus::reference::ObjectReference;
use cumulus::rules::RuleType;
use cumulus::run_snapshot;

mod util;
use util::*;

fn pseudo_random(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed;
    let mut out = Vec::with_capacity(len);
    for _ in 0..len {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        out.push((state >> 33) as u8);
    }
    out
}

/// Wait long enough that a second snapshot gets a distinct timestamp name.
fn next_snapshot_slot() {
    sleep(Duration::from_millis(1100));
}

#[test]
fn empty_file_writes_only_metadata() {
    let src = TreeFixture::new();
    src.create_file("f", b"");
    let dest = TempDir::new().unwrap();

    let descriptor_name = run_snapshot(test_options(dest.path(), src.path())).unwrap();
    let descriptor = read_descriptor(dest.path(), &descriptor_name);

    // One metadata segment, no data segment.
    let segments = list_segments(dest.path());
    assert_eq!(segments.len(), 1);
    assert_eq!(descriptor.segments, segments);

    // The root reference points into that segment.
    let root = ObjectReference::parse(&descriptor.root).unwrap();
    assert!(segments.contains(root.segment()));

    // The file record exists, with an empty data list.
    let statcache = read_statcache(dest.path());
    assert!(statcache.contains("type: f\n"));
    assert!(statcache.contains("size: 0\n"));
    assert!(statcache.contains("data: \n"));
}

#[test]
fn all_zero_file_stores_no_data_object() {
    let src = TreeFixture::new();
    src.create_file("sparse", &vec![0u8; 1 << 20]);
    let dest = TempDir::new().unwrap();

    run_snapshot(test_options(dest.path(), src.path())).unwrap();

    // Still only the metadata segment: the zero block was synthesised.
    assert_eq!(list_segments(dest.path()).len(), 1);

    let statcache = read_statcache(dest.path());
    assert!(statcache.contains("data: zero[1048576]\n"));
    assert!(statcache.contains("size: 1048576\n"));
    let expected = Hash::hash_bytes("sha224", &vec![0u8; 1 << 20]).unwrap();
    assert!(statcache.contains(&format!("checksum: {expected}\n")));
}

#[test]
fn identical_files_deduplicate_within_one_run() {
    let src = TreeFixture::new();
    let contents = pseudo_random(2 << 20, 7);
    src.create_file("a_first", &contents);
    src.create_file("b_second", &contents);
    let dest = TempDir::new().unwrap();

    run_snapshot(test_options(dest.path(), src.path())).unwrap();

    // Both files' records list identical block references.
    let statcache = read_statcache(dest.path());
    let data_lines: Vec<&str> = statcache
        .lines()
        .filter(|line| line.starts_with("data: "))
        .collect();
    assert_eq!(data_lines.len(), 2);
    assert_eq!(data_lines[0], data_lines[1]);

    // Only one copy of the content was uploaded.
    let total = total_segment_bytes(dest.path());
    assert!(
        total < (2 << 20) + (1 << 19),
        "expected ~2 MiB of segment data, got {total}"
    );
}

#[test]
fn small_change_reuses_old_chunks() {
    let src = TreeFixture::new();
    let contents = pseudo_random(1 << 20, 11);
    src.create_file("big", &contents);
    let dest = TempDir::new().unwrap();

    run_snapshot(test_options(dest.path(), src.path())).unwrap();
    let after_first = total_segment_bytes(dest.path());
    let first_segments = list_segments(dest.path());

    // Prepend 16 bytes; the chunker finds the original break points again
    // after the first chunk, so almost everything is reused.
    let mut changed = b"0123456789abcdef".to_vec();
    changed.extend_from_slice(&contents);
    src.create_file("big", &changed);

    next_snapshot_slot();
    let descriptor_name = run_snapshot(test_options(dest.path(), src.path())).unwrap();
    let delta = total_segment_bytes(dest.path()) - after_first;
    assert!(
        delta < 300 * 1024,
        "second snapshot should store only changed chunks, stored {delta}"
    );

    // The new file record mixes references to the old object with the new
    // literal data, merged where adjacent.
    let descriptor = read_descriptor(dest.path(), &descriptor_name);
    for segment in &first_segments {
        assert!(
            descriptor.segments.contains(segment),
            "old segment {segment} should stay live"
        );
    }

    let statcache = read_statcache(dest.path());
    let record = statcache
        .split("@@")
        .find(|entry| entry.contains("name: ") && entry.contains("/big\n"))
        .expect("statcache record for big");
    // The data value runs from its "data: " line through the indented
    // continuation lines that follow.
    let mut data = String::new();
    let mut in_data = false;
    for line in record.lines() {
        if let Some(first) = line.strip_prefix("data: ") {
            data.push_str(first);
            in_data = true;
        } else if in_data && line.starts_with(' ') {
            data.push(' ');
            data.push_str(line.trim_start());
        } else if in_data {
            break;
        }
    }
    let refs: Vec<ObjectReference> = data
        .split_whitespace()
        .filter_map(ObjectReference::parse)
        .collect();
    assert!(refs.len() >= 2, "expected a mixed reference list, got {data}");
    let total_len: u64 = refs.iter().map(|r| r.range_length()).sum();
    assert_eq!(total_len, (1 << 20) + 16);
    let old_segment_bytes: u64 = refs
        .iter()
        .filter(|r| first_segments.contains(r.segment()))
        .map(|r| r.range_length())
        .sum();
    assert!(
        old_segment_bytes > 700 * 1024,
        "most bytes should come from the old object, got {old_segment_bytes}"
    );
}

#[test]
fn include_exclude_rules_select_files() {
    let src = TreeFixture::new();
    src.create_dir("a");
    src.create_dir("b");
    src.create_file("a/keep", b"kept");
    src.create_file("a/skip", b"skipped");
    src.create_file("b/keep", b"kept");
    let dest = TempDir::new().unwrap();

    let mut options = test_options(dest.path(), src.path());
    options.rules = vec![
        (RuleType::Include, "**/keep".to_owned()),
        (RuleType::Include, "**/".to_owned()),
        (RuleType::Exclude, "**".to_owned()),
    ];
    run_snapshot(options).unwrap();

    let statcache = read_statcache(dest.path());
    let names: Vec<&str> = statcache
        .lines()
        .filter_map(|line| line.strip_prefix("name: "))
        .collect();
    assert!(names.iter().any(|n| n.ends_with("/a")));
    assert!(names.iter().any(|n| n.ends_with("/a/keep")));
    assert!(names.iter().any(|n| n.ends_with("/b")));
    assert!(names.iter().any(|n| n.ends_with("/b/keep")));
    assert!(!names.iter().any(|n| n.ends_with("/skip")));
}

#[test]
fn dir_merge_rules_scope_to_subtree() {
    let src = TreeFixture::new();
    src.create_dir("dir");
    src.create_dir("other");
    src.create_file("dir/.filt", b"- *.tmp\n");
    src.create_file("dir/junk.tmp", b"x");
    src.create_file("dir/real.txt", b"x");
    src.create_file("other/fine.tmp", b"x");
    src.create_file("top.tmp", b"x");
    let dest = TempDir::new().unwrap();

    let mut options = test_options(dest.path(), src.path());
    options.rules = vec![(RuleType::DirMerge, ".filt".to_owned())];
    run_snapshot(options).unwrap();

    let statcache = read_statcache(dest.path());
    let names: Vec<&str> = statcache
        .lines()
        .filter_map(|line| line.strip_prefix("name: "))
        .collect();
    // Inside dir the merged exclude applies; outside it does not, and the
    // parent's rules are restored after leaving the subtree.
    assert!(!names.iter().any(|n| n.ends_with("/junk.tmp")));
    assert!(names.iter().any(|n| n.ends_with("/real.txt")));
    assert!(names.iter().any(|n| n.ends_with("/fine.tmp")));
    assert!(names.iter().any(|n| n.ends_with("/top.tmp")));
}

#[test]
fn unchanged_second_snapshot_reuses_everything() {
    let src = TreeFixture::new();
    src.create_file("one", &pseudo_random(300_000, 21));
    src.create_file("two", b"small file");
    let dest = TempDir::new().unwrap();

    let first_name = run_snapshot(test_options(dest.path(), src.path())).unwrap();
    let first = read_descriptor(dest.path(), &first_name);
    let first_segments = list_segments(dest.path());

    next_snapshot_slot();
    let second_name = run_snapshot(test_options(dest.path(), src.path())).unwrap();
    assert_ne!(first_name, second_name);
    let second = read_descriptor(dest.path(), &second_name);

    // The second snapshot still reaches the old data segments, and the only
    // new segment holds its metadata log.
    let new_segments: Vec<_> = second.segments.difference(&first.segments).collect();
    assert_eq!(
        new_segments.len(),
        1,
        "expected one new metadata segment, got {new_segments:?}"
    );
    for segment in first_segments {
        assert!(second.segments.contains(&segment) || first.segments.contains(&segment));
    }

    // Old data segments are all referenced by the second snapshot.
    for segment in first.segments.iter() {
        assert!(
            second.segments.contains(segment),
            "first-run segment {segment} missing from second descriptor"
        );
    }
}

#[test]
fn descriptor_names_match_summary_files() {
    let src = TreeFixture::new();
    src.create_file("data", &pseudo_random(100_000, 5));
    let dest = TempDir::new().unwrap();

    let descriptor_name = run_snapshot(test_options(dest.path(), src.path())).unwrap();
    let descriptor = read_descriptor(dest.path(), &descriptor_name);
    let base = descriptor_name.trim_end_matches(".cumulus");

    // The checksums file is sha1sum-compatible and covers every segment.
    let sha1sums = fs::read_to_string(dest.path().join("meta").join(format!("{base}.sha1sums")))
        .unwrap();
    for line in sha1sums.lines() {
        let (hex, path) = line.split_once("  *").unwrap();
        assert_eq!(hex.len(), 40);
        assert!(path.starts_with("segments/"));
        // Verify the recorded hash against the uploaded file.
        let actual = Hash::hash_file_with("sha1", &dest.path().join(path))
            .unwrap()
            .unwrap();
        assert_eq!(actual, format!("sha1={hex}"));
    }
    assert_eq!(sha1sums.lines().count(), descriptor.segments.len());

    // The descriptor's digests cover the summary files just written.
    let checksums_digest =
        Hash::hash_file(&dest.path().join("meta").join(format!("{base}.sha1sums"))).unwrap();
    assert_eq!(descriptor.checksums, checksums_digest);
    let dbmeta_digest =
        Hash::hash_file(&dest.path().join("meta").join(format!("{base}.meta"))).unwrap();
    assert_eq!(descriptor.database_state, dbmeta_digest);

    // The dbmeta records agree with what is actually on disk.
    let dbmeta = fs::read_to_string(dest.path().join("meta").join(format!("{base}.meta"))).unwrap();
    for record in dbmeta.split("\n\n").filter(|r| !r.trim().is_empty()) {
        let field = |key: &str| {
            record
                .lines()
                .find_map(|line| line.strip_prefix(&format!("{key}: ")))
                .unwrap_or_else(|| panic!("record lacks {key}: {record}"))
                .to_owned()
        };
        let disk_size: u64 = field("disk_size").parse().unwrap();
        let actual = fs::metadata(dest.path().join(field("path"))).unwrap().len();
        assert_eq!(disk_size, actual);
        assert!(descriptor.segments.contains(&field("segment")));
    }
}

#[test]
fn symlinks_record_their_target() {
    let src = TreeFixture::new();
    src.create_symlink("link", "/a/destination");
    let dest = TempDir::new().unwrap();

    run_snapshot(test_options(dest.path(), src.path())).unwrap();

    let statcache = read_statcache(dest.path());
    assert!(statcache.contains("type: l\n"));
    assert!(statcache.contains("target: /a/destination\n"));
}

#[test]
fn upload_script_receives_all_files() {
    let src = TreeFixture::new();
    src.create_file("f", b"some contents");
    let scratch = TempDir::new().unwrap();
    let log = scratch.path().join("uploads");
    let script = format!(
        "while read line; do echo \"$line\" >> {}; echo OK; done",
        log.display()
    );

    let mut options = test_options(scratch.path().join("unused-dest").as_path(), src.path());
    options.dest = None;
    options.upload_script = Some(script);
    options.localdb = Some(scratch.path().join("localdb"));
    options.tmpdir = Some(scratch.path().to_path_buf());
    run_snapshot(options).unwrap();

    let uploads = fs::read_to_string(&log).unwrap();
    let types: Vec<&str> = uploads
        .lines()
        .map(|line| line.split(' ').nth(1).unwrap())
        .collect();
    // One data/metadata segment, two meta summary files, one descriptor.
    assert!(types.contains(&"segments"));
    assert!(types.contains(&"meta"));
    assert!(types.contains(&"snapshots"));
    // The descriptor is the last file uploaded.
    assert_eq!(*types.last().unwrap(), "snapshots");

    // The staging directory was cleaned up.
    let leftovers: Vec<_> = fs::read_dir(scratch.path())
        .unwrap()
        .filter_map(|e| {
            let name = e.unwrap().file_name().into_string().unwrap();
            name.starts_with("cumulus.").then_some(name)
        })
        .collect();
    assert!(leftovers.is_empty(), "staging dirs left behind: {leftovers:?}");
}
