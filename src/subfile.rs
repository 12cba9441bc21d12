// Cumulus backup system.
// Copyright 2008 The Cumulus Developers.

// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

//! Sub-file incremental backups.
//!
//! When a block of a file has changed, its content-defined chunks are
//! matched against chunk signatures recorded for blocks stored by earlier
//! snapshots. Matching chunks become references into old objects; the
//! remaining literal bytes are packed into one new object. Only blocks of
//! at least 16 KiB get their signatures saved, which keeps the signature
//! table from filling up with tiny blocks.

use std::collections::{BTreeSet, HashMap};

use crate::chunker::{self, chunk_spans};
use crate::hashes::{Hash, DEFAULT_ALGORITHM};
use crate::localdb::LocalDb;
use crate::reference::ObjectReference;
use crate::remote::RemoteStore;
use crate::store::SegmentStore;
use crate::Result;

/// Minimum block size for which chunk signatures are worth storing.
const MIN_SIGNATURE_BLOCK_SIZE: usize = 16384;

#[derive(Clone, Debug)]
struct ChunkInfo {
    hash: Vec<u8>,
    offset: usize,
    len: usize,
}

struct BlockSummary {
    reference: ObjectReference,
    chunks: Vec<ChunkInfo>,
}

struct Analysis {
    len: usize,
    chunks: Vec<ChunkInfo>,
}

/// Matches new data against chunks of previously stored blocks.
///
/// One `Subfile` serves one file being backed up: feed it the file's old
/// block references, then analyze and store each changed block in turn.
pub struct Subfile {
    algorithm: String,
    hash_size: usize,
    old_blocks: BTreeSet<ObjectReference>,
    signatures_loaded: bool,
    blocks: Vec<BlockSummary>,
    chunk_index: HashMap<Vec<u8>, (usize, usize)>,
    analysis: Option<Analysis>,
}

enum Item {
    Copy {
        reference: ObjectReference,
    },
    New {
        src_offset: usize,
        dst_offset: usize,
        len: usize,
        hash: Vec<u8>,
        reference: Option<ObjectReference>,
    },
}

impl Subfile {
    pub fn new() -> Subfile {
        let hash = Hash::new_default();
        Subfile {
            algorithm: format!("{}/{}", chunker::ALGORITHM_NAME, DEFAULT_ALGORITHM),
            hash_size: hash.digest_size(),
            old_blocks: BTreeSet::new(),
            signatures_loaded: false,
            blocks: Vec::new(),
            chunk_index: HashMap::new(),
            analysis: None,
        }
    }

    /// Add old blocks whose chunks may be reused. Only normal references
    /// matter; signatures are read lazily on first use.
    pub fn load_old_blocks(&mut self, db: &LocalDb, blocks: &[ObjectReference]) -> Result<()> {
        for block in blocks {
            if !block.is_normal() {
                continue;
            }
            let base = block.base();
            if self.old_blocks.insert(base.clone()) && self.signatures_loaded {
                self.index_chunks(db, &base)?;
            }
        }
        Ok(())
    }

    /// Read one block's chunk signatures from the database and index them.
    fn index_chunks(&mut self, db: &LocalDb, reference: &ObjectReference) -> Result<()> {
        if !db.is_available(reference)? {
            return Ok(());
        }
        let Some((packed, algorithm)) = db.load_chunk_signatures(reference)? else {
            return Ok(());
        };
        if algorithm != self.algorithm {
            return Ok(());
        }

        let entry_size = 2 + self.hash_size;
        let block_id = self.blocks.len();
        let mut chunks = Vec::with_capacity(packed.len() / entry_size);
        let mut offset = 0;
        for (chunk_id, entry) in packed.chunks_exact(entry_size).enumerate() {
            let len = u16::from_be_bytes([entry[0], entry[1]]) as usize;
            let hash = entry[2..].to_vec();
            self.chunk_index.insert(hash.clone(), (block_id, chunk_id));
            chunks.push(ChunkInfo { hash, offset, len });
            offset += len;
        }
        self.blocks.push(BlockSummary {
            reference: reference.clone(),
            chunks,
        });
        Ok(())
    }

    fn ensure_signatures_loaded(&mut self, db: &LocalDb) -> Result<()> {
        if self.signatures_loaded {
            return Ok(());
        }
        for block in self.old_blocks.clone() {
            self.index_chunks(db, &block)?;
        }
        self.signatures_loaded = true;
        Ok(())
    }

    /// Chunk a new block and compute per-chunk hashes.
    pub fn analyze_new_block(&mut self, buf: &[u8]) {
        let spans = chunk_spans(buf);
        if spans.is_empty() {
            self.analysis = None;
            return;
        }
        let chunks = spans
            .iter()
            .map(|span| {
                let mut hash = Hash::new_default();
                hash.update(&buf[span.offset..span.offset + span.len]);
                ChunkInfo {
                    hash: hash.digest().to_vec(),
                    offset: span.offset,
                    len: span.len,
                }
            })
            .collect();
        self.analysis = Some(Analysis {
            len: buf.len(),
            chunks,
        });
    }

    fn store_block_signatures(
        &self,
        db: &LocalDb,
        reference: &ObjectReference,
        chunks: &[ChunkInfo],
    ) -> Result<()> {
        let mut packed = Vec::with_capacity(chunks.len() * (2 + self.hash_size));
        for chunk in chunks {
            debug_assert!(chunk.len <= u16::MAX as usize);
            packed.extend_from_slice(&(chunk.len as u16).to_be_bytes());
            packed.extend_from_slice(&chunk.hash);
        }
        db.store_chunk_signatures(reference, &packed, &self.algorithm)
    }

    /// Save the most recent analysis as the signatures of `reference`, if
    /// the block is large enough to bother.
    pub fn store_analyzed_signatures(
        &self,
        db: &LocalDb,
        reference: &ObjectReference,
    ) -> Result<()> {
        let Some(analysis) = &self.analysis else {
            return Ok(());
        };
        if analysis.len >= MIN_SIGNATURE_BLOCK_SIZE {
            self.store_block_signatures(db, reference, &analysis.chunks)?;
        }
        Ok(())
    }

    /// Produce an incremental representation of the last analyzed block.
    ///
    /// Chunks found in indexed old blocks become references into them; the
    /// rest is concatenated into a single literal object in the `data`
    /// group. If nothing matches, the entire buffer is stored as one
    /// object in `group` with the given `checksum` and `age`. Adjacent
    /// references in the result are merged.
    pub fn create_incremental(
        &mut self,
        store: &mut SegmentStore,
        remote: &RemoteStore,
        db: &LocalDb,
        buf: &[u8],
        group: &str,
        checksum: Option<String>,
        age: f64,
    ) -> Result<Vec<ObjectReference>> {
        self.ensure_signatures_loaded(db)?;
        let analysis = self.analysis.as_ref().expect("block has been analyzed");
        assert!(!analysis.chunks.is_empty());

        let mut items: Vec<Item> = Vec::with_capacity(analysis.chunks.len());
        let mut matched_old = false;
        let mut new_data = 0usize;

        for chunk in &analysis.chunks {
            match self.chunk_index.get(&chunk.hash) {
                Some(&(block_id, chunk_id)) => {
                    let block = &self.blocks[block_id];
                    let old_chunk = &block.chunks[chunk_id];
                    let mut reference = block.reference.clone();
                    reference.set_range(old_chunk.offset as u64, old_chunk.len as u64, false);
                    matched_old = true;
                    items.push(Item::Copy { reference });
                }
                None => {
                    items.push(Item::New {
                        src_offset: chunk.offset,
                        dst_offset: new_data,
                        len: chunk.len,
                        hash: chunk.hash.clone(),
                        reference: None,
                    });
                    new_data += chunk.len;
                }
            }
        }

        // Nothing matched: the block goes out whole, and its own chunk
        // signatures are worth keeping for next time.
        if !matched_old {
            let reference = store.write_object(remote, db, buf, group, checksum, age)?;
            self.store_analyzed_signatures(db, &reference)?;
            return Ok(vec![reference]);
        }

        // Collect the literal bytes into one new object and point the NEW
        // items into it.
        if new_data > 0 {
            let mut literal = Vec::with_capacity(new_data);
            for item in &items {
                if let Item::New {
                    src_offset, len, ..
                } = item
                {
                    literal.extend_from_slice(&buf[*src_offset..*src_offset + *len]);
                }
            }
            debug_assert_eq!(literal.len(), new_data);
            let literal_ref = store.write_object(remote, db, &literal, "data", None, 0.0)?;

            let mut new_chunks = Vec::new();
            for item in &mut items {
                if let Item::New {
                    dst_offset,
                    len,
                    hash,
                    reference,
                    ..
                } = item
                {
                    let mut r = literal_ref.base();
                    r.set_range(*dst_offset as u64, *len as u64, false);
                    *reference = Some(r);
                    new_chunks.push(ChunkInfo {
                        hash: hash.clone(),
                        offset: *dst_offset,
                        len: *len,
                    });
                }
            }
            self.store_block_signatures(db, &literal_ref, &new_chunks)?;
        }

        // Walk the item list in order, merging adjacent references.
        let mut refs = Vec::new();
        let mut current = ObjectReference::null();
        for item in &items {
            let reference = match item {
                Item::Copy { reference } => reference,
                Item::New { reference, .. } => {
                    reference.as_ref().expect("new item has been patched")
                }
            };
            if !current.merge(reference) {
                refs.push(current);
                current = reference.clone();
            }
        }
        assert!(!current.is_null());
        refs.push(current);
        Ok(refs)
    }
}

impl Default for Subfile {
    fn default() -> Self {
        Subfile::new()
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use crate::localdb::LocalDb;
    use crate::store::{SegmentConfig, SegmentStore};

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

    fn test_data(len: usize, seed: u64) -> Vec<u8> {
        let mut state = seed;
        let mut out = Vec::with_capacity(len);
        for _ in 0..len {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            out.push((state >> 33) as u8);
        }
        out
    }

    fn finish(mut store: SegmentStore, remote: RemoteStore, db: LocalDb) {
        store.sync(&remote, &db).unwrap();
        remote.sync().unwrap();
        db.close().unwrap();
    }

    #[test]
    fn unmatched_block_is_stored_whole() {
        let (_dir, remote, db, mut store) = fixture();
        let data = test_data(100_000, 1);
        let mut subfile = Subfile::new();
        subfile.analyze_new_block(&data);
        let refs = subfile
            .create_incremental(&mut store, &remote, &db, &data, "data", None, 0.0)
            .unwrap();
        assert_eq!(refs.len(), 1);
        assert!(refs[0].range_is_exact());
        assert_eq!(refs[0].range_length(), 100_000);
        // Signatures were saved for this block (it exceeds 16 KiB).
        assert!(db.load_chunk_signatures(&refs[0].base()).unwrap().is_some());
        finish(store, remote, db);
    }

    #[test]
    fn small_blocks_do_not_get_signatures() {
        let (_dir, remote, db, mut store) = fixture();
        let data = test_data(4_000, 2);
        let mut subfile = Subfile::new();
        subfile.analyze_new_block(&data);
        let refs = subfile
            .create_incremental(&mut store, &remote, &db, &data, "data", None, 0.0)
            .unwrap();
        assert_eq!(refs.len(), 1);
        assert!(db.load_chunk_signatures(&refs[0].base()).unwrap().is_none());
        finish(store, remote, db);
    }

    #[test]
    fn identical_block_becomes_one_merged_copy() {
        let (_dir, remote, db, mut store) = fixture();
        let data = test_data(100_000, 3);

        let mut first = Subfile::new();
        first.analyze_new_block(&data);
        let old_refs = first
            .create_incremental(&mut store, &remote, &db, &data, "data", None, 0.0)
            .unwrap();

        let mut second = Subfile::new();
        second.load_old_blocks(&db, &old_refs).unwrap();
        second.analyze_new_block(&data);
        let refs = second
            .create_incremental(&mut store, &remote, &db, &data, "data", None, 0.0)
            .unwrap();

        // Every chunk matched; the adjacent copies merge into one range
        // covering the old object.
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].basename(), old_refs[0].basename());
        assert!(!refs[0].range_is_exact());
        assert_eq!(refs[0].range_start(), 0);
        assert_eq!(refs[0].range_length(), 100_000);
        finish(store, remote, db);
    }

    #[test]
    fn changed_tail_stores_only_new_chunks() {
        let (_dir, remote, db, mut store) = fixture();
        let data = test_data(120_000, 4);

        let mut first = Subfile::new();
        first.analyze_new_block(&data);
        let old_refs = first
            .create_incremental(&mut store, &remote, &db, &data, "data", None, 0.0)
            .unwrap();
        let old_segment = old_refs[0].segment().to_owned();

        // Keep the first 80 KB, replace the tail with fresh data.
        let mut changed = data[..80_000].to_vec();
        changed.extend_from_slice(&test_data(40_000, 999));

        let mut second = Subfile::new();
        second.load_old_blocks(&db, &old_refs).unwrap();
        second.analyze_new_block(&changed);
        let refs = second
            .create_incremental(&mut store, &remote, &db, &changed, "data", None, 0.0)
            .unwrap();

        let copied: u64 = refs
            .iter()
            .filter(|r| r.segment() == old_segment)
            .map(|r| r.range_length())
            .sum();
        let fresh: u64 = refs
            .iter()
            .filter(|r| r.segment() != old_segment)
            .map(|r| r.range_length())
            .sum();
        assert_eq!(copied + fresh, 120_000);
        assert!(
            copied >= 60_000,
            "most of the unchanged prefix should be reused, copied only {copied}"
        );
        assert!(fresh >= 40_000, "the changed tail must be stored");
        finish(store, remote, db);
    }
}
