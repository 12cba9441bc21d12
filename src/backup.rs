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

//! The per-inode backup driver.
//!
//! Walks the requested trees, applying the rule engine, and emits one
//! metadata record per inode. Regular file contents are read in 1 MiB
//! blocks, deduplicated whole-block against the local database, and
//! changed blocks are handed to the sub-file engine. A file whose stat
//! information matches the statcache is not read at all: the old block
//! references are reused directly.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Read;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::{FileTypeExt, MetadataExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use nix::sys::stat::{major, minor};
use tracing::warn;
use uzers::{Groups, Users, UsersCache};

use crate::format::{encode_int, uri_encode, IntBase};
use crate::hashes::Hash;
use crate::localdb::LocalDb;
use crate::metadata::{Dictionary, MetadataWriter, StatFields};
use crate::reference::ObjectReference;
use crate::remote::RemoteStore;
use crate::rules::PathFilterList;
use crate::store::SegmentStore;
use crate::subfile::Subfile;
use crate::{Result, BLOCK_SIZE};

/// Entries whose ctime/mtime is within this many seconds of the snapshot
/// are marked volatile: their statcache entry is never trusted next time.
const VOLATILE_WINDOW: i64 = 30;

/// Caches uid/gid renderings, one lookup per distinct id.
struct OwnerCache {
    users: HashMap<u32, String>,
    groups: HashMap<u32, String>,
    cache: UsersCache,
}

impl OwnerCache {
    fn new() -> OwnerCache {
        OwnerCache {
            users: HashMap::new(),
            groups: HashMap::new(),
            cache: UsersCache::new(),
        }
    }

    fn user_to_string(&mut self, uid: u32) -> String {
        if let Some(cached) = self.users.get(&uid) {
            return cached.clone();
        }
        let mut result = encode_int(uid as i64, IntBase::Decimal);
        if let Some(user) = self.cache.get_user_by_uid(uid) {
            result.push_str(&format!(" ({})", uri_encode(user.name().as_bytes())));
        }
        self.users.insert(uid, result.clone());
        result
    }

    fn group_to_string(&mut self, gid: u32) -> String {
        if let Some(cached) = self.groups.get(&gid) {
            return cached.clone();
        }
        let mut result = encode_int(gid as i64, IntBase::Decimal);
        if let Some(group) = self.cache.get_group_by_gid(gid) {
            result.push_str(&format!(" ({})", uri_encode(group.name().as_bytes())));
        }
        self.groups.insert(gid, result.clone());
        result
    }
}

/// Driver state for one snapshot run.
///
/// Owns every engine component, threading them through the traversal
/// explicitly rather than through process-wide state.
pub struct Backup {
    remote: RemoteStore,
    db: LocalDb,
    store: SegmentStore,
    metawriter: MetadataWriter,
    rules: PathFilterList,
    verbose: bool,
    rebuild_statcache: bool,
    block_buf: Vec<u8>,
    owners: OwnerCache,
}

/// Convert a filesystem path to its metadata-log form: relative, with the
/// root spelled `.`.
fn metafile_path(path: &[u8]) -> Vec<u8> {
    let path = path.strip_prefix(b"/").unwrap_or(path);
    if path.is_empty() {
        b".".to_vec()
    } else {
        path.to_vec()
    }
}

/// Open a regular file for reading without following a symlink or hanging
/// on a FIFO that may have replaced it, then confirm via the open handle
/// that it is still a regular file.
fn safe_open(path: &Path) -> Option<(File, fs::Metadata)> {
    let open_with = |flags: libc::c_int| {
        OpenOptions::new()
            .read(true)
            .custom_flags(flags)
            .open(path)
    };
    // O_NOATIME avoids inode writeback but needs ownership; retry without
    // it on failure.
    let file = open_with(libc::O_NOFOLLOW | libc::O_NONBLOCK | libc::O_NOATIME)
        .or_else(|_| open_with(libc::O_NOFOLLOW | libc::O_NONBLOCK));
    let file = match file {
        Ok(file) => file,
        Err(err) => {
            warn!("Unable to open file {}: {err}", path.display());
            return None;
        }
    };

    // O_NONBLOCK was only wanted for the open itself.
    if let Ok(flags) = nix::fcntl::fcntl(file.as_raw_fd(), nix::fcntl::FcntlArg::F_GETFL) {
        let flags = nix::fcntl::OFlag::from_bits_truncate(flags) & !nix::fcntl::OFlag::O_NONBLOCK;
        let _ = nix::fcntl::fcntl(file.as_raw_fd(), nix::fcntl::FcntlArg::F_SETFL(flags));
    }

    let metadata = match file.metadata() {
        Ok(metadata) => metadata,
        Err(err) => {
            warn!("fstat {}: {err}", path.display());
            return None;
        }
    };
    if !metadata.file_type().is_file() {
        warn!("{} is no longer a regular file", path.display());
        return None;
    }
    Some((file, metadata))
}

/// Read until the buffer is full or end-of-file; a short count only means
/// EOF.
fn file_read(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

fn stat_fields(metadata: &fs::Metadata) -> StatFields {
    StatFields {
        ctime: metadata.ctime(),
        mtime: metadata.mtime(),
        size: metadata.size() as i64,
        inode: format!(
            "{}/{}/{}",
            major(metadata.dev()),
            minor(metadata.dev()),
            metadata.ino()
        ),
    }
}

impl Backup {
    pub fn new(
        remote: RemoteStore,
        db: LocalDb,
        store: SegmentStore,
        metawriter: MetadataWriter,
        rules: PathFilterList,
        verbose: bool,
        rebuild_statcache: bool,
    ) -> Backup {
        Backup {
            remote,
            db,
            store,
            metawriter,
            rules,
            verbose,
            rebuild_statcache,
            block_buf: vec![0; BLOCK_SIZE],
            owners: OwnerCache::new(),
        }
    }

    /// Walk one command-line path.
    pub fn scan_path(&mut self, path: &Path) -> Result<()> {
        self.scanfile(path.as_os_str().as_bytes())
    }

    /// Close the metadata log and all open segments.
    ///
    /// Returns the root reference plus the components the orchestrator
    /// still needs for descriptor emission.
    pub fn finish(self) -> Result<(ObjectReference, RemoteStore, LocalDb, SegmentStore)> {
        let Backup {
            remote,
            db,
            mut store,
            metawriter,
            ..
        } = self;
        let root = metawriter.close(&mut store, &remote, &db)?;
        store.sync(&remote, &db)?;
        Ok((root, remote, db, store))
    }

    fn scanfile(&mut self, path: &[u8]) -> Result<()> {
        let fs_path = PathBuf::from(std::ffi::OsString::from_vec(path.to_vec()));
        let output_path = metafile_path(path);

        let metadata = match fs::symlink_metadata(&fs_path) {
            Ok(metadata) => metadata,
            Err(err) => {
                warn!("lstat({}): {err}", fs_path.display());
                return Ok(());
            }
        };
        let is_directory = metadata.file_type().is_dir();
        if !self.rules.is_included(&output_path, is_directory) {
            return Ok(());
        }

        if metadata.file_type().is_file() {
            // Re-stat through the opened descriptor; the file may have been
            // swapped out from under us since the lstat.
            let Some((mut file, metadata)) = safe_open(&fs_path) else {
                return Ok(());
            };
            self.dump_inode(&output_path, &fs_path, &metadata, Some(&mut file))?;
        } else {
            self.dump_inode(&output_path, &fs_path, &metadata, None)?;
        }

        if is_directory {
            self.scan_directory(path, &output_path)?;
        }
        Ok(())
    }

    fn scan_directory(&mut self, path: &[u8], output_path: &[u8]) -> Result<()> {
        let fs_path = PathBuf::from(std::ffi::OsString::from_vec(path.to_vec()));
        let dir = match fs::read_dir(&fs_path) {
            Ok(dir) => dir,
            Err(err) => {
                warn!("Error reading directory {}: {err}", fs_path.display());
                return Ok(());
            }
        };
        let mut contents: Vec<Vec<u8>> = Vec::new();
        for entry in dir {
            match entry {
                Ok(entry) => contents.push(entry.file_name().as_bytes().to_vec()),
                Err(err) => {
                    warn!("Error reading directory {}: {err}", fs_path.display());
                    return Ok(());
                }
            }
        }
        contents.sort();

        let child_path = |name: &[u8]| -> Vec<u8> {
            if path == b"." {
                name.to_vec()
            } else if path == b"/" {
                let mut p = b"/".to_vec();
                p.extend_from_slice(name);
                p
            } else {
                let mut p = path.to_vec();
                p.push(b'/');
                p.extend_from_slice(name);
                p
            }
        };

        self.rules.save();

        // First pass: load any per-directory rule files, so they apply to
        // everything scanned in the second pass.
        for name in &contents {
            let child = child_path(name);
            if self.rules.is_mergefile(&metafile_path(&child)) {
                if self.verbose {
                    println!(
                        "Merging directory filter rules {}",
                        String::from_utf8_lossy(&child)
                    );
                }
                self.try_merge_filter(&child, output_path)?;
            }
        }

        // Second pass: recurse; scanfile re-checks inclusion per entry.
        for name in &contents {
            self.scanfile(&child_path(name))?;
        }

        self.rules.restore();
        Ok(())
    }

    fn try_merge_filter(&mut self, path: &[u8], basedir: &[u8]) -> Result<()> {
        let fs_path = PathBuf::from(std::ffi::OsString::from_vec(path.to_vec()));
        let Ok(metadata) = fs::symlink_metadata(&fs_path) else {
            return Ok(());
        };
        if !metadata.file_type().is_file() {
            return Ok(());
        }
        let Some((mut file, _metadata)) = safe_open(&fs_path) else {
            return Ok(());
        };
        let bytes = match file_read(&mut file, &mut self.block_buf) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!("Unable to read filter merge file: {err}");
                return Ok(());
            }
        };
        // A crude complexity bound: a rule file bigger than one block is
        // not parsed at all.
        if bytes >= BLOCK_SIZE - 1 {
            warn!("Unable to read filter merge file (possibly size too large)");
            return Ok(());
        }
        self.rules.merge_patterns(
            &metafile_path(path),
            basedir,
            &self.block_buf[..bytes],
        );
        Ok(())
    }

    /// Emit the metadata record for one inode, dumping file contents if it
    /// is a regular file.
    fn dump_inode(
        &mut self,
        output_path: &[u8],
        fs_path: &Path,
        metadata: &fs::Metadata,
        file: Option<&mut File>,
    ) -> Result<()> {
        if self.verbose {
            println!("{}", String::from_utf8_lossy(output_path));
        }
        self.metawriter.find(output_path);

        let mut info = Dictionary::new();
        info.insert("name".into(), uri_encode(output_path));
        info.insert(
            "mode".into(),
            encode_int((metadata.mode() & 0o7777) as i64, IntBase::Octal),
        );
        info.insert(
            "ctime".into(),
            encode_int(metadata.ctime(), IntBase::Decimal),
        );
        info.insert(
            "mtime".into(),
            encode_int(metadata.mtime(), IntBase::Decimal),
        );
        info.insert("user".into(), self.owners.user_to_string(metadata.uid()));
        info.insert("group".into(), self.owners.group_to_string(metadata.gid()));

        let file_type = metadata.file_type();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        if (now - metadata.ctime() < VOLATILE_WINDOW || now - metadata.mtime() < VOLATILE_WINDOW)
            && !file_type.is_dir()
        {
            info.insert("volatile".into(), "1".into());
        }

        if metadata.nlink() > 1 && !file_type.is_dir() {
            info.insert(
                "links".into(),
                encode_int(metadata.nlink() as i64, IntBase::Decimal),
            );
        }

        info.insert(
            "inode".into(),
            format!(
                "{}/{}/{}",
                major(metadata.dev()),
                minor(metadata.dev()),
                metadata.ino()
            ),
        );

        let inode_type: char;
        if file_type.is_fifo() {
            inode_type = 'p';
        } else if file_type.is_socket() {
            inode_type = 's';
        } else if file_type.is_block_device() || file_type.is_char_device() {
            inode_type = if file_type.is_block_device() { 'b' } else { 'c' };
            info.insert(
                "device".into(),
                format!("{}/{}", major(metadata.rdev()), minor(metadata.rdev())),
            );
        } else if file_type.is_symlink() {
            inode_type = 'l';
            match fs::read_link(fs_path) {
                Ok(target) => {
                    let target = target.into_os_string().into_vec();
                    if target.len() as u64 <= metadata.size() {
                        info.insert("target".into(), uri_encode(&target));
                    } else {
                        warn!("error reading symlink {}: name truncated", fs_path.display());
                    }
                }
                Err(err) => warn!("error reading symlink {}: {err}", fs_path.display()),
            }
        } else if file_type.is_file() {
            inode_type = 'f';
            let file = file.expect("regular files arrive with an open handle");
            let file_size = self.dumpfile(file, &mut info, output_path, metadata)?;
            info.insert(
                "size".into(),
                encode_int(file_size as i64, IntBase::Decimal),
            );
            if file_size != metadata.size() {
                warn!("Size of {} changed during reading", fs_path.display());
                info.insert("volatile".into(), "1".into());
            }
        } else if file_type.is_dir() {
            inode_type = 'd';
        } else {
            warn!("Unknown inode type: mode={:o}", metadata.mode());
            return Ok(());
        }

        info.insert("type".into(), inode_type.to_string());
        self.metawriter
            .add(info, &mut self.store, &self.remote, &self.db)
    }

    /// Store a regular file's contents and fill in `checksum` and `data`.
    ///
    /// Returns the number of bytes actually read.
    fn dumpfile(
        &mut self,
        file: &mut File,
        info: &mut Dictionary,
        output_path: &[u8],
        metadata: &fs::Metadata,
    ) -> Result<u64> {
        let fields = stat_fields(metadata);
        let mut object_list: Vec<String> = Vec::new();
        let mut status: Option<&str> = None;
        let mut size: u64 = 0;

        let found = self.metawriter.find(output_path);
        let old_blocks = if found {
            self.metawriter.get_blocks()
        } else {
            Vec::new()
        };

        // Statcache fast path: an unchanged file whose old blocks are all
        // still live is not read at all.
        let mut cached = false;
        if found && !self.rebuild_statcache && self.metawriter.is_unchanged(&fields) {
            cached = true;
            for reference in &old_blocks {
                if !self.db.is_available(reference)? {
                    cached = false;
                    status = Some("repack");
                    break;
                }
            }
            if cached {
                info.insert(
                    "checksum".into(),
                    self.metawriter.get_checksum().unwrap_or_default().to_owned(),
                );
                for reference in &old_blocks {
                    object_list.push(reference.to_string());
                    self.db.use_object(reference)?;
                }
                size = metadata.size();
            }
        }

        if !cached {
            let mut file_hash = Hash::new_default();
            let mut subfile = Subfile::new();
            subfile.load_old_blocks(&self.db, &old_blocks)?;

            loop {
                let bytes = match file_read(file, &mut self.block_buf) {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        warn!(
                            "Backup contents for {} may be incorrect: {err}",
                            String::from_utf8_lossy(output_path)
                        );
                        break;
                    }
                };
                if bytes == 0 {
                    break;
                }
                let block = &self.block_buf[..bytes];
                file_hash.update(block);

                // Sparse file handling: blocks of all zeroes become a
                // synthetic reference and are never stored.
                let all_zero = block.iter().all(|&b| b == 0);

                let mut block_hash = Hash::new_default();
                block_hash.update(block);
                let block_csum = block_hash.digest_str();

                let existing = if all_zero {
                    let mut reference = ObjectReference::zero();
                    reference.set_range(0, bytes as u64, false);
                    Some(reference)
                } else {
                    self.db.find_object(&block_csum, bytes as u64)?
                };

                let mut refs: Vec<ObjectReference> = Vec::new();
                match existing {
                    None => {
                        // The checksum may still be known from a block that
                        // was stored in a segment since marked for cleaning.
                        // Rewritten copies of such data get grouped by the
                        // expired group number, and keep their original age,
                        // so segments stay homogeneous in age.
                        let mut block_age = 0.0;
                        let group;
                        match self.db.is_old_object(&block_csum, bytes as u64)? {
                            Some(old) => {
                                block_age = old.age;
                                match old.expired_group {
                                    None | Some(0) => group = "data".to_owned(),
                                    Some(n) => group = format!("compacted-{n}"),
                                }
                                if status.is_none() {
                                    status = Some("partial");
                                }
                            }
                            None => {
                                group = "data".to_owned();
                                status = Some("new");
                            }
                        }
                        subfile.analyze_new_block(block);
                        refs = subfile.create_incremental(
                            &mut self.store,
                            &self.remote,
                            &self.db,
                            block,
                            &group,
                            Some(block_csum),
                            block_age,
                        )?;
                    }
                    Some(reference) => {
                        if self.rebuild_statcache && reference.is_normal() {
                            subfile.analyze_new_block(block);
                            subfile.store_analyzed_signatures(&self.db, &reference)?;
                        }
                        refs.push(reference);
                    }
                }

                for mut reference in refs {
                    // The file-level checksum guards integrity; per-object
                    // checksums would only bloat the metadata log.
                    reference.clear_checksum();
                    object_list.push(reference.to_string());
                    self.db.use_object(&reference)?;
                }
                size += bytes as u64;

                if status.is_none() {
                    status = Some("old");
                }
            }

            info.insert("checksum".into(), file_hash.digest_str());
        }

        // If the file still looks unchanged but hashes differently than
        // the statcache recorded, something is wrong with the disk.
        if found && self.metawriter.is_unchanged(&fields) {
            if let Some(old_checksum) = self.metawriter.get_checksum() {
                if let Some(new_checksum) = info.get("checksum") {
                    if !old_checksum.is_empty() && old_checksum != new_checksum {
                        warn!(
                            "Checksum for {} does not match expected value\n\
                                 expected: {old_checksum}\n\
                                 actual:   {new_checksum}",
                            String::from_utf8_lossy(output_path),
                        );
                    }
                }
            }
        }

        if self.verbose {
            if let Some(status) = status {
                println!("    [{status}]");
            }
        }

        info.insert("data".into(), object_list.join("\n    "));
        Ok(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metafile_path_normalisation() {
        assert_eq!(metafile_path(b"/home/user"), b"home/user".to_vec());
        assert_eq!(metafile_path(b"home/user"), b"home/user".to_vec());
        assert_eq!(metafile_path(b"/"), b".".to_vec());
        assert_eq!(metafile_path(b"."), b".".to_vec());
    }

    #[test]
    fn owner_strings_have_id_and_name() {
        let mut owners = OwnerCache::new();
        let rendered = owners.user_to_string(0);
        assert!(rendered.starts_with('0'), "got {rendered}");
        // Cached second lookup returns the identical string.
        assert_eq!(owners.user_to_string(0), rendered);
        // A uid that can't resolve still renders its number.
        assert_eq!(owners.user_to_string(4_000_000_000), "4000000000");
    }
}
