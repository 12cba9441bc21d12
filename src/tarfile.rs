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

//! A segment on its way to the server: a TAR stream of numbered objects,
//! piped through the configured filter into a staging file.
//!
//! Objects are written whole; each gets a fresh 512-byte ustar header, data
//! padded to a 512-byte boundary, and the stream ends with the standard two
//! zero blocks before the filter pipe is closed. Member paths are
//! `<segment-uuid>/<8-hex-sequence>` with mode 0600 and numeric owner 0.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use tar::{EntryType, Header};

use crate::errors::Error;
use crate::filter::FileFilter;
use crate::Result;

struct CountingWriter {
    inner: FileFilter,
    bytes_written: u64,
}

impl Write for CountingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.bytes_written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// An open, partially written segment file.
pub struct Tarfile {
    builder: tar::Builder<CountingWriter>,
    segment_name: String,
    local_path: PathBuf,
}

impl Tarfile {
    /// Start a new segment TAR stream.
    ///
    /// `file` is the staging file (usually from a
    /// [RemoteFile](crate::remote::RemoteFile)); `local_path` is its path,
    /// used to watch the on-disk size while the filter runs.
    pub fn new(
        file: File,
        local_path: PathBuf,
        segment_name: &str,
        filter_program: Option<&str>,
    ) -> Result<Tarfile> {
        let filter = FileFilter::new(file, filter_program)?;
        Ok(Tarfile {
            builder: tar::Builder::new(CountingWriter {
                inner: filter,
                bytes_written: 0,
            }),
            segment_name: segment_name.to_owned(),
            local_path,
        })
    }

    pub fn segment_name(&self) -> &str {
        &self.segment_name
    }

    /// Append object number `id` with the given contents.
    pub fn write_object(&mut self, id: u32, data: &[u8]) -> Result<()> {
        let mut header = Header::new_ustar();
        header
            .set_path(format!("{}/{:08x}", self.segment_name, id))
            .map_err(|source| Error::SegmentWrite { source })?;
        header.set_entry_type(EntryType::Regular);
        header.set_mode(0o600);
        header.set_uid(0);
        header.set_gid(0);
        header.set_size(data.len() as u64);
        header.set_mtime(
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        );
        header.set_cksum();
        self.builder
            .append(&header, data)
            .map_err(|source| Error::SegmentWrite { source })
    }

    /// Estimated size of the finished segment file.
    ///
    /// While the filter buffers, the staging file lags behind what has been
    /// fed in; assume a filter will not compress better than 128:1 so the
    /// estimate never collapses to zero.
    pub fn size_estimate(&self) -> u64 {
        let on_disk = fs::metadata(&self.local_path).map(|m| m.len()).unwrap_or(0);
        on_disk.max(self.builder.get_ref().bytes_written / 128)
    }

    /// Write the TAR end-of-archive marker, close the filter pipe, and wait
    /// for the filter to exit.
    pub fn finish(self) -> Result<()> {
        let writer = self
            .builder
            .into_inner()
            .map_err(|source| Error::SegmentWrite { source })?;
        writer.inner.finish()
    }
}
