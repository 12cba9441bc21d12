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

//! Filter subprocesses.
//!
//! Segment data and the snapshot descriptor are piped through an external
//! program (a compressor, an encryption wrapper, a signer) on their way to
//! a staging file. The filter is a `/bin/sh -c` child whose stdout is the
//! staging file; writes to the [FileFilter] feed its stdin. An empty or
//! absent program means no filtering, and writes go straight to the file.

use std::fs::File;
use std::io::{self, Write};
use std::process::{Child, Command, Stdio};

use crate::errors::Error;
use crate::Result;

enum Sink {
    Direct(File),
    Piped(std::process::ChildStdin),
}

/// A write handle whose output is optionally passed through a filter
/// program before reaching the destination file.
pub struct FileFilter {
    sink: Option<Sink>,
    child: Option<Child>,
    program: String,
}

impl FileFilter {
    /// Wrap `output`, spawning `program` if one is given.
    ///
    /// `program` is run via `/bin/sh -c`, with stdout connected to
    /// `output`. `None` or an empty string installs no filter.
    pub fn new(output: File, program: Option<&str>) -> Result<FileFilter> {
        let program = program.unwrap_or("");
        if program.is_empty() {
            return Ok(FileFilter {
                sink: Some(Sink::Direct(output)),
                child: None,
                program: String::new(),
            });
        }

        let mut child = Command::new("/bin/sh")
            .arg("-c")
            .arg(program)
            .stdin(Stdio::piped())
            .stdout(Stdio::from(output))
            .spawn()
            .map_err(|source| Error::FilterSpawn {
                program: program.to_owned(),
                source,
            })?;
        let stdin = child.stdin.take().expect("filter child stdin is piped");
        Ok(FileFilter {
            sink: Some(Sink::Piped(stdin)),
            child: Some(child),
            program: program.to_owned(),
        })
    }

    /// Close the write side and wait for the filter to finish.
    ///
    /// The pipe must be closed before waiting or the child would block
    /// forever on its stdin. A non-zero filter exit is fatal.
    pub fn finish(mut self) -> Result<()> {
        self.finish_inner()
    }

    fn finish_inner(&mut self) -> Result<()> {
        if let Some(mut sink) = self.sink.take() {
            let result = match &mut sink {
                Sink::Direct(f) => f.flush(),
                Sink::Piped(p) => p.flush(),
            };
            result.map_err(|source| Error::SegmentWrite { source })?;
        }
        if let Some(mut child) = self.child.take() {
            let status = child.wait().map_err(|source| Error::FilterSpawn {
                program: self.program.clone(),
                source,
            })?;
            if !status.success() {
                return Err(Error::FilterExited {
                    program: self.program.clone(),
                    status: status.code().unwrap_or(-1),
                });
            }
        }
        Ok(())
    }
}

impl Write for FileFilter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.sink.as_mut() {
            Some(Sink::Direct(f)) => f.write(buf),
            Some(Sink::Piped(p)) => p.write(buf),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "filter closed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.sink.as_mut() {
            Some(Sink::Direct(f)) => f.flush(),
            Some(Sink::Piped(p)) => p.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for FileFilter {
    fn drop(&mut self) {
        // Normal shutdown goes through finish(); this only reaps the child
        // when the filter is dropped on an error path.
        let _ = self.sink.take();
        if let Some(mut child) = self.child.take() {
            let _ = child.wait();
        }
    }
}
