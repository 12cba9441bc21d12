// Cumulus backup system.
// Copyright 2012 The Cumulus Developers.

// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

//! Named digest algorithms.
//!
//! Checksums appear throughout the formats as `name=hexdigest` strings, so
//! hashes are looked up by name and remember their name. SHA-1 is kept for
//! compatibility with the historical segment checksum files; `sha224` is
//! the default for new content.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use sha1::Sha1;
use sha2::{Digest, Sha224};

/// Name of the algorithm used when no explicit choice is made.
pub const DEFAULT_ALGORITHM: &str = "sha224";

enum State {
    Sha1(Sha1),
    Sha224(Sha224),
    /// Finalized digest bytes; reached on the first call to [Hash::digest].
    Done(Vec<u8>),
}

/// An incremental digest bound to a named algorithm.
pub struct Hash {
    name: &'static str,
    state: State,
}

impl Hash {
    /// Look up an algorithm by name. Returns `None` for unknown names.
    pub fn new(algorithm: &str) -> Option<Hash> {
        match algorithm {
            "sha1" => Some(Hash {
                name: "sha1",
                state: State::Sha1(Sha1::new()),
            }),
            "sha224" => Some(Hash {
                name: "sha224",
                state: State::Sha224(Sha224::new()),
            }),
            _ => None,
        }
    }

    /// The default algorithm, used for all newly written content.
    pub fn new_default() -> Hash {
        Hash::new(DEFAULT_ALGORITHM).expect("default hash algorithm is registered")
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Size in bytes of the raw digest.
    pub fn digest_size(&self) -> usize {
        match self.name {
            "sha1" => 20,
            "sha224" => 28,
            _ => unreachable!(),
        }
    }

    /// Feed more data. Must not be called after [Hash::digest].
    pub fn update(&mut self, data: &[u8]) {
        match &mut self.state {
            State::Sha1(h) => h.update(data),
            State::Sha224(h) => h.update(data),
            State::Done(_) => panic!("update after digest"),
        }
    }

    /// Raw digest bytes. The first call finalizes the hash; later calls
    /// return the same bytes.
    pub fn digest(&mut self) -> &[u8] {
        if !matches!(self.state, State::Done(_)) {
            let bytes = match std::mem::replace(&mut self.state, State::Done(Vec::new())) {
                State::Sha1(h) => h.finalize().to_vec(),
                State::Sha224(h) => h.finalize().to_vec(),
                State::Done(_) => unreachable!(),
            };
            self.state = State::Done(bytes);
        }
        match &self.state {
            State::Done(bytes) => bytes,
            _ => unreachable!(),
        }
    }

    /// The digest as a `name=hex` string.
    pub fn digest_str(&mut self) -> String {
        let name = self.name;
        format!("{}={}", name, hex::encode(self.digest()))
    }

    /// Hash an entire byte slice with this algorithm in one step.
    pub fn hash_bytes(algorithm: &str, data: &[u8]) -> Option<String> {
        let mut hash = Hash::new(algorithm)?;
        hash.update(data);
        Some(hash.digest_str())
    }

    /// Stream a file through the default algorithm, returning `name=hex`.
    pub fn hash_file(path: &Path) -> io::Result<String> {
        Hash::hash_file_with(DEFAULT_ALGORITHM, path)
            .map(|opt| opt.expect("default hash algorithm is registered"))
    }

    /// Stream a file through a named algorithm, in 4 KiB chunks.
    pub fn hash_file_with(algorithm: &str, path: &Path) -> io::Result<Option<String>> {
        let Some(mut hash) = Hash::new(algorithm) else {
            return Ok(None);
        };
        let mut file = File::open(path)?;
        let mut buf = [0u8; 4096];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hash.update(&buf[..n]);
        }
        Ok(Some(hash.digest_str()))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[test]
    fn unknown_algorithm() {
        assert!(Hash::new("md5").is_none());
        assert!(Hash::hash_bytes("md5", b"x").is_none());
    }

    #[test]
    fn sha1_known_value() {
        let mut h = Hash::new("sha1").unwrap();
        h.update(b"abc");
        assert_eq!(
            h.digest_str(),
            "sha1=a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }

    #[test]
    fn sha224_known_value() {
        let mut h = Hash::new_default();
        h.update(b"abc");
        assert_eq!(
            h.digest_str(),
            "sha224=23097d223405d8228642a477bda255b32aadbce4bda0b3f7e36c9da7"
        );
        assert_eq!(h.digest_size(), 28);
    }

    #[test]
    fn digest_is_idempotent() {
        let mut h = Hash::new_default();
        h.update(b"hello");
        let first = h.digest().to_vec();
        assert_eq!(h.digest(), &first[..]);
        assert_eq!(h.digest_str(), format!("sha224={}", hex::encode(&first)));
    }

    #[test]
    fn incremental_matches_one_shot() {
        let mut h = Hash::new_default();
        h.update(b"hello ");
        h.update(b"world");
        assert_eq!(
            Some(h.digest_str()),
            Hash::hash_bytes("sha224", b"hello world")
        );
    }

    #[test]
    fn file_hashing() {
        let mut tf = NamedTempFile::new().unwrap();
        tf.write_all(b"abc").unwrap();
        tf.flush().unwrap();
        assert_eq!(
            Hash::hash_file(tf.path()).unwrap(),
            "sha224=23097d223405d8228642a477bda255b32aadbce4bda0b3f7e36c9da7"
        );
        assert_eq!(
            Hash::hash_file_with("sha1", tf.path()).unwrap().unwrap(),
            "sha1=a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }
}
