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

//! Object references: textual names for stored objects or parts of them.
//!
//! The grammar:
//!
//! ```text
//! ref       := "null" | "zero" range? | segment "/" seq checksum? range?
//! segment   := hex{8} "-" hex{4} "-" hex{4} "-" hex{4} "-" hex{12}
//! seq       := hex{8}
//! checksum  := "(" algo "=" hex+ ")"
//! range     := "[" ( "=" dec | dec | dec "+" dec ) "]"
//! ```
//!
//! A checksum binds the complete underlying object, not the ranged view.
//! The `[=length]` range form additionally asserts the object is exactly
//! that long; plain `[length]` is a prefix and `[start+length]` an
//! arbitrary sub-range.

use std::cmp::Ordering;
use std::fmt;

use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RefKind {
    Null,
    Zero,
    Normal,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Range {
    start: u64,
    length: u64,
    exact: bool,
}

/// A parsed object reference; see the module documentation for the grammar.
///
/// Equality and ordering are defined by the textual form.
#[derive(Clone, Debug)]
pub struct ObjectReference {
    kind: RefKind,
    segment: String,
    sequence: String,
    checksum: Option<String>,
    range: Option<Range>,
}

/// Generate a fresh lowercase UUID, suitable as a segment name.
pub fn generate_uuid() -> String {
    Uuid::new_v4().as_hyphenated().to_string()
}

impl ObjectReference {
    /// An uninitialised placeholder reference.
    pub fn null() -> ObjectReference {
        ObjectReference {
            kind: RefKind::Null,
            segment: String::new(),
            sequence: String::new(),
            checksum: None,
            range: None,
        }
    }

    /// The synthetic all-zeros object; never actually stored.
    pub fn zero() -> ObjectReference {
        ObjectReference {
            kind: RefKind::Zero,
            segment: String::new(),
            sequence: String::new(),
            checksum: None,
            range: None,
        }
    }

    /// A reference to object `sequence` in `segment`.
    pub fn normal(segment: &str, sequence: u32) -> ObjectReference {
        ObjectReference {
            kind: RefKind::Normal,
            segment: segment.to_owned(),
            sequence: format!("{sequence:08x}"),
            checksum: None,
            range: None,
        }
    }

    /// Like [ObjectReference::normal], with the sequence number already in
    /// its 8-hex form (as stored in the local database).
    pub(crate) fn normal_str(segment: &str, sequence: &str) -> ObjectReference {
        ObjectReference {
            kind: RefKind::Normal,
            segment: segment.to_owned(),
            sequence: sequence.to_owned(),
            checksum: None,
            range: None,
        }
    }

    pub fn is_null(&self) -> bool {
        self.kind == RefKind::Null
    }

    pub fn is_normal(&self) -> bool {
        self.kind == RefKind::Normal
    }

    pub fn segment(&self) -> &str {
        &self.segment
    }

    pub fn sequence(&self) -> &str {
        &self.sequence
    }

    /// `segment/sequence` with no checksum or range.
    pub fn basename(&self) -> String {
        format!("{}/{}", self.segment, self.sequence)
    }

    /// A copy of this reference stripped of checksum and range.
    pub fn base(&self) -> ObjectReference {
        ObjectReference {
            kind: self.kind,
            segment: self.segment.clone(),
            sequence: self.sequence.clone(),
            checksum: None,
            range: None,
        }
    }

    pub fn has_checksum(&self) -> bool {
        self.checksum.is_some()
    }

    pub fn checksum(&self) -> Option<&str> {
        self.checksum.as_deref()
    }

    pub fn set_checksum(&mut self, checksum: &str) {
        self.checksum = Some(checksum.to_owned());
    }

    pub fn clear_checksum(&mut self) {
        self.checksum = None;
    }

    pub fn has_range(&self) -> bool {
        self.range.is_some()
    }

    pub fn range_start(&self) -> u64 {
        self.range.map(|r| r.start).unwrap_or(0)
    }

    pub fn range_length(&self) -> u64 {
        self.range.map(|r| r.length).unwrap_or(0)
    }

    /// True if the range asserts the exact size of the underlying object.
    pub fn range_is_exact(&self) -> bool {
        self.range.map(|r| r.exact).unwrap_or(false)
    }

    pub fn set_range(&mut self, start: u64, length: u64, exact: bool) {
        debug_assert!(!exact || start == 0);
        self.range = Some(Range {
            start,
            length,
            exact,
        });
    }

    pub fn clear_range(&mut self) {
        self.range = None;
    }

    /// Parse the textual form. Any deviation from the grammar yields `None`.
    pub fn parse(s: &str) -> Option<ObjectReference> {
        if s == "null" {
            return Some(ObjectReference::null());
        }

        let mut rest = s;
        let mut reference = if let Some(tail) = rest.strip_prefix("zero") {
            rest = tail;
            ObjectReference::zero()
        } else {
            let slash = rest.find('/')?;
            let (segment, tail) = rest.split_at(slash);
            if !is_uuid(segment) {
                return None;
            }
            let tail = &tail[1..];
            let seq_len = tail
                .find(|c| !matches!(c, '0'..='9' | 'a'..='f'))
                .unwrap_or(tail.len());
            if seq_len != 8 {
                return None;
            }
            let (sequence, tail) = tail.split_at(8);
            rest = tail;
            ObjectReference::normal_str(segment, sequence)
        };

        if reference.is_normal() {
            if let Some(tail) = rest.strip_prefix('(') {
                let close = tail.find(')')?;
                let checksum = &tail[..close];
                if !is_checksum(checksum) {
                    return None;
                }
                reference.set_checksum(checksum);
                rest = &tail[close + 1..];
            }
        }

        if let Some(tail) = rest.strip_prefix('[') {
            let close = tail.find(']')?;
            let body = &tail[..close];
            rest = &tail[close + 1..];
            let (exact, body) = match body.strip_prefix('=') {
                Some(b) => (true, b),
                None => (false, body),
            };
            let range = match body.split_once('+') {
                Some((start, length)) => {
                    if exact {
                        return None;
                    }
                    Range {
                        start: parse_dec(start)?,
                        length: parse_dec(length)?,
                        exact: false,
                    }
                }
                None => Range {
                    start: 0,
                    length: parse_dec(body)?,
                    exact,
                },
            };
            reference.range = Some(range);
        }

        if !rest.is_empty() {
            return None;
        }
        Some(reference)
    }

    /// Extend this reference to also cover `other`, if the two are adjacent
    /// views of the same object.
    ///
    /// Succeeds only when both refer to the same object with the same
    /// checksum state, both carry non-exact ranges, and `other` begins
    /// exactly where this reference ends. A null reference merges with
    /// anything by adopting it wholesale.
    pub fn merge(&mut self, other: &ObjectReference) -> bool {
        if self.is_null() {
            *self = other.clone();
            return true;
        }

        if self.kind != other.kind
            || self.segment != other.segment
            || self.sequence != other.sequence
            || self.checksum != other.checksum
        {
            return false;
        }

        let (Some(a), Some(b)) = (self.range, other.range) else {
            return false;
        };
        if a.exact || b.exact {
            return false;
        }
        if a.start + a.length == b.start {
            self.range = Some(Range {
                start: a.start,
                length: a.length + b.length,
                exact: false,
            });
            true
        } else {
            false
        }
    }
}

fn is_uuid(s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.len() != 36 {
        return false;
    }
    bytes.iter().enumerate().all(|(i, &b)| match i {
        8 | 13 | 18 | 23 => b == b'-',
        _ => matches!(b, b'0'..=b'9' | b'a'..=b'f'),
    })
}

fn is_checksum(s: &str) -> bool {
    match s.split_once('=') {
        Some((algo, hex)) => {
            !algo.is_empty()
                && algo
                    .bytes()
                    .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
                && !hex.is_empty()
                && hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        }
        None => false,
    }
}

fn parse_dec(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

impl fmt::Display for ObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            RefKind::Null => return write!(f, "null"),
            RefKind::Zero => write!(f, "zero")?,
            RefKind::Normal => {
                write!(f, "{}/{}", self.segment, self.sequence)?;
                if let Some(checksum) = &self.checksum {
                    write!(f, "({checksum})")?;
                }
            }
        }
        if let Some(range) = self.range {
            if range.exact {
                write!(f, "[={}]", range.length)?;
            } else if self.kind == RefKind::Zero {
                write!(f, "[{}]", range.length)?;
            } else {
                write!(f, "[{}+{}]", range.start, range.length)?;
            }
        }
        Ok(())
    }
}

impl PartialEq for ObjectReference {
    fn eq(&self, other: &Self) -> bool {
        self.to_string() == other.to_string()
    }
}

impl Eq for ObjectReference {}

impl Ord for ObjectReference {
    fn cmp(&self, other: &Self) -> Ordering {
        self.to_string().cmp(&other.to_string())
    }
}

impl PartialOrd for ObjectReference {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
