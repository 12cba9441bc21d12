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

//! Conversions between in-memory values and the textual forms used in the
//! metadata log, the statcache, and snapshot file names.

use time::format_description::FormatItem;
use time::macros::format_description;
use time::OffsetDateTime;

/// URI-style escaping of a byte string.
///
/// Bytes in `['+', 0x7f)` other than `@` pass through; everything else is
/// written `%xx`. The encoded form is plain ASCII, so it can be embedded in
/// metadata log values regardless of the original filename encoding.
pub fn uri_encode(input: &[u8]) -> String {
    let mut out = String::with_capacity(input.len());
    for &c in input {
        if c >= b'+' && c < 0x7f && c != b'@' {
            out.push(c as char);
        } else {
            out.push_str(&format!("%{c:02x}"));
        }
    }
    out
}

/// Decode a string produced by [uri_encode].
///
/// Malformed escapes (a `%` not followed by two hex digits) are dropped, as
/// the historical decoder did.
pub fn uri_decode(input: &str) -> Vec<u8> {
    fn hex_val(c: u8) -> Option<u8> {
        (c as char).to_digit(16).map(|d| d as u8)
    }

    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            match (bytes.get(i + 1), bytes.get(i + 2)) {
                (Some(&hi), Some(&lo)) => match (hex_val(hi), hex_val(lo)) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi << 4 | lo);
                        i += 3;
                    }
                    _ => i += 1,
                },
                _ => i += 1,
            }
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    out
}

/// Numeric base used by [encode_int].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntBase {
    Decimal,
    Octal,
    Hex,
}

/// Render an integer, optionally in C-style octal (`0…`) or hex (`0x…`)
/// notation. Negative values always use decimal.
pub fn encode_int(n: i64, base: IntBase) -> String {
    match base {
        IntBase::Hex if n >= 0 => format!("0x{n:x}"),
        IntBase::Octal if n > 0 => format!("0{n:o}"),
        _ => format!("{n}"),
    }
}

/// Parse an integer in C notation: decimal, `0x…` hex, or `0…` octal.
///
/// Like `strtoll`, consumes the longest valid prefix and returns 0 when no
/// digits are present.
pub fn parse_int(s: &str) -> i64 {
    let s = s.trim_start();
    let (negative, s) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let (radix, digits) = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        (16, hex)
    } else if s.starts_with('0') && s.len() > 1 {
        (8, &s[1..])
    } else {
        (10, s)
    };
    let mut value: i64 = 0;
    for c in digits.chars() {
        match c.to_digit(radix) {
            Some(d) => value = value.wrapping_mul(radix as i64).wrapping_add(d as i64),
            None => break,
        }
    }
    if negative {
        -value
    } else {
        value
    }
}

/// Compact timestamp for snapshot and statcache file names, e.g.
/// `20120215T081755`. Always UTC.
const FORMAT_FILENAME: &[FormatItem<'static>] =
    format_description!("[year][month][day]T[hour][minute][second]");

/// Human-readable local timestamp with UTC offset for the descriptor's
/// `Date:` header, e.g. `2012-02-15 00:17:55 -0800`.
const FORMAT_LOCALTIME: &[FormatItem<'static>] = format_description!(
    "[year]-[month]-[day] [hour]:[minute]:[second] [offset_hour sign:mandatory][offset_minute]"
);

pub fn format_filename_timestamp(time: OffsetDateTime) -> String {
    time.to_offset(time::UtcOffset::UTC)
        .format(FORMAT_FILENAME)
        .expect("filename timestamp format")
}

pub fn format_localtime(time: OffsetDateTime) -> String {
    time.format(FORMAT_LOCALTIME)
        .expect("localtime timestamp format")
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    #[test]
    fn encode_passthrough_and_escapes() {
        assert_eq!(uri_encode(b"simple-name_1.txt"), "simple-name_1.txt");
        assert_eq!(uri_encode(b"with space"), "with%20space");
        assert_eq!(uri_encode(b"at@sign"), "at%40sign");
        assert_eq!(uri_encode(b"\x01\x7f\xff"), "%01%7f%ff");
        // '+' itself is the first passthrough byte; '*' just below must escape.
        assert_eq!(uri_encode(b"+*"), "+%2a");
    }

    #[test]
    fn decode_round_trip() {
        let cases: &[&[u8]] = &[
            b"",
            b"plain",
            b"with space and\ttab",
            b"\x00\x01\xfe\xff",
            b"newline\nin name",
            b"%41 literal percent-esc",
        ];
        for case in cases {
            assert_eq!(uri_decode(&uri_encode(case)), *case);
        }
    }

    #[test]
    fn decode_malformed_escape() {
        assert_eq!(uri_decode("abc%4"), b"abc4");
        assert_eq!(uri_decode("a%zzb"), b"azzb");
        assert_eq!(uri_decode("%41"), b"A");
    }

    #[test]
    fn int_encoding() {
        assert_eq!(encode_int(0, IntBase::Decimal), "0");
        assert_eq!(encode_int(1234, IntBase::Decimal), "1234");
        assert_eq!(encode_int(-5, IntBase::Decimal), "-5");
        assert_eq!(encode_int(0o644, IntBase::Octal), "0644");
        assert_eq!(encode_int(0, IntBase::Octal), "0");
        assert_eq!(encode_int(255, IntBase::Hex), "0xff");
        assert_eq!(encode_int(-255, IntBase::Hex), "-255");
    }

    #[test]
    fn int_parsing() {
        assert_eq!(parse_int("1234"), 1234);
        assert_eq!(parse_int("-17"), -17);
        assert_eq!(parse_int("0644"), 0o644);
        assert_eq!(parse_int("0xff"), 255);
        assert_eq!(parse_int(""), 0);
        assert_eq!(parse_int("junk"), 0);
        assert_eq!(parse_int("12junk"), 12);
    }

    #[test]
    fn timestamp_formats() {
        let t = datetime!(2012-02-15 08:17:55 UTC);
        assert_eq!(format_filename_timestamp(t), "20120215T081755");
        assert_eq!(format_localtime(t), "2012-02-15 08:17:55 +0000");
        let t = datetime!(2012-02-15 00:17:55 -8:00);
        assert_eq!(format_localtime(t), "2012-02-15 00:17:55 -0800");
        // The filename form is always rendered in UTC.
        assert_eq!(format_filename_timestamp(t), "20120215T081755");
    }
}
