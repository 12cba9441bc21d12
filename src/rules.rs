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

//! Include/exclude rules for selecting files to back up.
//!
//! A rule list is ordered; the first matching include or exclude rule
//! decides, and a path matching nothing is included. Dir-merge rules don't
//! select anything themselves: they name per-directory files whose
//! contents are parsed and spliced into the list while that directory is
//! being scanned, so deeper rules take precedence over shallower ones.
//!
//! Patterns are glob-like, compiled once to anchored regular expressions:
//! `?` matches one byte other than `/`, `*` any run of non-`/` bytes,
//! `**` any run of bytes, a leading `/` anchors at the root, and a
//! trailing `/` restricts the pattern to directories.

use std::sync::Arc;

use regex::bytes::{Regex, RegexBuilder};
use tracing::warn;

/// What a matching rule does.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuleType {
    Include,
    Exclude,
    DirMerge,
}

/// One compiled pattern. A pattern that failed to compile never matches.
#[derive(Debug)]
pub struct FilePattern {
    regex: Option<Regex>,
}

fn push_literal_byte(out: &mut String, b: u8) {
    match b {
        b'^' | b'.' | b'[' | b']' | b'$' | b'(' | b')' | b'|' | b'*' | b'+' | b'?' | b'{'
        | b'}' | b'\\' => {
            out.push('\\');
            out.push(b as char);
        }
        0x20..=0x7e => out.push(b as char),
        _ => out.push_str(&format!("\\x{b:02x}")),
    }
}

impl FilePattern {
    pub fn new(pattern: &[u8], basedir: &[u8]) -> FilePattern {
        let source = FilePattern::pattern_to_regex(pattern, basedir);
        match RegexBuilder::new(&source)
            .unicode(false)
            .dot_matches_new_line(true)
            .build()
        {
            Ok(regex) => FilePattern { regex: Some(regex) },
            Err(err) => {
                warn!(
                    "pattern {:?}: failed to compile as regular expression {source:?}: {err}",
                    String::from_utf8_lossy(pattern)
                );
                FilePattern { regex: None }
            }
        }
    }

    pub fn matches(&self, path: &[u8]) -> bool {
        match &self.regex {
            Some(regex) => regex.is_match(path),
            None => false,
        }
    }

    /// Translate a pattern into an anchored regular expression.
    fn pattern_to_regex(pattern: &[u8], basedir: &[u8]) -> String {
        let mut result = String::from("^");
        if pattern.is_empty() {
            // An empty pattern matches every path.
            return result;
        }

        // A non-empty base directory restricts matches to files below it.
        if !basedir.is_empty() && basedir != b"." {
            for &b in basedir {
                push_literal_byte(&mut result, b);
            }
            result.push('/');
        }

        // A leading slash anchors the pattern at the (possibly prefixed)
        // root; otherwise any number of leading components may precede it.
        let mut i = 0;
        if pattern[0] == b'/' {
            i += 1;
        } else {
            result.push_str("(?:.*/)?");
        }

        while i < pattern.len() {
            match pattern[i] {
                b'?' => result.push_str("[^/]"),
                b'*' => {
                    if pattern.get(i + 1) == Some(&b'*') {
                        i += 1;
                        result.push_str(".*");
                    } else {
                        result.push_str("[^/]*");
                    }
                }
                b => push_literal_byte(&mut result, b),
            }
            i += 1;
        }

        // A trailing slash matches only directories (callers add a slash to
        // directory paths); without one, either form matches.
        if pattern[pattern.len() - 1] != b'/' {
            result.push_str("/?");
        }
        result.push('$');
        result
    }
}

type Rule = (RuleType, Arc<FilePattern>);

struct Level {
    repeat: usize,
    patterns: Vec<Rule>,
}

/// The ordered rule list, with a save/restore stack for directory descent.
///
/// `save` is lazy: it bumps a repeat count, and the rule list is only
/// copied if a rule is added at that level. Rules themselves are shared
/// between levels.
pub struct PathFilterList {
    stack: Vec<Level>,
}

impl PathFilterList {
    pub fn new() -> PathFilterList {
        PathFilterList {
            stack: vec![Level {
                repeat: 1,
                patterns: Vec::new(),
            }],
        }
    }

    fn top(&self) -> &Level {
        self.stack.last().expect("rule stack is never empty")
    }

    /// Snapshot the current rules; a later [PathFilterList::restore]
    /// returns to them.
    pub fn save(&mut self) {
        self.stack.last_mut().expect("rule stack is never empty").repeat += 1;
    }

    pub fn restore(&mut self) {
        let top = self.stack.last_mut().expect("rule stack is never empty");
        top.repeat -= 1;
        if top.repeat == 0 {
            self.stack.pop();
            assert!(!self.stack.is_empty(), "unbalanced restore");
        }
    }

    fn mutable_patterns(&mut self) -> &mut Vec<Rule> {
        if self.top().repeat > 1 {
            let top = self.stack.last_mut().expect("rule stack is never empty");
            top.repeat -= 1;
            let copy = top.patterns.clone();
            self.stack.push(Level {
                repeat: 1,
                patterns: copy,
            });
        }
        &mut self.stack.last_mut().expect("rule stack is never empty").patterns
    }

    pub fn add_pattern(&mut self, rule_type: RuleType, pattern: &[u8], basedir: &[u8]) {
        let pattern = Arc::new(FilePattern::new(pattern, basedir));
        self.mutable_patterns().push((rule_type, pattern));
    }

    /// Should this path be backed up? First matching include or exclude
    /// rule wins; default is include.
    pub fn is_included(&self, path: &[u8], is_directory: bool) -> bool {
        let mut full_path = path.to_vec();
        if is_directory {
            full_path.push(b'/');
        }
        for (rule_type, pattern) in &self.top().patterns {
            if pattern.matches(&full_path) {
                match rule_type {
                    RuleType::Include => return true,
                    RuleType::Exclude => return false,
                    // Merge rules don't select files.
                    RuleType::DirMerge => continue,
                }
            }
        }
        true
    }

    /// Does any dir-merge rule name this path as a rule file?
    pub fn is_mergefile(&self, path: &[u8]) -> bool {
        self.top()
            .patterns
            .iter()
            .any(|(rule_type, pattern)| *rule_type == RuleType::DirMerge && pattern.matches(path))
    }

    /// Parse the contents of a per-directory rule file and splice the
    /// resulting rules in just before the dir-merge rule that matched
    /// `path`. Because descent saves before scanning children, the merged
    /// rules vanish again on restore.
    pub fn merge_patterns(&mut self, path: &[u8], basedir: &[u8], contents: &[u8]) {
        let new_rules = parse_rules(basedir, contents);
        let patterns = self.mutable_patterns();
        if let Some(pos) = patterns
            .iter()
            .position(|(rule_type, pattern)| *rule_type == RuleType::DirMerge && pattern.matches(path))
        {
            patterns.splice(pos..pos, new_rules);
        }
    }
}

impl Default for PathFilterList {
    fn default() -> Self {
        PathFilterList::new()
    }
}

/// Parse rule lines `<+|-|:> <pattern>`; blank lines and `#` comments are
/// skipped, anything else draws a warning.
fn parse_rules(basedir: &[u8], data: &[u8]) -> Vec<Rule> {
    let mut rules = Vec::new();
    for line in data.split(|&b| b == b'\n') {
        if line.is_empty() || line[0] == b'#' {
            continue;
        }
        if line.len() > 2 && line[1] == b' ' {
            let rule_type = match line[0] {
                b'+' => Some(RuleType::Include),
                b'-' => Some(RuleType::Exclude),
                b':' => Some(RuleType::DirMerge),
                _ => None,
            };
            if let Some(rule_type) = rule_type {
                rules.push((
                    rule_type,
                    Arc::new(FilePattern::new(&line[2..], basedir)),
                ));
                continue;
            }
        }
        warn!("Invalid rule: {:?}", String::from_utf8_lossy(line));
    }
    rules
}
