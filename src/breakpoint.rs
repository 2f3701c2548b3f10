//! Local breakpoint placement.
//!
//! The remote side does not report whether a breakpoint line holds executable code, so
//! placement is guessed from the source text: a comment line moves the breakpoint down to the
//! next line, a line that starts with a closing paren moves it up to the form it closes.

use once_cell::sync;
use regex::Regex;
use std::collections::HashMap;

/// Leading character of a line that moves a breakpoint one line down.
const MOVE_DOWN_MARKER: char = ';';
/// Leading character of a line that moves a breakpoint one line up.
const MOVE_UP_MARKER: char = ')';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    /// Line where breakpoint is actually set (1-based).
    pub line: i64,
    pub verified: bool,
}

/// Choose a line for a breakpoint requested at `line` (1-based) of a source with `lines`.
pub fn place<S: AsRef<str>>(lines: &[S], line: i64) -> Placement {
    if line < 1 || line as usize > lines.len() {
        return Placement {
            line,
            verified: false,
        };
    }

    let text = lines[line as usize - 1].as_ref().trim_start();
    let line = match text.chars().next() {
        Some(MOVE_DOWN_MARKER) => line + 1,
        Some(MOVE_UP_MARKER) => line - 1,
        _ => line,
    };
    Placement {
        line,
        verified: true,
    }
}

/// Return namespace name declared by the leading `(ns name ...)` form.
pub fn namespace_of(source: &str) -> Option<String> {
    static NS_RE: sync::Lazy<Regex> = sync::Lazy::new(|| {
        Regex::new(r"^\s*(?:;[^\n]*\n\s*)*\(\s*ns\s+(?:\^\S+\s+)?([^\s()\[\]{}]+)")
            .expect("must compile")
    });
    NS_RE
        .captures(source)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Breakpoint lines per source path, as they were last reported to the front-end.
#[derive(Default, Debug)]
pub struct BreakpointSet {
    by_source: HashMap<String, Vec<Placement>>,
}

impl BreakpointSet {
    /// Replace breakpoints of a source.
    pub fn replace(&mut self, path: &str, placements: Vec<Placement>) {
        self.by_source.insert(path.to_string(), placements);
    }

    pub fn lines(&self, path: &str) -> Vec<i64> {
        self.by_source
            .get(path)
            .map(|placements| placements.iter().map(|p| p.line).collect())
            .unwrap_or_default()
    }

    /// Verified lines of every source, those are the ones set on the remote side.
    pub fn verified(&self) -> impl Iterator<Item = (&str, Vec<i64>)> {
        self.by_source.iter().map(|(path, placements)| {
            let lines = placements
                .iter()
                .filter(|p| p.verified)
                .map(|p| p.line)
                .collect();
            (path.as_str(), lines)
        })
    }
}
