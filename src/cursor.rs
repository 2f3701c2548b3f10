use crate::error::Error;
use std::fs;
use std::path::{Path, PathBuf};

/// Line position over a statically loaded source. Used to step through a program when there
/// is no remote runtime to ask.
#[derive(Debug, Clone)]
pub struct LineCursor {
    path: PathBuf,
    lines: Vec<String>,
    /// Current line (1-based).
    current: i64,
}

/// Outcome of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Line(i64),
    End,
}

impl LineCursor {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = fs::read_to_string(path)?;
        Ok(Self::from_lines(
            path.to_path_buf(),
            text.lines().map(ToString::to_string).collect(),
        ))
    }

    pub fn from_lines(path: PathBuf, lines: Vec<String>) -> Self {
        Self {
            path,
            lines,
            current: 1,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn current(&self) -> i64 {
        self.current
    }

    /// Move to the next line. Cursor stays past the end once the source is exhausted.
    pub fn next(&mut self) -> Step {
        if self.current as usize >= self.lines.len() {
            self.current = self.lines.len() as i64 + 1;
            return Step::End;
        }
        self.current += 1;
        Step::Line(self.current)
    }
}
