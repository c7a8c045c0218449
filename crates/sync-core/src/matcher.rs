//! Include/exclude rules for a watched root.
//!
//! Patterns are regular expressions (unanchored search) unless prefixed with
//! `glob:`, in which case the remainder is a glob (`glob:*.txt`). All
//! patterns are compiled when the root is loaded, so evaluation cannot fail.

use std::collections::HashMap;

use globset::{Glob, GlobMatcher};
use regex::Regex;

use crate::change::ChangeKind;
use crate::error::ConfigError;

const GLOB_PREFIX: &str = "glob:";

/// Marker that makes a path segment hidden on this platform.
pub const HIDDEN_MARKER: char = '.';

/// A single compiled pattern.
#[derive(Debug, Clone)]
pub enum Pattern {
    Regex(Regex),
    Glob(GlobMatcher),
}

impl Pattern {
    pub fn compile(source: &str) -> Result<Self, ConfigError> {
        if let Some(glob) = source.strip_prefix(GLOB_PREFIX) {
            let glob = Glob::new(glob).map_err(|e| ConfigError::InvalidPattern {
                pattern: source.to_string(),
                reason: e.to_string(),
            })?;
            Ok(Pattern::Glob(glob.compile_matcher()))
        } else {
            let regex = Regex::new(source).map_err(|e| ConfigError::InvalidPattern {
                pattern: source.to_string(),
                reason: e.to_string(),
            })?;
            Ok(Pattern::Regex(regex))
        }
    }

    pub fn is_match(&self, path: &str) -> bool {
        match self {
            Pattern::Regex(regex) => regex.is_match(path),
            Pattern::Glob(glob) => glob.is_match(path),
        }
    }
}

/// An any-of list of patterns.
#[derive(Debug, Clone, Default)]
pub struct PatternSet {
    patterns: Vec<Pattern>,
}

impl PatternSet {
    pub fn compile<S: AsRef<str>>(sources: &[S]) -> Result<Self, ConfigError> {
        let patterns = sources
            .iter()
            .map(|s| Pattern::compile(s.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn matches(&self, path: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(path))
    }
}

/// Compiled match/ignore rules for one root.
#[derive(Debug, Clone, Default)]
pub struct PathMatcher {
    include: PatternSet,
    ignore: PatternSet,
    include_hidden: bool,
    ignore_on: HashMap<ChangeKind, PatternSet>,
}

impl PathMatcher {
    pub fn new(include: PatternSet, ignore: PatternSet, include_hidden: bool) -> Self {
        Self {
            include,
            ignore,
            include_hidden,
            ignore_on: HashMap::new(),
        }
    }

    /// Add patterns that suppress only one kind of change (e.g. deletions).
    pub fn with_ignore_on(mut self, kind: ChangeKind, patterns: PatternSet) -> Self {
        if !patterns.is_empty() {
            self.ignore_on.insert(kind, patterns);
        }
        self
    }

    /// Whether `relative_path` passes the root's rules. Does not look at the
    /// enabled flag; see [`crate::registry::WatchedRoot::should_sync`].
    pub fn matches(&self, relative_path: &str) -> bool {
        self.admits(relative_path) && (self.include.is_empty() || self.include.matches(relative_path))
    }

    /// Hidden and ignore rules only.
    fn admits(&self, relative_path: &str) -> bool {
        if !self.include_hidden && is_hidden(relative_path) {
            return false;
        }

        !self.ignore.matches(relative_path)
    }

    /// Like [`matches`](Self::matches), then applies the per-kind ignore list.
    ///
    /// Deletions skip the match list: a deleted path may have been a
    /// directory holding matching files, and it can no longer be inspected.
    pub fn matches_event(&self, relative_path: &str, kind: ChangeKind) -> bool {
        let admitted = match kind {
            ChangeKind::Deleted => self.admits(relative_path),
            _ => self.matches(relative_path),
        };
        if !admitted {
            return false;
        }

        match self.ignore_on.get(&kind) {
            Some(patterns) => !patterns.matches(relative_path),
            None => true,
        }
    }
}

/// Whether any segment of a `/`-separated path is hidden.
pub fn is_hidden(relative_path: &str) -> bool {
    relative_path
        .split('/')
        .any(|segment| segment.starts_with(HIDDEN_MARKER))
}
