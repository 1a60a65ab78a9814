//! Exclude rules for sync operations.
//!
//! Each rule is a regular expression matched against a path relative to the
//! sync roots, using `/` as separator and no leading slash. Rules come from
//! `rx:` lines (used verbatim) or glob patterns translated to regexes:
//!
//! - `**` at the start, followed by `/` or the end, matches any leading directories
//! - `/**` followed by `/` or the end matches any trailing path
//! - any other `**` matches anything
//! - `*` matches anything but `/`
//!
//! Glob rules match at the start of any path component and must end on a
//! component boundary: `*.log` excludes `logs/today.log`, `build/` excludes
//! `build` and `src/build` with everything below them, but not `builder`.

use regex::{Captures, NoExpand, Regex};
use std::path::Path;
use std::sync::LazyLock;

use crate::sync::error::{Result, SyncError};
use crate::sync::path_utils::normalize_path_string;

/// Prefix marking a line as a raw regular expression.
pub const REGEX_PREFIX: &str = "rx:";

static LEADING_GLOBSTAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\\\*\\\*(/|$)").expect("valid translation regex"));
static INNER_GLOBSTAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/\\\*\\\*(/|$)").expect("valid translation regex"));
static GLOBSTAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\\\*\\\*").expect("valid translation regex"));
static STAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\\\*").expect("valid translation regex"));

/// Translate a glob pattern into a regex anchored on component boundaries.
pub fn glob_to_regex(pattern: &str) -> String {
    let normalized = normalize_path_string(pattern);
    let escaped = regex::escape(normalized.trim_end_matches('/'));

    let body = LEADING_GLOBSTAR.replace(&escaped, NoExpand("(.+($|/))?"));
    let body = INNER_GLOBSTAR.replace_all(&body, |caps: &Captures| format!("(/.+)?{}", &caps[1]));
    let body = GLOBSTAR.replace_all(&body, NoExpand("(.+)?"));
    let body = STAR.replace_all(&body, NoExpand("([^/]+)?"));

    format!("(^|/)(?:{})(/|$)", body)
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| SyncError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

/// One compiled exclude rule.
#[derive(Debug, Clone)]
pub struct FilterRule {
    regex: Regex,
}

impl FilterRule {
    /// Compile one filter line: `rx:<regex>` or a glob pattern.
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        let regex = match line.strip_prefix(REGEX_PREFIX) {
            Some(raw) => compile(raw.trim())?,
            None => compile(&glob_to_regex(line))?,
        };
        Ok(Self { regex })
    }

    pub fn is_match(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }
}

/// Ordered set of exclude rules; a path is excluded if any rule matches.
#[derive(Debug, Clone, Default)]
pub struct FilterSet {
    rules: Vec<FilterRule>,
}

impl FilterSet {
    /// Create a new empty filter set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create from a list of filter lines.
    pub fn from_patterns(patterns: &[&str]) -> Result<Self> {
        let mut set = Self::new();
        for pattern in patterns {
            set.add_line(pattern)?;
        }
        Ok(set)
    }

    /// Parse filter file content: one rule per line, blank lines and `#` comments skipped.
    pub fn parse(content: &str) -> Result<Self> {
        let mut set = Self::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            set.add_line(line)?;
        }
        Ok(set)
    }

    /// Load a filter file.
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(SyncError::FilterFileNotFound {
                path: path.to_path_buf(),
            });
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| SyncError::from_io_error(e, "reading filter file", path))?;
        Self::parse(&content)
    }

    /// Add a command-line filter value: an `rx:` regex, or the path of a filter file.
    pub fn add_argument(&mut self, value: &str) -> Result<()> {
        if value.starts_with(REGEX_PREFIX) {
            self.add_line(value)
        } else {
            let file = Self::from_file(Path::new(value))?;
            self.merge(file);
            Ok(())
        }
    }

    /// Compile and append one filter line.
    pub fn add_line(&mut self, line: &str) -> Result<()> {
        self.rules.push(FilterRule::parse(line)?);
        Ok(())
    }

    /// Exclude everything below `relative` for the rest of the run.
    pub fn suppress_subtree(&mut self, relative: &str) {
        let pattern = format!("^{}/", regex::escape(relative.trim_matches('/')));
        if let Ok(regex) = Regex::new(&pattern) {
            self.rules.push(FilterRule { regex });
        }
    }

    /// Append the rules of another set.
    pub fn merge(&mut self, other: FilterSet) {
        self.rules.extend(other.rules);
    }

    /// Check if a relative path should be excluded.
    pub fn is_excluded(&self, path: &str) -> bool {
        self.rules.iter().any(|rule| rule.is_match(path))
    }

    /// Check a relative path and each of its ancestors.
    ///
    /// Raw `rx:` rules need not match below the directory they exclude;
    /// this makes an excluded directory hide its whole subtree anyway.
    pub fn is_excluded_tree(&self, path: &str) -> bool {
        if self.rules.is_empty() {
            return false;
        }
        let path = path.trim_matches('/');
        path.match_indices('/')
            .map(|(idx, _)| &path[..idx])
            .chain(std::iter::once(path))
            .any(|prefix| self.is_excluded(prefix))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
