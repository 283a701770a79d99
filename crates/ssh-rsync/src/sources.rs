//! Source path lists

use std::fmt;
use std::str::FromStr;

/// Ordered list of local paths to transfer.
///
/// The text form joins paths with `", "`, the format the path box of the
/// front-end builds up as files and folders are added. Paths that contain a
/// comma cannot round-trip through the text form; build the list with
/// [`SourceList::from_paths`] or [`SourceList::push`] instead.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceList {
    entries: Vec<String>,
}

impl SourceList {
    /// Create an empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Split a comma-joined list into trimmed, non-empty entries
    pub fn parse(joined: &str) -> Self {
        Self::from_paths(joined.split(','))
    }

    /// Build a list from individual paths, dropping blank ones
    pub fn from_paths<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut list = Self::new();
        list.extend(paths);
        list
    }

    /// Append one path
    pub fn push(&mut self, path: impl AsRef<str>) {
        let path = path.as_ref().trim();
        if !path.is_empty() {
            self.entries.push(path.to_string());
        }
    }

    /// Append several paths in order
    pub fn extend<I, S>(&mut self, paths: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for path in paths {
            self.push(path);
        }
    }

    /// Remove every entry
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Entries in insertion order
    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    /// Iterate over entries
    pub fn iter(&self) -> std::slice::Iter<'_, String> {
        self.entries.iter()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the list has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for SourceList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.entries.join(", "))
    }
}

impl FromStr for SourceList {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl<'a> IntoIterator for &'a SourceList {
    type Item = &'a String;
    type IntoIter = std::slice::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Name shown for a source: its last path component, ignoring trailing
/// slashes.
pub fn display_name(source: &str) -> &str {
    let trimmed = source.trim_matches('/');
    match trimmed.rsplit('/').next() {
        Some(name) if !name.is_empty() => name,
        _ if !trimmed.is_empty() => trimmed,
        _ => source,
    }
}
