#![forbid(unsafe_code)]

//! Addressing nodes inside a control tree.
//!
//! A [`FormPath`] is an ordered list of [`PathSegment`]s walked from the root.
//! Keys address group and record children, indices address array items.
//! Resolution is lenient about the segment flavour: a numeric key resolves
//! against an array, and an index resolves against a record key of the same
//! spelling, so `"phones.0.label"` works without the caller caring which
//! composite kind sits at each level.
//!
//! Only canonical numbers (`"0"`, `"12"`, not `"007"`) read as indices, so a
//! record key such as `"007"` keeps its spelling. Keys containing `.` cannot
//! be written in dotted form; build those paths with [`FormPath::child`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// One step in a [`FormPath`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    /// A named child of a group or record.
    Key(String),
    /// A positional child of an array.
    Index(usize),
}

impl PathSegment {
    /// The segment as a record/group key.
    #[must_use]
    pub fn as_key(&self) -> String {
        match self {
            Self::Key(key) => key.clone(),
            Self::Index(index) => index.to_string(),
        }
    }

    /// The segment as an array index, if it can be read as one.
    #[must_use]
    pub fn as_index(&self) -> Option<usize> {
        match self {
            Self::Key(key) => canonical_index(key),
            Self::Index(index) => Some(*index),
        }
    }
}

/// `s` as an index if it is the canonical spelling of one.
fn canonical_index(s: &str) -> Option<usize> {
    let index: usize = s.parse().ok()?;
    (index.to_string() == s).then_some(index)
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(key) => f.write_str(key),
            Self::Index(index) => write!(f, "{index}"),
        }
    }
}

impl From<&str> for PathSegment {
    fn from(key: &str) -> Self {
        Self::Key(key.to_string())
    }
}

impl From<String> for PathSegment {
    fn from(key: String) -> Self {
        Self::Key(key)
    }
}

impl From<usize> for PathSegment {
    fn from(index: usize) -> Self {
        Self::Index(index)
    }
}

/// Location of a node relative to the tree root. The empty path is the root.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FormPath {
    segments: Vec<PathSegment>,
}

impl FormPath {
    /// The root path.
    #[must_use]
    pub fn root() -> Self {
        Self::default()
    }

    /// Build a path from segments.
    #[must_use]
    pub fn from_segments(segments: Vec<PathSegment>) -> Self {
        Self { segments }
    }

    /// Parse a dotted path such as `"address.city"` or `"phones.0.phone"`.
    ///
    /// Canonical numeric segments become [`PathSegment::Index`]. Empty
    /// segments are skipped, so `""` is the root.
    #[must_use]
    pub fn parse(dotted: &str) -> Self {
        let segments = dotted
            .split('.')
            .filter(|s| !s.is_empty())
            .map(|s| match canonical_index(s) {
                Some(index) => PathSegment::Index(index),
                None => PathSegment::Key(s.to_string()),
            })
            .collect();
        Self { segments }
    }

    /// The segments, root first.
    #[must_use]
    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// A new path one level deeper.
    #[must_use]
    pub fn child(&self, segment: impl Into<PathSegment>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self { segments }
    }

    /// The enclosing path, or `None` at the root.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.segments.is_empty() {
            return None;
        }
        let mut segments = self.segments.clone();
        segments.pop();
        Some(Self { segments })
    }

    /// The final segment, or `None` at the root.
    #[must_use]
    pub fn last(&self) -> Option<&PathSegment> {
        self.segments.last()
    }

    /// Whether `self` is `other` or lies below it.
    #[must_use]
    pub fn starts_with(&self, other: &FormPath) -> bool {
        self.segments.starts_with(&other.segments)
    }

    pub fn push(&mut self, segment: impl Into<PathSegment>) {
        self.segments.push(segment.into());
    }
}

impl fmt::Display for FormPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("<root>");
        }
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{segment}")?;
        }
        Ok(())
    }
}

impl FromStr for FormPath {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl From<&str> for FormPath {
    fn from(dotted: &str) -> Self {
        Self::parse(dotted)
    }
}

impl From<String> for FormPath {
    fn from(dotted: String) -> Self {
        Self::parse(&dotted)
    }
}

impl From<&FormPath> for FormPath {
    fn from(path: &FormPath) -> Self {
        path.clone()
    }
}

impl From<Vec<PathSegment>> for FormPath {
    fn from(segments: Vec<PathSegment>) -> Self {
        Self { segments }
    }
}

impl FromIterator<PathSegment> for FormPath {
    fn from_iter<I: IntoIterator<Item = PathSegment>>(iter: I) -> Self {
        Self {
            segments: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_mixes_keys_and_indices() {
        let path = FormPath::parse("phones.0.label");
        assert_eq!(
            path.segments(),
            &[
                PathSegment::Key("phones".into()),
                PathSegment::Index(0),
                PathSegment::Key("label".into()),
            ]
        );
    }

    #[test]
    fn padded_numbers_stay_keys() {
        let path = FormPath::parse("agents.007");
        assert_eq!(path.last(), Some(&PathSegment::Key("007".into())));
        assert_eq!(path.to_string(), "agents.007");
        assert_eq!(PathSegment::Key("007".into()).as_index(), None);
        assert_eq!(PathSegment::Key("+7".into()).as_index(), None);
        assert_eq!(FormPath::parse("a.10").last(), Some(&PathSegment::Index(10)));
    }

    #[test]
    fn dotted_keys_need_child() {
        let path = FormPath::parse("skills").child("node.js");
        assert_eq!(path.len(), 2);
        assert_ne!(FormPath::parse("skills.node.js"), path);
    }

    #[test]
    fn empty_string_is_root() {
        assert!(FormPath::parse("").is_root());
        assert!(FormPath::parse("..").is_root());
        assert_eq!(FormPath::root().to_string(), "<root>");
    }

    #[test]
    fn display_round_trips_dotted_form() {
        let path = FormPath::parse("address.city");
        assert_eq!(path.to_string(), "address.city");
        assert_eq!(FormPath::parse(&path.to_string()), path);
    }

    #[test]
    fn parent_and_child() {
        let path = FormPath::parse("password.confirmPassword");
        let parent = path.parent().unwrap();
        assert_eq!(parent, FormPath::parse("password"));
        assert_eq!(parent.child("confirmPassword"), path);
        assert!(FormPath::root().parent().is_none());
    }

    #[test]
    fn segment_flavours_convert() {
        assert_eq!(PathSegment::Key("3".into()).as_index(), Some(3));
        assert_eq!(PathSegment::Key("city".into()).as_index(), None);
        assert_eq!(PathSegment::Index(7).as_key(), "7");
    }

    #[test]
    fn starts_with_is_prefix_match() {
        let path = FormPath::parse("address.city");
        assert!(path.starts_with(&FormPath::parse("address")));
        assert!(path.starts_with(&FormPath::root()));
        assert!(!path.starts_with(&FormPath::parse("phones")));
    }
}
