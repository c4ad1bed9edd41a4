use std::{
    fmt::{Debug, Display},
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{DocError, InternalString};

/// Separator between the segments of a rendered [NodePath].
pub const PATH_SEPARATOR: char = '/';

/// The segment under which a collection exposes its batch counter cell.
pub const COUNTER_SEGMENT: &str = "-1";

/// Address of a node relative to the top of its tree.
///
/// The top node itself has the empty path. Segments are node names: slot names
/// for records and positional indexes for collection items.
#[derive(Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct NodePath(SmallVec<[InternalString; 4]>);

impl NodePath {
    #[inline]
    pub fn root() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn segments(&self) -> &[InternalString] {
        &self.0
    }

    pub fn last(&self) -> Option<&InternalString> {
        self.0.last()
    }

    pub fn push(&mut self, segment: impl Into<InternalString>) {
        self.0.push(segment.into());
    }

    pub fn join(&self, segment: impl Into<InternalString>) -> Self {
        let mut ans = self.clone();
        ans.push(segment);
        ans
    }

    pub fn parent(&self) -> Option<NodePath> {
        if self.0.is_empty() {
            return None;
        }

        Some(Self(self.0[..self.0.len() - 1].iter().cloned().collect()))
    }

    pub fn starts_with(&self, prefix: &NodePath) -> bool {
        self.0.len() >= prefix.0.len() && self.0[..prefix.0.len()] == prefix.0[..]
    }

    pub fn strip_prefix(&self, prefix: &NodePath) -> Option<NodePath> {
        if !self.starts_with(prefix) {
            return None;
        }

        Some(Self(self.0[prefix.0.len()..].iter().cloned().collect()))
    }

    /// Concatenates `other` below `self`.
    pub fn concat(&self, other: &NodePath) -> NodePath {
        let mut ans = self.clone();
        ans.0.extend(other.0.iter().cloned());
        ans
    }
}

/// Interprets a segment as a collection index. `-1` addresses the counter cell.
pub fn parse_index(segment: &str) -> Option<i64> {
    segment.parse::<i64>().ok().filter(|x| *x >= -1)
}

impl FromIterator<InternalString> for NodePath {
    fn from_iter<I: IntoIterator<Item = InternalString>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> FromIterator<&'a str> for NodePath {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        Self(iter.into_iter().map(InternalString::from).collect())
    }
}

impl FromStr for NodePath {
    type Err = DocError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(Self::root());
        }

        let mut ans = Self::root();
        for segment in s.split(PATH_SEPARATOR) {
            if segment.is_empty() {
                return Err(DocError::decode(format!("empty segment in path `{}`", s)));
            }

            ans.push(segment);
        }

        Ok(ans)
    }
}

impl Display for NodePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, segment) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "{}", PATH_SEPARATOR)?;
            }
            f.write_str(segment)?;
        }
        Ok(())
    }
}

impl Debug for NodePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodePath(\"{}\")", self)
    }
}
