use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use thiserror::Error;

/// The separator used in remote paths.
pub const SEPARATOR: char = '/';

/// Reasons a remote path or an on-disk location can not be turned into a [`CacheKey`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidKey {
    /// The path contains no segments after normalization.
    #[error("empty remote path")]
    Empty,
    /// The path tries to escape its parent with `..`.
    #[error("parent segment in `{0}`")]
    ParentSegment(String),
    /// A segment starts with `.`, which is reserved for cache internals.
    #[error("reserved segment `{0}`")]
    ReservedSegment(String),
    /// A segment contains a character that does not map onto a file name.
    #[error("invalid character in segment `{0}`")]
    InvalidCharacter(String),
    /// The on-disk path is not valid UTF-8.
    #[error("non utf-8 path `{}`", .0.display())]
    NotUtf8(PathBuf),
    /// The on-disk path is not a plain relative path.
    #[error("not a relative path: `{}`", .0.display())]
    NotRelative(PathBuf),
}

/// A normalized, hierarchical identifier for a remote file.
///
/// The key is derived from the remote path by dropping empty and `.` segments, so
/// `/dataset//shard.1/./index` and `dataset/shard.1/index` denote the same file. Each segment
/// maps onto one directory level below the cache root, which makes the mapping between keys
/// and on-disk locations a bijection: see [`CacheKey::relative_path`] and
/// [`CacheKey::from_relative_path`].
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    path: Arc<str>,
}

impl CacheKey {
    /// Parses and normalizes a remote path.
    pub fn parse(remote_path: &str) -> Result<Self, InvalidKey> {
        let mut segments = Vec::new();
        for segment in remote_path.split(SEPARATOR) {
            match segment {
                "" | "." => continue,
                ".." => return Err(InvalidKey::ParentSegment(remote_path.to_owned())),
                segment => {
                    validate_segment(segment)?;
                    segments.push(segment);
                }
            }
        }

        if segments.is_empty() {
            return Err(InvalidKey::Empty);
        }

        Ok(Self {
            path: segments.join("/").into(),
        })
    }

    /// Recovers the key from a location relative to the cache root.
    ///
    /// This is the inverse of [`CacheKey::relative_path`]. Anything that could not have been
    /// produced by it, such as temporary download artifacts, is rejected.
    pub fn from_relative_path(path: &Path) -> Result<Self, InvalidKey> {
        let mut segments = Vec::new();
        for component in path.components() {
            let Component::Normal(segment) = component else {
                return Err(InvalidKey::NotRelative(path.to_owned()));
            };
            let segment = segment
                .to_str()
                .ok_or_else(|| InvalidKey::NotUtf8(path.to_owned()))?;
            validate_segment(segment)?;
            segments.push(segment);
        }

        if segments.is_empty() {
            return Err(InvalidKey::Empty);
        }

        Ok(Self {
            path: segments.join("/").into(),
        })
    }

    /// The normalized remote path, without leading separator.
    pub fn as_str(&self) -> &str {
        &self.path
    }

    /// Iterates over the segments of the key.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.path.split(SEPARATOR)
    }

    /// The file name of the remote file.
    pub fn file_name(&self) -> &str {
        self.path.rsplit(SEPARATOR).next().unwrap_or_default()
    }

    /// Returns the location of this key relative to a cache root.
    pub fn relative_path(&self) -> PathBuf {
        self.segments().collect()
    }
}

fn validate_segment(segment: &str) -> Result<(), InvalidKey> {
    if segment.starts_with('.') {
        return Err(InvalidKey::ReservedSegment(segment.to_owned()));
    }
    if segment.contains(['\\', '\0']) {
        return Err(InvalidKey::InvalidCharacter(segment.to_owned()));
    }
    Ok(())
}

impl FromStr for CacheKey {
    type Err = InvalidKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.path)
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CacheKey").field(&self.as_str()).finish()
    }
}
