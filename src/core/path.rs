//! core::path
//!
//! Depth-prefixed encoding of hierarchical paths into a flat keyspace.
//!
//! # Encoding
//!
//! A path is stored under its *depth* (the number of `/` characters it
//! contains) rendered as two uppercase hex digits, followed by the raw path:
//!
//! | path     | depth | encoded   |
//! |----------|-------|-----------|
//! | `/`      | 1     | `01/`     |
//! | `/a`     | 1     | `01/a`    |
//! | `/a/b`   | 2     | `02/a/b`  |
//!
//! Because the depth is the leading sort key, every child of `/a` lives in
//! the contiguous range that starts with `02/a/`. A grandchild such as
//! `/a/b/c` is encoded as `03/a/b/c` and can never appear in that range, so
//! listing children and watching for child changes both reduce to one
//! bounded range scan.
//!
//! The root is the one exception: `/` and its children share depth 1, so the
//! root key `01/` is itself the listing prefix for the root's children.
//!
//! # Example
//!
//! ```
//! use zetcd::core::path::{decode, encode, list_prefix, NODE_PREFIX};
//!
//! let key = encode("/a/b").unwrap();
//! assert_eq!(key.as_str(), "02/a/b");
//! assert_eq!(decode(key.as_str()).unwrap(), "/a/b");
//!
//! let prefix = list_prefix("/a").unwrap();
//! assert_eq!(prefix, format!("{}02/a/", NODE_PREFIX));
//! ```

use std::fmt;

use thiserror::Error;

/// Namespace holding node records. Children listings scan this namespace.
pub const NODE_PREFIX: &str = "/zk/ver/";

/// Namespace holding per-node child bookkeeping (cversion, child count).
pub const CHILD_META_PREFIX: &str = "/zk/cver/";

/// Largest depth the one-byte encoding can represent.
pub const MAX_DEPTH: usize = u8::MAX as usize;

const SEPARATOR: char = '/';

/// Errors from path validation and key encoding.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("path is empty")]
    Empty,

    #[error("invalid path '{path}': {reason}")]
    Invalid { path: String, reason: &'static str },

    #[error("path depth {depth} exceeds the encodable maximum of {MAX_DEPTH}")]
    DepthOverflow { depth: usize },

    #[error("malformed encoded key '{0}'")]
    MalformedKey(String),

    #[error("range start has no upper bound")]
    Unbounded,
}

/// A path rendered with its depth prefix, without any namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EncodedKey(String);

impl EncodedKey {
    /// The encoded form, e.g. `02/a/b`.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The depth recorded in the prefix.
    pub fn depth(&self) -> u8 {
        // Constructed only by `encode`/`decode`, so the prefix is valid hex.
        hex::decode(&self.0[..2]).map(|b| b[0]).unwrap_or(0)
    }

    /// The raw hierarchical path.
    pub fn path(&self) -> &str {
        &self.0[2..]
    }

    /// Whether this is the root marker `01/`.
    pub fn is_root(&self) -> bool {
        self.0.len() == 3
    }
}

impl fmt::Display for EncodedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A half-open byte range `[start, end)` over the flat keyspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    pub start: Vec<u8>,
    pub end: Vec<u8>,
}

impl KeyRange {
    /// Whether `key` falls inside the range.
    pub fn contains(&self, key: &[u8]) -> bool {
        key >= self.start.as_slice() && key < self.end.as_slice()
    }
}

/// Prefix a missing leading separator.
pub fn normalize(path: &str) -> String {
    if path.starts_with(SEPARATOR) {
        path.to_string()
    } else {
        format!("{}{}", SEPARATOR, path)
    }
}

/// Number of separators in `path`.
pub fn depth(path: &str) -> usize {
    path.bytes().filter(|b| *b == SEPARATOR as u8).count()
}

/// Encode a hierarchical path as `<hex depth><path>`.
///
/// A missing leading separator is added first.
///
/// # Errors
///
/// - `Empty` for an empty path
/// - `DepthOverflow` when the path is nested deeper than [`MAX_DEPTH`]
pub fn encode(path: &str) -> Result<EncodedKey, PathError> {
    if path.is_empty() {
        return Err(PathError::Empty);
    }
    let path = normalize(path);
    let depth = depth(&path);
    if depth > MAX_DEPTH {
        return Err(PathError::DepthOverflow { depth });
    }
    let encoded = format!("{}{}", hex::encode_upper([depth as u8]), path);
    tracing::trace!(path = %path, key = %encoded, "encoded path");
    Ok(EncodedKey(encoded))
}

/// Strip the depth prefix from an encoded key.
///
/// The prefix must be two uppercase hex digits matching the path's depth.
pub fn decode(key: &str) -> Result<String, PathError> {
    let malformed = || PathError::MalformedKey(key.to_string());
    if key.len() < 3 || !key.is_char_boundary(2) {
        return Err(malformed());
    }
    let (prefix, path) = key.split_at(2);
    if !prefix.bytes().all(|b| b.is_ascii_digit() || (b'A'..=b'F').contains(&b)) {
        return Err(malformed());
    }
    let declared = hex::decode(prefix).map_err(|_| malformed())?[0] as usize;
    if !path.starts_with(SEPARATOR) || declared != depth(path) {
        return Err(malformed());
    }
    Ok(path.to_string())
}

fn parse_encoded(input: &str) -> Result<EncodedKey, PathError> {
    if input.starts_with(SEPARATOR) {
        encode(input)
    } else {
        decode(input)?;
        Ok(EncodedKey(input.to_string()))
    }
}

/// Start key of the range scan that yields exactly the children of a node.
///
/// Accepts either a raw path (`/a`) or its encoded key (`01/a`). The root
/// marker is used verbatim; any other key has its depth incremented and a
/// trailing separator appended, all under [`NODE_PREFIX`].
pub fn list_prefix(encoded_or_path: &str) -> Result<String, PathError> {
    let key = parse_encoded(encoded_or_path)?;
    let prefix = if key.is_root() {
        format!("{}{}", NODE_PREFIX, key.as_str())
    } else {
        let next = key.depth() as usize + 1;
        if next > MAX_DEPTH {
            return Err(PathError::DepthOverflow { depth: next });
        }
        format!(
            "{}{}{}{}",
            NODE_PREFIX,
            hex::encode_upper([next as u8]),
            key.path(),
            SEPARATOR
        )
    };
    tracing::trace!(input = encoded_or_path, prefix = %prefix, "list prefix");
    Ok(prefix)
}

/// Start key of a child-change watch. Always equal to [`list_prefix`].
pub fn watch_prefix(encoded_or_path: &str) -> Result<String, PathError> {
    list_prefix(encoded_or_path)
}

/// Exclusive end of the scan over every key that starts with `key`.
///
/// The last byte below `0xFF` is incremented and everything after it
/// dropped. A key made only of `0xFF` bytes has no such bound and is
/// rejected instead of wrapping around.
pub fn inc_prefix(key: &[u8]) -> Result<Vec<u8>, PathError> {
    let mut end = key.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return Ok(end);
        }
    }
    Err(PathError::Unbounded)
}

/// The range holding exactly the immediate children of `path`.
pub fn child_range(path: &str) -> Result<KeyRange, PathError> {
    let start = list_prefix(path)?.into_bytes();
    let end = inc_prefix(&start)?;
    Ok(KeyRange { start, end })
}

/// Flat key of a node record.
pub fn node_key(path: &str) -> Result<Vec<u8>, PathError> {
    Ok(format!("{}{}", NODE_PREFIX, encode(path)?).into_bytes())
}

/// Flat key of a node's child bookkeeping record.
pub fn child_meta_key(path: &str) -> Result<Vec<u8>, PathError> {
    Ok(format!("{}{}", CHILD_META_PREFIX, encode(path)?).into_bytes())
}

/// Recover the path from a flat node key.
pub fn path_from_node_key(key: &[u8]) -> Result<String, PathError> {
    let text = std::str::from_utf8(key)
        .map_err(|_| PathError::MalformedKey(String::from_utf8_lossy(key).into_owned()))?;
    let encoded = text
        .strip_prefix(NODE_PREFIX)
        .ok_or_else(|| PathError::MalformedKey(text.to_string()))?;
    decode(encoded)
}

/// Check a client-supplied path against the coordination protocol's rules.
pub fn validate_path(path: &str) -> Result<(), PathError> {
    let invalid = |reason| PathError::Invalid {
        path: path.to_string(),
        reason,
    };
    if path.is_empty() {
        return Err(PathError::Empty);
    }
    if !path.starts_with(SEPARATOR) {
        return Err(invalid("must start with '/'"));
    }
    if path == "/" {
        return Ok(());
    }
    if path.ends_with(SEPARATOR) {
        return Err(invalid("must not end with '/'"));
    }
    if path.contains('\0') {
        return Err(invalid("must not contain NUL"));
    }
    for segment in path[1..].split(SEPARATOR) {
        match segment {
            "" => return Err(invalid("empty segment")),
            "." | ".." => return Err(invalid("relative segment")),
            _ => {}
        }
    }
    if depth(path) > MAX_DEPTH {
        return Err(PathError::DepthOverflow { depth: depth(path) });
    }
    Ok(())
}

/// Parent of a validated path; the root has none.
pub fn parent(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind(SEPARATOR) {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Last segment of a validated path (empty for the root).
pub fn base_name(path: &str) -> &str {
    path.rsplit(SEPARATOR).next().unwrap_or("")
}

/// Join a parent path and a child name.
pub fn join(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}
