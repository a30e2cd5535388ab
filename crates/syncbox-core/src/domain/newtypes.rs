//! Domain newtypes with validation
//!
//! This module provides strongly-typed wrappers for domain identifiers and values.
//! Each newtype ensures data validity at construction time.

use std::fmt::{self, Display, Formatter};
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::errors::DomainError;

// ============================================================================
// Counters and identifiers
// ============================================================================

/// Monotonic identifier of a [`ChangeRecord`](super::change::ChangeRecord)
///
/// Ids are handed out by a `ChangeIdGenerator` and strictly increase in
/// creation order, including across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeId(u64);

impl ChangeId {
    /// Wrap a raw id value
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the raw value
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }
}

impl Display for ChangeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Durable watermark advanced once per committed sync pass
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SyncCounter(u64);

impl SyncCounter {
    /// The counter of a freshly created or wiped index
    pub const ZERO: SyncCounter = SyncCounter(0);

    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// The counter value the next successful pass will commit
    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// True for an index that has never completed a pass
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl Display for SyncCounter {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one sync pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncId(Uuid);

impl SyncId {
    /// Create a new random SyncId
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID value
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SyncId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for SyncId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SyncId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| DomainError::InvalidId(format!("Invalid SyncId: {e}")))
    }
}

/// Server-side identifier of a syncbox (the remote tree being mirrored)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncboxId(i64);

impl SyncboxId {
    #[must_use]
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn value(&self) -> i64 {
        self.0
    }
}

impl Display for SyncboxId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Paths
// ============================================================================

/// A path relative to the sync root, stored with `/` separators
///
/// RelativePath ensures the path is:
/// - Non-empty
/// - Relative (no leading `/`, no drive prefix)
/// - Normalized (no `.`, `..` or empty components)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RelativePath(String);

impl RelativePath {
    /// Create a new RelativePath
    ///
    /// # Errors
    /// Returns `DomainError::InvalidPath` if the path is empty, absolute,
    /// or contains `.`/`..` components
    pub fn new(path: impl Into<String>) -> Result<Self, DomainError> {
        let path = path.into();
        if path.is_empty() {
            return Err(DomainError::InvalidPath("Path cannot be empty".to_string()));
        }
        if path.starts_with('/') || path.contains('\\') {
            return Err(DomainError::InvalidPath(format!(
                "Path must be relative with '/' separators: {path}"
            )));
        }
        if path
            .split('/')
            .any(|part| part.is_empty() || part == "." || part == "..")
        {
            return Err(DomainError::InvalidPath(format!(
                "Path is not normalized: {path}"
            )));
        }
        Ok(Self(path))
    }

    /// Build a RelativePath from an absolute local path under `root`
    ///
    /// # Errors
    /// Returns `DomainError::PathNotInSyncRoot` if `path` is not below `root`
    /// or is the root itself.
    pub fn from_local(root: &Path, path: &Path) -> Result<Self, DomainError> {
        let relative = path.strip_prefix(root).map_err(|_| {
            DomainError::PathNotInSyncRoot(format!(
                "{} is not within {}",
                path.display(),
                root.display()
            ))
        })?;

        let mut parts = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(c) => parts.push(c.to_string_lossy().into_owned()),
                Component::CurDir => {}
                _ => {
                    return Err(DomainError::InvalidPath(format!(
                        "Unexpected component in {}",
                        path.display()
                    )))
                }
            }
        }
        if parts.is_empty() {
            return Err(DomainError::PathNotInSyncRoot(format!(
                "{} is the sync root itself",
                path.display()
            )));
        }
        Self::new(parts.join("/"))
    }

    /// Get the inner string reference
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Resolve this path below a local sync root
    #[must_use]
    pub fn to_local(&self, root: &Path) -> PathBuf {
        self.0.split('/').fold(root.to_path_buf(), |acc, part| acc.join(part))
    }

    /// Parent path, or `None` for top-level entries
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        self.0
            .rsplit_once('/')
            .map(|(parent, _)| Self(parent.to_string()))
    }

    /// Final path component
    #[must_use]
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// True when `self` lies strictly below `ancestor`
    #[must_use]
    pub fn is_descendant_of(&self, ancestor: &RelativePath) -> bool {
        self.0.len() > ancestor.0.len()
            && self.0.starts_with(&ancestor.0)
            && self.0.as_bytes()[ancestor.0.len()] == b'/'
    }

    /// Number of components, used to order folder operations
    #[must_use]
    pub fn depth(&self) -> usize {
        self.0.split('/').count()
    }
}

impl Display for RelativePath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RelativePath {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for RelativePath {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<RelativePath> for String {
    fn from(path: RelativePath) -> Self {
        path.0
    }
}

// ============================================================================
// Content and server identity
// ============================================================================

/// Content hash of a file (lowercase hex digest)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash(String);

impl ContentHash {
    /// Create a new ContentHash
    ///
    /// # Errors
    /// Returns error if the hash is empty or not hexadecimal
    pub fn new(hash: impl Into<String>) -> Result<Self, DomainError> {
        let hash = hash.into();
        if hash.is_empty() {
            return Err(DomainError::InvalidHash("Hash cannot be empty".to_string()));
        }
        if !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(DomainError::InvalidHash(format!(
                "Hash is not hexadecimal: {hash}"
            )));
        }
        Ok(Self(hash.to_ascii_lowercase()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ContentHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ContentHash {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for ContentHash {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<ContentHash> for String {
    fn from(hash: ContentHash) -> Self {
        hash.0
    }
}

/// Server-assigned unique identifier of a file or folder
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServerUid(String);

impl ServerUid {
    /// Create a new ServerUid
    ///
    /// # Errors
    /// Returns error if the uid is empty or contains whitespace
    pub fn new(uid: impl Into<String>) -> Result<Self, DomainError> {
        let uid = uid.into();
        if uid.is_empty() {
            return Err(DomainError::InvalidServerUid(
                "Server uid cannot be empty".to_string(),
            ));
        }
        if uid.chars().any(char::is_whitespace) {
            return Err(DomainError::InvalidServerUid(format!(
                "Server uid contains whitespace: {uid}"
            )));
        }
        Ok(Self(uid))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ServerUid {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for ServerUid {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<ServerUid> for String {
    fn from(uid: ServerUid) -> Self {
        uid.0
    }
}

/// Identifier of this client device, sent with every remote request
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId(String);

impl DeviceId {
    /// Create a new DeviceId
    ///
    /// # Errors
    /// Returns error if the id is blank
    pub fn new(id: impl Into<String>) -> Result<Self, DomainError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(DomainError::ValidationFailed(
                "Device id cannot be empty".to_string(),
            ));
        }
        Ok(Self(id))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for DeviceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for DeviceId {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod relative_path_tests {
        use super::*;

        #[test]
        fn test_valid_paths() {
            assert!(RelativePath::new("a.txt").is_ok());
            assert!(RelativePath::new("docs/reports/q1.pdf").is_ok());
            assert!(RelativePath::new("with space/file name.txt").is_ok());
        }

        #[test]
        fn test_rejects_absolute_and_empty() {
            assert!(RelativePath::new("").is_err());
            assert!(RelativePath::new("/etc/passwd").is_err());
            assert!(RelativePath::new("dir\\file").is_err());
        }

        #[test]
        fn test_rejects_unnormalized() {
            assert!(RelativePath::new("a/../b").is_err());
            assert!(RelativePath::new("./a").is_err());
            assert!(RelativePath::new("a//b").is_err());
            assert!(RelativePath::new("a/").is_err());
        }

        #[test]
        fn test_from_local() {
            let root = Path::new("/home/user/Syncbox");
            let path = RelativePath::from_local(root, Path::new("/home/user/Syncbox/docs/a.txt"))
                .unwrap();
            assert_eq!(path.as_str(), "docs/a.txt");
        }

        #[test]
        fn test_from_local_outside_root() {
            let root = Path::new("/home/user/Syncbox");
            let result = RelativePath::from_local(root, Path::new("/tmp/a.txt"));
            assert!(matches!(result, Err(DomainError::PathNotInSyncRoot(_))));

            let result = RelativePath::from_local(root, root);
            assert!(matches!(result, Err(DomainError::PathNotInSyncRoot(_))));
        }

        #[test]
        fn test_to_local_roundtrip() {
            let root = Path::new("/data/box");
            let path = RelativePath::new("x/y/z.bin").unwrap();
            let local = path.to_local(root);
            assert_eq!(local, PathBuf::from("/data/box/x/y/z.bin"));
            assert_eq!(RelativePath::from_local(root, &local).unwrap(), path);
        }

        #[test]
        fn test_parent_and_file_name() {
            let path = RelativePath::new("docs/reports/q1.pdf").unwrap();
            assert_eq!(path.parent().unwrap().as_str(), "docs/reports");
            assert_eq!(path.file_name(), "q1.pdf");
            assert_eq!(path.depth(), 3);

            let top = RelativePath::new("top.txt").unwrap();
            assert!(top.parent().is_none());
            assert_eq!(top.file_name(), "top.txt");
        }

        #[test]
        fn test_is_descendant_of() {
            let dir = RelativePath::new("docs").unwrap();
            let child = RelativePath::new("docs/a.txt").unwrap();
            let sibling = RelativePath::new("docs2/a.txt").unwrap();
            assert!(child.is_descendant_of(&dir));
            assert!(!sibling.is_descendant_of(&dir));
            assert!(!dir.is_descendant_of(&dir));
        }

        #[test]
        fn test_serde_rejects_invalid() {
            let ok: RelativePath = serde_json::from_str("\"a/b\"").unwrap();
            assert_eq!(ok.as_str(), "a/b");
            let bad: Result<RelativePath, _> = serde_json::from_str("\"../b\"");
            assert!(bad.is_err());
        }
    }

    mod counter_tests {
        use super::*;

        #[test]
        fn test_sync_counter_next() {
            let counter = SyncCounter::ZERO;
            assert!(counter.is_zero());
            assert_eq!(counter.next(), SyncCounter::new(1));
            assert!(SyncCounter::new(5) > SyncCounter::new(4));
        }

        #[test]
        fn test_change_id_ordering() {
            assert!(ChangeId::new(2) > ChangeId::new(1));
            assert_eq!(ChangeId::new(7).to_string(), "#7");
        }

        #[test]
        fn test_sync_id_parse() {
            let id = SyncId::new();
            let parsed: SyncId = id.to_string().parse().unwrap();
            assert_eq!(id, parsed);
            assert!("nope".parse::<SyncId>().is_err());
        }
    }

    mod value_tests {
        use super::*;

        #[test]
        fn test_content_hash_lowercases() {
            let hash = ContentHash::new("ABCDEF0123").unwrap();
            assert_eq!(hash.as_str(), "abcdef0123");
            assert!(ContentHash::new("").is_err());
            assert!(ContentHash::new("xyz").is_err());
        }

        #[test]
        fn test_server_uid() {
            assert!(ServerUid::new("f-123").is_ok());
            assert!(ServerUid::new("").is_err());
            assert!(ServerUid::new("a b").is_err());
        }

        #[test]
        fn test_device_id() {
            assert!(DeviceId::new("laptop-01").is_ok());
            assert!(DeviceId::new("   ").is_err());
        }
    }
}
