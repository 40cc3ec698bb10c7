use std::fmt;

use chrono::{DateTime, Utc};
use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};

/// Stable identity of a configured share, independent of its display name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-connection transport requirements, handed through to the storage layer untouched
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportSecurity {
    pub encryption_required: bool,
    pub signing_required: bool,
}

/// Login material for a share
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub domain: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("domain", &self.domain)
            .finish()
    }
}

/// A remote share endpoint. Read-only from the pipeline's point of view.
#[derive(Debug, Clone)]
pub struct ConnectionDescriptor {
    pub id: ConnectionId,
    /// User-editable; never used as a key
    pub display_name: String,
    pub host: String,
    pub share: String,
    pub credentials: Credentials,
    pub security: TransportSecurity,
}

impl ConnectionDescriptor {
    pub fn new(id: impl Into<String>, host: impl Into<String>, share: impl Into<String>) -> Self {
        let id = ConnectionId::new(id);
        Self {
            display_name: id.to_string(),
            id,
            host: host.into(),
            share: share.into(),
            credentials: Credentials::default(),
            security: TransportSecurity::default(),
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_security(mut self, security: TransportSecurity) -> Self {
        self.security = security;
        self
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }
}

/// Type of a remote entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Dir,
}

/// One entry of a remote directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub name: String,
    /// Normalized path from the share root
    pub path: String,
    pub kind: EntryKind,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

impl RemoteEntry {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Dir
    }
}

/// Result of listing a directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryListing {
    pub path: String,
    pub entries: Vec<RemoteEntry>,
}

/// Which entry kinds a search returns
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeFilter {
    #[default]
    All,
    Files,
    Directories,
}

impl TypeFilter {
    pub fn accepts(&self, kind: EntryKind) -> bool {
        match self {
            TypeFilter::All => true,
            TypeFilter::Files => kind == EntryKind::File,
            TypeFilter::Directories => kind == EntryKind::Dir,
        }
    }
}

/// Name search with `*` and `?` wildcards
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SearchQuery {
    pub pattern: String,
    pub type_filter: TypeFilter,
    pub include_subdirectories: bool,
}

impl SearchQuery {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            type_filter: TypeFilter::All,
            include_subdirectories: true,
        }
    }

    pub fn with_filter(mut self, type_filter: TypeFilter) -> Self {
        self.type_filter = type_filter;
        self
    }

    pub fn recursive(mut self, include_subdirectories: bool) -> Self {
        self.include_subdirectories = include_subdirectories;
        self
    }

    /// Compiled matcher. Only `*` and `?` are special; everything else is literal.
    pub fn matcher(&self) -> NameMatcher {
        let mut escaped = String::with_capacity(self.pattern.len());
        for c in self.pattern.chars() {
            match c {
                '*' | '?' => escaped.push(c),
                other => escaped.push_str(&Pattern::escape(&other.to_string())),
            }
        }
        NameMatcher {
            // An escaped pattern always compiles; fall back to matching nothing otherwise.
            pattern: Pattern::new(&escaped).ok(),
        }
    }

    /// Stable string form used as the cache query parameter
    pub fn cache_param(&self) -> String {
        format!(
            "search:{}:{:?}:{}",
            self.pattern, self.type_filter, self.include_subdirectories
        )
    }
}

/// Case-insensitive wildcard matcher for entry names
#[derive(Debug, Clone)]
pub struct NameMatcher {
    pattern: Option<Pattern>,
}

impl NameMatcher {
    pub fn matches(&self, name: &str) -> bool {
        let options = MatchOptions {
            case_sensitive: false,
            require_literal_separator: false,
            require_literal_leading_dot: false,
        };
        self.pattern
            .as_ref()
            .map(|p| p.matches_with(name, options))
            .unwrap_or(false)
    }
}

/// Matches found under a search root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResults {
    pub root: String,
    pub query: SearchQuery,
    pub matches: Vec<RemoteEntry>,
}

/// Identity of a submitted operation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OperationId(String);

impl OperationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of a submitted operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Normal completion of an operation. Cancellation is not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    Completed(T),
    Cancelled,
}

impl<T> Outcome<T> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Cancelled)
    }

    pub fn completed(self) -> Option<T> {
        match self {
            Outcome::Completed(value) => Some(value),
            Outcome::Cancelled => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcards() {
        let m = SearchQuery::new("*.txt").matcher();
        assert!(m.matches("notes.txt"));
        assert!(m.matches("NOTES.TXT"));
        assert!(!m.matches("notes.txt.bak"));

        let m = SearchQuery::new("report-??.pdf").matcher();
        assert!(m.matches("report-01.pdf"));
        assert!(!m.matches("report-1.pdf"));
    }

    #[test]
    fn test_brackets_are_literal() {
        let m = SearchQuery::new("[draft]*").matcher();
        assert!(m.matches("[draft] plan.doc"));
        assert!(!m.matches("d plan.doc"));
    }

    #[test]
    fn test_type_filter() {
        assert!(TypeFilter::All.accepts(EntryKind::Dir));
        assert!(TypeFilter::Files.accepts(EntryKind::File));
        assert!(!TypeFilter::Files.accepts(EntryKind::Dir));
        assert!(!TypeFilter::Directories.accepts(EntryKind::File));
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let creds = Credentials {
            username: "alice".to_string(),
            password: "hunter2".to_string(),
            domain: None,
        };
        let printed = format!("{:?}", creds);
        assert!(printed.contains("alice"));
        assert!(!printed.contains("hunter2"));
    }
}
