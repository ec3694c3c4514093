//! Provider-side object descriptor.

use chrono::{DateTime, Utc};

/// One entry from a paginated bucket listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteObject {
    /// Full key within the bucket.
    pub key: String,

    /// Content checksum with surrounding quotes removed.
    pub etag: String,

    pub size: i64,
    pub last_modified: DateTime<Utc>,
}

impl RemoteObject {
    /// Zero-byte keys ending in `/` are folder markers, not content.
    pub fn is_directory_placeholder(&self) -> bool {
        self.size == 0 && self.key.ends_with('/')
    }
}

/// Strip the quoting providers put around etags (`"abc"` -> `abc`).
pub fn normalize_etag(raw: &str) -> String {
    raw.trim_matches('"').to_string()
}
