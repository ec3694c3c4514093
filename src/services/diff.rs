//! Change detection between a listing and the last recorded state.

use crate::models::remote_object::RemoteObject;
use std::collections::HashMap;

/// What to do with one listed object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Transfer,
    /// Recorded etag equals the listed one.
    Unchanged,
    /// Zero-byte folder marker.
    Placeholder,
}

/// Classifies listed objects against a `key -> etag` snapshot.
///
/// Etag equality is the only change signal; sizes and timestamps are not
/// compared. The snapshot is loaded once per run and never mutated.
#[derive(Debug, Default)]
pub struct DiffEngine {
    snapshot: HashMap<String, String>,
    total_listed: u64,
    already_complete: u64,
}

impl DiffEngine {
    pub fn new(snapshot: HashMap<String, String>) -> Self {
        Self {
            snapshot,
            ..Self::default()
        }
    }

    pub fn classify(&mut self, object: &RemoteObject) -> Decision {
        self.total_listed += 1;

        let decision = if object.is_directory_placeholder() {
            Decision::Placeholder
        } else if self.snapshot.get(&object.key) == Some(&object.etag) {
            Decision::Unchanged
        } else {
            Decision::Transfer
        };

        if decision != Decision::Transfer {
            self.already_complete += 1;
        }
        decision
    }

    pub fn total_listed(&self) -> u64 {
        self.total_listed
    }

    pub fn already_complete(&self) -> u64 {
        self.already_complete
    }
}
