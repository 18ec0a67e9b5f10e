//! Admission whitelist
//!
//! Either the universal token `*` or an ordered set of remote identifiers.

use indexmap::IndexSet;
use serde::{Serialize, Serializer};
use std::fmt;

/// Universal-match token
pub const ANYONE: &str = "*";

/// Delimiter of the persisted and user-entered form
pub const DELIMITER: char = ',';

/// Set of remote identifiers allowed to open a peer session with us
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Whitelist {
    /// Any remote identifier is admitted
    #[default]
    Anyone,
    /// Only the listed identifiers are admitted
    Only(IndexSet<String>),
}

impl Whitelist {
    /// Build an explicit whitelist from identifiers
    ///
    /// An empty list admits nobody, but it has no stored form of its own:
    /// see [`Whitelist::to_stored`].
    pub fn only<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Only(ids.into_iter().map(Into::into).collect())
    }

    /// Parse a comma-separated list, trimming each entry
    ///
    /// Returns `None` when the input holds no entries at all. Any `*` entry
    /// widens the whole list to [`Whitelist::Anyone`].
    pub fn parse(input: &str) -> Option<Self> {
        let ids: IndexSet<String> = input
            .split(DELIMITER)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        if ids.is_empty() {
            None
        } else if ids.contains(ANYONE) {
            Some(Self::Anyone)
        } else {
            Some(Self::Only(ids))
        }
    }

    /// Whether `remote_id` passes the whitelist
    pub fn admits(&self, remote_id: &str) -> bool {
        match self {
            Self::Anyone => true,
            Self::Only(ids) => ids.contains(remote_id),
        }
    }

    /// Entries in wire order, `["*"]` for anyone
    pub fn entries(&self) -> Vec<String> {
        match self {
            Self::Anyone => vec![ANYONE.to_string()],
            Self::Only(ids) => ids.iter().cloned().collect(),
        }
    }

    /// Comma-joined persisted form
    ///
    /// An empty [`Whitelist::Only`] stores as `""`, which [`Whitelist::parse`]
    /// reads back as `None`, so a reload falls back to the default
    /// [`Whitelist::Anyone`].
    pub fn to_stored(&self) -> String {
        self.entries().join(&DELIMITER.to_string())
    }
}

impl fmt::Display for Whitelist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_stored())
    }
}

impl Serialize for Whitelist {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.entries().serialize(serializer)
    }
}
