//! Change state attached to every mutable unit of the image DAG.

use std::fmt;

/// How a layer, config, manifest or tar entry differs from the source image.
///
/// `Unchanged` content is passed through byte-identical and keeps its original
/// digest. Everything else requires regeneration downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Change {
    #[default]
    Unchanged,
    /// Inserted by an earlier step, not present in the source.
    Added,
    /// Logically removed. Keeps its position for index-based edits.
    Deleted,
    /// Content mutated, a new digest is required.
    Replaced,
}

impl Change {
    /// Whether downstream regeneration has to touch this unit.
    pub fn is_modified(self) -> bool {
        self != Change::Unchanged
    }

    /// Combine the current state with a newly reported one.
    ///
    /// States only move forward within a run: nothing reverts to `Unchanged`,
    /// `Deleted` is final, and an `Added` unit stays `Added` when its content
    /// is rewritten.
    pub fn merge(self, reported: Change) -> Change {
        match (self, reported) {
            (current, Change::Unchanged) => current,
            (Change::Deleted, _) => Change::Deleted,
            (_, Change::Deleted) => Change::Deleted,
            (Change::Added, _) => Change::Added,
            (_, reported) => reported,
        }
    }
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Change::Unchanged => "unchanged",
            Change::Added => "added",
            Change::Deleted => "deleted",
            Change::Replaced => "replaced",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unchanged_never_reverts() {
        assert_eq!(Change::Replaced.merge(Change::Unchanged), Change::Replaced);
        assert_eq!(Change::Deleted.merge(Change::Unchanged), Change::Deleted);
        assert_eq!(Change::Added.merge(Change::Unchanged), Change::Added);
    }

    #[test]
    fn test_deleted_is_final() {
        assert_eq!(Change::Deleted.merge(Change::Replaced), Change::Deleted);
        assert_eq!(Change::Deleted.merge(Change::Added), Change::Deleted);
        assert_eq!(Change::Replaced.merge(Change::Deleted), Change::Deleted);
        assert_eq!(Change::Added.merge(Change::Deleted), Change::Deleted);
    }

    #[test]
    fn test_added_stays_added_when_rewritten() {
        assert_eq!(Change::Added.merge(Change::Replaced), Change::Added);
        assert_eq!(Change::Unchanged.merge(Change::Replaced), Change::Replaced);
    }

    #[test]
    fn test_is_modified() {
        assert!(!Change::Unchanged.is_modified());
        assert!(Change::Added.is_modified());
        assert!(Change::Deleted.is_modified());
        assert!(Change::Replaced.is_modified());
    }
}
