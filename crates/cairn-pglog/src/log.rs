//! The indexed placement-group log.

use std::collections::{HashMap, VecDeque};

use cairn_core::{Error, Eversion, ObjectId, Result};

use crate::entry::PgLogEntry;

/// An ordered placement-group log with a per-object index.
///
/// Entries are kept oldest-to-newest with strictly increasing versions. The
/// `tail` is the version *before* the oldest retained entry; the `head` is
/// the version of the newest entry (equal to the tail when the log is
/// empty). The index tracks the newest entry per object, which is what
/// reconciliation needs to decide whether an authoritative history
/// supersedes a divergent one.
#[derive(Debug, Clone, Default)]
pub struct IndexedLog {
    head: Eversion,
    tail: Eversion,
    entries: VecDeque<PgLogEntry>,
    index: HashMap<ObjectId, PgLogEntry>,
}

impl IndexedLog {
    /// Creates an empty log with `head == tail == ZERO`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a log from already-ordered entries.
    ///
    /// `tail` is the version preceding the oldest entry. Entries must have
    /// strictly increasing versions, all newer than the tail.
    pub fn from_entries(tail: Eversion, entries: Vec<PgLogEntry>) -> Result<Self> {
        let mut prev = tail;
        for entry in &entries {
            if entry.version <= prev {
                return Err(Error::invariant(format!(
                    "log entry {} not newer than {}",
                    entry.version, prev
                )));
            }
            prev = entry.version;
        }
        let head = entries.last().map_or(tail, |e| e.version);
        let mut log = Self { head, tail, entries: entries.into(), index: HashMap::new() };
        log.reindex();
        Ok(log)
    }

    /// The version of the newest entry.
    #[must_use]
    pub fn head(&self) -> Eversion {
        self.head
    }

    /// The version preceding the oldest retained entry.
    #[must_use]
    pub fn tail(&self) -> Eversion {
        self.tail
    }

    /// Number of retained entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no entries are retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates entries oldest to newest.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &PgLogEntry> {
        self.entries.iter()
    }

    /// The newest entry for the given object, if any is retained.
    #[must_use]
    pub fn newest_entry(&self, object: &ObjectId) -> Option<&PgLogEntry> {
        self.index.get(object)
    }

    /// The entry carrying exactly the given version, if retained.
    #[must_use]
    pub fn entry_at(&self, version: Eversion) -> Option<&PgLogEntry> {
        let idx = self
            .entries
            .binary_search_by(|e| e.version.cmp(&version))
            .ok()?;
        self.entries.get(idx)
    }

    /// Returns true if an entry identical to `entry` is retained.
    ///
    /// Identity requires the version, operation and object to all match;
    /// two histories that assigned the same version to different work are
    /// divergent, not shared.
    #[must_use]
    pub fn contains(&self, entry: &PgLogEntry) -> bool {
        self.entry_at(entry.version)
            .is_some_and(|e| e.op == entry.op && e.object == entry.object)
    }

    /// Appends a new head entry.
    pub fn add(&mut self, entry: PgLogEntry) -> Result<()> {
        if entry.version <= self.head {
            return Err(Error::invariant(format!(
                "appended entry {} not newer than head {}",
                entry.version, self.head
            )));
        }
        self.head = entry.version;
        self.index.insert(entry.object.clone(), entry.clone());
        self.entries.push_back(entry);
        Ok(())
    }

    /// Extends the tail backwards with older entries.
    ///
    /// `older` must be ordered, strictly older than the current tail, and
    /// `new_tail` must precede all of it.
    pub fn prepend_older(&mut self, new_tail: Eversion, older: Vec<PgLogEntry>) -> Result<()> {
        let mut prev = new_tail;
        for entry in &older {
            if entry.version <= prev || entry.version > self.tail {
                return Err(Error::invariant(format!(
                    "tail extension entry {} out of range ({} .. {}]",
                    entry.version, prev, self.tail
                )));
            }
            prev = entry.version;
        }
        for entry in older.into_iter().rev() {
            self.entries.push_front(entry);
        }
        self.tail = new_tail;
        if self.entries.is_empty() {
            self.head = self.tail;
        }
        self.reindex();
        Ok(())
    }

    /// Removes and returns all entries newer than `version`, oldest first.
    ///
    /// The head moves back to `version` (or the tail, whichever is newer).
    pub fn pop_newer_than(&mut self, version: Eversion) -> Vec<PgLogEntry> {
        let mut popped = Vec::new();
        while self.entries.back().is_some_and(|e| e.version > version) {
            if let Some(entry) = self.entries.pop_back() {
                popped.push(entry);
            }
        }
        popped.reverse();
        if !popped.is_empty() {
            self.head = version.max(self.tail);
            self.reindex();
        }
        popped
    }

    /// Removes and returns all entries with version at or below `version`,
    /// oldest first, advancing the tail to `version`.
    pub fn trim_to(&mut self, version: Eversion) -> Vec<PgLogEntry> {
        let mut trimmed = Vec::new();
        while self.entries.front().is_some_and(|e| e.version <= version) {
            if let Some(entry) = self.entries.pop_front() {
                trimmed.push(entry);
            }
        }
        if version > self.tail {
            self.tail = version;
        }
        if self.entries.is_empty() && self.tail > self.head {
            self.head = self.tail;
        }
        if !trimmed.is_empty() {
            self.reindex();
        }
        trimmed
    }

    fn reindex(&mut self) {
        self.index.clear();
        for entry in &self.entries {
            self.index.insert(entry.object.clone(), entry.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::PgLogEntry;

    fn ev(epoch: u64, version: u64) -> Eversion {
        Eversion::new(epoch, version)
    }

    fn modify(name: &str, version: Eversion, prior: Eversion) -> PgLogEntry {
        PgLogEntry::modify(ObjectId::head(name), version, prior)
    }

    #[test]
    fn test_from_entries_orders() {
        let log = IndexedLog::from_entries(
            ev(1, 1),
            vec![
                modify("a", ev(1, 2), ev(1, 1)),
                modify("b", ev(1, 3), Eversion::ZERO),
                modify("a", ev(1, 4), ev(1, 2)),
            ],
        )
        .unwrap();

        assert_eq!(log.head(), ev(1, 4));
        assert_eq!(log.tail(), ev(1, 1));
        assert_eq!(log.len(), 3);
        assert_eq!(log.newest_entry(&ObjectId::head("a")).unwrap().version, ev(1, 4));
        assert_eq!(log.newest_entry(&ObjectId::head("b")).unwrap().version, ev(1, 3));
    }

    #[test]
    fn test_from_entries_rejects_disorder() {
        let result = IndexedLog::from_entries(
            ev(1, 1),
            vec![modify("a", ev(1, 3), ev(1, 1)), modify("b", ev(1, 2), Eversion::ZERO)],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_contains_requires_identical_entry() {
        let log = IndexedLog::from_entries(
            Eversion::ZERO,
            vec![modify("a", ev(1, 1), Eversion::ZERO)],
        )
        .unwrap();

        assert!(log.contains(&modify("a", ev(1, 1), Eversion::ZERO)));
        // Same version, different operation: not the same history.
        assert!(!log.contains(&PgLogEntry::delete(
            ObjectId::head("a"),
            ev(1, 1),
            Eversion::ZERO
        )));
        // Same version, different object.
        assert!(!log.contains(&modify("b", ev(1, 1), Eversion::ZERO)));
    }

    #[test]
    fn test_pop_newer_than() {
        let mut log = IndexedLog::from_entries(
            Eversion::ZERO,
            vec![
                modify("a", ev(1, 1), Eversion::ZERO),
                modify("a", ev(1, 2), ev(1, 1)),
                modify("b", ev(1, 3), Eversion::ZERO),
            ],
        )
        .unwrap();

        let popped = log.pop_newer_than(ev(1, 1));
        assert_eq!(popped.len(), 2);
        assert_eq!(popped[0].version, ev(1, 2));
        assert_eq!(popped[1].version, ev(1, 3));
        assert_eq!(log.head(), ev(1, 1));
        // Index reflects only what remains.
        assert_eq!(log.newest_entry(&ObjectId::head("a")).unwrap().version, ev(1, 1));
        assert!(log.newest_entry(&ObjectId::head("b")).is_none());
    }

    #[test]
    fn test_prepend_older() {
        let mut log = IndexedLog::from_entries(
            ev(1, 2),
            vec![modify("a", ev(1, 3), ev(1, 1))],
        )
        .unwrap();

        log.prepend_older(
            Eversion::ZERO,
            vec![modify("b", ev(1, 1), Eversion::ZERO), modify("c", ev(1, 2), Eversion::ZERO)],
        )
        .unwrap();

        assert_eq!(log.tail(), Eversion::ZERO);
        assert_eq!(log.len(), 3);
        assert_eq!(log.iter().next().unwrap().version, ev(1, 1));
        assert!(log.newest_entry(&ObjectId::head("b")).is_some());
    }

    #[test]
    fn test_prepend_rejects_overlap() {
        let mut log = IndexedLog::from_entries(
            ev(1, 2),
            vec![modify("a", ev(1, 3), ev(1, 1))],
        )
        .unwrap();

        // (1,3) is already past the tail.
        let result = log.prepend_older(Eversion::ZERO, vec![modify("b", ev(1, 3), Eversion::ZERO)]);
        assert!(result.is_err());
    }

    #[test]
    fn test_trim_to() {
        let mut log = IndexedLog::from_entries(
            Eversion::ZERO,
            vec![
                modify("a", ev(1, 1), Eversion::ZERO),
                modify("b", ev(1, 2), Eversion::ZERO),
                modify("a", ev(1, 3), ev(1, 1)),
            ],
        )
        .unwrap();

        let trimmed = log.trim_to(ev(1, 2));
        assert_eq!(trimmed.len(), 2);
        assert_eq!(log.tail(), ev(1, 2));
        assert_eq!(log.head(), ev(1, 3));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_add_rejects_stale_head() {
        let mut log = IndexedLog::from_entries(
            Eversion::ZERO,
            vec![modify("a", ev(1, 2), Eversion::ZERO)],
        )
        .unwrap();

        assert!(log.add(modify("b", ev(1, 2), Eversion::ZERO)).is_err());
        assert!(log.add(modify("b", ev(1, 3), Eversion::ZERO)).is_ok());
        assert_eq!(log.head(), ev(1, 3));
    }
}
