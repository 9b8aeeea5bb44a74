//! The per-replica missing set.

use std::collections::{BTreeMap, HashMap};

use cairn_core::{Eversion, ObjectId};
use serde::{Deserialize, Serialize};

use crate::entry::PgLogEntry;

/// What a replica knows about one object it does not hold at the needed
/// version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingItem {
    /// The version the replica needs.
    pub need: Eversion,
    /// The version the replica currently holds, or [`Eversion::ZERO`] if it
    /// holds nothing usable.
    pub have: Eversion,
}

/// Map from object identity to the version needed and the version held.
///
/// A reverse index ordered by needed version lets recovery proceed in log
/// order. Needed versions are log-entry versions and therefore unique.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MissingSet {
    items: HashMap<ObjectId, MissingItem>,
    rmissing: BTreeMap<Eversion, ObjectId>,
}

impl MissingSet {
    /// Creates an empty missing set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if nothing is missing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Number of missing objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns true if the object is missing.
    #[must_use]
    pub fn is_missing(&self, object: &ObjectId) -> bool {
        self.items.contains_key(object)
    }

    /// The missing record for an object, if any.
    #[must_use]
    pub fn get(&self, object: &ObjectId) -> Option<&MissingItem> {
        self.items.get(object)
    }

    /// The smallest needed version across all missing objects.
    #[must_use]
    pub fn first_need(&self) -> Option<Eversion> {
        self.rmissing.keys().next().copied()
    }

    /// Iterates missing objects in needed-version order.
    pub fn iter_by_need(&self) -> impl Iterator<Item = (&ObjectId, &MissingItem)> {
        self.rmissing.values().filter_map(|oid| self.items.get_key_value(oid))
    }

    /// Records that `object` is needed at `need` while `have` is held.
    ///
    /// Replaces any previous record for the object.
    pub fn add(&mut self, object: ObjectId, need: Eversion, have: Eversion) {
        if let Some(old) = self.items.insert(object.clone(), MissingItem { need, have }) {
            self.rmissing.remove(&old.need);
        }
        self.rmissing.insert(need, object);
    }

    /// Drops the record for `object`, if any.
    pub fn rm(&mut self, object: &ObjectId) {
        if let Some(old) = self.items.remove(object) {
            self.rmissing.remove(&old.need);
        }
    }

    /// Rewrites the needed version, preserving what is held.
    pub fn revise_need(&mut self, object: ObjectId, need: Eversion) {
        let have = self.items.get(&object).map_or(Eversion::ZERO, |i| i.have);
        self.add(object, need, have);
    }

    /// Records that the object was recovered at `version`.
    ///
    /// The record is dropped when the recovered version satisfies the need.
    pub fn got(&mut self, object: &ObjectId, version: Eversion) {
        let satisfied = self.items.get(object).is_some_and(|i| i.need <= version);
        if satisfied {
            self.rm(object);
        }
    }

    /// Folds a freshly-observed log entry into the missing set.
    ///
    /// A delete clears the record: the object is not wanted at any version.
    /// A modify moves the need to the entry's version; on first sighting the
    /// held version is the entry's prior.
    pub fn add_next_event(&mut self, entry: &PgLogEntry) {
        if entry.is_delete() {
            self.rm(&entry.object);
            return;
        }
        let have = self
            .items
            .get(&entry.object)
            .map_or(entry.prior_version, |i| i.have);
        self.add(entry.object.clone(), entry.version, have);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(epoch: u64, version: u64) -> Eversion {
        Eversion::new(epoch, version)
    }

    #[test]
    fn test_add_and_rm() {
        let mut missing = MissingSet::new();
        let obj = ObjectId::head("a");

        missing.add(obj.clone(), ev(1, 3), ev(1, 1));
        assert!(missing.is_missing(&obj));
        assert_eq!(missing.get(&obj).unwrap().need, ev(1, 3));
        assert_eq!(missing.first_need(), Some(ev(1, 3)));

        missing.rm(&obj);
        assert!(missing.is_empty());
        assert_eq!(missing.first_need(), None);
    }

    #[test]
    fn test_add_replaces_reverse_index() {
        let mut missing = MissingSet::new();
        let obj = ObjectId::head("a");

        missing.add(obj.clone(), ev(1, 3), Eversion::ZERO);
        missing.add(obj.clone(), ev(1, 5), Eversion::ZERO);

        assert_eq!(missing.len(), 1);
        assert_eq!(missing.first_need(), Some(ev(1, 5)));
    }

    #[test]
    fn test_got() {
        let mut missing = MissingSet::new();
        let obj = ObjectId::head("a");
        missing.add(obj.clone(), ev(1, 3), Eversion::ZERO);

        // Recovery at an older version does not satisfy the need.
        missing.got(&obj, ev(1, 2));
        assert!(missing.is_missing(&obj));

        missing.got(&obj, ev(1, 3));
        assert!(!missing.is_missing(&obj));
    }

    #[test]
    fn test_add_next_event_modify() {
        let mut missing = MissingSet::new();
        let obj = ObjectId::head("a");

        let first = PgLogEntry::modify(obj.clone(), ev(1, 2), ev(1, 1));
        missing.add_next_event(&first);
        let item = *missing.get(&obj).unwrap();
        assert_eq!(item.need, ev(1, 2));
        assert_eq!(item.have, ev(1, 1));

        // A later event moves the need but keeps what is held.
        let second = PgLogEntry::modify(obj.clone(), ev(1, 4), ev(1, 2));
        missing.add_next_event(&second);
        let item = *missing.get(&obj).unwrap();
        assert_eq!(item.need, ev(1, 4));
        assert_eq!(item.have, ev(1, 1));
    }

    #[test]
    fn test_add_next_event_delete_clears() {
        let mut missing = MissingSet::new();
        let obj = ObjectId::head("a");
        missing.add(obj.clone(), ev(1, 2), Eversion::ZERO);

        let del = PgLogEntry::delete(obj.clone(), ev(1, 3), ev(1, 2));
        missing.add_next_event(&del);
        assert!(!missing.is_missing(&obj));
    }

    #[test]
    fn test_iter_by_need_ordering() {
        let mut missing = MissingSet::new();
        missing.add(ObjectId::head("b"), ev(1, 5), Eversion::ZERO);
        missing.add(ObjectId::head("a"), ev(1, 2), Eversion::ZERO);

        let needs: Vec<Eversion> = missing.iter_by_need().map(|(_, i)| i.need).collect();
        assert_eq!(needs, vec![ev(1, 2), ev(1, 5)]);
    }
}
