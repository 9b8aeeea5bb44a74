//! Log reconciliation: merge, rewind and replica divergence processing.

use std::collections::{BTreeMap, HashMap};

use cairn_core::{Error, Eversion, ObjectId, Result};
use tracing::debug;

use crate::entry::PgLogEntry;
use crate::log::IndexedLog;
use crate::missing::MissingSet;

/// Summary state of a placement group as carried between peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PgInfo {
    /// Newest update applied (the log head).
    pub last_update: Eversion,
    /// Newest version below which everything is locally complete.
    pub last_complete: Eversion,
    /// The log tail (version preceding the oldest retained entry).
    pub log_tail: Eversion,
}

/// Receives the side effects of reconciliation.
///
/// The engine never touches object data itself; it surfaces what must happen
/// to the caller. `rollback` is invoked newest-first for every local entry
/// removed as divergent, `remove` for objects that must not exist, and
/// `trim` for entries dropped off the tail.
pub trait DivergenceHandler {
    /// A divergent local entry is being rolled back.
    fn rollback(&mut self, entry: &PgLogEntry);

    /// The object must be removed from the local store.
    fn remove(&mut self, object: &ObjectId);

    /// An entry fell off the tail during a trim.
    fn trim(&mut self, _entry: &PgLogEntry) {}
}

/// The placement-group log engine: an indexed log, the local missing set and
/// the divergent-priors side map, reconciled together.
#[derive(Debug, Clone, Default)]
pub struct PgLog {
    log: IndexedLog,
    missing: MissingSet,
    divergent_priors: BTreeMap<Eversion, ObjectId>,
}

impl PgLog {
    /// Creates an engine over an existing log and missing set.
    #[must_use]
    pub fn new(log: IndexedLog, missing: MissingSet) -> Self {
        Self { log, missing, divergent_priors: BTreeMap::new() }
    }

    /// The underlying log.
    #[must_use]
    pub fn log(&self) -> &IndexedLog {
        &self.log
    }

    /// The local missing set.
    #[must_use]
    pub fn missing(&self) -> &MissingSet {
        &self.missing
    }

    /// Mutable access to the local missing set (recovery bookkeeping).
    pub fn missing_mut(&mut self) -> &mut MissingSet {
        &mut self.missing
    }

    /// Divergent objects whose prior version precedes the log tail, keyed by
    /// that prior version.
    #[must_use]
    pub fn divergent_priors(&self) -> &BTreeMap<Eversion, ObjectId> {
        &self.divergent_priors
    }

    /// Appends a locally-generated entry.
    ///
    /// `applied` is false when the entry describes a write this replica has
    /// not performed (catching up from a peer's log), in which case the
    /// missing set is updated to reflect it.
    pub fn add(&mut self, entry: PgLogEntry, applied: bool) -> Result<()> {
        if !applied {
            self.missing.add_next_event(&entry);
        }
        self.log.add(entry)
    }

    /// Reconciles the local log against an authoritative log `olog`.
    ///
    /// See the crate docs for the full contract. `info.last_update` ends at
    /// `olog`'s head; local entries the authoritative history does not
    /// contain are rolled back through `handler` and their objects scheduled
    /// for recovery.
    pub fn merge_log(
        &mut self,
        olog: &IndexedLog,
        info: &mut PgInfo,
        handler: &mut dyn DivergenceHandler,
    ) -> Result<()> {
        if olog.tail() > self.log.head() {
            return Err(Error::invariant(format!(
                "logs do not overlap: authoritative tail {} is past local head {}",
                olog.tail(),
                self.log.head()
            )));
        }

        // Extend our tail backwards with older authoritative entries.
        if olog.tail() < self.log.tail() {
            let older: Vec<PgLogEntry> = olog
                .iter()
                .filter(|e| e.version <= self.log.tail())
                .cloned()
                .collect();
            self.log.prepend_older(olog.tail(), older)?;
            info.log_tail = olog.tail();
        }

        if olog.head() < self.log.head() {
            // The authoritative history is shorter: rewind to it.
            return self.rewind_divergent_log(olog.head(), info, handler);
        }
        if olog.head() == self.log.head() {
            return Ok(());
        }

        // Find the newest entry both histories share.
        let local_head = self.log.head();
        let shared = olog
            .iter()
            .rev()
            .filter(|e| e.version <= local_head)
            .find(|e| self.log.contains(e))
            .map(|e| e.version);
        let lower_bound = shared.unwrap_or_else(|| olog.tail().max(self.log.tail()));

        debug!(%lower_bound, olog_head = %olog.head(), local_head = %local_head, "merging authoritative log");

        // Local entries past the shared point are divergent.
        let divergent = self.log.pop_newer_than(lower_bound);

        // Adopt the authoritative entries past the shared point.
        for entry in olog.iter().filter(|e| e.version > lower_bound) {
            self.missing.add_next_event(entry);
            if entry.is_delete() {
                handler.remove(&entry.object);
            }
            self.log.add(entry.clone())?;
        }

        info.last_update = olog.head();
        if info.last_complete > lower_bound {
            info.last_complete = lower_bound;
        }

        self.merge_divergent(divergent, handler)
    }

    /// Rewinds the log to `newhead`, processing everything newer as
    /// divergent.
    pub fn rewind_divergent_log(
        &mut self,
        newhead: Eversion,
        info: &mut PgInfo,
        handler: &mut dyn DivergenceHandler,
    ) -> Result<()> {
        if newhead < self.log.tail() {
            return Err(Error::invariant(format!(
                "cannot rewind to {} before log tail {}",
                newhead,
                self.log.tail()
            )));
        }
        if newhead > self.log.head() {
            return Err(Error::invariant(format!(
                "cannot rewind forwards to {} past head {}",
                newhead,
                self.log.head()
            )));
        }

        debug!(%newhead, head = %self.log.head(), "rewinding divergent log");

        let divergent = self.log.pop_newer_than(newhead);
        info.last_update = newhead;
        if info.last_complete > newhead {
            info.last_complete = newhead;
        }
        self.merge_divergent(divergent, handler)
    }

    /// Computes how a replica's log diverges from the local authoritative
    /// one, without mutating local state.
    ///
    /// `oinfo` and `omissing` are the replica's; its `last_update` moves
    /// back to the newest shared entry and `last_complete` to the newest
    /// replica version preceding the first missing need.
    pub fn proc_replica_log(
        &self,
        oinfo: &mut PgInfo,
        olog: &IndexedLog,
        omissing: &mut MissingSet,
    ) -> Result<()> {
        let shared = olog
            .iter()
            .rev()
            .filter(|e| e.version <= self.log.head())
            .find(|e| self.log.contains(e))
            .map(|e| e.version);
        let lu = shared.unwrap_or_else(|| olog.tail().max(self.log.tail()));

        let divergent: Vec<PgLogEntry> =
            olog.iter().filter(|e| e.version > lu).cloned().collect();

        for (object, entries) in group_by_object(&divergent)? {
            let first = &entries[0];
            let prior = first.prior_version;
            let authoritative = self.log.newest_entry(&object);

            match authoritative {
                Some(ae) if ae.version >= first.version => {
                    if ae.is_delete() {
                        omissing.rm(&object);
                    } else {
                        omissing.add(object.clone(), ae.version, Eversion::ZERO);
                    }
                }
                Some(ae) if ae.version == prior && ae.is_delete() => {
                    omissing.rm(&object);
                }
                _ => {
                    if prior.is_zero() {
                        omissing.rm(&object);
                    } else {
                        // Pre-tail priors also land here: we cannot record
                        // divergent priors on a peer's behalf, so the object
                        // is simply marked missing at its prior.
                        omissing.add(object.clone(), prior, Eversion::ZERO);
                    }
                }
            }
        }

        if lu < oinfo.last_update {
            oinfo.last_update = lu;
        }
        oinfo.last_complete = match omissing.first_need() {
            None => oinfo.last_update,
            Some(first_need) => olog
                .iter()
                .take_while(|e| e.version < first_need)
                .map(|e| e.version)
                .filter(|v| *v <= oinfo.last_update)
                .last()
                .unwrap_or(Eversion::ZERO),
        };
        Ok(())
    }

    /// Folds local log entries newer than `from` into a peer's missing set.
    ///
    /// Used when planning catch-up for a replica whose head is behind ours
    /// but not divergent.
    pub fn catch_up_missing(&self, from: Eversion, omissing: &mut MissingSet) {
        for entry in self.log.iter().filter(|e| e.version > from) {
            omissing.add_next_event(entry);
        }
    }

    /// Trims entries at or below `trim_to` off the tail.
    ///
    /// Trimming past `info.last_complete` would discard history still needed
    /// for recovery and is an invariant violation.
    pub fn trim(
        &mut self,
        info: &mut PgInfo,
        trim_to: Eversion,
        handler: &mut dyn DivergenceHandler,
    ) -> Result<()> {
        if trim_to > info.last_complete {
            return Err(Error::invariant(format!(
                "cannot trim to {} past last_complete {}",
                trim_to, info.last_complete
            )));
        }
        for entry in self.log.trim_to(trim_to) {
            handler.trim(&entry);
        }
        info.log_tail = self.log.tail();
        Ok(())
    }

    /// Applies the divergent-entry rules to entries popped off the local
    /// log.
    ///
    /// Bookkeeping (missing set, divergent priors, removals) is decided per
    /// object; the rollback callbacks then fire for every divergent entry in
    /// reverse (newest-first) order so partially-applied modifications can be
    /// undone back to front.
    fn merge_divergent(
        &mut self,
        divergent: Vec<PgLogEntry>,
        handler: &mut dyn DivergenceHandler,
    ) -> Result<()> {
        for (object, entries) in group_by_object(&divergent)? {
            self.merge_divergent_object(&object, &entries, handler)?;
        }
        for entry in divergent.iter().rev() {
            handler.rollback(entry);
        }
        Ok(())
    }

    fn merge_divergent_object(
        &mut self,
        object: &ObjectId,
        entries: &[PgLogEntry],
        handler: &mut dyn DivergenceHandler,
    ) -> Result<()> {
        let first = entries
            .first()
            .ok_or_else(|| Error::invariant("empty divergent entry group"))?;
        let prior = first.prior_version;

        debug!(
            object = %object,
            first = %first.version,
            %prior,
            count = entries.len(),
            "merging divergent entries"
        );

        let authoritative = self.log.newest_entry(object).cloned();
        match authoritative {
            Some(ae) if ae.version >= first.version => {
                // The authoritative history has its own verdict on the
                // object; the local divergent state is unusable either way.
                if ae.is_delete() {
                    self.missing.rm(object);
                    handler.remove(object);
                } else {
                    self.missing.add(object.clone(), ae.version, Eversion::ZERO);
                }
            }
            Some(ae) if ae.version == prior && ae.is_delete() => {
                // Rolling back to a delete: the object must not exist.
                self.missing.rm(object);
                handler.remove(object);
            }
            _ => {
                if prior.is_zero() {
                    // Created by the divergent entries alone.
                    self.missing.rm(object);
                    handler.remove(object);
                } else if prior > self.log.tail() {
                    self.missing.add(object.clone(), prior, Eversion::ZERO);
                } else {
                    self.divergent_priors.insert(prior, object.clone());
                }
            }
        }
        Ok(())
    }
}

/// Groups divergent entries per object, preserving first-seen object order
/// and validating that each object's entries form a contiguous chain.
fn group_by_object(
    entries: &[PgLogEntry],
) -> Result<Vec<(ObjectId, Vec<PgLogEntry>)>> {
    let mut order: Vec<ObjectId> = Vec::new();
    let mut groups: HashMap<ObjectId, Vec<PgLogEntry>> = HashMap::new();

    for entry in entries {
        let group = groups.entry(entry.object.clone()).or_insert_with(|| {
            order.push(entry.object.clone());
            Vec::new()
        });
        if let Some(last) = group.last() {
            if entry.prior_version != last.version {
                return Err(Error::invariant(format!(
                    "divergent entries for {} not contiguous: {} does not follow {}",
                    entry.object, entry.version, last.version
                )));
            }
        }
        group.push(entry.clone());
    }

    Ok(order
        .into_iter()
        .filter_map(|oid| groups.remove(&oid).map(|g| (oid, g)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::PgLogEntry;

    fn ev(epoch: u64, version: u64) -> Eversion {
        Eversion::new(epoch, version)
    }

    fn obj(name: &str) -> ObjectId {
        ObjectId::head(name)
    }

    fn modify(name: &str, version: Eversion, prior: Eversion) -> PgLogEntry {
        PgLogEntry::modify(obj(name), version, prior)
    }

    fn delete(name: &str, version: Eversion, prior: Eversion) -> PgLogEntry {
        PgLogEntry::delete(obj(name), version, prior)
    }

    fn log(tail: Eversion, entries: Vec<PgLogEntry>) -> IndexedLog {
        IndexedLog::from_entries(tail, entries).unwrap()
    }

    fn info(log: &IndexedLog) -> PgInfo {
        PgInfo { last_update: log.head(), last_complete: log.head(), log_tail: log.tail() }
    }

    /// Records every callback for assertion.
    #[derive(Default)]
    struct Recording {
        rollbacks: Vec<Eversion>,
        removed: Vec<ObjectId>,
        trimmed: Vec<Eversion>,
    }

    impl DivergenceHandler for Recording {
        fn rollback(&mut self, entry: &PgLogEntry) {
            self.rollbacks.push(entry.version);
        }
        fn remove(&mut self, object: &ObjectId) {
            self.removed.push(object.clone());
        }
        fn trim(&mut self, entry: &PgLogEntry) {
            self.trimmed.push(entry.version);
        }
    }

    #[test]
    fn test_merge_extends_tail() {
        // Local log starts at tail (1,2); authoritative reaches back to zero.
        let local = log(ev(1, 2), vec![modify("a", ev(1, 3), ev(1, 1))]);
        let olog = log(
            Eversion::ZERO,
            vec![
                modify("b", ev(1, 1), Eversion::ZERO),
                modify("c", ev(1, 2), Eversion::ZERO),
                modify("a", ev(1, 3), ev(1, 1)),
            ],
        );

        let mut info = info(&local);
        let mut pg = PgLog::new(local, MissingSet::new());
        let mut h = Recording::default();
        pg.merge_log(&olog, &mut info, &mut h).unwrap();

        assert_eq!(pg.log().tail(), Eversion::ZERO);
        assert_eq!(pg.log().len(), 3);
        assert_eq!(pg.log().head(), ev(1, 3));
        assert!(pg.missing().is_empty());
        assert!(h.rollbacks.is_empty());
        assert_eq!(info.log_tail, Eversion::ZERO);
    }

    #[test]
    fn test_merge_catch_up_marks_missing() {
        // Authoritative log is strictly ahead; no divergence.
        let shared = modify("a", ev(1, 1), Eversion::ZERO);
        let local = log(Eversion::ZERO, vec![shared.clone()]);
        let olog = log(
            Eversion::ZERO,
            vec![
                shared,
                modify("b", ev(1, 2), Eversion::ZERO),
                modify("b", ev(1, 3), ev(1, 2)),
            ],
        );

        let mut info = info(&local);
        let mut pg = PgLog::new(local, MissingSet::new());
        let mut h = Recording::default();
        pg.merge_log(&olog, &mut info, &mut h).unwrap();

        assert_eq!(info.last_update, ev(1, 3));
        assert_eq!(pg.log().head(), ev(1, 3));
        let item = pg.missing().get(&obj("b")).unwrap();
        assert_eq!(item.need, ev(1, 3));
        assert_eq!(item.have, Eversion::ZERO);
        assert!(h.rollbacks.is_empty());
    }

    #[test]
    fn test_merge_authoritative_delete_removes() {
        // P3: an authoritative delete supersedes a local modify; the object
        // is surfaced to the removal handler and is not missing.
        let shared = modify("a", ev(1, 1), Eversion::ZERO);
        let local = log(
            Eversion::ZERO,
            vec![shared.clone(), modify("victim", ev(1, 2), Eversion::ZERO)],
        );
        let olog = log(
            Eversion::ZERO,
            vec![
                shared,
                modify("victim", ev(1, 2), Eversion::ZERO),
                delete("victim", ev(1, 3), ev(1, 2)),
            ],
        );

        let mut info = info(&local);
        let mut pg = PgLog::new(local, MissingSet::new());
        let mut h = Recording::default();
        pg.merge_log(&olog, &mut info, &mut h).unwrap();

        assert_eq!(h.removed, vec![obj("victim")]);
        assert!(!pg.missing().is_missing(&obj("victim")));
        assert_eq!(info.last_update, ev(1, 3));
    }

    #[test]
    fn test_merge_divergent_rolls_back_to_prior() {
        // P1: local entries past the shared point roll back; the object
        // becomes missing at its authoritative prior version.
        let shared0 = modify("a", ev(1, 1), Eversion::ZERO);
        let shared1 = modify("d", ev(1, 2), Eversion::ZERO);
        let local = log(
            Eversion::ZERO,
            vec![
                shared0.clone(),
                shared1.clone(),
                modify("d", ev(1, 3), ev(1, 2)),
                modify("d", ev(1, 4), ev(1, 3)),
            ],
        );
        let olog = log(
            Eversion::ZERO,
            vec![shared0, shared1, modify("b", ev(2, 1), Eversion::ZERO)],
        );

        let mut info = info(&local);
        let mut pg = PgLog::new(local, MissingSet::new());
        let mut h = Recording::default();
        pg.merge_log(&olog, &mut info, &mut h).unwrap();

        // Rollbacks surfaced newest-first.
        assert_eq!(h.rollbacks, vec![ev(1, 4), ev(1, 3)]);
        let item = pg.missing().get(&obj("d")).unwrap();
        assert_eq!(item.need, ev(1, 2));
        // The divergent entries are gone from the log.
        assert!(pg.log().entry_at(ev(1, 3)).is_none());
        assert_eq!(info.last_update, ev(2, 1));
        assert!(pg.missing().is_missing(&obj("b")));
    }

    #[test]
    fn test_merge_same_version_delete_vs_modify() {
        // P2: local delete vs authoritative modify at the same version; the
        // object becomes missing at the authoritative version.
        let shared = modify("a", ev(1, 1), Eversion::ZERO);
        let prior = modify("x", ev(1, 2), Eversion::ZERO);
        let local = log(
            Eversion::ZERO,
            vec![shared.clone(), prior.clone(), delete("x", ev(1, 3), ev(1, 2))],
        );
        let olog = log(
            Eversion::ZERO,
            vec![shared, prior, modify("x", ev(1, 3), ev(1, 2)), modify("y", ev(1, 4), Eversion::ZERO)],
        );

        let mut info = info(&local);
        let mut pg = PgLog::new(local, MissingSet::new());
        let mut h = Recording::default();
        pg.merge_log(&olog, &mut info, &mut h).unwrap();

        let item = pg.missing().get(&obj("x")).unwrap();
        assert_eq!(item.need, ev(1, 3));
        assert_eq!(item.have, Eversion::ZERO);
        assert_eq!(h.rollbacks, vec![ev(1, 3)]);
        assert_eq!(info.last_update, ev(1, 4));
    }

    #[test]
    fn test_merge_divergent_created_object_removed() {
        // A divergent chain that created the object from nothing: the object
        // must not survive, and is not missing.
        let shared = modify("a", ev(1, 1), Eversion::ZERO);
        let local = log(
            Eversion::ZERO,
            vec![
                shared.clone(),
                modify("ghost", ev(1, 2), Eversion::ZERO),
                modify("ghost", ev(1, 3), ev(1, 2)),
            ],
        );
        let olog = log(Eversion::ZERO, vec![shared, modify("b", ev(2, 1), Eversion::ZERO)]);

        let mut info = info(&local);
        let mut pg = PgLog::new(local, MissingSet::new());
        let mut h = Recording::default();
        pg.merge_log(&olog, &mut info, &mut h).unwrap();

        assert_eq!(h.removed, vec![obj("ghost")]);
        assert!(!pg.missing().is_missing(&obj("ghost")));
        assert_eq!(h.rollbacks, vec![ev(1, 3), ev(1, 2)]);
    }

    #[test]
    fn test_merge_divergent_prior_before_tail() {
        // P4: the divergent entry's prior precedes the log tail, so the
        // object lands in the divergent-priors side map.
        let shared = modify("a", ev(1, 5), ev(1, 4));
        let local = log(
            ev(1, 4),
            vec![shared.clone(), modify("old", ev(1, 6), ev(1, 2))],
        );
        let olog = log(ev(1, 4), vec![shared, modify("b", ev(2, 1), Eversion::ZERO)]);

        let mut info = info(&local);
        let mut pg = PgLog::new(local, MissingSet::new());
        let mut h = Recording::default();
        pg.merge_log(&olog, &mut info, &mut h).unwrap();

        assert_eq!(pg.divergent_priors().get(&ev(1, 2)), Some(&obj("old")));
        assert!(!pg.missing().is_missing(&obj("old")));
        assert_eq!(h.rollbacks, vec![ev(1, 6)]);
    }

    #[test]
    fn test_merge_divergent_prior_is_delete() {
        // Rolling back to a prior entry that deleted the object: it must be
        // removed rather than recovered.
        let del = delete("x", ev(1, 2), ev(1, 1));
        let local = log(
            Eversion::ZERO,
            vec![
                modify("x", ev(1, 1), Eversion::ZERO),
                del.clone(),
                modify("x", ev(1, 3), ev(1, 2)),
            ],
        );
        let olog = log(
            Eversion::ZERO,
            vec![modify("x", ev(1, 1), Eversion::ZERO), del, modify("b", ev(2, 1), Eversion::ZERO)],
        );

        let mut info = info(&local);
        let mut pg = PgLog::new(local, MissingSet::new());
        let mut h = Recording::default();
        pg.merge_log(&olog, &mut info, &mut h).unwrap();

        assert_eq!(h.removed, vec![obj("x")]);
        assert!(!pg.missing().is_missing(&obj("x")));
    }

    #[test]
    fn test_merge_rejects_non_overlapping_logs() {
        let local = log(Eversion::ZERO, vec![modify("a", ev(1, 1), Eversion::ZERO)]);
        let olog = log(ev(5, 1), vec![modify("b", ev(5, 2), Eversion::ZERO)]);

        let mut pi = info(&local);
        let mut pg = PgLog::new(local, MissingSet::new());
        let mut h = Recording::default();
        let err = pg.merge_log(&olog, &mut pi, &mut h).unwrap_err();
        assert!(err.is(cairn_core::ErrorCode::InvariantViolation));
    }

    #[test]
    fn test_rewind_divergent_log() {
        // P5: rewind retains entries <= newhead, rolls the rest back
        // newest-first, and advances last_update/last_complete to newhead.
        let local = log(
            Eversion::ZERO,
            vec![
                modify("a", ev(1, 1), Eversion::ZERO),
                modify("b", ev(1, 2), Eversion::ZERO),
                modify("b", ev(1, 3), ev(1, 2)),
                modify("a", ev(1, 4), ev(1, 1)),
            ],
        );

        let mut pi = info(&local);
        let mut pg = PgLog::new(local, MissingSet::new());
        let mut h = Recording::default();
        pg.rewind_divergent_log(ev(1, 2), &mut pi, &mut h).unwrap();

        assert_eq!(pg.log().head(), ev(1, 2));
        assert_eq!(pg.log().len(), 2);
        assert_eq!(pi.last_update, ev(1, 2));
        assert_eq!(pi.last_complete, ev(1, 2));
        assert_eq!(h.rollbacks, vec![ev(1, 4), ev(1, 3)]);

        // b survives at (1,2) but its divergent (1,3) rolled back: missing
        // at the retained prior. a rolls back to its prior (1,1).
        assert_eq!(pg.missing().get(&obj("b")).unwrap().need, ev(1, 2));
        assert_eq!(pg.missing().get(&obj("a")).unwrap().need, ev(1, 1));
    }

    #[test]
    fn test_rewind_bounds() {
        let local = log(ev(1, 2), vec![modify("a", ev(1, 3), ev(1, 1))]);
        let mut pi = info(&local);
        let mut pg = PgLog::new(local, MissingSet::new());
        let mut h = Recording::default();

        assert!(pg.rewind_divergent_log(ev(1, 1), &mut pi, &mut h).is_err());
        assert!(pg.rewind_divergent_log(ev(1, 9), &mut pi, &mut h).is_err());
        // Rewinding to the current head is a no-op.
        assert!(pg.rewind_divergent_log(ev(1, 3), &mut pi, &mut h).is_ok());
        assert!(h.rollbacks.is_empty());
    }

    #[test]
    fn test_proc_replica_log_divergent() {
        // Replica wrote past the shared point along a lost history.
        let shared = modify("a", ev(1, 2), ev(1, 1));
        let authoritative = log(
            ev(1, 1),
            vec![shared.clone(), modify("b", ev(2, 1), Eversion::ZERO)],
        );
        let olog = log(
            ev(1, 1),
            vec![shared, modify("c", ev(1, 3), Eversion::ZERO), modify("a", ev(1, 4), ev(1, 2))],
        );

        let pg = PgLog::new(authoritative, MissingSet::new());
        let mut oinfo =
            PgInfo { last_update: ev(1, 4), last_complete: ev(1, 4), log_tail: ev(1, 1) };
        let mut omissing = MissingSet::new();
        pg.proc_replica_log(&mut oinfo, &olog, &mut omissing).unwrap();

        assert_eq!(oinfo.last_update, ev(1, 2));
        // c was created divergently: not missing. a rolls back to (1,2).
        assert!(!omissing.is_missing(&obj("c")));
        assert_eq!(omissing.get(&obj("a")).unwrap().need, ev(1, 2));
        // last_complete stops before the first missing need.
        assert!(oinfo.last_complete < ev(1, 2));
    }

    #[test]
    fn test_proc_replica_log_clean() {
        let shared = vec![
            modify("a", ev(1, 1), Eversion::ZERO),
            modify("b", ev(1, 2), Eversion::ZERO),
        ];
        let authoritative = log(Eversion::ZERO, shared.clone());
        let olog = log(Eversion::ZERO, shared);

        let pg = PgLog::new(authoritative, MissingSet::new());
        let mut oinfo =
            PgInfo { last_update: ev(1, 2), last_complete: ev(1, 2), log_tail: Eversion::ZERO };
        let mut omissing = MissingSet::new();
        pg.proc_replica_log(&mut oinfo, &olog, &mut omissing).unwrap();

        assert_eq!(oinfo.last_update, ev(1, 2));
        assert_eq!(oinfo.last_complete, ev(1, 2));
        assert!(omissing.is_empty());
    }

    #[test]
    fn test_proc_replica_log_delete_superseded() {
        // Replica divergently modified an object our history deleted.
        let shared = modify("a", ev(1, 1), Eversion::ZERO);
        let authoritative = log(
            Eversion::ZERO,
            vec![
                shared.clone(),
                modify("x", ev(1, 2), Eversion::ZERO),
                delete("x", ev(2, 1), ev(1, 2)),
            ],
        );
        let olog = log(
            Eversion::ZERO,
            vec![shared, modify("x", ev(1, 2), Eversion::ZERO), modify("x", ev(1, 3), ev(1, 2))],
        );

        let pg = PgLog::new(authoritative, MissingSet::new());
        let mut oinfo =
            PgInfo { last_update: ev(1, 3), last_complete: ev(1, 3), log_tail: Eversion::ZERO };
        let mut omissing = MissingSet::new();
        pg.proc_replica_log(&mut oinfo, &olog, &mut omissing).unwrap();

        // Our newest entry for x is the delete: the replica should not be
        // recovering x at all.
        assert!(!omissing.is_missing(&obj("x")));
        assert_eq!(oinfo.last_update, ev(1, 2));
    }

    #[test]
    fn test_catch_up_missing() {
        let pg = PgLog::new(
            log(
                Eversion::ZERO,
                vec![
                    modify("a", ev(1, 1), Eversion::ZERO),
                    modify("b", ev(1, 2), Eversion::ZERO),
                    delete("a", ev(1, 3), ev(1, 1)),
                ],
            ),
            MissingSet::new(),
        );

        let mut omissing = MissingSet::new();
        pg.catch_up_missing(ev(1, 1), &mut omissing);

        assert_eq!(omissing.get(&obj("b")).unwrap().need, ev(1, 2));
        // The delete means a is not wanted.
        assert!(!omissing.is_missing(&obj("a")));
    }

    #[test]
    fn test_trim() {
        let local = log(
            Eversion::ZERO,
            vec![
                modify("a", ev(1, 1), Eversion::ZERO),
                modify("b", ev(1, 2), Eversion::ZERO),
                modify("c", ev(1, 3), Eversion::ZERO),
            ],
        );
        let mut pi = info(&local);
        let mut pg = PgLog::new(local, MissingSet::new());
        let mut h = Recording::default();

        pg.trim(&mut pi, ev(1, 2), &mut h).unwrap();
        assert_eq!(h.trimmed, vec![ev(1, 1), ev(1, 2)]);
        assert_eq!(pg.log().tail(), ev(1, 2));
        assert_eq!(pi.log_tail, ev(1, 2));
        assert_eq!(pg.log().len(), 1);

        // Trimming past last_complete is refused.
        pi.last_complete = ev(1, 2);
        let err = pg.trim(&mut pi, ev(1, 3), &mut h).unwrap_err();
        assert!(err.is(cairn_core::ErrorCode::InvariantViolation));
    }

    #[test]
    fn test_add_unapplied_updates_missing() {
        let mut pg = PgLog::new(
            log(Eversion::ZERO, vec![modify("a", ev(1, 1), Eversion::ZERO)]),
            MissingSet::new(),
        );

        pg.add(modify("b", ev(1, 2), Eversion::ZERO), false).unwrap();
        assert!(pg.missing().is_missing(&obj("b")));
        assert_eq!(pg.log().head(), ev(1, 2));

        pg.add(modify("c", ev(1, 3), Eversion::ZERO), true).unwrap();
        assert!(!pg.missing().is_missing(&obj("c")));
    }

    #[test]
    fn test_group_by_object_rejects_gaps() {
        let entries = vec![
            modify("a", ev(1, 2), ev(1, 1)),
            // (1,4)'s prior should be (1,2) to chain onto the entry above.
            modify("a", ev(1, 4), ev(1, 3)),
        ];
        assert!(group_by_object(&entries).is_err());

        let ok = vec![modify("a", ev(1, 2), ev(1, 1)), modify("a", ev(1, 3), ev(1, 2))];
        let groups = group_by_object(&ok).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].1.len(), 2);
    }

    #[test]
    fn test_merge_log_is_idempotent_on_equal_heads() {
        let entries = vec![modify("a", ev(1, 1), Eversion::ZERO)];
        let local = log(Eversion::ZERO, entries.clone());
        let olog = log(Eversion::ZERO, entries);

        let mut pi = info(&local);
        let mut pg = PgLog::new(local, MissingSet::new());
        let mut h = Recording::default();
        pg.merge_log(&olog, &mut pi, &mut h).unwrap();

        assert!(h.rollbacks.is_empty());
        assert!(h.removed.is_empty());
        assert!(pg.missing().is_empty());
    }

    #[test]
    fn test_divergent_delete_rolls_back_to_modify() {
        // A divergent local delete whose prior is a retained modify: the
        // object is missing at the prior version (content was discarded).
        let keep = modify("x", ev(1, 2), Eversion::ZERO);
        let local = log(
            Eversion::ZERO,
            vec![keep.clone(), delete("x", ev(1, 3), ev(1, 2))],
        );
        let olog = log(Eversion::ZERO, vec![keep, modify("b", ev(2, 1), Eversion::ZERO)]);

        let mut pi = info(&local);
        let mut pg = PgLog::new(local, MissingSet::new());
        let mut h = Recording::default();
        pg.merge_log(&olog, &mut pi, &mut h).unwrap();

        assert_eq!(pg.missing().get(&obj("x")).unwrap().need, ev(1, 2));
        assert_eq!(h.rollbacks, vec![ev(1, 3)]);
        assert!(h.removed.is_empty());
    }

    #[test]
    fn test_recording_handler_sees_reverse_order_across_objects() {
        // Rollbacks fire globally newest-first, across objects.
        let shared = modify("s", ev(1, 1), Eversion::ZERO);
        let local = log(
            Eversion::ZERO,
            vec![
                shared.clone(),
                modify("a", ev(1, 2), Eversion::ZERO),
                modify("b", ev(1, 3), Eversion::ZERO),
                modify("a", ev(1, 4), ev(1, 2)),
            ],
        );
        let olog = log(Eversion::ZERO, vec![shared, modify("z", ev(2, 1), Eversion::ZERO)]);

        let mut pi = info(&local);
        let mut pg = PgLog::new(local, MissingSet::new());
        let mut h = Recording::default();
        pg.merge_log(&olog, &mut pi, &mut h).unwrap();

        assert_eq!(h.rollbacks, vec![ev(1, 4), ev(1, 3), ev(1, 2)]);
    }
}
