//! Subscription tracking for versioned cluster maps.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Flags attached to a map subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SubFlags(u32);

impl SubFlags {
    /// No flags: the subscription is continuous.
    pub const NONE: Self = Self(0);
    /// The subscription is retired after its first delivery.
    pub const ONETIME: Self = Self(1);

    /// Returns true if all bits of `other` are set.
    #[must_use]
    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

/// What a session wants from one map: the first version of interest and the
/// subscription flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubTarget {
    /// First version the subscriber has not yet seen.
    pub start: u64,
    /// Subscription flags.
    pub flags: SubFlags,
}

/// Per-session subscription state, keyed by map name.
///
/// Wants are split into *pending* (not yet communicated) and *sent* so a
/// session can tell which subscriptions need renewal after a reconnect.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionMap {
    pending: HashMap<String, SubTarget>,
    sent: HashMap<String, SubTarget>,
}

impl SubscriptionMap {
    /// Creates an empty subscription map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records interest in `name` starting at version `start`.
    ///
    /// Returns true if this changed the tracked state (and therefore needs
    /// to be communicated). Asking again with the same flags and an equal or
    /// newer start already covered by the existing want is a no-op.
    pub fn want(&mut self, name: &str, start: u64, flags: SubFlags) -> bool {
        let covered = |t: &SubTarget| t.start <= start && t.flags == flags;
        if self.pending.get(name).is_some_and(covered) {
            return false;
        }
        if self.pending.get(name).is_none() && self.sent.get(name).is_some_and(covered) {
            return false;
        }
        self.pending.insert(name.to_string(), SubTarget { start, flags });
        true
    }

    /// Records that version `delivered` of `name` arrived.
    ///
    /// A one-shot subscription is retired; otherwise the next desired start
    /// becomes `delivered + 1`.
    pub fn got(&mut self, name: &str, delivered: u64) {
        let onetime = self
            .target(name)
            .is_some_and(|t| t.flags.contains(SubFlags::ONETIME));
        if onetime {
            self.pending.remove(name);
            self.sent.remove(name);
            return;
        }
        for map in [&mut self.pending, &mut self.sent] {
            if let Some(t) = map.get_mut(name) {
                if t.start <= delivered {
                    t.start = delivered + 1;
                }
            }
        }
    }

    /// Drops interest in `name` entirely.
    pub fn unwant(&mut self, name: &str) {
        self.pending.remove(name);
        self.sent.remove(name);
    }

    /// The current target for `name`, pending taking precedence over sent.
    #[must_use]
    pub fn target(&self, name: &str) -> Option<&SubTarget> {
        self.pending.get(name).or_else(|| self.sent.get(name))
    }

    /// Returns true if any map is subscribed.
    #[must_use]
    pub fn has_any(&self) -> bool {
        !self.pending.is_empty() || !self.sent.is_empty()
    }

    /// Takes everything pending, marking it sent.
    ///
    /// The returned map is what a session should communicate when it
    /// establishes or renews itself.
    pub fn renew(&mut self) -> HashMap<String, SubTarget> {
        let out = std::mem::take(&mut self.pending);
        for (name, target) in &out {
            self.sent.insert(name.clone(), *target);
        }
        out
    }

    /// Moves all sent wants back to pending, for session re-establishment.
    pub fn reset(&mut self) {
        for (name, target) in self.sent.drain() {
            self.pending.entry(name).or_insert(target);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_want_tracks_changes() {
        let mut subs = SubscriptionMap::new();

        assert!(subs.want("osdmap", 5, SubFlags::NONE));
        // Same or newer start, same flags: no change needed.
        assert!(!subs.want("osdmap", 5, SubFlags::NONE));
        assert!(!subs.want("osdmap", 9, SubFlags::NONE));
        // An earlier start widens the want.
        assert!(subs.want("osdmap", 2, SubFlags::NONE));
        assert_eq!(subs.target("osdmap").unwrap().start, 2);
        // Changing flags is a change.
        assert!(subs.want("osdmap", 2, SubFlags::ONETIME));
    }

    #[test]
    fn test_got_advances_start() {
        let mut subs = SubscriptionMap::new();
        subs.want("osdmap", 3, SubFlags::NONE);

        subs.got("osdmap", 7);
        assert_eq!(subs.target("osdmap").unwrap().start, 8);

        // Deliveries older than the current start do not move it backwards.
        subs.got("osdmap", 4);
        assert_eq!(subs.target("osdmap").unwrap().start, 8);
    }

    #[test]
    fn test_got_retires_onetime() {
        let mut subs = SubscriptionMap::new();
        subs.want("monmap", 1, SubFlags::ONETIME);

        subs.got("monmap", 3);
        assert!(subs.target("monmap").is_none());
        assert!(!subs.has_any());
    }

    #[test]
    fn test_renew_and_reset() {
        let mut subs = SubscriptionMap::new();
        subs.want("osdmap", 1, SubFlags::NONE);
        subs.want("monmap", 2, SubFlags::ONETIME);

        let sent = subs.renew();
        assert_eq!(sent.len(), 2);
        // Nothing pending after renewal; wants are still tracked as sent.
        assert!(subs.renew().is_empty());
        assert!(subs.target("osdmap").is_some());

        // Re-wanting something already sent with the same coverage is a
        // no-op; after a session reset it must be sent again.
        assert!(!subs.want("osdmap", 1, SubFlags::NONE));
        subs.reset();
        let resent = subs.renew();
        assert_eq!(resent.len(), 2);
    }

    #[test]
    fn test_got_advances_sent_state() {
        let mut subs = SubscriptionMap::new();
        subs.want("osdmap", 1, SubFlags::NONE);
        subs.renew();

        subs.got("osdmap", 1);
        assert_eq!(subs.target("osdmap").unwrap().start, 2);
    }

    #[test]
    fn test_unwant() {
        let mut subs = SubscriptionMap::new();
        subs.want("osdmap", 1, SubFlags::NONE);
        subs.renew();
        subs.unwant("osdmap");
        assert!(!subs.has_any());
    }

    #[test]
    fn test_flags_contains() {
        assert!(SubFlags::ONETIME.contains(SubFlags::ONETIME));
        assert!(SubFlags::ONETIME.contains(SubFlags::NONE));
        assert!(!SubFlags::NONE.contains(SubFlags::ONETIME));
    }
}
