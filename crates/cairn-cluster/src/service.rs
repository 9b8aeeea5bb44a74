//! In-process map service: publishes versioned maps to subscribed sessions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use metrics::{counter, gauge};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use cairn_core::{Error, ErrorCode, Result};

use crate::sub::{SubFlags, SubscriptionMap};

/// One delivered map version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapUpdate {
    /// Map name (e.g. `"osdmap"`).
    pub name: String,
    /// Version of the delivered map.
    pub epoch: u64,
    /// Opaque encoded map payload.
    pub payload: Bytes,
}

struct Session {
    identity: String,
    subs: RwLock<SubscriptionMap>,
    tx: mpsc::UnboundedSender<MapUpdate>,
}

/// A connected session's receiving side.
pub struct SessionHandle {
    /// Session id, used for subscribe/disconnect calls.
    pub id: u64,
    rx: mpsc::UnboundedReceiver<MapUpdate>,
}

impl SessionHandle {
    /// Waits for the next map delivery. Returns `None` once disconnected.
    pub async fn recv(&mut self) -> Option<MapUpdate> {
        self.rx.recv().await
    }

    /// Returns the next delivery if one is already queued.
    pub fn try_recv(&mut self) -> Option<MapUpdate> {
        self.rx.try_recv().ok()
    }
}

/// Publishes versioned maps and delivers them to subscribed sessions.
///
/// Each named map carries a monotonically increasing epoch. Sessions
/// subscribe with a start version; every publish at or past a session's
/// start is delivered, after which the session's want advances (or retires,
/// for one-shot subscriptions).
pub struct MapService {
    maps: RwLock<HashMap<String, Vec<(u64, Bytes)>>>,
    sessions: DashMap<u64, Arc<Session>>,
    next_session: AtomicU64,
}

impl MapService {
    /// Creates a service with no maps and no sessions.
    #[must_use]
    pub fn new() -> Self {
        Self {
            maps: RwLock::new(HashMap::new()),
            sessions: DashMap::new(),
            next_session: AtomicU64::new(1),
        }
    }

    /// Opens a session for the given client identity.
    pub fn connect(&self, identity: &str) -> SessionHandle {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::new(Session {
            identity: identity.to_string(),
            subs: RwLock::new(SubscriptionMap::new()),
            tx,
        });
        self.sessions.insert(id, session);
        gauge!("cairn_map_sessions").set(self.sessions.len() as f64);
        debug!(session = id, identity, "map session connected");
        SessionHandle { id, rx }
    }

    /// Closes a session.
    pub fn disconnect(&self, session_id: u64) {
        if let Some((_, session)) = self.sessions.remove(&session_id) {
            debug!(session = session_id, identity = %session.identity, "map session disconnected");
        }
        gauge!("cairn_map_sessions").set(self.sessions.len() as f64);
    }

    /// Subscribes a session to `name` starting at version `start`.
    ///
    /// Returns true if the want changed. Versions already published at or
    /// past `start` are delivered immediately, newest last.
    pub fn subscribe(
        &self,
        session_id: u64,
        name: &str,
        start: u64,
        flags: SubFlags,
    ) -> Result<bool> {
        let session = self
            .sessions
            .get(&session_id)
            .ok_or_else(|| Error::new(ErrorCode::NotFound, format!("no session {session_id}")))?
            .clone();

        let changed = session.subs.write().want(name, start, flags);
        if !changed {
            return Ok(false);
        }
        session.subs.write().renew();

        // Deliver anything already published that the want covers.
        let backlog: Vec<(u64, Bytes)> = {
            let maps = self.maps.read();
            maps.get(name)
                .map(|versions| {
                    versions
                        .iter()
                        .filter(|(epoch, _)| *epoch >= start)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };
        for (epoch, payload) in backlog {
            if !Self::deliver(&session, name, epoch, &payload) {
                break;
            }
        }
        Ok(true)
    }

    /// Publishes a new version of `name`, delivering it to every session
    /// whose want covers it. Returns the assigned epoch.
    pub fn publish(&self, name: &str, payload: Bytes) -> u64 {
        let epoch = {
            let mut maps = self.maps.write();
            let versions = maps.entry(name.to_string()).or_default();
            let epoch = versions.last().map_or(1, |(e, _)| e + 1);
            versions.push((epoch, payload.clone()));
            epoch
        };
        counter!("cairn_map_publishes_total", "map" => name.to_string()).increment(1);
        trace!(map = name, epoch, "published map");

        for entry in &self.sessions {
            Self::deliver(entry.value(), name, epoch, &payload);
        }
        epoch
    }

    /// The newest published version of `name`, if any.
    #[must_use]
    pub fn latest(&self, name: &str) -> Option<(u64, Bytes)> {
        self.maps.read().get(name).and_then(|v| v.last().cloned())
    }

    /// Sends one version to one session if its subscription covers it, then
    /// advances the want. Returns false if the session wants nothing more
    /// from this map.
    fn deliver(session: &Session, name: &str, epoch: u64, payload: &Bytes) -> bool {
        let wanted = {
            let subs = session.subs.read();
            subs.target(name).is_some_and(|t| t.start <= epoch)
        };
        if !wanted {
            return session.subs.read().target(name).is_some();
        }

        let update =
            MapUpdate { name: name.to_string(), epoch, payload: payload.clone() };
        if session.tx.send(update).is_err() {
            // Receiver dropped; the session will be reaped on disconnect.
            return false;
        }
        let mut subs = session.subs.write();
        subs.got(name, epoch);
        subs.target(name).is_some()
    }
}

impl Default for MapService {
    fn default() -> Self {
        Self::new()
    }
}
