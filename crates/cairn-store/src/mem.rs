//! The in-memory object store.
//!
//! `MemStore` implements the full [`ObjectStore`] surface in memory: pools
//! of objects with data, xattrs and omap, self-managed snapshot clones,
//! watch/notify, class-method dispatch and quotas. The whole store can be
//! snapshotted to a file and reloaded, which is what gives the command-line
//! tool durable state between invocations.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use cairn_core::{Error, ErrorCode, Result, SnapId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::classes::ClassRegistry;
use crate::store::{ObjectInfo, ObjectStore, PoolQuota, SnapContext};
use crate::watch::{Notification, NotifyAck, NotifyResult, WatchHandle};

/// The mutable content of one object: byte data, extended attributes and a
/// sorted key-value map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectData {
    /// Object byte data.
    pub data: Vec<u8>,
    /// Extended attributes.
    pub xattrs: BTreeMap<String, Vec<u8>>,
    /// Sorted key-value map.
    pub omap: BTreeMap<String, Vec<u8>>,
}

/// A preserved pre-write state covering one or more snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapClone {
    /// Snapshot ids this clone serves, ascending.
    covers: Vec<SnapId>,
    data: ObjectData,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ObjectState {
    /// The writable head, absent after a remove.
    head: Option<ObjectData>,
    /// Snapshot sequence the head was last written under.
    head_seq: u64,
    /// Bumped on every mutation; guards compare against it.
    version: u64,
    clones: Vec<SnapClone>,
    #[serde(skip)]
    watchers: HashMap<u64, mpsc::UnboundedSender<Notification>>,
}

impl ObjectState {
    fn exists(&self) -> bool {
        self.head.is_some() || !self.clones.is_empty()
    }

    /// Resolves the object content visible at `snap`.
    ///
    /// A clone covering the snapshot wins; otherwise the head serves the
    /// read only if it predates the snapshot (no write has happened since).
    fn resolve(&self, snap: SnapId) -> Option<&ObjectData> {
        if snap.is_head() {
            return self.head.as_ref();
        }
        self.clones
            .iter()
            .find(|c| c.covers.contains(&snap))
            .map(|c| &c.data)
            .or_else(|| {
                if self.head_seq < snap.0 {
                    self.head.as_ref()
                } else {
                    None
                }
            })
    }

    /// Preserves the head as a clone if a snapshot was taken since it was
    /// last written.
    fn maybe_clone(&mut self, snapc: &SnapContext) {
        if snapc.seq > self.head_seq {
            if let Some(head) = &self.head {
                let mut covers: Vec<SnapId> = snapc
                    .snaps
                    .iter()
                    .copied()
                    .filter(|s| s.0 > self.head_seq && s.0 <= snapc.seq)
                    .collect();
                if !covers.is_empty() {
                    covers.sort();
                    self.clones.push(SnapClone { covers, data: head.clone() });
                }
            }
            self.head_seq = snapc.seq;
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PoolState {
    objects: BTreeMap<String, ObjectState>,
    quota: PoolQuota,
    /// Pool-wide self-managed snapshot sequence.
    snap_seq: u64,
}

impl PoolState {
    fn usage(&self) -> (u64, u64) {
        let mut bytes = 0u64;
        let mut count = 0u64;
        for state in self.objects.values() {
            if let Some(head) = &state.head {
                bytes += head.data.len() as u64;
                count += 1;
            }
        }
        (bytes, count)
    }

    fn check_quota(&self) -> Result<()> {
        let (bytes, count) = self.usage();
        if self.quota.max_bytes.is_some_and(|max| bytes > max) {
            return Err(Error::new(
                ErrorCode::QuotaExceeded,
                format!("pool byte quota exceeded ({bytes} bytes)"),
            ));
        }
        if self.quota.max_objects.is_some_and(|max| count > max) {
            return Err(Error::new(
                ErrorCode::QuotaExceeded,
                format!("pool object quota exceeded ({count} objects)"),
            ));
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct StoreSnapshot {
    pools: BTreeMap<String, PoolState>,
}

/// In-memory implementation of [`ObjectStore`].
pub struct MemStore {
    pools: RwLock<BTreeMap<String, PoolState>>,
    registry: Arc<ClassRegistry>,
    next_watch: AtomicU64,
    next_notify: AtomicU64,
}

impl MemStore {
    /// Creates an empty store using the given class registry.
    #[must_use]
    pub fn new(registry: Arc<ClassRegistry>) -> Self {
        Self {
            pools: RwLock::new(BTreeMap::new()),
            registry,
            next_watch: AtomicU64::new(1),
            next_notify: AtomicU64::new(1),
        }
    }

    /// Loads a store snapshot from `path`.
    pub fn load(path: &Path, registry: Arc<ClassRegistry>) -> Result<Self> {
        let raw = std::fs::read(path)?;
        let snapshot: StoreSnapshot =
            bincode::deserialize(&raw).map_err(|e| Error::Encoding(e.to_string()))?;
        let store = Self::new(registry);
        *store.pools.write() = snapshot.pools;
        debug!(path = %path.display(), "loaded store snapshot");
        Ok(store)
    }

    /// Writes a store snapshot to `path` (write-then-rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        let snapshot = {
            let pools = self.pools.read();
            StoreSnapshot {
                pools: pools
                    .iter()
                    .map(|(name, state)| {
                        (
                            name.clone(),
                            PoolState {
                                objects: state
                                    .objects
                                    .iter()
                                    .map(|(oname, ostate)| {
                                        (
                                            oname.clone(),
                                            ObjectState {
                                                head: ostate.head.clone(),
                                                head_seq: ostate.head_seq,
                                                version: ostate.version,
                                                clones: ostate.clones.clone(),
                                                watchers: HashMap::new(),
                                            },
                                        )
                                    })
                                    .collect(),
                                quota: state.quota,
                                snap_seq: state.snap_seq,
                            },
                        )
                    })
                    .collect(),
            }
        };
        let raw = bincode::serialize(&snapshot).map_err(|e| Error::Encoding(e.to_string()))?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, raw)?;
        std::fs::rename(&tmp, path)?;
        trace!(path = %path.display(), "saved store snapshot");
        Ok(())
    }

    fn check_guard(state: &ObjectState, guard: Option<u64>) -> Result<()> {
        if let Some(expected) = guard {
            if state.version != expected {
                return Err(Error::new(
                    ErrorCode::Canceled,
                    format!("version guard failed: expected {expected}, found {}", state.version),
                ));
            }
        }
        Ok(())
    }

    /// Runs a mutation against an object's head under the pool lock.
    ///
    /// Handles object creation, version guards, snapshot clone-on-write,
    /// version bumps and quota enforcement (with rollback on violation).
    /// Returns the mutation result and the object's new version.
    fn mutate<R>(
        &self,
        pool: &str,
        object: &str,
        snapc: &SnapContext,
        guard: Option<u64>,
        create: bool,
        f: impl FnOnce(&mut ObjectData) -> Result<R>,
    ) -> Result<(R, u64)> {
        let mut pools = self.pools.write();
        let pool_state = pools
            .get_mut(pool)
            .ok_or_else(|| Error::new(ErrorCode::NoSuchPool, format!("no such pool: {pool}")))?;

        let has_quota =
            pool_state.quota.max_bytes.is_some() || pool_state.quota.max_objects.is_some();

        let mut created = false;
        if !pool_state.objects.contains_key(object) {
            if !create {
                return Err(Error::not_found(format!("no such object: {pool}/{object}")));
            }
            pool_state.objects.insert(object.to_string(), ObjectState::default());
            created = true;
        }
        let state = pool_state
            .objects
            .get_mut(object)
            .ok_or_else(|| Error::invariant("object vanished under pool lock"))?;

        if state.head.is_none() && !create {
            return Err(Error::not_found(format!("no such object: {pool}/{object}")));
        }
        Self::check_guard(state, guard)?;

        state.maybe_clone(snapc);
        let head_was_absent = state.head.is_none();
        if head_was_absent {
            state.head_seq = snapc.seq;
            state.head = Some(ObjectData::default());
        }

        let saved = if has_quota && !created {
            Some((state.head.clone(), state.version))
        } else {
            None
        };

        let head = state
            .head
            .as_mut()
            .ok_or_else(|| Error::invariant("head absent after creation"))?;
        let result = match f(head) {
            Ok(r) => r,
            Err(e) => {
                if created {
                    pool_state.objects.remove(object);
                } else if head_was_absent {
                    if let Some(state) = pool_state.objects.get_mut(object) {
                        state.head = None;
                    }
                }
                return Err(e);
            }
        };
        state.version += 1;
        let version = state.version;

        if has_quota {
            if let Err(e) = pool_state.check_quota() {
                if created {
                    pool_state.objects.remove(object);
                } else if let Some((head, version)) = saved {
                    if let Some(state) = pool_state.objects.get_mut(object) {
                        state.head = head;
                        state.version = version;
                    }
                }
                return Err(e);
            }
        }
        Ok((result, version))
    }

    /// Runs a read against the object content visible at `snap`.
    fn read_at<R>(
        &self,
        pool: &str,
        object: &str,
        snap: SnapId,
        f: impl FnOnce(&ObjectData) -> R,
    ) -> Result<R> {
        let pools = self.pools.read();
        let pool_state = pools
            .get(pool)
            .ok_or_else(|| Error::new(ErrorCode::NoSuchPool, format!("no such pool: {pool}")))?;
        let state = pool_state
            .objects
            .get(object)
            .filter(|s| s.exists())
            .ok_or_else(|| Error::not_found(format!("no such object: {pool}/{object}")))?;
        let data = state
            .resolve(snap)
            .ok_or_else(|| Error::not_found(format!("no such object: {pool}/{object}@{snap}")))?;
        Ok(f(data))
    }
}

impl ObjectStore for MemStore {
    async fn create_pool(&self, pool: &str) -> Result<()> {
        let mut pools = self.pools.write();
        if pools.contains_key(pool) {
            return Err(Error::new(ErrorCode::Exists, format!("pool exists: {pool}")));
        }
        pools.insert(pool.to_string(), PoolState::default());
        debug!(pool, "created pool");
        Ok(())
    }

    async fn delete_pool(&self, pool: &str) -> Result<()> {
        let mut pools = self.pools.write();
        if pools.remove(pool).is_none() {
            return Err(Error::new(ErrorCode::NoSuchPool, format!("no such pool: {pool}")));
        }
        debug!(pool, "deleted pool");
        Ok(())
    }

    async fn list_pools(&self) -> Result<Vec<String>> {
        Ok(self.pools.read().keys().cloned().collect())
    }

    async fn set_pool_quota(&self, pool: &str, quota: PoolQuota) -> Result<()> {
        let mut pools = self.pools.write();
        let pool_state = pools
            .get_mut(pool)
            .ok_or_else(|| Error::new(ErrorCode::NoSuchPool, format!("no such pool: {pool}")))?;
        pool_state.quota = quota;
        Ok(())
    }

    async fn list_objects(&self, pool: &str, prefix: &str) -> Result<Vec<String>> {
        let pools = self.pools.read();
        let pool_state = pools
            .get(pool)
            .ok_or_else(|| Error::new(ErrorCode::NoSuchPool, format!("no such pool: {pool}")))?;
        Ok(pool_state
            .objects
            .iter()
            .filter(|(name, state)| name.starts_with(prefix) && state.head.is_some())
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn stat(&self, pool: &str, object: &str) -> Result<ObjectInfo> {
        let pools = self.pools.read();
        let pool_state = pools
            .get(pool)
            .ok_or_else(|| Error::new(ErrorCode::NoSuchPool, format!("no such pool: {pool}")))?;
        let state = pool_state
            .objects
            .get(object)
            .ok_or_else(|| Error::not_found(format!("no such object: {pool}/{object}")))?;
        let head = state
            .head
            .as_ref()
            .ok_or_else(|| Error::not_found(format!("no such object: {pool}/{object}")))?;
        Ok(ObjectInfo { size: head.data.len() as u64, version: state.version })
    }

    async fn read(
        &self,
        pool: &str,
        object: &str,
        snap: SnapId,
        off: u64,
        len: u64,
    ) -> Result<Bytes> {
        self.read_at(pool, object, snap, |data| {
            let start = (off as usize).min(data.data.len());
            let end = (off.saturating_add(len) as usize).min(data.data.len());
            Bytes::copy_from_slice(&data.data[start..end])
        })
    }

    async fn write(
        &self,
        pool: &str,
        object: &str,
        snapc: &SnapContext,
        off: u64,
        data: Bytes,
        guard: Option<u64>,
    ) -> Result<u64> {
        let ((), version) = self.mutate(pool, object, snapc, guard, true, |head| {
            let end = off as usize + data.len();
            if head.data.len() < end {
                head.data.resize(end, 0);
            }
            head.data[off as usize..end].copy_from_slice(&data);
            Ok(())
        })?;
        Ok(version)
    }

    async fn write_full(
        &self,
        pool: &str,
        object: &str,
        snapc: &SnapContext,
        data: Bytes,
        guard: Option<u64>,
    ) -> Result<u64> {
        let ((), version) = self.mutate(pool, object, snapc, guard, true, |head| {
            head.data = data.to_vec();
            Ok(())
        })?;
        Ok(version)
    }

    async fn zero(
        &self,
        pool: &str,
        object: &str,
        snapc: &SnapContext,
        off: u64,
        len: u64,
        guard: Option<u64>,
    ) -> Result<u64> {
        let ((), version) = self.mutate(pool, object, snapc, guard, false, |head| {
            let start = (off as usize).min(head.data.len());
            let end = (off.saturating_add(len) as usize).min(head.data.len());
            head.data[start..end].fill(0);
            Ok(())
        })?;
        Ok(version)
    }

    async fn truncate(
        &self,
        pool: &str,
        object: &str,
        snapc: &SnapContext,
        size: u64,
        guard: Option<u64>,
    ) -> Result<u64> {
        let ((), version) = self.mutate(pool, object, snapc, guard, true, |head| {
            head.data.resize(size as usize, 0);
            Ok(())
        })?;
        Ok(version)
    }

    async fn remove(
        &self,
        pool: &str,
        object: &str,
        snapc: &SnapContext,
        guard: Option<u64>,
    ) -> Result<()> {
        let mut pools = self.pools.write();
        let pool_state = pools
            .get_mut(pool)
            .ok_or_else(|| Error::new(ErrorCode::NoSuchPool, format!("no such pool: {pool}")))?;
        let state = pool_state
            .objects
            .get_mut(object)
            .filter(|s| s.head.is_some())
            .ok_or_else(|| Error::not_found(format!("no such object: {pool}/{object}")))?;
        Self::check_guard(state, guard)?;

        state.maybe_clone(snapc);
        state.head = None;
        state.head_seq = snapc.seq;
        state.version += 1;
        if !state.exists() {
            pool_state.objects.remove(object);
        }
        Ok(())
    }

    async fn selfmanaged_snap_create(&self, pool: &str) -> Result<SnapId> {
        let mut pools = self.pools.write();
        let pool_state = pools
            .get_mut(pool)
            .ok_or_else(|| Error::new(ErrorCode::NoSuchPool, format!("no such pool: {pool}")))?;
        pool_state.snap_seq += 1;
        Ok(SnapId(pool_state.snap_seq))
    }

    async fn remove_snap(&self, pool: &str, snap: SnapId) -> Result<()> {
        let mut pools = self.pools.write();
        let pool_state = pools
            .get_mut(pool)
            .ok_or_else(|| Error::new(ErrorCode::NoSuchPool, format!("no such pool: {pool}")))?;
        pool_state.objects.retain(|_, state| {
            for clone in &mut state.clones {
                clone.covers.retain(|s| *s != snap);
            }
            state.clones.retain(|c| !c.covers.is_empty());
            state.exists()
        });
        Ok(())
    }

    async fn getxattr(&self, pool: &str, object: &str, name: &str) -> Result<Bytes> {
        self.read_at(pool, object, SnapId::HEAD, |data| {
            data.xattrs.get(name).map(|v| Bytes::copy_from_slice(v))
        })?
        .ok_or_else(|| Error::new(ErrorCode::NoData, format!("no xattr {name} on {object}")))
    }

    async fn setxattr(&self, pool: &str, object: &str, name: &str, value: Bytes) -> Result<()> {
        self.mutate(pool, object, &SnapContext::none(), None, true, |head| {
            head.xattrs.insert(name.to_string(), value.to_vec());
            Ok(())
        })
        .map(|_| ())
    }

    async fn rmxattr(&self, pool: &str, object: &str, name: &str) -> Result<()> {
        self.mutate(pool, object, &SnapContext::none(), None, false, |head| {
            head.xattrs
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| Error::new(ErrorCode::NoData, format!("no xattr {name}")))
        })
        .map(|_| ())
    }

    async fn omap_get(
        &self,
        pool: &str,
        object: &str,
        keys: &[String],
    ) -> Result<Vec<(String, Bytes)>> {
        self.read_at(pool, object, SnapId::HEAD, |data| {
            keys.iter()
                .filter_map(|k| {
                    data.omap.get(k).map(|v| (k.clone(), Bytes::copy_from_slice(v)))
                })
                .collect()
        })
    }

    async fn omap_set(&self, pool: &str, object: &str, kvs: Vec<(String, Bytes)>) -> Result<()> {
        self.mutate(pool, object, &SnapContext::none(), None, true, |head| {
            for (k, v) in kvs {
                head.omap.insert(k, v.to_vec());
            }
            Ok(())
        })
        .map(|_| ())
    }

    async fn omap_rm(&self, pool: &str, object: &str, keys: &[String]) -> Result<()> {
        self.mutate(pool, object, &SnapContext::none(), None, false, |head| {
            for k in keys {
                head.omap.remove(k);
            }
            Ok(())
        })
        .map(|_| ())
    }

    async fn omap_list(
        &self,
        pool: &str,
        object: &str,
        prefix: &str,
    ) -> Result<Vec<(String, Bytes)>> {
        self.read_at(pool, object, SnapId::HEAD, |data| {
            data.omap
                .iter()
                .filter(|(k, _)| k.starts_with(prefix))
                .map(|(k, v)| (k.clone(), Bytes::copy_from_slice(v)))
                .collect()
        })
    }

    async fn exec(
        &self,
        pool: &str,
        object: &str,
        class: &str,
        method: &str,
        input: Bytes,
    ) -> Result<Bytes> {
        let registry = Arc::clone(&self.registry);
        let (flags, body) = {
            let (flags, body) = registry.get(class, method)?;
            (*flags, Arc::clone(body))
        };
        trace!(pool, object, class, method, "dispatching class method");

        if flags.write {
            let (out, _) = self.mutate(
                pool,
                object,
                &SnapContext::none(),
                None,
                flags.creates,
                |head| body(head, &input),
            )?;
            return Ok(Bytes::from(out));
        }

        // Read-only methods run against a copy: no version bump, no
        // visible mutation even if the body writes.
        let out = self.read_at(pool, object, SnapId::HEAD, |data| {
            let mut scratch = data.clone();
            body(&mut scratch, &input)
        })??;
        Ok(Bytes::from(out))
    }

    async fn watch(&self, pool: &str, object: &str) -> Result<WatchHandle> {
        let mut pools = self.pools.write();
        let pool_state = pools
            .get_mut(pool)
            .ok_or_else(|| Error::new(ErrorCode::NoSuchPool, format!("no such pool: {pool}")))?;
        let state = pool_state
            .objects
            .get_mut(object)
            .filter(|s| s.head.is_some())
            .ok_or_else(|| Error::not_found(format!("no such object: {pool}/{object}")))?;

        let id = self.next_watch.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        state.watchers.insert(id, tx);
        debug!(pool, object, watch = id, "registered watch");
        Ok(WatchHandle { id, rx })
    }

    async fn unwatch(&self, pool: &str, object: &str, watch_id: u64) -> Result<()> {
        let mut pools = self.pools.write();
        let pool_state = pools
            .get_mut(pool)
            .ok_or_else(|| Error::new(ErrorCode::NoSuchPool, format!("no such pool: {pool}")))?;
        let state = pool_state
            .objects
            .get_mut(object)
            .ok_or_else(|| Error::not_found(format!("no such object: {pool}/{object}")))?;
        state.watchers.remove(&watch_id);
        Ok(())
    }

    async fn notify(
        &self,
        pool: &str,
        object: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<NotifyResult> {
        let notify_id = self.next_notify.fetch_add(1, Ordering::Relaxed);
        let (ack_tx, mut ack_rx) = mpsc::unbounded_channel();

        // Deliver under the lock, then wait for acks without holding it.
        let mut delivered: Vec<u64> = Vec::new();
        let mut dead: Vec<u64> = Vec::new();
        {
            let pools = self.pools.read();
            let pool_state = pools.get(pool).ok_or_else(|| {
                Error::new(ErrorCode::NoSuchPool, format!("no such pool: {pool}"))
            })?;
            let state = pool_state
                .objects
                .get(object)
                .filter(|s| s.head.is_some())
                .ok_or_else(|| Error::not_found(format!("no such object: {pool}/{object}")))?;

            for (id, tx) in &state.watchers {
                let notification = Notification {
                    notify_id,
                    payload: payload.clone(),
                    ack_tx: ack_tx.clone(),
                };
                if tx.send(notification).is_ok() {
                    delivered.push(*id);
                } else {
                    dead.push(*id);
                }
            }
        }
        drop(ack_tx);

        if !dead.is_empty() {
            let mut pools = self.pools.write();
            if let Some(state) =
                pools.get_mut(pool).and_then(|p| p.objects.get_mut(object))
            {
                for id in &dead {
                    state.watchers.remove(id);
                }
            }
        }

        let mut result = NotifyResult::default();
        if delivered.is_empty() {
            return Ok(result);
        }

        let mut pending: Vec<u64> = delivered.clone();
        let deadline = tokio::time::Instant::now() + timeout;
        while !pending.is_empty() {
            match tokio::time::timeout_at(deadline, ack_rx.recv()).await {
                Ok(Some(ack)) => {
                    pending.retain(|id| *id != ack.watcher);
                    result.acks.push(NotifyAck { watcher: ack.watcher, reply: ack.reply });
                }
                Ok(None) | Err(_) => break,
            }
        }
        result.timed_out = pending;
        Ok(result)
    }

    async fn list_watchers(&self, pool: &str, object: &str) -> Result<Vec<u64>> {
        let pools = self.pools.read();
        let pool_state = pools
            .get(pool)
            .ok_or_else(|| Error::new(ErrorCode::NoSuchPool, format!("no such pool: {pool}")))?;
        let state = pool_state
            .objects
            .get(object)
            .ok_or_else(|| Error::not_found(format!("no such object: {pool}/{object}")))?;
        let mut ids: Vec<u64> = state.watchers.keys().copied().collect();
        ids.sort_unstable();
        Ok(ids)
    }
}
