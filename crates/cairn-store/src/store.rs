//! Object store trait definition and common types.

use std::time::Duration;

use bytes::Bytes;
use cairn_core::{Result, SnapId};
use serde::{Deserialize, Serialize};

use crate::watch::{NotifyResult, WatchHandle};

/// The snapshot context a write is performed under.
///
/// `seq` is the newest snapshot id in existence for the logical entity the
/// object belongs to; `snaps` lists all of its snapshot ids, newest first.
/// The first write after a new snapshot preserves the previous head as a
/// clone covering the snapshots taken since the last preserved state.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SnapContext {
    /// Newest existing snapshot id, or 0 if none.
    pub seq: u64,
    /// All existing snapshot ids, newest first.
    pub snaps: Vec<SnapId>,
}

impl SnapContext {
    /// A context with no snapshots.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Builds a context from snapshot ids, newest first.
    #[must_use]
    pub fn new(seq: u64, snaps: Vec<SnapId>) -> Self {
        Self { seq, snaps }
    }
}

/// Basic object metadata returned by `stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Head data length in bytes.
    pub size: u64,
    /// Version counter, bumped on every mutation.
    pub version: u64,
}

/// Usage limits for a pool. `None` means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolQuota {
    /// Maximum total head bytes across the pool's objects.
    pub max_bytes: Option<u64>,
    /// Maximum number of live objects.
    pub max_objects: Option<u64>,
}

/// Trait for object storage backends.
///
/// Mutating calls that accept a `guard` assert that the object's version
/// still matches the one the caller observed; on mismatch they fail with
/// `Canceled` so the caller can re-read and retry (see
/// [`retry_guarded`](crate::retry_guarded)).
#[allow(async_fn_in_trait)]
pub trait ObjectStore: Send + Sync {
    // Pool operations

    /// Create a new pool.
    async fn create_pool(&self, pool: &str) -> Result<()>;

    /// Delete a pool and everything in it.
    async fn delete_pool(&self, pool: &str) -> Result<()>;

    /// List pool names.
    async fn list_pools(&self) -> Result<Vec<String>>;

    /// Set usage limits for a pool.
    async fn set_pool_quota(&self, pool: &str, quota: PoolQuota) -> Result<()>;

    // Object operations

    /// List object names with the given prefix, sorted.
    async fn list_objects(&self, pool: &str, prefix: &str) -> Result<Vec<String>>;

    /// Object size and version. Fails `NotFound` if the head is absent.
    async fn stat(&self, pool: &str, object: &str) -> Result<ObjectInfo>;

    /// Read `len` bytes at `off` from the head or a snapshot.
    ///
    /// Reads past the end are truncated; a read entirely past the end
    /// returns empty bytes.
    async fn read(
        &self,
        pool: &str,
        object: &str,
        snap: SnapId,
        off: u64,
        len: u64,
    ) -> Result<Bytes>;

    /// Write `data` at `off`, creating the object if needed.
    ///
    /// Returns the new object version.
    async fn write(
        &self,
        pool: &str,
        object: &str,
        snapc: &SnapContext,
        off: u64,
        data: Bytes,
        guard: Option<u64>,
    ) -> Result<u64>;

    /// Replace the object's entire data, creating it if needed.
    ///
    /// Returns the new object version.
    async fn write_full(
        &self,
        pool: &str,
        object: &str,
        snapc: &SnapContext,
        data: Bytes,
        guard: Option<u64>,
    ) -> Result<u64>;

    /// Zero `len` bytes at `off` without changing the object length.
    async fn zero(
        &self,
        pool: &str,
        object: &str,
        snapc: &SnapContext,
        off: u64,
        len: u64,
        guard: Option<u64>,
    ) -> Result<u64>;

    /// Truncate (or zero-extend) the head to `size` bytes.
    async fn truncate(
        &self,
        pool: &str,
        object: &str,
        snapc: &SnapContext,
        size: u64,
        guard: Option<u64>,
    ) -> Result<u64>;

    /// Remove the object head. Snapshots keep their preserved clones.
    async fn remove(
        &self,
        pool: &str,
        object: &str,
        snapc: &SnapContext,
        guard: Option<u64>,
    ) -> Result<()>;

    /// Allocate the next self-managed snapshot id from the pool-wide
    /// sequence. Ids are unique across everything in the pool.
    async fn selfmanaged_snap_create(&self, pool: &str) -> Result<SnapId>;

    /// Drop snapshot `snap` from every object clone in the pool, releasing
    /// clones that no longer cover any snapshot.
    async fn remove_snap(&self, pool: &str, snap: SnapId) -> Result<()>;

    // Extended attributes

    /// Read an extended attribute. Fails `NoData` if unset.
    async fn getxattr(&self, pool: &str, object: &str, name: &str) -> Result<Bytes>;

    /// Set an extended attribute, creating the object if needed.
    async fn setxattr(&self, pool: &str, object: &str, name: &str, value: Bytes) -> Result<()>;

    /// Remove an extended attribute.
    async fn rmxattr(&self, pool: &str, object: &str, name: &str) -> Result<()>;

    // Omap (sorted key-value) operations

    /// Read omap values for the given keys; missing keys are omitted.
    async fn omap_get(
        &self,
        pool: &str,
        object: &str,
        keys: &[String],
    ) -> Result<Vec<(String, Bytes)>>;

    /// Set omap keys, creating the object if needed.
    async fn omap_set(&self, pool: &str, object: &str, kvs: Vec<(String, Bytes)>) -> Result<()>;

    /// Remove omap keys.
    async fn omap_rm(&self, pool: &str, object: &str, keys: &[String]) -> Result<()>;

    /// List omap entries with the given key prefix, sorted by key.
    async fn omap_list(
        &self,
        pool: &str,
        object: &str,
        prefix: &str,
    ) -> Result<Vec<(String, Bytes)>>;

    // Class methods

    /// Invoke a registered class method atomically against the object.
    async fn exec(
        &self,
        pool: &str,
        object: &str,
        class: &str,
        method: &str,
        input: Bytes,
    ) -> Result<Bytes>;

    // Watch / notify

    /// Register a watch on the object, receiving future notifications.
    async fn watch(&self, pool: &str, object: &str) -> Result<WatchHandle>;

    /// Drop a previously registered watch.
    async fn unwatch(&self, pool: &str, object: &str, watch_id: u64) -> Result<()>;

    /// Notify all watchers of the object and gather their acknowledgements
    /// until `timeout` expires.
    async fn notify(
        &self,
        pool: &str,
        object: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<NotifyResult>;

    /// Ids of the object's current watchers.
    async fn list_watchers(&self, pool: &str, object: &str) -> Result<Vec<u64>>;
}
