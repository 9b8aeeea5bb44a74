//! Image operations over an object store.

use bytes::{Bytes, BytesMut};
use cairn_core::{Error, ErrorCode, Result, SnapId};
use cairn_store::{classes::lock, retry_guarded, ObjectStore, SnapContext};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::header::{
    block_object, block_prefix, header_object, ChildRef, ImageHeader, ParentLink, SnapRecord,
    DEFAULT_ORDER, DIR_OBJECT, MAX_ORDER, MIN_ORDER,
};
use crate::diff::DiffRecord;

/// How long a header-update notification waits for watcher acks.
const HEADER_NOTIFY_TIMEOUT: Duration = Duration::from_secs(5);

/// The well-known lock name guarding an image.
pub const IMAGE_LOCK: &str = "img_lock";

/// Options for image creation.
#[derive(Debug, Clone)]
pub struct CreateOptions {
    /// Image size in bytes.
    pub size: u64,
    /// Block order; default 22 (4 MiB blocks).
    pub order: Option<u8>,
    /// Stripe unit in bytes; default one block.
    pub stripe_unit: Option<u64>,
    /// Stripe count; default 1.
    pub stripe_count: Option<u64>,
    /// Mark the image shared (no exclusive header ownership).
    pub shared: bool,
    /// Image format; only 2 is supported.
    pub format: u8,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            size: 0,
            order: None,
            stripe_unit: None,
            stripe_count: None,
            shared: false,
            format: 2,
        }
    }
}

/// Summary of an image, for `info` output.
#[derive(Debug, Clone, Serialize)]
pub struct ImageInfo {
    /// Image name.
    pub name: String,
    /// Image id.
    pub id: String,
    /// Size in bytes.
    pub size: u64,
    /// Block order.
    pub order: u8,
    /// Block size in bytes.
    pub block_size: u64,
    /// Image format.
    pub format: u8,
    /// Whether the image is shared.
    pub shared: bool,
    /// Stripe unit in bytes.
    pub stripe_unit: u64,
    /// Stripe count.
    pub stripe_count: u64,
    /// Number of snapshots.
    pub snap_count: usize,
    /// `pool/image@snap` of the parent, for clones.
    pub parent: Option<String>,
}

/// An open image: cached header plus the store it lives on.
pub struct ImageCtx<'a, S: ObjectStore> {
    store: &'a S,
    pool: String,
    name: String,
    header: ImageHeader,
    header_version: u64,
}

impl<'a, S: ObjectStore> std::fmt::Debug for ImageCtx<'a, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageCtx")
            .field("pool", &self.pool)
            .field("name", &self.name)
            .field("header", &self.header)
            .field("header_version", &self.header_version)
            .finish()
    }
}

fn validate_image_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name.contains('@') {
        return Err(Error::invalid(format!("invalid image name: {name:?}")));
    }
    Ok(())
}

async fn read_header<S: ObjectStore>(
    store: &S,
    pool: &str,
    id: &str,
) -> Result<(ImageHeader, u64)> {
    let object = header_object(id);
    let info = store.stat(pool, &object).await?;
    let raw = store.read(pool, &object, SnapId::HEAD, 0, info.size).await?;
    Ok((ImageHeader::decode(&raw)?, info.version))
}

async fn lookup_id<S: ObjectStore>(store: &S, pool: &str, name: &str) -> Result<String> {
    let entries = match store.omap_get(pool, DIR_OBJECT, &[name.to_string()]).await {
        Ok(entries) => entries,
        Err(e) if e.is(ErrorCode::NotFound) => Vec::new(),
        Err(e) => return Err(e),
    };
    entries
        .into_iter()
        .next()
        .map(|(_, id)| String::from_utf8_lossy(&id).into_owned())
        .ok_or_else(|| Error::not_found(format!("no such image: {pool}/{name}")))
}

/// Creates an image and returns its id.
pub async fn create<S: ObjectStore>(
    store: &S,
    pool: &str,
    name: &str,
    opts: &CreateOptions,
) -> Result<String> {
    validate_image_name(name)?;
    if opts.format != 2 {
        return Err(Error::invalid(format!(
            "unsupported image format {} (only format 2 exists)",
            opts.format
        )));
    }
    let order = opts.order.unwrap_or(DEFAULT_ORDER);
    if !(MIN_ORDER..=MAX_ORDER).contains(&order) {
        return Err(Error::invalid(format!(
            "order {order} out of range [{MIN_ORDER}, {MAX_ORDER}]"
        )));
    }
    let block_size = 1u64 << order;
    let stripe_unit = opts.stripe_unit.unwrap_or(block_size);
    let stripe_count = opts.stripe_count.unwrap_or(1);
    if stripe_unit == 0
        || stripe_unit > block_size
        || block_size % stripe_unit != 0
        || stripe_count == 0
    {
        return Err(Error::invalid(format!(
            "invalid striping: unit {stripe_unit}, count {stripe_count}, block size {block_size}"
        )));
    }

    if lookup_id(store, pool, name).await.is_ok() {
        return Err(Error::new(ErrorCode::Exists, format!("image exists: {pool}/{name}")));
    }

    let header = ImageHeader {
        id: Uuid::new_v4().simple().to_string(),
        format: 2,
        size: opts.size,
        order,
        stripe_unit,
        stripe_count,
        shared: opts.shared,
        snap_seq: 0,
        snaps: Vec::new(),
        parent: None,
    };
    write_new_image(store, pool, name, &header).await?;
    Ok(header.id)
}

async fn write_new_image<S: ObjectStore>(
    store: &S,
    pool: &str,
    name: &str,
    header: &ImageHeader,
) -> Result<()> {
    store
        .write_full(
            pool,
            &header_object(&header.id),
            &SnapContext::none(),
            Bytes::from(header.encode()?),
            None,
        )
        .await?;
    store
        .omap_set(
            pool,
            DIR_OBJECT,
            vec![(name.to_string(), Bytes::copy_from_slice(header.id.as_bytes()))],
        )
        .await?;
    debug!(pool, image = name, id = %header.id, size = header.size, "created image");
    Ok(())
}

/// Lists image names in a pool.
pub async fn list<S: ObjectStore>(store: &S, pool: &str) -> Result<Vec<String>> {
    match store.omap_list(pool, DIR_OBJECT, "").await {
        Ok(entries) => Ok(entries.into_iter().map(|(name, _)| name).collect()),
        Err(e) if e.is(ErrorCode::NotFound) => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

/// Removes an image. Fails while it has snapshots or watchers.
pub async fn remove<S: ObjectStore>(store: &S, pool: &str, name: &str) -> Result<()> {
    let ctx = ImageCtx::open(store, pool, name).await?;
    if !ctx.header.snaps.is_empty() {
        return Err(Error::new(
            ErrorCode::NotEmpty,
            format!("image {pool}/{name} has snapshots"),
        ));
    }
    let watchers = store.list_watchers(pool, &header_object(&ctx.header.id)).await?;
    if !watchers.is_empty() {
        return Err(Error::new(ErrorCode::Busy, format!("image {pool}/{name} is in use")));
    }
    if let Some(parent) = ctx.header.parent.clone() {
        detach_child(store, &parent, pool, name).await?;
    }

    let blocks = store.list_objects(pool, &block_prefix(&ctx.header.id)).await?;
    for block in blocks {
        store.remove(pool, &block, &SnapContext::none(), None).await?;
    }
    store
        .remove(pool, &header_object(&ctx.header.id), &SnapContext::none(), None)
        .await?;
    store.omap_rm(pool, DIR_OBJECT, &[name.to_string()]).await?;
    debug!(pool, image = name, "removed image");
    Ok(())
}

/// Renames an image within its pool.
pub async fn rename<S: ObjectStore>(
    store: &S,
    pool: &str,
    from: &str,
    to: &str,
) -> Result<()> {
    validate_image_name(to)?;
    if lookup_id(store, pool, to).await.is_ok() {
        return Err(Error::new(ErrorCode::Exists, format!("image exists: {pool}/{to}")));
    }
    let id = lookup_id(store, pool, from).await?;
    store
        .omap_set(pool, DIR_OBJECT, vec![(to.to_string(), Bytes::copy_from_slice(id.as_bytes()))])
        .await?;
    store.omap_rm(pool, DIR_OBJECT, &[from.to_string()]).await?;
    Ok(())
}

/// Clones `parent@snap` into a new image. The snapshot must be protected.
pub async fn clone<S: ObjectStore>(
    store: &S,
    parent_pool: &str,
    parent_name: &str,
    snap_name: &str,
    child_pool: &str,
    child_name: &str,
) -> Result<()> {
    validate_image_name(child_name)?;
    let mut parent = ImageCtx::open(store, parent_pool, parent_name).await?;
    let snap = parent
        .header
        .snap_by_name(snap_name)
        .cloned()
        .ok_or_else(|| Error::not_found(format!("no such snapshot: {snap_name}")))?;
    if !snap.protected {
        return Err(Error::invalid(format!(
            "snapshot {snap_name} must be protected before cloning"
        )));
    }
    if lookup_id(store, child_pool, child_name).await.is_ok() {
        return Err(Error::new(
            ErrorCode::Exists,
            format!("image exists: {child_pool}/{child_name}"),
        ));
    }

    let header = ImageHeader {
        id: Uuid::new_v4().simple().to_string(),
        format: 2,
        size: snap.size,
        order: parent.header.order,
        stripe_unit: parent.header.stripe_unit,
        stripe_count: parent.header.stripe_count,
        shared: false,
        snap_seq: 0,
        snaps: Vec::new(),
        parent: Some(ParentLink {
            pool: parent_pool.to_string(),
            image: parent_name.to_string(),
            image_id: parent.header.id.clone(),
            snap_id: snap.id,
            overlap: snap.size,
        }),
    };
    write_new_image(store, child_pool, child_name, &header).await?;

    let child = ChildRef { pool: child_pool.to_string(), image: child_name.to_string() };
    let snap_id = snap.id;
    parent
        .update_header(move |h| {
            let record = h
                .snaps
                .iter_mut()
                .find(|s| s.id == snap_id)
                .ok_or_else(|| Error::not_found("snapshot vanished during clone"))?;
            if !record.children.contains(&child) {
                record.children.push(child.clone());
            }
            Ok(())
        })
        .await
}

async fn detach_child<S: ObjectStore>(
    store: &S,
    parent: &ParentLink,
    child_pool: &str,
    child_name: &str,
) -> Result<()> {
    let mut pctx = ImageCtx::open(store, &parent.pool, &parent.image).await?;
    let snap_id = parent.snap_id;
    let child = ChildRef { pool: child_pool.to_string(), image: child_name.to_string() };
    pctx.update_header(move |h| {
        if let Some(record) = h.snaps.iter_mut().find(|s| s.id == snap_id) {
            record.children.retain(|c| c != &child);
        }
        Ok(())
    })
    .await
}

impl<'a, S: ObjectStore> ImageCtx<'a, S> {
    /// Opens an existing image.
    pub async fn open(store: &'a S, pool: &str, name: &str) -> Result<Self> {
        let id = lookup_id(store, pool, name).await?;
        let (header, header_version) = read_header(store, pool, &id).await?;
        Ok(Self {
            store,
            pool: pool.to_string(),
            name: name.to_string(),
            header,
            header_version,
        })
    }

    /// The cached header.
    #[must_use]
    pub fn header(&self) -> &ImageHeader {
        &self.header
    }

    /// The image name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Re-reads the header if the stored version moved past the cache.
    pub async fn refresh(&mut self) -> Result<()> {
        match self.fetch_newer().await {
            Ok((header, version)) => {
                self.header = header;
                self.header_version = version;
                Ok(())
            }
            Err(e) if e.is(ErrorCode::NotModified) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn fetch_newer(&self) -> Result<(ImageHeader, u64)> {
        let object = header_object(&self.header.id);
        let info = self.store.stat(&self.pool, &object).await?;
        if info.version == self.header_version {
            return Err(Error::new(ErrorCode::NotModified, "header unchanged"));
        }
        read_header(self.store, &self.pool, &self.header.id).await
    }

    /// Applies `f` to the header with an optimistic read-modify-write.
    ///
    /// Lost races surface as `Canceled` and are retried (bounded); watchers
    /// of the header object are notified after the update lands.
    pub async fn update_header<F>(&mut self, f: F) -> Result<()>
    where
        F: Fn(&mut ImageHeader) -> Result<()>,
    {
        let (header, version) = retry_guarded(|| self.try_update_header(&f)).await?;
        self.header = header;
        self.header_version = version;

        let object = header_object(&self.header.id);
        if let Err(e) = self
            .store
            .notify(&self.pool, &object, Bytes::from_static(b"header-update"), HEADER_NOTIFY_TIMEOUT)
            .await
        {
            debug!(error = %e, "header update notify failed");
        }
        Ok(())
    }

    async fn try_update_header<F>(&self, f: &F) -> Result<(ImageHeader, u64)>
    where
        F: Fn(&mut ImageHeader) -> Result<()>,
    {
        let (mut header, version) = read_header(self.store, &self.pool, &self.header.id).await?;
        f(&mut header)?;
        let new_version = self
            .store
            .write_full(
                &self.pool,
                &header_object(&header.id),
                &SnapContext::none(),
                Bytes::from(header.encode()?),
                Some(version),
            )
            .await?;
        Ok((header, new_version))
    }

    /// Resolves the content of block `index` as seen at `snap` (`None` for
    /// the head), following the parent chain for clones. `None` means the
    /// block does not exist at that point.
    async fn block_state(
        &self,
        index: u64,
        snap: Option<u64>,
        skip_self: bool,
    ) -> Result<Option<Bytes>> {
        let block_size = self.header.block_size();
        let off = index * block_size;

        let mut pool = self.pool.clone();
        let mut header = self.header.clone();
        let mut snap_id = snap.map(SnapId).unwrap_or(SnapId::HEAD);
        // Bytes of this level still visible through the chain so far.
        let mut limit = u64::MAX;
        let mut skip = skip_self;

        loop {
            if !skip {
                if off >= limit {
                    return Ok(None);
                }
                let object = block_object(&header.id, index);
                match self.store.read(&pool, &object, snap_id, 0, block_size).await {
                    Ok(data) => {
                        let max = (limit - off).min(block_size) as usize;
                        let data = if data.len() > max { data.slice(..max) } else { data };
                        return Ok(Some(data));
                    }
                    Err(e) if e.is(ErrorCode::NotFound) => {}
                    Err(e) => return Err(e),
                }
            }
            skip = false;

            let Some(parent) = header.parent.clone() else {
                return Ok(None);
            };
            limit = limit.min(parent.overlap);
            if off >= limit {
                return Ok(None);
            }
            let (pheader, _) = read_header(self.store, &parent.pool, &parent.image_id).await?;
            pool = parent.pool;
            snap_id = SnapId(parent.snap_id);
            header = pheader;
        }
    }

    fn clip_state(state: Option<Bytes>, size: u64, off: u64) -> Option<Bytes> {
        let state = state?;
        if off >= size {
            return None;
        }
        let max = (size - off).min(state.len() as u64) as usize;
        Some(state.slice(..max))
    }

    /// Reads `len` bytes at `off` from the head, zero-filling holes.
    pub async fn read(&self, off: u64, len: u64) -> Result<Bytes> {
        self.read_inner(off, len, None, self.header.size).await
    }

    /// Reads from a snapshot instead of the head.
    pub async fn read_at_snap(&self, snap_name: &str, off: u64, len: u64) -> Result<Bytes> {
        let snap = self
            .header
            .snap_by_name(snap_name)
            .ok_or_else(|| Error::not_found(format!("no such snapshot: {snap_name}")))?;
        self.read_inner(off, len, Some(snap.id), snap.size).await
    }

    async fn read_inner(
        &self,
        off: u64,
        len: u64,
        snap: Option<u64>,
        size: u64,
    ) -> Result<Bytes> {
        if off >= size {
            return Ok(Bytes::new());
        }
        let len = len.min(size - off);
        let block_size = self.header.block_size();
        let mut out = BytesMut::zeroed(len as usize);

        let mut pos = off;
        while pos < off + len {
            let index = pos / block_size;
            let boff = pos % block_size;
            let chunk = (block_size - boff).min(off + len - pos);
            if let Some(state) = self.block_state(index, snap, false).await? {
                let data_off = boff as usize;
                if state.len() > data_off {
                    let avail = (state.len() - data_off).min(chunk as usize);
                    let dst = (pos - off) as usize;
                    out[dst..dst + avail]
                        .copy_from_slice(&state[data_off..data_off + avail]);
                }
            }
            pos += chunk;
        }
        Ok(out.freeze())
    }

    /// Writes `data` at `off`. Writing past the end of the image is an
    /// error; clones copy up parent blocks on partial writes.
    pub async fn write(&self, off: u64, data: Bytes) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        if off + data.len() as u64 > self.header.size {
            return Err(Error::invalid(format!(
                "write of {} bytes at {off} past image end {}",
                data.len(),
                self.header.size
            )));
        }
        let block_size = self.header.block_size();
        let snapc = self.header.snap_context();

        let mut pos = off;
        while pos < off + data.len() as u64 {
            let index = pos / block_size;
            let boff = pos % block_size;
            let chunk = (block_size - boff).min(off + data.len() as u64 - pos);
            let object = block_object(&self.header.id, index);

            let full_block = boff == 0 && chunk == block_size;
            if !full_block && self.header.parent.is_some() {
                let absent = matches!(
                    self.store.stat(&self.pool, &object).await,
                    Err(ref e) if e.is(ErrorCode::NotFound)
                );
                if absent {
                    if let Some(parent_data) = self.block_state(index, None, true).await? {
                        trace!(block = index, "copy-up from parent");
                        self.store
                            .write(&self.pool, &object, &snapc, 0, parent_data, None)
                            .await?;
                    }
                }
            }

            let start = (pos - off) as usize;
            let slice = data.slice(start..start + chunk as usize);
            self.store.write(&self.pool, &object, &snapc, boff, slice, None).await?;
            pos += chunk;
        }
        Ok(())
    }

    /// Discards `[off, off + len)`: whole unbacked blocks are released,
    /// everything else reads back as zero.
    pub async fn discard(&self, off: u64, len: u64) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let end = (off + len).min(self.header.size);
        let block_size = self.header.block_size();
        let snapc = self.header.snap_context();

        let mut pos = off;
        while pos < end {
            let index = pos / block_size;
            let boff = pos % block_size;
            let chunk = (block_size - boff).min(end - pos);
            let object = block_object(&self.header.id, index);
            let parent_backed = self.header.parent.is_some()
                && self.block_state(index, None, true).await?.is_some();

            if boff == 0 && chunk == block_size && !parent_backed {
                match self.store.remove(&self.pool, &object, &snapc, None).await {
                    Ok(()) => {}
                    Err(e) if e.is(ErrorCode::NotFound) => {}
                    Err(e) => return Err(e),
                }
            } else if parent_backed {
                // Writing zeroes masks the parent data.
                self.write(pos, Bytes::from(vec![0u8; chunk as usize])).await?;
            } else {
                match self.store.zero(&self.pool, &object, &snapc, boff, chunk, None).await {
                    Ok(_) => {}
                    Err(e) if e.is(ErrorCode::NotFound) => {}
                    Err(e) => return Err(e),
                }
            }
            pos += chunk;
        }
        Ok(())
    }

    /// Resizes the image. Shrinking discards trimmed blocks.
    pub async fn resize(&mut self, new_size: u64) -> Result<()> {
        let old_size = self.header.size;
        if new_size < old_size {
            let block_size = self.header.block_size();
            let first_dead = new_size.div_ceil(block_size);
            for index in first_dead..self.header.block_count(old_size) {
                let object = block_object(&self.header.id, index);
                match self
                    .store
                    .remove(&self.pool, &object, &self.header.snap_context(), None)
                    .await
                {
                    Ok(()) => {}
                    Err(e) if e.is(ErrorCode::NotFound) => {}
                    Err(e) => return Err(e),
                }
            }
            // Trim the boundary block.
            if new_size % block_size != 0 {
                let object = block_object(&self.header.id, new_size / block_size);
                if self.store.stat(&self.pool, &object).await.is_ok() {
                    self.store
                        .truncate(
                            &self.pool,
                            &object,
                            &self.header.snap_context(),
                            new_size % block_size,
                            None,
                        )
                        .await?;
                }
            }
        }
        self.update_header(move |h| {
            h.size = new_size;
            if let Some(parent) = &mut h.parent {
                parent.overlap = parent.overlap.min(new_size);
            }
            Ok(())
        })
        .await
    }

    // === Snapshots ===

    /// Creates a snapshot.
    pub async fn snap_create(&mut self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::invalid("empty snapshot name"));
        }
        if self.header.snap_by_name(name).is_some() {
            return Err(Error::new(ErrorCode::Exists, format!("snapshot exists: {name}")));
        }
        // Snapshot ids come from the pool-wide sequence so that block
        // clones of different images never share an id.
        let id = self.store.selfmanaged_snap_create(&self.pool).await?.0;
        let name = name.to_string();
        self.update_header(move |h| {
            if h.snap_by_name(&name).is_some() {
                return Err(Error::new(
                    ErrorCode::Exists,
                    format!("snapshot exists: {name}"),
                ));
            }
            h.snap_seq = id;
            h.snaps.push(SnapRecord {
                id,
                name: name.clone(),
                size: h.size,
                protected: false,
                children: Vec::new(),
            });
            Ok(())
        })
        .await
    }

    /// Removes a snapshot. Protected snapshots are `Busy`.
    pub async fn snap_rm(&mut self, name: &str) -> Result<()> {
        let snap = self
            .header
            .snap_by_name(name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("no such snapshot: {name}")))?;
        if snap.protected {
            return Err(Error::new(ErrorCode::Busy, format!("snapshot {name} is protected")));
        }
        let name = name.to_string();
        self.update_header(move |h| {
            let idx = h
                .snaps
                .iter()
                .position(|s| s.name == name)
                .ok_or_else(|| Error::not_found(format!("no such snapshot: {name}")))?;
            if h.snaps[idx].protected {
                return Err(Error::new(ErrorCode::Busy, format!("snapshot {name} is protected")));
            }
            h.snaps.remove(idx);
            Ok(())
        })
        .await?;
        self.store.remove_snap(&self.pool, SnapId(snap.id)).await
    }

    /// Removes every unprotected snapshot; fails `Busy` if any protected
    /// snapshot remains.
    pub async fn snap_purge(&mut self) -> Result<()> {
        let names: Vec<String> = self
            .header
            .snaps
            .iter()
            .filter(|s| !s.protected)
            .map(|s| s.name.clone())
            .collect();
        for name in names {
            self.snap_rm(&name).await?;
        }
        if self.header.snaps.iter().any(|s| s.protected) {
            return Err(Error::new(ErrorCode::Busy, "protected snapshots remain"));
        }
        Ok(())
    }

    /// Marks a snapshot protected.
    pub async fn snap_protect(&mut self, name: &str) -> Result<()> {
        let name = name.to_string();
        self.update_header(move |h| {
            let snap = h
                .snap_by_name_mut(&name)
                .ok_or_else(|| Error::not_found(format!("no such snapshot: {name}")))?;
            if snap.protected {
                return Err(Error::new(
                    ErrorCode::Busy,
                    format!("snapshot {name} is already protected"),
                ));
            }
            snap.protected = true;
            Ok(())
        })
        .await
    }

    /// Unprotects a snapshot; fails `Busy` while clones of it exist.
    pub async fn snap_unprotect(&mut self, name: &str) -> Result<()> {
        let name = name.to_string();
        self.update_header(move |h| {
            let snap = h
                .snap_by_name_mut(&name)
                .ok_or_else(|| Error::not_found(format!("no such snapshot: {name}")))?;
            if !snap.protected {
                return Err(Error::invalid(format!("snapshot {name} is not protected")));
            }
            if !snap.children.is_empty() {
                return Err(Error::new(
                    ErrorCode::Busy,
                    format!("snapshot {name} has {} children", snap.children.len()),
                ));
            }
            snap.protected = false;
            Ok(())
        })
        .await
    }

    /// Rolls the image head back to a snapshot's contents and size.
    pub async fn snap_rollback(&mut self, name: &str) -> Result<()> {
        let snap = self
            .header
            .snap_by_name(name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("no such snapshot: {name}")))?;
        let snapc = self.header.snap_context();
        let span = self.header.block_count(snap.size.max(self.header.size));

        for index in 0..span {
            let object = block_object(&self.header.id, index);
            match self.block_state(index, Some(snap.id), false).await? {
                Some(data) => {
                    self.store
                        .write_full(&self.pool, &object, &snapc, data, None)
                        .await?;
                }
                None => match self.store.remove(&self.pool, &object, &snapc, None).await {
                    Ok(()) => {}
                    Err(e) if e.is(ErrorCode::NotFound) => {}
                    Err(e) => return Err(e),
                },
            }
        }
        let new_size = snap.size;
        self.update_header(move |h| {
            h.size = new_size;
            Ok(())
        })
        .await
    }

    /// Snapshot records, oldest first.
    #[must_use]
    pub fn snaps(&self) -> &[SnapRecord] {
        &self.header.snaps
    }

    /// Clones taken from the named snapshot.
    pub fn children(&self, snap_name: &str) -> Result<Vec<ChildRef>> {
        self.header
            .snap_by_name(snap_name)
            .map(|s| s.children.clone())
            .ok_or_else(|| Error::not_found(format!("no such snapshot: {snap_name}")))
    }

    /// Copies every parent-backed block into this image and drops the
    /// parent link.
    pub async fn flatten(&mut self) -> Result<()> {
        let Some(parent) = self.header.parent.clone() else {
            return Err(Error::invalid(format!("image {} has no parent", self.name)));
        };
        let snapc = self.header.snap_context();
        let limit = parent.overlap.min(self.header.size);

        for index in 0..self.header.block_count(limit) {
            let object = block_object(&self.header.id, index);
            let absent = matches!(
                self.store.stat(&self.pool, &object).await,
                Err(ref e) if e.is(ErrorCode::NotFound)
            );
            if !absent {
                continue;
            }
            if let Some(data) = self.block_state(index, None, true).await? {
                self.store.write(&self.pool, &object, &snapc, 0, data, None).await?;
            }
        }

        self.update_header(|h| {
            h.parent = None;
            Ok(())
        })
        .await?;
        detach_child(self.store, &parent, &self.pool, &self.name).await?;
        debug!(pool = %self.pool, image = %self.name, "flattened image");
        Ok(())
    }

    /// Copies this image's head data into a new image (snapshots are not
    /// copied).
    pub async fn copy_to(&self, dst_pool: &str, dst_name: &str) -> Result<()> {
        let opts = CreateOptions {
            size: self.header.size,
            order: Some(self.header.order),
            stripe_unit: Some(self.header.stripe_unit),
            stripe_count: Some(self.header.stripe_count),
            shared: self.header.shared,
            format: 2,
        };
        let dst_id = create(self.store, dst_pool, dst_name, &opts).await?;

        for index in 0..self.header.block_count(self.header.size) {
            if let Some(data) = self.block_state(index, None, false).await? {
                let object = block_object(&dst_id, index);
                self.store
                    .write(dst_pool, &object, &SnapContext::none(), 0, data, None)
                    .await?;
            }
        }
        Ok(())
    }

    // === Diff streams ===

    /// Computes the diff between `from_snap` (or the image's beginning) and
    /// `to_snap` (or the head).
    pub async fn export_diff(
        &self,
        from_snap: Option<&str>,
        to_snap: Option<&str>,
    ) -> Result<Vec<DiffRecord>> {
        let from = match from_snap {
            Some(name) => Some(
                self.header
                    .snap_by_name(name)
                    .cloned()
                    .ok_or_else(|| Error::not_found(format!("no such snapshot: {name}")))?,
            ),
            None => None,
        };
        let (to_id, end_size) = match to_snap {
            Some(name) => {
                let snap = self
                    .header
                    .snap_by_name(name)
                    .ok_or_else(|| Error::not_found(format!("no such snapshot: {name}")))?;
                (Some(snap.id), snap.size)
            }
            None => (None, self.header.size),
        };
        let from_size = from.as_ref().map_or(0, |s| s.size);

        let mut records = Vec::new();
        if let Some(snap) = &from {
            records.push(DiffRecord::FromSnap(snap.name.clone()));
        }
        if let Some(name) = to_snap {
            records.push(DiffRecord::ToSnap(name.to_string()));
        }
        records.push(DiffRecord::Size(end_size));

        let block_size = self.header.block_size();
        let span = self.header.block_count(end_size.max(from_size));
        for index in 0..span {
            let off = index * block_size;
            let from_state = match &from {
                Some(snap) => Self::clip_state(
                    self.block_state(index, Some(snap.id), false).await?,
                    from_size,
                    off,
                ),
                None => None,
            };
            let to_state = Self::clip_state(
                self.block_state(index, to_id, false).await?,
                end_size,
                off,
            );

            if from_state == to_state {
                continue;
            }
            match to_state {
                Some(data) => records.push(DiffRecord::Write { offset: off, data }),
                None => {
                    if off < end_size {
                        records.push(DiffRecord::Zero {
                            offset: off,
                            length: block_size.min(end_size - off),
                        });
                    }
                }
            }
        }
        records.push(DiffRecord::End);
        Ok(records)
    }

    /// Applies a diff stream to this image.
    ///
    /// The stream's from-snapshot must exist here (`PreconditionFailed`
    /// otherwise); its to-snapshot is created after the data lands.
    pub async fn import_diff(&mut self, records: Vec<DiffRecord>) -> Result<()> {
        let mut to_snap: Option<String> = None;
        for record in records {
            match record {
                DiffRecord::FromSnap(name) => {
                    if self.header.snap_by_name(&name).is_none() {
                        return Err(Error::new(
                            ErrorCode::PreconditionFailed,
                            format!("start snapshot {name} does not exist in {}", self.name),
                        ));
                    }
                }
                DiffRecord::ToSnap(name) => {
                    if self.header.snap_by_name(&name).is_some() {
                        return Err(Error::new(
                            ErrorCode::Exists,
                            format!("end snapshot {name} already exists in {}", self.name),
                        ));
                    }
                    to_snap = Some(name);
                }
                DiffRecord::Size(size) => self.resize(size).await?,
                DiffRecord::Write { offset, data } => self.write(offset, data).await?,
                DiffRecord::Zero { offset, length } => self.discard(offset, length).await?,
                DiffRecord::End => break,
            }
        }
        if let Some(name) = to_snap {
            self.snap_create(&name).await?;
        }
        Ok(())
    }

    // === Locks, watch, status ===

    /// Acquires the image lock.
    pub async fn lock_add(&self, cookie: &str, owner: &str, exclusive: bool) -> Result<()> {
        let args = lock::encode_lock(&lock::LockArgs {
            name: IMAGE_LOCK.to_string(),
            cookie: cookie.to_string(),
            owner: owner.to_string(),
            exclusive,
        })?;
        self.store
            .exec(
                &self.pool,
                &header_object(&self.header.id),
                lock::CLASS,
                lock::LOCK,
                Bytes::from(args),
            )
            .await
            .map(|_| ())
    }

    /// Releases the image lock.
    pub async fn lock_rm(&self, cookie: &str, owner: &str) -> Result<()> {
        let args = lock::encode_unlock(&lock::UnlockArgs {
            name: IMAGE_LOCK.to_string(),
            cookie: cookie.to_string(),
            owner: owner.to_string(),
        })?;
        self.store
            .exec(
                &self.pool,
                &header_object(&self.header.id),
                lock::CLASS,
                lock::UNLOCK,
                Bytes::from(args),
            )
            .await
            .map(|_| ())
    }

    /// Lists current lock holders.
    pub async fn lock_ls(&self) -> Result<lock::LockInfo> {
        let args = lock::encode_get_info(&lock::GetInfoArgs { name: IMAGE_LOCK.to_string() })?;
        let reply = self
            .store
            .exec(
                &self.pool,
                &header_object(&self.header.id),
                lock::CLASS,
                lock::GET_INFO,
                Bytes::from(args),
            )
            .await?;
        lock::decode_info(&reply)
    }

    /// Watches the header object for update notifications.
    pub async fn watch(&self) -> Result<cairn_store::WatchHandle> {
        self.store.watch(&self.pool, &header_object(&self.header.id)).await
    }

    /// Drops a header watch.
    pub async fn unwatch(&self, watch_id: u64) -> Result<()> {
        self.store
            .unwatch(&self.pool, &header_object(&self.header.id), watch_id)
            .await
    }

    /// Ids of the header's current watchers.
    pub async fn watchers(&self) -> Result<Vec<u64>> {
        self.store
            .list_watchers(&self.pool, &header_object(&self.header.id))
            .await
    }

    /// Summary for `info` output.
    #[must_use]
    pub fn info(&self) -> ImageInfo {
        ImageInfo {
            name: self.name.clone(),
            id: self.header.id.clone(),
            size: self.header.size,
            order: self.header.order,
            block_size: self.header.block_size(),
            format: self.header.format,
            shared: self.header.shared,
            stripe_unit: self.header.stripe_unit,
            stripe_count: self.header.stripe_count,
            snap_count: self.header.snaps.len(),
            parent: self
                .header
                .parent
                .as_ref()
                .map(|p| format!("{}/{}@snap:{}", p.pool, p.image, p.snap_id)),
        }
    }
}
