//! On-store image metadata.

use cairn_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// Directory object mapping image names to ids, one per pool.
pub const DIR_OBJECT: &str = "img_directory";

/// Default block order: 4 MiB blocks.
pub const DEFAULT_ORDER: u8 = 22;
/// Smallest supported block order (4 KiB).
pub const MIN_ORDER: u8 = 12;
/// Largest supported block order (64 MiB).
pub const MAX_ORDER: u8 = 26;

/// Name of an image's header object.
#[must_use]
pub fn header_object(id: &str) -> String {
    format!("img_header.{id}")
}

/// Name of one of an image's data block objects.
#[must_use]
pub fn block_object(id: &str, index: u64) -> String {
    format!("img_data.{id}.{index:016x}")
}

/// Prefix shared by all of an image's data block objects.
#[must_use]
pub fn block_prefix(id: &str) -> String {
    format!("img_data.{id}.")
}

/// A reference to a cloned child image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildRef {
    /// Pool the child lives in.
    pub pool: String,
    /// Child image name.
    pub image: String,
}

/// Link from a cloned image to its parent snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentLink {
    /// Parent pool.
    pub pool: String,
    /// Parent image name.
    pub image: String,
    /// Parent image id.
    pub image_id: String,
    /// Snapshot id the clone was taken from.
    pub snap_id: u64,
    /// Bytes of the child still backed by the parent.
    pub overlap: u64,
}

/// One snapshot of an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapRecord {
    /// Snapshot id, allocated from the pool-wide snapshot sequence.
    pub id: u64,
    /// Snapshot name, unique within the image.
    pub name: String,
    /// Image size when the snapshot was taken.
    pub size: u64,
    /// Protected snapshots cannot be removed and may be cloned.
    pub protected: bool,
    /// Clones taken from this snapshot.
    pub children: Vec<ChildRef>,
}

/// The per-image header, stored bincode-encoded in the header object and
/// rewritten with a version guard on every metadata change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageHeader {
    /// Image id (names can change, ids cannot).
    pub id: String,
    /// Image format; only format 2 exists.
    pub format: u8,
    /// Image size in bytes.
    pub size: u64,
    /// Block size is `2^order` bytes.
    pub order: u8,
    /// Stripe unit in bytes (recorded; layout is one stripe per block).
    pub stripe_unit: u64,
    /// Stripe count (recorded).
    pub stripe_count: u64,
    /// Shared images skip exclusive ownership of the header.
    pub shared: bool,
    /// Newest snapshot id taken by this image.
    pub snap_seq: u64,
    /// Snapshots, oldest first.
    pub snaps: Vec<SnapRecord>,
    /// Parent link if this image is a clone.
    pub parent: Option<ParentLink>,
}

impl ImageHeader {
    /// Block size in bytes.
    #[must_use]
    pub fn block_size(&self) -> u64 {
        1u64 << self.order
    }

    /// Number of blocks covering `size` bytes.
    #[must_use]
    pub fn block_count(&self, size: u64) -> u64 {
        size.div_ceil(self.block_size())
    }

    /// Finds a snapshot by name.
    #[must_use]
    pub fn snap_by_name(&self, name: &str) -> Option<&SnapRecord> {
        self.snaps.iter().find(|s| s.name == name)
    }

    /// Finds a snapshot by name, mutably.
    pub fn snap_by_name_mut(&mut self, name: &str) -> Option<&mut SnapRecord> {
        self.snaps.iter_mut().find(|s| s.name == name)
    }

    /// The snapshot context for writes to this image's data blocks.
    #[must_use]
    pub fn snap_context(&self) -> cairn_store::SnapContext {
        let mut snaps: Vec<cairn_core::SnapId> =
            self.snaps.iter().map(|s| cairn_core::SnapId(s.id)).collect();
        snaps.sort_unstable_by(|a, b| b.cmp(a));
        cairn_store::SnapContext::new(self.snap_seq, snaps)
    }

    /// Serializes the header.
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::Encoding(e.to_string()))
    }

    /// Deserializes a header.
    pub fn decode(raw: &[u8]) -> Result<Self> {
        bincode::deserialize(raw).map_err(|e| Error::Encoding(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> ImageHeader {
        ImageHeader {
            id: "abc123".to_string(),
            format: 2,
            size: 10 << 20,
            order: 22,
            stripe_unit: 1 << 22,
            stripe_count: 1,
            shared: false,
            snap_seq: 0,
            snaps: Vec::new(),
            parent: None,
        }
    }

    #[test]
    fn test_block_geometry() {
        let h = header();
        assert_eq!(h.block_size(), 4 << 20);
        assert_eq!(h.block_count(h.size), 3);
        assert_eq!(h.block_count(0), 0);
        assert_eq!(h.block_count(1), 1);
    }

    #[test]
    fn test_encode_decode() {
        let mut h = header();
        h.snaps.push(SnapRecord {
            id: 1,
            name: "s1".to_string(),
            size: h.size,
            protected: true,
            children: vec![ChildRef { pool: "p".into(), image: "child".into() }],
        });
        let decoded = ImageHeader::decode(&h.encode().unwrap()).unwrap();
        assert_eq!(decoded, h);
    }

    #[test]
    fn test_snap_context_newest_first() {
        let mut h = header();
        h.snap_seq = 7;
        for id in [2u64, 5, 7] {
            h.snaps.push(SnapRecord {
                id,
                name: format!("s{id}"),
                size: h.size,
                protected: false,
                children: Vec::new(),
            });
        }
        let snapc = h.snap_context();
        assert_eq!(snapc.seq, 7);
        assert_eq!(
            snapc.snaps,
            vec![cairn_core::SnapId(7), cairn_core::SnapId(5), cairn_core::SnapId(2)]
        );
    }

    #[test]
    fn test_object_names() {
        assert_eq!(header_object("id1"), "img_header.id1");
        assert_eq!(block_object("id1", 0x2a), "img_data.id1.000000000000002a");
        assert!(block_object("id1", 1).starts_with(&block_prefix("id1")));
    }
}
