// Copyright 2024 The Cairn Authors
// SPDX-License-Identifier: Apache-2.0

//! Block-image layer for Cairn.
//!
//! Images are thin-provisioned block devices stored as objects: a directory
//! object maps image names to ids, a per-image header object carries the
//! metadata (size, block order, snapshots, parent link), and image data
//! lives in per-block objects of `2^order` bytes. Snapshots use the store's
//! self-managed snapshot clones; clones of protected snapshots share blocks
//! with their parent until written (copy-up) or flattened.
//!
//! The diff stream (`export-diff`/`import-diff`/`merge-diff`) serializes
//! the changes between two snapshots as a banner-framed sequence of tagged
//! records; see [`diff`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod diff;
pub mod header;
pub mod image;
pub mod spec;

pub use diff::{DiffRecord, DIFF_BANNER};
pub use header::{ChildRef, ImageHeader, ParentLink, SnapRecord};
pub use image::{CreateOptions, ImageCtx, ImageInfo};
pub use spec::ImageSpec;
