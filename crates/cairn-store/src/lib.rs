// Copyright 2024 The Cairn Authors
// SPDX-License-Identifier: Apache-2.0

//! In-memory object store backend for Cairn.
//!
//! This crate provides:
//! - The [`ObjectStore`] trait: pools of objects carrying data, extended
//!   attributes and a sorted key-value map, with per-object versions
//! - [`MemStore`], a complete in-memory implementation with self-managed
//!   snapshots, watch/notify, class-method dispatch and quotas, plus
//!   whole-store snapshot persistence for tooling
//! - [`retry_guarded`], the bounded retry loop for optimistic updates
//!
//! Mutations may assert the object version the caller last observed; a
//! mismatch fails with `Canceled` and the enclosing read-modify-write loop
//! retries against fresh state.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod classes;
pub mod guard;
pub mod mem;
pub mod store;
pub mod watch;

pub use classes::{lock, ClassMethodFlags, ClassRegistry};
pub use guard::{retry_guarded, MAX_GUARDED_ATTEMPTS};
pub use mem::MemStore;
pub use store::{ObjectInfo, ObjectStore, PoolQuota, SnapContext};
pub use watch::{Notification, NotifyAck, NotifyResult, WatchHandle};
