// Copyright 2024 The Cairn Authors
// SPDX-License-Identifier: Apache-2.0

//! Placement-group log reconciliation for Cairn.
//!
//! Every placement group keeps an ordered log of object mutations. After a
//! partition heals, replicas compare logs and reconcile: one log is chosen as
//! authoritative and the others are rewound to it, with every locally-applied
//! mutation that the authoritative history does not contain rolled back and
//! the affected objects scheduled for recovery through the missing set.
//!
//! # How It Works
//!
//! Reconciliation walks both logs back from their heads to the newest entry
//! they share (same version, same operation, same object). Everything newer
//! on the local side is *divergent*:
//!
//! - if the authoritative log carries its own entry for the object at or
//!   after the divergence point, that entry wins: a modify puts the object
//!   into the missing set at the authoritative version, a delete removes it;
//! - otherwise the object rolls back to the divergent entries' prior
//!   version, landing in the missing set when the prior is inside the log
//!   window, in the divergent-priors side map when it precedes the tail, or
//!   out of existence when there is no prior at all;
//! - every rolled-back entry is surfaced to a [`DivergenceHandler`] in
//!   reverse (newest-first) order so the caller can undo partially-applied
//!   modifications.
//!
//! The engine mutates the log, the missing set and the handler in one
//! synchronous call; durability ordering is the caller's concern.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod entry;
pub mod log;
pub mod merge;
pub mod missing;

pub use entry::{LogOp, PgLogEntry};
pub use log::IndexedLog;
pub use merge::{DivergenceHandler, PgInfo, PgLog};
pub use missing::{MissingItem, MissingSet};
