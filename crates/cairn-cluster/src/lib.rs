// Copyright 2024 The Cairn Authors
// SPDX-License-Identifier: Apache-2.0

//! Cluster-map distribution and shard placement for Cairn.
//!
//! This crate provides:
//! - Subscription tracking for versioned cluster maps, with one-shot and
//!   continuous subscriptions
//! - An in-process map service that delivers map updates to connected
//!   sessions over channels
//! - The deterministic shard hash used to spread an index over its
//!   companion objects
//!
//! # Architecture
//!
//! Map distribution follows a want/got protocol: a session records which
//! maps it wants and from which version, the service delivers every
//! published version at or past that point, and each delivery advances the
//! want (or retires it, for one-shot subscriptions). Sessions receive
//! deliveries over an unbounded channel rather than blocking in a wait
//! loop.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod placement;
pub mod service;
pub mod sub;

pub use placement::shard_for_key;
pub use service::{MapService, MapUpdate, SessionHandle};
pub use sub::{SubFlags, SubTarget, SubscriptionMap};
