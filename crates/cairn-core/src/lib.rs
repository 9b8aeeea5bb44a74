// Copyright 2024 The Cairn Authors
// SPDX-License-Identifier: Apache-2.0

//! Core types and utilities for Cairn distributed storage.
//!
//! This crate provides the fundamental building blocks used across all Cairn
//! components:
//! - Error types carrying the platform's errno-style codes
//! - Object versions and identities shared by the log and store layers

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod types;

pub use error::{Error, ErrorCode, Result};
pub use types::{Eversion, ObjectId, SnapId};
