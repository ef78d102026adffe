//! `muon-binparse` --- byte-level parsing and patching primitives.
//!
//! This crate provides the low-level building blocks used by the table
//! manipulation crates:
//!
//! - [`BinaryReader`], a bounds-checked cursor over a byte slice,
//! - [`FromBytes`] / [`IntoBytes`], little-endian field access at arbitrary
//!   byte offsets,
//! - [`pattern::replace_masked`], a masked find/replace over a byte buffer.
//!
//! Everything is `no_std` and allocation-free.

#![cfg_attr(not(test), no_std)]

pub mod bytes;
pub mod pattern;
pub mod reader;

pub use bytes::{FromBytes, IntoBytes};
pub use reader::BinaryReader;
