// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # memglass - live shared-memory introspection
//!
//! A producer process declares plain-old-data types, allocates labelled
//! instances in POSIX shared memory, and updates them at full speed; any
//! number of observer processes attach to the session, discover types and
//! objects from a self-describing registry, and read field values by name -
//! zero-copy, no IPC round-trips, no serialization, and without ever
//! stopping the producer.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use memglass::{Atomicity, Config, Primitive, Session, TypeDescriptor};
//! use std::mem::offset_of;
//!
//! #[derive(Clone, Copy, Default)]
//! #[repr(C)]
//! struct Stats {
//!     frames: u64,
//!     load: f64,
//! }
//!
//! // Producer
//! let session = Session::init("demo", Config::default()).unwrap();
//! session.register::<Stats>(
//!     TypeDescriptor::builder::<Stats>("Stats")
//!         .field("frames", offset_of!(Stats, frames), Primitive::UInt64, Atomicity::None)
//!         .field("load", offset_of!(Stats, load), Primitive::Float64, Atomicity::None)
//!         .build(),
//! ).unwrap();
//! let mut stats = session.create::<Stats>("stats").unwrap();
//! stats.frames = 1;
//!
//! // Observer (normally another process)
//! let mut observer = memglass::Observer::new("demo");
//! observer.connect().unwrap();
//! let view = observer.find("stats").unwrap();
//! assert_eq!(view.field("frames").read::<u64>(), Some(1));
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------+                      +--------------------+
//! |  Producer process  |    shared memory     | Observer processes |
//! |                    |                      |                    |
//! |  Session           |  /memglass_S_header  |  Observer          |
//! |   type registry ---+--> types / fields ---+-> type mirror      |
//! |   object dir    ---+--> directory      ---+-> find / objects   |
//! |   region manager --+--> region chain   ---+-> region walk      |
//! |                    |  /memglass_S_region_*|                    |
//! |   field writes  ---+--> object bytes   ---+-> field proxies    |
//! +--------------------+                      +--------------------+
//! ```
//!
//! Observers never mutate shared memory. Per-field read discipline is
//! declared at registration time via [`Atomicity`]: plain loads, hardware
//! atomics, the [`Guarded`] sequence lock, or the [`Locked`] spin lock.

pub mod layout;
pub mod observer;
pub mod region;
pub mod registry;
pub mod session;
pub mod shm;
pub mod sync;

pub use layout::{Atomicity, Config, ObjectState, Primitive};
pub use observer::{FieldProxy, ObjectView, ObservedObject, ObservedType, Observer, Value};
pub use registry::{FieldDescriptor, TypeDescriptor, TypeDescriptorBuilder};
pub use session::{Session, Shared, SharedArray};
pub use shm::SharedMemory;
pub use sync::{Guarded, Locked};

use std::fmt;
use std::io;

/// Errors from session setup and observer attachment.
///
/// Query-path failures (missing labels, unknown fields, full tables) are
/// not errors: they surface as `None`/empty results.
#[derive(Debug)]
pub enum MemglassError {
    /// Shared-memory object creation failed
    SegmentCreate(io::Error),

    /// Shared-memory object open failed
    SegmentOpen(io::Error),

    /// Memory mapping failed
    Mmap(io::Error),

    /// Invalid shared-memory object name
    InvalidName(String),

    /// No such shared-memory object
    NotFound(String),

    /// Header magic mismatch: not a memglass session
    BadMagic,

    /// Protocol version mismatch
    BadVersion { expected: u32, found: u32 },
}

impl fmt::Display for MemglassError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SegmentCreate(e) => write!(f, "shared memory creation failed: {e}"),
            Self::SegmentOpen(e) => write!(f, "shared memory open failed: {e}"),
            Self::Mmap(e) => write!(f, "memory mapping failed: {e}"),
            Self::InvalidName(name) => write!(f, "invalid object name: {name}"),
            Self::NotFound(name) => write!(f, "shared memory object not found: {name}"),
            Self::BadMagic => write!(f, "header magic mismatch: not a memglass session"),
            Self::BadVersion { expected, found } => {
                write!(f, "protocol version mismatch: expected {expected}, found {found}")
            }
        }
    }
}

impl std::error::Error for MemglassError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::SegmentCreate(e) | Self::SegmentOpen(e) | Self::Mmap(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type for memglass setup operations.
pub type Result<T> = std::result::Result<T, MemglassError>;
