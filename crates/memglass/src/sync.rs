// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Field-level synchronization primitives.
//!
//! Both wrappers are embedded directly inside observed objects, so their
//! layout is part of the wire contract: `#[repr(C)]` with the control word
//! first and the payload after it. Both assume exactly one writer (the
//! producer) and any number of readers (observers in other processes), and
//! both require the payload to be trivially copyable.
//!
//! # Memory ordering
//!
//! `Guarded<T>` is a classic sequence lock:
//!
//! 1. Writer stores an odd sequence (write in progress), copies the payload,
//!    then stores the next even sequence with Release. The Release pairs
//!    with the readers' Acquire loads so a reader that sees the even value
//!    also sees the payload bytes that preceded it.
//! 2. Readers sample the sequence, copy the payload, and sample again; an
//!    odd value or a mismatch means the copy may be torn and is discarded.
//!
//! The payload copies go through volatile reads/writes so the compiler can
//! neither fuse them across the sequence checks nor invent extra loads.
//!
//! Readers and the writer live in different processes sharing the same
//! cache-coherent memory, so no fences beyond Acquire/Release are needed.

use std::cell::UnsafeCell;
use std::mem::offset_of;
use std::sync::atomic::{fence, AtomicBool, AtomicU32, Ordering};

/// Sequence-locked value for tear-free reads of compound types.
///
/// Single writer, many readers. Readers never block the writer; a reader
/// retries until it observes a quiescent copy.
#[repr(C)]
pub struct Guarded<T> {
    seq: AtomicU32,
    value: UnsafeCell<T>,
}

// SAFETY: concurrent access is mediated by the seqlock protocol; readers
// only ever copy the payload out, and torn copies are detected and
// discarded before use.
unsafe impl<T: Copy + Send> Send for Guarded<T> {}
unsafe impl<T: Copy + Send> Sync for Guarded<T> {}

impl<T: Copy> Guarded<T> {
    /// Byte offset of the payload inside the wrapper.
    ///
    /// Pre-flattened dotted field entries use this to address subfields of
    /// a guarded payload directly.
    pub const VALUE_OFFSET: usize = offset_of!(Self, value);

    #[must_use]
    pub const fn new(value: T) -> Self {
        Self {
            seq: AtomicU32::new(0),
            value: UnsafeCell::new(value),
        }
    }

    /// Producer-side write.
    ///
    /// Must only be called from the single writer; concurrent writers would
    /// corrupt the sequence protocol.
    pub fn write(&self, value: T) {
        let s = self.seq.load(Ordering::Relaxed);
        // Odd = write in progress. Relaxed is enough for the flag itself;
        // the fence keeps the payload store from floating above it.
        self.seq.store(s.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);

        // SAFETY: single-writer contract; readers tolerate torn payload
        // bytes while the sequence is odd. Volatile keeps the copy intact
        // as a store to memory the compiler must not elide or reorder.
        unsafe {
            self.value.get().write_volatile(value);
        }

        // Even = clean; Release publishes the payload to Acquire readers.
        self.seq.store(s.wrapping_add(2), Ordering::Release);
    }

    /// Observer-side read; spins until a consistent copy is observed.
    #[must_use]
    pub fn read(&self) -> T {
        loop {
            if let Some(v) = self.try_read() {
                return v;
            }
            std::hint::spin_loop();
        }
    }

    /// One-pass read; `None` when a write was in progress or the copy tore.
    #[must_use]
    pub fn try_read(&self) -> Option<T> {
        let s1 = self.seq.load(Ordering::Acquire);
        if s1 & 1 == 1 {
            return None;
        }

        // SAFETY: the pointee is valid for reads at all times; a value read
        // concurrently with a write may be torn, which the sequence
        // comparison below detects. Volatile prevents the compiler from
        // fusing this copy with either sequence load.
        let result = unsafe { self.value.get().read_volatile() };

        // Order the payload copy before the second sequence load.
        fence(Ordering::Acquire);

        let s2 = self.seq.load(Ordering::Acquire);
        (s1 == s2).then_some(result)
    }
}

impl<T: Copy + Default> Default for Guarded<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// Spin-locked value for exclusive access from both sides.
///
/// Unlike [`Guarded`], readers here do take the lock, so a reader can stall
/// the writer; in exchange the protocol supports read-modify-write.
#[repr(C)]
pub struct Locked<T> {
    flag: AtomicBool,
    value: UnsafeCell<T>,
}

// SAFETY: every access to the payload happens between a successful
// lock acquisition (Acquire) and the release store, on any process.
unsafe impl<T: Copy + Send> Send for Locked<T> {}
unsafe impl<T: Copy + Send> Sync for Locked<T> {}

impl<T: Copy> Locked<T> {
    /// Byte offset of the payload inside the wrapper.
    pub const VALUE_OFFSET: usize = offset_of!(Self, value);

    #[must_use]
    pub const fn new(value: T) -> Self {
        Self {
            flag: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    #[inline]
    fn acquire(&self) {
        while self.flag.swap(true, Ordering::Acquire) {
            std::hint::spin_loop();
        }
    }

    #[inline]
    fn release(&self) {
        self.flag.store(false, Ordering::Release);
    }

    pub fn write(&self, value: T) {
        self.acquire();
        // SAFETY: the flag grants exclusive access until release().
        unsafe {
            *self.value.get() = value;
        }
        self.release();
    }

    #[must_use]
    pub fn read(&self) -> T {
        self.acquire();
        // SAFETY: exclusive access under the flag.
        let result = unsafe { *self.value.get() };
        self.release();
        result
    }

    /// Read-modify-write under the lock.
    pub fn update<F: FnOnce(&mut T)>(&self, f: F) {
        self.acquire();
        // SAFETY: exclusive access under the flag.
        unsafe {
            f(&mut *self.value.get());
        }
        self.release();
    }
}

impl<T: Copy + Default> Default for Locked<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}
