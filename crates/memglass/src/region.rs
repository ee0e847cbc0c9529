// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Data region chain and bump allocator.
//!
//! The producer owns a singly-linked chain of shared-memory data regions.
//! Allocation bumps the tail region's `used` cursor; when the tail cannot
//! satisfy a request, a new region is created, linked in, and the header's
//! structural sequence is bumped so observers pick it up on refresh.
//!
//! Regions are append-only: a region is never resized, never unlinked
//! before shutdown, and allocations within it are never freed or moved.
//! That is what makes an `Alive` object's `(region_id, offset)` valid for
//! the remaining lifetime of the session.

use crate::layout::{RegionDescriptor, SessionHeader, REGION_MAGIC};
use crate::shm::{region_object_name, SharedMemory};
use crate::Result;
use parking_lot::Mutex;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;

const DESCRIPTOR_SIZE: usize = std::mem::size_of::<RegionDescriptor>();

fn align_up(value: u64, alignment: usize) -> u64 {
    let a = alignment as u64;
    (value + a - 1) & !(a - 1)
}

struct Region {
    shm: SharedMemory,
    id: u64,
}

impl Region {
    fn descriptor(&self) -> &RegionDescriptor {
        // SAFETY: every region is created at least DESCRIPTOR_SIZE bytes
        // large and its base is page-aligned, so the descriptor is always
        // in bounds and aligned.
        unsafe { &*self.shm.as_ptr().cast::<RegionDescriptor>() }
    }
}

struct Chain {
    regions: Vec<Region>,
    next_region_id: u64,
    /// Total size (descriptor included) of the most recent region
    current_size: usize,
}

/// Producer-side manager of the data region chain.
///
/// All mutation is serialized by an internal mutex; observers walk the
/// chain lock-free through the shared descriptors.
pub(crate) struct RegionManager {
    session: String,
    header: NonNull<SessionHeader>,
    max_region_size: usize,
    chain: Mutex<Chain>,
}

// SAFETY: the header pointer targets a mapping owned by the Session, which
// also owns this manager; the chain itself is mutex-protected.
unsafe impl Send for RegionManager {}
unsafe impl Sync for RegionManager {}

impl RegionManager {
    pub(crate) fn new(
        session: &str,
        header: NonNull<SessionHeader>,
        initial_region_size: usize,
        max_region_size: usize,
    ) -> Self {
        Self {
            session: session.to_string(),
            header,
            max_region_size,
            chain: Mutex::new(Chain {
                regions: Vec::new(),
                next_region_id: 1,
                current_size: initial_region_size,
            }),
        }
    }

    fn header(&self) -> &SessionHeader {
        // SAFETY: the Session keeps the header mapping alive for as long as
        // this manager exists.
        unsafe { self.header.as_ref() }
    }

    /// Create the first region and announce it in the header.
    pub(crate) fn init(&self) -> Result<()> {
        let mut chain = self.chain.lock();
        let initial = chain.current_size;
        let region = self.create_region(&mut chain, initial)?;
        self.header()
            .first_region_id
            .store(region, Ordering::Release);
        Ok(())
    }

    /// Create a region of `total_size` bytes, write its descriptor, and link
    /// it behind the current tail. Returns the new region's id.
    fn create_region(&self, chain: &mut Chain, total_size: usize) -> Result<u64> {
        let id = chain.next_region_id;
        let name = region_object_name(&self.session, id);

        let shm = SharedMemory::create(&name, total_size)?;

        // SAFETY: the fresh mapping is zeroed, at least DESCRIPTOR_SIZE
        // bytes, and exclusively ours until the descriptor is published.
        let desc = unsafe { &mut *shm.as_ptr().cast::<RegionDescriptor>() };
        desc.magic = REGION_MAGIC;
        desc.region_id = id;
        desc.size = total_size as u64;
        desc.used.store(DESCRIPTOR_SIZE as u64, Ordering::Release);
        desc.next_region_id.store(0, Ordering::Release);
        desc.set_shm_name(&name);

        // Link behind the previous tail: set once, from zero.
        if let Some(tail) = chain.regions.last() {
            tail.descriptor()
                .next_region_id
                .store(id, Ordering::Release);
        }

        log::debug!("[REGION] created {name} ({total_size} bytes)");

        chain.next_region_id += 1;
        chain.regions.push(Region { shm, id });
        Ok(id)
    }

    /// Bump-allocate `size` bytes at `alignment` (a power of two).
    ///
    /// Grows the chain when the tail is full. Requests that cannot fit in
    /// any region return `None` without creating one.
    pub(crate) fn allocate(&self, size: usize, alignment: usize) -> Option<NonNull<u8>> {
        debug_assert!(alignment.is_power_of_two());
        // The request must fit past the descriptor *at its alignment* in a
        // max-sized region, otherwise no region can ever hold it.
        let padded_descriptor = align_up(DESCRIPTOR_SIZE as u64, alignment) as usize;
        if size == 0 || size > self.max_region_size.saturating_sub(padded_descriptor) {
            return None;
        }

        let mut chain = self.chain.lock();
        let mut grew = false;
        loop {
            let tail = chain.regions.last()?;
            let desc = tail.descriptor();

            let used = desc.used.load(Ordering::Acquire);
            let aligned = align_up(used, alignment);
            let new_used = aligned + size as u64;

            if new_used <= desc.size {
                desc.used.store(new_used, Ordering::Release);
                // SAFETY: [aligned, new_used) is inside this region's
                // mapping and was never handed out before.
                let ptr = unsafe { tail.shm.as_ptr().add(aligned as usize) };
                return NonNull::new(ptr);
            }

            if grew {
                // A fresh region still cannot hold the request (alignment
                // padding ate the slack). The region stays for future use.
                return None;
            }

            // Tail is full: grow. At least double the previous region,
            // capped at the maximum, but never below what this request
            // needs past the aligned descriptor (the upfront guard keeps
            // that bound within max_region_size).
            let min_total = padded_descriptor + size;
            let new_size = chain
                .current_size
                .saturating_mul(2)
                .min(self.max_region_size)
                .max(min_total);
            chain.current_size = new_size;

            if self.create_region(&mut chain, new_size).is_err() {
                return None;
            }
            self.header().bump_sequence();
            grew = true;
        }
    }

    /// Resolve a pointer returned by [`allocate`](Self::allocate) back to
    /// its `(region_id, offset_in_region)`.
    pub(crate) fn locate(&self, ptr: *const u8) -> Option<(u64, u64)> {
        let chain = self.chain.lock();
        for region in &chain.regions {
            let base = region.shm.as_ptr() as usize;
            let p = ptr as usize;
            if p >= base && p < base + region.shm.size() {
                return Some((region.id, (p - base) as u64));
            }
        }
        None
    }

    /// Number of regions in the chain.
    pub(crate) fn region_count(&self) -> usize {
        self.chain.lock().regions.len()
    }
}
