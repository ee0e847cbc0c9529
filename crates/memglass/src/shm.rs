// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! POSIX shared memory mapping.
//!
//! Safe wrapper around `shm_open`, `ftruncate`, and `mmap` for the header
//! region and the data regions of a session.
//!
//! # Lifecycle
//!
//! 1. The producer creates objects with [`SharedMemory::create`]
//! 2. Observers map them with [`SharedMemory::open`]
//! 3. Every handle unmaps on drop
//! 4. The *creating* handle additionally unlinks its name on drop; observer
//!    handles never unlink
//!
//! Unlinking removes the name from the namespace only; mappings held by
//! other processes stay valid until they unmap.
//!
//! # Naming convention
//!
//! Object names must start with `/` and contain no other `/`. Session names
//! map deterministically:
//!
//! - header: `/memglass_<session>_header`
//! - data region: `/memglass_<session>_region_<id>` (id zero-padded to 4)

use crate::{MemglassError, Result};
use std::ffi::CString;
use std::io;
use std::ptr;

/// Shared-memory object name of a session's header region.
#[must_use]
pub fn header_object_name(session: &str) -> String {
    format!("/memglass_{session}_header")
}

/// Shared-memory object name of a session's data region.
#[must_use]
pub fn region_object_name(session: &str, region_id: u64) -> String {
    format!("/memglass_{session}_region_{region_id:04}")
}

/// A mapped POSIX shared-memory object.
///
/// Movable, non-clonable. The handle that created the object owns its name
/// and unlinks it on drop.
pub struct SharedMemory {
    /// Pointer to the mapped bytes
    ptr: *mut u8,
    /// Size of the mapping
    size: usize,
    /// Object name (for unlink)
    name: String,
    /// Whether this handle created the object
    owner: bool,
}

// SAFETY: the mapping is plain shared memory designed for cross-process
// access; all concurrent-access discipline lives in the structures placed
// inside it (atomics, Guarded, Locked).
unsafe impl Send for SharedMemory {}
unsafe impl Sync for SharedMemory {}

impl SharedMemory {
    /// Create a new shared-memory object of `size` bytes and map it.
    ///
    /// If an object with this name already exists (left behind by a crashed
    /// producer), it is reopened and truncated rather than failing the
    /// session outright.
    ///
    /// # Errors
    ///
    /// Returns an error when the object cannot be created, sized, or mapped;
    /// the handle is left closed and nothing remains linked.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        Self::validate_name(name)?;

        let c_name =
            CString::new(name).map_err(|_| MemglassError::InvalidName(name.to_string()))?;

        // SAFETY:
        // - c_name is a valid NUL-terminated CString created above
        // - shm_open with O_CREAT|O_RDWR|O_EXCL either creates a fresh object
        //   or fails with EEXIST; both paths are checked below
        // - mode 0o600 is a valid permission mask
        let mut fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_RDWR | libc::O_EXCL,
                0o600,
            )
        };

        if fd < 0 && io::Error::last_os_error().raw_os_error() == Some(libc::EEXIST) {
            // Stale object from a crashed producer: take it over.
            log::warn!("[SHM] reusing existing object {name}");
            // SAFETY: same CString; opening an existing object for read/write.
            fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
        }

        if fd < 0 {
            return Err(MemglassError::SegmentCreate(io::Error::last_os_error()));
        }

        // SAFETY:
        // - fd is a valid descriptor from the successful shm_open above
        // - ftruncate fails gracefully on an out-of-range size (checked)
        let ret = unsafe { libc::ftruncate(fd, size as libc::off_t) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: fd is valid and not used after this error path.
            unsafe {
                libc::close(fd);
                libc::shm_unlink(c_name.as_ptr());
            }
            return Err(MemglassError::SegmentCreate(err));
        }

        // SAFETY:
        // - null addr lets the kernel pick the mapping address
        // - PROT_READ|PROT_WRITE with MAP_SHARED is a valid cross-process
        //   read/write mapping of the object sized above
        // - fd is valid; offset 0 maps from the start
        // - MAP_FAILED is checked below
        let map = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };

        // SAFETY: the mapping (when successful) keeps its own reference to
        // the object; the descriptor is no longer needed either way.
        unsafe { libc::close(fd) };

        if map == libc::MAP_FAILED {
            // SAFETY: removing the name we just created; no mapping exists.
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
            return Err(MemglassError::Mmap(io::Error::last_os_error()));
        }

        // SAFETY: map points at exactly `size` writable bytes and nothing
        // else references this object yet. ftruncate zero-fills fresh pages,
        // but a taken-over stale object keeps its old content, so clear it.
        unsafe {
            ptr::write_bytes(map.cast::<u8>(), 0, size);
        }

        Ok(Self {
            ptr: map.cast::<u8>(),
            size,
            name: name.to_string(),
            owner: true,
        })
    }

    /// Map an existing shared-memory object read/write.
    ///
    /// The mapping size is discovered from the object's metadata.
    ///
    /// # Errors
    ///
    /// Returns [`MemglassError::NotFound`] when no such object exists, or a
    /// map error; the handle is left closed.
    pub fn open(name: &str) -> Result<Self> {
        Self::validate_name(name)?;

        let c_name =
            CString::new(name).map_err(|_| MemglassError::InvalidName(name.to_string()))?;

        // SAFETY: c_name is a valid CString; O_RDWR opens an existing object.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };

        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::NotFound {
                return Err(MemglassError::NotFound(name.to_string()));
            }
            return Err(MemglassError::SegmentOpen(err));
        }

        // SAFETY: fd is valid; fstat writes into the zeroed stat buffer.
        let mut sb: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut sb) } < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: fd is valid and not used after this error path.
            unsafe { libc::close(fd) };
            return Err(MemglassError::SegmentOpen(err));
        }
        let size = sb.st_size as usize;

        // SAFETY: identical contract to the mmap call in create().
        let map = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };

        // SAFETY: mapping holds its own reference; fd no longer needed.
        unsafe { libc::close(fd) };

        if map == libc::MAP_FAILED {
            return Err(MemglassError::Mmap(io::Error::last_os_error()));
        }

        Ok(Self {
            ptr: map.cast::<u8>(),
            size,
            name: name.to_string(),
            owner: false,
        })
    }

    fn validate_name(name: &str) -> Result<()> {
        if !name.starts_with('/') {
            return Err(MemglassError::InvalidName(format!(
                "object name must start with '/': {name}"
            )));
        }
        if name.len() > 1 && name[1..].contains('/') {
            return Err(MemglassError::InvalidName(format!(
                "object name cannot contain '/' after the prefix: {name}"
            )));
        }
        if name.len() > 255 {
            return Err(MemglassError::InvalidName(format!(
                "object name too long (max 255): {name}"
            )));
        }
        Ok(())
    }

    /// Remove the object's name from the namespace.
    ///
    /// Existing mappings (this one included) remain valid. Idempotent:
    /// a missing name is not an error.
    pub fn unlink(&self) {
        Self::unlink_name(&self.name);
    }

    /// Unlink an object by name without mapping it.
    pub fn unlink_name(name: &str) {
        if let Ok(c_name) = CString::new(name) {
            // SAFETY: valid CString; shm_unlink only touches the namespace.
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
        }
    }

    /// Unmap and, for the creating handle, unlink the name.
    pub fn close(&mut self) {
        if !self.ptr.is_null() {
            // SAFETY: ptr/size describe exactly one live mapping obtained
            // from mmap in create()/open(); close() resets ptr so the
            // mapping is never unmapped twice.
            unsafe {
                libc::munmap(self.ptr.cast::<libc::c_void>(), self.size);
            }
            self.ptr = ptr::null_mut();
        }
        if self.owner && !self.name.is_empty() {
            Self::unlink_name(&self.name);
            self.owner = false;
        }
        self.size = 0;
    }

    /// Check whether an object with the given name currently exists.
    #[must_use]
    pub fn exists(name: &str) -> bool {
        let Ok(c_name) = CString::new(name) else {
            return false;
        };

        // SAFETY: valid CString; O_RDONLY probe, descriptor closed below.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDONLY, 0) };
        if fd >= 0 {
            // SAFETY: fd is valid and unused after this.
            unsafe { libc::close(fd) };
            true
        } else {
            false
        }
    }

    /// Raw pointer to the mapped bytes.
    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Size of the mapping.
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Object name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this handle created (and will unlink) the object.
    #[inline]
    #[must_use]
    pub fn is_owner(&self) -> bool {
        self.owner
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        self.close();
    }
}
