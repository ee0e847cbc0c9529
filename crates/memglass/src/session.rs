// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Producer session: header initialization, type publication, and object
//! lifecycle.
//!
//! A [`Session`] is the single owned entry point for the producer process.
//! Creating it materializes the header region; dropping it unlinks the
//! header and every data region (observers that are still mapped keep
//! working until they unmap).
//!
//! # Publication discipline
//!
//! Structural changes follow one pattern: write the new entry with plain
//! stores, publish the grown count with a release store, then bump the
//! header's structural sequence. An observer that acquires a count is
//! therefore guaranteed to see every entry below it fully written.

use crate::layout::{
    Config, ObjectEntry, ObjectState, SessionHeader, HEADER_MAGIC, PROTOCOL_VERSION,
};
use crate::region::RegionManager;
use crate::registry::{TypeDescriptor, TypeRegistry};
use crate::shm::{header_object_name, SharedMemory};
use crate::Result;
use parking_lot::Mutex;
use std::any::TypeId;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

/// Handle to an object the producer placed in shared memory.
///
/// Borrows the session, so it cannot outlive the mappings it points into.
/// Writes through `DerefMut` are plain stores; fields that declared a
/// stricter [`Atomicity`](crate::Atomicity) must be written through their
/// wrapper (`Guarded`, `Locked`) or an atomic instead.
pub struct Shared<'s, T> {
    ptr: NonNull<T>,
    _session: PhantomData<&'s Session>,
}

// SAFETY: the pointee lives in shared memory for the rest of the session;
// the single-writer contract makes handing the handle to another producer
// thread sound.
unsafe impl<T: Send> Send for Shared<'_, T> {}
unsafe impl<T: Sync> Sync for Shared<'_, T> {}

impl<T> Shared<'_, T> {
    #[must_use]
    pub fn as_ptr(&self) -> *mut T {
        self.ptr.as_ptr()
    }
}

impl<T> Deref for Shared<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the session keeps the region mapped and never relocates
        // or reuses the allocation.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> DerefMut for Shared<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as above; mutation is the producer's exclusive right.
        unsafe { self.ptr.as_mut() }
    }
}

/// Handle to an array of objects placed in shared memory.
pub struct SharedArray<'s, T> {
    ptr: NonNull<T>,
    len: usize,
    _session: PhantomData<&'s Session>,
}

// SAFETY: same contract as `Shared`.
unsafe impl<T: Send> Send for SharedArray<'_, T> {}
unsafe impl<T: Sync> Sync for SharedArray<'_, T> {}

impl<T> SharedArray<'_, T> {
    #[must_use]
    pub fn as_ptr(&self) -> *mut T {
        self.ptr.as_ptr()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<T> Deref for SharedArray<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        // SAFETY: the session allocated `len` contiguous elements that stay
        // mapped and immovable for its lifetime.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl<T> DerefMut for SharedArray<'_, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        // SAFETY: as above.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

struct ProducerState {
    registry: TypeRegistry,
    /// Object base address -> directory slot, for destroy()
    ptr_to_slot: HashMap<usize, u32>,
}

/// A producer-side memglass session.
///
/// One per process and session name. All methods take `&self`; internal
/// mutation is serialized by a mutex, and everything observers read is
/// published through atomics in shared memory.
pub struct Session {
    name: String,
    config: Config,
    header_shm: SharedMemory,
    header: NonNull<SessionHeader>,
    regions: RegionManager,
    state: Mutex<ProducerState>,
}

// SAFETY: the raw header pointer targets the mapping owned by this struct;
// all interior mutation is mutex- or atomic-mediated.
unsafe impl Send for Session {}
unsafe impl Sync for Session {}

impl Session {
    /// Create a session: size and initialize the header region, then create
    /// the first data region.
    ///
    /// # Errors
    ///
    /// Any shared-memory failure aborts the init; everything created so far
    /// is unlinked before the error returns.
    pub fn init(name: &str, config: Config) -> Result<Self> {
        let header_size = config.header_region_size();
        let header_shm = SharedMemory::create(&header_object_name(name), header_size)?;

        let header_ptr = header_shm.as_ptr().cast::<SessionHeader>();
        // SAFETY: the mapping is zeroed, exclusively ours until the name is
        // handed to observers, and large enough for the header struct.
        let header = unsafe { &mut *header_ptr };

        header.magic = HEADER_MAGIC;
        header.version = PROTOCOL_VERSION;
        header.header_size = std::mem::size_of::<SessionHeader>() as u32;

        // [SessionHeader][TypeEntry..][FieldEntry..][ObjectEntry..]
        header.type_table_offset = std::mem::size_of::<SessionHeader>() as u64;
        header.type_capacity = config.max_types;
        header.field_table_offset = header.type_table_offset
            + u64::from(config.max_types) * std::mem::size_of::<crate::layout::TypeEntry>() as u64;
        header.field_capacity = config.max_fields;
        header.object_dir_offset = header.field_table_offset
            + u64::from(config.max_fields)
                * std::mem::size_of::<crate::layout::FieldEntry>() as u64;
        header.object_capacity = config.max_objects;

        header.set_session_name(name);
        // SAFETY: getpid never fails.
        header.producer_pid = unsafe { libc::getpid() } as u64;
        header.start_timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);

        let header_nn = NonNull::new(header_ptr).expect("mapped header pointer");
        let regions = RegionManager::new(
            name,
            header_nn,
            config.initial_region_size,
            config.max_region_size,
        );
        // On failure the header_shm drop below unlinks the header object.
        regions.init()?;

        log::info!("[SESSION] {name} initialized ({header_size} byte header)");

        Ok(Self {
            name: name.to_string(),
            config,
            header_shm,
            header: header_nn,
            regions,
            state: Mutex::new(ProducerState {
                registry: TypeRegistry::default(),
                ptr_to_slot: HashMap::new(),
            }),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    fn header(&self) -> &SessionHeader {
        // SAFETY: self owns the mapping the pointer targets.
        unsafe { self.header.as_ref() }
    }

    /// Register a type and publish it (and its fields) to the header
    /// tables, aliased to the Rust type `T` for `create::<T>`.
    ///
    /// Returns `None` when the type or field table is full.
    pub fn register<T: 'static>(&self, descriptor: TypeDescriptor) -> Option<u32> {
        self.register_inner(Some(TypeId::of::<T>()), descriptor)
    }

    /// Register a type known only by descriptor (no Rust-type alias).
    pub fn register_type(&self, descriptor: TypeDescriptor) -> Option<u32> {
        self.register_inner(None, descriptor)
    }

    fn register_inner(&self, alias: Option<TypeId>, descriptor: TypeDescriptor) -> Option<u32> {
        let header = self.header();
        let mut state = self.state.lock();

        let is_new = state.registry.id_for_name(&descriptor.name).is_none();
        if is_new && state.registry.len() >= header.type_capacity as usize {
            return None;
        }
        let type_name = descriptor.name.clone();

        let id = match alias {
            Some(alias) => state.registry.register_for(alias, descriptor),
            None => state.registry.register(descriptor),
        };

        // Re-publish the whole registry; counts move forward only.
        // SAFETY: base/extents are the live header region this session owns.
        unsafe {
            state
                .registry
                .write_to_header(header, self.header_shm.as_ptr());
        }
        header.bump_sequence();

        // A type past the table capacity was not published. Roll the
        // registry back so the name and alias stay unregistered and
        // create::<T> fails too, instead of minting directory entries no
        // observer can ever resolve.
        if header.type_count.load(Ordering::Acquire) < state.registry.len() as u32 {
            if is_new {
                state.registry.unregister(&type_name, alias);
            }
            return None;
        }
        Some(id)
    }

    /// Create a zero-initialized object of registered type `T`.
    ///
    /// Returns `None` when the type was never registered, the object
    /// directory is full, or the allocation cannot fit any region.
    pub fn create<T: Copy + 'static>(&self, label: &str) -> Option<Shared<'_, T>> {
        let ptr = self.create_raw(
            TypeId::of::<T>(),
            label,
            std::mem::size_of::<T>(),
            std::mem::align_of::<T>(),
        )?;
        Some(Shared {
            ptr: ptr.cast::<T>(),
            _session: PhantomData,
        })
    }

    /// Create an object of registered type `T` with an initial value.
    pub fn create_with<T: Copy + 'static>(&self, label: &str, value: T) -> Option<Shared<'_, T>> {
        let mut shared = self.create::<T>(label)?;
        *shared = value;
        Some(shared)
    }

    /// Create a zero-initialized array of `count` objects of registered
    /// type `T`, advertised as a single labelled instance.
    pub fn create_array<T: Copy + 'static>(
        &self,
        label: &str,
        count: usize,
    ) -> Option<SharedArray<'_, T>> {
        if count == 0 {
            return None;
        }
        let ptr = self.create_raw(
            TypeId::of::<T>(),
            label,
            std::mem::size_of::<T>() * count,
            std::mem::align_of::<T>(),
        )?;
        Some(SharedArray {
            ptr: ptr.cast::<T>(),
            len: count,
            _session: PhantomData,
        })
    }

    /// Allocate, locate, and append a directory entry. The allocation is
    /// zeroed (fresh region bytes are never reused).
    fn create_raw(
        &self,
        alias: TypeId,
        label: &str,
        size: usize,
        align: usize,
    ) -> Option<NonNull<u8>> {
        let header = self.header();
        let mut state = self.state.lock();

        let type_id = state.registry.id_for_alias(alias)?;

        let count = header.object_count.load(Ordering::Acquire);
        if count >= header.object_capacity {
            log::warn!("[SESSION] object directory full, cannot create {label}");
            return None;
        }

        let ptr = self.regions.allocate(size, align)?;
        let (region_id, offset) = self.regions.locate(ptr.as_ptr())?;

        // SAFETY: the directory slot at `count` is inside the header region
        // (count < object_capacity) and unpublished until the count store.
        let entry = unsafe { &mut *self.object_dir().add(count as usize) };
        entry.type_id = type_id;
        entry.region_id = region_id;
        entry.offset = offset;
        entry.generation = 1;
        entry.set_label(label);
        entry
            .state
            .store(ObjectState::Alive as u32, Ordering::Release);

        header.object_count.store(count + 1, Ordering::Release);
        header.bump_sequence();

        state.ptr_to_slot.insert(ptr.as_ptr() as usize, count);
        Some(ptr)
    }

    /// Mark an object destroyed.
    ///
    /// The directory slot is not reclaimed and the object's bytes are never
    /// reused; observers holding stale views read frozen data.
    pub fn destroy<T>(&self, object: Shared<'_, T>) {
        self.destroy_at(object.as_ptr().cast::<u8>());
    }

    /// Mark an array object destroyed.
    pub fn destroy_array<T>(&self, array: SharedArray<'_, T>) {
        self.destroy_at(array.as_ptr().cast::<u8>());
    }

    fn destroy_at(&self, ptr: *mut u8) {
        let mut state = self.state.lock();
        let Some(slot) = state.ptr_to_slot.remove(&(ptr as usize)) else {
            return;
        };
        // SAFETY: slot indexes a previously published directory entry.
        let entry = unsafe { &*self.object_dir().add(slot as usize) };
        entry
            .state
            .store(ObjectState::Destroyed as u32, Ordering::Release);
        self.header().bump_sequence();
    }

    /// Linear scan of the directory for an `Alive` object with this label.
    pub(crate) fn find_slot(&self, label: &str) -> Option<u32> {
        let header = self.header();
        let count = header.object_count.load(Ordering::Acquire);
        for i in 0..count {
            // SAFETY: i < published count, so the entry is fully written.
            let entry = unsafe { &*self.object_dir().add(i as usize) };
            if entry.state() == ObjectState::Alive && entry.label_str() == label {
                return Some(i);
            }
        }
        None
    }

    /// Whether an `Alive` object with this label exists.
    #[must_use]
    pub fn contains(&self, label: &str) -> bool {
        self.find_slot(label).is_some()
    }

    /// Number of directory entries ever created (including destroyed).
    #[must_use]
    pub fn object_count(&self) -> u32 {
        self.header().object_count.load(Ordering::Acquire)
    }

    /// Current structural sequence value.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.header().sequence.load(Ordering::Acquire)
    }

    /// Number of data regions created so far.
    #[must_use]
    pub fn region_count(&self) -> usize {
        self.regions.region_count()
    }

    fn object_dir(&self) -> *mut ObjectEntry {
        // SAFETY: offset was computed from the same capacities that sized
        // the mapping.
        unsafe {
            self.header_shm
                .as_ptr()
                .add(self.header().object_dir_offset as usize)
                .cast::<ObjectEntry>()
        }
    }

    /// Tear the session down explicitly. Equivalent to dropping it.
    pub fn shutdown(self) {
        drop(self);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Region and header shms are owners: their drops unmap and unlink.
        log::info!("[SESSION] {} shut down", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{Atomicity, Primitive};
    use std::mem::offset_of;

    fn unique_session() -> String {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("sesstest_{}_{ts}", std::process::id())
    }

    #[derive(Clone, Copy, Default)]
    #[repr(C)]
    struct Sample {
        x: i32,
        y: i32,
        value: f64,
    }

    fn sample_descriptor() -> TypeDescriptor {
        TypeDescriptor::builder::<Sample>("Sample")
            .field("x", offset_of!(Sample, x), Primitive::Int32, Atomicity::None)
            .field("y", offset_of!(Sample, y), Primitive::Int32, Atomicity::None)
            .field(
                "value",
                offset_of!(Sample, value),
                Primitive::Float64,
                Atomicity::None,
            )
            .build()
    }

    #[test]
    fn init_publishes_valid_header() {
        let session = Session::init(&unique_session(), Config::default()).expect("init");
        let header = session.header();
        assert!(header.validate());
        assert_eq!(header.type_table_offset, 160);
        assert_eq!(header.object_capacity, 4096);
        assert!(header.producer_pid > 0);
        assert!(header.start_timestamp > 0);
        assert_eq!(header.first_region_id.load(Ordering::Acquire), 1);
    }

    #[test]
    fn init_unlinks_on_drop() {
        let name = unique_session();
        let shm_name = header_object_name(&name);
        {
            let _session = Session::init(&name, Config::default()).expect("init");
            assert!(SharedMemory::exists(&shm_name));
        }
        assert!(!SharedMemory::exists(&shm_name));
    }

    #[test]
    fn create_requires_registration() {
        let session = Session::init(&unique_session(), Config::default()).expect("init");
        assert!(session.create::<Sample>("orphan").is_none());
    }

    #[test]
    fn create_and_write_round_trip() {
        let session = Session::init(&unique_session(), Config::default()).expect("init");
        session.register::<Sample>(sample_descriptor()).expect("register");

        let mut obj = session.create::<Sample>("sample_1").expect("create");
        assert_eq!(obj.x, 0);
        obj.x = 42;
        obj.value = 2.5;
        assert_eq!(obj.x, 42);
        assert!(session.contains("sample_1"));
        assert_eq!(session.object_count(), 1);
    }

    #[test]
    fn create_with_initial_value() {
        let session = Session::init(&unique_session(), Config::default()).expect("init");
        session.register::<Sample>(sample_descriptor()).expect("register");

        let obj = session
            .create_with("seeded", Sample { x: 7, y: 8, value: 9.0 })
            .expect("create_with");
        assert_eq!(obj.x, 7);
        assert_eq!(obj.y, 8);
    }

    #[test]
    fn create_array_round_trip() {
        let session = Session::init(&unique_session(), Config::default()).expect("init");
        session
            .register::<i64>(
                TypeDescriptor::builder::<i64>("i64")
                    .field("value", 0, Primitive::Int64, Atomicity::None)
                    .build(),
            )
            .expect("register");

        let mut arr = session.create_array::<i64>("numbers", 16).expect("array");
        assert_eq!(arr.len(), 16);
        arr[3] = 33;
        assert_eq!(arr[3], 33);
        assert!(session.create_array::<i64>("empty", 0).is_none());
    }

    #[test]
    fn destroy_flips_state_and_keeps_slot() {
        let session = Session::init(&unique_session(), Config::default()).expect("init");
        session.register::<Sample>(sample_descriptor()).expect("register");

        let obj = session.create::<Sample>("doomed").expect("create");
        let seq_before = session.sequence();
        session.destroy(obj);

        assert!(!session.contains("doomed"));
        assert_eq!(session.object_count(), 1);
        assert!(session.sequence() > seq_before);
    }

    #[test]
    fn directory_capacity_is_enforced() {
        let config = Config {
            max_objects: 2,
            ..Config::default()
        };
        let session = Session::init(&unique_session(), config).expect("init");
        session.register::<Sample>(sample_descriptor()).expect("register");

        assert!(session.create::<Sample>("a").is_some());
        assert!(session.create::<Sample>("b").is_some());
        assert!(session.create::<Sample>("c").is_none());
    }

    #[test]
    fn field_table_exhaustion_leaves_type_unregistered() {
        #[derive(Clone, Copy, Default)]
        #[repr(C)]
        struct Pairish {
            a: i32,
            b: i32,
        }

        // Room for Sample's three fields but not two more.
        let config = Config {
            max_fields: 4,
            ..Config::default()
        };
        let session = Session::init(&unique_session(), config).expect("init");
        session.register::<Sample>(sample_descriptor()).expect("register");

        let overflowing = TypeDescriptor::builder::<Pairish>("Pairish")
            .field("a", offset_of!(Pairish, a), Primitive::Int32, Atomicity::None)
            .field("b", offset_of!(Pairish, b), Primitive::Int32, Atomicity::None)
            .build();
        assert!(session.register::<Pairish>(overflowing).is_none());

        // The failed type must not be creatable: its id would never appear
        // in any observer's type table.
        assert!(session.create::<Pairish>("ghost").is_none());
        assert_eq!(session.object_count(), 0);

        // The published type keeps working.
        assert!(session.create::<Sample>("ok").is_some());
    }

    #[test]
    fn sequence_is_monotonic_across_operations() {
        let session = Session::init(&unique_session(), Config::default()).expect("init");
        let mut last = session.sequence();

        session.register::<Sample>(sample_descriptor()).expect("register");
        assert!(session.sequence() > last);
        last = session.sequence();

        let obj = session.create::<Sample>("s").expect("create");
        assert!(session.sequence() > last);
        last = session.sequence();

        session.destroy(obj);
        assert!(session.sequence() > last);
    }
}
