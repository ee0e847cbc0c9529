// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Observer engine.
//!
//! An [`Observer`] attaches to a session by name, mirrors its type table,
//! lazily maps data regions, and resolves object-label -> typed view ->
//! named field -> value, using the read discipline each field declares.
//!
//! # State machine
//!
//! ```text
//! Disconnected --connect()--> Connected --disconnect()--> Disconnected
//!                  | failure: stays Disconnected
//! ```
//!
//! While connected, [`Observer::refresh`] re-reads the header's structural
//! sequence and reloads the type mirror and region chain only when it
//! moved. Regions once mapped stay mapped until disconnect, which is what
//! keeps views into older regions valid across refreshes.
//!
//! Reading an object whose entry has flipped to `Destroyed` is allowed (the
//! bytes are never reused) but surfaces frozen data; re-enumerate after a
//! refresh before relying on results.

use crate::layout::{
    Atomicity, FieldEntry, ObjectEntry, ObjectState, Primitive, RegionDescriptor, SessionHeader,
    TypeEntry, HEADER_MAGIC, PROTOCOL_VERSION,
};
use crate::shm::{header_object_name, region_object_name, SharedMemory};
use crate::sync::{Guarded, Locked};
use crate::{MemglassError, Result};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};

/// A type as mirrored from the session's type table.
#[derive(Debug, Clone)]
pub struct ObservedType {
    pub type_id: u32,
    pub name: String,
    pub size: u32,
    pub alignment: u32,
    pub fields: Vec<FieldEntry>,
}

impl ObservedType {
    /// Find a field entry by exact name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldEntry> {
        self.fields.iter().find(|f| f.name_str() == name)
    }
}

/// A live object as enumerated from the directory.
#[derive(Debug, Clone)]
pub struct ObservedObject {
    pub label: String,
    pub type_name: String,
    pub type_id: u32,
    pub region_id: u64,
    pub offset: u64,
    pub generation: u64,
}

/// A decoded primitive field value.
///
/// The small tagged variant the dynamic read path dispatches into; use the
/// `as_*` accessors for exact-typed extraction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Bool(bool),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Char(u8),
}

impl Value {
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Self::I32(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Self::U32(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::I64(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::U64(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_f32(&self) -> Option<f32> {
        match self {
            Self::F32(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::F64(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::I8(v) => write!(f, "{v}"),
            Self::U8(v) => write!(f, "{v}"),
            Self::I16(v) => write!(f, "{v}"),
            Self::U16(v) => write!(f, "{v}"),
            Self::I32(v) => write!(f, "{v}"),
            Self::U32(v) => write!(f, "{v}"),
            Self::I64(v) => write!(f, "{v}"),
            Self::U64(v) => write!(f, "{v}"),
            Self::F32(v) => write!(f, "{v}"),
            Self::F64(v) => write!(f, "{v}"),
            Self::Char(v) => write!(f, "{}", *v as char),
        }
    }
}

/// Width-dispatched atomic load with acquire ordering.
///
/// # Safety
///
/// `ptr` must target a live mapping with `size_of::<T>()` readable bytes,
/// naturally aligned for the width.
unsafe fn atomic_load<T: Copy>(ptr: *const u8) -> Option<T> {
    let value: T = match std::mem::size_of::<T>() {
        1 => {
            let v = (*ptr.cast::<AtomicU8>()).load(Ordering::Acquire);
            std::mem::transmute_copy(&v)
        }
        2 => {
            let v = (*ptr.cast::<AtomicU16>()).load(Ordering::Acquire);
            std::mem::transmute_copy(&v)
        }
        4 => {
            let v = (*ptr.cast::<AtomicU32>()).load(Ordering::Acquire);
            std::mem::transmute_copy(&v)
        }
        8 => {
            let v = (*ptr.cast::<AtomicU64>()).load(Ordering::Acquire);
            std::mem::transmute_copy(&v)
        }
        _ => return None,
    };
    Some(value)
}

/// Byte offset of the payload inside a `Guarded`/`Locked` wrapper whose
/// payload has the given alignment.
fn wrapper_payload_offset(atomicity: Atomicity, payload_align: u32) -> u32 {
    let align = payload_align.max(1);
    match atomicity {
        // Guarded: u32 sequence word, payload at max(4, align)
        Atomicity::Seqlock => align.max(4),
        // Locked: 1-byte flag, payload at align
        Atomicity::Locked => align,
        _ => 0,
    }
}

/// Resolved handle to one field of one object: a pointer into the mapped
/// region plus the field's read discipline.
///
/// Proxies from failed lookups are *empty*; every operation on an empty
/// proxy yields an empty proxy or `None`, so lookups chain without
/// intermediate checks.
#[derive(Clone, Copy)]
pub struct FieldProxy<'a> {
    observer: &'a Observer,
    data: *mut u8,
    size: u32,
    type_id: u32,
    array_len: u32,
    is_array: bool,
    atomicity: Atomicity,
    valid: bool,
}

impl<'a> FieldProxy<'a> {
    fn empty(observer: &'a Observer) -> Self {
        Self {
            observer,
            data: std::ptr::null_mut(),
            size: 0,
            type_id: 0,
            array_len: 0,
            is_array: false,
            atomicity: Atomicity::None,
            valid: false,
        }
    }

    fn from_entry(observer: &'a Observer, base: *mut u8, entry: &FieldEntry) -> Self {
        // SAFETY: offset comes from a published field entry of the object's
        // type, so it stays inside the object's bytes.
        let data = unsafe { base.add(entry.offset as usize) };
        Self {
            observer,
            data,
            size: entry.size,
            type_id: entry.type_id,
            array_len: entry.array_len,
            is_array: entry.is_array(),
            atomicity: entry.atomicity(),
            valid: true,
        }
    }

    /// Whether this proxy resolved to a real field.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    #[must_use]
    pub fn atomicity(&self) -> Atomicity {
        self.atomicity
    }

    #[must_use]
    pub fn type_id(&self) -> u32 {
        self.type_id
    }

    /// Element count for array fields, 0 otherwise.
    #[must_use]
    pub fn array_len(&self) -> u32 {
        self.array_len
    }

    /// Resolve a field inside this (nested) field's own type.
    ///
    /// Exact names win; a dotted name falls back to recursion on the
    /// leftmost segment. Non-nested or primitive proxies resolve to empty.
    #[must_use]
    pub fn field(&self, name: &str) -> FieldProxy<'a> {
        if !self.valid {
            return *self;
        }
        let Some(ty) = self.observer.type_by_id(self.type_id) else {
            return Self::empty(self.observer);
        };

        // A guarded/locked compound keeps its payload behind the wrapper's
        // control word; subfield offsets are relative to the payload.
        let payload_off = wrapper_payload_offset(self.atomicity, ty.alignment);
        // SAFETY: the wrapper (and therefore its payload) lies inside the
        // object's mapped bytes.
        let base = unsafe { self.data.add(payload_off as usize) };

        if let Some(entry) = ty.field(name) {
            return Self::from_entry(self.observer, base, entry);
        }
        if let Some((head, rest)) = name.split_once('.') {
            return self.field(head).field(rest);
        }
        Self::empty(self.observer)
    }

    /// Proxy for element `n` of an array field; empty when out of range.
    #[must_use]
    pub fn index(&self, n: usize) -> FieldProxy<'a> {
        if !self.valid || !self.is_array || self.array_len == 0 {
            return Self::empty(self.observer);
        }
        if n as u32 >= self.array_len {
            return Self::empty(self.observer);
        }
        let elem_size = self.size / self.array_len;
        // SAFETY: n < array_len keeps the element inside the field's bytes.
        let data = unsafe { self.data.add(n * elem_size as usize) };
        Self {
            observer: self.observer,
            data,
            size: elem_size,
            type_id: self.type_id,
            array_len: 0,
            is_array: false,
            atomicity: self.atomicity,
            valid: true,
        }
    }

    /// Typed read with the field's declared atomicity.
    ///
    /// `T` must match the field's payload size exactly; a `Seqlock` read
    /// spins until a consistent copy is observed.
    #[must_use]
    pub fn read<T: Copy>(&self) -> Option<T> {
        if !self.valid || std::mem::size_of::<T>() as u32 != self.size {
            return None;
        }
        match self.atomicity {
            Atomicity::None => {
                // SAFETY: the pointer targets `size` mapped bytes; a plain
                // read may tear, which this discipline explicitly allows.
                Some(unsafe { self.data.cast::<T>().read_unaligned() })
            }
            // SAFETY: atomic fields are naturally aligned by construction.
            Atomicity::Atomic => unsafe { atomic_load::<T>(self.data) },
            Atomicity::Seqlock => {
                // SAFETY: the entry addresses a `Guarded<T>` placed by the
                // producer; wrapper alignment follows the payload's.
                let guarded = unsafe { &*self.data.cast::<Guarded<T>>() };
                Some(guarded.read())
            }
            Atomicity::Locked => {
                // SAFETY: as above, for `Locked<T>`.
                let locked = unsafe { &*self.data.cast::<Locked<T>>() };
                Some(locked.read())
            }
        }
    }

    /// One-pass read: for `Seqlock` fields, `None` while a write is in
    /// flight; identical to [`read`](Self::read) otherwise.
    #[must_use]
    pub fn try_read<T: Copy>(&self) -> Option<T> {
        if !self.valid || std::mem::size_of::<T>() as u32 != self.size {
            return None;
        }
        if self.atomicity == Atomicity::Seqlock {
            // SAFETY: as in read().
            let guarded = unsafe { &*self.data.cast::<Guarded<T>>() };
            return guarded.try_read();
        }
        self.read::<T>()
    }

    /// Decode a scalar field into the tagged [`Value`].
    ///
    /// `None` for arrays (index first), nested fields, and invalid proxies.
    #[must_use]
    pub fn value(&self) -> Option<Value> {
        if self.is_array {
            return None;
        }
        match Primitive::from_id(self.type_id)? {
            Primitive::Unknown => None,
            Primitive::Bool => self.read::<u8>().map(|v| Value::Bool(v != 0)),
            Primitive::Int8 => self.read::<i8>().map(Value::I8),
            Primitive::UInt8 => self.read::<u8>().map(Value::U8),
            Primitive::Int16 => self.read::<i16>().map(Value::I16),
            Primitive::UInt16 => self.read::<u16>().map(Value::U16),
            Primitive::Int32 => self.read::<i32>().map(Value::I32),
            Primitive::UInt32 => self.read::<u32>().map(Value::U32),
            Primitive::Int64 => self.read::<i64>().map(Value::I64),
            Primitive::UInt64 => self.read::<u64>().map(Value::U64),
            Primitive::Float32 => self.read::<f32>().map(Value::F32),
            Primitive::Float64 => self.read::<f64>().map(Value::F64),
            Primitive::Char => self.read::<u8>().map(Value::Char),
        }
    }

    /// Read a `char` array field as a NUL-terminated string.
    #[must_use]
    pub fn read_cstr(&self) -> Option<String> {
        if !self.valid || !self.is_array || self.type_id != Primitive::Char as u32 {
            return None;
        }
        let len = self.array_len as usize;
        let mut bytes = vec![0u8; len];
        // SAFETY: the field spans `array_len` mapped bytes; a plain copy
        // may tear, same contract as any `None`-atomicity read.
        unsafe {
            std::ptr::copy_nonoverlapping(self.data, bytes.as_mut_ptr(), len);
        }
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(len);
        bytes.truncate(end);
        Some(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Typed view of one live object.
pub struct ObjectView<'a> {
    observer: &'a Observer,
    info: ObservedObject,
    ty: &'a ObservedType,
    data: *mut u8,
}

impl<'a> ObjectView<'a> {
    /// Resolve a field by name.
    ///
    /// Exact matches win, which lets pre-flattened dotted names (as emitted
    /// by registration boilerplate) resolve without recursion; otherwise a
    /// dotted name recurses through nested types.
    #[must_use]
    pub fn field(&self, name: &str) -> FieldProxy<'a> {
        if let Some(entry) = self.ty.field(name) {
            return FieldProxy::from_entry(self.observer, self.data, entry);
        }
        if let Some((head, rest)) = name.split_once('.') {
            return self.field(head).field(rest);
        }
        FieldProxy::empty(self.observer)
    }

    /// Copy the whole object out as `T`.
    ///
    /// Only meaningful for types whose fields all tolerate plain reads;
    /// the copy may mix concurrent writes.
    #[must_use]
    pub fn read_struct<T: Copy>(&self) -> Option<T> {
        if std::mem::size_of::<T>() as u32 != self.ty.size {
            return None;
        }
        // SAFETY: the object spans `ty.size` mapped bytes.
        Some(unsafe { self.data.cast::<T>().read_unaligned() })
    }

    #[must_use]
    pub fn info(&self) -> &ObservedObject {
        &self.info
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.info.label
    }

    #[must_use]
    pub fn type_name(&self) -> &str {
        &self.ty.name
    }

    #[must_use]
    pub fn observed_type(&self) -> &'a ObservedType {
        self.ty
    }
}

/// Read-only attachment to a running session.
pub struct Observer {
    session: String,
    connected: bool,
    header_shm: Option<SharedMemory>,
    regions: HashMap<u64, SharedMemory>,
    types: Vec<ObservedType>,
    type_index: HashMap<u32, usize>,
    last_sequence: Option<u64>,
}

impl Observer {
    #[must_use]
    pub fn new(session: impl Into<String>) -> Self {
        Self {
            session: session.into(),
            connected: false,
            header_shm: None,
            regions: HashMap::new(),
            types: Vec::new(),
            type_index: HashMap::new(),
            last_sequence: None,
        }
    }

    /// Attach to the session: open the header, validate magic and version,
    /// and load the initial snapshot.
    ///
    /// # Errors
    ///
    /// A missing session, wrong magic, or wrong version leaves the observer
    /// disconnected with all handles closed.
    pub fn connect(&mut self) -> Result<()> {
        if self.connected {
            return Ok(());
        }

        let shm = SharedMemory::open(&header_object_name(&self.session))?;
        if shm.size() < std::mem::size_of::<SessionHeader>() {
            return Err(MemglassError::BadMagic);
        }
        // SAFETY: size checked above; magic and version validated before
        // any table access.
        let header = unsafe { &*shm.as_ptr().cast::<SessionHeader>() };
        if header.magic != HEADER_MAGIC {
            return Err(MemglassError::BadMagic);
        }
        if header.version != PROTOCOL_VERSION {
            return Err(MemglassError::BadVersion {
                expected: PROTOCOL_VERSION,
                found: header.version,
            });
        }

        self.header_shm = Some(shm);
        self.connected = true;
        self.refresh();
        log::debug!("[OBSERVER] connected to {}", self.session);
        Ok(())
    }

    /// Detach: release every region mapping and the header.
    ///
    /// In-flight views and proxies cannot outlive this call (they borrow
    /// the observer).
    pub fn disconnect(&mut self) {
        if !self.connected {
            return;
        }
        self.regions.clear();
        self.types.clear();
        self.type_index.clear();
        self.header_shm = None;
        self.last_sequence = None;
        self.connected = false;
        log::debug!("[OBSERVER] disconnected from {}", self.session);
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    fn header(&self) -> Option<&SessionHeader> {
        // SAFETY: the mapping outlives the returned borrow (it is owned by
        // self and only replaced through &mut methods).
        self.header_shm
            .as_ref()
            .map(|shm| unsafe { &*shm.as_ptr().cast::<SessionHeader>() })
    }

    /// Re-read the structural sequence; reload the type mirror and region
    /// chain only when it moved.
    pub fn refresh(&mut self) {
        if !self.connected {
            return;
        }
        let Some(header) = self.header() else { return };
        let sequence = header.sequence.load(Ordering::Acquire);
        if self.last_sequence == Some(sequence) {
            return;
        }
        self.load_types();
        self.load_regions();
        self.last_sequence = Some(sequence);
    }

    /// Producer process id, 0 when disconnected.
    #[must_use]
    pub fn producer_pid(&self) -> u64 {
        self.header().map_or(0, |h| h.producer_pid)
    }

    /// Session start timestamp, 0 when disconnected.
    #[must_use]
    pub fn start_timestamp(&self) -> u64 {
        self.header().map_or(0, |h| h.start_timestamp)
    }

    /// Current structural sequence, 0 when disconnected.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.header()
            .map_or(0, |h| h.sequence.load(Ordering::Acquire))
    }

    /// The mirrored type table.
    #[must_use]
    pub fn types(&self) -> &[ObservedType] {
        &self.types
    }

    #[must_use]
    pub fn type_by_id(&self, type_id: u32) -> Option<&ObservedType> {
        self.type_index.get(&type_id).map(|&i| &self.types[i])
    }

    /// Ids of the data regions currently mapped.
    #[must_use]
    pub fn region_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.regions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Enumerate `Alive` objects.
    #[must_use]
    pub fn objects(&self) -> Vec<ObservedObject> {
        let mut result = Vec::new();
        let Some(header) = self.header() else {
            return result;
        };

        let count = header.object_count.load(Ordering::Acquire);
        for i in 0..count {
            let Some(entry) = self.object_entry(i) else {
                break;
            };
            if entry.state() != ObjectState::Alive {
                continue;
            }
            result.push(self.observed_object(entry));
        }
        result
    }

    /// Find a live object by label.
    #[must_use]
    pub fn find(&self, label: &str) -> Option<ObjectView<'_>> {
        let header = self.header()?;
        let count = header.object_count.load(Ordering::Acquire);
        for i in 0..count {
            let entry = self.object_entry(i)?;
            if entry.state() == ObjectState::Alive && entry.label_str() == label {
                let info = self.observed_object(entry);
                return self.view_of(info);
            }
        }
        None
    }

    /// Materialize a view for an enumerated object.
    ///
    /// `None` when the object's type or region is not (yet) known to this
    /// observer; call [`refresh`](Self::refresh) and retry.
    #[must_use]
    pub fn get(&self, object: &ObservedObject) -> Option<ObjectView<'_>> {
        self.view_of(object.clone())
    }

    fn view_of(&self, info: ObservedObject) -> Option<ObjectView<'_>> {
        let idx = *self.type_index.get(&info.type_id)?;
        let data = self.object_data(info.region_id, info.offset)?;
        Some(ObjectView {
            observer: self,
            ty: &self.types[idx],
            data,
            info,
        })
    }

    /// Resolve a region-relative location to a local pointer.
    fn object_data(&self, region_id: u64, offset: u64) -> Option<*mut u8> {
        let shm = self.regions.get(&region_id)?;
        if offset as usize >= shm.size() {
            return None;
        }
        // SAFETY: offset is inside the mapping, checked above.
        Some(unsafe { shm.as_ptr().add(offset as usize) })
    }

    fn object_entry(&self, index: u32) -> Option<&ObjectEntry> {
        let shm = self.header_shm.as_ref()?;
        // SAFETY: validated header mapping owned by self.
        let header = unsafe { &*shm.as_ptr().cast::<SessionHeader>() };
        // SAFETY: index < published object_count <= object_capacity, and the
        // directory lies inside the header mapping at the recorded offset.
        Some(unsafe {
            &*shm
                .as_ptr()
                .add(header.object_dir_offset as usize)
                .cast::<ObjectEntry>()
                .add(index as usize)
        })
    }

    fn observed_object(&self, entry: &ObjectEntry) -> ObservedObject {
        let type_name = self
            .type_by_id(entry.type_id)
            .map(|t| t.name.clone())
            .unwrap_or_default();
        ObservedObject {
            label: entry.label_str().to_string(),
            type_name,
            type_id: entry.type_id,
            region_id: entry.region_id,
            offset: entry.offset,
            generation: entry.generation,
        }
    }

    /// Mirror the header's type and field tables.
    fn load_types(&mut self) {
        let Some(shm) = self.header_shm.as_ref() else {
            return;
        };
        let base = shm.as_ptr();
        // SAFETY: validated header mapping owned by self.
        let header = unsafe { &*base.cast::<SessionHeader>() };

        let type_count = header.type_count.load(Ordering::Acquire);
        let field_count = header.field_count.load(Ordering::Acquire);

        let mut types = Vec::with_capacity(type_count as usize);
        let mut type_index = HashMap::with_capacity(type_count as usize);

        for i in 0..type_count {
            // SAFETY: i < published type_count; entries below the count are
            // fully written before the count's release store.
            let te: TypeEntry = unsafe {
                *base
                    .add(header.type_table_offset as usize)
                    .cast::<TypeEntry>()
                    .add(i as usize)
            };

            let Some(rel) = te.fields_offset.checked_sub(header.field_table_offset) else {
                continue;
            };
            let first_field = rel / std::mem::size_of::<FieldEntry>() as u64;
            let mut fields = Vec::with_capacity(te.field_count as usize);
            for j in 0..u64::from(te.field_count) {
                let index = first_field + j;
                if index >= u64::from(field_count) {
                    break;
                }
                // SAFETY: index < published field_count.
                let fe: FieldEntry = unsafe {
                    *base
                        .add(header.field_table_offset as usize)
                        .cast::<FieldEntry>()
                        .add(index as usize)
                };
                fields.push(fe);
            }

            type_index.insert(te.type_id, types.len());
            types.push(ObservedType {
                type_id: te.type_id,
                name: te.name_str().to_string(),
                size: te.size,
                alignment: te.alignment,
                fields,
            });
        }

        self.types = types;
        self.type_index = type_index;
    }

    /// Walk the region chain from `first_region_id`, mapping regions not
    /// seen before. Invalid magic or a repeated id terminates the walk.
    fn load_regions(&mut self) {
        let Some(header) = self.header() else { return };
        let mut region_id = header.first_region_id.load(Ordering::Acquire);
        let mut visited = HashSet::new();

        while region_id != 0 && visited.insert(region_id) {
            if let Some(shm) = self.regions.get(&region_id) {
                // Already mapped: just follow the link.
                // SAFETY: mapped regions were magic-validated on insert.
                let desc = unsafe { &*shm.as_ptr().cast::<RegionDescriptor>() };
                region_id = desc.next_region_id.load(Ordering::Acquire);
                continue;
            }

            let name = region_object_name(&self.session, region_id);
            let Ok(shm) = SharedMemory::open(&name) else {
                log::debug!("[OBSERVER] region {name} not openable yet");
                break;
            };
            if shm.size() < std::mem::size_of::<RegionDescriptor>() {
                break;
            }
            // SAFETY: size checked above; descriptor sits at the base.
            let desc = unsafe { &*shm.as_ptr().cast::<RegionDescriptor>() };
            if !desc.validate() {
                log::debug!("[OBSERVER] region {name} has invalid magic, stopping walk");
                break;
            }

            let next = desc.next_region_id.load(Ordering::Acquire);
            self.regions.insert(region_id, shm);
            region_id = next;
        }
    }
}

impl Drop for Observer {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_accessors_are_exact_typed() {
        let v = Value::I32(42);
        assert_eq!(v.as_i32(), Some(42));
        assert_eq!(v.as_i64(), None);
        assert_eq!(v.as_u32(), None);

        let v = Value::F64(2.5);
        assert_eq!(v.as_f64(), Some(2.5));
        assert_eq!(v.as_f32(), None);

        assert_eq!(Value::Bool(true).as_bool(), Some(true));
        assert_eq!(Value::Char(b'A').to_string(), "A");
    }

    #[test]
    fn wrapper_payload_offsets_match_wrapper_layout() {
        #[derive(Clone, Copy)]
        #[repr(C)]
        struct Wide {
            _a: u64,
            _b: u64,
        }

        assert_eq!(
            wrapper_payload_offset(Atomicity::Seqlock, std::mem::align_of::<u32>() as u32) as usize,
            Guarded::<u32>::VALUE_OFFSET
        );
        assert_eq!(
            wrapper_payload_offset(Atomicity::Seqlock, std::mem::align_of::<Wide>() as u32) as usize,
            Guarded::<Wide>::VALUE_OFFSET
        );
        assert_eq!(
            wrapper_payload_offset(Atomicity::Locked, std::mem::align_of::<Wide>() as u32) as usize,
            Locked::<Wide>::VALUE_OFFSET
        );
        assert_eq!(wrapper_payload_offset(Atomicity::None, 8), 0);
    }

    #[test]
    fn disconnected_observer_returns_empty_results() {
        let observer = Observer::new("never_connected");
        assert!(!observer.is_connected());
        assert_eq!(observer.producer_pid(), 0);
        assert_eq!(observer.sequence(), 0);
        assert!(observer.types().is_empty());
        assert!(observer.objects().is_empty());
        assert!(observer.find("anything").is_none());
        assert!(observer.region_ids().is_empty());
    }
}
